//! Execution primitives shared by the ingestion loop: backoff policies, the
//! retry executor, the bounded concurrent runner, and cooperative
//! cancellation.

pub mod backoff;
pub mod cancel;
pub mod pool;
pub mod retry;

pub use backoff::BackoffPolicy;
pub use cancel::{CancelHandle, Cancelled};
pub use pool::run_bounded;
pub use retry::{retry, RetryOptions};
