pub mod checkpoint;
pub mod exec;
pub mod ranges;
pub mod rpc;
pub mod runtime;
pub mod watcher;

pub use checkpoint::{CheckpointError, CheckpointStore};
pub use exec::{retry, run_bounded, BackoffPolicy, CancelHandle, Cancelled, RetryOptions};
pub use ranges::BlockRange;
pub use rpc::{BatchedClient, NodeClient, RpcBreaker, RpcClientOptions, RpcError};
pub use runtime::config::{StartAt, WatcherConfig, WatcherConfigBuilder};
pub use runtime::runner::Runner;
pub use runtime::telemetry::{init_tracing, Telemetry, TelemetrySnapshot};
pub use watcher::{BlockProcessor, ProcessorFuture, Sink, SinkFuture, Watcher};
