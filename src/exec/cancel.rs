//! Cooperative cancellation. `CancelHandle` fans one abort signal out to
//! every operation racing against it; `Cancelled` is the distinguished
//! signal callers use to tell "stopped on purpose" from "failed".

use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Distinguished cancellation signal. Not a failure: never retried and
/// never logged as an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "operation cancelled")
    }
}

impl std::error::Error for Cancelled {}

impl Cancelled {
    /// True when `error`'s chain bottoms out in the cancellation signal.
    pub fn caused(error: &anyhow::Error) -> bool {
        error
            .chain()
            .any(|cause| cause.downcast_ref::<Cancelled>().is_some())
    }
}

/// Sticky, cloneable abort handle. Once [`CancelHandle::abort`] is called,
/// every outstanding [`CancelHandle::race`] resolves with [`Cancelled`] and
/// every future call rejects immediately.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Derives a handle that aborts with this one but can also be aborted
    /// independently.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
        }
    }

    /// Idempotent; releases everything currently racing.
    pub fn abort(&self) {
        self.token.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the handle has been aborted.
    pub async fn aborted(&self) {
        self.token.cancelled().await;
    }

    /// Runs `operation` to completion unless the handle aborts first.
    pub async fn race<F: Future>(&self, operation: F) -> Result<F::Output, Cancelled> {
        if self.token.is_cancelled() {
            return Err(Cancelled);
        }
        tokio::select! {
            _ = self.token.cancelled() => Err(Cancelled),
            value = operation => Ok(value),
        }
    }

    /// Cancellable timer used for poll intervals and backoff waits.
    pub async fn sleep(&self, delay: Duration) -> Result<(), Cancelled> {
        self.race(sleep(delay)).await
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}
