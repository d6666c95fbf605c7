//! Telemetry-sink seam. The wire protocol behind it (batching, compression,
//! reconnects) belongs to the implementation, not the engine.

use anyhow::Result;
use core::future::Future;
use core::pin::Pin;
use serde_json::Value;

pub type SinkFuture = Pin<Box<dyn Future<Output = Result<()>> + Send + 'static>>;

/// Destination for decoded output messages. Chunks run concurrently, so
/// `write` must tolerate concurrent calls.
pub trait Sink: Send + Sync + 'static {
    fn write(&self, message: Value) -> SinkFuture;

    /// Called once during watcher shutdown to drain buffered output.
    fn shutdown(&self) -> SinkFuture;
}
