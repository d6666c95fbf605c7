//! Domain-processor seam. The engine owns range iteration, skip-if-complete
//! filtering, batched fetching, retry, and completion marking; the processor
//! only turns one fetched block into sink messages.

use anyhow::Result;
use core::future::Future;
use core::pin::Pin;
use serde_json::Value;

pub type ProcessorFuture = Pin<Box<dyn Future<Output = Result<Vec<Value>>> + Send + 'static>>;

/// Implemented once per watcher flavor (blocks, balances, token transfers,
/// contract traces). Always async so implementations can fetch and decode.
pub trait BlockProcessor: Send + Sync + 'static {
    /// Turns one fetched block into the messages to forward to the sink.
    /// Returning an error makes the surrounding chunk retry.
    fn process(&self, number: u64, block: Value) -> ProcessorFuture;
}
