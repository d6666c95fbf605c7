//! The generic ingestion loop and the trait seams it is parameterized by:
//! a domain-specific [`BlockProcessor`] and a telemetry [`Sink`].

pub mod engine;
pub mod processor;
pub mod sink;

pub use engine::Watcher;
pub use processor::{BlockProcessor, ProcessorFuture};
pub use sink::{Sink, SinkFuture};
