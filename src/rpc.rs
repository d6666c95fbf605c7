//! JSON-RPC plumbing for talking to the chain node: the wire client, the
//! coalescing batch layer, circuit breaker, and client options.

pub mod batcher;
pub mod breaker;
pub mod client;
pub mod options;

pub use batcher::BatchedClient;
pub use breaker::{BreakerPhase, RpcBreaker};
pub use client::{NodeClient, RpcError};
pub use options::RpcClientOptions;
