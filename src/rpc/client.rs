//! Wire client for the chain node's JSON-RPC endpoint. Owns the HTTP
//! transport, timeout wrapping, breaker gating, and the typed helpers the
//! ingestion loop consumes (`fetch_head`, `fetch_block`, `fetch_blocks`).
//!
//! Block payloads stay opaque `serde_json::Value`s; decoding them is the
//! downstream collaborator's job.

use crate::rpc::breaker::RpcBreaker;
use crate::rpc::options::RpcClientOptions;
use anyhow::{anyhow, bail, Context, Result};
use jsonrpsee::core::{
    client::{ClientT, Error as JsonRpcError},
    params::{ArrayParams, BatchRequestBuilder},
};
use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use jsonrpsee::rpc_params;
use jsonrpsee::types::ErrorObject;
use serde_json::Value;
use std::sync::Arc;
use tokio::time::timeout;

/// RPC failure classes callers discriminate on (via `downcast_ref`).
#[derive(Debug)]
pub enum RpcError {
    Timeout { method: &'static str },
    CircuitOpen,
    ResultMissing { id: u64 },
    BlockMissing { number: u64 },
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RpcError::Timeout { method } => write!(f, "rpc method {method} timed out"),
            RpcError::CircuitOpen => write!(f, "rpc circuit breaker is open"),
            RpcError::ResultMissing { id } => {
                write!(f, "result missing from batch (request id {id})")
            }
            RpcError::BlockMissing { number } => {
                write!(f, "block {number} not found on the node")
            }
        }
    }
}

impl std::error::Error for RpcError {}

/// Formats a block number as an EVM hex quantity (`0x10` for 16).
pub fn quantity(number: u64) -> String {
    format!("0x{number:x}")
}

/// Parses an EVM hex quantity back into a block number.
pub fn parse_quantity(value: &Value) -> Result<u64> {
    let text = value
        .as_str()
        .ok_or_else(|| anyhow!("quantity is not a string: {value}"))?;
    let digits = text.strip_prefix("0x").unwrap_or(text);
    u64::from_str_radix(digits, 16).with_context(|| format!("malformed hex quantity {text:?}"))
}

#[derive(Debug, Clone)]
pub struct NodeClient {
    endpoint: Arc<String>,
    client: HttpClient,
    options: RpcClientOptions,
    breaker: Arc<RpcBreaker>,
}

impl NodeClient {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        Self::with_options(url, RpcClientOptions::default())
    }

    pub fn with_options(url: impl Into<String>, options: RpcClientOptions) -> Result<Self> {
        Self::with_options_and_breaker(url, options, Arc::new(RpcBreaker::default()))
    }

    pub fn with_options_and_breaker(
        url: impl Into<String>,
        options: RpcClientOptions,
        breaker: Arc<RpcBreaker>,
    ) -> Result<Self> {
        options.validate()?;
        let endpoint = url.into();

        let max_request_size = options.max_request_body_bytes.min(u32::MAX as usize) as u32;
        let max_response_size = options.max_response_body_bytes.min(u32::MAX as usize) as u32;
        let client = HttpClientBuilder::default()
            .request_timeout(options.request_timeout)
            .max_concurrent_requests(options.max_concurrent_requests)
            .max_request_size(max_request_size)
            .max_response_size(max_response_size)
            .build(&endpoint)
            .map_err(|err| anyhow!("failed to build RPC client: {err}"))?;

        Ok(Self {
            endpoint: Arc::new(endpoint),
            client,
            options,
            breaker,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn options(&self) -> &RpcClientOptions {
        &self.options
    }

    /// Current chain head block number.
    pub async fn fetch_head(&self) -> Result<u64> {
        let value = self.call("eth_blockNumber", rpc_params![]).await?;
        parse_quantity(&value).context("eth_blockNumber returned a malformed quantity")
    }

    /// One block with full transaction bodies.
    pub async fn fetch_block(&self, number: u64) -> Result<Value> {
        let value = self
            .call("eth_getBlockByNumber", rpc_params![quantity(number), true])
            .await?;
        if value.is_null() {
            bail!(RpcError::BlockMissing { number });
        }
        Ok(value)
    }

    /// Fetches the given block numbers in one batched wire call.
    pub async fn fetch_blocks(&self, numbers: &[u64]) -> Result<Vec<(u64, Value)>> {
        if numbers.is_empty() {
            return Ok(Vec::new());
        }

        let mut batch = BatchRequestBuilder::new();
        for number in numbers {
            batch
                .insert("eth_getBlockByNumber", rpc_params![quantity(*number), true])
                .context("failed to serialize eth_getBlockByNumber params")?;
        }

        let entries = self.call_batch(batch, "eth_getBlockByNumber").await?;
        if entries.len() != numbers.len() {
            bail!(
                "node returned {} results for {} requested blocks",
                entries.len(),
                numbers.len()
            );
        }

        let mut blocks = Vec::with_capacity(numbers.len());
        for (number, entry) in numbers.iter().copied().zip(entries) {
            let value = entry.with_context(|| {
                format!("batched eth_getBlockByNumber failed for block {number}")
            })?;
            if value.is_null() {
                bail!(RpcError::BlockMissing { number });
            }
            blocks.push((number, value));
        }
        Ok(blocks)
    }

    /// Single immediate call, bypassing any batching.
    pub(crate) async fn call(&self, method: &'static str, params: ArrayParams) -> Result<Value> {
        self.breaker.before_request().map_err(anyhow::Error::new)?;

        let outcome = timeout(
            self.options.request_timeout,
            self.client.request::<Value, _>(method, params),
        )
        .await;

        match outcome {
            Err(_) => {
                self.breaker.record_failure();
                Err(RpcError::Timeout { method }.into())
            }
            Ok(Err(err)) => {
                self.breaker.record_failure();
                Err(map_rpc_error(method, err))
            }
            Ok(Ok(value)) => {
                self.breaker.record_success();
                tracing::trace!(method, "rpc call completed");
                Ok(value)
            }
        }
    }

    /// One batched wire call. Entries come back in insertion order with
    /// per-entry errors preserved; a transport failure fails the whole
    /// batch.
    pub(crate) async fn call_batch<'a>(
        &self,
        batch: BatchRequestBuilder<'a>,
        label: &'static str,
    ) -> Result<Vec<Result<Value>>> {
        self.breaker.before_request().map_err(anyhow::Error::new)?;

        let outcome = timeout(
            self.options.request_timeout,
            self.client.batch_request::<Value>(batch),
        )
        .await;

        let response = match outcome {
            Err(_) => {
                self.breaker.record_failure();
                return Err(RpcError::Timeout { method: label }.into());
            }
            Ok(Err(err)) => {
                self.breaker.record_failure();
                return Err(map_rpc_error(label, err));
            }
            Ok(Ok(response)) => {
                self.breaker.record_success();
                response
            }
        };

        let entries: Vec<Result<Value>> = response
            .into_iter()
            .map(|entry| entry.map_err(|err| map_entry_error(label, &err)))
            .collect();

        tracing::debug!(
            method = label,
            count = entries.len(),
            "batch RPC call completed"
        );
        Ok(entries)
    }
}

fn map_rpc_error(method: &str, err: JsonRpcError) -> anyhow::Error {
    anyhow!("rpc {method} call failed: {err}")
}

fn map_entry_error(method: &str, err: &ErrorObject<'_>) -> anyhow::Error {
    anyhow!(
        "rpc {method} call failed (code={}, message={})",
        err.code(),
        err.message()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantity_round_trips() {
        for number in [0u64, 1, 16, 255, 1_234_567, u64::MAX] {
            let encoded = quantity(number);
            assert!(encoded.starts_with("0x"));
            let decoded = parse_quantity(&Value::String(encoded)).expect("must parse back");
            assert_eq!(decoded, number);
        }
    }

    #[test]
    fn parse_quantity_rejects_garbage() {
        assert!(parse_quantity(&Value::String("0xzz".into())).is_err());
        assert!(parse_quantity(&Value::Number(16.into())).is_err());
        assert!(parse_quantity(&Value::Null).is_err());
    }

    #[test]
    fn invalid_options_fail_construction() {
        let options = RpcClientOptions {
            batch_max_size: 0,
            ..RpcClientOptions::default()
        };
        let err = NodeClient::with_options("http://127.0.0.1:8545", options)
            .expect_err("zero batch size must be rejected");
        assert!(format!("{err}").contains("batch_max_size"));
    }

    #[test]
    fn rpc_error_messages_are_distinguishable() {
        assert_eq!(
            RpcError::ResultMissing { id: 7 }.to_string(),
            "result missing from batch (request id 7)"
        );
        assert_eq!(
            RpcError::Timeout {
                method: "eth_blockNumber"
            }
            .to_string(),
            "rpc method eth_blockNumber timed out"
        );
    }
}
