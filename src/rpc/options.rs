//! Configurable knobs for the RPC client, validated before any request is
//! made.

use anyhow::{bail, Result};
use std::time::Duration;

const DEFAULT_HTTP_BODY_LIMIT_BYTES: usize = 10 * 1024 * 1024;
const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 256;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
const DEFAULT_BATCH_MAX_SIZE: usize = 50;
const DEFAULT_BATCH_MAX_WAIT_MS: u64 = 50;

#[derive(Debug, Clone)]
pub struct RpcClientOptions {
    pub request_timeout: Duration,
    pub max_concurrent_requests: usize,
    pub max_request_body_bytes: usize,
    pub max_response_body_bytes: usize,
    /// Queued requests flush once this many are pending...
    pub batch_max_size: usize,
    /// ...or once the oldest has waited this long, whichever first.
    pub batch_max_wait: Duration,
}

impl Default for RpcClientOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
            max_request_body_bytes: DEFAULT_HTTP_BODY_LIMIT_BYTES,
            max_response_body_bytes: DEFAULT_HTTP_BODY_LIMIT_BYTES,
            batch_max_size: DEFAULT_BATCH_MAX_SIZE,
            batch_max_wait: Duration::from_millis(DEFAULT_BATCH_MAX_WAIT_MS),
        }
    }
}

impl RpcClientOptions {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.request_timeout.is_zero() {
            bail!("request_timeout must be greater than 0");
        }
        if self.max_concurrent_requests == 0 {
            bail!("max_concurrent_requests must be greater than 0");
        }
        if self.max_request_body_bytes == 0 {
            bail!("max_request_body_bytes must be greater than 0");
        }
        if self.max_response_body_bytes == 0 {
            bail!("max_response_body_bytes must be greater than 0");
        }
        if self.batch_max_size == 0 {
            bail!("batch_max_size must be greater than 0");
        }
        if self.batch_max_wait.is_zero() {
            bail!("batch_max_wait must be greater than 0");
        }
        Ok(())
    }
}
