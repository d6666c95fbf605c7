//! Runtime configuration for a watcher instance.
//!
//! All instances must be constructed via [`WatcherConfig::builder`] so
//! invariants are validated before any consumer observes the values.

use crate::checkpoint::store::DEFAULT_SAVE_DEBOUNCE;
use crate::exec::BackoffPolicy;
use crate::rpc::RpcClientOptions;
use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_MAX_CHUNK_SIZE: u64 = 50;
const DEFAULT_MAX_PARALLEL_CHUNKS: usize = 4;
const DEFAULT_CHUNK_ATTEMPTS: usize = 100;
const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;
const DEFAULT_RPC_TIMEOUT_SECS: u64 = 10;
const DEFAULT_METRICS_INTERVAL_SECS: u64 = 5;

/// Where ingestion begins the first time a stream runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartAt {
    /// Block 0.
    Genesis,
    /// The chain head observed at startup.
    Latest,
    /// An absolute block number.
    Absolute(u64),
    /// `head - n` at startup.
    Offset(u64),
}

impl StartAt {
    /// Resolves the configured start against the observed chain head.
    pub fn resolve(&self, head: u64) -> u64 {
        match *self {
            StartAt::Genesis => 0,
            StartAt::Latest => head,
            StartAt::Absolute(block) => block,
            StartAt::Offset(offset) => head.saturating_sub(offset),
        }
    }

    /// True when resolving requires asking the node for its head first.
    pub fn needs_head(&self) -> bool {
        matches!(self, StartAt::Latest | StartAt::Offset(_))
    }
}

impl FromStr for StartAt {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let value = value.trim();
        match value {
            "genesis" => Ok(StartAt::Genesis),
            "latest" => Ok(StartAt::Latest),
            _ => {
                if let Some(offset) = value.strip_prefix('-') {
                    let offset: u64 = offset
                        .parse()
                        .with_context(|| format!("invalid start_at offset {value:?}"))?;
                    Ok(StartAt::Offset(offset))
                } else {
                    let block: u64 = value
                        .parse()
                        .with_context(|| format!("invalid start_at {value:?}"))?;
                    Ok(StartAt::Absolute(block))
                }
            }
        }
    }
}

/// Validated configuration for one watcher instance.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    rpc_url: String,
    stream: String,
    checkpoint_path: PathBuf,
    start_at: StartAt,
    end_at: Option<u64>,
    max_chunk_size: u64,
    chunk_queue_max: Option<usize>,
    max_parallel_chunks: usize,
    chunk_attempts: usize,
    poll_interval: Duration,
    wait_after_failure: BackoffPolicy,
    checkpoint_debounce: Duration,
    rpc_timeout: Duration,
    batch_max_size: usize,
    batch_max_wait: Duration,
    metrics_interval: Duration,
}

impl WatcherConfig {
    pub fn builder() -> WatcherConfigBuilder {
        WatcherConfigBuilder::default()
    }

    pub fn rpc_url(&self) -> &str {
        &self.rpc_url
    }

    /// Checkpoint stream id this watcher records its progress under.
    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn checkpoint_path(&self) -> &PathBuf {
        &self.checkpoint_path
    }

    pub fn start_at(&self) -> StartAt {
        self.start_at
    }

    /// Optional upper bound; reaching it with no outstanding ranges
    /// completes the watcher.
    pub fn end_at(&self) -> Option<u64> {
        self.end_at
    }

    /// Maximum blocks per scheduled chunk.
    pub fn max_chunk_size(&self) -> u64 {
        self.max_chunk_size
    }

    /// Optional cap on chunks enumerated per outstanding range; the final
    /// chunk absorbs the rest when the cap is hit.
    pub fn chunk_queue_max(&self) -> Option<usize> {
        self.chunk_queue_max
    }

    /// Bound on in-flight chunks (and therefore in-flight batched fetches).
    pub fn max_parallel_chunks(&self) -> usize {
        self.max_parallel_chunks
    }

    /// Retry budget for one chunk before its failure escalates.
    pub fn chunk_attempts(&self) -> usize {
        self.chunk_attempts
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Backoff applied between chunk retries and after top-level
    /// iteration failures.
    pub fn wait_after_failure(&self) -> BackoffPolicy {
        self.wait_after_failure
    }

    pub fn checkpoint_debounce(&self) -> Duration {
        self.checkpoint_debounce
    }

    pub fn rpc_timeout(&self) -> Duration {
        self.rpc_timeout
    }

    pub fn batch_max_size(&self) -> usize {
        self.batch_max_size
    }

    pub fn batch_max_wait(&self) -> Duration {
        self.batch_max_wait
    }

    pub fn metrics_interval(&self) -> Duration {
        self.metrics_interval
    }

    /// RPC client options derived from this configuration.
    pub fn rpc_options(&self) -> RpcClientOptions {
        RpcClientOptions {
            request_timeout: self.rpc_timeout,
            batch_max_size: self.batch_max_size,
            batch_max_wait: self.batch_max_wait,
            ..RpcClientOptions::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_url(&self.rpc_url)?;

        if self.stream.trim().is_empty() {
            bail!("stream cannot be empty");
        }
        if self.checkpoint_path.as_os_str().is_empty() {
            bail!("checkpoint_path cannot be empty");
        }
        if self.max_chunk_size == 0 {
            bail!("max_chunk_size must be greater than 0");
        }
        if self.chunk_queue_max == Some(0) {
            bail!("chunk_queue_max must be greater than 0 when set");
        }
        if self.max_parallel_chunks == 0 {
            bail!("max_parallel_chunks must be greater than 0");
        }
        if self.chunk_attempts == 0 {
            bail!("chunk_attempts must be greater than 0");
        }
        if self.poll_interval.is_zero() {
            bail!("poll_interval must be greater than 0");
        }
        if self.checkpoint_debounce.is_zero() {
            bail!("checkpoint_debounce must be greater than 0");
        }
        if self.metrics_interval.is_zero() {
            bail!("metrics_interval must be greater than 0");
        }
        if let (StartAt::Absolute(start), Some(end)) = (self.start_at, self.end_at) {
            if start > end {
                bail!("start_at ({start}) exceeds end_at ({end})");
            }
        }

        self.rpc_options().validate()
    }
}

#[derive(Debug, Default, Clone)]
pub struct WatcherConfigBuilder {
    rpc_url: Option<String>,
    stream: Option<String>,
    checkpoint_path: Option<PathBuf>,
    start_at: Option<StartAt>,
    end_at: Option<u64>,
    max_chunk_size: Option<u64>,
    chunk_queue_max: Option<usize>,
    max_parallel_chunks: Option<usize>,
    chunk_attempts: Option<usize>,
    poll_interval: Option<Duration>,
    wait_after_failure: Option<BackoffPolicy>,
    checkpoint_debounce: Option<Duration>,
    rpc_timeout: Option<Duration>,
    batch_max_size: Option<usize>,
    batch_max_wait: Option<Duration>,
    metrics_interval: Option<Duration>,
}

impl WatcherConfigBuilder {
    pub fn rpc_url(mut self, url: impl Into<String>) -> Self {
        self.rpc_url = Some(url.into());
        self
    }

    pub fn stream(mut self, stream: impl Into<String>) -> Self {
        self.stream = Some(stream.into());
        self
    }

    pub fn checkpoint_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.checkpoint_path = Some(path.into());
        self
    }

    pub fn start_at(mut self, start_at: StartAt) -> Self {
        self.start_at = Some(start_at);
        self
    }

    pub fn end_at(mut self, end_at: u64) -> Self {
        self.end_at = Some(end_at);
        self
    }

    pub fn max_chunk_size(mut self, blocks: u64) -> Self {
        self.max_chunk_size = Some(blocks);
        self
    }

    pub fn chunk_queue_max(mut self, chunks: usize) -> Self {
        self.chunk_queue_max = Some(chunks);
        self
    }

    pub fn max_parallel_chunks(mut self, chunks: usize) -> Self {
        self.max_parallel_chunks = Some(chunks);
        self
    }

    pub fn chunk_attempts(mut self, attempts: usize) -> Self {
        self.chunk_attempts = Some(attempts);
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    pub fn wait_after_failure(mut self, policy: BackoffPolicy) -> Self {
        self.wait_after_failure = Some(policy);
        self
    }

    pub fn checkpoint_debounce(mut self, debounce: Duration) -> Self {
        self.checkpoint_debounce = Some(debounce);
        self
    }

    pub fn rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = Some(timeout);
        self
    }

    pub fn batch_max_size(mut self, size: usize) -> Self {
        self.batch_max_size = Some(size);
        self
    }

    pub fn batch_max_wait(mut self, wait: Duration) -> Self {
        self.batch_max_wait = Some(wait);
        self
    }

    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = Some(interval);
        self
    }

    pub fn build(self) -> Result<WatcherConfig> {
        let defaults = RpcClientOptions::default();
        let config = WatcherConfig {
            rpc_url: self.rpc_url.context("rpc_url is required")?,
            stream: self.stream.context("stream is required")?,
            checkpoint_path: self.checkpoint_path.context("checkpoint_path is required")?,
            start_at: self.start_at.unwrap_or(StartAt::Genesis),
            end_at: self.end_at,
            max_chunk_size: self.max_chunk_size.unwrap_or(DEFAULT_MAX_CHUNK_SIZE),
            chunk_queue_max: self.chunk_queue_max,
            max_parallel_chunks: self
                .max_parallel_chunks
                .unwrap_or(DEFAULT_MAX_PARALLEL_CHUNKS),
            chunk_attempts: self.chunk_attempts.unwrap_or(DEFAULT_CHUNK_ATTEMPTS),
            poll_interval: self
                .poll_interval
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS)),
            wait_after_failure: self.wait_after_failure.unwrap_or_else(|| {
                BackoffPolicy::exponential(Duration::from_secs(1), Duration::from_secs(60))
            }),
            checkpoint_debounce: self.checkpoint_debounce.unwrap_or(DEFAULT_SAVE_DEBOUNCE),
            rpc_timeout: self
                .rpc_timeout
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_RPC_TIMEOUT_SECS)),
            batch_max_size: self.batch_max_size.unwrap_or(defaults.batch_max_size),
            batch_max_wait: self.batch_max_wait.unwrap_or(defaults.batch_max_wait),
            metrics_interval: self
                .metrics_interval
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_METRICS_INTERVAL_SECS)),
        };

        config.validate()?;
        Ok(config)
    }
}

fn validate_url(url: &str) -> Result<()> {
    let url = url.trim();
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        bail!("rpc_url must start with http:// or https://");
    }
    Ok(())
}
