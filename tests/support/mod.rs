// Shared by every integration-test crate; not all of them use all of it.
#![allow(dead_code)]

pub mod mock_rpc;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use chainspan::{BlockProcessor, ProcessorFuture, Sink, SinkFuture};
use once_cell::sync::Lazy;
use serde_json::{json, Value};
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

static TRACING_SUBSCRIBER: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
});

pub fn init_tracing() {
    Lazy::force(&TRACING_SUBSCRIBER);
}

/// Processor that records every block it sees and emits one message per
/// block. Failures can be scripted per block number to exercise retry.
#[derive(Clone, Default)]
pub struct RecordingProcessor {
    seen: Arc<Mutex<Vec<u64>>>,
    failures: Arc<Mutex<HashMap<u64, usize>>>,
    delay: Option<Duration>,
}

impl RecordingProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// The next `count` attempts at `block` fail before anything reaches
    /// the sink.
    pub fn fail_block_times(&self, block: u64, count: usize) {
        self.failures.lock().unwrap().insert(block, count);
    }

    pub fn seen(&self) -> Vec<u64> {
        self.seen.lock().unwrap().clone()
    }
}

impl BlockProcessor for RecordingProcessor {
    fn process(&self, number: u64, block: Value) -> ProcessorFuture {
        let seen = self.seen.clone();
        let failures = self.failures.clone();
        let delay = self.delay;

        Box::pin(async move {
            if let Some(delay) = delay {
                sleep(delay).await;
            }

            let failed = {
                let mut failures = failures.lock().unwrap();
                match failures.get_mut(&number) {
                    Some(remaining) if *remaining > 0 => {
                        *remaining -= 1;
                        true
                    }
                    _ => false,
                }
            };
            if failed {
                bail!("induced processor failure for block {number}");
            }

            seen.lock().unwrap().push(number);
            Ok(vec![json!({
                "kind": "block",
                "number": number,
                "hash": block["hash"],
            })])
        })
    }
}

/// Sink that records every message and counts shutdowns.
#[derive(Clone, Default)]
pub struct RecordingSink {
    messages: Arc<Mutex<Vec<Value>>>,
    shutdowns: Arc<AtomicUsize>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<Value> {
        self.messages.lock().unwrap().clone()
    }

    pub fn message_numbers(&self) -> Vec<u64> {
        self.messages()
            .iter()
            .filter_map(|message| message["number"].as_u64())
            .collect()
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

impl Sink for RecordingSink {
    fn write(&self, message: Value) -> SinkFuture {
        let messages = self.messages.clone();
        Box::pin(async move {
            messages.lock().unwrap().push(message);
            Ok(())
        })
    }

    fn shutdown(&self) -> SinkFuture {
        let shutdowns = self.shutdowns.clone();
        Box::pin(async move {
            shutdowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

/// Polls `condition` until it holds or `timeout` elapses.
pub async fn wait_until<F>(what: &str, timeout: Duration, mut condition: F) -> Result<()>
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    loop {
        if condition() {
            return Ok(());
        }
        if start.elapsed() > timeout {
            bail!("condition not reached within {timeout:?}: {what}");
        }
        sleep(Duration::from_millis(20)).await;
    }
}
