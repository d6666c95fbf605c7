//! Tracing setup and lightweight rolling counters for observability.

use crate::exec::CancelHandle;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio::{select, time};
use tracing_subscriber::EnvFilter;

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs a basic tracing subscriber (if one is not already active).
///
/// The subscriber honours `RUST_LOG` if it is present, otherwise it falls
/// back to `info`. Calling this function multiple times is harmless.
pub fn init_tracing() {
    if TRACING_INIT.get().is_some() {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();

    let _ = TRACING_INIT.set(());
}

/// Rolling counters recorded by the ingestion loop.
#[derive(Default, Debug)]
pub struct Telemetry {
    processed_blocks: AtomicU64,
    sink_messages: AtomicU64,
    completed_ranges: AtomicU64,
    chunk_retries: AtomicU64,
    loop_failures: AtomicU64,
}

impl Telemetry {
    pub fn record_processed_block(&self) {
        self.processed_blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sink_messages(&self, count: u64) {
        if count == 0 {
            return;
        }
        self.sink_messages.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_completed_range(&self) {
        self.completed_ranges.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_chunk_retry(&self) {
        self.chunk_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_loop_failure(&self) {
        self.loop_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn processed_blocks(&self) -> u64 {
        self.processed_blocks.load(Ordering::Relaxed)
    }

    pub fn sink_messages(&self) -> u64 {
        self.sink_messages.load(Ordering::Relaxed)
    }

    pub fn completed_ranges(&self) -> u64 {
        self.completed_ranges.load(Ordering::Relaxed)
    }

    pub fn chunk_retries(&self) -> u64 {
        self.chunk_retries.load(Ordering::Relaxed)
    }

    pub fn loop_failures(&self) -> u64 {
        self.loop_failures.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            processed_blocks: self.processed_blocks(),
            sink_messages: self.sink_messages(),
            completed_ranges: self.completed_ranges(),
            chunk_retries: self.chunk_retries(),
            loop_failures: self.loop_failures(),
        }
    }
}

#[derive(Debug, Copy, Clone)]
pub struct TelemetrySnapshot {
    pub processed_blocks: u64,
    pub sink_messages: u64,
    pub completed_ranges: u64,
    pub chunk_retries: u64,
    pub loop_failures: u64,
}

/// Spawns a background task that periodically logs throughput and error
/// counters until `shutdown` is cancelled.
pub fn spawn_metrics_reporter(
    telemetry: Arc<Telemetry>,
    shutdown: CancelHandle,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_snapshot = telemetry.snapshot();
        let mut last_tick = Instant::now();

        loop {
            select! {
                _ = shutdown.aborted() => {
                    tracing::debug!(target: "chainspan::metrics", "metrics reporter shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let current = telemetry.snapshot();
                    let processed_delta = current
                        .processed_blocks
                        .saturating_sub(last_snapshot.processed_blocks);
                    let elapsed = last_tick.elapsed().as_secs_f64();
                    let throughput = if elapsed <= f64::EPSILON {
                        0.0
                    } else {
                        processed_delta as f64 / elapsed
                    };

                    tracing::info!(
                        target: "chainspan::metrics",
                        throughput = format!("{throughput:.2}"),
                        processed = current.processed_blocks,
                        sink_messages = current.sink_messages,
                        completed_ranges = current.completed_ranges,
                        chunk_retries = current.chunk_retries,
                        loop_failures = current.loop_failures,
                        "runtime metrics snapshot"
                    );

                    last_snapshot = current;
                    last_tick = Instant::now();
                }
            }
        }
    })
}
