//! The resumable ingestion loop.
//!
//! One `Watcher` drives one checkpoint stream: resolve the initial block
//! once, then poll — fetch the head, compute outstanding ranges from the
//! checkpoint, split them into chunks, and run the chunks through the
//! bounded runner with per-chunk retry. Completion is marked per block,
//! only after the sink has accepted that block's output, so a crash can
//! duplicate work but never skip it.

use crate::checkpoint::CheckpointStore;
use crate::exec::{retry, run_bounded, CancelHandle, Cancelled, RetryOptions};
use crate::ranges::{self, BlockRange};
use crate::rpc::NodeClient;
use crate::runtime::config::WatcherConfig;
use crate::runtime::telemetry::{spawn_metrics_reporter, Telemetry};
use crate::watcher::processor::BlockProcessor;
use crate::watcher::sink::Sink;
use anyhow::{bail, Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

pub struct Watcher<P: BlockProcessor> {
    config: WatcherConfig,
    checkpoint: CheckpointStore,
    client: Arc<NodeClient>,
    processor: Arc<P>,
    sink: Arc<dyn Sink>,
    telemetry: Arc<Telemetry>,
    cancel: CancelHandle,
    active: Arc<AtomicBool>,
    run_cancel: Option<CancelHandle>,
    loop_handle: Option<JoinHandle<Result<()>>>,
    metrics_handle: Option<JoinHandle<()>>,
    running: bool,
}

impl<P: BlockProcessor> std::fmt::Debug for Watcher<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("running", &self.running)
            .finish_non_exhaustive()
    }
}

struct WatcherContext<P: BlockProcessor> {
    config: WatcherConfig,
    checkpoint: CheckpointStore,
    client: Arc<NodeClient>,
    processor: Arc<P>,
    sink: Arc<dyn Sink>,
    telemetry: Arc<Telemetry>,
    cancel: CancelHandle,
    active: Arc<AtomicBool>,
}

impl<P: BlockProcessor> Clone for WatcherContext<P> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            checkpoint: self.checkpoint.clone(),
            client: Arc::clone(&self.client),
            processor: Arc::clone(&self.processor),
            sink: Arc::clone(&self.sink),
            telemetry: Arc::clone(&self.telemetry),
            cancel: self.cancel.clone(),
            active: Arc::clone(&self.active),
        }
    }
}

enum Iteration {
    /// Normal pass; `ranges_completed` counts outstanding ranges drained.
    Progressed { ranges_completed: usize },
    /// `end_at` reached with nothing outstanding.
    Completed,
}

impl<P: BlockProcessor> Watcher<P> {
    /// Creates a watcher with its own root cancellation handle. Loading a
    /// corrupted checkpoint file fails here, before any ingestion starts.
    pub async fn new(config: WatcherConfig, processor: P, sink: impl Sink) -> Result<Self> {
        Self::with_cancel_handle(config, processor, sink, CancelHandle::new()).await
    }

    /// Creates a watcher wired to an existing cancellation handle so it can
    /// share shutdown with the embedding process.
    pub async fn with_cancel_handle(
        config: WatcherConfig,
        processor: P,
        sink: impl Sink,
        cancel: CancelHandle,
    ) -> Result<Self> {
        debug_assert!(
            config.validate().is_ok(),
            "WatcherConfig should have been validated at construction time"
        );

        let checkpoint =
            CheckpointStore::load(config.checkpoint_path(), config.checkpoint_debounce())
                .await
                .context("failed to load checkpoint")?;
        let client = Arc::new(
            NodeClient::with_options(config.rpc_url(), config.rpc_options())
                .context("failed to build RPC client")?,
        );

        Ok(Self {
            config,
            checkpoint,
            client,
            processor: Arc::new(processor),
            sink: Arc::new(sink),
            telemetry: Arc::new(Telemetry::default()),
            cancel,
            active: Arc::new(AtomicBool::new(false)),
            run_cancel: None,
            loop_handle: None,
            metrics_handle: None,
            running: false,
        })
    }

    pub fn config(&self) -> &WatcherConfig {
        &self.config
    }

    pub fn checkpoint(&self) -> &CheckpointStore {
        &self.checkpoint
    }

    pub fn telemetry(&self) -> Arc<Telemetry> {
        self.telemetry.clone()
    }

    /// Root cancellation handle; aborting it stops the watcher.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Spawns the ingestion loop.
    pub fn start(&mut self) -> Result<()> {
        if self.running {
            bail!("watcher already running");
        }

        let run_cancel = self.cancel.child();
        self.active.store(true, Ordering::SeqCst);

        tracing::info!(
            stream = self.config.stream(),
            endpoint = self.config.rpc_url(),
            max_parallel_chunks = self.config.max_parallel_chunks(),
            "starting watcher"
        );

        let context = WatcherContext {
            config: self.config.clone(),
            checkpoint: self.checkpoint.clone(),
            client: self.client.clone(),
            processor: self.processor.clone(),
            sink: self.sink.clone(),
            telemetry: self.telemetry.clone(),
            cancel: run_cancel.clone(),
            active: self.active.clone(),
        };

        self.metrics_handle = Some(spawn_metrics_reporter(
            self.telemetry.clone(),
            run_cancel.clone(),
            self.config.metrics_interval(),
        ));
        self.loop_handle = Some(tokio::spawn(run_loop(context)));
        self.run_cancel = Some(run_cancel);
        self.running = true;
        Ok(())
    }

    /// Stops the watcher: clears the active flag, aborts the run handle,
    /// and waits for the loop to observe the abort, then drains the sink
    /// and flushes the checkpoint. No in-flight work is dropped silently.
    pub async fn stop(&mut self) -> Result<()> {
        if !self.running {
            return Ok(());
        }

        tracing::info!(stream = self.config.stream(), "stopping watcher");
        self.active.store(false, Ordering::SeqCst);
        if let Some(run_cancel) = &self.run_cancel {
            run_cancel.abort();
        }

        let mut pipeline_error: Option<anyhow::Error> = None;
        if let Some(handle) = self.loop_handle.take() {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) if Cancelled::caused(&err) => {}
                Ok(Err(err)) => {
                    tracing::error!(error = %format!("{err:#}"), "ingestion loop exited with error");
                    pipeline_error = Some(err);
                }
                Err(err) => {
                    tracing::error!(error = %err, "failed to join ingestion loop task");
                    pipeline_error = Some(err.into());
                }
            }
        }

        if let Some(handle) = self.metrics_handle.take() {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "metrics reporter task panicked");
            }
        }

        self.sink
            .shutdown()
            .await
            .context("failed to shut down sink")?;
        self.checkpoint
            .save()
            .await
            .context("failed to flush checkpoint")?;

        self.running = false;
        self.run_cancel = None;

        if let Some(err) = pipeline_error {
            return Err(err.context("ingestion pipeline aborted"));
        }
        Ok(())
    }

    /// Waits for the ingestion loop to finish on its own (`end_at` reached
    /// or cancellation observed), then performs the same teardown as
    /// [`Watcher::stop`].
    pub async fn wait(&mut self) -> Result<()> {
        let outcome = match self.loop_handle.take() {
            Some(handle) => handle.await,
            None => return self.stop().await,
        };

        let stop_result = self.stop().await;
        match outcome {
            Ok(Ok(())) => stop_result,
            Ok(Err(err)) if Cancelled::caused(&err) => stop_result,
            Ok(Err(err)) => Err(err.context("ingestion pipeline aborted")),
            Err(err) => Err(anyhow::Error::from(err)),
        }
    }
}

async fn run_loop<P: BlockProcessor>(ctx: WatcherContext<P>) -> Result<()> {
    let stream = ctx.config.stream().to_owned();

    // Determining-Start: once per stream lifetime.
    if ctx.checkpoint.is_fresh(&stream) {
        match determine_start(&ctx).await {
            Ok(()) => {}
            Err(err) if Cancelled::caused(&err) => {
                tracing::info!(stream = %stream, "watcher stopped before start block was resolved");
                return Ok(());
            }
            Err(err) => return Err(err.context("failed to resolve start block")),
        }
    }

    let mut consecutive_failures = 0usize;

    loop {
        if !ctx.active.load(Ordering::SeqCst) || ctx.cancel.is_aborted() {
            break;
        }

        match run_iteration(&ctx, &stream).await {
            Ok(Iteration::Completed) => {
                tracing::info!(
                    stream = %stream,
                    end_at = ?ctx.config.end_at(),
                    "configured end reached with no outstanding ranges; watcher complete"
                );
                break;
            }
            Ok(Iteration::Progressed { ranges_completed }) => {
                if ranges_completed > 0 {
                    consecutive_failures = 0;
                }
                if ctx.cancel.sleep(ctx.config.poll_interval()).await.is_err() {
                    break;
                }
            }
            Err(err) if Cancelled::caused(&err) => break,
            Err(err) => {
                consecutive_failures += 1;
                ctx.telemetry.record_loop_failure();
                let wait = ctx.config.wait_after_failure().delay(consecutive_failures);
                tracing::warn!(
                    stream = %stream,
                    consecutive_failures,
                    backoff_ms = wait.as_millis() as u64,
                    error = %format!("{err:#}"),
                    "ingestion iteration failed; backing off"
                );
                if ctx.cancel.sleep(wait).await.is_err() {
                    break;
                }
            }
        }
    }

    tracing::info!(stream = %stream, "watcher loop stopped");
    Ok(())
}

async fn determine_start<P: BlockProcessor>(ctx: &WatcherContext<P>) -> Result<()> {
    let start_at = ctx.config.start_at();

    let head = if start_at.needs_head() {
        let client = ctx.client.clone();
        retry(
            RetryOptions::new("resolve start block", ctx.config.wait_after_failure())
                .with_cancel(&ctx.cancel),
            move |_| {
                let client = client.clone();
                async move { client.fetch_head().await }
            },
        )
        .await?
    } else {
        0
    };

    let start = start_at.resolve(head);
    ctx.checkpoint.set_initial_block(ctx.config.stream(), start);
    tracing::info!(
        stream = ctx.config.stream(),
        start_block = start,
        "resolved initial block number"
    );
    Ok(())
}

async fn run_iteration<P: BlockProcessor>(
    ctx: &WatcherContext<P>,
    stream: &str,
) -> Result<Iteration> {
    // Fetching-Head, clamped to the configured end.
    let head = ctx.client.fetch_head().await?;
    let latest = ctx.config.end_at().map_or(head, |end| head.min(end));

    // Computing-Ranges.
    let outstanding = ctx.checkpoint.incomplete_ranges(stream, Some(latest));
    if outstanding.is_empty() {
        if let Some(end) = ctx.config.end_at() {
            if head >= end {
                return Ok(Iteration::Completed);
            }
        }
        tracing::debug!(stream = %stream, head, "no outstanding ranges; waiting for new blocks");
        return Ok(Iteration::Progressed {
            ranges_completed: 0,
        });
    }

    let mut ranges_completed = 0usize;
    for range in outstanding {
        process_range(ctx, stream, range).await?;
        ranges_completed += 1;
        ctx.telemetry.record_completed_range();
    }

    Ok(Iteration::Progressed { ranges_completed })
}

async fn process_range<P: BlockProcessor>(
    ctx: &WatcherContext<P>,
    stream: &str,
    range: BlockRange,
) -> Result<()> {
    // Chunking + Processing.
    let chunks = ranges::chunk(
        range,
        ctx.config.max_chunk_size(),
        ctx.config.chunk_queue_max(),
    );
    tracing::debug!(
        stream = %stream,
        range = %range,
        chunks = chunks.len(),
        "processing outstanding range"
    );

    let tasks: Vec<_> = chunks
        .into_iter()
        .map(|chunk| {
            let ctx = ctx.clone();
            let stream = stream.to_owned();
            move || async move { process_chunk_with_retry(&ctx, &stream, chunk).await }
        })
        .collect();

    run_bounded(tasks, ctx.config.max_parallel_chunks(), Some(&ctx.cancel)).await?;
    Ok(())
}

async fn process_chunk_with_retry<P: BlockProcessor>(
    ctx: &WatcherContext<P>,
    stream: &str,
    chunk: BlockRange,
) -> Result<()> {
    let name = format!("chunk {chunk}");
    let telemetry = ctx.telemetry.clone();

    retry(
        RetryOptions::new(&name, ctx.config.wait_after_failure())
            .with_max_attempts(ctx.config.chunk_attempts())
            .with_cancel(&ctx.cancel),
        |attempt| {
            if attempt > 1 {
                telemetry.record_chunk_retry();
            }
            process_chunk(ctx, stream, chunk)
        },
    )
    .await
}

async fn process_chunk<P: BlockProcessor>(
    ctx: &WatcherContext<P>,
    stream: &str,
    chunk: BlockRange,
) -> Result<()> {
    // Skip blocks a previous run (or a previous attempt) already completed.
    let pending: Vec<u64> = chunk
        .blocks()
        .filter(|block| ctx.checkpoint.is_incomplete(stream, *block))
        .collect();
    if pending.is_empty() {
        tracing::trace!(stream = %stream, chunk = %chunk, "chunk already complete; skipping");
        return Ok(());
    }

    // One batched wire call for the whole chunk.
    let blocks = ctx.client.fetch_blocks(&pending).await?;

    // Within a chunk, blocks are processed strictly in ascending order.
    for (number, block) in blocks {
        let messages = ctx
            .cancel
            .race(ctx.processor.process(number, block))
            .await
            .map_err(anyhow::Error::new)??;

        let count = messages.len() as u64;
        for message in messages {
            ctx.cancel
                .race(ctx.sink.write(message))
                .await
                .map_err(anyhow::Error::new)??;
        }
        ctx.telemetry.record_sink_messages(count);

        // Marked only after the sink accepted this block's output: a crash
        // here re-processes the block, it never skips it.
        ctx.checkpoint.mark_block_complete(stream, number);
        ctx.telemetry.record_processed_block();
    }

    Ok(())
}
