//! In-memory checkpoint state and its debounced, coalesced persistence.
//!
//! Completions arrive in storms while chunks finish concurrently, so writes
//! are coalesced: a pending/committed version pair decides whether another
//! write is needed after the in-flight one lands, and the writer follows an
//! explicit Idle -> Scheduled -> Writing (-> re-scheduled) machine guarded
//! by the state mutex. The final on-disk document always matches the final
//! in-memory state.

use super::persist::{self, StreamRecord};
use crate::ranges::{self, BlockRange};
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Mutex as WriteGate;

pub const DEFAULT_SAVE_DEBOUNCE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Idle,
    Scheduled,
    Writing,
}

#[derive(Debug, Default)]
struct StreamState {
    init: Option<u64>,
    completed: Vec<BlockRange>,
}

#[derive(Debug)]
struct StoreState {
    streams: BTreeMap<String, StreamState>,
    pending_version: u64,
    committed_version: u64,
    writer: WriterState,
}

/// Durable record of which ranges each named stream has completed.
///
/// Cloning is cheap; clones share the same state and file.
#[derive(Clone, Debug)]
pub struct CheckpointStore {
    path: Arc<PathBuf>,
    debounce: Duration,
    state: Arc<Mutex<StoreState>>,
    write_gate: Arc<WriteGate<()>>,
}

impl CheckpointStore {
    /// Loads the checkpoint file at `path`. A missing file is a fresh
    /// start; any other load failure is fatal — the engine refuses to
    /// resume from guessed progress.
    pub async fn load(path: impl Into<PathBuf>, debounce: Duration) -> Result<Self> {
        let path = path.into();
        let streams = match tokio::fs::read_to_string(&path).await {
            Ok(document) => persist::decode(&document)
                .with_context(|| format!("checkpoint file {} is unusable", path.display()))?
                .into_iter()
                .map(|(id, record)| {
                    let state = StreamState {
                        init: Some(record.init),
                        completed: record.ranges,
                    };
                    (id, state)
                })
                .collect(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to read checkpoint file {}", path.display())
                });
            }
        };

        Ok(Self {
            path: Arc::new(path),
            debounce,
            state: Arc::new(Mutex::new(StoreState {
                streams,
                pending_version: 0,
                committed_version: 0,
                writer: WriterState::Idle,
            })),
            write_gate: Arc::new(WriteGate::new(())),
        })
    }

    /// True until the stream's initial block number has been set — the
    /// caller must resolve and set it before the first ingestion pass.
    pub fn is_fresh(&self, stream: &str) -> bool {
        let state = self.lock_state();
        state
            .streams
            .get(stream)
            .map_or(true, |entry| entry.init.is_none())
    }

    pub fn initial_block(&self, stream: &str) -> Option<u64> {
        let state = self.lock_state();
        state.streams.get(stream).and_then(|entry| entry.init)
    }

    /// Sets the lower bound below which ingestion never occurs. Logically
    /// once per stream; re-setting below already-completed ranges leaves
    /// those completions in place.
    pub fn set_initial_block(&self, stream: &str, block: u64) {
        let mut state = self.lock_state();
        state.streams.entry(stream.to_owned()).or_default().init = Some(block);
        state.pending_version += 1;
        drop(state);
        self.schedule_write();
    }

    pub fn mark_block_complete(&self, stream: &str, block: u64) {
        self.mark_complete(stream, BlockRange::single(block));
    }

    /// Merges `range` into the stream's completed set and schedules a
    /// debounced write. Completions are never removed.
    pub fn mark_complete(&self, stream: &str, range: BlockRange) {
        let mut state = self.lock_state();
        let entry = state.streams.entry(stream.to_owned()).or_default();
        let mut merged = std::mem::take(&mut entry.completed);
        merged.push(range);
        entry.completed = ranges::compact(merged);
        state.pending_version += 1;
        drop(state);
        self.schedule_write();
    }

    /// True iff `block` is not covered by any completed range.
    pub fn is_incomplete(&self, stream: &str, block: u64) -> bool {
        let state = self.lock_state();
        state.streams.get(stream).map_or(true, |entry| {
            !entry.completed.iter().any(|range| range.contains(block))
        })
    }

    /// Outstanding ranges between the stream's initial block and `latest`.
    pub fn incomplete_ranges(&self, stream: &str, latest: Option<u64>) -> Vec<BlockRange> {
        let state = self.lock_state();
        match state.streams.get(stream) {
            Some(entry) => ranges::invert(&entry.completed, entry.init, latest),
            None => Vec::new(),
        }
    }

    pub fn completed_ranges(&self, stream: &str) -> Vec<BlockRange> {
        let state = self.lock_state();
        state
            .streams
            .get(stream)
            .map(|entry| entry.completed.clone())
            .unwrap_or_default()
    }

    /// Drains any scheduled write; returns once the on-disk document
    /// matches the in-memory state. Call on shutdown.
    pub async fn save(&self) -> Result<()> {
        self.flush().await
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.state.lock().expect("checkpoint state mutex poisoned")
    }

    fn schedule_write(&self) {
        let spawn = {
            let mut state = self.lock_state();
            if state.writer == WriterState::Idle {
                state.writer = WriterState::Scheduled;
                true
            } else {
                // Scheduled or Writing: the version bump alone makes the
                // active writer run another pass.
                false
            }
        };

        if spawn {
            let store = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(store.debounce).await;
                if let Err(err) = store.flush().await {
                    tracing::error!(
                        path = %store.path.display(),
                        error = %err,
                        "checkpoint write failed"
                    );
                }
            });
        }
    }

    async fn flush(&self) -> Result<()> {
        let _gate = self.write_gate.lock().await;

        loop {
            let (version, document) = {
                let mut state = self.lock_state();
                if state.pending_version <= state.committed_version {
                    state.writer = WriterState::Idle;
                    return Ok(());
                }
                state.writer = WriterState::Writing;
                (state.pending_version, persist::encode(&snapshot(&state)))
            };

            let written = self.write_document(&document).await;

            let mut state = self.lock_state();
            match written {
                Ok(()) => {
                    state.committed_version = state.committed_version.max(version);
                    // Loop once more: completions that raced this write
                    // have bumped the pending version.
                }
                Err(err) => {
                    state.writer = WriterState::Idle;
                    return Err(err);
                }
            }
        }
    }

    async fn write_document(&self, document: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.with_context(|| {
                    format!("failed to create checkpoint directory {}", parent.display())
                })?;
            }
        }

        // Temp file + rename keeps the previous checkpoint intact if the
        // process dies mid-write.
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, document)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, self.path.as_ref())
            .await
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

fn snapshot(state: &StoreState) -> BTreeMap<String, StreamRecord> {
    state
        .streams
        .iter()
        .filter_map(|(id, entry)| {
            entry.init.map(|init| {
                let record = StreamRecord {
                    init,
                    ranges: entry.completed.clone(),
                };
                (id.clone(), record)
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::time::sleep;

    fn range(from: u64, to: u64) -> BlockRange {
        BlockRange::new(from, to).expect("test range must be valid")
    }

    fn checkpoint_path(dir: &TempDir) -> PathBuf {
        dir.path().join("checkpoint.json")
    }

    async fn quick_store(dir: &TempDir) -> CheckpointStore {
        CheckpointStore::load(checkpoint_path(dir), Duration::from_millis(10))
            .await
            .expect("store must load")
    }

    #[tokio::test]
    async fn missing_file_is_a_fresh_start() {
        let dir = tempfile::tempdir().unwrap();
        let store = quick_store(&dir).await;
        assert!(store.is_fresh("blocks"));
        assert!(store.initial_block("blocks").is_none());
        assert!(store.incomplete_ranges("blocks", Some(100)).is_empty());
    }

    #[tokio::test]
    async fn corrupted_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = checkpoint_path(&dir);
        tokio::fs::write(&path, "{definitely not json").await.unwrap();

        let err = CheckpointStore::load(&path, Duration::from_millis(10))
            .await
            .expect_err("corruption must refuse to load");
        assert!(format!("{err:#}").contains("unusable"), "got {err:#}");
    }

    #[tokio::test]
    async fn marks_merge_and_compact() {
        let dir = tempfile::tempdir().unwrap();
        let store = quick_store(&dir).await;
        store.set_initial_block("blocks", 0);

        store.mark_complete("blocks", range(10, 20));
        store.mark_complete("blocks", range(30, 40));
        store.mark_block_complete("blocks", 21);
        store.mark_complete("blocks", range(15, 25));

        assert_eq!(
            store.completed_ranges("blocks"),
            vec![range(10, 25), range(30, 40)]
        );
        assert!(!store.is_incomplete("blocks", 12));
        assert!(store.is_incomplete("blocks", 27));
    }

    #[tokio::test]
    async fn incomplete_ranges_invert_against_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let store = quick_store(&dir).await;
        store.set_initial_block("blocks", 0);
        store.mark_complete("blocks", range(10, 20));
        store.mark_complete("blocks", range(30, 40));

        assert_eq!(
            store.incomplete_ranges("blocks", Some(50)),
            vec![range(0, 9), range(21, 29), range(41, 50)]
        );
    }

    #[tokio::test]
    async fn save_round_trips_every_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = checkpoint_path(&dir);
        {
            let store = CheckpointStore::load(&path, Duration::from_secs(60))
                .await
                .unwrap();
            store.set_initial_block("blocks", 0);
            store.mark_complete("blocks", range(0, 99));
            store.set_initial_block("balances", 50);
            store.mark_complete("balances", range(50, 60));
            store.save().await.expect("save must flush");
        }

        let reloaded = CheckpointStore::load(&path, Duration::from_secs(60))
            .await
            .expect("saved file must reload");
        assert_eq!(reloaded.initial_block("blocks"), Some(0));
        assert_eq!(reloaded.completed_ranges("blocks"), vec![range(0, 99)]);
        assert_eq!(reloaded.initial_block("balances"), Some(50));
        assert_eq!(reloaded.completed_ranges("balances"), vec![range(50, 60)]);
    }

    #[tokio::test]
    async fn debounce_coalesces_a_storm_of_completions() {
        let dir = tempfile::tempdir().unwrap();
        let path = checkpoint_path(&dir);
        let store = CheckpointStore::load(&path, Duration::from_millis(20))
            .await
            .unwrap();
        store.set_initial_block("blocks", 0);
        for block in 0..100 {
            store.mark_block_complete("blocks", block);
        }

        sleep(Duration::from_millis(200)).await;

        let document = tokio::fs::read_to_string(&path)
            .await
            .expect("debounced write must have landed");
        let reloaded: serde_json::Value = serde_json::from_str(&document).unwrap();
        assert_eq!(reloaded["v"], 2);
        assert_eq!(reloaded["blocks"]["ranges"], serde_json::json!(["0-99"]));
    }

    #[tokio::test]
    async fn v1_file_upgrades_to_v2_on_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = checkpoint_path(&dir);
        tokio::fs::write(&path, r#"{"v":1,"init":0,"ranges":["10-20","30-40"]}"#)
            .await
            .unwrap();

        let store = CheckpointStore::load(&path, Duration::from_secs(60))
            .await
            .expect("v1 file must load");
        assert_eq!(store.initial_block("main"), Some(0));
        assert_eq!(
            store.completed_ranges("main"),
            vec![range(10, 20), range(30, 40)]
        );

        store.mark_block_complete("main", 21);
        store.save().await.unwrap();

        let document = tokio::fs::read_to_string(&path).await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&document).unwrap();
        assert_eq!(value["v"], 2);
        assert_eq!(value["main"]["init"], 0);
        assert_eq!(value["main"]["ranges"], serde_json::json!(["10-21", "30-40"]));
    }

    #[tokio::test]
    async fn save_with_nothing_pending_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = quick_store(&dir).await;
        store.save().await.expect("empty save must succeed");
        assert!(!checkpoint_path(&dir).exists());
    }
}
