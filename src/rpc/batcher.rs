//! Coalescing batch layer over [`NodeClient`]. Requests submitted through
//! [`BatchedClient::request`] within a short window are flushed as one
//! batched wire call and demultiplexed back to their callers by request id.
//!
//! Correlation ids are instance-scoped, so independent clients (one per
//! test, one per watcher group) never share state.

use crate::rpc::client::{NodeClient, RpcError};
use anyhow::{anyhow, Context, Result};
use jsonrpsee::core::params::{ArrayParams, BatchRequestBuilder};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

struct BatchItem {
    id: u64,
    method: String,
    params: Vec<Value>,
    reply: oneshot::Sender<Result<Value>>,
}

struct QueueState {
    items: Vec<BatchItem>,
    /// Bumped whenever the queue is drained so a stale flush timer cannot
    /// flush the batch that came after its own.
    epoch: u64,
}

#[derive(Clone)]
pub struct BatchedClient {
    node: Arc<NodeClient>,
    queue: Arc<Mutex<QueueState>>,
    next_id: Arc<AtomicU64>,
}

impl BatchedClient {
    pub fn new(node: Arc<NodeClient>) -> Self {
        Self {
            node,
            queue: Arc::new(Mutex::new(QueueState {
                items: Vec::new(),
                epoch: 0,
            })),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn node(&self) -> &Arc<NodeClient> {
        &self.node
    }

    /// Single immediate call, bypassing the queue entirely.
    pub async fn send(&self, method: &'static str, params: Vec<Value>) -> Result<Value> {
        self.node.call(method, array_params(&params)?).await
    }

    /// Queues one request. The queue flushes as one batched wire call when
    /// it reaches `batch_max_size` entries or the oldest entry has waited
    /// `batch_max_wait`, whichever comes first.
    pub async fn request(&self, method: impl Into<String>, params: Vec<Value>) -> Result<Value> {
        let (reply, receiver) = oneshot::channel();
        let item = BatchItem {
            id: self.allocate_id(),
            method: method.into(),
            params,
            reply,
        };

        let options = self.node.options();
        let (due_now, timer_epoch) = {
            let mut queue = self.lock_queue();
            queue.items.push(item);
            if queue.items.len() >= options.batch_max_size {
                (Some(drain(&mut queue)), None)
            } else if queue.items.len() == 1 {
                (None, Some(queue.epoch))
            } else {
                (None, None)
            }
        };

        if let Some(items) = due_now {
            self.dispatch(items).await;
        } else if let Some(epoch) = timer_epoch {
            let client = self.clone();
            let wait = options.batch_max_wait;
            tokio::spawn(async move {
                tokio::time::sleep(wait).await;
                client.flush_epoch(epoch).await;
            });
        }

        receiver
            .await
            .map_err(|_| anyhow!("batch dispatcher dropped the request"))?
    }

    /// Issues `requests` as one explicit batched wire call right now,
    /// returning per-request results in submission order. A response
    /// missing from the batch fails only its own entry; a transport
    /// failure fails the call as a whole.
    pub async fn request_batch(
        &self,
        requests: Vec<(String, Vec<Value>)>,
    ) -> Result<Vec<Result<Value>>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<u64> = requests.iter().map(|_| self.allocate_id()).collect();
        let mut batch = BatchRequestBuilder::new();
        for (method, params) in &requests {
            batch
                .insert(method.as_str(), array_params(params)?)
                .with_context(|| format!("failed to serialize batched {method} request"))?;
        }

        let entries = self.node.call_batch(batch, "batch").await?;
        let mut entries = entries.into_iter();
        let results = ids
            .into_iter()
            .map(|id| match entries.next() {
                Some(entry) => entry,
                None => Err(RpcError::ResultMissing { id }.into()),
            })
            .collect();
        Ok(results)
    }

    async fn flush_epoch(&self, epoch: u64) {
        let due = {
            let mut queue = self.lock_queue();
            if queue.epoch == epoch && !queue.items.is_empty() {
                Some(drain(&mut queue))
            } else {
                // Already flushed by the size limit (or a newer batch owns
                // the queue now).
                None
            }
        };
        if let Some(items) = due {
            self.dispatch(items).await;
        }
    }

    async fn dispatch(&self, items: Vec<BatchItem>) {
        tracing::debug!(requests = items.len(), "flushing coalesced rpc batch");

        match self.send_wire(&items).await {
            Ok(entries) => {
                let mut entries = entries.into_iter();
                for item in items {
                    let result = match entries.next() {
                        Some(entry) => entry,
                        None => Err(RpcError::ResultMissing { id: item.id }.into()),
                    };
                    let _ = item.reply.send(result);
                }
            }
            Err(err) => {
                // Transport-level failure: every queued caller fails.
                let detail = format!("{err:#}");
                for item in items {
                    let _ = item
                        .reply
                        .send(Err(anyhow!("batched rpc call failed: {detail}")));
                }
            }
        }
    }

    async fn send_wire(&self, items: &[BatchItem]) -> Result<Vec<Result<Value>>> {
        let mut batch = BatchRequestBuilder::new();
        for item in items {
            batch
                .insert(item.method.as_str(), array_params(&item.params)?)
                .with_context(|| format!("failed to serialize batched {} request", item.method))?;
        }
        self.node.call_batch(batch, "batch").await
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.queue.lock().expect("batch queue mutex poisoned")
    }
}

fn drain(queue: &mut QueueState) -> Vec<BatchItem> {
    queue.epoch += 1;
    std::mem::take(&mut queue.items)
}

fn array_params(values: &[Value]) -> Result<ArrayParams> {
    let mut params = ArrayParams::new();
    for value in values {
        params
            .insert(value)
            .context("failed to serialize request parameter")?;
    }
    Ok(params)
}
