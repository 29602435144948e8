//! Ingest Coalescer
//!
//! Per-stream batching of record insertions. See the crate docs for
//! the model; this module holds the lock discipline:
//!
//! - A global map mutex guards only the `uuid -> stream slot` map.
//!   No I/O ever happens while it is held.
//! - Each stream slot is an async mutex over that stream's open batch.
//!   Appends, commits, deletes and the timer all take it.
//! - Each open batch owns an abort channel. A synchronous commit fires
//!   it so the timer task exits instead of waking up to an empty batch.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use quasar_core::{ClusterState, Error, Record, Result, StorageConfig};
use quasar_storage::BlockProvider;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::engine::TreeEngine;

/// One stream's pending state.
struct OpenTree {
    uuid: Uuid,
    pending: Vec<Record>,
    /// Fired when a synchronous commit makes the pending timer moot.
    abort: Option<oneshot::Sender<()>>,
}

impl OpenTree {
    fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            pending: Vec::new(),
            abort: None,
        }
    }
}

type TreeSlot = Arc<AsyncMutex<OpenTree>>;

/// Batches per-stream insertions and commits them through the tree
/// engine on a point or time threshold.
pub struct IngestCoalescer {
    engine: Arc<dyn TreeEngine>,
    provider: Arc<dyn BlockProvider>,
    cluster: Arc<dyn ClusterState>,
    max_points: usize,
    max_interval: Duration,
    trees: Arc<Mutex<HashMap<Uuid, TreeSlot>>>,
}

impl IngestCoalescer {
    pub fn new(
        engine: Arc<dyn TreeEngine>,
        provider: Arc<dyn BlockProvider>,
        cluster: Arc<dyn ClusterState>,
        config: &StorageConfig,
    ) -> Self {
        Self {
            engine,
            provider,
            cluster,
            max_points: config.coalesce_max_points,
            max_interval: Duration::from_millis(config.coalesce_max_interval_ms),
            trees: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The slot for a stream, creating it on first use. Fails with
    /// `NoSuchStream` for streams that were never created and
    /// `WrongEndpoint` for streams this node does not own.
    async fn tree_slot(&self, uuid: Uuid) -> Result<TreeSlot> {
        if !self.cluster.we_hold_write_lock_for(&uuid) {
            return Err(Error::WrongEndpoint);
        }
        {
            let trees = self.trees.lock().expect("tree map poisoned");
            if let Some(slot) = trees.get(&uuid) {
                return Ok(Arc::clone(slot));
            }
        }
        // Existence check happens outside the map mutex; that lock is
        // only ever held across map operations.
        if !self.provider.stream_exists(uuid).await? {
            return Err(Error::NoSuchStream);
        }
        let mut trees = self.trees.lock().expect("tree map poisoned");
        Ok(Arc::clone(trees.entry(uuid).or_insert_with(|| {
            Arc::new(AsyncMutex::new(OpenTree::new(uuid)))
        })))
    }

    /// Append records to the stream's pending batch, committing
    /// synchronously once the batch holds `coalesce_max_points`.
    pub async fn insert_values(&self, uuid: Uuid, records: Vec<Record>) -> Result<()> {
        let slot = self.tree_slot(uuid).await?;
        let mut tree = slot.lock().await;

        if tree.pending.is_empty() {
            tree.pending = Vec::with_capacity(records.len() * 2);
            let (abort_tx, abort_rx) = oneshot::channel();
            tree.abort = Some(abort_tx);

            let engine = Arc::clone(&self.engine);
            let timer_slot = Arc::clone(&slot);
            let interval = self.max_interval;
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        let mut tree = timer_slot.lock().await;
                        // A synchronous commit may have won the race
                        // between the timer firing and this lock;
                        // commit is a no-op on an empty batch then.
                        if let Err(e) = commit(&engine, &mut tree).await {
                            error!(uuid = %tree.uuid, error = %e, "timed coalesce commit failed");
                        }
                    }
                    _ = abort_rx => {}
                }
            });
        }

        tree.pending.extend(records);

        if tree.pending.len() >= self.max_points {
            if let Some(abort) = tree.abort.take() {
                let _ = abort.send(());
            }
            commit(&self.engine, &mut tree).await?;
        }
        Ok(())
    }

    /// Commit the stream's pending batch now, if there is one.
    pub async fn flush(&self, uuid: Uuid) -> Result<()> {
        let slot = self.tree_slot(uuid).await?;
        let mut tree = slot.lock().await;
        if tree.pending.is_empty() {
            debug!(%uuid, "flush found nothing pending");
            return Ok(());
        }
        if let Some(abort) = tree.abort.take() {
            let _ = abort.send(());
        }
        commit(&self.engine, &mut tree).await
    }

    /// Delete `[start, end)` from the stream. Any pending batch is
    /// committed first so the delete sees every accepted record.
    pub async fn delete_range(&self, uuid: Uuid, start: i64, end: i64) -> Result<()> {
        let slot = self.tree_slot(uuid).await?;
        let mut tree = slot.lock().await;
        if !tree.pending.is_empty() {
            if let Some(abort) = tree.abort.take() {
                let _ = abort.send(());
            }
            commit(&self.engine, &mut tree).await?;
        }
        self.engine.delete_range(uuid, start, end).await
    }

    /// Commit every open batch. The returned receiver completes when
    /// the last one is durable; callers stop feeding inserts first.
    pub fn initiate_shutdown(&self) -> oneshot::Receiver<()> {
        let (done_tx, done_rx) = oneshot::channel();
        let engine = Arc::clone(&self.engine);
        let trees = Arc::clone(&self.trees);
        tokio::spawn(async move {
            let slots: Vec<TreeSlot> = {
                let trees = trees.lock().expect("tree map poisoned");
                trees.values().cloned().collect()
            };
            let total = slots.len();
            warn!(total, "flushing open trees for shutdown");
            for (idx, slot) in slots.into_iter().enumerate() {
                let mut tree = slot.lock().await;
                if tree.pending.is_empty() {
                    debug!(uuid = %tree.uuid, "clean ({}/{total})", idx + 1);
                    continue;
                }
                if let Some(abort) = tree.abort.take() {
                    let _ = abort.send(());
                }
                match commit(&engine, &mut tree).await {
                    Ok(()) => warn!(uuid = %tree.uuid, "flushed ({}/{total})", idx + 1),
                    Err(e) => error!(uuid = %tree.uuid, error = %e, "shutdown commit failed"),
                }
            }
            let _ = done_tx.send(());
        });
        done_rx
    }
}

/// Hand the pending batch to the tree engine. Must be called with the
/// stream's mutex held; a batch never spans two commits because the
/// whole batch is taken out before the engine runs.
async fn commit(engine: &Arc<dyn TreeEngine>, tree: &mut OpenTree) -> Result<()> {
    if tree.pending.is_empty() {
        // Happens when the timer loses the race against a synchronous
        // commit; nothing to do.
        return Ok(());
    }
    let batch = std::mem::take(&mut tree.pending);
    tree.abort = None;
    let count = batch.len();
    engine.insert_values(tree.uuid, batch).await?;
    debug!(uuid = %tree.uuid, count, "batch committed");
    Ok(())
}
