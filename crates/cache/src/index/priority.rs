//! In-memory eviction index
//!
//! Keeps a min-heap of stored artifacts ordered by modification time plus a
//! running byte total. The heap is seeded lazily from a full listing of the
//! backing store the first time a notification arrives; until that warm-up
//! finishes, notifications are recorded but nothing is pruned.
//!
//! Once warm, every notification prunes: the oldest entries are taken off the
//! heap until the projected total satisfies the limit, deleted from the
//! backing store a few at a time, and subtracted from the total only when the
//! delete succeeded. Entries whose delete failed go back on the heap.
//!
//! Heap entries are never updated in place. A rewrite pushes a new entry and
//! the live-entry map decides which heap entry is current; stale ones are
//! skipped when popped.

use super::PruneReport;
use super::rebuild::{Rebuilder, Reconcile, item_from_blob};
use crate::backend::{BlobStore, list_all};
use crate::config::{IndexConfig, IndexLimit};
use artcache_core::parallel::run_bounded;
use artcache_core::{
    CacheIndex, CacheKey, IndexItem, ProgressCallback, RebuildProgress, RebuildableCacheIndex,
    Result,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const COLD: u8 = 0;
const WARMING: u8 = 1;
const WARM: u8 = 2;

#[derive(Debug, Default)]
struct QueueState {
    heap: BinaryHeap<Reverse<IndexItem>>,
    live: HashMap<CacheKey, IndexItem>,
    total_size: u64,
}

impl QueueState {
    /// Record `item`, replacing any previous entry for its key
    fn record(&mut self, item: IndexItem) {
        match self.live.insert(item.key, item) {
            Some(previous) if previous == item => return,
            Some(previous) => self.total_size = self.total_size.saturating_sub(previous.size),
            None => {}
        }
        self.total_size = self.total_size.saturating_add(item.size);
        self.heap.push(Reverse(item));
    }

    /// Record `item` only if its key is unknown
    fn record_if_absent(&mut self, item: IndexItem) {
        if !self.live.contains_key(&item.key) {
            self.record(item);
        }
    }

    fn forget(&mut self, key: &CacheKey) -> Option<IndexItem> {
        let item = self.live.remove(key)?;
        self.total_size = self.total_size.saturating_sub(item.size);
        Some(item)
    }

    /// Remove the oldest live entry; its bytes stay in the total
    fn pop_oldest(&mut self) -> Option<IndexItem> {
        while let Some(Reverse(item)) = self.heap.pop() {
            if self.live.get(&item.key) == Some(&item) {
                self.live.remove(&item.key);
                return Some(item);
            }
        }
        None
    }

    /// Put back an entry whose delete failed
    fn restore(&mut self, item: IndexItem) {
        if self.live.contains_key(&item.key) {
            // Rewritten while the delete was in flight; the new entry owns the bytes
            self.total_size = self.total_size.saturating_sub(item.size);
        } else {
            self.live.insert(item.key, item);
            self.heap.push(Reverse(item));
        }
    }

    fn items(&self) -> u64 {
        self.live.len() as u64
    }
}

/// Eviction index held entirely in memory
pub struct PriorityIndex {
    blobs: Arc<dyn BlobStore>,
    limit: IndexLimit,
    parallelism: usize,
    page_size: usize,
    state: Mutex<QueueState>,
    warm: AtomicU8,
    prune_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for PriorityIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PriorityIndex")
            .field("limit", &self.limit)
            .field("items", &state.live.len())
            .field("total_size", &state.total_size)
            .field("warm", &self.is_warm())
            .finish_non_exhaustive()
    }
}

impl PriorityIndex {
    /// Create an index over `blobs` bounded by `limit`
    #[must_use]
    pub fn new(blobs: Arc<dyn BlobStore>, limit: IndexLimit) -> Self {
        let defaults = IndexConfig::default();
        Self {
            blobs,
            limit,
            parallelism: defaults.delete_parallelism,
            page_size: defaults.page_size,
            state: Mutex::new(QueueState::default()),
            warm: AtomicU8::new(COLD),
            prune_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Create an index from configuration
    pub fn from_config(blobs: Arc<dyn BlobStore>, config: &IndexConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(blobs, config.required_limit()?)
            .with_parallelism(config.delete_parallelism)
            .with_page_size(config.page_size))
    }

    /// Set the number of concurrent deletes while pruning
    #[must_use]
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Set the listing page size used for warm-up and rebuilds
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Running byte total of tracked artifacts
    pub fn total_size(&self) -> u64 {
        self.state.lock().total_size
    }

    /// Number of tracked artifacts
    pub fn len(&self) -> usize {
        self.state.lock().live.len()
    }

    /// Whether nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.state.lock().live.is_empty()
    }

    /// Whether `key` is tracked
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.state.lock().live.contains_key(key)
    }

    /// Whether the initial listing has completed
    pub fn is_warm(&self) -> bool {
        self.warm.load(Ordering::Acquire) == WARM
    }

    /// Seed the index from the backing store if that has not happened yet
    ///
    /// Returns `false` if another task is currently warming the index.
    pub async fn warm_up(&self) -> Result<bool> {
        match self
            .warm
            .compare_exchange(COLD, WARMING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => match list_all(self.blobs.as_ref(), self.page_size).await {
                Ok(listing) => {
                    let mut state = self.state.lock();
                    for item in listing.iter().filter_map(item_from_blob) {
                        state.record_if_absent(item);
                    }
                    info!(
                        items = state.live.len(),
                        total_size = state.total_size,
                        "Seeded in-memory index from backing store"
                    );
                    self.warm.store(WARM, Ordering::Release);
                    Ok(true)
                }
                Err(e) => {
                    self.warm.store(COLD, Ordering::Release);
                    Err(e)
                }
            },
            Err(WARM) => Ok(true),
            Err(_) => Ok(false),
        }
    }

    /// Delete oldest artifacts until the limit is satisfied
    #[instrument(skip(self), fields(limit = ?self.limit))]
    pub async fn prune(&self) -> Result<PruneReport> {
        let _serial = self.prune_lock.lock().await;

        let victims = {
            let mut state = self.state.lock();
            let mut projected = state.total_size;
            let mut victims = Vec::new();
            while self.limit.is_exceeded(projected, state.items()) {
                let Some(item) = state.pop_oldest() else {
                    break;
                };
                projected = projected.saturating_sub(item.size);
                victims.push(item);
            }
            victims
        };

        let mut report = PruneReport {
            examined: victims.len() as u64,
            ..PruneReport::default()
        };
        if victims.is_empty() {
            return Ok(report);
        }

        let blobs = &self.blobs;
        let results = run_bounded(victims, self.parallelism, |item| async move {
            blobs.delete(&item.key.object_name()).await
        })
        .await;

        let mut state = self.state.lock();
        for (item, result) in results {
            match result {
                Ok(existed) => {
                    state.total_size = state.total_size.saturating_sub(item.size);
                    report.removed += 1;
                    report.freed_bytes += item.size;
                    debug!(key = %item.key, size = item.size, existed, "Evicted artifact");
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(key = %item.key, error = %e, "Failed to evict artifact, keeping it queued");
                    state.restore(item);
                }
            }
        }

        info!(
            removed = report.removed,
            failed = report.failed,
            freed_bytes = report.freed_bytes,
            total_size = state.total_size,
            "Pruned in-memory index"
        );
        Ok(report)
    }
}

#[async_trait]
impl CacheIndex for PriorityIndex {
    async fn notify_added(&self, key: CacheKey, modified: DateTime<Utc>, size: u64) -> Result<()> {
        self.state.lock().record(IndexItem::new(key, modified, size));

        if self.warm_up().await? {
            self.prune().await?;
        } else {
            debug!(key = %key, "Index warming up, deferring prune");
        }
        Ok(())
    }
}

#[async_trait]
impl Reconcile for PriorityIndex {
    async fn indexed_keys(&self) -> Result<HashSet<CacheKey>> {
        Ok(self.state.lock().live.keys().copied().collect())
    }

    async fn remove_entry(&self, key: &CacheKey) -> Result<()> {
        self.state.lock().forget(key);
        Ok(())
    }

    async fn add_entry(&self, item: IndexItem) -> Result<()> {
        self.state.lock().record(item);
        Ok(())
    }
}

#[async_trait]
impl RebuildableCacheIndex for PriorityIndex {
    async fn rebuild(
        &self,
        cancel: &CancellationToken,
        progress: ProgressCallback<'_>,
    ) -> Result<RebuildProgress> {
        let rebuilder = Rebuilder::new(Arc::clone(&self.blobs), self.page_size, self.parallelism);
        let outcome = rebuilder.run(self, cancel, progress).await?;
        self.warm.store(WARM, Ordering::Release);
        self.prune().await?;
        Ok(outcome)
    }
}
