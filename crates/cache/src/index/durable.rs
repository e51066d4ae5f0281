//! Persisted eviction index
//!
//! Rows live in an [`IndexStore`], so the accounting survives restarts and
//! can be shared by several cache instances. Notifications upsert a row and
//! poll the [`IndexWorker`]; the worker runs [`DurableIndex::prune`] in the
//! background. Pruning walks the oldest rows in batches and deletes a row only
//! after its blob is gone.

use super::PruneReport;
use super::concurrency::{ConflictPolicy, PendingWrite, SaveOutcome, save};
use super::rebuild::{Rebuilder, Reconcile};
use super::store::{IndexEntity, IndexStore};
use super::worker::{IndexWorker, WorkKind, WorkTask, WorkerConfig};
use crate::backend::BlobStore;
use crate::config::{IndexConfig, IndexLimit};
use artcache_core::parallel::run_bounded;
use artcache_core::{
    CacheIndex, CacheKey, IndexItem, ProgressCallback, RebuildProgress, RebuildableCacheIndex,
    Result,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Eviction index backed by an [`IndexStore`]
pub struct DurableIndex {
    rows: Arc<dyn IndexStore>,
    blobs: Arc<dyn BlobStore>,
    limit: IndexLimit,
    batch_size: usize,
    parallelism: usize,
    page_size: usize,
    conflict_retries: usize,
    worker: IndexWorker,
    prune_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for DurableIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableIndex")
            .field("limit", &self.limit)
            .field("batch_size", &self.batch_size)
            .field("parallelism", &self.parallelism)
            .field("worker", &self.worker)
            .finish_non_exhaustive()
    }
}

impl DurableIndex {
    /// Create an index over `blobs` whose rows live in `rows`
    #[must_use]
    pub fn new(rows: Arc<dyn IndexStore>, blobs: Arc<dyn BlobStore>, limit: IndexLimit) -> Self {
        let defaults = IndexConfig::default();
        Self {
            rows,
            blobs,
            limit,
            batch_size: defaults.prune_batch_size,
            parallelism: defaults.delete_parallelism,
            page_size: defaults.page_size,
            conflict_retries: defaults.conflict_retries,
            worker: IndexWorker::new(WorkerConfig::from(&defaults)),
            prune_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Create an index from configuration
    pub fn from_config(
        rows: Arc<dyn IndexStore>,
        blobs: Arc<dyn BlobStore>,
        config: &IndexConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(rows, blobs, config.required_limit()?)
            .with_batch_size(config.prune_batch_size)
            .with_parallelism(config.delete_parallelism)
            .with_page_size(config.page_size)
            .with_conflict_retries(config.conflict_retries)
            .with_worker_config(WorkerConfig::from(config)))
    }

    /// Set the number of rows examined per prune batch
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Set the number of concurrent blob deletes
    #[must_use]
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Set the listing page size used by rebuilds
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Set the number of re-attempts after a row conflict
    #[must_use]
    pub const fn with_conflict_retries(mut self, retries: usize) -> Self {
        self.conflict_retries = retries;
        self
    }

    /// Replace the background worker configuration
    #[must_use]
    pub fn with_worker_config(mut self, config: WorkerConfig) -> Self {
        self.worker = IndexWorker::new(config);
        self
    }

    /// The background worker
    pub const fn worker(&self) -> &IndexWorker {
        &self.worker
    }

    /// Number of indexed artifacts
    pub async fn count(&self) -> Result<u64> {
        self.rows.count().await
    }

    /// Summed size of indexed artifacts
    pub async fn total_size(&self) -> Result<u64> {
        self.rows.total_size().await
    }

    /// Start pruning in the background
    ///
    /// The worker holds a weak reference and goes idle once the index is
    /// dropped. Returns whether this call started it.
    pub fn start_worker(self: &Arc<Self>) -> bool {
        let weak = Arc::downgrade(self);
        let task: WorkTask = Arc::new(move |kind: WorkKind| {
            let weak = weak.clone();
            async move {
                let Some(index) = weak.upgrade() else {
                    return Ok(());
                };
                match kind {
                    WorkKind::Prune => index.prune().await.map(|_| ()),
                    WorkKind::Rebuild => {
                        let cancel = CancellationToken::new();
                        index.rebuild(&cancel, &|_: &RebuildProgress| {}).await.map(|_| ())
                    }
                }
            }
            .boxed()
        });
        self.worker.start(task)
    }

    /// Stop the background worker
    pub fn stop_worker(&self) -> bool {
        self.worker.stop()
    }

    /// Insert or refresh the row for `item`
    ///
    /// An existing row is rewritten only when the size changed. Conflicts
    /// resolve in favour of the stored row.
    pub async fn upsert(&self, item: IndexItem) -> Result<SaveOutcome> {
        let write = match self.rows.find(&item.key).await? {
            None => PendingWrite::Insert(IndexEntity::from_item(item)),
            Some(row) if row.size == item.size => return Ok(SaveOutcome::Kept(row)),
            Some(row) => PendingWrite::Update(IndexEntity {
                modified: item.modified,
                size: item.size,
                ..row
            }),
        };
        save(
            self.rows.as_ref(),
            write,
            ConflictPolicy::StoreWins,
            self.conflict_retries,
        )
        .await
    }

    /// Delete oldest artifacts until the limit is satisfied
    #[instrument(skip(self), fields(limit = ?self.limit))]
    pub async fn prune(&self) -> Result<PruneReport> {
        let _serial = self.prune_lock.lock().await;
        let mut report = PruneReport::default();

        loop {
            let count = self.rows.count().await?;
            let total = self.rows.total_size().await?;
            if !self.limit.is_exceeded(total, count) {
                break;
            }

            let batch = self.rows.oldest(self.batch_size).await?;
            let victims = select_victims(self.limit, batch, total, count);
            if victims.is_empty() {
                break;
            }
            report.examined += victims.len() as u64;

            let blobs = &self.blobs;
            let results = run_bounded(victims, self.parallelism, |row| async move {
                blobs.delete(&row.key.object_name()).await
            })
            .await;

            let mut removed = 0;
            for (row, result) in results {
                if let Err(e) = result {
                    report.failed += 1;
                    warn!(key = %row.key, error = %e, "Failed to evict artifact, keeping its row");
                    continue;
                }
                match self.rows.delete(&row.key, Some(row.version)).await {
                    Ok(_) => {
                        removed += 1;
                        report.removed += 1;
                        report.freed_bytes += row.size;
                        debug!(key = %row.key, size = row.size, "Evicted artifact");
                    }
                    Err(e) => {
                        report.failed += 1;
                        warn!(key = %row.key, error = %e, "Failed to delete index row");
                    }
                }
            }

            if removed == 0 {
                break;
            }
        }

        if report.examined > 0 {
            info!(
                removed = report.removed,
                failed = report.failed,
                freed_bytes = report.freed_bytes,
                "Pruned durable index"
            );
        }
        Ok(report)
    }
}

/// Oldest prefix of `batch` whose removal brings the totals under `limit`
///
/// If the batch is too small to get there the whole batch is returned.
fn select_victims(
    limit: IndexLimit,
    batch: Vec<IndexEntity>,
    total: u64,
    count: u64,
) -> Vec<IndexEntity> {
    let mut projected_total = total;
    let mut projected_count = count;
    batch
        .into_iter()
        .take_while(|row| {
            if !limit.is_exceeded(projected_total, projected_count) {
                return false;
            }
            projected_total = projected_total.saturating_sub(row.size);
            projected_count = projected_count.saturating_sub(1);
            true
        })
        .collect()
}

#[async_trait]
impl CacheIndex for DurableIndex {
    async fn notify_added(&self, key: CacheKey, modified: DateTime<Utc>, size: u64) -> Result<()> {
        let outcome = self.upsert(IndexItem::new(key, modified, size)).await?;
        debug!(key = %key, size, ?outcome, "Recorded artifact in durable index");
        self.worker.poll();
        Ok(())
    }
}

#[async_trait]
impl Reconcile for DurableIndex {
    async fn indexed_keys(&self) -> Result<HashSet<CacheKey>> {
        Ok(self.rows.keys().await?.into_iter().collect())
    }

    async fn remove_entry(&self, key: &CacheKey) -> Result<()> {
        self.rows.delete(key, None).await.map(|_| ())
    }

    async fn add_entry(&self, item: IndexItem) -> Result<()> {
        self.notify_added(item.key, item.modified, item.size).await
    }
}

#[async_trait]
impl RebuildableCacheIndex for DurableIndex {
    #[instrument(skip_all)]
    async fn rebuild(
        &self,
        cancel: &CancellationToken,
        progress: ProgressCallback<'_>,
    ) -> Result<RebuildProgress> {
        let rebuilder = Rebuilder::new(Arc::clone(&self.blobs), self.page_size, self.parallelism);
        let outcome = rebuilder.run(self, cancel, progress).await?;
        self.prune().await?;
        Ok(outcome)
    }
}
