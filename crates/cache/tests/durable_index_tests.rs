//! Integration tests for the persisted eviction index.
//!
//! These tests verify the behavioral contracts of [`DurableIndex`]:
//! - Pruning by item count and by summed size, oldest first
//! - Rows survive when their blob could not be deleted
//! - Rebuilds converge on the backing store and are idempotent
//! - Notifications feed the background worker every Nth call

use artcache::index::{SaveOutcome, WorkerConfig};
use artcache::{
    BlobStore, DurableIndex, IndexLimit, IndexStore, MemoryBlobStore, MemoryIndexStore,
};
use artcache_core::{
    CacheIndex, CacheKey, Error, RebuildPhase, RebuildProgress, RebuildableCacheIndex,
};
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn key(n: u8) -> CacheKey {
    CacheKey::from_bytes([n; 16])
}

fn at(minutes: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap() + Duration::minutes(minutes)
}

struct Fixture {
    blobs: Arc<MemoryBlobStore>,
    rows: Arc<MemoryIndexStore>,
    index: Arc<DurableIndex>,
}

impl Fixture {
    fn new(limit: IndexLimit) -> Self {
        Self::with(limit, |index| index)
    }

    fn with(limit: IndexLimit, configure: impl FnOnce(DurableIndex) -> DurableIndex) -> Self {
        let blobs = Arc::new(MemoryBlobStore::new());
        let rows = Arc::new(MemoryIndexStore::new());
        let index = configure(DurableIndex::new(rows.clone(), blobs.clone(), limit));
        Self {
            blobs,
            rows,
            index: Arc::new(index),
        }
    }

    /// Write key `n` to the store and notify the index
    async fn store(&self, n: u8, minutes: i64, size: u64) {
        let content = vec![n; usize::try_from(size).unwrap()];
        self.blobs
            .insert_with_modified(key(n).object_name(), content, at(minutes));
        self.index
            .notify_added(key(n), at(minutes), size)
            .await
            .unwrap();
    }

    fn stored(&self, n: u8) -> bool {
        self.blobs.contains(&key(n).object_name())
    }
}

fn ignore(_: &RebuildProgress) {}

// =============================================================================
// Pruning
// =============================================================================

#[tokio::test]
async fn prune_by_count_removes_oldest() {
    let fx = Fixture::new(IndexLimit::MaxItems(2));
    for (n, minutes) in [(1, 40), (2, 10), (3, 30), (4, 20)] {
        fx.store(n, minutes, 10).await;
    }
    // Notifications alone never prune
    assert_eq!(fx.index.count().await.unwrap(), 4);

    let report = fx.index.prune().await.unwrap();
    assert_eq!(report.removed, 2);
    assert_eq!(report.freed_bytes, 20);
    assert!(!fx.stored(2));
    assert!(!fx.stored(4));
    assert!(fx.stored(1));
    assert!(fx.stored(3));
    assert_eq!(fx.index.count().await.unwrap(), 2);
}

#[tokio::test]
async fn prune_by_size_stops_at_limit() {
    let fx = Fixture::new(IndexLimit::MaxBytes(1_000));
    for n in 1..=5 {
        fx.store(n, i64::from(n), 300).await;
    }

    let report = fx.index.prune().await.unwrap();
    assert_eq!(report.removed, 2);
    assert_eq!(fx.index.total_size().await.unwrap(), 900);
    assert!(!fx.stored(1) && !fx.stored(2));
    assert!(fx.stored(3) && fx.stored(4) && fx.stored(5));
}

#[tokio::test]
async fn small_batches_loop_until_done() {
    let fx = Fixture::with(IndexLimit::MaxItems(1), |index| index.with_batch_size(2));
    for n in 1..=7 {
        fx.store(n, i64::from(n), 1).await;
    }

    let report = fx.index.prune().await.unwrap();
    assert_eq!(report.removed, 6);
    assert_eq!(fx.index.count().await.unwrap(), 1);
    assert!(fx.stored(7));
}

#[tokio::test]
async fn failed_deletion_keeps_row() {
    let fx = Fixture::new(IndexLimit::MaxItems(1));
    fx.store(1, 0, 10).await;
    fx.store(2, 1, 10).await;
    fx.blobs.fail_deletes_of(key(1).object_name());

    let report = fx.index.prune().await.unwrap();
    assert_eq!(report.removed, 0);
    assert_eq!(report.failed, 1);
    assert!(fx.rows.find(&key(1)).await.unwrap().is_some());

    fx.blobs.clear_faults();
    let report = fx.index.prune().await.unwrap();
    assert_eq!(report.removed, 1);
    assert!(fx.rows.find(&key(1)).await.unwrap().is_none());
}

#[tokio::test]
async fn prune_under_limit_is_noop() {
    let fx = Fixture::new(IndexLimit::MaxItems(10));
    fx.store(1, 0, 10).await;
    let report = fx.index.prune().await.unwrap();
    assert_eq!(report.examined, 0);
    assert!(fx.stored(1));
}

// =============================================================================
// Upserts
// =============================================================================

#[tokio::test]
async fn upsert_rewrites_only_on_size_change() {
    let fx = Fixture::new(IndexLimit::MaxItems(10));
    fx.store(1, 0, 10).await;
    let first = fx.rows.find(&key(1)).await.unwrap().unwrap();

    let same = fx
        .index
        .upsert(artcache_core::IndexItem::new(key(1), at(5), 10))
        .await
        .unwrap();
    assert_eq!(same, SaveOutcome::Kept(first));

    let resized = fx
        .index
        .upsert(artcache_core::IndexItem::new(key(1), at(5), 25))
        .await
        .unwrap();
    assert!(matches!(resized, SaveOutcome::Saved(row) if row.size == 25 && row.version == 2));
    assert_eq!(fx.index.total_size().await.unwrap(), 25);
}

// =============================================================================
// Rebuild
// =============================================================================

#[tokio::test]
async fn rebuild_converges_on_store() {
    let fx = Fixture::new(IndexLimit::MaxItems(100));
    fx.store(1, 0, 5).await;
    fx.store(2, 1, 5).await;
    fx.blobs.delete(&key(1).object_name()).await.unwrap();
    fx.blobs
        .insert_with_modified(key(3).object_name(), vec![0u8; 9], at(2));
    fx.blobs
        .insert_with_modified(".DS_Store", vec![0u8; 3], at(2));

    let first = fx
        .index
        .rebuild(&CancellationToken::new(), &ignore)
        .await
        .unwrap();
    assert_eq!(first.phase, RebuildPhase::Completed);
    assert_eq!(first.discovered_blobs, 2);
    assert_eq!(first.removed, 1);
    assert_eq!(first.added, 1);
    assert_eq!(first.errors, 0);

    let mut keys = fx.rows.keys().await.unwrap();
    keys.sort();
    assert_eq!(keys, vec![key(2), key(3)]);

    let second = fx
        .index
        .rebuild(&CancellationToken::new(), &ignore)
        .await
        .unwrap();
    assert_eq!((second.added, second.removed), (0, 0));
    assert_eq!(fx.index.total_size().await.unwrap(), 14);
}

#[tokio::test]
async fn rebuild_prunes_afterwards() {
    let fx = Fixture::new(IndexLimit::MaxItems(2));
    for n in 1..=4 {
        fx.blobs
            .insert_with_modified(key(n).object_name(), vec![0u8; 1], at(i64::from(n)));
    }

    fx.index
        .rebuild(&CancellationToken::new(), &ignore)
        .await
        .unwrap();
    assert_eq!(fx.index.count().await.unwrap(), 2);
    assert!(fx.stored(3) && fx.stored(4));
}

#[tokio::test]
async fn cancelled_rebuild_carries_progress() {
    let fx = Fixture::new(IndexLimit::MaxItems(100));
    for n in 1..=3 {
        fx.blobs
            .insert_with_modified(key(n).object_name(), vec![0u8; 1], at(0));
    }

    let cancel = CancellationToken::new();
    let seen = parking_lot::Mutex::new(Vec::new());
    // Cancel as soon as discovery reports its first page
    let on_progress = |progress: &RebuildProgress| {
        seen.lock().push(progress.phase);
        if progress.discovered_blobs > 0 {
            cancel.cancel();
        }
    };

    let err = fx.index.rebuild(&cancel, &on_progress).await.unwrap_err();
    let Error::RebuildCancelled { progress } = err else {
        panic!("expected a cancelled rebuild");
    };
    assert_eq!(progress.phase, RebuildPhase::Cancelled);
    assert_eq!(progress.discovered_blobs, 3);
    assert_eq!(progress.added, 0);
    assert_eq!(seen.lock().last(), Some(&RebuildPhase::Cancelled));
    assert_eq!(fx.index.count().await.unwrap(), 0);
}

// =============================================================================
// Background worker
// =============================================================================

#[tokio::test]
async fn every_nth_notification_queues_prune() {
    let fx = Fixture::with(IndexLimit::MaxItems(100), |index| {
        index.with_worker_config(WorkerConfig {
            interval: std::time::Duration::from_secs(60),
            queue_task_every: 3,
            max_queued: 10,
        })
    });
    for n in 1..=7 {
        fx.store(n, i64::from(n), 1).await;
    }
    assert_eq!(fx.index.worker().queued(), 2);
}

#[tokio::test(start_paused = true)]
async fn worker_prunes_in_background() {
    let fx = Fixture::with(IndexLimit::MaxItems(1), |index| {
        index.with_worker_config(WorkerConfig {
            interval: std::time::Duration::from_millis(100),
            queue_task_every: 1,
            max_queued: 10,
        })
    });
    assert!(fx.index.start_worker());
    assert!(!fx.index.start_worker());

    fx.store(1, 0, 1).await;
    fx.store(2, 1, 1).await;
    tokio::time::sleep(std::time::Duration::from_millis(350)).await;

    assert_eq!(fx.index.count().await.unwrap(), 1);
    assert!(!fx.stored(1));
    assert_eq!(fx.index.worker().queued(), 0);
    assert!(fx.index.stop_worker());
}

#[tokio::test]
async fn queued_rebuild_runs_through_worker() {
    let fx = Fixture::new(IndexLimit::MaxItems(100));
    fx.blobs
        .insert_with_modified(key(1).object_name(), vec![0u8; 4], at(0));
    fx.index.start_worker();

    assert!(fx.index.worker().request_rebuild());
    assert!(fx.index.worker().run_once().await);
    assert_eq!(fx.index.count().await.unwrap(), 1);
    fx.index.stop_worker();
}

// =============================================================================
// SQLite rows
// =============================================================================

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn sqlite_rows_prune_like_memory_rows() {
    use artcache::index::SqliteIndexStore;

    let blobs = Arc::new(MemoryBlobStore::new());
    let rows: Arc<dyn IndexStore> = Arc::new(SqliteIndexStore::in_memory().await.unwrap());
    let index = DurableIndex::new(Arc::clone(&rows), blobs.clone(), IndexLimit::MaxBytes(20));

    for n in 1..=4 {
        blobs.insert_with_modified(key(n).object_name(), vec![0u8; 10], at(i64::from(n)));
        index.notify_added(key(n), at(i64::from(n)), 10).await.unwrap();
    }
    let report = index.prune().await.unwrap();
    assert_eq!(report.removed, 2);
    assert_eq!(rows.total_size().await.unwrap(), 20);
    assert!(blobs.contains(&key(4).object_name()));
}
