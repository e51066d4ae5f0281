//! Reconciliation of an index against the backing store
//!
//! The index is an optimization, never the source of truth. After an outage,
//! a manual cleanup or a lost notification it can disagree with the backing
//! store, and only a full listing can re-establish what actually exists.
//!
//! A run moves through `Discovery → Synchronization → Completed`. Cancellation
//! is checked between discovered objects and between synchronized chunks; a
//! cancelled run reports `Cancelled` to the callback and returns
//! [`Error::RebuildCancelled`] with the progress reached so far.

use crate::backend::{BlobInfo, BlobStore};
use artcache_core::parallel::run_bounded;
use artcache_core::{
    CacheKey, Error, IndexItem, ProgressCallback, RebuildPhase, RebuildProgress, Result,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Index operations a rebuild needs
#[async_trait]
pub trait Reconcile: Send + Sync {
    /// Keys currently recorded in the index
    async fn indexed_keys(&self) -> Result<HashSet<CacheKey>>;

    /// Forget `key` without touching the backing store
    async fn remove_entry(&self, key: &CacheKey) -> Result<()>;

    /// Record an object found in the backing store
    async fn add_entry(&self, item: IndexItem) -> Result<()>;
}

/// Parse a listing entry into an index item
///
/// Objects whose names are not cache keys, or that lack a timestamp or size,
/// are not cache artifacts and yield `None`.
#[must_use]
pub fn item_from_blob(blob: &BlobInfo) -> Option<IndexItem> {
    let key = blob.name.parse::<CacheKey>().ok()?;
    Some(IndexItem::new(key, blob.last_modified?, blob.size?))
}

/// Drives discovery and synchronization
#[derive(Clone)]
pub struct Rebuilder {
    blobs: Arc<dyn BlobStore>,
    page_size: usize,
    parallelism: usize,
}

impl std::fmt::Debug for Rebuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rebuilder")
            .field("page_size", &self.page_size)
            .field("parallelism", &self.parallelism)
            .finish_non_exhaustive()
    }
}

impl Rebuilder {
    /// Create a rebuilder listing `blobs` in pages of `page_size`
    #[must_use]
    pub fn new(blobs: Arc<dyn BlobStore>, page_size: usize, parallelism: usize) -> Self {
        Self {
            blobs,
            page_size: page_size.max(1),
            parallelism: parallelism.max(1),
        }
    }

    /// Run a full rebuild of `target`
    pub async fn run(
        &self,
        target: &dyn Reconcile,
        cancel: &CancellationToken,
        progress: ProgressCallback<'_>,
    ) -> Result<RebuildProgress> {
        let indexed = target.indexed_keys().await?;
        let mut state = RebuildProgress {
            phase: RebuildPhase::Discovery,
            items_in_index: indexed.len() as u64,
            ..RebuildProgress::default()
        };
        progress(&state);
        info!(items_in_index = state.items_in_index, "Index rebuild started");

        let discovered = self.discover(&mut state, cancel, progress).await?;

        state.phase = RebuildPhase::Synchronization;
        progress(&state);

        let stale: Vec<CacheKey> = indexed
            .iter()
            .filter(|key| !discovered.contains_key(key))
            .copied()
            .collect();
        let missing: Vec<IndexItem> = discovered
            .values()
            .filter(|item| !indexed.contains(&item.key))
            .copied()
            .collect();
        debug!(stale = stale.len(), missing = missing.len(), "Computed index differences");

        for chunk in stale.chunks(self.parallelism) {
            check_cancelled(&mut state, cancel, progress)?;
            let results = run_bounded(chunk.to_vec(), self.parallelism, |key| async move {
                target.remove_entry(&key).await
            })
            .await;
            for (key, result) in results {
                match result {
                    Ok(()) => state.removed += 1,
                    Err(e) => {
                        state.errors += 1;
                        warn!(key = %key, error = %e, "Failed to remove stale index entry");
                    }
                }
            }
            progress(&state);
        }

        for chunk in missing.chunks(self.parallelism) {
            check_cancelled(&mut state, cancel, progress)?;
            let results = run_bounded(chunk.to_vec(), self.parallelism, |item| async move {
                target.add_entry(item).await
            })
            .await;
            for (item, result) in results {
                match result {
                    Ok(()) => state.added += 1,
                    Err(e) => {
                        state.errors += 1;
                        warn!(key = %item.key, error = %e, "Failed to add discovered index entry");
                    }
                }
            }
            progress(&state);
        }

        state.phase = RebuildPhase::Completed;
        progress(&state);
        info!(
            discovered = state.discovered_blobs,
            added = state.added,
            removed = state.removed,
            errors = state.errors,
            "Index rebuild completed"
        );
        Ok(state)
    }

    async fn discover(
        &self,
        state: &mut RebuildProgress,
        cancel: &CancellationToken,
        progress: ProgressCallback<'_>,
    ) -> Result<HashMap<CacheKey, IndexItem>> {
        let mut discovered = HashMap::new();
        let mut continuation: Option<String> = None;

        loop {
            check_cancelled(state, cancel, progress)?;
            let page = self
                .blobs
                .list_page(continuation.as_deref(), self.page_size)
                .await?;

            for blob in &page.items {
                check_cancelled(state, cancel, progress)?;
                let Some(item) = item_from_blob(blob) else {
                    debug!(name = %blob.name, "Skipping object that is not a cache artifact");
                    continue;
                };
                // Listings may repeat a name across pages
                if discovered.insert(item.key, item).is_none() {
                    state.discovered_blobs += 1;
                }
            }
            progress(state);

            match page.continuation {
                Some(next) => continuation = Some(next),
                None => return Ok(discovered),
            }
        }
    }
}

fn check_cancelled(
    state: &mut RebuildProgress,
    cancel: &CancellationToken,
    progress: ProgressCallback<'_>,
) -> Result<()> {
    if cancel.is_cancelled() {
        state.phase = RebuildPhase::Cancelled;
        progress(state);
        warn!(
            discovered = state.discovered_blobs,
            added = state.added,
            removed = state.removed,
            "Index rebuild cancelled"
        );
        return Err(Error::rebuild_cancelled(*state));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BlobPage, MemoryBlobStore};
    use chrono::Utc;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct SetIndex {
        keys: Mutex<HashSet<CacheKey>>,
        fail_removals: bool,
    }

    #[async_trait]
    impl Reconcile for SetIndex {
        async fn indexed_keys(&self) -> Result<HashSet<CacheKey>> {
            Ok(self.keys.lock().clone())
        }

        async fn remove_entry(&self, key: &CacheKey) -> Result<()> {
            if self.fail_removals {
                return Err(Error::backend_message("remove", "index store down"));
            }
            self.keys.lock().remove(key);
            Ok(())
        }

        async fn add_entry(&self, item: IndexItem) -> Result<()> {
            self.keys.lock().insert(item.key);
            Ok(())
        }
    }

    fn key(n: u8) -> CacheKey {
        CacheKey::from_bytes([n; 16])
    }

    /// Store whose listing repeats the last name of a page on the next one
    struct OverlappingListing {
        names: Vec<String>,
    }

    #[async_trait]
    impl BlobStore for OverlappingListing {
        async fn put(&self, _name: &str, _content: bytes::Bytes) -> Result<()> {
            Ok(())
        }

        async fn get(&self, name: &str) -> Result<bytes::Bytes> {
            Err(Error::not_found(name))
        }

        async fn delete(&self, _name: &str) -> Result<bool> {
            Ok(false)
        }

        async fn list_page(&self, continuation: Option<&str>, _page_size: usize) -> Result<BlobPage> {
            let info = |name: &String| BlobInfo {
                name: name.clone(),
                last_modified: Some(Utc::now()),
                size: Some(1),
            };
            Ok(match continuation {
                None => BlobPage {
                    items: self.names[..2].iter().map(info).collect(),
                    continuation: Some(self.names[1].clone()),
                },
                Some(_) => BlobPage {
                    items: self.names[1..].iter().map(info).collect(),
                    continuation: None,
                },
            })
        }
    }

    #[test]
    fn skips_foreign_objects() {
        let valid = BlobInfo {
            name: key(1).to_string(),
            last_modified: Some(Utc::now()),
            size: Some(3),
        };
        assert!(item_from_blob(&valid).is_some());

        let foreign = BlobInfo {
            name: "thumbs.db".into(),
            ..valid.clone()
        };
        assert!(item_from_blob(&foreign).is_none());

        let no_size = BlobInfo {
            size: None,
            ..valid
        };
        assert!(item_from_blob(&no_size).is_none());
    }

    #[tokio::test]
    async fn partial_failures_are_counted() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let index = SetIndex {
            fail_removals: true,
            ..SetIndex::default()
        };
        index.keys.lock().insert(key(9));

        let rebuilder = Rebuilder::new(blobs, 10, 2);
        let progress = rebuilder
            .run(&index, &CancellationToken::new(), &|_: &RebuildProgress| {})
            .await
            .unwrap();

        assert_eq!(progress.phase, RebuildPhase::Completed);
        assert_eq!(progress.errors, 1);
        assert_eq!(progress.removed, 0);
    }

    #[tokio::test]
    async fn repeated_listing_entries_count_once() {
        let blobs = Arc::new(OverlappingListing {
            names: (1..=3).map(|n| key(n).to_string()).collect(),
        });
        let index = SetIndex::default();

        let progress = Rebuilder::new(blobs, 2, 2)
            .run(&index, &CancellationToken::new(), &|_: &RebuildProgress| {})
            .await
            .unwrap();

        assert_eq!(progress.discovered_blobs, 3);
        assert_eq!(progress.added, 3);
        assert_eq!(index.keys.lock().len(), 3);
    }

    #[tokio::test]
    async fn phases_are_reported_in_order() {
        let blobs = Arc::new(MemoryBlobStore::new());
        blobs.insert_with_modified(key(1).to_string(), vec![0u8; 4], Utc::now());
        let index = SetIndex::default();

        let phases = Mutex::new(Vec::new());
        Rebuilder::new(blobs, 10, 2)
            .run(&index, &CancellationToken::new(), &|p| {
                let mut phases = phases.lock();
                if phases.last() != Some(&p.phase) {
                    phases.push(p.phase);
                }
            })
            .await
            .unwrap();

        assert_eq!(
            phases.into_inner(),
            vec![
                RebuildPhase::Discovery,
                RebuildPhase::Synchronization,
                RebuildPhase::Completed
            ]
        );
    }
}
