//! Index contracts
//!
//! The index keeps `(key, modified, size)` for every stored artifact and is
//! used only to decide what to evict. It is never the source of truth: a
//! rebuild re-derives it from a full listing of the backing store.

use crate::{CacheKey, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tokio_util::sync::CancellationToken;

/// Accounting record of one stored artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexItem {
    /// Artifact key
    pub key: CacheKey,
    /// Last modification time in the backing store
    pub modified: DateTime<Utc>,
    /// Size in bytes
    pub size: u64,
}

impl IndexItem {
    /// Create an index item
    #[must_use]
    pub const fn new(key: CacheKey, modified: DateTime<Utc>, size: u64) -> Self {
        Self {
            key,
            modified,
            size,
        }
    }
}

/// Oldest first; equal timestamps fall back to key order.
impl Ord for IndexItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.modified
            .cmp(&other.modified)
            .then_with(|| self.key.cmp(&other.key))
            .then_with(|| self.size.cmp(&other.size))
    }
}

impl PartialOrd for IndexItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Phase of a rebuild run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebuildPhase {
    /// Rebuild has not begun
    #[default]
    NotStarted,
    /// Listing the backing store
    Discovery,
    /// Reconciling the index with the listing
    Synchronization,
    /// Finished normally
    Completed,
    /// Stopped by a cancellation request
    Cancelled,
}

/// Counters reported while rebuilding
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebuildProgress {
    /// Current phase
    pub phase: RebuildPhase,
    /// Entries in the index when the rebuild started
    pub items_in_index: u64,
    /// Valid objects found in the backing store
    pub discovered_blobs: u64,
    /// Entries added to the index
    pub added: u64,
    /// Entries removed from the index
    pub removed: u64,
    /// Individual add/remove failures
    pub errors: u64,
}

/// Callback receiving progress snapshots during a rebuild
pub type ProgressCallback<'a> = &'a (dyn Fn(&RebuildProgress) + Send + Sync);

/// Receives notifications about newly stored artifacts
#[async_trait]
pub trait CacheIndex: Send + Sync {
    /// Record that `key` was written with the given timestamp and size
    async fn notify_added(&self, key: CacheKey, modified: DateTime<Utc>, size: u64) -> Result<()>;
}

/// Index that can be resynchronized against the backing store
#[async_trait]
pub trait RebuildableCacheIndex: CacheIndex {
    /// Reconcile the index with a full listing of the backing store
    ///
    /// Returns [`crate::Error::RebuildCancelled`] with the partial progress if
    /// `cancel` fires before the run completes.
    async fn rebuild(
        &self,
        cancel: &CancellationToken,
        progress: ProgressCallback<'_>,
    ) -> Result<RebuildProgress>;
}

/// Index that records nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NullCacheIndex;

#[async_trait]
impl CacheIndex for NullCacheIndex {
    async fn notify_added(
        &self,
        _key: CacheKey,
        _modified: DateTime<Utc>,
        _size: u64,
    ) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl RebuildableCacheIndex for NullCacheIndex {
    async fn rebuild(
        &self,
        _cancel: &CancellationToken,
        progress: ProgressCallback<'_>,
    ) -> Result<RebuildProgress> {
        let done = RebuildProgress {
            phase: RebuildPhase::Completed,
            ..RebuildProgress::default()
        };
        progress(&done);
        Ok(done)
    }
}
