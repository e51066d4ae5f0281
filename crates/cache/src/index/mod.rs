//! Eviction indexes
//!
//! An index tracks what the backing store holds and deletes the oldest
//! artifacts once a size or item ceiling is exceeded. The variant is chosen
//! once, at construction:
//!
//! - [`NullCacheIndex`]: no tracking, nothing is ever evicted
//! - [`PriorityIndex`]: in-memory heap, pruned on every notification
//! - [`DurableIndex`]: rows in an [`IndexStore`], pruned by a background worker
//!
//! Both real variants can be reconciled with the backing store through
//! [`RebuildableCacheIndex::rebuild`].

pub mod concurrency;
pub mod durable;
pub mod priority;
pub mod rebuild;
#[cfg(feature = "sqlite")]
pub mod sqlite;
pub mod store;
pub mod worker;

pub use concurrency::{ConflictPolicy, PendingWrite, SaveOutcome};
pub use durable::DurableIndex;
pub use priority::PriorityIndex;
pub use rebuild::{Rebuilder, Reconcile};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteIndexStore;
pub use store::{IndexEntity, IndexStore, MemoryIndexStore};
pub use worker::{IndexWorker, WorkItem, WorkKind, WorkTask, WorkerConfig};

use crate::backend::BlobStore;
use crate::config::{IndexConfig, IndexKind};
use artcache_core::{
    CacheIndex, NullCacheIndex, ProgressCallback, RebuildProgress, RebuildableCacheIndex, Result,
};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Outcome of one prune run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    /// Artifacts selected for eviction
    pub examined: u64,
    /// Artifacts deleted from the backing store
    pub removed: u64,
    /// Artifacts whose deletion failed and stay indexed
    pub failed: u64,
    /// Bytes freed by successful deletions
    pub freed_bytes: u64,
}

/// The index variant selected by configuration
#[derive(Debug, Clone)]
pub enum ConfiguredIndex {
    /// No eviction
    Disabled(Arc<NullCacheIndex>),
    /// In-memory priority index
    Memory(Arc<PriorityIndex>),
    /// Persisted index
    Durable(Arc<DurableIndex>),
}

impl ConfiguredIndex {
    /// The variant as a notification target
    #[must_use]
    pub fn as_index(&self) -> Arc<dyn CacheIndex> {
        match self {
            Self::Disabled(index) => Arc::clone(index) as Arc<dyn CacheIndex>,
            Self::Memory(index) => Arc::clone(index) as Arc<dyn CacheIndex>,
            Self::Durable(index) => Arc::clone(index) as Arc<dyn CacheIndex>,
        }
    }

    /// Whether eviction is enabled
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        !matches!(self, Self::Disabled(_))
    }

    /// Reconcile the index with the backing store
    pub async fn rebuild(
        &self,
        cancel: &CancellationToken,
        progress: ProgressCallback<'_>,
    ) -> Result<RebuildProgress> {
        match self {
            Self::Disabled(index) => index.rebuild(cancel, progress).await,
            Self::Memory(index) => index.rebuild(cancel, progress).await,
            Self::Durable(index) => index.rebuild(cancel, progress).await,
        }
    }

    /// Evict until the limit holds
    pub async fn prune(&self) -> Result<PruneReport> {
        match self {
            Self::Disabled(_) => Ok(PruneReport::default()),
            Self::Memory(index) => index.prune().await,
            Self::Durable(index) => index.prune().await,
        }
    }
}

/// Build the index selected by `config`
///
/// The durable variant keeps its rows in `rows`, or in memory if none is
/// given, and has its background worker started. Must be called within a
/// tokio runtime when the durable variant is selected.
pub fn create_index(
    config: &IndexConfig,
    blobs: Arc<dyn BlobStore>,
    rows: Option<Arc<dyn IndexStore>>,
) -> Result<ConfiguredIndex> {
    config.validate()?;
    let index = match config.kind {
        IndexKind::Disabled => ConfiguredIndex::Disabled(Arc::new(NullCacheIndex)),
        IndexKind::Memory => ConfiguredIndex::Memory(Arc::new(PriorityIndex::from_config(
            blobs, config,
        )?)),
        IndexKind::Durable => {
            let rows = rows.unwrap_or_else(|| Arc::new(MemoryIndexStore::new()));
            let index = Arc::new(DurableIndex::from_config(rows, blobs, config)?);
            index.start_worker();
            ConfiguredIndex::Durable(index)
        }
    };
    info!(kind = ?config.kind, limit = ?config.limit, "Created cache index");
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBlobStore;
    use crate::config::IndexLimit;

    #[tokio::test]
    async fn selects_configured_variant() {
        let blobs: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());

        let disabled = create_index(&IndexConfig::default(), Arc::clone(&blobs), None).unwrap();
        assert!(!disabled.is_enabled());

        let memory = IndexConfig::new(IndexKind::Memory, IndexLimit::MaxItems(3));
        assert!(matches!(
            create_index(&memory, Arc::clone(&blobs), None).unwrap(),
            ConfiguredIndex::Memory(_)
        ));

        let durable = IndexConfig::new(IndexKind::Durable, IndexLimit::megabytes(1));
        let index = create_index(&durable, blobs, None).unwrap();
        let ConfiguredIndex::Durable(durable) = index else {
            panic!("expected durable index");
        };
        assert!(durable.worker().is_running());
        durable.stop_worker();
    }

    #[tokio::test]
    async fn enabled_index_without_limit_is_rejected() {
        let blobs: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        let config = IndexConfig {
            kind: IndexKind::Memory,
            ..IndexConfig::default()
        };
        let err = create_index(&config, blobs, None).unwrap_err();
        assert!(matches!(err, artcache_core::Error::Configuration { .. }));
    }

    #[tokio::test]
    async fn zero_prune_interval_is_rejected() {
        let blobs: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        let config = IndexConfig {
            prune_interval_ms: 0,
            ..IndexConfig::new(IndexKind::Durable, IndexLimit::MaxItems(1))
        };
        let err = create_index(&config, blobs, None).unwrap_err();
        assert!(err.to_string().contains("prune_interval_ms"));
    }
}
