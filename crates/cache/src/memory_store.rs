//! In-process front cache backed by moka

use crate::config::MemoryStoreConfig;
use artcache_core::{CacheKey, CacheStore};
use bytes::Bytes;
use moka::sync::Cache;
use std::time::Duration;
use tracing::debug;

/// Bounded, expiring front cache weighted by artifact size
#[derive(Clone)]
pub struct MemoryCacheStore {
    entries: Cache<CacheKey, Bytes>,
}

impl std::fmt::Debug for MemoryCacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCacheStore")
            .field("entries", &self.entries.entry_count())
            .field("weighted_bytes", &self.entries.weighted_size())
            .finish()
    }
}

impl MemoryCacheStore {
    /// Build a front cache from configuration
    ///
    /// With both expiries configured only the absolute one is applied.
    #[must_use]
    pub fn new(config: &MemoryStoreConfig) -> Self {
        let mut builder = Cache::builder()
            .max_capacity(config.max_bytes)
            .weigher(|_key: &CacheKey, value: &Bytes| -> u32 {
                u32::try_from(value.len()).unwrap_or(u32::MAX)
            });

        match (config.absolute_expiry_secs, config.sliding_expiry_secs) {
            (Some(absolute), _) => {
                builder = builder.time_to_live(Duration::from_secs(absolute));
            }
            (None, Some(sliding)) => {
                builder = builder.time_to_idle(Duration::from_secs(sliding));
            }
            (None, None) => {}
        }

        debug!(
            max_bytes = config.max_bytes,
            absolute_expiry_secs = ?config.absolute_expiry_secs,
            sliding_expiry_secs = ?config.sliding_expiry_secs,
            "Created memory front cache"
        );
        Self {
            entries: builder.build(),
        }
    }

    /// Number of cached artifacts
    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.entries.entry_count()
    }

    /// Total bytes of cached artifacts
    #[must_use]
    pub fn weighted_size(&self) -> u64 {
        self.entries.weighted_size()
    }

    /// Apply pending evictions and expirations
    pub fn run_pending_tasks(&self) {
        self.entries.run_pending_tasks();
    }
}

impl CacheStore for MemoryCacheStore {
    fn get(&self, key: &CacheKey) -> Option<Bytes> {
        self.entries.get(key)
    }

    fn insert(&self, key: CacheKey, content: Bytes) {
        self.entries.insert(key, content);
    }
}
