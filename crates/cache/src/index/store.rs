//! Durable index rows
//!
//! [`IndexStore`] is the row-level interface of the relational store behind
//! [`super::DurableIndex`]. Every row carries a version token; updates and
//! version-checked deletes fail with [`Error::Conflict`] when the stored
//! version moved on.

use artcache_core::{CacheKey, Error, IndexItem, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One durable index row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntity {
    /// Artifact key
    pub key: CacheKey,
    /// Last modification time
    pub modified: DateTime<Utc>,
    /// Size in bytes
    pub size: u64,
    /// Optimistic concurrency token
    pub version: u64,
}

impl IndexEntity {
    /// New, not yet stored row for `item`
    #[must_use]
    pub const fn from_item(item: IndexItem) -> Self {
        Self {
            key: item.key,
            modified: item.modified,
            size: item.size,
            version: 0,
        }
    }

    /// Accounting view of this row
    #[must_use]
    pub const fn item(&self) -> IndexItem {
        IndexItem::new(self.key, self.modified, self.size)
    }
}

/// Row storage for the durable index
#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Row for `key`, if present
    async fn find(&self, key: &CacheKey) -> Result<Option<IndexEntity>>;

    /// Insert a new row; conflicts if the key already exists
    ///
    /// Returns the stored row with its initial version.
    async fn insert(&self, entity: &IndexEntity) -> Result<IndexEntity>;

    /// Update a row whose stored version equals `entity.version`
    ///
    /// Conflicts if the row is missing or its version moved on. Returns the
    /// stored row with its new version.
    async fn update(&self, entity: &IndexEntity) -> Result<IndexEntity>;

    /// Delete the row for `key`, returning whether it existed
    ///
    /// With `version` set, conflicts if the stored version differs.
    async fn delete(&self, key: &CacheKey, version: Option<u64>) -> Result<bool>;

    /// Number of rows
    async fn count(&self) -> Result<u64>;

    /// Sum of `size` over all rows
    async fn total_size(&self) -> Result<u64>;

    /// Up to `limit` rows ordered by `modified`, then key, ascending
    async fn oldest(&self, limit: usize) -> Result<Vec<IndexEntity>>;

    /// Every key in the index
    async fn keys(&self) -> Result<Vec<CacheKey>>;
}

/// Index rows kept in memory
#[derive(Debug, Default)]
pub struct MemoryIndexStore {
    rows: Mutex<HashMap<CacheKey, IndexEntity>>,
}

impl MemoryIndexStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IndexStore for MemoryIndexStore {
    async fn find(&self, key: &CacheKey) -> Result<Option<IndexEntity>> {
        Ok(self.rows.lock().get(key).copied())
    }

    async fn insert(&self, entity: &IndexEntity) -> Result<IndexEntity> {
        let mut rows = self.rows.lock();
        if rows.contains_key(&entity.key) {
            return Err(Error::conflict(entity.key.to_string(), 1));
        }
        let stored = IndexEntity {
            version: 1,
            ..*entity
        };
        rows.insert(entity.key, stored);
        Ok(stored)
    }

    async fn update(&self, entity: &IndexEntity) -> Result<IndexEntity> {
        let mut rows = self.rows.lock();
        match rows.get_mut(&entity.key) {
            Some(row) if row.version == entity.version => {
                *row = IndexEntity {
                    version: entity.version + 1,
                    ..*entity
                };
                Ok(*row)
            }
            _ => Err(Error::conflict(entity.key.to_string(), 1)),
        }
    }

    async fn delete(&self, key: &CacheKey, version: Option<u64>) -> Result<bool> {
        let mut rows = self.rows.lock();
        match (rows.get(key).map(|row| row.version), version) {
            (None, _) => Ok(false),
            (Some(stored), Some(expected)) if stored != expected => {
                Err(Error::conflict(key.to_string(), 1))
            }
            (Some(_), _) => Ok(rows.remove(key).is_some()),
        }
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.rows.lock().len() as u64)
    }

    async fn total_size(&self) -> Result<u64> {
        Ok(self.rows.lock().values().map(|row| row.size).sum())
    }

    async fn oldest(&self, limit: usize) -> Result<Vec<IndexEntity>> {
        let mut rows: Vec<IndexEntity> = self.rows.lock().values().copied().collect();
        rows.sort_by(|a, b| a.item().cmp(&b.item()));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn keys(&self) -> Result<Vec<CacheKey>> {
        Ok(self.rows.lock().keys().copied().collect())
    }
}
