//! Configuration types for the blob cache
//!
//! These are plain values; loading them from files or the environment is the
//! host's concern.

use artcache_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a [`crate::BlobCache`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlobCacheConfig {
    /// How long a request waits for a key's lock, in milliseconds
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// In-process front cache; disabled when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_store: Option<MemoryStoreConfig>,

    /// Eviction index
    #[serde(default)]
    pub index: IndexConfig,

    /// Capacity of the index notification queue
    #[serde(default = "default_notify_queue_capacity")]
    pub notify_queue_capacity: usize,

    /// Retry policy for index notifications
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for BlobCacheConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: default_lock_timeout_ms(),
            memory_store: None,
            index: IndexConfig::default(),
            notify_queue_capacity: default_notify_queue_capacity(),
            retry: RetryConfig::default(),
        }
    }
}

impl BlobCacheConfig {
    /// Lock acquisition timeout
    #[must_use]
    pub const fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Check the configuration for values that cannot work
    pub fn validate(&self) -> Result<()> {
        if self.lock_timeout_ms == 0 {
            return Err(Error::configuration("lock_timeout_ms must be greater than 0"));
        }
        if self.notify_queue_capacity == 0 {
            return Err(Error::configuration(
                "notify_queue_capacity must be greater than 0",
            ));
        }
        if let Some(memory) = &self.memory_store {
            memory.validate()?;
        }
        self.index.validate()?;
        self.retry.validate()
    }
}

/// Front cache sizing and expiry
///
/// When both expiries are set the absolute one applies and the sliding one is
/// ignored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemoryStoreConfig {
    /// Total bytes of artifacts kept in memory
    pub max_bytes: u64,

    /// Entries expire this many seconds after insertion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub absolute_expiry_secs: Option<u64>,

    /// Entries expire this many seconds after their last access
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sliding_expiry_secs: Option<u64>,
}

impl MemoryStoreConfig {
    /// Front cache limited to `mb` megabytes (10^6 bytes)
    #[must_use]
    pub const fn from_megabytes(mb: u64) -> Self {
        Self {
            max_bytes: mb.saturating_mul(1_000_000),
            absolute_expiry_secs: None,
            sliding_expiry_secs: None,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.max_bytes == 0 {
            return Err(Error::configuration(
                "memory_store.max_bytes must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Which index strategy tracks stored artifacts
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    /// No index; nothing is ever evicted
    #[default]
    Disabled,
    /// In-memory priority queue seeded from the backing store
    Memory,
    /// Rows in a durable index store
    Durable,
}

/// Eviction ceiling; size and item count are mutually exclusive
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IndexLimit {
    /// Keep the summed artifact size at or below this many bytes
    MaxBytes(u64),
    /// Keep at most this many artifacts
    MaxItems(u64),
}

impl IndexLimit {
    /// Size ceiling of `mb` megabytes (10^6 bytes)
    #[must_use]
    pub const fn megabytes(mb: u64) -> Self {
        Self::MaxBytes(mb.saturating_mul(1_000_000))
    }

    /// Whether the given totals are over the ceiling
    #[must_use]
    pub const fn is_exceeded(&self, total_bytes: u64, items: u64) -> bool {
        match *self {
            Self::MaxBytes(max) => total_bytes > max,
            Self::MaxItems(max) => items > max,
        }
    }
}

/// Eviction index configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexConfig {
    /// Index strategy
    #[serde(default)]
    pub kind: IndexKind,

    /// Eviction ceiling; required unless the index is disabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<IndexLimit>,

    /// Rows examined per durable prune batch
    #[serde(default = "default_prune_batch_size")]
    pub prune_batch_size: usize,

    /// Background worker tick interval in milliseconds
    #[serde(default = "default_prune_interval_ms")]
    pub prune_interval_ms: u64,

    /// Queue a prune on every Nth notification
    #[serde(default = "default_prune_every")]
    pub prune_every: u64,

    /// Maximum queued worker requests
    #[serde(default = "default_max_queued_work")]
    pub max_queued_work: usize,

    /// Concurrent backing-store deletes while pruning or rebuilding
    #[serde(default = "default_delete_parallelism")]
    pub delete_parallelism: usize,

    /// Objects requested per listing page
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Extra save attempts after an optimistic concurrency conflict
    #[serde(default = "default_conflict_retries")]
    pub conflict_retries: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            kind: IndexKind::default(),
            limit: None,
            prune_batch_size: default_prune_batch_size(),
            prune_interval_ms: default_prune_interval_ms(),
            prune_every: default_prune_every(),
            max_queued_work: default_max_queued_work(),
            delete_parallelism: default_delete_parallelism(),
            page_size: default_page_size(),
            conflict_retries: default_conflict_retries(),
        }
    }
}

impl IndexConfig {
    /// Index of `kind` bounded by `limit`, other values defaulted
    #[must_use]
    pub fn new(kind: IndexKind, limit: IndexLimit) -> Self {
        Self {
            kind,
            limit: Some(limit),
            ..Self::default()
        }
    }

    /// Background worker tick interval
    #[must_use]
    pub const fn prune_interval(&self) -> Duration {
        Duration::from_millis(self.prune_interval_ms)
    }

    /// The eviction ceiling, required for enabled indexes
    pub fn required_limit(&self) -> Result<IndexLimit> {
        self.limit.ok_or_else(|| {
            Error::configuration(format!("index.limit is required for the {:?} index", self.kind))
        })
    }

    /// Check the index settings; a disabled index accepts anything
    pub fn validate(&self) -> Result<()> {
        if self.kind == IndexKind::Disabled {
            return Ok(());
        }
        self.required_limit()?;
        let positive = [
            ("prune_batch_size", self.prune_batch_size as u64),
            ("prune_interval_ms", self.prune_interval_ms),
            ("prune_every", self.prune_every),
            ("max_queued_work", self.max_queued_work as u64),
            ("delete_parallelism", self.delete_parallelism as u64),
            ("page_size", self.page_size as u64),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(Error::configuration(format!(
                    "index.{name} must be greater than 0"
                )));
            }
        }
        Ok(())
    }
}

/// Retry configuration with exponential backoff
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    /// Initial backoff duration in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff duration in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Backoff multiplier
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryConfig {
    fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::configuration("retry.max_attempts must be at least 1"));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(Error::configuration(
                "retry.backoff_multiplier must be at least 1.0",
            ));
        }
        Ok(())
    }
}

// Default value functions
const fn default_lock_timeout_ms() -> u64 {
    5_000
}

const fn default_notify_queue_capacity() -> usize {
    1_024
}

const fn default_prune_batch_size() -> usize {
    500
}

const fn default_prune_interval_ms() -> u64 {
    241_000
}

const fn default_prune_every() -> u64 {
    1
}

const fn default_max_queued_work() -> usize {
    10_000
}

const fn default_delete_parallelism() -> usize {
    4
}

const fn default_page_size() -> usize {
    1_000
}

const fn default_conflict_retries() -> usize {
    3
}

const fn default_max_attempts() -> usize {
    3
}

const fn default_initial_backoff_ms() -> u64 {
    100
}

const fn default_max_backoff_ms() -> u64 {
    10_000
}

const fn default_backoff_multiplier() -> f64 {
    2.0
}
