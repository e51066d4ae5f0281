//! Write-through artifact cache over a [`BlobStore`]
//!
//! Reads check the front cache, then take the key's lock, check again and
//! fetch from the backing store. Writes take the key's lock, run the producer,
//! upload and then populate the front cache. Index bookkeeping happens after
//! the upload through the [`IndexNotifier`] and never fails the caller.
//!
//! A deadline bounds waiting for the lock and the backing-store round trip.
//! Missing it yields [`CacheStatus::Failed`](artcache_core::CacheStatus)
//! rather than an error. Once an upload completed the deadline no longer
//! applies.

use crate::backend::BlobStore;
use crate::config::{BlobCacheConfig, RetryConfig};
use crate::index::{ConfiguredIndex, IndexStore, create_index};
use crate::memory_store::MemoryCacheStore;
use crate::notify::{IndexNotifier, NotifierStats};
use artcache_core::{
    CacheKey, CacheProvider, CacheResult, CacheStore, Deadline, Error, IndexItem, KeyGenerator,
    KeyGuard, KeySynchronizer, NullCacheStore, Producer, Result, Sha256KeyGenerator,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

enum Fetch {
    Found(Bytes),
    Missing,
    Expired,
}

/// Artifact cache backed by a remote object store
pub struct BlobCache {
    blobs: Arc<dyn BlobStore>,
    front: Arc<dyn CacheStore>,
    locks: KeySynchronizer<CacheKey>,
    index: Option<ConfiguredIndex>,
    notifier: Option<IndexNotifier>,
    keys: Arc<dyn KeyGenerator>,
    lock_timeout: Duration,
}

impl std::fmt::Debug for BlobCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobCache")
            .field("index", &self.index)
            .field("notifier", &self.notifier)
            .field("lock_timeout", &self.lock_timeout)
            .field("locks", &self.locks.len())
            .finish_non_exhaustive()
    }
}

impl BlobCache {
    /// Cache over `blobs` with no front cache and no index
    #[must_use]
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            blobs,
            front: Arc::new(NullCacheStore),
            locks: KeySynchronizer::new(),
            index: None,
            notifier: None,
            keys: Arc::new(Sha256KeyGenerator),
            lock_timeout: BlobCacheConfig::default().lock_timeout(),
        }
    }

    /// Assemble the cache described by `config`
    ///
    /// A durable index keeps its rows in `rows`, or in memory if none is
    /// given. Must be called within a tokio runtime when an index is enabled.
    pub fn from_config(
        config: &BlobCacheConfig,
        blobs: Arc<dyn BlobStore>,
        rows: Option<Arc<dyn IndexStore>>,
    ) -> Result<Self> {
        config.validate()?;
        let index = create_index(&config.index, Arc::clone(&blobs), rows)?;

        let mut cache = Self::new(blobs).with_lock_timeout(config.lock_timeout());
        if let Some(memory) = &config.memory_store {
            cache = cache.with_cache_store(Arc::new(MemoryCacheStore::new(memory)));
        }
        Ok(cache.attach_index(index, config.notify_queue_capacity, config.retry.clone()))
    }

    /// Use `front` as the in-process front cache
    #[must_use]
    pub fn with_cache_store(mut self, front: Arc<dyn CacheStore>) -> Self {
        self.front = front;
        self
    }

    /// Notify `index` of every stored artifact
    ///
    /// Must be called within a tokio runtime when the index is enabled.
    #[must_use]
    pub fn with_index(self, index: ConfiguredIndex) -> Self {
        let defaults = BlobCacheConfig::default();
        self.attach_index(index, defaults.notify_queue_capacity, defaults.retry)
    }

    /// Derive path-based keys with `keys`
    #[must_use]
    pub fn with_key_generator(mut self, keys: Arc<dyn KeyGenerator>) -> Self {
        self.keys = keys;
        self
    }

    /// Default time budget used by [`BlobCache::deadline`]
    #[must_use]
    pub const fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    fn attach_index(mut self, index: ConfiguredIndex, capacity: usize, retry: RetryConfig) -> Self {
        self.notifier = index
            .is_enabled()
            .then(|| IndexNotifier::spawn(index.as_index(), capacity, retry));
        self.index = Some(index);
        self
    }

    /// A deadline the configured lock timeout from now
    #[must_use]
    pub fn deadline(&self) -> Deadline {
        Deadline::after(self.lock_timeout)
    }

    /// The attached index, if any
    pub const fn index(&self) -> Option<&ConfiguredIndex> {
        self.index.as_ref()
    }

    /// Key for a source path, extension and modification time
    pub fn key_for(
        &self,
        path: &str,
        extension: Option<&str>,
        modified: Option<DateTime<Utc>>,
    ) -> CacheKey {
        self.keys.generate_for(path, extension, modified)
    }

    /// [`CacheProvider::get`] for a path-derived key
    pub async fn get_path(
        &self,
        path: &str,
        extension: Option<&str>,
        modified: Option<DateTime<Utc>>,
        deadline: &Deadline,
    ) -> Result<CacheResult> {
        let key = self.key_for(path, extension, modified);
        self.get(&key, deadline).await
    }

    /// [`CacheProvider::create`] for a path-derived key
    pub async fn create_path(
        &self,
        path: &str,
        extension: Option<&str>,
        modified: Option<DateTime<Utc>>,
        deadline: &Deadline,
        producer: Producer<'_>,
    ) -> Result<CacheResult> {
        let key = self.key_for(path, extension, modified);
        self.create(&key, deadline, producer).await
    }

    /// Notification counters; zero when no index is attached
    #[must_use]
    pub fn notifier_stats(&self) -> NotifierStats {
        self.notifier
            .as_ref()
            .map(IndexNotifier::stats)
            .unwrap_or_default()
    }

    /// Wait until queued index notifications have been delivered
    pub async fn flush_notifications(&self) {
        if let Some(notifier) = &self.notifier {
            notifier.flush().await;
        }
    }

    async fn lock(
        &self,
        key: &CacheKey,
        deadline: &Deadline,
    ) -> Result<Option<KeyGuard<'_, CacheKey>>> {
        match self.locks.acquire(key, deadline).await {
            Ok(guard) => Ok(Some(guard)),
            Err(Error::LockTimeout { .. }) => {
                debug!(key = %key, "Timed out waiting for key lock");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Front cache re-check and backing-store read; caller holds the lock
    async fn fetch(&self, key: &CacheKey, deadline: &Deadline) -> Result<Fetch> {
        if let Some(content) = self.front.get(key) {
            trace!(key = %key, "Front cache hit after lock");
            return Ok(Fetch::Found(content));
        }

        let name = key.object_name();
        let fetched = tokio::select! {
            biased;
            result = self.blobs.get(&name) => result,
            () = deadline.expired() => {
                warn!(key = %key, "Backing store read did not finish before the deadline");
                return Ok(Fetch::Expired);
            }
        };

        match fetched {
            Ok(content) => {
                debug!(key = %key, size = content.len(), "Fetched artifact from backing store");
                self.front.insert(*key, content.clone());
                Ok(Fetch::Found(content))
            }
            Err(e) if e.is_not_found() => Ok(Fetch::Missing),
            Err(e) => Err(e),
        }
    }

    /// Produce, upload and record an artifact; caller holds the lock
    async fn produce(
        &self,
        key: &CacheKey,
        deadline: &Deadline,
        producer: Producer<'_>,
    ) -> Result<CacheResult> {
        let content = Bytes::from(producer.await?);
        let name = key.object_name();

        let uploaded = tokio::select! {
            biased;
            result = self.blobs.put(&name, content.clone()) => Some(result),
            () = deadline.expired() => None,
        };
        let size = content.len() as u64;
        match uploaded {
            Some(result) => result?,
            None => {
                // The store may already hold the object; keep it counted
                warn!(key = %key, size, "Upload did not finish before the deadline, indexing it anyway");
                self.record(key, size);
                return Ok(CacheResult::failed());
            }
        }

        // Stored; the deadline no longer applies
        self.front.insert(*key, content.clone());
        self.record(key, size);
        debug!(key = %key, size, "Stored artifact");
        Ok(CacheResult::hit(content))
    }

    fn record(&self, key: &CacheKey, size: u64) {
        if let Some(notifier) = &self.notifier {
            notifier.notify(IndexItem::new(*key, Utc::now(), size));
        }
    }
}

#[async_trait]
impl CacheProvider for BlobCache {
    async fn get(&self, key: &CacheKey, deadline: &Deadline) -> Result<CacheResult> {
        if let Some(content) = self.front.get(key) {
            trace!(key = %key, "Front cache hit");
            return Ok(CacheResult::hit(content));
        }

        let Some(_guard) = self.lock(key, deadline).await? else {
            return Ok(CacheResult::failed());
        };
        Ok(match self.fetch(key, deadline).await? {
            Fetch::Found(content) => CacheResult::hit(content),
            Fetch::Missing => CacheResult::miss(),
            Fetch::Expired => CacheResult::failed(),
        })
    }

    async fn create(
        &self,
        key: &CacheKey,
        deadline: &Deadline,
        producer: Producer<'_>,
    ) -> Result<CacheResult> {
        let Some(_guard) = self.lock(key, deadline).await? else {
            return Ok(CacheResult::failed());
        };
        self.produce(key, deadline, producer).await
    }

    async fn get_or_create(
        &self,
        key: &CacheKey,
        deadline: &Deadline,
        producer: Producer<'_>,
    ) -> Result<CacheResult> {
        if let Some(content) = self.front.get(key) {
            trace!(key = %key, "Front cache hit");
            return Ok(CacheResult::hit(content));
        }

        let Some(_guard) = self.lock(key, deadline).await? else {
            return Ok(CacheResult::failed());
        };
        match self.fetch(key, deadline).await? {
            Fetch::Found(content) => Ok(CacheResult::hit(content)),
            Fetch::Expired => Ok(CacheResult::failed()),
            Fetch::Missing => self.produce(key, deadline, producer).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBlobStore;
    use crate::config::MemoryStoreConfig;
    use artcache_core::CacheStatus;
    use futures::FutureExt;

    fn producer(content: &'static [u8]) -> Producer<'static> {
        async move { Ok(content.to_vec()) }.boxed()
    }

    #[tokio::test]
    async fn front_cache_serves_repeat_reads() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let cache = BlobCache::new(blobs.clone()).with_cache_store(Arc::new(
            MemoryCacheStore::new(&MemoryStoreConfig::from_megabytes(1)),
        ));
        let key = CacheKey::from_bytes([1; 16]);

        cache
            .create(&key, &Deadline::never(), producer(b"abc"))
            .await
            .unwrap();
        for _ in 0..3 {
            let result = cache.get(&key, &Deadline::never()).await.unwrap();
            assert_eq!(result.content.as_deref(), Some(&b"abc"[..]));
        }
        assert_eq!(blobs.get_calls(), 0);
    }

    #[tokio::test]
    async fn producer_error_propagates() {
        let cache = BlobCache::new(Arc::new(MemoryBlobStore::new()));
        let key = CacheKey::from_bytes([2; 16]);
        let failing: Producer<'static> = async { Err(Error::producer("encoder crashed")) }.boxed();

        let err = cache
            .create(&key, &Deadline::never(), failing)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Producer { .. }));

        let result = cache.get(&key, &Deadline::never()).await.unwrap();
        assert_eq!(result.status, CacheStatus::Miss);
    }

    #[tokio::test]
    async fn path_keys_match_generator() {
        let cache = BlobCache::new(Arc::new(MemoryBlobStore::new()));
        let modified = Utc::now();
        let created = cache
            .create_path("/img/a", Some(".jpg"), Some(modified), &Deadline::never(), producer(b"x"))
            .await
            .unwrap();
        assert!(created.is_hit());

        let found = cache
            .get_path("/img/a.jpg", None, Some(modified), &Deadline::never())
            .await
            .unwrap();
        assert!(found.is_hit());
        assert_eq!(
            cache.key_for("/img/a", Some(".jpg"), Some(modified)),
            Sha256KeyGenerator.generate_for("/img/a.jpg", None, Some(modified))
        );
    }

    #[tokio::test]
    async fn locks_are_released_after_use() {
        let cache = BlobCache::new(Arc::new(MemoryBlobStore::new()));
        let key = CacheKey::from_bytes([3; 16]);
        cache
            .get_or_create(&key, &Deadline::never(), producer(b"y"))
            .await
            .unwrap();
        cache.get(&key, &Deadline::never()).await.unwrap();
        assert!(cache.locks.is_empty());
    }

    #[tokio::test]
    async fn disabled_index_spawns_no_notifier() {
        let cache = BlobCache::from_config(
            &BlobCacheConfig::default(),
            Arc::new(MemoryBlobStore::new()),
            None,
        )
        .unwrap();
        let key = CacheKey::from_bytes([4; 16]);
        cache
            .create(&key, &cache.deadline(), producer(b"z"))
            .await
            .unwrap();
        assert_eq!(cache.notifier_stats(), NotifierStats::default());
        assert!(!cache.index().is_some_and(ConfiguredIndex::is_enabled));
    }
}
