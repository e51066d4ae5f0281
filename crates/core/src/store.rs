//! Front cache contract

use crate::CacheKey;
use bytes::Bytes;

/// In-process cache consulted before the backing store
///
/// Implementations must be cheap and infallible; a front cache that cannot
/// keep an entry simply forgets it.
pub trait CacheStore: Send + Sync {
    /// Cached artifact for `key`, if any
    fn get(&self, key: &CacheKey) -> Option<Bytes>;

    /// Remember the artifact for `key`
    fn insert(&self, key: CacheKey, content: Bytes);
}

/// Front cache that stores nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NullCacheStore;

impl CacheStore for NullCacheStore {
    fn get(&self, _key: &CacheKey) -> Option<Bytes> {
        None
    }

    fn insert(&self, _key: CacheKey, _content: Bytes) {}
}
