//! Cache provider contract consumed by hosts

use crate::{CacheKey, CacheResult, Deadline, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;

/// Deferred production of an artifact
///
/// The future is not polled until the provider holds the key's lock, so
/// building it is cheap and production happens at most once per call.
pub type Producer<'a> = BoxFuture<'a, Result<Vec<u8>>>;

/// Get/create orchestration over a backing store
#[async_trait]
pub trait CacheProvider: Send + Sync {
    /// Look up `key`
    ///
    /// Returns `Failed` if the key's lock is not acquired before `deadline`
    /// and `Miss` if the backing store does not have the object. Other store
    /// faults are returned as errors.
    async fn get(&self, key: &CacheKey, deadline: &Deadline) -> Result<CacheResult>;

    /// Produce, store and return the artifact for `key`
    ///
    /// Returns `Failed` if the lock is not acquired or the upload does not
    /// finish before `deadline`. Producer errors are returned as errors.
    async fn create(
        &self,
        key: &CacheKey,
        deadline: &Deadline,
        producer: Producer<'_>,
    ) -> Result<CacheResult>;

    /// Look up `key` and produce it under the same lock hold if missing
    ///
    /// Concurrent callers for a cold key run the producer exactly once.
    async fn get_or_create(
        &self,
        key: &CacheKey,
        deadline: &Deadline,
        producer: Producer<'_>,
    ) -> Result<CacheResult>;
}
