//! In-process blob store

use super::{BlobInfo, BlobPage, BlobStore};
use artcache_core::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashSet};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, Clone)]
struct StoredBlob {
    content: Bytes,
    modified: DateTime<Utc>,
}

/// Blob store kept in memory
///
/// Supports injecting faults so callers can exercise failure handling:
/// deletes of selected names and all reads can be made to fail, and writes
/// can be acknowledged late.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<BTreeMap<String, StoredBlob>>,
    failing_deletes: Mutex<HashSet<String>>,
    fail_gets: AtomicBool,
    put_ack_delay: Mutex<Option<Duration>>,
    gets: AtomicUsize,
    puts: AtomicUsize,
}

impl MemoryBlobStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an object with an explicit modification time
    pub fn insert_with_modified(
        &self,
        name: impl Into<String>,
        content: impl Into<Bytes>,
        modified: DateTime<Utc>,
    ) {
        self.blobs.write().insert(
            name.into(),
            StoredBlob {
                content: content.into(),
                modified,
            },
        );
    }

    /// Make every delete of `name` fail with a backend error
    pub fn fail_deletes_of(&self, name: impl Into<String>) {
        self.failing_deletes.lock().insert(name.into());
    }

    /// Make every read fail with a backend error
    pub fn fail_gets(&self, fail: bool) {
        self.fail_gets.store(fail, Ordering::SeqCst);
    }

    /// Commit writes at once but acknowledge them only after `delay`
    pub fn delay_put_acks(&self, delay: Option<Duration>) {
        *self.put_ack_delay.lock() = delay;
    }

    /// Remove all injected faults
    pub fn clear_faults(&self) {
        self.failing_deletes.lock().clear();
        self.fail_gets.store(false, Ordering::SeqCst);
        *self.put_ack_delay.lock() = None;
    }

    /// Whether object `name` exists
    pub fn contains(&self, name: &str) -> bool {
        self.blobs.read().contains_key(name)
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }

    /// Number of `get` calls served so far
    pub fn get_calls(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    /// Number of `put` calls served so far
    pub fn put_calls(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, name: &str, content: Bytes) -> Result<()> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.insert_with_modified(name, content, Utc::now());
        let delay = *self.put_ack_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Bytes> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if self.fail_gets.load(Ordering::SeqCst) {
            return Err(Error::backend_message("get", "injected read failure"));
        }
        self.blobs
            .read()
            .get(name)
            .map(|blob| blob.content.clone())
            .ok_or_else(|| Error::not_found(name))
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        if self.failing_deletes.lock().contains(name) {
            return Err(Error::backend_message("delete", "injected delete failure"));
        }
        Ok(self.blobs.write().remove(name).is_some())
    }

    async fn list_page(&self, continuation: Option<&str>, page_size: usize) -> Result<BlobPage> {
        let blobs = self.blobs.read();
        let lower = continuation.map_or(Bound::Unbounded, Bound::Excluded);
        let mut range = blobs.range::<str, _>((lower, Bound::Unbounded));

        let items: Vec<BlobInfo> = range
            .by_ref()
            .take(page_size.max(1))
            .map(|(name, blob)| BlobInfo {
                name: name.clone(),
                last_modified: Some(blob.modified),
                size: Some(blob.content.len() as u64),
            })
            .collect();
        let continuation = match (range.next(), items.last()) {
            (Some(_), Some(last)) => Some(last.name.clone()),
            _ => None,
        };

        Ok(BlobPage {
            items,
            continuation,
        })
    }
}
