//! Backing object store
//!
//! The backing store is the source of truth for cached artifacts. Objects are
//! addressed by the textual rendering of their [`artcache_core::CacheKey`].
//!
//! ## Implementations
//!
//! - [`MemoryBlobStore`]: in-process map, used for tests and embedding
//! - [`FsBlobStore`]: directory tree with atomic writes

mod fs;
mod memory;

pub use fs::FsBlobStore;
pub use memory::MemoryBlobStore;

use artcache_core::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

/// Metadata of one listed object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobInfo {
    /// Object name
    pub name: String,
    /// Last modification time, if the store reports one
    pub last_modified: Option<DateTime<Utc>>,
    /// Content length, if the store reports one
    pub size: Option<u64>,
}

/// One page of an object listing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlobPage {
    /// Objects on this page
    pub items: Vec<BlobInfo>,
    /// Token for the next page; `None` on the last page
    pub continuation: Option<String>,
}

/// Remote object store holding artifact bytes
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Create or overwrite object `name`
    async fn put(&self, name: &str, content: Bytes) -> Result<()>;

    /// Read object `name`
    ///
    /// Returns [`artcache_core::Error::NotFound`] if it does not exist.
    async fn get(&self, name: &str) -> Result<Bytes>;

    /// Delete object `name`, returning whether it existed
    async fn delete(&self, name: &str) -> Result<bool>;

    /// List up to `page_size` objects starting after `continuation`
    async fn list_page(&self, continuation: Option<&str>, page_size: usize) -> Result<BlobPage>;
}

/// Collect a full listing of `store`
pub async fn list_all(store: &dyn BlobStore, page_size: usize) -> Result<Vec<BlobInfo>> {
    let mut all = Vec::new();
    let mut continuation: Option<String> = None;
    loop {
        let page = store.list_page(continuation.as_deref(), page_size).await?;
        all.extend(page.items);
        match page.continuation {
            Some(next) => continuation = Some(next),
            None => return Ok(all),
        }
    }
}
