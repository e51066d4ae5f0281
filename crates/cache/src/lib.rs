//! Write-through artifact cache over a remote blob store
//!
//! This crate provides the storage side of the artifact cache:
//! - [`BlobCache`], the [`CacheProvider`](artcache_core::CacheProvider)
//!   coordinating front cache, per-key locks and backing store
//! - Backing stores behind the [`BlobStore`] trait
//! - Eviction indexes that keep the backing store under a size or item ceiling
//!
//! # Overview
//!
//! ```text
//! host ─► BlobCache ─► front cache (moka)
//!             │
//!             ├──────► BlobStore (memory, filesystem)
//!             │
//!             └─ notify ─► index (priority or durable) ─► prune / rebuild
//! ```
//!
//! The backing store is always the source of truth. Indexes only decide what
//! to delete and can be rebuilt from a listing at any time.

#![expect(
    clippy::missing_errors_doc,
    reason = "Error documentation to be added incrementally"
)]

pub mod backend;
pub mod config;
pub mod index;
pub mod memory_store;
pub mod notify;
pub mod provider;
pub mod retry;

pub use backend::{BlobInfo, BlobPage, BlobStore, FsBlobStore, MemoryBlobStore, list_all};
pub use config::{
    BlobCacheConfig, IndexConfig, IndexKind, IndexLimit, MemoryStoreConfig, RetryConfig,
};
pub use index::{
    ConfiguredIndex, DurableIndex, IndexStore, MemoryIndexStore, PriorityIndex, PruneReport,
    create_index,
};
pub use memory_store::MemoryCacheStore;
pub use notify::{IndexNotifier, NotifierStats};
pub use provider::BlobCache;
