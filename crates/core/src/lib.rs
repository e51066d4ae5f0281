//! Core types for artcache
//!
//! artcache is a write-through cache for expensive binary artifacts, such as
//! resized images, kept in a remote blob store. This crate holds the
//! store-independent pieces:
//! - Deterministic cache key derivation
//! - Per-key locking with deadlines
//! - The cache result model and the provider contract hosts call
//! - Front cache and index contracts, with null implementations
//! - Rebuild progress reporting and bounded parallel execution
//!
//! The blob-store backed provider and both index strategies live in the
//! `artcache` crate.

#![expect(
    clippy::missing_errors_doc,
    reason = "Errors are described on the Error enum variants"
)]

pub mod deadline;
mod error;
pub mod index;
pub mod key;
pub mod parallel;
pub mod provider;
pub mod result;
pub mod store;
pub mod sync;

pub use deadline::Deadline;
pub use error::{BoxError, Error, Result};
pub use index::{
    CacheIndex, IndexItem, NullCacheIndex, ProgressCallback, RebuildPhase, RebuildProgress,
    RebuildableCacheIndex,
};
pub use key::{CacheKey, KeyGenerator, Sha256KeyGenerator};
pub use provider::{CacheProvider, Producer};
pub use result::{CacheResult, CacheStatus};
pub use store::{CacheStore, NullCacheStore};
pub use sync::{KeyGuard, KeySynchronizer};
