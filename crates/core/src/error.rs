//! Error types shared by every artcache crate

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use crate::index::RebuildProgress;
use miette::Diagnostic;
use std::path::Path;
use thiserror::Error;

/// Boxed error produced by a backing-store or index-store client
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error type for cache operations
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// The per-key lock was not acquired before the deadline
    #[error("Timed out waiting for the lock on cache key {key}")]
    #[diagnostic(
        code(artcache::lock_timeout),
        help("Another request is producing this artifact; retry the request")
    )]
    LockTimeout {
        /// Key whose lock could not be acquired
        key: String,
    },

    /// Object does not exist in the backing store
    #[error("Object not found: {name}")]
    #[diagnostic(code(artcache::not_found))]
    NotFound {
        /// Object name that was looked up
        name: String,
    },

    /// Backing-store or index-store fault unrelated to a missing object
    #[error("Store operation '{operation}' failed")]
    #[diagnostic(
        code(artcache::backend),
        help("The store may be temporarily unavailable; the operation can be retried")
    )]
    Backend {
        /// Operation that failed (e.g. "put", "list", "update row")
        operation: String,
        /// Underlying client error
        #[source]
        source: BoxError,
    },

    /// Optimistic concurrency conflict on an index row that survived every retry
    #[error("Concurrency conflict on index row {key} after {attempts} attempts")]
    #[diagnostic(
        code(artcache::conflict),
        help("Another writer keeps updating this row; run a rebuild if it persists")
    )]
    Conflict {
        /// Key of the conflicting row
        key: String,
        /// Number of save attempts made
        attempts: usize,
    },

    /// A rebuild was cancelled before it completed
    #[error("Index rebuild cancelled during {:?}", progress.phase)]
    #[diagnostic(code(artcache::rebuild_cancelled))]
    RebuildCancelled {
        /// Progress reached before cancellation
        progress: Box<RebuildProgress>,
    },

    /// The caller-supplied producer failed to materialize the artifact
    #[error("Artifact production failed: {message}")]
    #[diagnostic(code(artcache::producer))]
    Producer {
        /// Description of the failure
        message: String,
    },

    /// Text that does not parse as a cache key
    #[error("Invalid cache key: {value}")]
    #[diagnostic(
        code(artcache::invalid_key),
        help("Cache keys are rendered as hyphenated 8-4-4-4-12 hex")
    )]
    InvalidKey {
        /// The rejected text
        value: String,
    },

    /// Configuration or validation error
    #[error("Cache configuration error: {message}")]
    #[diagnostic(code(artcache::config))]
    Configuration {
        /// Error message describing the configuration issue
        message: String,
    },

    /// I/O error in a filesystem-backed store
    #[error("I/O {operation} failed{}", path.as_ref().map_or(String::new(), |p| format!(": {}", p.display())))]
    #[diagnostic(
        code(artcache::io),
        help("Check file permissions and ensure the path exists")
    )]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path that caused the error, if available
        path: Option<Box<Path>>,
        /// Operation that failed (e.g., "read", "write", "rename")
        operation: String,
    },
}

impl Error {
    /// Create a lock timeout error
    #[must_use]
    pub fn lock_timeout(key: impl Into<String>) -> Self {
        Self::LockTimeout { key: key.into() }
    }

    /// Create a not found error
    #[must_use]
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound { name: name.into() }
    }

    /// Wrap a store client error
    #[must_use]
    pub fn backend(
        operation: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Backend {
            operation: operation.into(),
            source: Box::new(source),
        }
    }

    /// Create a backend error from a plain message
    #[must_use]
    pub fn backend_message(operation: impl Into<String>, message: impl Into<String>) -> Self {
        let message: String = message.into();
        Self::Backend {
            operation: operation.into(),
            source: message.into(),
        }
    }

    /// Create a concurrency conflict error
    #[must_use]
    pub fn conflict(key: impl Into<String>, attempts: usize) -> Self {
        Self::Conflict {
            key: key.into(),
            attempts,
        }
    }

    /// Create a rebuild cancellation error carrying partial progress
    #[must_use]
    pub fn rebuild_cancelled(progress: RebuildProgress) -> Self {
        Self::RebuildCancelled {
            progress: Box::new(progress),
        }
    }

    /// Create a producer error
    #[must_use]
    pub fn producer(msg: impl Into<String>) -> Self {
        Self::Producer {
            message: msg.into(),
        }
    }

    /// Create an invalid key error
    #[must_use]
    pub fn invalid_key(value: impl Into<String>) -> Self {
        Self::InvalidKey {
            value: value.into(),
        }
    }

    /// Create a configuration error
    #[must_use]
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// Create an I/O error with path context
    #[must_use]
    pub fn io(
        source: std::io::Error,
        path: impl AsRef<Path>,
        operation: impl Into<String>,
    ) -> Self {
        Self::Io {
            source,
            path: Some(path.as_ref().into()),
            operation: operation.into(),
        }
    }

    /// Create an I/O error without path context
    #[must_use]
    pub fn io_no_path(source: std::io::Error, operation: impl Into<String>) -> Self {
        Self::Io {
            source,
            path: None,
            operation: operation.into(),
        }
    }

    /// Whether this is the backing store's "object not found" condition
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether this is an optimistic concurrency conflict
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Whether retrying the same operation may succeed
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Backend { .. } | Self::Io { .. } | Self::LockTimeout { .. }
        )
    }
}

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(Error::not_found("a").is_not_found());
        assert!(!Error::not_found("a").is_transient());
        assert!(Error::backend_message("get", "connection reset").is_transient());
        assert!(Error::conflict("k", 2).is_conflict());
        assert!(!Error::invalid_key("zz").is_transient());
    }

    #[test]
    fn backend_message_keeps_source_text() {
        let err = Error::backend_message("list", "throttled");
        let source = std::error::Error::source(&err).map(ToString::to_string);
        assert_eq!(source.as_deref(), Some("throttled"));
        assert_eq!(err.to_string(), "Store operation 'list' failed");
    }
}
