//! Outcome of a cache lookup or production

use crate::{CacheKey, Error, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Status of a cache operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStatus {
    /// The per-key lock was not acquired before the deadline
    Failed,
    /// The artifact is not cached
    Miss,
    /// The artifact was found or produced
    Hit,
    /// Fetching or producing failed fatally
    Error,
}

/// Cache operation result with optional artifact bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheResult {
    /// Outcome of the operation
    pub status: CacheStatus,
    /// Artifact bytes; present for hits
    pub content: Option<Bytes>,
}

impl CacheResult {
    /// Artifact found or produced
    #[must_use]
    pub const fn hit(content: Bytes) -> Self {
        Self {
            status: CacheStatus::Hit,
            content: Some(content),
        }
    }

    /// Artifact not cached
    #[must_use]
    pub const fn miss() -> Self {
        Self {
            status: CacheStatus::Miss,
            content: None,
        }
    }

    /// Lock not acquired in time
    #[must_use]
    pub const fn failed() -> Self {
        Self {
            status: CacheStatus::Failed,
            content: None,
        }
    }

    /// Fatal fault, kept for diagnostics
    #[must_use]
    pub const fn error() -> Self {
        Self {
            status: CacheStatus::Error,
            content: None,
        }
    }

    /// Collapse an operation outcome into a status-only result
    ///
    /// Lock timeouts become `Failed`, not-found becomes `Miss` and any other
    /// fault becomes `Error`. For hosts that report a status instead of
    /// propagating errors.
    #[must_use]
    pub fn from_result(result: Result<Self>) -> Self {
        match result {
            Ok(result) => result,
            Err(Error::LockTimeout { .. }) => Self::failed(),
            Err(e) if e.is_not_found() => Self::miss(),
            Err(_) => Self::error(),
        }
    }

    /// Whether the result carries the artifact
    #[must_use]
    pub const fn is_hit(&self) -> bool {
        matches!(self.status, CacheStatus::Hit)
    }

    /// Turn a `Failed` result into a timeout error for `key`
    ///
    /// Hosts use this to report lock contention as a timeout-class failure
    /// instead of confusing it with a missing artifact.
    pub fn or_timeout(self, key: &CacheKey) -> Result<Self> {
        match self.status {
            CacheStatus::Failed => Err(Error::lock_timeout(key.to_string())),
            _ => Ok(self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_maps_to_timeout() {
        let key = CacheKey::from_bytes([1; 16]);
        let err = CacheResult::failed().or_timeout(&key).unwrap_err();
        assert!(matches!(err, Error::LockTimeout { .. }));

        let miss = CacheResult::miss().or_timeout(&key).unwrap();
        assert_eq!(miss.status, CacheStatus::Miss);
        assert!(miss.content.is_none());
    }

    #[test]
    fn faults_collapse_to_status() {
        let key = CacheKey::from_bytes([2; 16]);
        let status = |result| CacheResult::from_result(result).status;

        assert_eq!(status(Err(Error::lock_timeout(key.to_string()))), CacheStatus::Failed);
        assert_eq!(status(Err(Error::not_found(key.object_name()))), CacheStatus::Miss);
        assert_eq!(
            status(Err(Error::backend_message("get", "connection reset"))),
            CacheStatus::Error
        );
        assert_eq!(status(Ok(CacheResult::miss())), CacheStatus::Miss);
    }

    #[test]
    fn hit_carries_content() {
        let result = CacheResult::hit(Bytes::from_static(b"png"));
        assert!(result.is_hit());
        assert_eq!(result.content.as_deref(), Some(&b"png"[..]));
    }
}
