//! Cache key derivation
//!
//! A [`CacheKey`] is a 128-bit identifier derived from the logical identity of
//! an artifact: its path, an optional variant extension and, when the source
//! is versioned by time, its modification timestamp. The textual rendering of
//! a key is the object name used in the backing store, so parsing and
//! rendering must stay stable across releases.
//!
//! ```text
//! "photos/cat.jpg" + ".w400" + "638412345678900000"
//!        └──────────── SHA-256 ────────────┘
//!                 first 16 bytes
//!   3f2a6c1e-9b0d-4e55-8c21-77aa0b3d9e10
//! ```

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Length of the rendered key (`8-4-4-4-12` hex with hyphens)
const RENDERED_LEN: usize = 36;

/// Ticks between 0001-01-01T00:00:00Z and the Unix epoch
const UNIX_EPOCH_TICKS: i64 = 621_355_968_000_000_000;

/// Fixed-length identifier of a cached artifact
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey([u8; 16]);

impl CacheKey {
    /// Build a key from raw bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Object name of this key in the backing store
    #[must_use]
    pub fn object_name(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&Uuid::from_bytes(self.0).hyphenated(), f)
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({self})")
    }
}

impl FromStr for CacheKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != RENDERED_LEN {
            return Err(Error::invalid_key(s));
        }
        Uuid::try_parse(s)
            .map(|uuid| Self(uuid.into_bytes()))
            .map_err(|_| Error::invalid_key(s))
    }
}

impl Serialize for CacheKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CacheKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Number of 100ns intervals since 0001-01-01T00:00:00Z
///
/// Timestamps before the Unix epoch are supported; the value saturates
/// instead of overflowing for dates outside chrono's nanosecond range.
#[must_use]
pub fn ticks(timestamp: DateTime<Utc>) -> i64 {
    let since_epoch = timestamp.timestamp_nanos_opt().map_or_else(
        || timestamp.timestamp().saturating_mul(10_000_000),
        |nanos| nanos / 100,
    );
    UNIX_EPOCH_TICKS.saturating_add(since_epoch)
}

/// Derives cache keys from artifact identities
pub trait KeyGenerator: Send + Sync {
    /// Derive a key from an already-concatenated identity string
    fn generate(&self, input: &str) -> CacheKey;

    /// Derive a key from path, optional extension and optional modification time
    ///
    /// The identity is `path + extension`, followed by the decimal tick count
    /// of `modified` when present, so `("a", Some(".jpg"))` and `("a.jpg", None)`
    /// name the same artifact.
    fn generate_for(
        &self,
        path: &str,
        extension: Option<&str>,
        modified: Option<DateTime<Utc>>,
    ) -> CacheKey {
        let mut input = String::with_capacity(path.len() + 32);
        input.push_str(path);
        if let Some(extension) = extension {
            input.push_str(extension);
        }
        if let Some(modified) = modified {
            input.push_str(&ticks(modified).to_string());
        }
        self.generate(&input)
    }
}

/// SHA-256 key generator truncated to 128 bits
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256KeyGenerator;

impl KeyGenerator for Sha256KeyGenerator {
    fn generate(&self, input: &str) -> CacheKey {
        let digest = Sha256::digest(input.as_bytes());
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        CacheKey(bytes)
    }
}
