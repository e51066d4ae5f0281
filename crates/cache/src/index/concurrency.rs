//! Optimistic concurrency resolution for index rows
//!
//! Writes are attempted against the row version the writer last saw. On a
//! conflict the current row is reloaded and the policy decides the outcome:
//! - `StoreWins` keeps the stored row and drops the local change. Routine
//!   notifications use it since losing a redundant size update is harmless.
//! - `ClientWins` adopts the stored version token and writes again.
//!
//! A row that disappeared in the meantime is re-inserted. Every re-attempt
//! consumes one unit of the retry budget; running out surfaces
//! [`Error::Conflict`].

use super::store::{IndexEntity, IndexStore};
use artcache_core::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// How a write conflict is resolved
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Keep the stored row, discard the local change
    #[default]
    StoreWins,
    /// Overwrite the stored row with the local values
    ClientWins,
}

/// Write waiting to be saved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingWrite {
    /// Create a row that is expected to be absent
    Insert(IndexEntity),
    /// Update a row at the version it was read with
    Update(IndexEntity),
}

impl PendingWrite {
    const fn entity(&self) -> IndexEntity {
        match self {
            Self::Insert(entity) | Self::Update(entity) => *entity,
        }
    }
}

/// Result of a successful save
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// The local values were written
    Saved(IndexEntity),
    /// The stored row was kept instead of the local values
    Kept(IndexEntity),
}

impl SaveOutcome {
    /// The row as it now exists in the store
    #[must_use]
    pub const fn entity(&self) -> IndexEntity {
        match self {
            Self::Saved(entity) | Self::Kept(entity) => *entity,
        }
    }
}

/// Save `write`, resolving version conflicts with `policy`
///
/// `retries` is the number of re-attempts after the first conflict.
pub async fn save(
    store: &dyn IndexStore,
    write: PendingWrite,
    policy: ConflictPolicy,
    retries: usize,
) -> Result<SaveOutcome> {
    let key = write.entity().key;
    let mut write = write;
    let mut attempts = 0;

    loop {
        attempts += 1;
        let result = match &write {
            PendingWrite::Insert(entity) => store.insert(entity).await,
            PendingWrite::Update(entity) => store.update(entity).await,
        };
        match result {
            Ok(stored) => return Ok(SaveOutcome::Saved(stored)),
            Err(e) if e.is_conflict() => {}
            Err(e) => return Err(e),
        }

        if attempts > retries {
            warn!(key = %key, attempts, ?policy, "Index row conflict not resolved");
            return Err(Error::conflict(key.to_string(), attempts));
        }

        let local = write.entity();
        write = match (policy, store.find(&key).await?) {
            (ConflictPolicy::StoreWins, Some(current)) => {
                debug!(key = %key, version = current.version, "Kept stored index row");
                return Ok(SaveOutcome::Kept(current));
            }
            (ConflictPolicy::ClientWins, Some(current)) => {
                debug!(key = %key, version = current.version, "Overwriting stored index row");
                PendingWrite::Update(IndexEntity {
                    version: current.version,
                    ..local
                })
            }
            (_, None) => PendingWrite::Insert(local),
        };
    }
}
