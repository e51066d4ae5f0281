//! Key-scoped mutual exclusion
//!
//! [`KeySynchronizer`] hands out one binary semaphore per key for as long as
//! somebody is interested in that key, and forgets it once the last holder or
//! waiter is gone. The table itself is guarded by a single coarse lock that
//! is never held across an await point.
//!
//! ## Reclaiming entries
//!
//! Every party that may still use a key's semaphore holds a clone of its
//! `Arc`: waiters, permit holders and guards. An entry is discarded only when
//! the table holds the sole reference and the permit is free, both checked
//! under the table lock. A caller that loses the race against a discard just
//! gets a fresh semaphore on its next `acquire`.

use crate::{Deadline, Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::trace;

/// Table of lazily created per-key locks
#[derive(Debug)]
pub struct KeySynchronizer<K> {
    entries: Mutex<HashMap<K, Arc<Semaphore>>>,
}

impl<K> Default for KeySynchronizer<K> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<K> KeySynchronizer<K>
where
    K: Eq + Hash + Clone + Display,
{
    /// Create an empty synchronizer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Semaphore for `key`, created on first use
    pub fn lock_for(&self, key: &K) -> Arc<Semaphore> {
        let mut entries = self.entries.lock();
        Arc::clone(
            entries
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Semaphore::new(1))),
        )
    }

    /// Wait for exclusive access to `key` until `deadline` fires
    ///
    /// Returns [`Error::LockTimeout`] if the deadline fires first.
    pub async fn acquire(&self, key: &K, deadline: &Deadline) -> Result<KeyGuard<'_, K>> {
        let semaphore = self.lock_for(key);
        let acquired = tokio::select! {
            biased;
            permit = Arc::clone(&semaphore).acquire_owned() => permit.ok(),
            () = deadline.expired() => None,
        };

        match acquired {
            Some(permit) => Ok(KeyGuard {
                owner: self,
                key: key.clone(),
                permit: Some(permit),
                semaphore: Some(semaphore),
            }),
            None => {
                drop(semaphore);
                self.try_discard(key);
                trace!(key = %key, "Lock acquisition timed out");
                Err(Error::lock_timeout(key.to_string()))
            }
        }
    }

    /// Remove the entry for `key` if nobody holds or waits on it
    ///
    /// Returns `true` only for the call that actually removed the entry.
    pub fn try_discard(&self, key: &K) -> bool {
        let mut entries = self.entries.lock();
        let idle = entries
            .get(key)
            .is_some_and(|sem| Arc::strong_count(sem) == 1 && sem.available_permits() == 1);
        if idle {
            entries.remove(key);
        }
        idle
    }

    /// Whether a lock entry currently exists for `key`
    pub fn contains(&self, key: &K) -> bool {
        self.entries.lock().contains_key(key)
    }

    /// Number of live lock entries
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether no lock entries exist
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Exclusive hold on one key
///
/// Dropping the guard releases the lock and discards the key's entry when no
/// other party is interested in it.
#[derive(Debug)]
#[must_use = "the key is unlocked as soon as the guard is dropped"]
pub struct KeyGuard<'a, K>
where
    K: Eq + Hash + Clone + Display,
{
    owner: &'a KeySynchronizer<K>,
    key: K,
    permit: Option<OwnedSemaphorePermit>,
    semaphore: Option<Arc<Semaphore>>,
}

impl<K> KeyGuard<'_, K>
where
    K: Eq + Hash + Clone + Display,
{
    /// Key this guard protects
    pub const fn key(&self) -> &K {
        &self.key
    }

    /// Release the lock explicitly
    pub fn release(self) {
        drop(self);
    }
}

impl<K> Drop for KeyGuard<'_, K>
where
    K: Eq + Hash + Clone + Display,
{
    fn drop(&mut self) {
        drop(self.permit.take());
        drop(self.semaphore.take());
        self.owner.try_discard(&self.key);
    }
}
