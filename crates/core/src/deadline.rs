//! Deadlines for lock acquisition and store round trips

use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Point after which a cache operation gives up waiting
///
/// A deadline fires either when its instant passes or when its cancellation
/// token is cancelled, whichever comes first. A deadline without an instant
/// only fires on cancellation.
#[derive(Debug, Clone, Default)]
pub struct Deadline {
    at: Option<Instant>,
    token: CancellationToken,
}

impl Deadline {
    /// Deadline `timeout` from now
    #[must_use]
    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Some(Instant::now() + timeout),
            token: CancellationToken::new(),
        }
    }

    /// Deadline that only fires on cancellation
    #[must_use]
    pub fn never() -> Self {
        Self::default()
    }

    /// Attach a cancellation token
    #[must_use]
    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    /// Instant the deadline fires at, if bounded
    #[must_use]
    pub const fn instant(&self) -> Option<Instant> {
        self.at
    }

    /// Whether the deadline has already fired
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.token.is_cancelled() || self.at.is_some_and(|at| Instant::now() >= at)
    }

    /// Resolves once the deadline fires
    pub async fn expired(&self) {
        match self.at {
            Some(at) => {
                tokio::select! {
                    () = tokio::time::sleep_until(at) => {}
                    () = self.token.cancelled() => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }
}
