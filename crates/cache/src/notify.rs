//! Hand-off of index notifications to a background task
//!
//! Writers must not wait on index bookkeeping, and a failing index must not
//! fail a successful write. Notifications are pushed onto a bounded queue and
//! delivered by a single task that retries transient failures. A full queue
//! drops the notification, counts it and logs a warning; the next rebuild
//! restores the missing entry.
//!
//! Dropping the notifier closes the queue and the task drains what is left.
//! Notifications that never reach the index because the runtime shuts down
//! first are counted as dropped.

use crate::config::RetryConfig;
use crate::retry::retry_with_backoff;
use artcache_core::{CacheIndex, IndexItem};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

enum Message {
    Added(IndexItem),
    Flush(oneshot::Sender<()>),
}

/// Delivery counters
#[derive(Debug, Default)]
struct Counters {
    queued: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

/// Snapshot of notifier counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotifierStats {
    /// Notifications accepted onto the queue
    pub queued: u64,
    /// Notifications the index accepted
    pub delivered: u64,
    /// Notifications dropped because the queue was full or closed
    pub dropped: u64,
    /// Notifications that failed after every retry
    pub failed: u64,
}

/// Bounded queue feeding an index
pub struct IndexNotifier {
    sender: mpsc::Sender<Message>,
    counters: Arc<Counters>,
    worker: JoinHandle<()>,
}

impl std::fmt::Debug for IndexNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexNotifier")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl IndexNotifier {
    /// Spawn the delivery task on the current tokio runtime
    #[must_use]
    pub fn spawn(index: Arc<dyn CacheIndex>, capacity: usize, retry: RetryConfig) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let counters = Arc::new(Counters::default());
        let inbox = Inbox {
            receiver,
            counters: Arc::clone(&counters),
            in_flight: None,
        };
        let worker = tokio::spawn(deliver(index, inbox, retry));
        Self {
            sender,
            counters,
            worker,
        }
    }

    /// Queue a notification without waiting
    ///
    /// Returns `false` if the notification was dropped.
    pub fn notify(&self, item: IndexItem) -> bool {
        match self.sender.try_send(Message::Added(item)) {
            Ok(()) => {
                self.counters.queued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                let dropped = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                let reason = match e {
                    mpsc::error::TrySendError::Full(_) => "queue full",
                    mpsc::error::TrySendError::Closed(_) => "queue closed",
                };
                warn!(key = %item.key, size = item.size, dropped, reason, "Dropped index notification");
                false
            }
        }
    }

    /// Wait until every notification queued before this call was processed
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.sender.send(Message::Flush(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Close the queue and wait for every queued notification to be handled
    pub async fn shutdown(self) -> NotifierStats {
        let Self {
            sender,
            counters,
            worker,
        } = self;
        drop(sender);
        if let Err(e) = worker.await {
            warn!(error = %e, "Index notifier task ended abnormally");
        }
        snapshot(&counters)
    }

    /// Current counters
    #[must_use]
    pub fn stats(&self) -> NotifierStats {
        snapshot(&self.counters)
    }
}

fn snapshot(counters: &Counters) -> NotifierStats {
    NotifierStats {
        queued: counters.queued.load(Ordering::Relaxed),
        delivered: counters.delivered.load(Ordering::Relaxed),
        dropped: counters.dropped.load(Ordering::Relaxed),
        failed: counters.failed.load(Ordering::Relaxed),
    }
}

/// Receiving end owned by the delivery task
///
/// Anything still queued or in flight when this is dropped is counted as
/// dropped.
struct Inbox {
    receiver: mpsc::Receiver<Message>,
    counters: Arc<Counters>,
    in_flight: Option<IndexItem>,
}

impl Drop for Inbox {
    fn drop(&mut self) {
        self.receiver.close();
        let mut lost = u64::from(self.in_flight.take().is_some());
        while let Ok(message) = self.receiver.try_recv() {
            if matches!(message, Message::Added(_)) {
                lost += 1;
            }
        }
        if lost > 0 {
            let dropped = self.counters.dropped.fetch_add(lost, Ordering::Relaxed) + lost;
            warn!(lost, dropped, "Index notifications abandoned at shutdown");
        }
    }
}

async fn deliver(index: Arc<dyn CacheIndex>, mut inbox: Inbox, retry: RetryConfig) {
    while let Some(message) = inbox.receiver.recv().await {
        match message {
            Message::Added(item) => {
                inbox.in_flight = Some(item);
                let result = retry_with_backoff(&retry, "index notify", || {
                    index.notify_added(item.key, item.modified, item.size)
                })
                .await;
                inbox.in_flight = None;
                let counters = &inbox.counters;
                match result {
                    Ok(()) => {
                        counters.delivered.fetch_add(1, Ordering::Relaxed);
                        debug!(key = %item.key, size = item.size, "Index notified");
                    }
                    Err(e) => {
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                        error!(key = %item.key, error = %e, "Index notification failed");
                    }
                }
            }
            Message::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}
