//! Background trim/rebuild worker
//!
//! Decouples notification volume from prune frequency. Callers `poll()` on
//! every notification; every Nth poll queues a prune request, and requests
//! beyond the queue cap are dropped. A timer drains one request per tick.
//!
//! ```text
//! notify ─► poll() ─► [Prune, Prune, Rebuild, …] ─► tick ─► task(kind)
//!            every Nth    capped queue              one at a time
//! ```
//!
//! A run never overlaps another run. A failed request goes back to the front
//! of the queue. After `stop()` returns no new run begins; a run already in
//! progress finishes normally.

use artcache_core::Result;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::IndexConfig;

/// Shortest timer period; `interval` rejects a zero period
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Kind of queued work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkKind {
    /// Delete oldest artifacts until the index limit holds
    Prune,
    /// Reconcile the index with the backing store
    Rebuild,
}

/// Queued work request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkItem {
    /// What to do
    pub kind: WorkKind,
    /// When it was requested
    pub requested_at: DateTime<Utc>,
}

/// Work callback run by the worker
pub type WorkTask = Arc<dyn Fn(WorkKind) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Configuration for the background worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Timer period
    pub interval: Duration,
    /// Queue a prune on every Nth poll
    pub queue_task_every: u64,
    /// Maximum queued requests
    pub max_queued: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from(&IndexConfig::default())
    }
}

impl From<&IndexConfig> for WorkerConfig {
    fn from(config: &IndexConfig) -> Self {
        Self {
            interval: config.prune_interval(),
            queue_task_every: config.prune_every.max(1),
            max_queued: config.max_queued_work,
        }
    }
}

#[derive(Default)]
struct Gate {
    stopped: bool,
    token: Option<CancellationToken>,
    timer: Option<JoinHandle<()>>,
}

struct Shared {
    config: WorkerConfig,
    queue: Mutex<VecDeque<WorkItem>>,
    polls: AtomicU64,
    in_progress: AtomicBool,
    gate: Mutex<Gate>,
    task: Mutex<Option<WorkTask>>,
}

/// Timer-driven worker with a capped request queue
pub struct IndexWorker {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for IndexWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexWorker")
            .field("config", &self.shared.config)
            .field("queued", &self.queued())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl IndexWorker {
    /// Create a stopped worker
    #[must_use]
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                queue: Mutex::new(VecDeque::new()),
                polls: AtomicU64::new(0),
                in_progress: AtomicBool::new(false),
                gate: Mutex::new(Gate::default()),
                task: Mutex::new(None),
            }),
        }
    }

    /// Count a notification; every Nth call queues a prune
    ///
    /// Returns whether a request was queued.
    pub fn poll(&self) -> bool {
        let every = self.shared.config.queue_task_every.max(1);
        let n = self.shared.polls.fetch_add(1, Ordering::Relaxed) + 1;
        if n % every != 0 {
            return false;
        }
        self.shared.enqueue(WorkKind::Prune)
    }

    /// Queue a full rebuild
    pub fn request_rebuild(&self) -> bool {
        self.shared.enqueue(WorkKind::Rebuild)
    }

    /// Number of queued requests
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Whether the timer is active
    pub fn is_running(&self) -> bool {
        self.shared.gate.lock().token.is_some()
    }

    /// Whether a run is in progress
    pub fn is_busy(&self) -> bool {
        self.shared.in_progress.load(Ordering::Acquire)
    }

    /// Start the timer with `task`; no-op if already running
    ///
    /// Must be called within a tokio runtime. Returns whether the timer was
    /// started by this call.
    pub fn start(&self, task: WorkTask) -> bool {
        let mut gate = self.shared.gate.lock();
        if gate.token.is_some() {
            return false;
        }

        *self.shared.task.lock() = Some(task);
        gate.stopped = false;
        let token = CancellationToken::new();
        let shared = Arc::clone(&self.shared);
        let period = self.shared.config.interval.max(MIN_INTERVAL);
        let loop_token = token.clone();

        gate.timer = Some(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;
                    () = loop_token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                shared.run_once().await;
            }
            debug!("Index worker timer stopped");
        }));
        gate.token = Some(token);
        info!(interval_ms = period.as_millis(), "Index worker started");
        true
    }

    /// Stop the timer; no-op if not running
    ///
    /// A run in progress is allowed to finish. Returns whether the timer was
    /// stopped by this call.
    pub fn stop(&self) -> bool {
        let mut gate = self.shared.gate.lock();
        gate.stopped = true;
        let Some(token) = gate.token.take() else {
            return false;
        };
        token.cancel();
        drop(gate.timer.take());
        info!("Index worker stopped");
        true
    }

    /// Run the oldest queued request now
    ///
    /// Returns `false` without doing anything if the worker is stopped, no
    /// task is installed, another run is in progress or the queue is empty.
    pub async fn run_once(&self) -> bool {
        self.shared.run_once().await
    }
}

impl Drop for IndexWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn enqueue(&self, kind: WorkKind) -> bool {
        let mut queue = self.queue.lock();
        if queue.len() >= self.config.max_queued {
            debug!(?kind, queued = queue.len(), "Worker queue full, dropping request");
            return false;
        }
        queue.push_back(WorkItem {
            kind,
            requested_at: Utc::now(),
        });
        true
    }

    async fn run_once(&self) -> bool {
        let (item, task) = {
            let gate = self.gate.lock();
            if gate.stopped {
                return false;
            }
            let Some(task) = self.task.lock().clone() else {
                return false;
            };
            if self.in_progress.swap(true, Ordering::AcqRel) {
                return false;
            }
            let Some(item) = self.queue.lock().pop_front() else {
                self.in_progress.store(false, Ordering::Release);
                return false;
            };
            (item, task)
        };

        debug!(kind = ?item.kind, requested_at = %item.requested_at, "Running index work");
        if let Err(e) = task(item.kind).await {
            warn!(kind = ?item.kind, error = %e, "Index work failed, re-queueing");
            self.queue.lock().push_front(item);
        }
        self.in_progress.store(false, Ordering::Release);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use artcache_core::Error;
    use futures::FutureExt;
    use std::sync::atomic::AtomicUsize;

    fn config(every: u64, max_queued: usize) -> WorkerConfig {
        WorkerConfig {
            interval: Duration::from_millis(100),
            queue_task_every: every,
            max_queued,
        }
    }

    fn counting_task(counter: Arc<AtomicUsize>) -> WorkTask {
        Arc::new(move |_kind: WorkKind| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            .boxed()
        })
    }

    #[test]
    fn poll_queues_every_nth_call() {
        let worker = IndexWorker::new(config(3, 100));
        let queued: Vec<bool> = (0..6).map(|_| worker.poll()).collect();
        assert_eq!(queued, vec![false, false, true, false, false, true]);
        assert_eq!(worker.queued(), 2);
    }

    #[test]
    fn queue_is_capped() {
        let worker = IndexWorker::new(config(1, 2));
        assert!(worker.poll());
        assert!(worker.poll());
        assert!(!worker.poll());
        assert!(!worker.request_rebuild());
        assert_eq!(worker.queued(), 2);
    }

    #[tokio::test]
    async fn run_once_needs_task_and_work() {
        let worker = IndexWorker::new(config(1, 10));
        worker.poll();
        // No task installed yet
        assert!(!worker.run_once().await);

        let runs = Arc::new(AtomicUsize::new(0));
        worker.start(counting_task(Arc::clone(&runs)));
        assert!(worker.run_once().await);
        assert!(!worker.run_once().await);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        worker.stop();
    }

    #[tokio::test]
    async fn failed_work_is_requeued() {
        let worker = IndexWorker::new(config(1, 10));
        let attempts = Arc::new(AtomicUsize::new(0));
        let task: WorkTask = {
            let attempts = Arc::clone(&attempts);
            Arc::new(move |_kind: WorkKind| {
                let attempts = Arc::clone(&attempts);
                async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(Error::backend_message("prune", "store unavailable"))
                    } else {
                        Ok(())
                    }
                }
                .boxed()
            })
        };
        worker.start(task);
        worker.request_rebuild();

        assert!(worker.run_once().await);
        assert_eq!(worker.queued(), 1);
        assert!(worker.run_once().await);
        assert_eq!(worker.queued(), 0);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        worker.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn timer_drains_queue() {
        let worker = IndexWorker::new(config(1, 10));
        let runs = Arc::new(AtomicUsize::new(0));
        assert!(worker.start(counting_task(Arc::clone(&runs))));
        assert!(!worker.start(counting_task(Arc::clone(&runs))));

        worker.poll();
        worker.poll();
        tokio::time::sleep(Duration::from_millis(350)).await;

        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(worker.queued(), 0);
        assert!(worker.stop());
        assert!(!worker.stop());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_interval_still_drains() {
        let worker = IndexWorker::new(WorkerConfig {
            interval: Duration::ZERO,
            ..config(1, 10)
        });
        let runs = Arc::new(AtomicUsize::new(0));
        assert!(worker.start(counting_task(Arc::clone(&runs))));

        worker.poll();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(worker.is_running());
        assert!(worker.stop());
    }

    #[tokio::test(start_paused = true)]
    async fn no_new_runs_after_stop() {
        let worker = IndexWorker::new(config(1, 10));
        let runs = Arc::new(AtomicUsize::new(0));
        worker.start(counting_task(Arc::clone(&runs)));
        worker.stop();

        worker.poll();
        assert!(!worker.run_once().await);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(worker.queued(), 1);

        // Restart picks the queued request up again
        assert!(worker.start(counting_task(Arc::clone(&runs))));
        assert!(worker.run_once().await);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn runs_never_overlap() {
        let worker = Arc::new(IndexWorker::new(config(1, 10)));
        let release = Arc::new(tokio::sync::Notify::new());
        let task: WorkTask = {
            let release = Arc::clone(&release);
            Arc::new(move |_kind: WorkKind| {
                let release = Arc::clone(&release);
                async move {
                    release.notified().await;
                    Ok(())
                }
                .boxed()
            })
        };
        worker.start(task);
        worker.poll();
        worker.poll();

        let first = {
            let worker = Arc::clone(&worker);
            tokio::spawn(async move { worker.run_once().await })
        };
        tokio::task::yield_now().await;
        assert!(worker.is_busy());
        assert!(!worker.run_once().await);

        release.notify_one();
        assert!(first.await.unwrap());
        assert!(!worker.is_busy());
        assert_eq!(worker.queued(), 1);
        worker.stop();
    }
}
