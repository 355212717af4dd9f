//! Bounded-concurrency dispatcher for firings.
//!
//! Timers and the command interface enqueue [`Firing`]s without blocking; a
//! dispatcher task starts them on worker tasks, at most `max_concurrent` at a
//! time. Manual executions take priority over scheduled ones; within a lane
//! the queue is FIFO.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::types::{ExecutionResult, Job, PoolError};

/// One unit of admitted work: a single firing of a job.
#[derive(Debug)]
pub struct Firing {
    pub job: Job,
    pub manual: bool,
    pub enqueued_at: DateTime<Utc>,
    /// Present on manual firings; receives the terminal result.
    pub completion: Option<oneshot::Sender<ExecutionResult>>,
}

impl Firing {
    pub fn scheduled(job: Job) -> Self {
        Self {
            job,
            manual: false,
            enqueued_at: Utc::now(),
            completion: None,
        }
    }

    pub fn manual(job: Job, completion: oneshot::Sender<ExecutionResult>) -> Self {
        Self {
            job,
            manual: true,
            enqueued_at: Utc::now(),
            completion: Some(completion),
        }
    }
}

/// Executes one admitted firing. Implemented by the execution driver.
#[async_trait]
pub trait FiringHandler: Send + Sync {
    /// Run the firing to completion. `cancel` fires when the process is
    /// shutting down past its grace deadline.
    async fn handle(&self, firing: Firing, cancel: CancellationToken);
}

/// Observable pool state for metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub pending: usize,
    pub active: usize,
    pub concurrency: usize,
}

#[derive(Default)]
struct QueueState {
    manual: VecDeque<Firing>,
    scheduled: VecDeque<Firing>,
}

impl QueueState {
    fn len(&self) -> usize {
        self.manual.len() + self.scheduled.len()
    }

    fn pop(&mut self) -> Option<Firing> {
        self.manual.pop_front().or_else(|| self.scheduled.pop_front())
    }
}

/// Bounded-concurrency worker pool.
pub struct WorkerPool {
    state: Mutex<QueueState>,
    wakeup: Notify,
    idle: Notify,
    active: AtomicUsize,
    accepting: AtomicBool,
    dispatch_cancel: CancellationToken,
    firing_cancel: CancellationToken,
    max_concurrent: usize,
    queue_capacity: Option<usize>,
}

impl WorkerPool {
    pub fn new(max_concurrent: usize, queue_capacity: Option<usize>) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            wakeup: Notify::new(),
            idle: Notify::new(),
            active: AtomicUsize::new(0),
            accepting: AtomicBool::new(true),
            dispatch_cancel: CancellationToken::new(),
            firing_cancel: CancellationToken::new(),
            max_concurrent,
            queue_capacity,
        }
    }

    /// Start the dispatcher task feeding admitted firings into `handler`.
    pub fn start(self: Arc<Self>, handler: Arc<dyn FiringHandler>) {
        let pool = self;
        tokio::spawn(async move {
            loop {
                Self::dispatch_ready(&pool, &handler);
                tokio::select! {
                    _ = pool.wakeup.notified() => {}
                    _ = pool.dispatch_cancel.cancelled() => {
                        debug!("worker pool dispatcher stopping");
                        break;
                    }
                }
            }
        });
    }

    fn dispatch_ready(pool: &Arc<Self>, handler: &Arc<dyn FiringHandler>) {
        loop {
            if pool.dispatch_cancel.is_cancelled() {
                return;
            }
            if pool.active.load(Ordering::SeqCst) >= pool.max_concurrent {
                return;
            }
            let Some(firing) = pool.state.lock().pop() else {
                return;
            };

            pool.active.fetch_add(1, Ordering::SeqCst);
            let worker_pool = pool.clone();
            let handler = handler.clone();
            let cancel = pool.firing_cancel.child_token();
            tokio::spawn(async move {
                handler.handle(firing, cancel).await;
                worker_pool.active.fetch_sub(1, Ordering::SeqCst);
                worker_pool.wakeup.notify_one();
                worker_pool.idle.notify_waiters();
            });
        }
    }

    /// Non-blocking admission. Fails with `QueueOverflow` when a bounded
    /// queue is full, and `ShuttingDown` once shutdown has begun.
    pub fn enqueue(&self, firing: Firing) -> Result<(), PoolError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(PoolError::ShuttingDown);
        }
        {
            let mut state = self.state.lock();
            if let Some(capacity) = self.queue_capacity {
                if state.len() >= capacity {
                    warn!(
                        job_id = %firing.job.id,
                        capacity,
                        "QUEUE_OVERFLOW: worker queue full, firing dropped"
                    );
                    return Err(PoolError::QueueOverflow { capacity });
                }
            }
            if firing.manual {
                state.manual.push_back(firing);
            } else {
                state.scheduled.push_back(firing);
            }
        }
        self.wakeup.notify_one();
        Ok(())
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            pending: self.state.lock().len(),
            active: self.active.load(Ordering::SeqCst),
            concurrency: self.max_concurrent,
        }
    }

    /// Drain the pool: refuse new admissions, let active firings finish
    /// within `grace`, then cancel the remainder.
    pub async fn shutdown(&self, grace: Duration) {
        self.accepting.store(false, Ordering::SeqCst);
        self.dispatch_cancel.cancel();

        let drained = tokio::time::timeout(grace, self.wait_idle()).await.is_ok();
        if !drained {
            warn!(
                active = self.active.load(Ordering::SeqCst),
                "shutdown grace elapsed, cancelling in-flight firings"
            );
            self.firing_cancel.cancel();
            // Give cancelled firings a moment to persist their terminal state.
            let _ = tokio::time::timeout(Duration::from_secs(5), self.wait_idle()).await;
        }

        let mut state = self.state.lock();
        let dropped = state.len();
        if dropped > 0 {
            warn!(dropped, "discarding queued firings at shutdown");
        }
        state.manual.clear();
        state.scheduled.clear();
    }

    async fn wait_idle(&self) {
        loop {
            if self.active.load(Ordering::SeqCst) == 0 {
                return;
            }
            tokio::select! {
                _ = self.idle.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HttpMethod;

    fn test_job(name: &str) -> Job {
        Job::new(
            name,
            "* * * * *",
            "UTC",
            "https://example.com",
            HttpMethod::Post,
            "owner-1",
        )
    }

    /// Handler that records execution order and optionally blocks on a gate.
    struct RecordingHandler {
        order: Mutex<Vec<String>>,
        gate: tokio::sync::Semaphore,
    }

    impl RecordingHandler {
        fn new(initial_permits: usize) -> Self {
            Self {
                order: Mutex::new(Vec::new()),
                gate: tokio::sync::Semaphore::new(initial_permits),
            }
        }
    }

    #[async_trait]
    impl FiringHandler for RecordingHandler {
        async fn handle(&self, firing: Firing, _cancel: CancellationToken) {
            let permit = self.gate.acquire().await.unwrap();
            permit.forget();
            self.order.lock().push(firing.job.name.clone());
        }
    }

    #[tokio::test]
    async fn manual_firings_run_before_scheduled() {
        let handler = Arc::new(RecordingHandler::new(0));
        let pool = Arc::new(WorkerPool::new(1, None));
        pool.clone().start(handler.clone());

        pool.enqueue(Firing::scheduled(test_job("first"))).unwrap();
        // Let the dispatcher admit "first"; it blocks on the gate.
        tokio::time::sleep(Duration::from_millis(50)).await;

        pool.enqueue(Firing::scheduled(test_job("scheduled"))).unwrap();
        let (tx, _rx) = oneshot::channel();
        pool.enqueue(Firing::manual(test_job("manual"), tx)).unwrap();

        handler.gate.add_permits(3);
        tokio::time::sleep(Duration::from_millis(200)).await;

        let order = handler.order.lock().clone();
        assert_eq!(order, vec!["first", "manual", "scheduled"]);
    }

    #[tokio::test]
    async fn concurrency_one_serialises_firings() {
        struct SlowHandler {
            concurrent: AtomicUsize,
            max_seen: AtomicUsize,
        }

        #[async_trait]
        impl FiringHandler for SlowHandler {
            async fn handle(&self, _firing: Firing, _cancel: CancellationToken) {
                let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                self.concurrent.fetch_sub(1, Ordering::SeqCst);
            }
        }

        let handler = Arc::new(SlowHandler {
            concurrent: AtomicUsize::new(0),
            max_seen: AtomicUsize::new(0),
        });
        let pool = Arc::new(WorkerPool::new(1, None));
        pool.clone().start(handler.clone());

        pool.enqueue(Firing::scheduled(test_job("a"))).unwrap();
        pool.enqueue(Firing::scheduled(test_job("b"))).unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(handler.max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn bounded_queue_overflows() {
        let pool = Arc::new(WorkerPool::new(1, Some(2)));
        // No dispatcher started: everything stays queued.
        pool.enqueue(Firing::scheduled(test_job("a"))).unwrap();
        pool.enqueue(Firing::scheduled(test_job("b"))).unwrap();

        let err = pool.enqueue(Firing::scheduled(test_job("c"))).unwrap_err();
        assert!(matches!(err, PoolError::QueueOverflow { capacity: 2 }));
        assert_eq!(pool.stats().pending, 2);
    }

    #[tokio::test]
    async fn stats_report_pending_active_concurrency() {
        let handler = Arc::new(RecordingHandler::new(0));
        let pool = Arc::new(WorkerPool::new(2, None));
        pool.clone().start(handler.clone());

        pool.enqueue(Firing::scheduled(test_job("a"))).unwrap();
        pool.enqueue(Firing::scheduled(test_job("b"))).unwrap();
        pool.enqueue(Firing::scheduled(test_job("c"))).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stats = pool.stats();
        assert_eq!(stats.concurrency, 2);
        assert_eq!(stats.active, 2);
        assert_eq!(stats.pending, 1);

        handler.gate.add_permits(3);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.stats().active, 0);
        assert_eq!(pool.stats().pending, 0);
    }

    #[tokio::test]
    async fn shutdown_refuses_new_admissions_and_drains() {
        let handler = Arc::new(RecordingHandler::new(10));
        let pool = Arc::new(WorkerPool::new(2, None));
        pool.clone().start(handler.clone());

        pool.enqueue(Firing::scheduled(test_job("a"))).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        pool.shutdown(Duration::from_secs(1)).await;

        let err = pool.enqueue(Firing::scheduled(test_job("late"))).unwrap_err();
        assert!(matches!(err, PoolError::ShuttingDown));
        assert_eq!(pool.stats().active, 0);
        assert_eq!(pool.stats().pending, 0);
    }

    #[tokio::test]
    async fn shutdown_cancels_stuck_firings_after_grace() {
        struct StuckHandler;

        #[async_trait]
        impl FiringHandler for StuckHandler {
            async fn handle(&self, _firing: Firing, cancel: CancellationToken) {
                // Only the cancellation signal ends this firing.
                cancel.cancelled().await;
            }
        }

        let pool = Arc::new(WorkerPool::new(1, None));
        pool.clone().start(Arc::new(StuckHandler));

        pool.enqueue(Firing::scheduled(test_job("stuck"))).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.stats().active, 1);

        pool.shutdown(Duration::from_millis(100)).await;
        assert_eq!(pool.stats().active, 0);
    }
}
