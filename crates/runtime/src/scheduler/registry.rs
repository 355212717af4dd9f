//! In-memory mapping from job id to its live timer.
//!
//! All mutations go through the lifecycle orchestrator's command path, so the
//! invariant "at most one live timer per job id" holds: `register`
//! unconditionally unregisters first. Timer tasks only enqueue firings into
//! the worker pool; they never execute work themselves.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::scheduler::cron::{Clock, CronEvaluator};
use crate::scheduler::worker_pool::{Firing, WorkerPool};
use crate::types::{CronError, Job, JobId, PoolError};

struct TimerHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Registry of active timers, one per enabled job.
pub struct JobRegistry {
    timers: Mutex<HashMap<JobId, TimerHandle>>,
    pool: Arc<WorkerPool>,
    clock: Arc<dyn Clock>,
}

impl JobRegistry {
    pub fn new(pool: Arc<WorkerPool>, clock: Arc<dyn Clock>) -> Self {
        Self {
            timers: Mutex::new(HashMap::new()),
            pool,
            clock,
        }
    }

    /// Install a timer for `job`, replacing any existing one. Fails if the
    /// expression or timezone does not parse; in that case no timer exists
    /// for the job afterwards.
    pub fn register(&self, job: Job) -> Result<(), CronError> {
        // Validate expression and timezone before touching the timer map.
        CronEvaluator::next(&job.cron_expression, &job.timezone, self.clock.now())?;

        self.unregister(job.id);

        let job_id = job.id;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(timer_loop(
            job,
            self.pool.clone(),
            self.clock.clone(),
            cancel.clone(),
        ));
        self.timers
            .lock()
            .insert(job_id, TimerHandle { cancel, task });
        Ok(())
    }

    /// Cancel and remove a job's timer. Returns `false` if none existed.
    pub fn unregister(&self, job_id: JobId) -> bool {
        match self.timers.lock().remove(&job_id) {
            Some(handle) => {
                handle.cancel.cancel();
                handle.task.abort();
                true
            }
            None => false,
        }
    }

    pub fn has(&self, job_id: JobId) -> bool {
        self.timers.lock().contains_key(&job_id)
    }

    /// Ids of all jobs that currently hold a timer.
    pub fn snapshot(&self) -> Vec<JobId> {
        self.timers.lock().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.timers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.lock().is_empty()
    }

    /// Cancel every timer (shutdown path).
    pub fn clear(&self) {
        let mut timers = self.timers.lock();
        for (_, handle) in timers.drain() {
            handle.cancel.cancel();
            handle.task.abort();
        }
    }
}

async fn timer_loop(
    job: Job,
    pool: Arc<WorkerPool>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
) {
    loop {
        let now = clock.now();
        let next = match CronEvaluator::next(&job.cron_expression, &job.timezone, now) {
            Ok(next) => next,
            Err(e) => {
                error!(job_id = %job.id, error = %e, "timer stopping, schedule no longer evaluates");
                break;
            }
        };
        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }

        match pool.enqueue(Firing::scheduled(job.clone())) {
            Ok(()) => debug!(job_id = %job.id, fire_at = %next, "firing enqueued"),
            Err(PoolError::QueueOverflow { .. }) => {
                // Already logged by the pool; the missed firing is not recovered.
            }
            Err(PoolError::ShuttingDown) => break,
        }
    }
}
