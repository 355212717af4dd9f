//! Lifecycle orchestration: boot-time rehydration, the external command
//! interface, and graceful shutdown.
//!
//! Every command re-derives the registry entry from the post-mutation job
//! row: unregister when disabled or deleted, register (replacing any previous
//! timer) when enabled. Commands return after the registry mutation is
//! visible.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::scheduler::controller::ScheduleCommands;
use crate::scheduler::cron::{Clock, CronEvaluator};
use crate::scheduler::events::{EventPayload, EventPublisher, SchedulerEvent};
use crate::scheduler::registry::JobRegistry;
use crate::scheduler::store::ExecutionStore;
use crate::scheduler::worker_pool::{Firing, WorkerPool};
use crate::types::{
    ExecutionResult, Job, JobId, LifecycleError, RuntimeError, ScheduleChange,
};

/// Reason recorded on schedule changes arriving through the CRUD command path.
const MANUAL_CHANGE_REASON: &str = "manual";

/// Owns the registry mutation path and coordinates boot and shutdown.
pub struct LifecycleOrchestrator {
    store: Arc<dyn ExecutionStore>,
    registry: Arc<JobRegistry>,
    pool: Arc<WorkerPool>,
    publisher: Arc<dyn EventPublisher>,
    clock: Arc<dyn Clock>,
}

impl LifecycleOrchestrator {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        registry: Arc<JobRegistry>,
        pool: Arc<WorkerPool>,
        publisher: Arc<dyn EventPublisher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            registry,
            pool,
            publisher,
            clock,
        }
    }

    /// Rehydrate timers for every enabled job. Jobs whose expression or
    /// timezone no longer parses are logged and skipped, never fatal.
    pub async fn boot(&self) -> Result<usize, RuntimeError> {
        let jobs = self.store.list_enabled_jobs().await?;
        let total = jobs.len();
        let mut registered = 0;
        for job in jobs {
            let job_id = job.id;
            match self.arm(job).await {
                Ok(()) => registered += 1,
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "skipping job at boot");
                }
            }
        }
        info!(registered, total, "boot rehydration complete");
        Ok(registered)
    }

    /// Validate, compute `next_fire_at`, persist, and install the timer.
    async fn arm(&self, mut job: Job) -> Result<(), LifecycleError> {
        job.validate().map_err(LifecycleError::InvalidJob)?;
        let next =
            CronEvaluator::next(&job.cron_expression, &job.timezone, self.clock.now())?;
        job.next_fire_at = Some(next);
        self.store.update_job(&job).await?;
        self.registry.register(job)?;
        Ok(())
    }

    /// A job row was created by the CRUD collaborator.
    pub async fn on_job_created(&self, job: Job) -> Result<(), LifecycleError> {
        job.validate().map_err(LifecycleError::InvalidJob)?;
        self.store.insert_job(&job).await?;
        self.publisher.publish(SchedulerEvent::JobCreated(
            EventPayload::for_job(&job, self.clock.now()),
        ));
        if job.enabled {
            self.arm(job).await?;
        }
        Ok(())
    }

    /// A job row was mutated. Appends a schedule-change audit row iff the
    /// cron expression actually changed against the stored row.
    pub async fn on_job_updated(&self, job: Job) -> Result<(), LifecycleError> {
        job.validate().map_err(LifecycleError::InvalidJob)?;
        let old = self
            .store
            .get_job(job.id)
            .await?
            .ok_or(LifecycleError::NotFound(job.id))?;
        let now = self.clock.now();

        if old.cron_expression != job.cron_expression {
            let change = ScheduleChange::new(
                job.id,
                &old.cron_expression,
                &job.cron_expression,
                MANUAL_CHANGE_REASON,
                &job.owner,
                now,
            );
            self.store.append_schedule_change(&change).await?;
            self.publisher.publish(SchedulerEvent::ScheduleChanged(
                EventPayload::for_job(&job, now)
                    .with_expressions(&old.cron_expression, &job.cron_expression),
            ));
        }

        let mut updated = job;
        updated.updated_at = now;

        if updated.enabled {
            // Validate before touching the existing timer so a bad payload
            // cannot leave an armed job timerless.
            let next =
                CronEvaluator::next(&updated.cron_expression, &updated.timezone, now)?;
            updated.next_fire_at = Some(next);
            self.store.update_job(&updated).await?;
            self.registry.register(updated.clone())?;
        } else {
            self.registry.unregister(updated.id);
            updated.next_fire_at = None;
            self.store.update_job(&updated).await?;
        }

        self.publisher.publish(SchedulerEvent::JobUpdated(
            EventPayload::for_job(&updated, now),
        ));
        Ok(())
    }

    /// A job row was deleted. Pending timers are cancelled; queued firings
    /// discover the deletion when the driver re-checks existence.
    pub async fn on_job_deleted(&self, job_id: JobId) -> Result<(), LifecycleError> {
        self.registry.unregister(job_id);
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or(LifecycleError::NotFound(job_id))?;
        self.store.delete_job(job_id).await?;
        self.publisher.publish(SchedulerEvent::JobDeleted(
            EventPayload::for_job(&job, self.clock.now()),
        ));
        Ok(())
    }

    pub async fn on_job_enabled(&self, job: Job) -> Result<(), LifecycleError> {
        let mut job = job;
        job.enabled = true;
        job.updated_at = self.clock.now();
        let payload_job = job.clone();
        self.arm(job).await?;
        self.publisher.publish(SchedulerEvent::JobUpdated(
            EventPayload::for_job(&payload_job, self.clock.now()),
        ));
        Ok(())
    }

    pub async fn on_job_disabled(&self, job_id: JobId) -> Result<(), LifecycleError> {
        self.registry.unregister(job_id);
        let mut job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or(LifecycleError::NotFound(job_id))?;
        job.enabled = false;
        job.next_fire_at = None;
        job.updated_at = self.clock.now();
        self.store.update_job(&job).await?;
        self.publisher.publish(SchedulerEvent::JobUpdated(
            EventPayload::for_job(&job, self.clock.now()),
        ));
        Ok(())
    }

    /// Fire a job immediately, ahead of scheduled work, and wait for its
    /// terminal result.
    pub async fn trigger_manual(&self, job_id: JobId) -> Result<ExecutionResult, LifecycleError> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or(LifecycleError::NotFound(job_id))?;

        let (tx, rx) = tokio::sync::oneshot::channel();
        self.pool.enqueue(Firing::manual(job, tx))?;
        rx.await.map_err(|_| {
            LifecycleError::Cancelled("firing dropped before completion".to_string())
        })
    }

    /// Drain the worker pool within `grace`, then tear down all timers.
    pub async fn shutdown(&self, grace: Duration) {
        self.pool.shutdown(grace).await;
        self.registry.clear();
        info!("lifecycle orchestrator shut down");
    }
}

#[async_trait]
impl ScheduleCommands for LifecycleOrchestrator {
    async fn on_job_updated(&self, job: Job) -> Result<(), LifecycleError> {
        LifecycleOrchestrator::on_job_updated(self, job).await
    }

    async fn on_job_disabled(&self, job_id: JobId) -> Result<(), LifecycleError> {
        LifecycleOrchestrator::on_job_disabled(self, job_id).await
    }
}
