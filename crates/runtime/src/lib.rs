//! webcron scheduler runtime
//!
//! The core of a managed, multi-tenant scheduler for HTTP-invoked recurring
//! jobs: a persistent timer registry that survives restarts, a
//! bounded-concurrency execution engine with retry and backoff, and an
//! auto-rescheduling controller that stretches or disables misbehaving
//! schedules.
//!
//! The HTTP/REST CRUD surface, authentication, and the push channel live in
//! external collaborators; this crate exposes the command interface they
//! drive ([`SchedulerRuntime`]) and the event stream they consume.

pub mod config;
pub mod invoker;
pub mod lifecycle;
pub mod scheduler;
pub mod types;

pub use config::{ConfigError, RuntimeConfig};
pub use invoker::{HttpCall, HttpInvoke, HttpInvoker, HttpResponse};
pub use lifecycle::LifecycleOrchestrator;
pub use scheduler::{
    BroadcastPublisher, Clock, ControllerConfig, CronEvaluator, CronValidation, EventPublisher,
    ExecutionDriver, ExecutionStore, JobMetrics, JobRegistry, PoolStats, ReschedulingController,
    SchedulerEvent, SqliteExecutionStore, SystemClock, WorkerPool,
};
pub use types::*;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::info;

/// Health snapshot of the running scheduler.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeHealth {
    pub is_running: bool,
    pub store_accessible: bool,
    pub enabled_jobs: usize,
    pub registered_timers: usize,
    pub pool_pending: usize,
    pub pool_active: usize,
    pub pool_concurrency: usize,
}

/// The assembled scheduler core: store, registry, worker pool, driver,
/// controller, and orchestrator, wired together and running.
pub struct SchedulerRuntime {
    store: Arc<dyn ExecutionStore>,
    registry: Arc<JobRegistry>,
    pool: Arc<WorkerPool>,
    publisher: Arc<BroadcastPublisher>,
    orchestrator: Arc<LifecycleOrchestrator>,
    controller: Arc<ReschedulingController>,
    config: RuntimeConfig,
    running: AtomicBool,
}

impl SchedulerRuntime {
    /// Open the configured store and start the runtime.
    pub async fn start(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        config.validate()?;
        let store: Arc<dyn ExecutionStore> =
            if config.database_path == Path::new(":memory:") {
                Arc::new(SqliteExecutionStore::open_in_memory()?)
            } else {
                Arc::new(SqliteExecutionStore::open(
                    &config.database_path,
                    config.database_connection_limit,
                )?)
            };
        Self::start_with_store(config, store).await
    }

    /// Start the runtime on an externally provided store.
    pub async fn start_with_store(
        config: RuntimeConfig,
        store: Arc<dyn ExecutionStore>,
    ) -> Result<Self, RuntimeError> {
        config.validate()?;

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let publisher = Arc::new(BroadcastPublisher::default());
        let invoker = Arc::new(HttpInvoker::new(config.http_max_sockets_per_host)?);

        let pool = Arc::new(WorkerPool::new(
            config.max_concurrent_executions,
            config.worker_queue_capacity,
        ));
        let registry = Arc::new(JobRegistry::new(pool.clone(), clock.clone()));

        let driver = Arc::new(ExecutionDriver::new(
            store.clone(),
            invoker,
            publisher.clone(),
            clock.clone(),
        ));
        pool.clone().start(driver);

        let orchestrator = Arc::new(LifecycleOrchestrator::new(
            store.clone(),
            registry.clone(),
            pool.clone(),
            publisher.clone(),
            clock.clone(),
        ));
        orchestrator.boot().await?;

        let controller = Arc::new(ReschedulingController::new(
            store.clone(),
            publisher.clone(),
            clock,
            ControllerConfig {
                enabled: config.auto_rescheduling_enabled,
                batch_size: config.rescheduling_batch_size,
                interval: config.rescheduling_interval,
            },
        ));
        controller.clone().start(orchestrator.clone());

        info!(
            concurrency = config.max_concurrent_executions,
            auto_rescheduling = config.auto_rescheduling_enabled,
            "scheduler runtime started"
        );
        Ok(Self {
            store,
            registry,
            pool,
            publisher,
            orchestrator,
            controller,
            config,
            running: AtomicBool::new(true),
        })
    }

    // ── Command interface consumed by the CRUD collaborator ───────────

    pub async fn on_job_created(&self, job: Job) -> Result<(), LifecycleError> {
        self.orchestrator.on_job_created(job).await
    }

    pub async fn on_job_updated(&self, job: Job) -> Result<(), LifecycleError> {
        self.orchestrator.on_job_updated(job).await
    }

    pub async fn on_job_deleted(&self, job_id: JobId) -> Result<(), LifecycleError> {
        self.orchestrator.on_job_deleted(job_id).await
    }

    pub async fn on_job_enabled(&self, job: Job) -> Result<(), LifecycleError> {
        self.orchestrator.on_job_enabled(job).await
    }

    pub async fn on_job_disabled(&self, job_id: JobId) -> Result<(), LifecycleError> {
        self.orchestrator.on_job_disabled(job_id).await
    }

    pub async fn trigger_manual(&self, job_id: JobId) -> Result<ExecutionResult, LifecycleError> {
        self.orchestrator.trigger_manual(job_id).await
    }

    // ── Observability ─────────────────────────────────────────────────

    /// Subscribe to the outbound event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.publisher.subscribe()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// The canonical store, for collaborators that read execution history.
    pub fn store(&self) -> Arc<dyn ExecutionStore> {
        self.store.clone()
    }

    pub async fn check_health(&self) -> Result<RuntimeHealth, RuntimeError> {
        // A cheap probe doubles as the store accessibility check.
        let enabled_jobs = self.store.list_enabled_jobs().await?.len();
        let stats = self.pool.stats();
        Ok(RuntimeHealth {
            is_running: self.running.load(Ordering::SeqCst),
            store_accessible: true,
            enabled_jobs,
            registered_timers: self.registry.len(),
            pool_pending: stats.pending,
            pool_active: stats.active,
            pool_concurrency: stats.concurrency,
        })
    }

    /// Graceful shutdown: stop the controller, drain the worker pool within
    /// the grace deadline, then tear down all timers.
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("scheduler runtime shutting down");
        self.controller.stop();
        self.orchestrator.shutdown(self.config.shutdown_grace).await;
        info!("scheduler runtime shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn test_config() -> RuntimeConfig {
        RuntimeConfig {
            database_path: PathBuf::from(":memory:"),
            shutdown_grace: Duration::from_millis(500),
            ..Default::default()
        }
    }

    fn test_job(url: &str) -> Job {
        Job::new(
            "runtime_test",
            "*/5 * * * *",
            "UTC",
            url,
            HttpMethod::Post,
            "owner-1",
        )
    }

    #[tokio::test]
    async fn start_command_health_shutdown() {
        let runtime = SchedulerRuntime::start(test_config()).await.unwrap();

        let job = test_job("https://example.com/hook");
        runtime.on_job_created(job.clone()).await.unwrap();

        let health = runtime.check_health().await.unwrap();
        assert!(health.is_running);
        assert!(health.store_accessible);
        assert_eq!(health.enabled_jobs, 1);
        assert_eq!(health.registered_timers, 1);
        assert_eq!(health.pool_concurrency, 10);

        runtime.on_job_disabled(job.id).await.unwrap();
        let health = runtime.check_health().await.unwrap();
        assert_eq!(health.enabled_jobs, 0);
        assert_eq!(health.registered_timers, 0);

        runtime.shutdown().await;
        let health = runtime.check_health().await.unwrap();
        assert!(!health.is_running);
        // Shutdown is idempotent.
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn manual_trigger_round_trip_through_real_invoker() {
        // One-shot local endpoint answering 200 with a JSON body.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let _ = socket.read(&mut buf).await;
                    let _ = socket
                        .write_all(
                            b"HTTP/1.1 200 OK\r\nContent-Length: 11\r\n\r\n{\"ok\":true}",
                        )
                        .await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        let runtime = SchedulerRuntime::start(test_config()).await.unwrap();
        let mut events = runtime.subscribe();

        let job = test_job(&format!("http://{addr}/hook"));
        runtime.on_job_created(job.clone()).await.unwrap();

        let result = runtime.trigger_manual(job.id).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(result.response_status_code, Some(200));

        let history = runtime.store().recent_executions(job.id, 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].response_body.as_deref(), Some("{\"ok\":true}"));

        // job.created, execution.started, execution.completed all observable.
        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            kinds.push(event.kind());
        }
        assert!(kinds.contains(&"job.created"));
        assert!(kinds.contains(&"execution.started"));
        assert!(kinds.contains(&"execution.completed"));

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn boot_rehydrates_from_existing_store() {
        let store: Arc<dyn ExecutionStore> =
            Arc::new(SqliteExecutionStore::open_in_memory().unwrap());
        let job = test_job("https://example.com/hook");
        store.insert_job(&job).await.unwrap();

        let runtime = SchedulerRuntime::start_with_store(test_config(), store)
            .await
            .unwrap();
        let health = runtime.check_health().await.unwrap();
        assert_eq!(health.registered_timers, 1);
        runtime.shutdown().await;
    }
}
