//! Per-firing execution: the retry loop, outcome classification, atomic
//! terminal persistence, and event emission.
//!
//! Success policy: an attempt succeeds iff a response was received and its
//! status code is in [200, 400). Transport errors, timeouts, and status codes
//! >= 400 all count as attempt failures and consume retry budget.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::invoker::{HttpCall, HttpInvoke, HttpResponse};
use crate::scheduler::cron::{Clock, CronEvaluator};
use crate::scheduler::events::{EventPayload, EventPublisher, SchedulerEvent};
use crate::scheduler::store::{ExecutionStore, TerminalUpdate};
use crate::scheduler::worker_pool::{Firing, FiringHandler};
use crate::types::{
    Execution, ExecutionId, ExecutionResult, ExecutionStatus, InvokeError, Job, RuntimeError,
    StoreError,
};

/// Backoff cap between attempts.
const BACKOFF_CAP_MS: u64 = 60_000;

/// Error message persisted when shutdown interrupts a firing.
const CANCELLED_MESSAGE: &str = "cancelled";

/// Sleep before attempt `attempt + 1`: 1s, 2s, 4s, ... capped at 60s.
pub fn backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    Duration::from_millis((1_000u64 << exp).min(BACKOFF_CAP_MS))
}

/// Storage-time defence: HTML bodies are never persisted, so the history UI
/// can render stored bodies without sanitising. Returns `None` when the body
/// is deemed HTML.
pub fn filter_response_body(raw: &str) -> Option<String> {
    let trimmed = raw.trim_start();
    let lower = trimmed.to_lowercase();
    if lower.starts_with("<!doctype") || lower.starts_with("<html") {
        return None;
    }
    if lower.starts_with('<') && lower.contains("</html>") {
        return None;
    }
    Some(raw.to_string())
}

enum AttemptOutcome {
    Success(HttpResponse),
    Failure(String),
}

fn classify(result: Result<HttpResponse, InvokeError>) -> AttemptOutcome {
    match result {
        Ok(response) if (200..400).contains(&response.status) => {
            AttemptOutcome::Success(response)
        }
        Ok(response) => AttemptOutcome::Failure(format!("HTTP {}", response.status)),
        Err(e) => AttemptOutcome::Failure(format!("{}: {e}", e.kind())),
    }
}

struct FiringContext {
    job: Job,
    execution_id: ExecutionId,
    firing_start: chrono::DateTime<chrono::Utc>,
    completion: Option<tokio::sync::oneshot::Sender<ExecutionResult>>,
}

/// Drives one firing through its attempts and writes the terminal state.
pub struct ExecutionDriver {
    store: Arc<dyn ExecutionStore>,
    invoker: Arc<dyn HttpInvoke>,
    publisher: Arc<dyn EventPublisher>,
    clock: Arc<dyn Clock>,
}

impl ExecutionDriver {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        invoker: Arc<dyn HttpInvoke>,
        publisher: Arc<dyn EventPublisher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            invoker,
            publisher,
            clock,
        }
    }

    async fn run(
        &self,
        mut firing: Firing,
        cancel: CancellationToken,
    ) -> Result<(), RuntimeError> {
        let completion = firing.completion.take();
        let job = firing.job;
        let firing_start = self.clock.now();

        match self.store.mark_job_running(job.id, firing_start).await {
            Ok(()) => {}
            Err(StoreError::NotFound(_)) => {
                warn!(job_id = %job.id, "job vanished before its firing started, aborting");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
        self.publisher.publish(SchedulerEvent::ExecutionStarted(
            EventPayload::for_job(&job, firing_start).with_status(ExecutionStatus::Running),
        ));

        let execution = Execution::started(job.id, firing_start);
        self.store.insert_execution(&execution).await?;

        let ctx = FiringContext {
            execution_id: execution.id,
            firing_start,
            completion,
            job,
        };

        let call = HttpCall::from(&ctx.job);
        let mut last_error = String::from("no attempts were made");

        for attempt in 1..=ctx.job.retry_budget.max(1) {
            if cancel.is_cancelled() {
                return self.finish_failed(ctx, CANCELLED_MESSAGE.into(), attempt).await;
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    return self.finish_failed(ctx, CANCELLED_MESSAGE.into(), attempt).await;
                }
                result = self.invoker.invoke(&call) => result,
            };

            match classify(result) {
                AttemptOutcome::Success(response) => {
                    return self.finish_success(ctx, response, attempt).await;
                }
                AttemptOutcome::Failure(message) => {
                    warn!(
                        job_id = %ctx.job.id,
                        attempt,
                        budget = ctx.job.retry_budget,
                        error = %message,
                        "attempt failed"
                    );
                    last_error = message;
                    if attempt < ctx.job.retry_budget {
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                return self
                                    .finish_failed(ctx, CANCELLED_MESSAGE.into(), attempt)
                                    .await;
                            }
                            _ = tokio::time::sleep(backoff_delay(attempt)) => {}
                        }
                    }
                }
            }
        }

        let budget = ctx.job.retry_budget;
        self.finish_failed(ctx, last_error, budget).await
    }

    async fn finish_success(
        &self,
        ctx: FiringContext,
        response: HttpResponse,
        attempt: u32,
    ) -> Result<(), RuntimeError> {
        let body = filter_response_body(&response.body);
        if body.is_none() && !response.body.is_empty() {
            warn!(
                job_id = %ctx.job.id,
                "response body looks like HTML, storing null instead"
            );
        }
        self.finish(ctx, ExecutionStatus::Success, Some(response.status), body, None, attempt)
            .await
    }

    async fn finish_failed(
        &self,
        ctx: FiringContext,
        error_message: String,
        attempt: u32,
    ) -> Result<(), RuntimeError> {
        self.finish(
            ctx,
            ExecutionStatus::Failed,
            None,
            None,
            Some(error_message),
            attempt,
        )
        .await
    }

    async fn finish(
        &self,
        ctx: FiringContext,
        status: ExecutionStatus,
        response_status_code: Option<u16>,
        response_body: Option<String>,
        error_message: Option<String>,
        attempt: u32,
    ) -> Result<(), RuntimeError> {
        let completed_at = self.clock.now();
        let duration_ms = (completed_at - ctx.firing_start).num_milliseconds().max(0) as u64;

        let next_fire_at =
            match CronEvaluator::next(&ctx.job.cron_expression, &ctx.job.timezone, completed_at) {
                Ok(next) => Some(next),
                Err(e) => {
                    warn!(job_id = %ctx.job.id, error = %e, "could not compute next firing");
                    None
                }
            };

        // The job may have been deleted while the firing was in flight; its
        // execution rows are gone with it, so there is nothing to write.
        if self.store.get_job(ctx.job.id).await?.is_none() {
            warn!(job_id = %ctx.job.id, "job deleted mid-firing, skipping terminal write");
            return Ok(());
        }

        let update = TerminalUpdate {
            execution_id: ctx.execution_id,
            job_id: ctx.job.id,
            status,
            completed_at,
            response_status_code,
            response_body,
            error_message: error_message.clone(),
            duration_ms,
            attempt_number: attempt,
            next_fire_at,
        };

        match self.store.complete_execution(&update).await {
            Ok(()) => {}
            Err(StoreError::NotFound(_)) => {
                warn!(job_id = %ctx.job.id, "job deleted during terminal write, aborting");
                return Ok(());
            }
            Err(e) => {
                // The execution row stays RUNNING; emit a synthetic completion
                // so consumers converge, and let the next firing repair state.
                error!(job_id = %ctx.job.id, error = %e, "terminal write failed");
                self.publisher.publish(SchedulerEvent::ExecutionCompleted(
                    EventPayload::for_job(&ctx.job, completed_at)
                        .with_status(ExecutionStatus::Failed)
                        .with_error(Some(e.to_string())),
                ));
                return Err(e.into());
            }
        }

        self.publisher.publish(SchedulerEvent::ExecutionCompleted(
            EventPayload::for_job(&ctx.job, completed_at)
                .with_status(status)
                .with_error(error_message.clone()),
        ));

        if let Some(tx) = ctx.completion {
            let _ = tx.send(ExecutionResult {
                execution_id: ctx.execution_id,
                job_id: ctx.job.id,
                status,
                response_status_code,
                error_message,
                duration_ms,
                attempt_number: attempt,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl FiringHandler for ExecutionDriver {
    async fn handle(&self, firing: Firing, cancel: CancellationToken) {
        let job_id = firing.job.id;
        if let Err(e) = self.run(firing, cancel).await {
            error!(job_id = %job_id, error = %e, "firing did not persist cleanly");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::cron::SystemClock;
    use crate::scheduler::events::RecordingPublisher;
    use crate::scheduler::store::SqliteExecutionStore;
    use crate::types::HttpMethod;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::time::Instant;

    /// Invoker returning scripted outcomes, then repeating the last one.
    struct StubInvoker {
        script: Mutex<VecDeque<Result<HttpResponse, InvokeError>>>,
    }

    impl StubInvoker {
        fn new(script: Vec<Result<HttpResponse, InvokeError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
            })
        }

        fn ok(status: u16, body: &str) -> Result<HttpResponse, InvokeError> {
            Ok(HttpResponse {
                status,
                body: body.to_string(),
            })
        }

        fn no_response() -> Result<HttpResponse, InvokeError> {
            Err(InvokeError::NoResponse {
                url: "https://example.com".into(),
                reason: "connection refused".into(),
            })
        }

        fn timeout() -> Result<HttpResponse, InvokeError> {
            Err(InvokeError::Timeout {
                url: "https://example.com".into(),
                timeout_ms: 1_000,
            })
        }
    }

    #[async_trait]
    impl HttpInvoke for StubInvoker {
        async fn invoke(&self, _call: &HttpCall) -> Result<HttpResponse, InvokeError> {
            let mut script = self.script.lock();
            if script.len() > 1 {
                script.pop_front().unwrap()
            } else {
                script.front().cloned().unwrap_or_else(Self::no_response)
            }
        }
    }

    struct Harness {
        store: Arc<SqliteExecutionStore>,
        publisher: Arc<RecordingPublisher>,
        driver: ExecutionDriver,
    }

    fn harness(invoker: Arc<dyn HttpInvoke>) -> Harness {
        let store = Arc::new(SqliteExecutionStore::open_in_memory().unwrap());
        let publisher = Arc::new(RecordingPublisher::default());
        let driver = ExecutionDriver::new(
            store.clone(),
            invoker,
            publisher.clone(),
            Arc::new(SystemClock),
        );
        Harness {
            store,
            publisher,
            driver,
        }
    }

    async fn insert_job(store: &SqliteExecutionStore, retry_budget: u32) -> Job {
        let mut job = Job::new(
            "driver_test",
            "*/5 * * * *",
            "UTC",
            "https://example.com/hook",
            HttpMethod::Post,
            "owner-1",
        );
        job.retry_budget = retry_budget;
        store.insert_job(&job).await.unwrap();
        job
    }

    #[test]
    fn backoff_doubles_and_caps_at_sixty_seconds() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(3), Duration::from_secs(4));
        assert_eq!(backoff_delay(6), Duration::from_secs(32));
        // 2^6 = 64s would exceed the cap.
        assert_eq!(backoff_delay(7), Duration::from_secs(60));
        assert_eq!(backoff_delay(10), Duration::from_secs(60));
    }

    #[test]
    fn html_bodies_are_filtered() {
        assert!(filter_response_body("<!DOCTYPE html><html></html>").is_none());
        assert!(filter_response_body("  <!doctype HTML>").is_none());
        assert!(filter_response_body("<HTML><body/></HTML>").is_none());
        assert!(filter_response_body("<div>x</div></html>").is_none());
        assert_eq!(
            filter_response_body("{\"ok\":true}").as_deref(),
            Some("{\"ok\":true}")
        );
        assert_eq!(filter_response_body("plain text").as_deref(), Some("plain text"));
        // A lone tag without a closing </html> is not deemed HTML.
        assert_eq!(filter_response_body("<xml/>").as_deref(), Some("<xml/>"));
    }

    #[tokio::test]
    async fn success_on_first_attempt() {
        let h = harness(StubInvoker::new(vec![StubInvoker::ok(200, "{\"ok\":true}")]));
        let job = insert_job(&h.store, 3).await;

        let (tx, rx) = tokio::sync::oneshot::channel();
        h.driver
            .run(Firing::manual(job.clone(), tx), CancellationToken::new())
            .await
            .unwrap();

        let result = rx.await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(result.response_status_code, Some(200));
        assert_eq!(result.attempt_number, 1);

        let history = h.store.recent_executions(job.id, 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, ExecutionStatus::Success);
        assert_eq!(history[0].response_body.as_deref(), Some("{\"ok\":true}"));
        assert!(history[0].completed_at.unwrap() >= history[0].started_at);

        let loaded = h.store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(
            loaded.lifecycle_status,
            crate::types::JobLifecycleStatus::Success
        );
        let next = loaded.next_fire_at.unwrap();
        assert!(next > chrono::Utc::now());
        assert!(next <= chrono::Utc::now() + chrono::Duration::minutes(5));

        assert_eq!(
            h.publisher.kinds(),
            vec!["execution.started", "execution.completed"]
        );
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let h = harness(StubInvoker::new(vec![
            StubInvoker::no_response(),
            StubInvoker::ok(200, "{}"),
        ]));
        let job = insert_job(&h.store, 3).await;

        let started = Instant::now();
        h.driver
            .run(Firing::scheduled(job.clone()), CancellationToken::new())
            .await
            .unwrap();
        // One backoff of 1s separates the attempts.
        assert!(started.elapsed() >= Duration::from_millis(1_000));

        let history = h.store.recent_executions(job.id, 10).await.unwrap();
        assert_eq!(history[0].status, ExecutionStatus::Success);
        assert_eq!(history[0].attempt_number, 2);
    }

    #[tokio::test]
    async fn exhausts_retries_and_fails() {
        let h = harness(StubInvoker::new(vec![StubInvoker::timeout()]));
        let job = insert_job(&h.store, 2).await;

        h.driver
            .run(Firing::scheduled(job.clone()), CancellationToken::new())
            .await
            .unwrap();

        let history = h.store.recent_executions(job.id, 10).await.unwrap();
        assert_eq!(history[0].status, ExecutionStatus::Failed);
        assert_eq!(history[0].attempt_number, 2);
        let message = history[0].error_message.clone().unwrap().to_lowercase();
        assert!(message.contains("timeout"));

        let loaded = h.store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(
            loaded.lifecycle_status,
            crate::types::JobLifecycleStatus::Failed
        );
        // A failed firing still schedules the next one.
        assert!(loaded.next_fire_at.is_some());
    }

    #[tokio::test]
    async fn retry_budget_of_one_never_sleeps() {
        let h = harness(StubInvoker::new(vec![StubInvoker::no_response()]));
        let job = insert_job(&h.store, 1).await;

        let started = Instant::now();
        h.driver
            .run(Firing::scheduled(job.clone()), CancellationToken::new())
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_millis(500));

        let history = h.store.recent_executions(job.id, 10).await.unwrap();
        assert_eq!(history[0].attempt_number, 1);
    }

    #[tokio::test]
    async fn status_4xx_fails_under_strict_policy() {
        let h = harness(StubInvoker::new(vec![StubInvoker::ok(404, "missing")]));
        let job = insert_job(&h.store, 1).await;

        h.driver
            .run(Firing::scheduled(job.clone()), CancellationToken::new())
            .await
            .unwrap();

        let history = h.store.recent_executions(job.id, 10).await.unwrap();
        assert_eq!(history[0].status, ExecutionStatus::Failed);
        assert_eq!(history[0].error_message.as_deref(), Some("HTTP 404"));
    }

    #[tokio::test]
    async fn redirect_class_counts_as_success() {
        let h = harness(StubInvoker::new(vec![StubInvoker::ok(302, "")]));
        let job = insert_job(&h.store, 1).await;

        h.driver
            .run(Firing::scheduled(job.clone()), CancellationToken::new())
            .await
            .unwrap();

        let history = h.store.recent_executions(job.id, 10).await.unwrap();
        assert_eq!(history[0].status, ExecutionStatus::Success);
        assert_eq!(history[0].response_status_code, Some(302));
    }

    #[tokio::test]
    async fn html_body_persists_as_null_on_success() {
        let h = harness(StubInvoker::new(vec![StubInvoker::ok(
            200,
            "<!DOCTYPE html><html><body>hi</body></html>",
        )]));
        let job = insert_job(&h.store, 1).await;

        h.driver
            .run(Firing::scheduled(job.clone()), CancellationToken::new())
            .await
            .unwrap();

        let history = h.store.recent_executions(job.id, 10).await.unwrap();
        assert_eq!(history[0].status, ExecutionStatus::Success);
        assert_eq!(history[0].response_status_code, Some(200));
        assert!(history[0].response_body.is_none());
    }

    #[tokio::test]
    async fn cancellation_during_backoff_writes_failed() {
        let h = harness(StubInvoker::new(vec![StubInvoker::no_response()]));
        let job = insert_job(&h.store, 3).await;

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        h.driver
            .run(Firing::scheduled(job.clone()), cancel)
            .await
            .unwrap();
        // Cancelled out of the 1s backoff well before it elapsed.
        assert!(started.elapsed() < Duration::from_millis(900));

        let history = h.store.recent_executions(job.id, 10).await.unwrap();
        assert_eq!(history[0].status, ExecutionStatus::Failed);
        assert_eq!(history[0].error_message.as_deref(), Some("cancelled"));
    }

    #[tokio::test]
    async fn missing_job_aborts_without_rows_or_events() {
        let h = harness(StubInvoker::new(vec![StubInvoker::ok(200, "{}")]));
        // Job never inserted into the store.
        let job = Job::new(
            "ghost",
            "* * * * *",
            "UTC",
            "https://example.com",
            HttpMethod::Get,
            "owner-1",
        );

        h.driver
            .run(Firing::scheduled(job.clone()), CancellationToken::new())
            .await
            .unwrap();

        assert!(h.publisher.events().is_empty());
        assert!(h
            .store
            .recent_executions(job.id, 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn job_deleted_mid_firing_skips_terminal_write() {
        /// Deletes the job from the store while the attempt is in flight.
        struct DeletingInvoker {
            store: Arc<SqliteExecutionStore>,
            job_id: crate::types::JobId,
        }

        #[async_trait]
        impl HttpInvoke for DeletingInvoker {
            async fn invoke(&self, _call: &HttpCall) -> Result<HttpResponse, InvokeError> {
                self.store.delete_job(self.job_id).await.unwrap();
                Ok(HttpResponse {
                    status: 200,
                    body: "{}".into(),
                })
            }
        }

        let store = Arc::new(SqliteExecutionStore::open_in_memory().unwrap());
        let publisher = Arc::new(RecordingPublisher::default());
        let job = insert_job(&store, 1).await;
        let driver = ExecutionDriver::new(
            store.clone(),
            Arc::new(DeletingInvoker {
                store: store.clone(),
                job_id: job.id,
            }),
            publisher.clone(),
            Arc::new(SystemClock),
        );

        driver
            .run(Firing::scheduled(job.clone()), CancellationToken::new())
            .await
            .unwrap();

        // Started was published, but no completion: the terminal write was
        // skipped because the job vanished.
        assert_eq!(publisher.kinds(), vec!["execution.started"]);
    }
}
