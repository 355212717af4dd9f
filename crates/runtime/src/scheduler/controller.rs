//! Periodic auto-rescheduling control loop.
//!
//! Every sweep loads per-job execution history, computes [`JobMetrics`], and
//! applies the first matching rule: keep the schedule, stretch the cron
//! interval, or disable the job. Rules are ordered; lower number wins.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::scheduler::cron::{Clock, CronEvaluator};
use crate::scheduler::events::{EventPayload, EventPublisher, SchedulerEvent};
use crate::scheduler::store::{ExecutionStore, MAX_HISTORY_WINDOW};
use crate::types::{
    Execution, ExecutionStatus, Job, JobId, LifecycleError, RuntimeError, ScheduleChange,
};

/// Author recorded on controller-originated schedule changes.
const CONTROLLER_AUTHOR: &str = "rescheduling-controller";

/// The command surface the controller drives. Implemented by the lifecycle
/// orchestrator; the controller holds no other reference to it.
#[async_trait]
pub trait ScheduleCommands: Send + Sync {
    async fn on_job_updated(&self, job: Job) -> Result<(), LifecycleError>;
    async fn on_job_disabled(&self, job_id: JobId) -> Result<(), LifecycleError>;
}

/// Controller configuration, lifted from the runtime configuration.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub enabled: bool,
    pub batch_size: usize,
    pub interval: Duration,
}

/// Aggregates over a job's recent execution history.
#[derive(Debug, Clone, PartialEq)]
pub struct JobMetrics {
    pub total_executions: usize,
    pub success_rate: f64,
    pub failure_rate: f64,
    pub average_execution_time_ms: f64,
    pub recent_failures: usize,
    pub recent_timeouts: usize,
}

impl JobMetrics {
    /// Compute metrics from a newest-first history window.
    pub fn compute(executions: &[Execution], per_attempt_timeout_ms: u64) -> Self {
        let n = executions.len();
        let successes = executions
            .iter()
            .filter(|e| e.status == ExecutionStatus::Success)
            .count();
        let failures = executions
            .iter()
            .filter(|e| e.status == ExecutionStatus::Failed)
            .count();

        let durations: Vec<u64> = executions.iter().filter_map(|e| e.duration_ms).collect();
        let average_execution_time_ms = if durations.is_empty() {
            0.0
        } else {
            durations.iter().sum::<u64>() as f64 / durations.len() as f64
        };

        let recent = &executions[..n.min(10)];
        let recent_failures = recent
            .iter()
            .filter(|e| e.status == ExecutionStatus::Failed)
            .count();
        let recent_timeouts = recent
            .iter()
            .filter(|e| e.duration_ms.unwrap_or(0) >= per_attempt_timeout_ms)
            .count();

        Self {
            total_executions: n,
            success_rate: if n == 0 {
                1.0
            } else {
                successes as f64 / n as f64
            },
            failure_rate: if n == 0 {
                0.0
            } else {
                failures as f64 / n as f64
            },
            average_execution_time_ms,
            recent_failures,
            recent_timeouts,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum RuleAction {
    Keep,
    Extend(f64),
    Disable,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Rule {
    name: &'static str,
    action: RuleAction,
}

/// First matching rule in priority order; `None` when no rule applies.
fn evaluate_rules(metrics: &JobMetrics, per_attempt_timeout_ms: u64) -> Option<Rule> {
    let n = metrics.total_executions;

    if metrics.success_rate >= 0.95 && n >= 20 {
        return Some(Rule {
            name: "keep-on-success",
            action: RuleAction::Keep,
        });
    }
    if metrics.failure_rate > 0.50 && n >= 10 {
        return Some(Rule {
            name: "failure-based-backoff",
            action: RuleAction::Extend(2.0),
        });
    }
    if metrics.recent_timeouts >= 3 && n >= 10 {
        return Some(Rule {
            name: "timeout-based-reduction",
            action: RuleAction::Extend(1.5),
        });
    }
    if metrics.average_execution_time_ms > 0.8 * per_attempt_timeout_ms as f64 && n >= 10 {
        return Some(Rule {
            name: "slow-execution-decongestion",
            action: RuleAction::Extend(1.2),
        });
    }
    if metrics.recent_failures >= 3 {
        return Some(Rule {
            name: "failure-streak-disable",
            action: RuleAction::Disable,
        });
    }
    None
}

/// Stretch a 5-field expression's minute field by `factor`.
///
/// A numeric minute `m` becomes `floor(max(1, m * factor))`; a step form
/// `*/s` becomes `*/floor(max(1, s * factor))`. Any other minute field, or a
/// rewrite that lands on the same value, yields `None` (schedule unchanged).
pub fn extend_cron_interval(expression: &str, factor: f64) -> Option<String> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() != 5 {
        return None;
    }

    let minute = fields[0];
    let rewritten = if let Ok(m) = minute.parse::<u32>() {
        let stretched = (m as f64 * factor).max(1.0).floor() as u32;
        if stretched == m {
            return None;
        }
        stretched.to_string()
    } else if let Some(step) = minute.strip_prefix("*/") {
        let s: u32 = step.parse().ok()?;
        let stretched = (s as f64 * factor).max(1.0).floor() as u32;
        if stretched == s {
            return None;
        }
        format!("*/{stretched}")
    } else {
        return None;
    };

    let mut fields = fields;
    fields[0] = &rewritten;
    Some(fields.join(" "))
}

/// What a sweep did to one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleOutcome {
    Kept,
    Rescheduled,
    Disabled,
}

/// Summary of one controller sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub evaluated: usize,
    pub rescheduled: usize,
    pub disabled: usize,
    pub failed: usize,
}

/// The hourly auto-rescheduling controller.
pub struct ReschedulingController {
    store: Arc<dyn ExecutionStore>,
    publisher: Arc<dyn EventPublisher>,
    clock: Arc<dyn Clock>,
    config: ControllerConfig,
    shutdown: CancellationToken,
}

impl ReschedulingController {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        publisher: Arc<dyn EventPublisher>,
        clock: Arc<dyn Clock>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            store,
            publisher,
            clock,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Spawn the periodic sweep loop.
    pub fn start(self: Arc<Self>, commands: Arc<dyn ScheduleCommands>) {
        let controller = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(controller.config.interval);
            // The immediate first tick would sweep at boot; skip it.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match controller.sweep(commands.as_ref()).await {
                            Ok(stats) => info!(
                                evaluated = stats.evaluated,
                                rescheduled = stats.rescheduled,
                                disabled = stats.disabled,
                                failed = stats.failed,
                                "controller sweep finished"
                            ),
                            Err(e) => error!(error = %e, "controller sweep aborted"),
                        }
                    }
                    _ = controller.shutdown.cancelled() => {
                        info!("rescheduling controller stopping");
                        break;
                    }
                }
            }
        });
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// One pass over all enabled jobs, in parallel batches. Individual
    /// failures are logged and do not abort the sweep.
    pub async fn sweep(
        &self,
        commands: &dyn ScheduleCommands,
    ) -> Result<SweepStats, RuntimeError> {
        let mut stats = SweepStats::default();
        if !self.config.enabled {
            return Ok(stats);
        }

        let jobs = self.store.list_enabled_jobs().await.map_err(RuntimeError::Store)?;
        stats.evaluated = jobs.len();

        for batch in jobs.chunks(self.config.batch_size.max(1)) {
            let results = join_all(
                batch
                    .iter()
                    .map(|job| self.evaluate_job(job, commands)),
            )
            .await;

            for (job, result) in batch.iter().zip(results) {
                match result {
                    Ok(RuleOutcome::Rescheduled) => stats.rescheduled += 1,
                    Ok(RuleOutcome::Disabled) => stats.disabled += 1,
                    Ok(RuleOutcome::Kept) => {}
                    Err(e) => {
                        error!(job_id = %job.id, error = %e, "sweep evaluation failed");
                        stats.failed += 1;
                    }
                }
            }
        }
        Ok(stats)
    }

    async fn evaluate_job(
        &self,
        job: &Job,
        commands: &dyn ScheduleCommands,
    ) -> Result<RuleOutcome, RuntimeError> {
        let history = self
            .store
            .recent_executions(job.id, MAX_HISTORY_WINDOW)
            .await?;
        let metrics = JobMetrics::compute(&history, job.per_attempt_timeout_ms);

        let Some(rule) = evaluate_rules(&metrics, job.per_attempt_timeout_ms) else {
            return Ok(RuleOutcome::Kept);
        };

        match rule.action {
            RuleAction::Keep => Ok(RuleOutcome::Kept),
            RuleAction::Disable => {
                info!(
                    job_id = %job.id,
                    rule = rule.name,
                    recent_failures = metrics.recent_failures,
                    "disabling job"
                );
                commands.on_job_disabled(job.id).await?;
                Ok(RuleOutcome::Disabled)
            }
            RuleAction::Extend(factor) => {
                let Some(new_expression) = extend_cron_interval(&job.cron_expression, factor)
                else {
                    return Ok(RuleOutcome::Kept);
                };
                let now = self.clock.now();
                if let Err(e) = CronEvaluator::validate(&new_expression, now) {
                    warn!(
                        job_id = %job.id,
                        rewritten = %new_expression,
                        error = %e,
                        "rewritten expression does not parse, keeping schedule"
                    );
                    return Ok(RuleOutcome::Kept);
                }

                let change = ScheduleChange::new(
                    job.id,
                    &job.cron_expression,
                    &new_expression,
                    format!("auto:{}", rule.name),
                    CONTROLLER_AUTHOR,
                    now,
                );
                self.store.append_schedule_change(&change).await?;

                // Persist first so the command path sees the rewrite as
                // already audited and only re-derives the timer.
                let mut updated = job.clone();
                updated.cron_expression = new_expression.clone();
                updated.updated_at = now;
                self.store.update_job(&updated).await?;
                commands.on_job_updated(updated).await?;

                info!(
                    job_id = %job.id,
                    rule = rule.name,
                    old = %job.cron_expression,
                    new = %new_expression,
                    "schedule extended"
                );
                self.publisher.publish(SchedulerEvent::ScheduleChanged(
                    EventPayload::for_job(job, now)
                        .with_expressions(&job.cron_expression, &new_expression),
                ));
                Ok(RuleOutcome::Rescheduled)
            }
        }
    }
}
