//! Shared types for the webcron scheduler core.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

pub mod error;

pub use error::*;

/// Bounds on a job's retry budget (total HTTP attempts per firing).
pub const RETRY_BUDGET_MIN: u32 = 1;
pub const RETRY_BUDGET_MAX: u32 = 10;

/// Bounds on a job's per-attempt HTTP deadline.
pub const ATTEMPT_TIMEOUT_MIN_MS: u64 = 1_000;
pub const ATTEMPT_TIMEOUT_MAX_MS: u64 = 300_000;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

uuid_id! {
    /// Unique identifier for a scheduled job.
    JobId
}

uuid_id! {
    /// Unique identifier for a single execution (one firing of a job).
    ExecutionId
}

uuid_id! {
    /// Unique identifier for a schedule-change audit record.
    ScheduleChangeId
}

/// HTTP method of a job's target invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    #[default]
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_reqwest(&self) -> reqwest::Method {
        match self {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for HttpMethod {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "PATCH" => Ok(HttpMethod::Patch),
            "DELETE" => Ok(HttpMethod::Delete),
            other => Err(format!("unknown HTTP method: {other}")),
        }
    }
}

/// Lifecycle status a job row carries, reflecting its last-completed firing.
///
/// Advisory under overlapping firings; execution rows are the authoritative
/// trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum JobLifecycleStatus {
    /// Never fired yet.
    #[default]
    Pending,
    /// A firing is currently in flight.
    Running,
    /// The last completed firing succeeded.
    Success,
    /// The last completed firing failed.
    Failed,
}

impl fmt::Display for JobLifecycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobLifecycleStatus::Pending => "pending",
            JobLifecycleStatus::Running => "running",
            JobLifecycleStatus::Success => "success",
            JobLifecycleStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobLifecycleStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobLifecycleStatus::Pending),
            "running" => Ok(JobLifecycleStatus::Running),
            "success" => Ok(JobLifecycleStatus::Success),
            "failed" => Ok(JobLifecycleStatus::Failed),
            other => Err(format!("unknown job lifecycle status: {other}")),
        }
    }
}

/// Status of a single execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Running,
    Success,
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(ExecutionStatus::Running),
            "success" => Ok(ExecutionStatus::Success),
            "failed" => Ok(ExecutionStatus::Failed),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// A scheduled job: a cron expression plus the HTTP envelope to fire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// 5-field cron expression (minute, hour, day-of-month, month, day-of-week).
    pub cron_expression: String,
    /// IANA timezone name the expression is evaluated in.
    pub timezone: String,
    pub url: String,
    pub method: HttpMethod,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub query_params: HashMap<String, String>,
    pub enabled: bool,
    /// Total HTTP attempts per firing, 1..=10.
    pub retry_budget: u32,
    /// Deadline for each HTTP attempt in milliseconds, 1s..=5min.
    pub per_attempt_timeout_ms: u64,
    pub owner: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub lifecycle_status: JobLifecycleStatus,
    #[serde(default)]
    pub last_fired_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_fire_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create an enabled job with default retry budget and timeout.
    pub fn new(
        name: impl Into<String>,
        cron_expression: impl Into<String>,
        timezone: impl Into<String>,
        url: impl Into<String>,
        method: HttpMethod,
        owner: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            name: name.into(),
            description: None,
            cron_expression: cron_expression.into(),
            timezone: timezone.into(),
            url: url.into(),
            method,
            headers: HashMap::new(),
            body: None,
            query_params: HashMap::new(),
            enabled: true,
            retry_budget: 3,
            per_attempt_timeout_ms: 30_000,
            owner: owner.into(),
            created_at: now,
            updated_at: now,
            lifecycle_status: JobLifecycleStatus::Pending,
            last_fired_at: None,
            next_fire_at: None,
        }
    }

    /// Check the envelope invariants (retry budget and timeout bounds).
    pub fn validate(&self) -> Result<(), String> {
        if !(RETRY_BUDGET_MIN..=RETRY_BUDGET_MAX).contains(&self.retry_budget) {
            return Err(format!(
                "retry_budget {} outside {}..={}",
                self.retry_budget, RETRY_BUDGET_MIN, RETRY_BUDGET_MAX
            ));
        }
        if !(ATTEMPT_TIMEOUT_MIN_MS..=ATTEMPT_TIMEOUT_MAX_MS).contains(&self.per_attempt_timeout_ms)
        {
            return Err(format!(
                "per_attempt_timeout_ms {} outside {}..={}",
                self.per_attempt_timeout_ms, ATTEMPT_TIMEOUT_MIN_MS, ATTEMPT_TIMEOUT_MAX_MS
            ));
        }
        if self.url.is_empty() {
            return Err("target url is empty".to_string());
        }
        Ok(())
    }
}

/// One firing of a job, persisted as the authoritative execution trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub job_id: JobId,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    pub response_status_code: Option<u16>,
    pub response_body: Option<String>,
    pub error_message: Option<String>,
    pub duration_ms: Option<u64>,
    pub attempt_number: u32,
}

impl Execution {
    /// A fresh execution row in `Running` state, attempt 1.
    pub fn started(job_id: JobId, started_at: DateTime<Utc>) -> Self {
        Self {
            id: ExecutionId::new(),
            job_id,
            started_at,
            completed_at: None,
            status: ExecutionStatus::Running,
            response_status_code: None,
            response_body: None,
            error_message: None,
            duration_ms: None,
            attempt_number: 1,
        }
    }
}

/// Append-only audit record of a cron expression rewrite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleChange {
    pub id: ScheduleChangeId,
    pub job_id: JobId,
    pub old_expression: String,
    pub new_expression: String,
    /// Free text; controller-originated changes use the `auto:` prefix.
    pub reason: String,
    pub author: String,
    pub changed_at: DateTime<Utc>,
}

impl ScheduleChange {
    pub fn new(
        job_id: JobId,
        old_expression: impl Into<String>,
        new_expression: impl Into<String>,
        reason: impl Into<String>,
        author: impl Into<String>,
        changed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ScheduleChangeId::new(),
            job_id,
            old_expression: old_expression.into(),
            new_expression: new_expression.into(),
            reason: reason.into(),
            author: author.into(),
            changed_at,
        }
    }
}

/// Terminal outcome of one firing, returned to manual-trigger callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub execution_id: ExecutionId,
    pub job_id: JobId,
    pub status: ExecutionStatus,
    pub response_status_code: Option<u16>,
    pub error_message: Option<String>,
    pub duration_ms: u64,
    pub attempt_number: u32,
}
