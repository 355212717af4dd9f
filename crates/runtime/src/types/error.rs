//! Error types for the scheduler core.

use thiserror::Error;

use super::JobId;

/// Top-level runtime error, aggregating every subsystem.
#[derive(Error, Debug, Clone)]
pub enum RuntimeError {
    #[error("cron error: {0}")]
    Cron(#[from] CronError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("http error: {0}")]
    Invoke(#[from] InvokeError),

    #[error("worker pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Cron expression or timezone failures.
#[derive(Error, Debug, Clone)]
pub enum CronError {
    #[error("invalid cron expression `{expression}`: {reason}")]
    InvalidExpression { expression: String, reason: String },

    #[error("unknown timezone: {0}")]
    InvalidTimezone(String),
}

/// Transport-level HTTP failures. A received response, whatever its status
/// code, is never an `InvokeError`.
#[derive(Error, Debug, Clone)]
pub enum InvokeError {
    #[error("no response from {url}: {reason}")]
    NoResponse { url: String, reason: String },

    #[error("request to {url} timed out after {timeout_ms}ms")]
    Timeout { url: String, timeout_ms: u64 },

    #[error("invalid request: {0}")]
    RequestInvalid(String),
}

impl InvokeError {
    /// Stable machine-readable kind, persisted in execution error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            InvokeError::NoResponse { .. } => "NO_RESPONSE",
            InvokeError::Timeout { .. } => "TIMEOUT",
            InvokeError::RequestInvalid(_) => "REQUEST_INVALID",
        }
    }
}

/// Persistence failures.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("row not found: {0}")]
    NotFound(String),
}

/// Worker pool admission failures.
#[derive(Error, Debug, Clone)]
pub enum PoolError {
    #[error("worker queue at capacity ({capacity}); firing dropped")]
    QueueOverflow { capacity: usize },

    #[error("worker pool is shutting down")]
    ShuttingDown,
}

/// Failures surfaced by the lifecycle orchestrator's command interface.
#[derive(Error, Debug, Clone)]
pub enum LifecycleError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("invalid job definition: {0}")]
    InvalidJob(String),

    #[error("firing cancelled: {0}")]
    Cancelled(String),

    #[error(transparent)]
    Cron(#[from] CronError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invoke_error_kinds() {
        let no_resp = InvokeError::NoResponse {
            url: "https://example.com".into(),
            reason: "connection refused".into(),
        };
        assert_eq!(no_resp.kind(), "NO_RESPONSE");

        let timeout = InvokeError::Timeout {
            url: "https://example.com".into(),
            timeout_ms: 5_000,
        };
        assert_eq!(timeout.kind(), "TIMEOUT");
        assert!(timeout.to_string().contains("5000ms"));

        assert_eq!(
            InvokeError::RequestInvalid("bad header".into()).kind(),
            "REQUEST_INVALID"
        );
    }

    #[test]
    fn errors_convert_to_runtime_error() {
        let err: RuntimeError = CronError::InvalidTimezone("Mars/Olympus".into()).into();
        assert!(matches!(err, RuntimeError::Cron(_)));

        let err: RuntimeError = StoreError::Sqlite("locked".into()).into();
        assert!(matches!(err, RuntimeError::Store(_)));
    }

    #[test]
    fn lifecycle_not_found_names_the_job() {
        let id = JobId::new();
        let err = LifecycleError::NotFound(id);
        assert!(err.to_string().contains(&id.to_string()));
    }
}
