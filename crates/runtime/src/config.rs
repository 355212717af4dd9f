//! Typed runtime configuration.
//!
//! Every recognised key has a default; values can be overridden through
//! `WEBCRON_*` environment variables.

use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error, Clone)]
pub enum ConfigError {
    #[error("invalid configuration value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

/// Runtime configuration for the scheduler core.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Worker pool concurrency.
    pub max_concurrent_executions: usize,
    /// Size of the SQLite reader connection set.
    pub database_connection_limit: usize,
    /// Store location; `:memory:` for an in-memory store.
    pub database_path: PathBuf,
    /// Arms the rescheduling controller.
    pub auto_rescheduling_enabled: bool,
    /// How many jobs a controller sweep evaluates in parallel.
    pub rescheduling_batch_size: usize,
    /// Controller sweep period.
    pub rescheduling_interval: Duration,
    /// How long shutdown waits for in-flight firings to finish.
    pub shutdown_grace: Duration,
    /// Per-host ceiling on open sockets in the HTTP invoker.
    pub http_max_sockets_per_host: usize,
    /// Optional bound on the worker queue; `None` = unbounded.
    pub worker_queue_capacity: Option<usize>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let concurrency = 10;
        Self {
            max_concurrent_executions: concurrency,
            database_connection_limit: concurrency * 2,
            database_path: PathBuf::from("webcron.db"),
            auto_rescheduling_enabled: true,
            rescheduling_batch_size: 50,
            rescheduling_interval: Duration::from_secs(3600),
            shutdown_grace: Duration::from_millis(30_000),
            http_max_sockets_per_host: 50,
            worker_queue_capacity: None,
        }
    }
}

impl RuntimeConfig {
    /// Build a configuration from defaults plus `WEBCRON_*` overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = parse_env::<usize>("WEBCRON_MAX_CONCURRENT_EXECUTIONS")? {
            config.max_concurrent_executions = v;
            // Re-derive the default pool size unless it is overridden below.
            config.database_connection_limit = v * 2;
        }
        if let Some(v) = parse_env::<usize>("WEBCRON_DATABASE_CONNECTION_LIMIT")? {
            config.database_connection_limit = v;
        }
        if let Ok(v) = env::var("WEBCRON_DATABASE_PATH") {
            config.database_path = PathBuf::from(v);
        }
        if let Some(v) = parse_env::<bool>("WEBCRON_AUTO_RESCHEDULING_ENABLED")? {
            config.auto_rescheduling_enabled = v;
        }
        if let Some(v) = parse_env::<usize>("WEBCRON_RESCHEDULING_BATCH_SIZE")? {
            config.rescheduling_batch_size = v;
        }
        if let Some(v) = parse_env::<u64>("WEBCRON_RESCHEDULING_INTERVAL_SECS")? {
            config.rescheduling_interval = Duration::from_secs(v);
        }
        if let Some(v) = parse_env::<u64>("WEBCRON_SHUTDOWN_GRACE_MS")? {
            config.shutdown_grace = Duration::from_millis(v);
        }
        if let Some(v) = parse_env::<usize>("WEBCRON_HTTP_MAX_SOCKETS_PER_HOST")? {
            config.http_max_sockets_per_host = v;
        }
        if let Some(v) = parse_env::<usize>("WEBCRON_WORKER_QUEUE_CAPACITY")? {
            config.worker_queue_capacity = Some(v);
        }

        config.validate()?;
        Ok(config)
    }

    /// Check value ranges that other subsystems rely on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_executions == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_concurrent_executions".into(),
                reason: "must be at least 1".into(),
            });
        }
        if self.database_connection_limit < self.max_concurrent_executions * 2 {
            return Err(ConfigError::InvalidValue {
                key: "database_connection_limit".into(),
                reason: format!(
                    "must be at least 2x worker concurrency ({})",
                    self.max_concurrent_executions * 2
                ),
            });
        }
        if self.rescheduling_batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "rescheduling_batch_size".into(),
                reason: "must be at least 1".into(),
            });
        }
        if self.http_max_sockets_per_host == 0 {
            return Err(ConfigError::InvalidValue {
                key: "http_max_sockets_per_host".into(),
                reason: "must be at least 1".into(),
            });
        }
        if self.worker_queue_capacity == Some(0) {
            return Err(ConfigError::InvalidValue {
                key: "worker_queue_capacity".into(),
                reason: "bounded queue must hold at least 1 firing".into(),
            });
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                reason: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}
