//! Durable persistence for jobs, executions, and schedule changes, backed by
//! SQLite.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::Connection;

use crate::types::{
    Execution, ExecutionId, ExecutionStatus, Job, JobId, JobLifecycleStatus, ScheduleChange,
    StoreError,
};

/// Upper bound on the history window served by [`ExecutionStore::recent_executions`].
pub const MAX_HISTORY_WINDOW: usize = 100;

/// The combined terminal write: one execution reaching SUCCESS or FAILED
/// together with its parent job's derived state. Applied atomically.
#[derive(Debug, Clone)]
pub struct TerminalUpdate {
    pub execution_id: ExecutionId,
    pub job_id: JobId,
    pub status: ExecutionStatus,
    pub completed_at: DateTime<Utc>,
    pub response_status_code: Option<u16>,
    pub response_body: Option<String>,
    pub error_message: Option<String>,
    pub duration_ms: u64,
    pub attempt_number: u32,
    pub next_fire_at: Option<DateTime<Utc>>,
}

impl TerminalUpdate {
    pub fn job_status(&self) -> JobLifecycleStatus {
        match self.status {
            ExecutionStatus::Success => JobLifecycleStatus::Success,
            _ => JobLifecycleStatus::Failed,
        }
    }
}

/// Narrow persistence interface the core depends on. Every operation is
/// atomic.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// All enabled jobs, used for boot-time rehydration and controller sweeps.
    async fn list_enabled_jobs(&self) -> Result<Vec<Job>, StoreError>;

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, StoreError>;

    async fn insert_job(&self, job: &Job) -> Result<(), StoreError>;

    /// Replace a job row. `NotFound` if it does not exist.
    async fn update_job(&self, job: &Job) -> Result<(), StoreError>;

    /// Returns `false` if the job did not exist.
    async fn delete_job(&self, job_id: JobId) -> Result<bool, StoreError>;

    /// The firing-start write: `lifecycle_status = running`, `last_fired_at`.
    async fn mark_job_running(
        &self,
        job_id: JobId,
        fired_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Persist a fresh execution in `running` state.
    async fn insert_execution(&self, execution: &Execution) -> Result<(), StoreError>;

    /// Apply the execution's terminal state and the parent job's
    /// `lifecycle_status`/`next_fire_at` in a single transaction.
    async fn complete_execution(&self, update: &TerminalUpdate) -> Result<(), StoreError>;

    async fn append_schedule_change(&self, change: &ScheduleChange) -> Result<(), StoreError>;

    /// Last `limit` executions for a job, newest first. `limit` is clamped to
    /// [`MAX_HISTORY_WINDOW`].
    async fn recent_executions(
        &self,
        job_id: JobId,
        limit: usize,
    ) -> Result<Vec<Execution>, StoreError>;
}

/// SQLite-backed store. One writer connection serialises all mutations; reads
/// round-robin over a small reader set (WAL allows concurrent readers).
pub struct SqliteExecutionStore {
    writer: tokio::sync::Mutex<Connection>,
    readers: Vec<tokio::sync::Mutex<Connection>>,
    next_reader: AtomicUsize,
}

impl SqliteExecutionStore {
    /// Open (or create) the store at `path` with up to `connection_limit`
    /// connections.
    pub fn open(path: &Path, connection_limit: usize) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Sqlite(format!("create dir: {e}")))?;
            }
        }

        let writer = Self::open_connection(path)?;
        Self::init_schema(&writer)?;

        let reader_count = connection_limit.saturating_sub(1);
        let mut readers = Vec::with_capacity(reader_count);
        for _ in 0..reader_count {
            readers.push(tokio::sync::Mutex::new(Self::open_connection(path)?));
        }

        Ok(Self {
            writer: tokio::sync::Mutex::new(writer),
            readers,
            next_reader: AtomicUsize::new(0),
        })
    }

    /// Open an in-memory store (single connection; useful for tests).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        conn.pragma_update(None, "foreign_keys", true)
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        Self::init_schema(&conn)?;
        Ok(Self {
            writer: tokio::sync::Mutex::new(conn),
            readers: Vec::new(),
            next_reader: AtomicUsize::new(0),
        })
    }

    fn open_connection(path: &Path) -> Result<Connection, StoreError> {
        let conn = Connection::open(path).map_err(|e| StoreError::Sqlite(e.to_string()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        conn.pragma_update(None, "foreign_keys", true)
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        Ok(conn)
    }

    fn reader(&self) -> &tokio::sync::Mutex<Connection> {
        if self.readers.is_empty() {
            return &self.writer;
        }
        let idx = self.next_reader.fetch_add(1, Ordering::Relaxed) % self.readers.len();
        &self.readers[idx]
    }

    fn init_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            );

            INSERT OR IGNORE INTO schema_version (version) VALUES (1);

            CREATE TABLE IF NOT EXISTS jobs (
                job_id             TEXT PRIMARY KEY,
                name               TEXT NOT NULL,
                description        TEXT,
                cron_expr          TEXT NOT NULL,
                timezone           TEXT NOT NULL,
                url                TEXT NOT NULL,
                method             TEXT NOT NULL,
                headers_json       TEXT NOT NULL DEFAULT '{}',
                body               TEXT,
                query_json         TEXT NOT NULL DEFAULT '{}',
                enabled            INTEGER NOT NULL DEFAULT 1,
                retry_budget       INTEGER NOT NULL DEFAULT 3,
                attempt_timeout_ms INTEGER NOT NULL,
                owner              TEXT NOT NULL,
                created_at         TEXT NOT NULL,
                updated_at         TEXT NOT NULL,
                lifecycle_status   TEXT NOT NULL DEFAULT 'pending',
                last_fired_at      TEXT,
                next_fire_at       TEXT
            );

            CREATE TABLE IF NOT EXISTS executions (
                execution_id    TEXT PRIMARY KEY,
                job_id          TEXT NOT NULL,
                started_at      TEXT NOT NULL,
                completed_at    TEXT,
                status          TEXT NOT NULL,
                response_status INTEGER,
                response_body   TEXT,
                error           TEXT,
                duration_ms     INTEGER,
                attempt_number  INTEGER NOT NULL DEFAULT 1,
                FOREIGN KEY (job_id) REFERENCES jobs(job_id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS schedule_changes (
                change_id  TEXT PRIMARY KEY,
                job_id     TEXT NOT NULL,
                old_expr   TEXT NOT NULL,
                new_expr   TEXT NOT NULL,
                reason     TEXT NOT NULL,
                author     TEXT NOT NULL,
                changed_at TEXT NOT NULL,
                FOREIGN KEY (job_id) REFERENCES jobs(job_id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_executions_job_started
                ON executions(job_id, started_at DESC);
            CREATE INDEX IF NOT EXISTS idx_schedule_changes_job_changed
                ON schedule_changes(job_id, changed_at DESC);",
        )
        .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
impl SqliteExecutionStore {
    /// Test support: number of audit rows for a job.
    pub async fn count_schedule_changes(&self, job_id: JobId) -> i64 {
        let conn = self.reader().lock().await;
        conn.query_row(
            "SELECT COUNT(*) FROM schedule_changes WHERE job_id = ?1",
            rusqlite::params![job_id.to_string()],
            |row| row.get(0),
        )
        .unwrap_or(0)
    }
}

const JOB_COLUMNS: &str = "job_id, name, description, cron_expr, timezone, url, method, \
     headers_json, body, query_json, enabled, retry_budget, attempt_timeout_ms, owner, \
     created_at, updated_at, lifecycle_status, last_fired_at, next_fire_at";

#[async_trait]
impl ExecutionStore for SqliteExecutionStore {
    async fn list_enabled_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let conn = self.reader().lock().await;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM jobs WHERE enabled = 1 ORDER BY created_at"
            ))
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;

        let rows = stmt
            .query_map([], row_to_job)
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;

        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row.map_err(|e| StoreError::Sqlite(e.to_string()))??);
        }
        Ok(jobs)
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        let conn = self.reader().lock().await;
        let mut stmt = conn
            .prepare(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = ?1"))
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;

        let result = stmt
            .query_row(rusqlite::params![job_id.to_string()], row_to_job)
            .optional()
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;

        match result {
            Some(Ok(job)) => Ok(Some(job)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    async fn insert_job(&self, job: &Job) -> Result<(), StoreError> {
        let headers_json = serde_json::to_string(&job.headers)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let query_json = serde_json::to_string(&job.query_params)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let conn = self.writer.lock().await;
        conn.execute(
            &format!(
                "INSERT INTO jobs ({JOB_COLUMNS})
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19)"
            ),
            rusqlite::params![
                job.id.to_string(),
                job.name,
                job.description,
                job.cron_expression,
                job.timezone,
                job.url,
                job.method.to_string(),
                headers_json,
                job.body,
                query_json,
                job.enabled as i32,
                job.retry_budget as i64,
                job.per_attempt_timeout_ms as i64,
                job.owner,
                job.created_at.to_rfc3339(),
                job.updated_at.to_rfc3339(),
                job.lifecycle_status.to_string(),
                job.last_fired_at.map(|t| t.to_rfc3339()),
                job.next_fire_at.map(|t| t.to_rfc3339()),
            ],
        )
        .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        Ok(())
    }

    async fn update_job(&self, job: &Job) -> Result<(), StoreError> {
        let headers_json = serde_json::to_string(&job.headers)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let query_json = serde_json::to_string(&job.query_params)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let conn = self.writer.lock().await;
        let rows = conn
            .execute(
                "UPDATE jobs SET
                    name = ?2, description = ?3, cron_expr = ?4, timezone = ?5, url = ?6,
                    method = ?7, headers_json = ?8, body = ?9, query_json = ?10,
                    enabled = ?11, retry_budget = ?12, attempt_timeout_ms = ?13, owner = ?14,
                    updated_at = ?15, lifecycle_status = ?16, last_fired_at = ?17,
                    next_fire_at = ?18
                 WHERE job_id = ?1",
                rusqlite::params![
                    job.id.to_string(),
                    job.name,
                    job.description,
                    job.cron_expression,
                    job.timezone,
                    job.url,
                    job.method.to_string(),
                    headers_json,
                    job.body,
                    query_json,
                    job.enabled as i32,
                    job.retry_budget as i64,
                    job.per_attempt_timeout_ms as i64,
                    job.owner,
                    job.updated_at.to_rfc3339(),
                    job.lifecycle_status.to_string(),
                    job.last_fired_at.map(|t| t.to_rfc3339()),
                    job.next_fire_at.map(|t| t.to_rfc3339()),
                ],
            )
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        if rows == 0 {
            return Err(StoreError::NotFound(job.id.to_string()));
        }
        Ok(())
    }

    async fn delete_job(&self, job_id: JobId) -> Result<bool, StoreError> {
        let conn = self.writer.lock().await;
        let rows = conn
            .execute(
                "DELETE FROM jobs WHERE job_id = ?1",
                rusqlite::params![job_id.to_string()],
            )
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        Ok(rows > 0)
    }

    async fn mark_job_running(
        &self,
        job_id: JobId,
        fired_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.writer.lock().await;
        let rows = conn
            .execute(
                "UPDATE jobs
                 SET lifecycle_status = 'running', last_fired_at = ?2, updated_at = ?3
                 WHERE job_id = ?1",
                rusqlite::params![
                    job_id.to_string(),
                    fired_at.to_rfc3339(),
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        if rows == 0 {
            return Err(StoreError::NotFound(job_id.to_string()));
        }
        Ok(())
    }

    async fn insert_execution(&self, execution: &Execution) -> Result<(), StoreError> {
        let conn = self.writer.lock().await;
        conn.execute(
            "INSERT INTO executions
                (execution_id, job_id, started_at, completed_at, status,
                 response_status, response_body, error, duration_ms, attempt_number)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
            rusqlite::params![
                execution.id.to_string(),
                execution.job_id.to_string(),
                execution.started_at.to_rfc3339(),
                execution.completed_at.map(|t| t.to_rfc3339()),
                execution.status.to_string(),
                execution.response_status_code.map(|s| s as i64),
                execution.response_body,
                execution.error_message,
                execution.duration_ms.map(|v| v as i64),
                execution.attempt_number as i64,
            ],
        )
        .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        Ok(())
    }

    async fn complete_execution(&self, update: &TerminalUpdate) -> Result<(), StoreError> {
        let mut conn = self.writer.lock().await;
        let tx = conn
            .transaction()
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;

        let exec_rows = tx
            .execute(
                "UPDATE executions
                 SET completed_at = ?2, status = ?3, response_status = ?4,
                     response_body = ?5, error = ?6, duration_ms = ?7, attempt_number = ?8
                 WHERE execution_id = ?1",
                rusqlite::params![
                    update.execution_id.to_string(),
                    update.completed_at.to_rfc3339(),
                    update.status.to_string(),
                    update.response_status_code.map(|s| s as i64),
                    update.response_body,
                    update.error_message,
                    update.duration_ms as i64,
                    update.attempt_number as i64,
                ],
            )
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        if exec_rows == 0 {
            return Err(StoreError::NotFound(update.execution_id.to_string()));
        }

        let job_rows = tx
            .execute(
                "UPDATE jobs SET lifecycle_status = ?2, next_fire_at = ?3, updated_at = ?4
                 WHERE job_id = ?1",
                rusqlite::params![
                    update.job_id.to_string(),
                    update.job_status().to_string(),
                    update.next_fire_at.map(|t| t.to_rfc3339()),
                    update.completed_at.to_rfc3339(),
                ],
            )
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        if job_rows == 0 {
            // Dropping the transaction rolls the execution update back.
            return Err(StoreError::NotFound(update.job_id.to_string()));
        }

        tx.commit().map_err(|e| StoreError::Sqlite(e.to_string()))
    }

    async fn append_schedule_change(&self, change: &ScheduleChange) -> Result<(), StoreError> {
        let conn = self.writer.lock().await;
        conn.execute(
            "INSERT INTO schedule_changes
                (change_id, job_id, old_expr, new_expr, reason, author, changed_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7)",
            rusqlite::params![
                change.id.to_string(),
                change.job_id.to_string(),
                change.old_expression,
                change.new_expression,
                change.reason,
                change.author,
                change.changed_at.to_rfc3339(),
            ],
        )
        .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        Ok(())
    }

    async fn recent_executions(
        &self,
        job_id: JobId,
        limit: usize,
    ) -> Result<Vec<Execution>, StoreError> {
        let limit = limit.min(MAX_HISTORY_WINDOW);
        let conn = self.reader().lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT execution_id, job_id, started_at, completed_at, status,
                        response_status, response_body, error, duration_ms, attempt_number
                 FROM executions
                 WHERE job_id = ?1
                 ORDER BY started_at DESC
                 LIMIT ?2",
            )
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;

        let rows = stmt
            .query_map(
                rusqlite::params![job_id.to_string(), limit as i64],
                row_to_execution,
            )
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;

        let mut executions = Vec::new();
        for row in rows {
            executions.push(row.map_err(|e| StoreError::Sqlite(e.to_string()))??);
        }
        Ok(executions)
    }
}

// ── Row-mapping helpers ───────────────────────────────────────────────

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Job, StoreError>> {
    let job_id_str: String = row.get(0)?;
    let name: String = row.get(1)?;
    let description: Option<String> = row.get(2)?;
    let cron_expr: String = row.get(3)?;
    let timezone: String = row.get(4)?;
    let url: String = row.get(5)?;
    let method_str: String = row.get(6)?;
    let headers_json: String = row.get(7)?;
    let body: Option<String> = row.get(8)?;
    let query_json: String = row.get(9)?;
    let enabled: i32 = row.get(10)?;
    let retry_budget: i64 = row.get(11)?;
    let attempt_timeout_ms: i64 = row.get(12)?;
    let owner: String = row.get(13)?;
    let created_str: String = row.get(14)?;
    let updated_str: String = row.get(15)?;
    let status_str: String = row.get(16)?;
    let last_fired_str: Option<String> = row.get(17)?;
    let next_fire_str: Option<String> = row.get(18)?;

    Ok((|| -> Result<Job, StoreError> {
        Ok(Job {
            id: job_id_str
                .parse()
                .map_err(|e: uuid::Error| StoreError::Serialization(e.to_string()))?,
            name,
            description,
            cron_expression: cron_expr,
            timezone,
            url,
            method: method_str.parse().map_err(StoreError::Serialization)?,
            headers: serde_json::from_str(&headers_json)
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
            body,
            query_params: serde_json::from_str(&query_json)
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
            enabled: enabled != 0,
            retry_budget: retry_budget as u32,
            per_attempt_timeout_ms: attempt_timeout_ms as u64,
            owner,
            created_at: parse_instant(&created_str)?,
            updated_at: parse_instant(&updated_str)?,
            lifecycle_status: status_str.parse().map_err(StoreError::Serialization)?,
            last_fired_at: last_fired_str.as_deref().map(parse_instant).transpose()?,
            next_fire_at: next_fire_str.as_deref().map(parse_instant).transpose()?,
        })
    })())
}

fn row_to_execution(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Execution, StoreError>> {
    let execution_id_str: String = row.get(0)?;
    let job_id_str: String = row.get(1)?;
    let started_str: String = row.get(2)?;
    let completed_str: Option<String> = row.get(3)?;
    let status_str: String = row.get(4)?;
    let response_status: Option<i64> = row.get(5)?;
    let response_body: Option<String> = row.get(6)?;
    let error: Option<String> = row.get(7)?;
    let duration_ms: Option<i64> = row.get(8)?;
    let attempt_number: i64 = row.get(9)?;

    Ok((|| -> Result<Execution, StoreError> {
        Ok(Execution {
            id: execution_id_str
                .parse()
                .map_err(|e: uuid::Error| StoreError::Serialization(e.to_string()))?,
            job_id: job_id_str
                .parse()
                .map_err(|e: uuid::Error| StoreError::Serialization(e.to_string()))?,
            started_at: parse_instant(&started_str)?,
            completed_at: completed_str.as_deref().map(parse_instant).transpose()?,
            status: status_str.parse().map_err(StoreError::Serialization)?,
            response_status_code: response_status.map(|s| s as u16),
            response_body,
            error_message: error,
            duration_ms: duration_ms.map(|v| v as u64),
            attempt_number: attempt_number as u32,
        })
    })())
}

fn parse_instant(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Extension trait so we can use `optional()` on rusqlite queries.
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>, rusqlite::Error>;
}

impl<T> OptionalExt<T> for Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>, rusqlite::Error> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
