//! Scheduling subsystems: cron evaluation, timers, the worker pool, the
//! execution driver, and the auto-rescheduling controller.

pub mod controller;
pub mod cron;
pub mod driver;
pub mod events;
pub mod registry;
pub mod store;
pub mod worker_pool;

pub use controller::{
    extend_cron_interval, ControllerConfig, JobMetrics, ReschedulingController, RuleOutcome,
    ScheduleCommands, SweepStats,
};
pub use cron::{Clock, CronEvaluator, CronValidation, SystemClock};
pub use driver::{backoff_delay, filter_response_body, ExecutionDriver};
pub use events::{
    BroadcastPublisher, EventPayload, EventPublisher, NullPublisher, SchedulerEvent,
};
pub use registry::JobRegistry;
pub use store::{ExecutionStore, SqliteExecutionStore, TerminalUpdate, MAX_HISTORY_WINDOW};
pub use worker_pool::{Firing, FiringHandler, PoolStats, WorkerPool};
