//! Outbound notification events.
//!
//! Publishing is fire-and-forget: failures are logged and swallowed, and must
//! never affect persistence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::types::{ExecutionStatus, Job, JobId};

/// Payload shared by all event kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventPayload {
    pub job_id: JobId,
    pub job_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_expression: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_expression: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl EventPayload {
    pub fn for_job(job: &Job, timestamp: DateTime<Utc>) -> Self {
        Self {
            job_id: job.id,
            job_name: job.name.clone(),
            status: None,
            error_message: None,
            old_expression: None,
            new_expression: None,
            timestamp,
        }
    }

    pub fn with_status(mut self, status: ExecutionStatus) -> Self {
        self.status = Some(status.to_string());
        self
    }

    pub fn with_error(mut self, error: Option<String>) -> Self {
        self.error_message = error;
        self
    }

    pub fn with_expressions(
        mut self,
        old: impl Into<String>,
        new: impl Into<String>,
    ) -> Self {
        self.old_expression = Some(old.into());
        self.new_expression = Some(new.into());
        self
    }
}

/// Event kinds exposed to the push channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload")]
pub enum SchedulerEvent {
    #[serde(rename = "job.created")]
    JobCreated(EventPayload),
    #[serde(rename = "job.updated")]
    JobUpdated(EventPayload),
    #[serde(rename = "job.deleted")]
    JobDeleted(EventPayload),
    #[serde(rename = "execution.started")]
    ExecutionStarted(EventPayload),
    #[serde(rename = "execution.completed")]
    ExecutionCompleted(EventPayload),
    #[serde(rename = "schedule.changed")]
    ScheduleChanged(EventPayload),
}

impl SchedulerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            SchedulerEvent::JobCreated(_) => "job.created",
            SchedulerEvent::JobUpdated(_) => "job.updated",
            SchedulerEvent::JobDeleted(_) => "job.deleted",
            SchedulerEvent::ExecutionStarted(_) => "execution.started",
            SchedulerEvent::ExecutionCompleted(_) => "execution.completed",
            SchedulerEvent::ScheduleChanged(_) => "schedule.changed",
        }
    }

    pub fn payload(&self) -> &EventPayload {
        match self {
            SchedulerEvent::JobCreated(p)
            | SchedulerEvent::JobUpdated(p)
            | SchedulerEvent::JobDeleted(p)
            | SchedulerEvent::ExecutionStarted(p)
            | SchedulerEvent::ExecutionCompleted(p)
            | SchedulerEvent::ScheduleChanged(p) => p,
        }
    }
}

/// Sink for outbound events.
pub trait EventPublisher: Send + Sync {
    /// Publish one event. Implementations must not block and must not fail
    /// the caller.
    fn publish(&self, event: SchedulerEvent);
}

/// Default publisher fanning events out over a broadcast channel.
pub struct BroadcastPublisher {
    sender: broadcast::Sender<SchedulerEvent>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Attach a new subscriber. Slow subscribers lag and drop events rather
    /// than applying backpressure.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventPublisher for BroadcastPublisher {
    fn publish(&self, event: SchedulerEvent) {
        if let Err(e) = self.sender.send(event) {
            debug!("event dropped, no subscribers: {}", e.0.kind());
        }
    }
}

/// Publisher that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullPublisher;

impl EventPublisher for NullPublisher {
    fn publish(&self, _event: SchedulerEvent) {}
}

/// Captures published events in memory, for assertions in tests.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingPublisher {
    events: parking_lot::Mutex<Vec<SchedulerEvent>>,
}

#[cfg(test)]
impl RecordingPublisher {
    pub fn events(&self) -> Vec<SchedulerEvent> {
        self.events.lock().clone()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(|e| e.kind()).collect()
    }
}

#[cfg(test)]
impl EventPublisher for RecordingPublisher {
    fn publish(&self, event: SchedulerEvent) {
        self.events.lock().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HttpMethod;

    fn test_job() -> Job {
        Job::new(
            "events_test",
            "* * * * *",
            "UTC",
            "https://example.com",
            HttpMethod::Post,
            "owner-1",
        )
    }

    #[tokio::test]
    async fn broadcast_delivers_to_subscribers() {
        let publisher = BroadcastPublisher::default();
        let mut rx = publisher.subscribe();

        let job = test_job();
        publisher.publish(SchedulerEvent::JobCreated(EventPayload::for_job(
            &job,
            Utc::now(),
        )));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind(), "job.created");
        assert_eq!(event.payload().job_id, job.id);
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        let publisher = BroadcastPublisher::default();
        let job = test_job();
        // Must not panic or error.
        publisher.publish(SchedulerEvent::JobDeleted(EventPayload::for_job(
            &job,
            Utc::now(),
        )));
    }

    #[test]
    fn payload_serializes_with_wire_field_names() {
        let job = test_job();
        let payload = EventPayload::for_job(&job, Utc::now())
            .with_status(ExecutionStatus::Failed)
            .with_error(Some("TIMEOUT".into()));
        let event = SchedulerEvent::ExecutionCompleted(payload);

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "execution.completed");
        assert_eq!(json["payload"]["status"], "failed");
        assert_eq!(json["payload"]["error_message"], "TIMEOUT");
        // Absent optionals are omitted from the wire format.
        assert!(json["payload"].get("old_expression").is_none());
    }

    #[test]
    fn schedule_changed_carries_both_expressions() {
        let job = test_job();
        let payload = EventPayload::for_job(&job, Utc::now())
            .with_expressions("5 * * * *", "10 * * * *");
        let event = SchedulerEvent::ScheduleChanged(payload);
        assert_eq!(event.payload().old_expression.as_deref(), Some("5 * * * *"));
        assert_eq!(
            event.payload().new_expression.as_deref(),
            Some("10 * * * *")
        );
    }

    #[test]
    fn recording_publisher_captures_order() {
        let publisher = RecordingPublisher::default();
        let job = test_job();
        publisher.publish(SchedulerEvent::ExecutionStarted(EventPayload::for_job(
            &job,
            Utc::now(),
        )));
        publisher.publish(SchedulerEvent::ExecutionCompleted(EventPayload::for_job(
            &job,
            Utc::now(),
        )));
        assert_eq!(
            publisher.kinds(),
            vec!["execution.started", "execution.completed"]
        );
    }
}
