//! Event types for the critique event system
//!
//! Provides the shared progress event definitions and the `EventBus` that
//! carries them to in-process subscribers (the SSE endpoint, tests, metrics).
//!
//! The durable record of a job's progress is the store's event log; the bus is
//! a lossy live view of the same transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Which kind of work unit an event refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Single-image analysis
    Single,
    /// Multi-image group analysis
    Group,
}

/// Critique event types
///
/// Events are broadcast via EventBus and serialized for SSE transmission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CritiqueEvent {
    /// A job or group job row was created and its first stage dispatched
    JobCreated {
        job_id: Uuid,
        job_kind: JobKind,
        timestamp: DateTime<Utc>,
    },

    /// A stage began for the given job
    StageStarted {
        job_id: Uuid,
        job_kind: JobKind,
        stage: String,
        /// Progress floor of the stage (0-100)
        progress: u8,
        timestamp: DateTime<Utc>,
    },

    /// A stage finished successfully
    StageCompleted {
        job_id: Uuid,
        job_kind: JobKind,
        stage: String,
        progress: u8,
        /// Derived from the matching `started` event, if one exists
        duration_ms: Option<i64>,
        timestamp: DateTime<Utc>,
    },

    /// A stage failed; the job is now terminal
    StageFailed {
        job_id: Uuid,
        job_kind: JobKind,
        stage: String,
        message: String,
        timestamp: DateTime<Utc>,
    },

    /// Job finished and its result was persisted
    JobCompleted {
        job_id: Uuid,
        job_kind: JobKind,
        /// Analysis result id (single) or session id (group)
        result_id: Uuid,
        overall_quality: u8,
        is_partial_result: bool,
        timestamp: DateTime<Utc>,
    },

    /// Job was cancelled by a caller
    JobCancelled {
        job_id: Uuid,
        job_kind: JobKind,
        timestamp: DateTime<Utc>,
    },

    /// Retention purge removed old event rows
    EventsPurged {
        deleted: u64,
        retention_days: u32,
        timestamp: DateTime<Utc>,
    },
}

impl CritiqueEvent {
    /// Event type name, used as the SSE `event:` field
    pub fn event_type(&self) -> &'static str {
        match self {
            CritiqueEvent::JobCreated { .. } => "JobCreated",
            CritiqueEvent::StageStarted { .. } => "StageStarted",
            CritiqueEvent::StageCompleted { .. } => "StageCompleted",
            CritiqueEvent::StageFailed { .. } => "StageFailed",
            CritiqueEvent::JobCompleted { .. } => "JobCompleted",
            CritiqueEvent::JobCancelled { .. } => "JobCancelled",
            CritiqueEvent::EventsPurged { .. } => "EventsPurged",
        }
    }

    /// Job id the event refers to, if any
    pub fn job_id(&self) -> Option<Uuid> {
        match self {
            CritiqueEvent::JobCreated { job_id, .. }
            | CritiqueEvent::StageStarted { job_id, .. }
            | CritiqueEvent::StageCompleted { job_id, .. }
            | CritiqueEvent::StageFailed { job_id, .. }
            | CritiqueEvent::JobCompleted { job_id, .. }
            | CritiqueEvent::JobCancelled { job_id, .. } => Some(*job_id),
            CritiqueEvent::EventsPurged { .. } => None,
        }
    }
}

/// Central event distribution bus
///
/// Wraps a tokio broadcast channel. Cloning the bus shares the channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CritiqueEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// # Examples
    ///
    /// ```
    /// use critique_common::events::EventBus;
    ///
    /// let event_bus = EventBus::new(100);
    /// assert_eq!(event_bus.capacity(), 100);
    /// ```
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    ///
    /// Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<CritiqueEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: CritiqueEvent,
    ) -> Result<usize, broadcast::error::SendError<CritiqueEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: CritiqueEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_emitted_event() {
        let bus = EventBus::new(10);
        let mut rx = bus.subscribe();
        let job_id = Uuid::new_v4();

        bus.emit_lossy(CritiqueEvent::JobCreated {
            job_id,
            job_kind: JobKind::Single,
            timestamp: Utc::now(),
        });

        let received = rx.recv().await.unwrap();
        assert_eq!(received.job_id(), Some(job_id));
        assert_eq!(received.event_type(), "JobCreated");
    }

    #[test]
    fn test_emit_without_subscribers_is_error_but_lossy_is_not() {
        let bus = EventBus::new(10);
        let event = CritiqueEvent::JobCancelled {
            job_id: Uuid::new_v4(),
            job_kind: JobKind::Group,
            timestamp: Utc::now(),
        };
        assert!(bus.emit(event.clone()).is_err());
        bus.emit_lossy(event);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_serialized_event_is_tagged() {
        let event = CritiqueEvent::StageFailed {
            job_id: Uuid::nil(),
            job_kind: JobKind::Group,
            stage: "ai".to_string(),
            message: "missing credentials".to_string(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "StageFailed");
        assert_eq!(json["job_kind"], "group");
        assert_eq!(json["stage"], "ai");
    }
}
