//! Event log rows
//!
//! One immutable row per stage transition. Names follow
//! `"<domain>/<stage>.<phase>"`, e.g. `analysis/vision.completed`.

use super::job::{JobRef, JobStatus, Stage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Transition phase of a stage event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventPhase {
    Started,
    Completed,
    Failed,
}

impl EventPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventPhase::Started => "started",
            EventPhase::Completed => "completed",
            EventPhase::Failed => "failed",
        }
    }

    /// Completed and failed events close a `started` event
    pub fn is_terminal(&self) -> bool {
        !matches!(self, EventPhase::Started)
    }
}

impl fmt::Display for EventPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(EventPhase::Started),
            "completed" => Ok(EventPhase::Completed),
            "failed" => Ok(EventPhase::Failed),
            other => Err(format!("unknown event phase '{}'", other)),
        }
    }
}

/// Build the namespaced event name
pub fn event_name(subject: JobRef, stage: Stage, phase: EventPhase) -> String {
    format!("{}/{}.{}", subject.domain(), stage, phase)
}

/// Persisted event row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    /// Insertion order; the only ordering used for duration matching
    pub seq: i64,
    pub subject: JobRef,
    pub attempt: u32,
    pub event_name: String,
    pub stage: Stage,
    pub phase: EventPhase,
    pub status: JobStatus,
    pub progress: u8,
    pub message: String,
    pub metadata: serde_json::Value,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Fixed at insert time from the matching `started` event
    pub duration_ms: Option<i64>,
    pub recorded_at: DateTime<Utc>,
}

/// Event to append
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub subject: JobRef,
    pub attempt: u32,
    pub stage: Stage,
    pub phase: EventPhase,
    pub status: JobStatus,
    pub progress: u8,
    pub message: String,
    pub metadata: serde_json::Value,
}

impl NewEvent {
    pub fn started(subject: JobRef, attempt: u32, stage: Stage, progress: u8) -> Self {
        Self {
            subject,
            attempt,
            stage,
            phase: EventPhase::Started,
            status: JobStatus::Processing,
            progress,
            message: format!("{} stage started", stage),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn completed(
        subject: JobRef,
        attempt: u32,
        stage: Stage,
        progress: u8,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            subject,
            attempt,
            stage,
            phase: EventPhase::Completed,
            status: if stage == Stage::Synthesis {
                JobStatus::Completed
            } else {
                JobStatus::Processing
            },
            progress,
            message: format!("{} stage completed", stage),
            metadata,
        }
    }

    pub fn failed(
        subject: JobRef,
        attempt: u32,
        stage: Stage,
        progress: u8,
        message: String,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            subject,
            attempt,
            stage,
            phase: EventPhase::Failed,
            status: JobStatus::Failed,
            progress,
            message,
            metadata,
        }
    }

    pub fn event_name(&self) -> String {
        event_name(self.subject, self.stage, self.phase)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names_are_namespaced() {
        let id = Uuid::new_v4();
        assert_eq!(
            event_name(JobRef::Single(id), Stage::Vision, EventPhase::Completed),
            "analysis/vision.completed"
        );
        assert_eq!(
            event_name(JobRef::Group(id), Stage::Ai, EventPhase::Failed),
            "group-analysis/ai.failed"
        );
    }

    #[test]
    fn test_synthesis_completion_marks_job_completed() {
        let subject = JobRef::Single(Uuid::new_v4());
        let ev = NewEvent::completed(subject, 1, Stage::Synthesis, 100, serde_json::Value::Null);
        assert_eq!(ev.status, JobStatus::Completed);
        let ev = NewEvent::completed(subject, 1, Stage::Vision, 55, serde_json::Value::Null);
        assert_eq!(ev.status, JobStatus::Processing);
    }
}
