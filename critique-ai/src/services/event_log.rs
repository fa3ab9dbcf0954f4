//! Event log service
//!
//! Every job state transition commits in one transaction with the event row
//! that records it, then is broadcast on the [`EventBus`]. The log is the
//! source of truth for progress, durations, stage outputs and resume points.

use crate::db::{self, events, jobs};
use crate::models::{Event, EventPhase, JobRef, JobStatus, NewEvent, Stage};
use crate::utils::db_retry::{retry_on_lock, DEFAULT_MAX_LOCK_WAIT_MS};
use chrono::{Duration, Utc};
use critique_common::events::{CritiqueEvent, EventBus};
use critique_common::{Error, Result};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use sqlx::SqlitePool;
use uuid::Uuid;

#[derive(Clone)]
pub struct EventLog {
    db: SqlitePool,
    event_bus: EventBus,
}

impl EventLog {
    pub fn new(db: SqlitePool, event_bus: EventBus) -> Self {
        Self { db, event_bus }
    }

    /// Claim a stage and append its `started` event
    ///
    /// `None` when the check-and-set lost (job moved on, was cancelled, or a
    /// newer attempt exists).
    pub async fn enter_stage(
        &self,
        job_ref: JobRef,
        attempt: u32,
        stage: Stage,
        floor: u8,
    ) -> Result<Option<Event>> {
        let event = NewEvent::started(job_ref, attempt, stage, floor);
        let recorded = retry_on_lock("enter stage", DEFAULT_MAX_LOCK_WAIT_MS, || {
            let event = &event;
            async move {
                let now = Utc::now();
                let mut tx = self.db.begin().await?;
                if !jobs::mark_stage_entered(&mut tx, job_ref, attempt, stage, floor, now).await? {
                    return Ok(None);
                }
                let recorded = events::append_event(&mut tx, event, now).await?;
                tx.commit().await?;
                Ok(Some(recorded))
            }
        })
        .await?;

        if let Some(ev) = &recorded {
            self.event_bus.emit_lossy(CritiqueEvent::StageStarted {
                job_id: job_ref.id(),
                job_kind: job_ref.kind(),
                stage: stage.to_string(),
                progress: ev.progress,
                timestamp: ev.recorded_at,
            });
        }
        Ok(recorded)
    }

    /// Commit a stage output and move the job to the next stage
    pub async fn complete_stage(
        &self,
        job_ref: JobRef,
        attempt: u32,
        stage: Stage,
        progress: u8,
        metadata: Value,
    ) -> Result<Option<Event>> {
        let event = NewEvent::completed(job_ref, attempt, stage, progress, metadata);
        let recorded = retry_on_lock("complete stage", DEFAULT_MAX_LOCK_WAIT_MS, || {
            let event = &event;
            async move {
                let now = Utc::now();
                let mut tx = self.db.begin().await?;
                if !jobs::advance_stage(&mut tx, job_ref, attempt, stage, progress, now).await? {
                    return Ok(None);
                }
                let recorded = events::append_event(&mut tx, event, now).await?;
                tx.commit().await?;
                Ok(Some(recorded))
            }
        })
        .await?;

        if let Some(ev) = &recorded {
            self.emit_stage_completed(ev);
        }
        Ok(recorded)
    }

    /// Commit the synthesis stage and mark the job completed
    pub async fn complete_job(
        &self,
        job_ref: JobRef,
        attempt: u32,
        result_id: Uuid,
        overall_quality: u8,
        is_partial_result: bool,
        metadata: Value,
    ) -> Result<Option<Event>> {
        let event = NewEvent::completed(job_ref, attempt, Stage::Synthesis, 100, metadata);
        let recorded = retry_on_lock("complete job", DEFAULT_MAX_LOCK_WAIT_MS, || {
            let event = &event;
            async move {
                let now = Utc::now();
                let mut tx = self.db.begin().await?;
                if !jobs::mark_completed(&mut tx, job_ref, attempt, result_id, now).await? {
                    return Ok(None);
                }
                let recorded = events::append_event(&mut tx, event, now).await?;
                tx.commit().await?;
                Ok(Some(recorded))
            }
        })
        .await?;

        if let Some(ev) = &recorded {
            self.emit_stage_completed(ev);
            self.event_bus.emit_lossy(CritiqueEvent::JobCompleted {
                job_id: job_ref.id(),
                job_kind: job_ref.kind(),
                result_id,
                overall_quality,
                is_partial_result,
                timestamp: ev.recorded_at,
            });
        }
        Ok(recorded)
    }

    /// Record a stage failure; the job becomes `failed`
    pub async fn fail_stage(
        &self,
        job_ref: JobRef,
        attempt: u32,
        stage: Stage,
        progress: u8,
        message: String,
        metadata: Value,
    ) -> Result<Option<Event>> {
        let event = NewEvent::failed(job_ref, attempt, stage, progress, message, metadata);
        let recorded = retry_on_lock("fail stage", DEFAULT_MAX_LOCK_WAIT_MS, || {
            let event = &event;
            async move {
                let now = Utc::now();
                let mut tx = self.db.begin().await?;
                if !jobs::mark_failed(&mut tx, job_ref, attempt, stage, &event.message, now).await? {
                    return Ok(None);
                }
                let recorded = events::append_event(&mut tx, event, now).await?;
                tx.commit().await?;
                Ok(Some(recorded))
            }
        })
        .await?;

        if let Some(ev) = &recorded {
            self.event_bus.emit_lossy(CritiqueEvent::StageFailed {
                job_id: job_ref.id(),
                job_kind: job_ref.kind(),
                stage: stage.to_string(),
                message: ev.message.clone(),
                timestamp: ev.recorded_at,
            });
        }
        Ok(recorded)
    }

    /// Mark the job cancelled, closing its current stage in the log
    pub async fn cancel(
        &self,
        job_ref: JobRef,
        attempt: u32,
        stage: Stage,
        progress: u8,
    ) -> Result<Option<Event>> {
        let mut event = NewEvent::failed(
            job_ref,
            attempt,
            stage,
            progress,
            "cancelled by request".to_string(),
            json!({ "cancelled": true }),
        );
        event.status = JobStatus::Cancelled;

        let recorded = retry_on_lock("cancel job", DEFAULT_MAX_LOCK_WAIT_MS, || {
            let event = &event;
            async move {
                let now = Utc::now();
                let mut tx = self.db.begin().await?;
                if !jobs::mark_cancelled(&mut tx, job_ref, now).await? {
                    return Ok(None);
                }
                let recorded = events::append_event(&mut tx, event, now).await?;
                tx.commit().await?;
                Ok(Some(recorded))
            }
        })
        .await?;

        if let Some(ev) = &recorded {
            self.event_bus.emit_lossy(CritiqueEvent::JobCancelled {
                job_id: job_ref.id(),
                job_kind: job_ref.kind(),
                timestamp: ev.recorded_at,
            });
        }
        Ok(recorded)
    }

    /// Start a new attempt for a failed or cancelled job
    pub async fn reset_for_retry(&self, job_ref: JobRef) -> Result<bool> {
        retry_on_lock("retry job", DEFAULT_MAX_LOCK_WAIT_MS, || async move {
            let mut conn = self.db.acquire().await?;
            jobs::reset_for_retry(&mut conn, job_ref, Utc::now()).await
        })
        .await
    }

    pub async fn history(&self, job_ref: JobRef) -> Result<Vec<Event>> {
        events::list_events(&self.db, job_ref).await
    }

    pub async fn attempt_events(&self, job_ref: JobRef, attempt: u32) -> Result<Vec<Event>> {
        events::list_attempt_events(&self.db, job_ref, attempt).await
    }

    /// Deserialized output of a stage completed in `attempt`
    pub async fn stage_output<T: DeserializeOwned>(
        &self,
        job_ref: JobRef,
        attempt: u32,
        stage: Stage,
    ) -> Result<Option<T>> {
        let metadata = events::stage_output(&self.db, job_ref, attempt, stage).await?;
        metadata
            .map(|value| {
                serde_json::from_value(value).map_err(|e| {
                    Error::Internal(format!("Stored {} output is unreadable: {}", stage, e))
                })
            })
            .transpose()
    }

    pub async fn stage_completed(&self, job_ref: JobRef, attempt: u32, stage: Stage) -> Result<bool> {
        Ok(events::stage_output(&self.db, job_ref, attempt, stage)
            .await?
            .is_some())
    }

    /// Delete events older than `retention_days`
    ///
    /// A retention reaching past the Unix epoch keeps everything.
    pub async fn purge(&self, retention_days: u32) -> Result<u64> {
        let Some(cutoff) = Utc::now()
            .checked_sub_signed(Duration::days(i64::from(retention_days)))
            .filter(|cutoff| cutoff.timestamp() >= 0)
        else {
            tracing::debug!(retention_days, "Retention predates the epoch, nothing to purge");
            return Ok(0);
        };
        let deleted = events::purge_events_before(&self.db, cutoff).await?;

        tracing::info!(
            deleted,
            retention_days,
            cutoff = %db::fmt_ts(cutoff),
            "Purged old events"
        );
        self.event_bus.emit_lossy(CritiqueEvent::EventsPurged {
            deleted,
            retention_days,
            timestamp: Utc::now(),
        });
        Ok(deleted)
    }

    fn emit_stage_completed(&self, ev: &Event) {
        debug_assert_eq!(ev.phase, EventPhase::Completed);
        self.event_bus.emit_lossy(CritiqueEvent::StageCompleted {
            job_id: ev.subject.id(),
            job_kind: ev.subject.kind(),
            stage: ev.stage.to_string(),
            progress: ev.progress,
            duration_ms: ev.duration_ms,
            timestamp: ev.recorded_at,
        });
    }
}
