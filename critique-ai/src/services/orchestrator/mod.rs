//! Stage orchestrator
//!
//! Drives jobs and group jobs through `context → vision → ai → synthesis`.
//!
//! Handlers are stateless continuations over the event log: each one reads
//! its inputs from the `.completed` events of earlier stages in the current
//! attempt, commits its own output together with the stage transition, and
//! hands the next stage to the [`StageDispatcher`]. Because every transition
//! is a check-and-set, a stage delivered twice, a cancelled job, or a stale
//! handler from an older attempt simply stands down.

mod prompts;
mod stage_ai;
mod stage_context;
mod stage_synthesis;
mod stage_vision;

use crate::config::{PipelineConfig, ScoringConfig};
use crate::db;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{
    Event, EventPhase, GroupJob, Job, JobRef, JobState, JobStatus, NewGroupJob, NewJob,
    SessionStatus, Stage,
};
use crate::providers::{ProviderErrorKind, ProviderGateway};
use crate::services::dispatch::{StageDispatcher, StageTask};
use crate::services::event_log::EventLog;
use crate::services::group_aggregator::GroupAggregator;
use crate::services::quality_scorer::QualityScorer;
use crate::services::version_manager::VersionManager;
use chrono::{DateTime, Utc};
use critique_common::events::{CritiqueEvent, EventBus};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Shared handles the orchestrator is built from
#[derive(Clone)]
pub struct PipelineContext {
    pub db: SqlitePool,
    pub event_bus: EventBus,
    pub gateway: Arc<ProviderGateway>,
    pub pipeline: PipelineConfig,
    pub scoring: ScoringConfig,
}

/// What one `run_stage` call did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StageRun {
    /// Stage output committed; `next` was dispatched
    Completed { stage: Stage, next: Option<Stage> },
    /// Stage failed; the job is now `failed`
    Failed { stage: Stage, message: String },
    /// Stage had already completed in this attempt
    AlreadyCompleted { stage: Stage },
    /// Nothing to do (terminal job, other stage current, lost race)
    Skipped { stage: Stage, reason: String },
}

/// Where an unfinished job should pick up again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumePoint {
    /// Last event is a stale `X.completed`; dispatch the stage after X
    Dispatch(Stage),
    /// Last event is a stale `X.started` (or there are no events); re-enter X
    Reenter(Stage),
    /// Recent `X.started`, or a recent `.completed` whose successor X may
    /// still be queued
    InFlight(Stage),
    /// Last event is a failure
    Nothing,
}

#[derive(Debug, Clone, Serialize)]
pub struct ForkOutcome {
    pub session_id: Uuid,
    pub parent_session_id: Uuid,
    pub group_job_id: Uuid,
}

/// A loaded job of either kind
#[derive(Debug, Clone)]
pub(crate) enum WorkUnit {
    Single(Job),
    Group(GroupJob),
}

impl WorkUnit {
    pub(crate) fn state(&self) -> &JobState {
        match self {
            WorkUnit::Single(job) => &job.state,
            WorkUnit::Group(job) => &job.state,
        }
    }

    /// User context for a job, group context for a group job
    pub(crate) fn context_text(&self) -> Option<&str> {
        match self {
            WorkUnit::Single(job) => job.user_context.as_deref(),
            WorkUnit::Group(job) => job.group_context.as_deref(),
        }
    }

    pub(crate) fn prompt(&self) -> Option<&str> {
        match self {
            WorkUnit::Single(_) => None,
            WorkUnit::Group(job) => job.prompt.as_deref(),
        }
    }

    /// (subject_id, subject_url) pairs
    pub(crate) fn subjects(&self) -> Vec<(&str, &str)> {
        match self {
            WorkUnit::Single(job) => vec![(job.subject_id.as_str(), job.subject_url.as_str())],
            WorkUnit::Group(job) => job.subjects().collect(),
        }
    }
}

/// Result of a stage body, before it is committed
pub(crate) enum StageCommit {
    Advance(Value),
    Finish {
        result_id: Uuid,
        overall_quality: u8,
        is_partial_result: bool,
        metadata: Value,
    },
    /// The job changed under the handler (cancelled or retried)
    StandDown,
}

pub struct StageOrchestrator {
    db: SqlitePool,
    event_bus: EventBus,
    event_log: EventLog,
    gateway: Arc<ProviderGateway>,
    dispatcher: Arc<dyn StageDispatcher>,
    scorer: QualityScorer,
    versions: VersionManager,
    aggregator: GroupAggregator,
    config: PipelineConfig,
}

impl StageOrchestrator {
    pub fn new(ctx: PipelineContext, dispatcher: Arc<dyn StageDispatcher>) -> Self {
        Self {
            event_log: EventLog::new(ctx.db.clone(), ctx.event_bus.clone()),
            versions: VersionManager::new(ctx.db.clone(), ctx.pipeline.dedup_window_hours),
            aggregator: GroupAggregator::new(ctx.db.clone()),
            scorer: QualityScorer::new(ctx.scoring),
            db: ctx.db,
            event_bus: ctx.event_bus,
            gateway: ctx.gateway,
            dispatcher,
            config: ctx.pipeline,
        }
    }

    pub fn event_log(&self) -> &EventLog {
        &self.event_log
    }

    pub fn versions(&self) -> &VersionManager {
        &self.versions
    }

    pub fn aggregator(&self) -> &GroupAggregator {
        &self.aggregator
    }

    pub fn gateway(&self) -> &ProviderGateway {
        &self.gateway
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Job lifecycle
    // ------------------------------------------------------------------

    /// Persist a job and dispatch its context stage; returns immediately
    pub async fn create_job(&self, request: NewJob) -> PipelineResult<Job> {
        request.validate().map_err(PipelineError::Validation)?;
        let job = Job::new(request);
        db::jobs::insert_job(&self.db, &job).await?;

        info!(
            job_id = %job.id,
            subject_id = %job.subject_id,
            analysis_type = %job.analysis_type,
            "Job created"
        );
        self.emit_created(job.job_ref());
        self.dispatch(job.job_ref(), Stage::Context).await?;
        Ok(job)
    }

    /// Persist a group job and dispatch its context stage
    pub async fn create_group_job(&self, request: NewGroupJob) -> PipelineResult<GroupJob> {
        request.validate().map_err(PipelineError::Validation)?;
        let job = GroupJob::new(request);
        db::jobs::insert_group_job(&self.db, &job).await?;

        info!(
            group_job_id = %job.id,
            group_id = %job.group_id,
            subjects = job.subject_ids.len(),
            "Group job created"
        );
        self.emit_created(job.job_ref());
        self.dispatch(job.job_ref(), Stage::Context).await?;
        Ok(job)
    }

    pub async fn get_job(&self, id: Uuid) -> PipelineResult<Job> {
        db::jobs::load_job(&self.db, id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("job {}", id)))
    }

    pub async fn get_group_job(&self, id: Uuid) -> PipelineResult<GroupJob> {
        db::jobs::load_group_job(&self.db, id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("group job {}", id)))
    }

    pub async fn job_state(&self, job_ref: JobRef) -> PipelineResult<JobState> {
        db::jobs::load_state(&self.db, job_ref)
            .await?
            .ok_or_else(|| PipelineError::NotFound(job_ref.to_string()))
    }

    /// Cancel a pending or processing job
    ///
    /// Cooperative: a handler mid-stage finishes its provider calls but its
    /// commit no longer matches, so nothing after the cancel is recorded.
    pub async fn cancel(&self, job_ref: JobRef) -> PipelineResult<JobState> {
        let state = self.job_state(job_ref).await?;
        if state.is_terminal() {
            return Err(PipelineError::InvalidState(format!(
                "{} is already {}",
                job_ref, state.status
            )));
        }

        let cancelled = self
            .event_log
            .cancel(job_ref, state.attempt, state.current_stage, state.progress)
            .await?;
        let current = self.job_state(job_ref).await?;
        if cancelled.is_none() {
            return Err(PipelineError::InvalidState(format!(
                "{} is already {}",
                job_ref, current.status
            )));
        }

        info!(job = %job_ref, stage = %state.current_stage, "Job cancelled");
        Ok(current)
    }

    /// Start a new attempt of a failed or cancelled job
    pub async fn retry(&self, job_ref: JobRef) -> PipelineResult<JobState> {
        let state = self.job_state(job_ref).await?;
        if !matches!(state.status, JobStatus::Failed | JobStatus::Cancelled) {
            return Err(PipelineError::InvalidState(format!(
                "{} is {}; only failed or cancelled jobs can be retried",
                job_ref, state.status
            )));
        }
        if !self.event_log.reset_for_retry(job_ref).await? {
            return Err(PipelineError::InvalidState(format!(
                "{} changed state before retry",
                job_ref
            )));
        }

        let state = self.job_state(job_ref).await?;
        info!(job = %job_ref, attempt = state.attempt, "Job retry scheduled");
        self.dispatch(job_ref, Stage::Context).await?;
        Ok(state)
    }

    /// Full event history of a job, all attempts, in order
    pub async fn events(&self, job_ref: JobRef) -> PipelineResult<Vec<Event>> {
        self.job_state(job_ref).await?;
        Ok(self.event_log.history(job_ref).await?)
    }

    // ------------------------------------------------------------------
    // Stage execution
    // ------------------------------------------------------------------

    pub async fn run_context(&self, job_ref: JobRef) -> PipelineResult<StageRun> {
        self.run_stage(job_ref, Stage::Context).await
    }

    pub async fn run_vision(&self, job_ref: JobRef) -> PipelineResult<StageRun> {
        self.run_stage(job_ref, Stage::Vision).await
    }

    pub async fn run_ai(&self, job_ref: JobRef) -> PipelineResult<StageRun> {
        self.run_stage(job_ref, Stage::Ai).await
    }

    pub async fn run_synthesis(&self, job_ref: JobRef) -> PipelineResult<StageRun> {
        self.run_stage(job_ref, Stage::Synthesis).await
    }

    /// Run one stage of one job
    ///
    /// Idempotent: terminal jobs are a no-op, and a stage already completed
    /// in the current attempt only re-dispatches its successor.
    pub async fn run_stage(&self, job_ref: JobRef, stage: Stage) -> PipelineResult<StageRun> {
        if !stage.is_work_stage() {
            return Err(PipelineError::Validation(format!(
                "{} is not a runnable stage",
                stage
            )));
        }

        let state = self.job_state(job_ref).await?;
        if state.is_terminal() {
            debug!(job = %job_ref, stage = %stage, status = %state.status, "Job is terminal, skipping stage");
            return Ok(StageRun::Skipped {
                stage,
                reason: format!("job is {}", state.status),
            });
        }

        let attempt = state.attempt;
        if self.event_log.stage_completed(job_ref, attempt, stage).await? {
            if let Some(next) = stage.next().filter(|s| s.is_work_stage()) {
                if state.current_stage == next {
                    debug!(job = %job_ref, stage = %stage, "Stage already completed, re-dispatching successor");
                    self.dispatch(job_ref, next).await?;
                }
            }
            return Ok(StageRun::AlreadyCompleted { stage });
        }

        if state.current_stage != stage {
            debug!(
                job = %job_ref,
                stage = %stage,
                current_stage = %state.current_stage,
                "Stage is not current, skipping"
            );
            return Ok(StageRun::Skipped {
                stage,
                reason: format!("current stage is {}", state.current_stage),
            });
        }

        let progress = self.config.progress.for_stage(stage);
        if self
            .event_log
            .enter_stage(job_ref, attempt, stage, progress.floor)
            .await?
            .is_none()
        {
            return Ok(StageRun::Skipped {
                stage,
                reason: "stage claim lost".to_string(),
            });
        }
        info!(job = %job_ref, stage = %stage, attempt, "Stage started");

        let body = match stage {
            Stage::Context => self.stage_context(job_ref, attempt).await,
            Stage::Vision => self.stage_vision(job_ref, attempt).await,
            Stage::Ai => self.stage_ai(job_ref, attempt).await,
            Stage::Synthesis => self.stage_synthesis(job_ref, attempt).await,
            Stage::Completed => Err(PipelineError::Validation(
                "completed is not a runnable stage".to_string(),
            )),
        };

        match body {
            Ok(StageCommit::Advance(metadata)) => {
                let committed = self
                    .event_log
                    .complete_stage(job_ref, attempt, stage, progress.completed, metadata)
                    .await?;
                if committed.is_none() {
                    return Ok(self.stood_down(job_ref, stage));
                }
                let next = stage.next().filter(|s| s.is_work_stage());
                info!(job = %job_ref, stage = %stage, "Stage completed");
                if let Some(next) = next {
                    self.dispatch(job_ref, next).await?;
                }
                Ok(StageRun::Completed { stage, next })
            }
            Ok(StageCommit::Finish {
                result_id,
                overall_quality,
                is_partial_result,
                metadata,
            }) => {
                let committed = self
                    .event_log
                    .complete_job(
                        job_ref,
                        attempt,
                        result_id,
                        overall_quality,
                        is_partial_result,
                        metadata,
                    )
                    .await?;
                if committed.is_none() {
                    return Ok(self.stood_down(job_ref, stage));
                }
                info!(
                    job = %job_ref,
                    result_id = %result_id,
                    overall_quality,
                    is_partial_result,
                    "Job completed"
                );
                Ok(StageRun::Completed { stage, next: None })
            }
            Ok(StageCommit::StandDown) => Ok(self.stood_down(job_ref, stage)),
            Err(err) => {
                let message = err.to_string();
                let recorded = self
                    .event_log
                    .fail_stage(
                        job_ref,
                        attempt,
                        stage,
                        progress.floor,
                        message.clone(),
                        failure_metadata(&err),
                    )
                    .await?;
                if recorded.is_none() {
                    // Another handler already moved the job past this stage
                    warn!(job = %job_ref, stage = %stage, attempt, "Discarding failure of superseded stage: {}", message);
                    return Ok(self.stood_down(job_ref, stage));
                }
                error!(job = %job_ref, stage = %stage, attempt, "Stage failed: {}", message);
                Ok(StageRun::Failed { stage, message })
            }
        }
    }

    // ------------------------------------------------------------------
    // Recovery and maintenance
    // ------------------------------------------------------------------

    /// Re-dispatch stages of unfinished jobs whose handlers went away
    ///
    /// Returns the tasks that were dispatched.
    pub async fn resume_abandoned(&self, stale_after: Duration) -> PipelineResult<Vec<StageTask>> {
        let now = Utc::now();
        let mut resumed = Vec::new();

        for (job_ref, state) in db::jobs::list_unfinished(&self.db).await? {
            let events = self.event_log.attempt_events(job_ref, state.attempt).await?;

            let point = Self::derive_resume_point(state.current_stage, &events, now, stale_after);
            let stage = match point {
                ResumePoint::Dispatch(stage) => stage,
                ResumePoint::Reenter(stage) if events.is_empty() => {
                    // A freshly created job has no events yet; give its first
                    // dispatch the same grace period as a running stage
                    let unit = self.load_unit(job_ref).await?;
                    if !is_stale(updated_at(&unit), now, stale_after) {
                        continue;
                    }
                    stage
                }
                ResumePoint::Reenter(stage) => stage,
                ResumePoint::InFlight(_) | ResumePoint::Nothing => continue,
            };

            info!(job = %job_ref, stage = %stage, attempt = state.attempt, "Resuming abandoned job");
            self.dispatch(job_ref, stage).await?;
            resumed.push(StageTask::new(job_ref, stage));
        }

        if !resumed.is_empty() {
            info!(count = resumed.len(), "Resumed abandoned jobs");
        }
        Ok(resumed)
    }

    /// Resume point of one attempt, from its events alone
    pub fn derive_resume_point(
        current_stage: Stage,
        events: &[Event],
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> ResumePoint {
        let Some(last) = events.iter().max_by_key(|e| e.seq) else {
            return ResumePoint::Reenter(current_stage);
        };

        match last.phase {
            EventPhase::Completed => match last.stage.next() {
                Some(next) if !next.is_work_stage() => ResumePoint::Nothing,
                Some(next) if is_stale(last.recorded_at, now, stale_after) => {
                    ResumePoint::Dispatch(next)
                }
                Some(next) => ResumePoint::InFlight(next),
                None => ResumePoint::Nothing,
            },
            EventPhase::Started if is_stale(last.recorded_at, now, stale_after) => {
                ResumePoint::Reenter(last.stage)
            }
            EventPhase::Started => ResumePoint::InFlight(last.stage),
            EventPhase::Failed => ResumePoint::Nothing,
        }
    }

    /// Delete events older than `retention_days` (configured default if `None`)
    pub async fn purge_events(&self, retention_days: Option<u32>) -> PipelineResult<u64> {
        let days = retention_days.unwrap_or(self.config.event_retention_days);
        Ok(self.event_log.purge(days).await?)
    }

    /// Fork a completed group session and run a group job that fills the fork
    ///
    /// The request is validated before the fork row exists; if the group job
    /// cannot be created the pending fork is removed again.
    pub async fn fork_group_session(
        &self,
        source_session_id: Uuid,
        prompt: Option<String>,
    ) -> PipelineResult<ForkOutcome> {
        let source = self
            .aggregator
            .load(source_session_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("group session {}", source_session_id)))?;
        if source.status != SessionStatus::Completed {
            return Err(PipelineError::InvalidState(format!(
                "group session {} is {}; only completed sessions can be forked",
                source_session_id,
                source.status.as_str()
            )));
        }
        let source_job_id = source.group_job_id.ok_or_else(|| {
            PipelineError::InvalidState(format!(
                "group session {} has no originating group job",
                source_session_id
            ))
        })?;
        let source_job = self.get_group_job(source_job_id).await?;

        let mut request = NewGroupJob {
            group_id: Some(source.group_id.clone()),
            subject_ids: source_job.subject_ids,
            subject_urls: source_job.subject_urls,
            group_context: source_job.group_context,
            prompt: prompt.clone().or(source.prompt),
            session_id: None,
        };
        request.validate().map_err(PipelineError::Validation)?;

        let session_id = self.aggregator.fork(source_session_id, prompt).await?;
        request.session_id = Some(session_id);
        let job = match self.create_group_job(request).await {
            Ok(job) => job,
            Err(err) => {
                if let Err(cleanup) = self.aggregator.discard_fork(session_id).await {
                    warn!(session_id = %session_id, "Failed to discard unused fork: {}", cleanup);
                }
                return Err(err);
            }
        };

        info!(
            source_session_id = %source_session_id,
            session_id = %session_id,
            group_job_id = %job.id,
            "Group session fork scheduled"
        );
        Ok(ForkOutcome {
            session_id,
            parent_session_id: source_session_id,
            group_job_id: job.id,
        })
    }

    // ------------------------------------------------------------------
    // Helpers shared by the stage handlers
    // ------------------------------------------------------------------

    pub(crate) async fn load_unit(&self, job_ref: JobRef) -> PipelineResult<WorkUnit> {
        match job_ref {
            JobRef::Single(id) => Ok(WorkUnit::Single(self.get_job(id).await?)),
            JobRef::Group(id) => Ok(WorkUnit::Group(self.get_group_job(id).await?)),
        }
    }

    /// Output of an earlier stage of this attempt
    pub(crate) async fn require_output<T: DeserializeOwned>(
        &self,
        job_ref: JobRef,
        attempt: u32,
        stage: Stage,
    ) -> PipelineResult<T> {
        self.event_log
            .stage_output(job_ref, attempt, stage)
            .await?
            .ok_or_else(|| {
                PipelineError::InvalidState(format!(
                    "{} output missing for attempt {}",
                    stage, attempt
                ))
            })
    }

    /// True while the job is still running `attempt`
    pub(crate) async fn still_running(&self, job_ref: JobRef, attempt: u32) -> PipelineResult<bool> {
        let state = self.job_state(job_ref).await?;
        Ok(state.status == JobStatus::Processing && state.attempt == attempt)
    }

    async fn dispatch(&self, job_ref: JobRef, stage: Stage) -> PipelineResult<()> {
        self.dispatcher.dispatch(StageTask::new(job_ref, stage)).await
    }

    fn stood_down(&self, job_ref: JobRef, stage: Stage) -> StageRun {
        warn!(job = %job_ref, stage = %stage, "Job changed during stage, discarding output");
        StageRun::Skipped {
            stage,
            reason: "job changed during stage".to_string(),
        }
    }

    fn emit_created(&self, job_ref: JobRef) {
        self.event_bus.emit_lossy(CritiqueEvent::JobCreated {
            job_id: job_ref.id(),
            job_kind: job_ref.kind(),
            timestamp: Utc::now(),
        });
    }
}

fn is_stale(since: DateTime<Utc>, now: DateTime<Utc>, stale_after: Duration) -> bool {
    now.signed_duration_since(since)
        .to_std()
        .map(|age| age >= stale_after)
        .unwrap_or(false)
}

fn updated_at(unit: &WorkUnit) -> DateTime<Utc> {
    match unit {
        WorkUnit::Single(job) => job.updated_at,
        WorkUnit::Group(job) => job.updated_at,
    }
}

/// Structured failure detail stored on the `.failed` event
fn failure_metadata(err: &PipelineError) -> Value {
    match err {
        PipelineError::Provider(e) => json!({ "error_kind": e.kind, "error": e.message }),
        PipelineError::FatalConfig(msg) => {
            json!({ "error_kind": ProviderErrorKind::Config, "error": msg })
        }
        PipelineError::StageFailed { message, .. } => json!({ "error": message }),
        other => json!({ "error": other.to_string() }),
    }
}
