//! Single-image job API handlers
//!
//! POST /jobs, GET /jobs/:id, POST /jobs/:id/cancel, POST /jobs/:id/retry,
//! GET /jobs/:id/events, POST /internal/jobs/:id/stages/:stage

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use uuid::Uuid;

use super::{parse_stage, JobAccepted};
use crate::error::ApiResult;
use crate::models::{Event, Job, JobRef, NewJob};
use crate::services::StageRun;
use crate::AppState;

/// GET /jobs/:id/events response
#[derive(Debug, Serialize)]
pub struct JobEventsResponse {
    pub job: JobRef,
    pub events: Vec<Event>,
}

/// POST /jobs
///
/// Creates the job and dispatches its first stage. Returns 202 Accepted.
pub async fn create_job(
    State(state): State<AppState>,
    Json(request): Json<NewJob>,
) -> ApiResult<(StatusCode, Json<JobAccepted>)> {
    let job = state.orchestrator.create_job(request).await?;
    Ok((StatusCode::ACCEPTED, Json(JobAccepted::new(job.id, &job.state))))
}

/// GET /jobs/:id
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Job>> {
    Ok(Json(state.orchestrator.get_job(id).await?))
}

/// POST /jobs/:id/cancel
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<JobAccepted>> {
    let job_state = state.orchestrator.cancel(JobRef::Single(id)).await?;
    Ok(Json(JobAccepted::new(id, &job_state)))
}

/// POST /jobs/:id/retry
pub async fn retry_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<JobAccepted>)> {
    let job_state = state.orchestrator.retry(JobRef::Single(id)).await?;
    Ok((StatusCode::ACCEPTED, Json(JobAccepted::new(id, &job_state))))
}

/// GET /jobs/:id/events
pub async fn job_events(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<JobEventsResponse>> {
    let job = JobRef::Single(id);
    let events = state.orchestrator.events(job).await?;
    Ok(Json(JobEventsResponse { job, events }))
}

/// POST /internal/jobs/:id/stages/:stage
///
/// Runs one stage synchronously. Used by external dispatchers and for
/// operational re-drives; the in-process worker pool calls the orchestrator
/// directly.
pub async fn run_job_stage(
    State(state): State<AppState>,
    Path((id, stage)): Path<(Uuid, String)>,
) -> ApiResult<Json<StageRun>> {
    let stage = parse_stage(&stage)?;
    let run = state.orchestrator.run_stage(JobRef::Single(id), stage).await?;
    Ok(Json(run))
}

/// Build job routes
pub fn job_routes() -> Router<AppState> {
    Router::new()
        .route("/jobs", post(create_job))
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/cancel", post(cancel_job))
        .route("/jobs/:id/retry", post(retry_job))
        .route("/jobs/:id/events", get(job_events))
        .route("/internal/jobs/:id/stages/:stage", post(run_job_stage))
}
