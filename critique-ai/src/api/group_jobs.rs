//! Group job API handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use uuid::Uuid;

use super::jobs::JobEventsResponse;
use super::{parse_stage, JobAccepted};
use crate::error::ApiResult;
use crate::models::{GroupAnalysisResult, GroupJob, JobRef, NewGroupJob};
use crate::services::StageRun;
use crate::AppState;

/// GET /group-jobs/:id response; `result` is set once completed
#[derive(Debug, Serialize)]
pub struct GroupJobResponse {
    #[serde(flatten)]
    pub job: GroupJob,
    pub result: Option<GroupAnalysisResult>,
}

/// POST /group-jobs
pub async fn create_group_job(
    State(state): State<AppState>,
    Json(request): Json<NewGroupJob>,
) -> ApiResult<(StatusCode, Json<JobAccepted>)> {
    let job = state.orchestrator.create_group_job(request).await?;
    Ok((StatusCode::ACCEPTED, Json(JobAccepted::new(job.id, &job.state))))
}

/// GET /group-jobs/:id
pub async fn get_group_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<GroupJobResponse>> {
    let job = state.orchestrator.get_group_job(id).await?;
    let result = match job.result_session_id {
        Some(session_id) => state.orchestrator.aggregator().load(session_id).await?,
        None => None,
    };
    Ok(Json(GroupJobResponse { job, result }))
}

/// POST /group-jobs/:id/cancel
pub async fn cancel_group_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<JobAccepted>> {
    let job_state = state.orchestrator.cancel(JobRef::Group(id)).await?;
    Ok(Json(JobAccepted::new(id, &job_state)))
}

/// POST /group-jobs/:id/retry
pub async fn retry_group_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<JobAccepted>)> {
    let job_state = state.orchestrator.retry(JobRef::Group(id)).await?;
    Ok((StatusCode::ACCEPTED, Json(JobAccepted::new(id, &job_state))))
}

/// GET /group-jobs/:id/events
pub async fn group_job_events(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<JobEventsResponse>> {
    let job = JobRef::Group(id);
    let events = state.orchestrator.events(job).await?;
    Ok(Json(JobEventsResponse { job, events }))
}

/// POST /internal/group-jobs/:id/stages/:stage
pub async fn run_group_job_stage(
    State(state): State<AppState>,
    Path((id, stage)): Path<(Uuid, String)>,
) -> ApiResult<Json<StageRun>> {
    let stage = parse_stage(&stage)?;
    let run = state.orchestrator.run_stage(JobRef::Group(id), stage).await?;
    Ok(Json(run))
}

pub fn group_job_routes() -> Router<AppState> {
    Router::new()
        .route("/group-jobs", post(create_group_job))
        .route("/group-jobs/:id", get(get_group_job))
        .route("/group-jobs/:id/cancel", post(cancel_group_job))
        .route("/group-jobs/:id/retry", post(retry_group_job))
        .route("/group-jobs/:id/events", get(group_job_events))
        .route("/internal/group-jobs/:id/stages/:stage", post(run_group_job_stage))
}
