//! Maintenance endpoints
//!
//! POST /maintenance/purge-events, POST /maintenance/resume

use axum::{extract::State, routing::post, Json, Router};
use serde::{Deserialize, Serialize};

use crate::error::ApiResult;
use crate::services::StageTask;
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct PurgeRequest {
    /// Defaults to the configured retention (60 days)
    #[serde(default)]
    pub retention_days: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct PurgeResponse {
    pub deleted: u64,
    pub retention_days: u32,
}

#[derive(Debug, Deserialize)]
pub struct ResumeRequest {
    /// Age after which a started stage counts as abandoned
    #[serde(default)]
    pub stale_after_secs: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct ResumedTask {
    pub job: crate::models::JobRef,
    pub stage: crate::models::Stage,
}

#[derive(Debug, Serialize)]
pub struct ResumeResponse {
    pub resumed: Vec<ResumedTask>,
}

/// POST /maintenance/purge-events
pub async fn purge_events(
    State(state): State<AppState>,
    request: Option<Json<PurgeRequest>>,
) -> ApiResult<Json<PurgeResponse>> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let retention_days = request
        .retention_days
        .unwrap_or(state.orchestrator.config().event_retention_days);
    let deleted = state
        .orchestrator
        .purge_events(Some(retention_days))
        .await?;
    Ok(Json(PurgeResponse {
        deleted,
        retention_days,
    }))
}

/// POST /maintenance/resume
pub async fn resume_abandoned(
    State(state): State<AppState>,
    request: Option<Json<ResumeRequest>>,
) -> ApiResult<Json<ResumeResponse>> {
    let stale_after = request
        .and_then(|Json(r)| r.stale_after_secs)
        .map(std::time::Duration::from_secs)
        .unwrap_or_else(|| state.orchestrator.config().stale_stage_after());
    let resumed = state
        .orchestrator
        .resume_abandoned(stale_after)
        .await?
        .into_iter()
        .map(|StageTask { job_ref, stage }| ResumedTask { job: job_ref, stage })
        .collect();
    Ok(Json(ResumeResponse { resumed }))
}

pub fn maintenance_routes() -> Router<AppState> {
    Router::new()
        .route("/maintenance/purge-events", post(purge_events))
        .route("/maintenance/resume", post(resume_abandoned))
}
