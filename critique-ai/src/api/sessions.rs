//! Group session API handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::models::GroupAnalysisResult;
use crate::services::ForkOutcome;
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct ForkRequest {
    #[serde(default)]
    pub prompt: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LineageResponse {
    pub session_id: Uuid,
    /// Nearest ancestor first
    pub ancestors: Vec<GroupAnalysisResult>,
}

/// GET /group-sessions/:session_id
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<Json<GroupAnalysisResult>> {
    state
        .orchestrator
        .aggregator()
        .load(session_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("group session {}", session_id)))
}

/// POST /group-sessions/:session_id/fork
///
/// Body is optional; `{"prompt": "..."}` overrides the source prompt.
pub async fn fork_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    request: Option<Json<ForkRequest>>,
) -> ApiResult<(StatusCode, Json<ForkOutcome>)> {
    let prompt = request.and_then(|Json(r)| r.prompt);
    let outcome = state
        .orchestrator
        .fork_group_session(session_id, prompt)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(outcome)))
}

/// GET /group-sessions/:session_id/lineage
pub async fn session_lineage(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<Json<LineageResponse>> {
    let ancestors = state
        .orchestrator
        .aggregator()
        .lineage(session_id)
        .await
        .map_err(|e| match e {
            critique_common::Error::NotFound(msg) => ApiError::NotFound(msg),
            other => ApiError::Common(other),
        })?;
    Ok(Json(LineageResponse {
        session_id,
        ancestors,
    }))
}

pub fn session_routes() -> Router<AppState> {
    Router::new()
        .route("/group-sessions/:session_id", get(get_session))
        .route("/group-sessions/:session_id/fork", post(fork_session))
        .route("/group-sessions/:session_id/lineage", get(session_lineage))
}
