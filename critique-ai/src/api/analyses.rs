//! Analysis result API handlers
//!
//! Versions are listed newest first.

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::models::{AnalysisResult, ExistingInfo};
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct VersionListResponse {
    pub subject_id: String,
    pub analysis_type: String,
    pub versions: Vec<AnalysisResult>,
}

#[derive(Debug, Deserialize)]
pub struct ExistingQuery {
    pub within_hours: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct ExistingResponse {
    pub exists: bool,
    pub existing: Option<ExistingInfo>,
}

/// GET /analyses/:subject_id/:analysis_type
pub async fn list_versions(
    State(state): State<AppState>,
    Path((subject_id, analysis_type)): Path<(String, String)>,
) -> ApiResult<Json<VersionListResponse>> {
    let versions = state
        .orchestrator
        .versions()
        .list_versions(&subject_id, &analysis_type)
        .await?;
    Ok(Json(VersionListResponse {
        subject_id,
        analysis_type,
        versions,
    }))
}

/// GET /analyses/:subject_id/:analysis_type/latest
pub async fn latest_version(
    State(state): State<AppState>,
    Path((subject_id, analysis_type)): Path<(String, String)>,
) -> ApiResult<Json<AnalysisResult>> {
    state
        .orchestrator
        .versions()
        .latest(&subject_id, &analysis_type)
        .await?
        .map(Json)
        .ok_or_else(|| {
            ApiError::NotFound(format!("no analysis for {}/{}", subject_id, analysis_type))
        })
}

/// GET /analyses/:subject_id/:analysis_type/existing?within_hours=N
pub async fn check_existing(
    State(state): State<AppState>,
    Path((subject_id, analysis_type)): Path<(String, String)>,
    Query(query): Query<ExistingQuery>,
) -> ApiResult<Json<ExistingResponse>> {
    let existing = state
        .orchestrator
        .versions()
        .check_existing(&subject_id, &analysis_type, query.within_hours)
        .await?;
    Ok(Json(ExistingResponse {
        exists: existing.is_some(),
        existing,
    }))
}

/// GET /analysis-results/:id
pub async fn get_analysis(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<AnalysisResult>> {
    state
        .orchestrator
        .versions()
        .load(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("analysis result {}", id)))
}

pub fn analysis_routes() -> Router<AppState> {
    Router::new()
        .route("/analyses/:subject_id/:analysis_type", get(list_versions))
        .route("/analyses/:subject_id/:analysis_type/latest", get(latest_version))
        .route("/analyses/:subject_id/:analysis_type/existing", get(check_existing))
        .route("/analysis-results/:id", get(get_analysis))
}
