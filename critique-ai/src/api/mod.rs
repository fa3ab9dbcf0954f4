//! HTTP API handlers for critique-ai
//!
//! REST endpoints for jobs, group jobs, results and maintenance, plus an SSE
//! stream of pipeline progress.

pub mod analyses;
pub mod group_jobs;
pub mod health;
pub mod jobs;
pub mod maintenance;
pub mod sessions;
pub mod sse;

pub use analyses::analysis_routes;
pub use group_jobs::group_job_routes;
pub use health::health_routes;
pub use jobs::job_routes;
pub use maintenance::maintenance_routes;
pub use sessions::session_routes;
pub use sse::event_stream;

use crate::error::{ApiError, ApiResult};
use crate::models::Stage;
use serde::Serialize;
use uuid::Uuid;

/// Accepted-for-processing response shared by create, cancel and retry
#[derive(Debug, Serialize)]
pub struct JobAccepted {
    pub id: Uuid,
    pub status: crate::models::JobStatus,
    pub current_stage: Stage,
    pub attempt: u32,
}

impl JobAccepted {
    pub fn new(id: Uuid, state: &crate::models::JobState) -> Self {
        Self {
            id,
            status: state.status,
            current_stage: state.current_stage,
            attempt: state.attempt,
        }
    }
}

/// Path segment → work stage
pub(crate) fn parse_stage(raw: &str) -> ApiResult<Stage> {
    let stage: Stage = raw.parse().map_err(ApiError::BadRequest)?;
    if !stage.is_work_stage() {
        return Err(ApiError::BadRequest(format!("{} is not a runnable stage", stage)));
    }
    Ok(stage)
}
