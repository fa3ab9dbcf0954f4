//! critique-ai library interface
//!
//! Design-review analysis pipeline: jobs move through context, vision, ai and
//! synthesis stages over a durable event log. Exposed as a library so
//! integration tests can drive the pipeline without the HTTP server.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod providers;
pub mod services;
pub mod utils;

pub use crate::error::{ApiError, ApiResult, PipelineError, PipelineResult};

use axum::Router;
use chrono::{DateTime, Utc};
use critique_common::events::EventBus;
use services::{stage_queue, PipelineContext, StageOrchestrator, StageWorkerPool};
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    /// Event bus for SSE broadcasting
    pub event_bus: EventBus,
    pub orchestrator: Arc<StageOrchestrator>,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(db: SqlitePool, event_bus: EventBus, orchestrator: Arc<StageOrchestrator>) -> Self {
        Self {
            db,
            event_bus,
            orchestrator,
            startup_time: Utc::now(),
        }
    }
}

/// Orchestrator wired to an in-process worker pool
pub fn start_pipeline(
    ctx: PipelineContext,
    shutdown: CancellationToken,
) -> (Arc<StageOrchestrator>, StageWorkerPool) {
    let workers = ctx.pipeline.worker_count;
    let (dispatcher, rx) = stage_queue();
    let orchestrator = Arc::new(StageOrchestrator::new(ctx, Arc::new(dispatcher)));
    let pool = StageWorkerPool::spawn(Arc::clone(&orchestrator), rx, workers, shutdown);
    (orchestrator, pool)
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    use axum::routing::get;

    Router::new()
        .merge(api::job_routes())
        .merge(api::group_job_routes())
        .merge(api::analysis_routes())
        .merge(api::session_routes())
        .merge(api::maintenance_routes())
        .merge(api::health_routes())
        .route("/events", get(api::event_stream))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
