//! Health check endpoint

use axum::{extract::State, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::config::ProviderRole;
use crate::providers::BreakerState;
use crate::AppState;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// "ok", or "degraded" while any breaker is open
    pub status: String,
    pub module: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub providers: Vec<ProviderHealth>,
}

#[derive(Debug, Serialize)]
pub struct ProviderHealth {
    pub operation_key: String,
    pub role: ProviderRole,
    /// `closed` until the key is first invoked
    pub breaker: BreakerState,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime = Utc::now().signed_duration_since(state.startup_time);
    let uptime_seconds = uptime.num_seconds().max(0) as u64;

    let gateway = state.orchestrator.gateway();
    let providers: Vec<ProviderHealth> = [ProviderRole::Context, ProviderRole::Vision, ProviderRole::Ai]
        .into_iter()
        .flat_map(|role| gateway.bindings_for(role))
        .map(|binding| {
            let operation_key = binding.operation_key();
            ProviderHealth {
                breaker: gateway
                    .breaker_state(&operation_key)
                    .unwrap_or(BreakerState::Closed),
                role: binding.role,
                operation_key,
            }
        })
        .collect();

    let status = if providers.iter().any(|p| p.breaker == BreakerState::Open) {
        "degraded"
    } else {
        "ok"
    };

    Json(HealthResponse {
        status: status.to_string(),
        module: "critique-ai".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds,
        providers,
    })
}

pub fn health_routes() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
