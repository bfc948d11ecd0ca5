//! Health and status handlers

use crate::api::rest::state::AppState;
use crate::error::ApiResult;
use axum::{extract::State, Json};
use serde::Serialize;
use steward_types::{RunFilter, RunStatus};

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthCheckResponse {
    pub status: String,
    pub version: String,
    pub uptime: String,
}

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<HealthCheckResponse> {
    Json(HealthCheckResponse {
        status: "healthy".to_string(),
        version: state.version.clone(),
        uptime: state.uptime(),
    })
}

/// Daemon status response
#[derive(Debug, Serialize)]
pub struct DaemonStatusResponse {
    pub status: String,
    pub version: String,
    pub uptime: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub stats: DaemonStats,
}

#[derive(Debug, Serialize)]
pub struct DaemonStats {
    pub graphs: usize,
    pub active_runs: usize,
    pub running: usize,
    pub waiting_approval: usize,
    pub armed_timers: usize,
    pub pinned_graphs: usize,
}

/// Daemon status endpoint
pub async fn daemon_status(State(state): State<AppState>) -> ApiResult<Json<DaemonStatusResponse>> {
    let active = state.engine.list_runs(&RunFilter::active()).await?;
    let count = |status: RunStatus| active.iter().filter(|r| r.status == status).count();

    Ok(Json(DaemonStatusResponse {
        status: "healthy".to_string(),
        version: state.version.clone(),
        uptime: state.uptime(),
        started_at: state.started_at,
        stats: DaemonStats {
            graphs: state.engine.graphs().count(),
            active_runs: active.len(),
            running: count(RunStatus::Running),
            waiting_approval: count(RunStatus::WaitingApproval),
            armed_timers: state.engine.gateway().timers().len(),
            pinned_graphs: state.engine.pinned_runs(),
        },
    }))
}
