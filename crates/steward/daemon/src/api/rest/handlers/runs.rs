//! Run lifecycle handlers

use crate::api::rest::state::AppState;
use crate::error::{ApiError, ApiResult};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use steward_engine::{IntentRequest, RequestKind, RunHandle, StartRequest};
use steward_types::{
    ApprovalRequest, Checkpoint, GraphId, Mode, RiskLevel, Run, RunFilter, RunId, RunStatus,
};

/// Start run request
#[derive(Debug, Deserialize)]
pub struct StartRunRequest {
    /// Graph id or name
    pub graph: String,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub requester: Option<String>,
    /// Explicit mode; otherwise the intent router decides
    #[serde(default)]
    pub mode: Option<Mode>,
    #[serde(default)]
    pub kind: RequestKind,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub requester_risk: Option<f64>,
}

impl From<StartRunRequest> for StartRequest {
    fn from(request: StartRunRequest) -> Self {
        let mut start = StartRequest::new(request.graph).with_input(request.input);
        if let Some(run_id) = request.run_id {
            start = start.with_run_id(RunId::new(run_id));
        }
        if let Some(requester) = request.requester {
            start = start.with_requester(requester);
        }
        start.intent = IntentRequest {
            explicit_mode: request.mode,
            requester: start.requester.clone(),
            requester_risk: request.requester_risk,
            kind: request.kind,
            text: request.text,
        };
        start
    }
}

/// Start a run and drive it in the background
pub async fn start_run(
    State(state): State<AppState>,
    Json(request): Json<StartRunRequest>,
) -> ApiResult<(StatusCode, Json<RunHandle>)> {
    if state.engine.graphs().resolve(&request.graph).is_none() {
        return Err(ApiError::NotFound(format!(
            "Graph {} not found",
            request.graph
        )));
    }

    let handle = state.engine.start(request.into()).await?;
    state.engine.spawn_driver(handle.run_id.clone());

    Ok((StatusCode::ACCEPTED, Json(handle)))
}

/// List runs query params
#[derive(Debug, Default, Deserialize)]
pub struct ListRunsQuery {
    pub status: Option<RunStatus>,
    pub graph_id: Option<String>,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub limit: usize,
}

/// List runs
pub async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<ListRunsQuery>,
) -> ApiResult<Json<Vec<Run>>> {
    let filter = RunFilter {
        status: query.status,
        graph_id: query.graph_id.map(GraphId::new),
        active_only: query.active,
        limit: query.limit,
    };
    Ok(Json(state.engine.list_runs(&filter).await?))
}

/// A run with its open approval request, if paused
#[derive(Debug, Serialize)]
pub struct RunView {
    #[serde(flatten)]
    pub run: Run,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval: Option<ApprovalRequest>,
}

/// Get a run
pub async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<RunView>> {
    let run_id = RunId::new(run_id);
    let run = state.engine.get_run(&run_id).await?;
    let approval = if run.status == RunStatus::WaitingApproval {
        state.engine.open_request(&run_id).await?
    } else {
        None
    };
    Ok(Json(RunView { run, approval }))
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelRunRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

/// Cancel a run. Waits for an in-flight step to stop.
pub async fn cancel_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    body: Option<Json<CancelRunRequest>>,
) -> ApiResult<Json<Run>> {
    let reason = body
        .and_then(|Json(body)| body.reason)
        .unwrap_or_else(|| "cancelled by operator".to_string());
    let run = state.engine.cancel(&RunId::new(run_id), &reason).await?;
    Ok(Json(run))
}

#[derive(Debug, Deserialize)]
pub struct SwitchModeRequest {
    pub mode: Mode,
    /// Hybrid threshold; keeps the current one when absent
    #[serde(default)]
    pub threshold: Option<RiskLevel>,
}

/// Change a run's mode. Takes effect at the next gate check.
pub async fn switch_mode(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Json(request): Json<SwitchModeRequest>,
) -> ApiResult<Json<Run>> {
    let run = state
        .engine
        .switch_mode(&RunId::new(run_id), request.mode, request.threshold)
        .await?;
    Ok(Json(run))
}

#[derive(Debug, Deserialize)]
pub struct ListCheckpointsQuery {
    #[serde(default = "default_checkpoint_limit")]
    pub limit: usize,
}

fn default_checkpoint_limit() -> usize {
    20
}

/// Latest checkpoints of a run, newest first
pub async fn list_checkpoints(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Query(query): Query<ListCheckpointsQuery>,
) -> ApiResult<Json<Vec<Checkpoint>>> {
    let run_id = RunId::new(run_id);
    state.engine.get_run(&run_id).await?;
    Ok(Json(
        state.engine.list_checkpoints(&run_id, query.limit).await?,
    ))
}
