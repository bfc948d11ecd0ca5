//! Approval decision handlers

use crate::api::rest::state::AppState;
use crate::error::{ApiError, ApiResult};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use steward_engine::DecisionReceipt;
use steward_types::{ApprovalRequest, ApprovalResponse, RequestId, RunId, RunStatus};

/// Decision body
#[derive(Debug, Deserialize)]
pub struct DecisionRequest {
    pub approved: bool,
    #[serde(default)]
    pub reason: String,
    pub approver_id: String,
}

/// Record a decision. A run that resumes is driven in the background.
pub async fn submit_decision(
    State(state): State<AppState>,
    Path((run_id, request_id)): Path<(String, String)>,
    Json(decision): Json<DecisionRequest>,
) -> ApiResult<(StatusCode, Json<DecisionReceipt>)> {
    if decision.approver_id.trim().is_empty() {
        return Err(ApiError::BadRequest("approver_id must not be empty".into()));
    }
    let run_id = RunId::new(run_id);
    let request_id = RequestId::new(request_id);

    let response = if decision.approved {
        ApprovalResponse::approve(request_id.clone(), decision.approver_id)
            .with_reason(decision.reason)
    } else {
        ApprovalResponse::reject(request_id.clone(), decision.approver_id, decision.reason)
    };

    let receipt = state
        .engine
        .submit_decision(&run_id, &request_id, response)
        .await?;
    if receipt.run_status == RunStatus::Running {
        state.engine.spawn_driver(run_id);
    }

    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

/// All approval requests of a run, oldest first
pub async fn list_run_approvals(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<Vec<ApprovalRequest>>> {
    let run_id = RunId::new(run_id);
    state.engine.get_run(&run_id).await?;
    Ok(Json(state.engine.list_requests(&run_id).await?))
}

/// Get an approval request
pub async fn get_approval(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
) -> ApiResult<Json<ApprovalRequest>> {
    Ok(Json(
        state
            .engine
            .get_request(&RequestId::new(request_id))
            .await?,
    ))
}
