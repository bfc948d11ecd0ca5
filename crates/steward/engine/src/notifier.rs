//! Notification capability used by the approval gateway

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use steward_types::{ApprovalRequest, RequestId, RiskLevel, RunId, StepId};

/// What approvers are told about a pending request
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestSummary {
    pub request_id: RequestId,
    pub run_id: RunId,
    pub step_id: StepId,
    pub action: String,
    pub risk_level: RiskLevel,
    pub risk_score: f64,
    pub required_approvers: u32,
    pub timeout_seconds: u64,
    pub escalation_level: u32,
    pub message: String,
}

impl From<&ApprovalRequest> for RequestSummary {
    fn from(request: &ApprovalRequest) -> Self {
        Self {
            request_id: request.request_id.clone(),
            run_id: request.run_id.clone(),
            step_id: request.step_id.clone(),
            action: request.action.clone(),
            risk_level: request.risk_level,
            risk_score: request.risk_score,
            required_approvers: request.required_approvers,
            timeout_seconds: request.timeout_seconds,
            escalation_level: request.escalation_level,
            message: request.summary(),
        }
    }
}

/// Notification failure. Never fatal to the gate.
#[derive(Debug, Clone, thiserror::Error)]
#[error("notification to '{group}' failed: {reason}")]
pub struct NotifyError {
    pub group: String,
    pub reason: String,
}

/// Best-effort delivery of approval notifications
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, approver_group: &str, summary: &RequestSummary)
        -> Result<(), NotifyError>;
}

/// Writes notifications to the log
#[derive(Clone, Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(
        &self,
        approver_group: &str,
        summary: &RequestSummary,
    ) -> Result<(), NotifyError> {
        tracing::info!(
            approver_group,
            request_id = %summary.request_id,
            run_id = %summary.run_id,
            step_id = %summary.step_id,
            risk_level = %summary.risk_level,
            escalation_level = summary.escalation_level,
            "{}",
            summary.message
        );
        Ok(())
    }
}
