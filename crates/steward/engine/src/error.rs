//! Engine errors
//!
//! Errors that end a run are rendered into `Run.error` through their
//! `Display` output, so those messages are part of the external contract.

use steward_storage::StorageError;
use steward_types::{
    DecisionError, GraphId, RequestId, RoutingError, RunId, RunStatus, TransitionError,
};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Graph '{graph_id}' is invalid: {reason}")]
    GraphInvalid { graph_id: GraphId, reason: String },

    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    #[error("Run {run_id} is {status}, not running")]
    NotRunning { run_id: RunId, status: RunStatus },

    /// Retries exhausted; carries the last executor error verbatim
    #[error("{0}")]
    StepExecution(String),

    #[error("{0}")]
    AmbiguousRouting(#[from] RoutingError),

    #[error("approval_timeout")]
    ApprovalTimeout(RequestId),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("Approval request {0} is already resolved")]
    AlreadyResolved(RequestId),

    #[error("Approver '{approver_id}' already decided on request {request_id}")]
    DuplicateApprover {
        request_id: RequestId,
        approver_id: String,
    },

    #[error("Invalid decision: {0}")]
    InvalidDecision(String),

    #[error("Run not found: {0}")]
    RunNotFound(RunId),

    #[error("Approval request not found: {0}")]
    RequestNotFound(RequestId),

    #[error("Run already exists: {0}")]
    RunAlreadyExists(RunId),

    #[error("Storage error: {0}")]
    Storage(StorageError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<StorageError> for EngineError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Decision(decision) => decision.into(),
            other => EngineError::Storage(other),
        }
    }
}

impl From<DecisionError> for EngineError {
    fn from(err: DecisionError) -> Self {
        match err {
            DecisionError::AlreadyResolved(id) => EngineError::AlreadyResolved(id),
            DecisionError::DuplicateApprover {
                request_id,
                approver_id,
            } => EngineError::DuplicateApprover {
                request_id,
                approver_id,
            },
            DecisionError::MissingApprover => {
                EngineError::InvalidDecision("approver_id must not be empty".into())
            }
        }
    }
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_messages_render_into_run_error() {
        assert_eq!(
            EngineError::ApprovalTimeout(RequestId::new("q")).to_string(),
            "approval_timeout"
        );
        assert_eq!(
            EngineError::Rejected("too risky".into()).to_string(),
            "rejected: too risky"
        );
        assert_eq!(
            EngineError::StepExecution("connection reset".into()).to_string(),
            "connection reset"
        );
    }

    #[test]
    fn test_storage_decision_errors_unwrap() {
        let err: EngineError =
            StorageError::Decision(DecisionError::AlreadyResolved(RequestId::new("q"))).into();
        assert!(matches!(err, EngineError::AlreadyResolved(_)));
        let err: EngineError = StorageError::Backend("down".into()).into();
        assert!(matches!(err, EngineError::Storage(_)));
    }
}
