//! Error types for the Steward domain layer

use crate::{RequestId, RunEvent, RunStatus, StepId};

/// Structural defects in a step graph
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GraphError {
    #[error("Graph must have at least one step")]
    Empty,

    #[error("No start step defined")]
    NoStartStep,

    #[error("Graph must have exactly one start step, found {0}")]
    MultipleStartSteps(usize),

    #[error("No terminal step defined")]
    NoTerminalStep,

    #[error("Duplicate step ID: {0}")]
    DuplicateStepId(StepId),

    #[error("Step not found: {0}")]
    StepNotFound(StepId),

    #[error("Duplicate edge: {from} -> {to}")]
    DuplicateEdge { from: StepId, to: StepId },

    #[error("Disconnected graph: step '{0}' is unreachable from the start step")]
    Unreachable(StepId),

    #[error("Step '{0}' is not terminal but has no outgoing edges")]
    DeadEnd(StepId),

    #[error("Terminal step '{0}' must not have outgoing edges")]
    TerminalHasEdges(StepId),

    #[error("Step '{0}' mixes static and conditional edges")]
    MixedRouting(StepId),

    #[error("Step '{0}' has more than one static edge")]
    MultipleStaticEdges(StepId),

    #[error("Invalid condition on edge {from} -> {to}: {reason}")]
    InvalidCondition {
        from: StepId,
        to: StepId,
        reason: String,
    },
}

/// Routing failures discovered while advancing a run
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RoutingError {
    #[error("Ambiguous routing from step '{step}': {matched} conditional edges matched")]
    Ambiguous { step: StepId, matched: usize },

    #[error("Step not found: {0}")]
    StepNotFound(StepId),
}

/// A (state, event) pair outside the run transition table
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Invalid transition: cannot apply '{event}' to a run in state '{from}'")]
pub struct TransitionError {
    pub from: RunStatus,
    pub event: RunEvent,
}

/// A decision that cannot be recorded against an approval request
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecisionError {
    #[error("Approval request {0} is already resolved")]
    AlreadyResolved(RequestId),

    #[error("Approver '{approver_id}' already decided on request {request_id}")]
    DuplicateApprover {
        request_id: RequestId,
        approver_id: String,
    },

    #[error("Approver id must not be empty")]
    MissingApprover,
}

/// Result type alias for graph operations
pub type GraphResult<T> = Result<T, GraphError>;
