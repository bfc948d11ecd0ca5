//! Execution events: the ordered, replayable record of run transitions
//!
//! Events are for observation only. The engine never reads them back to
//! decide anything.

use crate::{RunId, StepId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The kind of transition an event records
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "run.started")]
    RunStarted,
    #[serde(rename = "step.started")]
    StepStarted,
    #[serde(rename = "step.completed")]
    StepCompleted,
    #[serde(rename = "step.failed")]
    StepFailed,
    #[serde(rename = "approval.requested")]
    ApprovalRequested,
    #[serde(rename = "approval.decided")]
    ApprovalDecided,
    #[serde(rename = "approval.escalated")]
    ApprovalEscalated,
    #[serde(rename = "mode.changed")]
    ModeChanged,
    #[serde(rename = "run.completed")]
    RunCompleted,
    #[serde(rename = "run.failed")]
    RunFailed,
    #[serde(rename = "run.cancelled")]
    RunCancelled,
}

impl EventType {
    pub const ALL: [EventType; 11] = [
        EventType::RunStarted,
        EventType::StepStarted,
        EventType::StepCompleted,
        EventType::StepFailed,
        EventType::ApprovalRequested,
        EventType::ApprovalDecided,
        EventType::ApprovalEscalated,
        EventType::ModeChanged,
        EventType::RunCompleted,
        EventType::RunFailed,
        EventType::RunCancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunStarted => "run.started",
            Self::StepStarted => "step.started",
            Self::StepCompleted => "step.completed",
            Self::StepFailed => "step.failed",
            Self::ApprovalRequested => "approval.requested",
            Self::ApprovalDecided => "approval.decided",
            Self::ApprovalEscalated => "approval.escalated",
            Self::ModeChanged => "mode.changed",
            Self::RunCompleted => "run.completed",
            Self::RunFailed => "run.failed",
            Self::RunCancelled => "run.cancelled",
        }
    }

    /// Whether this event closes the run's stream
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::RunCompleted | Self::RunFailed | Self::RunCancelled
        )
    }

    pub fn is_approval(&self) -> bool {
        matches!(
            self,
            Self::ApprovalRequested | Self::ApprovalDecided | Self::ApprovalEscalated
        )
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown event type: {s}"))
    }
}

/// An immutable record of one transition
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    /// Per-run sequence, strictly increasing from 1
    pub seq: u64,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub run_id: RunId,
    pub step_id: Option<StepId>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: Value,
}

impl ExecutionEvent {
    /// Create an unsequenced event; the event store assigns `seq`
    pub fn new(run_id: RunId, event_type: EventType) -> Self {
        Self {
            seq: 0,
            event_type,
            run_id,
            step_id: None,
            timestamp: Utc::now(),
            payload: Value::Object(Default::default()),
        }
    }

    pub fn with_step(mut self, step_id: StepId) -> Self {
        self.step_id = Some(step_id);
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.event_type.is_terminal()
    }
}
