//! Runs: one execution of a step graph
//!
//! A run owns exactly one cursor (the current step) and a status. Both change
//! only through [`RunStatus::apply`] and the engine that drives it.

use crate::{GraphId, RequestId, RiskLevel, StepId, TransitionError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

// ── Identifiers ──────────────────────────────────────────────────────

/// Unique identifier for a run
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        &self.0[..8.min(self.0.len())]
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── State machine ────────────────────────────────────────────────────

/// Lifecycle status of a run
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    WaitingApproval,
    Completed,
    Failed,
    Cancelled,
}

/// Events that drive the run state machine
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEvent {
    Begin,
    Gate,
    Approve,
    Reject,
    Complete,
    Fail,
    Cancel,
}

impl RunStatus {
    pub const ALL: [RunStatus; 6] = [
        RunStatus::Pending,
        RunStatus::Running,
        RunStatus::WaitingApproval,
        RunStatus::Completed,
        RunStatus::Failed,
        RunStatus::Cancelled,
    ];

    /// Apply an event. Pairs outside the transition table are errors.
    pub fn apply(self, event: RunEvent) -> Result<RunStatus, TransitionError> {
        use RunEvent::*;
        use RunStatus::*;

        let next = match (self, event) {
            (Pending, Begin) => Running,
            (Running, RunEvent::Gate) => WaitingApproval,
            (WaitingApproval, Approve) => Running,
            (WaitingApproval, Reject) => Failed,
            (Running, Complete) => Completed,
            (Running | WaitingApproval, Fail) => Failed,
            (Pending | Running | WaitingApproval, Cancel) => Cancelled,
            (from, event) => return Err(TransitionError { from, event }),
        };
        Ok(next)
    }

    /// Terminal states absorb every event
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::WaitingApproval => "waiting_approval",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown run status: {s}"))
    }
}

impl RunEvent {
    pub const ALL: [RunEvent; 7] = [
        RunEvent::Begin,
        RunEvent::Gate,
        RunEvent::Approve,
        RunEvent::Reject,
        RunEvent::Complete,
        RunEvent::Fail,
        RunEvent::Cancel,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Begin => "begin",
            Self::Gate => "gate",
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::Complete => "complete",
            Self::Fail => "fail",
            Self::Cancel => "cancel",
        }
    }
}

impl std::fmt::Display for RunEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Modes ────────────────────────────────────────────────────────────

/// How cautiously a run executes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Chat style: only critical steps are gated
    Autonomous,
    /// Workflow style: medium and above are gated
    Supervised,
    /// Gated at or above an adjustable threshold
    #[default]
    Hybrid,
}

impl Mode {
    /// Whether a step assessed at `level` must wait for approval
    pub fn gates(&self, level: RiskLevel, hybrid_threshold: RiskLevel) -> bool {
        match self {
            Self::Autonomous => level == RiskLevel::Critical,
            Self::Supervised => level >= RiskLevel::Medium,
            Self::Hybrid => level >= hybrid_threshold,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Autonomous => "autonomous",
            Self::Supervised => "supervised",
            Self::Hybrid => "hybrid",
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "autonomous" | "chat" => Ok(Self::Autonomous),
            "supervised" | "workflow" => Ok(Self::Supervised),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(format!("unknown mode: {other}")),
        }
    }
}

/// Active mode together with the hybrid gating threshold
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeState {
    pub mode: Mode,
    pub hybrid_threshold: RiskLevel,
}

impl ModeState {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            hybrid_threshold: RiskLevel::High,
        }
    }

    pub fn hybrid(threshold: RiskLevel) -> Self {
        Self {
            mode: Mode::Hybrid,
            hybrid_threshold: threshold,
        }
    }

    pub fn gates(&self, level: RiskLevel) -> bool {
        self.mode.gates(level, self.hybrid_threshold)
    }
}

impl std::fmt::Display for ModeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.mode {
            Mode::Hybrid => write!(f, "hybrid@{}", self.hybrid_threshold),
            mode => write!(f, "{mode}"),
        }
    }
}

// ── Run ──────────────────────────────────────────────────────────────

/// One execution of a step graph
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: RunId,
    pub graph_id: GraphId,
    pub status: RunStatus,
    pub mode: Mode,
    /// Gating threshold while in hybrid mode
    pub hybrid_threshold: RiskLevel,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Output of the terminal step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The current step pointer
    pub cursor: StepId,
    #[serde(default)]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester: Option<String>,
    /// Outputs of completed steps
    #[serde(default)]
    pub outputs: BTreeMap<StepId, Value>,
    /// Steps completed, in execution order
    #[serde(default)]
    pub trail: Vec<StepId>,
    /// Step whose gate check already passed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate_cleared: Option<StepId>,
    /// Consecutive approvals since the last rejection or mode change
    #[serde(default)]
    pub approval_streak: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_request: Option<RequestId>,
}

impl Run {
    /// Create a pending run positioned at the start step
    pub fn new(run_id: RunId, graph_id: GraphId, start: StepId, mode: ModeState) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            graph_id,
            status: RunStatus::Pending,
            mode: mode.mode,
            hybrid_threshold: mode.hybrid_threshold,
            created_at: now,
            updated_at: now,
            completed_at: None,
            result: None,
            error: None,
            cursor: start,
            input: Value::Null,
            requester: None,
            outputs: BTreeMap::new(),
            trail: Vec::new(),
            gate_cleared: None,
            approval_streak: 0,
            open_request: None,
        }
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    pub fn with_requester(mut self, requester: impl Into<String>) -> Self {
        self.requester = Some(requester.into());
        self
    }

    /// Apply a state machine event. On error the run is left untouched.
    pub fn transition(&mut self, event: RunEvent) -> Result<RunStatus, TransitionError> {
        let next = self.status.apply(event)?;
        let now = Utc::now();
        self.status = next;
        self.updated_at = now;
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        Ok(next)
    }

    pub fn mode_state(&self) -> ModeState {
        ModeState {
            mode: self.mode,
            hybrid_threshold: self.hybrid_threshold,
        }
    }

    pub fn set_mode_state(&mut self, state: ModeState) {
        self.mode = state.mode;
        self.hybrid_threshold = state.hybrid_threshold;
        self.updated_at = Utc::now();
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether the current step already passed its gate check
    pub fn cursor_cleared(&self) -> bool {
        self.gate_cleared.as_ref() == Some(&self.cursor)
    }

    /// Output of the most recently completed step
    pub fn last_output(&self) -> Option<&Value> {
        self.trail.last().and_then(|id| self.outputs.get(id))
    }
}

/// Query filter for listing runs
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph_id: Option<GraphId>,
    /// Only non-terminal runs
    #[serde(default)]
    pub active_only: bool,
    /// Zero means unbounded
    #[serde(default)]
    pub limit: usize,
}

impl RunFilter {
    pub fn active() -> Self {
        Self {
            active_only: true,
            ..Default::default()
        }
    }

    pub fn matches(&self, run: &Run) -> bool {
        if self.active_only && run.is_terminal() {
            return false;
        }
        if let Some(status) = self.status {
            if run.status != status {
                return false;
            }
        }
        if let Some(graph_id) = &self.graph_id {
            if &run.graph_id != graph_id {
                return false;
            }
        }
        true
    }
}
