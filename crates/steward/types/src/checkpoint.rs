//! Checkpoints: durable snapshots sufficient to resume a run

use crate::{RunId, StepId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Unique identifier for a checkpoint
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckpointId(pub String);

impl CheckpointId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A snapshot of run state.
///
/// `state_blob` is opaque to stores: only the engine's serializer reads it.
/// `seq` increases strictly per run, so the highest `seq` is authoritative.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_id: CheckpointId,
    pub run_id: RunId,
    pub step_id: StepId,
    /// Per-run ordering assigned by the store on save
    pub seq: u64,
    pub state_blob: Value,
    pub created_at: DateTime<Utc>,
}
