use crate::StorageResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use steward_types::{
    ApprovalRequest, ApprovalResponse, ApprovalStatus, Checkpoint, CheckpointId, ExecutionEvent,
    RequestId, Run, RunFilter, RunId, StepId,
};

/// Storage interface for run records.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Insert a new run. Fails with `Conflict` if the id is taken.
    async fn insert_run(&self, run: &Run) -> StorageResult<()>;

    /// Replace the stored state of an existing run.
    async fn update_run(&self, run: &Run) -> StorageResult<()>;

    async fn get_run(&self, run_id: &RunId) -> StorageResult<Option<Run>>;

    /// List runs newest-first.
    async fn list_runs(&self, filter: &RunFilter) -> StorageResult<Vec<Run>>;
}

/// Storage interface for append-only run checkpoints.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Append a checkpoint. Concurrent saves for one run are serialised and
    /// receive strictly increasing sequence numbers.
    async fn save_checkpoint(
        &self,
        run_id: &RunId,
        step_id: &StepId,
        state_blob: Value,
    ) -> StorageResult<CheckpointId>;

    /// The authoritative checkpoint for a run. `NotFound` if none exist.
    async fn load_latest_checkpoint(&self, run_id: &RunId) -> StorageResult<Checkpoint>;

    /// Checkpoints newest-first. A limit of zero returns all of them.
    async fn list_checkpoints(&self, run_id: &RunId, limit: usize)
        -> StorageResult<Vec<Checkpoint>>;

    /// Remove every checkpoint of a run.
    async fn delete_checkpoints(&self, run_id: &RunId) -> StorageResult<()>;
}

/// Storage interface for approval requests.
#[async_trait]
pub trait ApprovalStore: Send + Sync {
    /// Persist a new open request. Fails with `Conflict` if the run already
    /// has an open request.
    async fn open_request(&self, request: &ApprovalRequest) -> StorageResult<()>;

    async fn get_request(&self, request_id: &RequestId) -> StorageResult<Option<ApprovalRequest>>;

    async fn open_request_for_run(&self, run_id: &RunId)
        -> StorageResult<Option<ApprovalRequest>>;

    /// Record a vote atomically and return the updated request.
    ///
    /// Votes against a closed request fail with `AlreadyResolved`, so at most
    /// one caller ever observes the transition out of `open`.
    async fn record_response(&self, response: ApprovalResponse) -> StorageResult<ApprovalRequest>;

    /// Move an open request to its next escalation tier.
    /// Returns `None` if the request is closed or has no tier left.
    async fn escalate_request(
        &self,
        request_id: &RequestId,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<ApprovalRequest>>;

    /// Close an open request as expired or cancelled.
    /// Returns `None` if it was already closed.
    async fn close_request(
        &self,
        request_id: &RequestId,
        status: ApprovalStatus,
        at: DateTime<Utc>,
    ) -> StorageResult<Option<ApprovalRequest>>;

    async fn list_open_requests(&self) -> StorageResult<Vec<ApprovalRequest>>;

    /// Every request of a run, oldest first.
    async fn list_requests_for_run(&self, run_id: &RunId) -> StorageResult<Vec<ApprovalRequest>>;
}

/// Storage interface for per-run execution events.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append an event, assigning the run's next sequence number.
    async fn append_event(&self, event: ExecutionEvent) -> StorageResult<ExecutionEvent>;

    /// Events of a run with `seq > after_seq`, in sequence order.
    async fn list_events(&self, run_id: &RunId, after_seq: u64)
        -> StorageResult<Vec<ExecutionEvent>>;

    /// The run's highest-sequence event, if any.
    async fn last_event(&self, run_id: &RunId) -> StorageResult<Option<ExecutionEvent>>;
}

/// Unified storage bundle used by the engine and daemon.
pub trait StewardStorage: RunStore + CheckpointStore + ApprovalStore + EventStore + Send + Sync {}

impl<T> StewardStorage for T where T: RunStore + CheckpointStore + ApprovalStore + EventStore + Send + Sync {}
