//! In-memory reference implementation for Steward storage traits.
//!
//! This adapter is deterministic and test-friendly. Production deployments
//! should use a durable backend (e.g. PostgreSQL) so runs survive restarts.

use crate::traits::{ApprovalStore, CheckpointStore, EventStore, RunStore};
use crate::{StorageError, StorageResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;
use steward_types::{
    ApprovalRequest, ApprovalResponse, ApprovalStatus, Checkpoint, CheckpointId, ExecutionEvent,
    RequestId, Run, RunFilter, RunId, StepId,
};

#[derive(Default)]
struct CheckpointLog {
    entries: Vec<Checkpoint>,
    last_seq: u64,
}

/// In-memory Steward storage adapter.
#[derive(Default)]
pub struct InMemoryStewardStorage {
    runs: RwLock<HashMap<RunId, Run>>,
    checkpoints: RwLock<HashMap<RunId, CheckpointLog>>,
    approvals: RwLock<HashMap<RequestId, ApprovalRequest>>,
    events: RwLock<HashMap<RunId, Vec<ExecutionEvent>>>,
}

impl InMemoryStewardStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned(what: &str) -> StorageError {
    StorageError::Backend(format!("{what} lock poisoned"))
}

#[async_trait]
impl RunStore for InMemoryStewardStorage {
    async fn insert_run(&self, run: &Run) -> StorageResult<()> {
        let mut guard = self.runs.write().map_err(|_| poisoned("runs"))?;
        if guard.contains_key(&run.run_id) {
            tracing::debug!(run_id = %run.run_id, "Run insert conflict");
            return Err(StorageError::Conflict(format!(
                "run {} already exists",
                run.run_id
            )));
        }
        guard.insert(run.run_id.clone(), run.clone());
        Ok(())
    }

    async fn update_run(&self, run: &Run) -> StorageResult<()> {
        let mut guard = self.runs.write().map_err(|_| poisoned("runs"))?;
        let slot = guard
            .get_mut(&run.run_id)
            .ok_or_else(|| StorageError::NotFound(format!("run {} not found", run.run_id)))?;
        *slot = run.clone();
        Ok(())
    }

    async fn get_run(&self, run_id: &RunId) -> StorageResult<Option<Run>> {
        let guard = self.runs.read().map_err(|_| poisoned("runs"))?;
        Ok(guard.get(run_id).cloned())
    }

    async fn list_runs(&self, filter: &RunFilter) -> StorageResult<Vec<Run>> {
        let guard = self.runs.read().map_err(|_| poisoned("runs"))?;
        let mut values = guard
            .values()
            .filter(|run| filter.matches(run))
            .cloned()
            .collect::<Vec<_>>();
        values.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.run_id.cmp(&b.run_id))
        });
        if filter.limit > 0 {
            values.truncate(filter.limit);
        }
        Ok(values)
    }
}

#[async_trait]
impl CheckpointStore for InMemoryStewardStorage {
    async fn save_checkpoint(
        &self,
        run_id: &RunId,
        step_id: &StepId,
        state_blob: Value,
    ) -> StorageResult<CheckpointId> {
        let mut guard = self.checkpoints.write().map_err(|_| poisoned("checkpoints"))?;
        let log = guard.entry(run_id.clone()).or_default();
        log.last_seq += 1;
        let checkpoint = Checkpoint {
            checkpoint_id: CheckpointId::generate(),
            run_id: run_id.clone(),
            step_id: step_id.clone(),
            seq: log.last_seq,
            state_blob,
            created_at: Utc::now(),
        };
        let id = checkpoint.checkpoint_id.clone();
        log.entries.push(checkpoint);
        Ok(id)
    }

    async fn load_latest_checkpoint(&self, run_id: &RunId) -> StorageResult<Checkpoint> {
        let guard = self.checkpoints.read().map_err(|_| poisoned("checkpoints"))?;
        guard
            .get(run_id)
            .and_then(|log| log.entries.last())
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("no checkpoint for run {run_id}")))
    }

    async fn list_checkpoints(
        &self,
        run_id: &RunId,
        limit: usize,
    ) -> StorageResult<Vec<Checkpoint>> {
        let guard = self.checkpoints.read().map_err(|_| poisoned("checkpoints"))?;
        let mut values = guard
            .get(run_id)
            .map(|log| log.entries.iter().rev().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        if limit > 0 {
            values.truncate(limit);
        }
        Ok(values)
    }

    async fn delete_checkpoints(&self, run_id: &RunId) -> StorageResult<()> {
        let mut guard = self.checkpoints.write().map_err(|_| poisoned("checkpoints"))?;
        // Keep the sequence counter so later saves still sort after deleted ones
        if let Some(log) = guard.get_mut(run_id) {
            log.entries.clear();
        }
        Ok(())
    }
}

#[async_trait]
impl ApprovalStore for InMemoryStewardStorage {
    async fn open_request(&self, request: &ApprovalRequest) -> StorageResult<()> {
        let mut guard = self.approvals.write().map_err(|_| poisoned("approvals"))?;
        if !request.is_open() {
            return Err(StorageError::InvalidInput(format!(
                "request {} is not open",
                request.request_id
            )));
        }
        if guard.contains_key(&request.request_id) {
            tracing::debug!(request_id = %request.request_id, "Request insert conflict");
            return Err(StorageError::Conflict(format!(
                "request {} already exists",
                request.request_id
            )));
        }
        if let Some(existing) = guard
            .values()
            .find(|r| r.run_id == request.run_id && r.is_open())
        {
            tracing::warn!(
                run_id = %request.run_id,
                open = %existing.request_id,
                rejected = %request.request_id,
                "Second open approval request refused"
            );
            return Err(StorageError::Conflict(format!(
                "run {} already has open request {}",
                request.run_id, existing.request_id
            )));
        }
        guard.insert(request.request_id.clone(), request.clone());
        Ok(())
    }

    async fn get_request(&self, request_id: &RequestId) -> StorageResult<Option<ApprovalRequest>> {
        let guard = self.approvals.read().map_err(|_| poisoned("approvals"))?;
        Ok(guard.get(request_id).cloned())
    }

    async fn open_request_for_run(
        &self,
        run_id: &RunId,
    ) -> StorageResult<Option<ApprovalRequest>> {
        let guard = self.approvals.read().map_err(|_| poisoned("approvals"))?;
        Ok(guard
            .values()
            .find(|r| &r.run_id == run_id && r.is_open())
            .cloned())
    }

    async fn record_response(&self, response: ApprovalResponse) -> StorageResult<ApprovalRequest> {
        let mut guard = self.approvals.write().map_err(|_| poisoned("approvals"))?;
        let request = guard.get_mut(&response.request_id).ok_or_else(|| {
            StorageError::NotFound(format!("approval request {} not found", response.request_id))
        })?;
        request.apply_response(response)?;
        Ok(request.clone())
    }

    async fn escalate_request(
        &self,
        request_id: &RequestId,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<ApprovalRequest>> {
        let mut guard = self.approvals.write().map_err(|_| poisoned("approvals"))?;
        let request = guard.get_mut(request_id).ok_or_else(|| {
            StorageError::NotFound(format!("approval request {request_id} not found"))
        })?;
        Ok(request.escalate(now).map(|_| request.clone()))
    }

    async fn close_request(
        &self,
        request_id: &RequestId,
        status: ApprovalStatus,
        at: DateTime<Utc>,
    ) -> StorageResult<Option<ApprovalRequest>> {
        if !matches!(status, ApprovalStatus::Expired | ApprovalStatus::Cancelled) {
            return Err(StorageError::InvalidInput(format!(
                "requests are closed as {status} only by decisions"
            )));
        }
        let mut guard = self.approvals.write().map_err(|_| poisoned("approvals"))?;
        let request = guard.get_mut(request_id).ok_or_else(|| {
            StorageError::NotFound(format!("approval request {request_id} not found"))
        })?;
        Ok(request.close(status, at).then(|| request.clone()))
    }

    async fn list_open_requests(&self) -> StorageResult<Vec<ApprovalRequest>> {
        let guard = self.approvals.read().map_err(|_| poisoned("approvals"))?;
        let mut values = guard
            .values()
            .filter(|r| r.is_open())
            .cloned()
            .collect::<Vec<_>>();
        values.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(values)
    }

    async fn list_requests_for_run(&self, run_id: &RunId) -> StorageResult<Vec<ApprovalRequest>> {
        let guard = self.approvals.read().map_err(|_| poisoned("approvals"))?;
        let mut values = guard
            .values()
            .filter(|r| &r.run_id == run_id)
            .cloned()
            .collect::<Vec<_>>();
        values.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(values)
    }
}

#[async_trait]
impl EventStore for InMemoryStewardStorage {
    async fn append_event(&self, mut event: ExecutionEvent) -> StorageResult<ExecutionEvent> {
        let mut guard = self.events.write().map_err(|_| poisoned("events"))?;
        let log = guard.entry(event.run_id.clone()).or_default();
        event.seq = log.last().map(|e| e.seq).unwrap_or(0) + 1;
        log.push(event.clone());
        Ok(event)
    }

    async fn list_events(
        &self,
        run_id: &RunId,
        after_seq: u64,
    ) -> StorageResult<Vec<ExecutionEvent>> {
        let guard = self.events.read().map_err(|_| poisoned("events"))?;
        Ok(guard
            .get(run_id)
            .map(|log| {
                log.iter()
                    .filter(|e| e.seq > after_seq)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default())
    }

    async fn last_event(&self, run_id: &RunId) -> StorageResult<Option<ExecutionEvent>> {
        let guard = self.events.read().map_err(|_| poisoned("events"))?;
        Ok(guard.get(run_id).and_then(|log| log.last().cloned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use steward_types::{
        DecisionError, EventType, GraphId, Mode, ModeState, RiskLevel, RunEvent, RunStatus,
    };

    fn sample_run(id: &str) -> Run {
        Run::new(
            RunId::new(id),
            GraphId::new("g"),
            StepId::new("start"),
            ModeState::new(Mode::Supervised),
        )
    }

    fn sample_request(run: &str) -> ApprovalRequest {
        ApprovalRequest::new(RunId::new(run), StepId::new("pay"), "pay vendor")
            .with_risk(RiskLevel::High, 0.7)
            .with_required_approvers(1)
            .with_timeout(30)
    }

    #[tokio::test]
    async fn run_insert_conflicts_on_duplicate() {
        let storage = InMemoryStewardStorage::new();
        let run = sample_run("r1");
        storage.insert_run(&run).await.unwrap();
        let result = storage.insert_run(&run).await;
        assert!(matches!(result, Err(StorageError::Conflict(_))));
    }

    #[tokio::test]
    async fn run_update_requires_existing_record() {
        let storage = InMemoryStewardStorage::new();
        let mut run = sample_run("r1");
        assert!(matches!(
            storage.update_run(&run).await,
            Err(StorageError::NotFound(_))
        ));
        storage.insert_run(&run).await.unwrap();
        run.transition(RunEvent::Begin).unwrap();
        storage.update_run(&run).await.unwrap();
        let loaded = storage.get_run(&run.run_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Running);
    }

    #[tokio::test]
    async fn list_runs_applies_filter() {
        let storage = InMemoryStewardStorage::new();
        let mut done = sample_run("done");
        done.transition(RunEvent::Cancel).unwrap();
        storage.insert_run(&done).await.unwrap();
        storage.insert_run(&sample_run("live")).await.unwrap();

        let active = storage.list_runs(&RunFilter::active()).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].run_id, RunId::new("live"));
        let all = storage.list_runs(&RunFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn checkpoints_are_ordered_per_run() {
        let storage = InMemoryStewardStorage::new();
        let run = RunId::new("r1");
        let other = RunId::new("r2");
        for step in ["a", "b", "c"] {
            storage
                .save_checkpoint(&run, &StepId::new(step), json!({"at": step}))
                .await
                .unwrap();
        }
        storage
            .save_checkpoint(&other, &StepId::new("x"), json!({}))
            .await
            .unwrap();

        let latest = storage.load_latest_checkpoint(&run).await.unwrap();
        assert_eq!(latest.step_id, StepId::new("c"));
        assert_eq!(latest.seq, 3);

        let listed = storage.list_checkpoints(&run, 2).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].seq, 3);
        assert_eq!(listed[1].seq, 2);
        assert_eq!(storage.list_checkpoints(&run, 0).await.unwrap().len(), 3);

        storage.delete_checkpoints(&run).await.unwrap();
        assert!(matches!(
            storage.load_latest_checkpoint(&run).await,
            Err(StorageError::NotFound(_))
        ));
        assert_eq!(storage.load_latest_checkpoint(&other).await.unwrap().seq, 1);
    }

    #[tokio::test]
    async fn concurrent_saves_lose_no_updates() {
        let storage = Arc::new(InMemoryStewardStorage::new());
        let run = RunId::new("r1");
        let mut handles = Vec::new();
        for i in 0..16 {
            let storage = storage.clone();
            let run = run.clone();
            handles.push(tokio::spawn(async move {
                storage
                    .save_checkpoint(&run, &StepId::new(format!("s{i}")), json!(i))
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let all = storage.list_checkpoints(&run, 0).await.unwrap();
        let mut seqs = all.iter().map(|c| c.seq).collect::<Vec<_>>();
        seqs.sort_unstable();
        assert_eq!(seqs, (1..=16).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn one_open_request_per_run() {
        let storage = InMemoryStewardStorage::new();
        storage.open_request(&sample_request("r1")).await.unwrap();
        let second = storage.open_request(&sample_request("r1")).await;
        assert!(matches!(second, Err(StorageError::Conflict(_))));
        storage.open_request(&sample_request("r2")).await.unwrap();
        assert_eq!(storage.list_open_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn responses_close_exactly_once() {
        let storage = InMemoryStewardStorage::new();
        let request = sample_request("r1");
        let id = request.request_id.clone();
        storage.open_request(&request).await.unwrap();

        let closed = storage
            .record_response(ApprovalResponse::approve(id.clone(), "alice"))
            .await
            .unwrap();
        assert_eq!(closed.status, ApprovalStatus::Approved);

        let late = storage
            .record_response(ApprovalResponse::reject(id.clone(), "bob", "no"))
            .await;
        assert!(matches!(
            late,
            Err(StorageError::Decision(DecisionError::AlreadyResolved(_)))
        ));
        assert!(storage
            .close_request(&id, ApprovalStatus::Expired, Utc::now())
            .await
            .unwrap()
            .is_none());
        assert!(storage
            .open_request_for_run(&RunId::new("r1"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn escalation_stops_at_depth() {
        let storage = InMemoryStewardStorage::new();
        let request = sample_request("r1").with_escalation(vec!["leads".into()], 1);
        let id = request.request_id.clone();
        storage.open_request(&request).await.unwrap();

        let escalated = storage
            .escalate_request(&id, Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(escalated.escalation_level, 1);
        assert_eq!(escalated.approver_group, "leads");
        assert!(storage
            .escalate_request(&id, Utc::now())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn close_rejects_decision_statuses() {
        let storage = InMemoryStewardStorage::new();
        let request = sample_request("r1");
        storage.open_request(&request).await.unwrap();
        let result = storage
            .close_request(&request.request_id, ApprovalStatus::Approved, Utc::now())
            .await;
        assert!(matches!(result, Err(StorageError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn event_sequences_are_per_run() {
        let storage = InMemoryStewardStorage::new();
        let r1 = RunId::new("r1");
        let r2 = RunId::new("r2");
        let a = storage
            .append_event(ExecutionEvent::new(r1.clone(), EventType::RunStarted))
            .await
            .unwrap();
        let b = storage
            .append_event(ExecutionEvent::new(r2.clone(), EventType::RunStarted))
            .await
            .unwrap();
        let c = storage
            .append_event(ExecutionEvent::new(r1.clone(), EventType::StepStarted))
            .await
            .unwrap();
        assert_eq!((a.seq, b.seq, c.seq), (1, 1, 2));

        let replay = storage.list_events(&r1, 1).await.unwrap();
        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0].event_type, EventType::StepStarted);
    }

    #[tokio::test]
    async fn last_event_tracks_the_tail_of_each_run() {
        let storage = InMemoryStewardStorage::new();
        let run = RunId::new("r1");
        assert!(storage.last_event(&run).await.unwrap().is_none());

        for event_type in [EventType::RunStarted, EventType::StepStarted, EventType::RunCompleted] {
            storage
                .append_event(ExecutionEvent::new(run.clone(), event_type))
                .await
                .unwrap();
        }
        let last = storage.last_event(&run).await.unwrap().unwrap();
        assert_eq!(last.seq, 3);
        assert_eq!(last.event_type, EventType::RunCompleted);
        assert!(storage.last_event(&RunId::new("other")).await.unwrap().is_none());
    }
}
