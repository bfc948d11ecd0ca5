//! The execution engine: drives runs through their step graphs
//!
//! Every mutation of a run happens under that run's async lock, loads the
//! run from the [`RunStore`], applies one state machine event and persists
//! the result before any event is published. Runs never share a lock.
//!
//! A run that is waiting for approval holds no lock and no task; the open
//! request's timer and [`ExecutionEngine::submit_decision`] move it on.

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::event_bridge::{EventBridge, EventStream};
use crate::executor::{CancelToken, StepError, StepExecutor, StepInput};
use crate::gateway::{ApprovalGateway, TimeoutOutcome};
use crate::notifier::{LogNotifier, Notifier, RequestSummary};
use crate::registry::GraphRegistry;
use crate::risk::{RiskAssessmentEngine, RiskConfig, RiskContext};
use crate::router::{IntentRequest, IntentRouter, RouterConfig};
use crate::switcher::{ModeSwitcher, Signal, SwitchDecision, SwitcherConfig};
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use steward_storage::{
    ApprovalStore, CheckpointStore, EventStore, InMemoryStewardStorage, RunStore, StewardStorage,
    StorageError,
};
use steward_types::{
    ApprovalRequest, ApprovalResponse, ApprovalStatus, Checkpoint, EventType, ExecutionEvent,
    GraphId, Mode, ModeState, RejectionPolicy, RequestId, RiskAssessment, RiskLevel, Run,
    RunEvent, RunFilter, RunId, RunStatus, StepGraph, StepId, StepNode, TransitionError,
};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;

// ── Public types ─────────────────────────────────────────────────────

/// Parameters for starting a run
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StartRequest {
    /// Caller-chosen run id; generated when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    /// Graph id, or the name of a registered graph
    pub graph: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester: Option<String>,
    /// Signals used to pick the initial mode
    #[serde(default)]
    pub intent: IntentRequest,
}

impl StartRequest {
    pub fn new(graph: impl Into<String>) -> Self {
        Self {
            graph: graph.into(),
            ..Default::default()
        }
    }

    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.intent.explicit_mode = Some(mode);
        self
    }

    pub fn with_requester(mut self, requester: impl Into<String>) -> Self {
        self.requester = Some(requester.into());
        self
    }
}

/// Returned by [`ExecutionEngine::start`]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunHandle {
    pub run_id: RunId,
    pub graph_id: GraphId,
    pub status: RunStatus,
    pub mode: ModeState,
}

/// Result of one [`ExecutionEngine::step`]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    /// The step ran and the cursor moved to `next`
    Advanced { next: StepId },
    /// The step was gated and nothing ran
    AwaitingApproval { request_id: RequestId },
    Completed { result: Value },
    Failed { error: String },
    /// The executor observed cancellation; `cancel` finalises the run
    Cancelled,
}

/// Outcome of a human decision passed to [`ExecutionEngine::resume`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Approve,
    Reject { reason: String },
}

/// Returned by [`ExecutionEngine::submit_decision`]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DecisionReceipt {
    pub request: ApprovalRequest,
    pub run_status: RunStatus,
}

/// Checkpoint blob layout
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckpointState {
    pub run: Run,
    /// Snapshot of the open request when the checkpoint was taken at a gate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_request: Option<ApprovalRequest>,
    /// The graph definition the run is pinned to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph: Option<StepGraph>,
}

impl CheckpointState {
    pub fn decode(checkpoint: &Checkpoint) -> EngineResult<Self> {
        Ok(serde_json::from_value(checkpoint.state_blob.clone())?)
    }
}

// ── Builder ──────────────────────────────────────────────────────────

pub struct ExecutionEngineBuilder {
    executor: Arc<dyn StepExecutor>,
    runs: Option<Arc<dyn RunStore>>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    approvals: Option<Arc<dyn ApprovalStore>>,
    events: Option<Arc<dyn EventStore>>,
    notifier: Arc<dyn Notifier>,
    risk: Option<Arc<dyn RiskAssessmentEngine>>,
    router: Option<Arc<dyn IntentRouter>>,
    switcher: SwitcherConfig,
    graphs: Option<Arc<GraphRegistry>>,
    config: EngineConfig,
}

impl ExecutionEngineBuilder {
    pub fn new(executor: Arc<dyn StepExecutor>) -> Self {
        Self {
            executor,
            runs: None,
            checkpoints: None,
            approvals: None,
            events: None,
            notifier: Arc::new(LogNotifier),
            risk: None,
            router: None,
            switcher: SwitcherConfig::default(),
            graphs: None,
            config: EngineConfig::default(),
        }
    }

    /// Use one backend for every store
    pub fn with_storage<S: StewardStorage + 'static>(mut self, storage: Arc<S>) -> Self {
        self.runs = Some(storage.clone());
        self.checkpoints = Some(storage.clone());
        self.approvals = Some(storage.clone());
        self.events = Some(storage);
        self
    }

    pub fn with_run_store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.runs = Some(store);
        self
    }

    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    pub fn with_approval_store(mut self, store: Arc<dyn ApprovalStore>) -> Self {
        self.approvals = Some(store);
        self
    }

    pub fn with_event_store(mut self, store: Arc<dyn EventStore>) -> Self {
        self.events = Some(store);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_risk_engine(mut self, risk: Arc<dyn RiskAssessmentEngine>) -> Self {
        self.risk = Some(risk);
        self
    }

    pub fn with_router(mut self, router: Arc<dyn IntentRouter>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn with_switcher(mut self, config: SwitcherConfig) -> Self {
        self.switcher = config;
        self
    }

    pub fn with_graphs(mut self, graphs: Arc<GraphRegistry>) -> Self {
        self.graphs = Some(graphs);
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Stores left unset share one in-memory backend
    pub fn build(self) -> ExecutionEngine {
        let fallback = Arc::new(InMemoryStewardStorage::new());
        let runs: Arc<dyn RunStore> = match self.runs {
            Some(store) => store,
            None => fallback.clone(),
        };
        let checkpoints: Arc<dyn CheckpointStore> = match self.checkpoints {
            Some(store) => store,
            None => fallback.clone(),
        };
        let approvals: Arc<dyn ApprovalStore> = match self.approvals {
            Some(store) => store,
            None => fallback.clone(),
        };
        let events: Arc<dyn EventStore> = match self.events {
            Some(store) => store,
            None => fallback,
        };

        ExecutionEngine {
            inner: Arc::new(Inner {
                graphs: self.graphs.unwrap_or_default(),
                runs,
                checkpoints,
                approvals: approvals.clone(),
                bridge: EventBridge::new(events, self.config.event_buffer),
                gateway: ApprovalGateway::new(
                    approvals,
                    self.notifier,
                    self.config.approvals.clone(),
                ),
                risk: self.risk.unwrap_or_else(|| RiskConfig::default().build()),
                router: self.router.unwrap_or_else(|| RouterConfig::default().build()),
                switcher: ModeSwitcher::new(self.switcher),
                executor: self.executor,
                config: self.config,
                locks: DashMap::new(),
                cancels: DashMap::new(),
                pins: DashMap::new(),
            }),
        }
    }
}

// ── Engine ───────────────────────────────────────────────────────────

struct Inner {
    graphs: Arc<GraphRegistry>,
    runs: Arc<dyn RunStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    approvals: Arc<dyn ApprovalStore>,
    bridge: EventBridge,
    gateway: ApprovalGateway,
    risk: Arc<dyn RiskAssessmentEngine>,
    router: Arc<dyn IntentRouter>,
    switcher: ModeSwitcher,
    executor: Arc<dyn StepExecutor>,
    config: EngineConfig,
    locks: DashMap<RunId, Arc<Mutex<()>>>,
    cancels: DashMap<RunId, CancelToken>,
    /// Graph each live run resolved at start; re-registration does not reach these
    pins: DashMap<RunId, Arc<StepGraph>>,
}

/// Cheap to clone; clones share all state
#[derive(Clone)]
pub struct ExecutionEngine {
    inner: Arc<Inner>,
}

/// A completed mode switch, published after the run is persisted
struct ModeChange {
    from: ModeState,
    to: ModeState,
    reason: &'static str,
}

/// Executor failure after retries
struct StepFailure {
    error: StepError,
    attempts: u32,
}

/// Exclusive hold on one run
struct RunGuard<'a> {
    locks: &'a DashMap<RunId, Arc<Mutex<()>>>,
    run_id: RunId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        // Only the map's own handle left means nobody holds or awaits the lock
        self.locks
            .remove_if(&self.run_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl ExecutionEngine {
    pub fn builder(executor: Arc<dyn StepExecutor>) -> ExecutionEngineBuilder {
        ExecutionEngineBuilder::new(executor)
    }

    pub fn graphs(&self) -> &Arc<GraphRegistry> {
        &self.inner.graphs
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn gateway(&self) -> &ApprovalGateway {
        &self.inner.gateway
    }

    pub fn register_graph(&self, graph: StepGraph) -> EngineResult<GraphId> {
        self.inner.graphs.register(graph)
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub async fn get_run(&self, run_id: &RunId) -> EngineResult<Run> {
        self.inner
            .runs
            .get_run(run_id)
            .await?
            .ok_or_else(|| EngineError::RunNotFound(run_id.clone()))
    }

    pub async fn list_runs(&self, filter: &RunFilter) -> EngineResult<Vec<Run>> {
        Ok(self.inner.runs.list_runs(filter).await?)
    }

    /// The request a paused run is waiting on
    pub async fn open_request(&self, run_id: &RunId) -> EngineResult<Option<ApprovalRequest>> {
        Ok(self.inner.approvals.open_request_for_run(run_id).await?)
    }

    pub async fn get_request(&self, request_id: &RequestId) -> EngineResult<ApprovalRequest> {
        self.inner
            .approvals
            .get_request(request_id)
            .await?
            .ok_or_else(|| EngineError::RequestNotFound(request_id.clone()))
    }

    pub async fn list_requests(&self, run_id: &RunId) -> EngineResult<Vec<ApprovalRequest>> {
        Ok(self.inner.approvals.list_requests_for_run(run_id).await?)
    }

    pub async fn list_checkpoints(
        &self,
        run_id: &RunId,
        limit: usize,
    ) -> EngineResult<Vec<Checkpoint>> {
        Ok(self.inner.checkpoints.list_checkpoints(run_id, limit).await?)
    }

    pub async fn subscribe(&self, run_id: &RunId, after: Option<u64>) -> EngineResult<EventStream> {
        self.inner.bridge.subscribe(run_id, after).await
    }

    pub async fn history(&self, run_id: &RunId, after: u64) -> EngineResult<Vec<ExecutionEvent>> {
        self.inner.bridge.history(run_id, after).await
    }

    // ── Start ────────────────────────────────────────────────────────

    /// Create a run and enter `running`. Nothing executes until it is stepped.
    pub async fn start(&self, request: StartRequest) -> EngineResult<RunHandle> {
        let graph = self.inner.graphs.resolve(&request.graph).ok_or_else(|| {
            EngineError::GraphInvalid {
                graph_id: GraphId::new(request.graph.clone()),
                reason: "graph is not registered".into(),
            }
        })?;
        let start = graph.start_step().ok_or_else(|| EngineError::GraphInvalid {
            graph_id: graph.id.clone(),
            reason: "no start step defined".into(),
        })?;
        if graph.terminal_steps().is_empty() {
            return Err(EngineError::GraphInvalid {
                graph_id: graph.id.clone(),
                reason: "no terminal step defined".into(),
            });
        }

        let run_id = request.run_id.unwrap_or_else(RunId::generate);
        let _guard = self.lock_run(&run_id).await;

        let mut intent = request.intent;
        if intent.requester.is_none() {
            intent.requester = request.requester.clone();
        }
        let mode = ModeState {
            mode: self.inner.router.classify(&intent),
            hybrid_threshold: self.inner.config.default_hybrid_threshold,
        };

        let mut run = Run::new(run_id.clone(), graph.id.clone(), start.id.clone(), mode)
            .with_input(request.input);
        run.requester = request.requester;

        self.inner.runs.insert_run(&run).await.map_err(|e| match e {
            StorageError::Conflict(_) => EngineError::RunAlreadyExists(run_id.clone()),
            other => other.into(),
        })?;
        run.transition(RunEvent::Begin)?;
        self.inner.runs.update_run(&run).await?;
        self.inner.cancels.insert(run_id.clone(), CancelToken::new());
        self.inner.pins.insert(run_id.clone(), graph.clone());
        if self.inner.config.checkpoint_every_step {
            self.checkpoint(&run, None).await?;
        }

        tracing::info!(
            run_id = %run_id,
            graph_id = %graph.id,
            mode = %mode,
            router = self.inner.router.name(),
            "Run started"
        );
        self.emit(
            &run_id,
            EventType::RunStarted,
            None,
            json!({
                "graph_id": graph.id,
                "mode": mode.mode,
                "hybrid_threshold": mode.hybrid_threshold,
                "requester": run.requester,
            }),
        )
        .await;

        Ok(RunHandle {
            run_id,
            graph_id: graph.id.clone(),
            status: run.status,
            mode,
        })
    }

    // ── Step ─────────────────────────────────────────────────────────

    /// Gate-check and, unless gated, execute the current step
    pub async fn step(&self, run_id: &RunId) -> EngineResult<StepOutcome> {
        let _guard = self.lock_run(run_id).await;

        let run = self.get_run(run_id).await?;
        if run.status != RunStatus::Running {
            return Err(EngineError::NotRunning {
                run_id: run.run_id,
                status: run.status,
            });
        }

        let graph = self.graph_for(&run)?;
        let Some(node) = graph.get_step(&run.cursor) else {
            let err = EngineError::GraphInvalid {
                graph_id: graph.id.clone(),
                reason: format!("step '{}' not found", run.cursor),
            };
            return self.fail_run(run, err).await;
        };

        let assessment = self.inner.risk.score(
            &node.action,
            &RiskContext {
                run_id: &run.run_id,
                step_id: &node.id,
                mode: run.mode,
                requester: run.requester.as_deref(),
            },
        );

        if !run.cursor_cleared() && run.mode_state().gates(assessment.level) {
            return self.open_gate(run, &graph, node, assessment).await;
        }
        self.execute_step(run, &graph, node, assessment).await
    }

    /// Step until the run pauses, ends or is cancelled
    pub async fn drive(&self, run_id: &RunId) -> EngineResult<StepOutcome> {
        loop {
            match self.step(run_id).await? {
                StepOutcome::Advanced { .. } => continue,
                outcome => return Ok(outcome),
            }
        }
    }

    /// Drive a run on its own task
    pub fn spawn_driver(&self, run_id: RunId) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            match engine.drive(&run_id).await {
                Ok(outcome) => {
                    tracing::debug!(run_id = %run_id, ?outcome, "Driver finished");
                }
                Err(EngineError::NotRunning { status, .. }) => {
                    tracing::debug!(run_id = %run_id, %status, "Driver stopped, run not running");
                }
                Err(e) => {
                    tracing::error!(run_id = %run_id, error = %e, "Driver failed");
                }
            }
        })
    }

    async fn open_gate(
        &self,
        mut run: Run,
        graph: &StepGraph,
        node: &StepNode,
        assessment: RiskAssessment,
    ) -> EngineResult<StepOutcome> {
        let request =
            self.inner
                .gateway
                .build_request(&run, node, &assessment, graph.on_reject);
        run.transition(RunEvent::Gate)?;
        run.open_request = Some(request.request_id.clone());

        self.checkpoint(&run, Some(&request)).await?;
        self.inner.gateway.open(&request).await?;
        self.inner.runs.update_run(&run).await?;

        tracing::info!(
            run_id = %run.run_id,
            step_id = %node.id,
            request_id = %request.request_id,
            risk_level = %assessment.level,
            mode = %run.mode_state(),
            "Step gated for approval"
        );
        self.emit(
            &run.run_id,
            EventType::ApprovalRequested,
            Some(&node.id),
            json!({
                "request": RequestSummary::from(&request),
                "factors": assessment.factors,
            }),
        )
        .await;

        self.arm_timer(
            request.request_id.clone(),
            Duration::from_secs(request.timeout_seconds),
        );
        Ok(StepOutcome::AwaitingApproval {
            request_id: request.request_id,
        })
    }

    async fn execute_step(
        &self,
        mut run: Run,
        graph: &StepGraph,
        node: &StepNode,
        assessment: RiskAssessment,
    ) -> EngineResult<StepOutcome> {
        let step_id = node.id.clone();
        run.gate_cleared = Some(step_id.clone());
        self.emit(
            &run.run_id,
            EventType::StepStarted,
            Some(&step_id),
            json!({
                "action": node.action.kind,
                "risk_level": assessment.level,
                "risk_score": assessment.score,
            }),
        )
        .await;

        let cancel = self.cancel_token(&run.run_id);
        let input = StepInput {
            run_id: run.run_id.clone(),
            step_id: step_id.clone(),
            action: node.action.clone(),
            params: node.params.clone(),
            run_input: run.input.clone(),
            previous: run.last_output().cloned(),
            outputs: run.outputs.clone(),
            attempt: 1,
        };

        let (output, attempts) = match self.execute_with_retry(node, input, &cancel).await {
            Ok(done) if !cancel.is_cancelled() => done,
            Ok(_)
            | Err(StepFailure {
                error: StepError::Cancelled,
                ..
            }) => {
                tracing::info!(run_id = %run.run_id, step_id = %step_id, "Step stopped by cancellation");
                return Ok(StepOutcome::Cancelled);
            }
            Err(StepFailure { error, attempts }) => {
                tracing::warn!(
                    run_id = %run.run_id,
                    step_id = %step_id,
                    attempts,
                    error = %error,
                    "Step failed"
                );
                self.emit(
                    &run.run_id,
                    EventType::StepFailed,
                    Some(&step_id),
                    json!({ "error": error.to_string(), "attempts": attempts }),
                )
                .await;
                return self
                    .fail_run(run, EngineError::StepExecution(error.to_string()))
                    .await;
            }
        };

        run.outputs.insert(step_id.clone(), output.clone());
        run.trail.push(step_id.clone());
        run.updated_at = Utc::now();
        self.emit(
            &run.run_id,
            EventType::StepCompleted,
            Some(&step_id),
            json!({ "output": output, "attempts": attempts }),
        )
        .await;

        let next = match graph.route(&step_id, &output) {
            Ok(next) => next,
            Err(e) => return self.fail_run(run, e.into()).await,
        };
        let Some(next) = next else {
            return self.complete_run(run, output).await;
        };

        run.cursor = next.clone();
        run.gate_cleared = None;
        let change = self.evaluate_switch(
            &mut run,
            Signal::StepCompleted {
                level: assessment.level,
            },
        );
        self.inner.runs.update_run(&run).await?;
        if self.inner.config.checkpoint_every_step {
            self.checkpoint(&run, None).await?;
        }
        self.publish_mode_change(&run, change).await;

        tracing::debug!(run_id = %run.run_id, from = %step_id, to = %next, "Cursor advanced");
        Ok(StepOutcome::Advanced { next })
    }

    async fn execute_with_retry(
        &self,
        node: &StepNode,
        mut input: StepInput,
        cancel: &CancelToken,
    ) -> Result<(Value, u32), StepFailure> {
        let policy = node
            .retry
            .clone()
            .unwrap_or_else(|| self.inner.config.default_retry.clone());
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            if cancel.is_cancelled() {
                return Err(StepFailure {
                    error: StepError::Cancelled,
                    attempts: attempt - 1,
                });
            }
            input.attempt = attempt;
            let error = match self
                .inner
                .executor
                .execute(&node.id, input.clone(), cancel.clone())
                .await
            {
                Ok(output) => return Ok((output, attempt)),
                Err(error) => error,
            };
            if !error.is_retryable() || attempt >= max_attempts {
                return Err(StepFailure {
                    error,
                    attempts: attempt,
                });
            }

            let delay = policy.backoff(attempt);
            tracing::warn!(
                run_id = %input.run_id,
                step_id = %node.id,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Step attempt failed, retrying"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    return Err(StepFailure { error: StepError::Cancelled, attempts: attempt });
                }
            }
            attempt += 1;
        }
    }

    async fn complete_run(&self, mut run: Run, result: Value) -> EngineResult<StepOutcome> {
        run.result = Some(result.clone());
        run.transition(RunEvent::Complete)?;
        self.inner.runs.update_run(&run).await?;
        if self.inner.config.checkpoint_every_step {
            self.checkpoint(&run, None).await?;
        }
        tracing::info!(run_id = %run.run_id, steps = run.trail.len(), "Run completed");
        self.emit(
            &run.run_id,
            EventType::RunCompleted,
            None,
            json!({ "result": result }),
        )
        .await;
        self.forget(&run.run_id);
        Ok(StepOutcome::Completed { result })
    }

    /// Fail a running or waiting run with the error's message
    async fn fail_run(&self, mut run: Run, err: EngineError) -> EngineResult<StepOutcome> {
        let message = err.to_string();
        run.transition(RunEvent::Fail)?;
        run.error = Some(message.clone());
        run.open_request = None;
        self.inner.runs.update_run(&run).await?;
        if self.inner.config.checkpoint_every_step {
            self.checkpoint(&run, None).await?;
        }
        tracing::warn!(run_id = %run.run_id, step_id = %run.cursor, error = %message, "Run failed");
        self.emit(
            &run.run_id,
            EventType::RunFailed,
            Some(&run.cursor),
            json!({ "error": message }),
        )
        .await;
        self.forget(&run.run_id);
        Ok(StepOutcome::Failed { error: message })
    }

    // ── Decisions ────────────────────────────────────────────────────

    /// Apply a decision to a run waiting for approval
    pub async fn resume(&self, run_id: &RunId, verdict: Verdict) -> EngineResult<Run> {
        let _guard = self.lock_run(run_id).await;
        let run = self.get_run(run_id).await?;
        self.resume_locked(run, verdict).await
    }

    async fn resume_locked(&self, mut run: Run, verdict: Verdict) -> EngineResult<Run> {
        let event = match verdict {
            Verdict::Approve => RunEvent::Approve,
            Verdict::Reject { .. } => RunEvent::Reject,
        };
        if run.status != RunStatus::WaitingApproval {
            return Err(TransitionError {
                from: run.status,
                event,
            }
            .into());
        }

        match verdict {
            Verdict::Approve => {
                run.transition(RunEvent::Approve)?;
                run.gate_cleared = Some(run.cursor.clone());
                run.open_request = None;
                run.approval_streak = run.approval_streak.saturating_add(1);
                let change = self.evaluate_switch(&mut run, Signal::ApprovalDecided { approved: true });
                self.inner.runs.update_run(&run).await?;
                self.checkpoint(&run, None).await?;
                tracing::info!(run_id = %run.run_id, step_id = %run.cursor, "Step approved");
                self.publish_mode_change(&run, change).await;
            }
            Verdict::Reject { reason } => {
                let graph = self.graph_for(&run)?;
                let skip_to = match graph.rejection_policy_for(&run.cursor) {
                    RejectionPolicy::SkipStep => graph.static_successor(&run.cursor),
                    RejectionPolicy::FailRun => None,
                };
                run.approval_streak = 0;

                let Some(next) = skip_to else {
                    run.open_request = None;
                    run.error = Some(EngineError::Rejected(reason).to_string());
                    run.transition(RunEvent::Reject)?;
                    self.inner.runs.update_run(&run).await?;
                    if self.inner.config.checkpoint_every_step {
                        self.checkpoint(&run, None).await?;
                    }
                    let error = run.error.clone().unwrap_or_default();
                    tracing::warn!(run_id = %run.run_id, step_id = %run.cursor, error = %error, "Run rejected");
                    self.emit(
                        &run.run_id,
                        EventType::RunFailed,
                        Some(&run.cursor),
                        json!({ "error": error }),
                    )
                    .await;
                    self.forget(&run.run_id);
                    return Ok(run);
                };

                let skipped = std::mem::replace(&mut run.cursor, next);
                run.transition(RunEvent::Approve)?;
                run.gate_cleared = None;
                run.open_request = None;
                let change =
                    self.evaluate_switch(&mut run, Signal::ApprovalDecided { approved: false });
                self.inner.runs.update_run(&run).await?;
                self.checkpoint(&run, None).await?;
                tracing::info!(
                    run_id = %run.run_id,
                    skipped = %skipped,
                    next = %run.cursor,
                    reason = %reason,
                    "Rejected step skipped"
                );
                self.publish_mode_change(&run, change).await;
            }
        }
        Ok(run)
    }

    /// Record an approver's decision and resume the run once the request closes
    pub async fn submit_decision(
        &self,
        run_id: &RunId,
        request_id: &RequestId,
        mut response: ApprovalResponse,
    ) -> EngineResult<DecisionReceipt> {
        let request = self.get_request(request_id).await?;
        if &request.run_id != run_id {
            return Err(EngineError::RequestNotFound(request_id.clone()));
        }
        response.request_id = request_id.clone();
        let approver_id = response.approver_id.clone();
        let approved = response.approved;
        let reason = response.reason.clone();

        let request = self.inner.gateway.decide(response).await?;
        self.emit(
            run_id,
            EventType::ApprovalDecided,
            Some(&request.step_id),
            json!({
                "request_id": request.request_id,
                "approver_id": approver_id,
                "approved": approved,
                "reason": reason,
                "status": request.status,
                "approvals": request.approvals(),
                "required_approvers": request.required_approvers,
            }),
        )
        .await;

        let _guard = self.lock_run(run_id).await;
        let mut run = self.get_run(run_id).await?;

        let verdict = match request.status {
            ApprovalStatus::Approved => Some(Verdict::Approve),
            ApprovalStatus::Rejected => Some(Verdict::Reject {
                reason: rejection_reason(&request),
            }),
            _ => None,
        };
        if let Some(verdict) = verdict {
            if run.status == RunStatus::WaitingApproval
                && run.open_request.as_ref() == Some(&request.request_id)
            {
                run = self.resume_locked(run, verdict).await?;
            }
        }

        Ok(DecisionReceipt {
            request,
            run_status: run.status,
        })
    }

    /// Handle an approval timer: escalate while tiers remain, then expire
    pub async fn on_timeout(&self, request_id: &RequestId) -> EngineResult<TimeoutOutcome> {
        let Some(request) = self.inner.approvals.get_request(request_id).await? else {
            return Ok(TimeoutOutcome::Closed);
        };
        let _guard = self.lock_run(&request.run_id).await;

        let Some(request) = self.inner.approvals.get_request(request_id).await? else {
            return Ok(TimeoutOutcome::Closed);
        };
        if !request.is_open() {
            return Ok(TimeoutOutcome::Closed);
        }

        if request.can_escalate() {
            let Some(escalated) = self.inner.gateway.escalate(request_id, Utc::now()).await? else {
                return Ok(TimeoutOutcome::Closed);
            };
            self.emit(
                &escalated.run_id,
                EventType::ApprovalEscalated,
                Some(&escalated.step_id),
                json!({
                    "request_id": escalated.request_id,
                    "escalation_level": escalated.escalation_level,
                    "approver_group": escalated.approver_group,
                }),
            )
            .await;
            self.arm_timer(
                escalated.request_id.clone(),
                Duration::from_secs(escalated.timeout_seconds),
            );
            return Ok(TimeoutOutcome::Escalated {
                level: escalated.escalation_level,
            });
        }

        if self
            .inner
            .gateway
            .close(request_id, ApprovalStatus::Expired)
            .await?
            .is_none()
        {
            return Ok(TimeoutOutcome::Closed);
        }
        let run = self.get_run(&request.run_id).await?;
        if run.status == RunStatus::WaitingApproval && run.open_request.as_ref() == Some(request_id)
        {
            self.fail_run(run, EngineError::ApprovalTimeout(request_id.clone()))
                .await?;
        }
        Ok(TimeoutOutcome::Expired)
    }

    // ── Cancel ───────────────────────────────────────────────────────

    /// Cancel a non-terminal run. Waits for an in-flight step to finish or
    /// acknowledge the signal.
    pub async fn cancel(&self, run_id: &RunId, reason: &str) -> EngineResult<Run> {
        if let Some(token) = self.inner.cancels.get(run_id) {
            token.cancel();
        }
        let _guard = self.lock_run(run_id).await;
        let result = async {
            let run = self.get_run(run_id).await?;
            self.cancel_locked(run, reason).await
        }
        .await;
        if let Err(e) = &result {
            // The run stays live, so later steps must not see the early signal
            if let Some(token) = self.inner.cancels.get(run_id) {
                token.reset();
                tracing::warn!(run_id = %run_id, error = %e, "Cancel failed, signal withdrawn");
            }
        }
        result
    }

    async fn cancel_locked(&self, mut run: Run, reason: &str) -> EngineResult<Run> {
        run.status.apply(RunEvent::Cancel)?;

        let open = match run.open_request.take() {
            Some(id) => Some(id),
            None => self
                .inner
                .approvals
                .open_request_for_run(&run.run_id)
                .await?
                .map(|r| r.request_id),
        };
        if let Some(request_id) = open {
            self.inner
                .gateway
                .close(&request_id, ApprovalStatus::Cancelled)
                .await?;
        }

        run.error = Some(EngineError::Cancelled(reason.to_string()).to_string());
        run.transition(RunEvent::Cancel)?;
        self.inner.runs.update_run(&run).await?;
        if self.inner.config.checkpoint_every_step {
            self.checkpoint(&run, None).await?;
        }
        tracing::info!(run_id = %run.run_id, reason, "Run cancelled");
        self.emit(
            &run.run_id,
            EventType::RunCancelled,
            Some(&run.cursor),
            json!({ "reason": reason, "error": run.error }),
        )
        .await;
        self.forget(&run.run_id);
        Ok(run)
    }

    // ── Modes ────────────────────────────────────────────────────────

    /// Explicit user mode change. Applies from the next gate check.
    pub async fn switch_mode(
        &self,
        run_id: &RunId,
        mode: Mode,
        threshold: Option<RiskLevel>,
    ) -> EngineResult<Run> {
        let _guard = self.lock_run(run_id).await;
        let mut run = self.get_run(run_id).await?;
        if run.is_terminal() {
            return Err(EngineError::NotRunning {
                run_id: run.run_id,
                status: run.status,
            });
        }

        let change = self.evaluate_switch(&mut run, Signal::UserRequested { mode, threshold });
        if change.is_some() {
            self.inner.runs.update_run(&run).await?;
            let open = match &run.open_request {
                Some(id) => self.inner.approvals.get_request(id).await?,
                None => None,
            };
            self.checkpoint(&run, open.as_ref()).await?;
            self.publish_mode_change(&run, change).await;
        }
        Ok(run)
    }

    fn evaluate_switch(&self, run: &mut Run, signal: Signal) -> Option<ModeChange> {
        let from = run.mode_state();
        match self
            .inner
            .switcher
            .evaluate(from, run.approval_streak, &signal)
        {
            SwitchDecision::NoChange => None,
            SwitchDecision::Switch(to) => {
                run.set_mode_state(to);
                run.approval_streak = 0;
                tracing::info!(run_id = %run.run_id, %from, %to, signal = signal.as_str(), "Mode changed");
                Some(ModeChange {
                    from,
                    to,
                    reason: signal.as_str(),
                })
            }
        }
    }

    async fn publish_mode_change(&self, run: &Run, change: Option<ModeChange>) {
        let Some(change) = change else {
            return;
        };
        self.emit(
            &run.run_id,
            EventType::ModeChanged,
            None,
            json!({
                "from": change.from,
                "to": change.to,
                "reason": change.reason,
            }),
        )
        .await;
    }

    // ── Recovery ─────────────────────────────────────────────────────

    /// Rebuild a run from its latest checkpoint and re-arm its approval timer
    pub async fn recover(&self, run_id: &RunId) -> EngineResult<Run> {
        let _guard = self.lock_run(run_id).await;

        let stored = self.inner.runs.get_run(run_id).await?;
        if let Some(run) = &stored {
            if run.is_terminal() {
                return Ok(run.clone());
            }
        }

        let checkpoint = match self.inner.checkpoints.load_latest_checkpoint(run_id).await {
            Ok(checkpoint) => Some(checkpoint),
            Err(StorageError::NotFound(_)) => None,
            Err(e) => return Err(e.into()),
        };
        let (mut run, snapshot) = match (checkpoint, stored.is_some()) {
            (Some(checkpoint), exists) => {
                let state = CheckpointState::decode(&checkpoint)?;
                if let Some(graph) = state.graph {
                    if !state.run.is_terminal() {
                        self.inner
                            .pins
                            .entry(run_id.clone())
                            .or_insert_with(|| Arc::new(graph));
                    }
                }
                if exists {
                    self.inner.runs.update_run(&state.run).await?;
                } else {
                    self.inner.runs.insert_run(&state.run).await?;
                }
                (state.run, state.open_request)
            }
            (None, _) => match stored {
                Some(run) => (run, None),
                None => return Err(EngineError::RunNotFound(run_id.clone())),
            },
        };
        tracing::info!(run_id = %run_id, status = %run.status, cursor = %run.cursor, "Recovering run");

        if run.is_terminal() {
            return Ok(run);
        }
        self.inner.cancels.insert(run_id.clone(), CancelToken::new());

        match run.status {
            RunStatus::Pending => {
                run.transition(RunEvent::Begin)?;
                self.inner.runs.update_run(&run).await?;
                self.emit(
                    run_id,
                    EventType::RunStarted,
                    None,
                    json!({ "graph_id": run.graph_id, "mode": run.mode, "recovered": true }),
                )
                .await;
                Ok(run)
            }
            RunStatus::WaitingApproval => self.recover_gate(run, snapshot).await,
            _ => Ok(run),
        }
    }

    async fn recover_gate(
        &self,
        run: Run,
        snapshot: Option<ApprovalRequest>,
    ) -> EngineResult<Run> {
        let approvals = &self.inner.approvals;
        let mut request = match &run.open_request {
            Some(id) => approvals.get_request(id).await?,
            None => approvals.open_request_for_run(&run.run_id).await?,
        };
        if request.is_none() {
            if let Some(snapshot) = snapshot.filter(|s| s.is_open()) {
                approvals.open_request(&snapshot).await?;
                request = Some(snapshot);
            }
        }

        let Some(request) = request else {
            let err = EngineError::StepExecution("approval request missing for paused run".into());
            self.fail_run(run.clone(), err).await?;
            return self.get_run(&run.run_id).await;
        };

        match request.status {
            ApprovalStatus::Open => {
                let remaining = request.remaining(Utc::now());
                tracing::info!(
                    run_id = %run.run_id,
                    request_id = %request.request_id,
                    remaining_ms = remaining.as_millis() as u64,
                    "Approval timer re-armed"
                );
                self.arm_timer(request.request_id.clone(), remaining);
                Ok(run)
            }
            ApprovalStatus::Approved => self.resume_locked(run, Verdict::Approve).await,
            ApprovalStatus::Rejected => {
                let reason = rejection_reason(&request);
                self.resume_locked(run, Verdict::Reject { reason }).await
            }
            ApprovalStatus::Expired => {
                let run_id = run.run_id.clone();
                self.fail_run(run, EngineError::ApprovalTimeout(request.request_id))
                    .await?;
                self.get_run(&run_id).await
            }
            ApprovalStatus::Cancelled => self.cancel_locked(run, "approval request cancelled").await,
        }
    }

    /// Recover every non-terminal run. Runs left `running` need a driver.
    pub async fn recover_all(&self) -> EngineResult<Vec<Run>> {
        let active = self.inner.runs.list_runs(&RunFilter::active()).await?;
        let mut recovered = Vec::with_capacity(active.len());
        for run in active {
            match self.recover(&run.run_id).await {
                Ok(run) => recovered.push(run),
                Err(e) => {
                    tracing::error!(run_id = %run.run_id, error = %e, "Run recovery failed");
                }
            }
        }
        tracing::info!(count = recovered.len(), "Recovery complete");
        Ok(recovered)
    }

    // ── Internals ────────────────────────────────────────────────────

    /// The run's pinned graph. A run without a pin adopts the registered one.
    fn graph_for(&self, run: &Run) -> EngineResult<Arc<StepGraph>> {
        if let Some(graph) = self.inner.pins.get(&run.run_id) {
            return Ok(Arc::clone(graph.value()));
        }
        let graph = self
            .inner
            .graphs
            .get(&run.graph_id)
            .ok_or_else(|| EngineError::GraphInvalid {
                graph_id: run.graph_id.clone(),
                reason: "graph is not registered".into(),
            })?;
        if !run.is_terminal() {
            self.inner.pins.insert(run.run_id.clone(), graph.clone());
        }
        Ok(graph)
    }

    /// Serialize work on one run. The lock entry is dropped with its last holder.
    async fn lock_run(&self, run_id: &RunId) -> RunGuard<'_> {
        let lock = self
            .inner
            .locks
            .entry(run_id.clone())
            .or_default()
            .clone();
        let guard = lock.lock_owned().await;
        RunGuard {
            locks: &self.inner.locks,
            run_id: run_id.clone(),
            guard: Some(guard),
        }
    }

    /// Runs with a lock held or awaited
    pub fn locked_runs(&self) -> usize {
        self.inner.locks.len()
    }

    /// Runs holding a pinned graph
    pub fn pinned_runs(&self) -> usize {
        self.inner.pins.len()
    }

    fn cancel_token(&self, run_id: &RunId) -> CancelToken {
        self.inner
            .cancels
            .entry(run_id.clone())
            .or_default()
            .clone()
    }

    /// Drop per-run resources of a terminal run
    fn forget(&self, run_id: &RunId) {
        self.inner.cancels.remove(run_id);
        self.inner.pins.remove(run_id);
    }

    async fn checkpoint(&self, run: &Run, open: Option<&ApprovalRequest>) -> EngineResult<()> {
        let state = CheckpointState {
            run: run.clone(),
            open_request: open.cloned(),
            graph: self
                .inner
                .pins
                .get(&run.run_id)
                .map(|graph| StepGraph::clone(graph.value())),
        };
        let blob = serde_json::to_value(&state)?;
        self.inner
            .checkpoints
            .save_checkpoint(&run.run_id, &run.cursor, blob)
            .await?;
        Ok(())
    }

    fn arm_timer(&self, request_id: RequestId, delay: Duration) {
        let engine = self.clone();
        let id = request_id.clone();
        self.inner.gateway.timers().arm(request_id, delay, async move {
            match engine.on_timeout(&id).await {
                Ok(outcome) => {
                    tracing::debug!(request_id = %id, ?outcome, "Approval timer fired");
                }
                Err(e) => {
                    tracing::error!(request_id = %id, error = %e, "Approval timeout handling failed");
                }
            }
        });
    }

    /// Events are observational; a failed publish never fails the run
    async fn emit(
        &self,
        run_id: &RunId,
        event_type: EventType,
        step_id: Option<&StepId>,
        payload: Value,
    ) {
        if let Err(e) = self
            .inner
            .bridge
            .emit(run_id, event_type, step_id, payload)
            .await
        {
            tracing::warn!(run_id = %run_id, event_type = %event_type, error = %e, "Event publish failed");
        }
    }
}

fn rejection_reason(request: &ApprovalRequest) -> String {
    request
        .responses
        .iter()
        .find(|r| !r.approved)
        .map(|r| {
            if r.reason.trim().is_empty() {
                format!("declined by {}", r.approver_id)
            } else {
                r.reason.clone()
            }
        })
        .unwrap_or_else(|| "declined".to_string())
}
