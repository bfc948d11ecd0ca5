//! Steward execution engine
//!
//! Drives runs through step graphs, pausing at risk-bearing steps until
//! humans approve them.
//!
//! # Architecture
//!
//! The [`ExecutionEngine`] composes specialized components:
//!
//! - [`GraphRegistry`]: validated step graphs, resolved by id or name
//! - [`RiskAssessmentEngine`]: scores each step before it runs
//! - [`IntentRouter`]: picks a run's initial mode
//! - [`ModeSwitcher`]: tightens or relaxes the mode between gate checks
//! - [`ApprovalGateway`]: approval requests, escalation timers, decisions
//! - [`EventBridge`]: sequenced, replayable per-run event streams
//!
//! Step work is delegated to a [`StepExecutor`]; the engine never performs
//! a step's action itself.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use serde_json::{json, Value};
//! use steward_engine::*;
//! use steward_types::*;
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl StepExecutor for Echo {
//!     async fn execute(&self, _: &StepId, input: StepInput, _: CancelToken) -> Result<Value, StepError> {
//!         Ok(input.params)
//!     }
//! }
//!
//! # async fn demo() -> Result<(), EngineError> {
//! let engine = ExecutionEngine::builder(Arc::new(Echo)).build();
//! let graph = StepGraph::new("greet")
//!     .with_step(StepNode::start("hello")).unwrap()
//!     .with_step(StepNode::terminal("done")).unwrap()
//!     .with_edge(StepEdge::new("hello", "done")).unwrap();
//! let graph_id = engine.register_graph(graph)?;
//!
//! let run = engine
//!     .start(StartRequest::new(graph_id.as_str()).with_mode(Mode::Autonomous))
//!     .await?;
//! let outcome = engine.drive(&run.run_id).await?;
//! assert!(matches!(outcome, StepOutcome::Completed { .. }));
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]

pub mod config;
mod engine;
pub mod error;
pub mod event_bridge;
pub mod executor;
pub mod gateway;
pub mod notifier;
pub mod registry;
pub mod risk;
pub mod router;
pub mod switcher;

pub use config::{ApprovalDefaults, EngineConfig};
pub use engine::{
    CheckpointState, DecisionReceipt, ExecutionEngine, ExecutionEngineBuilder, RunHandle,
    StartRequest, StepOutcome, Verdict,
};
pub use error::{EngineError, EngineResult};
pub use event_bridge::{EventBridge, EventStream};
pub use executor::{CancelToken, StepError, StepExecutor, StepInput};
pub use gateway::{ApprovalGateway, TimeoutOutcome, TimerSet};
pub use notifier::{LogNotifier, Notifier, NotifyError, RequestSummary};
pub use registry::GraphRegistry;
pub use risk::{
    HeuristicRiskConfig, HeuristicRiskEngine, RiskAssessmentEngine, RiskConfig, RiskContext,
    RiskRule, RuleTableConfig, RuleTableRiskEngine,
};
pub use router::{
    ExplicitRouter, HeuristicRouter, IntentRequest, IntentRouter, RequestKind, RiskProfileRouter,
    RouterConfig,
};
pub use switcher::{ModeSwitcher, Signal, SwitchDecision, SwitcherConfig};
