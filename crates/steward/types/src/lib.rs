//! Steward domain types
//!
//! Steward executes multi-step tasks as **runs** over a **step graph**,
//! pausing at risk-bearing steps until a human approves them.
//!
//! # Key Concepts
//!
//! - **StepGraph**: a directed graph of steps with exactly one start step
//!   and at least one terminal step. Edges are static or conditional.
//! - **Run**: one execution of a step graph. Its status changes only through
//!   the transition table in [`RunStatus::apply`].
//! - **Mode**: how cautiously a run executes (`autonomous`, `supervised`
//!   or `hybrid`) and therefore which risk levels are gated.
//! - **ApprovalRequest**: a pending human decision on a gated step.
//! - **Checkpoint**: a durable snapshot sufficient to resume a run.
//! - **ExecutionEvent**: an ordered, replayable record of a transition.
//!
//! # Design Principles
//!
//! 1. Terminal run states absorb; invalid transitions are errors, never no-ops.
//! 2. Routing is explicit: exactly one conditional edge must match.
//! 3. Every pause carries the open request explaining why execution stopped.

#![deny(unsafe_code)]

mod approval;
mod checkpoint;
mod edge;
mod errors;
mod event;
mod graph;
mod risk;
mod run;

pub use approval::*;
pub use checkpoint::*;
pub use edge::*;
pub use errors::*;
pub use event::*;
pub use graph::*;
pub use risk::*;
pub use run::*;
