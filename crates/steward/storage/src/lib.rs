//! Steward storage abstractions.
//!
//! This crate defines the persistence contracts the engine relies on:
//! - run records (the current state of every run)
//! - append-only, per-run ordered checkpoints for crash recovery
//! - approval requests with atomic, exactly-once closing
//! - per-run sequenced execution events for replay
//!
//! Design stance:
//! - Each concern is its own trait; human-workflow logic stays in the engine.
//! - All writes are scoped to one run, so no cross-run locking is needed.
//! - The in-memory adapter is for tests and development only.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]
#![warn(rust_2018_idioms)]

mod error;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
mod traits;

pub use error::{StorageError, StorageResult};
pub use memory::InMemoryStewardStorage;
pub use traits::{ApprovalStore, CheckpointStore, EventStore, RunStore, StewardStorage};
