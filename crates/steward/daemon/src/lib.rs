//! Steward daemon library
//!
//! This module provides the components of the Steward daemon:
//! - REST API and SSE event streaming
//! - Configuration layering
//! - Step executor and approval notifier adapters
//! - Graph definition loading
//! - Server lifecycle management

pub mod api;
pub mod config;
pub mod error;
pub mod executor;
pub mod graphs;
pub mod notifier;
pub mod server;

pub use api::create_router;
pub use config::DaemonConfig;
pub use error::{ApiError, DaemonError};
pub use server::Server;
