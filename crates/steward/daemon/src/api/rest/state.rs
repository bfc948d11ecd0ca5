//! Application state for API handlers

use std::time::Duration;
use steward_engine::ExecutionEngine;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: ExecutionEngine,

    /// Interval between SSE keep-alive comments
    pub keep_alive: Duration,

    /// Daemon version
    pub version: String,

    /// Daemon start time
    pub started_at: chrono::DateTime<chrono::Utc>,
}

impl AppState {
    pub fn new(engine: ExecutionEngine, keep_alive: Duration) -> Self {
        Self {
            engine,
            keep_alive,
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: chrono::Utc::now(),
        }
    }

    /// Get uptime as a human-readable string
    pub fn uptime(&self) -> String {
        let secs = (chrono::Utc::now() - self.started_at).num_seconds();

        if secs < 60 {
            format!("{}s", secs)
        } else if secs < 3600 {
            format!("{}m {}s", secs / 60, secs % 60)
        } else if secs < 86400 {
            format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
        } else {
            format!("{}d {}h", secs / 86400, (secs % 86400) / 3600)
        }
    }
}
