//! Configuration for steward-daemon
//!
//! Layered as built-in defaults, then an optional file, then `STEWARD_`
//! environment variables (`STEWARD_SERVER__LISTEN_ADDR=0.0.0.0:9000`).

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use steward_engine::{ApprovalDefaults, EngineConfig, RiskConfig, RouterConfig, SwitcherConfig};

/// Main daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    /// Engine tuning. Approval defaults live in their own section.
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub approvals: ApprovalDefaults,

    #[serde(default)]
    pub risk: RiskConfig,

    #[serde(default)]
    pub router: RouterConfig,

    #[serde(default)]
    pub switcher: SwitcherConfig,

    #[serde(default)]
    pub executor: ExecutorConfig,

    #[serde(default)]
    pub notifier: NotifierConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Directory of YAML/JSON graph definitions registered at startup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graphs_dir: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            engine: EngineConfig::default(),
            approvals: ApprovalDefaults::default(),
            risk: RiskConfig::default(),
            router: RouterConfig::default(),
            switcher: SwitcherConfig::default(),
            executor: ExecutorConfig::default(),
            notifier: NotifierConfig::default(),
            logging: LoggingConfig::default(),
            graphs_dir: None,
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    pub listen_addr: SocketAddr,

    /// Enable CORS
    #[serde(default = "default_true")]
    pub enable_cors: bool,

    /// Maximum request body size in bytes
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,

    /// SSE keep-alive interval
    #[serde(default = "default_keep_alive")]
    pub sse_keep_alive_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            enable_cors: true,
            max_body_size: default_max_body_size(),
            sse_keep_alive_secs: default_keep_alive(),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory storage (for development/testing)
    #[default]
    Memory,

    /// PostgreSQL storage
    Postgres {
        /// Connection URL
        url: String,

        /// Maximum connections in pool
        #[serde(default = "default_pool_size")]
        max_connections: u32,

        /// Connection timeout in seconds
        #[serde(default = "default_connection_timeout")]
        connect_timeout_secs: u64,
    },
}

/// Which step executor the daemon delegates to
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutorConfig {
    /// Returns each step's parameters as its output
    #[default]
    Echo,

    /// POSTs each step to an agent endpoint
    Http {
        endpoint: String,

        #[serde(default = "default_executor_timeout")]
        timeout_secs: u64,
    },
}

/// Where approval notifications go
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotifierConfig {
    #[default]
    Log,

    Webhook {
        url: String,

        #[serde(default = "default_notifier_timeout")]
        timeout_secs: u64,
    },
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_body_size() -> usize {
    2 * 1024 * 1024
}

fn default_keep_alive() -> u64 {
    15
}

fn default_pool_size() -> u32 {
    10
}

fn default_connection_timeout() -> u64 {
    5
}

fn default_executor_timeout() -> u64 {
    60
}

fn default_notifier_timeout() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

impl DaemonConfig {
    /// Load configuration from defaults, an optional file and the environment
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&DaemonConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("STEWARD")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Engine configuration with the top-level approval defaults applied
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            approvals: self.approvals.clone(),
            ..self.engine.clone()
        }
    }
}
