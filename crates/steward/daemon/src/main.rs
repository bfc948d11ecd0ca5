//! Steward Daemon - human-in-the-loop execution service
//!
//! The Steward daemon provides:
//! - REST API for graphs, runs and approval decisions
//! - Background drivers that advance runs between approval gates
//! - Crash recovery from checkpoints at startup
//! - Server-sent event streams for observers

use clap::Parser;
use steward_daemon::error::{DaemonError, DaemonResult};
use steward_daemon::{DaemonConfig, Server};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Steward Daemon CLI
#[derive(Parser)]
#[command(name = "stewardd")]
#[command(about = "Steward Daemon - human-in-the-loop execution service", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "STEWARD_CONFIG")]
    config: Option<String>,

    /// Listen address, overriding the configuration file
    #[arg(short, long, env = "STEWARD_LISTEN_ADDR")]
    listen: Option<String>,

    /// Log level, overriding the configuration file
    #[arg(long, env = "STEWARD_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long, env = "STEWARD_LOG_JSON")]
    json: bool,
}

#[tokio::main]
async fn main() -> DaemonResult<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = DaemonConfig::load(cli.config.as_deref())
        .map_err(|e| DaemonError::Config(e.to_string()))?;

    // Override with CLI args
    if let Some(listen) = &cli.listen {
        config.server.listen_addr = listen
            .parse()
            .map_err(|e| DaemonError::Config(format!("Invalid listen address: {}", e)))?;
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    config.logging.json |= cli.json;

    // Initialize tracing
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.level.clone().into());

    if config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    // Print startup banner
    println!(
        r#"
  STEWARD
  Human-in-the-loop execution engine
  Version: {}
  Storage: {}
  Listening: {}
"#,
        env!("CARGO_PKG_VERSION"),
        match config.storage {
            steward_daemon::config::StorageConfig::Memory => "memory",
            steward_daemon::config::StorageConfig::Postgres { .. } => "postgres",
        },
        config.server.listen_addr
    );

    // Create and run server
    let server = Server::new(config).await?;
    server.run().await
}
