//! Server setup and lifecycle management

use crate::api::create_router;
use crate::api::rest::state::AppState;
use crate::config::{DaemonConfig, StorageConfig};
use crate::error::{DaemonError, DaemonResult};
use crate::executor::build_executor;
use crate::graphs;
use crate::notifier::build_notifier;
use std::sync::Arc;
use std::time::Duration;
use steward_engine::{ExecutionEngine, ExecutionEngineBuilder};
use steward_storage::InMemoryStewardStorage;
use steward_types::RunStatus;
use tokio::net::TcpListener;

/// Steward daemon server
pub struct Server {
    config: DaemonConfig,
    engine: ExecutionEngine,
}

impl Server {
    /// Build the engine from configuration and register graph definitions
    pub async fn new(config: DaemonConfig) -> DaemonResult<Self> {
        let executor = build_executor(&config.executor)?;
        let notifier = build_notifier(&config.notifier)?;

        let builder = ExecutionEngine::builder(executor)
            .with_notifier(notifier)
            .with_risk_engine(config.risk.build())
            .with_router(config.router.build())
            .with_switcher(config.switcher.clone())
            .with_config(config.engine_config());
        let engine = attach_storage(builder, &config.storage).await?.build();

        if let Some(dir) = &config.graphs_dir {
            let definitions =
                graphs::load_dir(dir).map_err(|e| DaemonError::Graphs(format!("{e:#}")))?;
            for graph in definitions {
                let id = engine.register_graph(graph)?;
                tracing::info!(graph_id = %id, "Loaded graph definition");
            }
        }

        Ok(Self { config, engine })
    }

    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    /// Recover unfinished runs and resume driving those not waiting on a human
    pub async fn recover(&self) -> DaemonResult<usize> {
        let recovered = self.engine.recover_all().await?;
        for run in &recovered {
            if run.status == RunStatus::Running {
                self.engine.spawn_driver(run.run_id.clone());
            }
        }
        Ok(recovered.len())
    }

    /// Run the server
    pub async fn run(self) -> DaemonResult<()> {
        let addr = self.config.server.listen_addr;

        let recovered = self.recover().await?;
        if recovered > 0 {
            tracing::info!(runs = recovered, "Resumed unfinished runs");
        }

        let state = AppState::new(
            self.engine.clone(),
            Duration::from_secs(self.config.server.sse_keep_alive_secs),
        );
        let app = create_router(state, &self.config.server);

        let listener = TcpListener::bind(addr).await?;

        tracing::info!("Steward daemon listening on {}", addr);
        tracing::info!(graphs = self.engine.graphs().count(), "Graph registry ready");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| DaemonError::Server(e.to_string()))?;

        tracing::info!("Steward daemon shutting down");

        // Pending timers re-arm from storage on the next start.
        self.engine.gateway().timers().abort_all();

        Ok(())
    }
}

async fn attach_storage(
    builder: ExecutionEngineBuilder,
    storage: &StorageConfig,
) -> DaemonResult<ExecutionEngineBuilder> {
    match storage {
        StorageConfig::Memory => {
            tracing::warn!("Using in-memory storage; runs will not survive a restart");
            Ok(builder.with_storage(Arc::new(InMemoryStewardStorage::new())))
        }
        #[cfg(feature = "postgres")]
        StorageConfig::Postgres {
            url,
            max_connections,
            connect_timeout_secs,
        } => {
            let store = steward_storage::postgres::PostgresStewardStorage::connect_with_options(
                url,
                *max_connections,
                *connect_timeout_secs,
            )
            .await?;
            tracing::info!(max_connections, "Connected to PostgreSQL storage");
            Ok(builder.with_storage(Arc::new(store)))
        }
        #[cfg(not(feature = "postgres"))]
        StorageConfig::Postgres { .. } => Err(DaemonError::Config(
            "postgres storage requires the `postgres` feature".into(),
        )),
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn builds_with_defaults() {
        let server = Server::new(DaemonConfig::default()).await.unwrap();
        assert_eq!(server.engine().graphs().count(), 0);
        assert_eq!(server.recover().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn missing_graphs_dir_is_reported() {
        let config = DaemonConfig {
            graphs_dir: Some(PathBuf::from("/nonexistent/steward-graphs")),
            ..DaemonConfig::default()
        };
        let err = Server::new(config).await.err().unwrap();
        assert!(matches!(err, DaemonError::Graphs(_)));
    }

    #[cfg(not(feature = "postgres"))]
    #[tokio::test]
    async fn postgres_without_feature_is_a_config_error() {
        let config = DaemonConfig {
            storage: StorageConfig::Postgres {
                url: "postgres://localhost/steward".into(),
                max_connections: 1,
                connect_timeout_secs: 1,
            },
            ..DaemonConfig::default()
        };
        let err = Server::new(config).await.err().unwrap();
        assert!(matches!(err, DaemonError::Config(_)));
    }
}
