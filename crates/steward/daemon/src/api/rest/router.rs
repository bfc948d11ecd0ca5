//! API Router configuration

use super::handlers;
use super::state::AppState;
use crate::config::ServerConfig;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Create the main API router
pub fn create_router(state: AppState, server: &ServerConfig) -> Router {
    let api_routes = Router::new()
        // Health and status
        .route("/health", get(handlers::health_check))
        .route("/status", get(handlers::daemon_status))
        // Graphs
        .route(
            "/graphs",
            get(handlers::list_graphs).post(handlers::register_graph),
        )
        .route("/graphs/:id", get(handlers::get_graph))
        // Runs
        .route("/runs", get(handlers::list_runs).post(handlers::start_run))
        .route("/runs/:run_id", get(handlers::get_run))
        .route("/runs/:run_id/cancel", post(handlers::cancel_run))
        .route("/runs/:run_id/mode", post(handlers::switch_mode))
        .route("/runs/:run_id/checkpoints", get(handlers::list_checkpoints))
        // Approvals
        .route("/runs/:run_id/approvals", get(handlers::list_run_approvals))
        .route(
            "/runs/:run_id/approvals/:request_id",
            post(handlers::submit_decision),
        )
        .route("/approvals/:request_id", get(handlers::get_approval))
        // Events
        .route("/runs/:run_id/events", get(handlers::stream_events))
        .route("/runs/:run_id/events/history", get(handlers::event_history));

    let mut router = Router::new()
        .nest("/api/v1", api_routes)
        .layer(DefaultBodyLimit::max(server.max_body_size))
        .layer(TraceLayer::new_for_http());

    if server.enable_cors {
        router = router.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );
    }

    router.with_state(state)
}
