//! Graph registration handlers

use crate::api::rest::state::AppState;
use crate::error::{ApiError, ApiResult};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use steward_types::StepGraph;

#[derive(Debug, Serialize)]
pub struct GraphSummary {
    pub id: String,
    pub name: String,
    pub version: u32,
    pub steps: usize,
}

impl From<&StepGraph> for GraphSummary {
    fn from(graph: &StepGraph) -> Self {
        Self {
            id: graph.id.to_string(),
            name: graph.name.clone(),
            version: graph.version,
            steps: graph.step_count(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RegisterGraphResponse {
    pub id: String,
    pub created: bool,
}

/// List registered graphs
pub async fn list_graphs(State(state): State<AppState>) -> Json<Vec<GraphSummary>> {
    let graphs = state.engine.graphs().list();
    Json(graphs.iter().map(|g| GraphSummary::from(g.as_ref())).collect())
}

/// Get a graph by id or name
pub async fn get_graph(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<StepGraph>> {
    let graph = state
        .engine
        .graphs()
        .resolve(&id)
        .ok_or_else(|| ApiError::NotFound(format!("Graph {} not found", id)))?;
    Ok(Json(graph.as_ref().clone()))
}

/// Validate and register a graph. An existing graph with the same id is replaced.
pub async fn register_graph(
    State(state): State<AppState>,
    Json(graph): Json<StepGraph>,
) -> ApiResult<(StatusCode, Json<RegisterGraphResponse>)> {
    let replaced = state.engine.graphs().contains(&graph.id);
    let id = state.engine.register_graph(graph)?;

    tracing::info!(graph_id = %id, replaced, "Registered graph");

    let status = if replaced {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((
        status,
        Json(RegisterGraphResponse {
            id: id.to_string(),
            created: !replaced,
        }),
    ))
}
