//! Graph registry: stores and resolves step graphs
//!
//! Graphs are validated on registration and shared immutably afterwards.
//! Registering a graph under an existing id replaces it for new runs only.
//! The engine pins each run to the graph it resolved at start and carries
//! that definition in the run's checkpoints.

use crate::error::{EngineError, EngineResult};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use steward_types::{GraphId, StepGraph};

#[derive(Default)]
struct Inner {
    graphs: HashMap<GraphId, Arc<StepGraph>>,
    /// Name -> ids in registration order
    by_name: HashMap<String, Vec<GraphId>>,
}

/// Registry of step graphs
#[derive(Default)]
pub struct GraphRegistry {
    inner: RwLock<Inner>,
}

impl GraphRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and register a graph
    pub fn register(&self, graph: StepGraph) -> EngineResult<GraphId> {
        graph.validate().map_err(|e| EngineError::GraphInvalid {
            graph_id: graph.id.clone(),
            reason: e.to_string(),
        })?;

        let id = graph.id.clone();
        let name = graph.name.clone();
        let mut inner = self.inner.write().unwrap_or_else(|p| p.into_inner());
        if inner.graphs.insert(id.clone(), Arc::new(graph)).is_some() {
            tracing::info!(graph_id = %id, "Step graph replaced");
        } else {
            tracing::info!(graph_id = %id, name = %name, "Step graph registered");
        }
        let ids = inner.by_name.entry(name).or_default();
        ids.retain(|existing| existing != &id);
        ids.push(id.clone());
        Ok(id)
    }

    pub fn get(&self, id: &GraphId) -> Option<Arc<StepGraph>> {
        let inner = self.inner.read().unwrap_or_else(|p| p.into_inner());
        inner.graphs.get(id).cloned()
    }

    /// Resolve by id, falling back to the latest graph registered under that name
    pub fn resolve(&self, id_or_name: &str) -> Option<Arc<StepGraph>> {
        let inner = self.inner.read().unwrap_or_else(|p| p.into_inner());
        inner
            .graphs
            .get(&GraphId::new(id_or_name))
            .or_else(|| {
                inner
                    .by_name
                    .get(id_or_name)
                    .and_then(|ids| ids.last())
                    .and_then(|id| inner.graphs.get(id))
            })
            .cloned()
    }

    /// All graphs, sorted by id
    pub fn list(&self) -> Vec<Arc<StepGraph>> {
        let inner = self.inner.read().unwrap_or_else(|p| p.into_inner());
        let mut graphs: Vec<_> = inner.graphs.values().cloned().collect();
        graphs.sort_by(|a, b| a.id.cmp(&b.id));
        graphs
    }

    pub fn count(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(|p| p.into_inner());
        inner.graphs.len()
    }

    pub fn contains(&self, id: &GraphId) -> bool {
        let inner = self.inner.read().unwrap_or_else(|p| p.into_inner());
        inner.graphs.contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use steward_types::{StepEdge, StepNode};

    fn linear(id: &str, name: &str) -> StepGraph {
        StepGraph::new(name)
            .with_id(id)
            .with_step(StepNode::start("start"))
            .unwrap()
            .with_step(StepNode::terminal("end"))
            .unwrap()
            .with_edge(StepEdge::new("start", "end"))
            .unwrap()
    }

    #[test]
    fn test_register_and_get() {
        let registry = GraphRegistry::new();
        let id = registry.register(linear("g1", "Refunds")).unwrap();
        assert_eq!(registry.get(&id).unwrap().name, "Refunds");
        assert_eq!(registry.count(), 1);
        assert!(registry.contains(&id));
    }

    #[test]
    fn test_register_invalid() {
        let registry = GraphRegistry::new();
        let graph = StepGraph::new("Bad").with_id("bad");
        let err = registry.register(graph).unwrap_err();
        assert!(matches!(err, EngineError::GraphInvalid { .. }));
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_resolve_by_name_returns_latest() {
        let registry = GraphRegistry::new();
        registry.register(linear("g1", "Refunds")).unwrap();
        registry.register(linear("g2", "Refunds")).unwrap();
        assert_eq!(registry.resolve("Refunds").unwrap().id, GraphId::new("g2"));
        assert_eq!(registry.resolve("g1").unwrap().id, GraphId::new("g1"));
        assert!(registry.resolve("missing").is_none());
    }

    #[test]
    fn test_reregister_replaces() {
        let registry = GraphRegistry::new();
        registry.register(linear("g1", "Refunds")).unwrap();
        registry
            .register(linear("g1", "Refunds").with_description("v2"))
            .unwrap();
        assert_eq!(registry.count(), 1);
        assert_eq!(registry.get(&GraphId::new("g1")).unwrap().description, "v2");
        assert_eq!(registry.list().len(), 1);
    }
}
