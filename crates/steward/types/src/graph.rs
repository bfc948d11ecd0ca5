//! Step graphs: the blueprint a run executes
//!
//! A StepGraph is a directed graph where:
//! - Steps carry an action descriptor (what would happen) used for risk scoring
//! - Edges are static (always followed) or conditional on the step output
//!
//! Graphs are validated before a run may start. A valid graph has exactly one
//! start step, at least one terminal step, and every step reachable.

use crate::{GraphError, GraphResult, RiskLevel, RoutingError, StepEdge};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

// ── Identifiers ──────────────────────────────────────────────────────

/// Unique identifier for a step graph
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GraphId(pub String);

impl GraphId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for GraphId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a step, unique within its graph
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(pub String);

impl StepId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Step Graph ───────────────────────────────────────────────────────

/// A step graph definition
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepGraph {
    /// Unique identifier
    pub id: GraphId,
    /// Human-readable name
    pub name: String,
    /// What this graph accomplishes
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default = "default_version")]
    pub version: u32,
    /// The steps in the graph
    pub steps: Vec<StepNode>,
    /// The edges in the graph
    #[serde(default)]
    pub edges: Vec<StepEdge>,
    /// What a rejected approval does unless a step overrides it
    #[serde(default)]
    pub on_reject: RejectionPolicy,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

fn default_version() -> u32 {
    1
}

impl StepGraph {
    /// Create an empty graph with a generated id
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: GraphId::generate(),
            name: name.into(),
            description: String::new(),
            version: 1,
            steps: Vec::new(),
            edges: Vec::new(),
            on_reject: RejectionPolicy::default(),
            created_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = GraphId::new(id);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_rejection_policy(mut self, policy: RejectionPolicy) -> Self {
        self.on_reject = policy;
        self
    }

    pub fn with_step(mut self, step: StepNode) -> GraphResult<Self> {
        self.add_step(step)?;
        Ok(self)
    }

    pub fn with_edge(mut self, edge: StepEdge) -> GraphResult<Self> {
        self.add_edge(edge)?;
        Ok(self)
    }

    /// Add a step to the graph
    pub fn add_step(&mut self, step: StepNode) -> GraphResult<()> {
        if self.steps.iter().any(|s| s.id == step.id) {
            return Err(GraphError::DuplicateStepId(step.id));
        }
        self.steps.push(step);
        Ok(())
    }

    /// Add an edge between two existing steps
    pub fn add_edge(&mut self, edge: StepEdge) -> GraphResult<()> {
        if self.get_step(&edge.source).is_none() {
            return Err(GraphError::StepNotFound(edge.source));
        }
        if self.get_step(&edge.target).is_none() {
            return Err(GraphError::StepNotFound(edge.target));
        }
        if self
            .edges
            .iter()
            .any(|e| e.source == edge.source && e.target == edge.target)
        {
            return Err(GraphError::DuplicateEdge {
                from: edge.source,
                to: edge.target,
            });
        }
        self.edges.push(edge);
        Ok(())
    }

    /// The designated start step
    pub fn start_step(&self) -> Option<&StepNode> {
        self.steps.iter().find(|s| s.kind == StepKind::Start)
    }

    pub fn terminal_steps(&self) -> Vec<&StepNode> {
        self.steps.iter().filter(|s| s.is_terminal()).collect()
    }

    pub fn get_step(&self, id: &StepId) -> Option<&StepNode> {
        self.steps.iter().find(|s| &s.id == id)
    }

    pub fn outgoing_edges(&self, id: &StepId) -> Vec<&StepEdge> {
        self.edges.iter().filter(|e| &e.source == id).collect()
    }

    /// Rejection policy in force for a step
    pub fn rejection_policy_for(&self, id: &StepId) -> RejectionPolicy {
        self.get_step(id)
            .and_then(|s| s.approval.as_ref())
            .and_then(|a| a.on_reject)
            .unwrap_or(self.on_reject)
    }

    /// Validate the graph for structural correctness
    pub fn validate(&self) -> GraphResult<()> {
        if self.steps.is_empty() {
            return Err(GraphError::Empty);
        }

        let start_count = self
            .steps
            .iter()
            .filter(|s| s.kind == StepKind::Start)
            .count();
        if start_count == 0 {
            return Err(GraphError::NoStartStep);
        }
        if start_count > 1 {
            return Err(GraphError::MultipleStartSteps(start_count));
        }

        if !self.steps.iter().any(|s| s.is_terminal()) {
            return Err(GraphError::NoTerminalStep);
        }

        let mut seen_ids = HashSet::new();
        for step in &self.steps {
            if !seen_ids.insert(&step.id) {
                return Err(GraphError::DuplicateStepId(step.id.clone()));
            }
        }

        let mut seen_edges = HashSet::new();
        for edge in &self.edges {
            if !seen_ids.contains(&edge.source) {
                return Err(GraphError::StepNotFound(edge.source.clone()));
            }
            if !seen_ids.contains(&edge.target) {
                return Err(GraphError::StepNotFound(edge.target.clone()));
            }
            if !seen_edges.insert((&edge.source, &edge.target)) {
                return Err(GraphError::DuplicateEdge {
                    from: edge.source.clone(),
                    to: edge.target.clone(),
                });
            }
            if let crate::EdgeCondition::When { expression } = &edge.condition {
                crate::Condition::parse(expression).map_err(|reason| {
                    GraphError::InvalidCondition {
                        from: edge.source.clone(),
                        to: edge.target.clone(),
                        reason,
                    }
                })?;
            }
        }

        for step in &self.steps {
            let outgoing = self.outgoing_edges(&step.id);
            if step.is_terminal() {
                if !outgoing.is_empty() {
                    return Err(GraphError::TerminalHasEdges(step.id.clone()));
                }
                continue;
            }
            if outgoing.is_empty() {
                return Err(GraphError::DeadEnd(step.id.clone()));
            }
            let static_count = outgoing.iter().filter(|e| e.is_static()).count();
            if static_count > 1 {
                return Err(GraphError::MultipleStaticEdges(step.id.clone()));
            }
            if static_count == 1 && outgoing.len() > 1 {
                return Err(GraphError::MixedRouting(step.id.clone()));
            }
        }

        if let Some(start) = self.start_step() {
            let reachable = self.reachable_from(&start.id);
            if let Some(orphan) = self.steps.iter().find(|s| !reachable.contains(&s.id)) {
                return Err(GraphError::Unreachable(orphan.id.clone()));
            }
        }

        Ok(())
    }

    /// Pick the step that follows `from` given its output.
    ///
    /// Returns `Ok(None)` when `from` is terminal. A single static edge is
    /// followed unconditionally; otherwise exactly one conditional edge must match.
    pub fn route(&self, from: &StepId, output: &Value) -> Result<Option<StepId>, RoutingError> {
        let step = self
            .get_step(from)
            .ok_or_else(|| RoutingError::StepNotFound(from.clone()))?;
        if step.is_terminal() {
            return Ok(None);
        }

        let outgoing = self.outgoing_edges(from);
        if let [edge] = outgoing.as_slice() {
            if edge.is_static() {
                return Ok(Some(edge.target.clone()));
            }
        }

        let matched: Vec<&StepEdge> = outgoing
            .into_iter()
            .filter(|e| e.condition.matches(output))
            .collect();
        match matched.as_slice() {
            [edge] => Ok(Some(edge.target.clone())),
            _ => Err(RoutingError::Ambiguous {
                step: from.clone(),
                matched: matched.len(),
            }),
        }
    }

    /// The static successor of a step, if it has exactly one static edge
    pub fn static_successor(&self, from: &StepId) -> Option<StepId> {
        match self.outgoing_edges(from).as_slice() {
            [edge] if edge.is_static() => Some(edge.target.clone()),
            _ => None,
        }
    }

    fn reachable_from(&self, start: &StepId) -> HashSet<StepId> {
        let mut visited = HashSet::new();
        let mut queue = vec![start.clone()];

        while let Some(current) = queue.pop() {
            if visited.insert(current.clone()) {
                for edge in self.outgoing_edges(&current) {
                    if !visited.contains(&edge.target) {
                        queue.push(edge.target.clone());
                    }
                }
            }
        }

        visited
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }
}

// ── Steps ────────────────────────────────────────────────────────────

/// A step in the graph
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepNode {
    /// Unique identifier within this graph
    pub id: StepId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub kind: StepKind,
    /// What executing this step would do
    #[serde(default)]
    pub action: ActionDescriptor,
    /// Static parameters handed to the executor
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
    /// Overrides the engine's default retry policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Overrides the gateway defaults when this step is gated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval: Option<ApprovalPolicy>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl StepNode {
    pub fn new(id: impl Into<String>, kind: StepKind) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id: StepId::new(id),
            kind,
            action: ActionDescriptor::default(),
            params: Value::Null,
            retry: None,
            approval: None,
            metadata: HashMap::new(),
        }
    }

    pub fn start(id: impl Into<String>) -> Self {
        Self::new(id, StepKind::Start)
    }

    pub fn task(id: impl Into<String>) -> Self {
        Self::new(id, StepKind::Task)
    }

    pub fn terminal(id: impl Into<String>) -> Self {
        Self::new(id, StepKind::Terminal)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_action(mut self, action: ActionDescriptor) -> Self {
        self.action = action;
        self
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_approval(mut self, approval: ApprovalPolicy) -> Self {
        self.approval = Some(approval);
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.kind == StepKind::Terminal
    }
}

/// Position of a step in the graph. Every kind is executed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Start,
    #[default]
    Task,
    Terminal,
}

// ── Action descriptor ────────────────────────────────────────────────

/// Declared description of what a step would do, scored for risk
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionDescriptor {
    /// Machine-readable action kind, e.g. `payment.refund`
    #[serde(default = "default_action_kind")]
    pub kind: String,
    /// Human-readable description shown to approvers
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub effect: EffectDomain,
    #[serde(default)]
    pub reversibility: Reversibility,
    /// Resources the action touches
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<String>,
    /// Declared minimum risk level
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_hint: Option<RiskLevel>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

fn default_action_kind() -> String {
    "generic".to_string()
}

impl Default for ActionDescriptor {
    fn default() -> Self {
        Self {
            kind: default_action_kind(),
            description: String::new(),
            effect: EffectDomain::default(),
            reversibility: Reversibility::default(),
            targets: Vec::new(),
            risk_hint: None,
            metadata: HashMap::new(),
        }
    }
}

impl ActionDescriptor {
    pub fn new(kind: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            description: description.into(),
            ..Default::default()
        }
    }

    pub fn with_effect(mut self, effect: EffectDomain) -> Self {
        self.effect = effect;
        self
    }

    pub fn with_reversibility(mut self, reversibility: Reversibility) -> Self {
        self.reversibility = reversibility;
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.targets.push(target.into());
        self
    }

    pub fn with_risk_hint(mut self, level: RiskLevel) -> Self {
        self.risk_hint = Some(level);
        self
    }

    /// Summary line used in approval notifications
    pub fn summary(&self) -> String {
        if self.description.is_empty() {
            self.kind.clone()
        } else {
            format!("{}: {}", self.kind, self.description)
        }
    }
}

/// Domain an action's effects land in
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectDomain {
    /// Read-only or purely computational
    #[default]
    Compute,
    Communication,
    Data,
    DataDeletion,
    Financial,
    Infrastructure,
    Governance,
}

/// Whether an action's effects can be undone
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reversibility {
    #[default]
    Reversible,
    /// Reversible within a window, or under conditions
    Conditional {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        window_secs: Option<u64>,
    },
    Irreversible,
}

// ── Policies ─────────────────────────────────────────────────────────

/// Bounded exponential backoff for step executor failures
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub multiplier: f64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 200,
            multiplier: 2.0,
            max_backoff_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// No retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delay before the attempt following failed attempt number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let millis = self.initial_backoff_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        let capped = millis.min(self.max_backoff_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

/// Per-step approval overrides. Unset fields fall back to gateway defaults.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ApprovalPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_approvers: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approver_group: Option<String>,
    /// Approver groups notified on successive escalations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation_chain: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_escalation_depth: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_reject: Option<RejectionPolicy>,
}

/// What a rejected approval does to the run
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionPolicy {
    /// Fail the run with `rejected: <reason>`
    #[default]
    FailRun,
    /// Skip the gated step along its single static edge
    SkipStep,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn linear() -> StepGraph {
        StepGraph::new("linear")
            .with_step(StepNode::start("a"))
            .unwrap()
            .with_step(StepNode::task("b"))
            .unwrap()
            .with_step(StepNode::terminal("c"))
            .unwrap()
            .with_edge(StepEdge::new("a", "b"))
            .unwrap()
            .with_edge(StepEdge::new("b", "c"))
            .unwrap()
    }

    fn branching() -> StepGraph {
        let mut graph = StepGraph::new("branching");
        graph.add_step(StepNode::start("check")).unwrap();
        graph.add_step(StepNode::terminal("approve")).unwrap();
        graph.add_step(StepNode::terminal("deny")).unwrap();
        graph
            .add_edge(StepEdge::when("check", "approve", "score >= 0.5"))
            .unwrap();
        graph
            .add_edge(StepEdge::when("check", "deny", "score < 0.5"))
            .unwrap();
        graph
    }

    #[test]
    fn test_valid_graphs() {
        linear().validate().unwrap();
        branching().validate().unwrap();
    }

    #[test]
    fn test_empty_and_missing_markers() {
        assert_eq!(StepGraph::new("x").validate(), Err(GraphError::Empty));

        let mut no_start = StepGraph::new("x");
        no_start.add_step(StepNode::terminal("end")).unwrap();
        assert_eq!(no_start.validate(), Err(GraphError::NoStartStep));

        let mut no_end = StepGraph::new("x");
        no_end.add_step(StepNode::start("a")).unwrap();
        assert_eq!(no_end.validate(), Err(GraphError::NoTerminalStep));

        let mut two_starts = linear();
        two_starts.steps.push(StepNode::start("z"));
        assert_eq!(two_starts.validate(), Err(GraphError::MultipleStartSteps(2)));
    }

    #[test]
    fn test_duplicates_rejected() {
        let mut graph = linear();
        assert!(matches!(
            graph.add_step(StepNode::task("b")),
            Err(GraphError::DuplicateStepId(_))
        ));
        assert!(matches!(
            graph.add_edge(StepEdge::new("a", "b")),
            Err(GraphError::DuplicateEdge { .. })
        ));
        assert!(matches!(
            graph.add_edge(StepEdge::new("a", "nope")),
            Err(GraphError::StepNotFound(_))
        ));
    }

    #[test]
    fn test_structural_defects() {
        let mut unreachable = linear();
        unreachable.steps.push(StepNode::terminal("island"));
        assert_eq!(
            unreachable.validate(),
            Err(GraphError::Unreachable(StepId::new("island")))
        );

        let mut dead_end = linear();
        dead_end.edges.retain(|e| e.source.as_str() != "b");
        assert!(matches!(dead_end.validate(), Err(GraphError::DeadEnd(_))));

        let mut mixed = branching();
        mixed.steps.push(StepNode::terminal("other"));
        mixed.edges.push(StepEdge::new("check", "other"));
        assert!(matches!(mixed.validate(), Err(GraphError::MixedRouting(_))));

        let mut bad_condition = branching();
        bad_condition.edges[0] = StepEdge::when("check", "approve", ">= 3");
        assert!(matches!(
            bad_condition.validate(),
            Err(GraphError::InvalidCondition { .. })
        ));
    }

    #[test]
    fn test_route_static_and_terminal() {
        let graph = linear();
        assert_eq!(
            graph.route(&StepId::new("a"), &Value::Null).unwrap(),
            Some(StepId::new("b"))
        );
        assert_eq!(graph.route(&StepId::new("c"), &Value::Null).unwrap(), None);
        assert!(matches!(
            graph.route(&StepId::new("zz"), &Value::Null),
            Err(RoutingError::StepNotFound(_))
        ));
    }

    #[test]
    fn test_route_conditional() {
        let graph = branching();
        let from = StepId::new("check");
        assert_eq!(
            graph.route(&from, &json!({"score": 0.9})).unwrap(),
            Some(StepId::new("approve"))
        );
        assert_eq!(
            graph.route(&from, &json!({"score": 0.1})).unwrap(),
            Some(StepId::new("deny"))
        );
        assert_eq!(
            graph.route(&from, &json!({})),
            Err(RoutingError::Ambiguous {
                step: from.clone(),
                matched: 0
            })
        );
    }

    #[test]
    fn test_route_multiple_matches_is_ambiguous() {
        let mut graph = branching();
        graph.edges[1] = StepEdge::when("check", "deny", "score > 0");
        let err = graph
            .route(&StepId::new("check"), &json!({"score": 0.9}))
            .unwrap_err();
        assert!(matches!(err, RoutingError::Ambiguous { matched: 2, .. }));
    }

    #[test]
    fn test_rejection_policy_override() {
        let mut graph = linear().with_rejection_policy(RejectionPolicy::FailRun);
        graph.steps[1].approval = Some(ApprovalPolicy {
            on_reject: Some(RejectionPolicy::SkipStep),
            ..Default::default()
        });
        assert_eq!(
            graph.rejection_policy_for(&StepId::new("b")),
            RejectionPolicy::SkipStep
        );
        assert_eq!(
            graph.rejection_policy_for(&StepId::new("a")),
            RejectionPolicy::FailRun
        );
        assert_eq!(graph.static_successor(&StepId::new("b")), Some(StepId::new("c")));
    }

    #[test]
    fn test_retry_backoff_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(10), Duration::from_millis(5_000));
    }

    #[test]
    fn test_yaml_shaped_definition_deserializes() {
        let graph: StepGraph = serde_json::from_value(json!({
            "id": "refunds",
            "name": "Refunds",
            "steps": [
                {"id": "lookup", "kind": "start"},
                {"id": "refund", "action": {
                    "kind": "payment.refund",
                    "effect": "financial",
                    "reversibility": {"type": "irreversible"}
                }},
                {"id": "done", "kind": "terminal"}
            ],
            "edges": [
                {"source": "lookup", "target": "refund"},
                {"source": "refund", "target": "done"}
            ]
        }))
        .unwrap();
        graph.validate().unwrap();
        let refund = graph.get_step(&StepId::new("refund")).unwrap();
        assert_eq!(refund.kind, StepKind::Task);
        assert_eq!(refund.action.effect, EffectDomain::Financial);
        assert_eq!(refund.action.reversibility, Reversibility::Irreversible);
    }
}
