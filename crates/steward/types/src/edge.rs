//! Step edges and routing conditions
//!
//! An edge either always fires (`always`) or fires when a condition over
//! the source step's JSON output holds (`when`). Conditions are small
//! comparisons against a dotted path into the output:
//!
//! - `status == "ok"`, `count != 0`, `amount >= 100`, `score < 0.5`
//! - `approved` (truthy check) and `!approved` (negated truthy check)

use crate::StepId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// A directed edge between two steps
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepEdge {
    /// Source step
    pub source: StepId,
    /// Target step
    pub target: StepId,
    /// When this edge may be followed
    #[serde(default)]
    pub condition: EdgeCondition,
    /// Human-readable label for this transition
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub label: String,
}

impl StepEdge {
    /// Create an edge that is always followed
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: StepId::new(source),
            target: StepId::new(target),
            condition: EdgeCondition::Always,
            label: String::new(),
        }
    }

    /// Create an edge followed only when `expression` holds for the source output
    pub fn when(
        source: impl Into<String>,
        target: impl Into<String>,
        expression: impl Into<String>,
    ) -> Self {
        Self {
            source: StepId::new(source),
            target: StepId::new(target),
            condition: EdgeCondition::When {
                expression: expression.into(),
            },
            label: String::new(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn is_static(&self) -> bool {
        matches!(self.condition, EdgeCondition::Always)
    }
}

/// Firing rule of an edge
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EdgeCondition {
    /// Followed unconditionally
    #[default]
    Always,
    /// Followed when the expression evaluates to true against the step output
    When { expression: String },
}

impl EdgeCondition {
    /// Evaluate against a step output. Expressions that fail to parse never match.
    pub fn matches(&self, output: &Value) -> bool {
        match self {
            Self::Always => true,
            Self::When { expression } => Condition::parse(expression)
                .map(|c| c.evaluate(output))
                .unwrap_or(false),
        }
    }
}

// ── Condition expressions ────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CompareOp {
    Eq,
    Ne,
    Ge,
    Le,
    Gt,
    Lt,
}

// Two-character operators first so `>=` is never read as `>`.
const OPERATORS: [(&str, CompareOp); 6] = [
    ("==", CompareOp::Eq),
    ("!=", CompareOp::Ne),
    (">=", CompareOp::Ge),
    ("<=", CompareOp::Le),
    (">", CompareOp::Gt),
    ("<", CompareOp::Lt),
];

/// A parsed edge condition
#[derive(Clone, Debug, PartialEq)]
pub struct Condition {
    path: Vec<String>,
    test: ConditionTest,
}

#[derive(Clone, Debug, PartialEq)]
enum ConditionTest {
    Truthy { negated: bool },
    Compare { op: CompareOp, literal: Value },
}

impl Condition {
    /// Parse a condition expression
    pub fn parse(expression: &str) -> Result<Self, String> {
        let expression = expression.trim();
        if expression.is_empty() {
            return Err("empty expression".into());
        }

        for (symbol, op) in OPERATORS {
            if let Some((lhs, rhs)) = expression.split_once(symbol) {
                let path = parse_path(lhs)?;
                let rhs = rhs.trim();
                if rhs.is_empty() {
                    return Err(format!("missing right-hand side after '{symbol}'"));
                }
                return Ok(Self {
                    path,
                    test: ConditionTest::Compare {
                        op,
                        literal: parse_literal(rhs),
                    },
                });
            }
        }

        let (negated, key) = match expression.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, expression),
        };
        Ok(Self {
            path: parse_path(key)?,
            test: ConditionTest::Truthy { negated },
        })
    }

    /// Evaluate against a step output
    pub fn evaluate(&self, output: &Value) -> bool {
        let actual = lookup(output, &self.path);
        match &self.test {
            ConditionTest::Truthy { negated } => truthy(actual) != *negated,
            ConditionTest::Compare { op, literal } => match (op, actual) {
                // A missing value satisfies only `!=`
                (CompareOp::Ne, None) => true,
                (_, None) => false,
                (CompareOp::Eq, Some(actual)) => loosely_equal(actual, literal),
                (CompareOp::Ne, Some(actual)) => !loosely_equal(actual, literal),
                (op, Some(actual)) => match order(actual, literal) {
                    Some(ordering) => match op {
                        CompareOp::Ge => ordering != Ordering::Less,
                        CompareOp::Le => ordering != Ordering::Greater,
                        CompareOp::Gt => ordering == Ordering::Greater,
                        CompareOp::Lt => ordering == Ordering::Less,
                        CompareOp::Eq | CompareOp::Ne => false,
                    },
                    None => false,
                },
            },
        }
    }
}

fn parse_path(raw: &str) -> Result<Vec<String>, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err("missing left-hand side".into());
    }
    let segments: Vec<String> = raw.split('.').map(|s| s.trim().to_string()).collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(format!("invalid path '{raw}'"));
    }
    if let Some(bad) = segments
        .iter()
        .find(|s| s.chars().any(|c| c.is_whitespace() || c == '"' || c == '\''))
    {
        return Err(format!("invalid path segment '{bad}'"));
    }
    Ok(segments)
}

/// Literals are JSON when they parse as JSON, otherwise bare strings
fn parse_literal(raw: &str) -> Value {
    if raw.len() >= 2 && raw.starts_with('\'') && raw.ends_with('\'') {
        return Value::String(raw[1..raw.len() - 1].to_string());
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn lookup<'a>(value: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter().try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(Value::Object(o)) => !o.is_empty(),
    }
}

fn loosely_equal(actual: &Value, literal: &Value) -> bool {
    match (actual, literal) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        // `status == ok` compares against the string "ok"
        (Value::String(a), Value::String(b)) => a == b,
        (Value::Bool(a), Value::String(b)) | (Value::String(b), Value::Bool(a)) => {
            b.parse::<bool>().map(|b| b == *a).unwrap_or(false)
        }
        _ => actual == literal,
    }
}

fn order(actual: &Value, literal: &Value) -> Option<Ordering> {
    match (actual, literal) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval(expression: &str, output: Value) -> bool {
        Condition::parse(expression).unwrap().evaluate(&output)
    }

    #[test]
    fn test_equality() {
        assert!(eval("status == \"ok\"", json!({"status": "ok"})));
        assert!(eval("status == ok", json!({"status": "ok"})));
        assert!(eval("status == 'ok'", json!({"status": "ok"})));
        assert!(!eval("status == ok", json!({"status": "error"})));
        assert!(eval("count == 3", json!({"count": 3.0})));
        assert!(eval("flag == true", json!({"flag": true})));
    }

    #[test]
    fn test_missing_variable() {
        assert!(!eval("status == ok", json!({})));
        assert!(eval("status != ok", json!({})));
        assert!(!eval("amount > 1", json!({})));
        assert!(!eval("approved", json!({})));
        assert!(eval("!approved", json!({})));
    }

    #[test]
    fn test_ordering() {
        assert!(eval("amount >= 100", json!({"amount": 100})));
        assert!(!eval("amount > 100", json!({"amount": 100})));
        assert!(eval("amount <= 100", json!({"amount": 99.5})));
        assert!(eval("score < 0.5", json!({"score": 0.1})));
        assert!(!eval("score < 0.5", json!({"score": "low"})));
    }

    #[test]
    fn test_dotted_paths() {
        let output = json!({"result": {"items": [{"kind": "refund"}], "total": 12}});
        assert!(eval("result.total > 10", output.clone()));
        assert!(eval("result.items.0.kind == refund", output.clone()));
        assert!(!eval("result.items.3.kind == refund", output));
    }

    #[test]
    fn test_truthiness() {
        assert!(eval("approved", json!({"approved": true})));
        assert!(!eval("approved", json!({"approved": false})));
        assert!(!eval("items", json!({"items": []})));
        assert!(eval("!items", json!({"items": []})));
        assert!(eval("name", json!({"name": "x"})));
    }

    #[test]
    fn test_parse_errors() {
        assert!(Condition::parse("").is_err());
        assert!(Condition::parse("== 3").is_err());
        assert!(Condition::parse("amount >=").is_err());
        assert!(Condition::parse("a..b").is_err());
        assert!(Condition::parse("two words").is_err());
    }

    #[test]
    fn test_edge_condition_matches() {
        assert!(EdgeCondition::Always.matches(&Value::Null));
        let edge = StepEdge::when("a", "b", "kind == refund");
        assert!(!edge.is_static());
        assert!(edge.condition.matches(&json!({"kind": "refund"})));
        assert!(!edge.condition.matches(&json!({"kind": "charge"})));
        let bad = EdgeCondition::When {
            expression: String::new(),
        };
        assert!(!bad.matches(&json!({})));
    }

    #[test]
    fn test_condition_serde_shape() {
        let edge: StepEdge = serde_json::from_value(json!({
            "source": "a",
            "target": "b",
            "condition": {"type": "when", "expression": "ok"}
        }))
        .unwrap();
        assert_eq!(
            edge.condition,
            EdgeCondition::When {
                expression: "ok".into()
            }
        );
        let plain: StepEdge = serde_json::from_value(json!({"source": "a", "target": "b"})).unwrap();
        assert!(plain.is_static());
    }
}
