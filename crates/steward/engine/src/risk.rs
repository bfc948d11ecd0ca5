//! Risk assessment strategies
//!
//! Every strategy is a pure function of the action descriptor and context.
//! Levels always come from [`RiskLevel::from_score`], so the bucketing is
//! identical across strategies.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use steward_types::{
    ActionDescriptor, EffectDomain, Mode, Reversibility, RiskAssessment, RiskLevel, RunId, StepId,
};

/// Context a step is scored in
#[derive(Clone, Copy, Debug)]
pub struct RiskContext<'a> {
    pub run_id: &'a RunId,
    pub step_id: &'a StepId,
    pub mode: Mode,
    pub requester: Option<&'a str>,
}

/// Scores a proposed step
pub trait RiskAssessmentEngine: Send + Sync {
    fn name(&self) -> &str;

    fn score(&self, action: &ActionDescriptor, context: &RiskContext<'_>) -> RiskAssessment;
}

/// Strategy selection, as read from configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum RiskConfig {
    Heuristic(HeuristicRiskConfig),
    RuleTable(RuleTableConfig),
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self::Heuristic(HeuristicRiskConfig::default())
    }
}

impl RiskConfig {
    pub fn build(&self) -> Arc<dyn RiskAssessmentEngine> {
        match self {
            Self::Heuristic(config) => Arc::new(HeuristicRiskEngine::new(config.clone())),
            Self::RuleTable(config) => Arc::new(RuleTableRiskEngine::new(config.clone())),
        }
    }
}

// ── Heuristic ────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HeuristicRiskConfig {
    pub base_score: f64,
    /// Added for irreversible actions; half of it for conditional reversibility
    pub irreversible_penalty: f64,
    pub financial_multiplier: f64,
    pub infrastructure_penalty: f64,
    pub governance_penalty: f64,
    pub data_deletion_penalty: f64,
}

impl Default for HeuristicRiskConfig {
    fn default() -> Self {
        Self {
            base_score: 0.2,
            irreversible_penalty: 0.3,
            financial_multiplier: 1.5,
            infrastructure_penalty: 0.2,
            governance_penalty: 0.15,
            data_deletion_penalty: 0.25,
        }
    }
}

/// Scores by reversibility, effect domain and blast radius
pub struct HeuristicRiskEngine {
    config: HeuristicRiskConfig,
}

impl HeuristicRiskEngine {
    pub fn new(config: HeuristicRiskConfig) -> Self {
        Self { config }
    }
}

impl Default for HeuristicRiskEngine {
    fn default() -> Self {
        Self::new(HeuristicRiskConfig::default())
    }
}

impl RiskAssessmentEngine for HeuristicRiskEngine {
    fn name(&self) -> &str {
        "heuristic"
    }

    fn score(&self, action: &ActionDescriptor, _context: &RiskContext<'_>) -> RiskAssessment {
        let mut score = self.config.base_score;
        let mut factors = Vec::new();

        match action.reversibility {
            Reversibility::Irreversible => {
                score += self.config.irreversible_penalty;
                factors.push("Irreversible action".to_string());
            }
            Reversibility::Conditional { window_secs } => {
                score += self.config.irreversible_penalty * 0.5;
                factors.push("Conditional reversal".to_string());
                if matches!(window_secs, Some(w) if w < 60) {
                    score += 0.1;
                    factors.push("Short reversal window (<1min)".to_string());
                }
            }
            Reversibility::Reversible => {}
        }

        match action.effect {
            EffectDomain::Financial => {
                score *= self.config.financial_multiplier;
                factors.push("Financial domain (elevated risk)".to_string());
            }
            EffectDomain::Infrastructure => {
                score += self.config.infrastructure_penalty;
                factors.push("Infrastructure domain".to_string());
            }
            EffectDomain::Governance => {
                score += self.config.governance_penalty;
                factors.push("Governance domain".to_string());
            }
            EffectDomain::DataDeletion => {
                score += self.config.data_deletion_penalty;
                factors.push("Data deletion".to_string());
            }
            EffectDomain::Compute | EffectDomain::Communication | EffectDomain::Data => {}
        }

        let target_count = action.targets.len();
        if target_count > 10 {
            score += 0.15;
            factors.push(format!("High target count: {target_count}"));
        } else if target_count > 5 {
            score += 0.05;
            factors.push(format!("Moderate target count: {target_count}"));
        }

        if let Some(hint) = action.risk_hint {
            if score < hint.floor_score() {
                score = hint.floor_score();
                factors.push(format!("Declared risk hint: {hint}"));
            }
        }

        let mut assessment = RiskAssessment::from_score(score);
        assessment.factors = factors;
        assessment
    }
}

// ── Rule table ───────────────────────────────────────────────────────

/// One row of a rule table. `pattern` is an exact action kind or a `prefix*`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RiskRule {
    pub pattern: String,
    pub level: RiskLevel,
    /// Defaults to the level's floor score
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

impl RiskRule {
    pub fn new(pattern: impl Into<String>, level: RiskLevel) -> Self {
        Self {
            pattern: pattern.into(),
            level,
            score: None,
        }
    }

    pub fn matches(&self, kind: &str) -> bool {
        match self.pattern.strip_suffix('*') {
            Some(prefix) => kind.starts_with(prefix),
            None => self.pattern == kind,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RuleTableConfig {
    #[serde(default)]
    pub rules: Vec<RiskRule>,
    #[serde(default)]
    pub default_level: RiskLevel,
}

/// First matching rule wins
pub struct RuleTableRiskEngine {
    config: RuleTableConfig,
}

impl RuleTableRiskEngine {
    pub fn new(config: RuleTableConfig) -> Self {
        Self { config }
    }
}

impl RiskAssessmentEngine for RuleTableRiskEngine {
    fn name(&self) -> &str {
        "rule_table"
    }

    fn score(&self, action: &ActionDescriptor, _context: &RiskContext<'_>) -> RiskAssessment {
        let (level, score, factor) = match self.config.rules.iter().find(|r| r.matches(&action.kind))
        {
            Some(rule) => (
                rule.level,
                rule.score.unwrap_or_else(|| rule.level.floor_score()),
                format!("Matched rule '{}'", rule.pattern),
            ),
            None => (
                self.config.default_level,
                self.config.default_level.floor_score(),
                "No rule matched".to_string(),
            ),
        };

        // A configured score outside the rule's bucket is pulled back into it
        let bucketed = RiskAssessment::from_score(score);
        let score = if bucketed.level == level {
            bucketed.score
        } else {
            level.floor_score()
        };
        RiskAssessment {
            level,
            score,
            factors: vec![factor],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context<'a>(run_id: &'a RunId, step_id: &'a StepId) -> RiskContext<'a> {
        RiskContext {
            run_id,
            step_id,
            mode: Mode::Hybrid,
            requester: None,
        }
    }

    fn score(engine: &dyn RiskAssessmentEngine, action: &ActionDescriptor) -> RiskAssessment {
        let run_id = RunId::new("r");
        let step_id = StepId::new("s");
        engine.score(action, &context(&run_id, &step_id))
    }

    #[test]
    fn low_risk_compute() {
        let assessment = score(
            &HeuristicRiskEngine::default(),
            &ActionDescriptor::new("lookup", "read a record"),
        );
        assert_eq!(assessment.level, RiskLevel::Low);
        assert!((assessment.score - 0.2).abs() < 1e-9);
    }

    #[test]
    fn irreversible_financial_is_high() {
        let action = ActionDescriptor::new("payment.send", "wire funds")
            .with_effect(EffectDomain::Financial)
            .with_reversibility(Reversibility::Irreversible);
        let assessment = score(&HeuristicRiskEngine::default(), &action);
        // (0.2 + 0.3) * 1.5
        assert!((assessment.score - 0.75).abs() < 1e-9);
        assert_eq!(assessment.level, RiskLevel::High);
        assert_eq!(assessment.factors.len(), 2);
    }

    #[test]
    fn infrastructure_irreversible_with_many_targets_is_critical() {
        let mut action = ActionDescriptor::new("infra.drop", "drop clusters")
            .with_effect(EffectDomain::Infrastructure)
            .with_reversibility(Reversibility::Irreversible);
        for i in 0..11 {
            action = action.with_target(format!("cluster-{i}"));
        }
        let assessment = score(&HeuristicRiskEngine::default(), &action);
        assert_eq!(assessment.level, RiskLevel::Critical);
        assert!(assessment.score <= 1.0);
    }

    #[test]
    fn risk_hint_raises_floor_only() {
        let hinted = ActionDescriptor::new("note", "").with_risk_hint(RiskLevel::High);
        assert_eq!(
            score(&HeuristicRiskEngine::default(), &hinted).level,
            RiskLevel::High
        );
        let already_higher = ActionDescriptor::new("drop", "")
            .with_effect(EffectDomain::Financial)
            .with_reversibility(Reversibility::Irreversible)
            .with_risk_hint(RiskLevel::Low);
        assert_eq!(
            score(&HeuristicRiskEngine::default(), &already_higher).level,
            RiskLevel::High
        );
    }

    #[test]
    fn scoring_is_deterministic() {
        let engine = HeuristicRiskEngine::default();
        let action = ActionDescriptor::new("data.purge", "purge")
            .with_effect(EffectDomain::DataDeletion)
            .with_reversibility(Reversibility::Conditional {
                window_secs: Some(30),
            });
        let first = score(&engine, &action);
        let second = score(&engine, &action);
        assert_eq!(first, second);
        // 0.2 + 0.15 + 0.1 + 0.25
        assert!((first.score - 0.7).abs() < 1e-9);
        assert_eq!(first.level, RiskLevel::High);
    }

    #[test]
    fn rule_table_first_match_wins() {
        let engine = RuleTableRiskEngine::new(RuleTableConfig {
            rules: vec![
                RiskRule::new("payment.refund", RiskLevel::Medium),
                RiskRule::new("payment.*", RiskLevel::Critical),
            ],
            default_level: RiskLevel::Low,
        });
        let refund = score(&engine, &ActionDescriptor::new("payment.refund", ""));
        assert_eq!(refund.level, RiskLevel::Medium);
        let wire = score(&engine, &ActionDescriptor::new("payment.wire", ""));
        assert_eq!(wire.level, RiskLevel::Critical);
        let other = score(&engine, &ActionDescriptor::new("search", ""));
        assert_eq!(other.level, RiskLevel::Low);
    }

    #[test]
    fn rule_score_stays_in_bucket() {
        let engine = RuleTableRiskEngine::new(RuleTableConfig {
            rules: vec![RiskRule {
                pattern: "x".into(),
                level: RiskLevel::High,
                score: Some(0.95),
            }],
            default_level: RiskLevel::Low,
        });
        let assessment = score(&engine, &ActionDescriptor::new("x", ""));
        assert_eq!(assessment.level, RiskLevel::High);
        assert_eq!(RiskLevel::from_score(assessment.score), RiskLevel::High);
    }

    #[test]
    fn config_selects_strategy() {
        let config: RiskConfig = serde_json::from_value(serde_json::json!({
            "strategy": "rule_table",
            "rules": [{"pattern": "deploy*", "level": "high"}]
        }))
        .unwrap();
        assert_eq!(config.build().name(), "rule_table");
        assert_eq!(RiskConfig::default().build().name(), "heuristic");
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        fn any_effect() -> impl Strategy<Value = EffectDomain> {
            prop_oneof![
                Just(EffectDomain::Compute),
                Just(EffectDomain::Communication),
                Just(EffectDomain::Data),
                Just(EffectDomain::DataDeletion),
                Just(EffectDomain::Financial),
                Just(EffectDomain::Infrastructure),
                Just(EffectDomain::Governance),
            ]
        }

        fn any_reversibility() -> impl Strategy<Value = Reversibility> {
            prop_oneof![
                Just(Reversibility::Reversible),
                Just(Reversibility::Irreversible),
                proptest::option::of(0u64..600)
                    .prop_map(|window_secs| Reversibility::Conditional { window_secs }),
            ]
        }

        fn any_level() -> impl Strategy<Value = RiskLevel> {
            prop_oneof![
                Just(RiskLevel::Low),
                Just(RiskLevel::Medium),
                Just(RiskLevel::High),
                Just(RiskLevel::Critical),
            ]
        }

        proptest! {
            #[test]
            fn prop_heuristic_score_is_bounded_and_respects_hint(
                effect in any_effect(),
                reversibility in any_reversibility(),
                targets in 0usize..20,
                hint in proptest::option::of(any_level()),
            ) {
                let mut action = ActionDescriptor::new("op", "")
                    .with_effect(effect)
                    .with_reversibility(reversibility);
                for i in 0..targets {
                    action = action.with_target(format!("t{i}"));
                }
                if let Some(hint) = hint {
                    action = action.with_risk_hint(hint);
                }

                let assessment = score(&HeuristicRiskEngine::default(), &action);
                prop_assert!((0.0..=1.0).contains(&assessment.score));
                prop_assert_eq!(assessment.level, RiskLevel::from_score(assessment.score));
                if let Some(hint) = hint {
                    prop_assert!(assessment.level >= hint);
                }
            }
        }
    }
}
