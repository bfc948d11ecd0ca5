//! Intent routing: choose the initial execution mode of a request

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use steward_types::Mode;

/// Declared intent signals of an incoming request
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct IntentRequest {
    /// Mode the user asked for explicitly
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explicit_mode: Option<Mode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester: Option<String>,
    /// Historical risk score of the requester in [0, 1], when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester_risk: Option<f64>,
    #[serde(default)]
    pub kind: RequestKind,
    /// Free text of the request
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,
}

impl IntentRequest {
    pub fn explicit(mode: Mode) -> Self {
        Self {
            explicit_mode: Some(mode),
            ..Default::default()
        }
    }
}

/// Shape of a request
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    /// Chat-style conversational request
    Conversational,
    /// Structured workflow submission
    Workflow,
    #[default]
    Unspecified,
}

/// Classifies a request into an execution mode
pub trait IntentRouter: Send + Sync {
    fn name(&self) -> &str;

    fn classify(&self, request: &IntentRequest) -> Mode;
}

/// Strategy selection, as read from configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum RouterConfig {
    Explicit {
        #[serde(default)]
        default_mode: Mode,
    },
    RiskProfile {
        #[serde(default)]
        profiles: HashMap<String, f64>,
        /// Score assumed for unknown requesters
        #[serde(default)]
        default_score: f64,
    },
    Heuristic {
        #[serde(default = "default_sensitive_keywords")]
        sensitive_keywords: Vec<String>,
    },
}

fn default_sensitive_keywords() -> Vec<String> {
    [
        "delete", "drop", "transfer", "payment", "refund", "deploy", "production", "revoke",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self::Heuristic {
            sensitive_keywords: default_sensitive_keywords(),
        }
    }
}

impl RouterConfig {
    pub fn build(&self) -> Arc<dyn IntentRouter> {
        match self {
            Self::Explicit { default_mode } => Arc::new(ExplicitRouter::new(*default_mode)),
            Self::RiskProfile {
                profiles,
                default_score,
            } => Arc::new(RiskProfileRouter::new(profiles.clone(), *default_score)),
            Self::Heuristic { sensitive_keywords } => {
                Arc::new(HeuristicRouter::new(sensitive_keywords.clone()))
            }
        }
    }
}

/// Honours the explicit flag, otherwise a fixed default
pub struct ExplicitRouter {
    default_mode: Mode,
}

impl ExplicitRouter {
    pub fn new(default_mode: Mode) -> Self {
        Self { default_mode }
    }
}

impl IntentRouter for ExplicitRouter {
    fn name(&self) -> &str {
        "explicit"
    }

    fn classify(&self, request: &IntentRequest) -> Mode {
        request.explicit_mode.unwrap_or(self.default_mode)
    }
}

/// Routes by the requester's historical risk score
pub struct RiskProfileRouter {
    profiles: HashMap<String, f64>,
    default_score: f64,
}

impl RiskProfileRouter {
    pub const SUPERVISED_AT: f64 = 0.6;
    pub const HYBRID_AT: f64 = 0.3;

    pub fn new(profiles: HashMap<String, f64>, default_score: f64) -> Self {
        Self {
            profiles,
            default_score,
        }
    }

    fn requester_score(&self, request: &IntentRequest) -> f64 {
        request
            .requester
            .as_ref()
            .and_then(|r| self.profiles.get(r).copied())
            .or(request.requester_risk)
            .unwrap_or(self.default_score)
    }
}

impl IntentRouter for RiskProfileRouter {
    fn name(&self) -> &str {
        "risk_profile"
    }

    fn classify(&self, request: &IntentRequest) -> Mode {
        if let Some(mode) = request.explicit_mode {
            return mode;
        }
        let score = self.requester_score(request);
        if score >= Self::SUPERVISED_AT {
            Mode::Supervised
        } else if score >= Self::HYBRID_AT {
            Mode::Hybrid
        } else {
            Mode::Autonomous
        }
    }
}

/// Routes by request shape and sensitive wording
pub struct HeuristicRouter {
    sensitive_keywords: Vec<String>,
}

impl HeuristicRouter {
    pub fn new(sensitive_keywords: Vec<String>) -> Self {
        Self {
            sensitive_keywords: sensitive_keywords
                .into_iter()
                .map(|k| k.to_lowercase())
                .collect(),
        }
    }

    fn is_sensitive(&self, text: &str) -> bool {
        let text = text.to_lowercase();
        text.split(|c: char| !c.is_alphanumeric())
            .any(|word| self.sensitive_keywords.iter().any(|k| k == word))
    }
}

impl Default for HeuristicRouter {
    fn default() -> Self {
        Self::new(default_sensitive_keywords())
    }
}

impl IntentRouter for HeuristicRouter {
    fn name(&self) -> &str {
        "heuristic"
    }

    fn classify(&self, request: &IntentRequest) -> Mode {
        if let Some(mode) = request.explicit_mode {
            return mode;
        }
        if request.kind == RequestKind::Workflow || self.is_sensitive(&request.text) {
            return Mode::Supervised;
        }
        match request.kind {
            RequestKind::Conversational => Mode::Autonomous,
            _ => Mode::Hybrid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_flag_wins_everywhere() {
        let request = IntentRequest {
            explicit_mode: Some(Mode::Autonomous),
            kind: RequestKind::Workflow,
            requester_risk: Some(0.9),
            text: "delete production".into(),
            ..Default::default()
        };
        for config in [
            RouterConfig::Explicit {
                default_mode: Mode::Supervised,
            },
            RouterConfig::RiskProfile {
                profiles: HashMap::new(),
                default_score: 1.0,
            },
            RouterConfig::default(),
        ] {
            assert_eq!(config.build().classify(&request), Mode::Autonomous);
        }
    }

    #[test]
    fn explicit_router_falls_back_to_default() {
        let router = ExplicitRouter::new(Mode::Supervised);
        assert_eq!(router.classify(&IntentRequest::default()), Mode::Supervised);
    }

    #[test]
    fn risk_profile_thresholds() {
        let mut profiles = HashMap::new();
        profiles.insert("mallory".to_string(), 0.8);
        profiles.insert("bob".to_string(), 0.4);
        let router = RiskProfileRouter::new(profiles, 0.0);

        let by = |name: &str| IntentRequest {
            requester: Some(name.to_string()),
            ..Default::default()
        };
        assert_eq!(router.classify(&by("mallory")), Mode::Supervised);
        assert_eq!(router.classify(&by("bob")), Mode::Hybrid);
        assert_eq!(router.classify(&by("alice")), Mode::Autonomous);

        let declared = IntentRequest {
            requester: Some("carol".into()),
            requester_risk: Some(0.65),
            ..Default::default()
        };
        assert_eq!(router.classify(&declared), Mode::Supervised);
    }

    #[test]
    fn heuristic_shapes_and_keywords() {
        let router = HeuristicRouter::default();
        let chat = IntentRequest {
            kind: RequestKind::Conversational,
            text: "summarise the meeting".into(),
            ..Default::default()
        };
        assert_eq!(router.classify(&chat), Mode::Autonomous);

        let risky_chat = IntentRequest {
            kind: RequestKind::Conversational,
            text: "please Refund order 42".into(),
            ..Default::default()
        };
        assert_eq!(router.classify(&risky_chat), Mode::Supervised);

        let workflow = IntentRequest {
            kind: RequestKind::Workflow,
            ..Default::default()
        };
        assert_eq!(router.classify(&workflow), Mode::Supervised);
        assert_eq!(router.classify(&IntentRequest::default()), Mode::Hybrid);
    }

    #[test]
    fn keywords_match_whole_words() {
        let router = HeuristicRouter::default();
        let request = IntentRequest {
            kind: RequestKind::Conversational,
            text: "the dropdown is broken".into(),
            ..Default::default()
        };
        assert_eq!(router.classify(&request), Mode::Autonomous);
    }
}
