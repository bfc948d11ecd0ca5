//! Mode switching between gate checks
//!
//! The switcher is a pure function from the current mode state and a signal
//! to a decision. The engine applies decisions after the step or approval
//! that produced the signal, so a change only affects the next gate check.

use serde::{Deserialize, Serialize};
use steward_types::{Mode, ModeState, RiskLevel};

/// What happened since the last evaluation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Signal {
    /// A step finished; `level` is the risk it was assessed at
    StepCompleted { level: RiskLevel },
    ApprovalDecided { approved: bool },
    /// Explicit user request
    UserRequested {
        mode: Mode,
        threshold: Option<RiskLevel>,
    },
}

impl Signal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StepCompleted { .. } => "step_completed",
            Self::ApprovalDecided { approved: true } => "approval_granted",
            Self::ApprovalDecided { approved: false } => "approval_rejected",
            Self::UserRequested { .. } => "user_requested",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwitchDecision {
    NoChange,
    Switch(ModeState),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitcherConfig {
    /// Consecutive approvals that relax the mode; zero disables relaxing
    pub relax_after_approvals: u32,
    /// Whether rejections tighten the mode
    pub tighten_on_reject: bool,
    /// Whether a high-risk step seen in autonomous mode moves to hybrid
    pub escalate_on_high_risk: bool,
}

impl Default for SwitcherConfig {
    fn default() -> Self {
        Self {
            relax_after_approvals: 3,
            tighten_on_reject: true,
            escalate_on_high_risk: true,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ModeSwitcher {
    config: SwitcherConfig,
}

impl ModeSwitcher {
    pub fn new(config: SwitcherConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SwitcherConfig {
        &self.config
    }

    /// Decide the next mode. `streak` counts consecutive approvals including
    /// the one being signalled.
    pub fn evaluate(&self, current: ModeState, streak: u32, signal: &Signal) -> SwitchDecision {
        let next = match *signal {
            Signal::UserRequested { mode, threshold } => Some(ModeState {
                mode,
                hybrid_threshold: threshold.unwrap_or(current.hybrid_threshold),
            }),
            Signal::ApprovalDecided { approved: false } if self.config.tighten_on_reject => {
                tighten(current)
            }
            Signal::ApprovalDecided { approved: true }
                if self.config.relax_after_approvals > 0
                    && streak >= self.config.relax_after_approvals =>
            {
                relax(current)
            }
            Signal::StepCompleted { level }
                if self.config.escalate_on_high_risk
                    && current.mode == Mode::Autonomous
                    && level >= RiskLevel::High =>
            {
                Some(ModeState::hybrid(RiskLevel::High))
            }
            _ => None,
        };

        match next {
            Some(state) if state != current => SwitchDecision::Switch(state),
            _ => SwitchDecision::NoChange,
        }
    }
}

fn tighten(current: ModeState) -> Option<ModeState> {
    match current.mode {
        Mode::Autonomous => Some(ModeState::hybrid(RiskLevel::High)),
        Mode::Hybrid if current.hybrid_threshold > RiskLevel::Medium => {
            Some(ModeState::hybrid(current.hybrid_threshold.lowered()))
        }
        Mode::Hybrid => Some(ModeState::new(Mode::Supervised)),
        Mode::Supervised => None,
    }
}

fn relax(current: ModeState) -> Option<ModeState> {
    match current.mode {
        Mode::Supervised => Some(ModeState::hybrid(RiskLevel::High)),
        Mode::Hybrid if current.hybrid_threshold < RiskLevel::Critical => {
            Some(ModeState::hybrid(current.hybrid_threshold.raised()))
        }
        Mode::Hybrid | Mode::Autonomous => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn switcher() -> ModeSwitcher {
        ModeSwitcher::default()
    }

    fn rejected() -> Signal {
        Signal::ApprovalDecided { approved: false }
    }

    #[test]
    fn rejection_ladder_tightens() {
        let s = switcher();
        let mut state = ModeState::new(Mode::Autonomous);
        let mut seen = Vec::new();
        while let SwitchDecision::Switch(next) = s.evaluate(state, 0, &rejected()) {
            seen.push(next.to_string());
            state = next;
        }
        assert_eq!(seen, ["hybrid@high", "hybrid@medium", "supervised"]);
    }

    #[test]
    fn approval_streak_relaxes() {
        let s = switcher();
        let supervised = ModeState::new(Mode::Supervised);
        let granted = Signal::ApprovalDecided { approved: true };
        assert_eq!(s.evaluate(supervised, 2, &granted), SwitchDecision::NoChange);
        assert_eq!(
            s.evaluate(supervised, 3, &granted),
            SwitchDecision::Switch(ModeState::hybrid(RiskLevel::High))
        );
        assert_eq!(
            s.evaluate(ModeState::hybrid(RiskLevel::High), 3, &granted),
            SwitchDecision::Switch(ModeState::hybrid(RiskLevel::Critical))
        );
        assert_eq!(
            s.evaluate(ModeState::hybrid(RiskLevel::Critical), 9, &granted),
            SwitchDecision::NoChange
        );
    }

    #[test]
    fn high_risk_step_in_autonomous_moves_to_hybrid() {
        let s = switcher();
        let auto = ModeState::new(Mode::Autonomous);
        assert_eq!(
            s.evaluate(auto, 0, &Signal::StepCompleted { level: RiskLevel::Medium }),
            SwitchDecision::NoChange
        );
        assert_eq!(
            s.evaluate(auto, 0, &Signal::StepCompleted { level: RiskLevel::High }),
            SwitchDecision::Switch(ModeState::hybrid(RiskLevel::High))
        );
    }

    #[test]
    fn user_request_applies_and_keeps_threshold() {
        let s = switcher();
        let current = ModeState::hybrid(RiskLevel::Medium);
        let to_auto = Signal::UserRequested {
            mode: Mode::Autonomous,
            threshold: None,
        };
        match s.evaluate(current, 0, &to_auto) {
            SwitchDecision::Switch(next) => {
                assert_eq!(next.mode, Mode::Autonomous);
                assert_eq!(next.hybrid_threshold, RiskLevel::Medium);
            }
            other => panic!("expected switch, got {other:?}"),
        }
        let same = Signal::UserRequested {
            mode: Mode::Hybrid,
            threshold: Some(RiskLevel::Medium),
        };
        assert_eq!(s.evaluate(current, 0, &same), SwitchDecision::NoChange);
    }

    #[test]
    fn disabled_rules_do_nothing() {
        let s = ModeSwitcher::new(SwitcherConfig {
            relax_after_approvals: 0,
            tighten_on_reject: false,
            escalate_on_high_risk: false,
        });
        let auto = ModeState::new(Mode::Autonomous);
        assert_eq!(s.evaluate(auto, 0, &rejected()), SwitchDecision::NoChange);
        assert_eq!(
            s.evaluate(
                ModeState::new(Mode::Supervised),
                10,
                &Signal::ApprovalDecided { approved: true }
            ),
            SwitchDecision::NoChange
        );
    }
}
