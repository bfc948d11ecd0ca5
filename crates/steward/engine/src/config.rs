//! Engine configuration

use serde::{Deserialize, Serialize};
use steward_types::{ApprovalPolicy, RejectionPolicy, RetryPolicy, RiskLevel};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Save a checkpoint after every completed step, not only at gates
    pub checkpoint_every_step: bool,
    /// Used for steps without their own retry policy
    pub default_retry: RetryPolicy,
    pub approvals: ApprovalDefaults,
    /// Threshold given to runs that start in hybrid mode
    pub default_hybrid_threshold: RiskLevel,
    /// Capacity of the live event channel
    pub event_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            checkpoint_every_step: true,
            default_retry: RetryPolicy::default(),
            approvals: ApprovalDefaults::default(),
            default_hybrid_threshold: RiskLevel::High,
            event_buffer: 1024,
        }
    }
}

/// Approval settings used where a step's policy leaves a field unset
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalDefaults {
    pub required_approvers: u32,
    pub timeout_secs: u64,
    pub approver_group: String,
    pub escalation_chain: Vec<String>,
    pub max_escalation_depth: u32,
}

impl Default for ApprovalDefaults {
    fn default() -> Self {
        Self {
            required_approvers: 1,
            timeout_secs: 300,
            approver_group: "approvers".to_string(),
            escalation_chain: Vec::new(),
            max_escalation_depth: 2,
        }
    }
}

/// A step's approval policy with every field resolved
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedApproval {
    pub required_approvers: u32,
    pub timeout_secs: u64,
    pub approver_group: String,
    pub escalation_chain: Vec<String>,
    pub max_escalation_depth: u32,
    pub on_reject: RejectionPolicy,
}

impl ApprovalDefaults {
    pub fn resolve(
        &self,
        policy: Option<&ApprovalPolicy>,
        graph_on_reject: RejectionPolicy,
    ) -> ResolvedApproval {
        let policy = policy.cloned().unwrap_or_default();
        ResolvedApproval {
            required_approvers: policy
                .required_approvers
                .unwrap_or(self.required_approvers)
                .max(1),
            timeout_secs: policy.timeout_secs.unwrap_or(self.timeout_secs),
            approver_group: policy
                .approver_group
                .unwrap_or_else(|| self.approver_group.clone()),
            escalation_chain: policy
                .escalation_chain
                .unwrap_or_else(|| self.escalation_chain.clone()),
            max_escalation_depth: policy
                .max_escalation_depth
                .unwrap_or(self.max_escalation_depth),
            on_reject: policy.on_reject.unwrap_or(graph_on_reject),
        }
    }
}
