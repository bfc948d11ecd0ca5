//! Approval requests and responses
//!
//! A request is opened when a step is gated and is closed exactly once:
//! approved, rejected, expired or cancelled. Votes are counted per distinct
//! approver; a single rejection closes the request.

use crate::{DecisionError, RiskLevel, RunId, StepId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for an approval request
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub String);

impl RequestId {
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

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of an approval request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Open,
    Approved,
    Rejected,
    Expired,
    Cancelled,
}

impl ApprovalStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ApprovalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "expired" => Ok(Self::Expired),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown approval status: {other}")),
        }
    }
}

/// A pending human decision on a gated step
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub request_id: RequestId,
    pub run_id: RunId,
    pub step_id: StepId,
    /// What would happen if approved
    pub action: String,
    pub risk_level: RiskLevel,
    pub risk_score: f64,
    /// Fixed at creation
    pub required_approvers: u32,
    pub timeout_seconds: u64,
    pub created_at: DateTime<Utc>,
    /// When the current escalation tier times out
    pub deadline_at: DateTime<Utc>,
    pub status: ApprovalStatus,
    pub escalation_level: u32,
    pub max_escalation_depth: u32,
    /// Group notified at the current tier
    pub approver_group: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub escalation_chain: Vec<String>,
    #[serde(default)]
    pub responses: Vec<ApprovalResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
}

impl ApprovalRequest {
    pub fn new(run_id: RunId, step_id: StepId, action: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            request_id: RequestId::generate(),
            run_id,
            step_id,
            action: action.into(),
            risk_level: RiskLevel::Low,
            risk_score: 0.0,
            required_approvers: 1,
            timeout_seconds: 0,
            created_at: now,
            deadline_at: now,
            status: ApprovalStatus::Open,
            escalation_level: 0,
            max_escalation_depth: 0,
            approver_group: String::new(),
            escalation_chain: Vec::new(),
            responses: Vec::new(),
            closed_at: None,
        }
    }

    pub fn with_risk(mut self, level: RiskLevel, score: f64) -> Self {
        self.risk_level = level;
        self.risk_score = score;
        self
    }

    /// Required approvers is clamped to at least one
    pub fn with_required_approvers(mut self, count: u32) -> Self {
        self.required_approvers = count.max(1);
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self.deadline_at = self.created_at + secs(seconds);
        self
    }

    pub fn with_approver_group(mut self, group: impl Into<String>) -> Self {
        self.approver_group = group.into();
        self
    }

    pub fn with_escalation(mut self, chain: Vec<String>, max_depth: u32) -> Self {
        self.escalation_chain = chain;
        self.max_escalation_depth = max_depth;
        self
    }

    pub fn is_open(&self) -> bool {
        self.status.is_open()
    }

    /// Distinct approvals recorded so far
    pub fn approvals(&self) -> usize {
        self.responses.iter().filter(|r| r.approved).count()
    }

    /// Record a vote. Returns the request status after the vote.
    pub fn apply_response(
        &mut self,
        response: ApprovalResponse,
    ) -> Result<ApprovalStatus, DecisionError> {
        if !self.is_open() {
            return Err(DecisionError::AlreadyResolved(self.request_id.clone()));
        }
        if response.approver_id.trim().is_empty() {
            return Err(DecisionError::MissingApprover);
        }
        if self
            .responses
            .iter()
            .any(|r| r.approver_id == response.approver_id)
        {
            return Err(DecisionError::DuplicateApprover {
                request_id: self.request_id.clone(),
                approver_id: response.approver_id,
            });
        }

        let decided_at = response.decided_at;
        let approved = response.approved;
        self.responses.push(response);

        if !approved {
            self.close(ApprovalStatus::Rejected, decided_at);
        } else if self.approvals() >= self.required_approvers as usize {
            self.close(ApprovalStatus::Approved, decided_at);
        }
        Ok(self.status)
    }

    /// Close the request. Returns false if it was already closed.
    pub fn close(&mut self, status: ApprovalStatus, at: DateTime<Utc>) -> bool {
        if !self.is_open() || status.is_open() {
            return false;
        }
        self.status = status;
        self.closed_at = Some(at);
        true
    }

    /// Whether another escalation tier is available
    pub fn can_escalate(&self) -> bool {
        !self.escalation_chain.is_empty() && self.escalation_level < self.max_escalation_depth
    }

    /// Approver group for an escalation level (level 0 is the current group)
    pub fn group_for_level(&self, level: u32) -> Option<&str> {
        if level == 0 {
            return Some(self.approver_group.as_str());
        }
        let last = self.escalation_chain.len().checked_sub(1)?;
        let index = (level as usize - 1).min(last);
        self.escalation_chain.get(index).map(String::as_str)
    }

    /// Move to the next tier and restart the deadline
    pub fn escalate(&mut self, now: DateTime<Utc>) -> Option<u32> {
        if !self.is_open() || !self.can_escalate() {
            return None;
        }
        let level = self.escalation_level + 1;
        let group = self.group_for_level(level)?.to_string();
        self.escalation_level = level;
        self.approver_group = group;
        self.deadline_at = now + secs(self.timeout_seconds);
        Some(level)
    }

    /// Time left before the current tier times out
    pub fn remaining(&self, now: DateTime<Utc>) -> std::time::Duration {
        (self.deadline_at - now).to_std().unwrap_or_default()
    }

    /// One-line summary for notifications
    pub fn summary(&self) -> String {
        format!(
            "Run {} step '{}' needs approval ({} risk, score {:.2}): {}",
            self.run_id, self.step_id, self.risk_level, self.risk_score, self.action
        )
    }
}

// Ten years; keeps deadline arithmetic in range
const MAX_TIMEOUT_SECS: u64 = 315_360_000;

fn secs(seconds: u64) -> Duration {
    Duration::seconds(seconds.min(MAX_TIMEOUT_SECS) as i64)
}

/// A decision against an approval request
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApprovalResponse {
    pub request_id: RequestId,
    pub approved: bool,
    #[serde(default)]
    pub reason: String,
    pub approver_id: String,
    pub decided_at: DateTime<Utc>,
}

impl ApprovalResponse {
    pub fn approve(request_id: RequestId, approver_id: impl Into<String>) -> Self {
        Self {
            request_id,
            approved: true,
            reason: String::new(),
            approver_id: approver_id.into(),
            decided_at: Utc::now(),
        }
    }

    pub fn reject(
        request_id: RequestId,
        approver_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            request_id,
            approved: false,
            reason: reason.into(),
            approver_id: approver_id.into(),
            decided_at: Utc::now(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(required: u32) -> ApprovalRequest {
        ApprovalRequest::new(RunId::new("r"), StepId::new("s"), "refund")
            .with_risk(RiskLevel::High, 0.7)
            .with_required_approvers(required)
            .with_timeout(60)
            .with_approver_group("ops")
    }

    #[test]
    fn test_single_approval_closes() {
        let mut req = request(1);
        let id = req.request_id.clone();
        let status = req
            .apply_response(ApprovalResponse::approve(id.clone(), "alice"))
            .unwrap();
        assert_eq!(status, ApprovalStatus::Approved);
        assert!(req.closed_at.is_some());
        assert_eq!(
            req.apply_response(ApprovalResponse::approve(id.clone(), "bob")),
            Err(DecisionError::AlreadyResolved(id))
        );
    }

    #[test]
    fn test_quorum_counts_distinct_approvers() {
        let mut req = request(2);
        let id = req.request_id.clone();
        assert_eq!(
            req.apply_response(ApprovalResponse::approve(id.clone(), "alice"))
                .unwrap(),
            ApprovalStatus::Open
        );
        assert!(matches!(
            req.apply_response(ApprovalResponse::approve(id.clone(), "alice")),
            Err(DecisionError::DuplicateApprover { .. })
        ));
        assert_eq!(
            req.apply_response(ApprovalResponse::approve(id, "bob"))
                .unwrap(),
            ApprovalStatus::Approved
        );
    }

    #[test]
    fn test_single_rejection_closes() {
        let mut req = request(3);
        let id = req.request_id.clone();
        req.apply_response(ApprovalResponse::approve(id.clone(), "alice"))
            .unwrap();
        let status = req
            .apply_response(ApprovalResponse::reject(id, "bob", "too risky"))
            .unwrap();
        assert_eq!(status, ApprovalStatus::Rejected);
    }

    #[test]
    fn test_required_approvers_at_least_one() {
        assert_eq!(request(0).required_approvers, 1);
    }

    #[test]
    fn test_missing_approver_refused() {
        let mut req = request(1);
        let id = req.request_id.clone();
        assert_eq!(
            req.apply_response(ApprovalResponse::approve(id, " ")),
            Err(DecisionError::MissingApprover)
        );
        assert!(req.is_open());
    }

    #[test]
    fn test_escalation_ladder() {
        let mut req = request(1).with_escalation(vec!["leads".into(), "directors".into()], 3);
        let now = Utc::now();
        assert_eq!(req.escalate(now), Some(1));
        assert_eq!(req.approver_group, "leads");
        assert_eq!(req.escalate(now), Some(2));
        assert_eq!(req.approver_group, "directors");
        // Past the end of the chain the last tier is reused
        assert_eq!(req.escalate(now), Some(3));
        assert_eq!(req.approver_group, "directors");
        assert_eq!(req.escalate(now), None);
    }

    #[test]
    fn test_no_chain_never_escalates() {
        let mut req = request(1).with_escalation(Vec::new(), 2);
        assert!(!req.can_escalate());
        assert_eq!(req.escalate(Utc::now()), None);
    }

    #[test]
    fn test_close_is_exactly_once() {
        let mut req = request(1);
        assert!(req.close(ApprovalStatus::Expired, Utc::now()));
        assert!(!req.close(ApprovalStatus::Cancelled, Utc::now()));
        assert_eq!(req.status, ApprovalStatus::Expired);
        assert!(!request(1).close(ApprovalStatus::Open, Utc::now()));
    }

    #[test]
    fn test_remaining_never_negative() {
        let req = request(1);
        let later = req.deadline_at + Duration::seconds(5);
        assert_eq!(req.remaining(later), std::time::Duration::ZERO);
        assert!(req.remaining(req.created_at) <= std::time::Duration::from_secs(60));
    }
}
