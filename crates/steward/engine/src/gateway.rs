//! Approval gateway: opens, decides, escalates and expires approval requests
//!
//! The gateway owns the human-workflow side of a gate. Persistence goes
//! through the [`ApprovalStore`]; notifications are best effort and never
//! fail a gate. Each open request has at most one timer, owned by the
//! [`TimerSet`] and abortable on its own.

use crate::config::ApprovalDefaults;
use crate::error::EngineResult;
use crate::notifier::{Notifier, RequestSummary};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use steward_storage::ApprovalStore;
use steward_types::{
    ApprovalRequest, ApprovalResponse, ApprovalStatus, RejectionPolicy, RequestId, RiskAssessment,
    Run, StepNode,
};
use tokio::task::AbortHandle;

/// What a fired timer did
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TimeoutOutcome {
    /// Moved to the next tier and re-armed
    Escalated { level: u32 },
    /// Expired; the waiting run was failed
    Expired,
    /// The request was already closed
    Closed,
}

pub struct ApprovalGateway {
    store: Arc<dyn ApprovalStore>,
    notifier: Arc<dyn Notifier>,
    defaults: ApprovalDefaults,
    timers: TimerSet,
}

impl ApprovalGateway {
    pub fn new(
        store: Arc<dyn ApprovalStore>,
        notifier: Arc<dyn Notifier>,
        defaults: ApprovalDefaults,
    ) -> Self {
        Self {
            store,
            notifier,
            defaults,
            timers: TimerSet::default(),
        }
    }

    pub fn store(&self) -> &Arc<dyn ApprovalStore> {
        &self.store
    }

    pub fn timers(&self) -> &TimerSet {
        &self.timers
    }

    /// Build the request for a gated step. Unset policy fields take the
    /// configured defaults.
    pub fn build_request(
        &self,
        run: &Run,
        node: &StepNode,
        assessment: &RiskAssessment,
        graph_on_reject: RejectionPolicy,
    ) -> ApprovalRequest {
        let policy = self.defaults.resolve(node.approval.as_ref(), graph_on_reject);
        ApprovalRequest::new(run.run_id.clone(), node.id.clone(), node.action.summary())
            .with_risk(assessment.level, assessment.score)
            .with_required_approvers(policy.required_approvers)
            .with_timeout(policy.timeout_secs)
            .with_approver_group(policy.approver_group)
            .with_escalation(policy.escalation_chain, policy.max_escalation_depth)
    }

    /// Persist a new request and notify its approver group
    pub async fn open(&self, request: &ApprovalRequest) -> EngineResult<()> {
        self.store.open_request(request).await?;
        tracing::info!(
            request_id = %request.request_id,
            run_id = %request.run_id,
            step_id = %request.step_id,
            risk_level = %request.risk_level,
            approver_group = %request.approver_group,
            "Approval requested"
        );
        self.notify(request).await;
        Ok(())
    }

    /// Record one approver's vote
    pub async fn decide(&self, response: ApprovalResponse) -> EngineResult<ApprovalRequest> {
        let approver_id = response.approver_id.clone();
        let request = self.store.record_response(response).await?;
        tracing::info!(
            request_id = %request.request_id,
            run_id = %request.run_id,
            approver_id = %approver_id,
            status = %request.status,
            approvals = request.approvals(),
            required = request.required_approvers,
            "Approval decision recorded"
        );
        if !request.is_open() {
            self.timers.disarm(&request.request_id);
        }
        Ok(request)
    }

    /// Move to the next escalation tier and notify it
    pub async fn escalate(
        &self,
        request_id: &RequestId,
        now: DateTime<Utc>,
    ) -> EngineResult<Option<ApprovalRequest>> {
        let Some(request) = self.store.escalate_request(request_id, now).await? else {
            return Ok(None);
        };
        tracing::warn!(
            request_id = %request.request_id,
            run_id = %request.run_id,
            level = request.escalation_level,
            approver_group = %request.approver_group,
            "Approval escalated"
        );
        self.notify(&request).await;
        Ok(Some(request))
    }

    /// Close an open request as expired or cancelled and drop its timer
    pub async fn close(
        &self,
        request_id: &RequestId,
        status: ApprovalStatus,
    ) -> EngineResult<Option<ApprovalRequest>> {
        let closed = self.store.close_request(request_id, status, Utc::now()).await?;
        self.timers.disarm(request_id);
        if closed.is_some() {
            tracing::info!(request_id = %request_id, status = %status, "Approval request closed");
        }
        Ok(closed)
    }

    pub fn disarm(&self, request_id: &RequestId) {
        self.timers.disarm(request_id);
    }

    async fn notify(&self, request: &ApprovalRequest) {
        let summary = RequestSummary::from(request);
        if let Err(e) = self
            .notifier
            .notify(&request.approver_group, &summary)
            .await
        {
            tracing::warn!(request_id = %request.request_id, error = %e, "Approval notification failed");
        }
    }
}

/// Per-request approval timers
///
/// Each arming gets a generation number. A firing timer removes its own
/// entry before running its handler, so the handler may re-arm the same
/// request without aborting itself.
#[derive(Default)]
pub struct TimerSet {
    timers: Arc<DashMap<RequestId, (u64, AbortHandle)>>,
    generation: AtomicU64,
}

impl TimerSet {
    /// Run `on_fire` after `delay`, replacing any timer already armed for the request
    pub fn arm<F>(&self, request_id: RequestId, delay: Duration, on_fire: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let timers = self.timers.clone();
        let id = request_id.clone();
        let spawn = move || {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                timers.remove_if(&id, |_, (armed, _)| *armed == generation);
                on_fire.await;
            })
            .abort_handle()
        };

        // Spawning under the entry guard keeps the map in step with the task
        match self.timers.entry(request_id) {
            Entry::Occupied(mut slot) => {
                let (_, previous) = slot.insert((generation, spawn()));
                previous.abort();
            }
            Entry::Vacant(slot) => {
                slot.insert((generation, spawn()));
            }
        }
    }

    /// Abort the request's timer, if any
    pub fn disarm(&self, request_id: &RequestId) -> bool {
        match self.timers.remove(request_id) {
            Some((_, (_, handle))) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self, request_id: &RequestId) -> bool {
        self.timers.contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    pub fn abort_all(&self) {
        self.timers.retain(|_, (_, handle)| {
            handle.abort();
            false
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::NotifyError;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use steward_storage::InMemoryStewardStorage;
    use steward_types::{
        ActionDescriptor, ApprovalPolicy, GraphId, Mode, ModeState, RiskLevel, RunId, StepId,
    };

    #[derive(Default)]
    struct RecordingNotifier {
        groups: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(
            &self,
            approver_group: &str,
            _summary: &RequestSummary,
        ) -> Result<(), NotifyError> {
            self.groups.lock().unwrap().push(approver_group.to_string());
            if self.fail {
                return Err(NotifyError {
                    group: approver_group.to_string(),
                    reason: "unreachable".into(),
                });
            }
            Ok(())
        }
    }

    fn gateway(notifier: Arc<RecordingNotifier>) -> ApprovalGateway {
        ApprovalGateway::new(
            Arc::new(InMemoryStewardStorage::new()),
            notifier,
            ApprovalDefaults {
                escalation_chain: vec!["leads".into(), "directors".into()],
                ..Default::default()
            },
        )
    }

    fn run() -> Run {
        Run::new(
            RunId::new("r"),
            GraphId::new("g"),
            StepId::new("refund"),
            ModeState::new(Mode::Supervised),
        )
    }

    fn node() -> StepNode {
        StepNode::task("refund")
            .with_action(ActionDescriptor::new("payment.refund", "refund $40"))
            .with_approval(ApprovalPolicy {
                required_approvers: Some(2),
                timeout_secs: Some(30),
                ..Default::default()
            })
    }

    #[tokio::test]
    async fn build_request_merges_policy_and_defaults() {
        let gw = gateway(Arc::default());
        let request = gw.build_request(
            &run(),
            &node(),
            &RiskAssessment::from_score(0.7),
            RejectionPolicy::FailRun,
        );
        assert_eq!(request.required_approvers, 2);
        assert_eq!(request.timeout_seconds, 30);
        assert_eq!(request.approver_group, "approvers");
        assert_eq!(request.escalation_chain.len(), 2);
        assert_eq!(request.max_escalation_depth, 2);
        assert_eq!(request.risk_level, RiskLevel::High);
    }

    #[tokio::test]
    async fn notification_failure_does_not_fail_open() {
        let notifier = Arc::new(RecordingNotifier {
            fail: true,
            ..Default::default()
        });
        let gw = gateway(notifier.clone());
        let request = gw.build_request(
            &run(),
            &node(),
            &RiskAssessment::from_score(0.7),
            RejectionPolicy::FailRun,
        );
        gw.open(&request).await.unwrap();
        assert_eq!(*notifier.groups.lock().unwrap(), vec!["approvers".to_string()]);
        assert!(gw
            .store()
            .get_request(&request.request_id)
            .await
            .unwrap()
            .unwrap()
            .is_open());
    }

    #[tokio::test]
    async fn escalation_notifies_next_tier() {
        let notifier = Arc::new(RecordingNotifier::default());
        let gw = gateway(notifier.clone());
        let request = gw.build_request(
            &run(),
            &node(),
            &RiskAssessment::from_score(0.7),
            RejectionPolicy::FailRun,
        );
        gw.open(&request).await.unwrap();
        let escalated = gw
            .escalate(&request.request_id, Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(escalated.escalation_level, 1);
        assert_eq!(
            *notifier.groups.lock().unwrap(),
            vec!["approvers".to_string(), "leads".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_replaces_previous_timer() {
        let timers = TimerSet::default();
        let fired = Arc::new(AtomicUsize::new(0));
        let id = RequestId::new("q");
        for _ in 0..3 {
            let fired = fired.clone();
            timers.arm(id.clone(), Duration::from_secs(1), async move {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(timers.len(), 1);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timers.is_armed(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn disarm_affects_only_its_request() {
        let timers = TimerSet::default();
        let fired = Arc::new(Mutex::new(Vec::new()));
        for name in ["a", "b"] {
            let fired = fired.clone();
            timers.arm(RequestId::new(name), Duration::from_secs(1), async move {
                fired.lock().unwrap().push(name);
            });
        }
        assert!(timers.disarm(&RequestId::new("a")));
        assert!(!timers.disarm(&RequestId::new("a")));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(*fired.lock().unwrap(), vec!["b"]);
    }
}
