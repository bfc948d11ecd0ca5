//! Approval notifiers the daemon can deliver through

use crate::config::NotifierConfig;
use crate::error::{DaemonError, DaemonResult};
use crate::executor::truncate;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use steward_engine::{LogNotifier, Notifier, NotifyError, RequestSummary};

pub fn build_notifier(config: &NotifierConfig) -> DaemonResult<Arc<dyn Notifier>> {
    match config {
        NotifierConfig::Log => Ok(Arc::new(LogNotifier)),
        NotifierConfig::Webhook { url, timeout_secs } => Ok(Arc::new(WebhookNotifier::new(
            url.clone(),
            Duration::from_secs(*timeout_secs),
        )?)),
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    approver_group: &'a str,
    request: &'a RequestSummary,
}

/// POSTs `{approver_group, request}` to a webhook
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: String, timeout: Duration) -> DaemonResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DaemonError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(
        &self,
        approver_group: &str,
        summary: &RequestSummary,
    ) -> Result<(), NotifyError> {
        let failure = |reason: String| NotifyError {
            group: approver_group.to_string(),
            reason,
        };

        let response = self
            .client
            .post(&self.url)
            .json(&WebhookPayload {
                approver_group,
                request: summary,
            })
            .send()
            .await
            .map_err(|e| failure(format!("webhook request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(failure(format!(
                "webhook error {}: {}",
                status,
                truncate(&body, 320)
            )));
        }
        tracing::debug!(request_id = %summary.request_id, approver_group, "Webhook notification delivered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use steward_types::{RequestId, RiskLevel, RunId, StepId};

    #[tokio::test]
    async fn unreachable_webhook_reports_group() {
        let notifier =
            WebhookNotifier::new("http://127.0.0.1:9/hook".into(), Duration::from_secs(2)).unwrap();
        let summary = RequestSummary {
            request_id: RequestId::new("q"),
            run_id: RunId::new("r"),
            step_id: StepId::new("s"),
            action: "payment.refund".into(),
            risk_level: RiskLevel::High,
            risk_score: 0.7,
            required_approvers: 1,
            timeout_seconds: 60,
            escalation_level: 0,
            message: "refund".into(),
        };
        let err = notifier.notify("finance", &summary).await.unwrap_err();
        assert_eq!(err.group, "finance");
    }

    #[test]
    fn log_notifier_is_default() {
        assert!(build_notifier(&NotifierConfig::default()).is_ok());
    }
}
