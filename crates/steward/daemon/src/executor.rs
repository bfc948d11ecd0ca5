//! Step executors the daemon can delegate to

use crate::config::ExecutorConfig;
use crate::error::{DaemonError, DaemonResult};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use steward_engine::{CancelToken, StepError, StepExecutor, StepInput};
use steward_types::StepId;

pub fn build_executor(config: &ExecutorConfig) -> DaemonResult<Arc<dyn StepExecutor>> {
    match config {
        ExecutorConfig::Echo => Ok(Arc::new(EchoStepExecutor)),
        ExecutorConfig::Http {
            endpoint,
            timeout_secs,
        } => Ok(Arc::new(HttpStepExecutor::new(
            endpoint.clone(),
            Duration::from_secs(*timeout_secs),
        )?)),
    }
}

/// Development executor: a step's output is its `params`, or its id when it has none
#[derive(Clone, Debug, Default)]
pub struct EchoStepExecutor;

#[async_trait]
impl StepExecutor for EchoStepExecutor {
    async fn execute(
        &self,
        step_id: &StepId,
        input: StepInput,
        _cancel: CancelToken,
    ) -> Result<Value, StepError> {
        if input.params.is_null() {
            Ok(json!({ "step_id": step_id }))
        } else {
            Ok(input.params)
        }
    }
}

/// POSTs the step input to an agent endpoint and returns the JSON response body.
///
/// Server errors and transport failures are retryable; other non-success
/// statuses are permanent. An in-flight request is dropped on cancellation.
pub struct HttpStepExecutor {
    client: Client,
    endpoint: String,
}

impl HttpStepExecutor {
    pub fn new(endpoint: String, timeout: Duration) -> DaemonResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DaemonError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, endpoint })
    }

    async fn call(&self, step_id: &StepId, input: &StepInput) -> Result<Value, StepError> {
        let url = format!("{}/{}", self.endpoint.trim_end_matches('/'), step_id);
        let response = self
            .client
            .post(&url)
            .json(input)
            .send()
            .await
            .map_err(|e| StepError::failed(format!("executor request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!("executor error {}: {}", status, truncate(&body, 320));
            return Err(if is_retryable(status) {
                StepError::Failed(message)
            } else {
                StepError::Permanent(message)
            });
        }

        response
            .json()
            .await
            .map_err(|e| StepError::Permanent(format!("invalid executor response: {e}")))
    }
}

#[async_trait]
impl StepExecutor for HttpStepExecutor {
    async fn execute(
        &self,
        step_id: &StepId,
        input: StepInput,
        cancel: CancelToken,
    ) -> Result<Value, StepError> {
        tracing::debug!(run_id = %input.run_id, step_id = %step_id, attempt = input.attempt, "Calling step executor");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StepError::Cancelled),
            result = self.call(step_id, &input) => result,
        }
    }
}

fn is_retryable(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

pub(crate) fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}
