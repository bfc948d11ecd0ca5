//! Step executor capability and cooperative cancellation

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use steward_types::{ActionDescriptor, RunId, StepId};
use tokio::sync::watch;

/// Cooperative cancellation signal shared between the engine and an executor.
///
/// Executors should poll [`CancelToken::is_cancelled`] or race their work
/// against [`CancelToken::cancelled`]. The engine never force-kills a step.
#[derive(Clone, Debug)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Withdraw a signal that did not take effect
    pub(crate) fn reset(&self) {
        self.tx.send_replace(false);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once cancellation has been signalled
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this cannot observe a closed channel
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything an executor receives for one step
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepInput {
    pub run_id: RunId,
    pub step_id: StepId,
    pub action: ActionDescriptor,
    /// Static parameters declared on the step
    #[serde(default)]
    pub params: Value,
    /// Input the run was started with
    #[serde(default)]
    pub run_input: Value,
    /// Output of the previously completed step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<Value>,
    /// Outputs of all completed steps
    #[serde(default)]
    pub outputs: BTreeMap<StepId, Value>,
    /// 1-based attempt number
    pub attempt: u32,
}

/// Failure reported by a step executor
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StepError {
    /// Retried according to the step's retry policy
    #[error("{0}")]
    Failed(String),

    /// Not retried
    #[error("{0}")]
    Permanent(String),

    /// The executor acknowledged cancellation
    #[error("step cancelled")]
    Cancelled,
}

impl StepError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// External capability that computes a step's output.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(
        &self,
        step_id: &StepId,
        input: StepInput,
        cancel: CancelToken,
    ) -> Result<Value, StepError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn cancel_wakes_waiters() {
        let token = CancelToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };
        assert!(!token.is_cancelled());
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_returns_immediately_when_already_signalled() {
        let token = CancelToken::new();
        token.cancel();
        token.cancel();
        tokio::time::timeout(Duration::from_millis(50), token.cancelled())
            .await
            .unwrap();
    }

    #[test]
    fn retryability() {
        assert!(StepError::failed("x").is_retryable());
        assert!(!StepError::Permanent("x".into()).is_retryable());
        assert!(!StepError::Cancelled.is_retryable());
    }
}
