//! Error types for steward-daemon

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use steward_engine::EngineError;
use steward_storage::StorageError;
use thiserror::Error;

/// Daemon-level errors
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Server startup error
    #[error("Server error: {0}")]
    Server(String),

    /// Graph definitions could not be loaded
    #[error("Graph loading error: {0}")]
    Graphs(String),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// API-specific errors
#[derive(Debug, Error)]
pub enum ApiError {
    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Bad request
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Conflict with the current state of a run or request
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let message = err.to_string();
        match err {
            EngineError::RunNotFound(_) | EngineError::RequestNotFound(_) => {
                ApiError::NotFound(message)
            }
            EngineError::InvalidTransition(_)
            | EngineError::NotRunning { .. }
            | EngineError::AlreadyResolved(_)
            | EngineError::DuplicateApprover { .. }
            | EngineError::RunAlreadyExists(_) => ApiError::Conflict(message),
            EngineError::GraphInvalid { .. } => ApiError::Validation(message),
            EngineError::InvalidDecision(_) => ApiError::BadRequest(message),
            EngineError::Storage(storage) => storage.into(),
            EngineError::StepExecution(_)
            | EngineError::AmbiguousRouting(_)
            | EngineError::ApprovalTimeout(_)
            | EngineError::Rejected(_)
            | EngineError::Cancelled(_)
            | EngineError::Serialization(_) => ApiError::Internal(message),
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        let message = err.to_string();
        match err {
            StorageError::NotFound(_) => ApiError::NotFound(message),
            StorageError::Conflict(_) | StorageError::Decision(_) => ApiError::Conflict(message),
            StorageError::InvalidInput(_) => ApiError::BadRequest(message),
            _ => ApiError::Internal(message),
        }
    }
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            ApiError::Validation(_) => (StatusCode::UNPROCESSABLE_ENTITY, "VALIDATION_ERROR"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }

        let body = ErrorResponse {
            error: self.to_string(),
            code: code.to_string(),
        };

        (status, Json(body)).into_response()
    }
}

/// Result type alias for API operations
pub type ApiResult<T> = Result<T, ApiError>;

/// Result type alias for daemon operations
pub type DaemonResult<T> = Result<T, DaemonError>;

#[cfg(test)]
mod tests {
    use super::*;
    use steward_types::{RequestId, RunId, RunStatus};

    #[test]
    fn test_api_error_status_codes() {
        assert_eq!(
            ApiError::NotFound("test".to_string())
                .into_response()
                .status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::Validation("test".to_string())
                .into_response()
                .status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }

    #[test]
    fn test_engine_errors_map_to_http_semantics() {
        let status = |err: EngineError| ApiError::from(err).into_response().status();
        assert_eq!(
            status(EngineError::AlreadyResolved(RequestId::new("q"))),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status(EngineError::RequestNotFound(RequestId::new("q"))),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status(EngineError::NotRunning {
                run_id: RunId::new("r"),
                status: RunStatus::Completed,
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status(EngineError::Storage(StorageError::Backend("down".into()))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
