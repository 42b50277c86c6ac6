use axum::{http::StatusCode, response::IntoResponse, response::Response, Json};
use serde::Serialize;
use thiserror::Error;

/// Coarse error kind carried inside a terminal `StreamEvent::Error`, independent of how the
/// owning `AppError` maps to an HTTP status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RequestTimeout,
    StreamTimeout,
    BackendError,
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid request field {0}: {1}")]
    InvalidRequest(String, String),
    #[error("invalid config field {0}")]
    InvalidConfig(String),
    #[error("rate limit exceeded for client {0}")]
    RateLimited(String),
    #[error("unknown model {0}")]
    UnknownModel(String),
    #[error("scheduler queue full for model {0}")]
    QueueFull(String),
    #[error("backpressure dropped tokens for stream {0}")]
    BackpressureDropped(String),
    #[error("request {0} timed out")]
    RequestTimeout(String),
    #[error("stream {0} already exists")]
    StreamExists(String),
    #[error("stream {0} timed out waiting for a token")]
    StreamTimeout(String),
    #[error("stream {0} is closed")]
    StreamClosed(String),
    #[error("no loader registered for model {0}")]
    NoLoader(String),
    #[error("failed to load model {0}: {1}")]
    LoadFailed(String, String),
    #[error("backend error: {0}")]
    BackendError(String),
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
    #[serde(rename = "type")]
    error_type: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            AppError::InvalidRequest(_, _) => (StatusCode::BAD_REQUEST, "invalid_request_error"),
            AppError::InvalidConfig(_) => (StatusCode::INTERNAL_SERVER_ERROR, "invalid_config_error"),
            AppError::RateLimited(_) => (StatusCode::TOO_MANY_REQUESTS, "rate_limit_error"),
            AppError::UnknownModel(_) => (StatusCode::NOT_FOUND, "unknown_model_error"),
            AppError::QueueFull(_) | AppError::BackpressureDropped(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "overloaded_error")
            }
            AppError::RequestTimeout(_) => (StatusCode::GATEWAY_TIMEOUT, "timeout_error"),
            AppError::StreamExists(_) | AppError::StreamTimeout(_) | AppError::StreamClosed(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "stream_error")
            }
            AppError::NoLoader(_) | AppError::LoadFailed(_, _) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "registry_error")
            }
            AppError::BackendError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "backend_error"),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "server_error"),
        };

        let payload = ErrorEnvelope {
            error: ErrorBody {
                message: self.to_string(),
                error_type: error_type.to_owned(),
            },
        };

        (status, Json(payload)).into_response()
    }
}
