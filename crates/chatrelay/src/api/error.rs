//! API error handling.
//!
//! Failures are reported as a bare status code with a plaintext body; the
//! relay endpoints declare no error schema.

use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::{error, warn};

use crate::upstream::UpstreamError;

/// Body sent when the completion provider fails.
pub const UPSTREAM_ERROR_BODY: &str = "Upstream error";

/// Body sent when a relay request body cannot be read.
pub const INVALID_BODY: &str = "Invalid request body";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Provider call failed; never surfaced in detail to the caller.
    #[error("Upstream failure: {0}")]
    Upstream(String),

    /// Relay body was not a JSON chat request.
    #[error("Malformed request body: {0}")]
    MalformedBody(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Upstream(_) | Self::MalformedBody(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<UpstreamError> for ApiError {
    fn from(err: UpstreamError) -> Self {
        Self::Upstream(err.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::MalformedBody(rejection.body_text())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(format!("{err:#}"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let body = match &self {
            ApiError::Upstream(msg) => {
                warn!(message = %msg, "upstream request failed");
                UPSTREAM_ERROR_BODY.to_string()
            }
            ApiError::MalformedBody(msg) => {
                warn!(message = %msg, "unreadable relay request");
                INVALID_BODY.to_string()
            }
            ApiError::Internal(msg) => {
                error!(message = %msg, "API error");
                "Internal server error".to_string()
            }
            ApiError::BadRequest(_) => {
                tracing::debug!(message = %self, "client error");
                self.to_string()
            }
        };

        (status, body).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
