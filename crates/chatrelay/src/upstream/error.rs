//! Upstream client error types.

use thiserror::Error;

/// Result type for upstream operations.
pub type UpstreamResult<T> = Result<T, UpstreamError>;

/// Errors that can occur while talking to the completion provider.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// No API key configured; callers should serve the mock reply instead.
    #[error("no upstream credential configured")]
    NotConfigured,

    /// HTTP request failed before a response arrived.
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    /// Provider answered with a non-success status.
    #[error("upstream returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },

    /// Response body could not be decoded.
    #[error("failed to parse upstream response: {0}")]
    ParseError(String),
}
