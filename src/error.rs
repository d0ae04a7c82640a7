// =============================================================================
// Error taxonomy
// =============================================================================
//
// `FeedError` classifies everything the upstream boundary can report; the
// Feed Session turns each variant into a state transition and nothing above
// it ever sees one. `ApiError` is the only error an HTTP caller can receive.
// =============================================================================

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FeedError {
    /// Missing or invalid credentials. Fatal, never retried.
    #[error("configuration error: {0}")]
    Config(String),

    /// Network or handshake failure. Retried with a short delay.
    #[error("transient upstream error: {0}")]
    Transient(String),

    /// Explicit auth failure. Retried only after the full cooldown.
    #[error("upstream rejected credentials: {0}")]
    Rejected(String),

    /// The upstream wants an out-of-band code before completing the handshake.
    #[error("verification required: {0}")]
    VerificationRequired(String),

    /// Payload that could not be interpreted.
    #[error("malformed upstream payload: {0}")]
    Malformed(String),

    #[error("upstream not connected")]
    NotConnected,
}

impl FeedError {
    /// Classify a free-form handshake failure reason the way the broker
    /// reports it.
    pub fn from_handshake_reason(reason: &str) -> Self {
        let lower = reason.to_lowercase();
        let asks_for_code = lower
            .split(|c: char| !c.is_ascii_alphanumeric())
            .any(|word| word == "pin" || word.starts_with("verif"));
        if asks_for_code {
            Self::VerificationRequired(reason.to_string())
        } else if lower.contains("password")
            || lower.contains("credential")
            || lower.contains("unauthor")
            || lower.contains("forbidden")
        {
            Self::Rejected(reason.to_string())
        } else {
            Self::Transient(reason.to_string())
        }
    }
}

/// Error returned by the HTTP query API.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unavailable(String),
    Internal(String),
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadRequest(msg) => write!(f, "bad_request: {msg}"),
            Self::Unavailable(msg) => write!(f, "unavailable: {msg}"),
            Self::Internal(msg) => write!(f, "internal_error: {msg}"),
        }
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            Self::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, axum::Json(json!({ "error": message }))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        Self::Internal(format!("{e:#}"))
    }
}
