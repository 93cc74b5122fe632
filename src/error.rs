use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::source::SourceIdError;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("backend unavailable: {message}")]
    BackendUnavailable { message: String, transient: bool },
    #[error("backend rejected command: {message}")]
    Backend { message: String },
    #[error("key {key} holds a value of the wrong type")]
    ShapeMismatch { key: String },
    #[error("failed to deserialize record: {0}")]
    Deserialization(#[from] serde_json::Error),
    #[error("unexpected backend reply: {message}")]
    Decode { message: String },
}

impl StoreError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            message: message.into(),
            transient: true,
        }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Map a backend error reply onto the matching variant. Redis prefixes
    /// type errors with `WRONGTYPE`.
    pub fn from_reply(key: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        if message.starts_with("WRONGTYPE") {
            Self::ShapeMismatch {
                key: key.to_string(),
            }
        } else {
            Self::Backend { message }
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::BackendUnavailable {
                transient: true,
                ..
            }
        )
    }
}

/// Failures surfaced to HTTP callers. Delivery failures never get here;
/// they are folded into the acknowledgment.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("method not allowed")]
    MethodNotSupported,
    #[error("invalid source id: {0}")]
    InvalidSource(#[from] SourceIdError),
    #[error("Missing verify_token")]
    MissingVerifyToken,
    #[error("storage backend not configured")]
    StorageNotConfigured,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            Self::MethodNotSupported => (StatusCode::METHOD_NOT_ALLOWED, "method_not_allowed"),
            Self::InvalidSource(_) => (StatusCode::BAD_REQUEST, "invalid_source"),
            Self::MissingVerifyToken => (StatusCode::BAD_REQUEST, "missing_verify_token"),
            Self::StorageNotConfigured => {
                (StatusCode::SERVICE_UNAVAILABLE, "storage_not_configured")
            }
            Self::Store(StoreError::BackendUnavailable { .. }) => {
                (StatusCode::SERVICE_UNAVAILABLE, "backend_unavailable")
            }
            Self::Store(_) => (StatusCode::BAD_GATEWAY, "backend_error"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        // The verification handshake is plain text on both outcomes.
        if matches!(self, Self::MissingVerifyToken) {
            return (status, self.to_string()).into_response();
        }
        let envelope = ErrorEnvelope {
            code,
            message: self.to_string(),
        };
        (status, Json(envelope)).into_response()
    }
}
