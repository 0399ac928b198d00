//! Uniform HTTP error envelope.
//!
//! Every failed request answers `{"error": {code, message, retryable,
//! details?}}` with a code from the canonical closed set. Messages are for
//! humans; clients must branch on the code only.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use floe_base::error::ErrorCode;
use floe_kv::KvError;
use serde_json::{json, Value};
use tracing::error;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
    pub details: Option<Value>,
}

impl ApiError {
    pub fn new(
        status: StatusCode,
        code: ErrorCode,
        message: impl Into<String>,
        retryable: bool,
    ) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            retryable,
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Non-retryable client input problem.
    pub fn bad_request(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message, false)
    }

    pub fn not_found(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, code, message, false)
    }

    pub fn conflict(code: ErrorCode, message: impl Into<String>, retryable: bool) -> Self {
        Self::new(StatusCode::CONFLICT, code, message, retryable)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::InternalError,
            message,
            true,
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut envelope = json!({
            "error": {
                "code": self.code.as_str(),
                "message": self.message,
                "retryable": self.retryable,
            }
        });
        if let Some(details) = self.details {
            envelope["error"]["details"] = details;
        }
        (self.status, Json(envelope)).into_response()
    }
}

impl From<KvError> for ApiError {
    fn from(e: KvError) -> Self {
        error!(error = %e, "kv failure surfaced to request");
        Self::internal("key-value store failure")
    }
}
