//! Error responses of the HTTP transport.

use std::fmt;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

use xpkg_core::ExtensionError;

/// API error response with an HTTP status code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error code for programmatic handling.
    pub code: String,
    /// Human-readable error message.
    pub message: String,
    #[serde(skip)]
    pub status: StatusCode,
    /// Optional request ID for tracing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, message: impl Into<String>, status: StatusCode) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            status,
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, request_id: String) -> Self {
        self.request_id = Some(request_id);
        self
    }

    /// Bad request (400).
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new("BAD_REQUEST", message, StatusCode::BAD_REQUEST)
    }

    /// Payload too large (413).
    pub fn payload_too_large(message: impl Into<String>) -> Self {
        Self::new("PAYLOAD_TOO_LARGE", message, StatusCode::PAYLOAD_TOO_LARGE)
    }

    /// Internal server error (500).
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new("INTERNAL_ERROR", message, StatusCode::INTERNAL_SERVER_ERROR)
    }
}

/// Status for each runtime error code.
pub fn status_for(err: &ExtensionError) -> StatusCode {
    match err {
        ExtensionError::Validation(_) | ExtensionError::EmptyInput | ExtensionError::Json(_) => {
            StatusCode::BAD_REQUEST
        }
        ExtensionError::Schema { .. }
        | ExtensionError::Integrity { .. }
        | ExtensionError::Mismatch { .. }
        | ExtensionError::CapabilityMismatch { .. }
        | ExtensionError::PlatformIncompatible { .. }
        | ExtensionError::Zip(_) => StatusCode::UNPROCESSABLE_ENTITY,
        ExtensionError::NotFound(_) => StatusCode::NOT_FOUND,
        ExtensionError::AlreadyRegistered(_) | ExtensionError::InvalidState { .. } => StatusCode::CONFLICT,
        ExtensionError::Unsupported { .. } | ExtensionError::NotImplemented(_) => {
            StatusCode::NOT_IMPLEMENTED
        }
        ExtensionError::Transport(_) | ExtensionError::ServiceUnreachable(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ExtensionError::Cancelled(_) => StatusCode::REQUEST_TIMEOUT,
        ExtensionError::Load(_)
        | ExtensionError::Lifecycle { .. }
        | ExtensionError::Rejected { .. }
        | ExtensionError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<ExtensionError> for ErrorResponse {
    fn from(err: ExtensionError) -> Self {
        let status = status_for(&err);
        let request_id = uuid::Uuid::new_v4().to_string();
        if status.is_server_error() {
            tracing::warn!(request_id = %request_id, code = err.code(), error = %err, "Request failed");
        } else {
            tracing::debug!(request_id = %request_id, code = err.code(), error = %err, "Request refused");
        }
        Self::new(err.code().to_string(), err.to_string(), status).with_request_id(request_id)
    }
}

impl From<axum::extract::multipart::MultipartError> for ErrorResponse {
    fn from(err: axum::extract::multipart::MultipartError) -> Self {
        let status = err.status();
        Self::new("BAD_REQUEST", format!("invalid multipart body: {}", err.body_text()), status)
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        let status = self.status;
        let body = serde_json::json!({
            "success": false,
            "error": {
                "code": self.code,
                "message": self.message,
                "request_id": self.request_id,
            }
        });
        (status, axum::Json(body)).into_response()
    }
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for ErrorResponse {}
