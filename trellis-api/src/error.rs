//! Error Types for the Trellis API
//!
//! This module maps the kernel error taxonomy onto HTTP responses:
//! - `ErrorCode` mirrors the taxonomy codes (plus the transport-only codes
//!   the WebSocket protocol needs)
//! - `ApiError` is the response body shape `{ code, message, details?,
//!   request_id? }`
//! - `IntoResponse` picks the status from the code
//!
//! In production (`TRELLIS_ENV=production`) internal errors are masked.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use trellis_core::TrellisError;

// ============================================================================
// ERROR CODE ENUM
// ============================================================================

/// Error codes for API responses. One per kernel taxonomy entry, plus the
/// auth/transport codes that only exist at this layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Kernel taxonomy
    NotFound,
    AlreadyExists,
    VersionConflict,
    ValidationError,
    TypeMismatch,
    PermissionDenied,
    TenantMismatch,
    CircularDependency,
    InvalidExpression,
    ReferenceBroken,
    DivisionByZero,
    MaxDepthExceeded,
    UnknownFunction,
    DomainError,
    DeadlineExceeded,

    // API layer
    AuthRequired,
    InvalidToken,
    SubscriptionNotFound,
    InternalError,
}

impl ErrorCode {
    /// The HTTP status for this code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::AlreadyExists | ErrorCode::VersionConflict => StatusCode::CONFLICT,
            ErrorCode::ValidationError
            | ErrorCode::TypeMismatch
            | ErrorCode::InvalidExpression => StatusCode::BAD_REQUEST,
            ErrorCode::PermissionDenied | ErrorCode::TenantMismatch => StatusCode::FORBIDDEN,
            ErrorCode::CircularDependency | ErrorCode::ReferenceBroken => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            ErrorCode::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::AuthRequired | ErrorCode::InvalidToken => StatusCode::UNAUTHORIZED,
            ErrorCode::SubscriptionNotFound => StatusCode::NOT_FOUND,
            // Everything else, evaluation failures included, is a server
            // fault if it escapes to a response.
            ErrorCode::DivisionByZero
            | ErrorCode::MaxDepthExceeded
            | ErrorCode::UnknownFunction
            | ErrorCode::DomainError
            | ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Parse a kernel taxonomy code.
    pub fn from_kernel(code: &str) -> Self {
        match code {
            "NOT_FOUND" => ErrorCode::NotFound,
            "ALREADY_EXISTS" => ErrorCode::AlreadyExists,
            "VERSION_CONFLICT" => ErrorCode::VersionConflict,
            "VALIDATION_ERROR" => ErrorCode::ValidationError,
            "TYPE_MISMATCH" => ErrorCode::TypeMismatch,
            "PERMISSION_DENIED" => ErrorCode::PermissionDenied,
            "TENANT_MISMATCH" => ErrorCode::TenantMismatch,
            "CIRCULAR_DEPENDENCY" => ErrorCode::CircularDependency,
            "INVALID_EXPRESSION" => ErrorCode::InvalidExpression,
            "REFERENCE_BROKEN" => ErrorCode::ReferenceBroken,
            "DIVISION_BY_ZERO" => ErrorCode::DivisionByZero,
            "MAX_DEPTH_EXCEEDED" => ErrorCode::MaxDepthExceeded,
            "UNKNOWN_FUNCTION" => ErrorCode::UnknownFunction,
            "DOMAIN_ERROR" => ErrorCode::DomainError,
            "DEADLINE_EXCEEDED" => ErrorCode::DeadlineExceeded,
            _ => ErrorCode::InternalError,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Render the wire form
        let s = serde_json::to_string(self).unwrap_or_default();
        write!(f, "{}", s.trim_matches('"'))
    }
}

// ============================================================================
// API ERROR STRUCT
// ============================================================================

/// Structured error response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            request_id: None,
        }
    }

    pub fn with_details(mut self, details: JsonValue) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn status_code(&self) -> StatusCode {
        self.code.status_code()
    }

    // ========================================================================
    // Convenience constructors
    // ========================================================================

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    pub fn auth_required(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::AuthRequired, message)
    }

    pub fn invalid_token(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidToken, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

/// Whether unexpected failure detail should be masked.
fn in_production() -> bool {
    static PRODUCTION: once_cell::sync::Lazy<bool> = once_cell::sync::Lazy::new(|| {
        std::env::var("TRELLIS_ENV")
            .map(|v| v.eq_ignore_ascii_case("production"))
            .unwrap_or(false)
    });
    *PRODUCTION
}

impl From<TrellisError> for ApiError {
    fn from(err: TrellisError) -> Self {
        let code = ErrorCode::from_kernel(err.code());
        if code == ErrorCode::InternalError {
            tracing::error!(error = %err, "internal error surfaced to API");
            if in_production() {
                return ApiError::internal("Internal server error");
            }
        }
        ApiError {
            code,
            message: err.to_string(),
            details: err.details(),
            request_id: None,
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::validation(format!("Invalid JSON: {}", err))
    }
}

// ============================================================================
// AXUM INTEGRATION
// ============================================================================

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(self);
        (status, body).into_response()
    }
}

/// Result type alias for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;
