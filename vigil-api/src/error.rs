//! Error Types for VIGIL API
//!
//! Every failure leaves the server as JSON `{code, message, details?}` with
//! a status derived from the code. Engine failures arrive as
//! [`ControlError`] and keep their kind as the code.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use vigil_core::{ErrorKind, VigilError};
use vigil_engine::ControlError;

// ============================================================================
// ERROR CODE ENUM
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    // ========================================================================
    // Request errors
    // ========================================================================
    /// No usable caller identity on the request
    Unauthorized,

    /// Malformed path parameter or body
    InvalidInput,

    // ========================================================================
    // Engine errors
    // ========================================================================
    NotFound,
    Forbidden,
    InvalidTransition,
    Disabled,
    SafetyBlocked,
    BudgetExceeded,
    MaxStepsReached,
    ToolInvocationError,
    RollbackError,
    ConcurrentModification,
    ValidationFailed,
    Internal,
}

impl ErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::Forbidden => StatusCode::FORBIDDEN,

            ErrorCode::InvalidInput | ErrorCode::ValidationFailed => StatusCode::BAD_REQUEST,

            ErrorCode::NotFound => StatusCode::NOT_FOUND,

            ErrorCode::InvalidTransition | ErrorCode::ConcurrentModification => {
                StatusCode::CONFLICT
            }

            ErrorCode::Disabled => StatusCode::LOCKED,

            ErrorCode::SafetyBlocked | ErrorCode::BudgetExceeded | ErrorCode::MaxStepsReached => {
                StatusCode::UNPROCESSABLE_ENTITY
            }

            ErrorCode::ToolInvocationError => StatusCode::BAD_GATEWAY,

            ErrorCode::RollbackError | ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorCode::Unauthorized => "Caller identity required",
            ErrorCode::InvalidInput => "Invalid input data",
            ErrorCode::NotFound => "Entity not found",
            ErrorCode::Forbidden => "Access forbidden",
            ErrorCode::InvalidTransition => "Operation not allowed in the current state",
            ErrorCode::Disabled => "Agent is disabled",
            ErrorCode::SafetyBlocked => "Action blocked by safety policy",
            ErrorCode::BudgetExceeded => "Budget exceeded",
            ErrorCode::MaxStepsReached => "Step limit reached",
            ErrorCode::ToolInvocationError => "Tool invocation failed",
            ErrorCode::RollbackError => "Rollback failed",
            ErrorCode::ConcurrentModification => "Concurrent modification detected",
            ErrorCode::ValidationFailed => "Request validation failed",
            ErrorCode::Internal => "Internal server error",
        }
    }
}

impl From<ErrorKind> for ErrorCode {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::NotFound => ErrorCode::NotFound,
            ErrorKind::Forbidden => ErrorCode::Forbidden,
            ErrorKind::InvalidTransition => ErrorCode::InvalidTransition,
            ErrorKind::Disabled => ErrorCode::Disabled,
            ErrorKind::SafetyBlocked => ErrorCode::SafetyBlocked,
            ErrorKind::BudgetExceeded => ErrorCode::BudgetExceeded,
            ErrorKind::MaxStepsReached => ErrorCode::MaxStepsReached,
            ErrorKind::ToolInvocationError => ErrorCode::ToolInvocationError,
            ErrorKind::RollbackError => ErrorCode::RollbackError,
            ErrorKind::ConcurrentModification => ErrorCode::ConcurrentModification,
            ErrorKind::ValidationFailed => ErrorCode::ValidationFailed,
            ErrorKind::Internal => ErrorCode::Internal,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
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
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn status_code(&self) -> StatusCode {
        self.code.status_code()
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidInput, message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

// ============================================================================
// AXUM INTEGRATION
// ============================================================================

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(self)).into_response()
    }
}

// ============================================================================
// CONVERSIONS
// ============================================================================

impl From<ControlError> for ApiError {
    fn from(err: ControlError) -> Self {
        let error = ApiError::new(err.kind.into(), err.message);
        match err.details {
            Some(details) => error.with_details(details),
            None => error,
        }
    }
}

impl From<VigilError> for ApiError {
    fn from(err: VigilError) -> Self {
        tracing::error!(error = %err, "Unhandled engine error");
        ApiError::from(ControlError::from(&err))
    }
}

impl From<std::io::Error> for ApiError {
    fn from(err: std::io::Error) -> Self {
        ApiError::internal_error(format!("I/O error: {}", err))
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
