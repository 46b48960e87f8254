//! Central HTTP-facing error type.
//!
//! Subsystems (`ports`, `projects`, `runtime`, `lifecycle`, `logs`, `metrics`,
//! `health`) each define their own `thiserror` error enum for their own
//! internal use; at the API boundary those are converted into `ApiError`,
//! which implements `IntoResponse` and shapes the `{error: {code, message,
//! details}}` envelope from spec section 7.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// One of the error kinds from spec section 7. Carried as `code` in the
/// response envelope, not as a Rust type hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Timeout,
    DaemonUnavailable,
    StateViolation,
    ResourceExhausted,
    External,
    Internal,
}

impl ErrorKind {
    pub fn status(self) -> StatusCode {
        match self {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Timeout => StatusCode::REQUEST_TIMEOUT,
            ErrorKind::DaemonUnavailable => StatusCode::BAD_GATEWAY,
            ErrorKind::StateViolation => StatusCode::CONFLICT,
            ErrorKind::ResourceExhausted => StatusCode::CONFLICT,
            ErrorKind::External => StatusCode::BAD_GATEWAY,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Error)]
#[error("{message}")]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
    pub details: Option<Value>,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

impl From<crate::ports::PortError> for ApiError {
    fn from(err: crate::ports::PortError) -> Self {
        use crate::ports::{PortError, PortErrorCode};
        match err {
            PortError::Code(code) => {
                let kind = match code {
                    PortErrorCode::InvalidPort
                    | PortErrorCode::PortOutOfRange
                    | PortErrorCode::InvalidProjectType => ErrorKind::Validation,
                    PortErrorCode::SystemReserved => ErrorKind::Validation,
                    PortErrorCode::PortInUse
                    | PortErrorCode::PortInUseExternal
                    | PortErrorCode::ProjectMismatch => ErrorKind::Conflict,
                    PortErrorCode::NoAvailablePorts => ErrorKind::ResourceExhausted,
                };
                ApiError::new(kind, code.to_string())
            }
            PortError::Store(e) => ApiError::internal(e.to_string()),
        }
    }
}

impl From<crate::projects::ProjectError> for ApiError {
    fn from(err: crate::projects::ProjectError) -> Self {
        use crate::projects::ProjectError;
        match err {
            ProjectError::NotFound(id) => ApiError::not_found(format!("project not found: {id}")),
            ProjectError::NameTaken(name) => ApiError::conflict(format!("name already taken: {name}")),
            ProjectError::Port(e) => e.into(),
            ProjectError::Store(e) => ApiError::internal(e.to_string()),
        }
    }
}

impl From<crate::runtime::RuntimeError> for ApiError {
    fn from(err: crate::runtime::RuntimeError) -> Self {
        use crate::runtime::RuntimeError;
        match err {
            RuntimeError::NotFound(msg) => ApiError::not_found(msg),
            RuntimeError::Unavailable(msg) => ApiError::new(ErrorKind::DaemonUnavailable, msg),
            RuntimeError::Timeout => ApiError::new(ErrorKind::Timeout, "operation timed out"),
            RuntimeError::Daemon(msg) => ApiError::new(ErrorKind::External, msg),
        }
    }
}

impl From<crate::lifecycle::LifecycleError> for ApiError {
    fn from(err: crate::lifecycle::LifecycleError) -> Self {
        use crate::lifecycle::LifecycleError;
        match err {
            LifecycleError::Validation(msg) => ApiError::validation(msg),
            LifecycleError::NotFound(msg) => ApiError::not_found(msg),
            LifecycleError::StartTimeout => ApiError::new(ErrorKind::Timeout, "start timed out"),
            LifecycleError::Runtime(e) => e.into(),
            LifecycleError::Project(e) => e.into(),
            LifecycleError::Port(e) => e.into(),
        }
    }
}

impl From<crate::logs::LogError> for ApiError {
    fn from(err: crate::logs::LogError) -> Self {
        use crate::logs::LogError;
        match err {
            LogError::NotFound(msg) => ApiError::not_found(msg),
            LogError::Io(e) => ApiError::internal(e.to_string()),
        }
    }
}

impl From<crate::metrics::MetricsError> for ApiError {
    fn from(err: crate::metrics::MetricsError) -> Self {
        use crate::metrics::MetricsError;
        match err {
            MetricsError::NotFound(msg) => ApiError::not_found(msg),
            MetricsError::Runtime(e) => e.into(),
            MetricsError::Store(e) => ApiError::internal(e.to_string()),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorEnvelope,
}

#[derive(Serialize)]
struct ErrorEnvelope {
    code: ErrorKind,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.kind.status();
        let body = ErrorBody {
            error: ErrorEnvelope {
                code: self.kind,
                message: self.message,
                details: self.details,
            },
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
