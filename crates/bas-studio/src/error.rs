// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for bas-studio.
//!
//! Every service returns [`Error`]; each variant maps to exactly one API
//! error code and HTTP status, rendered as the `{code, message, details,
//! status}` envelope.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bas_core::error::CoreError;
use bas_core::persistence::entity;
use bas_core::BlobError;
use bas_driver::DriverError;
use serde::Serialize;
use serde_json::{Value, json};
use strum::{AsRefStr, Display};
use thiserror::Error;

/// Why the artifacts of an execution cannot be served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ArtifactsReason {
    /// The execution row could not be read.
    ExecutionLookupFailed,
    /// The execution never wrote a result directory.
    ArtifactsNotSaved,
    /// The result directory no longer exists.
    ArtifactsDeleted,
    /// The result directory exists but cannot be read.
    ArtifactsInaccessible,
    /// The run finished without producing a timeline file.
    TimelineNotGenerated,
}

/// Studio errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Malformed or semantically invalid request.
    #[error("{0}")]
    InvalidRequest(String),

    /// A required field was absent or empty.
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    /// The request conflicts with the current state of a resource.
    #[error("{0}")]
    Conflict(String),

    /// A flow definition failed normalization or validation.
    #[error("Invalid workflow payload: {message}")]
    InvalidWorkflowPayload {
        message: String,
        details: Option<Value>,
    },

    #[error("Invalid cron expression: {0}")]
    InvalidCron(String),

    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("Workflow already exists: {0}")]
    WorkflowAlreadyExists(String),

    #[error("Workflow '{workflow_id}' was modified: expected version {expected}, current is {actual}")]
    VersionConflict {
        workflow_id: String,
        expected: i64,
        actual: i64,
    },

    /// A lookup by id failed.
    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Screenshot not found: {0}")]
    ScreenshotNotFound(String),

    #[error("Artifacts for execution '{execution_id}' are unavailable ({reason})")]
    ArtifactsUnavailable {
        execution_id: String,
        reason: ArtifactsReason,
    },

    /// The recording session is unknown to the studio or the driver.
    #[error("Recording session not found: {0}")]
    SessionNotFound(String),

    #[error("Recording already in progress for session {0}")]
    RecordingInProgress(String),

    /// The caller's tier does not include the feature.
    #[error("Feature not available for this account: {0}")]
    FeatureNotAvailable(&'static str),

    #[error("Request timed out: {0}")]
    RequestTimeout(String),

    #[error("Request too large: limit is {limit} bytes")]
    RequestTooLarge { limit: u64 },

    /// A dependency is unreachable or not configured.
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// A dependency answered with an error.
    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("AI service error: {0}")]
    AiService(String),

    #[error("Workflow execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type using the studio Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Serialized error body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorEnvelope {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    pub status: u16,
}

impl Error {
    /// Shorthand for a not-found error.
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Shorthand for an artifacts-unavailable error.
    pub fn artifacts(execution_id: impl ToString, reason: ArtifactsReason) -> Self {
        Self::ArtifactsUnavailable {
            execution_id: execution_id.to_string(),
            reason,
        }
    }

    /// API error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) | Self::Conflict(_) | Self::Json(_) => "INVALID_REQUEST",
            Self::MissingField(_) => "MISSING_REQUIRED_FIELD",
            Self::InvalidWorkflowPayload { .. } => "INVALID_WORKFLOW_PAYLOAD",
            Self::InvalidCron(_) => "INVALID_CRON_EXPRESSION",
            Self::InvalidTimezone(_) => "INVALID_TIMEZONE",
            Self::WorkflowAlreadyExists(_) => "WORKFLOW_ALREADY_EXISTS",
            Self::VersionConflict { .. } => "WORKFLOW_VERSION_CONFLICT",
            Self::NotFound { entity, .. } => match *entity {
                entity::WORKFLOW | entity::WORKFLOW_VERSION => "WORKFLOW_NOT_FOUND",
                entity::EXECUTION => "EXECUTION_NOT_FOUND",
                entity::SCHEDULE => "SCHEDULE_NOT_FOUND",
                entity::EXPORT => "EXPORT_NOT_FOUND",
                entity::PROJECT => "PROJECT_NOT_FOUND",
                _ => "NOT_FOUND",
            },
            Self::ScreenshotNotFound(_) => "SCREENSHOT_NOT_FOUND",
            Self::ArtifactsUnavailable { .. } => "EXECUTION_ARTIFACTS_UNAVAILABLE",
            Self::SessionNotFound(_) => "SESSION_NOT_FOUND",
            Self::RecordingInProgress(_) => "RECORDING_IN_PROGRESS",
            Self::FeatureNotAvailable(_) => "FEATURE_NOT_AVAILABLE",
            Self::RequestTimeout(_) => "REQUEST_TIMEOUT",
            Self::RequestTooLarge { .. } => "REQUEST_TOO_LARGE",
            Self::ServiceUnavailable(_) | Self::Upstream(_) => "SERVICE_UNAVAILABLE",
            Self::AiService(_) => "AI_SERVICE_ERROR",
            Self::ExecutionFailed(_) => "WORKFLOW_EXECUTION_FAILED",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Internal(_) | Self::Io(_) => "INTERNAL_SERVER",
        }
    }

    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_)
            | Self::MissingField(_)
            | Self::InvalidWorkflowPayload { .. }
            | Self::InvalidCron(_)
            | Self::InvalidTimezone(_)
            | Self::Json(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_)
            | Self::WorkflowAlreadyExists(_)
            | Self::VersionConflict { .. }
            | Self::RecordingInProgress(_) => StatusCode::CONFLICT,
            Self::NotFound { .. }
            | Self::ScreenshotNotFound(_)
            | Self::ArtifactsUnavailable { .. }
            | Self::SessionNotFound(_) => StatusCode::NOT_FOUND,
            Self::FeatureNotAvailable(_) => StatusCode::FORBIDDEN,
            Self::RequestTimeout(_) => StatusCode::REQUEST_TIMEOUT,
            Self::RequestTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Upstream(_) | Self::AiService(_) => StatusCode::BAD_GATEWAY,
            Self::ExecutionFailed(_)
            | Self::Database(_)
            | Self::Internal(_)
            | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn details(&self) -> Option<Value> {
        match self {
            Self::InvalidWorkflowPayload { details, .. } => details.clone(),
            Self::VersionConflict {
                workflow_id,
                expected,
                actual,
            } => Some(json!({
                "workflow_id": workflow_id,
                "expected_version": expected,
                "current_version": actual,
            })),
            Self::NotFound { entity, id } => Some(json!({ "entity": entity, "id": id })),
            Self::ArtifactsUnavailable {
                execution_id,
                reason,
            } => Some(json!({ "execution_id": execution_id, "reason": reason.as_ref() })),
            Self::MissingField(field) => Some(json!({ "field": field })),
            Self::FeatureNotAvailable(feature) => Some(json!({ "feature": feature })),
            Self::RequestTooLarge { limit } => Some(json!({ "limit_bytes": limit })),
            _ => None,
        }
    }

    /// Render the API error envelope.
    pub fn envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            code: self.code(),
            message: self.to_string(),
            details: self.details(),
            status: self.status().as_u16(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let envelope = self.envelope();
        if envelope.status >= 500 {
            tracing::error!(code = envelope.code, error = %self, "Request failed");
        }
        (self.status(), Json(envelope)).into_response()
    }
}

impl From<CoreError> for Error {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::NotFound { entity, id } => Self::NotFound { entity, id },
            CoreError::AlreadyExists { entity, detail } => {
                if entity == entity::WORKFLOW {
                    Self::WorkflowAlreadyExists(detail)
                } else {
                    Self::Conflict(format!("{} already exists: {}", entity, detail))
                }
            }
            CoreError::VersionConflict {
                workflow_id,
                expected,
                actual,
            } => Self::VersionConflict {
                workflow_id,
                expected,
                actual,
            },
            err @ CoreError::InvalidState { .. } => Self::Conflict(err.to_string()),
            CoreError::ValidationError { field, message } => {
                Self::InvalidRequest(format!("{}: {}", field, message))
            }
            err @ CoreError::DatabaseError { .. } => Self::Database(err.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<DriverError> for Error {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::SessionNotFound(id) => Self::SessionNotFound(id),
            DriverError::RecordingInProgress(id) => Self::RecordingInProgress(id),
            err @ (DriverError::Unavailable(_) | DriverError::Timeout(_)) => {
                Self::ServiceUnavailable(format!("browser driver: {}", err))
            }
            DriverError::Server { status, message } if status < 500 => {
                Self::InvalidRequest(format!("browser driver rejected the request: {}", message))
            }
            err => Self::Upstream(format!("browser driver: {}", err)),
        }
    }
}

impl From<BlobError> for Error {
    fn from(err: BlobError) -> Self {
        match err {
            BlobError::NotFound(name) => Self::not_found("artifact", name),
            err @ BlobError::Transient(_) => Self::ServiceUnavailable(err.to_string()),
            err @ BlobError::Fatal(_) => Self::Internal(err.to_string()),
        }
    }
}
