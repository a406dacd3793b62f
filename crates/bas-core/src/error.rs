// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for bas-core.
//!
//! A single error type shared by the index store and the services built on
//! it. `NotFound` is a sentinel that callers match on directly.

use std::fmt;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors raised by the index store and domain rules.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// A row was not found.
    NotFound {
        /// Entity kind (`workflow`, `execution`, ...).
        entity: &'static str,
        /// The id or key that was looked up.
        id: String,
    },

    /// A uniqueness constraint was violated.
    AlreadyExists {
        /// Entity kind.
        entity: &'static str,
        /// Description of the conflicting value.
        detail: String,
    },

    /// A workflow update was based on a stale version.
    VersionConflict {
        /// The workflow being updated.
        workflow_id: String,
        /// The version the caller based its update on.
        expected: i64,
        /// The version currently stored.
        actual: i64,
    },

    /// A state transition is not allowed.
    InvalidState {
        /// Entity kind.
        entity: &'static str,
        /// The entity id.
        id: String,
        /// The current state.
        current: String,
        /// The requested state.
        requested: String,
    },

    /// Input validation failed.
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Database operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Shorthand for a not-found error.
    pub fn not_found(entity: &'static str, id: impl fmt::Display) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Shorthand for a validation error.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ValidationError {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::AlreadyExists { .. } => "ALREADY_EXISTS",
            Self::VersionConflict { .. } => "VERSION_CONFLICT",
            Self::InvalidState { .. } => "INVALID_STATE",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }

    /// True for the not-found sentinel.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { entity, id } => write!(f, "{} '{}' not found", entity, id),
            Self::AlreadyExists { entity, detail } => {
                write!(f, "{} already exists: {}", entity, detail)
            }
            Self::VersionConflict {
                workflow_id,
                expected,
                actual,
            } => write!(
                f,
                "Workflow '{}' version conflict: expected {}, current is {}",
                workflow_id, expected, actual
            ),
            Self::InvalidState {
                entity,
                id,
                current,
                requested,
            } => write!(
                f,
                "{} '{}' cannot move from '{}' to '{}'",
                entity, id, current, requested
            ),
            Self::ValidationError { field, message } => {
                write!(f, "Validation error for '{}': {}", field, message)
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        if let Some(db_err) = err.as_database_error()
            && db_err.is_unique_violation()
        {
            return CoreError::AlreadyExists {
                entity: "record",
                detail: db_err.message().to_string(),
            };
        }
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::DatabaseError {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let test_cases = vec![
            (CoreError::not_found("workflow", "w1"), "NOT_FOUND"),
            (
                CoreError::AlreadyExists {
                    entity: "project",
                    detail: "name".to_string(),
                },
                "ALREADY_EXISTS",
            ),
            (
                CoreError::VersionConflict {
                    workflow_id: "w1".to_string(),
                    expected: 1,
                    actual: 2,
                },
                "VERSION_CONFLICT",
            ),
            (
                CoreError::InvalidState {
                    entity: "execution",
                    id: "e1".to_string(),
                    current: "completed".to_string(),
                    requested: "running".to_string(),
                },
                "INVALID_STATE",
            ),
            (CoreError::validation("name", "empty"), "VALIDATION_ERROR"),
            (
                CoreError::DatabaseError {
                    operation: "insert".to_string(),
                    details: "disk full".to_string(),
                },
                "DATABASE_ERROR",
            ),
        ];

        for (error, expected_code) in test_cases {
            assert_eq!(error.error_code(), expected_code, "{}", error);
        }
    }

    #[test]
    fn test_display_messages() {
        assert_eq!(
            CoreError::not_found("schedule", "abc").to_string(),
            "schedule 'abc' not found"
        );
        let conflict = CoreError::VersionConflict {
            workflow_id: "w".to_string(),
            expected: 1,
            actual: 2,
        };
        assert!(conflict.to_string().contains("expected 1, current is 2"));
    }

    #[test]
    fn test_row_not_found_is_database_error() {
        let err: CoreError = sqlx::Error::RowNotFound.into();
        assert_eq!(err.error_code(), "DATABASE_ERROR");
        assert!(!err.is_not_found());
    }
}
