// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for bas-driver.

use std::time::Duration;

use thiserror::Error;

/// Result type using DriverError.
pub type Result<T> = std::result::Result<T, DriverError>;

/// Errors returned by driver RPCs.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DriverError {
    /// The driver does not know the session (HTTP 404).
    #[error("driver session not found: {0}")]
    SessionNotFound(String),

    /// A recording is already running for the session (HTTP 409).
    #[error("recording already in progress for session {0}")]
    RecordingInProgress(String),

    /// The driver could not be reached.
    #[error("driver unavailable: {0}")]
    Unavailable(String),

    /// The call exceeded its deadline.
    #[error("driver call timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The driver answered with an error status.
    #[error("driver error [{status}]: {message}")]
    Server { status: u16, message: String },

    /// The driver answered with a body we could not decode.
    #[error("invalid driver response: {0}")]
    InvalidResponse(String),
}

impl DriverError {
    /// Whether retrying the call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unavailable(_) | Self::Timeout(_) => true,
            Self::Server { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Whether the driver itself is unreachable.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(DriverError::Unavailable("refused".into()).is_transient());
        assert!(DriverError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(
            DriverError::Server {
                status: 502,
                message: "bad gateway".into()
            }
            .is_transient()
        );
        assert!(
            !DriverError::Server {
                status: 400,
                message: "bad selector".into()
            }
            .is_transient()
        );
        assert!(!DriverError::SessionNotFound("s".into()).is_transient());
        assert!(!DriverError::RecordingInProgress("s".into()).is_transient());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            DriverError::Timeout(Duration::from_millis(1500)).to_string(),
            "driver call timed out after 1500ms"
        );
    }
}
