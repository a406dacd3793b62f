// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Studio handler state.
//!
//! A plain aggregate of the services every HTTP handler closes over, plus
//! the cross-cutting pieces handlers share: the dependency health check,
//! the caller identity and request deadlines.

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use bas_core::entitlement::{ANONYMOUS_IDENTITY, features};
use bas_core::{ArtifactGateway, EntitlementGate, IndexStore, TelemetryHub};
use bas_driver::BrowserDriver;
use serde::Serialize;
use strum::{AsRefStr, Display};
use tracing::warn;

use crate::catalog::WorkflowCatalog;
use crate::error::{Error, Result};
use crate::execution::ExecutionEngine;
use crate::link_preview::LinkPreviewService;
use crate::recording::RecordingService;
use crate::scheduler::Scheduler;
use crate::transfer::TransferService;

/// Header carrying the caller's identity.
pub const USER_IDENTITY_HEADER: &str = "x-user-identity";

/// Default deadline of an API request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline of import and export requests.
pub const EXTENDED_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Shared state for studio handlers.
pub struct StudioHandlerState {
    pub store: Arc<dyn IndexStore>,
    pub driver: Arc<dyn BrowserDriver>,
    pub artifacts: Arc<ArtifactGateway>,
    pub hub: Arc<TelemetryHub>,
    pub entitlements: Arc<EntitlementGate>,
    pub catalog: Arc<WorkflowCatalog>,
    pub engine: ExecutionEngine,
    pub recording: RecordingService,
    pub scheduler: Scheduler,
    pub transfer: TransferService,
    pub link_preview: LinkPreviewService,
    /// When the server started (for uptime calculation).
    pub start_time: Instant,
    pub version: String,
    pub request_timeout: Duration,
}

impl StudioHandlerState {
    /// Set the default request deadline.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn uptime_ms(&self) -> i64 {
        self.start_time.elapsed().as_millis() as i64
    }

    /// Run `fut` under the default request deadline.
    pub async fn with_deadline<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        with_timeout(self.request_timeout, fut).await
    }

    /// Fail with `FEATURE_NOT_AVAILABLE` unless the caller may record.
    pub async fn require_recording(&self, identity: &UserIdentity) -> Result<()> {
        if self.entitlements.can_use_recording(identity.as_str()).await {
            Ok(())
        } else {
            Err(Error::FeatureNotAvailable(features::RECORDING))
        }
    }
}

/// Run `fut`, failing with `REQUEST_TIMEOUT` after `timeout`.
pub async fn with_timeout<T>(timeout: Duration, fut: impl Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::RequestTimeout(format!(
            "request exceeded {} ms",
            timeout.as_millis()
        ))),
    }
}

// ============================================================================
// Identity
// ============================================================================

/// Caller identity from the `X-User-Identity` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity(pub String);

impl UserIdentity {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<S> FromRequestParts<S> for UserIdentity
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> std::result::Result<Self, Self::Rejection> {
        let identity = parts
            .headers
            .get(USER_IDENTITY_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or(ANONYMOUS_IDENTITY);
        Ok(Self(identity.to_string()))
    }
}

// ============================================================================
// Health Check
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    /// A non-critical dependency is down.
    Degraded,
    /// The index is down.
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DependencyCheck {
    pub name: &'static str,
    pub healthy: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub version: String,
    pub uptime_ms: i64,
    pub checks: Vec<DependencyCheck>,
}

/// Check the index, the driver and the blob store.
pub async fn handle_health_check(state: &StudioHandlerState) -> HealthReport {
    const CHECK_TIMEOUT: Duration = Duration::from_secs(5);

    async fn check_dependency<F>(name: &'static str, fut: F) -> DependencyCheck
    where
        F: Future<Output = std::result::Result<(), String>>,
    {
        let started = Instant::now();
        let outcome = match tokio::time::timeout(CHECK_TIMEOUT, fut).await {
            Ok(outcome) => outcome,
            Err(_) => Err(format!("timed out after {} s", CHECK_TIMEOUT.as_secs())),
        };
        if let Err(e) = &outcome {
            warn!(dependency = name, error = %e, "Health check failed");
        }
        DependencyCheck {
            name,
            healthy: outcome.is_ok(),
            latency_ms: started.elapsed().as_millis() as u64,
            error: outcome.err(),
        }
    }

    let index = check_dependency("index", async {
        state.store.health_check().await.map_err(|e| e.to_string())
    });
    let driver = check_dependency("driver", async {
        match state.driver.health().await {
            Ok(health) if health.is_healthy() => Ok(()),
            Ok(health) => Err(format!("driver reports status '{}'", health.status)),
            Err(e) => Err(e.to_string()),
        }
    });
    let blob = check_dependency("blob", async {
        state.artifacts.health_check().await.map_err(|e| e.to_string())
    });
    let (index, driver, blob) = tokio::join!(index, driver, blob);

    let status = if !index.healthy {
        HealthStatus::Unhealthy
    } else if !driver.healthy || !blob.healthy {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    };
    HealthReport {
        status,
        version: state.version.clone(),
        uptime_ms: state.uptime_ms(),
        checks: vec![index, driver, blob],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn identity_of(request: Request<()>) -> UserIdentity {
        let (mut parts, _) = request.into_parts();
        match UserIdentity::from_request_parts(&mut parts, &()).await {
            Ok(identity) => identity,
            Err(never) => match never {},
        }
    }

    #[tokio::test]
    async fn test_identity_header_and_default() {
        let with = Request::builder()
            .header("X-User-Identity", " alice@example.com ")
            .body(())
            .unwrap();
        assert_eq!(identity_of(with).await.as_str(), "alice@example.com");

        let without = Request::builder().body(()).unwrap();
        assert_eq!(identity_of(without).await.as_str(), ANONYMOUS_IDENTITY);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_maps_to_request_timeout() {
        let err = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert_eq!(err.code(), "REQUEST_TIMEOUT");
    }
}
