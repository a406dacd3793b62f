// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP API.
//!
//! All routes live under `/api/v1`. Handlers return `Result<Response>`;
//! failures render through the shared error envelope, including extractor
//! rejections (see [`json`]).

mod executions;
mod exports;
pub mod json;
mod recordings;
mod schedules;
mod workflows;
mod ws;

pub use ws::IDLE_TIMEOUT;

use std::future::Future;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::Error;
use crate::handlers::{HealthStatus, StudioHandlerState, handle_health_check};

/// API prefix.
pub const API_PREFIX: &str = "/api/v1";

pub const DEFAULT_PAGE_LIMIT: i64 = 50;
pub const MAX_PAGE_LIMIT: i64 = 200;

type AppState = Arc<StudioHandlerState>;

/// `limit`/`offset` query pair.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct Page {
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    offset: Option<i64>,
}

impl Page {
    fn resolve(self) -> (i64, i64) {
        (
            self.limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT),
            self.offset.unwrap_or(0).max(0),
        )
    }
}

/// Build the API router.
pub fn build_router(state: Arc<StudioHandlerState>) -> Router {
    let api = Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws::telemetry_socket))
        .merge(workflows::routes())
        .merge(executions::routes())
        .merge(recordings::routes())
        .merge(schedules::routes())
        .merge(exports::routes());

    Router::new()
        .nest(API_PREFIX, api)
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve `router` until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "HTTP API listening");
    }
    axum::serve(listener, router).with_graceful_shutdown(shutdown).await
}

async fn health(State(state): State<AppState>) -> Response {
    let report = handle_health_check(&state).await;
    let status = match report.status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
    };
    (status, Json(report)).into_response()
}

async fn not_found(uri: Uri) -> Error {
    Error::NotFound {
        entity: "route",
        id: uri.path().to_string(),
    }
}
