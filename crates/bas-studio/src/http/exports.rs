// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Export records, replay configuration and link previews.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bas_core::models::ExportFilter;
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use super::AppState;
use super::json::{ApiJson, ApiPath, ApiQuery};
use crate::caption::CAPTION_TIMEOUT;
use crate::error::Result;
use crate::handlers::{UserIdentity, with_timeout};
use crate::transfer::{CreateExportRequest, UpdateExportRequest};

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/exports", get(list_exports).post(create_export))
        .route(
            "/exports/{id}",
            get(get_export).put(update_export).delete(delete_export),
        )
        .route("/exports/{id}/generate-caption", post(generate_caption))
        .route(
            "/replay-config",
            get(get_replay_config)
                .put(put_replay_config)
                .delete(delete_replay_config),
        )
        .route("/link-preview", get(link_preview))
}

// ============================================================================
// Exports
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ExportListQuery {
    #[serde(default)]
    execution_id: Option<Uuid>,
    #[serde(default)]
    workflow_id: Option<Uuid>,
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    offset: Option<i64>,
}

async fn list_exports(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<ExportListQuery>,
) -> Result<Response> {
    let filter = ExportFilter {
        execution_id: query.execution_id,
        workflow_id: query.workflow_id,
    };
    let exports = state
        .with_deadline(state.transfer.list_exports(&filter, query.limit, query.offset))
        .await?;
    Ok(Json(json!({ "exports": exports })).into_response())
}

async fn create_export(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<CreateExportRequest>,
) -> Result<Response> {
    let export = state.with_deadline(state.transfer.create_export(req)).await?;
    Ok((StatusCode::CREATED, Json(export)).into_response())
}

async fn get_export(State(state): State<AppState>, ApiPath(id): ApiPath<Uuid>) -> Result<Response> {
    let export = state.with_deadline(state.transfer.get_export(id)).await?;
    Ok(Json(export).into_response())
}

async fn update_export(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(req): ApiJson<UpdateExportRequest>,
) -> Result<Response> {
    let export = state
        .with_deadline(state.transfer.update_export(id, req))
        .await?;
    Ok(Json(export).into_response())
}

async fn delete_export(State(state): State<AppState>, ApiPath(id): ApiPath<Uuid>) -> Result<Response> {
    state.with_deadline(state.transfer.delete_export(id)).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn generate_caption(
    State(state): State<AppState>,
    identity: UserIdentity,
    ApiPath(id): ApiPath<Uuid>,
) -> Result<Response> {
    // The generator enforces its own deadline; this one covers the lookups around it.
    let export = with_timeout(
        CAPTION_TIMEOUT + state.request_timeout,
        state.transfer.generate_caption(id, identity.as_str()),
    )
    .await?;
    Ok(Json(export).into_response())
}

// ============================================================================
// Replay configuration
// ============================================================================

async fn get_replay_config(State(state): State<AppState>) -> Result<Response> {
    let config = state.with_deadline(state.transfer.get_replay_config()).await?;
    Ok(Json(config).into_response())
}

async fn put_replay_config(
    State(state): State<AppState>,
    ApiJson(value): ApiJson<Value>,
) -> Result<Response> {
    let config = state
        .with_deadline(state.transfer.put_replay_config(value))
        .await?;
    Ok(Json(config).into_response())
}

async fn delete_replay_config(State(state): State<AppState>) -> Result<Response> {
    let deleted = state.with_deadline(state.transfer.delete_replay_config()).await?;
    Ok(Json(json!({ "deleted": deleted })).into_response())
}

// ============================================================================
// Link preview
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct LinkPreviewQuery {
    #[serde(default)]
    url: String,
}

async fn link_preview(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<LinkPreviewQuery>,
) -> Result<Response> {
    let preview = state.link_preview.preview(&query.url).await?;
    Ok(Json(preview).into_response())
}
