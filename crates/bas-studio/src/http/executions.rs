// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution control, artifact and export routes.

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bas_core::models::{ExecutionFilter, ExecutionStatus};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use uuid::Uuid;

use super::json::{ApiJson, ApiPath, ApiQuery};
use super::{AppState, Page};
use crate::error::Result;
use crate::handlers::{EXTENDED_REQUEST_TIMEOUT, UserIdentity, with_timeout};
use crate::transfer::{ExportOutcome, ExportRequest};

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/executions", get(list_executions))
        .route("/executions/{id}", get(get_execution))
        .route("/executions/{id}/stop", post(stop_execution))
        .route("/executions/{id}/pause", post(pause_execution))
        .route("/executions/{id}/resume", post(resume_execution))
        .route("/executions/{id}/timeline", get(get_timeline))
        .route("/executions/{id}/screenshots", get(list_screenshots))
        .route("/executions/{id}/screenshots/{step}", get(get_screenshot))
        .route("/executions/{id}/recorded-videos", get(recorded_videos))
        .route("/executions/{id}/recorded-traces", get(recorded_traces))
        .route("/executions/{id}/recorded-har", get(recorded_har))
        .route("/executions/{id}/export", post(export_execution))
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ExecutionListQuery {
    #[serde(default)]
    workflow_id: Option<Uuid>,
    #[serde(default)]
    status: Option<ExecutionStatus>,
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    offset: Option<i64>,
}

async fn list_executions(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<ExecutionListQuery>,
) -> Result<Response> {
    let (limit, offset) = Page {
        limit: query.limit,
        offset: query.offset,
    }
    .resolve();
    let filter = ExecutionFilter {
        workflow_id: query.workflow_id,
        status: query.status,
    };
    let executions = state
        .with_deadline(state.engine.list_executions(&filter, limit, offset))
        .await?;
    Ok(Json(json!({ "executions": executions })).into_response())
}

async fn get_execution(State(state): State<AppState>, ApiPath(id): ApiPath<Uuid>) -> Result<Response> {
    let execution = state.with_deadline(state.engine.get_execution(id)).await?;
    let timeline_url = (!execution.result_path.is_empty())
        .then(|| format!("/api/v1/executions/{}/timeline", execution.id));
    let mut body = serde_json::to_value(&execution)?;
    if let (Some(url), Some(object)) = (timeline_url, body.as_object_mut()) {
        object.insert("timeline_url".to_string(), Value::String(url));
    }
    Ok(Json(body).into_response())
}

async fn stop_execution(State(state): State<AppState>, ApiPath(id): ApiPath<Uuid>) -> Result<Response> {
    let execution = state.with_deadline(state.engine.stop_execution(id)).await?;
    Ok(Json(execution).into_response())
}

async fn pause_execution(State(state): State<AppState>, ApiPath(id): ApiPath<Uuid>) -> Result<Response> {
    let execution = state.with_deadline(state.engine.pause_execution(id)).await?;
    Ok(Json(execution).into_response())
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ResumeRequest {
    #[serde(default)]
    parameters: Map<String, Value>,
}

async fn resume_execution(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
    body: Option<ApiJson<ResumeRequest>>,
) -> Result<Response> {
    let parameters = body.map(|ApiJson(req)| req.parameters).unwrap_or_default();
    let execution = state
        .with_deadline(state.engine.resume_execution(id, parameters))
        .await?;
    Ok(Json(execution).into_response())
}

async fn get_timeline(State(state): State<AppState>, ApiPath(id): ApiPath<Uuid>) -> Result<Response> {
    let timeline = state.with_deadline(state.engine.get_timeline(id)).await?;
    Ok(Json(timeline).into_response())
}

async fn list_screenshots(State(state): State<AppState>, ApiPath(id): ApiPath<Uuid>) -> Result<Response> {
    let screenshots = state.with_deadline(state.engine.list_screenshots(id)).await?;
    Ok(Json(json!({ "screenshots": screenshots })).into_response())
}

async fn get_screenshot(
    State(state): State<AppState>,
    ApiPath((id, step)): ApiPath<(Uuid, u32)>,
) -> Result<Response> {
    let bytes = state.with_deadline(state.engine.get_screenshot(id, step)).await?;
    Ok(([(header::CONTENT_TYPE, "image/png")], bytes).into_response())
}

async fn recorded_videos(State(state): State<AppState>, ApiPath(id): ApiPath<Uuid>) -> Result<Response> {
    let files = state.with_deadline(state.engine.recorded_videos(id)).await?;
    Ok(Json(json!({ "videos": files })).into_response())
}

async fn recorded_traces(State(state): State<AppState>, ApiPath(id): ApiPath<Uuid>) -> Result<Response> {
    let files = state.with_deadline(state.engine.recorded_traces(id)).await?;
    Ok(Json(json!({ "traces": files })).into_response())
}

async fn recorded_har(State(state): State<AppState>, ApiPath(id): ApiPath<Uuid>) -> Result<Response> {
    let files = state.with_deadline(state.engine.recorded_har(id)).await?;
    Ok(Json(json!({ "har": files })).into_response())
}

async fn export_execution(
    State(state): State<AppState>,
    identity: UserIdentity,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(req): ApiJson<ExportRequest>,
) -> Result<Response> {
    let outcome = with_timeout(
        EXTENDED_REQUEST_TIMEOUT,
        state.transfer.export_execution(id, req, identity.as_str()),
    )
    .await?;
    Ok(match outcome {
        ExportOutcome::Folder { output_dir, files } => (
            StatusCode::OK,
            Json(json!({ "output_dir": output_dir, "files": files })),
        )
            .into_response(),
        ExportOutcome::Spec(spec) => Json(spec).into_response(),
        ExportOutcome::Rendered {
            bytes,
            content_type,
            file_name,
        } => (
            [
                (header::CONTENT_TYPE, content_type.to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{}\"", file_name.replace('"', "")),
                ),
            ],
            bytes,
        )
            .into_response(),
    })
}
