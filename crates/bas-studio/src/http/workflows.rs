// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Project, workflow and project-file routes.

use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bas_core::models::{ChangeSource, WorkflowFilter};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use uuid::Uuid;

use super::json::{ApiJson, ApiPath, ApiQuery};
use super::{AppState, Page};
use crate::catalog::{CreateProjectRequest, CreateWorkflowRequest, UpdateProjectRequest, UpdateWorkflowRequest};
use crate::error::Result;
use crate::execution::AdhocExecutionRequest;
use crate::handlers::UserIdentity;

/// Upper bound of a synchronous `wait_for_completion`.
const MAX_WAIT: Duration = Duration::from_secs(300);
const DEFAULT_WAIT: Duration = Duration::from_secs(120);

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/projects", get(list_projects).post(create_project))
        .route(
            "/projects/{id}",
            get(get_project).put(update_project).delete(delete_project),
        )
        .route("/projects/{id}/workflows", get(list_project_workflows))
        .route("/projects/{id}/workflows/bulk-delete", post(bulk_delete))
        .route("/projects/{id}/files", get(file_tree))
        .route(
            "/projects/{id}/files/content",
            get(read_file).put(write_file).delete(delete_file),
        )
        .route("/projects/{id}/files/move", post(move_file))
        .route("/projects/{id}/files/resync", post(resync_files))
        .route("/workflows", get(list_workflows).post(create_workflow))
        .route("/workflows/validate", post(validate_workflow))
        .route("/workflows/adhoc/execute", post(execute_adhoc))
        .route(
            "/workflows/{id}",
            get(get_workflow).put(update_workflow).delete(delete_workflow),
        )
        .route("/workflows/{id}/execute", post(execute_workflow))
        .route("/workflows/{id}/versions", get(list_versions))
        .route(
            "/workflows/{id}/versions/{version}",
            get(get_version).post(restore_version),
        )
}

// ============================================================================
// Projects
// ============================================================================

async fn list_projects(State(state): State<AppState>, ApiQuery(page): ApiQuery<Page>) -> Result<Response> {
    let (limit, offset) = page.resolve();
    let projects = state
        .with_deadline(state.catalog.list_projects(limit, offset))
        .await?;
    Ok(Json(json!({ "projects": projects })).into_response())
}

async fn create_project(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<CreateProjectRequest>,
) -> Result<Response> {
    let project = state.with_deadline(state.catalog.create_project(req)).await?;
    Ok((StatusCode::CREATED, Json(project)).into_response())
}

async fn get_project(State(state): State<AppState>, ApiPath(id): ApiPath<Uuid>) -> Result<Response> {
    let project = state.with_deadline(state.catalog.get_project(id)).await?;
    Ok(Json(project).into_response())
}

async fn update_project(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(req): ApiJson<UpdateProjectRequest>,
) -> Result<Response> {
    let project = state.with_deadline(state.catalog.update_project(id, req)).await?;
    Ok(Json(project).into_response())
}

async fn delete_project(State(state): State<AppState>, ApiPath(id): ApiPath<Uuid>) -> Result<Response> {
    state.with_deadline(state.catalog.delete_project(id)).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn list_project_workflows(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
    ApiQuery(page): ApiQuery<Page>,
) -> Result<Response> {
    let (limit, offset) = page.resolve();
    let filter = WorkflowFilter {
        project_id: Some(id),
        ..Default::default()
    };
    let workflows = state
        .with_deadline(async {
            state.catalog.get_project(id).await?;
            state.catalog.list_workflows(&filter, limit, offset).await
        })
        .await?;
    Ok(Json(json!({ "workflows": workflows })).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BulkDeleteRequest {
    ids: Vec<Uuid>,
}

async fn bulk_delete(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(req): ApiJson<BulkDeleteRequest>,
) -> Result<Response> {
    let deleted = state.with_deadline(state.catalog.bulk_delete(id, &req.ids)).await?;
    Ok(Json(json!({ "deleted": deleted })).into_response())
}

// ----------------------------------------------------------------------------
// Project files
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileQuery {
    path: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct WriteFileRequest {
    path: String,
    content: Value,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MoveFileRequest {
    from: String,
    to: String,
}

async fn file_tree(State(state): State<AppState>, ApiPath(id): ApiPath<Uuid>) -> Result<Response> {
    let entries = state.with_deadline(state.catalog.file_tree(id)).await?;
    Ok(Json(json!({ "entries": entries })).into_response())
}

async fn read_file(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
    ApiQuery(query): ApiQuery<FileQuery>,
) -> Result<Response> {
    let content = state.with_deadline(state.catalog.read_file(id, &query.path)).await?;
    Ok(Json(content).into_response())
}

async fn write_file(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(req): ApiJson<WriteFileRequest>,
) -> Result<Response> {
    let workflow = state
        .with_deadline(state.catalog.write_file(id, &req.path, &req.content))
        .await?;
    Ok(Json(workflow).into_response())
}

async fn delete_file(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
    ApiQuery(query): ApiQuery<FileQuery>,
) -> Result<Response> {
    state.with_deadline(state.catalog.delete_file(id, &query.path)).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn move_file(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(req): ApiJson<MoveFileRequest>,
) -> Result<Response> {
    let workflow = state
        .with_deadline(state.catalog.move_file(id, &req.from, &req.to))
        .await?;
    Ok(Json(json!({ "path": req.to, "workflow": workflow })).into_response())
}

async fn resync_files(State(state): State<AppState>, ApiPath(id): ApiPath<Uuid>) -> Result<Response> {
    let report = state
        .with_deadline(state.catalog.sync_project_workflows(id))
        .await?;
    Ok(Json(report).into_response())
}

// ============================================================================
// Workflows
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct WorkflowListQuery {
    #[serde(default)]
    project_id: Option<Uuid>,
    #[serde(default)]
    tag: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    offset: Option<i64>,
}

async fn list_workflows(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<WorkflowListQuery>,
) -> Result<Response> {
    let (limit, offset) = Page {
        limit: query.limit,
        offset: query.offset,
    }
    .resolve();
    let filter = WorkflowFilter {
        project_id: query.project_id,
        tag: query.tag.filter(|t| !t.is_empty()),
        name_contains: query.name.filter(|n| !n.is_empty()),
    };
    let workflows = state
        .with_deadline(state.catalog.list_workflows(&filter, limit, offset))
        .await?;
    Ok(Json(json!({ "workflows": workflows })).into_response())
}

async fn create_workflow(
    State(state): State<AppState>,
    identity: UserIdentity,
    ApiJson(req): ApiJson<CreateWorkflowRequest>,
) -> Result<Response> {
    let workflow = state
        .with_deadline(state.catalog.create_workflow(req, ChangeSource::Manual, identity.as_str()))
        .await?;
    Ok((StatusCode::CREATED, Json(workflow)).into_response())
}

async fn get_workflow(State(state): State<AppState>, ApiPath(id): ApiPath<Uuid>) -> Result<Response> {
    let workflow = state.with_deadline(state.catalog.get_workflow(id)).await?;
    Ok(Json(workflow).into_response())
}

async fn update_workflow(
    State(state): State<AppState>,
    identity: UserIdentity,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(req): ApiJson<UpdateWorkflowRequest>,
) -> Result<Response> {
    let workflow = state
        .with_deadline(state.catalog.update_workflow(id, req, identity.as_str()))
        .await?;
    Ok(Json(workflow).into_response())
}

async fn delete_workflow(State(state): State<AppState>, ApiPath(id): ApiPath<Uuid>) -> Result<Response> {
    state.with_deadline(state.catalog.delete_workflow(id)).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ValidateRequest {
    flow_definition: Value,
    #[serde(default)]
    parameters: Option<Map<String, Value>>,
}

async fn validate_workflow(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<ValidateRequest>,
) -> Result<Response> {
    let report = match &req.parameters {
        Some(parameters) => state.catalog.validate_resolved(&req.flow_definition, parameters)?,
        None => state.catalog.validate(&req.flow_definition)?,
    };
    Ok(Json(report).into_response())
}

async fn list_versions(State(state): State<AppState>, ApiPath(id): ApiPath<Uuid>) -> Result<Response> {
    let versions = state.with_deadline(state.catalog.list_versions(id)).await?;
    Ok(Json(json!({ "versions": versions })).into_response())
}

async fn get_version(
    State(state): State<AppState>,
    ApiPath((id, version)): ApiPath<(Uuid, i64)>,
) -> Result<Response> {
    let version = state.with_deadline(state.catalog.get_version(id, version)).await?;
    Ok(Json(version).into_response())
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RestoreRequest {
    #[serde(default)]
    change_description: Option<String>,
}

async fn restore_version(
    State(state): State<AppState>,
    identity: UserIdentity,
    ApiPath((id, version)): ApiPath<(Uuid, i64)>,
    body: Option<ApiJson<RestoreRequest>>,
) -> Result<Response> {
    let note = body.and_then(|ApiJson(req)| req.change_description);
    let workflow = state
        .with_deadline(state.catalog.restore_version(id, version, note, identity.as_str()))
        .await?;
    Ok(Json(workflow).into_response())
}

// ----------------------------------------------------------------------------
// Execution dispatch
// ----------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct ExecuteRequest {
    #[serde(default)]
    parameters: Option<Map<String, Value>>,
    #[serde(default)]
    execution_params: Option<Map<String, Value>>,
    #[serde(default)]
    wait_for_completion: bool,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

fn wait_budget(timeout_ms: Option<u64>) -> Duration {
    timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_WAIT)
        .min(MAX_WAIT)
}

async fn execute_workflow(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
    body: Option<ApiJson<ExecuteRequest>>,
) -> Result<Response> {
    let req = body.map(|ApiJson(req)| req).unwrap_or_default();
    let parameters = AdhocExecutionRequest {
        parameters: req.parameters,
        execution_params: req.execution_params,
        ..Default::default()
    }
    .merged_parameters();
    let execution = state
        .with_deadline(state.engine.execute_workflow(
            id,
            parameters,
            bas_core::models::TriggerType::Api,
        ))
        .await?;
    if !req.wait_for_completion {
        return Ok((StatusCode::ACCEPTED, Json(execution)).into_response());
    }
    let finished = state
        .engine
        .wait_for_completion(execution.id, wait_budget(req.timeout_ms))
        .await?;
    Ok(Json(finished).into_response())
}

async fn execute_adhoc(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<AdhocExecutionRequest>,
) -> Result<Response> {
    let execution = state.with_deadline(state.engine.execute_adhoc(&req)).await?;
    if !req.wait_for_completion {
        return Ok((StatusCode::ACCEPTED, Json(execution)).into_response());
    }
    let finished = state
        .engine
        .wait_for_completion(execution.id, wait_budget(req.timeout_ms))
        .await?;
    Ok(Json(finished).into_response())
}
