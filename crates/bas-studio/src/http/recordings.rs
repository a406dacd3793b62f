// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Record-mode, session profile and archive import routes.

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, FromRequest, Multipart, Request, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bas_driver::RecordedAction;
use bytes::Bytes;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use super::AppState;
use super::json::{ApiJson, ApiPath, ApiQuery};
use crate::error::{Error, Result};
use crate::handlers::{EXTENDED_REQUEST_TIMEOUT, UserIdentity, with_timeout};
use crate::recording::{CreatePageRequest, GenerateWorkflowRequest, PageEventRequest, StartRecordingRequest};
use crate::transfer::{ImportOptions, MAX_IMPORT_BYTES};

/// Multipart field names accepted for the archive.
const ARCHIVE_FIELDS: [&str; 2] = ["file", "archive"];

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/recordings/live/start", post(start_recording))
        .route("/recordings/live/{session}", axum::routing::delete(close_session))
        .route("/recordings/live/{session}/stop", post(stop_recording))
        .route("/recordings/live/{session}/status", get(recording_status))
        .route(
            "/recordings/live/{session}/actions",
            get(get_actions).post(ingest_action),
        )
        .route("/recordings/live/{session}/generate-workflow", post(generate_workflow))
        .route("/recordings/live/{session}/validate-selector", post(validate_selector))
        .route("/recordings/live/{session}/pages", get(list_pages).post(create_page))
        .route(
            "/recordings/live/{session}/pages/{page}",
            axum::routing::delete(close_page),
        )
        .route("/recordings/live/{session}/pages/{page}/activate", post(activate_page))
        .route("/recordings/live/{session}/page-events", post(ingest_page_event))
        .route("/recordings/live/{session}/timeline", get(recording_timeline))
        .route("/recordings/profiles", get(list_profiles).post(create_profile))
        .route(
            "/recordings/profiles/{id}",
            get(get_profile).put(update_profile).delete(delete_profile),
        )
        .route(
            "/recordings/import",
            post(import_archive).layer(DefaultBodyLimit::disable()),
        )
}

// ============================================================================
// Live sessions
// ============================================================================

async fn start_recording(
    State(state): State<AppState>,
    identity: UserIdentity,
    body: Option<ApiJson<StartRecordingRequest>>,
) -> Result<Response> {
    state.require_recording(&identity).await?;
    let req = body.map(|ApiJson(req)| req).unwrap_or_default();
    let started = state.with_deadline(state.recording.start(req)).await?;
    Ok((StatusCode::CREATED, Json(started)).into_response())
}

async fn stop_recording(State(state): State<AppState>, ApiPath(session): ApiPath<String>) -> Result<Response> {
    let stopped = state.with_deadline(state.recording.stop(&session)).await?;
    Ok(Json(stopped).into_response())
}

async fn close_session(State(state): State<AppState>, ApiPath(session): ApiPath<String>) -> Result<Response> {
    state.with_deadline(state.recording.close_session(&session)).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn recording_status(
    State(state): State<AppState>,
    ApiPath(session): ApiPath<String>,
) -> Result<Response> {
    let status = state.with_deadline(state.recording.status(&session)).await?;
    Ok(Json(status).into_response())
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ActionsQuery {
    #[serde(default)]
    clear: bool,
}

async fn get_actions(
    State(state): State<AppState>,
    ApiPath(session): ApiPath<String>,
    ApiQuery(query): ApiQuery<ActionsQuery>,
) -> Result<Response> {
    let actions = state
        .with_deadline(state.recording.fetch_actions(&session, query.clear))
        .await?;
    Ok(Json(json!({ "session_id": session, "actions": actions })).into_response())
}

/// One action or a batch, as posted by the driver callback.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ActionPayload {
    Batch { actions: Vec<RecordedAction> },
    Single(Box<RecordedAction>),
}

async fn ingest_action(
    State(state): State<AppState>,
    ApiPath(session): ApiPath<String>,
    ApiJson(payload): ApiJson<ActionPayload>,
) -> Result<Response> {
    let actions = match payload {
        ActionPayload::Batch { actions } => actions,
        ActionPayload::Single(action) => vec![*action],
    };
    let count = actions.len();
    state
        .with_deadline(async {
            for action in actions {
                state.recording.ingest_action(&session, action).await?;
            }
            Ok(())
        })
        .await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "accepted": count }))).into_response())
}

async fn generate_workflow(
    State(state): State<AppState>,
    ApiPath(session): ApiPath<String>,
    ApiJson(req): ApiJson<GenerateWorkflowRequest>,
) -> Result<Response> {
    let generated = state
        .with_deadline(state.recording.generate_workflow(&session, req))
        .await?;
    Ok((StatusCode::CREATED, Json(generated)).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ValidateSelectorRequest {
    selector: String,
}

async fn validate_selector(
    State(state): State<AppState>,
    ApiPath(session): ApiPath<String>,
    ApiJson(req): ApiJson<ValidateSelectorRequest>,
) -> Result<Response> {
    let validation = state
        .with_deadline(state.recording.validate_selector(&session, &req.selector))
        .await?;
    Ok(Json(validation).into_response())
}

// ----------------------------------------------------------------------------
// Pages
// ----------------------------------------------------------------------------

async fn list_pages(State(state): State<AppState>, ApiPath(session): ApiPath<String>) -> Result<Response> {
    let pages = state.with_deadline(state.recording.list_pages(&session)).await?;
    Ok(Json(pages).into_response())
}

async fn create_page(
    State(state): State<AppState>,
    ApiPath(session): ApiPath<String>,
    body: Option<ApiJson<CreatePageRequest>>,
) -> Result<Response> {
    let req = body.map(|ApiJson(req)| req).unwrap_or_default();
    let page = state
        .with_deadline(state.recording.create_page(&session, req.url.as_deref()))
        .await?;
    Ok((StatusCode::CREATED, Json(page)).into_response())
}

async fn activate_page(
    State(state): State<AppState>,
    ApiPath((session, page)): ApiPath<(String, String)>,
) -> Result<Response> {
    let page = state
        .with_deadline(state.recording.activate_page(&session, &page))
        .await?;
    Ok(Json(page).into_response())
}

async fn close_page(
    State(state): State<AppState>,
    ApiPath((session, page)): ApiPath<(String, String)>,
) -> Result<Response> {
    let pages = state
        .with_deadline(state.recording.close_page(&session, &page))
        .await?;
    Ok(Json(pages).into_response())
}

async fn ingest_page_event(
    State(state): State<AppState>,
    ApiPath(session): ApiPath<String>,
    ApiJson(event): ApiJson<PageEventRequest>,
) -> Result<Response> {
    let page = state
        .with_deadline(state.recording.ingest_page_event(&session, event))
        .await?;
    Ok(Json(json!({ "page": page })).into_response())
}

async fn recording_timeline(
    State(state): State<AppState>,
    ApiPath(session): ApiPath<String>,
) -> Result<Response> {
    let timeline = state.with_deadline(state.recording.timeline(&session)).await?;
    Ok(Json(timeline).into_response())
}

// ============================================================================
// Profiles
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CreateProfileRequest {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct UpdateProfileRequest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    storage_state: Option<Value>,
}

async fn list_profiles(State(state): State<AppState>) -> Result<Response> {
    let profiles = state.with_deadline(state.recording.profiles().list()).await?;
    Ok(Json(json!({ "profiles": profiles })).into_response())
}

async fn create_profile(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<CreateProfileRequest>,
) -> Result<Response> {
    let profile = state
        .with_deadline(state.recording.profiles().create(&req.name))
        .await?;
    Ok((StatusCode::CREATED, Json(profile)).into_response())
}

async fn get_profile(State(state): State<AppState>, ApiPath(id): ApiPath<Uuid>) -> Result<Response> {
    let profile = state.with_deadline(state.recording.profiles().get(id)).await?;
    Ok(Json(profile).into_response())
}

async fn update_profile(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(req): ApiJson<UpdateProfileRequest>,
) -> Result<Response> {
    let profiles = state.recording.profiles();
    let profile = state
        .with_deadline(async {
            let mut profile = profiles.get(id).await?;
            if let Some(name) = &req.name {
                profile = profiles.rename(id, name).await?;
            }
            if let Some(storage_state) = req.storage_state.clone() {
                if !storage_state.is_object() {
                    return Err(Error::InvalidRequest(
                        "storage_state must be an object".to_string(),
                    ));
                }
                profile = profiles.update_storage_state(id, storage_state).await?;
            }
            Ok(profile)
        })
        .await?;
    Ok(Json(profile).into_response())
}

async fn delete_profile(State(state): State<AppState>, ApiPath(id): ApiPath<Uuid>) -> Result<Response> {
    state.with_deadline(state.recording.delete_profile(id)).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

// ============================================================================
// Archive import
// ============================================================================

async fn import_archive(
    State(state): State<AppState>,
    ApiQuery(options): ApiQuery<ImportOptions>,
    request: Request,
) -> Result<Response> {
    let declared = request
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if declared.is_some_and(|len| len > MAX_IMPORT_BYTES) {
        return Err(Error::RequestTooLarge {
            limit: MAX_IMPORT_BYTES,
        });
    }
    let is_multipart = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("multipart/form-data"));

    let archive = with_timeout(EXTENDED_REQUEST_TIMEOUT, async {
        if is_multipart {
            read_multipart_archive(request).await
        } else {
            read_limited(request.into_body()).await
        }
    })
    .await?;

    let summary = state.transfer.import_archive(archive, options).await?;
    Ok((StatusCode::CREATED, Json(summary)).into_response())
}

/// Upload buffer that fails once it grows past the import limit.
#[derive(Default)]
struct LimitedBuffer {
    bytes: Vec<u8>,
}

impl LimitedBuffer {
    fn push(&mut self, chunk: &Bytes) -> Result<()> {
        if (self.bytes.len() + chunk.len()) as u64 > MAX_IMPORT_BYTES {
            return Err(Error::RequestTooLarge {
                limit: MAX_IMPORT_BYTES,
            });
        }
        self.bytes.extend_from_slice(chunk);
        Ok(())
    }
}

async fn read_limited(body: Body) -> Result<Vec<u8>> {
    let mut buffer = LimitedBuffer::default();
    let mut stream = body.into_data_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| Error::InvalidRequest(format!("failed to read upload: {}", e)))?;
        buffer.push(&chunk)?;
    }
    Ok(buffer.bytes)
}

async fn read_multipart_archive(request: Request) -> Result<Vec<u8>> {
    let mut multipart = Multipart::from_request(request, &())
        .await
        .map_err(|e| Error::InvalidRequest(e.body_text()))?;
    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::InvalidRequest(e.body_text()))?
    {
        if !field.name().is_some_and(|name| ARCHIVE_FIELDS.contains(&name)) {
            continue;
        }
        let mut buffer = LimitedBuffer::default();
        while let Some(chunk) = field
            .chunk()
            .await
            .map_err(|e| Error::InvalidRequest(e.body_text()))?
        {
            buffer.push(&chunk)?;
        }
        return Ok(buffer.bytes);
    }
    Ok(Vec::new())
}
