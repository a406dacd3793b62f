// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Schedule routes.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bas_core::models::ScheduleFilter;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use super::AppState;
use super::json::{ApiJson, ApiPath, ApiQuery};
use crate::error::Result;
use crate::scheduler::{CreateScheduleRequest, DEFAULT_MAX_PER_SCHEDULE, UpdateScheduleRequest};

/// Projection window when the caller gives no end.
const DEFAULT_OCCURRENCE_WINDOW_DAYS: i64 = 7;

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/schedules", get(list_schedules).post(create_schedule))
        .route("/schedules/occurrences", get(get_occurrences))
        .route(
            "/schedules/{id}",
            get(get_schedule).put(update_schedule).delete(delete_schedule),
        )
        .route("/schedules/{id}/toggle", post(toggle_schedule))
        .route("/schedules/{id}/trigger", post(trigger_schedule))
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ScheduleListQuery {
    #[serde(default)]
    workflow_id: Option<Uuid>,
    #[serde(default)]
    active_only: bool,
}

async fn list_schedules(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<ScheduleListQuery>,
) -> Result<Response> {
    let filter = ScheduleFilter {
        workflow_id: query.workflow_id,
        active_only: query.active_only,
    };
    let schedules = state
        .with_deadline(state.scheduler.list_schedules(&filter))
        .await?;
    Ok(Json(json!({ "schedules": schedules })).into_response())
}

async fn create_schedule(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<CreateScheduleRequest>,
) -> Result<Response> {
    let schedule = state.with_deadline(state.scheduler.create_schedule(req)).await?;
    Ok((StatusCode::CREATED, Json(schedule)).into_response())
}

async fn get_schedule(State(state): State<AppState>, ApiPath(id): ApiPath<Uuid>) -> Result<Response> {
    let schedule = state.with_deadline(state.scheduler.get_schedule(id)).await?;
    Ok(Json(schedule).into_response())
}

async fn update_schedule(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(req): ApiJson<UpdateScheduleRequest>,
) -> Result<Response> {
    let schedule = state
        .with_deadline(state.scheduler.update_schedule(id, req))
        .await?;
    Ok(Json(schedule).into_response())
}

async fn delete_schedule(State(state): State<AppState>, ApiPath(id): ApiPath<Uuid>) -> Result<Response> {
    state.with_deadline(state.scheduler.delete_schedule(id)).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn toggle_schedule(State(state): State<AppState>, ApiPath(id): ApiPath<Uuid>) -> Result<Response> {
    let schedule = state.with_deadline(state.scheduler.toggle_schedule(id)).await?;
    Ok(Json(schedule).into_response())
}

async fn trigger_schedule(State(state): State<AppState>, ApiPath(id): ApiPath<Uuid>) -> Result<Response> {
    let execution = state.with_deadline(state.scheduler.trigger_schedule(id)).await?;
    Ok((StatusCode::ACCEPTED, Json(execution)).into_response())
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct OccurrenceQuery {
    #[serde(default)]
    start: Option<DateTime<Utc>>,
    #[serde(default)]
    end: Option<DateTime<Utc>>,
    #[serde(default)]
    max_per_schedule: Option<usize>,
}

async fn get_occurrences(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<OccurrenceQuery>,
) -> Result<Response> {
    let start = query.start.unwrap_or_else(Utc::now);
    let end = query
        .end
        .unwrap_or(start + Duration::days(DEFAULT_OCCURRENCE_WINDOW_DAYS));
    let max = query.max_per_schedule.unwrap_or(DEFAULT_MAX_PER_SCHEDULE);
    let occurrences = state
        .with_deadline(state.scheduler.get_occurrences(start, end, max))
        .await?;
    Ok(Json(json!({
        "start": start,
        "end": end,
        "schedules": occurrences,
    }))
    .into_response())
}
