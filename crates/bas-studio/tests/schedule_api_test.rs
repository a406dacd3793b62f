// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Schedule routes and the scheduler tick.

mod common;

use axum::http::{Method, StatusCode};
use chrono::{DateTime, Duration, Utc};
use common::{TestContext, two_step_flow};
use serde_json::{Value, json};
use uuid::Uuid;

async fn create_schedule(ctx: &TestContext, cron: &str) -> (String, Value) {
    let workflow = ctx.create_workflow("Nightly", two_step_flow()).await;
    let workflow_id = workflow["id"].as_str().unwrap().to_string();
    let (status, schedule) = ctx
        .post(
            "/api/v1/schedules",
            json!({
                "workflow_id": workflow_id,
                "name": "every minute",
                "cron_expression": cron,
                "parameters": {"region": "eu"}
            }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{schedule}");
    (workflow_id, schedule)
}

fn timestamp(value: &Value) -> DateTime<Utc> {
    value.as_str().unwrap().parse().unwrap()
}

#[tokio::test]
async fn test_invalid_cron_is_rejected() {
    let ctx = TestContext::new().await;
    let workflow = ctx.create_workflow("Cron", two_step_flow()).await;
    let (status, body) = ctx
        .post(
            "/api/v1/schedules",
            json!({
                "workflow_id": workflow["id"],
                "name": "broken",
                "cron_expression": "*/0 * * * *"
            }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_CRON_EXPRESSION");

    let (status, body) = ctx
        .post(
            "/api/v1/schedules",
            json!({
                "workflow_id": Uuid::new_v4(),
                "name": "orphan",
                "cron_expression": "* * * * *"
            }),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "WORKFLOW_NOT_FOUND");
}

#[tokio::test]
async fn test_create_computes_next_run_and_aggregates() {
    let ctx = TestContext::new().await;
    let before = Utc::now();
    let (workflow_id, schedule) = create_schedule(&ctx, "* * * * *").await;

    assert_eq!(schedule["is_active"], true);
    assert_eq!(schedule["timezone"], "UTC");
    assert_eq!(schedule["is_recurring"], true);
    assert_eq!(schedule["estimated_runs_per_day"], 1440.0);
    assert!(timestamp(&schedule["next_run_at"]) > before);

    let (status, listed) = ctx
        .get(&format!("/api/v1/schedules?workflow_id={workflow_id}&active_only=true"))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed["schedules"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_missed_runs_coalesce_into_one_fire() {
    let ctx = TestContext::new().await;
    let (_, schedule) = create_schedule(&ctx, "* * * * *").await;
    let id: Uuid = schedule["id"].as_str().unwrap().parse().unwrap();

    // Ten minutes of missed fires.
    let now = Utc::now() + Duration::minutes(10);
    let report = ctx.state.scheduler.tick(now).await.unwrap();
    assert_eq!(report.fired, vec![id]);
    assert!(report.skipped.is_empty());

    let (_, after) = ctx.get(&format!("/api/v1/schedules/{id}")).await;
    assert!(timestamp(&after["next_run_at"]) > now);
    assert!(after["last_run_at"].is_string());

    let again = ctx.state.scheduler.tick(now).await.unwrap();
    assert!(again.fired.is_empty());

    let (_, executions) = ctx.get("/api/v1/executions").await;
    let executions = executions["executions"].as_array().unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0]["trigger_type"], "scheduled");
    assert_eq!(executions[0]["parameters"]["_schedule_id"], id.to_string());
    assert_eq!(executions[0]["parameters"]["region"], "eu");
}

#[tokio::test]
async fn test_toggle_and_update() {
    let ctx = TestContext::new().await;
    let (_, schedule) = create_schedule(&ctx, "0 9 * * 1-5").await;
    let id = schedule["id"].as_str().unwrap();

    let (status, paused) = ctx
        .request(Method::POST, &format!("/api/v1/schedules/{id}/toggle"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(paused["is_active"], false);
    assert!(paused.get("next_run_at").is_none());

    let (_, resumed) = ctx
        .request(Method::POST, &format!("/api/v1/schedules/{id}/toggle"), None)
        .await;
    assert_eq!(resumed["is_active"], true);
    assert!(resumed["next_run_at"].is_string());

    let (status, updated) = ctx
        .put(
            &format!("/api/v1/schedules/{id}"),
            json!({"cron_expression": "0 0 1 1 *", "timezone": "Europe/Warsaw"}),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{updated}");
    assert_eq!(updated["timezone"], "Europe/Warsaw");
    assert_eq!(updated["cron_expression"], "0 0 1 1 *");

    let (status, body) = ctx
        .put(
            &format!("/api/v1/schedules/{id}"),
            json!({"cron_expression": "61 * * * *"}),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_CRON_EXPRESSION");

    let (status, _) = ctx.delete(&format!("/api/v1/schedules/{id}")).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, body) = ctx.get(&format!("/api/v1/schedules/{id}")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "SCHEDULE_NOT_FOUND");
}

#[tokio::test]
async fn test_occurrences_window() {
    let ctx = TestContext::new().await;
    create_schedule(&ctx, "*/15 * * * *").await;

    let (status, body) = ctx
        .get("/api/v1/schedules/occurrences?start=2029-12-31T23:59:30Z&end=2030-01-01T00:59:00Z")
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let schedules = body["schedules"].as_array().unwrap();
    assert_eq!(schedules.len(), 1);
    assert_eq!(schedules[0]["times"].as_array().unwrap().len(), 4);
    assert_eq!(schedules[0]["truncated"], false);

    let (status, body) = ctx
        .get("/api/v1/schedules/occurrences?start=2030-01-02T00:00:00Z&end=2030-01-01T00:00:00Z")
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_REQUEST");
}

#[tokio::test]
async fn test_manual_trigger_starts_an_execution() {
    let ctx = TestContext::new().await;
    let (_, schedule) = create_schedule(&ctx, "0 0 1 1 *").await;
    let id = schedule["id"].as_str().unwrap();

    let (status, execution) = ctx
        .request(Method::POST, &format!("/api/v1/schedules/{id}/trigger"), None)
        .await;
    assert_eq!(status, StatusCode::ACCEPTED, "{execution}");
    assert_eq!(execution["parameters"]["_manual_trigger"], true);

    let finished = ctx.wait_terminal(execution["id"].as_str().unwrap()).await;
    assert_eq!(finished["status"], "completed");

    let (_, after) = ctx.get(&format!("/api/v1/schedules/{id}")).await;
    assert!(after["last_run_at"].is_string());
}
