// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow catalog and execution routes end to end.

mod common;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use bas_driver::mock::MOCK_PNG;
use common::{TestContext, two_step_flow};
use serde_json::{Value, json};
use std::time::Duration;

#[tokio::test]
async fn test_health_reports_healthy_dependencies() {
    let ctx = TestContext::new().await;
    let (status, body) = ctx.get("/api/v1/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["checks"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn test_health_degrades_when_driver_is_down() {
    let ctx = TestContext::new().await;
    ctx.driver.set_unavailable(true).await;
    let (status, body) = ctx.get("/api/v1/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "degraded");
}

#[tokio::test]
async fn test_execute_with_wait_produces_timeline_and_screenshot() {
    let ctx = TestContext::new().await;
    let workflow = ctx.create_workflow("Smoke", two_step_flow()).await;
    let id = workflow["id"].as_str().unwrap();
    assert_eq!(workflow["version"], 1);

    let (status, execution) = ctx
        .post(
            &format!("/api/v1/workflows/{id}/execute"),
            json!({"wait_for_completion": true, "timeout_ms": 30000}),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{execution}");
    assert_eq!(execution["status"], "completed");
    assert_eq!(execution["progress"], 100);
    let execution_id = execution["id"].as_str().unwrap();

    let (status, detail) = ctx.get(&format!("/api/v1/executions/{execution_id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        detail["timeline_url"],
        format!("/api/v1/executions/{execution_id}/timeline")
    );

    let (status, timeline) = ctx
        .get(&format!("/api/v1/executions/{execution_id}/timeline"))
        .await;
    assert_eq!(status, StatusCode::OK);
    let frames = timeline["entries"].as_array().unwrap();
    assert_eq!(frames.len(), 2);
    assert!(frames.iter().all(|f| f["success"] == true));

    let (status, shots) = ctx
        .get(&format!("/api/v1/executions/{execution_id}/screenshots"))
        .await;
    assert_eq!(status, StatusCode::OK);
    let step = shots["screenshots"][0]["step_index"].as_u64().unwrap();

    let request = Request::builder()
        .uri(format!("/api/v1/executions/{execution_id}/screenshots/{step}"))
        .body(Body::empty())
        .unwrap();
    let (status, headers, bytes) = ctx.send(request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_TYPE], "image/png");
    assert_eq!(bytes.as_ref(), MOCK_PNG);

    let (status, body) = ctx
        .get(&format!("/api/v1/executions/{execution_id}/screenshots/99"))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "SCREENSHOT_NOT_FOUND");
}

#[tokio::test]
async fn test_async_execute_returns_accepted() {
    let ctx = TestContext::new().await;
    let workflow = ctx.create_workflow("Async", two_step_flow()).await;
    let id = workflow["id"].as_str().unwrap();

    let (status, execution) = ctx
        .request(Method::POST, &format!("/api/v1/workflows/{id}/execute"), None)
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(execution["status"], "pending");

    let finished = ctx.wait_terminal(execution["id"].as_str().unwrap()).await;
    assert_eq!(finished["status"], "completed");

    let (status, listed) = ctx
        .get(&format!("/api/v1/executions?workflow_id={id}"))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed["executions"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_stale_update_is_a_version_conflict() {
    let ctx = TestContext::new().await;
    let workflow = ctx.create_workflow("Versioned", two_step_flow()).await;
    let id = workflow["id"].as_str().unwrap();

    let mut changed = two_step_flow();
    changed["nodes"][0]["data"]["url"] = json!("https://example.org");
    let (status, updated) = ctx
        .put(
            &format!("/api/v1/workflows/{id}"),
            json!({"flow_definition": changed, "expected_version": 1}),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{updated}");
    assert_eq!(updated["version"], 2);

    let (status, body) = ctx
        .put(
            &format!("/api/v1/workflows/{id}"),
            json!({"description": "late", "expected_version": 1}),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "WORKFLOW_VERSION_CONFLICT");
    assert_eq!(body["details"]["current_version"], 2);

    let (status, versions) = ctx.get(&format!("/api/v1/workflows/{id}/versions")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(versions["versions"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_duplicate_name_is_rejected() {
    let ctx = TestContext::new().await;
    ctx.create_workflow("Twice", two_step_flow()).await;
    let (status, body) = ctx
        .post(
            "/api/v1/workflows",
            json!({"name": "Twice", "flow_definition": two_step_flow()}),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "WORKFLOW_ALREADY_EXISTS");
}

#[tokio::test]
async fn test_validate_route() {
    let ctx = TestContext::new().await;
    let (status, report) = ctx
        .post("/api/v1/workflows/validate", json!({"flow_definition": two_step_flow()}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["valid"], true);
}

#[tokio::test]
async fn test_malformed_bodies_use_error_envelope() {
    let ctx = TestContext::new().await;

    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/v1/workflows")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, _, body) = ctx.send(request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["code"], "INVALID_REQUEST");

    let (status, body) = ctx.get("/api/v1/workflows/not-a-uuid").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_REQUEST");

    let (status, body) = ctx
        .get(&format!("/api/v1/workflows/{}", uuid::Uuid::new_v4()))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "WORKFLOW_NOT_FOUND");

    let (status, _) = ctx.get("/api/v1/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_project_lifecycle() {
    let ctx = TestContext::new().await;
    let (status, project) = ctx.post("/api/v1/projects", json!({"name": "Checkout"})).await;
    assert_eq!(status, StatusCode::CREATED, "{project}");
    let project_id = project["id"].as_str().unwrap();

    let (status, workflow) = ctx
        .post(
            "/api/v1/workflows",
            json!({"name": "Pay", "project_id": project_id, "flow_definition": two_step_flow()}),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{workflow}");

    let (status, listed) = ctx
        .get(&format!("/api/v1/projects/{project_id}/workflows"))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed["workflows"].as_array().unwrap().len(), 1);

    let (status, _) = ctx.delete(&format!("/api/v1/projects/{project_id}")).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = ctx.get(&format!("/api/v1/projects/{project_id}")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

/// Navigate, then click each selector in order.
fn click_flow(selectors: &[&str], settings: Value) -> Value {
    let mut nodes = vec![json!({"id": "n0", "type": "navigate", "data": {"url": "https://example.com"}})];
    let mut edges = Vec::new();
    for (i, selector) in selectors.iter().enumerate() {
        let id = format!("n{}", i + 1);
        nodes.push(json!({"id": id, "type": "click", "data": {"selector": selector}}));
        edges.push(json!({"id": format!("e{}", i + 1), "source": format!("n{i}"), "target": id}));
    }
    json!({"nodes": nodes, "edges": edges, "settings": settings})
}

async fn start_async(ctx: &TestContext, flow: Value) -> String {
    let workflow = ctx.create_workflow("Lifecycle", flow).await;
    let id = workflow["id"].as_str().unwrap();
    let (status, execution) = ctx
        .request(Method::POST, &format!("/api/v1/workflows/{id}/execute"), None)
        .await;
    assert_eq!(status, StatusCode::ACCEPTED, "{execution}");
    execution["id"].as_str().unwrap().to_string()
}

async fn wait_status(ctx: &TestContext, execution_id: &str, expected: &str) {
    for _ in 0..400 {
        let (_, execution) = ctx.get(&format!("/api/v1/executions/{execution_id}")).await;
        if execution["status"] == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("execution {execution_id} never became {expected}");
}

async fn call_count(ctx: &TestContext, call: &str) -> usize {
    ctx.driver.calls().await.iter().filter(|c| *c == call).count()
}

#[tokio::test]
async fn test_stop_cancels_a_running_execution() {
    let ctx = TestContext::new().await;
    ctx.driver.set_action_delay(Duration::from_millis(100)).await;
    let id = start_async(&ctx, click_flow(&["#a", "#b", "#c", "#d", "#e"], json!({}))).await;
    wait_status(&ctx, &id, "running").await;

    let (status, _) = ctx
        .request(Method::POST, &format!("/api/v1/executions/{id}/stop"), None)
        .await;
    assert_eq!(status, StatusCode::OK);

    let finished = ctx.wait_terminal(&id).await;
    assert_eq!(finished["status"], "cancelled");
    assert_eq!(finished["error"], "cancelled by user");
    assert_eq!(call_count(&ctx, "click:#e").await, 0);

    let (status, body) = ctx
        .request(Method::POST, &format!("/api/v1/executions/{id}/stop"), None)
        .await;
    assert_eq!(status, StatusCode::CONFLICT, "{body}");
}

#[tokio::test]
async fn test_pause_then_resume_completes_in_place() {
    let ctx = TestContext::new().await;
    ctx.driver.set_action_delay(Duration::from_millis(100)).await;
    let id = start_async(&ctx, click_flow(&["#a", "#b", "#c", "#d"], json!({}))).await;
    wait_status(&ctx, &id, "running").await;

    let (status, _) = ctx
        .request(Method::POST, &format!("/api/v1/executions/{id}/pause"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    wait_status(&ctx, &id, "paused").await;

    let (status, resumed) = ctx
        .request(Method::POST, &format!("/api/v1/executions/{id}/resume"), None)
        .await;
    assert_eq!(status, StatusCode::OK, "{resumed}");
    assert_eq!(resumed["id"], id.as_str());

    let finished = ctx.wait_terminal(&id).await;
    assert_eq!(finished["status"], "completed");
    let (_, timeline) = ctx.get(&format!("/api/v1/executions/{id}/timeline")).await;
    assert_eq!(timeline["entries"].as_array().unwrap().len(), 5);
    assert_eq!(call_count(&ctx, "click:#a").await, 1);
}

#[tokio::test]
async fn test_resume_failed_execution_replays_completed_steps() {
    let ctx = TestContext::new().await;
    ctx.driver.fail_selector_transiently("#b", 1).await;
    let id = start_async(&ctx, click_flow(&["#a", "#b"], json!({"max_retries": 0}))).await;
    let failed = ctx.wait_terminal(&id).await;
    assert_eq!(failed["status"], "failed", "{failed}");

    let (status, resumed) = ctx
        .post(
            &format!("/api/v1/executions/{id}/resume"),
            json!({"parameters": {"note": "retry"}}),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{resumed}");
    let next_id = resumed["id"].as_str().unwrap();
    assert_ne!(next_id, id);
    assert_eq!(resumed["trigger_type"], "resume");
    assert_eq!(resumed["parameters"]["_resumed_from"], id.as_str());
    assert_eq!(resumed["parameters"]["note"], "retry");

    let finished = ctx.wait_terminal(next_id).await;
    assert_eq!(finished["status"], "completed", "{finished}");
    assert_eq!(call_count(&ctx, "click:#a").await, 1);
    assert_eq!(call_count(&ctx, "click:#b").await, 2);

    let (_, timeline) = ctx.get(&format!("/api/v1/executions/{next_id}/timeline")).await;
    let frames = timeline["entries"].as_array().unwrap();
    assert_eq!(frames.len(), 3);
    assert!(frames.iter().all(|f| f["success"] == true));

    let (_, original) = ctx.get(&format!("/api/v1/executions/{id}")).await;
    assert_eq!(original["status"], "failed");
}

#[tokio::test]
async fn test_transient_driver_errors_are_retried() {
    let ctx = TestContext::new().await;
    ctx.driver.fail_selector_transiently("#flaky", 2).await;
    let workflow = ctx
        .create_workflow("Flaky", click_flow(&["#flaky"], json!({"retry_backoff_ms": 1})))
        .await;
    let id = workflow["id"].as_str().unwrap();

    let (status, execution) = ctx
        .post(
            &format!("/api/v1/workflows/{id}/execute"),
            json!({"wait_for_completion": true, "timeout_ms": 30000}),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{execution}");
    assert_eq!(execution["status"], "completed");
    assert_eq!(call_count(&ctx, "click:#flaky").await, 3);

    let execution_id = execution["id"].as_str().unwrap();
    let (_, timeline) = ctx
        .get(&format!("/api/v1/executions/{execution_id}/timeline"))
        .await;
    assert_eq!(timeline["entries"][1]["retries"], 2);
}

#[tokio::test]
async fn test_panicking_step_fails_the_execution() {
    let ctx = TestContext::new().await;
    ctx.driver.panic_on_selector("#boom").await;
    let id = start_async(&ctx, click_flow(&["#boom"], json!({}))).await;

    let finished = ctx.wait_terminal(&id).await;
    assert_eq!(finished["status"], "failed");
    assert!(
        finished["error"].as_str().unwrap().starts_with("INTERNAL_SERVER:"),
        "{finished}"
    );
    assert_eq!(ctx.driver.open_sessions().await, 0);
}
