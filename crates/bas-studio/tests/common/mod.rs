// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared fixtures for the HTTP API tests.

#![allow(dead_code)]

use std::io::{Cursor, Write};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, Method, Request, StatusCode, header};
use bas_core::entitlement::{DEFAULT_CACHE_TTL, StaticEntitlementSource};
use bas_core::{EntitlementGate, FsBlobStore, SqliteIndexStore, Tier, TtlCache};
use bas_driver::MockDriver;
use bas_studio::handlers::StudioHandlerState;
use bas_studio::http::build_router;
use bas_studio::runtime::StudioRuntime;
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tempfile::TempDir;
use tower::ServiceExt;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

/// A fully wired studio on an in-memory index and a mock driver.
pub struct TestContext {
    pub state: Arc<StudioHandlerState>,
    pub router: Router,
    pub driver: Arc<MockDriver>,
    pub dir: TempDir,
}

impl TestContext {
    /// Studio with entitlements disabled.
    pub async fn new() -> Self {
        Self::build(EntitlementGate::disabled()).await
    }

    /// Studio enforcing `tier` for every caller.
    pub async fn with_tier(tier: Tier) -> Self {
        Self::with_source(StaticEntitlementSource::new(tier)).await
    }

    /// Studio enforcing the given fixed entitlements.
    pub async fn with_source(source: StaticEntitlementSource) -> Self {
        Self::build(EntitlementGate::new(
            true,
            Arc::new(source),
            Arc::new(TtlCache::new(DEFAULT_CACHE_TTL)),
        ))
        .await
    }

    async fn build(gate: EntitlementGate) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let driver = Arc::new(MockDriver::new());
        let store = Arc::new(SqliteIndexStore::in_memory().await.unwrap());
        let config = StudioRuntime::builder()
            .store(store)
            .driver(driver.clone())
            .blob_store(Arc::new(FsBlobStore::new(dir.path().join("blobs"))))
            .entitlements(Arc::new(gate))
            .recordings_root(dir.path().join("recordings"))
            .projects_root(dir.path().join("projects"))
            .profiles_root(dir.path().join("profiles"))
            .build()
            .unwrap();
        let state = config.handler_state();
        let router = build_router(state.clone());
        Self {
            state,
            router,
            driver,
            dir,
        }
    }

    /// Send a request and return status, headers and raw body.
    pub async fn send(&self, request: Request<Body>) -> (StatusCode, HeaderMap, Bytes) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, headers, body)
    }

    /// Send a JSON request and parse the JSON response (`Null` when empty).
    pub async fn request(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let (status, _, bytes) = self.send(request).await;
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };
        (status, value)
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.request(Method::GET, uri, None).await
    }

    pub async fn post(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.request(Method::POST, uri, Some(body)).await
    }

    pub async fn put(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.request(Method::PUT, uri, Some(body)).await
    }

    pub async fn delete(&self, uri: &str) -> (StatusCode, Value) {
        self.request(Method::DELETE, uri, None).await
    }

    /// Create a workflow and return its JSON.
    pub async fn create_workflow(&self, name: &str, flow_definition: Value) -> Value {
        let (status, body) = self
            .post(
                "/api/v1/workflows",
                json!({"name": name, "flow_definition": flow_definition}),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "create workflow failed: {body}");
        body
    }

    /// POST raw archive bytes to the import route.
    pub async fn import(&self, bytes: Vec<u8>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/v1/recordings/import")
            .header(header::CONTENT_TYPE, "application/zip")
            .body(Body::from(bytes))
            .unwrap();
        let (status, _, body) = self.send(request).await;
        (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
    }

    /// Poll an execution until it reaches a terminal status.
    pub async fn wait_terminal(&self, execution_id: &str) -> Value {
        for _ in 0..200 {
            let (_, execution) = self.get(&format!("/api/v1/executions/{execution_id}")).await;
            if matches!(
                execution["status"].as_str(),
                Some("completed" | "failed" | "cancelled")
            ) {
                return execution;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("execution {execution_id} did not finish");
    }
}

/// Navigate then screenshot.
pub fn two_step_flow() -> Value {
    json!({
        "nodes": [
            {"id": "1", "type": "navigate", "data": {"url": "https://example.com"}},
            {"id": "2", "type": "screenshot", "data": {}}
        ],
        "edges": [{"id": "e1", "source": "1", "target": "2"}]
    })
}

/// Zip a manifest with the given assets.
pub fn build_archive(manifest: &Value, assets: &[(&str, &[u8])]) -> Vec<u8> {
    let mut buffer = Cursor::new(Vec::new());
    {
        let mut zip = ZipWriter::new(&mut buffer);
        let options = SimpleFileOptions::default();
        zip.start_file("manifest.json", options).unwrap();
        zip.write_all(&serde_json::to_vec(manifest).unwrap()).unwrap();
        for (name, bytes) in assets {
            zip.start_file(*name, options).unwrap();
            zip.write_all(bytes).unwrap();
        }
        zip.finish().unwrap();
    }
    buffer.into_inner()
}

/// Two frames, one screenshot, 150 ms.
pub fn sample_archive() -> Vec<u8> {
    build_archive(
        &json!({"version": 1, "frames": [
            {"step_index": 0, "node_id": "n1", "step_type": "navigate", "duration_ms": 100, "url": "https://example.com"},
            {"step_index": 1, "node_id": "n2", "step_type": "screenshot", "duration_ms": 50, "screenshot": "shot.png"}
        ]}),
        &[("shot.png", b"png")],
    )
}
