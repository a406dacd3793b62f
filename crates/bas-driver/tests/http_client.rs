// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HttpDriverClient tests against a wiremock driver.

use std::time::Duration;

use bas_driver::{BrowserDriver, DriverConfig, DriverError, HttpDriverClient, SessionOptions};
use bas_dsl::{ClickAction, NavigateAction, ScreenshotAction};
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer) -> HttpDriverClient {
    HttpDriverClient::new(DriverConfig {
        base_url: server.uri(),
        call_timeout: Duration::from_millis(500),
        connect_timeout: Duration::from_millis(500),
    })
    .unwrap()
}

#[tokio::test]
async fn test_create_session_and_navigate() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sessions"))
        .and(body_partial_json(json!({"viewport_width": 1280})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"session_id": "s1"})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/sessions/s1/navigate"))
        .and(body_partial_json(json!({"url": "https://example.com"})))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"url": "https://example.com/", "title": "Example"})),
        )
        .mount(&server)
        .await;

    let driver = client(&server);
    let session = driver
        .create_session(&SessionOptions::new(1280, 720))
        .await
        .unwrap();
    assert_eq!(session.session_id, "s1");

    let nav = driver
        .navigate(
            "s1",
            &NavigateAction {
                url: "https://example.com".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(nav.title, "Example");
}

#[tokio::test]
async fn test_status_mapping() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sessions/gone/click"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({"error": "no session"})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/sessions/busy/record/start"))
        .respond_with(ResponseTemplate::new(409))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/sessions/s1/click"))
        .respond_with(
            ResponseTemplate::new(500).set_body_json(json!({"error": "element detached"})),
        )
        .mount(&server)
        .await;

    let driver = client(&server);
    let click = ClickAction {
        selector: "#btn".to_string(),
        ..Default::default()
    };

    assert_eq!(
        driver.click("gone", &click).await.unwrap_err(),
        DriverError::SessionNotFound("gone".to_string())
    );
    assert_eq!(
        driver.start_recording("busy", None).await.unwrap_err(),
        DriverError::RecordingInProgress("busy".to_string())
    );
    let err = driver.click("s1", &click).await.unwrap_err();
    assert_eq!(
        err,
        DriverError::Server {
            status: 500,
            message: "element detached".to_string()
        }
    );
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_call_deadline() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/sessions/slow/pages"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"pages": []}))
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let driver = client(&server);
    let err = driver.get_pages("slow").await.unwrap_err();
    assert!(matches!(err, DriverError::Timeout(_)));
}

#[tokio::test]
async fn test_unreachable_driver() {
    let driver = HttpDriverClient::new(DriverConfig {
        base_url: "http://127.0.0.1:9".to_string(),
        call_timeout: Duration::from_millis(500),
        connect_timeout: Duration::from_millis(200),
    })
    .unwrap();
    let err = driver.health().await.unwrap_err();
    assert!(err.is_unavailable());
}

#[tokio::test]
async fn test_recording_calls() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/sessions/s1/record/actions"))
        .and(query_param("clear", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "actions": [
                {"action_type": "click", "selector": {"primary": "#btn"}},
                {"action_type": "type", "selector": {"primary": "#q"}, "payload": {"text": "hi"}}
            ]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/sessions/s1/record/validate-selector"))
        .and(body_partial_json(json!({"selector": "#btn"})))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"valid": true, "match_count": 2})),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/sessions/s1/record/status"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"is_recording": true, "action_count": 2})),
        )
        .mount(&server)
        .await;

    let driver = client(&server);
    let actions = driver.get_actions("s1", true).await.unwrap();
    assert_eq!(actions.len(), 2);
    assert_eq!(actions[1].payload_str("text"), Some("hi"));

    let validation = driver.validate_selector("s1", "#btn").await.unwrap();
    assert!(validation.valid);
    assert_eq!(validation.match_count, 2);

    let status = driver.recording_status("s1").await.unwrap();
    assert!(status.is_recording);
}

#[tokio::test]
async fn test_screenshot_and_artifacts_decode() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sessions/s1/screenshot"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": "AAEC"})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/sessions/s1/artifacts"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"trace": "AAEC"})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/sessions/s1/close"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let driver = client(&server);
    let shot = driver
        .screenshot("s1", &ScreenshotAction::default())
        .await
        .unwrap();
    assert_eq!(shot.data, vec![0, 1, 2]);

    let artifacts = driver.collect_artifacts("s1").await.unwrap();
    assert_eq!(artifacts.trace, Some(vec![0, 1, 2]));
    assert!(artifacts.video.is_none());

    driver.close_session("s1").await.unwrap();
    // Unknown sessions close quietly.
    driver.close_session("other").await.unwrap();
}
