// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Browser driver client.
//!
//! [`BrowserDriver`] is the seam the studio services talk to;
//! [`HttpDriverClient`] implements it over the driver's JSON HTTP API.
//! Every call carries its own deadline, and driver status codes are mapped
//! to [`DriverError`] variants.

use std::time::Duration;

use bas_dsl::{
    ClickAction, ExtractAction, KeyboardAction, NavigateAction, ScreenshotAction, ScrollAction,
    SelectAction, TypeAction, WaitAction,
};
use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, instrument};

use crate::error::{DriverError, Result};
use crate::types::{
    ActionsResponse, DriverHealth, DriverPage, ExtractResult, NavigationResult, PageList,
    RecordedAction, RecordingStarted, RecordingStatus, RecordingStopped, Screenshot,
    SelectorValidation, SessionArtifacts, SessionInfo, SessionOptions,
};

/// Default driver base URL.
pub const DEFAULT_DRIVER_URL: &str = "http://127.0.0.1:39400";

/// Default deadline of a single call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Extra time granted on top of an action's own timeout.
const ACTION_GRACE: Duration = Duration::from_secs(5);

/// RPC surface of the external browser driver.
#[async_trait::async_trait]
pub trait BrowserDriver: Send + Sync {
    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    /// Start a browser session.
    async fn create_session(&self, options: &SessionOptions) -> Result<SessionInfo>;

    /// Close a session. Unknown sessions are not an error.
    async fn close_session(&self, session_id: &str) -> Result<()>;

    // ------------------------------------------------------------------
    // Actions
    // ------------------------------------------------------------------

    async fn navigate(&self, session_id: &str, action: &NavigateAction)
    -> Result<NavigationResult>;

    async fn click(&self, session_id: &str, action: &ClickAction) -> Result<()>;

    async fn type_text(&self, session_id: &str, action: &TypeAction) -> Result<()>;

    async fn scroll(&self, session_id: &str, action: &ScrollAction) -> Result<()>;

    async fn select(&self, session_id: &str, action: &SelectAction) -> Result<()>;

    async fn keyboard(&self, session_id: &str, action: &KeyboardAction) -> Result<()>;

    async fn wait(&self, session_id: &str, action: &WaitAction) -> Result<()>;

    /// Whether `selector` matches anything on the active page.
    async fn element_exists(&self, session_id: &str, selector: &str) -> Result<bool>;

    /// Run an extraction (selector/attribute or script).
    async fn extract(&self, session_id: &str, action: &ExtractAction) -> Result<ExtractResult>;

    async fn screenshot(&self, session_id: &str, action: &ScreenshotAction) -> Result<Screenshot>;

    // ------------------------------------------------------------------
    // Recording
    // ------------------------------------------------------------------

    async fn start_recording(
        &self,
        session_id: &str,
        callback_url: Option<&str>,
    ) -> Result<RecordingStarted>;

    async fn stop_recording(&self, session_id: &str) -> Result<RecordingStopped>;

    async fn recording_status(&self, session_id: &str) -> Result<RecordingStatus>;

    /// Captured actions, optionally clearing the driver-side buffer.
    async fn get_actions(&self, session_id: &str, clear: bool) -> Result<Vec<RecordedAction>>;

    async fn validate_selector(&self, session_id: &str, selector: &str)
    -> Result<SelectorValidation>;

    // ------------------------------------------------------------------
    // Pages
    // ------------------------------------------------------------------

    async fn create_page(&self, session_id: &str, url: Option<&str>) -> Result<DriverPage>;

    async fn get_pages(&self, session_id: &str) -> Result<PageList>;

    async fn activate_page(&self, session_id: &str, driver_page_id: &str) -> Result<()>;

    async fn close_page(&self, session_id: &str, driver_page_id: &str) -> Result<()>;

    // ------------------------------------------------------------------
    // Observability
    // ------------------------------------------------------------------

    async fn health(&self) -> Result<DriverHealth>;

    /// Video, trace and HAR of a session.
    async fn collect_artifacts(&self, session_id: &str) -> Result<SessionArtifacts>;
}

/// Configuration for [`HttpDriverClient`].
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Base URL, e.g. `http://127.0.0.1:39400`.
    pub base_url: String,
    /// Default per-call deadline.
    pub call_timeout: Duration,
    /// Connection timeout.
    pub connect_timeout: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_DRIVER_URL.to_string(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl DriverConfig {
    /// Configuration for a base URL with default timeouts.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }
}

/// JSON-over-HTTP driver client.
#[derive(Debug, Clone)]
pub struct HttpDriverClient {
    client: reqwest::Client,
    config: DriverConfig,
}

impl HttpDriverClient {
    /// Create a client.
    pub fn new(config: DriverConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| DriverError::Unavailable(format!("failed to build HTTP client: {}", e)))?;
        let config = DriverConfig {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            ..config
        };
        Ok(Self { client, config })
    }

    /// Client for `base_url` with default timeouts.
    pub fn from_url(base_url: impl Into<String>) -> Result<Self> {
        Self::new(DriverConfig::new(base_url))
    }

    /// The client configuration.
    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    // =========================================================================
    // Internal helpers
    // =========================================================================

    fn session_path(session_id: &str, suffix: &str) -> String {
        format!("/sessions/{}/{}", session_id, suffix)
    }

    /// Deadline for an action with its own timeout.
    fn action_timeout(&self, action_timeout_ms: Option<u64>) -> Duration {
        match action_timeout_ms {
            Some(ms) => Duration::from_millis(ms) + ACTION_GRACE,
            None => self.config.call_timeout,
        }
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        session_id: Option<&str>,
        timeout: Duration,
    ) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.config.base_url, path);
        debug!(method = %method, url = %url, "Driver call");

        let mut request = self.client.request(method, &url).timeout(timeout);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                DriverError::Timeout(timeout)
            } else {
                DriverError::Unavailable(e.to_string())
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = response
            .text()
            .await
            .ok()
            .and_then(|body| error_message(&body))
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("error").to_string());
        let session = session_id.unwrap_or_default().to_string();

        Err(match status {
            StatusCode::NOT_FOUND if session_id.is_some() => DriverError::SessionNotFound(session),
            StatusCode::CONFLICT => DriverError::RecordingInProgress(session),
            StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
                DriverError::Timeout(timeout)
            }
            _ => DriverError::Server {
                status: status.as_u16(),
                message,
            },
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        session_id: Option<&str>,
        timeout: Duration,
    ) -> Result<T> {
        let response = self.send(method, path, body, session_id, timeout).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| DriverError::InvalidResponse(e.to_string()))?;
        // Empty bodies decode as `null` so unit-like responses work.
        let slice: &[u8] = if bytes.is_empty() { b"null" } else { &bytes };
        serde_json::from_slice(slice).map_err(|e| DriverError::InvalidResponse(e.to_string()))
    }

    async fn call_unit(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        session_id: Option<&str>,
        timeout: Duration,
    ) -> Result<()> {
        self.send(method, path, body, session_id, timeout).await?;
        Ok(())
    }

    async fn session_action<A: Serialize + Sync>(
        &self,
        session_id: &str,
        suffix: &str,
        action: &A,
        timeout_ms: Option<u64>,
    ) -> Result<()> {
        let body = serde_json::to_value(action)
            .map_err(|e| DriverError::InvalidResponse(e.to_string()))?;
        self.call_unit(
            Method::POST,
            &Self::session_path(session_id, suffix),
            Some(body),
            Some(session_id),
            self.action_timeout(timeout_ms),
        )
        .await
    }
}

/// Pull a message out of a driver error body.
fn error_message(body: &str) -> Option<String> {
    if body.trim().is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(body) {
        Ok(value) => value
            .get("error")
            .or_else(|| value.get("message"))
            .and_then(|m| match m {
                Value::String(s) => Some(s.clone()),
                Value::Object(o) => o.get("message").and_then(Value::as_str).map(String::from),
                _ => None,
            })
            .or_else(|| Some(body.to_string())),
        Err(_) => Some(body.to_string()),
    }
}

#[async_trait::async_trait]
impl BrowserDriver for HttpDriverClient {
    #[instrument(skip(self, options))]
    async fn create_session(&self, options: &SessionOptions) -> Result<SessionInfo> {
        let body = serde_json::to_value(options)
            .map_err(|e| DriverError::InvalidResponse(e.to_string()))?;
        self.call(
            Method::POST,
            "/sessions",
            Some(body),
            None,
            self.config.call_timeout,
        )
        .await
    }

    #[instrument(skip(self))]
    async fn close_session(&self, session_id: &str) -> Result<()> {
        match self
            .call_unit(
                Method::POST,
                &Self::session_path(session_id, "close"),
                None,
                Some(session_id),
                self.config.call_timeout,
            )
            .await
        {
            Err(DriverError::SessionNotFound(_)) => Ok(()),
            other => other,
        }
    }

    async fn navigate(
        &self,
        session_id: &str,
        action: &NavigateAction,
    ) -> Result<NavigationResult> {
        let body = serde_json::to_value(action)
            .map_err(|e| DriverError::InvalidResponse(e.to_string()))?;
        self.call(
            Method::POST,
            &Self::session_path(session_id, "navigate"),
            Some(body),
            Some(session_id),
            self.action_timeout(action.timeout_ms),
        )
        .await
    }

    async fn click(&self, session_id: &str, action: &ClickAction) -> Result<()> {
        self.session_action(session_id, "click", action, action.timeout_ms)
            .await
    }

    async fn type_text(&self, session_id: &str, action: &TypeAction) -> Result<()> {
        self.session_action(session_id, "type", action, None).await
    }

    async fn scroll(&self, session_id: &str, action: &ScrollAction) -> Result<()> {
        self.session_action(session_id, "scroll", action, None)
            .await
    }

    async fn select(&self, session_id: &str, action: &SelectAction) -> Result<()> {
        self.session_action(session_id, "select", action, None)
            .await
    }

    async fn keyboard(&self, session_id: &str, action: &KeyboardAction) -> Result<()> {
        self.session_action(session_id, "keyboard", action, None)
            .await
    }

    async fn wait(&self, session_id: &str, action: &WaitAction) -> Result<()> {
        let budget = action
            .duration_ms
            .into_iter()
            .chain(action.timeout_ms)
            .max();
        self.session_action(session_id, "wait", action, budget)
            .await
    }

    async fn element_exists(&self, session_id: &str, selector: &str) -> Result<bool> {
        let response: Value = self
            .call(
                Method::POST,
                &Self::session_path(session_id, "element-exists"),
                Some(json!({ "selector": selector })),
                Some(session_id),
                self.config.call_timeout,
            )
            .await?;
        response
            .get("exists")
            .and_then(Value::as_bool)
            .ok_or_else(|| DriverError::InvalidResponse("missing 'exists' field".to_string()))
    }

    async fn extract(&self, session_id: &str, action: &ExtractAction) -> Result<ExtractResult> {
        let body = serde_json::to_value(action)
            .map_err(|e| DriverError::InvalidResponse(e.to_string()))?;
        self.call(
            Method::POST,
            &Self::session_path(session_id, "extract"),
            Some(body),
            Some(session_id),
            self.config.call_timeout,
        )
        .await
    }

    async fn screenshot(&self, session_id: &str, action: &ScreenshotAction) -> Result<Screenshot> {
        let body = serde_json::to_value(action)
            .map_err(|e| DriverError::InvalidResponse(e.to_string()))?;
        self.call(
            Method::POST,
            &Self::session_path(session_id, "screenshot"),
            Some(body),
            Some(session_id),
            self.config.call_timeout,
        )
        .await
    }

    #[instrument(skip(self))]
    async fn start_recording(
        &self,
        session_id: &str,
        callback_url: Option<&str>,
    ) -> Result<RecordingStarted> {
        self.call(
            Method::POST,
            &Self::session_path(session_id, "record/start"),
            Some(json!({ "callback_url": callback_url })),
            Some(session_id),
            self.config.call_timeout,
        )
        .await
    }

    #[instrument(skip(self))]
    async fn stop_recording(&self, session_id: &str) -> Result<RecordingStopped> {
        self.call(
            Method::POST,
            &Self::session_path(session_id, "record/stop"),
            None,
            Some(session_id),
            self.config.call_timeout,
        )
        .await
    }

    async fn recording_status(&self, session_id: &str) -> Result<RecordingStatus> {
        self.call(
            Method::GET,
            &Self::session_path(session_id, "record/status"),
            None,
            Some(session_id),
            self.config.call_timeout,
        )
        .await
    }

    async fn get_actions(&self, session_id: &str, clear: bool) -> Result<Vec<RecordedAction>> {
        let path = format!(
            "{}?clear={}",
            Self::session_path(session_id, "record/actions"),
            clear
        );
        let response: ActionsResponse = self
            .call(
                Method::GET,
                &path,
                None,
                Some(session_id),
                self.config.call_timeout,
            )
            .await?;
        Ok(response.actions)
    }

    async fn validate_selector(
        &self,
        session_id: &str,
        selector: &str,
    ) -> Result<SelectorValidation> {
        self.call(
            Method::POST,
            &Self::session_path(session_id, "record/validate-selector"),
            Some(json!({ "selector": selector })),
            Some(session_id),
            self.config.call_timeout,
        )
        .await
    }

    async fn create_page(&self, session_id: &str, url: Option<&str>) -> Result<DriverPage> {
        self.call(
            Method::POST,
            &Self::session_path(session_id, "pages"),
            Some(json!({ "url": url })),
            Some(session_id),
            self.config.call_timeout,
        )
        .await
    }

    async fn get_pages(&self, session_id: &str) -> Result<PageList> {
        self.call(
            Method::GET,
            &Self::session_path(session_id, "pages"),
            None,
            Some(session_id),
            self.config.call_timeout,
        )
        .await
    }

    async fn activate_page(&self, session_id: &str, driver_page_id: &str) -> Result<()> {
        self.call_unit(
            Method::POST,
            &Self::session_path(session_id, &format!("pages/{}/activate", driver_page_id)),
            None,
            Some(session_id),
            self.config.call_timeout,
        )
        .await
    }

    async fn close_page(&self, session_id: &str, driver_page_id: &str) -> Result<()> {
        self.call_unit(
            Method::POST,
            &Self::session_path(session_id, &format!("pages/{}/close", driver_page_id)),
            None,
            Some(session_id),
            self.config.call_timeout,
        )
        .await
    }

    async fn health(&self) -> Result<DriverHealth> {
        self.call(
            Method::GET,
            "/health",
            None,
            None,
            Duration::from_secs(5),
        )
        .await
    }

    async fn collect_artifacts(&self, session_id: &str) -> Result<SessionArtifacts> {
        self.call(
            Method::GET,
            &Self::session_path(session_id, "artifacts"),
            None,
            Some(session_id),
            self.config.call_timeout,
        )
        .await
    }
}
