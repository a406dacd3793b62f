// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock driver for testing.
//!
//! Simulates sessions, pages and recordings in memory. Failures, delays and
//! extraction results are configurable per selector so callers can exercise
//! retry, branching and cancellation paths without a browser.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bas_dsl::{
    ClickAction, ExtractAction, KeyboardAction, NavigateAction, ScreenshotAction, ScrollAction,
    SelectAction, TypeAction, WaitAction,
};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::client::BrowserDriver;
use crate::error::{DriverError, Result};
use crate::types::*;

/// A 1x1 transparent PNG.
pub const MOCK_PNG: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44,
    0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F,
    0x15, 0xC4, 0x89, 0x00, 0x00, 0x00, 0x0A, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9C, 0x63, 0x00,
    0x01, 0x00, 0x00, 0x05, 0x00, 0x01, 0x0D, 0x0A, 0x2D, 0xB4, 0x00, 0x00, 0x00, 0x00, 0x49,
    0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82,
];

#[derive(Debug, Default)]
struct MockSession {
    url: String,
    recording_id: Option<String>,
    actions: Vec<RecordedAction>,
    pages: Vec<DriverPage>,
    active_page: Option<String>,
}

#[derive(Debug, Default)]
struct MockState {
    sessions: HashMap<String, MockSession>,
    /// Selectors whose actions always fail.
    failing_selectors: HashSet<String>,
    /// Selectors failing transiently this many more times.
    transient_failures: HashMap<String, u32>,
    /// Selectors whose actions panic inside the driver call.
    panicking_selectors: HashSet<String>,
    /// Selectors reported as present by `element_exists`.
    existing_elements: HashSet<String>,
    /// Extract results keyed by selector or script.
    extract_values: HashMap<String, Value>,
    artifacts: SessionArtifacts,
    unavailable: bool,
    action_delay: Duration,
    calls: Vec<String>,
}

/// In-memory [`BrowserDriver`].
#[derive(Clone, Default)]
pub struct MockDriver {
    state: Arc<Mutex<MockState>>,
    next_id: Arc<AtomicU64>,
}

impl MockDriver {
    /// Create a mock driver with no configured failures.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every action on `selector`.
    pub async fn fail_selector(&self, selector: &str) {
        self.state
            .lock()
            .await
            .failing_selectors
            .insert(selector.to_string());
    }

    /// Fail actions on `selector` with a transient error `times` times.
    pub async fn fail_selector_transiently(&self, selector: &str, times: u32) {
        self.state
            .lock()
            .await
            .transient_failures
            .insert(selector.to_string(), times);
    }

    /// Panic inside any action on `selector`.
    pub async fn panic_on_selector(&self, selector: &str) {
        self.state
            .lock()
            .await
            .panicking_selectors
            .insert(selector.to_string());
    }

    /// Make `element_exists(selector)` true.
    pub async fn add_element(&self, selector: &str) {
        self.state
            .lock()
            .await
            .existing_elements
            .insert(selector.to_string());
    }

    /// Value returned by extract calls on `key` (selector or script).
    pub async fn set_extract_value(&self, key: &str, value: Value) {
        self.state
            .lock()
            .await
            .extract_values
            .insert(key.to_string(), value);
    }

    /// Artifacts returned by `collect_artifacts`.
    pub async fn set_artifacts(&self, artifacts: SessionArtifacts) {
        self.state.lock().await.artifacts = artifacts;
    }

    /// Make every call fail with `Unavailable`.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().await.unavailable = unavailable;
    }

    /// Delay applied to every action call.
    pub async fn set_action_delay(&self, delay: Duration) {
        self.state.lock().await.action_delay = delay;
    }

    /// Simulate a user event captured by an active recording.
    pub async fn push_action(&self, session_id: &str, action: RecordedAction) {
        let mut state = self.state.lock().await;
        state
            .sessions
            .entry(session_id.to_string())
            .or_default()
            .actions
            .push(action);
    }

    /// Calls received so far, as `name:detail` strings.
    pub async fn calls(&self) -> Vec<String> {
        self.state.lock().await.calls.clone()
    }

    /// Number of sessions currently open.
    pub async fn open_sessions(&self) -> usize {
        self.state.lock().await.sessions.len()
    }

    fn mint(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Log a call and apply the global failure knobs.
    async fn enter(&self, call: String) -> Result<Duration> {
        let mut state = self.state.lock().await;
        state.calls.push(call);
        if state.unavailable {
            return Err(DriverError::Unavailable("connection refused".to_string()));
        }
        Ok(state.action_delay)
    }

    async fn selector_action(&self, session_id: &str, name: &str, selector: &str) -> Result<()> {
        let delay = self.enter(format!("{}:{}", name, selector)).await?;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().await;
        if !state.sessions.contains_key(session_id) {
            return Err(DriverError::SessionNotFound(session_id.to_string()));
        }
        if state.panicking_selectors.contains(selector) {
            drop(state);
            panic!("mock driver panicked on {}", selector);
        }
        if let Some(remaining) = state.transient_failures.get_mut(selector)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(DriverError::Unavailable(format!(
                "transient failure on {}",
                selector
            )));
        }
        if state.failing_selectors.contains(selector) {
            return Err(DriverError::Server {
                status: 400,
                message: format!("element not found: {}", selector),
            });
        }
        Ok(())
    }

    async fn with_session<T>(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut MockSession) -> Result<T>,
    ) -> Result<T> {
        let mut state = self.state.lock().await;
        match state.sessions.get_mut(session_id) {
            Some(session) => f(session),
            None => Err(DriverError::SessionNotFound(session_id.to_string())),
        }
    }
}

#[async_trait]
impl BrowserDriver for MockDriver {
    async fn create_session(&self, _options: &SessionOptions) -> Result<SessionInfo> {
        self.enter("create_session".to_string()).await?;
        let session_id = self.mint("session");
        self.open_session(&session_id).await;
        Ok(SessionInfo { session_id })
    }

    async fn close_session(&self, session_id: &str) -> Result<()> {
        self.enter(format!("close_session:{}", session_id)).await?;
        self.state.lock().await.sessions.remove(session_id);
        Ok(())
    }

    async fn navigate(
        &self,
        session_id: &str,
        action: &NavigateAction,
    ) -> Result<NavigationResult> {
        self.selector_action(session_id, "navigate", &action.url)
            .await?;
        let url = action.url.clone();
        self.with_session(session_id, |s| {
            s.url = url.clone();
            if let Some(active) = s.active_page.clone()
                && let Some(page) = s.pages.iter_mut().find(|p| p.driver_page_id == active)
            {
                page.url = url.clone();
            }
            Ok(NavigationResult {
                url,
                title: "Mock Page".to_string(),
            })
        })
        .await
    }

    async fn click(&self, session_id: &str, action: &ClickAction) -> Result<()> {
        self.selector_action(session_id, "click", &action.selector)
            .await
    }

    async fn type_text(&self, session_id: &str, action: &TypeAction) -> Result<()> {
        self.selector_action(session_id, "type", &action.selector)
            .await
    }

    async fn scroll(&self, session_id: &str, action: &ScrollAction) -> Result<()> {
        let target = action.selector.as_deref().unwrap_or("window");
        self.selector_action(session_id, "scroll", target).await
    }

    async fn select(&self, session_id: &str, action: &SelectAction) -> Result<()> {
        self.selector_action(session_id, "select", &action.selector)
            .await
    }

    async fn keyboard(&self, session_id: &str, action: &KeyboardAction) -> Result<()> {
        self.selector_action(session_id, "keyboard", &action.key)
            .await
    }

    async fn wait(&self, session_id: &str, action: &WaitAction) -> Result<()> {
        let target = action.selector.as_deref().unwrap_or("duration");
        self.selector_action(session_id, "wait", target).await
    }

    async fn element_exists(&self, session_id: &str, selector: &str) -> Result<bool> {
        self.enter(format!("element_exists:{}", selector)).await?;
        let state = self.state.lock().await;
        if !state.sessions.contains_key(session_id) {
            return Err(DriverError::SessionNotFound(session_id.to_string()));
        }
        Ok(state.existing_elements.contains(selector))
    }

    async fn extract(&self, session_id: &str, action: &ExtractAction) -> Result<ExtractResult> {
        let key = action
            .selector
            .clone()
            .or_else(|| action.script.clone())
            .unwrap_or_default();
        self.selector_action(session_id, "extract", &key).await?;
        let state = self.state.lock().await;
        Ok(ExtractResult {
            value: state.extract_values.get(&key).cloned().unwrap_or(Value::Null),
        })
    }

    async fn screenshot(&self, session_id: &str, action: &ScreenshotAction) -> Result<Screenshot> {
        let target = action.selector.as_deref().unwrap_or("page");
        self.selector_action(session_id, "screenshot", target)
            .await?;
        self.with_session(session_id, |s| {
            Ok(Screenshot {
                data: MOCK_PNG.to_vec(),
                url: Some(s.url.clone()),
            })
        })
        .await
    }

    async fn start_recording(
        &self,
        session_id: &str,
        _callback_url: Option<&str>,
    ) -> Result<RecordingStarted> {
        self.enter(format!("start_recording:{}", session_id))
            .await?;
        let recording_id = self.mint("rec");
        let mut state = self.state.lock().await;
        let session = state.sessions.entry(session_id.to_string()).or_default();
        if session.recording_id.is_some() {
            return Err(DriverError::RecordingInProgress(session_id.to_string()));
        }
        session.recording_id = Some(recording_id.clone());
        if session.pages.is_empty() {
            session.pages.push(DriverPage {
                driver_page_id: format!("{}-page-0", session_id),
                url: "about:blank".to_string(),
                ..Default::default()
            });
            session.active_page = Some(format!("{}-page-0", session_id));
        }
        Ok(RecordingStarted { recording_id })
    }

    async fn stop_recording(&self, session_id: &str) -> Result<RecordingStopped> {
        self.enter(format!("stop_recording:{}", session_id)).await?;
        self.with_session(session_id, |s| {
            Ok(RecordingStopped {
                recording_id: s.recording_id.take(),
                action_count: s.actions.len() as u32,
            })
        })
        .await
    }

    async fn recording_status(&self, session_id: &str) -> Result<RecordingStatus> {
        self.enter(format!("recording_status:{}", session_id))
            .await?;
        self.with_session(session_id, |s| {
            Ok(RecordingStatus {
                is_recording: s.recording_id.is_some(),
                recording_id: s.recording_id.clone(),
                action_count: s.actions.len() as u32,
                started_at: None,
            })
        })
        .await
    }

    async fn get_actions(&self, session_id: &str, clear: bool) -> Result<Vec<RecordedAction>> {
        self.enter(format!("get_actions:{}", session_id)).await?;
        self.with_session(session_id, |s| {
            if clear {
                Ok(std::mem::take(&mut s.actions))
            } else {
                Ok(s.actions.clone())
            }
        })
        .await
    }

    async fn validate_selector(
        &self,
        session_id: &str,
        selector: &str,
    ) -> Result<SelectorValidation> {
        self.enter(format!("validate_selector:{}", selector)).await?;
        let state = self.state.lock().await;
        if !state.sessions.contains_key(session_id) {
            return Err(DriverError::SessionNotFound(session_id.to_string()));
        }
        if selector.trim().is_empty() {
            return Ok(SelectorValidation {
                valid: false,
                match_count: 0,
                error: Some("selector is empty".to_string()),
            });
        }
        let found = state.existing_elements.contains(selector);
        Ok(SelectorValidation {
            valid: true,
            match_count: u32::from(found),
            error: None,
        })
    }

    async fn create_page(&self, session_id: &str, url: Option<&str>) -> Result<DriverPage> {
        self.enter(format!("create_page:{}", session_id)).await?;
        let driver_page_id = self.mint("page");
        let url = url.unwrap_or("about:blank").to_string();
        self.with_session(session_id, |s| {
            let page = DriverPage {
                driver_page_id: driver_page_id.clone(),
                url,
                title: String::new(),
                opener_id: s.active_page.clone(),
            };
            s.pages.push(page.clone());
            s.active_page = Some(driver_page_id);
            Ok(page)
        })
        .await
    }

    async fn get_pages(&self, session_id: &str) -> Result<PageList> {
        self.enter(format!("get_pages:{}", session_id)).await?;
        self.with_session(session_id, |s| {
            Ok(PageList {
                pages: s.pages.clone(),
                active_page_id: s.active_page.clone(),
            })
        })
        .await
    }

    async fn activate_page(&self, session_id: &str, driver_page_id: &str) -> Result<()> {
        self.enter(format!("activate_page:{}", driver_page_id))
            .await?;
        self.with_session(session_id, |s| {
            s.active_page = Some(driver_page_id.to_string());
            Ok(())
        })
        .await
    }

    async fn close_page(&self, session_id: &str, driver_page_id: &str) -> Result<()> {
        self.enter(format!("close_page:{}", driver_page_id)).await?;
        self.with_session(session_id, |s| {
            s.pages.retain(|p| p.driver_page_id != driver_page_id);
            if s.active_page.as_deref() == Some(driver_page_id) {
                s.active_page = s.pages.last().map(|p| p.driver_page_id.clone());
            }
            Ok(())
        })
        .await
    }

    async fn health(&self) -> Result<DriverHealth> {
        self.enter("health".to_string()).await?;
        let state = self.state.lock().await;
        Ok(DriverHealth {
            status: "ok".to_string(),
            version: Some("mock".to_string()),
            active_sessions: state.sessions.len() as u32,
        })
    }

    async fn collect_artifacts(&self, session_id: &str) -> Result<SessionArtifacts> {
        self.enter(format!("collect_artifacts:{}", session_id))
            .await?;
        Ok(self.state.lock().await.artifacts.clone())
    }
}

impl MockDriver {
    /// Register an externally created session (recordings start on sessions
    /// the studio did not create).
    pub async fn open_session(&self, session_id: &str) {
        self.state
            .lock()
            .await
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| MockSession {
                url: "about:blank".to_string(),
                ..Default::default()
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_transient_failures_run_out() {
        let driver = MockDriver::new();
        let session = driver
            .create_session(&SessionOptions::new(1280, 720))
            .await
            .unwrap();
        driver.fail_selector_transiently("#flaky", 2).await;

        let click = ClickAction {
            selector: "#flaky".to_string(),
            ..Default::default()
        };
        assert!(driver.click(&session.session_id, &click).await.is_err());
        assert!(driver.click(&session.session_id, &click).await.is_err());
        assert!(driver.click(&session.session_id, &click).await.is_ok());
    }

    #[tokio::test]
    async fn test_panic_knob_unwinds_the_caller() {
        let driver = std::sync::Arc::new(MockDriver::new());
        let session = driver
            .create_session(&SessionOptions::new(1280, 720))
            .await
            .unwrap();
        driver.panic_on_selector("#boom").await;

        let task = {
            let driver = driver.clone();
            tokio::spawn(async move {
                let click = ClickAction {
                    selector: "#boom".to_string(),
                    ..Default::default()
                };
                driver.click(&session.session_id, &click).await
            })
        };
        assert!(task.await.unwrap_err().is_panic());
        // The state lock is released before unwinding.
        assert_eq!(driver.calls().await.len(), 2);
    }

    #[tokio::test]
    async fn test_recording_conflict_and_actions() {
        let driver = MockDriver::new();
        driver.open_session("s").await;
        driver.start_recording("s", None).await.unwrap();
        assert_eq!(
            driver.start_recording("s", None).await.unwrap_err(),
            DriverError::RecordingInProgress("s".to_string())
        );

        driver
            .push_action(
                "s",
                RecordedAction {
                    action_type: "click".to_string(),
                    ..Default::default()
                },
            )
            .await;
        assert_eq!(driver.get_actions("s", true).await.unwrap().len(), 1);
        assert!(driver.get_actions("s", false).await.unwrap().is_empty());

        let stopped = driver.stop_recording("s").await.unwrap();
        assert!(stopped.recording_id.is_some());
        assert!(!driver.recording_status("s").await.unwrap().is_recording);
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let driver = MockDriver::new();
        let err = driver.recording_status("nope").await.unwrap_err();
        assert_eq!(err, DriverError::SessionNotFound("nope".to_string()));
    }

    #[tokio::test]
    async fn test_unavailable() {
        let driver = MockDriver::new();
        driver.set_unavailable(true).await;
        assert!(driver.health().await.unwrap_err().is_unavailable());
        assert_eq!(driver.calls().await, vec!["health".to_string()]);
    }
}
