// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Record Mode Service.
//!
//! Live recording sessions are kept in a process-local registry, one lock
//! per session. Each session owns a [`PageRegistry`] and the log of
//! captured actions. Page and action events are published to the telemetry
//! hub keyed by the session id, and a timeline sink collects them so the UI
//! can rebuild the session after a reconnect.
//!
//! ```text
//! start ──> (ingest actions / page events, user page ops) ──> stop ──> generate-workflow
//! ```

mod pages;
mod profiles;
mod synthesis;

pub use pages::{ClosedPage, PageError, PageRegistry, TrackedPage};
pub use profiles::{Profile, ProfileStore};
pub use synthesis::{ActionEdit, ActionRange, TYPE_LABEL_MAX_CHARS, select_actions, synthesize};

use std::collections::HashMap;
use std::sync::{Arc, PoisonError};

use bas_core::models::{ChangeSource, Workflow};
use bas_core::timeline::PageEventKind;
use bas_core::{EventType, SubscriptionFilter, TelemetryEvent, TelemetryHub};
use bas_driver::{BrowserDriver, RecordedAction, SelectorValidation, SessionOptions};
use bas_dsl::NavigateAction;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::{CreateWorkflowRequest, WorkflowCatalog};
use crate::error::{Error, Result};
use crate::execution::DEFAULT_VIEWPORT;

/// Upper bound of events kept per session timeline.
pub const MAX_TIMELINE_EVENTS: usize = 5_000;

/// Author recorded on workflows generated from a recording.
const GENERATED_BY: &str = "recording";

impl From<PageError> for Error {
    fn from(err: PageError) -> Self {
        match err {
            PageError::NotFound(id) => Error::not_found("page", id),
            PageError::InitialPage => Error::InvalidRequest(err.to_string()),
            PageError::Closed(_) => Error::Conflict(err.to_string()),
        }
    }
}

// ============================================================================
// Request / response types
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StartRecordingRequest {
    /// Existing driver session. A new session is created when absent.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Page to open once recording has started.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub profile_id: Option<Uuid>,
    /// Driver-side callback for streamed actions and page events.
    #[serde(default)]
    pub callback_url: Option<String>,
    #[serde(default)]
    pub viewport_width: Option<u32>,
    #[serde(default)]
    pub viewport_height: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StartedRecording {
    pub session_id: String,
    pub recording_id: String,
    pub initial_page_id: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoppedRecording {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recording_id: Option<String>,
    pub action_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordingStatusView {
    pub session_id: String,
    pub is_recording: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recording_id: Option<String>,
    pub action_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_page_id: Option<String>,
    pub page_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_id: Option<Uuid>,
}

/// Page lifecycle notification sent by the driver.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PageEventRequest {
    pub kind: PageEventKind,
    pub driver_page_id: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub opener_driver_page_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreatePageRequest {
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GenerateWorkflowRequest {
    pub name: String,
    #[serde(default)]
    pub project_id: Option<Uuid>,
    #[serde(default)]
    pub folder_path: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub range: Option<ActionRange>,
    #[serde(default)]
    pub edits: Vec<ActionEdit>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GeneratedWorkflow {
    pub workflow: Workflow,
    pub node_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PageListView {
    pub pages: Vec<TrackedPage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_page_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordingTimeline {
    pub session_id: String,
    pub pages: Vec<TrackedPage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_page_id: Option<String>,
    pub events: Vec<TelemetryEvent>,
}

// ============================================================================
// Service
// ============================================================================

struct RecordingSession {
    session_id: String,
    recording_id: Option<String>,
    profile_id: Option<Uuid>,
    pages: PageRegistry,
    actions: Vec<RecordedAction>,
    started_at: Option<DateTime<Utc>>,
    /// The driver session was created by this service.
    owned: bool,
}

type Timelines = Arc<std::sync::Mutex<HashMap<String, Vec<TelemetryEvent>>>>;

struct Inner {
    driver: Arc<dyn BrowserDriver>,
    hub: Arc<TelemetryHub>,
    catalog: Arc<WorkflowCatalog>,
    profiles: ProfileStore,
    browserless_url: Option<String>,
    sessions: RwLock<HashMap<String, Arc<Mutex<RecordingSession>>>>,
    timelines: Timelines,
    sink_id: u64,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.sink_id);
    }
}

/// Record Mode Service. Cheap to clone.
#[derive(Clone)]
pub struct RecordingService {
    inner: Arc<Inner>,
}

impl RecordingService {
    pub fn new(
        driver: Arc<dyn BrowserDriver>,
        hub: Arc<TelemetryHub>,
        catalog: Arc<WorkflowCatalog>,
        profiles: ProfileStore,
    ) -> Self {
        let timelines: Timelines = Arc::default();
        let sink_timelines = timelines.clone();
        let sink_id = hub.subscribe_sink(
            SubscriptionFilter::All,
            Arc::new(move |event: &TelemetryEvent| record_timeline_event(&sink_timelines, event)),
        );
        Self {
            inner: Arc::new(Inner {
                driver,
                hub,
                catalog,
                profiles,
                browserless_url: None,
                sessions: RwLock::new(HashMap::new()),
                timelines,
                sink_id,
            }),
        }
    }

    /// Forward a browser farm endpoint to sessions created here.
    ///
    /// Only effective before the service is cloned.
    pub fn with_browserless_url(mut self, url: Option<String>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.browserless_url = url;
        }
        self
    }

    pub fn profiles(&self) -> &ProfileStore {
        &self.inner.profiles
    }

    async fn session(&self, session_id: &str) -> Result<Arc<Mutex<RecordingSession>>> {
        self.inner
            .sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))
    }

    fn publish(&self, event_type: EventType, session_id: &str, payload: Value) {
        self.inner
            .hub
            .emit(event_type, Some(session_id.to_string()), payload);
    }

    // ------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------

    pub async fn start(&self, req: StartRecordingRequest) -> Result<StartedRecording> {
        let driver = &self.inner.driver;
        let mut existing = None;
        let (session_id, owned) = match req.session_id.filter(|id| !id.trim().is_empty()) {
            Some(id) => {
                if let Ok(session) = self.session(&id).await {
                    let guard = session.lock().await;
                    if guard.recording_id.is_some() {
                        return Err(Error::RecordingInProgress(id));
                    }
                    let owned = guard.owned;
                    drop(guard);
                    existing = Some(session);
                    (id, owned)
                } else {
                    (id, false)
                }
            }
            None => {
                let storage_state = match req.profile_id {
                    Some(profile_id) => self.inner.profiles.get(profile_id).await?.storage_state,
                    None => None,
                };
                let mut options = SessionOptions::new(
                    req.viewport_width.unwrap_or(DEFAULT_VIEWPORT.0),
                    req.viewport_height.unwrap_or(DEFAULT_VIEWPORT.1),
                );
                options.storage_state = storage_state;
                options.browserless_url = self.inner.browserless_url.clone();
                (driver.create_session(&options).await?.session_id, true)
            }
        };

        let started = match driver
            .start_recording(&session_id, req.callback_url.as_deref())
            .await
        {
            Ok(started) => started,
            Err(e) => {
                if owned
                    && existing.is_none()
                    && let Err(close_err) = driver.close_session(&session_id).await
                {
                    warn!(session_id = %session_id, error = %close_err, "Failed to close session (non-fatal)");
                }
                return Err(e.into());
            }
        };

        let started_at = Utc::now();
        self.open_timeline(&session_id);
        let (session, initial) = match existing {
            // A restarted session keeps its page history; the action log starts over.
            Some(session) => {
                let mut guard = session.lock().await;
                let active = guard.pages.active().cloned();
                let initial = match active {
                    Some(page) => page,
                    None => self.register_initial_page(&session_id, &mut guard.pages).await,
                };
                guard.recording_id = Some(started.recording_id.clone());
                guard.started_at = Some(started_at);
                if req.profile_id.is_some() {
                    guard.profile_id = req.profile_id;
                }
                guard.actions.clear();
                drop(guard);
                (session, initial)
            }
            None => {
                let mut pages = PageRegistry::new();
                let initial = self.register_initial_page(&session_id, &mut pages).await;
                let session = Arc::new(Mutex::new(RecordingSession {
                    session_id: session_id.clone(),
                    recording_id: Some(started.recording_id.clone()),
                    profile_id: req.profile_id,
                    pages,
                    actions: Vec::new(),
                    started_at: Some(started_at),
                    owned,
                }));
                self.inner
                    .sessions
                    .write()
                    .await
                    .insert(session_id.clone(), session.clone());
                self.publish(
                    EventType::PageCreated,
                    &session_id,
                    page_payload(&initial),
                );
                (session, initial)
            }
        };

        if let Some(url) = req.url.filter(|u| !u.trim().is_empty()) {
            let nav = NavigateAction {
                url,
                ..Default::default()
            };
            match driver.navigate(&session_id, &nav).await {
                Ok(result) => {
                    let mut guard = session.lock().await;
                    let title = (!result.title.is_empty()).then_some(result.title.as_str());
                    if let Some(page) =
                        guard.pages.navigated(&initial.driver_page_id, &result.url, title)
                    {
                        drop(guard);
                        self.publish(EventType::PageNavigated, &session_id, page_payload(&page));
                    }
                }
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "Initial navigation failed (non-fatal)")
                }
            }
        }

        info!(
            session_id = %session_id,
            recording_id = %started.recording_id,
            owned,
            "Recording started"
        );
        Ok(StartedRecording {
            session_id,
            recording_id: started.recording_id,
            initial_page_id: initial.page_id,
            started_at,
        })
    }

    /// Register the driver's current page (or a placeholder) as the initial page.
    async fn register_initial_page(&self, session_id: &str, pages: &mut PageRegistry) -> TrackedPage {
        let listed = match self.inner.driver.get_pages(session_id).await {
            Ok(list) => {
                let driver_page = list
                    .active_page_id
                    .as_deref()
                    .and_then(|id| list.pages.iter().find(|p| p.driver_page_id == id))
                    .or_else(|| list.pages.first());
                driver_page.map(|p| pages.register_initial(&p.driver_page_id, &p.url))
            }
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Failed to list pages at recording start (non-fatal)");
                None
            }
        };
        listed.unwrap_or_else(|| {
            pages.register_initial(&format!("{}-initial", session_id), "about:blank")
        })
    }

    pub async fn stop(&self, session_id: &str) -> Result<StoppedRecording> {
        let session = self.session(session_id).await?;
        let stopped = self.inner.driver.stop_recording(session_id).await?;
        let drained = self.drain_driver_actions(session_id).await;

        let mut guard = session.lock().await;
        self.append_actions(&mut guard, drained);
        let recording_id = guard.recording_id.take().or(stopped.recording_id);
        let action_count = guard.actions.len();
        info!(session_id = %session_id, action_count, "Recording stopped");
        Ok(StoppedRecording {
            session_id: session_id.to_string(),
            recording_id,
            action_count,
        })
    }

    pub async fn status(&self, session_id: &str) -> Result<RecordingStatusView> {
        let session = self.session(session_id).await?;
        let driver_status = match self.inner.driver.recording_status(session_id).await {
            Ok(status) => Some(status),
            Err(e) => {
                debug!(session_id = %session_id, error = %e, "Driver recording status unavailable");
                None
            }
        };
        let guard = session.lock().await;
        let is_recording = driver_status
            .as_ref()
            .map(|s| s.is_recording)
            .unwrap_or(guard.recording_id.is_some());
        let driver_count = driver_status.map(|s| s.action_count as usize).unwrap_or(0);
        Ok(RecordingStatusView {
            session_id: guard.session_id.clone(),
            is_recording,
            recording_id: guard.recording_id.clone(),
            action_count: guard.actions.len().max(driver_count),
            started_at: guard.started_at,
            active_page_id: guard.pages.active_page_id(),
            page_count: guard.pages.open_pages().len(),
            profile_id: guard.profile_id,
        })
    }

    /// Forget a session, closing its driver session when this service created it.
    pub async fn close_session(&self, session_id: &str) -> Result<()> {
        let session = self
            .inner
            .sessions
            .write()
            .await
            .remove(session_id)
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
        let guard = session.lock().await;
        if guard.recording_id.is_some()
            && let Err(e) = self.inner.driver.stop_recording(session_id).await
        {
            warn!(session_id = %session_id, error = %e, "Failed to stop recording (non-fatal)");
        }
        if guard.owned
            && let Err(e) = self.inner.driver.close_session(session_id).await
        {
            warn!(session_id = %session_id, error = %e, "Failed to close driver session (non-fatal)");
        }
        self.close_timeline(session_id);
        info!(session_id = %session_id, "Recording session closed");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Actions
    // ------------------------------------------------------------------

    /// Captured actions, pulling any the driver still buffers.
    pub async fn fetch_actions(&self, session_id: &str, clear: bool) -> Result<Vec<RecordedAction>> {
        let session = self.session(session_id).await?;
        let drained = self.drain_driver_actions(session_id).await;
        let mut guard = session.lock().await;
        self.append_actions(&mut guard, drained);
        if clear {
            Ok(std::mem::take(&mut guard.actions))
        } else {
            Ok(guard.actions.clone())
        }
    }

    /// Append an action streamed by the driver callback.
    pub async fn ingest_action(&self, session_id: &str, action: RecordedAction) -> Result<()> {
        let session = self.session(session_id).await?;
        let mut guard = session.lock().await;
        self.append_actions(&mut guard, vec![action]);
        Ok(())
    }

    pub async fn validate_selector(
        &self,
        session_id: &str,
        selector: &str,
    ) -> Result<SelectorValidation> {
        self.session(session_id).await?;
        if selector.trim().is_empty() {
            return Err(Error::MissingField("selector"));
        }
        Ok(self
            .inner
            .driver
            .validate_selector(session_id, selector)
            .await?)
    }

    async fn drain_driver_actions(&self, session_id: &str) -> Vec<RecordedAction> {
        match self.inner.driver.get_actions(session_id, true).await {
            Ok(actions) => actions,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Failed to fetch driver actions (non-fatal)");
                Vec::new()
            }
        }
    }

    fn append_actions(&self, session: &mut RecordingSession, actions: Vec<RecordedAction>) {
        for mut action in actions {
            // Driver page ids are rewritten to local page ids.
            if let Some(page) = action
                .page_id
                .as_deref()
                .and_then(|id| session.pages.by_driver_id(id))
            {
                action.page_id = Some(page.page_id.clone());
            }
            self.publish(
                EventType::RecordingAction,
                &session.session_id,
                json!({ "index": session.actions.len(), "action": action }),
            );
            session.actions.push(action);
        }
    }

    // ------------------------------------------------------------------
    // Pages
    // ------------------------------------------------------------------

    pub async fn list_pages(&self, session_id: &str) -> Result<PageListView> {
        let session = self.session(session_id).await?;
        let guard = session.lock().await;
        Ok(PageListView {
            pages: guard.pages.open_pages(),
            active_page_id: guard.pages.active_page_id(),
        })
    }

    /// Open a page and switch to it.
    pub async fn create_page(&self, session_id: &str, url: Option<&str>) -> Result<TrackedPage> {
        let session = self.session(session_id).await?;
        let created = self.inner.driver.create_page(session_id, url).await?;

        let mut guard = session.lock().await;
        let previous = guard.pages.active_page_id();
        let page = guard.pages.register_created(
            &created.driver_page_id,
            &created.url,
            created.opener_id.as_deref(),
        );
        let page = guard.pages.activate(&page.page_id)?;
        drop(guard);

        self.publish(EventType::PageCreated, session_id, page_payload(&page));
        self.publish(
            EventType::PageSwitched,
            session_id,
            json!({ "page_id": page.page_id, "previous_page_id": previous }),
        );
        Ok(page)
    }

    pub async fn activate_page(&self, session_id: &str, page_id: &str) -> Result<TrackedPage> {
        let session = self.session(session_id).await?;
        let (driver_page_id, previous) = {
            let guard = session.lock().await;
            let page = guard.pages.get(page_id)?;
            if page.is_closed {
                return Err(PageError::Closed(page_id.to_string()).into());
            }
            (page.driver_page_id.clone(), guard.pages.active_page_id())
        };
        self.inner
            .driver
            .activate_page(session_id, &driver_page_id)
            .await?;

        let page = session.lock().await.pages.activate(page_id)?;
        if previous.as_deref() != Some(page_id) {
            self.publish(
                EventType::PageSwitched,
                session_id,
                json!({ "page_id": page.page_id, "previous_page_id": previous }),
            );
        }
        Ok(page)
    }

    /// Close a page on behalf of the user. The initial page is protected.
    pub async fn close_page(&self, session_id: &str, page_id: &str) -> Result<PageListView> {
        let session = self.session(session_id).await?;
        let driver_page_id = {
            let guard = session.lock().await;
            let page = guard.pages.get(page_id)?;
            if page.is_closed {
                return Err(PageError::Closed(page_id.to_string()).into());
            }
            if page.is_initial {
                return Err(PageError::InitialPage.into());
            }
            page.driver_page_id.clone()
        };
        self.inner
            .driver
            .close_page(session_id, &driver_page_id)
            .await?;

        let mut guard = session.lock().await;
        let closed = guard.pages.close(page_id, true)?;
        let view = PageListView {
            pages: guard.pages.open_pages(),
            active_page_id: guard.pages.active_page_id(),
        };
        drop(guard);
        self.publish_closed(session_id, &closed);
        Ok(view)
    }

    /// Apply a page lifecycle event reported by the driver.
    pub async fn ingest_page_event(
        &self,
        session_id: &str,
        event: PageEventRequest,
    ) -> Result<Option<TrackedPage>> {
        let session = self.session(session_id).await?;
        let url = event.url.as_deref().unwrap_or("about:blank");
        let mut guard = session.lock().await;
        match event.kind {
            PageEventKind::Initial => {
                let page = guard.pages.register_initial(&event.driver_page_id, url);
                drop(guard);
                self.publish(EventType::PageCreated, session_id, page_payload(&page));
                Ok(Some(page))
            }
            PageEventKind::Created => {
                let known = guard.pages.by_driver_id(&event.driver_page_id).is_some();
                let page = guard.pages.register_created(
                    &event.driver_page_id,
                    url,
                    event.opener_driver_page_id.as_deref(),
                );
                drop(guard);
                if !known {
                    self.publish(EventType::PageCreated, session_id, page_payload(&page));
                }
                Ok(Some(page))
            }
            PageEventKind::Navigated => {
                let page =
                    guard
                        .pages
                        .navigated(&event.driver_page_id, url, event.title.as_deref());
                drop(guard);
                if let Some(page) = &page {
                    self.publish(EventType::PageNavigated, session_id, page_payload(page));
                }
                Ok(page)
            }
            PageEventKind::Closed => {
                let closed = guard.pages.close_by_driver_id(&event.driver_page_id)?;
                drop(guard);
                self.publish_closed(session_id, &closed);
                Ok(Some(closed.page))
            }
            PageEventKind::Switched => Err(Error::InvalidRequest(
                "page event kind must be one of initial, created, navigated, closed".to_string(),
            )),
        }
    }

    fn publish_closed(&self, session_id: &str, closed: &ClosedPage) {
        self.publish(
            EventType::PageClosed,
            session_id,
            json!({ "page_id": closed.page.page_id, "driver_page_id": closed.page.driver_page_id }),
        );
        if let Some(next) = &closed.switched_to {
            self.publish(
                EventType::PageSwitched,
                session_id,
                json!({ "page_id": next.page_id, "previous_page_id": closed.page.page_id }),
            );
        }
    }

    // ------------------------------------------------------------------
    // Workflow generation
    // ------------------------------------------------------------------

    /// Turn the captured actions into a persisted workflow.
    pub async fn generate_workflow(
        &self,
        session_id: &str,
        req: GenerateWorkflowRequest,
    ) -> Result<GeneratedWorkflow> {
        let actions = self.fetch_actions(session_id, false).await?;
        if let Some(range) = req.range
            && (range.start > range.end || range.start >= actions.len().max(1))
        {
            return Err(Error::InvalidRequest(format!(
                "action range {}..={} is outside the {} captured actions",
                range.start,
                range.end,
                actions.len()
            )));
        }
        let selected = select_actions(&actions, req.range, &req.edits);
        if selected.is_empty() {
            return Err(Error::InvalidRequest(
                "no recorded actions to convert".to_string(),
            ));
        }
        let flow = synthesize(&selected);
        let node_count = flow.nodes.len();
        let create = CreateWorkflowRequest {
            project_id: req.project_id,
            name: req.name,
            folder_path: req.folder_path,
            description: req.description,
            flow_definition: serde_json::to_value(&flow)?,
            ..Default::default()
        };
        let workflow = self
            .inner
            .catalog
            .create_workflow(create, ChangeSource::Recording, GENERATED_BY)
            .await?;
        info!(
            session_id = %session_id,
            workflow_id = %workflow.id,
            node_count,
            "Workflow generated from recording"
        );
        Ok(GeneratedWorkflow {
            workflow,
            node_count,
        })
    }

    // ------------------------------------------------------------------
    // Timeline
    // ------------------------------------------------------------------

    fn open_timeline(&self, session_id: &str) {
        let mut timelines = self
            .inner
            .timelines
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        timelines.entry(session_id.to_string()).or_default();
    }

    fn close_timeline(&self, session_id: &str) {
        self.inner
            .timelines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id);
    }

    pub async fn timeline(&self, session_id: &str) -> Result<RecordingTimeline> {
        let session = self.session(session_id).await?;
        let (pages, active_page_id) = {
            let guard = session.lock().await;
            (guard.pages.all_pages().to_vec(), guard.pages.active_page_id())
        };
        let events = self
            .inner
            .timelines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
            .unwrap_or_default();
        Ok(RecordingTimeline {
            session_id: session_id.to_string(),
            pages,
            active_page_id,
            events,
        })
    }

    // ------------------------------------------------------------------
    // Profiles
    // ------------------------------------------------------------------

    /// Delete a profile and detach it from live sessions.
    pub async fn delete_profile(&self, profile_id: Uuid) -> Result<()> {
        self.inner.profiles.delete(profile_id).await?;
        let sessions: Vec<_> = self.inner.sessions.read().await.values().cloned().collect();
        for session in sessions {
            let mut guard = session.lock().await;
            if guard.profile_id == Some(profile_id) {
                guard.profile_id = None;
                debug!(session_id = %guard.session_id, profile_id = %profile_id, "Profile detached from session");
            }
        }
        Ok(())
    }

    pub async fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.inner.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

fn page_payload(page: &TrackedPage) -> Value {
    json!({
        "page_id": page.page_id,
        "driver_page_id": page.driver_page_id,
        "url": page.url,
        "title": page.title,
        "opener_page_id": page.opener_page_id,
        "is_initial": page.is_initial,
    })
}

fn record_timeline_event(timelines: &Timelines, event: &TelemetryEvent) {
    if !matches!(
        event.event_type,
        EventType::PageCreated
            | EventType::PageNavigated
            | EventType::PageClosed
            | EventType::PageSwitched
            | EventType::RecordingAction
    ) {
        return;
    }
    let Some(key) = event.execution_id.as_deref() else {
        return;
    };
    let mut timelines = timelines.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(events) = timelines.get_mut(key) {
        if events.len() >= MAX_TIMELINE_EVENTS {
            events.remove(0);
        }
        events.push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bas_core::SqliteIndexStore;
    use bas_driver::{MockDriver, SelectorSet};
    use bas_dsl::{Action, FlowDefinition};

    async fn service() -> (RecordingService, Arc<MockDriver>, Arc<TelemetryHub>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteIndexStore::in_memory().await.unwrap());
        let catalog = Arc::new(WorkflowCatalog::new(store, dir.path().join("projects")));
        let driver = Arc::new(MockDriver::new());
        let hub = Arc::new(TelemetryHub::new());
        let service = RecordingService::new(
            driver.clone(),
            hub.clone(),
            catalog,
            ProfileStore::new(dir.path().join("profiles")),
        );
        (service, driver, hub, dir)
    }

    fn click(selector: &str) -> RecordedAction {
        RecordedAction {
            action_type: "click".to_string(),
            selector: Some(SelectorSet {
                primary: selector.to_string(),
                candidates: vec![],
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_start_registers_initial_page() {
        let (service, _driver, _hub, _dir) = service().await;
        let started = service.start(StartRecordingRequest::default()).await.unwrap();

        let status = service.status(&started.session_id).await.unwrap();
        assert!(status.is_recording);
        assert_eq!(status.page_count, 1);
        assert_eq!(status.active_page_id, Some(started.initial_page_id.clone()));

        let err = service
            .start(StartRecordingRequest {
                session_id: Some(started.session_id.clone()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RecordingInProgress(_)));
    }

    #[tokio::test]
    async fn test_restart_keeps_page_history() {
        let (service, _driver, _hub, _dir) = service().await;
        let started = service.start(StartRecordingRequest::default()).await.unwrap();
        let sid = started.session_id.as_str();

        let second = service.create_page(sid, Some("https://example.com")).await.unwrap();
        service.close_page(sid, &second.page_id).await.unwrap();
        service.ingest_action(sid, click("#old")).await.unwrap();
        service.stop(sid).await.unwrap();

        let restarted = service
            .start(StartRecordingRequest {
                session_id: Some(sid.to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(restarted.initial_page_id, started.initial_page_id);

        let timeline = service.timeline(sid).await.unwrap();
        assert_eq!(timeline.pages.len(), 2);
        assert!(timeline.pages.iter().any(|p| p.page_id == second.page_id && p.is_closed));
        assert!(timeline.events.iter().any(|e| e.event_type == EventType::PageClosed));

        let status = service.status(sid).await.unwrap();
        assert!(status.is_recording);
        assert_eq!(status.action_count, 0);
        assert_eq!(status.active_page_id, Some(started.initial_page_id));
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let (service, _driver, _hub, _dir) = service().await;
        assert!(matches!(
            service.status("missing").await,
            Err(Error::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_page_ops_keep_single_active_page() {
        let (service, _driver, _hub, _dir) = service().await;
        let started = service.start(StartRecordingRequest::default()).await.unwrap();
        let sid = started.session_id.as_str();

        let second = service.create_page(sid, Some("https://example.com")).await.unwrap();
        let pages = service.list_pages(sid).await.unwrap();
        assert_eq!(pages.pages.len(), 2);
        assert_eq!(pages.active_page_id, Some(second.page_id.clone()));

        let err = service
            .close_page(sid, &started.initial_page_id)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));

        let view = service.close_page(sid, &second.page_id).await.unwrap();
        assert_eq!(view.pages.len(), 1);
        assert_eq!(view.active_page_id, Some(started.initial_page_id.clone()));

        let timeline = service.timeline(sid).await.unwrap();
        let kinds: Vec<_> = timeline.events.iter().map(|e| e.event_type).collect();
        assert_eq!(
            kinds,
            vec![
                EventType::PageCreated,
                EventType::PageCreated,
                EventType::PageSwitched,
                EventType::PageClosed,
                EventType::PageSwitched,
            ]
        );
    }

    #[tokio::test]
    async fn test_ingested_created_page_is_not_activated() {
        let (service, _driver, _hub, _dir) = service().await;
        let started = service.start(StartRecordingRequest::default()).await.unwrap();
        let sid = started.session_id.as_str();

        let opener = service.list_pages(sid).await.unwrap().pages[0].driver_page_id.clone();
        let popup = service
            .ingest_page_event(
                sid,
                PageEventRequest {
                    kind: PageEventKind::Created,
                    driver_page_id: "popup-1".to_string(),
                    url: Some("https://example.com/popup".to_string()),
                    title: None,
                    opener_driver_page_id: Some(opener),
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            popup.opener_page_id.as_deref(),
            Some(started.initial_page_id.as_str())
        );
        let pages = service.list_pages(sid).await.unwrap();
        assert_eq!(pages.active_page_id, Some(started.initial_page_id));
    }

    #[tokio::test]
    async fn test_generate_workflow_from_actions() {
        let (service, driver, _hub, _dir) = service().await;
        let started = service.start(StartRecordingRequest::default()).await.unwrap();
        let sid = started.session_id.as_str();

        driver.push_action(sid, click("#a")).await;
        assert_eq!(service.fetch_actions(sid, false).await.unwrap().len(), 1);
        service.ingest_action(sid, click("#b")).await.unwrap();
        service.ingest_action(sid, click("#c")).await.unwrap();
        let stopped = service.stop(sid).await.unwrap();
        assert_eq!(stopped.action_count, 3);

        let generated = service
            .generate_workflow(
                sid,
                GenerateWorkflowRequest {
                    name: "Recorded flow".to_string(),
                    edits: vec![ActionEdit {
                        index: 0,
                        remove: true,
                        ..Default::default()
                    }],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(generated.node_count, 2);

        let flow: FlowDefinition = generated.workflow.flow_definition.clone();
        assert_eq!(flow.edges.len(), 1);
        assert!(matches!(&flow.nodes[0].action, Action::Click(c) if c.selector == "#b"));
        assert_eq!(generated.workflow.name, "Recorded flow");
    }

    #[tokio::test]
    async fn test_generate_rejects_empty_log() {
        let (service, _driver, _hub, _dir) = service().await;
        let started = service.start(StartRecordingRequest::default()).await.unwrap();
        let err = service
            .generate_workflow(
                &started.session_id,
                GenerateWorkflowRequest {
                    name: "empty".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_delete_profile_detaches_sessions() {
        let (service, _driver, _hub, _dir) = service().await;
        let profile = service.profiles().create("shop login").await.unwrap();
        let started = service
            .start(StartRecordingRequest {
                profile_id: Some(profile.id),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(
            service.status(&started.session_id).await.unwrap().profile_id,
            Some(profile.id)
        );

        service.delete_profile(profile.id).await.unwrap();
        assert_eq!(
            service.status(&started.session_id).await.unwrap().profile_id,
            None
        );
    }
}
