// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-execution run loop.
//!
//! [`RunState`] is an explicit state machine: every call to
//! [`RunState::step`] runs at most one node. Control signals (pause, cancel)
//! are observed between nodes and after a driver call returns.
//!
//! The timeline file is rewritten after every frame so a resumed run can
//! replay exactly what completed.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bas_core::models::ExecutionStatus;
use bas_core::telemetry::EventType;
use bas_core::timeline::{
    ExecutionSummary, HAR_FILE, SCREENSHOTS_DIR, TRACE_FILE, VIDEO_FILE,
};
use bas_core::{
    ArtifactGateway, ArtifactKind, ExecutionTimeline, Frame, FrameStatus, IndexStore, LogEntry,
    TelemetryHub,
};
use bas_driver::{BrowserDriver, DriverError, SessionOptions};
use bas_dsl::template::{lookup_path, resolve_action};
use bas_dsl::validation::MAX_STEP_RETRIES;
use bas_dsl::{
    Action, Condition, FlowCursor, FlowDefinition, FlowGraph, FlowSettings, LoopAction,
    NavigateAction, ScreenshotAction, StepOutcome,
};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use rand::Rng;
use serde_json::{Map, Value, json};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Default viewport when a flow does not set one.
pub const DEFAULT_VIEWPORT: (u32, u32) = (1280, 720);

/// Default base backoff between step retries.
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 500;

/// Progress never reaches 100 before the execution completes.
const MAX_RUNNING_PROGRESS: i64 = 99;

/// Control signal for a live run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunSignal {
    Run,
    Pause,
    Cancel,
}

/// Shared collaborators of every run.
#[derive(Clone)]
pub(crate) struct RunDeps {
    pub store: Arc<dyn IndexStore>,
    pub driver: Arc<dyn BrowserDriver>,
    pub artifacts: Arc<ArtifactGateway>,
    pub hub: Arc<TelemetryHub>,
    pub browserless_url: Option<String>,
}

/// Everything a run needs to start.
pub(crate) struct RunPlan {
    pub execution_id: Uuid,
    pub definition: FlowDefinition,
    pub vars: Map<String, Value>,
    pub result_path: PathBuf,
    /// Frames of an earlier attempt to replay before running new nodes.
    pub replay: Vec<Frame>,
    pub resume_url: Option<String>,
}

/// Result of one [`RunState::step`].
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StepResult {
    Continue,
    Finished,
    Failed(String),
    Cancelled,
}

/// What a driver call produced.
#[derive(Debug, Default)]
struct Performed {
    outcome: Option<StepOutcome>,
    extracted: Option<Value>,
    screenshot: Option<Vec<u8>>,
    url: Option<String>,
}

// ============================================================================
// RunState
// ============================================================================

pub(crate) struct RunState {
    deps: RunDeps,
    execution_id: Uuid,
    graph: FlowGraph,
    cursor: FlowCursor,
    settings: FlowSettings,
    vars: Map<String, Value>,
    session_id: String,
    result_path: PathBuf,
    timeline: ExecutionTimeline,
    visited: HashSet<usize>,
    loop_items: HashMap<usize, Vec<Value>>,
    current_url: Option<String>,
    control: watch::Receiver<RunSignal>,
}

impl RunState {
    fn new(
        deps: RunDeps,
        plan: &RunPlan,
        graph: FlowGraph,
        session_id: String,
        control: watch::Receiver<RunSignal>,
    ) -> Self {
        let cursor = FlowCursor::new(&graph);
        Self {
            deps,
            execution_id: plan.execution_id,
            graph,
            cursor,
            settings: plan.definition.settings.clone(),
            vars: plan.vars.clone(),
            session_id,
            result_path: plan.result_path.clone(),
            timeline: ExecutionTimeline::new(plan.execution_id),
            visited: HashSet::new(),
            loop_items: HashMap::new(),
            current_url: None,
            control,
        }
    }

    fn exec_id(&self) -> Option<String> {
        Some(self.execution_id.to_string())
    }

    fn next_step_index(&self) -> u32 {
        self.timeline.entries.len() as u32
    }

    /// Replay frames of an earlier attempt without touching the browser.
    ///
    /// Stops at the first frame whose node no longer matches the graph walk.
    fn replay(&mut self, frames: &[Frame]) -> usize {
        let mut replayed = 0;
        for frame in frames {
            let snapshot = self.cursor.clone();
            let Some(index) = self.cursor.next(&self.graph) else {
                break;
            };
            let node = self.graph.node(index).clone();
            if node.id != frame.node_id {
                warn!(
                    execution_id = %self.execution_id,
                    expected = %frame.node_id,
                    found = %node.id,
                    "Replay diverged from the graph, continuing live"
                );
                self.cursor = snapshot;
                break;
            }
            self.bind_loop_items();

            let outcome = match &node.action {
                Action::Conditional(_) => StepOutcome::Branch(frame.branch.unwrap_or(false)),
                Action::Loop(l) => {
                    let planned = self.plan_loop(index, l);
                    StepOutcome::Iterations(frame.iterations.unwrap_or(planned))
                }
                Action::Extract(e) => {
                    if let (Some(name), Some(data)) = (&e.store_as, &frame.extracted_data) {
                        self.vars.insert(name.clone(), data.clone());
                    }
                    StepOutcome::Done
                }
                _ => StepOutcome::Done,
            };
            if frame.url.is_some() {
                self.current_url = frame.url.clone();
            }

            let mut copy = frame.clone();
            copy.step_index = self.next_step_index();
            self.timeline.entries.push(copy);
            self.visited.insert(index);
            self.cursor.complete(&self.graph, index, outcome);
            replayed += 1;
        }
        if replayed > 0 {
            self.timeline.logs.push(LogEntry::info(
                format!("Replayed {} completed step(s)", replayed),
                None,
            ));
        }
        replayed
    }

    /// Wait out a pause; returns `false` when the run must stop.
    async fn observe_signal(&mut self) -> bool {
        let signal = *self.control.borrow();
        match signal {
            RunSignal::Run => true,
            RunSignal::Cancel => false,
            RunSignal::Pause => {
                self.set_status(ExecutionStatus::Paused, None).await;
                info!(execution_id = %self.execution_id, "Execution paused");
                let resumed = match self.control.wait_for(|s| *s != RunSignal::Pause).await {
                    Ok(s) => *s == RunSignal::Run,
                    Err(_) => false,
                };
                if resumed {
                    self.set_status(ExecutionStatus::Running, None).await;
                    info!(execution_id = %self.execution_id, "Execution resumed");
                }
                resumed
            }
        }
    }

    fn is_cancelled(&self) -> bool {
        *self.control.borrow() == RunSignal::Cancel
    }

    async fn set_status(&self, status: ExecutionStatus, error: Option<&str>) {
        if let Err(e) = self
            .deps
            .store
            .transition_execution(self.execution_id, status, error)
            .await
        {
            warn!(execution_id = %self.execution_id, error = %e, "Status transition rejected");
            return;
        }
        publish_status(&self.deps, self.execution_id, status, error);
    }

    /// Run the next node.
    pub(crate) async fn step(&mut self) -> StepResult {
        if !self.observe_signal().await {
            return StepResult::Cancelled;
        }
        let Some(index) = self.cursor.next(&self.graph) else {
            return StepResult::Finished;
        };
        self.bind_loop_items();

        let node = self.graph.node(index).clone();
        let step_index = self.next_step_index();
        let step_type = node.node_type().to_string();
        let started_at = Utc::now();

        self.deps.hub.emit(
            EventType::StepStarted,
            self.exec_id(),
            json!({"step_index": step_index, "node_id": node.id, "step_type": step_type}),
        );

        let action = match resolve_action(&node.action, &self.vars) {
            Ok(action) => action,
            Err(e) => {
                let message = format!("failed to resolve node '{}': {}", node.id, e);
                return self
                    .fail_step(step_index, &node.id, &step_type, started_at, 0, message)
                    .await;
            }
        };

        let max_retries = self
            .settings
            .max_retries
            .unwrap_or(MAX_STEP_RETRIES)
            .min(MAX_STEP_RETRIES);
        let backoff_base = self
            .settings
            .retry_backoff_ms
            .unwrap_or(DEFAULT_RETRY_BACKOFF_MS);

        let mut retries = 0;
        let performed = loop {
            match self.perform(index, &action).await {
                Ok(performed) => break performed,
                Err(e) if e.is_transient() && retries < max_retries && !self.is_cancelled() => {
                    retries += 1;
                    let delay = backoff_delay(backoff_base, retries);
                    debug!(
                        execution_id = %self.execution_id,
                        node_id = %node.id,
                        attempt = retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying step"
                    );
                    self.timeline.logs.push(LogEntry::info(
                        format!("Retry {} after: {}", retries, e),
                        Some(step_index),
                    ));
                    let mut control = self.control.clone();
                    let cancelled = tokio::select! {
                        _ = tokio::time::sleep(delay) => false,
                        signal = control.wait_for(|s| *s == RunSignal::Cancel) => signal.is_ok(),
                    };
                    if cancelled {
                        return self
                            .cancel_step(step_index, &node.id, &step_type, started_at, retries)
                            .await;
                    }
                }
                Err(e) => {
                    return self
                        .fail_step(step_index, &node.id, &step_type, started_at, retries, e.to_string())
                        .await;
                }
            }
        };

        let mut performed = performed;
        if performed.screenshot.is_none()
            && self.settings.screenshot_each_step == Some(true)
            && !node.node_type().is_control_flow()
        {
            match self
                .deps
                .driver
                .screenshot(&self.session_id, &ScreenshotAction::default())
                .await
            {
                Ok(shot) => performed.screenshot = Some(shot.data),
                Err(e) => warn!(execution_id = %self.execution_id, error = %e, "Step screenshot failed"),
            }
        }

        let screenshot_ref = match performed.screenshot.take() {
            Some(bytes) => self.store_screenshot(step_index, &bytes).await,
            None => None,
        };

        if let Action::Extract(extract) = &action
            && let Some(data) = &performed.extracted
        {
            if let Some(name) = &extract.store_as {
                self.vars.insert(name.clone(), data.clone());
            }
            if let Ok(bytes) = serde_json::to_vec(data)
                && let Err(e) = self
                    .deps
                    .artifacts
                    .put_artifact(
                        self.execution_id,
                        Some(step_index),
                        ArtifactKind::ExtractedData,
                        &bytes,
                        Some(data.clone()),
                    )
                    .await
            {
                warn!(execution_id = %self.execution_id, error = %e, "Failed to store extracted data");
            }
        }
        if performed.url.is_some() {
            self.current_url = performed.url.clone();
        }

        let outcome = performed.outcome.unwrap_or(StepOutcome::Done);
        let frame = Frame {
            step_index,
            node_id: node.id.clone(),
            step_type: step_type.clone(),
            status: FrameStatus::Completed,
            success: true,
            started_at,
            ended_at: Utc::now(),
            screenshot_ref: screenshot_ref.clone(),
            error: None,
            branch: match outcome {
                StepOutcome::Branch(taken) => Some(taken),
                _ => None,
            },
            iterations: match outcome {
                StepOutcome::Iterations(k) => Some(k),
                _ => None,
            },
            retries,
            extracted_data: performed.extracted,
            url: self.current_url.clone(),
        };
        let duration_ms = frame.duration_ms();
        self.push_frame(frame).await;

        self.cursor.complete(&self.graph, index, outcome);
        self.visited.insert(index);
        let progress = self.progress();
        if let Err(e) = self
            .deps
            .store
            .update_execution_progress(self.execution_id, progress)
            .await
        {
            warn!(execution_id = %self.execution_id, error = %e, "Failed to update progress");
        }

        self.deps.hub.emit(
            EventType::StepCompleted,
            self.exec_id(),
            json!({
                "step_index": step_index,
                "node_id": node.id,
                "step_type": step_type,
                "duration_ms": duration_ms,
                "screenshot_ref": screenshot_ref,
                "progress": progress,
            }),
        );
        StepResult::Continue
    }

    async fn perform(&mut self, index: usize, action: &Action) -> Result<Performed, DriverError> {
        let driver = self.deps.driver.clone();
        let session_id = self.session_id.clone();
        let sid = session_id.as_str();
        let mut performed = Performed::default();
        match action {
            Action::Navigate(nav) => {
                let result = driver.navigate(sid, nav).await?;
                performed.url = Some(result.url);
            }
            Action::Click(a) => driver.click(sid, a).await?,
            Action::Type(a) => driver.type_text(sid, a).await?,
            Action::Scroll(a) => driver.scroll(sid, a).await?,
            Action::Select(a) => driver.select(sid, a).await?,
            Action::Keyboard(a) => driver.keyboard(sid, a).await?,
            Action::Wait(a) => driver.wait(sid, a).await?,
            Action::Extract(a) => {
                performed.extracted = Some(driver.extract(sid, a).await?.value);
            }
            Action::Screenshot(a) => {
                let shot = driver.screenshot(sid, a).await?;
                performed.url = shot.url;
                performed.screenshot = Some(shot.data);
            }
            Action::Conditional(c) => {
                let taken = match &c.condition {
                    Condition::ElementExists { selector } => {
                        driver.element_exists(sid, selector).await?
                    }
                    Condition::VariableEquals { variable, value } => {
                        lookup_path(&self.vars, variable) == Some(value)
                    }
                    Condition::VariableTruthy { variable } => {
                        lookup_path(&self.vars, variable).is_some_and(is_truthy)
                    }
                };
                performed.outcome = Some(StepOutcome::Branch(taken));
            }
            Action::Loop(l) => {
                let count = self.plan_loop(index, l);
                performed.outcome = Some(StepOutcome::Iterations(count));
            }
        }
        Ok(performed)
    }

    /// Iteration count of a loop; item lists are kept for body binding.
    fn plan_loop(&mut self, index: usize, l: &LoopAction) -> u32 {
        let count = match l.items_variable.as_deref() {
            Some(name) => {
                let items = lookup_path(&self.vars, name)
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                let count = items.len() as u32;
                self.loop_items.insert(index, items);
                count
            }
            None => l.iterations.unwrap_or(0),
        };
        count.min(l.max_iterations)
    }

    /// Expose the current item of every enclosing loop.
    fn bind_loop_items(&mut self) {
        for (loop_index, iteration) in self.cursor.loop_iterations() {
            let Action::Loop(l) = &self.graph.node(loop_index).action else {
                continue;
            };
            let Some(item_var) = l.item_variable.clone() else {
                continue;
            };
            if let Some(item) = self
                .loop_items
                .get(&loop_index)
                .and_then(|items| items.get(iteration as usize))
            {
                self.vars.insert(item_var, item.clone());
            } else {
                self.vars.insert(item_var, Value::from(iteration));
            }
        }
    }

    fn progress(&self) -> i64 {
        let total = self.graph.len().max(1);
        ((self.visited.len() * 100 / total) as i64).min(MAX_RUNNING_PROGRESS)
    }

    async fn store_screenshot(&self, step_index: u32, bytes: &[u8]) -> Option<String> {
        let relative = screenshot_file(step_index);
        let local = self.result_path.join(&relative);
        if let Some(parent) = local.parent()
            && let Err(e) = tokio::fs::create_dir_all(parent).await
        {
            warn!(execution_id = %self.execution_id, error = %e, "Cannot create screenshot dir");
        }
        if let Err(e) = tokio::fs::write(&local, bytes).await {
            warn!(execution_id = %self.execution_id, error = %e, "Failed to write screenshot");
        }
        match self
            .deps
            .artifacts
            .put_artifact(
                self.execution_id,
                Some(step_index),
                ArtifactKind::Screenshot,
                bytes,
                None,
            )
            .await
        {
            Ok(artifact) => Some(artifact.storage_url),
            Err(e) => {
                warn!(execution_id = %self.execution_id, error = %e, "Screenshot upload failed, keeping local copy");
                Some(relative)
            }
        }
    }

    async fn push_frame(&mut self, frame: Frame) {
        self.timeline.entries.push(frame);
        if let Err(e) = self.timeline.write_to(&self.result_path).await {
            warn!(execution_id = %self.execution_id, error = %e, "Timeline checkpoint failed");
        }
    }

    async fn fail_step(
        &mut self,
        step_index: u32,
        node_id: &str,
        step_type: &str,
        started_at: DateTime<Utc>,
        retries: u32,
        message: String,
    ) -> StepResult {
        warn!(
            execution_id = %self.execution_id,
            node_id = %node_id,
            retries,
            error = %message,
            "Step failed"
        );
        self.timeline
            .logs
            .push(LogEntry::error(message.clone(), Some(step_index)));
        self.push_frame(Frame {
            step_index,
            node_id: node_id.to_string(),
            step_type: step_type.to_string(),
            status: FrameStatus::Failed,
            success: false,
            started_at,
            ended_at: Utc::now(),
            screenshot_ref: None,
            error: Some(message.clone()),
            branch: None,
            iterations: None,
            retries,
            extracted_data: None,
            url: self.current_url.clone(),
        })
        .await;
        self.deps.hub.emit(
            EventType::StepFailed,
            self.exec_id(),
            json!({
                "step_index": step_index,
                "node_id": node_id,
                "step_type": step_type,
                "error": message,
            }),
        );
        StepResult::Failed(format!("step '{}' failed: {}", node_id, message))
    }

    async fn cancel_step(
        &mut self,
        step_index: u32,
        node_id: &str,
        step_type: &str,
        started_at: DateTime<Utc>,
        retries: u32,
    ) -> StepResult {
        self.push_frame(Frame {
            step_index,
            node_id: node_id.to_string(),
            step_type: step_type.to_string(),
            status: FrameStatus::Cancelled,
            success: false,
            started_at,
            ended_at: Utc::now(),
            screenshot_ref: None,
            error: Some("cancelled".to_string()),
            branch: None,
            iterations: None,
            retries,
            extracted_data: None,
            url: self.current_url.clone(),
        })
        .await;
        StepResult::Cancelled
    }
}

// ============================================================================
// Driving a run
// ============================================================================

/// Drive one execution from `pending` (or `paused`) to a terminal status.
pub(crate) async fn drive(deps: RunDeps, plan: RunPlan, control: watch::Receiver<RunSignal>) {
    let execution_id = plan.execution_id;
    if let Err(e) = deps
        .store
        .transition_execution(execution_id, ExecutionStatus::Running, None)
        .await
    {
        warn!(execution_id = %execution_id, error = %e, "Execution not started");
        return;
    }
    publish_status(&deps, execution_id, ExecutionStatus::Running, None);
    info!(execution_id = %execution_id, nodes = plan.definition.nodes.len(), "Execution started");

    let graph = match FlowGraph::build(&plan.definition) {
        Ok(graph) => graph,
        Err(e) => {
            finish(&deps, &plan, None, ExecutionStatus::Failed, Some(e.to_string())).await;
            return;
        }
    };

    let settings = &plan.definition.settings;
    let mut options = SessionOptions::new(
        settings.viewport_width.unwrap_or(DEFAULT_VIEWPORT.0),
        settings.viewport_height.unwrap_or(DEFAULT_VIEWPORT.1),
    );
    options.user_agent = settings.user_agent.clone();
    options.browserless_url = deps.browserless_url.clone();
    options.record_video = true;

    let session_id = match deps.driver.create_session(&options).await {
        Ok(session) => session.session_id,
        Err(e) => {
            let message = format!("failed to start browser session: {}", e);
            finish(&deps, &plan, None, ExecutionStatus::Failed, Some(message)).await;
            return;
        }
    };

    let mut state = RunState::new(deps.clone(), &plan, graph, session_id.clone(), control);
    let replayed = state.replay(&plan.replay);
    let resume_target = plan
        .resume_url
        .clone()
        .or_else(|| (replayed > 0).then(|| state.current_url.clone()).flatten());
    if let Some(url) = resume_target {
        let nav = NavigateAction {
            url: url.clone(),
            ..Default::default()
        };
        match deps.driver.navigate(&session_id, &nav).await {
            Ok(result) => state.current_url = Some(result.url),
            Err(e) => warn!(execution_id = %execution_id, url = %url, error = %e, "Resume navigation failed"),
        }
    }

    let (status, error) = loop {
        match AssertUnwindSafe(state.step()).catch_unwind().await {
            Ok(StepResult::Continue) => continue,
            Ok(StepResult::Finished) => break (ExecutionStatus::Completed, None),
            Ok(StepResult::Failed(message)) => break (ExecutionStatus::Failed, Some(message)),
            Ok(StepResult::Cancelled) => {
                break (ExecutionStatus::Cancelled, Some("cancelled by user".to_string()));
            }
            Err(panic) => {
                let message = format!("INTERNAL_SERVER: {}", panic_message(&*panic));
                error!(execution_id = %execution_id, error = %message, "Run loop panicked");
                break (ExecutionStatus::Failed, Some(message));
            }
        }
    };

    if status == ExecutionStatus::Cancelled
        && let Err(e) = deps.driver.stop_recording(&session_id).await
    {
        debug!(execution_id = %execution_id, error = %e, "No recording to stop");
    }
    collect_session_artifacts(&deps, execution_id, &session_id, &plan.result_path).await;
    if let Err(e) = deps.driver.close_session(&session_id).await {
        warn!(execution_id = %execution_id, error = %e, "Failed to close session");
    }

    let timeline = std::mem::take(&mut state.timeline);
    let vars = state.vars.clone();
    finish(
        &deps,
        &plan,
        Some((timeline, vars)),
        status,
        error,
    )
    .await;
}

/// Persist timeline and summary, then move to the terminal status.
async fn finish(
    deps: &RunDeps,
    plan: &RunPlan,
    outcome: Option<(ExecutionTimeline, Map<String, Value>)>,
    status: ExecutionStatus,
    error: Option<String>,
) {
    let execution_id = plan.execution_id;
    let (mut timeline, vars) =
        outcome.unwrap_or_else(|| (ExecutionTimeline::new(execution_id), plan.vars.clone()));
    timeline.execution_id = execution_id;
    if let Some(message) = &error
        && status == ExecutionStatus::Failed
        && timeline.logs.iter().all(|l| &l.message != message)
    {
        timeline.logs.push(LogEntry::error(message.clone(), None));
    }
    if let Err(e) = timeline.write_to(&plan.result_path).await {
        error!(execution_id = %execution_id, error = %e, "Failed to write timeline");
    }

    let extracted: Map<String, Value> = vars
        .into_iter()
        .filter(|(k, _)| !plan.vars.contains_key(k))
        .collect();
    let summary = ExecutionSummary {
        execution_id,
        status: status.to_string(),
        total_steps: plan.definition.nodes.len(),
        completed_steps: timeline.completed_frames().count(),
        error: error.clone(),
        extracted,
        finished_at: Utc::now(),
    };
    if let Err(e) = summary.write_to(&plan.result_path).await {
        error!(execution_id = %execution_id, error = %e, "Failed to write result summary");
    }

    match deps
        .store
        .transition_execution(execution_id, status, error.as_deref())
        .await
    {
        Ok(()) => {
            publish_status(deps, execution_id, status, error.as_deref());
            info!(
                execution_id = %execution_id,
                status = %status,
                frames = timeline.entries.len(),
                "Execution finished"
            );
        }
        Err(e) => error!(execution_id = %execution_id, error = %e, "Failed to record final status"),
    }
}

async fn collect_session_artifacts(
    deps: &RunDeps,
    execution_id: Uuid,
    session_id: &str,
    result_path: &Path,
) {
    let artifacts = match deps.driver.collect_artifacts(session_id).await {
        Ok(artifacts) if !artifacts.is_empty() => artifacts,
        Ok(_) => return,
        Err(e) => {
            debug!(execution_id = %execution_id, error = %e, "No session artifacts");
            return;
        }
    };
    let har = artifacts
        .har
        .as_ref()
        .and_then(|har| serde_json::to_vec_pretty(har).ok());
    let files = [
        (VIDEO_FILE, ArtifactKind::Video, artifacts.video.as_deref()),
        (TRACE_FILE, ArtifactKind::Trace, artifacts.trace.as_deref()),
        (HAR_FILE, ArtifactKind::Har, har.as_deref()),
    ];
    for (name, kind, bytes) in files {
        let Some(bytes) = bytes else {
            continue;
        };
        if let Err(e) = tokio::fs::write(result_path.join(name), bytes).await {
            warn!(execution_id = %execution_id, file = name, error = %e, "Failed to write artifact");
        }
        if let Err(e) = deps
            .artifacts
            .put_artifact(execution_id, None, kind, bytes, None)
            .await
        {
            warn!(execution_id = %execution_id, file = name, error = %e, "Artifact upload failed");
        }
    }
}

pub(crate) fn publish_status(
    deps: &RunDeps,
    execution_id: Uuid,
    status: ExecutionStatus,
    error: Option<&str>,
) {
    deps.hub.emit(
        EventType::ExecutionStatusChanged,
        Some(execution_id.to_string()),
        json!({"status": status, "error": error}),
    );
}

/// Relative path of a step screenshot inside the result directory.
pub fn screenshot_file(step_index: u32) -> String {
    format!("{}/step-{:04}.png", SCREENSHOTS_DIR, step_index)
}

/// Exponential backoff with up to 50% jitter.
fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let exp = base_ms.saturating_mul(1u64 << attempt.saturating_sub(1).min(10));
    let jitter = if base_ms > 1 {
        rand::thread_rng().gen_range(0..=base_ms / 2)
    } else {
        0
    };
    Duration::from_millis(exp.saturating_add(jitter))
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty() && s != "false" && s != "0",
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "run loop panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_exponentially() {
        let first = backoff_delay(100, 1);
        let third = backoff_delay(100, 3);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(150));
        assert!(third >= Duration::from_millis(400) && third <= Duration::from_millis(450));
        assert_eq!(backoff_delay(0, 2), Duration::ZERO);
    }

    #[test]
    fn test_truthiness() {
        assert!(is_truthy(&json!(true)));
        assert!(is_truthy(&json!("yes")));
        assert!(is_truthy(&json!([1])));
        assert!(!is_truthy(&json!("false")));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&Value::Null));
    }

    #[test]
    fn test_screenshot_file_name() {
        assert_eq!(screenshot_file(7), "screenshots/step-0007.png");
    }
}
