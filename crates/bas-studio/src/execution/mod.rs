// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution Engine.
//!
//! Dispatch creates a `pending` execution, spawns its run task and returns
//! immediately. Each live run owns a `watch` channel through which stop,
//! pause and resume requests reach it between steps.
//!
//! ## Resume
//!
//! - `paused`: the live run continues in place. When no run is live (the
//!   process restarted) the same execution is re-driven and replays its own
//!   timeline.
//! - `failed` / `cancelled`: a new execution with trigger `resume` replays
//!   the leading completed frames of the old timeline, then continues.
//!
//! Either way the browser is navigated to `resume_url` (or the last replayed
//! page) before the first live step.

mod artifacts;
pub(crate) mod run;

pub use artifacts::{RecordedFile, ScreenshotInfo};
pub use run::{DEFAULT_VIEWPORT, RunSignal, screenshot_file};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bas_core::models::{Execution, ExecutionFilter, ExecutionStatus, TriggerType};
use bas_core::{ArtifactGateway, ExecutionTimeline, IndexStore, TelemetryHub};
use bas_driver::BrowserDriver;
use bas_dsl::template::resolve_flow;
use bas_dsl::{
    FlowDefinition, FlowGraph, normalize_flow_definition, normalize_parameters, validate_flow,
    validate_resolved,
};
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, watch};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use run::{RunDeps, RunPlan};

/// Snapshot of the definition a run started with.
pub const DEFINITION_FILE: &str = "definition.json";

/// Parameter linking a resumed execution to its predecessor.
pub const RESUMED_FROM_PARAM: &str = "_resumed_from";

/// Parameter naming the page a resumed run starts on.
pub const RESUME_URL_PARAM: &str = "resume_url";

/// Default poll interval of `wait_for_completion`.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Engine settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root of per-execution result directories.
    pub recordings_root: PathBuf,
    /// Browser farm endpoint forwarded to new sessions.
    pub browserless_url: Option<String>,
    pub poll_interval: Duration,
}

impl EngineConfig {
    pub fn new(recordings_root: impl Into<PathBuf>) -> Self {
        Self {
            recordings_root: recordings_root.into(),
            browserless_url: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Body of an ad-hoc run.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdhocExecutionRequest {
    pub flow_definition: Value,
    #[serde(default)]
    pub parameters: Option<Map<String, Value>>,
    /// Older clients send parameters under this name.
    #[serde(default)]
    pub execution_params: Option<Map<String, Value>>,
    #[serde(default)]
    pub wait_for_completion: bool,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl AdhocExecutionRequest {
    /// Merged parameters; `parameters` wins over `execution_params`.
    pub fn merged_parameters(&self) -> Map<String, Value> {
        let mut body = Map::new();
        if let Some(legacy) = &self.execution_params {
            body.insert("execution_params".to_string(), Value::Object(legacy.clone()));
        }
        if let Some(params) = &self.parameters {
            body.insert("parameters".to_string(), Value::Object(params.clone()));
        }
        normalize_parameters(&body)
    }
}

struct EngineInner {
    deps: RunDeps,
    config: EngineConfig,
    runs: Mutex<HashMap<Uuid, watch::Sender<RunSignal>>>,
}

/// Dispatches and controls executions.
#[derive(Clone)]
pub struct ExecutionEngine {
    inner: Arc<EngineInner>,
}

impl ExecutionEngine {
    pub fn new(
        store: Arc<dyn IndexStore>,
        driver: Arc<dyn BrowserDriver>,
        artifacts: Arc<ArtifactGateway>,
        hub: Arc<TelemetryHub>,
        config: EngineConfig,
    ) -> Self {
        let deps = RunDeps {
            store,
            driver,
            artifacts,
            hub,
            browserless_url: config.browserless_url.clone(),
        };
        Self {
            inner: Arc::new(EngineInner {
                deps,
                config,
                runs: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn store(&self) -> &Arc<dyn IndexStore> {
        &self.inner.deps.store
    }

    pub fn recordings_root(&self) -> &Path {
        &self.inner.config.recordings_root
    }

    /// Result directory assigned to an execution.
    pub fn result_path_for(&self, execution_id: Uuid) -> PathBuf {
        self.inner
            .config
            .recordings_root
            .join(execution_id.to_string())
    }

    /// Number of runs currently live in this process.
    pub async fn live_runs(&self) -> usize {
        self.inner.runs.lock().await.len()
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Start a stored workflow.
    pub async fn execute_workflow(
        &self,
        workflow_id: Uuid,
        parameters: Map<String, Value>,
        trigger: TriggerType,
    ) -> Result<Execution> {
        let workflow = self.store().get_workflow(workflow_id).await?;
        check_runnable(&workflow.flow_definition, &parameters)?;

        let execution = Execution::new(
            Some(workflow.id),
            workflow.project_id,
            trigger,
            Value::Object(parameters.clone()),
        );
        info!(
            execution_id = %execution.id,
            workflow_id = %workflow.id,
            trigger = %trigger,
            "Dispatching execution"
        );
        self.launch(execution, workflow.flow_definition, parameters, Vec::new(), None, true)
            .await
    }

    /// Start an anonymous definition without a workflow row.
    pub async fn execute_adhoc(&self, req: &AdhocExecutionRequest) -> Result<Execution> {
        if req.flow_definition.is_null() {
            return Err(Error::MissingField("flow_definition"));
        }
        let definition =
            normalize_flow_definition(&req.flow_definition).map_err(|e| Error::InvalidWorkflowPayload {
                message: e.to_string(),
                details: None,
            })?;
        let parameters = req.merged_parameters();
        check_runnable(&definition, &parameters)?;

        let execution = Execution::new(
            None,
            None,
            TriggerType::Api,
            Value::Object(parameters.clone()),
        );
        info!(execution_id = %execution.id, "Dispatching ad-hoc execution");
        self.launch(execution, definition, parameters, Vec::new(), None, true)
            .await
    }

    async fn launch(
        &self,
        mut execution: Execution,
        definition: FlowDefinition,
        vars: Map<String, Value>,
        replay: Vec<bas_core::Frame>,
        resume_url: Option<String>,
        create_row: bool,
    ) -> Result<Execution> {
        let result_path = self.result_path_for(execution.id);
        tokio::fs::create_dir_all(&result_path).await?;
        tokio::fs::write(
            result_path.join(DEFINITION_FILE),
            serde_json::to_vec_pretty(&definition)?,
        )
        .await?;

        execution.result_path = result_path.to_string_lossy().into_owned();
        if create_row {
            self.store().create_execution(&execution).await?;
        }
        self.store()
            .set_execution_result_path(execution.id, &execution.result_path)
            .await?;

        let (tx, rx) = watch::channel(RunSignal::Run);
        self.inner.runs.lock().await.insert(execution.id, tx);

        let plan = RunPlan {
            execution_id: execution.id,
            definition,
            vars,
            result_path,
            replay,
            resume_url,
        };
        let engine = self.clone();
        let deps = self.inner.deps.clone();
        let execution_id = execution.id;
        tokio::spawn(async move {
            run::drive(deps, plan, rx).await;
            engine.inner.runs.lock().await.remove(&execution_id);
        });

        Ok(execution)
    }

    /// Poll until the execution is terminal or the deadline passes.
    pub async fn wait_for_completion(&self, id: Uuid, timeout: Duration) -> Result<Execution> {
        let deadline = Instant::now() + timeout;
        loop {
            let execution = self.store().get_execution(id).await?;
            if execution.status.is_terminal() {
                return Ok(execution);
            }
            if Instant::now() >= deadline {
                return Err(Error::RequestTimeout(format!(
                    "execution {} still {} after {} ms",
                    id,
                    execution.status,
                    timeout.as_millis()
                )));
            }
            tokio::time::sleep(self.inner.config.poll_interval).await;
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn get_execution(&self, id: Uuid) -> Result<Execution> {
        Ok(self.store().get_execution(id).await?)
    }

    pub async fn list_executions(
        &self,
        filter: &ExecutionFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Execution>> {
        Ok(self.store().list_executions(filter, limit, offset).await?)
    }

    // ========================================================================
    // Control
    // ========================================================================

    /// Cancel an execution. Live runs stop before their next node.
    pub async fn stop_execution(&self, id: Uuid) -> Result<Execution> {
        let execution = self.store().get_execution(id).await?;
        if execution.status.is_terminal() {
            return Err(Error::Conflict(format!(
                "execution {} is already {}",
                id, execution.status
            )));
        }

        let signalled = match self.inner.runs.lock().await.get(&id) {
            Some(tx) => {
                tx.send_replace(RunSignal::Cancel);
                true
            }
            None => false,
        };
        if !signalled {
            self.store()
                .transition_execution(id, ExecutionStatus::Cancelled, Some("cancelled by user"))
                .await?;
            run::publish_status(
                &self.inner.deps,
                id,
                ExecutionStatus::Cancelled,
                Some("cancelled by user"),
            );
        }
        info!(execution_id = %id, live = signalled, "Execution stop requested");
        Ok(self.store().get_execution(id).await?)
    }

    /// Pause a live run at its next step boundary.
    pub async fn pause_execution(&self, id: Uuid) -> Result<Execution> {
        let execution = self.store().get_execution(id).await?;
        if !matches!(
            execution.status,
            ExecutionStatus::Pending | ExecutionStatus::Running
        ) {
            return Err(Error::Conflict(format!(
                "execution {} cannot be paused while {}",
                id, execution.status
            )));
        }
        match self.inner.runs.lock().await.get(&id) {
            Some(tx) => {
                tx.send_replace(RunSignal::Pause);
            }
            None => {
                return Err(Error::Conflict(format!(
                    "execution {} is not running in this process",
                    id
                )));
            }
        }
        info!(execution_id = %id, "Execution pause requested");
        Ok(execution)
    }

    /// Resume a paused, failed or cancelled execution.
    ///
    /// Returns the execution that carries on: the same one for `paused`, a
    /// new one for `failed` and `cancelled`.
    pub async fn resume_execution(
        &self,
        id: Uuid,
        parameters: Map<String, Value>,
    ) -> Result<Execution> {
        let execution = self.store().get_execution(id).await?;
        let resume_url = parameters
            .get(RESUME_URL_PARAM)
            .and_then(Value::as_str)
            .map(str::to_string);

        match execution.status {
            ExecutionStatus::Paused => {
                if let Some(tx) = self.inner.runs.lock().await.get(&id) {
                    tx.send_replace(RunSignal::Run);
                    info!(execution_id = %id, "Resuming live execution");
                    return Ok(execution);
                }
                let (definition, frames) = self.load_checkpoint(&execution).await?;
                let vars = merge_params(&execution.parameters, &parameters);
                info!(execution_id = %id, replay = frames.len(), "Re-driving paused execution");
                self.launch(execution, definition, vars, frames, resume_url, false)
                    .await
            }
            ExecutionStatus::Failed | ExecutionStatus::Cancelled => {
                let (definition, frames) = self.load_checkpoint(&execution).await?;
                let mut vars = merge_params(&execution.parameters, &parameters);
                vars.insert(
                    RESUMED_FROM_PARAM.to_string(),
                    Value::String(id.to_string()),
                );
                let next = Execution::new(
                    execution.workflow_id,
                    execution.project_id,
                    TriggerType::Resume,
                    Value::Object(vars.clone()),
                );
                info!(
                    execution_id = %next.id,
                    resumed_from = %id,
                    replay = frames.len(),
                    "Resuming execution"
                );
                self.launch(next, definition, vars, frames, resume_url, true)
                    .await
            }
            status => Err(Error::Conflict(format!(
                "execution {} cannot be resumed while {}",
                id, status
            ))),
        }
    }

    /// Definition and replayable frames of an earlier run.
    async fn load_checkpoint(
        &self,
        execution: &Execution,
    ) -> Result<(FlowDefinition, Vec<bas_core::Frame>)> {
        let result_path = PathBuf::from(&execution.result_path);
        let definition = match tokio::fs::read(result_path.join(DEFINITION_FILE)).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) => {
                let Some(workflow_id) = execution.workflow_id else {
                    return Err(Error::Conflict(format!(
                        "execution {} has no stored definition to resume from: {}",
                        execution.id, e
                    )));
                };
                warn!(
                    execution_id = %execution.id,
                    error = %e,
                    "Definition snapshot missing, resuming with the current workflow"
                );
                self.store().get_workflow(workflow_id).await?.flow_definition
            }
        };
        let frames = if execution.result_path.is_empty() {
            Vec::new()
        } else {
            ExecutionTimeline::read_from(&result_path)
                .await?
                .map(|t| t.replayable_prefix().to_vec())
                .unwrap_or_default()
        };
        Ok((definition, frames))
    }
}

/// Reject flows that cannot run with the given parameters.
fn check_runnable(definition: &FlowDefinition, parameters: &Map<String, Value>) -> Result<()> {
    FlowGraph::build(definition).map_err(|e| Error::InvalidWorkflowPayload {
        message: e.to_string(),
        details: None,
    })?;
    let resolved = resolve_flow(definition, parameters).map_err(|e| Error::InvalidWorkflowPayload {
        message: e,
        details: None,
    })?;
    let mut result = validate_flow(&resolved);
    result.merge(validate_resolved(&resolved));
    if result.has_errors() {
        return Err(Error::InvalidWorkflowPayload {
            message: result.error_summary(),
            details: serde_json::to_value(result.report()).ok(),
        });
    }
    Ok(())
}

fn merge_params(previous: &Value, overrides: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = previous.as_object().cloned().unwrap_or_default();
    for (k, v) in overrides {
        merged.insert(k.clone(), v.clone());
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_adhoc_parameters_prefer_new_name() {
        let req: AdhocExecutionRequest = serde_json::from_value(json!({
            "flow_definition": {"nodes": []},
            "execution_params": {"a": 1, "b": {"string_value": "legacy"}},
            "parameters": {"a": 2}
        }))
        .unwrap();
        let params = req.merged_parameters();
        assert_eq!(params["a"], json!(2));
        assert_eq!(params["b"], json!("legacy"));
    }

    #[test]
    fn test_merge_params_overrides() {
        let merged = merge_params(&json!({"a": 1, "b": 2}), &Map::from_iter([
            ("b".to_string(), json!(3)),
        ]));
        assert_eq!(Value::Object(merged), json!({"a": 1, "b": 3}));
    }

    #[test]
    fn test_check_runnable_rejects_unresolved_tokens() {
        let definition = normalize_flow_definition(&json!({
            "nodes": [{"id": "1", "type": "navigate", "data": {"url": "${base}/login"}}]
        }))
        .unwrap();
        let err = check_runnable(&definition, &Map::new()).unwrap_err();
        assert_eq!(err.code(), "INVALID_WORKFLOW_PAYLOAD");

        let params = Map::from_iter([("base".to_string(), json!("https://example.com"))]);
        check_runnable(&definition, &params).unwrap();
    }
}
