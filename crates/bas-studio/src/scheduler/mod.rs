// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scheduler.
//!
//! Periodically polls for active schedules whose `next_run_at` has passed
//! and dispatches one execution per schedule per tick. Fires missed while
//! the host was suspended are coalesced: `next_run_at` always moves to the
//! first fire after the tick time.
//!
//! A schedule is not fired again while an execution it started is still
//! `pending` or `running`. Manual triggers bypass that check.

pub mod cron;

pub use self::cron::{CronRule, OCCURRENCE_SCAN_CAP, Occurrences, parse_timezone, validate_cron};

use std::sync::Arc;
use std::time::Duration;

use bas_core::IndexStore;
use bas_core::models::{Execution, ExecutionFilter, ExecutionStatus, Schedule, ScheduleFilter, TriggerType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::execution::ExecutionEngine;

/// Default tick interval.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(15);

/// Longest allowed tick interval.
pub const MAX_TICK_INTERVAL: Duration = Duration::from_secs(30);

/// Default cap of concrete occurrences per schedule in a projection.
pub const DEFAULT_MAX_PER_SCHEDULE: usize = 100;

pub const TRIGGER_TYPE_PARAM: &str = "_trigger_type";
pub const SCHEDULE_ID_PARAM: &str = "_schedule_id";
pub const SCHEDULE_NAME_PARAM: &str = "_schedule_name";
pub const MANUAL_TRIGGER_PARAM: &str = "_manual_trigger";

/// Live executions inspected per status during duplicate detection.
const LIVE_SCAN_LIMIT: i64 = 200;

// ============================================================================
// Request / response types
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateScheduleRequest {
    pub workflow_id: Uuid,
    pub name: String,
    pub cron_expression: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateScheduleRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub cron_expression: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub is_active: Option<bool>,
    #[serde(default)]
    pub parameters: Option<Map<String, Value>>,
}

/// A schedule with derived aggregates for list views.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleView {
    #[serde(flatten)]
    pub schedule: Schedule,
    pub is_recurring: bool,
    pub estimated_runs_per_day: f64,
}

impl ScheduleView {
    fn new(schedule: Schedule) -> Self {
        let (is_recurring, estimated_runs_per_day) =
            match CronRule::parse(&schedule.cron_expression, &schedule.timezone) {
                Ok(rule) => (rule.is_recurring(), rule.estimated_runs_per_day()),
                Err(_) => (false, 0.0),
            };
        Self {
            schedule,
            is_recurring,
            estimated_runs_per_day,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleOccurrences {
    pub schedule_id: Uuid,
    pub schedule_name: String,
    pub workflow_id: Uuid,
    #[serde(flatten)]
    pub occurrences: Occurrences,
}

/// Outcome of one tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TickReport {
    pub fired: Vec<Uuid>,
    pub skipped: Vec<Uuid>,
    pub failed: Vec<Uuid>,
}

// ============================================================================
// Scheduler
// ============================================================================

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: DEFAULT_TICK_INTERVAL,
        }
    }
}

#[derive(Clone)]
pub struct Scheduler {
    store: Arc<dyn IndexStore>,
    engine: ExecutionEngine,
    config: SchedulerConfig,
    shutdown: Arc<Notify>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn IndexStore>, engine: ExecutionEngine, config: SchedulerConfig) -> Self {
        let config = SchedulerConfig {
            tick_interval: config.tick_interval.clamp(Duration::from_secs(1), MAX_TICK_INTERVAL),
        };
        Self {
            store,
            engine,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the tick loop until shutdown is signalled.
    pub async fn run(self) {
        info!(
            tick_interval_secs = self.config.tick_interval.as_secs(),
            "Scheduler started"
        );
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("Scheduler shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.tick_interval) => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        error!(error = %e, "Scheduler tick failed");
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // CRUD
    // ------------------------------------------------------------------

    pub async fn create_schedule(&self, req: CreateScheduleRequest) -> Result<ScheduleView> {
        let name = req.name.trim();
        if name.is_empty() {
            return Err(Error::MissingField("name"));
        }
        let rule = CronRule::parse(&req.cron_expression, &req.timezone)?;
        self.store.get_workflow(req.workflow_id).await?;

        let mut schedule = Schedule::new(req.workflow_id, name, rule.expression(), rule.timezone().name());
        schedule.is_active = req.is_active;
        schedule.parameters = Value::Object(req.parameters);
        if schedule.is_active {
            schedule.next_run_at = rule.next_after(Utc::now());
        }
        self.store.create_schedule(&schedule).await?;
        info!(
            schedule_id = %schedule.id,
            workflow_id = %schedule.workflow_id,
            cron = %schedule.cron_expression,
            next_run_at = ?schedule.next_run_at,
            "Schedule created"
        );
        Ok(ScheduleView::new(schedule))
    }

    pub async fn get_schedule(&self, id: Uuid) -> Result<ScheduleView> {
        Ok(ScheduleView::new(self.store.get_schedule(id).await?))
    }

    pub async fn list_schedules(&self, filter: &ScheduleFilter) -> Result<Vec<ScheduleView>> {
        Ok(self
            .store
            .list_schedules(filter)
            .await?
            .into_iter()
            .map(ScheduleView::new)
            .collect())
    }

    pub async fn update_schedule(&self, id: Uuid, req: UpdateScheduleRequest) -> Result<ScheduleView> {
        let mut schedule = self.store.get_schedule(id).await?;
        if let Some(name) = req.name {
            let name = name.trim();
            if name.is_empty() {
                return Err(Error::MissingField("name"));
            }
            schedule.name = name.to_string();
        }
        let cron_expression = req.cron_expression.unwrap_or(schedule.cron_expression);
        let timezone = req.timezone.unwrap_or(schedule.timezone);
        let rule = CronRule::parse(&cron_expression, &timezone)?;
        schedule.cron_expression = rule.expression().to_string();
        schedule.timezone = rule.timezone().name().to_string();
        if let Some(active) = req.is_active {
            schedule.is_active = active;
        }
        if let Some(parameters) = req.parameters {
            schedule.parameters = Value::Object(parameters);
        }
        schedule.next_run_at = if schedule.is_active {
            rule.next_after(Utc::now())
        } else {
            None
        };
        schedule.updated_at = Utc::now();
        self.store.update_schedule(&schedule).await?;
        Ok(ScheduleView::new(schedule))
    }

    pub async fn delete_schedule(&self, id: Uuid) -> Result<()> {
        self.store.delete_schedule(id).await?;
        info!(schedule_id = %id, "Schedule deleted");
        Ok(())
    }

    /// Flip `is_active`. Activation recomputes the next run from now.
    pub async fn toggle_schedule(&self, id: Uuid) -> Result<ScheduleView> {
        let schedule = self.store.get_schedule(id).await?;
        self.update_schedule(
            id,
            UpdateScheduleRequest {
                is_active: Some(!schedule.is_active),
                ..Default::default()
            },
        )
        .await
    }

    /// Fire a schedule now, regardless of its next run time or live runs.
    pub async fn trigger_schedule(&self, id: Uuid) -> Result<Execution> {
        let schedule = self.store.get_schedule(id).await?;
        let now = Utc::now();
        let execution = self.fire(&schedule, true).await?;
        let next = if schedule.is_active {
            CronRule::parse(&schedule.cron_expression, &schedule.timezone)
                .ok()
                .and_then(|rule| rule.next_after(now))
        } else {
            schedule.next_run_at
        };
        self.store.update_schedule_last_run(id, now, next).await?;
        Ok(execution)
    }

    // ------------------------------------------------------------------
    // Tick
    // ------------------------------------------------------------------

    /// Fire every due schedule at most once.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let due = self.store.get_active_schedules_due(now).await?;
        let mut report = TickReport::default();
        if due.is_empty() {
            debug!("No schedules due");
            return Ok(report);
        }
        debug!(count = due.len(), "Processing due schedules");

        for schedule in due {
            let next = match CronRule::parse(&schedule.cron_expression, &schedule.timezone) {
                Ok(rule) => rule.next_after(now),
                Err(e) => {
                    warn!(schedule_id = %schedule.id, error = %e, "Schedule has an invalid rule, deactivating");
                    let mut disabled = schedule.clone();
                    disabled.is_active = false;
                    disabled.next_run_at = None;
                    disabled.updated_at = now;
                    if let Err(e) = self.store.update_schedule(&disabled).await {
                        error!(schedule_id = %schedule.id, error = %e, "Failed to deactivate schedule");
                    }
                    report.failed.push(schedule.id);
                    continue;
                }
            };

            if self.has_live_execution(&schedule).await {
                info!(schedule_id = %schedule.id, "Previous run still active, skipping fire");
                report.skipped.push(schedule.id);
            } else {
                match self.fire(&schedule, false).await {
                    Ok(execution) => {
                        info!(
                            schedule_id = %schedule.id,
                            execution_id = %execution.id,
                            "Scheduled execution dispatched"
                        );
                        report.fired.push(schedule.id);
                    }
                    Err(e) => {
                        error!(schedule_id = %schedule.id, error = %e, "Failed to dispatch scheduled execution");
                        report.failed.push(schedule.id);
                    }
                }
            }

            if let Err(e) = self.store.update_schedule_last_run(schedule.id, now, next).await {
                error!(schedule_id = %schedule.id, error = %e, "Failed to record schedule run");
            }
        }
        Ok(report)
    }

    async fn fire(&self, schedule: &Schedule, manual: bool) -> Result<Execution> {
        let mut params = schedule.parameters.as_object().cloned().unwrap_or_default();
        params.insert(TRIGGER_TYPE_PARAM.into(), Value::String(TriggerType::Scheduled.to_string()));
        params.insert(SCHEDULE_ID_PARAM.into(), Value::String(schedule.id.to_string()));
        params.insert(SCHEDULE_NAME_PARAM.into(), Value::String(schedule.name.clone()));
        if manual {
            params.insert(MANUAL_TRIGGER_PARAM.into(), Value::Bool(true));
        }
        self.engine
            .execute_workflow(schedule.workflow_id, params, TriggerType::Scheduled)
            .await
    }

    async fn has_live_execution(&self, schedule: &Schedule) -> bool {
        let id = schedule.id.to_string();
        for status in [ExecutionStatus::Pending, ExecutionStatus::Running] {
            let filter = ExecutionFilter {
                workflow_id: Some(schedule.workflow_id),
                status: Some(status),
            };
            match self.engine.list_executions(&filter, LIVE_SCAN_LIMIT, 0).await {
                Ok(executions) => {
                    if executions.iter().any(|e| {
                        e.parameters.get(SCHEDULE_ID_PARAM).and_then(Value::as_str) == Some(id.as_str())
                    }) {
                        return true;
                    }
                }
                Err(e) => {
                    warn!(schedule_id = %schedule.id, error = %e, "Duplicate check failed (non-fatal)")
                }
            }
        }
        false
    }

    // ------------------------------------------------------------------
    // Projection
    // ------------------------------------------------------------------

    /// Planned run times of active schedules within `[start, end]`.
    pub async fn get_occurrences(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        max_per_schedule: usize,
    ) -> Result<Vec<ScheduleOccurrences>> {
        if end < start {
            return Err(Error::InvalidRequest("end must not be before start".to_string()));
        }
        let schedules = self
            .store
            .list_schedules(&ScheduleFilter {
                workflow_id: None,
                active_only: true,
            })
            .await?;
        let mut out = Vec::with_capacity(schedules.len());
        for schedule in schedules {
            let rule = match CronRule::parse(&schedule.cron_expression, &schedule.timezone) {
                Ok(rule) => rule,
                Err(e) => {
                    warn!(schedule_id = %schedule.id, error = %e, "Skipping schedule with invalid rule");
                    continue;
                }
            };
            out.push(ScheduleOccurrences {
                schedule_id: schedule.id,
                schedule_name: schedule.name,
                workflow_id: schedule.workflow_id,
                occurrences: rule.occurrences(start, end, max_per_schedule),
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CreateWorkflowRequest, WorkflowCatalog};
    use crate::execution::EngineConfig;
    use bas_core::models::ChangeSource;
    use bas_core::{ArtifactGateway, FsBlobStore, SqliteIndexStore, TelemetryHub};
    use bas_driver::MockDriver;
    use serde_json::json;

    struct Fixture {
        scheduler: Scheduler,
        store: Arc<dyn IndexStore>,
        workflow_id: Uuid,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn IndexStore> = Arc::new(SqliteIndexStore::in_memory().await.unwrap());
        let catalog = WorkflowCatalog::new(store.clone(), dir.path().join("projects"));
        let workflow = catalog
            .create_workflow(
                CreateWorkflowRequest {
                    name: "nightly".to_string(),
                    flow_definition: json!({
                        "nodes": [{"id": "n1", "type": "navigate", "data": {"url": "https://example.com"}}],
                        "edges": []
                    }),
                    ..Default::default()
                },
                ChangeSource::Manual,
                "test",
            )
            .await
            .unwrap();
        let engine = ExecutionEngine::new(
            store.clone(),
            Arc::new(MockDriver::new()),
            Arc::new(ArtifactGateway::new(Arc::new(FsBlobStore::new(dir.path().join("blobs"))))),
            Arc::new(TelemetryHub::new()),
            EngineConfig::new(dir.path().join("recordings")),
        );
        Fixture {
            scheduler: Scheduler::new(store.clone(), engine, SchedulerConfig::default()),
            store,
            workflow_id: workflow.id,
            _dir: dir,
        }
    }

    fn request(workflow_id: Uuid, cron: &str) -> CreateScheduleRequest {
        CreateScheduleRequest {
            workflow_id,
            name: "every five".to_string(),
            cron_expression: cron.to_string(),
            timezone: "UTC".to_string(),
            is_active: true,
            parameters: Map::new(),
        }
    }

    #[tokio::test]
    async fn test_create_validates_cron_and_timezone() {
        let f = fixture().await;
        let err = f
            .scheduler
            .create_schedule(request(f.workflow_id, "*/0 * * * *"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_CRON_EXPRESSION");

        let mut bad_tz = request(f.workflow_id, "*/5 * * * *");
        bad_tz.timezone = "Nowhere/City".to_string();
        let err = f.scheduler.create_schedule(bad_tz).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_TIMEZONE");

        let view = f
            .scheduler
            .create_schedule(request(f.workflow_id, "*/5 * * * *"))
            .await
            .unwrap();
        assert!(view.schedule.next_run_at.unwrap() > Utc::now());
        assert_eq!(view.estimated_runs_per_day, 288.0);
    }

    #[tokio::test]
    async fn test_tick_coalesces_missed_fires() {
        let f = fixture().await;
        let view = f
            .scheduler
            .create_schedule(request(f.workflow_id, "*/5 * * * *"))
            .await
            .unwrap();

        // Pretend the host slept through several fires.
        let mut schedule = view.schedule.clone();
        schedule.next_run_at = Some(Utc::now() - chrono::Duration::hours(3));
        f.store.update_schedule(&schedule).await.unwrap();

        let now = Utc::now();
        let report = f.scheduler.tick(now).await.unwrap();
        assert_eq!(report.fired, vec![schedule.id]);

        let after = f.store.get_schedule(schedule.id).await.unwrap();
        assert!(after.next_run_at.unwrap() > now);
        assert!(after.last_run_at.is_some());

        let executions = f
            .scheduler
            .engine
            .list_executions(&ExecutionFilter::default(), 50, 0)
            .await
            .unwrap();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].trigger_type, TriggerType::Scheduled);
        assert_eq!(executions[0].parameters[SCHEDULE_ID_PARAM], json!(schedule.id.to_string()));

        // Nothing due any more.
        assert!(f.scheduler.tick(now).await.unwrap().fired.is_empty());
    }

    async fn make_due(f: &Fixture, schedule: &Schedule) {
        let mut schedule = f.store.get_schedule(schedule.id).await.unwrap();
        schedule.next_run_at = Some(Utc::now() - chrono::Duration::minutes(1));
        f.store.update_schedule(&schedule).await.unwrap();
    }

    #[tokio::test]
    async fn test_tick_skips_while_previous_run_is_live() {
        let f = fixture().await;
        let view = f
            .scheduler
            .create_schedule(request(f.workflow_id, "*/5 * * * *"))
            .await
            .unwrap();
        let id = view.schedule.id;

        let live = Execution::new(
            Some(f.workflow_id),
            None,
            TriggerType::Scheduled,
            json!({ SCHEDULE_ID_PARAM: id.to_string() }),
        );
        f.store.create_execution(&live).await.unwrap();
        make_due(&f, &view.schedule).await;

        let now = Utc::now();
        let report = f.scheduler.tick(now).await.unwrap();
        assert!(report.fired.is_empty());
        assert_eq!(report.skipped, vec![id]);
        let after = f.store.get_schedule(id).await.unwrap();
        assert!(after.next_run_at.unwrap() > now);

        // Still live while running.
        f.store
            .transition_execution(live.id, ExecutionStatus::Running, None)
            .await
            .unwrap();
        make_due(&f, &view.schedule).await;
        assert_eq!(f.scheduler.tick(Utc::now()).await.unwrap().skipped, vec![id]);

        f.store
            .transition_execution(live.id, ExecutionStatus::Completed, None)
            .await
            .unwrap();
        make_due(&f, &view.schedule).await;
        let report = f.scheduler.tick(Utc::now()).await.unwrap();
        assert_eq!(report.fired, vec![id]);
        assert!(report.skipped.is_empty());
    }

    #[tokio::test]
    async fn test_tick_deactivates_schedule_with_invalid_rule() {
        let f = fixture().await;
        let view = f
            .scheduler
            .create_schedule(request(f.workflow_id, "*/5 * * * *"))
            .await
            .unwrap();
        let mut broken = view.schedule.clone();
        broken.cron_expression = "every tuesday".to_string();
        broken.next_run_at = Some(Utc::now() - chrono::Duration::minutes(1));
        f.store.update_schedule(&broken).await.unwrap();

        let report = f.scheduler.tick(Utc::now()).await.unwrap();
        assert_eq!(report.failed, vec![broken.id]);
        assert!(report.fired.is_empty());

        let after = f.store.get_schedule(broken.id).await.unwrap();
        assert!(!after.is_active);
        assert!(after.next_run_at.is_none());

        assert_eq!(f.scheduler.tick(Utc::now()).await.unwrap(), TickReport::default());
        let executions = f
            .scheduler
            .engine
            .list_executions(&ExecutionFilter::default(), 50, 0)
            .await
            .unwrap();
        assert!(executions.is_empty());
    }

    #[tokio::test]
    async fn test_toggle_clears_next_run() {
        let f = fixture().await;
        let view = f
            .scheduler
            .create_schedule(request(f.workflow_id, "0 9 * * *"))
            .await
            .unwrap();
        let off = f.scheduler.toggle_schedule(view.schedule.id).await.unwrap();
        assert!(!off.schedule.is_active);
        assert!(off.schedule.next_run_at.is_none());
        let on = f.scheduler.toggle_schedule(view.schedule.id).await.unwrap();
        assert!(on.schedule.is_active);
        assert!(on.schedule.next_run_at.is_some());
    }

    #[tokio::test]
    async fn test_manual_trigger_marks_params() {
        let f = fixture().await;
        let view = f
            .scheduler
            .create_schedule(request(f.workflow_id, "0 9 * * *"))
            .await
            .unwrap();
        let execution = f.scheduler.trigger_schedule(view.schedule.id).await.unwrap();
        assert_eq!(execution.parameters[MANUAL_TRIGGER_PARAM], json!(true));
        assert_eq!(execution.parameters[TRIGGER_TYPE_PARAM], json!("scheduled"));
    }

    #[tokio::test]
    async fn test_occurrences_projection() {
        let f = fixture().await;
        f.scheduler
            .create_schedule(request(f.workflow_id, "* * * * *"))
            .await
            .unwrap();
        let start = Utc::now();
        let projected = f
            .scheduler
            .get_occurrences(start, start + chrono::Duration::days(1), 5)
            .await
            .unwrap();
        assert_eq!(projected.len(), 1);
        assert_eq!(projected[0].occurrences.times.len(), 5);
        assert!(projected[0].occurrences.truncated);
        assert!(projected[0].occurrences.total_runs >= 1439);

        let err = f
            .scheduler
            .get_occurrences(start, start - chrono::Duration::days(1), 5)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }
}
