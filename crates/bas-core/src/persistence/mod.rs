// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Index store interface and backends.
//!
//! The index is the durable, queryable catalogue of projects, workflows,
//! executions, schedules, exports and settings. Artifact bytes never live
//! here; see [`crate::artifacts`].

pub mod sqlite;

pub use self::sqlite::SqliteIndexStore;

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::error::CoreError;
use crate::models::{
    Execution, ExecutionFilter, ExecutionStatus, Export, ExportFilter, Project, Schedule,
    ScheduleFilter, Setting, Workflow, WorkflowFilter, WorkflowVersion,
};

/// Entity names used in `CoreError::NotFound`.
pub mod entity {
    pub const PROJECT: &str = "project";
    pub const WORKFLOW: &str = "workflow";
    pub const WORKFLOW_VERSION: &str = "workflow_version";
    pub const EXECUTION: &str = "execution";
    pub const SCHEDULE: &str = "schedule";
    pub const EXPORT: &str = "export";
    pub const SETTING: &str = "setting";
}

/// Index store contract.
///
/// Every write is transactional. `get_*` methods return
/// `CoreError::NotFound` for missing rows; `find_*` methods return `None`.
#[async_trait::async_trait]
pub trait IndexStore: Send + Sync {
    // ========================================================================
    // Projects
    // ========================================================================

    /// Insert a project.
    async fn create_project(&self, project: &Project) -> Result<(), CoreError>;

    /// Get a project by id.
    async fn get_project(&self, id: Uuid) -> Result<Project, CoreError>;

    /// Find a project by its unique name.
    async fn find_project_by_name(&self, name: &str) -> Result<Option<Project>, CoreError>;

    /// Update name, folder and description.
    async fn update_project(&self, project: &Project) -> Result<(), CoreError>;

    /// Delete a project and, by cascade, its workflows.
    async fn delete_project(&self, id: Uuid) -> Result<(), CoreError>;

    /// List projects ordered by name.
    async fn list_projects(&self, limit: i64, offset: i64) -> Result<Vec<Project>, CoreError>;

    // ========================================================================
    // Workflows
    // ========================================================================

    /// Insert a workflow together with its first history entry.
    async fn create_workflow(
        &self,
        workflow: &Workflow,
        version: &WorkflowVersion,
    ) -> Result<(), CoreError>;

    /// Get a workflow by id.
    async fn get_workflow(&self, id: Uuid) -> Result<Workflow, CoreError>;

    /// Find a workflow by name within a project (or among project-less ones).
    async fn find_workflow_by_name(
        &self,
        project_id: Option<Uuid>,
        name: &str,
    ) -> Result<Option<Workflow>, CoreError>;

    /// Find a workflow by its file path within a project.
    async fn find_workflow_by_file(
        &self,
        project_id: Uuid,
        file_path: &str,
    ) -> Result<Option<Workflow>, CoreError>;

    /// Compare-and-swap update.
    ///
    /// Succeeds only if the stored version equals `expected_version`; the
    /// row is replaced by `workflow` (whose version must be greater) and
    /// `history` is appended in the same transaction. Otherwise fails with
    /// `CoreError::VersionConflict`.
    async fn update_workflow(
        &self,
        workflow: &Workflow,
        expected_version: i64,
        history: &WorkflowVersion,
    ) -> Result<(), CoreError>;

    /// Delete a workflow and its history.
    async fn delete_workflow(&self, id: Uuid) -> Result<(), CoreError>;

    /// Delete several workflows; returns the number removed.
    async fn delete_workflows(&self, ids: &[Uuid]) -> Result<u64, CoreError>;

    /// List workflows, newest first.
    async fn list_workflows(
        &self,
        filter: &WorkflowFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Workflow>, CoreError>;

    /// History of a workflow, newest version first.
    async fn list_workflow_versions(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<WorkflowVersion>, CoreError>;

    /// One history entry.
    async fn get_workflow_version(
        &self,
        workflow_id: Uuid,
        version: i64,
    ) -> Result<WorkflowVersion, CoreError>;

    // ========================================================================
    // Executions
    // ========================================================================

    /// Insert an execution.
    async fn create_execution(&self, execution: &Execution) -> Result<(), CoreError>;

    /// Get an execution by id.
    async fn get_execution(&self, id: Uuid) -> Result<Execution, CoreError>;

    /// Move an execution to `next`.
    ///
    /// The update is guarded in SQL by the allowed predecessor statuses, so
    /// terminal states are never left. Entering `running` stamps
    /// `started_at` once; entering a terminal status stamps `completed_at`
    /// and, for `completed`, sets progress to 100. Fails with
    /// `CoreError::InvalidState` when the transition is not allowed.
    async fn transition_execution(
        &self,
        id: Uuid,
        next: ExecutionStatus,
        error: Option<&str>,
    ) -> Result<(), CoreError>;

    /// Update progress of a non-terminal execution.
    async fn update_execution_progress(&self, id: Uuid, progress: i64) -> Result<(), CoreError>;

    /// Record the artifact directory.
    async fn set_execution_result_path(&self, id: Uuid, result_path: &str)
    -> Result<(), CoreError>;

    /// List executions, newest first.
    async fn list_executions(
        &self,
        filter: &ExecutionFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Execution>, CoreError>;

    // ========================================================================
    // Schedules
    // ========================================================================

    /// Insert a schedule.
    async fn create_schedule(&self, schedule: &Schedule) -> Result<(), CoreError>;

    /// Get a schedule by id.
    async fn get_schedule(&self, id: Uuid) -> Result<Schedule, CoreError>;

    /// Replace a schedule's mutable fields.
    async fn update_schedule(&self, schedule: &Schedule) -> Result<(), CoreError>;

    /// Delete a schedule.
    async fn delete_schedule(&self, id: Uuid) -> Result<(), CoreError>;

    /// List schedules ordered by name.
    async fn list_schedules(&self, filter: &ScheduleFilter) -> Result<Vec<Schedule>, CoreError>;

    /// Active schedules whose `next_run_at` is at or before `now`.
    async fn get_active_schedules_due(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Schedule>, CoreError>;

    /// Record a fire and store the next run time.
    async fn update_schedule_last_run(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), CoreError>;

    // ========================================================================
    // Exports
    // ========================================================================

    /// Insert an export.
    async fn create_export(&self, export: &Export) -> Result<(), CoreError>;

    /// Get an export by id.
    async fn get_export(&self, id: Uuid) -> Result<Export, CoreError>;

    /// Replace an export's mutable fields.
    async fn update_export(&self, export: &Export) -> Result<(), CoreError>;

    /// Delete an export.
    async fn delete_export(&self, id: Uuid) -> Result<(), CoreError>;

    /// List exports, newest first.
    async fn list_exports(
        &self,
        filter: &ExportFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Export>, CoreError>;

    // ========================================================================
    // Settings
    // ========================================================================

    /// Read a setting.
    async fn get_setting(&self, key: &str) -> Result<Option<Setting>, CoreError>;

    /// Insert or replace a setting.
    async fn put_setting(&self, key: &str, value: &Value) -> Result<Setting, CoreError>;

    /// Remove a setting; returns whether it existed.
    async fn delete_setting(&self, key: &str) -> Result<bool, CoreError>;

    // ========================================================================
    // Health
    // ========================================================================

    /// Cheap connectivity check.
    async fn health_check(&self) -> Result<(), CoreError>;
}
