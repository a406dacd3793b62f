// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed index store.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::types::Json;
use uuid::Uuid;

use crate::error::CoreError;
use crate::models::{
    Execution, ExecutionFilter, ExecutionStatus, Export, ExportFilter, Project, Schedule,
    ScheduleFilter, Setting, Workflow, WorkflowFilter, WorkflowVersion,
};

use super::{IndexStore, entity};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

const PROJECT_COLUMNS: &str = "id, name, folder_path, description, created_at, updated_at";

const WORKFLOW_COLUMNS: &str = "id, project_id, name, folder_path, file_path, version, tags, \
     description, flow_definition, definition_hash, created_at, updated_at";

const VERSION_COLUMNS: &str = "workflow_id, version, definition_hash, change_description, \
     change_source, flow_definition, created_at, created_by";

const EXECUTION_COLUMNS: &str = "id, workflow_id, project_id, trigger_type, status, progress, \
     parameters, result_path, started_at, completed_at, error, created_at, updated_at";

const SCHEDULE_COLUMNS: &str = "id, workflow_id, name, cron_expression, timezone, is_active, \
     parameters, next_run_at, last_run_at, created_at, updated_at";

const EXPORT_COLUMNS: &str = "id, execution_id, workflow_id, name, format, settings, \
     storage_url, status, file_size_bytes, duration_ms, ai_caption, error, created_at, updated_at";

/// SQLite-backed index store.
#[derive(Clone)]
pub struct SqliteIndexStore {
    pool: SqlitePool,
}

impl SqliteIndexStore {
    /// Create a new SQLite index store from an existing, migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a new SQLite index store from a file path.
    ///
    /// This convenience constructor handles all setup:
    /// - Creates parent directories if they don't exist
    /// - Creates the database file if it doesn't exist
    /// - Connects to the database with sensible defaults
    /// - Runs all migrations
    ///
    /// # Example
    ///
    /// ```ignore
    /// let store = SqliteIndexStore::from_path(".data/studio.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {:?}: {}", path, e),
            })?;

        Self::migrate(&pool).await?;

        Ok(Self { pool })
    }

    /// In-memory store on a single connection, for tests and ephemeral runs.
    pub async fn in_memory() -> Result<Self, CoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// Run embedded migrations against a pool.
    pub async fn migrate(pool: &SqlitePool) -> Result<(), CoreError> {
        MIGRATOR
            .run(pool)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })
    }

    /// Underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn status_list(statuses: &[ExecutionStatus]) -> String {
    // Values come from a closed enum, so inlining them is safe.
    statuses
        .iter()
        .map(|s| format!("'{}'", s.as_ref()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn require_affected(rows: u64, entity: &'static str, id: Uuid) -> Result<(), CoreError> {
    if rows == 0 {
        Err(CoreError::not_found(entity, id))
    } else {
        Ok(())
    }
}

#[async_trait::async_trait]
impl IndexStore for SqliteIndexStore {
    // ========================================================================
    // Projects
    // ========================================================================

    async fn create_project(&self, project: &Project) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO projects (id, name, folder_path, description, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(project.id)
        .bind(&project.name)
        .bind(&project.folder_path)
        .bind(&project.description)
        .bind(project.created_at)
        .bind(project.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match CoreError::from(e) {
            CoreError::AlreadyExists { detail, .. } => CoreError::AlreadyExists {
                entity: entity::PROJECT,
                detail,
            },
            other => other,
        })?;

        Ok(())
    }

    async fn get_project(&self, id: Uuid) -> Result<Project, CoreError> {
        let query = format!("SELECT {} FROM projects WHERE id = ?", PROJECT_COLUMNS);
        sqlx::query_as::<_, Project>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CoreError::not_found(entity::PROJECT, id))
    }

    async fn find_project_by_name(&self, name: &str) -> Result<Option<Project>, CoreError> {
        let query = format!("SELECT {} FROM projects WHERE name = ?", PROJECT_COLUMNS);
        Ok(sqlx::query_as::<_, Project>(&query)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn update_project(&self, project: &Project) -> Result<(), CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE projects
            SET name = ?, folder_path = ?, description = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&project.name)
        .bind(&project.folder_path)
        .bind(&project.description)
        .bind(Utc::now())
        .bind(project.id)
        .execute(&self.pool)
        .await?;

        require_affected(result.rows_affected(), entity::PROJECT, project.id)
    }

    async fn delete_project(&self, id: Uuid) -> Result<(), CoreError> {
        let result = sqlx::query("DELETE FROM projects WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        require_affected(result.rows_affected(), entity::PROJECT, id)
    }

    async fn list_projects(&self, limit: i64, offset: i64) -> Result<Vec<Project>, CoreError> {
        let query = format!(
            "SELECT {} FROM projects ORDER BY name LIMIT ? OFFSET ?",
            PROJECT_COLUMNS
        );
        Ok(sqlx::query_as::<_, Project>(&query)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?)
    }

    // ========================================================================
    // Workflows
    // ========================================================================

    async fn create_workflow(
        &self,
        workflow: &Workflow,
        version: &WorkflowVersion,
    ) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO workflows (id, project_id, name, folder_path, file_path, version, tags,
                                   description, flow_definition, definition_hash,
                                   created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(workflow.id)
        .bind(workflow.project_id)
        .bind(&workflow.name)
        .bind(&workflow.folder_path)
        .bind(&workflow.file_path)
        .bind(workflow.version)
        .bind(Json(&workflow.tags))
        .bind(&workflow.description)
        .bind(Json(&workflow.flow_definition))
        .bind(&workflow.definition_hash)
        .bind(workflow.created_at)
        .bind(workflow.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| match CoreError::from(e) {
            CoreError::AlreadyExists { .. } => CoreError::AlreadyExists {
                entity: entity::WORKFLOW,
                detail: format!("file '{}'", workflow.file_path),
            },
            other => other,
        })?;

        insert_version(&mut tx, version).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_workflow(&self, id: Uuid) -> Result<Workflow, CoreError> {
        let query = format!("SELECT {} FROM workflows WHERE id = ?", WORKFLOW_COLUMNS);
        sqlx::query_as::<_, Workflow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CoreError::not_found(entity::WORKFLOW, id))
    }

    async fn find_workflow_by_name(
        &self,
        project_id: Option<Uuid>,
        name: &str,
    ) -> Result<Option<Workflow>, CoreError> {
        let query = format!(
            "SELECT {} FROM workflows WHERE project_id IS ? AND name = ? LIMIT 1",
            WORKFLOW_COLUMNS
        );
        Ok(sqlx::query_as::<_, Workflow>(&query)
            .bind(project_id)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn find_workflow_by_file(
        &self,
        project_id: Uuid,
        file_path: &str,
    ) -> Result<Option<Workflow>, CoreError> {
        let query = format!(
            "SELECT {} FROM workflows WHERE project_id = ? AND file_path = ?",
            WORKFLOW_COLUMNS
        );
        Ok(sqlx::query_as::<_, Workflow>(&query)
            .bind(project_id)
            .bind(file_path)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn update_workflow(
        &self,
        workflow: &Workflow,
        expected_version: i64,
        history: &WorkflowVersion,
    ) -> Result<(), CoreError> {
        if workflow.version <= expected_version {
            return Err(CoreError::validation(
                "version",
                format!(
                    "new version {} must be greater than {}",
                    workflow.version, expected_version
                ),
            ));
        }

        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE workflows
            SET project_id = ?, name = ?, folder_path = ?, file_path = ?, version = ?, tags = ?,
                description = ?, flow_definition = ?, definition_hash = ?, updated_at = ?
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(workflow.project_id)
        .bind(&workflow.name)
        .bind(&workflow.folder_path)
        .bind(&workflow.file_path)
        .bind(workflow.version)
        .bind(Json(&workflow.tags))
        .bind(&workflow.description)
        .bind(Json(&workflow.flow_definition))
        .bind(&workflow.definition_hash)
        .bind(workflow.updated_at)
        .bind(workflow.id)
        .bind(expected_version)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            let current: Option<i64> = sqlx::query_scalar("SELECT version FROM workflows WHERE id = ?")
                .bind(workflow.id)
                .fetch_optional(&mut *tx)
                .await?;
            tx.rollback().await?;
            return Err(match current {
                None => CoreError::not_found(entity::WORKFLOW, workflow.id),
                Some(actual) => CoreError::VersionConflict {
                    workflow_id: workflow.id.to_string(),
                    expected: expected_version,
                    actual,
                },
            });
        }

        insert_version(&mut tx, history).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn delete_workflow(&self, id: Uuid) -> Result<(), CoreError> {
        let result = sqlx::query("DELETE FROM workflows WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        require_affected(result.rows_affected(), entity::WORKFLOW, id)
    }

    async fn delete_workflows(&self, ids: &[Uuid]) -> Result<u64, CoreError> {
        let mut tx = self.pool.begin().await?;
        let mut removed = 0;
        for id in ids {
            removed += sqlx::query("DELETE FROM workflows WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        Ok(removed)
    }

    async fn list_workflows(
        &self,
        filter: &WorkflowFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Workflow>, CoreError> {
        let query = format!(
            r#"
            SELECT {}
            FROM workflows
            WHERE (?1 IS NULL OR project_id = ?1)
              AND (?2 IS NULL OR EXISTS (SELECT 1 FROM json_each(workflows.tags) WHERE value = ?2))
              AND (?3 IS NULL OR LOWER(name) LIKE '%' || LOWER(?3) || '%')
            ORDER BY rowid DESC
            LIMIT ?4 OFFSET ?5
            "#,
            WORKFLOW_COLUMNS
        );
        Ok(sqlx::query_as::<_, Workflow>(&query)
            .bind(filter.project_id)
            .bind(&filter.tag)
            .bind(&filter.name_contains)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn list_workflow_versions(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<WorkflowVersion>, CoreError> {
        let query = format!(
            "SELECT {} FROM workflow_versions WHERE workflow_id = ? ORDER BY version DESC",
            VERSION_COLUMNS
        );
        Ok(sqlx::query_as::<_, WorkflowVersion>(&query)
            .bind(workflow_id)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn get_workflow_version(
        &self,
        workflow_id: Uuid,
        version: i64,
    ) -> Result<WorkflowVersion, CoreError> {
        let query = format!(
            "SELECT {} FROM workflow_versions WHERE workflow_id = ? AND version = ?",
            VERSION_COLUMNS
        );
        sqlx::query_as::<_, WorkflowVersion>(&query)
            .bind(workflow_id)
            .bind(version)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| {
                CoreError::not_found(entity::WORKFLOW_VERSION, format!("{}@{}", workflow_id, version))
            })
    }

    // ========================================================================
    // Executions
    // ========================================================================

    async fn create_execution(&self, execution: &Execution) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO executions (id, workflow_id, project_id, trigger_type, status, progress,
                                    parameters, result_path, started_at, completed_at, error,
                                    created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(execution.id)
        .bind(execution.workflow_id)
        .bind(execution.project_id)
        .bind(execution.trigger_type)
        .bind(execution.status)
        .bind(execution.progress)
        .bind(Json(&execution.parameters))
        .bind(&execution.result_path)
        .bind(execution.started_at)
        .bind(execution.completed_at)
        .bind(&execution.error)
        .bind(execution.created_at)
        .bind(execution.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> Result<Execution, CoreError> {
        let query = format!("SELECT {} FROM executions WHERE id = ?", EXECUTION_COLUMNS);
        sqlx::query_as::<_, Execution>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CoreError::not_found(entity::EXECUTION, id))
    }

    async fn transition_execution(
        &self,
        id: Uuid,
        next: ExecutionStatus,
        error: Option<&str>,
    ) -> Result<(), CoreError> {
        let predecessors = ExecutionStatus::predecessors(next);
        let terminal: Vec<ExecutionStatus> = ExecutionStatus::ALL
            .into_iter()
            .filter(|s| s.is_terminal())
            .collect();

        let query = format!(
            r#"
            UPDATE executions
            SET status = ?1,
                error = COALESCE(?2, error),
                started_at = CASE WHEN ?1 = 'running' AND started_at IS NULL THEN ?3 ELSE started_at END,
                completed_at = CASE WHEN ?1 IN ({terminal}) THEN ?3 ELSE completed_at END,
                progress = CASE WHEN ?1 = 'completed' THEN 100 ELSE progress END,
                updated_at = ?3
            WHERE id = ?4 AND status IN ({allowed})
            "#,
            terminal = status_list(&terminal),
            allowed = status_list(&predecessors),
        );

        let result = sqlx::query(&query)
            .bind(next.as_ref())
            .bind(error)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            let current = self.get_execution(id).await?;
            return Err(CoreError::InvalidState {
                entity: entity::EXECUTION,
                id: id.to_string(),
                current: current.status.to_string(),
                requested: next.to_string(),
            });
        }

        Ok(())
    }

    async fn update_execution_progress(&self, id: Uuid, progress: i64) -> Result<(), CoreError> {
        let query = format!(
            r#"
            UPDATE executions
            SET progress = ?, updated_at = ?
            WHERE id = ? AND status NOT IN ({})
            "#,
            status_list(&[
                ExecutionStatus::Completed,
                ExecutionStatus::Failed,
                ExecutionStatus::Cancelled
            ])
        );
        sqlx::query(&query)
            .bind(progress.clamp(0, 100))
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn set_execution_result_path(
        &self,
        id: Uuid,
        result_path: &str,
    ) -> Result<(), CoreError> {
        let result =
            sqlx::query("UPDATE executions SET result_path = ?, updated_at = ? WHERE id = ?")
                .bind(result_path)
                .bind(Utc::now())
                .bind(id)
                .execute(&self.pool)
                .await?;

        require_affected(result.rows_affected(), entity::EXECUTION, id)
    }

    async fn list_executions(
        &self,
        filter: &ExecutionFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Execution>, CoreError> {
        let query = format!(
            r#"
            SELECT {}
            FROM executions
            WHERE (?1 IS NULL OR workflow_id = ?1)
              AND (?2 IS NULL OR status = ?2)
            ORDER BY rowid DESC
            LIMIT ?3 OFFSET ?4
            "#,
            EXECUTION_COLUMNS
        );
        Ok(sqlx::query_as::<_, Execution>(&query)
            .bind(filter.workflow_id)
            .bind(filter.status.map(|s| s.as_ref().to_string()))
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?)
    }

    // ========================================================================
    // Schedules
    // ========================================================================

    async fn create_schedule(&self, schedule: &Schedule) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO schedules (id, workflow_id, name, cron_expression, timezone, is_active,
                                   parameters, next_run_at, last_run_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(schedule.id)
        .bind(schedule.workflow_id)
        .bind(&schedule.name)
        .bind(&schedule.cron_expression)
        .bind(&schedule.timezone)
        .bind(schedule.is_active)
        .bind(Json(&schedule.parameters))
        .bind(schedule.next_run_at)
        .bind(schedule.last_run_at)
        .bind(schedule.created_at)
        .bind(schedule.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_schedule(&self, id: Uuid) -> Result<Schedule, CoreError> {
        let query = format!("SELECT {} FROM schedules WHERE id = ?", SCHEDULE_COLUMNS);
        sqlx::query_as::<_, Schedule>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CoreError::not_found(entity::SCHEDULE, id))
    }

    async fn update_schedule(&self, schedule: &Schedule) -> Result<(), CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE schedules
            SET workflow_id = ?, name = ?, cron_expression = ?, timezone = ?, is_active = ?,
                parameters = ?, next_run_at = ?, last_run_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(schedule.workflow_id)
        .bind(&schedule.name)
        .bind(&schedule.cron_expression)
        .bind(&schedule.timezone)
        .bind(schedule.is_active)
        .bind(Json(&schedule.parameters))
        .bind(schedule.next_run_at)
        .bind(schedule.last_run_at)
        .bind(Utc::now())
        .bind(schedule.id)
        .execute(&self.pool)
        .await?;

        require_affected(result.rows_affected(), entity::SCHEDULE, schedule.id)
    }

    async fn delete_schedule(&self, id: Uuid) -> Result<(), CoreError> {
        let result = sqlx::query("DELETE FROM schedules WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        require_affected(result.rows_affected(), entity::SCHEDULE, id)
    }

    async fn list_schedules(&self, filter: &ScheduleFilter) -> Result<Vec<Schedule>, CoreError> {
        let query = format!(
            r#"
            SELECT {}
            FROM schedules
            WHERE (?1 IS NULL OR workflow_id = ?1)
              AND (NOT ?2 OR is_active = 1)
            ORDER BY name, rowid
            "#,
            SCHEDULE_COLUMNS
        );
        Ok(sqlx::query_as::<_, Schedule>(&query)
            .bind(filter.workflow_id)
            .bind(filter.active_only)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn get_active_schedules_due(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Schedule>, CoreError> {
        let query = format!(
            r#"
            SELECT {}
            FROM schedules
            WHERE is_active = 1
              AND next_run_at IS NOT NULL
              AND julianday(next_run_at) <= julianday(?)
            ORDER BY julianday(next_run_at), rowid
            "#,
            SCHEDULE_COLUMNS
        );
        Ok(sqlx::query_as::<_, Schedule>(&query)
            .bind(now)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn update_schedule_last_run(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE schedules
            SET last_run_at = ?, next_run_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(at)
        .bind(next_run_at)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        require_affected(result.rows_affected(), entity::SCHEDULE, id)
    }

    // ========================================================================
    // Exports
    // ========================================================================

    async fn create_export(&self, export: &Export) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO exports (id, execution_id, workflow_id, name, format, settings,
                                 storage_url, status, file_size_bytes, duration_ms, ai_caption,
                                 error, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(export.id)
        .bind(export.execution_id)
        .bind(export.workflow_id)
        .bind(&export.name)
        .bind(export.format)
        .bind(Json(&export.settings))
        .bind(&export.storage_url)
        .bind(export.status)
        .bind(export.file_size_bytes)
        .bind(export.duration_ms)
        .bind(&export.ai_caption)
        .bind(&export.error)
        .bind(export.created_at)
        .bind(export.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_export(&self, id: Uuid) -> Result<Export, CoreError> {
        let query = format!("SELECT {} FROM exports WHERE id = ?", EXPORT_COLUMNS);
        sqlx::query_as::<_, Export>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CoreError::not_found(entity::EXPORT, id))
    }

    async fn update_export(&self, export: &Export) -> Result<(), CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE exports
            SET name = ?, format = ?, settings = ?, storage_url = ?, status = ?,
                file_size_bytes = ?, duration_ms = ?, ai_caption = ?, error = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&export.name)
        .bind(export.format)
        .bind(Json(&export.settings))
        .bind(&export.storage_url)
        .bind(export.status)
        .bind(export.file_size_bytes)
        .bind(export.duration_ms)
        .bind(&export.ai_caption)
        .bind(&export.error)
        .bind(Utc::now())
        .bind(export.id)
        .execute(&self.pool)
        .await?;

        require_affected(result.rows_affected(), entity::EXPORT, export.id)
    }

    async fn delete_export(&self, id: Uuid) -> Result<(), CoreError> {
        let result = sqlx::query("DELETE FROM exports WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        require_affected(result.rows_affected(), entity::EXPORT, id)
    }

    async fn list_exports(
        &self,
        filter: &ExportFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Export>, CoreError> {
        let query = format!(
            r#"
            SELECT {}
            FROM exports
            WHERE (?1 IS NULL OR execution_id = ?1)
              AND (?2 IS NULL OR workflow_id = ?2)
            ORDER BY rowid DESC
            LIMIT ?3 OFFSET ?4
            "#,
            EXPORT_COLUMNS
        );
        Ok(sqlx::query_as::<_, Export>(&query)
            .bind(filter.execution_id)
            .bind(filter.workflow_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?)
    }

    // ========================================================================
    // Settings
    // ========================================================================

    async fn get_setting(&self, key: &str) -> Result<Option<Setting>, CoreError> {
        Ok(sqlx::query_as::<_, Setting>(
            "SELECT key, value, updated_at FROM settings WHERE key = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn put_setting(&self, key: &str, value: &Value) -> Result<Setting, CoreError> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO settings (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(Json(value))
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(Setting {
            key: key.to_string(),
            value: value.clone(),
            updated_at: now,
        })
    }

    async fn delete_setting(&self, key: &str) -> Result<bool, CoreError> {
        let result = sqlx::query("DELETE FROM settings WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ========================================================================
    // Health
    // ========================================================================

    async fn health_check(&self) -> Result<(), CoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

async fn insert_version(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    version: &WorkflowVersion,
) -> Result<(), CoreError> {
    sqlx::query(
        r#"
        INSERT INTO workflow_versions (workflow_id, version, definition_hash, change_description,
                                       change_source, flow_definition, created_at, created_by)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(version.workflow_id)
    .bind(version.version)
    .bind(&version.definition_hash)
    .bind(&version.change_description)
    .bind(version.change_source)
    .bind(Json(&version.flow_definition))
    .bind(version.created_at)
    .bind(&version.created_by)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChangeSource, ExportFormat, TriggerType};
    use bas_dsl::FlowDefinition;
    use chrono::Duration;
    use serde_json::json;

    async fn test_store() -> SqliteIndexStore {
        SqliteIndexStore::in_memory()
            .await
            .expect("Failed to create in-memory SQLite store")
    }

    fn flow(url: &str) -> FlowDefinition {
        bas_dsl::parse_flow_definition(&json!({
            "nodes": [{"id": "n1", "type": "navigate", "action": {"url": url}}]
        }))
        .unwrap()
    }

    async fn seed_workflow(store: &SqliteIndexStore) -> Workflow {
        let workflow = Workflow::new(None, "login", "login.workflow.json", flow("https://a.test"));
        let version = workflow.snapshot(ChangeSource::Manual, "created", "tester");
        store.create_workflow(&workflow, &version).await.unwrap();
        workflow
    }

    #[tokio::test]
    async fn test_project_crud_and_uniqueness() {
        let store = test_store().await;
        let project = Project::new("demo", "/tmp/demo");
        store.create_project(&project).await.unwrap();

        let loaded = store.get_project(project.id).await.unwrap();
        assert_eq!(loaded.name, "demo");

        let dup = Project::new("demo", "/tmp/other");
        let err = store.create_project(&dup).await.unwrap_err();
        assert_eq!(err.error_code(), "ALREADY_EXISTS");

        store.delete_project(project.id).await.unwrap();
        assert!(store.get_project(project.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_project_delete_cascades_workflows() {
        let store = test_store().await;
        let project = Project::new("p", "/tmp/p");
        store.create_project(&project).await.unwrap();
        let workflow = Workflow::new(Some(project.id), "w", "w.workflow.json", flow("https://a.test"));
        store
            .create_workflow(&workflow, &workflow.snapshot(ChangeSource::Manual, "", ""))
            .await
            .unwrap();

        store.delete_project(project.id).await.unwrap();
        assert!(store.get_workflow(workflow.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_workflow_round_trip() {
        let store = test_store().await;
        let workflow = seed_workflow(&store).await;

        let loaded = store.get_workflow(workflow.id).await.unwrap();
        assert_eq!(loaded.flow_definition, workflow.flow_definition);
        assert_eq!(loaded.version, 1);

        let versions = store.list_workflow_versions(workflow.id).await.unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].change_source, ChangeSource::Manual);
    }

    #[tokio::test]
    async fn test_workflow_compare_and_swap() {
        let store = test_store().await;
        let mut workflow = seed_workflow(&store).await;

        workflow.version = 2;
        workflow.flow_definition = flow("https://b.test");
        let history = workflow.snapshot(ChangeSource::Autosave, "edit", "tester");
        store.update_workflow(&workflow, 1, &history).await.unwrap();

        // Second writer based on version 1 loses.
        let err = store.update_workflow(&workflow, 1, &history).await.unwrap_err();
        match err {
            CoreError::VersionConflict {
                expected, actual, ..
            } => {
                assert_eq!(expected, 1);
                assert_eq!(actual, 2);
            }
            other => panic!("unexpected error {:?}", other),
        }

        assert_eq!(store.get_workflow(workflow.id).await.unwrap().version, 2);
        assert_eq!(store.list_workflow_versions(workflow.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_workflow_filters() {
        let store = test_store().await;
        let mut tagged = Workflow::new(None, "Checkout Flow", "a.workflow.json", flow("https://a.test"));
        tagged.tags = vec!["smoke".to_string()];
        store
            .create_workflow(&tagged, &tagged.snapshot(ChangeSource::Manual, "", ""))
            .await
            .unwrap();
        seed_workflow(&store).await;

        let by_tag = WorkflowFilter {
            tag: Some("smoke".to_string()),
            ..Default::default()
        };
        let found = store.list_workflows(&by_tag, 50, 0).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, tagged.id);

        let by_name = WorkflowFilter {
            name_contains: Some("checkout".to_string()),
            ..Default::default()
        };
        assert_eq!(store.list_workflows(&by_name, 50, 0).await.unwrap().len(), 1);
        assert_eq!(
            store
                .list_workflows(&WorkflowFilter::default(), 50, 0)
                .await
                .unwrap()
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn test_execution_transitions_are_guarded() {
        let store = test_store().await;
        let execution = Execution::new(None, None, TriggerType::Api, json!({}));
        store.create_execution(&execution).await.unwrap();

        store
            .transition_execution(execution.id, ExecutionStatus::Running, None)
            .await
            .unwrap();
        let running = store.get_execution(execution.id).await.unwrap();
        assert!(running.started_at.is_some());

        store
            .transition_execution(execution.id, ExecutionStatus::Completed, None)
            .await
            .unwrap();
        let done = store.get_execution(execution.id).await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert_eq!(done.progress, 100);
        assert!(done.completed_at.is_some());

        let err = store
            .transition_execution(execution.id, ExecutionStatus::Running, None)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_STATE");

        // Progress does not move after a terminal state.
        store.update_execution_progress(execution.id, 10).await.unwrap();
        assert_eq!(store.get_execution(execution.id).await.unwrap().progress, 100);
    }

    #[tokio::test]
    async fn test_transition_missing_execution() {
        let store = test_store().await;
        let err = store
            .transition_execution(Uuid::new_v4(), ExecutionStatus::Running, None)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_failed_transition_keeps_error() {
        let store = test_store().await;
        let execution = Execution::new(None, None, TriggerType::Manual, json!({"a": 1}));
        store.create_execution(&execution).await.unwrap();
        store
            .transition_execution(execution.id, ExecutionStatus::Running, None)
            .await
            .unwrap();
        store
            .transition_execution(execution.id, ExecutionStatus::Failed, Some("boom"))
            .await
            .unwrap();

        let failed = store.get_execution(execution.id).await.unwrap();
        assert_eq!(failed.error.as_deref(), Some("boom"));
        assert_eq!(failed.parameters, json!({"a": 1}));

        let listed = store
            .list_executions(
                &ExecutionFilter {
                    status: Some(ExecutionStatus::Failed),
                    ..Default::default()
                },
                10,
                0,
            )
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn test_due_schedules() {
        let store = test_store().await;
        let workflow = seed_workflow(&store).await;
        let now = Utc::now();

        let mut due = Schedule::new(workflow.id, "due", "*/5 * * * *", "UTC");
        due.next_run_at = Some(now - Duration::minutes(1));
        store.create_schedule(&due).await.unwrap();

        let mut later = Schedule::new(workflow.id, "later", "0 * * * *", "UTC");
        later.next_run_at = Some(now + Duration::hours(1));
        store.create_schedule(&later).await.unwrap();

        let mut paused = Schedule::new(workflow.id, "paused", "* * * * *", "UTC");
        paused.is_active = false;
        paused.next_run_at = Some(now - Duration::minutes(5));
        store.create_schedule(&paused).await.unwrap();

        let found = store.get_active_schedules_due(now).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, due.id);

        let next = now + Duration::minutes(4);
        store
            .update_schedule_last_run(due.id, now, Some(next))
            .await
            .unwrap();
        assert!(store.get_active_schedules_due(now).await.unwrap().is_empty());
        let reloaded = store.get_schedule(due.id).await.unwrap();
        assert_eq!(
            reloaded.last_run_at.map(|t| t.timestamp_millis()),
            Some(now.timestamp_millis())
        );
    }

    #[tokio::test]
    async fn test_exports_and_settings() {
        let store = test_store().await;
        let execution_id = Uuid::new_v4();
        let mut export = Export::new(execution_id, "demo", ExportFormat::Json);
        store.create_export(&export).await.unwrap();

        export.ai_caption = Some("A short demo".to_string());
        store.update_export(&export).await.unwrap();
        let listed = store
            .list_exports(
                &ExportFilter {
                    execution_id: Some(execution_id),
                    ..Default::default()
                },
                10,
                0,
            )
            .await
            .unwrap();
        assert_eq!(listed[0].ai_caption.as_deref(), Some("A short demo"));

        assert!(store.get_setting("replay_config").await.unwrap().is_none());
        store
            .put_setting("replay_config", &json!({"chromeTheme": "aurora"}))
            .await
            .unwrap();
        store
            .put_setting("replay_config", &json!({"chromeTheme": "solar"}))
            .await
            .unwrap();
        let setting = store.get_setting("replay_config").await.unwrap().unwrap();
        assert_eq!(setting.value, json!({"chromeTheme": "solar"}));
        assert!(store.delete_setting("replay_config").await.unwrap());
        assert!(!store.delete_setting("replay_config").await.unwrap());
    }
}
