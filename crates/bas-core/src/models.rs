// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Domain records stored in the index.
//!
//! Every record is a plain struct that maps onto one table row
//! (`sqlx::FromRow`) and onto the snake_case JSON shape of the HTTP API.
//! JSON-valued columns are declared with `#[sqlx(json)]`.

use bas_dsl::FlowDefinition;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

/// Suffix every workflow file carries.
pub const WORKFLOW_FILE_SUFFIX: &str = ".workflow.json";

// ============================================================================
// Projects
// ============================================================================

/// A project groups workflows under one folder on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Project {
    pub id: Uuid,
    /// Unique project name.
    pub name: String,
    /// Absolute filesystem root; unique.
    pub folder_path: String,
    #[serde(default)]
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    /// Create a new project record.
    pub fn new(name: impl Into<String>, folder_path: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            folder_path: folder_path.into(),
            description: String::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

// ============================================================================
// Workflows
// ============================================================================

/// A versioned workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Workflow {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<Uuid>,
    pub name: String,
    /// Logical folder inside the project.
    #[serde(default)]
    pub folder_path: String,
    /// Path relative to the project root, ending in `.workflow.json`.
    pub file_path: String,
    /// Monotonic version, starting at 1.
    pub version: i64,
    #[sqlx(json)]
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub description: String,
    #[sqlx(json)]
    pub flow_definition: FlowDefinition,
    /// Content hash of `flow_definition`.
    pub definition_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    /// Create a version-1 workflow.
    pub fn new(
        project_id: Option<Uuid>,
        name: impl Into<String>,
        file_path: impl Into<String>,
        flow_definition: FlowDefinition,
    ) -> Self {
        let now = Utc::now();
        let definition_hash = definition_hash(&flow_definition);
        Self {
            id: Uuid::new_v4(),
            project_id,
            name: name.into(),
            folder_path: String::new(),
            file_path: file_path.into(),
            version: 1,
            tags: Vec::new(),
            description: String::new(),
            flow_definition,
            definition_hash,
            created_at: now,
            updated_at: now,
        }
    }

    /// Snapshot the current content as a history entry.
    pub fn snapshot(
        &self,
        change_source: ChangeSource,
        change_description: impl Into<String>,
        created_by: impl Into<String>,
    ) -> WorkflowVersion {
        WorkflowVersion {
            workflow_id: self.id,
            version: self.version,
            definition_hash: self.definition_hash.clone(),
            change_description: change_description.into(),
            change_source,
            flow_definition: self.flow_definition.clone(),
            created_at: Utc::now(),
            created_by: created_by.into(),
        }
    }
}

/// Where a workflow change came from.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
    sqlx::Type,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ChangeSource {
    #[default]
    Manual,
    Autosave,
    Import,
    AiGenerated,
    Recording,
}

/// Immutable history entry of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct WorkflowVersion {
    pub workflow_id: Uuid,
    pub version: i64,
    pub definition_hash: String,
    #[serde(default)]
    pub change_description: String,
    pub change_source: ChangeSource,
    #[sqlx(json)]
    pub flow_definition: FlowDefinition,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub created_by: String,
}

/// Content hash of a flow definition (hex SHA-256 of its canonical JSON).
pub fn definition_hash(def: &FlowDefinition) -> String {
    let bytes = serde_json::to_vec(def).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

/// Filter for workflow listings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkflowFilter {
    pub project_id: Option<Uuid>,
    pub tag: Option<String>,
    /// Case-insensitive substring of the name.
    pub name_contains: Option<String>,
}

// ============================================================================
// Executions
// ============================================================================

/// Execution lifecycle status.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
    sqlx::Type,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// All statuses.
    pub const ALL: [ExecutionStatus; 6] = [
        Self::Pending,
        Self::Running,
        Self::Paused,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];

    /// Completed, failed and cancelled are terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether an execution may move from `self` to `next`.
    ///
    /// Re-entering the current non-terminal status is allowed so that
    /// transitions are idempotent.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        match (self, next) {
            (a, _) if a.is_terminal() => false,
            (a, b) if *a == b => true,
            (Pending, Running | Failed | Cancelled) => true,
            (Running, Completed | Failed | Cancelled | Paused) => true,
            (Paused, Running | Cancelled) => true,
            _ => false,
        }
    }

    /// Statuses from which `next` is reachable.
    pub fn predecessors(next: ExecutionStatus) -> Vec<ExecutionStatus> {
        Self::ALL
            .into_iter()
            .filter(|s| s.can_transition_to(next))
            .collect()
    }
}

/// What started an execution.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
    sqlx::Type,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum TriggerType {
    #[default]
    Manual,
    Scheduled,
    Api,
    RecordingImport,
    Resume,
}

/// One run of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Execution {
    pub id: Uuid,
    /// `None` for ad-hoc runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<Uuid>,
    pub trigger_type: TriggerType,
    pub status: ExecutionStatus,
    /// 0 to 100.
    pub progress: i64,
    #[sqlx(json)]
    pub parameters: Value,
    /// Directory holding the artifact bundle; empty until the first write.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub result_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Execution {
    /// Create a pending execution.
    pub fn new(
        workflow_id: Option<Uuid>,
        project_id: Option<Uuid>,
        trigger_type: TriggerType,
        parameters: Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            workflow_id,
            project_id,
            trigger_type,
            status: ExecutionStatus::Pending,
            progress: 0,
            parameters,
            result_path: String::new(),
            started_at: None,
            completed_at: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Filter for execution listings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecutionFilter {
    pub workflow_id: Option<Uuid>,
    pub status: Option<ExecutionStatus>,
}

// ============================================================================
// Schedules
// ============================================================================

/// A cron rule producing scheduled executions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Schedule {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub name: String,
    /// Five-field cron expression.
    pub cron_expression: String,
    /// IANA timezone name.
    pub timezone: String,
    pub is_active: bool,
    #[sqlx(json)]
    pub parameters: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Schedule {
    /// Create an active schedule without a computed next run.
    pub fn new(
        workflow_id: Uuid,
        name: impl Into<String>,
        cron_expression: impl Into<String>,
        timezone: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            workflow_id,
            name: name.into(),
            cron_expression: cron_expression.into(),
            timezone: timezone.into(),
            is_active: true,
            parameters: Value::Object(Default::default()),
            next_run_at: None,
            last_run_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Filter for schedule listings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScheduleFilter {
    pub workflow_id: Option<Uuid>,
    #[serde(default)]
    pub active_only: bool,
}

// ============================================================================
// Exports
// ============================================================================

/// Export output format.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
    sqlx::Type,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ExportFormat {
    Mp4,
    Gif,
    Json,
    Html,
    Webm,
}

impl ExportFormat {
    /// MIME type of the rendered output.
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Mp4 => "video/mp4",
            Self::Gif => "image/gif",
            Self::Json => "application/json",
            Self::Html => "text/html",
            Self::Webm => "video/webm",
        }
    }

    /// Formats that need a compositor.
    pub fn is_video(&self) -> bool {
        matches!(self, Self::Mp4 | Self::Gif | Self::Webm)
    }
}

/// Export processing status.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
    sqlx::Type,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ExportStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

/// A rendering artifact of a finished execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Export {
    pub id: Uuid,
    pub execution_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<Uuid>,
    pub name: String,
    pub format: ExportFormat,
    /// Theme, cursor, watermark and intro/outro settings.
    #[sqlx(json)]
    pub settings: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_url: Option<String>,
    pub status: ExportStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size_bytes: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_caption: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Export {
    /// Create a pending export row.
    pub fn new(execution_id: Uuid, name: impl Into<String>, format: ExportFormat) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            execution_id,
            workflow_id: None,
            name: name.into(),
            format,
            settings: Value::Object(Default::default()),
            storage_url: None,
            status: ExportStatus::Pending,
            file_size_bytes: None,
            duration_ms: None,
            ai_caption: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Filter for export listings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExportFilter {
    pub execution_id: Option<Uuid>,
    pub workflow_id: Option<Uuid>,
}

// ============================================================================
// Settings
// ============================================================================

/// Key of the persisted export overrides.
pub const SETTING_REPLAY_CONFIG: &str = "replay_config";

/// A key/value setting row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Setting {
    pub key: String,
    #[sqlx(json)]
    pub value: Value,
    pub updated_at: DateTime<Utc>,
}
