// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow Catalog.
//!
//! The catalog exclusively owns workflow mutation. Every accepted change
//! bumps the version, appends an immutable history entry and rewrites the
//! workflow file inside the owning project's folder:
//!
//! ```text
//! <project_root>/workflows/<folder>/<slug>.workflow.json
//! ```
//!
//! Project file operations confine every path to the project root; `..`
//! components and absolute paths are rejected.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use bas_core::IndexStore;
use bas_core::models::{
    ChangeSource, Project, WORKFLOW_FILE_SUFFIX, Workflow, WorkflowFilter, WorkflowVersion,
    definition_hash,
};
use bas_core::persistence::entity;
use bas_dsl::{
    FlowDefinition, FlowGraph, GraphError, ValidationReport, normalize_flow_definition,
    resolve_flow, validate_flow, validate_resolved,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Directory inside a project root holding workflow files.
pub const WORKFLOWS_DIR: &str = "workflows";

/// Page size used when a listing has to see every row.
const SCAN_PAGE: i64 = 1000;

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateProjectRequest {
    pub name: String,
    /// Absolute folder; auto-provisioned under the projects root when absent.
    #[serde(default)]
    pub folder_path: Option<String>,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateProjectRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateWorkflowRequest {
    #[serde(default)]
    pub project_id: Option<Uuid>,
    pub name: String,
    #[serde(default)]
    pub folder_path: Option<String>,
    /// Path relative to the project root; derived from the name when absent.
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// UI-shaped or canonical flow definition.
    #[serde(default)]
    pub flow_definition: Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateWorkflowRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub flow_definition: Option<Value>,
    /// Optimistic concurrency guard.
    #[serde(default)]
    pub expected_version: Option<i64>,
    #[serde(default)]
    pub change_description: Option<String>,
    #[serde(default)]
    pub change_source: Option<ChangeSource>,
}

/// On-disk shape of a workflow file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default)]
    pub version: i64,
    pub flow_definition: FlowDefinition,
}

impl WorkflowFile {
    fn from_workflow(workflow: &Workflow) -> Self {
        Self {
            id: Some(workflow.id),
            name: workflow.name.clone(),
            description: workflow.description.clone(),
            tags: workflow.tags.clone(),
            version: workflow.version,
            flow_definition: workflow.flow_definition.clone(),
        }
    }

    /// Parse a file body. A bare flow definition is accepted and named after
    /// the file stem.
    fn parse(raw: &Value, file_path: &str) -> Result<Self> {
        let obj = raw
            .as_object()
            .ok_or_else(|| payload_error(format!("{}: expected a JSON object", file_path)))?;
        let (flow_raw, name) = match obj.get("flow_definition") {
            Some(flow) => (
                flow,
                obj.get("name").and_then(Value::as_str).map(str::to_string),
            ),
            None => (raw, None),
        };
        let flow_definition = normalize_flow_definition(flow_raw)
            .map_err(|e| payload_error(format!("{}: {}", file_path, e)))?;
        let str_field = |key: &str| {
            obj.get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        Ok(Self {
            id: obj
                .get("id")
                .and_then(Value::as_str)
                .and_then(|s| Uuid::parse_str(s).ok()),
            name: name.unwrap_or_else(|| file_stem(file_path)),
            description: str_field("description"),
            tags: obj
                .get("tags")
                .and_then(Value::as_array)
                .map(|tags| {
                    tags.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            version: obj.get("version").and_then(Value::as_i64).unwrap_or(0),
            flow_definition,
        })
    }
}

/// Outcome of reconciling a project folder with the index.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncReport {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
    pub unchanged: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

/// One entry of a project file tree.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileEntry {
    /// Path relative to the project root.
    pub path: String,
    pub is_dir: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<Uuid>,
}

/// Content of a project file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileContent {
    pub path: String,
    pub content: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<Uuid>,
}

// ============================================================================
// Catalog
// ============================================================================

/// Projects and workflows: CRUD, versioning, validation and file sync.
pub struct WorkflowCatalog {
    store: Arc<dyn IndexStore>,
    projects_root: PathBuf,
}

impl WorkflowCatalog {
    /// Create a catalog that provisions project folders under `projects_root`.
    pub fn new(store: Arc<dyn IndexStore>, projects_root: impl Into<PathBuf>) -> Self {
        Self {
            store,
            projects_root: absolute(projects_root.into()),
        }
    }

    pub fn store(&self) -> &Arc<dyn IndexStore> {
        &self.store
    }

    // ========================================================================
    // Projects
    // ========================================================================

    /// Create a project and provision its folder.
    pub async fn create_project(&self, req: CreateProjectRequest) -> Result<Project> {
        let name = req.name.trim();
        if name.is_empty() {
            return Err(Error::MissingField("name"));
        }
        if self.store.find_project_by_name(name).await?.is_some() {
            return Err(Error::Conflict(format!("project '{}' already exists", name)));
        }

        let folder = match req.folder_path.as_deref().map(str::trim) {
            Some(path) if !path.is_empty() => {
                let path = PathBuf::from(path);
                if !path.is_absolute() {
                    return Err(Error::InvalidRequest(
                        "folder_path must be an absolute path".to_string(),
                    ));
                }
                path
            }
            _ => self.projects_root.join(slugify(name)),
        };
        tokio::fs::create_dir_all(folder.join(WORKFLOWS_DIR)).await?;

        let mut project = Project::new(name, folder.to_string_lossy());
        project.description = req.description;
        self.store.create_project(&project).await?;
        info!(project_id = %project.id, folder = %project.folder_path, "Project created");
        Ok(project)
    }

    pub async fn get_project(&self, id: Uuid) -> Result<Project> {
        Ok(self.store.get_project(id).await?)
    }

    pub async fn list_projects(&self, limit: i64, offset: i64) -> Result<Vec<Project>> {
        Ok(self.store.list_projects(limit, offset).await?)
    }

    pub async fn update_project(&self, id: Uuid, req: UpdateProjectRequest) -> Result<Project> {
        let mut project = self.store.get_project(id).await?;
        if let Some(name) = req.name {
            let name = name.trim().to_string();
            if name.is_empty() {
                return Err(Error::MissingField("name"));
            }
            if name != project.name
                && let Some(existing) = self.store.find_project_by_name(&name).await?
                && existing.id != id
            {
                return Err(Error::Conflict(format!("project '{}' already exists", name)));
            }
            project.name = name;
        }
        if let Some(description) = req.description {
            project.description = description;
        }
        project.updated_at = Utc::now();
        self.store.update_project(&project).await?;
        Ok(project)
    }

    /// Delete a project, its workflows and their files.
    pub async fn delete_project(&self, id: Uuid) -> Result<()> {
        let project = self.store.get_project(id).await?;
        let workflows = self.project_workflows(id).await?;
        let root = PathBuf::from(&project.folder_path);
        for workflow in &workflows {
            remove_file_quietly(&root.join(&workflow.file_path)).await;
        }
        let ids: Vec<Uuid> = workflows.iter().map(|w| w.id).collect();
        if !ids.is_empty() {
            self.store.delete_workflows(&ids).await?;
        }
        self.store.delete_project(id).await?;
        info!(project_id = %id, workflows = ids.len(), "Project deleted");
        Ok(())
    }

    // ========================================================================
    // Workflows
    // ========================================================================

    /// Create a workflow at version 1.
    pub async fn create_workflow(
        &self,
        req: CreateWorkflowRequest,
        source: ChangeSource,
        created_by: &str,
    ) -> Result<Workflow> {
        let name = req.name.trim().to_string();
        if name.is_empty() {
            return Err(Error::MissingField("name"));
        }
        let project = match req.project_id {
            Some(id) => Some(self.store.get_project(id).await?),
            None => None,
        };
        if self
            .store
            .find_workflow_by_name(req.project_id, &name)
            .await?
            .is_some()
        {
            return Err(Error::WorkflowAlreadyExists(format!("name '{}'", name)));
        }

        let flow_definition = parse_definition(&req.flow_definition)?;
        let folder_path = match req.folder_path.as_deref().map(|f| f.trim().trim_matches('/')) {
            Some(folder) if !folder.is_empty() => confine(folder)?,
            _ => String::new(),
        };
        let file_path = match req.file_path {
            Some(path) => normalize_workflow_path(&path)?,
            None => normalize_workflow_path(&derive_file_path(&folder_path, &name))?,
        };
        if let Some(project_id) = req.project_id
            && self
                .store
                .find_workflow_by_file(project_id, &file_path)
                .await?
                .is_some()
        {
            return Err(Error::WorkflowAlreadyExists(format!("file '{}'", file_path)));
        }

        let mut workflow = Workflow::new(req.project_id, name, file_path, flow_definition);
        workflow.folder_path = folder_path;
        workflow.tags = req.tags;
        workflow.description = req.description;
        let history = workflow.snapshot(source, "Initial version", created_by);

        self.store.create_workflow(&workflow, &history).await?;
        if let Some(project) = &project {
            self.write_workflow_file(project, &workflow).await?;
        }
        info!(
            workflow_id = %workflow.id,
            name = %workflow.name,
            source = %source,
            "Workflow created"
        );
        Ok(workflow)
    }

    pub async fn get_workflow(&self, id: Uuid) -> Result<Workflow> {
        Ok(self.store.get_workflow(id).await?)
    }

    pub async fn list_workflows(
        &self,
        filter: &WorkflowFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Workflow>> {
        Ok(self.store.list_workflows(filter, limit, offset).await?)
    }

    /// Apply an update under optimistic concurrency.
    ///
    /// Without `expected_version` the update is based on the version read at
    /// the start of the call; a concurrent writer still makes it fail.
    pub async fn update_workflow(
        &self,
        id: Uuid,
        req: UpdateWorkflowRequest,
        created_by: &str,
    ) -> Result<Workflow> {
        let current = self.store.get_workflow(id).await?;
        let expected = req.expected_version.unwrap_or(current.version);
        if expected != current.version {
            return Err(Error::VersionConflict {
                workflow_id: id.to_string(),
                expected,
                actual: current.version,
            });
        }

        let mut next = current.clone();
        if let Some(name) = req.name {
            let name = name.trim().to_string();
            if name.is_empty() {
                return Err(Error::MissingField("name"));
            }
            if name != current.name
                && let Some(existing) = self
                    .store
                    .find_workflow_by_name(current.project_id, &name)
                    .await?
                && existing.id != id
            {
                return Err(Error::WorkflowAlreadyExists(format!("name '{}'", name)));
            }
            next.name = name;
        }
        if let Some(description) = req.description {
            next.description = description;
        }
        if let Some(tags) = req.tags {
            next.tags = tags;
        }
        if let Some(raw) = &req.flow_definition {
            next.flow_definition = parse_definition(raw)?;
        }

        let source = req.change_source.unwrap_or(ChangeSource::Manual);
        let description = req
            .change_description
            .unwrap_or_else(|| format!("Update to version {}", current.version + 1));
        self.commit(current, next, expected, source, description, created_by)
            .await
    }

    /// Create a new version whose content is an older snapshot.
    pub async fn restore_version(
        &self,
        id: Uuid,
        version: i64,
        note: Option<String>,
        created_by: &str,
    ) -> Result<Workflow> {
        let snapshot = self.store.get_workflow_version(id, version).await?;
        let current = self.store.get_workflow(id).await?;
        let mut next = current.clone();
        next.flow_definition = snapshot.flow_definition;
        let description = note.unwrap_or_else(|| format!("Restored from version {}", version));
        let expected = current.version;
        self.commit(
            current,
            next,
            expected,
            ChangeSource::Manual,
            description,
            created_by,
        )
        .await
    }

    async fn commit(
        &self,
        current: Workflow,
        mut next: Workflow,
        expected: i64,
        source: ChangeSource,
        description: String,
        created_by: &str,
    ) -> Result<Workflow> {
        next.version = current.version + 1;
        next.definition_hash = definition_hash(&next.flow_definition);
        next.updated_at = Utc::now();
        let history = next.snapshot(source, description, created_by);

        self.store
            .update_workflow(&next, expected, &history)
            .await?;

        if let Some(project_id) = next.project_id {
            let project = self.store.get_project(project_id).await?;
            if current.file_path != next.file_path {
                remove_file_quietly(&PathBuf::from(&project.folder_path).join(&current.file_path))
                    .await;
            }
            self.write_workflow_file(&project, &next).await?;
        }
        debug!(workflow_id = %next.id, version = next.version, "Workflow updated");
        Ok(next)
    }

    /// Delete a workflow and its file.
    pub async fn delete_workflow(&self, id: Uuid) -> Result<()> {
        let workflow = self.store.get_workflow(id).await?;
        self.store.delete_workflow(id).await?;
        if let Some(project_id) = workflow.project_id
            && let Ok(project) = self.store.get_project(project_id).await
        {
            remove_file_quietly(&PathBuf::from(&project.folder_path).join(&workflow.file_path))
                .await;
        }
        info!(workflow_id = %id, "Workflow deleted");
        Ok(())
    }

    /// Delete the listed workflows of a project; ids outside the project are
    /// ignored. Returns the number deleted.
    pub async fn bulk_delete(&self, project_id: Uuid, ids: &[Uuid]) -> Result<u64> {
        let project = self.store.get_project(project_id).await?;
        let root = PathBuf::from(&project.folder_path);
        let mut owned = Vec::with_capacity(ids.len());
        for id in ids {
            match self.store.get_workflow(*id).await {
                Ok(workflow) if workflow.project_id == Some(project_id) => {
                    remove_file_quietly(&root.join(&workflow.file_path)).await;
                    owned.push(workflow.id);
                }
                Ok(_) => debug!(workflow_id = %id, "Skipping workflow of another project"),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
        if owned.is_empty() {
            return Ok(0);
        }
        Ok(self.store.delete_workflows(&owned).await?)
    }

    pub async fn list_versions(&self, id: Uuid) -> Result<Vec<WorkflowVersion>> {
        self.store.get_workflow(id).await?;
        Ok(self.store.list_workflow_versions(id).await?)
    }

    pub async fn get_version(&self, id: Uuid, version: i64) -> Result<WorkflowVersion> {
        Ok(self.store.get_workflow_version(id, version).await?)
    }

    // ========================================================================
    // Validation
    // ========================================================================

    /// Schema and lint check of an ad-hoc definition.
    pub fn validate(&self, raw: &Value) -> Result<ValidationReport> {
        let definition = normalize_flow_definition(raw).map_err(|e| payload_error(e.to_string()))?;
        Ok(validate_flow(&definition).report())
    }

    /// Validate a definition after substituting `parameters` into it.
    pub fn validate_resolved(
        &self,
        raw: &Value,
        parameters: &Map<String, Value>,
    ) -> Result<ValidationReport> {
        let definition = normalize_flow_definition(raw).map_err(|e| payload_error(e.to_string()))?;
        let resolved = resolve_flow(&definition, parameters).map_err(payload_error)?;
        let mut result = validate_flow(&resolved);
        result.merge(validate_resolved(&resolved));
        Ok(result.report())
    }

    // ========================================================================
    // File sync
    // ========================================================================

    /// Reconcile every project folder with the index.
    pub async fn sync_all_projects(&self) -> Result<usize> {
        let projects = self.store.list_projects(SCAN_PAGE, 0).await?;
        let mut synced = 0;
        for project in projects {
            match self.sync_project_workflows(project.id).await {
                Ok(report) => {
                    synced += 1;
                    if !report.added.is_empty() || !report.removed.is_empty() {
                        info!(
                            project_id = %project.id,
                            added = report.added.len(),
                            updated = report.updated.len(),
                            removed = report.removed.len(),
                            "Project workflows synced"
                        );
                    }
                }
                Err(e) => warn!(
                    project_id = %project.id,
                    error = %e,
                    "Project sync failed (non-fatal)"
                ),
            }
        }
        Ok(synced)
    }

    /// Add new workflow files, update changed ones and drop index rows whose
    /// file disappeared.
    pub async fn sync_project_workflows(&self, project_id: Uuid) -> Result<SyncReport> {
        let project = self.store.get_project(project_id).await?;
        let root = PathBuf::from(&project.folder_path);
        let files = walk(&root, Path::new(WORKFLOWS_DIR)).await?;

        let mut report = SyncReport::default();
        let mut seen = HashSet::new();
        for entry in files.iter().filter(|e| !e.is_dir) {
            if !entry.path.ends_with(WORKFLOW_FILE_SUFFIX) {
                continue;
            }
            seen.insert(entry.path.clone());
            match self.upsert_from_file(&project, &entry.path).await {
                Ok(Upsert::Added) => report.added.push(entry.path.clone()),
                Ok(Upsert::Updated) => report.updated.push(entry.path.clone()),
                Ok(Upsert::Unchanged) => report.unchanged += 1,
                Err(e) => {
                    warn!(path = %entry.path, error = %e, "Skipping workflow file");
                    report.errors.push(format!("{}: {}", entry.path, e));
                }
            }
        }

        for workflow in self.project_workflows(project_id).await? {
            if !seen.contains(&workflow.file_path) {
                self.store.delete_workflow(workflow.id).await?;
                report.removed.push(workflow.file_path);
            }
        }
        Ok(report)
    }

    async fn upsert_from_file(&self, project: &Project, file_path: &str) -> Result<Upsert> {
        let path = PathBuf::from(&project.folder_path).join(file_path);
        let bytes = tokio::fs::read(&path).await?;
        let raw: Value = serde_json::from_slice(&bytes)
            .map_err(|e| payload_error(format!("{}: {}", file_path, e)))?;
        let parsed = WorkflowFile::parse(&raw, file_path)?;

        match self
            .store
            .find_workflow_by_file(project.id, file_path)
            .await?
        {
            Some(existing) => {
                if definition_hash(&parsed.flow_definition) == existing.definition_hash
                    && parsed.name == existing.name
                {
                    return Ok(Upsert::Unchanged);
                }
                let mut next = existing.clone();
                next.flow_definition = parsed.flow_definition;
                if !parsed.name.is_empty() && parsed.name != existing.name {
                    let taken = self
                        .store
                        .find_workflow_by_name(Some(project.id), &parsed.name)
                        .await?
                        .is_some_and(|w| w.id != existing.id);
                    if !taken {
                        next.name = parsed.name;
                    }
                }
                let expected = existing.version;
                self.commit(
                    existing,
                    next,
                    expected,
                    ChangeSource::Import,
                    "Synced from file".to_string(),
                    "file-sync",
                )
                .await?;
                Ok(Upsert::Updated)
            }
            None => {
                let mut name = parsed.name;
                if self
                    .store
                    .find_workflow_by_name(Some(project.id), &name)
                    .await?
                    .is_some()
                {
                    name = format!("{} ({})", name, file_stem(file_path));
                }
                let mut workflow = Workflow::new(
                    Some(project.id),
                    name,
                    file_path.to_string(),
                    parsed.flow_definition,
                );
                workflow.folder_path = folder_of(file_path);
                workflow.description = parsed.description;
                workflow.tags = parsed.tags;
                let history = workflow.snapshot(ChangeSource::Import, "Imported from file", "file-sync");
                self.store.create_workflow(&workflow, &history).await?;
                self.write_workflow_file(project, &workflow).await?;
                Ok(Upsert::Added)
            }
        }
    }

    // ========================================================================
    // Project files
    // ========================================================================

    /// All files and folders under the project's workflow directory.
    pub async fn file_tree(&self, project_id: Uuid) -> Result<Vec<FileEntry>> {
        let project = self.store.get_project(project_id).await?;
        let root = PathBuf::from(&project.folder_path);
        let mut entries = walk(&root, Path::new(WORKFLOWS_DIR)).await?;
        let workflows = self.project_workflows(project_id).await?;
        for entry in &mut entries {
            entry.workflow_id = workflows
                .iter()
                .find(|w| w.file_path == entry.path)
                .map(|w| w.id);
        }
        Ok(entries)
    }

    pub async fn read_file(&self, project_id: Uuid, path: &str) -> Result<FileContent> {
        let project = self.store.get_project(project_id).await?;
        let relative = confine(path)?;
        let full = PathBuf::from(&project.folder_path).join(&relative);
        let bytes = match tokio::fs::read(&full).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::not_found("file", &relative));
            }
            Err(e) => return Err(e.into()),
        };
        let content = serde_json::from_slice(&bytes)
            .map_err(|e| Error::InvalidRequest(format!("{} is not valid JSON: {}", relative, e)))?;
        let workflow_id = self
            .store
            .find_workflow_by_file(project_id, &relative)
            .await?
            .map(|w| w.id);
        Ok(FileContent {
            path: relative,
            content,
            workflow_id,
        })
    }

    /// Write a workflow file and upsert its index row.
    pub async fn write_file(&self, project_id: Uuid, path: &str, content: &Value) -> Result<Workflow> {
        let project = self.store.get_project(project_id).await?;
        let relative = normalize_workflow_path(path)?;
        WorkflowFile::parse(content, &relative)?;

        let full = PathBuf::from(&project.folder_path).join(&relative);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&full, serde_json::to_vec_pretty(content)?).await?;
        self.upsert_from_file(&project, &relative).await?;

        self.store
            .find_workflow_by_file(project_id, &relative)
            .await?
            .ok_or_else(|| Error::not_found(entity::WORKFLOW, &relative))
    }

    /// Move a workflow file; the index row follows it as a new version.
    pub async fn move_file(&self, project_id: Uuid, from: &str, to: &str) -> Result<Option<Workflow>> {
        let project = self.store.get_project(project_id).await?;
        let from = confine(from)?;
        let to = normalize_workflow_path(to)?;
        let root = PathBuf::from(&project.folder_path);
        if tokio::fs::try_exists(root.join(&to)).await? {
            return Err(Error::Conflict(format!("'{}' already exists", to)));
        }
        if !tokio::fs::try_exists(root.join(&from)).await? {
            return Err(Error::not_found("file", &from));
        }
        if let Some(parent) = root.join(&to).parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(root.join(&from), root.join(&to)).await?;

        let Some(existing) = self.store.find_workflow_by_file(project_id, &from).await? else {
            return Ok(None);
        };
        let mut next = existing.clone();
        next.file_path = to.clone();
        next.folder_path = folder_of(&to);
        let expected = existing.version;
        let moved = self
            .commit(
                existing,
                next,
                expected,
                ChangeSource::Manual,
                format!("Moved from {}", from),
                "file-ops",
            )
            .await?;
        Ok(Some(moved))
    }

    /// Delete a file and its index row.
    pub async fn delete_file(&self, project_id: Uuid, path: &str) -> Result<()> {
        let project = self.store.get_project(project_id).await?;
        let relative = confine(path)?;
        let full = PathBuf::from(&project.folder_path).join(&relative);
        match tokio::fs::remove_file(&full).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::not_found("file", &relative));
            }
            Err(e) => return Err(e.into()),
        }
        if let Some(workflow) = self.store.find_workflow_by_file(project_id, &relative).await? {
            self.store.delete_workflow(workflow.id).await?;
        }
        Ok(())
    }

    async fn write_workflow_file(&self, project: &Project, workflow: &Workflow) -> Result<()> {
        let path = PathBuf::from(&project.folder_path).join(&workflow.file_path);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let body = serde_json::to_vec_pretty(&WorkflowFile::from_workflow(workflow))?;
        tokio::fs::write(&path, body).await?;
        Ok(())
    }

    async fn project_workflows(&self, project_id: Uuid) -> Result<Vec<Workflow>> {
        let filter = WorkflowFilter {
            project_id: Some(project_id),
            ..Default::default()
        };
        let mut all = Vec::new();
        loop {
            let page = self
                .store
                .list_workflows(&filter, SCAN_PAGE, all.len() as i64)
                .await?;
            let done = page.len() < SCAN_PAGE as usize;
            all.extend(page);
            if done {
                return Ok(all);
            }
        }
    }
}

enum Upsert {
    Added,
    Updated,
    Unchanged,
}

// ============================================================================
// Helpers
// ============================================================================

fn payload_error(message: impl Into<String>) -> Error {
    Error::InvalidWorkflowPayload {
        message: message.into(),
        details: None,
    }
}

/// Normalize a raw definition and reject graphs that cannot run.
fn parse_definition(raw: &Value) -> Result<FlowDefinition> {
    if raw.is_null() {
        return Ok(FlowDefinition::default());
    }
    let definition = normalize_flow_definition(raw).map_err(|e| payload_error(e.to_string()))?;
    match FlowGraph::build(&definition) {
        Ok(_) | Err(GraphError::Empty) => Ok(definition),
        Err(e) => {
            let report = validate_flow(&definition).report();
            Err(Error::InvalidWorkflowPayload {
                message: e.to_string(),
                details: serde_json::to_value(report).ok(),
            })
        }
    }
}

/// Resolve a relative path, rejecting anything that could leave the root.
pub fn confine(path: &str) -> Result<String> {
    let trimmed = path.trim().trim_start_matches("./");
    if trimmed.is_empty() {
        return Err(Error::MissingField("path"));
    }
    let candidate = Path::new(trimmed);
    let mut parts = Vec::new();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::InvalidRequest(format!(
                    "path '{}' escapes the project root",
                    path
                )));
            }
        }
    }
    if parts.is_empty() {
        return Err(Error::MissingField("path"));
    }
    Ok(parts.join("/"))
}

/// Confine a path and require the workflow file suffix.
fn normalize_workflow_path(path: &str) -> Result<String> {
    let relative = confine(path)?;
    if !relative.ends_with(WORKFLOW_FILE_SUFFIX) {
        return Err(Error::InvalidRequest(format!(
            "file_path must end with {}",
            WORKFLOW_FILE_SUFFIX
        )));
    }
    Ok(relative)
}

fn derive_file_path(folder: &str, name: &str) -> String {
    let file = format!("{}{}", slugify(name), WORKFLOW_FILE_SUFFIX);
    if folder.is_empty() {
        format!("{}/{}", WORKFLOWS_DIR, file)
    } else {
        format!("{}/{}/{}", WORKFLOWS_DIR, folder, file)
    }
}

/// Logical folder of a workflow file (path between `workflows/` and the file).
fn folder_of(file_path: &str) -> String {
    let inner = file_path
        .strip_prefix(WORKFLOWS_DIR)
        .map(|p| p.trim_start_matches('/'))
        .unwrap_or(file_path);
    match inner.rsplit_once('/') {
        Some((folder, _)) => folder.to_string(),
        None => String::new(),
    }
}

fn file_stem(file_path: &str) -> String {
    let name = file_path.rsplit('/').next().unwrap_or(file_path);
    name.strip_suffix(WORKFLOW_FILE_SUFFIX)
        .unwrap_or(name)
        .to_string()
}

/// Lowercase, dash-separated file-system-safe name.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut dash = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            dash = false;
        } else if !dash && !slug.is_empty() {
            slug.push('-');
            dash = true;
        }
    }
    let slug = slug.trim_end_matches('-').to_string();
    if slug.is_empty() {
        "workflow".to_string()
    } else {
        slug
    }
}

fn absolute(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(&path))
            .unwrap_or(path)
    }
}

async fn remove_file_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %e, "Failed to remove workflow file (non-fatal)");
    }
}

/// Depth-first listing of `root/start`, paths relative to `root`, sorted.
async fn walk(root: &Path, start: &Path) -> Result<Vec<FileEntry>> {
    let mut entries = Vec::new();
    let mut pending = vec![start.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut reader = match tokio::fs::read_dir(root.join(&dir)).await {
            Ok(reader) => reader,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        while let Some(item) = reader.next_entry().await? {
            let relative = dir.join(item.file_name());
            let path = relative.to_string_lossy().replace('\\', "/");
            // DirEntry::metadata does not traverse symlinks.
            let meta = item.metadata().await?;
            if meta.file_type().is_symlink() {
                debug!(path = %path, "Skipping symlink in project tree");
                continue;
            }
            if meta.is_dir() {
                pending.push(relative);
                entries.push(FileEntry {
                    path,
                    is_dir: true,
                    size_bytes: None,
                    workflow_id: None,
                });
            } else {
                entries.push(FileEntry {
                    path,
                    is_dir: false,
                    size_bytes: Some(meta.len()),
                    workflow_id: None,
                });
            }
        }
    }
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(entries)
}
