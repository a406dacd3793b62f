// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Recording archive import.
//!
//! An archive is a zip holding `manifest.json` plus asset files. Assets are
//! extracted into a fresh execution's result directory and the manifest's
//! frames become that execution's timeline.

use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use bas_core::models::{Execution, ExecutionStatus, TriggerType};
use bas_core::timeline::{RESULT_FILE, TIMELINE_FILE};
use bas_core::{ExecutionTimeline, Frame, FrameStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};
use uuid::Uuid;
use zip::ZipArchive;

use super::TransferService;
use crate::error::{Error, Result};
use crate::execution::{DEFINITION_FILE, screenshot_file};

/// Largest accepted archive.
pub const MAX_IMPORT_BYTES: u64 = 200 * 1024 * 1024;

/// Largest total of decompressed entry bytes one archive may expand to.
pub const MAX_EXTRACTED_BYTES: u64 = 4 * MAX_IMPORT_BYTES;

/// Deadline of one import.
pub const IMPORT_TIMEOUT: Duration = Duration::from_secs(120);

/// Manifest entry name inside an archive.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Current manifest version.
pub const MANIFEST_VERSION: u32 = 1;

/// Frame descriptor of a recording manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManifestFrame {
    pub step_index: u32,
    pub node_id: String,
    #[serde(default)]
    pub step_type: String,
    #[serde(default = "default_success")]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    /// Archive-relative path of the step screenshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn default_success() -> bool {
    true
}

fn default_version() -> u32 {
    MANIFEST_VERSION
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecordingManifest {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    pub frames: Vec<ManifestFrame>,
}

impl RecordingManifest {
    /// Manifest describing an execution timeline.
    pub fn from_timeline(timeline: &ExecutionTimeline) -> Self {
        let frames: Vec<ManifestFrame> = timeline
            .entries
            .iter()
            .map(|f| ManifestFrame {
                step_index: f.step_index,
                node_id: f.node_id.clone(),
                step_type: f.step_type.clone(),
                success: f.success,
                started_at: Some(f.started_at),
                duration_ms: Some(f.duration_ms()),
                screenshot: f
                    .screenshot_ref
                    .as_ref()
                    .map(|_| screenshot_file(f.step_index)),
                url: f.url.clone(),
                error: f.error.clone(),
            })
            .collect();
        let duration_ms = match (timeline.entries.first(), timeline.entries.last()) {
            (Some(first), Some(last)) => Some((last.ended_at - first.started_at).num_milliseconds().max(0)),
            _ => None,
        };
        Self {
            version: MANIFEST_VERSION,
            duration_ms,
            frames,
        }
    }

    fn total_duration_ms(&self) -> i64 {
        self.duration_ms.unwrap_or_else(|| {
            self.frames
                .iter()
                .map(|f| f.duration_ms.unwrap_or(0).max(0))
                .sum()
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImportOptions {
    #[serde(default)]
    pub workflow_id: Option<Uuid>,
    #[serde(default)]
    pub project_id: Option<Uuid>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImportSummary {
    pub execution_id: Uuid,
    pub frames: usize,
    pub assets: usize,
    pub duration_ms: i64,
}

/// Result of unpacking an archive on a blocking thread.
struct Extracted {
    manifest: RecordingManifest,
    assets: Vec<String>,
}

impl TransferService {
    /// Import a recording archive as a completed execution.
    pub async fn import_archive(&self, archive: Vec<u8>, options: ImportOptions) -> Result<ImportSummary> {
        if archive.is_empty() {
            return Err(Error::InvalidRequest("archive missing".to_string()));
        }
        if archive.len() as u64 > MAX_IMPORT_BYTES {
            return Err(Error::RequestTooLarge {
                limit: MAX_IMPORT_BYTES,
            });
        }
        match tokio::time::timeout(IMPORT_TIMEOUT, self.import_inner(archive, options)).await {
            Ok(result) => result,
            Err(_) => Err(Error::RequestTimeout(format!(
                "archive import exceeded {} s",
                IMPORT_TIMEOUT.as_secs()
            ))),
        }
    }

    async fn import_inner(&self, archive: Vec<u8>, options: ImportOptions) -> Result<ImportSummary> {
        let started = Instant::now();
        if let Some(workflow_id) = options.workflow_id {
            self.store().get_workflow(workflow_id).await?;
        }
        let mut params = Map::new();
        if let Some(name) = options.name.as_ref().filter(|n| !n.trim().is_empty()) {
            params.insert("archive_name".into(), Value::String(name.clone()));
        }
        let mut execution = Execution::new(
            options.workflow_id,
            options.project_id,
            TriggerType::RecordingImport,
            Value::Object(params),
        );
        let result_path = self.engine.result_path_for(execution.id);
        let dest = result_path.clone();
        let extracted = tokio::task::spawn_blocking(move || {
            extract_archive(&archive, &dest, MAX_EXTRACTED_BYTES)
        })
            .await
            .map_err(|e| Error::Internal(format!("archive extraction task failed: {}", e)))?;
        let extracted = match extracted {
            Ok(extracted) => extracted,
            Err(e) => {
                if let Err(cleanup) = tokio::fs::remove_dir_all(&result_path).await
                    && cleanup.kind() != std::io::ErrorKind::NotFound
                {
                    warn!(path = %result_path.display(), error = %cleanup, "Failed to clean up rejected import (non-fatal)");
                }
                return Err(e);
            }
        };

        execution.result_path = result_path.to_string_lossy().into_owned();
        let store = self.store();
        store.create_execution(&execution).await?;
        store
            .set_execution_result_path(execution.id, &execution.result_path)
            .await?;
        store
            .transition_execution(execution.id, ExecutionStatus::Running, None)
            .await?;

        let timeline = build_timeline(execution.id, &extracted.manifest);
        timeline.write_to(&result_path).await?;
        let failure = timeline
            .entries
            .iter()
            .find(|f| !f.success)
            .map(|f| f.error.clone().unwrap_or_else(|| format!("step {} failed", f.step_index)));
        match failure {
            Some(error) => {
                store
                    .transition_execution(execution.id, ExecutionStatus::Failed, Some(&error))
                    .await?
            }
            None => {
                store
                    .transition_execution(execution.id, ExecutionStatus::Completed, None)
                    .await?
            }
        }

        let summary = ImportSummary {
            execution_id: execution.id,
            frames: extracted.manifest.frames.len(),
            assets: extracted.assets.len(),
            duration_ms: extracted.manifest.total_duration_ms(),
        };
        info!(
            execution_id = %execution.id,
            frames = summary.frames,
            assets = summary.assets,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Recording archive imported"
        );
        Ok(summary)
    }
}

fn invalid(msg: impl Into<String>) -> Error {
    Error::InvalidRequest(msg.into())
}

/// Unpack `bytes` into `dest`. Entry sizes in zip headers are not trusted;
/// reading stops once `budget` decompressed bytes have been produced.
fn extract_archive(bytes: &[u8], dest: &Path, budget: u64) -> Result<Extracted> {
    let mut archive =
        ZipArchive::new(Cursor::new(bytes)).map_err(|e| invalid(format!("invalid archive: {}", e)))?;

    let mut manifest: Option<RecordingManifest> = None;
    let mut assets = Vec::new();
    let mut remaining = budget;
    std::fs::create_dir_all(dest)?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| invalid(format!("failed to read archive entry {}: {}", i, e)))?;
        if entry.is_dir() {
            continue;
        }
        let name = entry
            .enclosed_name()
            .ok_or_else(|| invalid(format!("archive entry '{}' escapes the archive root", entry.name())))?;
        let relative = normalized(&name);

        let mut contents = Vec::with_capacity(entry.size().min(remaining) as usize);
        (&mut entry)
            .take(remaining + 1)
            .read_to_end(&mut contents)
            .map_err(|e| invalid(format!("failed to read '{}': {}", relative, e)))?;
        if contents.len() as u64 > remaining {
            warn!(entry = %relative, limit_bytes = budget, "Archive expands past the extraction limit");
            return Err(Error::RequestTooLarge { limit: budget });
        }
        remaining -= contents.len() as u64;

        if relative == MANIFEST_FILE {
            let parsed: RecordingManifest = serde_json::from_slice(&contents)
                .map_err(|e| invalid(format!("invalid manifest: {}", e)))?;
            manifest = Some(parsed);
            continue;
        }
        let target = dest.join(&name);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&target, &contents)?;
        assets.push(relative);
    }

    let manifest = manifest.ok_or_else(|| invalid(format!("archive has no {}", MANIFEST_FILE)))?;
    validate_manifest(&manifest, &assets)?;

    // Screenshots live under their canonical step path only.
    let mut canonical_paths = std::collections::HashSet::new();
    let mut relocated = Vec::new();
    for frame in &manifest.frames {
        if let Some(shot) = &frame.screenshot {
            let canonical = screenshot_file(frame.step_index);
            if *shot != canonical {
                let target = dest.join(&canonical);
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::copy(dest.join(shot), target)?;
                relocated.push(shot.clone());
            }
            canonical_paths.insert(canonical);
        }
    }
    for shot in relocated {
        if !canonical_paths.contains(&shot) {
            match std::fs::remove_file(dest.join(&shot)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
    let assets = list_assets(dest)?;
    Ok(Extracted { manifest, assets })
}

fn validate_manifest(manifest: &RecordingManifest, assets: &[String]) -> Result<()> {
    if manifest.version != MANIFEST_VERSION {
        return Err(invalid(format!(
            "unsupported manifest version {}",
            manifest.version
        )));
    }
    let mut seen = std::collections::HashSet::new();
    for frame in &manifest.frames {
        if frame.node_id.trim().is_empty() {
            return Err(invalid(format!("frame {} has no node_id", frame.step_index)));
        }
        if !seen.insert(frame.step_index) {
            return Err(invalid(format!("duplicate frame step_index {}", frame.step_index)));
        }
        if let Some(shot) = &frame.screenshot
            && !assets.iter().any(|a| a == shot)
        {
            return Err(invalid(format!(
                "frame {} references missing asset '{}'",
                frame.step_index, shot
            )));
        }
    }
    Ok(())
}

fn normalized(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn build_timeline(execution_id: Uuid, manifest: &RecordingManifest) -> ExecutionTimeline {
    let mut timeline = ExecutionTimeline::new(execution_id);
    let mut cursor = Utc::now();
    let mut frames: Vec<&ManifestFrame> = manifest.frames.iter().collect();
    frames.sort_by_key(|f| f.step_index);
    for frame in frames {
        let started_at = frame.started_at.unwrap_or(cursor);
        let ended_at = started_at + chrono::Duration::milliseconds(frame.duration_ms.unwrap_or(0).max(0));
        cursor = ended_at;
        timeline.entries.push(Frame {
            step_index: frame.step_index,
            node_id: frame.node_id.clone(),
            step_type: frame.step_type.clone(),
            status: if frame.success {
                FrameStatus::Completed
            } else {
                FrameStatus::Failed
            },
            success: frame.success,
            started_at,
            ended_at,
            screenshot_ref: frame
                .screenshot
                .as_ref()
                .map(|_| screenshot_file(frame.step_index)),
            error: frame.error.clone(),
            branch: None,
            iterations: None,
            retries: 0,
            extracted_data: None,
            url: frame.url.clone(),
        });
    }
    timeline
}

/// Files the studio writes itself; never treated as assets.
const INTERNAL_FILES: [&str; 4] = [TIMELINE_FILE, RESULT_FILE, DEFINITION_FILE, MANIFEST_FILE];

/// Archive-relative paths of every asset under a result directory.
pub(crate) fn list_assets(root: &Path) -> std::io::Result<Vec<String>> {
    let mut out = Vec::new();
    let mut stack: Vec<PathBuf> = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                stack.push(path);
            } else if let Ok(relative) = path.strip_prefix(root) {
                let relative = normalized(relative);
                if !INTERNAL_FILES.contains(&relative.as_str()) && !relative.ends_with(".tmp") {
                    out.push(relative);
                }
            }
        }
    }
    out.sort();
    Ok(out)
}
