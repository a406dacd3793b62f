// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Artifact queries over an execution's result directory.

use std::path::PathBuf;

use bas_core::artifacts::{BLOB_URL_PREFIX, content_type_for};
use bas_core::timeline::{HAR_FILE, TRACE_FILE, VIDEO_FILE};
use bas_core::ExecutionTimeline;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::ExecutionEngine;
use super::run::screenshot_file;
use crate::error::{ArtifactsReason, Error, Result};

/// One captured screenshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScreenshotInfo {
    pub step_index: u32,
    pub node_id: String,
    pub storage_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_url: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// A recorded session file (video, trace or HAR).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordedFile {
    pub name: String,
    pub path: String,
    pub size_bytes: u64,
    pub content_type: &'static str,
}

impl ExecutionEngine {
    /// Result directory of an execution, classified when unusable.
    pub async fn result_dir(&self, id: Uuid) -> Result<PathBuf> {
        let execution = match self.get_execution(id).await {
            Ok(execution) => execution,
            Err(e @ Error::NotFound { .. }) => return Err(e),
            Err(_) => return Err(Error::artifacts(id, ArtifactsReason::ExecutionLookupFailed)),
        };
        if execution.result_path.is_empty() {
            return Err(Error::artifacts(id, ArtifactsReason::ArtifactsNotSaved));
        }
        let dir = PathBuf::from(&execution.result_path);
        match tokio::fs::metadata(&dir).await {
            Ok(meta) if meta.is_dir() => Ok(dir),
            Ok(_) => Err(Error::artifacts(id, ArtifactsReason::ArtifactsInaccessible)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::artifacts(id, ArtifactsReason::ArtifactsDeleted))
            }
            Err(_) => Err(Error::artifacts(id, ArtifactsReason::ArtifactsInaccessible)),
        }
    }

    pub async fn get_timeline(&self, id: Uuid) -> Result<ExecutionTimeline> {
        let dir = self.result_dir(id).await?;
        match ExecutionTimeline::read_from(&dir).await {
            Ok(Some(timeline)) => Ok(timeline),
            Ok(None) => Err(Error::artifacts(id, ArtifactsReason::TimelineNotGenerated)),
            Err(_) => Err(Error::artifacts(id, ArtifactsReason::ArtifactsInaccessible)),
        }
    }

    pub async fn list_screenshots(&self, id: Uuid) -> Result<Vec<ScreenshotInfo>> {
        let timeline = self.get_timeline(id).await?;
        Ok(timeline
            .screenshot_frames()
            .map(|frame| ScreenshotInfo {
                step_index: frame.step_index,
                node_id: frame.node_id.clone(),
                storage_url: frame.screenshot_ref.clone().unwrap_or_default(),
                page_url: frame.url.clone(),
                timestamp: frame.ended_at,
            })
            .collect())
    }

    /// PNG bytes of the screenshot taken at `step_index`.
    pub async fn get_screenshot(&self, id: Uuid, step_index: u32) -> Result<Vec<u8>> {
        let timeline = self.get_timeline(id).await?;
        let not_found = || Error::ScreenshotNotFound(format!("execution {} step {}", id, step_index));
        let frame = timeline
            .screenshot_frames()
            .find(|f| f.step_index == step_index)
            .ok_or_else(not_found)?;

        let dir = self.result_dir(id).await?;
        match tokio::fs::read(dir.join(screenshot_file(step_index))).await {
            Ok(bytes) => return Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        match frame.screenshot_ref.as_deref() {
            Some(url) if url.starts_with(BLOB_URL_PREFIX) => {
                let object = self.inner.deps.artifacts.open(url, None).await.map_err(|e| match e {
                    bas_core::BlobError::NotFound(_) => not_found(),
                    other => other.into(),
                })?;
                Ok(object.bytes)
            }
            _ => Err(not_found()),
        }
    }

    pub async fn recorded_videos(&self, id: Uuid) -> Result<Vec<RecordedFile>> {
        self.recorded_files(id, VIDEO_FILE).await
    }

    pub async fn recorded_traces(&self, id: Uuid) -> Result<Vec<RecordedFile>> {
        self.recorded_files(id, TRACE_FILE).await
    }

    pub async fn recorded_har(&self, id: Uuid) -> Result<Vec<RecordedFile>> {
        self.recorded_files(id, HAR_FILE).await
    }

    async fn recorded_files(&self, id: Uuid, name: &str) -> Result<Vec<RecordedFile>> {
        let dir = self.result_dir(id).await?;
        let path = dir.join(name);
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(vec![RecordedFile {
                name: name.to_string(),
                path: path.to_string_lossy().into_owned(),
                size_bytes: meta.len(),
                content_type: content_type_for(name),
            }]),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(_) => Err(Error::artifacts(id, ArtifactsReason::ArtifactsInaccessible)),
        }
    }
}
