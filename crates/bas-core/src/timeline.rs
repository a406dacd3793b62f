// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution timelines and the on-disk artifact bundle layout.
//!
//! A timeline is the per-execution record of executed steps (frames), log
//! lines and page events. It is written as `timeline.proto.json` inside the
//! execution's `result_path` and is the source of truth for resume.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

use crate::error::CoreError;

/// Timeline file name inside `result_path`.
pub const TIMELINE_FILE: &str = "timeline.proto.json";
/// Summary file name inside `result_path`.
pub const RESULT_FILE: &str = "result.json";
/// Screenshot directory inside `result_path`.
pub const SCREENSHOTS_DIR: &str = "screenshots";
/// Recorded video file name.
pub const VIDEO_FILE: &str = "video.webm";
/// Recorded trace file name.
pub const TRACE_FILE: &str = "trace.zip";
/// Recorded HAR file name.
pub const HAR_FILE: &str = "har.json";

/// Outcome of one executed step.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FrameStatus {
    Completed,
    Failed,
    Cancelled,
}

/// One per-step record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub step_index: u32,
    pub node_id: String,
    pub step_type: String,
    pub status: FrameStatus,
    pub success: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Conditional outcome.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<bool>,
    /// Iteration count chosen by a loop node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterations: Option<u32>,
    /// Retries spent before the final attempt.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_data: Option<Value>,
    /// URL of the page after the step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl Frame {
    /// Duration of the step in milliseconds.
    pub fn duration_ms(&self) -> i64 {
        (self.ended_at - self.started_at).num_milliseconds().max(0)
    }
}

/// A log line captured during an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    /// `info`, `warn` or `error`.
    pub level: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_index: Option<u32>,
}

impl LogEntry {
    /// Info-level entry stamped now.
    pub fn info(message: impl Into<String>, step_index: Option<u32>) -> Self {
        Self {
            timestamp: Utc::now(),
            level: "info".to_string(),
            message: message.into(),
            step_index,
        }
    }

    /// Error-level entry stamped now.
    pub fn error(message: impl Into<String>, step_index: Option<u32>) -> Self {
        Self {
            level: "error".to_string(),
            ..Self::info(message, step_index)
        }
    }
}

/// Kind of a page lifecycle event.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PageEventKind {
    Initial,
    Created,
    Navigated,
    Closed,
    Switched,
}

/// A browser page lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageEvent {
    pub kind: PageEventKind,
    pub page_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_page_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opener_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Per-execution ordered record of frames, logs and page events.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExecutionTimeline {
    pub execution_id: Uuid,
    #[serde(default)]
    pub entries: Vec<Frame>,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    #[serde(default)]
    pub page_events: Vec<PageEvent>,
}

impl ExecutionTimeline {
    /// Empty timeline for an execution.
    pub fn new(execution_id: Uuid) -> Self {
        Self {
            execution_id,
            ..Default::default()
        }
    }

    /// Frames that completed successfully.
    pub fn completed_frames(&self) -> impl Iterator<Item = &Frame> {
        self.entries.iter().filter(|f| f.success)
    }

    /// Leading run of successful frames; resume replays exactly these.
    pub fn replayable_prefix(&self) -> &[Frame] {
        let end = self
            .entries
            .iter()
            .position(|f| !f.success)
            .unwrap_or(self.entries.len());
        &self.entries[..end]
    }

    /// Frames that captured a screenshot.
    pub fn screenshot_frames(&self) -> impl Iterator<Item = &Frame> {
        self.entries.iter().filter(|f| f.screenshot_ref.is_some())
    }

    /// Path of the timeline file inside a result directory.
    pub fn file_path(result_path: &Path) -> PathBuf {
        result_path.join(TIMELINE_FILE)
    }

    /// Write the timeline into `result_path`, replacing any previous file.
    pub async fn write_to(&self, result_path: &Path) -> Result<(), CoreError> {
        tokio::fs::create_dir_all(result_path)
            .await
            .map_err(|e| io_error("create_dir", result_path, e))?;
        let bytes = serde_json::to_vec_pretty(self)?;
        let target = Self::file_path(result_path);
        let tmp = result_path.join(format!("{}.tmp", TIMELINE_FILE));
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| io_error("write", &tmp, e))?;
        tokio::fs::rename(&tmp, &target)
            .await
            .map_err(|e| io_error("rename", &target, e))?;
        Ok(())
    }

    /// Read the timeline from `result_path`; `Ok(None)` when absent.
    pub async fn read_from(result_path: &Path) -> Result<Option<Self>, CoreError> {
        let path = Self::file_path(result_path);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error("read", &path, e)),
        }
    }
}

/// Summary written as `result.json` when an execution finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub execution_id: Uuid,
    pub status: String,
    pub total_steps: usize,
    pub completed_steps: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Variables produced by extract steps.
    #[serde(default)]
    pub extracted: serde_json::Map<String, Value>,
    pub finished_at: DateTime<Utc>,
}

impl ExecutionSummary {
    /// Write the summary into `result_path`.
    pub async fn write_to(&self, result_path: &Path) -> Result<(), CoreError> {
        tokio::fs::create_dir_all(result_path)
            .await
            .map_err(|e| io_error("create_dir", result_path, e))?;
        let path = result_path.join(RESULT_FILE);
        tokio::fs::write(&path, serde_json::to_vec_pretty(self)?)
            .await
            .map_err(|e| io_error("write", &path, e))
    }
}

fn io_error(operation: &str, path: &Path, err: std::io::Error) -> CoreError {
    CoreError::DatabaseError {
        operation: format!("artifact_{}", operation),
        details: format!("{}: {}", path.display(), err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(step_index: u32, success: bool) -> Frame {
        let now = Utc::now();
        Frame {
            step_index,
            node_id: format!("n{}", step_index),
            step_type: "click".to_string(),
            status: if success {
                FrameStatus::Completed
            } else {
                FrameStatus::Failed
            },
            success,
            started_at: now,
            ended_at: now,
            screenshot_ref: None,
            error: None,
            branch: None,
            iterations: None,
            retries: 0,
            extracted_data: None,
            url: None,
        }
    }

    #[test]
    fn test_replayable_prefix_stops_at_first_failure() {
        let mut timeline = ExecutionTimeline::new(Uuid::new_v4());
        timeline.entries = vec![frame(0, true), frame(1, true), frame(2, false)];
        assert_eq!(timeline.replayable_prefix().len(), 2);

        timeline.entries.push(frame(3, true));
        assert_eq!(timeline.replayable_prefix().len(), 2);
        assert_eq!(timeline.completed_frames().count(), 3);
    }

    #[test]
    fn test_frame_serialization_omits_empty_fields() {
        let value = serde_json::to_value(frame(0, true)).unwrap();
        let obj = value.as_object().unwrap();
        assert_eq!(obj["status"], serde_json::json!("completed"));
        assert!(!obj.contains_key("screenshot_ref"));
        assert!(!obj.contains_key("retries"));
    }

    #[tokio::test]
    async fn test_write_and_read_timeline() {
        let dir = tempfile::tempdir().unwrap();
        let mut timeline = ExecutionTimeline::new(Uuid::new_v4());
        timeline.entries.push(frame(0, true));
        timeline.logs.push(LogEntry::info("started", None));

        timeline.write_to(dir.path()).await.unwrap();
        let loaded = ExecutionTimeline::read_from(dir.path()).await.unwrap();
        assert_eq!(loaded, Some(timeline));
    }

    #[tokio::test]
    async fn test_read_missing_timeline() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = ExecutionTimeline::read_from(dir.path()).await.unwrap();
        assert!(loaded.is_none());
    }
}
