// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request and response types exchanged with the browser driver.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Options for a new browser session.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SessionOptions {
    pub viewport_width: u32,
    pub viewport_height: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    /// Cookies and origins to preload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_state: Option<Value>,
    /// Remote browser farm endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browserless_url: Option<String>,
    /// Record a video of the session.
    #[serde(default)]
    pub record_video: bool,
}

impl SessionOptions {
    /// Session with the given viewport.
    pub fn new(viewport_width: u32, viewport_height: u32) -> Self {
        Self {
            viewport_width,
            viewport_height,
            ..Default::default()
        }
    }
}

/// A started session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
}

/// Page state after a navigation or page operation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NavigationResult {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub title: String,
}

/// Result of an extract call.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExtractResult {
    #[serde(default)]
    pub value: Value,
}

/// A captured screenshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Screenshot {
    /// PNG bytes, base64-encoded on the wire.
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Started recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingStarted {
    pub recording_id: String,
}

/// Stopped recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingStopped {
    #[serde(default)]
    pub recording_id: Option<String>,
    #[serde(default)]
    pub action_count: u32,
}

/// Recording state of a session.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RecordingStatus {
    pub is_recording: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recording_id: Option<String>,
    #[serde(default)]
    pub action_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

/// Selector candidates captured for an element.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SelectorSet {
    pub primary: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub candidates: Vec<String>,
}

/// Element metadata captured with an action.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ElementInfo {
    #[serde(default)]
    pub tag_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attributes: Map<String, Value>,
}

/// A single observed user event.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RecordedAction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// `click`, `type`, `navigate`, `scroll`, `select`, `keypress`, ...
    pub action_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<SelectorSet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_info: Option<ElementInfo>,
    /// Type-specific data (`text`, `value`, `key`, `url`, `delta_y`, `modifiers`).
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub payload: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Driver page the action happened on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl RecordedAction {
    /// Primary selector, if captured.
    pub fn primary_selector(&self) -> Option<&str> {
        self.selector.as_ref().map(|s| s.primary.as_str())
    }

    /// String payload field.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

/// Actions fetched from a recording.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ActionsResponse {
    #[serde(default)]
    pub actions: Vec<RecordedAction>,
}

/// Result of validating a selector against the live page.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SelectorValidation {
    pub valid: bool,
    #[serde(default)]
    pub match_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A driver-side page.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DriverPage {
    pub driver_page_id: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opener_id: Option<String>,
}

/// All pages of a session.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PageList {
    #[serde(default)]
    pub pages: Vec<DriverPage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_page_id: Option<String>,
}

/// Driver health.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DriverHealth {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub active_sessions: u32,
}

impl DriverHealth {
    /// Whether the driver reports itself usable.
    pub fn is_healthy(&self) -> bool {
        matches!(self.status.as_str(), "ok" | "healthy")
    }
}

/// Binary artifacts collected from a finished session.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SessionArtifacts {
    #[serde(default, with = "base64_opt", skip_serializing_if = "Option::is_none")]
    pub video: Option<Vec<u8>>,
    #[serde(default, with = "base64_opt", skip_serializing_if = "Option::is_none")]
    pub trace: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub har: Option<Value>,
}

impl SessionArtifacts {
    /// True when nothing was collected.
    pub fn is_empty(&self) -> bool {
        self.video.is_none() && self.trace.is_none() && self.har.is_none()
    }
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

mod base64_opt {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => s.serialize_str(&STANDARD.encode(b)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded = Option::<String>::deserialize(d)?;
        encoded
            .map(|e| STANDARD.decode(e).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_recorded_action_accessors() {
        let action: RecordedAction = serde_json::from_value(json!({
            "action_type": "type",
            "selector": {"primary": "#q", "candidates": ["input[name=q]"]},
            "payload": {"text": "hello"}
        }))
        .unwrap();
        assert_eq!(action.primary_selector(), Some("#q"));
        assert_eq!(action.payload_str("text"), Some("hello"));
        assert_eq!(action.payload_str("missing"), None);
    }

    #[test]
    fn test_screenshot_base64() {
        let shot: Screenshot = serde_json::from_value(json!({"data": "iVBORw=="})).unwrap();
        assert_eq!(&shot.data[..4], &[0x89, b'P', b'N', b'G']);

        let back = serde_json::to_value(&shot).unwrap();
        assert_eq!(back["data"], json!("iVBORw=="));
    }

    #[test]
    fn test_session_artifacts_optional_fields() {
        let artifacts: SessionArtifacts = serde_json::from_value(json!({})).unwrap();
        assert!(artifacts.is_empty());

        let artifacts: SessionArtifacts =
            serde_json::from_value(json!({"video": "AAEC", "har": {"log": {}}})).unwrap();
        assert_eq!(artifacts.video.as_deref(), Some(&[0u8, 1, 2][..]));
        assert!(artifacts.trace.is_none());
        assert!(!artifacts.is_empty());
    }
}
