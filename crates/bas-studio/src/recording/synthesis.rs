// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Conversion of recorded browser actions into a flow definition.

use bas_driver::RecordedAction;
use bas_dsl::{
    Action, ClickAction, Edge, FlowDefinition, KeyboardAction, NavigateAction, Node, Position,
    ScrollAction, SelectAction, TypeAction,
};
use serde::Deserialize;
use serde_json::Value;

/// Node labels derived from typed text are cut at this many characters.
pub const TYPE_LABEL_MAX_CHARS: usize = 20;

const LAYOUT_X: f64 = 250.0;
const LAYOUT_Y0: f64 = 100.0;
const LAYOUT_DY: f64 = 120.0;

/// A user correction applied to one captured action before synthesis.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActionEdit {
    /// Index into the captured action log.
    pub index: usize,
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub remove: bool,
}

/// Inclusive range of action indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActionRange {
    pub start: usize,
    pub end: usize,
}

/// Apply edits, then the range (over original indices), then removals.
pub fn select_actions(
    actions: &[RecordedAction],
    range: Option<ActionRange>,
    edits: &[ActionEdit],
) -> Vec<RecordedAction> {
    let mut edited: Vec<(RecordedAction, bool)> =
        actions.iter().cloned().map(|a| (a, false)).collect();

    for edit in edits {
        let Some((action, removed)) = edited.get_mut(edit.index) else {
            continue;
        };
        if edit.remove {
            *removed = true;
        }
        if let Some(selector) = &edit.selector {
            let set = action.selector.get_or_insert_with(Default::default);
            set.primary = selector.clone();
        }
        if let Some(text) = &edit.text {
            action.payload.insert("text".into(), Value::String(text.clone()));
        }
        if let Some(url) = &edit.url {
            action.payload.insert("url".into(), Value::String(url.clone()));
            action.url = Some(url.clone());
        }
        if let Some(value) = &edit.value {
            action.payload.insert("value".into(), Value::String(value.clone()));
        }
    }

    edited
        .into_iter()
        .enumerate()
        .filter(|(i, _)| range.is_none_or(|r| *i >= r.start && *i <= r.end))
        .filter(|(_, (_, removed))| !removed)
        .map(|(_, (action, _))| action)
        .collect()
}

/// Build a straight-line flow from captured actions.
pub fn synthesize(actions: &[RecordedAction]) -> FlowDefinition {
    let nodes: Vec<Node> = actions
        .iter()
        .enumerate()
        .map(|(i, action)| {
            let (action, label) = convert(action);
            let position = Position {
                x: LAYOUT_X,
                y: LAYOUT_Y0 + LAYOUT_DY * i as f64,
            };
            Node::new(format!("node-{}", i + 1), action, position).with_label(label)
        })
        .collect();

    let edges = nodes
        .windows(2)
        .map(|pair| Edge::new(&pair[0].id, &pair[1].id))
        .collect();

    FlowDefinition {
        nodes,
        edges,
        ..Default::default()
    }
}

fn convert(action: &RecordedAction) -> (Action, String) {
    let selector = action.primary_selector().unwrap_or_default().to_string();
    match action.action_type.as_str() {
        "type" => {
            let text = action
                .payload_str("text")
                .or_else(|| action.payload_str("value"))
                .unwrap_or_default()
                .to_string();
            let label = format!("Type \"{}\"", truncate(&text, TYPE_LABEL_MAX_CHARS));
            let action = Action::Type(TypeAction {
                selector,
                text,
                ..Default::default()
            });
            (action, label)
        }
        "navigate" => {
            let url = action
                .payload_str("url")
                .or(action.url.as_deref())
                .unwrap_or_default()
                .to_string();
            let label = format!("Navigate to {}", hostname(&url));
            let action = Action::Navigate(NavigateAction {
                url,
                ..Default::default()
            });
            (action, label)
        }
        "scroll" => {
            let y = action
                .payload
                .get("delta_y")
                .or_else(|| action.payload.get("y"))
                .and_then(Value::as_f64)
                .map(|y| y.round() as i64);
            let action = Action::Scroll(ScrollAction {
                selector: (!selector.is_empty()).then_some(selector),
                y,
                ..Default::default()
            });
            (action, "Scroll".to_string())
        }
        "select" => {
            let value = action.payload_str("value").unwrap_or_default().to_string();
            let label = format!("Select {}", value);
            let action = Action::Select(SelectAction { selector, value });
            (action, label)
        }
        "keypress" => {
            let key = action.payload_str("key").unwrap_or_default().to_string();
            let label = format!("Press {}", key);
            let action = Action::Keyboard(KeyboardAction {
                key,
                modifiers: modifiers(action),
            });
            (action, label)
        }
        // click, and anything unknown
        _ => {
            let label = match action.element_info.as_ref().and_then(|e| e.text.as_deref()) {
                Some(text) if !text.trim().is_empty() => {
                    format!("Click {}", truncate(text.trim(), TYPE_LABEL_MAX_CHARS))
                }
                _ => "Click".to_string(),
            };
            let action = Action::Click(ClickAction {
                selector,
                modifiers: modifiers(action),
                ..Default::default()
            });
            (action, label)
        }
    }
}

fn modifiers(action: &RecordedAction) -> Vec<String> {
    action
        .payload
        .get("modifiers")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(max_chars).collect();
    cut.push_str("...");
    cut
}

fn hostname(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| url.to_string())
}
