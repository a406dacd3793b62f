// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Normalization of loosely-shaped payloads into canonical form.
//!
//! The visual editor sends nodes and edges with canvas bookkeeping fields
//! (`selected`, `dragging`, `measured`, handles, ...) and keeps action
//! parameters under `data`. [`normalize_flow_definition`] strips the canvas
//! fields, moves `data` into the typed `action` payload and then parses the
//! result strictly, so anything that is neither canvas noise nor a known
//! field is rejected.
//!
//! The module also owns the back-compat coercions applied to execution
//! requests: `execution_params` as an alias for `parameters`, float viewport
//! dimensions, and protojson typed-value wrappers.

use serde_json::{Map, Number, Value};

use crate::flow::{BRANCH_FALSE, BRANCH_TRUE, FlowDefinition, LOOP_BODY, LOOP_EXIT};

/// Node keys that only matter to the canvas.
const UI_NODE_FIELDS: &[&str] = &[
    "width",
    "height",
    "selected",
    "dragging",
    "positionAbsolute",
    "measured",
    "style",
    "className",
    "sourcePosition",
    "targetPosition",
    "zIndex",
    "hidden",
    "draggable",
    "selectable",
    "connectable",
    "deletable",
    "focusable",
    "resizing",
    "parentId",
    "extent",
    "expandParent",
    "origin",
    "handles",
    "ariaLabel",
];

/// Keys inside a node's `data` object that are editor state, not action parameters.
const UI_DATA_FIELDS: &[&str] = &[
    "label",
    "status",
    "isSelected",
    "highlighted",
    "collapsed",
    "lastRunStatus",
    "lastResult",
    "isRunning",
];

/// Edge keys that only matter to the canvas.
const UI_EDGE_FIELDS: &[&str] = &[
    "sourceHandle",
    "targetHandle",
    "type",
    "animated",
    "style",
    "markerStart",
    "markerEnd",
    "label",
    "labelStyle",
    "labelBgStyle",
    "selected",
    "zIndex",
    "interactionWidth",
    "hidden",
    "deletable",
    "focusable",
    "className",
    "pathOptions",
    "reconnectable",
];

/// Top-level keys that only matter to the canvas.
const UI_FLOW_FIELDS: &[&str] = &["viewport", "zoom"];

/// Action fields holding integers that editors sometimes send as floats.
const INTEGER_FIELDS: &[&str] = &[
    "timeout_ms",
    "delay_ms",
    "duration_ms",
    "click_count",
    "iterations",
    "max_iterations",
    "x",
    "y",
];

/// Node type aliases accepted from older editors.
const NODE_TYPE_ALIASES: &[(&str, &str)] = &[
    ("goto", "navigate"),
    ("open", "navigate"),
    ("input", "type"),
    ("fill", "type"),
    ("keypress", "keyboard"),
    ("press", "keyboard"),
    ("condition", "conditional"),
    ("if", "conditional"),
    ("delay", "wait"),
    ("sleep", "wait"),
    ("capture", "screenshot"),
];

/// Error produced when a payload cannot be normalized.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NormalizeError {
    /// The payload has the wrong JSON shape.
    #[error("{path}: {message}")]
    Shape {
        /// JSON path of the offending value.
        path: String,
        /// What was wrong.
        message: String,
    },
    /// Strict parsing of the canonical shape failed.
    #[error("invalid flow definition: {0}")]
    Parse(String),
}

fn shape(path: impl Into<String>, message: impl Into<String>) -> NormalizeError {
    NormalizeError::Shape {
        path: path.into(),
        message: message.into(),
    }
}

// ============================================================================
// Flow Definitions
// ============================================================================

/// Convert an editor-shaped or canonical flow definition into a [`FlowDefinition`].
///
/// Canonical input passes through unchanged, so the function is idempotent.
pub fn normalize_flow_definition(raw: &Value) -> Result<FlowDefinition, NormalizeError> {
    let canonical = canonicalize_flow_value(raw)?;
    serde_json::from_value(canonical).map_err(|e| NormalizeError::Parse(e.to_string()))
}

/// Produce the canonical JSON shape without parsing it into typed structs.
pub fn canonicalize_flow_value(raw: &Value) -> Result<Value, NormalizeError> {
    let obj = raw
        .as_object()
        .ok_or_else(|| shape("flow_definition", "expected an object"))?;

    let mut out = Map::new();
    for (key, value) in obj {
        if UI_FLOW_FIELDS.contains(&key.as_str()) {
            continue;
        }
        let normalized = match key.as_str() {
            "nodes" => Value::Array(normalize_nodes(value)?),
            "edges" => Value::Array(normalize_edges(value)?),
            "settings" => normalize_settings(value)?,
            _ => value.clone(),
        };
        out.insert(key.clone(), normalized);
    }

    Ok(Value::Object(out))
}

fn normalize_nodes(value: &Value) -> Result<Vec<Value>, NormalizeError> {
    let nodes = match value {
        Value::Null => return Ok(Vec::new()),
        Value::Array(nodes) => nodes,
        _ => return Err(shape("nodes", "expected an array")),
    };

    nodes
        .iter()
        .enumerate()
        .map(|(i, node)| normalize_node(i, node))
        .collect()
}

fn normalize_node(index: usize, node: &Value) -> Result<Value, NormalizeError> {
    let path = format!("nodes[{}]", index);
    let obj = node
        .as_object()
        .ok_or_else(|| shape(&path, "expected an object"))?;

    let mut out = Map::new();
    let mut label: Option<Value> = None;
    let mut action: Option<Value> = None;

    for (key, value) in obj {
        if UI_NODE_FIELDS.contains(&key.as_str()) {
            continue;
        }
        match key.as_str() {
            "id" => {
                out.insert("id".to_string(), id_value(value, &path)?);
            }
            "type" => {
                let node_type = value
                    .as_str()
                    .ok_or_else(|| shape(format!("{}.type", path), "expected a string"))?;
                out.insert("type".to_string(), Value::String(canonical_node_type(node_type)));
            }
            "label" => label = Some(value.clone()),
            "data" => {
                // Explicit `action` wins over editor `data`.
                if let Value::Object(data) = value {
                    if let Some(data_label) = data.get("label")
                        && label.is_none()
                    {
                        label = Some(data_label.clone());
                    }
                    if action.is_none() {
                        let params: Map<String, Value> = data
                            .iter()
                            .filter(|(k, _)| !UI_DATA_FIELDS.contains(&k.as_str()))
                            .map(|(k, v)| (k.clone(), v.clone()))
                            .collect();
                        action = Some(Value::Object(params));
                    }
                } else if !value.is_null() {
                    return Err(shape(format!("{}.data", path), "expected an object"));
                }
            }
            "action" => action = Some(value.clone()),
            _ => {
                out.insert(key.clone(), value.clone());
            }
        }
    }

    if let Some(Value::String(label)) = label
        && !label.is_empty()
    {
        out.insert("label".to_string(), Value::String(label));
    }

    let mut action = action.unwrap_or_else(|| Value::Object(Map::new()));
    coerce_integer_fields(&mut action);
    out.insert("action".to_string(), action);

    Ok(Value::Object(out))
}

fn id_value(value: &Value, path: &str) -> Result<Value, NormalizeError> {
    match value {
        Value::String(s) => Ok(Value::String(s.clone())),
        Value::Number(n) => Ok(Value::String(n.to_string())),
        _ => Err(shape(format!("{}.id", path), "expected a string")),
    }
}

fn canonical_node_type(raw: &str) -> String {
    let lower = raw.trim().to_ascii_lowercase();
    NODE_TYPE_ALIASES
        .iter()
        .find(|(alias, _)| *alias == lower)
        .map(|(_, canonical)| canonical.to_string())
        .unwrap_or(lower)
}

fn normalize_edges(value: &Value) -> Result<Vec<Value>, NormalizeError> {
    let edges = match value {
        Value::Null => return Ok(Vec::new()),
        Value::Array(edges) => edges,
        _ => return Err(shape("edges", "expected an array")),
    };

    let mut out = Vec::with_capacity(edges.len());
    for (i, edge) in edges.iter().enumerate() {
        let path = format!("edges[{}]", i);
        let obj = edge
            .as_object()
            .ok_or_else(|| shape(&path, "expected an object"))?;

        let mut normalized = Map::new();
        let mut condition = obj.get("condition").cloned().filter(|c| !c.is_null());

        if condition.is_none()
            && let Some(Value::Object(data)) = obj.get("data")
        {
            condition = data.get("condition").cloned().filter(|c| !c.is_null());
        }
        if condition.is_none()
            && let Some(Value::String(handle)) = obj.get("sourceHandle")
            && [BRANCH_TRUE, BRANCH_FALSE, LOOP_BODY, LOOP_EXIT].contains(&handle.as_str())
        {
            condition = Some(Value::String(handle.clone()));
        }

        for (key, value) in obj {
            if UI_EDGE_FIELDS.contains(&key.as_str()) || key == "data" || key == "condition" {
                continue;
            }
            let value = match key.as_str() {
                "id" | "source" | "target" => id_value(value, &path)?,
                _ => value.clone(),
            };
            normalized.insert(key.clone(), value);
        }

        if let Some(condition) = condition {
            let condition = match condition {
                Value::Bool(b) => Value::String(b.to_string()),
                other => other,
            };
            normalized.insert("condition".to_string(), condition);
        }

        out.push(Value::Object(normalized));
    }

    Ok(out)
}

fn normalize_settings(value: &Value) -> Result<Value, NormalizeError> {
    match value {
        Value::Null => Ok(Value::Object(Map::new())),
        Value::Object(settings) => {
            let mut out = settings.clone();
            for key in ["viewport_width", "viewport_height"] {
                if let Some(v) = out.get_mut(key) {
                    *v = coerce_dimension(v)
                        .ok_or_else(|| shape(format!("settings.{}", key), "expected a number"))?;
                }
            }
            for key in ["timeout_ms", "max_retries", "retry_backoff_ms"] {
                if let Some(v) = out.get_mut(key) {
                    coerce_integral_float(v);
                }
            }
            Ok(Value::Object(out))
        }
        _ => Err(shape("settings", "expected an object")),
    }
}

/// Round float viewport dimensions to integers; numeric strings are accepted too.
fn coerce_dimension(value: &Value) -> Option<Value> {
    match value {
        Value::Null => Some(Value::Null),
        Value::Number(n) if n.is_u64() || n.is_i64() => Some(value.clone()),
        Value::Number(n) => {
            let f = n.as_f64()?;
            (f.is_finite() && f >= 0.0).then(|| Value::Number(Number::from(f.round() as u64)))
        }
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite() && *f >= 0.0)
            .map(|f| Value::Number(Number::from(f.round() as u64))),
        _ => None,
    }
}

fn coerce_integral_float(value: &mut Value) {
    if let Value::Number(n) = value
        && !n.is_i64()
        && !n.is_u64()
        && let Some(f) = n.as_f64()
        && f.fract() == 0.0
        && f.is_finite()
    {
        *value = Value::Number(Number::from(f as i64));
    }
}

fn coerce_integer_fields(action: &mut Value) {
    if let Value::Object(map) = action {
        for key in INTEGER_FIELDS {
            if let Some(v) = map.get_mut(*key) {
                coerce_integral_float(v);
            }
        }
    }
}

// ============================================================================
// Execution Parameters
// ============================================================================

/// Merge `execution_params` into `parameters` and unwrap typed-value wrappers.
///
/// `parameters` wins on key collisions. Returns the merged parameter map.
pub fn normalize_parameters(body: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = Map::new();

    if let Some(Value::Object(legacy)) = body.get("execution_params") {
        for (k, v) in legacy {
            merged.insert(k.clone(), unwrap_typed_value(v));
        }
    }
    if let Some(Value::Object(params)) = body.get("parameters") {
        for (k, v) in params {
            merged.insert(k.clone(), unwrap_typed_value(v));
        }
    }

    merged
}

const TYPED_VALUE_KEYS: &[&str] = &[
    "string_value",
    "int_value",
    "double_value",
    "bool_value",
    "json_value",
    "null_value",
];

/// Unwrap `{"string_value": "..."}`-style wrappers into plain JSON.
///
/// Values that are not wrappers are returned unchanged; nested objects and
/// arrays are unwrapped recursively.
pub fn unwrap_typed_value(value: &Value) -> Value {
    match value {
        Value::Object(map) if map.len() == 1 => {
            let (key, inner) = match map.iter().next() {
                Some(entry) => entry,
                None => return value.clone(),
            };
            match key.as_str() {
                "string_value" | "int_value" | "double_value" | "bool_value" => inner.clone(),
                "json_value" => unwrap_typed_value(inner),
                "null_value" => Value::Null,
                _ => Value::Object(
                    map.iter()
                        .map(|(k, v)| (k.clone(), unwrap_typed_value(v)))
                        .collect(),
                ),
            }
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), unwrap_typed_value(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(unwrap_typed_value).collect()),
        other => other.clone(),
    }
}

/// Wrap a plain JSON value in its typed-value form.
pub fn wrap_typed_value(value: &Value) -> Value {
    let (key, inner) = match value {
        Value::Null => ("null_value", Value::Null),
        Value::Bool(b) => ("bool_value", Value::Bool(*b)),
        Value::Number(n) if n.is_i64() || n.is_u64() => ("int_value", value.clone()),
        Value::Number(_) => ("double_value", value.clone()),
        Value::String(s) => ("string_value", Value::String(s.clone())),
        Value::Array(_) | Value::Object(_) => ("json_value", value.clone()),
    };
    let mut map = Map::new();
    map.insert(key.to_string(), inner);
    Value::Object(map)
}

/// Stamp typed-value wrappers onto every entry of a parameter map.
pub fn stamp_typed_map(params: &Map<String, Value>) -> Map<String, Value> {
    params
        .iter()
        .map(|(k, v)| {
            let already_wrapped = matches!(v, Value::Object(m)
                if m.len() == 1 && m.keys().all(|k| TYPED_VALUE_KEYS.contains(&k.as_str())));
            let wrapped = if already_wrapped {
                v.clone()
            } else {
                wrap_typed_value(v)
            };
            (k.clone(), wrapped)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{Action, NodeType};
    use serde_json::json;

    fn ui_flow() -> Value {
        json!({
            "nodes": [
                {
                    "id": "1",
                    "type": "navigate",
                    "position": {"x": 250, "y": 100},
                    "width": 220,
                    "height": 64,
                    "selected": true,
                    "data": {"label": "Open site", "url": "https://example.com", "timeout_ms": 5000.0}
                },
                {
                    "id": 2,
                    "type": "click",
                    "position": {"x": 250, "y": 220},
                    "dragging": false,
                    "data": {"selector": "#btn"}
                }
            ],
            "edges": [
                {"id": "e1", "source": "1", "target": 2, "sourceHandle": null, "animated": true}
            ],
            "settings": {"viewport_width": 1280.0, "viewport_height": 719.6},
            "viewport": {"x": 0, "y": 0, "zoom": 1}
        })
    }

    #[test]
    fn test_ui_shape_is_normalized() {
        let def = normalize_flow_definition(&ui_flow()).unwrap();

        assert_eq!(def.nodes.len(), 2);
        assert_eq!(def.nodes[0].label.as_deref(), Some("Open site"));
        assert_eq!(def.nodes[1].id, "2");
        assert_eq!(def.nodes[1].node_type(), NodeType::Click);
        match &def.nodes[0].action {
            Action::Navigate(nav) => {
                assert_eq!(nav.url, "https://example.com");
                assert_eq!(nav.timeout_ms, Some(5000));
            }
            other => panic!("unexpected action {:?}", other),
        }
        assert_eq!(def.edges[0].target, "2");
        assert_eq!(def.settings.viewport_width, Some(1280));
        assert_eq!(def.settings.viewport_height, Some(720));
    }

    #[test]
    fn test_normalization_is_idempotent() {
        let def = normalize_flow_definition(&ui_flow()).unwrap();
        let canonical = serde_json::to_value(&def).unwrap();
        let again = normalize_flow_definition(&canonical).unwrap();
        assert_eq!(def, again);
    }

    #[test]
    fn test_unknown_node_field_rejected() {
        let raw = json!({
            "nodes": [{"id": "1", "type": "wait", "data": {"duration_ms": 10}, "bogus": 1}]
        });
        let err = normalize_flow_definition(&raw).unwrap_err();
        assert!(matches!(err, NormalizeError::Parse(ref m) if m.contains("bogus")), "{}", err);
    }

    #[test]
    fn test_unknown_data_field_rejected() {
        let raw = json!({
            "nodes": [{"id": "1", "type": "click", "data": {"selector": "#a", "clickCount": 2}}]
        });
        assert!(normalize_flow_definition(&raw).is_err());
    }

    #[test]
    fn test_edge_condition_from_handle_and_data() {
        let raw = json!({
            "nodes": [
                {"id": "c", "type": "conditional", "data": {"condition": {"kind": "variable_truthy", "variable": "ok"}}},
                {"id": "a", "type": "wait", "data": {"duration_ms": 1}},
                {"id": "b", "type": "wait", "data": {"duration_ms": 1}}
            ],
            "edges": [
                {"id": "e1", "source": "c", "target": "a", "sourceHandle": "true"},
                {"id": "e2", "source": "c", "target": "b", "data": {"condition": false}}
            ]
        });
        let def = normalize_flow_definition(&raw).unwrap();
        assert_eq!(def.edges[0].condition.as_deref(), Some("true"));
        assert_eq!(def.edges[1].condition.as_deref(), Some("false"));
    }

    #[test]
    fn test_type_aliases() {
        let raw = json!({"nodes": [{"id": "k", "type": "keypress", "data": {"key": "Enter"}}]});
        let def = normalize_flow_definition(&raw).unwrap();
        assert_eq!(def.nodes[0].node_type(), NodeType::Keyboard);
    }

    #[test]
    fn test_non_object_rejected() {
        assert!(matches!(
            normalize_flow_definition(&json!([1, 2])),
            Err(NormalizeError::Shape { .. })
        ));
    }

    #[test]
    fn test_execution_params_alias() {
        let body = json!({
            "execution_params": {"a": 1, "b": {"string_value": "legacy"}},
            "parameters": {"b": "new"}
        });
        let params = normalize_parameters(body.as_object().unwrap());
        assert_eq!(params.get("a"), Some(&json!(1)));
        assert_eq!(params.get("b"), Some(&json!("new")));
    }

    #[test]
    fn test_typed_value_wrappers() {
        assert_eq!(wrap_typed_value(&json!("x")), json!({"string_value": "x"}));
        assert_eq!(wrap_typed_value(&json!(3)), json!({"int_value": 3}));
        assert_eq!(wrap_typed_value(&json!(1.5)), json!({"double_value": 1.5}));
        assert_eq!(wrap_typed_value(&json!({"k": 1})), json!({"json_value": {"k": 1}}));

        let nested = json!({"outer": {"bool_value": true}, "list": [{"int_value": 2}]});
        assert_eq!(
            unwrap_typed_value(&nested),
            json!({"outer": true, "list": [2]})
        );

        let params = json!({"a": "x", "b": {"int_value": 1}});
        let stamped = stamp_typed_map(params.as_object().unwrap());
        assert_eq!(stamped.get("a"), Some(&json!({"string_value": "x"})));
        assert_eq!(stamped.get("b"), Some(&json!({"int_value": 1})));
    }
}
