// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Parameter substitution and unresolved-token detection.
//!
//! Action strings may reference parameters and runtime variables as
//! `${name}` or `{{ name }}` (dotted paths index into objects). External
//! resolvers additionally expand `@fixture/`, `@selector/` and `@seed/`
//! references before a flow reaches the engine.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::flow::{Action, FlowDefinition, Node};

static TEMPLATE_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{\s*([A-Za-z_][A-Za-z0-9_.\-]*)\s*\}|\{\{\s*([A-Za-z_][A-Za-z0-9_.\-]*)\s*\}\}")
        .expect("template token pattern is valid")
});

static ANY_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"@(?:fixture|selector|seed)/[^\s'\x22)]*|\$\{[^}]*\}|\{\{[^}]*\}\}")
        .expect("unresolved token pattern is valid")
});

/// Kind of an unresolved reference left in a string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// `@fixture/...`
    Fixture,
    /// `@selector/...`
    Selector,
    /// `@seed/...`
    Seed,
    /// `${...}`
    Dollar,
    /// `{{...}}`
    Mustache,
}

/// An unresolved token found in a string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedToken {
    /// Kind of token.
    pub kind: TokenKind,
    /// The token text as it appears.
    pub text: String,
    /// Variable name for `${}`/`{{}}` tokens.
    pub variable: Option<String>,
}

/// Find every unresolved token in `input`.
pub fn find_unresolved_tokens(input: &str) -> Vec<UnresolvedToken> {
    ANY_TOKEN
        .find_iter(input)
        .map(|m| {
            let text = m.as_str().to_string();
            let (kind, variable) = if text.starts_with("@fixture/") {
                (TokenKind::Fixture, None)
            } else if text.starts_with("@selector/") {
                (TokenKind::Selector, None)
            } else if text.starts_with("@seed/") {
                (TokenKind::Seed, None)
            } else if let Some(inner) = text.strip_prefix("${") {
                (
                    TokenKind::Dollar,
                    Some(inner.trim_end_matches('}').trim().to_string()),
                )
            } else {
                let inner = text.trim_start_matches('{').trim_end_matches('}');
                (TokenKind::Mustache, Some(inner.trim().to_string()))
            };
            UnresolvedToken {
                kind,
                text,
                variable,
            }
        })
        .collect()
}

/// Look up a dotted path (`user.name`, `items.0`) in a variable map.
pub fn lookup_path<'a>(vars: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = vars.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Replace `${name}` / `{{name}}` tokens whose variable is known.
///
/// Unknown variables are left in place so that post-resolution validation
/// can report them.
pub fn substitute_str(input: &str, vars: &Map<String, Value>) -> String {
    if !input.contains("${") && !input.contains("{{") {
        return input.to_string();
    }
    TEMPLATE_TOKEN
        .replace_all(input, |caps: &regex::Captures<'_>| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            match lookup_path(vars, name) {
                Some(value) => render_value(value),
                None => caps
                    .get(0)
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_default(),
            }
        })
        .into_owned()
}

fn substitute_value(value: &mut Value, vars: &Map<String, Value>) {
    match value {
        Value::String(s) => *s = substitute_str(s, vars),
        Value::Array(items) => items.iter_mut().for_each(|v| substitute_value(v, vars)),
        Value::Object(map) => map.values_mut().for_each(|v| substitute_value(v, vars)),
        _ => {}
    }
}

/// Substitute variables into every string of an action payload.
pub fn resolve_action(action: &Action, vars: &Map<String, Value>) -> Result<Action, String> {
    let mut params = action.params_value();
    substitute_value(&mut params, vars);
    Action::from_parts(action.node_type(), params).map_err(|e| e.to_string())
}

/// Substitute parameters into every node of a flow.
pub fn resolve_flow(
    def: &FlowDefinition,
    vars: &Map<String, Value>,
) -> Result<FlowDefinition, String> {
    let nodes = def
        .nodes
        .iter()
        .map(|node| {
            let action = resolve_action(&node.action, vars)
                .map_err(|e| format!("node '{}': {}", node.id, e))?;
            Ok(Node {
                action,
                ..node.clone()
            })
        })
        .collect::<Result<Vec<_>, String>>()?;

    Ok(FlowDefinition {
        nodes,
        ..def.clone()
    })
}

/// Collect every string of an action payload together with its field path.
pub fn action_strings(action: &Action) -> Vec<(String, String)> {
    fn walk(value: &Value, path: String, out: &mut Vec<(String, String)>) {
        match value {
            Value::String(s) => out.push((path, s.clone())),
            Value::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    walk(item, format!("{}[{}]", path, i), out);
                }
            }
            Value::Object(map) => {
                for (k, v) in map {
                    let child = if path.is_empty() {
                        k.clone()
                    } else {
                        format!("{}.{}", path, k)
                    };
                    walk(v, child, out);
                }
            }
            _ => {}
        }
    }

    let mut out = Vec::new();
    walk(&action.params_value(), String::new(), &mut out);
    out
}
