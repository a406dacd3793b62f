// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flow validation.
//!
//! Two entry points:
//! - [`validate_flow`] checks structure and lints an authored definition
//!   (graph shape, required fields, settings ranges).
//! - [`validate_resolved`] runs after parameter and fixture resolution and
//!   rejects definitions that still contain unresolved references.
//!
//! Errors carry stable `[Exxx]` codes and warnings `[Wxxx]` codes in their
//! display output.

use std::collections::HashSet;

use serde::Serialize;

use crate::flow::{
    Action, BRANCH_FALSE, BRANCH_TRUE, Condition, DestinationType, FlowDefinition, LOOP_BODY,
    LOOP_EXIT, NodeType,
};
use crate::graph::{FlowGraph, GraphError};
use crate::template::{TokenKind, action_strings, find_unresolved_tokens};

/// Maximum retries per step accepted in settings.
pub const MAX_STEP_RETRIES: u32 = 3;

/// Waits longer than this produce a warning.
const LONG_WAIT_MS: u64 = 60_000;

/// Largest accepted viewport dimension.
const MAX_VIEWPORT_DIMENSION: u32 = 7680;

// ============================================================================
// Validation Result Types
// ============================================================================

/// Result of validation containing errors and warnings.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// Hard errors that prevent saving or running the flow.
    pub errors: Vec<ValidationError>,
    /// Soft warnings.
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    /// Returns true if there are no errors (warnings are allowed).
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns true if there are any errors.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Merge another validation result into this one.
    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Serializable summary for API responses.
    pub fn report(&self) -> ValidationReport {
        ValidationReport {
            valid: self.is_ok(),
            errors: self
                .errors
                .iter()
                .map(|e| ValidationIssue {
                    code: e.code(),
                    message: e.to_string(),
                    node_id: e.node_id().map(str::to_string),
                })
                .collect(),
            warnings: self
                .warnings
                .iter()
                .map(|w| ValidationIssue {
                    code: w.code(),
                    message: w.to_string(),
                    node_id: w.node_id().map(str::to_string),
                })
                .collect(),
        }
    }

    /// Join all error messages, one per line.
    pub fn error_summary(&self) -> String {
        self.errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Serializable validation summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    /// True when there are no errors.
    pub valid: bool,
    /// Error entries.
    pub errors: Vec<ValidationIssue>,
    /// Warning entries.
    pub warnings: Vec<ValidationIssue>,
}

/// One validation finding.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationIssue {
    /// Stable code (`E001`, `W002`, ...).
    pub code: &'static str,
    /// Human-readable message.
    pub message: String,
    /// Node the finding refers to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

// ============================================================================
// Validation Errors
// ============================================================================

/// Errors that can occur during validation.
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum ValidationError {
    // === Graph Structure Errors ===
    /// The flow has no nodes.
    EmptyFlow,
    /// Two nodes share an id.
    DuplicateNodeId { node_id: String },
    /// An edge references a node that does not exist.
    UnknownEdgeEndpoint {
        edge_id: String,
        endpoint: &'static str,
        node_id: String,
        available_nodes: Vec<String>,
    },
    /// A cycle that does not pass through a loop node.
    CycleOutsideLoop { node_ids: Vec<String> },

    // === Node Errors ===
    /// A required field is empty.
    MissingRequiredField { node_id: String, field: String },
    /// A navigate URL is not a usable URL.
    InvalidUrl { node_id: String, url: String },
    /// A loop has no `body` edge.
    LoopWithoutBody { node_id: String },
    /// A loop has neither an iteration count nor an items variable.
    LoopWithoutBound { node_id: String },

    // === Settings Errors ===
    /// Viewport dimension out of range.
    InvalidViewport { field: &'static str, value: u32 },
    /// Retry count above the cap.
    InvalidRetryPolicy { max_retries: u32 },

    // === Resolution Errors ===
    /// A template or fixture token survived resolution.
    UnresolvedToken {
        node_id: String,
        field: String,
        token: String,
    },
    /// A scenario destination did not resolve to a concrete URL.
    UnresolvedScenarioDestination { node_id: String, destination: String },
}

impl ValidationError {
    /// Stable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::EmptyFlow => "E001",
            Self::DuplicateNodeId { .. } => "E002",
            Self::UnknownEdgeEndpoint { .. } => "E003",
            Self::CycleOutsideLoop { .. } => "E004",
            Self::MissingRequiredField { .. } => "E010",
            Self::InvalidUrl { .. } => "E011",
            Self::LoopWithoutBody { .. } => "E012",
            Self::LoopWithoutBound { .. } => "E013",
            Self::InvalidViewport { .. } => "E020",
            Self::InvalidRetryPolicy { .. } => "E021",
            Self::UnresolvedToken { .. } => "E030",
            Self::UnresolvedScenarioDestination { .. } => "E031",
        }
    }

    /// Node the error refers to, if any.
    pub fn node_id(&self) -> Option<&str> {
        match self {
            Self::DuplicateNodeId { node_id }
            | Self::MissingRequiredField { node_id, .. }
            | Self::InvalidUrl { node_id, .. }
            | Self::LoopWithoutBody { node_id }
            | Self::LoopWithoutBound { node_id }
            | Self::UnresolvedToken { node_id, .. }
            | Self::UnresolvedScenarioDestination { node_id, .. } => Some(node_id),
            Self::UnknownEdgeEndpoint { node_id, .. } => Some(node_id),
            Self::CycleOutsideLoop { node_ids } => node_ids.first().map(String::as_str),
            Self::EmptyFlow | Self::InvalidViewport { .. } | Self::InvalidRetryPolicy { .. } => {
                None
            }
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let code = self.code();
        match self {
            Self::EmptyFlow => write!(f, "[{}] Flow has no nodes defined", code),
            Self::DuplicateNodeId { node_id } => {
                write!(f, "[{}] Node id '{}' is used more than once", code, node_id)
            }
            Self::UnknownEdgeEndpoint {
                edge_id,
                endpoint,
                node_id,
                available_nodes,
            } => {
                let suggestion = find_similar_name(node_id, available_nodes)
                    .map(|s| format!(". Did you mean '{}'?", s))
                    .unwrap_or_default();
                write!(
                    f,
                    "[{}] Edge '{}' {} '{}' does not exist{}",
                    code, edge_id, endpoint, node_id, suggestion
                )
            }
            Self::CycleOutsideLoop { node_ids } => write!(
                f,
                "[{}] Cycle outside a loop body: {}",
                code,
                node_ids.join(" -> ")
            ),
            Self::MissingRequiredField { node_id, field } => write!(
                f,
                "[{}] Node '{}' is missing required field '{}'",
                code, node_id, field
            ),
            Self::InvalidUrl { node_id, url } => {
                write!(f, "[{}] Node '{}' has invalid URL '{}'", code, node_id, url)
            }
            Self::LoopWithoutBody { node_id } => write!(
                f,
                "[{}] Loop '{}' has no outgoing '{}' edge",
                code, node_id, LOOP_BODY
            ),
            Self::LoopWithoutBound { node_id } => write!(
                f,
                "[{}] Loop '{}' needs 'iterations' or 'items_variable'",
                code, node_id
            ),
            Self::InvalidViewport { field, value } => write!(
                f,
                "[{}] Setting '{}' must be between 1 and {} (got {})",
                code, field, MAX_VIEWPORT_DIMENSION, value
            ),
            Self::InvalidRetryPolicy { max_retries } => write!(
                f,
                "[{}] Setting 'max_retries' must be at most {} (got {})",
                code, MAX_STEP_RETRIES, max_retries
            ),
            Self::UnresolvedToken {
                node_id,
                field,
                token,
            } => write!(
                f,
                "[{}] Node '{}' field '{}' contains unresolved token '{}'",
                code, node_id, field, token
            ),
            Self::UnresolvedScenarioDestination {
                node_id,
                destination,
            } => write!(
                f,
                "[{}] Node '{}' scenario destination '{}' did not resolve to a URL",
                code, node_id, destination
            ),
        }
    }
}

impl std::error::Error for ValidationError {}

// ============================================================================
// Validation Warnings
// ============================================================================

/// Warnings that don't prevent running the flow.
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum ValidationWarning {
    /// More than one node has no incoming edge; each starts a branch.
    MultipleEntryPoints { node_ids: Vec<String> },
    /// A conditional has no edge for one of its outcomes.
    ConditionalMissingBranch { node_id: String, branch: &'static str },
    /// An edge carries a condition its source does not produce.
    UnknownEdgeCondition { edge_id: String, condition: String },
    /// A wait longer than a minute.
    LongWait { node_id: String, duration_ms: u64 },
    /// A loop has no exit edge; nothing runs after it.
    LoopWithoutExit { node_id: String },
}

impl ValidationWarning {
    /// Stable warning code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MultipleEntryPoints { .. } => "W001",
            Self::ConditionalMissingBranch { .. } => "W002",
            Self::UnknownEdgeCondition { .. } => "W003",
            Self::LongWait { .. } => "W004",
            Self::LoopWithoutExit { .. } => "W005",
        }
    }

    /// Node the warning refers to, if any.
    pub fn node_id(&self) -> Option<&str> {
        match self {
            Self::ConditionalMissingBranch { node_id, .. }
            | Self::LongWait { node_id, .. }
            | Self::LoopWithoutExit { node_id } => Some(node_id),
            Self::MultipleEntryPoints { node_ids } => node_ids.first().map(String::as_str),
            Self::UnknownEdgeCondition { .. } => None,
        }
    }
}

impl std::fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let code = self.code();
        match self {
            Self::MultipleEntryPoints { node_ids } => write!(
                f,
                "[{}] Flow has several entry points: {}",
                code,
                node_ids.join(", ")
            ),
            Self::ConditionalMissingBranch { node_id, branch } => write!(
                f,
                "[{}] Conditional '{}' has no '{}' branch",
                code, node_id, branch
            ),
            Self::UnknownEdgeCondition { edge_id, condition } => write!(
                f,
                "[{}] Edge '{}' has condition '{}' that its source never produces",
                code, edge_id, condition
            ),
            Self::LongWait {
                node_id,
                duration_ms,
            } => write!(
                f,
                "[{}] Node '{}' waits {} ms",
                code, node_id, duration_ms
            ),
            Self::LoopWithoutExit { node_id } => {
                write!(f, "[{}] Loop '{}' has no exit edge", code, node_id)
            }
        }
    }
}

// ============================================================================
// Validation Entry Points
// ============================================================================

/// Structural validation and lint of an authored flow.
pub fn validate_flow(def: &FlowDefinition) -> ValidationResult {
    let mut result = ValidationResult::default();

    validate_graph(def, &mut result);
    validate_nodes(def, &mut result);
    validate_settings(def, &mut result);
    validate_edge_conditions(def, &mut result);

    result
}

/// Validation after parameter and fixture resolution.
///
/// Template tokens referring to variables produced at runtime (extract
/// `store_as` names, loop item variables) are allowed.
pub fn validate_resolved(def: &FlowDefinition) -> ValidationResult {
    let mut result = ValidationResult::default();
    let runtime_vars = runtime_variables(def);

    for node in &def.nodes {
        for (field, value) in action_strings(&node.action) {
            for token in find_unresolved_tokens(&value) {
                let allowed = matches!(token.kind, TokenKind::Dollar | TokenKind::Mustache)
                    && token
                        .variable
                        .as_deref()
                        .map(|v| runtime_vars.contains(v.split('.').next().unwrap_or(v)))
                        .unwrap_or(false);
                if !allowed {
                    result.errors.push(ValidationError::UnresolvedToken {
                        node_id: node.id.clone(),
                        field: field.clone(),
                        token: token.text,
                    });
                }
            }
        }

        if let Action::Navigate(nav) = &node.action
            && nav.destination_type == Some(DestinationType::Scenario)
            && !is_concrete_url(&nav.url)
        {
            result
                .errors
                .push(ValidationError::UnresolvedScenarioDestination {
                    node_id: node.id.clone(),
                    destination: nav
                        .scenario
                        .clone()
                        .filter(|s| !s.is_empty())
                        .unwrap_or_else(|| nav.url.clone()),
                });
        }
    }

    result
}

/// Variable names assigned while a flow runs.
pub fn runtime_variables(def: &FlowDefinition) -> HashSet<String> {
    def.nodes
        .iter()
        .filter_map(|node| match &node.action {
            Action::Extract(extract) => extract.store_as.clone(),
            Action::Loop(l) => l.item_variable.clone(),
            _ => None,
        })
        .collect()
}

fn validate_graph(def: &FlowDefinition, result: &mut ValidationResult) {
    match FlowGraph::build(def) {
        Ok(graph) => {
            let entries = graph.entry_points();
            if entries.len() > 1 && !def.edges.is_empty() {
                result.warnings.push(ValidationWarning::MultipleEntryPoints {
                    node_ids: entries
                        .iter()
                        .map(|&i| graph.node(i).id.clone())
                        .collect(),
                });
            }
        }
        Err(GraphError::Empty) => result.errors.push(ValidationError::EmptyFlow),
        Err(GraphError::DuplicateNode(node_id)) => {
            result.errors.push(ValidationError::DuplicateNodeId { node_id })
        }
        Err(GraphError::UnknownEndpoint {
            edge_id,
            endpoint,
            node_id,
        }) => result.errors.push(ValidationError::UnknownEdgeEndpoint {
            edge_id,
            endpoint,
            node_id,
            available_nodes: def.node_ids(),
        }),
        Err(GraphError::CycleOutsideLoop(node_ids)) => result
            .errors
            .push(ValidationError::CycleOutsideLoop { node_ids }),
    }
}

fn validate_nodes(def: &FlowDefinition, result: &mut ValidationResult) {
    for node in &def.nodes {
        let missing = |field: &str| ValidationError::MissingRequiredField {
            node_id: node.id.clone(),
            field: field.to_string(),
        };

        match &node.action {
            Action::Navigate(nav) => {
                if nav.url.trim().is_empty() {
                    if nav.destination_type != Some(DestinationType::Scenario) {
                        result.errors.push(missing("url"));
                    }
                } else if !is_concrete_url(&nav.url) && find_unresolved_tokens(&nav.url).is_empty()
                {
                    result.errors.push(ValidationError::InvalidUrl {
                        node_id: node.id.clone(),
                        url: nav.url.clone(),
                    });
                }
            }
            Action::Click(a) if a.selector.trim().is_empty() => {
                result.errors.push(missing("selector"))
            }
            Action::Type(a) if a.selector.trim().is_empty() => {
                result.errors.push(missing("selector"))
            }
            Action::Select(a) if a.selector.trim().is_empty() => {
                result.errors.push(missing("selector"))
            }
            Action::Keyboard(a) if a.key.trim().is_empty() => result.errors.push(missing("key")),
            Action::Extract(a) => {
                let has_selector = a.selector.as_deref().is_some_and(|s| !s.trim().is_empty());
                let has_script = a.script.as_deref().is_some_and(|s| !s.trim().is_empty());
                if !has_selector && !has_script {
                    result.errors.push(missing("selector"));
                }
            }
            Action::Wait(a) => {
                if a.duration_ms.is_none() && a.selector.is_none() {
                    result.errors.push(missing("duration_ms"));
                }
                if let Some(duration_ms) = a.duration_ms
                    && duration_ms > LONG_WAIT_MS
                {
                    result.warnings.push(ValidationWarning::LongWait {
                        node_id: node.id.clone(),
                        duration_ms,
                    });
                }
            }
            Action::Conditional(c) => {
                let empty = match &c.condition {
                    Condition::ElementExists { selector } => selector.trim().is_empty(),
                    Condition::VariableEquals { variable, .. }
                    | Condition::VariableTruthy { variable } => variable.trim().is_empty(),
                };
                if empty {
                    result.errors.push(missing("condition"));
                }
                for branch in [BRANCH_TRUE, BRANCH_FALSE] {
                    let has_branch = def.edges.iter().any(|e| {
                        e.source == node.id
                            && match e.condition.as_deref() {
                                Some(c) => c == branch,
                                None => branch == BRANCH_TRUE,
                            }
                    });
                    if !has_branch {
                        result
                            .warnings
                            .push(ValidationWarning::ConditionalMissingBranch {
                                node_id: node.id.clone(),
                                branch,
                            });
                    }
                }
            }
            Action::Loop(l) => {
                if l.iterations.is_none() && l.items_variable.is_none() {
                    result.errors.push(ValidationError::LoopWithoutBound {
                        node_id: node.id.clone(),
                    });
                }
                let outgoing: Vec<_> = def.edges.iter().filter(|e| e.source == node.id).collect();
                if !outgoing
                    .iter()
                    .any(|e| e.condition.as_deref() == Some(LOOP_BODY))
                {
                    result.errors.push(ValidationError::LoopWithoutBody {
                        node_id: node.id.clone(),
                    });
                }
                if !outgoing
                    .iter()
                    .any(|e| e.condition.as_deref() != Some(LOOP_BODY))
                {
                    result.warnings.push(ValidationWarning::LoopWithoutExit {
                        node_id: node.id.clone(),
                    });
                }
            }
            _ => {}
        }
    }
}

fn validate_settings(def: &FlowDefinition, result: &mut ValidationResult) {
    let settings = &def.settings;
    for (field, value) in [
        ("viewport_width", settings.viewport_width),
        ("viewport_height", settings.viewport_height),
    ] {
        if let Some(value) = value
            && (value == 0 || value > MAX_VIEWPORT_DIMENSION)
        {
            result
                .errors
                .push(ValidationError::InvalidViewport { field, value });
        }
    }

    if let Some(max_retries) = settings.max_retries
        && max_retries > MAX_STEP_RETRIES
    {
        result
            .errors
            .push(ValidationError::InvalidRetryPolicy { max_retries });
    }
}

fn validate_edge_conditions(def: &FlowDefinition, result: &mut ValidationResult) {
    for edge in &def.edges {
        let Some(condition) = edge.condition.as_deref() else {
            continue;
        };
        let Some(source) = def.node(&edge.source) else {
            continue;
        };
        let expected: &[&str] = match source.node_type() {
            NodeType::Conditional => &[BRANCH_TRUE, BRANCH_FALSE],
            NodeType::Loop => &[LOOP_BODY, LOOP_EXIT],
            _ => &[],
        };
        if !expected.contains(&condition) {
            result.warnings.push(ValidationWarning::UnknownEdgeCondition {
                edge_id: if edge.id.is_empty() {
                    format!("{}->{}", edge.source, edge.target)
                } else {
                    edge.id.clone()
                },
                condition: condition.to_string(),
            });
        }
    }
}

/// True for absolute URLs the browser can open directly.
pub fn is_concrete_url(raw: &str) -> bool {
    if !find_unresolved_tokens(raw).is_empty() {
        return false;
    }
    match url::Url::parse(raw.trim()) {
        Ok(url) => matches!(url.scheme(), "http" | "https" | "about" | "data" | "file"),
        Err(_) => false,
    }
}

/// Find a similar name from a list of candidates (for "did you mean" suggestions).
fn find_similar_name(target: &str, candidates: &[String]) -> Option<String> {
    let target_lower = target.to_lowercase();

    candidates
        .iter()
        .filter_map(|candidate| {
            let distance = levenshtein_distance(&target_lower, &candidate.to_lowercase());
            (distance <= target.len() / 2 + 1).then(|| (candidate.clone(), distance))
        })
        .min_by_key(|(_, d)| *d)
        .map(|(name, _)| name)
}

fn levenshtein_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];
    for i in 1..=a.len() {
        curr[0] = i;
        for j in 1..=b.len() {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize_flow_definition;
    use serde_json::json;

    fn flow(value: serde_json::Value) -> FlowDefinition {
        normalize_flow_definition(&value).unwrap()
    }

    #[test]
    fn test_valid_flow_has_no_errors() {
        let def = flow(json!({
            "nodes": [
                {"id": "a", "type": "navigate", "action": {"url": "https://example.com"}},
                {"id": "b", "type": "screenshot", "action": {}}
            ],
            "edges": [{"id": "e", "source": "a", "target": "b"}]
        }));
        let result = validate_flow(&def);
        assert!(result.is_ok(), "{}", result.error_summary());
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_empty_flow() {
        let result = validate_flow(&FlowDefinition::default());
        assert_eq!(result.errors, vec![ValidationError::EmptyFlow]);
        assert!(result.errors[0].to_string().starts_with("[E001]"));
    }

    #[test]
    fn test_unknown_edge_target_suggests_name() {
        let def = flow(json!({
            "nodes": [
                {"id": "login", "type": "navigate", "action": {"url": "https://a.test"}},
                {"id": "submit", "type": "click", "action": {"selector": "#go"}}
            ],
            "edges": [{"id": "e1", "source": "login", "target": "submt"}]
        }));
        let result = validate_flow(&def);
        let message = result.errors[0].to_string();
        assert!(message.starts_with("[E003]"), "{}", message);
        assert!(message.contains("Did you mean 'submit'?"), "{}", message);
    }

    #[test]
    fn test_missing_fields_and_bad_url() {
        let def = flow(json!({
            "nodes": [
                {"id": "n", "type": "navigate", "action": {"url": "not a url"}},
                {"id": "c", "type": "click", "action": {"selector": " "}},
                {"id": "x", "type": "extract", "action": {}}
            ]
        }));
        let codes: Vec<&str> = validate_flow(&def).errors.iter().map(|e| e.code()).collect();
        assert_eq!(codes, vec!["E011", "E010", "E010"]);
    }

    #[test]
    fn test_templated_url_passes_lint() {
        let def = flow(json!({
            "nodes": [{"id": "n", "type": "navigate", "action": {"url": "${base_url}/login"}}]
        }));
        assert!(validate_flow(&def).is_ok());
    }

    #[test]
    fn test_settings_ranges() {
        let def = flow(json!({
            "nodes": [{"id": "w", "type": "wait", "action": {"duration_ms": 120000}}],
            "settings": {"viewport_width": 0, "max_retries": 5}
        }));
        let result = validate_flow(&def);
        let codes: Vec<&str> = result.errors.iter().map(|e| e.code()).collect();
        assert_eq!(codes, vec!["E020", "E021"]);
        assert_eq!(result.warnings[0].code(), "W004");
    }

    #[test]
    fn test_loop_lint() {
        let def = flow(json!({
            "nodes": [{"id": "l", "type": "loop", "action": {}}]
        }));
        let result = validate_flow(&def);
        let codes: Vec<&str> = result.errors.iter().map(|e| e.code()).collect();
        assert_eq!(codes, vec!["E013", "E012"]);
        assert_eq!(result.warnings[0].code(), "W005");
    }

    #[test]
    fn test_conditional_missing_branch_warns() {
        let def = flow(json!({
            "nodes": [
                {"id": "c", "type": "conditional", "action": {"condition": {"kind": "element_exists", "selector": "#x"}}},
                {"id": "t", "type": "wait", "action": {"duration_ms": 5}}
            ],
            "edges": [{"id": "e", "source": "c", "target": "t", "condition": "true"}]
        }));
        let result = validate_flow(&def);
        assert!(result.is_ok());
        assert_eq!(
            result.warnings,
            vec![ValidationWarning::ConditionalMissingBranch {
                node_id: "c".to_string(),
                branch: "false"
            }]
        );
    }

    #[test]
    fn test_post_resolution_flags_tokens() {
        let def = flow(json!({
            "nodes": [
                {"id": "n", "type": "navigate", "action": {"url": "https://a.test/${path}"}},
                {"id": "t", "type": "type", "action": {"selector": "@selector/login.email", "text": "@fixture/user.email"}},
                {"id": "x", "type": "extract", "action": {"selector": "h1", "store_as": "title"}},
                {"id": "y", "type": "type", "action": {"selector": "#q", "text": "{{ title }}"}}
            ]
        }));
        let result = validate_resolved(&def);
        let tokens: Vec<String> = result
            .errors
            .iter()
            .filter_map(|e| match e {
                ValidationError::UnresolvedToken { token, .. } => Some(token.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(tokens.len(), 3);
        assert!(tokens.contains(&"${path}".to_string()));
        assert!(tokens.contains(&"@selector/login.email".to_string()));
        assert!(tokens.contains(&"@fixture/user.email".to_string()));
    }

    #[test]
    fn test_post_resolution_scenario_destination() {
        let def = flow(json!({
            "nodes": [{
                "id": "n",
                "type": "navigate",
                "action": {"url": "", "destination_type": "scenario", "scenario": "checkout"}
            }]
        }));
        assert!(validate_flow(&def).is_ok());
        let result = validate_resolved(&def);
        assert_eq!(
            result.errors,
            vec![ValidationError::UnresolvedScenarioDestination {
                node_id: "n".to_string(),
                destination: "checkout".to_string()
            }]
        );
    }

    #[test]
    fn test_report_serializes_codes() {
        let def = flow(json!({"nodes": [{"id": "c", "type": "click", "action": {"selector": ""}}]}));
        let report = validate_flow(&def).report();
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["valid"], json!(false));
        assert_eq!(value["errors"][0]["code"], json!("E010"));
        assert_eq!(value["errors"][0]["node_id"], json!("c"));
    }
}
