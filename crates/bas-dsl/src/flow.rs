// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Canonical flow definition types.
//!
//! These types describe the persisted (protojson-compatible) shape of a
//! workflow: snake_case field names, unknown fields rejected on every typed
//! section. The loose shape produced by the visual editor is converted into
//! this one by [`crate::normalize`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum::{AsRefStr, Display, EnumIter, EnumString};

/// Flow format version written into exported workflow files.
pub const FLOW_FORMAT_VERSION: &str = "1.0";

// ============================================================================
// Root Types
// ============================================================================

/// A complete workflow graph: ordered nodes, ordered edges, settings and
/// free-form metadata.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FlowDefinition {
    /// Nodes in authoring order. The first node is the graph root.
    #[serde(default)]
    pub nodes: Vec<Node>,

    /// Directed edges between nodes.
    #[serde(default)]
    pub edges: Vec<Edge>,

    /// Execution settings (viewport, timeouts, retry policy).
    #[serde(default, skip_serializing_if = "FlowSettings::is_empty")]
    pub settings: FlowSettings,

    /// Free-form metadata carried along with the definition.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl FlowDefinition {
    /// Look up a node by id.
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Ids of all nodes, in authoring order.
    pub fn node_ids(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.id.clone()).collect()
    }

    /// Number of nodes that produce a browser interaction (everything except
    /// control-flow nodes).
    pub fn action_node_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| !n.node_type().is_control_flow())
            .count()
    }
}

/// Execution settings attached to a flow.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FlowSettings {
    /// Browser viewport width in CSS pixels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewport_width: Option<u32>,

    /// Browser viewport height in CSS pixels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewport_height: Option<u32>,

    /// Default per-step timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    /// Retries per failed step (capped at 3).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,

    /// Base backoff between retries in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_backoff_ms: Option<u64>,

    /// User agent override for the browser session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,

    /// Capture a screenshot after every successful step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot_each_step: Option<bool>,
}

impl FlowSettings {
    /// True when no setting is populated.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Canvas position of a node.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Position {
    /// Horizontal coordinate.
    pub x: f64,
    /// Vertical coordinate.
    pub y: f64,
}

/// A directed edge between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Edge {
    /// Edge id; optional in hand-written definitions.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    /// Source node id.
    pub source: String,
    /// Target node id.
    pub target: String,
    /// Branch label: `true`/`false` out of conditionals, `body`/`exit` out of loops.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl Edge {
    /// Create an unconditional edge with a derived id.
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        let source = source.into();
        let target = target.into();
        Self {
            id: format!("{}->{}", source, target),
            source,
            target,
            condition: None,
        }
    }

    /// Attach a branch condition.
    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }
}

/// Edge condition taken when a conditional evaluates true.
pub const BRANCH_TRUE: &str = "true";
/// Edge condition taken when a conditional evaluates false.
pub const BRANCH_FALSE: &str = "false";
/// Edge condition entering a loop body.
pub const LOOP_BODY: &str = "body";
/// Edge condition leaving a loop.
pub const LOOP_EXIT: &str = "exit";

// ============================================================================
// Nodes
// ============================================================================

/// Node kinds understood by the execution engine.
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
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NodeType {
    Navigate,
    Click,
    Type,
    Scroll,
    Select,
    Extract,
    Keyboard,
    Wait,
    Conditional,
    Loop,
    Screenshot,
}

impl NodeType {
    /// Control-flow nodes never talk to the browser directly.
    pub fn is_control_flow(&self) -> bool {
        matches!(self, NodeType::Conditional | NodeType::Loop)
    }
}

/// A workflow node: identity, canvas position and a typed action payload.
///
/// Serialized as `{"id", "type", "position", "label"?, "action"}`; the
/// `action` object is parsed strictly according to `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawNode", into = "RawNode")]
pub struct Node {
    /// Node id, unique within the flow.
    pub id: String,
    /// Canvas position.
    pub position: Position,
    /// Human-readable label.
    pub label: Option<String>,
    /// Typed action payload.
    pub action: Action,
}

impl Node {
    /// Create a node at the given position.
    pub fn new(id: impl Into<String>, action: Action, position: Position) -> Self {
        Self {
            id: id.into(),
            position,
            label: None,
            action,
        }
    }

    /// Attach a label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Kind of this node, derived from its action.
    pub fn node_type(&self) -> NodeType {
        self.action.node_type()
    }
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawNode {
    id: String,
    #[serde(rename = "type")]
    node_type: NodeType,
    #[serde(default)]
    position: Position,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    label: Option<String>,
    #[serde(default)]
    action: Value,
}

impl TryFrom<RawNode> for Node {
    type Error = String;

    fn try_from(raw: RawNode) -> Result<Self, Self::Error> {
        let action = Action::from_parts(raw.node_type, raw.action)
            .map_err(|e| format!("node '{}': {}", raw.id, e))?;
        Ok(Node {
            id: raw.id,
            position: raw.position,
            label: raw.label,
            action,
        })
    }
}

impl From<Node> for RawNode {
    fn from(node: Node) -> Self {
        RawNode {
            node_type: node.node_type(),
            action: node.action.params_value(),
            id: node.id,
            position: node.position,
            label: node.label,
        }
    }
}

// ============================================================================
// Actions
// ============================================================================

/// Typed action payload, one variant per [`NodeType`].
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Navigate(NavigateAction),
    Click(ClickAction),
    Type(TypeAction),
    Scroll(ScrollAction),
    Select(SelectAction),
    Extract(ExtractAction),
    Keyboard(KeyboardAction),
    Wait(WaitAction),
    Conditional(ConditionalAction),
    Loop(LoopAction),
    Screenshot(ScreenshotAction),
}

impl Action {
    /// Kind of node this action belongs to.
    pub fn node_type(&self) -> NodeType {
        match self {
            Action::Navigate(_) => NodeType::Navigate,
            Action::Click(_) => NodeType::Click,
            Action::Type(_) => NodeType::Type,
            Action::Scroll(_) => NodeType::Scroll,
            Action::Select(_) => NodeType::Select,
            Action::Extract(_) => NodeType::Extract,
            Action::Keyboard(_) => NodeType::Keyboard,
            Action::Wait(_) => NodeType::Wait,
            Action::Conditional(_) => NodeType::Conditional,
            Action::Loop(_) => NodeType::Loop,
            Action::Screenshot(_) => NodeType::Screenshot,
        }
    }

    /// Parse an action payload for the given node type, rejecting unknown fields.
    pub fn from_parts(node_type: NodeType, params: Value) -> Result<Self, serde_json::Error> {
        // Missing payloads are treated as empty objects so that required
        // fields surface as "missing field" errors rather than type errors.
        let params = if params.is_null() {
            Value::Object(Map::new())
        } else {
            params
        };

        Ok(match node_type {
            NodeType::Navigate => Action::Navigate(serde_json::from_value(params)?),
            NodeType::Click => Action::Click(serde_json::from_value(params)?),
            NodeType::Type => Action::Type(serde_json::from_value(params)?),
            NodeType::Scroll => Action::Scroll(serde_json::from_value(params)?),
            NodeType::Select => Action::Select(serde_json::from_value(params)?),
            NodeType::Extract => Action::Extract(serde_json::from_value(params)?),
            NodeType::Keyboard => Action::Keyboard(serde_json::from_value(params)?),
            NodeType::Wait => Action::Wait(serde_json::from_value(params)?),
            NodeType::Conditional => Action::Conditional(serde_json::from_value(params)?),
            NodeType::Loop => Action::Loop(serde_json::from_value(params)?),
            NodeType::Screenshot => Action::Screenshot(serde_json::from_value(params)?),
        })
    }

    /// Serialize the payload (without the type tag).
    pub fn params_value(&self) -> Value {
        let result = match self {
            Action::Navigate(a) => serde_json::to_value(a),
            Action::Click(a) => serde_json::to_value(a),
            Action::Type(a) => serde_json::to_value(a),
            Action::Scroll(a) => serde_json::to_value(a),
            Action::Select(a) => serde_json::to_value(a),
            Action::Extract(a) => serde_json::to_value(a),
            Action::Keyboard(a) => serde_json::to_value(a),
            Action::Wait(a) => serde_json::to_value(a),
            Action::Conditional(a) => serde_json::to_value(a),
            Action::Loop(a) => serde_json::to_value(a),
            Action::Screenshot(a) => serde_json::to_value(a),
        };
        // Plain structs of strings, numbers and JSON values always serialize.
        result.unwrap_or(Value::Null)
    }

    /// CSS selector targeted by this action, if any.
    pub fn selector(&self) -> Option<&str> {
        match self {
            Action::Click(a) => Some(&a.selector),
            Action::Type(a) => Some(&a.selector),
            Action::Select(a) => Some(&a.selector),
            Action::Scroll(a) => a.selector.as_deref(),
            Action::Extract(a) => a.selector.as_deref(),
            Action::Wait(a) => a.selector.as_deref(),
            Action::Screenshot(a) => a.selector.as_deref(),
            Action::Conditional(a) => match &a.condition {
                Condition::ElementExists { selector } => Some(selector),
                _ => None,
            },
            Action::Navigate(_) | Action::Keyboard(_) | Action::Loop(_) => None,
        }
    }

    /// Per-action timeout override.
    pub fn timeout_ms(&self) -> Option<u64> {
        match self {
            Action::Navigate(a) => a.timeout_ms,
            Action::Click(a) => a.timeout_ms,
            Action::Wait(a) => a.timeout_ms,
            _ => None,
        }
    }
}

/// When a navigation is considered finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum WaitUntil {
    Load,
    DomContentLoaded,
    NetworkIdle,
}

/// What a navigate node's destination refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationType {
    /// A literal URL.
    #[default]
    Url,
    /// A scenario-scoped destination that resolves to a URL before execution.
    Scenario,
}

/// Navigate to a URL.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NavigateAction {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_until: Option<WaitUntil>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_type: Option<DestinationType>,
    /// Scenario name when `destination_type` is `scenario`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario: Option<String>,
}

/// Mouse button for clicks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MouseButton {
    #[default]
    Left,
    Right,
    Middle,
}

/// Click an element.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClickAction {
    pub selector: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub button: Option<MouseButton>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub click_count: Option<u32>,
    /// Held modifier keys (`Shift`, `Control`, `Alt`, `Meta`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modifiers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Type text into an element.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TypeAction {
    pub selector: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
    /// Clear the field before typing.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub clear: bool,
}

/// Scroll the page or an element.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScrollAction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<i64>,
}

/// Choose an option of a `<select>`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SelectAction {
    pub selector: String,
    pub value: String,
}

/// Extract data from the page, either by selector or by script.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtractAction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    /// JavaScript expression evaluated in the page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    /// Attribute to read instead of text content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
    /// Variable the extracted value is stored under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_as: Option<String>,
    /// Extract from every match instead of the first.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub all: bool,
}

/// Press a key.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeyboardAction {
    pub key: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modifiers: Vec<String>,
}

/// Wait for a duration or for a selector to appear.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WaitAction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Branch on a condition. Outgoing edges are labelled `true` / `false`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConditionalAction {
    pub condition: Condition,
}

/// A condition evaluated by a conditional node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum Condition {
    /// True when the selector matches at least one element.
    ElementExists { selector: String },
    /// True when a variable equals the given value.
    VariableEquals { variable: String, value: Value },
    /// True when a variable is set and truthy.
    VariableTruthy { variable: String },
}

/// Repeat the loop body a fixed number of times or once per item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoopAction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterations: Option<u32>,
    /// Variable holding an array to iterate over.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items_variable: Option<String>,
    /// Variable the current item is exposed as inside the body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_variable: Option<String>,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
}

fn default_max_iterations() -> u32 {
    100
}

impl Default for LoopAction {
    fn default() -> Self {
        Self {
            iterations: None,
            items_variable: None,
            item_variable: None,
            max_iterations: default_max_iterations(),
        }
    }
}

/// Capture a screenshot of the page or an element.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScreenshotAction {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub full_page: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_node_round_trip_keeps_type_and_action() {
        let value = json!({
            "id": "n1",
            "type": "click",
            "position": {"x": 250.0, "y": 100.0},
            "label": "Click button",
            "action": {"selector": "#btn", "modifiers": ["Shift"]}
        });

        let node: Node = serde_json::from_value(value.clone()).unwrap();
        assert_eq!(node.node_type(), NodeType::Click);
        match &node.action {
            Action::Click(click) => {
                assert_eq!(click.selector, "#btn");
                assert_eq!(click.modifiers, vec!["Shift".to_string()]);
            }
            other => panic!("unexpected action {:?}", other),
        }

        assert_eq!(serde_json::to_value(&node).unwrap(), value);
    }

    #[test]
    fn test_unknown_action_field_is_rejected() {
        let value = json!({
            "id": "n1",
            "type": "navigate",
            "action": {"url": "https://example.com", "waitUntil": "load"}
        });

        let err = serde_json::from_value::<Node>(value).unwrap_err();
        assert!(err.to_string().contains("waitUntil"), "{}", err);
        assert!(err.to_string().contains("node 'n1'"), "{}", err);
    }

    #[test]
    fn test_missing_required_field_is_reported() {
        let value = json!({"id": "n1", "type": "type", "action": {"selector": "#q"}});
        let err = serde_json::from_value::<Node>(value).unwrap_err();
        assert!(err.to_string().contains("text"), "{}", err);
    }

    #[test]
    fn test_camel_case_settings_rejected() {
        let value = json!({"nodes": [], "settings": {"viewportWidth": 1280}});
        assert!(serde_json::from_value::<FlowDefinition>(value).is_err());
    }

    #[test]
    fn test_conditional_payload() {
        let value = json!({
            "id": "c",
            "type": "conditional",
            "action": {"condition": {"kind": "element_exists", "selector": ".banner"}}
        });
        let node: Node = serde_json::from_value(value).unwrap();
        assert_eq!(node.action.selector(), Some(".banner"));
        assert!(node.node_type().is_control_flow());
    }

    #[test]
    fn test_loop_defaults_max_iterations() {
        let node: Node =
            serde_json::from_value(json!({"id": "l", "type": "loop", "action": {"iterations": 3}}))
                .unwrap();
        match node.action {
            Action::Loop(l) => {
                assert_eq!(l.iterations, Some(3));
                assert_eq!(l.max_iterations, 100);
            }
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn test_node_type_strings() {
        assert_eq!(NodeType::Keyboard.to_string(), "keyboard");
        assert_eq!("navigate".parse::<NodeType>().unwrap(), NodeType::Navigate);
        assert!("hover".parse::<NodeType>().is_err());
    }

    #[test]
    fn test_empty_settings_not_serialized() {
        let def = FlowDefinition::default();
        assert_eq!(
            serde_json::to_value(&def).unwrap(),
            json!({"nodes": [], "edges": []})
        );
    }
}
