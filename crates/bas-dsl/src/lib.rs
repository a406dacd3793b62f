// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flow Definition DSL
//!
//! This crate defines the workflow language shared by the studio services:
//! - Typed flow definitions (nodes with strict action payloads, edges, settings)
//! - Normalization of editor-shaped payloads into the canonical shape
//! - Parameter substitution and unresolved-token detection
//! - Graph arena with loop-aware cycle detection and a step cursor
//! - Lint and post-resolution validation with stable error codes
//!
//! The crate does no I/O.

pub mod flow;
pub mod graph;
pub mod normalize;
pub mod template;
pub mod validation;

pub use flow::*;
pub use graph::{FlowCursor, FlowGraph, GraphError, StepOutcome};
pub use normalize::{
    NormalizeError, canonicalize_flow_value, normalize_flow_definition, normalize_parameters,
    stamp_typed_map, unwrap_typed_value, wrap_typed_value,
};
pub use template::{find_unresolved_tokens, resolve_flow, substitute_str};
pub use validation::{
    ValidationError, ValidationReport, ValidationResult, ValidationWarning, validate_flow,
    validate_resolved,
};

// ============================================================================
// Parsing Functions
// ============================================================================

/// Parse a flow definition in either editor or canonical shape.
pub fn parse_flow_definition(json: &serde_json::Value) -> Result<FlowDefinition, String> {
    normalize_flow_definition(json).map_err(|e| format!("Failed to parse flow definition: {}", e))
}

/// Serialize a flow definition to its canonical JSON value.
pub fn flow_to_value(def: &FlowDefinition) -> serde_json::Value {
    serde_json::to_value(def).unwrap_or(serde_json::Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_and_serialize_are_stable() {
        let raw = json!({
            "nodes": [
                {"id": "1", "type": "navigate", "position": {"x": 0, "y": 0},
                 "data": {"url": "https://example.com", "label": "Open"}},
                {"id": "2", "type": "screenshot", "data": {}}
            ],
            "edges": [{"id": "e1", "source": "1", "target": "2"}]
        });
        let def = parse_flow_definition(&raw).unwrap();
        let canonical = flow_to_value(&def);
        let again = parse_flow_definition(&canonical).unwrap();
        assert_eq!(def, again);
        assert_eq!(flow_to_value(&again), canonical);
    }

    #[test]
    fn test_parse_error_prefixed() {
        let err = parse_flow_definition(&json!([])).unwrap_err();
        assert!(err.starts_with("Failed to parse flow definition"));
    }
}
