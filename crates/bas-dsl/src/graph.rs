// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flow graph arena and traversal.
//!
//! [`FlowGraph`] indexes nodes by position (arena index) and stores edges as
//! index pairs. Loop bodies are computed once at build time: the body of a
//! loop `L` is everything reachable from its `body` edges (without passing
//! through `L`) that is not also reachable from its exit edges. Edges that
//! return from a body node to its loop are *back edges*; once they are
//! removed the graph must be acyclic, otherwise the build fails with
//! [`GraphError::CycleOutsideLoop`].
//!
//! [`FlowCursor`] walks the graph one node at a time. Each scope (the root
//! scope and one per loop body) is visited in topological order; a node runs
//! only when one of its incoming edges was taken by a completed predecessor.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};

use crate::flow::{BRANCH_FALSE, BRANCH_TRUE, FlowDefinition, LOOP_BODY, Node, NodeType};

/// Errors raised while building a [`FlowGraph`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    /// The flow has no nodes.
    #[error("flow has no nodes")]
    Empty,
    /// Two nodes share an id.
    #[error("duplicate node id '{0}'")]
    DuplicateNode(String),
    /// An edge points at a node that does not exist.
    #[error("edge '{edge_id}' references unknown {endpoint} node '{node_id}'")]
    UnknownEndpoint {
        /// Edge id (or `source->target` when the edge has none).
        edge_id: String,
        /// `source` or `target`.
        endpoint: &'static str,
        /// The missing node id.
        node_id: String,
    },
    /// A cycle that does not return through a loop node.
    #[error("cycle outside a loop body: {}", .0.join(" -> "))]
    CycleOutsideLoop(Vec<String>),
}

/// An edge between two arena indices.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphEdge {
    /// Source arena index.
    pub source: usize,
    /// Target arena index.
    pub target: usize,
    /// Branch label copied from the definition.
    pub condition: Option<String>,
}

/// Indexed, validated view of a [`FlowDefinition`].
#[derive(Debug, Clone)]
pub struct FlowGraph {
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
    edges: Vec<GraphEdge>,
    outgoing: Vec<Vec<usize>>,
    incoming: Vec<Vec<usize>>,
    back_edges: HashSet<usize>,
    loop_bodies: HashMap<usize, HashSet<usize>>,
    owner: Vec<Option<usize>>,
    topo: Vec<usize>,
}

impl FlowGraph {
    /// Build the arena, compute loop bodies and reject stray cycles.
    pub fn build(def: &FlowDefinition) -> Result<Self, GraphError> {
        if def.nodes.is_empty() {
            return Err(GraphError::Empty);
        }

        let mut index = HashMap::with_capacity(def.nodes.len());
        for (i, node) in def.nodes.iter().enumerate() {
            if index.insert(node.id.clone(), i).is_some() {
                return Err(GraphError::DuplicateNode(node.id.clone()));
            }
        }

        let n = def.nodes.len();
        let mut edges = Vec::with_capacity(def.edges.len());
        let mut outgoing = vec![Vec::new(); n];
        let mut incoming = vec![Vec::new(); n];

        for edge in &def.edges {
            let edge_id = if edge.id.is_empty() {
                format!("{}->{}", edge.source, edge.target)
            } else {
                edge.id.clone()
            };
            let source = *index
                .get(&edge.source)
                .ok_or_else(|| GraphError::UnknownEndpoint {
                    edge_id: edge_id.clone(),
                    endpoint: "source",
                    node_id: edge.source.clone(),
                })?;
            let target = *index
                .get(&edge.target)
                .ok_or_else(|| GraphError::UnknownEndpoint {
                    edge_id: edge_id.clone(),
                    endpoint: "target",
                    node_id: edge.target.clone(),
                })?;

            let edge_index = edges.len();
            edges.push(GraphEdge {
                source,
                target,
                condition: edge.condition.clone(),
            });
            outgoing[source].push(edge_index);
            incoming[target].push(edge_index);
        }

        let mut graph = FlowGraph {
            nodes: def.nodes.clone(),
            index,
            edges,
            outgoing,
            incoming,
            back_edges: HashSet::new(),
            loop_bodies: HashMap::new(),
            owner: vec![None; n],
            topo: Vec::new(),
        };

        graph.compute_loop_bodies();
        graph.check_cycles()?;
        graph.topo = graph.topological_order();

        Ok(graph)
    }

    fn compute_loop_bodies(&mut self) {
        let loops: Vec<usize> = (0..self.nodes.len())
            .filter(|&i| self.nodes[i].node_type() == NodeType::Loop)
            .collect();

        for &l in &loops {
            let (entries, exits): (Vec<usize>, Vec<usize>) = self.outgoing[l]
                .iter()
                .partition(|&&e| self.edges[e].condition.as_deref() == Some(LOOP_BODY));

            let entry_targets: Vec<usize> = entries.iter().map(|&e| self.edges[e].target).collect();
            let exit_targets: Vec<usize> = exits.iter().map(|&e| self.edges[e].target).collect();

            let forward = self.reach_avoiding(&entry_targets, l);
            let after = self.reach_avoiding(&exit_targets, l);
            let body: HashSet<usize> = forward.difference(&after).copied().collect();

            for &node in &body {
                for &e in &self.outgoing[node] {
                    if self.edges[e].target == l {
                        self.back_edges.insert(e);
                    }
                }
            }
            self.loop_bodies.insert(l, body);
        }

        // Innermost owning loop is the smallest body that contains the node.
        for node in 0..self.nodes.len() {
            self.owner[node] = loops
                .iter()
                .filter(|l| self.loop_bodies[*l].contains(&node))
                .min_by_key(|l| self.loop_bodies[*l].len())
                .copied();
        }
    }

    fn reach_avoiding(&self, starts: &[usize], avoid: usize) -> HashSet<usize> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<usize> = starts.iter().copied().filter(|&s| s != avoid).collect();
        while let Some(node) = queue.pop_front() {
            if !seen.insert(node) {
                continue;
            }
            for &e in &self.outgoing[node] {
                let target = self.edges[e].target;
                if target != avoid && !seen.contains(&target) {
                    queue.push_back(target);
                }
            }
        }
        seen
    }

    /// Tarjan's strongly connected components over the graph minus back edges.
    fn check_cycles(&self) -> Result<(), GraphError> {
        struct Tarjan<'a> {
            graph: &'a FlowGraph,
            next_index: usize,
            indices: Vec<Option<usize>>,
            lowlink: Vec<usize>,
            on_stack: Vec<bool>,
            stack: Vec<usize>,
            cycles: Vec<Vec<usize>>,
        }

        impl Tarjan<'_> {
            fn visit(&mut self, v: usize) {
                self.indices[v] = Some(self.next_index);
                self.lowlink[v] = self.next_index;
                self.next_index += 1;
                self.stack.push(v);
                self.on_stack[v] = true;

                let targets: Vec<usize> = self.graph.forward_targets(v).collect();
                for w in targets {
                    match self.indices[w] {
                        None => {
                            self.visit(w);
                            self.lowlink[v] = self.lowlink[v].min(self.lowlink[w]);
                        }
                        Some(w_index) if self.on_stack[w] => {
                            self.lowlink[v] = self.lowlink[v].min(w_index);
                        }
                        Some(_) => {}
                    }
                }

                if Some(self.lowlink[v]) == self.indices[v] {
                    let mut component = Vec::new();
                    while let Some(w) = self.stack.pop() {
                        self.on_stack[w] = false;
                        component.push(w);
                        if w == v {
                            break;
                        }
                    }
                    let self_loop = component.len() == 1
                        && self.graph.forward_targets(v).any(|t| t == v);
                    if component.len() > 1 || self_loop {
                        component.sort_unstable();
                        self.cycles.push(component);
                    }
                }
            }
        }

        let n = self.nodes.len();
        let mut tarjan = Tarjan {
            graph: self,
            next_index: 0,
            indices: vec![None; n],
            lowlink: vec![0; n],
            on_stack: vec![false; n],
            stack: Vec::new(),
            cycles: Vec::new(),
        };
        for v in 0..n {
            if tarjan.indices[v].is_none() {
                tarjan.visit(v);
            }
        }

        match tarjan.cycles.into_iter().min_by_key(|c| c[0]) {
            Some(cycle) => Err(GraphError::CycleOutsideLoop(
                cycle.iter().map(|&i| self.nodes[i].id.clone()).collect(),
            )),
            None => Ok(()),
        }
    }

    /// Kahn's algorithm over forward edges, lowest arena index first.
    fn topological_order(&self) -> Vec<usize> {
        let n = self.nodes.len();
        let mut in_degree = vec![0usize; n];
        for v in 0..n {
            for w in self.forward_targets(v) {
                in_degree[w] += 1;
            }
        }

        let mut ready: BinaryHeap<Reverse<usize>> = (0..n)
            .filter(|&v| in_degree[v] == 0)
            .map(Reverse)
            .collect();
        let mut order = Vec::with_capacity(n);
        while let Some(Reverse(v)) = ready.pop() {
            order.push(v);
            for w in self.forward_targets(v) {
                in_degree[w] -= 1;
                if in_degree[w] == 0 {
                    ready.push(Reverse(w));
                }
            }
        }
        order
    }

    fn forward_edges(&self, node: usize) -> impl Iterator<Item = &GraphEdge> + '_ {
        self.outgoing[node]
            .iter()
            .filter(|e| !self.back_edges.contains(*e))
            .map(|&e| &self.edges[e])
    }

    fn forward_targets(&self, node: usize) -> impl Iterator<Item = usize> + '_ {
        self.forward_edges(node).map(|e| e.target)
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Always false for a built graph; present for API symmetry.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node at an arena index.
    pub fn node(&self, index: usize) -> &Node {
        &self.nodes[index]
    }

    /// All nodes in arena order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Arena index of a node id.
    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// All edges.
    pub fn edges(&self) -> &[GraphEdge] {
        &self.edges
    }

    /// Body of a loop node (empty for non-loop nodes).
    pub fn loop_body(&self, loop_index: usize) -> Vec<usize> {
        let mut body: Vec<usize> = self
            .loop_bodies
            .get(&loop_index)
            .map(|b| b.iter().copied().collect())
            .unwrap_or_default();
        body.sort_unstable();
        body
    }

    /// Innermost loop owning a node, if it sits inside a loop body.
    pub fn owner(&self, index: usize) -> Option<usize> {
        self.owner[index]
    }

    /// Nodes of a scope (root scope for `None`) in topological order.
    pub fn scope(&self, owner: Option<usize>) -> Vec<usize> {
        self.topo
            .iter()
            .copied()
            .filter(|&n| self.owner[n] == owner)
            .collect()
    }

    /// Root-scope nodes without incoming forward edges; execution starts here.
    pub fn entry_points(&self) -> Vec<usize> {
        self.scope_sources(None)
    }

    fn scope_sources(&self, owner: Option<usize>) -> Vec<usize> {
        self.scope(owner)
            .into_iter()
            .filter(|&n| {
                !self.incoming[n].iter().any(|e| {
                    !self.back_edges.contains(e) && self.owner[self.edges[*e].source] == owner
                })
            })
            .collect()
    }

    fn loop_entry_targets(&self, loop_index: usize) -> Vec<usize> {
        self.forward_edges(loop_index)
            .filter(|e| e.condition.as_deref() == Some(LOOP_BODY))
            .map(|e| e.target)
            .filter(|&t| self.owner[t] == Some(loop_index))
            .collect()
    }

    fn loop_exit_targets(&self, loop_index: usize) -> Vec<usize> {
        self.forward_edges(loop_index)
            .filter(|e| e.condition.as_deref() != Some(LOOP_BODY))
            .map(|e| e.target)
            .collect()
    }

    /// Nodes reachable from the entry points, following every forward edge.
    pub fn reachable(&self) -> HashSet<usize> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<usize> = self.entry_points().into();
        while let Some(node) = queue.pop_front() {
            if seen.insert(node) {
                queue.extend(self.forward_targets(node));
            }
        }
        seen
    }
}

// ============================================================================
// Cursor
// ============================================================================

/// Result of executing one node, fed back into the cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Action finished; all outgoing edges are taken.
    Done,
    /// Conditional evaluated; only matching branch edges are taken.
    Branch(bool),
    /// Loop evaluated to this many iterations.
    Iterations(u32),
}

#[derive(Debug, Clone)]
struct CursorFrame {
    owner: Option<usize>,
    scope: Vec<usize>,
    pos: usize,
    active: HashSet<usize>,
    iteration: u32,
    total: u32,
}

/// Step-by-step walker over a [`FlowGraph`].
///
/// Call [`next`](Self::next) to get the next node to run and
/// [`complete`](Self::complete) with its outcome before asking again.
#[derive(Debug, Clone)]
pub struct FlowCursor {
    frames: Vec<CursorFrame>,
}

impl FlowCursor {
    /// Start a walk at the graph's entry points.
    pub fn new(graph: &FlowGraph) -> Self {
        let root = CursorFrame {
            owner: None,
            scope: graph.scope(None),
            pos: 0,
            active: graph.entry_points().into_iter().collect(),
            iteration: 0,
            total: 1,
        };
        Self { frames: vec![root] }
    }

    /// True once every scope is exhausted.
    pub fn is_finished(&self) -> bool {
        self.frames.is_empty()
    }

    /// Active loop frames, outermost first, as `(loop_index, iteration)`.
    pub fn loop_iterations(&self) -> Vec<(usize, u32)> {
        self.frames
            .iter()
            .filter_map(|f| f.owner.map(|l| (l, f.iteration)))
            .collect()
    }

    /// Advance to the next runnable node.
    pub fn next(&mut self, graph: &FlowGraph) -> Option<usize> {
        loop {
            let frame = self.frames.last_mut()?;
            while frame.pos < frame.scope.len() {
                let node = frame.scope[frame.pos];
                frame.pos += 1;
                if frame.active.contains(&node) {
                    return Some(node);
                }
            }

            let Some(loop_index) = frame.owner else {
                self.frames.clear();
                return None;
            };

            frame.iteration += 1;
            if frame.iteration < frame.total {
                frame.pos = 0;
                frame.active = graph.loop_entry_targets(loop_index).into_iter().collect();
                continue;
            }

            self.frames.pop();
            let exits = graph.loop_exit_targets(loop_index);
            if let Some(parent) = self.frames.last_mut() {
                activate(parent, graph, exits);
            }
        }
    }

    /// Record the outcome of the node returned by the last [`next`](Self::next).
    pub fn complete(&mut self, graph: &FlowGraph, node: usize, outcome: StepOutcome) {
        let is_loop = graph.node(node).node_type() == NodeType::Loop;

        if is_loop {
            let iterations = match outcome {
                StepOutcome::Iterations(k) => k,
                _ => 0,
            };
            let entries = graph.loop_entry_targets(node);
            if iterations > 0 && !entries.is_empty() {
                self.frames.push(CursorFrame {
                    owner: Some(node),
                    scope: graph.scope(Some(node)),
                    pos: 0,
                    active: entries.into_iter().collect(),
                    iteration: 0,
                    total: iterations,
                });
            } else if let Some(frame) = self.frames.last_mut() {
                activate(frame, graph, graph.loop_exit_targets(node));
            }
            return;
        }

        let targets: Vec<usize> = graph
            .forward_edges(node)
            .filter(|edge| match outcome {
                StepOutcome::Branch(taken) => match edge.condition.as_deref() {
                    Some(BRANCH_FALSE) => !taken,
                    Some(BRANCH_TRUE) | None => taken,
                    Some(_) => taken,
                },
                _ => true,
            })
            .map(|edge| edge.target)
            .collect();

        if let Some(frame) = self.frames.last_mut() {
            activate(frame, graph, targets);
        }
    }
}

fn activate(frame: &mut CursorFrame, graph: &FlowGraph, targets: Vec<usize>) {
    for target in targets {
        if graph.owner(target) == frame.owner {
            frame.active.insert(target);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{
        Action, Condition, ConditionalAction, Edge, LoopAction, NavigateAction, Position,
        WaitAction,
    };

    fn wait(id: &str) -> Node {
        Node::new(
            id,
            Action::Wait(WaitAction {
                duration_ms: Some(1),
                ..Default::default()
            }),
            Position::default(),
        )
    }

    fn nav(id: &str) -> Node {
        Node::new(
            id,
            Action::Navigate(NavigateAction {
                url: "https://example.com".to_string(),
                ..Default::default()
            }),
            Position::default(),
        )
    }

    fn cond(id: &str) -> Node {
        Node::new(
            id,
            Action::Conditional(ConditionalAction {
                condition: Condition::VariableTruthy {
                    variable: "flag".to_string(),
                },
            }),
            Position::default(),
        )
    }

    fn looping(id: &str) -> Node {
        Node::new(
            id,
            Action::Loop(LoopAction {
                iterations: Some(2),
                ..Default::default()
            }),
            Position::default(),
        )
    }

    fn run(def: &FlowDefinition, mut outcome: impl FnMut(&Node) -> StepOutcome) -> Vec<String> {
        let graph = FlowGraph::build(def).unwrap();
        let mut cursor = FlowCursor::new(&graph);
        let mut visited = Vec::new();
        while let Some(node) = cursor.next(&graph) {
            visited.push(graph.node(node).id.clone());
            let result = outcome(graph.node(node));
            cursor.complete(&graph, node, result);
        }
        assert!(cursor.is_finished());
        visited
    }

    #[test]
    fn test_linear_chain() {
        let def = FlowDefinition {
            nodes: vec![nav("a"), wait("b"), wait("c")],
            edges: vec![Edge::new("a", "b"), Edge::new("b", "c")],
            ..Default::default()
        };
        assert_eq!(run(&def, |_| StepOutcome::Done), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_edgeless_flow_runs_in_order() {
        let def = FlowDefinition {
            nodes: vec![nav("a"), wait("b")],
            ..Default::default()
        };
        assert_eq!(run(&def, |_| StepOutcome::Done), vec!["a", "b"]);
    }

    #[test]
    fn test_topological_order_not_authoring_order() {
        let def = FlowDefinition {
            nodes: vec![wait("late"), nav("start")],
            edges: vec![Edge::new("start", "late")],
            ..Default::default()
        };
        assert_eq!(run(&def, |_| StepOutcome::Done), vec!["start", "late"]);
    }

    #[test]
    fn test_conditional_branches() {
        let def = FlowDefinition {
            nodes: vec![nav("a"), cond("c"), wait("yes"), wait("no"), wait("join")],
            edges: vec![
                Edge::new("a", "c"),
                Edge::new("c", "yes").with_condition("true"),
                Edge::new("c", "no").with_condition("false"),
                Edge::new("yes", "join"),
                Edge::new("no", "join"),
            ],
            ..Default::default()
        };

        let taken = run(&def, |n| match n.node_type() {
            NodeType::Conditional => StepOutcome::Branch(true),
            _ => StepOutcome::Done,
        });
        assert_eq!(taken, vec!["a", "c", "yes", "join"]);

        let not_taken = run(&def, |n| match n.node_type() {
            NodeType::Conditional => StepOutcome::Branch(false),
            _ => StepOutcome::Done,
        });
        assert_eq!(not_taken, vec!["a", "c", "no", "join"]);
    }

    #[test]
    fn test_loop_repeats_body() {
        let def = FlowDefinition {
            nodes: vec![nav("a"), looping("l"), wait("b1"), wait("b2"), wait("after")],
            edges: vec![
                Edge::new("a", "l"),
                Edge::new("l", "b1").with_condition("body"),
                Edge::new("b1", "b2"),
                Edge::new("b2", "l"),
                Edge::new("l", "after").with_condition("exit"),
            ],
            ..Default::default()
        };

        let graph = FlowGraph::build(&def).unwrap();
        let l = graph.index_of("l").unwrap();
        assert_eq!(
            graph.loop_body(l),
            vec![graph.index_of("b1").unwrap(), graph.index_of("b2").unwrap()]
        );

        let visited = run(&def, |n| match n.node_type() {
            NodeType::Loop => StepOutcome::Iterations(3),
            _ => StepOutcome::Done,
        });
        assert_eq!(
            visited,
            vec!["a", "l", "b1", "b2", "b1", "b2", "b1", "b2", "after"]
        );
    }

    #[test]
    fn test_zero_iterations_skips_body() {
        let def = FlowDefinition {
            nodes: vec![looping("l"), wait("body"), wait("after")],
            edges: vec![
                Edge::new("l", "body").with_condition("body"),
                Edge::new("body", "l"),
                Edge::new("l", "after").with_condition("exit"),
            ],
            ..Default::default()
        };
        let visited = run(&def, |n| match n.node_type() {
            NodeType::Loop => StepOutcome::Iterations(0),
            _ => StepOutcome::Done,
        });
        assert_eq!(visited, vec!["l", "after"]);
    }

    #[test]
    fn test_nested_loops() {
        let def = FlowDefinition {
            nodes: vec![looping("outer"), looping("inner"), wait("x"), wait("y")],
            edges: vec![
                Edge::new("outer", "inner").with_condition("body"),
                Edge::new("inner", "x").with_condition("body"),
                Edge::new("x", "inner"),
                Edge::new("inner", "y").with_condition("exit"),
                Edge::new("y", "outer"),
            ],
            ..Default::default()
        };
        let visited = run(&def, |n| match n.node_type() {
            NodeType::Loop => StepOutcome::Iterations(2),
            _ => StepOutcome::Done,
        });
        assert_eq!(
            visited,
            vec![
                "outer", "inner", "x", "x", "y", "inner", "x", "x", "y"
            ]
        );
    }

    #[test]
    fn test_cycle_outside_loop_rejected() {
        let def = FlowDefinition {
            nodes: vec![nav("a"), wait("b"), wait("c")],
            edges: vec![
                Edge::new("a", "b"),
                Edge::new("b", "c"),
                Edge::new("c", "b"),
            ],
            ..Default::default()
        };
        assert_eq!(
            FlowGraph::build(&def).unwrap_err(),
            GraphError::CycleOutsideLoop(vec!["b".to_string(), "c".to_string()])
        );
    }

    #[test]
    fn test_self_loop_rejected() {
        let def = FlowDefinition {
            nodes: vec![wait("a")],
            edges: vec![Edge::new("a", "a")],
            ..Default::default()
        };
        assert!(matches!(
            FlowGraph::build(&def),
            Err(GraphError::CycleOutsideLoop(_))
        ));
    }

    #[test]
    fn test_unknown_endpoint_and_duplicates() {
        let def = FlowDefinition {
            nodes: vec![wait("a")],
            edges: vec![Edge::new("a", "ghost")],
            ..Default::default()
        };
        assert!(matches!(
            FlowGraph::build(&def),
            Err(GraphError::UnknownEndpoint { endpoint: "target", .. })
        ));

        let def = FlowDefinition {
            nodes: vec![wait("a"), wait("a")],
            ..Default::default()
        };
        assert_eq!(
            FlowGraph::build(&def).unwrap_err(),
            GraphError::DuplicateNode("a".to_string())
        );

        assert_eq!(
            FlowGraph::build(&FlowDefinition::default()).unwrap_err(),
            GraphError::Empty
        );
    }
}
