//! Stage graph construction and validation.
//!
//! A graph is assembled with the builder, validated once, and then immutable.
//! All structural errors (unknown node references, duplicate names, cycles in
//! the static edges) surface at build time so the executor never has to
//! handle a malformed graph.

use crate::errors::GraphError;
use crate::stage::StageOperation;
use crate::state::WorkflowState;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

/// Predicate gating a conditional edge.
pub type EdgeCondition = Arc<dyn Fn(&WorkflowState) -> bool + Send + Sync>;

/// Review loop attached to a node: where a retry jumps back to and how many
/// rejection cycles a task gets before the router forces a decision.
#[derive(Clone)]
pub struct ReviewLoop {
    /// Node re-entered on `RetrySameStage`.
    pub retry_to: String,
    /// Per-task rejection budget.
    pub max_iterations: u32,
}

/// One node of the stage graph.
pub struct NodeDef {
    pub name: String,
    pub op: Arc<dyn StageOperation>,
    /// Review loop routing, for review nodes.
    pub review: Option<ReviewLoop>,
}

struct Edge {
    from: String,
    to: String,
    condition: Option<EdgeCondition>,
}

/// Validated, immutable stage graph.
///
/// Edge order is significant: `next_node` returns the first edge out of a
/// node whose condition passes, and unconditional edges always pass.
pub struct StageGraph {
    nodes: HashMap<String, NodeDef>,
    edges: Vec<Edge>,
    entry: String,
    interrupts: HashSet<String>,
    observable: HashSet<String>,
}

impl StageGraph {
    pub fn builder() -> GraphBuilder {
        GraphBuilder::new()
    }

    pub fn node(&self, name: &str) -> Option<&NodeDef> {
        self.nodes.get(name)
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    /// Check if execution must pause for approval before this node.
    pub fn is_interrupt(&self, name: &str) -> bool {
        self.interrupts.contains(name)
    }

    /// Node names flagged observable, consumed by the event translator.
    pub fn observable_nodes(&self) -> &HashSet<String> {
        &self.observable
    }

    /// First matching successor of `from` under the current state, or `None`
    /// when the node is terminal.
    pub fn next_node(&self, from: &str, state: &WorkflowState) -> Option<&str> {
        self.edges
            .iter()
            .filter(|e| e.from == from)
            .find(|e| e.condition.as_ref().is_none_or(|cond| cond(state)))
            .map(|e| e.to.as_str())
    }

    /// First conditional successor of `from` whose predicate passes, ignoring
    /// unconditional edges. Used to find a rejection retry path.
    pub fn conditional_next(&self, from: &str, state: &WorkflowState) -> Option<&str> {
        self.edges
            .iter()
            .filter(|e| e.from == from)
            .find(|e| e.condition.as_ref().is_some_and(|cond| cond(state)))
            .map(|e| e.to.as_str())
    }
}

impl fmt::Debug for StageGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageGraph")
            .field("nodes", &self.nodes.keys().collect::<Vec<_>>())
            .field("entry", &self.entry)
            .field("interrupts", &self.interrupts)
            .field("observable", &self.observable)
            .finish()
    }
}

/// Builder for a `StageGraph`.
#[derive(Default)]
pub struct GraphBuilder {
    nodes: Vec<NodeDef>,
    edges: Vec<Edge>,
    entry: Option<String>,
    interrupts: HashSet<String>,
    observable: HashSet<String>,
    review_loops: Vec<(String, ReviewLoop)>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node backed by a stage operation.
    pub fn node(mut self, name: impl Into<String>, op: Arc<dyn StageOperation>) -> Self {
        self.nodes.push(NodeDef {
            name: name.into(),
            op,
            review: None,
        });
        self
    }

    /// Add an unconditional edge.
    pub fn edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.push(Edge {
            from: from.into(),
            to: to.into(),
            condition: None,
        });
        self
    }

    /// Add a conditional edge, consulted in insertion order before any later
    /// edge out of the same node.
    pub fn edge_if(
        mut self,
        from: impl Into<String>,
        to: impl Into<String>,
        condition: EdgeCondition,
    ) -> Self {
        self.edges.push(Edge {
            from: from.into(),
            to: to.into(),
            condition: Some(condition),
        });
        self
    }

    /// Set the entry node. Defaults to the first node added.
    pub fn entry(mut self, name: impl Into<String>) -> Self {
        self.entry = Some(name.into());
        self
    }

    /// Require approval before `name` executes.
    pub fn interrupt_before(mut self, name: impl Into<String>) -> Self {
        self.interrupts.insert(name.into());
        self
    }

    /// Flag `name` as observable: its transitions produce external events.
    pub fn observable(mut self, name: impl Into<String>) -> Self {
        self.observable.insert(name.into());
        self
    }

    /// Attach a review loop to `node`: on rejection the router jumps back to
    /// `retry_to`, at most `max_iterations` times per task.
    pub fn review_loop(
        mut self,
        node: impl Into<String>,
        retry_to: impl Into<String>,
        max_iterations: u32,
    ) -> Self {
        self.review_loops.push((
            node.into(),
            ReviewLoop {
                retry_to: retry_to.into(),
                max_iterations,
            },
        ));
        self
    }

    /// Validate and freeze the graph.
    pub fn build(self) -> Result<StageGraph, GraphError> {
        let mut nodes = HashMap::new();
        let mut order = Vec::new();

        for def in self.nodes {
            if nodes.contains_key(&def.name) {
                return Err(GraphError::DuplicateNode { name: def.name });
            }
            order.push(def.name.clone());
            nodes.insert(def.name.clone(), def);
        }

        if nodes.is_empty() {
            return Err(GraphError::Empty);
        }

        for edge in &self.edges {
            for end in [&edge.from, &edge.to] {
                if !nodes.contains_key(end) {
                    return Err(GraphError::UnknownEdgeNode {
                        from: edge.from.clone(),
                        to: edge.to.clone(),
                        unknown: end.clone(),
                    });
                }
            }
        }

        for name in &self.interrupts {
            if !nodes.contains_key(name) {
                return Err(GraphError::UnknownInterrupt { name: name.clone() });
            }
        }

        for name in &self.observable {
            if !nodes.contains_key(name) {
                return Err(GraphError::UnknownObservable { name: name.clone() });
            }
        }

        for (node, review) in self.review_loops {
            if !nodes.contains_key(&review.retry_to) {
                return Err(GraphError::UnknownReviewTarget {
                    node,
                    target: review.retry_to,
                });
            }
            match nodes.get_mut(&node) {
                Some(def) => def.review = Some(review),
                None => return Err(GraphError::UnknownReviewNode { node }),
            }
        }

        let entry = match self.entry {
            Some(name) => {
                if !nodes.contains_key(&name) {
                    return Err(GraphError::UnknownEntry { name });
                }
                name
            }
            // order is non-empty, checked above
            None => order[0].clone(),
        };

        // Kahn's algorithm over the unconditional edges. Conditional edges
        // are allowed to point backwards (rejection retry paths); review
        // loops are router-driven and never appear as edges at all.
        detect_cycle(&order, &self.edges)?;

        Ok(StageGraph {
            nodes,
            edges: self.edges,
            entry,
            interrupts: self.interrupts,
            observable: self.observable,
        })
    }
}

fn detect_cycle(order: &[String], edges: &[Edge]) -> Result<(), GraphError> {
    let mut in_degree: HashMap<&str, usize> = order.iter().map(|n| (n.as_str(), 0)).collect();
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();

    for edge in edges.iter().filter(|e| e.condition.is_none()) {
        adjacency
            .entry(edge.from.as_str())
            .or_default()
            .push(edge.to.as_str());
        *in_degree.entry(edge.to.as_str()).or_default() += 1;
    }

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(n, _)| *n)
        .collect();
    let mut visited = 0usize;

    while let Some(node) = queue.pop_front() {
        visited += 1;
        for next in adjacency.get(node).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(next) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(next);
                }
            }
        }
    }

    if visited != order.len() {
        let mut stuck: Vec<String> = in_degree
            .iter()
            .filter(|(_, d)| **d > 0)
            .map(|(n, _)| n.to_string())
            .collect();
        stuck.sort();
        return Err(GraphError::CycleDetected { nodes: stuck });
    }
    Ok(())
}
