//! Graph model and topology validation.
//!
//! A [`Graph`] owns its nodes and directed edges. It must pass
//! [`Graph::validate_topology`] before a scheduler will execute it, and any
//! structural mutation clears the validated state. Mutation needs `&mut self`,
//! so a graph shared through an `Arc` for execution cannot change underneath a
//! running scheduler.
//!
//! Cycle reports follow depth-first order: roots are visited in insertion
//! order and outgoing edges in the order they were declared. The reported path
//! starts at the first node found twice on the current DFS path and follows
//! edge direction back to it.

mod node;

pub use node::{node_fn, FnNode, NodeHandle, NodeInput, NodeOptions, NodeRunner, NodeSpec};

use crate::errors::{CycleDetectedError, MissingDependencyError, PipelineError};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, OnceLock};

/// Node ids forming a cycle. First and last are the same node and every
/// consecutive pair is an edge.
pub type CycleReport = Vec<String>;

/// A directed acyclic graph of nodes.
#[derive(Debug, Default)]
pub struct Graph {
    name: String,
    nodes: HashMap<String, NodeSpec>,
    order: Vec<String>,
    required: Vec<String>,
    validated: OnceLock<Vec<String>>,
}

impl Graph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Returns the graph name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns a node by id.
    #[must_use]
    pub fn node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.get(id)
    }

    /// Returns true if the node exists.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// Returns node ids in insertion order.
    #[must_use]
    pub fn node_ids(&self) -> &[String] {
        &self.order
    }

    /// Returns the ids declared as required.
    #[must_use]
    pub fn required_nodes(&self) -> &[String] {
        &self.required
    }

    /// Returns true if the graph has passed validation since its last mutation.
    #[must_use]
    pub fn is_validated(&self) -> bool {
        self.validated.get().is_some()
    }

    /// Returns the cached topological order, if validated.
    #[must_use]
    pub fn topological_order(&self) -> Option<&[String]> {
        self.validated.get().map(Vec::as_slice)
    }

    /// Adds a node.
    ///
    /// Dependencies listed in `options.depends_on` may reference nodes that
    /// are added later; validation reports any that never appear.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an empty or duplicate id.
    pub fn add_node(
        &mut self,
        id: impl Into<String>,
        runner: Arc<dyn NodeRunner>,
        options: NodeOptions,
    ) -> Result<NodeHandle, PipelineError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(PipelineError::validation("node id cannot be empty"));
        }
        if self.nodes.contains_key(&id) {
            return Err(PipelineError::validation(format!(
                "node '{id}' already exists in graph '{}'",
                self.name
            )));
        }

        let mut inputs = Vec::new();
        for dep in options.depends_on {
            push_unique(&mut inputs, dep);
        }

        for dep in &inputs {
            if let Some(upstream) = self.nodes.get_mut(dep) {
                push_unique(&mut upstream.outputs, id.clone());
            }
        }

        // Wire nodes that declared this id before it existed.
        let mut outputs = Vec::new();
        for existing in &self.order {
            if self.nodes[existing].inputs.contains(&id) {
                outputs.push(existing.clone());
            }
        }

        self.nodes.insert(
            id.clone(),
            NodeSpec {
                id: id.clone(),
                runner,
                inputs,
                outputs,
                optional: options.optional,
                max_retries: options.max_retries,
                retry_delay: options.retry_delay,
                timeout: options.timeout,
            },
        );
        self.order.push(id.clone());
        self.invalidate();

        Ok(NodeHandle::new(id))
    }

    /// Adds a directed edge `from -> to`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::UnknownNode`] if either endpoint is absent.
    pub fn connect(&mut self, from: &str, to: &str) -> Result<(), PipelineError> {
        for id in [from, to] {
            if !self.nodes.contains_key(id) {
                return Err(PipelineError::unknown_node(id));
            }
        }

        if let Some(upstream) = self.nodes.get_mut(from) {
            push_unique(&mut upstream.outputs, to.to_string());
        }
        if let Some(downstream) = self.nodes.get_mut(to) {
            push_unique(&mut downstream.inputs, from.to_string());
        }
        self.invalidate();
        Ok(())
    }

    /// Declares a node that must exist and must succeed in every run.
    pub fn require(&mut self, id: impl Into<String>) {
        push_unique(&mut self.required, id.into());
        self.invalidate();
    }

    /// Validates the topology.
    ///
    /// Nodes and edges are left untouched; on success the topological order is
    /// cached and the graph becomes executable.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::MissingDependency`] for undeclared references
    /// and [`PipelineError::CycleDetected`] when a cycle exists.
    pub fn validate_topology(&self) -> Result<(), PipelineError> {
        for id in &self.order {
            for dep in &self.nodes[id].inputs {
                if !self.nodes.contains_key(dep) {
                    return Err(MissingDependencyError::new(id.clone(), dep.clone()).into());
                }
            }
        }
        for id in &self.required {
            if !self.nodes.contains_key(id) {
                return Err(MissingDependencyError::new("<graph>", id.clone()).into());
            }
        }

        self.detect_cycles()?;

        let order = self.kahn_order();
        let _ = self.validated.set(order);
        Ok(())
    }

    fn invalidate(&mut self) {
        self.validated = OnceLock::new();
    }

    fn detect_cycles(&self) -> Result<(), CycleDetectedError> {
        let mut visited = HashSet::new();
        let mut on_path = HashSet::new();
        let mut path = Vec::new();

        for id in &self.order {
            if !visited.contains(id.as_str()) {
                if let Some(cycle) = self.dfs_cycle(id, &mut visited, &mut on_path, &mut path) {
                    return Err(CycleDetectedError::new(cycle));
                }
            }
        }
        Ok(())
    }

    fn dfs_cycle<'a>(
        &'a self,
        node: &'a str,
        visited: &mut HashSet<&'a str>,
        on_path: &mut HashSet<&'a str>,
        path: &mut Vec<&'a str>,
    ) -> Option<CycleReport> {
        visited.insert(node);
        on_path.insert(node);
        path.push(node);

        if let Some(spec) = self.nodes.get(node) {
            for next in &spec.outputs {
                let next = next.as_str();
                if on_path.contains(next) {
                    let start = path.iter().position(|n| *n == next).unwrap_or(0);
                    let mut cycle: CycleReport =
                        path[start..].iter().map(|n| (*n).to_string()).collect();
                    cycle.push(next.to_string());
                    return Some(cycle);
                }
                if !visited.contains(next) {
                    if let Some(cycle) = self.dfs_cycle(next, visited, on_path, path) {
                        return Some(cycle);
                    }
                }
            }
        }

        path.pop();
        on_path.remove(node);
        None
    }

    /// Kahn's algorithm with insertion-order tie-breaking. Assumes acyclicity.
    fn kahn_order(&self) -> Vec<String> {
        let mut in_degree: HashMap<&str, usize> = self
            .order
            .iter()
            .map(|id| (id.as_str(), self.nodes[id].inputs.len()))
            .collect();
        let mut ready: VecDeque<&str> = self
            .order
            .iter()
            .map(String::as_str)
            .filter(|id| in_degree[id] == 0)
            .collect();
        let mut result = Vec::with_capacity(self.order.len());

        while let Some(id) = ready.pop_front() {
            result.push(id.to_string());
            for next in &self.nodes[id].outputs {
                if let Some(count) = in_degree.get_mut(next.as_str()) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        ready.push_back(next);
                    }
                }
            }
        }
        result
    }
}

fn push_unique(list: &mut Vec<String>, value: String) {
    if !list.contains(&value) {
        list.push(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn noop() -> Arc<dyn NodeRunner> {
        node_fn("noop", |_input| async { Ok(Value::Null) })
    }

    fn linear(ids: &[&str]) -> Graph {
        let mut graph = Graph::new("linear");
        for id in ids {
            graph.add_node(*id, noop(), NodeOptions::new()).unwrap();
        }
        for pair in ids.windows(2) {
            graph.connect(pair[0], pair[1]).unwrap();
        }
        graph
    }

    fn assert_valid_cycle(graph: &Graph, cycle: &[String]) {
        assert!(cycle.len() >= 2);
        assert_eq!(cycle.first(), cycle.last());
        for pair in cycle.windows(2) {
            let from = graph.node(&pair[0]).unwrap();
            assert!(
                from.outputs.contains(&pair[1]),
                "{} -> {} is not an edge",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_acyclic_graph_validates() {
        let graph = linear(&["a", "b", "c"]);
        assert!(!graph.is_validated());

        graph.validate_topology().unwrap();

        assert!(graph.is_validated());
        assert_eq!(
            graph.topological_order().unwrap(),
            &["a".to_string(), "b".to_string(), "c".to_string()]
        );
    }

    #[test]
    fn test_three_node_cycle_detected() {
        let mut graph = linear(&["a", "b", "c"]);
        graph.connect("c", "a").unwrap();

        let err = graph.validate_topology().unwrap_err();
        match err {
            PipelineError::CycleDetected(report) => assert_valid_cycle(&graph, &report.cycle),
            other => panic!("expected cycle, got {other:?}"),
        }
        assert!(!graph.is_validated());
    }

    #[test]
    fn test_cycle_reachable_from_acyclic_prefix() {
        let mut graph = linear(&["root", "x", "y", "z"]);
        graph.connect("z", "x").unwrap();

        let PipelineError::CycleDetected(report) = graph.validate_topology().unwrap_err() else {
            panic!("expected cycle");
        };

        assert_valid_cycle(&graph, &report.cycle);
        assert!(!report.cycle.contains(&"root".to_string()));
    }

    #[test]
    fn test_self_edge_is_a_cycle() {
        let mut graph = linear(&["solo"]);
        graph.connect("solo", "solo").unwrap();

        let PipelineError::CycleDetected(report) = graph.validate_topology().unwrap_err() else {
            panic!("expected cycle");
        };
        assert_eq!(report.cycle, vec!["solo".to_string(), "solo".to_string()]);
    }

    #[test]
    fn test_connect_unknown_node() {
        let mut graph = linear(&["a"]);
        let err = graph.connect("a", "ghost").unwrap_err();
        assert!(matches!(err, PipelineError::UnknownNode { ref node_id } if node_id == "ghost"));

        let err = graph.connect("ghost", "a").unwrap_err();
        assert!(matches!(err, PipelineError::UnknownNode { ref node_id } if node_id == "ghost"));
    }

    #[test]
    fn test_missing_dependency() {
        let mut graph = Graph::new("deps");
        graph
            .add_node("b", noop(), NodeOptions::new().depends_on("a"))
            .unwrap();

        let err = graph.validate_topology().unwrap_err();
        assert!(matches!(
            err,
            PipelineError::MissingDependency(ref e) if e.node == "b" && e.dependency == "a"
        ));
    }

    #[test]
    fn test_forward_reference_resolves_when_added() {
        let mut graph = Graph::new("deps");
        graph
            .add_node("b", noop(), NodeOptions::new().depends_on("a"))
            .unwrap();
        graph.add_node("a", noop(), NodeOptions::new()).unwrap();

        graph.validate_topology().unwrap();
        assert_eq!(graph.node("a").unwrap().outputs, vec!["b".to_string()]);
        assert_eq!(
            graph.topological_order().unwrap(),
            &["a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn test_missing_required_node() {
        let mut graph = linear(&["a"]);
        graph.require("generate");

        let err = graph.validate_topology().unwrap_err();
        assert!(matches!(
            err,
            PipelineError::MissingDependency(ref e) if e.dependency == "generate"
        ));
    }

    #[test]
    fn test_duplicate_node_rejected() {
        let mut graph = linear(&["a"]);
        let err = graph.add_node("a", noop(), NodeOptions::new()).unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }

    #[test]
    fn test_mutation_clears_validation() {
        let mut graph = linear(&["a", "b"]);
        graph.validate_topology().unwrap();
        assert!(graph.is_validated());

        graph.add_node("c", noop(), NodeOptions::new()).unwrap();
        assert!(!graph.is_validated());

        graph.validate_topology().unwrap();
        graph.connect("b", "c").unwrap();
        assert!(!graph.is_validated());
    }

    #[test]
    fn test_validation_does_not_mutate_edges() {
        let mut graph = linear(&["a", "b", "c"]);
        graph.connect("a", "c").unwrap();
        let before: Vec<_> = graph
            .node_ids()
            .iter()
            .map(|id| graph.node(id).unwrap().outputs.clone())
            .collect();

        graph.validate_topology().unwrap();

        let after: Vec<_> = graph
            .node_ids()
            .iter()
            .map(|id| graph.node(id).unwrap().outputs.clone())
            .collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_diamond_topological_order() {
        let mut graph = Graph::new("diamond");
        for id in ["load", "left", "right", "join"] {
            graph.add_node(id, noop(), NodeOptions::new()).unwrap();
        }
        graph.connect("load", "left").unwrap();
        graph.connect("load", "right").unwrap();
        graph.connect("left", "join").unwrap();
        graph.connect("right", "join").unwrap();
        graph.validate_topology().unwrap();

        let order = graph.topological_order().unwrap();
        let pos = |id: &str| order.iter().position(|n| n == id).unwrap();
        assert!(pos("load") < pos("left"));
        assert!(pos("load") < pos("right"));
        assert!(pos("left") < pos("join"));
        assert!(pos("right") < pos("join"));
    }
}
