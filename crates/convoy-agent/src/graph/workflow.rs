use std::collections::HashMap;

use convoy_core::config::validate_agent_set;
use convoy_core::error::{ConvoyError, Result};
use convoy_core::types::Topology;

use super::edge::{Edge, Target};
use crate::node::AgentNode;

/// Agent nodes wired under a topology.
///
/// The edge set is computed once at construction and never changes. Nodes are
/// addressed by agent name.
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    topology: Topology,
    nodes: Vec<AgentNode>,
    index: HashMap<String, usize>,
    edges: Vec<Edge>,
    entry: String,
}

impl WorkflowGraph {
    /// Wire `nodes` in configuration order.
    ///
    /// Fails with a config error for an empty agent list or duplicate names.
    pub fn build(topology: Topology, nodes: Vec<AgentNode>) -> Result<Self> {
        validate_agent_set(nodes.iter().map(|n| n.spec()))?;

        let names: Vec<String> = nodes.iter().map(|n| n.name().to_string()).collect();
        let index = names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        let edges = match topology {
            Topology::Sequential => sequential_edges(&names),
            Topology::Broadcast => broadcast_edges(&names),
        };
        let entry = names[0].clone();

        Ok(Self {
            topology,
            nodes,
            index,
            edges,
            entry,
        })
    }

    /// Same as [`build`](Self::build), with the topology given by name.
    pub fn from_name(topology: &str, nodes: Vec<AgentNode>) -> Result<Self> {
        Self::build(topology.parse()?, nodes)
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    /// Name of the entry node.
    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn nodes(&self) -> &[AgentNode] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn node(&self, name: &str) -> Option<&AgentNode> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }

    /// Like [`node`](Self::node), but an unknown name is a config error.
    pub fn require(&self, name: &str) -> Result<&AgentNode> {
        self.node(name)
            .ok_or_else(|| ConvoyError::Config(format!("node '{}' not found in graph", name)))
    }

    /// Outgoing edges of a node, in priority order.
    pub fn outgoing<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.from == name)
    }

    /// Next node after `current`, given the policy verdict.
    ///
    /// Takes the first outgoing edge whose condition matches. `None` means the
    /// topology ends the run here.
    pub fn successor(&self, current: &str, should_continue: bool) -> Option<&str> {
        self.edges
            .iter()
            .filter(|e| e.from == current)
            .find(|e| e.condition.matches(should_continue))
            .and_then(|e| e.target_node())
    }

    /// One line per edge, for display.
    pub fn describe(&self) -> Vec<String> {
        self.edges
            .iter()
            .map(|e| {
                let to = match &e.to {
                    Target::Node(name) => name.as_str(),
                    Target::End => "END",
                };
                format!("{} -> {} [{:?}]", e.from, to, e.condition)
            })
            .collect()
    }
}

/// `i -> i+1` unconditionally; the last node loops back to the first while the
/// run continues, and ends otherwise.
fn sequential_edges(names: &[String]) -> Vec<Edge> {
    let mut edges: Vec<Edge> = names
        .windows(2)
        .map(|pair| Edge::always(&pair[0], &pair[1]))
        .collect();
    if let (Some(first), Some(last)) = (names.first(), names.last()) {
        edges.push(Edge::on_continue(last, first));
        edges.push(Edge::on_halt(last));
    }
    edges
}

/// Every node to every other node. Each node's edges are listed starting from
/// its successor in configuration order, so the first edge gives round-robin
/// traversal.
fn broadcast_edges(names: &[String]) -> Vec<Edge> {
    let n = names.len();
    let mut edges = Vec::with_capacity(n * n.saturating_sub(1));
    for (i, from) in names.iter().enumerate() {
        for k in 1..n {
            edges.push(Edge::always(from, &names[(i + k) % n]));
        }
    }
    edges
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use convoy_core::config::AgentSpec;
    use convoy_core::types::AgentRole;
    use convoy_test_utils::EchoTurn;

    use crate::graph::edge::EdgeCondition;

    fn nodes(names: &[&str]) -> Vec<AgentNode> {
        names
            .iter()
            .map(|n| AgentNode::new(AgentSpec::new(*n, AgentRole::Executor), Arc::new(EchoTurn)))
            .collect()
    }

    #[test]
    fn test_sequential_wiring() {
        let graph = WorkflowGraph::build(Topology::Sequential, nodes(&["a", "b", "c"])).unwrap();
        assert_eq!(graph.entry(), "a");
        assert_eq!(graph.edges().len(), 4);
        assert_eq!(graph.successor("a", true), Some("b"));
        assert_eq!(graph.successor("b", true), Some("c"));
        assert_eq!(graph.successor("c", true), Some("a"));
        assert_eq!(graph.successor("c", false), None);
    }

    #[test]
    fn test_single_agent_self_loop() {
        let graph = WorkflowGraph::build(Topology::Sequential, nodes(&["solo"])).unwrap();
        assert_eq!(
            graph.edges(),
            &[Edge::on_continue("solo", "solo"), Edge::on_halt("solo")]
        );
        assert_eq!(graph.successor("solo", true), Some("solo"));
        assert_eq!(graph.successor("solo", false), None);
    }

    #[test]
    fn test_broadcast_full_mesh() {
        let graph = WorkflowGraph::build(Topology::Broadcast, nodes(&["x", "y", "z"])).unwrap();
        assert_eq!(graph.edges().len(), 6);
        assert!(graph.edges().iter().all(|e| e.condition == EdgeCondition::Always));
        assert!(graph.edges().iter().all(|e| e.target_node() != Some(e.from.as_str())));

        let from_y: Vec<_> = graph.outgoing("y").filter_map(|e| e.target_node()).collect();
        assert_eq!(from_y, vec!["z", "x"]);

        assert_eq!(graph.successor("x", true), Some("y"));
        assert_eq!(graph.successor("y", true), Some("z"));
        assert_eq!(graph.successor("z", true), Some("x"));
    }

    #[test]
    fn test_broadcast_single_agent_has_no_edges() {
        let graph = WorkflowGraph::build(Topology::Broadcast, nodes(&["only"])).unwrap();
        assert!(graph.edges().is_empty());
        assert_eq!(graph.successor("only", true), None);
    }

    #[test]
    fn test_construction_errors() {
        assert!(matches!(
            WorkflowGraph::build(Topology::Sequential, vec![]),
            Err(ConvoyError::Config(_))
        ));
        assert!(matches!(
            WorkflowGraph::build(Topology::Broadcast, nodes(&["a", "b", "a"])),
            Err(ConvoyError::Config(_))
        ));
        assert!(matches!(
            WorkflowGraph::from_name("star", nodes(&["a"])),
            Err(ConvoyError::Config(_))
        ));
    }

    #[test]
    fn test_lookup_and_describe() {
        let graph = WorkflowGraph::from_name("sequential", nodes(&["a", "b"])).unwrap();
        assert_eq!(graph.require("b").unwrap().name(), "b");
        assert!(graph.require("zz").is_err());
        assert_eq!(
            graph.describe(),
            vec![
                "a -> b [Always]".to_string(),
                "b -> a [OnContinue]".to_string(),
                "b -> END [OnHalt]".to_string(),
            ]
        );
    }
}
