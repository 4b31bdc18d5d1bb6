//! Workflow graph — agent nodes wired by a communication topology.
//!
//! A workflow is a directed graph of [`AgentNode`](crate::AgentNode)s joined by
//! `Edge`s. Edges carry a condition keyed on the continuation verdict
//! (Always, OnContinue, OnHalt). The topology decides the edge set:
//! sequential hand-off with a loop back from the last node, or a broadcast
//! full mesh visited round-robin.

pub mod edge;
pub mod workflow;

pub use edge::{Edge, EdgeCondition, Target};
pub use workflow::WorkflowGraph;
