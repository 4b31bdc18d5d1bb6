use serde::{Deserialize, Serialize};

/// Where an edge leads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "node", rename_all = "snake_case")]
pub enum Target {
    Node(String),
    /// Terminal state; the run halts.
    End,
}

/// An edge connecting two nodes in the workflow graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    /// Source node name.
    pub from: String,
    pub to: Target,
    /// Condition that must hold to traverse this edge.
    #[serde(default)]
    pub condition: EdgeCondition,
}

/// Condition for traversing an edge, keyed on the continuation verdict.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeCondition {
    /// Always traverse this edge.
    #[default]
    Always,
    /// Traverse only when the policy says continue.
    OnContinue,
    /// Traverse only when the policy says halt.
    OnHalt,
}

impl EdgeCondition {
    /// Explicit two-way branch on the policy verdict.
    pub fn matches(&self, should_continue: bool) -> bool {
        match (self, should_continue) {
            (Self::Always, _) => true,
            (Self::OnContinue, true) => true,
            (Self::OnHalt, false) => true,
            (Self::OnContinue, false) | (Self::OnHalt, true) => false,
        }
    }
}

impl Edge {
    /// Create an unconditional edge.
    pub fn always(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: Target::Node(to.into()),
            condition: EdgeCondition::Always,
        }
    }

    /// Create an edge taken while the run continues.
    pub fn on_continue(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: Target::Node(to.into()),
            condition: EdgeCondition::OnContinue,
        }
    }

    /// Create an edge into the terminal state, taken when the run halts.
    pub fn on_halt(from: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: Target::End,
            condition: EdgeCondition::OnHalt,
        }
    }

    /// Target node name, if this edge does not lead to the end.
    pub fn target_node(&self) -> Option<&str> {
        match &self.to {
            Target::Node(name) => Some(name),
            Target::End => None,
        }
    }
}
