use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConvoyError {
    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Agent errors
    #[error("Agent execution failed: {agent}: {cause}")]
    AgentExecution { agent: String, cause: String },

    #[error("Agent step timeout after {timeout_ms}ms: {agent}")]
    AgentTimeout { agent: String, timeout_ms: u64 },

    #[error("Tool timeout after {timeout_secs}s: {tool}")]
    ToolTimeout { tool: String, timeout_secs: u64 },

    // State errors
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Run cancelled")]
    Cancelled,

    // Storage errors
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("No checkpoint found for run: {0}")]
    NotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ConvoyError {
    /// Build an agent execution error from any displayable cause.
    pub fn agent(agent: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        Self::AgentExecution {
            agent: agent.into(),
            cause: cause.to_string(),
        }
    }

    /// Attribute this error to `agent`.
    ///
    /// A timeout keeps its variant. Anything else becomes an execution failure
    /// whose cause keeps the original text, including a failure another agent
    /// or a tool was named in.
    pub fn for_agent(self, agent: &str) -> Self {
        match self {
            Self::AgentTimeout { timeout_ms, .. } => Self::AgentTimeout {
                agent: agent.to_string(),
                timeout_ms,
            },
            Self::AgentExecution { agent: inner, cause } if inner == agent => {
                Self::AgentExecution { agent: inner, cause }
            }
            Self::AgentExecution { agent: inner, cause } => {
                Self::agent(agent, format!("{}: {}", inner, cause))
            }
            other => Self::agent(agent, other),
        }
    }

    /// Whether this error came out of an agent's turn (failure or timeout).
    pub fn is_agent_error(&self) -> bool {
        matches!(self, Self::AgentExecution { .. } | Self::AgentTimeout { .. })
    }

    /// Name of the agent that produced this error, if any.
    pub fn agent_name(&self) -> Option<&str> {
        match self {
            Self::AgentExecution { agent, .. } | Self::AgentTimeout { agent, .. } => Some(agent),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ConvoyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_error_helpers() {
        let err = ConvoyError::agent("critic", "connection reset");
        assert!(err.is_agent_error());
        assert_eq!(err.agent_name(), Some("critic"));
        assert_eq!(
            err.to_string(),
            "Agent execution failed: critic: connection reset"
        );

        let timeout = ConvoyError::AgentTimeout {
            agent: "writer".into(),
            timeout_ms: 250,
        };
        assert_eq!(timeout.to_string(), "Agent step timeout after 250ms: writer");
        assert!(timeout.is_agent_error());
        assert_eq!(timeout.agent_name(), Some("writer"));

        assert!(!ConvoyError::Cancelled.is_agent_error());
        assert_eq!(ConvoyError::Persistence("disk full".into()).agent_name(), None);

        let tool = ConvoyError::ToolTimeout {
            tool: "search".into(),
            timeout_secs: 30,
        };
        assert!(!tool.is_agent_error());
        assert_eq!(tool.agent_name(), None);
    }

    #[test]
    fn test_for_agent_names_the_failing_node() {
        let nested = ConvoyError::agent("search", "quota exceeded").for_agent("researcher");
        assert_eq!(nested.agent_name(), Some("researcher"));
        assert_eq!(
            nested.to_string(),
            "Agent execution failed: researcher: search: quota exceeded"
        );

        let own = ConvoyError::agent("researcher", "bad reply").for_agent("researcher");
        assert_eq!(own.to_string(), "Agent execution failed: researcher: bad reply");

        let timeout = ConvoyError::AgentTimeout {
            agent: "inner".into(),
            timeout_ms: 1500,
        }
        .for_agent("writer");
        assert!(matches!(
            timeout,
            ConvoyError::AgentTimeout { ref agent, timeout_ms: 1500 } if agent == "writer"
        ));

        let tool = ConvoyError::ToolTimeout {
            tool: "scrape".into(),
            timeout_secs: 30,
        }
        .for_agent("critic");
        assert_eq!(tool.agent_name(), Some("critic"));
        assert!(tool.to_string().contains("Tool timeout after 30s: scrape"));
    }
}
