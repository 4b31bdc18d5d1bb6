use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConvoyError, Result};
use crate::types::{AgentRole, Topology};

pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
/// `max_turns` fallback for a workflow with one agent.
pub const SINGLE_AGENT_MAX_TURNS: usize = 10;
/// `max_turns` fallback for a workflow with several agents.
pub const MULTI_AGENT_MAX_TURNS: usize = 20;

/// Top-level workflow file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default)]
    pub workflow: RunConfig,
    #[serde(default)]
    pub agents: Vec<AgentSpec>,
}

/// Run-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub topology: Topology,
    /// SQLite path for checkpoints. Empty or `:memory:` keeps them in memory.
    #[serde(default)]
    pub checkpoint: String,
    /// Overrides the agent-count based default.
    #[serde(default)]
    pub max_turns: Option<usize>,
    /// A message containing any of these ends the run.
    #[serde(default)]
    pub completion_markers: Vec<String>,
    /// Abort the run when a checkpoint cannot be written.
    #[serde(default)]
    pub persistence_fatal: bool,
    /// Per-step deadline. Unset means no deadline.
    #[serde(default)]
    pub step_timeout_secs: Option<u64>,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Whether to write a checkpoint after every step (default: true).
    #[serde(default = "default_checkpoint_enabled")]
    pub checkpoint_enabled: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            topology: Topology::default(),
            checkpoint: String::new(),
            max_turns: None,
            completion_markers: vec![],
            persistence_fatal: false,
            step_timeout_secs: None,
            retry: RetryConfig::default(),
            checkpoint_enabled: default_checkpoint_enabled(),
        }
    }
}

fn default_checkpoint_enabled() -> bool {
    true
}

/// Bounded retry of a failed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_initial_backoff() -> u64 {
    200
}

fn default_max_backoff() -> u64 {
    5000
}

/// Declarative part of an agent: everything except the turn capability and
/// the bound tool objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSpec {
    pub name: String,
    #[serde(default)]
    pub role: AgentRole,
    #[serde(default)]
    pub instructions: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Names of tools to bind from the registry.
    #[serde(default)]
    pub tools: Vec<String>,
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_temperature() -> f32 {
    DEFAULT_TEMPERATURE
}

impl AgentSpec {
    pub fn new(name: impl Into<String>, role: AgentRole) -> Self {
        Self {
            name: name.into(),
            role,
            instructions: String::new(),
            model: default_model(),
            temperature: default_temperature(),
            tools: vec![],
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools = tools;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ConvoyError::Config("agent name must not be empty".into()));
        }
        if !(0.0..=1.0).contains(&self.temperature) {
            return Err(ConvoyError::Config(format!(
                "agent '{}': temperature {} outside [0, 1]",
                self.name, self.temperature
            )));
        }
        Ok(())
    }
}

/// Reject an empty agent set, duplicate names, or an invalid agent.
pub fn validate_agent_set<'a>(specs: impl IntoIterator<Item = &'a AgentSpec>) -> Result<()> {
    let mut seen = HashSet::new();
    for spec in specs {
        spec.validate()?;
        if !seen.insert(spec.name.as_str()) {
            return Err(ConvoyError::Config(format!(
                "duplicate agent name '{}'",
                spec.name
            )));
        }
    }
    if seen.is_empty() {
        return Err(ConvoyError::Config("workflow has no agents".into()));
    }
    Ok(())
}

/// Where checkpoints go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointTarget {
    Memory,
    Sqlite(PathBuf),
}

impl CheckpointTarget {
    pub fn parse(target: &str) -> Self {
        match target.trim() {
            "" | ":memory:" => Self::Memory,
            path => Self::Sqlite(expand_home(path)),
        }
    }
}

impl WorkflowConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| ConvoyError::ConfigNotFound(path.display().to_string()))?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: Self =
            toml::from_str(&expanded).map_err(|e| ConvoyError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        validate_agent_set(&self.agents)?;
        if self.workflow.max_turns == Some(0) {
            return Err(ConvoyError::Config("max_turns must be at least 1".into()));
        }
        if self.workflow.step_timeout_secs == Some(0) {
            return Err(ConvoyError::Config(
                "step_timeout_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// `max_turns` to use when the run metadata does not set one.
    pub fn default_max_turns(&self) -> usize {
        self.workflow
            .max_turns
            .unwrap_or_else(|| default_max_turns_for(self.agents.len()))
    }

    pub fn checkpoint_target(&self) -> CheckpointTarget {
        CheckpointTarget::parse(&self.workflow.checkpoint)
    }

    pub fn step_timeout(&self) -> Option<Duration> {
        self.workflow.step_timeout_secs.map(Duration::from_secs)
    }
}

/// Fallback `max_turns`: 10 for a lone agent, 20 otherwise.
pub fn default_max_turns_for(agent_count: usize) -> usize {
    if agent_count <= 1 {
        SINGLE_AGENT_MAX_TURNS
    } else {
        MULTI_AGENT_MAX_TURNS
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}
