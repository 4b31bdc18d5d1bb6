use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tracing::info;

use convoy_core::config::{AgentSpec, WorkflowConfig};
use convoy_core::error::{ConvoyError, Result};
use convoy_core::event::EventBus;
use convoy_core::traits::{CheckpointStore, ContinuationPolicy, Tool, TurnCapability};
use convoy_core::types::{AgentRole, Topology};

use crate::checkpoint::{open_store, SqliteCheckpointStore};
use crate::executor::{Executor, ExecutorOptions};
use crate::graph::WorkflowGraph;
use crate::node::AgentNode;
use crate::policy::DefaultPolicy;
use crate::tools::ToolRegistry;

/// Name given to the agent of a single-agent workflow.
pub const SINGLE_AGENT_NAME: &str = "main_agent";

/// Assembles an [`Executor`] from a [`WorkflowConfig`].
///
/// Configuration names the agents and their tool bindings; the builder is
/// where turn capabilities and tool objects get attached to those names.
pub struct WorkflowBuilder {
    config: WorkflowConfig,
    tools: ToolRegistry,
    turns: HashMap<String, Arc<dyn TurnCapability>>,
    default_turn: Option<Arc<dyn TurnCapability>>,
    policy: Option<Arc<dyn ContinuationPolicy>>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    events: Option<Arc<EventBus>>,
}

impl WorkflowBuilder {
    pub fn new(config: WorkflowConfig) -> Self {
        Self {
            config,
            tools: ToolRegistry::new(),
            turns: HashMap::new(),
            default_turn: None,
            policy: None,
            checkpoints: None,
            events: None,
        }
    }

    /// Registry the agents' `tools` bindings are resolved against.
    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    /// Turn capability for one named agent.
    pub fn with_turn(mut self, agent: impl Into<String>, turn: Arc<dyn TurnCapability>) -> Self {
        self.turns.insert(agent.into(), turn);
        self
    }

    /// Turn capability for every agent without its own.
    pub fn with_default_turn(mut self, turn: Arc<dyn TurnCapability>) -> Self {
        self.default_turn = Some(turn);
        self
    }

    /// Replace the policy built from `max_turns` and `completion_markers`.
    pub fn with_policy(mut self, policy: Arc<dyn ContinuationPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Use this store instead of opening the configured checkpoint target.
    pub fn with_checkpoints(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    /// Wire the graph without building an executor.
    pub fn build_graph(&self) -> Result<WorkflowGraph> {
        self.config.validate()?;
        let nodes = self
            .config
            .agents
            .iter()
            .map(|spec| self.node_for(spec))
            .collect::<Result<Vec<_>>>()?;
        WorkflowGraph::build(self.config.workflow.topology, nodes)
    }

    fn node_for(&self, spec: &AgentSpec) -> Result<AgentNode> {
        let turn = self
            .turns
            .get(&spec.name)
            .or(self.default_turn.as_ref())
            .cloned()
            .ok_or_else(|| {
                ConvoyError::Config(format!(
                    "no turn capability attached to agent '{}'",
                    spec.name
                ))
            })?;
        let tools = self.tools.resolve(&spec.name, &spec.tools)?;
        Ok(AgentNode::new(spec.clone(), turn).with_tools(tools))
    }

    pub fn build(self) -> Result<Executor> {
        let graph = self.build_graph()?;
        let options = ExecutorOptions::from_config(&self.config);
        let policy = match self.policy {
            Some(policy) => policy,
            None => Arc::new(
                DefaultPolicy::new(options.default_max_turns)
                    .with_markers(self.config.workflow.completion_markers.clone()),
            ),
        };

        let mut executor = Executor::new(graph)
            .with_options(options)
            .with_policy(policy);

        if self.config.workflow.checkpoint_enabled {
            let store = match self.checkpoints {
                Some(store) => store,
                None => open_store(&self.config.checkpoint_target())?,
            };
            executor = executor.with_checkpoints(store);
        }
        if let Some(events) = self.events {
            executor = executor.with_events(events);
        }

        info!(
            topology = %executor.graph().topology(),
            agents = executor.graph().nodes().len(),
            entry = %executor.graph().entry(),
            "Workflow built"
        );
        Ok(executor)
    }
}

/// One agent looping on itself while the policy allows.
///
/// `model` falls back to the default model. No checkpointing.
pub fn create_single_agent(
    instructions: &str,
    tools: Vec<Arc<dyn Tool>>,
    model: Option<&str>,
    turn: Arc<dyn TurnCapability>,
) -> Result<Executor> {
    let mut spec = AgentSpec::new(SINGLE_AGENT_NAME, AgentRole::Executor)
        .with_instructions(instructions)
        .with_tools(tools.iter().map(|t| t.name().to_string()).collect());
    if let Some(model) = model {
        spec = spec.with_model(model);
    }
    let node = AgentNode::new(spec, turn).with_tools(tools);
    let graph = WorkflowGraph::build(Topology::Sequential, vec![node])?;
    Ok(Executor::new(graph))
}

/// Several agents under a named topology, checkpointed to SQLite.
///
/// Without `checkpoint_path` the database lives in memory for the life of the
/// executor.
pub fn create_multi_agent_workflow(
    agents: Vec<AgentNode>,
    topology: &str,
    checkpoint_path: Option<&Path>,
) -> Result<Executor> {
    let graph = WorkflowGraph::from_name(topology, agents)?;
    let store = match checkpoint_path {
        Some(path) => SqliteCheckpointStore::open(path)?,
        None => SqliteCheckpointStore::open_in_memory()?,
    };
    Ok(Executor::new(graph).with_checkpoints(Arc::new(store)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_core::types::{HaltReason, Metadata, Role};
    use convoy_test_utils::{max_turns, EchoTurn, ScriptedTurn, StaticTool, ToolCallingTurn};

    const CONFIG: &str = r#"
[workflow]
topology = "sequential"
max_turns = 5
completion_markers = ["LGTM"]

[[agents]]
name = "writer"
instructions = "Write the code."

[[agents]]
name = "reviewer"
role = "critic"
instructions = "Review the code."
tools = ["lint"]
"#;

    fn registry() -> ToolRegistry {
        let mut tools = ToolRegistry::new();
        tools.register(StaticTool::new("lint", "0 warnings"));
        tools
    }

    #[tokio::test]
    async fn test_build_from_config() {
        let config = WorkflowConfig::from_toml_str(CONFIG).unwrap();
        let executor = WorkflowBuilder::new(config)
            .with_tools(registry())
            .with_default_turn(Arc::new(EchoTurn))
            .with_turn("reviewer", Arc::new(ToolCallingTurn))
            .build()
            .unwrap();

        assert_eq!(executor.graph().entry(), "writer");
        assert_eq!(executor.graph().node("reviewer").unwrap().tool_names(), vec!["lint"]);
        assert_eq!(executor.options().default_max_turns, 5);
        assert!(executor.checkpoints().is_some());

        let outcome = executor.run("add a cache", Metadata::new()).await.unwrap();
        assert_eq!(outcome.reason, HaltReason::MaxTurnsReached);
        assert_eq!(outcome.state.len(), 5);
        assert_eq!(outcome.state.history[2].role, Role::Tool);
        assert_eq!(outcome.state.history[2].content, "lint: 0 warnings");
    }

    #[tokio::test]
    async fn test_completion_markers_from_config() {
        let config = WorkflowConfig::from_toml_str(CONFIG).unwrap();
        let executor = WorkflowBuilder::new(config)
            .with_tools(registry())
            .with_turn("writer", Arc::new(ScriptedTurn::new(&["v1"])))
            .with_turn("reviewer", Arc::new(ScriptedTurn::new(&["LGTM"])))
            .build()
            .unwrap();
        let outcome = executor.run("go", Metadata::new()).await.unwrap();
        assert_eq!(outcome.contents(), vec!["go", "v1", "LGTM"]);
        assert_eq!(outcome.reason, HaltReason::ContinuationFalse);
    }

    #[test]
    fn test_unbound_tool_and_missing_turn() {
        let config = WorkflowConfig::from_toml_str(CONFIG).unwrap();
        let err = WorkflowBuilder::new(config.clone())
            .with_default_turn(Arc::new(EchoTurn))
            .build()
            .err()
            .unwrap();
        assert!(err.to_string().contains("unknown tool 'lint'"));

        let err = WorkflowBuilder::new(config)
            .with_tools(registry())
            .with_turn("writer", Arc::new(EchoTurn))
            .build()
            .err()
            .unwrap();
        assert!(err.to_string().contains("reviewer"));
    }

    #[test]
    fn test_checkpointing_disabled() {
        let mut config = WorkflowConfig::from_toml_str(CONFIG).unwrap();
        config.workflow.checkpoint_enabled = false;
        let executor = WorkflowBuilder::new(config)
            .with_tools(registry())
            .with_default_turn(Arc::new(EchoTurn))
            .build()
            .unwrap();
        assert!(executor.checkpoints().is_none());
    }

    #[tokio::test]
    async fn test_create_single_agent() {
        let tool: Arc<dyn Tool> = Arc::new(StaticTool::new("search", "found"));
        let executor =
            create_single_agent("You answer questions.", vec![tool], None, Arc::new(EchoTurn))
                .unwrap();
        let node = executor.graph().node(SINGLE_AGENT_NAME).unwrap();
        assert_eq!(node.spec().model, "gpt-3.5-turbo");
        assert_eq!(node.tool_names(), vec!["search"]);

        let outcome = executor.run("hello", Metadata::new()).await.unwrap();
        assert_eq!(outcome.state.len(), 10);
        assert_eq!(outcome.reason, HaltReason::MaxTurnsReached);

        let custom = create_single_agent("x", vec![], Some("gpt-4"), Arc::new(EchoTurn)).unwrap();
        assert_eq!(custom.graph().nodes()[0].spec().model, "gpt-4");
    }

    #[tokio::test]
    async fn test_create_multi_agent_workflow() {
        let nodes = vec![
            AgentNode::new(AgentSpec::new("x", AgentRole::Researcher), Arc::new(EchoTurn)),
            AgentNode::new(AgentSpec::new("y", AgentRole::Critic), Arc::new(EchoTurn)),
        ];
        let executor = create_multi_agent_workflow(nodes.clone(), "broadcast", None).unwrap();
        let outcome = executor.run("start", max_turns(2)).await.unwrap();
        assert_eq!(outcome.contents(), vec!["start", "x"]);
        assert!(executor
            .checkpoints()
            .unwrap()
            .exists(&outcome.run_id)
            .unwrap());

        assert!(matches!(
            create_multi_agent_workflow(nodes, "hierarchical", None),
            Err(ConvoyError::Config(_))
        ));
        assert!(create_multi_agent_workflow(vec![], "sequential", None).is_err());
    }
}
