use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::debug;

use convoy_core::config::AgentSpec;
use convoy_core::error::{ConvoyError, Result};
use convoy_core::reducer::merge;
use convoy_core::traits::{Tool, TurnCapability};
use convoy_core::types::{AgentRole, Message, PromptContext, SharedState, TurnOutput};

use crate::tools::TimedTool;

/// Extension function attached to an agent. Opaque to the engine.
pub type ExtensionFn =
    Arc<dyn Fn(serde_json::Value) -> Result<serde_json::Value> + Send + Sync>;

/// Message metadata key naming the agent that produced a message.
pub const AGENT_META_KEY: &str = "agent";

/// One participant in a workflow.
///
/// Pairs an immutable [`AgentSpec`] with the turn capability that speaks for
/// it and the tools bound to it. Bound tools reach the turn wrapped in a
/// [`TimedTool`], so every call is bounded by the tool's timeout.
#[derive(Clone)]
pub struct AgentNode {
    spec: AgentSpec,
    turn: Arc<dyn TurnCapability>,
    tools: Vec<Arc<dyn Tool>>,
    extensions: HashMap<String, ExtensionFn>,
}

impl std::fmt::Debug for AgentNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentNode")
            .field("spec", &self.spec)
            .field("tools", &self.tool_names())
            .field("extensions", &self.extensions.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl AgentNode {
    pub fn new(spec: AgentSpec, turn: Arc<dyn TurnCapability>) -> Self {
        Self {
            spec,
            turn,
            tools: vec![],
            extensions: HashMap::new(),
        }
    }

    /// Bind a tool.
    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(TimedTool::wrap(tool));
        self
    }

    /// Bind several tools.
    pub fn with_tools(mut self, tools: Vec<Arc<dyn Tool>>) -> Self {
        self.tools.extend(tools.into_iter().map(TimedTool::wrap));
        self
    }

    /// Attach a named extension function.
    pub fn with_extension(mut self, name: impl Into<String>, f: ExtensionFn) -> Self {
        self.extensions.insert(name.into(), f);
        self
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn role(&self) -> AgentRole {
        self.spec.role
    }

    pub fn spec(&self) -> &AgentSpec {
        &self.spec
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    pub fn extension(&self, name: &str) -> Option<&ExtensionFn> {
        self.extensions.get(name)
    }

    /// Invoke an extension function by name.
    pub fn call_extension(
        &self,
        name: &str,
        input: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let f = self.extensions.get(name).ok_or_else(|| {
            ConvoyError::Config(format!(
                "agent '{}' has no extension '{}'",
                self.spec.name, name
            ))
        })?;
        f(input)
    }

    /// Build the ephemeral context for a turn: instructions first, then history.
    pub fn prompt_context(&self, state: &SharedState) -> PromptContext {
        let mut messages = Vec::with_capacity(state.history.len() + 1);
        messages.push(Message::system(self.spec.instructions.clone()));
        messages.extend(state.history.iter().cloned());

        PromptContext {
            agent: self.spec.name.clone(),
            role: self.spec.role,
            model: self.spec.model.clone(),
            temperature: self.spec.temperature,
            messages,
            metadata: state.metadata.clone(),
        }
    }

    /// Run one turn and fold its output into a new state.
    ///
    /// The input state is never modified. Turn failures come back as
    /// [`ConvoyError::AgentExecution`] naming this agent, even when the turn
    /// passed along an error that named a tool or another agent.
    pub async fn process(&self, state: &SharedState) -> Result<SharedState> {
        let ctx = self.prompt_context(state);
        let output = self
            .turn
            .take_turn(ctx, &self.tools)
            .await
            .map_err(|e| e.for_agent(&self.spec.name))?;

        let produced = output.messages.len();
        let candidates: Vec<Message> = output
            .messages
            .into_iter()
            .map(|mut m| {
                m.metadata
                    .entry(AGENT_META_KEY.to_string())
                    .or_insert_with(|| serde_json::Value::String(self.spec.name.clone()));
                m
            })
            .collect();

        let history = merge(&state.history, candidates)?;
        let mut next = state.with_history(history);
        next.apply_patch(&output.metadata_patch);

        debug!(
            agent = %self.spec.name,
            produced,
            history_len = next.len(),
            "Agent turn merged"
        );
        Ok(next)
    }
}

/// Turn capability backed by an async closure.
pub struct FnTurn<F> {
    f: F,
}

impl<F, Fut> TurnCapability for FnTurn<F>
where
    F: Fn(PromptContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<TurnOutput>> + Send + 'static,
{
    fn take_turn<'a>(
        &'a self,
        ctx: PromptContext,
        _tools: &'a [Arc<dyn Tool>],
    ) -> BoxFuture<'a, Result<TurnOutput>> {
        Box::pin((self.f)(ctx))
    }
}

/// Wrap an async closure as a turn capability.
pub fn turn_fn<F, Fut>(f: F) -> Arc<dyn TurnCapability>
where
    F: Fn(PromptContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<TurnOutput>> + Send + 'static,
{
    Arc::new(FnTurn { f })
}
