//! Mock turn capabilities, tools, and policies for exercising the engine
//! without a model behind it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;

use convoy_core::error::{ConvoyError, Result};
use convoy_core::traits::{ContinuationPolicy, Tool, TurnCapability};
use convoy_core::types::{Continuation, Message, Metadata, PromptContext, SharedState, TurnOutput};

/// Replies with one agent message whose content is the agent's name.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoTurn;

impl TurnCapability for EchoTurn {
    fn take_turn<'a>(
        &'a self,
        ctx: PromptContext,
        _tools: &'a [Arc<dyn Tool>],
    ) -> BoxFuture<'a, Result<TurnOutput>> {
        Box::pin(async move { Ok(TurnOutput::message(Message::agent(ctx.agent))) })
    }
}

/// Replies with a fixed list of messages every turn, without ids.
#[derive(Debug, Clone)]
pub struct BatchTurn {
    contents: Vec<String>,
}

impl BatchTurn {
    pub fn new(contents: &[&str]) -> Self {
        Self {
            contents: contents.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl TurnCapability for BatchTurn {
    fn take_turn<'a>(
        &'a self,
        _ctx: PromptContext,
        _tools: &'a [Arc<dyn Tool>],
    ) -> BoxFuture<'a, Result<TurnOutput>> {
        let messages = self
            .contents
            .iter()
            .map(|c| Message::unidentified(convoy_core::types::Role::Agent, c.clone()))
            .collect();
        Box::pin(async move { Ok(TurnOutput::messages(messages)) })
    }
}

/// Plays back scripted replies in order, then echoes.
#[derive(Debug, Default)]
pub struct ScriptedTurn {
    replies: Mutex<Vec<String>>,
}

impl ScriptedTurn {
    pub fn new(replies: &[&str]) -> Self {
        let mut replies: Vec<String> = replies.iter().map(|s| s.to_string()).collect();
        replies.reverse();
        Self {
            replies: Mutex::new(replies),
        }
    }
}

impl TurnCapability for ScriptedTurn {
    fn take_turn<'a>(
        &'a self,
        ctx: PromptContext,
        _tools: &'a [Arc<dyn Tool>],
    ) -> BoxFuture<'a, Result<TurnOutput>> {
        let next = self.replies.lock().ok().and_then(|mut r| r.pop());
        Box::pin(async move {
            Ok(TurnOutput::message(Message::agent(
                next.unwrap_or(ctx.agent),
            )))
        })
    }
}

/// Fails a number of times, then echoes. `always` never recovers.
#[derive(Debug)]
pub struct FailingTurn {
    failures_left: AtomicUsize,
    message: String,
    calls: AtomicUsize,
}

impl FailingTurn {
    pub fn always(message: &str) -> Self {
        Self::times(usize::MAX, message)
    }

    pub fn times(n: usize, message: &str) -> Self {
        Self {
            failures_left: AtomicUsize::new(n),
            message: message.to_string(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TurnCapability for FailingTurn {
    fn take_turn<'a>(
        &'a self,
        ctx: PromptContext,
        _tools: &'a [Arc<dyn Tool>],
    ) -> BoxFuture<'a, Result<TurnOutput>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let message = self.message.clone();
        Box::pin(async move {
            if failing {
                Err(ConvoyError::agent(ctx.agent, message))
            } else {
                Ok(TurnOutput::message(Message::agent(ctx.agent)))
            }
        })
    }
}

/// Sleeps before echoing. Pairs with a paused tokio clock in tests.
#[derive(Debug, Clone, Copy)]
pub struct SlowTurn {
    pub delay: Duration,
}

impl TurnCapability for SlowTurn {
    fn take_turn<'a>(
        &'a self,
        ctx: PromptContext,
        _tools: &'a [Arc<dyn Tool>],
    ) -> BoxFuture<'a, Result<TurnOutput>> {
        let delay = self.delay;
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            Ok(TurnOutput::message(Message::agent(ctx.agent)))
        })
    }
}

/// Calls every bound tool with the last message and replies with the results.
#[derive(Debug, Default, Clone, Copy)]
pub struct ToolCallingTurn;

impl TurnCapability for ToolCallingTurn {
    fn take_turn<'a>(
        &'a self,
        ctx: PromptContext,
        tools: &'a [Arc<dyn Tool>],
    ) -> BoxFuture<'a, Result<TurnOutput>> {
        Box::pin(async move {
            let input = ctx
                .history()
                .last()
                .map(|m| m.content.clone())
                .unwrap_or_default();
            let mut messages = Vec::with_capacity(tools.len());
            for tool in tools {
                let out = tool.call(input.clone()).await?;
                messages.push(Message::tool(format!("{}: {}", tool.name(), out)));
            }
            Ok(TurnOutput::messages(messages))
        })
    }
}

/// Records which agents took turns, in order, and echoes.
#[derive(Debug, Default, Clone)]
pub struct RecordingTurn {
    seen: Arc<Mutex<Vec<(String, usize)>>>,
}

impl RecordingTurn {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(agent, history length it observed)` per turn.
    pub fn seen(&self) -> Vec<(String, usize)> {
        self.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl TurnCapability for RecordingTurn {
    fn take_turn<'a>(
        &'a self,
        ctx: PromptContext,
        _tools: &'a [Arc<dyn Tool>],
    ) -> BoxFuture<'a, Result<TurnOutput>> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push((ctx.agent.clone(), ctx.history().len()));
        }
        Box::pin(async move { Ok(TurnOutput::message(Message::agent(ctx.agent))) })
    }
}

/// Tool returning a fixed answer.
#[derive(Debug, Clone)]
pub struct StaticTool {
    name: String,
    answer: String,
}

impl StaticTool {
    pub fn new(name: &str, answer: &str) -> Self {
        Self {
            name: name.to_string(),
            answer: answer.to_string(),
        }
    }
}

impl Tool for StaticTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Returns a canned answer"
    }

    fn call(&self, _input: String) -> BoxFuture<'_, Result<String>> {
        let answer = self.answer.clone();
        Box::pin(async move { Ok(answer) })
    }
}

/// Tool that sleeps before answering `"<name> done"`.
#[derive(Debug, Clone)]
pub struct SlowTool {
    name: String,
    delay: Duration,
    timeout_secs: u64,
}

impl SlowTool {
    pub fn new(name: &str, delay: Duration, timeout_secs: u64) -> Self {
        Self {
            name: name.to_string(),
            delay,
            timeout_secs,
        }
    }
}

impl Tool for SlowTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Answers after a delay"
    }

    fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }

    fn call(&self, _input: String) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            Ok(format!("{} done", self.name))
        })
    }
}

/// Policy that always fails to evaluate.
#[derive(Debug, Default, Clone, Copy)]
pub struct BrokenPolicy;

impl ContinuationPolicy for BrokenPolicy {
    fn evaluate(&self, _state: &SharedState) -> Result<Continuation> {
        Err(ConvoyError::InvariantViolation("policy exploded".into()))
    }
}

/// Policy that panics when evaluated.
#[derive(Debug, Default, Clone, Copy)]
pub struct PanickingPolicy;

impl ContinuationPolicy for PanickingPolicy {
    fn evaluate(&self, _state: &SharedState) -> Result<Continuation> {
        panic!("policy panicked")
    }
}

/// Run metadata with `max_turns` set.
pub fn max_turns(n: u64) -> Metadata {
    let mut meta = Metadata::new();
    meta.insert(
        convoy_core::types::MAX_TURNS_KEY.to_string(),
        serde_json::json!(n),
    );
    meta
}
