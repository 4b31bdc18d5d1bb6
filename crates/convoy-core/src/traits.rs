use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::{ConvoyError, Result};
use crate::types::*;

/// Turn capability — produces an agent's messages for one step.
///
/// This is where an LLM client, a static-analysis routine, or any
/// deterministic function plugs into the engine.
pub trait TurnCapability: Send + Sync + 'static {
    /// Run one turn against the prompt context, with the agent's bound tools.
    fn take_turn<'a>(
        &'a self,
        ctx: PromptContext,
        tools: &'a [Arc<dyn Tool>],
    ) -> BoxFuture<'a, Result<TurnOutput>>;
}

/// Tool — named callable with text input and text output.
///
/// The engine passes tools through to turn capabilities and never interprets
/// their results.
pub trait Tool: Send + Sync + 'static {
    /// Tool name (the key agents bind by).
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// Invoke the tool.
    fn call(&self, input: String) -> BoxFuture<'_, Result<String>>;

    /// Timeout in seconds for this tool.
    fn timeout_secs(&self) -> u64 {
        30
    }
}

/// Continuation policy — decides after every step whether the run proceeds.
pub trait ContinuationPolicy: Send + Sync + 'static {
    /// Evaluate the state. Errors are treated as "stop" by the executor.
    fn evaluate(&self, state: &SharedState) -> Result<Continuation>;

    /// Boolean view of [`evaluate`](Self::evaluate); failures mean `false`.
    fn should_continue(&self, state: &SharedState) -> bool {
        matches!(self.evaluate(state), Ok(Continuation::Continue))
    }
}

/// Checkpoint store — persistence backend for run snapshots.
///
/// Snapshots accumulate per run; nothing is deleted unless the caller asks.
pub trait CheckpointStore: Send + Sync + 'static {
    /// Persist a snapshot.
    fn save(&self, checkpoint: &Checkpoint) -> Result<()>;

    /// Load the latest snapshot for a run, or [`ConvoyError::NotFound`].
    fn load(&self, run_id: &RunId) -> Result<Checkpoint>;

    /// All snapshots for a run, oldest first.
    fn history(&self, run_id: &RunId) -> Result<Vec<Checkpoint>>;

    /// Ids of every run with at least one snapshot.
    fn list_runs(&self) -> Result<Vec<RunId>>;

    /// Delete every snapshot of a run. Returns how many were removed.
    fn delete_run(&self, run_id: &RunId) -> Result<usize>;

    /// Load just the shared state of the latest snapshot.
    fn load_state(&self, run_id: &RunId) -> Result<SharedState> {
        self.load(run_id).map(|cp| cp.state)
    }

    /// Whether a run has any snapshot. Store failures propagate.
    fn exists(&self, run_id: &RunId) -> Result<bool> {
        match self.load(run_id) {
            Ok(_) => Ok(true),
            Err(ConvoyError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
