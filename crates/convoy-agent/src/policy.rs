use std::panic::{catch_unwind, AssertUnwindSafe};

use convoy_core::config::default_max_turns_for;
use convoy_core::error::{ConvoyError, Result};
use convoy_core::traits::ContinuationPolicy;
use convoy_core::types::{Continuation, HaltReason, Role, SharedState};

/// Stops once the history holds `max_turns` messages, or once an agent says
/// a completion marker.
///
/// `max_turns` is read from the state metadata on every evaluation and counts
/// every message, the seed included.
#[derive(Debug, Clone)]
pub struct DefaultPolicy {
    default_max_turns: usize,
    completion_markers: Vec<String>,
}

impl DefaultPolicy {
    pub fn new(default_max_turns: usize) -> Self {
        Self {
            default_max_turns,
            completion_markers: vec![],
        }
    }

    /// Default sized for a workflow with `agent_count` agents.
    pub fn for_agents(agent_count: usize) -> Self {
        Self::new(default_max_turns_for(agent_count))
    }

    pub fn with_markers(mut self, markers: Vec<String>) -> Self {
        self.completion_markers = markers.into_iter().filter(|m| !m.is_empty()).collect();
        self
    }

    pub fn default_max_turns(&self) -> usize {
        self.default_max_turns
    }

    fn marker_seen(&self, state: &SharedState) -> Option<&str> {
        // Only agent and tool output counts; the seed prompt may quote a marker.
        state
            .history
            .iter()
            .filter(|m| matches!(m.role, Role::Agent | Role::Tool))
            .find_map(|m| {
                self.completion_markers
                    .iter()
                    .find(|marker| m.content.contains(marker.as_str()))
                    .map(|s| s.as_str())
            })
    }
}

impl ContinuationPolicy for DefaultPolicy {
    fn evaluate(&self, state: &SharedState) -> Result<Continuation> {
        let max_turns = state.max_turns(self.default_max_turns)?;
        if state.len() >= max_turns {
            return Ok(Continuation::Halt(HaltReason::MaxTurnsReached));
        }
        if self.marker_seen(state).is_some() {
            return Ok(Continuation::Halt(HaltReason::ContinuationFalse));
        }
        Ok(Continuation::Continue)
    }
}

/// Policy from a plain predicate. `false` halts with `continuation_false`.
pub struct FnPolicy<F> {
    f: F,
}

impl<F> FnPolicy<F>
where
    F: Fn(&SharedState) -> bool + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> ContinuationPolicy for FnPolicy<F>
where
    F: Fn(&SharedState) -> bool + Send + Sync + 'static,
{
    fn evaluate(&self, state: &SharedState) -> Result<Continuation> {
        if (self.f)(state) {
            Ok(Continuation::Continue)
        } else {
            Ok(Continuation::Halt(HaltReason::ContinuationFalse))
        }
    }
}

/// Evaluate a policy, turning a panic into [`ConvoyError::InvariantViolation`].
pub fn evaluate_guarded(
    policy: &dyn ContinuationPolicy,
    state: &SharedState,
) -> Result<Continuation> {
    match catch_unwind(AssertUnwindSafe(|| policy.evaluate(state))) {
        Ok(result) => result,
        Err(panic) => {
            let detail = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(ConvoyError::InvariantViolation(format!(
                "continuation policy panicked: {}",
                detail
            )))
        }
    }
}
