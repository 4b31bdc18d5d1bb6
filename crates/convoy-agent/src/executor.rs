use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use convoy_core::config::{default_max_turns_for, RetryConfig, WorkflowConfig};
use convoy_core::error::{ConvoyError, Result};
use convoy_core::event::EventBus;
use convoy_core::reducer::validate_history;
use convoy_core::traits::{CheckpointStore, ContinuationPolicy};
use convoy_core::types::{
    Checkpoint, Continuation, HaltReason, Metadata, RunEvent, RunId, SharedState,
};

use crate::graph::WorkflowGraph;
use crate::node::AgentNode;
use crate::policy::{evaluate_guarded, DefaultPolicy};

/// Knobs for the run loop.
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// `max_turns` used when the run metadata does not carry one.
    pub default_max_turns: usize,
    /// Retries of a failed turn before the run halts with an error.
    pub retry: RetryConfig,
    /// Deadline for a single step.
    pub step_timeout: Option<Duration>,
    /// Halt the run when a checkpoint cannot be written.
    pub persistence_fatal: bool,
    /// Write a checkpoint after every step (when a store is attached).
    pub checkpoint_enabled: bool,
}

impl ExecutorOptions {
    pub fn for_agents(agent_count: usize) -> Self {
        Self {
            default_max_turns: default_max_turns_for(agent_count),
            retry: RetryConfig::default(),
            step_timeout: None,
            persistence_fatal: false,
            checkpoint_enabled: true,
        }
    }

    pub fn from_config(config: &WorkflowConfig) -> Self {
        Self {
            default_max_turns: config.default_max_turns(),
            retry: config.workflow.retry.clone(),
            step_timeout: config.step_timeout(),
            persistence_fatal: config.workflow.persistence_fatal,
            checkpoint_enabled: config.workflow.checkpoint_enabled,
        }
    }
}

/// How a run ended.
#[derive(Debug)]
pub struct RunOutcome {
    pub run_id: RunId,
    /// Last coherent state. A failed step contributes nothing.
    pub state: SharedState,
    pub reason: HaltReason,
    /// Node steps completed, counted across resumes.
    pub steps: usize,
    /// The failure that ended the run, or a policy failure treated as stop.
    pub error: Option<ConvoyError>,
    /// Non-fatal problems, such as checkpoints that were not written.
    pub warnings: Vec<String>,
}

impl RunOutcome {
    pub fn is_error(&self) -> bool {
        self.reason == HaltReason::Error
    }

    /// Message contents of the final history.
    pub fn contents(&self) -> Vec<&str> {
        self.state.contents()
    }

    /// The final state, or the error when the run halted with `error`.
    pub fn into_result(self) -> Result<SharedState> {
        match (self.reason, self.error) {
            (HaltReason::Error, Some(e)) => Err(e),
            _ => Ok(self.state),
        }
    }
}

/// Result of a single [`Executor::step`].
#[derive(Debug, Clone)]
pub struct Step {
    pub state: SharedState,
    pub verdict: Continuation,
    /// Node that runs next, `None` when the run would halt.
    pub next: Option<String>,
}

/// Drives a workflow graph: invoke a node, fold its output in, checkpoint,
/// ask the policy, follow the topology.
///
/// One run is strictly sequential. Independent runs may share an executor
/// from separate tasks; each owns its own state and its own cancellation
/// token. The executor's token is a shutdown switch over all of them.
pub struct Executor {
    graph: Arc<WorkflowGraph>,
    policy: Arc<dyn ContinuationPolicy>,
    custom_policy: bool,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    options: ExecutorOptions,
    cancel: CancellationToken,
    events: Option<Arc<EventBus>>,
}

impl Executor {
    /// Executor with the default policy and no checkpointing.
    pub fn new(graph: WorkflowGraph) -> Self {
        let options = ExecutorOptions::for_agents(graph.nodes().len());
        Self {
            policy: Arc::new(DefaultPolicy::new(options.default_max_turns)),
            custom_policy: false,
            graph: Arc::new(graph),
            checkpoints: None,
            options,
            cancel: CancellationToken::new(),
            events: None,
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn ContinuationPolicy>) -> Self {
        self.policy = policy;
        self.custom_policy = true;
        self
    }

    pub fn with_checkpoints(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    /// Replace the options. The default policy is resized to match.
    pub fn with_options(mut self, options: ExecutorOptions) -> Self {
        if !self.custom_policy {
            self.policy = Arc::new(DefaultPolicy::new(options.default_max_turns));
        }
        self.options = options;
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Use `cancel` as the shutdown token.
    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Shutdown token. Cancelling it stops every run on this executor, those in
    /// flight and any started later. Use [`run_with_cancel`](Self::run_with_cancel)
    /// to stop a single run.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn graph(&self) -> &WorkflowGraph {
        &self.graph
    }

    pub fn options(&self) -> &ExecutorOptions {
        &self.options
    }

    pub fn checkpoints(&self) -> Option<&Arc<dyn CheckpointStore>> {
        self.checkpoints.as_ref()
    }

    /// Seed a fresh run and drive it to a halt.
    ///
    /// Returns `Err` only for problems found before the first step: malformed
    /// run metadata, or a fatal failure to write the seed checkpoint.
    pub async fn run(&self, initial_message: &str, metadata: Metadata) -> Result<RunOutcome> {
        self.run_with_id(RunId::new(), initial_message, metadata).await
    }

    /// Like [`run`](Self::run), under a caller-chosen run id.
    pub async fn run_with_id(
        &self,
        run_id: RunId,
        initial_message: &str,
        metadata: Metadata,
    ) -> Result<RunOutcome> {
        self.run_with_cancel(run_id, initial_message, metadata, CancellationToken::new())
            .await
    }

    /// Like [`run_with_id`](Self::run_with_id), stopped at the next step
    /// boundary when `cancel` fires. Other runs are unaffected.
    pub async fn run_with_cancel(
        &self,
        run_id: RunId,
        initial_message: &str,
        metadata: Metadata,
        cancel: CancellationToken,
    ) -> Result<RunOutcome> {
        let state = SharedState::seeded(initial_message, metadata);
        state.max_turns(self.options.default_max_turns)?;

        let mut warnings = Vec::new();
        self.persist(&run_id, 0, None, &state, &mut warnings)?;

        let entry = self.graph.entry().to_string();
        let start = Start {
            node: entry,
            steps: 0,
            resumed: false,
        };
        Ok(self.drive(run_id, state, start, warnings, &cancel).await)
    }

    /// Continue a run from its latest checkpoint.
    ///
    /// The policy is evaluated against the stored state first, so a run that
    /// had already halted comes straight back with its reason.
    pub async fn resume(&self, run_id: &RunId) -> Result<RunOutcome> {
        self.resume_with_cancel(run_id, CancellationToken::new()).await
    }

    /// Like [`resume`](Self::resume), with a token for this run alone.
    pub async fn resume_with_cancel(
        &self,
        run_id: &RunId,
        cancel: CancellationToken,
    ) -> Result<RunOutcome> {
        let store = self
            .checkpoints
            .as_ref()
            .ok_or_else(|| ConvoyError::Config("resume requires a checkpoint store".into()))?;
        let cp = store.load(run_id)?;
        validate_history(&cp.state.history)?;

        if cp.topology != self.graph.topology() {
            return Err(ConvoyError::Config(format!(
                "run {} was recorded under the {} topology, workflow is {}",
                run_id,
                cp.topology,
                self.graph.topology()
            )));
        }
        cp.state.max_turns(self.options.default_max_turns)?;

        let next = match cp.node.as_deref() {
            None => self.graph.entry().to_string(),
            Some(last) => {
                self.graph.require(last)?;
                let verdict = evaluate_guarded(self.policy.as_ref(), &cp.state)?;
                let successor = match verdict {
                    Continuation::Halt(reason) => {
                        info!(run_id = %run_id, reason = %reason, "Resumed run already halted");
                        return Ok(self.finish(cp.run_id, cp.state, reason, cp.step, None, vec![]));
                    }
                    Continuation::Continue => self.graph.successor(last, true),
                };
                match successor {
                    Some(next) => next.to_string(),
                    None => {
                        return Ok(self.finish(
                            cp.run_id,
                            cp.state,
                            HaltReason::ContinuationFalse,
                            cp.step,
                            None,
                            vec![],
                        ))
                    }
                }
            }
        };

        let start = Start {
            node: next,
            steps: cp.step,
            resumed: true,
        };
        Ok(self.drive(cp.run_id, cp.state, start, vec![], &cancel).await)
    }

    /// Execute one node against a state, outside any run.
    ///
    /// Applies the step timeout and retry options, then evaluates the policy on
    /// the result. A policy failure is returned as an error here.
    pub async fn step(&self, node: &str, state: &SharedState) -> Result<Step> {
        let agent = self.graph.require(node)?;
        let run_id = RunId::new();
        let next_state = self
            .invoke(&run_id, agent, state, &CancellationToken::new())
            .await?;
        let verdict = evaluate_guarded(self.policy.as_ref(), &next_state)?;
        let next = if verdict.should_continue() {
            self.graph.successor(node, true).map(String::from)
        } else {
            None
        };
        Ok(Step {
            state: next_state,
            verdict,
            next,
        })
    }

    async fn drive(
        &self,
        run_id: RunId,
        mut state: SharedState,
        start: Start,
        mut warnings: Vec<String>,
        cancel: &CancellationToken,
    ) -> RunOutcome {
        let Start {
            node: mut current,
            mut steps,
            resumed,
        } = start;
        info!(
            run_id = %run_id,
            entry = %current,
            resumed,
            topology = %self.graph.topology(),
            "Run started"
        );
        self.emit(RunEvent::RunStarted {
            run_id: run_id.clone(),
            entry: current.clone(),
            resumed,
        });

        let (reason, failure) = loop {
            if cancel.is_cancelled() || self.cancel.is_cancelled() {
                info!(run_id = %run_id, steps, "Run cancelled");
                break (HaltReason::Cancelled, None);
            }

            let node = match self.graph.require(&current) {
                Ok(node) => node,
                Err(e) => break (HaltReason::Error, Some(e)),
            };
            let step = steps + 1;
            self.emit(RunEvent::StepStarted {
                run_id: run_id.clone(),
                step,
                node: current.clone(),
            });

            let started = Instant::now();
            state = match self.invoke(&run_id, node, &state, cancel).await {
                Ok(next) => next,
                Err(ConvoyError::Cancelled) => {
                    info!(run_id = %run_id, node = %current, "Run cancelled mid-step");
                    break (HaltReason::Cancelled, None);
                }
                Err(e) => {
                    error!(run_id = %run_id, node = %current, step, error = %e, "Step failed");
                    break (HaltReason::Error, Some(e));
                }
            };
            steps = step;

            let elapsed_ms = started.elapsed().as_millis() as u64;
            debug!(
                run_id = %run_id,
                node = %current,
                step,
                history_len = state.len(),
                elapsed_ms,
                "Step complete"
            );
            self.emit(RunEvent::StepCompleted {
                run_id: run_id.clone(),
                step,
                node: current.clone(),
                history_len: state.len(),
                elapsed_ms,
            });

            let node_name = Some(current.as_str());
            if let Err(e) = self.persist(&run_id, step, node_name, &state, &mut warnings) {
                break (HaltReason::Error, Some(e));
            }

            let verdict = match evaluate_guarded(self.policy.as_ref(), &state) {
                Ok(verdict) => verdict,
                Err(e) => {
                    warn!(run_id = %run_id, step, error = %e, "Continuation policy failed");
                    warnings.push(format!("continuation policy failed: {}", e));
                    self.emit(RunEvent::PolicyFailed {
                        run_id: run_id.clone(),
                        error: e.to_string(),
                    });
                    break (HaltReason::ContinuationFalse, Some(e));
                }
            };

            if let Continuation::Halt(reason) = verdict {
                break (reason, None);
            }
            match self.graph.successor(&current, true) {
                Some(next) => current = next.to_string(),
                None => {
                    debug!(run_id = %run_id, node = %current, "No outgoing edge, run complete");
                    break (HaltReason::ContinuationFalse, None);
                }
            }
        };

        self.finish(run_id, state, reason, steps, failure, warnings)
    }

    fn finish(
        &self,
        run_id: RunId,
        state: SharedState,
        reason: HaltReason,
        steps: usize,
        error: Option<ConvoyError>,
        warnings: Vec<String>,
    ) -> RunOutcome {
        info!(
            run_id = %run_id,
            reason = %reason,
            steps,
            history_len = state.len(),
            "Run halted"
        );
        self.emit(RunEvent::RunHalted {
            run_id: run_id.clone(),
            reason,
            steps,
            at: Utc::now(),
        });
        RunOutcome {
            run_id,
            state,
            reason,
            steps,
            error,
            warnings,
        }
    }

    /// One node step with timeout, retry and cancellation.
    async fn invoke(
        &self,
        run_id: &RunId,
        node: &AgentNode,
        state: &SharedState,
        cancel: &CancellationToken,
    ) -> Result<SharedState> {
        let retry = &self.options.retry;
        let mut attempt = 0u32;
        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ConvoyError::Cancelled),
                _ = self.cancel.cancelled() => return Err(ConvoyError::Cancelled),
                r = self.attempt(node, state) => r,
            };

            match result {
                Ok(next) => return Ok(next),
                Err(e) if e.is_agent_error() && attempt < retry.max_retries => {
                    let backoff = calculate_backoff(attempt, retry);
                    attempt += 1;
                    warn!(
                        run_id = %run_id,
                        node = %node.name(),
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Step failed, retrying"
                    );
                    self.emit(RunEvent::StepRetry {
                        run_id: run_id.clone(),
                        node: node.name().to_string(),
                        attempt,
                        error: e.to_string(),
                    });
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(ConvoyError::Cancelled),
                        _ = self.cancel.cancelled() => return Err(ConvoyError::Cancelled),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn attempt(&self, node: &AgentNode, state: &SharedState) -> Result<SharedState> {
        match self.options.step_timeout {
            Some(limit) => match tokio::time::timeout(limit, node.process(state)).await {
                Ok(result) => result,
                Err(_) => Err(ConvoyError::AgentTimeout {
                    agent: node.name().to_string(),
                    timeout_ms: limit.as_millis() as u64,
                }),
            },
            None => node.process(state).await,
        }
    }

    fn persist(
        &self,
        run_id: &RunId,
        step: usize,
        node: Option<&str>,
        state: &SharedState,
        warnings: &mut Vec<String>,
    ) -> Result<()> {
        if !self.options.checkpoint_enabled {
            return Ok(());
        }
        let Some(store) = &self.checkpoints else {
            return Ok(());
        };

        let cp = Checkpoint::new(
            run_id.clone(),
            step,
            node.map(String::from),
            self.graph.topology(),
            state.clone(),
        );
        match store.save(&cp) {
            Ok(()) => Ok(()),
            Err(e) if self.options.persistence_fatal => {
                error!(run_id = %run_id, step, error = %e, "Checkpoint failed");
                Err(e)
            }
            Err(e) => {
                warn!(run_id = %run_id, step, error = %e, "Checkpoint failed, continuing");
                warnings.push(format!("checkpoint at step {} not saved: {}", step, e));
                self.emit(RunEvent::CheckpointFailed {
                    run_id: run_id.clone(),
                    step,
                    error: e.to_string(),
                });
                Ok(())
            }
        }
    }

    fn emit(&self, event: RunEvent) {
        if let Some(bus) = &self.events {
            bus.publish(event);
        }
    }
}

/// Where a run's loop picks up.
struct Start {
    node: String,
    steps: usize,
    resumed: bool,
}

/// Exponential backoff with 0.8x-1.2x jitter, capped at `max_backoff_ms`.
fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let ms = config
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(config.max_backoff_ms);
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}
