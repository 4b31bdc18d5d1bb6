use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ConvoyError, Result};

/// Free-form key/value data carried on messages and on the shared state.
pub type Metadata = HashMap<String, serde_json::Value>;

/// Metadata key read by the default continuation policy.
pub const MAX_TURNS_KEY: &str = "max_turns";

/// Unique run identifier. Keys checkpoints.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RunId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Message identifier. Assigned once, when the message is created.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    /// A fresh 128-bit random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Author of a message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Agent,
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::System => "system",
            Self::User => "user",
            Self::Agent => "agent",
            Self::Tool => "tool",
        };
        f.write_str(s)
    }
}

/// A single entry in the conversation history.
///
/// Messages are values: "updating" one means producing a new `Message` with
/// the same id and letting the reducer replace the old entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// `None` only for messages a producer handed over without an id; the
    /// reducer assigns one before the message enters a history.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Message {
    /// Create a message with a freshly assigned id.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Some(MessageId::new()),
            role,
            content: content.into(),
            metadata: Metadata::new(),
        }
    }

    /// Create a message without an id. The reducer assigns one on merge.
    pub fn unidentified(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: None,
            role,
            content: content.into(),
            metadata: Metadata::new(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn agent(content: impl Into<String>) -> Self {
        Self::new(Role::Agent, content)
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self::new(Role::Tool, content)
    }

    /// Replace the id (used to emit an updated version of an earlier message).
    pub fn with_id(mut self, id: impl Into<MessageId>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Attach a metadata entry.
    pub fn with_meta(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// The id as a string slice, if assigned.
    pub fn id_str(&self) -> Option<&str> {
        self.id.as_ref().map(|id| id.0.as_str())
    }
}

/// The conversation record passed through a workflow.
///
/// Owned by the executor for the lifetime of a run. Nodes receive it by
/// reference and hand back a new value; nothing mutates it in place.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SharedState {
    pub history: Vec<Message>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl SharedState {
    pub fn new(history: Vec<Message>, metadata: Metadata) -> Self {
        Self { history, metadata }
    }

    /// Seed a run: a single user message plus the caller's metadata.
    pub fn seeded(initial_message: impl Into<String>, metadata: Metadata) -> Self {
        Self {
            history: vec![Message::user(initial_message)],
            metadata,
        }
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.history.last()
    }

    /// Contents of every message, in history order.
    pub fn contents(&self) -> Vec<&str> {
        self.history.iter().map(|m| m.content.as_str()).collect()
    }

    /// Read `max_turns` from metadata, falling back to `default` when absent.
    ///
    /// A present but non-integer value is a configuration error.
    pub fn max_turns(&self, default: usize) -> Result<usize> {
        match self.metadata.get(MAX_TURNS_KEY) {
            None => Ok(default),
            Some(value) => value
                .as_u64()
                .map(|n| n as usize)
                .ok_or_else(|| {
                    ConvoyError::Config(format!(
                        "metadata key '{}' must be a non-negative integer, got {}",
                        MAX_TURNS_KEY, value
                    ))
                }),
        }
    }

    /// Return a copy with the given history and this state's metadata.
    pub fn with_history(&self, history: Vec<Message>) -> Self {
        Self {
            history,
            metadata: self.metadata.clone(),
        }
    }

    /// Apply a metadata patch. `null` values remove the key.
    pub fn apply_patch(&mut self, patch: &Metadata) {
        for (key, value) in patch {
            if value.is_null() {
                self.metadata.remove(key);
            } else {
                self.metadata.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Role an agent plays in a workflow.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    Coordinator,
    #[default]
    Executor,
    Critic,
    Researcher,
    Custom,
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Coordinator => "coordinator",
            Self::Executor => "executor",
            Self::Critic => "critic",
            Self::Researcher => "researcher",
            Self::Custom => "custom",
        };
        f.write_str(s)
    }
}

/// Everything a turn capability sees for one invocation.
#[derive(Debug, Clone)]
pub struct PromptContext {
    pub agent: String,
    pub role: AgentRole,
    pub model: String,
    pub temperature: f32,
    /// The agent's instructions as a system message, followed by the history.
    pub messages: Vec<Message>,
    pub metadata: Metadata,
}

impl PromptContext {
    /// The conversation without the prepended instructions.
    pub fn history(&self) -> &[Message] {
        match self.messages.first() {
            Some(first) if first.role == Role::System => &self.messages[1..],
            _ => &self.messages,
        }
    }
}

/// What a turn capability returns.
#[derive(Debug, Clone, Default)]
pub struct TurnOutput {
    /// New messages, or updated versions of existing ones (same id).
    pub messages: Vec<Message>,
    /// Requested metadata changes. `null` removes a key.
    pub metadata_patch: Metadata,
}

impl TurnOutput {
    pub fn messages(messages: Vec<Message>) -> Self {
        Self {
            messages,
            metadata_patch: Metadata::new(),
        }
    }

    pub fn message(message: Message) -> Self {
        Self::messages(vec![message])
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_patch(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata_patch.insert(key.into(), value);
        self
    }
}

/// Why a run stopped.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HaltReason {
    ContinuationFalse,
    MaxTurnsReached,
    Cancelled,
    Error,
}

impl std::fmt::Display for HaltReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ContinuationFalse => "continuation_false",
            Self::MaxTurnsReached => "max_turns_reached",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Verdict of a continuation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuation {
    Continue,
    Halt(HaltReason),
}

impl Continuation {
    pub fn should_continue(&self) -> bool {
        matches!(self, Self::Continue)
    }
}

/// Communication topology wiring the agents of a workflow.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Topology {
    /// Each agent hands off to the next; the last loops back while the
    /// continuation policy allows.
    #[default]
    Sequential,
    /// Full mesh; agents are visited round-robin in configuration order.
    Broadcast,
}

impl std::str::FromStr for Topology {
    type Err = ConvoyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sequential" => Ok(Self::Sequential),
            "broadcast" => Ok(Self::Broadcast),
            other => Err(ConvoyError::Config(format!("unknown topology '{}'", other))),
        }
    }
}

impl std::fmt::Display for Topology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sequential => f.write_str("sequential"),
            Self::Broadcast => f.write_str("broadcast"),
        }
    }
}

/// A persisted snapshot of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: RunId,
    /// Number of node steps completed when the snapshot was taken (0 = seed).
    pub step: usize,
    /// Node whose output produced this snapshot; `None` for the seed.
    pub node: Option<String>,
    pub topology: Topology,
    pub state: SharedState,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(
        run_id: RunId,
        step: usize,
        node: Option<String>,
        topology: Topology,
        state: SharedState,
    ) -> Self {
        Self {
            run_id,
            step,
            node,
            topology,
            state,
            created_at: Utc::now(),
        }
    }
}

/// Run lifecycle event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum RunEvent {
    /// Run seeded (or resumed) and entering its loop.
    RunStarted { run_id: RunId, entry: String, resumed: bool },
    /// A node is about to execute.
    StepStarted { run_id: RunId, step: usize, node: String },
    /// A node's output was merged into the shared state.
    StepCompleted {
        run_id: RunId,
        step: usize,
        node: String,
        history_len: usize,
        elapsed_ms: u64,
    },
    /// A step attempt failed and will be retried.
    StepRetry { run_id: RunId, node: String, attempt: u32, error: String },
    /// Checkpoint write failed; the run carries on with unpersisted state.
    CheckpointFailed { run_id: RunId, step: usize, error: String },
    /// The continuation policy failed and was treated as "stop".
    PolicyFailed { run_id: RunId, error: String },
    /// Run reached its terminal state.
    RunHalted {
        run_id: RunId,
        reason: HaltReason,
        steps: usize,
        at: DateTime<Utc>,
    },
}

impl RunEvent {
    /// The run this event belongs to.
    pub fn run_id(&self) -> &RunId {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::StepStarted { run_id, .. }
            | Self::StepCompleted { run_id, .. }
            | Self::StepRetry { run_id, .. }
            | Self::CheckpointFailed { run_id, .. }
            | Self::PolicyFailed { run_id, .. }
            | Self::RunHalted { run_id, .. } => run_id,
        }
    }

    /// Whether this is the last event of its run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RunHalted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_constructors_assign_ids() {
        let a = Message::user("hello");
        let b = Message::agent("hello");
        assert!(a.id.is_some());
        assert!(b.id.is_some());
        assert_ne!(a.id, b.id);
        assert_eq!(a.role, Role::User);
        assert_eq!(b.role, Role::Agent);

        let bare = Message::unidentified(Role::Tool, "raw");
        assert!(bare.id.is_none());
        assert_eq!(bare.with_id("t-1").id_str(), Some("t-1"));
    }

    #[test]
    fn test_message_serde_shape() {
        let msg = Message::agent("draft")
            .with_id("m-1")
            .with_meta("score", serde_json::json!(3));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["id"], "m-1");
        assert_eq!(json["role"], "agent");
        assert_eq!(json["content"], "draft");
        assert_eq!(json["metadata"]["score"], 3);

        let bare = serde_json::to_value(Message::unidentified(Role::User, "x")).unwrap();
        assert!(bare.get("id").is_none());
    }

    #[test]
    fn test_seeded_state() {
        let mut meta = Metadata::new();
        meta.insert(MAX_TURNS_KEY.into(), serde_json::json!(4));
        let state = SharedState::seeded("start", meta);
        assert_eq!(state.len(), 1);
        assert_eq!(state.history[0].role, Role::User);
        assert_eq!(state.contents(), vec!["start"]);
        assert_eq!(state.max_turns(20).unwrap(), 4);
    }

    #[test]
    fn test_max_turns_default_and_malformed() {
        let state = SharedState::seeded("start", Metadata::new());
        assert_eq!(state.max_turns(10).unwrap(), 10);

        let mut meta = Metadata::new();
        meta.insert(MAX_TURNS_KEY.into(), serde_json::json!("four"));
        let bad = SharedState::seeded("start", meta);
        assert!(matches!(bad.max_turns(10), Err(ConvoyError::Config(_))));

        let mut meta = Metadata::new();
        meta.insert(MAX_TURNS_KEY.into(), serde_json::json!(-1));
        let negative = SharedState::seeded("start", meta);
        assert!(negative.max_turns(10).is_err());
    }

    #[test]
    fn test_apply_patch() {
        let mut state = SharedState::default();
        state.metadata.insert("stage".into(), serde_json::json!("draft"));
        state.metadata.insert("temp".into(), serde_json::json!(true));

        let mut patch = Metadata::new();
        patch.insert("stage".into(), serde_json::json!("review"));
        patch.insert("temp".into(), serde_json::Value::Null);
        patch.insert("score".into(), serde_json::json!(7));
        state.apply_patch(&patch);

        assert_eq!(state.metadata.get("stage"), Some(&serde_json::json!("review")));
        assert_eq!(state.metadata.get("score"), Some(&serde_json::json!(7)));
        assert!(!state.metadata.contains_key("temp"));
    }

    #[test]
    fn test_prompt_context_history_skips_instructions() {
        let ctx = PromptContext {
            agent: "a".into(),
            role: AgentRole::Critic,
            model: "m".into(),
            temperature: 0.2,
            messages: vec![Message::system("be terse"), Message::user("hi")],
            metadata: Metadata::new(),
        };
        assert_eq!(ctx.history().len(), 1);
        assert_eq!(ctx.history()[0].content, "hi");
    }

    #[test]
    fn test_topology_parse() {
        assert_eq!("sequential".parse::<Topology>().unwrap(), Topology::Sequential);
        assert_eq!(" Broadcast ".parse::<Topology>().unwrap(), Topology::Broadcast);
        assert!(matches!(
            "hierarchical".parse::<Topology>(),
            Err(ConvoyError::Config(_))
        ));
        assert_eq!(Topology::Broadcast.to_string(), "broadcast");
    }

    #[test]
    fn test_halt_reason_codes() {
        assert_eq!(HaltReason::MaxTurnsReached.to_string(), "max_turns_reached");
        assert_eq!(
            serde_json::to_value(HaltReason::ContinuationFalse).unwrap(),
            "continuation_false"
        );
        assert!(Continuation::Continue.should_continue());
        assert!(!Continuation::Halt(HaltReason::Cancelled).should_continue());
    }
}
