pub mod builder;
pub mod checkpoint;
pub mod executor;
pub mod graph;
pub mod node;
pub mod policy;
pub mod tools;

pub use builder::{create_multi_agent_workflow, create_single_agent, WorkflowBuilder};
pub use checkpoint::{open_store, MemoryCheckpointStore, SqliteCheckpointStore};
pub use executor::{Executor, ExecutorOptions, RunOutcome, Step};
pub use graph::{Edge, EdgeCondition, Target, WorkflowGraph};
pub use node::{turn_fn, AgentNode, ExtensionFn};
pub use policy::{DefaultPolicy, FnPolicy};
pub use tools::ToolRegistry;
