use std::io::Write;
use std::sync::Arc;

use convoy_agent::{
    create_multi_agent_workflow, AgentNode, SqliteCheckpointStore, ToolRegistry, WorkflowBuilder,
};
use convoy_core::config::{AgentSpec, WorkflowConfig};
use convoy_core::reducer::merge;
use convoy_core::traits::CheckpointStore;
use convoy_core::types::{AgentRole, HaltReason, Message, Metadata, RunId};
use convoy_test_utils::{max_turns, EchoTurn, FailingTurn, StaticTool, ToolCallingTurn};

fn write_config(dir: &std::path::Path, body: &str) -> std::path::PathBuf {
    let path = dir.join("convoy.toml");
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(body.as_bytes()).unwrap();
    path
}

#[tokio::test]
async fn test_sequential_scenario_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        dir.path(),
        r#"
[[agents]]
name = "A"
[[agents]]
name = "B"
[[agents]]
name = "C"
"#,
    );
    let config = WorkflowConfig::load(&path).unwrap();
    let executor = WorkflowBuilder::new(config)
        .with_default_turn(Arc::new(EchoTurn))
        .build()
        .unwrap();

    let outcome = executor.run("start", max_turns(4)).await.unwrap();
    assert_eq!(outcome.contents(), vec!["start", "A", "B", "C"]);
    assert_eq!(outcome.reason, HaltReason::MaxTurnsReached);

    // Every message carries a distinct id.
    let mut ids: Vec<_> = outcome
        .state
        .history
        .iter()
        .map(|m| m.id_str().unwrap().to_string())
        .collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 4);
}

#[tokio::test]
async fn test_broadcast_scenario_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        dir.path(),
        r#"
[workflow]
topology = "broadcast"

[[agents]]
name = "X"
[[agents]]
name = "Y"
"#,
    );
    let executor = WorkflowBuilder::new(WorkflowConfig::load(&path).unwrap())
        .with_default_turn(Arc::new(EchoTurn))
        .build()
        .unwrap();

    let outcome = executor.run("start", max_turns(2)).await.unwrap();
    assert_eq!(outcome.contents(), vec!["start", "X"]);
    assert_eq!(outcome.reason, HaltReason::MaxTurnsReached);
}

#[tokio::test]
async fn test_tools_flow_through_to_turns() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        dir.path(),
        r#"
[workflow]
max_turns = 3

[[agents]]
name = "researcher"
tools = ["search"]
"#,
    );
    let mut tools = ToolRegistry::new();
    tools.register(StaticTool::new("search", "3 papers found"));

    let executor = WorkflowBuilder::new(WorkflowConfig::load(&path).unwrap())
        .with_tools(tools)
        .with_default_turn(Arc::new(ToolCallingTurn))
        .build()
        .unwrap();
    let outcome = executor.run("survey rust async", Metadata::new()).await.unwrap();
    assert_eq!(
        outcome.contents(),
        vec!["survey rust async", "search: 3 papers found", "search: 3 papers found"]
    );
    assert_eq!(outcome.state.history[1].metadata["agent"], "researcher");
}

#[tokio::test]
async fn test_sqlite_checkpoint_resume_across_executors() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("state").join("runs.db");
    let run_id = RunId::from("nightly-review");

    let failing = vec![
        AgentNode::new(AgentSpec::new("writer", AgentRole::Executor), Arc::new(EchoTurn)),
        AgentNode::new(
            AgentSpec::new("reviewer", AgentRole::Critic),
            Arc::new(FailingTurn::always("upstream 503")),
        ),
    ];
    let first = create_multi_agent_workflow(failing, "sequential", Some(&db)).unwrap();
    let broken = first
        .run_with_id(run_id.clone(), "review the patch", max_turns(5))
        .await
        .unwrap();
    assert_eq!(broken.reason, HaltReason::Error);
    assert_eq!(broken.contents(), vec!["review the patch", "writer"]);
    drop(first);

    let healthy = vec![
        AgentNode::new(AgentSpec::new("writer", AgentRole::Executor), Arc::new(EchoTurn)),
        AgentNode::new(AgentSpec::new("reviewer", AgentRole::Critic), Arc::new(EchoTurn)),
    ];
    let second = create_multi_agent_workflow(healthy, "sequential", Some(&db)).unwrap();
    let resumed = second.resume(&run_id).await.unwrap();
    assert_eq!(
        resumed.contents(),
        vec!["review the patch", "writer", "reviewer", "writer", "reviewer"]
    );
    assert_eq!(resumed.reason, HaltReason::MaxTurnsReached);
    assert_eq!(resumed.steps, 4);
    // Ids survive the round trip through SQLite.
    assert_eq!(resumed.state.history[..2], broken.state.history[..]);

    let store = SqliteCheckpointStore::open(&db).unwrap();
    let steps: Vec<usize> = store.history(&run_id).unwrap().iter().map(|c| c.step).collect();
    assert_eq!(steps, vec![0, 1, 2, 3, 4]);
    assert_eq!(store.load_state(&run_id).unwrap(), resumed.state);
    assert_eq!(store.delete_run(&run_id).unwrap(), 5);
}

#[test]
fn test_merge_properties() {
    let history = vec![Message::user("start"), Message::agent("draft").with_id("d")];
    let incoming = vec![
        Message::agent("draft v2").with_id("d"),
        Message::agent("note"),
    ];

    let once = merge(&history, incoming.clone()).unwrap();
    let twice = merge(&history, once.clone()).unwrap();
    assert_eq!(once, twice);
    assert_eq!(
        once.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(),
        vec!["start", "draft v2", "note"]
    );
    // Inputs are untouched.
    assert_eq!(history[1].content, "draft");
}
