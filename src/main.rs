use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use convoy_core::config::WorkflowConfig;
use convoy_core::error::Result as ConvoyResult;
use convoy_core::event::EventBus;
use convoy_core::traits::{CheckpointStore, Tool, TurnCapability};
use convoy_core::types::{
    Message, Metadata, PromptContext, RunEvent, RunId, SharedState, TurnOutput, MAX_TURNS_KEY,
};

use convoy_agent::{open_store, Executor, RunOutcome, ToolRegistry, WorkflowBuilder};

#[derive(Parser)]
#[command(name = "convoy", version, about = "Multi-agent workflow engine")]
struct Cli {
    /// Path to workflow file
    #[arg(short, long, default_value = "convoy.toml", env = "CONVOY_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check the workflow file and print the wiring
    Validate,
    /// Rehearse a run with an echo turn in place of every agent
    Run {
        /// Message that seeds the run (read from stdin when empty)
        #[arg(trailing_var_arg = true)]
        message: Vec<String>,
        /// Override max_turns for this run
        #[arg(long)]
        max_turns: Option<u64>,
        /// Run id (auto-generated if not provided)
        #[arg(long)]
        run_id: Option<String>,
        /// Print the final state as JSON
        #[arg(long)]
        json: bool,
    },
    /// Continue a checkpointed run
    Resume {
        run_id: String,
        #[arg(long)]
        json: bool,
    },
    /// Inspect or clean up checkpoints
    Checkpoints {
        #[command(subcommand)]
        action: CheckpointAction,
    },
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// List runs with checkpoints
    List,
    /// Show the latest checkpoint of a run
    Show {
        run_id: String,
        /// Show every checkpoint, oldest first
        #[arg(long)]
        all: bool,
    },
    /// Delete every checkpoint of a run
    Delete { run_id: String },
}

/// Stand-in turn capability: the agent repeats the last message back,
/// prefixed with its name and role.
struct RehearsalTurn;

impl TurnCapability for RehearsalTurn {
    fn take_turn<'a>(
        &'a self,
        ctx: PromptContext,
        tools: &'a [Arc<dyn Tool>],
    ) -> BoxFuture<'a, ConvoyResult<TurnOutput>> {
        Box::pin(async move {
            let last = ctx
                .history()
                .last()
                .map(|m| truncate(&m.content, 80))
                .unwrap_or_default();
            let mut content = format!("[{} / {}] {}", ctx.agent, ctx.role, last);
            if !tools.is_empty() {
                let names: Vec<&str> = tools.iter().map(|t| t.name()).collect();
                content.push_str(&format!(" (tools: {})", names.join(", ")));
            }
            Ok(TurnOutput::message(Message::agent(content)))
        })
    }
}

/// Placeholder for a tool binding during rehearsal.
struct RehearsalTool {
    name: String,
}

impl Tool for RehearsalTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Rehearsal placeholder"
    }

    fn call(&self, input: String) -> BoxFuture<'_, ConvoyResult<String>> {
        Box::pin(async move { Ok(format!("{} received {} bytes", self.name, input.len())) })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("convoy=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = WorkflowConfig::load(&cli.config)?;
    info!(path = %cli.config.display(), agents = config.agents.len(), "Loaded workflow");

    match cli.command {
        Commands::Validate => {
            let executor = build_rehearsal(&config, None)?;
            let graph = executor.graph();
            println!("Workflow OK: {} topology, entry '{}'", graph.topology(), graph.entry());
            for node in graph.nodes() {
                println!(
                    "  agent {} ({}, model {}, temperature {})",
                    node.name(),
                    node.role(),
                    node.spec().model,
                    node.spec().temperature
                );
            }
            for line in graph.describe() {
                println!("  {}", line);
            }
            println!(
                "  max_turns {} | checkpoint {:?}",
                config.default_max_turns(),
                config.checkpoint_target()
            );
        }
        Commands::Run {
            message,
            max_turns,
            run_id,
            json,
        } => {
            let text = if message.is_empty() {
                read_stdin()
            } else {
                message.join(" ")
            };
            if text.trim().is_empty() {
                anyhow::bail!("no message given on the command line or stdin");
            }

            let mut metadata = Metadata::new();
            if let Some(n) = max_turns {
                metadata.insert(MAX_TURNS_KEY.to_string(), serde_json::json!(n));
            }

            let bus = Arc::new(EventBus::default());
            let executor = build_rehearsal(&config, Some(bus.clone()))?;
            let run_id = run_id.map(RunId::from).unwrap_or_default();
            let printer = spawn_event_printer(&bus, run_id.clone());
            let cancel = CancellationToken::new();
            spawn_ctrl_c(cancel.clone());

            let outcome = executor
                .run_with_cancel(run_id, &text, metadata, cancel)
                .await?;
            // Closing the bus lets the printer drain and stop.
            drop(executor);
            drop(bus);
            printer.await.ok();
            report(&outcome, json)?;
        }
        Commands::Resume { run_id, json } => {
            let bus = Arc::new(EventBus::default());
            let executor = build_rehearsal(&config, Some(bus.clone()))?;
            let run_id = RunId::from(run_id);
            let printer = spawn_event_printer(&bus, run_id.clone());
            let cancel = CancellationToken::new();
            spawn_ctrl_c(cancel.clone());

            let outcome = executor.resume_with_cancel(&run_id, cancel).await?;
            // Closing the bus lets the printer drain and stop.
            drop(executor);
            drop(bus);
            printer.await.ok();
            report(&outcome, json)?;
        }
        Commands::Checkpoints { action } => {
            let store = open_store(&config.checkpoint_target())?;
            handle_checkpoints(store.as_ref(), action)?;
        }
    }

    Ok(())
}

fn build_rehearsal(
    config: &WorkflowConfig,
    events: Option<Arc<EventBus>>,
) -> anyhow::Result<Executor> {
    let mut tools = ToolRegistry::new();
    for name in config.agents.iter().flat_map(|a| a.tools.iter()) {
        tools.register(RehearsalTool { name: name.clone() });
    }

    let mut builder = WorkflowBuilder::new(config.clone())
        .with_tools(tools)
        .with_default_turn(Arc::new(RehearsalTurn));
    if let Some(events) = events {
        builder = builder.with_events(events);
    }
    Ok(builder.build()?)
}

fn handle_checkpoints(store: &dyn CheckpointStore, action: CheckpointAction) -> anyhow::Result<()> {
    match action {
        CheckpointAction::List => {
            let runs = store.list_runs()?;
            if runs.is_empty() {
                println!("No checkpoints.");
            }
            for run_id in runs {
                let latest = store.load(&run_id)?;
                println!(
                    "{}  step {:>3}  {:>3} messages  {}  {}",
                    run_id,
                    latest.step,
                    latest.state.len(),
                    latest.topology,
                    latest.created_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        CheckpointAction::Show { run_id, all } => {
            let run_id = RunId::from(run_id);
            let snapshots = if all {
                store.history(&run_id)?
            } else {
                vec![store.load(&run_id)?]
            };
            for cp in snapshots {
                println!(
                    "step {} (after {})",
                    cp.step,
                    cp.node.as_deref().unwrap_or("seed")
                );
                print_history(&cp.state);
            }
        }
        CheckpointAction::Delete { run_id } => {
            let removed = store.delete_run(&RunId::from(run_id.as_str()))?;
            println!("Deleted {} checkpoint(s) for {}", removed, run_id);
        }
    }
    Ok(())
}

fn report(outcome: &RunOutcome, json: bool) -> anyhow::Result<()> {
    for warning in &outcome.warnings {
        warn!(run_id = %outcome.run_id, "{}", warning);
    }

    if json {
        let doc = serde_json::json!({
            "run_id": outcome.run_id,
            "reason": outcome.reason,
            "steps": outcome.steps,
            "error": outcome.error.as_ref().map(|e| e.to_string()),
            "state": outcome.state,
        });
        println!("{}", serde_json::to_string_pretty(&doc)?);
    } else {
        print_history(&outcome.state);
        println!(
            "\nRun {} halted: {} after {} step(s)",
            outcome.run_id, outcome.reason, outcome.steps
        );
        if let Some(ref e) = outcome.error {
            eprintln!("[error: {}]", e);
        }
    }

    if outcome.is_error() {
        std::process::exit(1);
    }
    Ok(())
}

fn print_history(state: &SharedState) {
    for (i, msg) in state.history.iter().enumerate() {
        let author = msg
            .metadata
            .get("agent")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        println!("{:>3} {:<6} {:<12} {}", i, msg.role, author, msg.content);
    }
}

/// Prints one run's progress to stderr. Finishes once the run halts.
fn spawn_event_printer(bus: &EventBus, run_id: RunId) -> tokio::task::JoinHandle<()> {
    let mut events = bus.subscribe_run(run_id);
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                RunEvent::StepStarted { step, node, .. } => {
                    eprintln!("[step {}: {}]", step, node);
                }
                RunEvent::StepRetry {
                    node, attempt, error, ..
                } => {
                    eprintln!("[{}: retry {}] {}", node, attempt, truncate(&error, 200));
                }
                RunEvent::CheckpointFailed { step, error, .. } => {
                    eprintln!("[checkpoint {} failed] {}", step, error);
                }
                RunEvent::PolicyFailed { error, .. } => {
                    eprintln!("[policy failed] {}", error);
                }
                _ => {}
            }
        }
    })
}

fn spawn_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Cancelling run...");
        cancel.cancel();
    });
}

fn read_stdin() -> String {
    io::stdin()
        .lock()
        .lines()
        .map_while(|l| l.ok())
        .collect::<Vec<_>>()
        .join("\n")
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{}...", cut)
    }
}
