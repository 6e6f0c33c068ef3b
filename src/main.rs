//! daq-actions - run instrument workflows from the command line

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use daq_actions::action::{ActionEventKind, ActionId, ActionState, ActionTree};
use daq_actions::config::EngineConfig;
use daq_actions::supervisor::Supervisor;
use daq_actions::tracing_setup;
use daq_actions::workflow::{ControlRegistry, Workflow};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "daq-actions",
    version,
    about = "Run composable instrument workflows"
)]
struct Cli {
    /// Configuration file (defaults to config/daq_actions.toml)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow against the configured controls
    Run {
        /// Workflow file (.toml, .yaml or .json)
        workflow: PathBuf,
        /// Print every action event as a JSON line
        #[arg(long)]
        events: bool,
    },
    /// Build a workflow without running it and print its outline
    Validate {
        /// Workflow file (.toml, .yaml or .json)
        workflow: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => EngineConfig::load_from(path)?,
        None => EngineConfig::load()?,
    };
    tracing_setup::init_from_config(&config.application)?;

    match cli.command {
        Commands::Run { workflow, events } => run(&config, &workflow, events).await,
        Commands::Validate { workflow } => validate(&config, &workflow),
    }
}

fn load(config: &EngineConfig, path: &Path) -> Result<(Workflow, ActionTree, ActionId)> {
    let workflow = Workflow::from_path(path)
        .with_context(|| format!("Failed to load workflow {}", path.display()))?;
    let registry = ControlRegistry::simulated_from_config(config);
    let (tree, root) = workflow
        .build(&registry, config)
        .with_context(|| format!("Failed to build workflow '{}'", workflow.name))?;
    Ok((workflow, tree, root))
}

fn validate(config: &EngineConfig, path: &Path) -> Result<ExitCode> {
    let (workflow, tree, root) = load(config, path)?;

    println!("{}: {} actions", workflow.name, tree.len());
    print!("{}", tree.outline(root));
    match tree.effective_expected_duration(root) {
        Some(expected) => println!("expected duration: {:.1} s", expected.as_secs_f64()),
        None => println!("expected duration: unknown"),
    }
    Ok(ExitCode::SUCCESS)
}

/// Descriptions of every action under `root`, for event output.
fn descriptions(tree: &ActionTree, root: ActionId) -> HashMap<ActionId, String> {
    let mut names = HashMap::new();
    let mut stack = vec![root];
    while let Some(id) = stack.pop() {
        if let Some(info) = tree.info(id) {
            names.insert(id, info.description().to_string());
        }
        stack.extend_from_slice(tree.children(id));
    }
    names
}

async fn run(config: &EngineConfig, path: &Path, print_events: bool) -> Result<ExitCode> {
    let (workflow, mut tree, root) = load(config, path)?;
    let log = config.action_log.open()?;
    tree.set_action_log(log.clone());
    let names = descriptions(&tree, root);

    let supervisor = Supervisor::spawn(&config.engine, log);
    let mut events = supervisor.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) if print_events => match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(e) => warn!("Failed to serialize event: {}", e),
                },
                Ok(event) => {
                    if let ActionEventKind::StateChanged { old, new } = event.kind {
                        let name = names.get(&event.id).map_or("?", String::as_str);
                        println!("[{}] {}: {} -> {}", event.id, name, old, new);
                    }
                }
                Err(RecvError::Lagged(missed)) => warn!("Event output lagged, {} events dropped", missed),
                Err(RecvError::Closed) => break,
            }
        }
    });

    info!(workflow = %workflow.name, "Running workflow");
    let run_id = supervisor.run(tree, root).await?;
    let finished = tokio::select! {
        result = supervisor.wait_for(run_id) => result?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling workflow");
            supervisor.cancel().await?;
            supervisor.wait_for(run_id).await?
        }
    };
    supervisor.shutdown().await?;
    drop(supervisor);
    printer.abort();

    let root = &finished.root;
    match &root.failure {
        Some(failure) => println!("{}: {} ({})", workflow.name, root.state, failure),
        None => println!("{}: {}", workflow.name, root.state),
    }
    if let Some(ended) = root.ended_at {
        if let Some(started) = root.started_at {
            let elapsed = (ended - started).to_std().unwrap_or_default();
            println!("run time: {:.1} s", elapsed.as_secs_f64());
        }
    }

    Ok(if root.state == ActionState::Succeeded {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
