//! loadpilot CLI
//!
//! Usage:
//!   loadpilot serve --port 8080
//!   loadpilot runs list
//!   loadpilot runs show <run-id>
//!   loadpilot workflows list

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use loadpilot::config::Config;
use loadpilot::db::{Database, RunFilter};
use loadpilot::orchestrator::{load_workflows, Engine, LoggingCommitStore};
use loadpilot::stream::GlassDoor;
use loadpilot::web::{self, state::AppState};

#[derive(Parser)]
#[command(name = "loadpilot")]
#[command(about = "Multi-agent decision workflows for freight dispatch")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to a config file (defaults to .loadpilot.toml discovery)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v info, -vv debug, -vvv trace). Default is warn.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the orchestrator server
    Serve {
        /// Port to listen on (overrides config)
        #[arg(long, short)]
        port: Option<u16>,
    },
    /// Inspect workflow runs
    Runs {
        #[command(subcommand)]
        command: RunCommands,
    },
    /// Workflow definitions
    Workflows {
        #[command(subcommand)]
        command: WorkflowCommands,
    },
}

#[derive(Subcommand)]
enum RunCommands {
    /// List recent runs
    List {
        /// Filter by workflow name
        #[arg(long)]
        workflow: Option<String>,

        /// Maximum rows
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Show a run with its steps and events
    Show {
        /// Run id
        run_id: String,
    },
}

#[derive(Subcommand)]
enum WorkflowCommands {
    /// List available workflows
    List,
}

/// Initialize tracing with the given verbosity level
///
/// - 0: warn (default)
/// - 1: info (-v)
/// - 2: debug (-vv)
/// - 3+: trace (-vvv)
fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    // Allow RUST_LOG to override if set
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.to_string()));

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { port } => serve(config, port).await,
        Commands::Runs { command } => runs_command(&config, command),
        Commands::Workflows { command } => workflows_command(&config, command),
    }
}

async fn serve(config: Config, port: Option<u16>) -> Result<()> {
    let db = match &config.engine.db_path {
        Some(path) => Database::open_at(path.clone())?,
        None => Database::open()?,
    };

    let door = GlassDoor::new(db.clone());
    let engine = Engine::new(db.clone(), door.clone(), Arc::new(LoggingCommitStore));
    let agents = config.agent_set();
    let workflows = load_workflows(config.workflows.dir.as_deref())?;
    tracing::info!("Loaded {} workflows", workflows.len());

    let state = AppState::new(db, door, engine, agents, workflows);

    // Pick up runs a previous process left mid-flight
    let resumed = state
        .engine
        .resume_unfinished(&state.workflows, &state.agents)
        .await?;
    if resumed > 0 {
        tracing::info!("Re-entered {} runs left unfinished by the last shutdown", resumed);
    }

    web::serve(state, port.unwrap_or(config.server.port)).await
}

fn runs_command(config: &Config, command: RunCommands) -> Result<()> {
    let db = match &config.engine.db_path {
        Some(path) => Database::open_at(path.clone())?,
        None => Database::open()?,
    };

    match command {
        RunCommands::List { workflow, limit } => {
            let filter = RunFilter {
                workflow,
                limit: Some(limit),
                ..RunFilter::default()
            };
            let runs = db.list_runs(&filter)?;
            if runs.is_empty() {
                println!("No runs found.");
                return Ok(());
            }
            for run in runs {
                let outcome = run
                    .outcome
                    .map(|o| o.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{}  {:<16} {:<10} attempt {}  {}",
                    run.id, run.workflow, run.phase, run.attempt, outcome
                );
            }
        }
        RunCommands::Show { run_id } => {
            let run = db
                .get_run(&run_id)?
                .ok_or_else(|| anyhow::anyhow!("Run not found: {}", run_id))?;

            println!("Run {}", run.id);
            println!("  workflow:  {}", run.workflow);
            println!("  tenant:    {}", run.tenant_id);
            println!("  phase:     {}", run.phase);
            println!("  attempt:   {}/{}", run.attempt, run.max_attempts);
            if let Some(outcome) = run.outcome {
                println!("  outcome:   {}", outcome);
            }
            if let Some(reason) = &run.reason {
                println!("  reason:    {}", reason);
            }

            let steps = db.get_steps(&run_id)?;
            if !steps.is_empty() {
                println!("\nSteps:");
                for step in steps {
                    println!(
                        "  {}. {:<10} {:<9} {}",
                        step.seq,
                        step.role,
                        step.outcome,
                        step.output_summary.as_deref().unwrap_or("-")
                    );
                }
            }

            let events = db.events_after(&run_id, 0)?;
            if !events.is_empty() {
                println!("\nEvents:");
                for event in events {
                    println!("  {}. [{}] {}", event.seq, event.kind, event.message);
                }
            }
        }
    }

    Ok(())
}

fn workflows_command(config: &Config, command: WorkflowCommands) -> Result<()> {
    match command {
        WorkflowCommands::List => {
            let workflows = load_workflows(config.workflows.dir.as_deref())?;
            let mut names: Vec<_> = workflows.values().collect();
            names.sort_by(|a, b| a.name.cmp(&b.name));
            for spec in names {
                println!(
                    "{:<16} max_attempts={}  {}",
                    spec.name, spec.max_attempts, spec.description
                );
            }
        }
    }
    Ok(())
}
