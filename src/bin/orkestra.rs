//! Orkestra CLI: starts the engine, submits workflows, and inspects queue
//! and scheduler state.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use orkestra_core::adapter::AdapterRegistry;
use orkestra_core::config::{AppConfig, ConfigLoader};
use orkestra_core::domain::{Priority, WorkflowDefinition};
use orkestra_core::facade::OrchestrationFacade;

#[derive(Parser)]
#[command(name = "orkestra")]
#[command(about = "Priority-queued, auto-scaling execution engine for workflow adapters")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to a JSON config file; falls back to environment overrides
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the engine and block until Ctrl-C.
    Start,

    /// Submit a workflow execution from a JSON definition file.
    Submit {
        #[arg(short, long)]
        file: PathBuf,
        #[arg(short, long, default_value = "normal")]
        priority: String,
    },

    /// Query the status of a previously submitted execution.
    Status {
        execution_id: String,
    },

    /// Manage cron-style schedules.
    #[command(subcommand)]
    Schedule(ScheduleCommands),

    /// Print current queue band occupancy.
    QueueStats,

    /// Print worker pool and scaling metrics.
    SchedulerStats,
}

#[derive(Subcommand)]
enum ScheduleCommands {
    Add {
        #[arg(short, long)]
        cron: String,
        #[arg(short, long)]
        file: PathBuf,
    },
    Remove {
        schedule_id: String,
    },
    List,
}

fn parse_priority(raw: &str) -> Priority {
    match raw.to_ascii_lowercase().as_str() {
        "low" => Priority::Low,
        "high" => Priority::High,
        "critical" => Priority::Critical,
        _ => Priority::Normal,
    }
}

fn load_workflow(path: &PathBuf) -> Result<WorkflowDefinition, String> {
    let content = std::fs::read_to_string(path).map_err(|e| format!("failed to read {}: {e}", path.display()))?;
    serde_json::from_str(&content).map_err(|e| format!("invalid workflow definition: {e}"))
}

fn load_config(path: &Option<PathBuf>) -> Result<AppConfig, String> {
    match path {
        Some(path) => ConfigLoader::load_from_file(path).map_err(|e| e.to_string()),
        None => ConfigLoader::load_from_env().map_err(|e| e.to_string()),
    }
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => std::process::ExitCode::from(0),
        Err(StartupError(msg)) => {
            eprintln!("error: {msg}");
            std::process::ExitCode::from(1)
        }
    }
}

struct StartupError(String);

impl From<String> for StartupError {
    fn from(value: String) -> Self {
        StartupError(value)
    }
}

async fn run(cli: Cli) -> Result<(), StartupError> {
    let config = load_config(&cli.config)?;
    // Reference adapters are registered by the embedding application; the
    // CLI itself only drives submission and inspection.
    let adapters = Arc::new(AdapterRegistry::new());

    match cli.command {
        Commands::Start => {
            let facade = Arc::new(OrchestrationFacade::new(config, adapters));
            facade.start();
            println!("orkestra started");
            tokio::signal::ctrl_c().await.map_err(|e| e.to_string())?;
            facade.stop(Duration::from_secs(30)).await;
            println!("orkestra stopped");
        }
        Commands::Submit { file, priority } => {
            let workflow = load_workflow(&file)?;
            let facade = Arc::new(OrchestrationFacade::new(config, adapters));
            let id = facade
                .execute_workflow(workflow, Default::default(), Some(parse_priority(&priority)), None, None)
                .await
                .map_err(|e| e.to_string())?;
            println!("{id}");
        }
        Commands::Status { execution_id } => {
            let facade = OrchestrationFacade::new(config, adapters);
            let status = facade.get_execution_status(&execution_id).map_err(|e| e.to_string())?;
            println!("{status:?}");
        }
        Commands::Schedule(ScheduleCommands::Add { cron, file }) => {
            let workflow = load_workflow(&file)?;
            let facade = OrchestrationFacade::new(config, adapters);
            let id = facade
                .schedule_workflow(cron, chrono_tz::Tz::UTC, workflow, Default::default(), None)
                .map_err(|e| e.to_string())?;
            println!("{id}");
        }
        Commands::Schedule(ScheduleCommands::Remove { schedule_id }) => {
            let facade = OrchestrationFacade::new(config, adapters);
            let removed = facade.unschedule_workflow(&schedule_id);
            println!("{removed}");
        }
        Commands::Schedule(ScheduleCommands::List) => {
            let facade = OrchestrationFacade::new(config, adapters);
            for schedule in facade.get_scheduler_stats() {
                println!("{} {} enabled={}", schedule.id, schedule.cron_expression, schedule.enabled);
            }
        }
        Commands::QueueStats => {
            let facade = OrchestrationFacade::new(config, adapters);
            let stats = facade.get_queue_stats();
            println!("{stats:?}");
        }
        Commands::SchedulerStats => {
            let facade = OrchestrationFacade::new(config, adapters);
            let workers = facade.get_workers_status();
            println!("{} workers", workers.len());
            let metrics = facade.get_execution_metrics();
            println!("{metrics:?}");
        }
    }

    Ok(())
}
