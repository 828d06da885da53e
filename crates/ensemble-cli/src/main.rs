mod simulate;

use anyhow::Context;
use clap::{Parser, Subcommand};
use ensemble_orchestrator::{
    DependencyGraph, Orchestrator, OrchestratorConfig, Plan, SchedulerSnapshot, Task,
};
use serde::Deserialize;
use simulate::{simulated_registry, SimulationConfig};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ensemble", about = "Ensemble: budget-aware multi-agent task orchestration")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "ensemble.toml")]
    config: PathBuf,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a plan and print its execution order
    Plan {
        /// Plan file (JSON task array or {tasks, features, constraints})
        plan: PathBuf,
    },
    /// Run a plan against simulated workers and print the summary
    Run {
        /// Plan file (JSON task array or {tasks, features, constraints})
        #[arg(required_unless_present = "resume", conflicts_with = "resume")]
        plan: Option<PathBuf>,
        /// Total budget (overrides config)
        #[arg(long)]
        budget: Option<f64>,
        /// Concurrency ceiling (overrides config)
        #[arg(long)]
        max_concurrent: Option<usize>,
        /// Write a snapshot here after every reconcile step
        #[arg(long)]
        snapshot: Option<PathBuf>,
        /// Resume from a snapshot instead of planning from scratch
        #[arg(long)]
        resume: Option<PathBuf>,
    },
}

#[derive(Deserialize, Default)]
struct EnsembleConfig {
    #[serde(default)]
    orchestrator: OrchestratorConfig,
    #[serde(default)]
    simulation: SimulationConfig,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PlanFile {
    Tasks(Vec<Task>),
    Plan(Plan),
}

async fn load_config(path: &Path) -> anyhow::Result<EnsembleConfig> {
    let config_str = match tokio::fs::read_to_string(path).await {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "No config file, using defaults");
            return Ok(EnsembleConfig::default());
        }
        Err(e) => {
            return Err(anyhow::anyhow!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        }
    };
    let config: EnsembleConfig = toml::from_str(&config_str)
        .with_context(|| format!("Invalid config file '{}'", path.display()))?;
    config.orchestrator.validate()?;
    Ok(config)
}

async fn load_plan(path: &Path) -> anyhow::Result<Plan> {
    let json = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read plan file '{}'", path.display()))?;
    let plan = match serde_json::from_str::<PlanFile>(&json)
        .with_context(|| format!("Invalid plan file '{}'", path.display()))?
    {
        PlanFile::Tasks(tasks) => Plan::from_tasks(tasks),
        PlanFile::Plan(plan) => plan,
    };
    Ok(plan)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    let config = load_config(&cli.config).await?;

    match cli.command {
        Commands::Plan { plan } => {
            let plan = load_plan(&plan).await?;
            let graph = DependencyGraph::build(&plan)?;
            for (position, id) in graph.execution_order().into_iter().enumerate() {
                let deps = graph.dependencies_of(id);
                if deps.is_empty() {
                    println!("{:>4}. {id}", position + 1);
                } else {
                    println!("{:>4}. {id}  <- {}", position + 1, deps.join(", "));
                }
            }
        }
        Commands::Run {
            plan,
            budget,
            max_concurrent,
            snapshot,
            resume,
        } => {
            let mut orchestrator_config = config.orchestrator;
            if let Some(total) = budget {
                orchestrator_config = orchestrator_config.with_budget(total);
            }
            if let Some(n) = max_concurrent {
                orchestrator_config = orchestrator_config.with_max_concurrent_tasks(n);
            }

            let registry = simulated_registry(&config.simulation);
            let mut orchestrator = Orchestrator::new(orchestrator_config, registry)?;

            if let Some(path) = snapshot {
                orchestrator = orchestrator.with_checkpoint_hook(move |snap| {
                    let written = snap
                        .to_json()
                        .map_err(anyhow::Error::from)
                        .and_then(|json| std::fs::write(&path, json).map_err(Into::into));
                    if let Err(e) = written {
                        warn!(path = %path.display(), error = %e, "Failed to write snapshot");
                    }
                });
            }

            match (resume, plan) {
                (Some(path), _) => {
                    let snap = SchedulerSnapshot::load(&path)
                        .await
                        .with_context(|| format!("Failed to load snapshot '{}'", path.display()))?;
                    orchestrator.restore(&snap)?;
                    info!(path = %path.display(), "Resuming from snapshot");
                }
                (None, Some(plan)) => {
                    let plan = load_plan(&plan).await?;
                    orchestrator.load_plan(&plan)?;
                }
                (None, None) => anyhow::bail!("either a plan file or --resume is required"),
            }

            let summary = orchestrator.run().await;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            if !summary.success {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
