//! CLI entry point for daq-orchestrator
//!
//! Provides command-line interface for:
//! - Checking a wiring file (activation order, isolated modules and tasks)
//! - Dry-running a wiring file against mock modules and task bodies
//!
//! # Usage
//!
//! Check a wiring file:
//! ```bash
//! daq-orchestrator check config/confocal.toml
//! ```
//!
//! Dry-run it, starting two tasks and stopping after five seconds:
//! ```bash
//! daq-orchestrator run config/confocal.toml --task scan --task refocus --duration-ms 5000
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use daq_orchestrator::config::Settings;
use daq_orchestrator::lifecycle::mock::MockFactory;
use daq_orchestrator::lifecycle::ModuleManager;
use daq_orchestrator::logging;
use daq_orchestrator::tasks::TaskScheduler;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "daq-orchestrator")]
#[command(about = "Dependency-ordered module lifecycle and task scheduling", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a wiring file and print the resolved orders
    Check {
        /// Path to the TOML wiring file
        config: PathBuf,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,

        /// Also print the effective configuration, environment overrides applied
        #[arg(long)]
        print_config: bool,
    },

    /// Bring a wiring file up against mock modules and task bodies
    Run {
        /// Path to the TOML wiring file
        config: PathBuf,

        /// Task to start once the startup modules are active (repeatable)
        #[arg(long = "task")]
        tasks: Vec<String>,

        /// Shut down after this many milliseconds instead of waiting for Ctrl+C
        #[arg(long)]
        duration_ms: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Check {
            config,
            json,
            print_config,
        } => check(config, json, print_config),
        Commands::Run {
            config,
            tasks,
            duration_ms,
        } => run(config, tasks, duration_ms).await,
    }
}

fn load(path: &PathBuf) -> Result<Settings> {
    let settings = Settings::load_from(path)
        .with_context(|| format!("failed to load wiring file {}", path.display()))?;
    settings.validate()?;
    Ok(settings)
}

fn check(path: PathBuf, json: bool, print_config: bool) -> Result<()> {
    let settings = load(&path)?;
    if print_config {
        println!("{}", settings.to_toml()?);
    }
    let factory = Arc::new(MockFactory::new());
    let manager = ModuleManager::from_settings(&settings, factory.clone());
    let scheduler = TaskScheduler::new(manager.clone(), factory, settings.scheduler.clone());

    let module_errors = manager.validation_errors();
    let task_errors = scheduler.graph().invalid();

    if json {
        let report = serde_json::json!({
            "activation_order": manager.activation_order(),
            "task_order": scheduler.graph().order(),
            "invalid_modules": module_errors
                .iter()
                .map(|(name, e)| (name.clone(), e.to_string()))
                .collect::<std::collections::BTreeMap<_, _>>(),
            "invalid_tasks": task_errors
                .iter()
                .map(|(name, e)| (name.clone(), e.to_string()))
                .collect::<std::collections::BTreeMap<_, _>>(),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Wiring: {}", path.display());
        println!("Activation order: {}", manager.activation_order().join(" -> "));
        println!("Task order: {}", scheduler.graph().order().join(", "));
        for (name, e) in &module_errors {
            println!("  module {name}: {e}");
        }
        for (name, e) in task_errors {
            println!("  task {name}: {e}");
        }
    }

    if module_errors.is_empty() && task_errors.is_empty() {
        Ok(())
    } else {
        anyhow::bail!(
            "{} module(s) and {} task(s) are isolated",
            module_errors.len(),
            task_errors.len()
        )
    }
}

async fn run(path: PathBuf, tasks: Vec<String>, duration_ms: Option<u64>) -> Result<()> {
    let settings = load(&path)?;
    logging::init_from_settings(&settings)?;
    info!(app = %settings.application.name, wiring = %path.display(), "Starting dry run");

    let factory = Arc::new(MockFactory::new());
    let manager = ModuleManager::from_settings(&settings, factory.clone());
    for (name, e) in manager.validation_errors() {
        warn!(module = %name, error = %e, "Module isolated");
    }

    for (name, result) in manager.activate_startup(&settings.lifecycle.startup).await {
        if let Err(e) = result {
            error!(module = %name, error = %e, "Startup activation failed");
        }
    }

    let scheduler = TaskScheduler::new(manager.clone(), factory, settings.scheduler.clone());
    scheduler.begin_run();
    for task in &tasks {
        if let Err(e) = scheduler.start(task).await {
            error!(task = %task, error = %e, "Task did not start");
        }
    }

    match duration_ms {
        Some(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
        None => {
            info!("Running - press Ctrl+C to stop");
            tokio::signal::ctrl_c().await?;
        }
    }

    let status = serde_json::json!({
        "modules": manager.snapshot(),
        "tasks": scheduler.snapshot(),
    });
    println!("{}", serde_json::to_string_pretty(&status)?);

    scheduler.shutdown().await;
    for (name, e) in manager.shutdown().await {
        warn!(module = %name, error = %e, "Module did not shut down cleanly");
    }
    info!("Dry run finished");
    Ok(())
}
