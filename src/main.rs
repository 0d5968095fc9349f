//! opsrunner - Main entry point
//!
//! Dispatches CLI commands onto the orchestrator and operation queue.

mod cli;
mod config;
mod error;
mod exec;
mod lock;
mod notify;
mod orchestrator;
mod queue;
mod state;
mod step;
mod template;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::cli::{parse_params, Cli, Commands, QueueCommands};
use crate::config::EngineConfig;
use crate::orchestrator::Orchestrator;
use crate::queue::{OperationQueue, OperationStatus};
use crate::template::VarMap;

/// Initialize structured logging; RUST_LOG overrides the default level
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> ExitCode {
    init_logging();

    let cli = Cli::parse_args();

    let config = match load_config(&cli) {
        Ok(c) => c,
        Err(e) => {
            error!("configuration error: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Commands::Run {
            template,
            param,
            dry_run,
        } => run_operation(config, &template, &param, dry_run),
        Commands::Queue { queue_command } => run_queue_command(config, queue_command),
    }
}

/// Resolve engine configuration from --config, falling back to defaults
/// rooted at --repo-root (or the current directory)
fn load_config(cli: &Cli) -> anyhow::Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load_from_file(path)?,
        None => {
            let root = cli
                .repo_root
                .clone()
                .unwrap_or_else(|| PathBuf::from("."));
            EngineConfig::new(root)
        }
    };

    // An explicit --repo-root wins over the file's value
    if let Some(root) = &cli.repo_root {
        config.repo_root = root.clone();
    }

    config.validate()?;
    Ok(config)
}

fn collect_params(raw: &[String]) -> Result<VarMap, ExitCode> {
    match parse_params(raw) {
        Ok(pairs) => Ok(pairs
            .into_iter()
            .map(|(k, v)| (k, serde_json::Value::String(v)))
            .collect()),
        Err(e) => {
            error!("{e}");
            Err(ExitCode::FAILURE)
        }
    }
}

fn run_operation(
    config: EngineConfig,
    template: &str,
    raw_params: &[String],
    dry_run: bool,
) -> ExitCode {
    let params = match collect_params(raw_params) {
        Ok(p) => p,
        Err(code) => return code,
    };

    let orchestrator = Orchestrator::new(config);
    let result = orchestrator.execute(template, &params, dry_run);

    match serde_json::to_string_pretty(&result) {
        Ok(rendered) => println!("{rendered}"),
        Err(e) => error!("failed to render result: {e}"),
    }

    if result.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn run_queue_command(config: EngineConfig, command: QueueCommands) -> ExitCode {
    let queue = OperationQueue::new(config);

    match command {
        QueueCommands::Add {
            template,
            param,
            priority,
        } => {
            let params = match collect_params(&param) {
                Ok(p) => p,
                Err(code) => return code,
            };
            let id = queue.enqueue(&template, params, priority);
            println!("{id}");
            ExitCode::SUCCESS
        }
        QueueCommands::Status { id } => match queue.status(&id) {
            Some(op) => {
                print_json(&op);
                ExitCode::SUCCESS
            }
            None => {
                error!(id = %id, "operation not found");
                ExitCode::FAILURE
            }
        },
        QueueCommands::Cancel { id } => {
            if queue.cancel(&id) {
                info!(id = %id, "cancelled");
                ExitCode::SUCCESS
            } else {
                error!(id = %id, "operation is not pending, cannot cancel");
                ExitCode::FAILURE
            }
        }
        QueueCommands::List { filter } => {
            let filter = match filter.as_deref().map(str::parse::<OperationStatus>) {
                Some(Ok(status)) => Some(status),
                Some(Err(_)) => {
                    error!("invalid status filter, expected one of: queued, running, success, failed, cancelled");
                    return ExitCode::FAILURE;
                }
                None => None,
            };
            print_json(&queue.list(filter));
            ExitCode::SUCCESS
        }
        QueueCommands::Stats => {
            print_json(&queue.stats());
            ExitCode::SUCCESS
        }
        QueueCommands::Process { workers } => run_queue_loop(&queue, workers),
    }
}

/// Run workers until interrupted, reporting stats periodically
fn run_queue_loop(queue: &OperationQueue, workers: Option<usize>) -> ExitCode {
    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = Arc::clone(&interrupted);
        if let Err(e) = ctrlc::set_handler(move || {
            interrupted.store(true, Ordering::SeqCst);
        }) {
            error!("failed to install interrupt handler: {e}");
            return ExitCode::FAILURE;
        }
    }

    queue.start_workers(workers);
    info!("processing queue, press Ctrl-C to stop");

    while !interrupted.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_secs(5));
        let stats = queue.stats();
        info!(
            pending = stats.pending,
            running = stats.running,
            succeeded = stats.succeeded,
            failed = stats.failed,
            "queue status"
        );
    }

    info!("interrupt received, stopping workers");
    queue.stop_workers();
    ExitCode::SUCCESS
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(rendered) => println!("{rendered}"),
        Err(e) => error!("failed to render output: {e}"),
    }
}
