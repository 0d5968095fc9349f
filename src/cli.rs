use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// opsrunner - template-driven operation orchestration
#[derive(Parser)]
#[command(name = "opsrunner")]
#[command(about = "Run versioned operation templates with locking, rollback, and queueing")]
#[command(version)]
pub struct Cli {
    /// Repository root holding operations/, infra/state/, and scripts/
    ///
    /// Defaults to the current directory. All template references, state
    /// files, and lock files resolve relative to this root.
    #[arg(long, global = true)]
    pub repo_root: Option<PathBuf>,

    /// Path to an engine configuration file (JSON)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute an operation template immediately
    Run {
        /// Template reference: a path under operations/, an absolute path,
        /// or a bare name like deploy_home_mcp
        template: String,

        /// Operation parameters as key=value pairs
        #[arg(short, long)]
        param: Vec<String>,

        /// List the resolved steps without executing anything
        #[arg(long)]
        dry_run: bool,
    },
    /// Operation queue management
    Queue {
        #[command(subcommand)]
        queue_command: QueueCommands,
    },
}

#[derive(Subcommand)]
pub enum QueueCommands {
    /// Add an operation to the queue
    Add {
        /// Template reference (same forms as `run`)
        template: String,

        /// Operation parameters as key=value pairs
        #[arg(short, long)]
        param: Vec<String>,

        /// Scheduling priority; higher runs first
        #[arg(long, default_value = "5")]
        priority: i64,
    },
    /// Show one queued operation
    Status {
        /// Operation id returned by `queue add`
        id: String,
    },
    /// Cancel a pending operation
    Cancel {
        /// Operation id returned by `queue add`
        id: String,
    },
    /// List queued, running, and recent operations
    List {
        /// Restrict to one status (queued, running, success, failed, cancelled)
        #[arg(short, long)]
        filter: Option<String>,
    },
    /// Show queue counters
    Stats,
    /// Start workers and process the queue until interrupted
    Process {
        /// Number of worker threads (defaults to max_concurrent)
        #[arg(short, long)]
        workers: Option<usize>,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}

/// Split `key=value` parameter arguments into pairs
pub fn parse_params(raw: &[String]) -> Result<Vec<(String, String)>, String> {
    raw.iter()
        .map(|entry| {
            entry
                .split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| format!("invalid parameter '{entry}', expected key=value"))
        })
        .collect()
}
