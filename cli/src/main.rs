// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Coding Swarm CLI
//!
//! The `swarm` binary sets up a shared repository, launches a fleet of coding
//! agents against it and observes them while they work.
//!
//! ## Commands
//!
//! - `swarm init` - Write a starter `swarm.yaml`
//! - `swarm launch [--dry-run]` - Bootstrap the shared repository and start workers
//! - `swarm status|dashboard` - One-shot or live view of locks, commits and workers
//! - `swarm logs [ID]` - List or tail agent session logs
//! - `swarm stop` - Signal every worker, force-terminating stragglers
//! - `swarm unlock <TASK>` - Remove a stale task lock
//!
//! `swarm worker` is the hidden entry point each launched worker runs.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use coding_swarm::commands::{
    self, InitArgs, LaunchArgs, LogsArgs, StatusArgs, StopArgs, UnlockArgs, WorkerArgs,
};
use coding_swarm::logging::init_logging;

/// Coding Swarm - many coding agents, one shared git repository
#[derive(Parser)]
#[command(name = "swarm")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(
        short,
        long,
        global = true,
        env = "SWARM_CONFIG_PATH",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "SWARM_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a starter swarm.yaml
    Init(InitArgs),

    /// Start the agent swarm
    Launch(LaunchArgs),

    /// Show running agents and their current tasks
    Status(StatusArgs),

    /// Live-refresh dashboard showing swarm activity
    Dashboard {
        /// Refresh interval in seconds
        #[arg(short, long, default_value = "10")]
        interval: u64,
    },

    /// View logs for a specific agent (or list all log files)
    Logs(LogsArgs),

    /// Stop all running swarm agents
    Stop(StopArgs),

    /// Remove a task lock from the shared repository
    Unlock(UnlockArgs),

    /// Run one worker loop (started by `launch`)
    #[command(hide = true)]
    Worker(WorkerArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Workers log into their session file instead of the console
    if !matches!(cli.command, Commands::Worker(_)) {
        init_logging(&cli.log_level)?;
    }

    match cli.command {
        Commands::Init(args) => commands::init::handle_command(args).await,
        Commands::Launch(args) => commands::launch::handle_command(args, cli.config).await,
        Commands::Status(args) => commands::status::handle_command(args, cli.config).await,
        Commands::Dashboard { interval } => commands::status::dashboard(interval, cli.config).await,
        Commands::Logs(args) => commands::logs::handle_command(args, cli.config).await,
        Commands::Stop(args) => commands::stop::handle_command(args, cli.config).await,
        Commands::Unlock(args) => commands::unlock::handle_command(args, cli.config).await,
        Commands::Worker(args) => commands::worker::handle_command(args, &cli.log_level).await,
    }
}
