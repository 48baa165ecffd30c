// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `swarm stop` - signal every worker, then force-terminate stragglers

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use std::path::PathBuf;
use std::time::Duration;

use crate::layout;

#[derive(Args, Debug)]
pub struct StopArgs {
    /// Seconds to wait before force-terminating (default: worker.stop_grace_seconds)
    #[arg(long)]
    pub grace: Option<u64>,
}

pub async fn handle_command(args: StopArgs, config_override: Option<PathBuf>) -> Result<()> {
    let (config, paths) = layout::load_config(config_override)?;
    let fleet = layout::fleet(&config, &paths).await?;
    let grace = Duration::from_secs(args.grace.unwrap_or(config.worker.stop_grace_seconds));

    let running = fleet
        .process_table()
        .await
        .context("Failed to list workers")?
        .iter()
        .filter(|p| p.is_running())
        .count();
    if running == 0 {
        println!("No running swarm workers found.");
    } else {
        println!(
            "Stopping {} worker(s), grace period {}s ...",
            running,
            grace.as_secs()
        );
    }

    let report = fleet.stop(grace).await.context("Failed to stop workers")?;
    for id in &report.stopped {
        println!("   {} {}", "stopped".green(), id);
    }
    for id in &report.killed {
        println!("   {} {}", "killed ".yellow(), id);
    }
    for failure in &report.failed {
        println!("   {} {}: {}", "failed ".red(), failure.identity.id, failure.error);
    }

    if !report.failed.is_empty() {
        anyhow::bail!("{} worker(s) could not be terminated", report.failed.len());
    }
    if running > 0 {
        println!("{}", "✓ Done.".green());
    }
    Ok(())
}
