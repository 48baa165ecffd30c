// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `swarm status` and `swarm dashboard`

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::layout;
use swarm_core::domain::snapshot::SwarmSnapshot;

const MAX_COMMITS: usize = 10;
const MAX_LOGS: usize = 10;
const ORPHAN_MARKER: &str = "[owner not running]";

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Print the snapshot as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn handle_command(args: StatusArgs, config_override: Option<PathBuf>) -> Result<()> {
    let (config, paths) = layout::load_config(config_override)?;
    let aggregator = layout::aggregator(&config, &paths).await?;
    let snapshot = aggregator.snapshot().await.context("Failed to read swarm state")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        print_snapshot(&snapshot);
    }
    Ok(())
}

pub async fn dashboard(interval: u64, config_override: Option<PathBuf>) -> Result<()> {
    let (config, paths) = layout::load_config(config_override)?;
    let aggregator = layout::aggregator(&config, &paths).await?;

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        layout::shutdown_signal().await;
        trigger.cancel();
    });

    println!("Press Ctrl+C to exit.");
    aggregator
        .watch(Duration::from_secs(interval.max(1)), token, |snapshot| {
            // Clear screen, cursor home
            print!("\x1B[2J\x1B[H");
            print_snapshot(snapshot);
        })
        .await;
    println!("\nExiting dashboard.");
    Ok(())
}

fn print_snapshot(snapshot: &SwarmSnapshot) {
    for line in snapshot.render(MAX_COMMITS, MAX_LOGS).lines() {
        println!("{}", colorize(line));
    }
    let orphaned = snapshot.orphaned_locks().count();
    if orphaned > 0 {
        println!(
            "{}",
            format!(
                "{} lock(s) belong to workers that are not running; clear with `swarm unlock <TASK>`",
                orphaned
            )
            .yellow()
        );
    }
}

fn colorize(line: &str) -> String {
    if line.contains(ORPHAN_MARKER) {
        line.yellow().to_string()
    } else if line.starts_with("  CODING SWARM") || (!line.starts_with(' ') && line.ends_with(':')) {
        line.bold().to_string()
    } else if line.contains(" running ") {
        line.green().to_string()
    } else {
        line.to_string()
    }
}
