// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `swarm launch` - bootstrap the shared repository and start workers
//!
//! Setup is idempotent: an existing shared repository is reused as is and
//! only the missing worker slots are started.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use std::path::PathBuf;
use tracing::{info, warn};

use crate::layout::{self, SwarmPaths};
use swarm_coordination::application::{plan_workers, LaunchReport};
use swarm_core::domain::runtime::{WorkerLauncher, WorkerSpec};
use swarm_core::domain::swarm_config::{RuntimeKind, SwarmConfig};
use swarm_core::infrastructure::upstream::{init_upstream_repo, seed_project_files};

#[derive(Args, Debug)]
pub struct LaunchArgs {
    /// Print what would be done without starting workers
    #[arg(long)]
    pub dry_run: bool,
}

pub async fn handle_command(args: LaunchArgs, config_override: Option<PathBuf>) -> Result<()> {
    let (config, paths) = layout::load_config(config_override)?;

    if args.dry_run {
        return dry_run(&config, &paths).await;
    }

    prepare_upstream(&config, &paths).await?;
    std::fs::create_dir_all(&paths.logs_dir)
        .with_context(|| format!("Failed to create {:?}", paths.logs_dir))?;

    let fleet = layout::fleet(&config, &paths).await?;
    let report = fleet
        .launch(&config, false)
        .await
        .context("Failed to query the worker runtime")?;
    print_report(&report);

    if !report.failed.is_empty() {
        anyhow::bail!("{} worker(s) failed to start", report.failed.len());
    }
    println!();
    println!("  Monitor with: swarm dashboard");
    println!("  Stop with:    swarm stop");
    Ok(())
}

/// Create the shared repository if needed. A fresh repository without a
/// `repo_url` is seeded from the local project directory.
async fn prepare_upstream(config: &SwarmConfig, paths: &SwarmPaths) -> Result<()> {
    let upstream = paths.upstream.clone();
    let repo_url = Some(config.project.repo_url.trim().to_string()).filter(|u| !u.is_empty());
    let branch = config.project.branch.clone();
    let tasks_dir = config.tasks_dir.clone();
    let progress_file = config.progress_file.clone();
    let project_dir = paths.project_dir(config);
    let scratch = paths.seed_dir();

    let created = tokio::task::spawn_blocking(move || -> Result<bool> {
        let created = init_upstream_repo(
            &upstream,
            repo_url.as_deref(),
            &branch,
            &tasks_dir,
            &progress_file,
        )
        .with_context(|| format!("Failed to initialize shared repository at {:?}", upstream))?;

        if created && repo_url.is_none() {
            match seed_project_files(&upstream, &branch, &project_dir, &scratch)
                .with_context(|| format!("Failed to seed project files from {:?}", project_dir))?
            {
                Some(commit) => info!(%commit, "Seeded shared repository from project directory"),
                None => info!("Project directory added nothing to the shared repository"),
            }
        }
        Ok(created)
    })
    .await??;

    if created {
        println!(
            "{}",
            format!("✓ Shared repository ready: {}", paths.upstream.display()).green()
        );
    } else {
        println!("  Using existing shared repository: {}", paths.upstream.display());
    }
    Ok(())
}

async fn dry_run(config: &SwarmConfig, paths: &SwarmPaths) -> Result<()> {
    // The runtime may not be reachable yet; plan against an empty table then.
    let running = match layout::SwarmLauncher::from_config(config, paths).await {
        Ok(launcher) => launcher.list().await.unwrap_or_else(|e| {
            warn!("Cannot list running workers: {}", e);
            Vec::new()
        }),
        Err(e) => {
            warn!("Runtime not reachable: {:#}", e);
            Vec::new()
        }
    };
    let planned = plan_workers(&paths.fleet_layout(config), config, &running);

    println!("{}", "Dry-run mode - would launch:".bold());
    println!();
    for spec in &planned {
        print_spec(spec);
    }
    println!();
    println!("  Total:    {} agent(s)", planned.len());
    let already = running.iter().filter(|p| p.is_running()).count();
    if already > 0 {
        println!("  Running:  {} agent(s) left untouched", already);
    }
    match config.runtime {
        RuntimeKind::Docker => println!("  Runtime:  docker ({})", config.docker.image),
        RuntimeKind::Process => println!("  Runtime:  local processes"),
    }
    println!("  Upstream: {}", paths.upstream.display());
    Ok(())
}

fn print_spec(spec: &WorkerSpec) {
    let prompt = spec
        .prompt_file
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "-".to_string());
    println!(
        "   {}  provider={}  model={}  prompt={}",
        spec.identity.id.bold(),
        spec.identity.provider,
        spec.identity.model,
        prompt
    );
}

fn print_report(report: &LaunchReport) {
    if report.already_running > 0 {
        println!("  {} worker(s) already running", report.already_running);
    }
    for process in &report.started {
        println!(
            "{}",
            format!(
                "✓ Started {} ({}/{}) [{}]",
                process.identity.id,
                process.identity.provider,
                process.identity.model,
                process.instance.as_str()
            )
            .green()
        );
    }
    for failure in &report.failed {
        println!(
            "{}",
            format!("✗ {} failed to start: {}", failure.identity.id, failure.error).red()
        );
    }
    if report.planned.is_empty() {
        println!("  Nothing to start.");
    }
}
