// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `swarm unlock` - operator removal of a task lock
//!
//! Locks never expire on their own. Without `--force` a lock is only removed
//! when its owner is not among the running workers.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use std::path::PathBuf;

use crate::layout::{self, SwarmLauncher};
use swarm_coordination::domain::task_lock::{ReleaseOutcome, TaskLock};
use swarm_core::domain::lock::LockRecord;
use swarm_core::domain::runtime::WorkerLauncher;
use swarm_core::infrastructure::git_sync::SyncClient;
use swarm_core::infrastructure::upstream::operator_identity;

#[derive(Args, Debug)]
pub struct UnlockArgs {
    /// Task id as written in the lock file
    pub task: String,

    /// Remove the lock even if its owner is still running
    #[arg(long)]
    pub force: bool,
}

pub async fn handle_command(args: UnlockArgs, config_override: Option<PathBuf>) -> Result<()> {
    let (config, paths) = layout::load_config(config_override)?;

    let upstream = paths.upstream.clone();
    let branch = config.project.branch.clone();
    let workdir = paths.operator_dir();
    let tasks_dir = config.tasks_dir.clone();
    let attempts = config.worker.lock_attempts;
    let task = args.task.clone();

    let (lock, holder) = tokio::task::spawn_blocking(move || -> Result<(TaskLock, Option<LockRecord>)> {
        let sync = SyncClient::initialize(&upstream, &branch, &workdir, operator_identity())
            .context("Shared repository is not available")?;
        let mut lock = TaskLock::new(sync, tasks_dir, attempts);
        lock.sync_mut().refresh()?;
        // A previous unlock may have left its removal unpublished.
        lock.sync_mut().push_with_retry(attempts)?;
        let holder = lock.holder(&task)?;
        Ok((lock, holder))
    })
    .await??;

    let Some(record) = holder else {
        println!("No lock found for task '{}'", args.task);
        return Ok(());
    };

    if !args.force {
        let launcher = SwarmLauncher::from_config(&config, &paths)
            .await
            .context("Cannot determine whether the owner is running; use --force")?;
        let processes = launcher
            .list()
            .await
            .context("Cannot determine whether the owner is running; use --force")?;
        if processes.iter().any(|p| p.is_running() && p.identity.id == record.owner) {
            anyhow::bail!(
                "Task '{}' is held by running worker {}; use --force to remove it anyway",
                record.task_id,
                record.owner
            );
        }
    }

    let task = args.task.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        let mut lock = lock;
        lock.force_release(&task)
    })
    .await??;

    match outcome {
        ReleaseOutcome::Released => {
            println!(
                "{}",
                format!("✓ Removed lock '{}' (was held by {})", record.task_id, record.owner).green()
            );
            Ok(())
        }
        ReleaseOutcome::Absent => {
            println!("Lock '{}' was already removed", record.task_id);
            Ok(())
        }
        ReleaseOutcome::Deferred => anyhow::bail!(
            "Removal of '{}' could not be published; the shared branch is busy, retry shortly",
            record.task_id
        ),
    }
}
