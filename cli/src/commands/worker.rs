// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `swarm worker` - one worker loop, started by `swarm launch`
//!
//! Every argument falls back to the `SWARM_*` environment contract set by the
//! launchers, so the same command line works for local processes and
//! containers.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Args;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::layout::shutdown_signal;
use crate::logging::init_file_logging;
use swarm_coordination::application::{WorkerLoop, WorkerLoopConfig};
use swarm_coordination::domain::task_lock::TaskLock;
use swarm_core::domain::identity::{Provider, WorkerIdentity};
use swarm_core::domain::runtime::env;
use swarm_core::infrastructure::git_sync::SyncClient;
use swarm_core::infrastructure::work_generator::{session_log_path, CommandWorkGenerator};

#[derive(Args, Debug, Clone)]
pub struct WorkerArgs {
    #[arg(long, env = env::AGENT_ID)]
    pub id: String,

    #[arg(long, env = env::AGENT_ROLE, default_value = "generalist")]
    pub role: String,

    #[arg(long, env = env::AGENT_PROVIDER, default_value = "anthropic")]
    pub provider: Provider,

    /// Defaults to the provider's model
    #[arg(long, env = env::AGENT_MODEL)]
    pub model: Option<String>,

    /// Role instructions, re-read every cycle
    #[arg(long, env = env::PROMPT_FILE)]
    pub prompt_file: Option<PathBuf>,

    #[arg(long, env = env::BRANCH, default_value = "main")]
    pub branch: String,

    #[arg(long, env = env::TEST_COMMAND)]
    pub test_command: Option<String>,

    #[arg(long, env = env::UPSTREAM)]
    pub upstream: PathBuf,

    #[arg(long, env = env::WORKSPACE)]
    pub workspace: PathBuf,

    #[arg(long, env = env::LOGS_DIR)]
    pub logs_dir: PathBuf,

    #[arg(long, env = env::AGENT_COMMAND)]
    pub agent_command: String,

    #[arg(long, env = env::TASKS_DIR, default_value = "current_tasks")]
    pub tasks_dir: String,

    #[arg(long, env = env::PROGRESS_FILE, default_value = "PROGRESS.md")]
    pub progress_file: String,

    #[arg(long, env = env::IDLE_SECONDS, default_value = "10")]
    pub idle_seconds: u64,

    #[arg(long, env = env::PUSH_ATTEMPTS, default_value = "5")]
    pub push_attempts: u32,

    #[arg(long, env = env::LOCK_ATTEMPTS, default_value = "3")]
    pub lock_attempts: u32,

    #[arg(long, env = env::HISTORY_DEPTH, default_value = "20")]
    pub history_depth: usize,

    /// Stop after this many cycles
    #[arg(long)]
    pub max_cycles: Option<u64>,

    /// Serve Prometheus metrics on this address
    #[arg(long, env = "SWARM_METRICS_ADDR")]
    pub metrics_addr: Option<SocketAddr>,
}

impl WorkerArgs {
    pub fn identity(&self) -> WorkerIdentity {
        let model = self
            .model
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| self.provider.default_model());
        WorkerIdentity::new(self.id.trim(), self.role.trim(), self.provider, model)
    }

    pub fn loop_config(&self) -> WorkerLoopConfig {
        WorkerLoopConfig {
            branch: self.branch.clone(),
            tasks_dir: PathBuf::from(&self.tasks_dir),
            progress_file: PathBuf::from(&self.progress_file),
            prompt_file: self.prompt_file.clone(),
            test_command: self.test_command.clone().filter(|c| !c.trim().is_empty()),
            idle: Duration::from_secs(self.idle_seconds),
            push_attempts: self.push_attempts.max(1),
            history_depth: self.history_depth,
            max_cycles: self.max_cycles,
        }
    }
}

pub async fn handle_command(args: WorkerArgs, log_level: &str) -> Result<()> {
    let identity = args.identity();
    let session_log = session_log_path(&args.logs_dir, &identity.id, Utc::now());
    init_file_logging(log_level, &session_log)?;
    info!(worker = %identity, workspace = ?args.workspace, "Worker starting");

    if let Some(addr) = args.metrics_addr {
        match PrometheusBuilder::new().with_http_listener(addr).install() {
            Ok(()) => info!(%addr, "Serving metrics"),
            Err(e) => warn!(%addr, "Metrics listener not started: {}", e),
        }
    }

    let upstream = args.upstream.clone();
    let branch = args.branch.clone();
    let workspace = args.workspace.clone();
    let sync_identity = identity.clone();
    let sync = tokio::task::spawn_blocking(move || {
        SyncClient::initialize(&upstream, &branch, &workspace, sync_identity)
    })
    .await?
    .map_err(|e| {
        error!("Cannot open shared repository: {}", e);
        e
    })
    .context("Worker setup failed")?;

    let lock = TaskLock::new(sync, &args.tasks_dir, args.lock_attempts.max(1));
    let generator = CommandWorkGenerator::new(&args.agent_command, session_log)
        .with_layout(&args.tasks_dir, &args.progress_file);

    let mut worker = WorkerLoop::new(lock, Arc::new(generator), args.loop_config());
    let token = worker.shutdown_token();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown requested");
        token.cancel();
    });

    let cycles = worker.run().await?;
    info!(worker = %identity.id, cycles, "Worker exited");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        worker: WorkerArgs,
    }

    #[test]
    fn test_flags_build_identity_and_config() {
        let harness = Harness::try_parse_from([
            "swarm",
            "--id",
            "reviewer-2",
            "--role",
            "reviewer",
            "--provider",
            "gemini",
            "--upstream",
            "/srv/upstream.git",
            "--workspace",
            "/srv/ws/reviewer-2",
            "--logs-dir",
            "/srv/logs",
            "--agent-command",
            "gemini -p",
            "--test-command",
            "",
            "--max-cycles",
            "2",
            "--lock-attempts",
            "6",
        ])
        .unwrap();

        let identity = harness.worker.identity();
        assert_eq!(identity.id, "reviewer-2");
        assert_eq!(identity.provider, Provider::Gemini);
        assert_eq!(identity.model, "gemini-2.5-pro");

        let config = harness.worker.loop_config();
        assert_eq!(config.test_command, None);
        assert_eq!(config.max_cycles, Some(2));
        assert_eq!(config.tasks_dir, PathBuf::from("current_tasks"));
        assert!(harness.worker.metrics_addr.is_none());
        assert_eq!(harness.worker.lock_attempts, 6);
    }
}
