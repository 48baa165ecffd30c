// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Fleet Manager
//!
//! Expands the configured agent roles into worker identities and drives a
//! [`WorkerLauncher`] to start, inspect and stop them. Workers are isolated:
//! one failing to start does not prevent its siblings from starting.

use futures::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use swarm_core::domain::identity::WorkerIdentity;
use swarm_core::domain::runtime::{LaunchError, WorkerLauncher, WorkerProcess, WorkerSpec};
use swarm_core::domain::swarm_config::SwarmConfig;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum FleetError {
    #[error(transparent)]
    Launcher(#[from] LaunchError),
}

/// Host-side locations every worker spec is derived from.
#[derive(Debug, Clone)]
pub struct FleetLayout {
    /// Directory relative paths in the configuration resolve against.
    pub base_dir: PathBuf,
    pub upstream: PathBuf,
    pub logs_dir: PathBuf,
    /// Parent of the per-worker working copies.
    pub workspaces_dir: PathBuf,
    /// Passed to every worker (API keys, user variables).
    pub extra_env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LaunchFailure {
    pub identity: WorkerIdentity,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LaunchReport {
    pub dry_run: bool,
    pub planned: Vec<WorkerSpec>,
    pub started: Vec<WorkerProcess>,
    pub failed: Vec<LaunchFailure>,
    /// Workers that were already running and left alone.
    pub already_running: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StopReport {
    /// Exited within the grace period.
    pub stopped: Vec<String>,
    /// Force-terminated after the grace period.
    pub killed: Vec<String>,
    pub failed: Vec<LaunchFailure>,
}

pub struct FleetManager<L: WorkerLauncher> {
    launcher: Arc<L>,
    layout: FleetLayout,
}

impl<L: WorkerLauncher> FleetManager<L> {
    pub fn new(launcher: Arc<L>, layout: FleetLayout) -> Self {
        Self { launcher, layout }
    }

    pub fn launcher(&self) -> &Arc<L> {
        &self.launcher
    }

    /// Specs for every configured worker slot; see [`plan_workers`].
    pub fn plan(&self, config: &SwarmConfig, running: &[WorkerProcess]) -> Vec<WorkerSpec> {
        plan_workers(&self.layout, config, running)
    }

    /// Start every configured worker. With `dry_run`, only plan.
    pub async fn launch(&self, config: &SwarmConfig, dry_run: bool) -> Result<LaunchReport, FleetError> {
        let existing = self.launcher.list().await?;
        let already_running = existing.iter().filter(|p| p.is_running()).count();
        let planned = self.plan(config, &existing);

        if dry_run {
            return Ok(LaunchReport {
                dry_run,
                planned,
                already_running,
                ..Default::default()
            });
        }

        info!(
            workers = planned.len(),
            runtime = self.launcher.kind(),
            "Launching swarm workers"
        );
        let results = join_all(planned.iter().map(|spec| self.launcher.start(spec))).await;

        let mut report = LaunchReport {
            dry_run,
            already_running,
            ..Default::default()
        };
        for (spec, result) in planned.iter().zip(results) {
            match result {
                Ok(process) => {
                    metrics::counter!("swarm_workers_started_total").increment(1);
                    report.started.push(process);
                }
                Err(e) => {
                    warn!(worker = %spec.identity.id, "Failed to start worker: {}", e);
                    report.failed.push(LaunchFailure {
                        identity: spec.identity.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }
        report.planned = planned;
        Ok(report)
    }

    /// Ask every worker to stop, force-terminate those still running after
    /// `grace`, and drop all bookkeeping.
    pub async fn stop(&self, grace: Duration) -> Result<StopReport, FleetError> {
        let workers = self.launcher.list().await?;
        let mut report = StopReport::default();

        let running: Vec<&WorkerProcess> = workers.iter().filter(|p| p.is_running()).collect();
        let signals = join_all(running.iter().map(|w| self.launcher.signal(w))).await;
        for (worker, result) in running.iter().zip(signals) {
            if let Err(e) = result {
                warn!(worker = %worker.identity.id, "Failed to signal worker: {}", e);
            }
        }

        let deadline = Instant::now() + grace;
        let mut pending: Vec<&WorkerProcess> = running;
        loop {
            let mut still = Vec::new();
            for worker in pending {
                // An instance that vanished counts as stopped.
                if self.launcher.is_running(worker).await.unwrap_or(false) {
                    still.push(worker);
                } else {
                    report.stopped.push(worker.identity.id.clone());
                }
            }
            pending = still;
            if pending.is_empty() || Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }

        for worker in pending {
            match self.launcher.kill(worker).await {
                Ok(()) => report.killed.push(worker.identity.id.clone()),
                Err(e) => report.failed.push(LaunchFailure {
                    identity: worker.identity.clone(),
                    error: e.to_string(),
                }),
            }
        }

        let reaps = join_all(workers.iter().map(|w| self.launcher.reap(w))).await;
        for (worker, result) in workers.iter().zip(reaps) {
            if let Err(e) = result {
                warn!(worker = %worker.identity.id, "Failed to clean up worker: {}", e);
            }
        }

        info!(
            stopped = report.stopped.len(),
            killed = report.killed.len(),
            "Swarm stopped"
        );
        Ok(report)
    }

    /// Current process table, sorted by worker id.
    pub async fn process_table(&self) -> Result<Vec<WorkerProcess>, FleetError> {
        Ok(self.launcher.list().await?)
    }
}

/// Specs for every configured worker slot, giving each role instance the
/// lowest index not taken by a running worker.
pub fn plan_workers(layout: &FleetLayout, config: &SwarmConfig, running: &[WorkerProcess]) -> Vec<WorkerSpec> {
    let taken: HashSet<&str> = running
        .iter()
        .filter(|p| p.is_running())
        .map(|p| p.identity.id.as_str())
        .collect();
    let mut assigned: Vec<String> = Vec::new();
    let mut specs = Vec::with_capacity(config.total_workers());

    for agent in &config.agents {
        let mut index = 0;
        for _ in 0..agent.count {
            let identity = loop {
                let candidate = WorkerIdentity::for_slot(&agent.role, index, agent.provider, agent.resolved_model());
                index += 1;
                if !taken.contains(candidate.id.as_str()) && !assigned.contains(&candidate.id) {
                    break candidate;
                }
            };
            assigned.push(identity.id.clone());

            let agent_command = if agent.extra_args.trim().is_empty() {
                config.worker.agent_command.clone()
            } else {
                format!("{} {}", config.worker.agent_command, agent.extra_args.trim())
            };
            let prompt = layout.base_dir.join(agent.resolved_prompt());

            specs.push(WorkerSpec {
                workspace: layout.workspaces_dir.join(&identity.id),
                identity,
                upstream: layout.upstream.clone(),
                branch: config.project.branch.clone(),
                logs_dir: layout.logs_dir.clone(),
                prompt_file: Some(prompt),
                test_command: config.test_command().map(str::to_string),
                agent_command,
                tasks_dir: config.tasks_dir.clone(),
                progress_file: config.progress_file.clone(),
                idle_seconds: config.worker.idle_seconds,
                push_attempts: config.worker.push_attempts,
                lock_attempts: config.worker.lock_attempts,
                history_depth: config.worker.history_depth,
                resources: config.resources.clone(),
                extra_env: layout.extra_env.clone(),
            });
        }
    }
    specs
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use swarm_core::domain::runtime::InstanceId;
    use tokio::sync::Mutex;

    /// In-memory launcher. Workers listed in `fail_ids` fail to start; workers
    /// in `stubborn_ids` ignore the graceful signal.
    #[derive(Default)]
    struct MockLauncher {
        table: Arc<Mutex<Vec<WorkerProcess>>>,
        fail_ids: Vec<String>,
        stubborn_ids: Vec<String>,
        signals: Arc<Mutex<Vec<String>>>,
        kills: Arc<Mutex<Vec<String>>>,
    }

    impl MockLauncher {
        async fn set_state(&self, id: &str, state: &str) {
            for p in self.table.lock().await.iter_mut() {
                if p.identity.id == id {
                    p.state = state.to_string();
                }
            }
        }
    }

    #[async_trait]
    impl WorkerLauncher for MockLauncher {
        fn kind(&self) -> &'static str {
            "mock"
        }

        async fn start(&self, spec: &WorkerSpec) -> Result<WorkerProcess, LaunchError> {
            if self.fail_ids.contains(&spec.identity.id) {
                return Err(LaunchError::SpawnFailed("boom".to_string()));
            }
            let process = WorkerProcess {
                identity: spec.identity.clone(),
                instance: InstanceId::new(format!("instance-{}", spec.identity.id)),
                started_at: Utc::now(),
                state: "running".to_string(),
            };
            self.table.lock().await.push(process.clone());
            Ok(process)
        }

        async fn list(&self) -> Result<Vec<WorkerProcess>, LaunchError> {
            Ok(self.table.lock().await.clone())
        }

        async fn signal(&self, worker: &WorkerProcess) -> Result<(), LaunchError> {
            self.signals.lock().await.push(worker.identity.id.clone());
            if !self.stubborn_ids.contains(&worker.identity.id) {
                self.set_state(&worker.identity.id, "exited").await;
            }
            Ok(())
        }

        async fn is_running(&self, worker: &WorkerProcess) -> Result<bool, LaunchError> {
            Ok(self
                .table
                .lock()
                .await
                .iter()
                .any(|p| p.identity.id == worker.identity.id && p.is_running()))
        }

        async fn kill(&self, worker: &WorkerProcess) -> Result<(), LaunchError> {
            self.kills.lock().await.push(worker.identity.id.clone());
            self.set_state(&worker.identity.id, "exited").await;
            Ok(())
        }

        async fn reap(&self, worker: &WorkerProcess) -> Result<(), LaunchError> {
            self.table.lock().await.retain(|p| p.identity.id != worker.identity.id);
            Ok(())
        }
    }

    const CONFIG: &str = r#"
project:
  name: demo
  test_command: cargo test
worker:
  agent_command: claude --print
  lock_attempts: 7
agents:
  - role: generalist
    count: 3
  - role: reviewer
    provider: gemini
    count: 2
    extra_args: --verbose
"#;

    fn layout() -> FleetLayout {
        FleetLayout {
            base_dir: PathBuf::from("/proj"),
            upstream: PathBuf::from("/proj/.swarm/upstream.git"),
            logs_dir: PathBuf::from("/proj/.swarm/logs"),
            workspaces_dir: PathBuf::from("/proj/.swarm/workspaces"),
            extra_env: BTreeMap::from([("ANTHROPIC_API_KEY".to_string(), "sk".to_string())]),
        }
    }

    fn config() -> SwarmConfig {
        SwarmConfig::from_yaml_str(CONFIG).unwrap()
    }

    #[tokio::test]
    async fn test_launch_assigns_distinct_identities() {
        let fleet = FleetManager::new(Arc::new(MockLauncher::default()), layout());
        let report = fleet.launch(&config(), false).await.unwrap();

        let ids: Vec<_> = report.started.iter().map(|p| p.identity.id.clone()).collect();
        assert_eq!(
            ids,
            vec!["generalist-0", "generalist-1", "generalist-2", "reviewer-0", "reviewer-1"]
        );
        assert!(report.failed.is_empty());

        let reviewer = &report.planned[3];
        assert_eq!(reviewer.identity.model, "gemini-2.5-pro");
        assert_eq!(reviewer.agent_command, "claude --print --verbose");
        assert_eq!(reviewer.workspace, PathBuf::from("/proj/.swarm/workspaces/reviewer-0"));
        assert_eq!(reviewer.prompt_file, Some(PathBuf::from("/proj/agents/prompts/REVIEWER.md")));
        assert_eq!(reviewer.test_command.as_deref(), Some("cargo test"));
        assert_eq!(reviewer.extra_env["ANTHROPIC_API_KEY"], "sk");
        assert_eq!(reviewer.lock_attempts, 7);
        assert!(reviewer
            .env_vars()
            .contains(&("SWARM_LOCK_ATTEMPTS".to_string(), "7".to_string())));
    }

    #[tokio::test]
    async fn test_dry_run_starts_nothing() {
        let launcher = Arc::new(MockLauncher::default());
        let fleet = FleetManager::new(launcher.clone(), layout());
        let report = fleet.launch(&config(), true).await.unwrap();
        assert_eq!(report.planned.len(), 5);
        assert!(report.started.is_empty());
        assert!(launcher.table.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_relaunch_skips_running_indices() {
        let fleet = FleetManager::new(Arc::new(MockLauncher::default()), layout());
        fleet.launch(&config(), false).await.unwrap();
        let second = fleet.launch(&config(), false).await.unwrap();

        assert_eq!(second.already_running, 5);
        let ids: Vec<_> = second.started.iter().map(|p| p.identity.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["generalist-3", "generalist-4", "generalist-5", "reviewer-2", "reviewer-3"]
        );
        let table = fleet.process_table().await.unwrap();
        let unique: HashSet<_> = table.iter().map(|p| p.identity.id.clone()).collect();
        assert_eq!(unique.len(), 10);
    }

    #[tokio::test]
    async fn test_start_failure_is_isolated() {
        let launcher = MockLauncher {
            fail_ids: vec!["generalist-1".to_string()],
            ..Default::default()
        };
        let fleet = FleetManager::new(Arc::new(launcher), layout());
        let report = fleet.launch(&config(), false).await.unwrap();
        assert_eq!(report.started.len(), 4);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].identity.id, "generalist-1");
    }

    #[tokio::test]
    async fn test_stop_escalates_after_grace() {
        let launcher = Arc::new(MockLauncher {
            stubborn_ids: vec!["reviewer-0".to_string()],
            ..Default::default()
        });
        let fleet = FleetManager::new(launcher.clone(), layout());
        fleet.launch(&config(), false).await.unwrap();

        let report = fleet.stop(Duration::from_millis(300)).await.unwrap();
        assert_eq!(report.stopped.len(), 4);
        assert_eq!(report.killed, vec!["reviewer-0".to_string()]);
        assert_eq!(launcher.signals.lock().await.len(), 5);
        assert_eq!(*launcher.kills.lock().await, vec!["reviewer-0".to_string()]);
        assert!(fleet.process_table().await.unwrap().is_empty());
    }
}
