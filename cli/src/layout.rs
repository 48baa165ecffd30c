// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Host-side layout of a swarm and the launcher selected for it.
//!
//! Every relative path in `swarm.yaml` resolves against the directory that
//! holds the configuration file. Private state lives next to the shared
//! repository (`.swarm/` by default):
//!
//! ```text
//! .swarm/
//!   upstream.git/     shared bare repository
//!   logs/             session logs and worker console output
//!   workspaces/<id>/  per-worker working copies
//!   fleet.json        local process registry
//!   _monitor/         read-only mirror used by status and dashboard
//!   _operator/        working copy used by unlock
//! ```

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use swarm_coordination::application::{FleetLayout, FleetManager, StateAggregator};
use swarm_core::domain::runtime::{LaunchError, WorkerLauncher, WorkerProcess, WorkerSpec};
use swarm_core::domain::swarm_config::{RuntimeKind, SwarmConfig};
use swarm_core::infrastructure::git_sync::SyncClient;
use swarm_core::infrastructure::upstream::operator_identity;
use swarm_core::infrastructure::{DockerLauncher, LocalProcessLauncher};

#[derive(Debug, Clone)]
pub struct SwarmPaths {
    pub base_dir: PathBuf,
    pub upstream: PathBuf,
    pub logs_dir: PathBuf,
    pub state_dir: PathBuf,
}

impl SwarmPaths {
    pub fn resolve(config: &SwarmConfig, config_path: &Path) -> Result<Self> {
        let parent = config_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let base_dir = std::path::absolute(parent)
            .with_context(|| format!("Failed to resolve {:?}", parent))?;
        Ok(Self {
            upstream: config.upstream_path(&base_dir),
            logs_dir: config.logs_path(&base_dir),
            state_dir: config.state_path(&base_dir),
            base_dir,
        })
    }

    pub fn workspaces_dir(&self) -> PathBuf {
        self.state_dir.join("workspaces")
    }

    pub fn registry(&self) -> PathBuf {
        self.state_dir.join("fleet.json")
    }

    pub fn monitor_dir(&self) -> PathBuf {
        self.state_dir.join("_monitor")
    }

    pub fn operator_dir(&self) -> PathBuf {
        self.state_dir.join("_operator")
    }

    pub fn seed_dir(&self) -> PathBuf {
        self.state_dir.join("_seed")
    }

    pub fn project_dir(&self, config: &SwarmConfig) -> PathBuf {
        self.base_dir.join(&config.project.repo_path)
    }

    pub fn fleet_layout(&self, config: &SwarmConfig) -> FleetLayout {
        FleetLayout {
            base_dir: self.base_dir.clone(),
            upstream: self.upstream.clone(),
            logs_dir: self.logs_dir.clone(),
            workspaces_dir: self.workspaces_dir(),
            extra_env: worker_env(config, |name| std::env::var(name).ok()),
        }
    }
}

/// Config file path plus parsed configuration, with env overrides applied.
pub fn load_config(config_override: Option<PathBuf>) -> Result<(SwarmConfig, SwarmPaths)> {
    let path = SwarmConfig::discover(config_override);
    let config = SwarmConfig::load(Some(path.clone()))
        .with_context(|| format!("Failed to load configuration from {:?}", path))?;
    let paths = SwarmPaths::resolve(&config, &path)?;
    debug!(base = ?paths.base_dir, upstream = ?paths.upstream, "Resolved swarm layout");
    Ok((config, paths))
}

/// Environment passed to every worker: user-defined variables plus every
/// configured provider API key present in `lookup`.
pub fn worker_env<F>(config: &SwarmConfig, lookup: F) -> BTreeMap<String, String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut env = config.docker.extra_env.clone();
    for (provider, var) in &config.docker.api_keys {
        match lookup(var).filter(|v| !v.trim().is_empty()) {
            Some(value) => {
                env.insert(var.clone(), value);
            }
            None => {
                let used = config.agents.iter().any(|a| a.provider.as_str() == provider);
                if used {
                    warn!("{} is not set; {} agents will start without an API key", var, provider);
                }
            }
        }
    }
    env
}

/// The launcher selected by `runtime:` in the configuration.
pub enum SwarmLauncher {
    Process(LocalProcessLauncher),
    Docker(DockerLauncher),
}

impl SwarmLauncher {
    pub async fn from_config(config: &SwarmConfig, paths: &SwarmPaths) -> Result<Self> {
        match config.runtime {
            RuntimeKind::Process => Ok(Self::Process(LocalProcessLauncher::for_current_exe(
                paths.registry(),
            )?)),
            RuntimeKind::Docker => {
                let docker = DockerLauncher::new(&config.docker, None)?;
                docker.healthcheck().await?;
                Ok(Self::Docker(docker))
            }
        }
    }

    fn inner(&self) -> &dyn WorkerLauncher {
        match self {
            Self::Process(launcher) => launcher,
            Self::Docker(launcher) => launcher,
        }
    }
}

#[async_trait]
impl WorkerLauncher for SwarmLauncher {
    fn kind(&self) -> &'static str {
        self.inner().kind()
    }

    async fn start(&self, spec: &WorkerSpec) -> Result<WorkerProcess, LaunchError> {
        self.inner().start(spec).await
    }

    async fn list(&self) -> Result<Vec<WorkerProcess>, LaunchError> {
        self.inner().list().await
    }

    async fn signal(&self, worker: &WorkerProcess) -> Result<(), LaunchError> {
        self.inner().signal(worker).await
    }

    async fn is_running(&self, worker: &WorkerProcess) -> Result<bool, LaunchError> {
        self.inner().is_running(worker).await
    }

    async fn kill(&self, worker: &WorkerProcess) -> Result<(), LaunchError> {
        self.inner().kill(worker).await
    }

    async fn reap(&self, worker: &WorkerProcess) -> Result<(), LaunchError> {
        self.inner().reap(worker).await
    }
}

pub async fn fleet(config: &SwarmConfig, paths: &SwarmPaths) -> Result<FleetManager<SwarmLauncher>> {
    let launcher = SwarmLauncher::from_config(config, paths).await?;
    Ok(FleetManager::new(Arc::new(launcher), paths.fleet_layout(config)))
}

/// Aggregator over the shared repository, reading through `.swarm/_monitor`.
pub async fn aggregator(
    config: &SwarmConfig,
    paths: &SwarmPaths,
) -> Result<StateAggregator<SwarmLauncher>> {
    let launcher = SwarmLauncher::from_config(config, paths).await?;
    let upstream = paths.upstream.clone();
    let branch = config.project.branch.clone();
    let monitor = paths.monitor_dir();
    let mirror = tokio::task::spawn_blocking(move || {
        SyncClient::initialize(&upstream, &branch, &monitor, operator_identity())
    })
    .await?
    .context("Shared repository is not available; run `swarm launch` first")?;

    Ok(StateAggregator::new(
        Arc::new(launcher),
        mirror,
        &config.tasks_dir,
        &config.progress_file,
        paths.logs_dir.clone(),
        config.worker.history_depth,
    ))
}

/// Resolves on Ctrl-C or, on unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
project:
  name: demo
  repo_path: project
agents:
  - role: generalist
    count: 2
  - role: reviewer
    provider: gemini
    count: 1
docker:
  extra_env:
    RUST_BACKTRACE: "1"
"#;

    #[test]
    fn test_paths_resolve_against_config_directory() {
        let config = SwarmConfig::from_yaml_str(CONFIG).unwrap();
        let paths = SwarmPaths::resolve(&config, Path::new("/srv/demo/swarm.yaml")).unwrap();
        assert_eq!(paths.base_dir, PathBuf::from("/srv/demo"));
        assert_eq!(paths.upstream, PathBuf::from("/srv/demo/.swarm/upstream.git"));
        assert_eq!(paths.logs_dir, PathBuf::from("/srv/demo/.swarm/logs"));
        assert_eq!(paths.registry(), PathBuf::from("/srv/demo/.swarm/fleet.json"));
        assert_eq!(paths.project_dir(&config), PathBuf::from("/srv/demo/project"));
    }

    #[test]
    fn test_bare_file_name_resolves_to_current_dir() {
        let config = SwarmConfig::from_yaml_str(CONFIG).unwrap();
        let paths = SwarmPaths::resolve(&config, Path::new("swarm.yaml")).unwrap();
        assert!(paths.base_dir.is_absolute());
        assert!(paths.upstream.ends_with(".swarm/upstream.git"));
    }

    #[test]
    fn test_worker_env_collects_present_keys() {
        let config = SwarmConfig::from_yaml_str(CONFIG).unwrap();
        let env = worker_env(&config, |name| match name {
            "ANTHROPIC_API_KEY" => Some("sk-ant".to_string()),
            "OPENAI_API_KEY" => Some("  ".to_string()),
            _ => None,
        });
        assert_eq!(env["ANTHROPIC_API_KEY"], "sk-ant");
        assert_eq!(env["RUST_BACKTRACE"], "1");
        assert!(!env.contains_key("OPENAI_API_KEY"));
        assert!(!env.contains_key("GEMINI_API_KEY"));
    }
}
