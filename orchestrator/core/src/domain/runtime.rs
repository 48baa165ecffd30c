// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

use crate::domain::identity::WorkerIdentity;

/// Environment variable names of the worker process contract.
pub mod env {
    pub const AGENT_ID: &str = "SWARM_AGENT_ID";
    pub const AGENT_ROLE: &str = "SWARM_AGENT_ROLE";
    pub const AGENT_PROVIDER: &str = "SWARM_AGENT_PROVIDER";
    pub const AGENT_MODEL: &str = "SWARM_AGENT_MODEL";
    pub const PROMPT_FILE: &str = "SWARM_PROMPT_FILE";
    pub const BRANCH: &str = "SWARM_BRANCH";
    pub const TEST_COMMAND: &str = "SWARM_TEST_COMMAND";
    pub const UPSTREAM: &str = "SWARM_UPSTREAM";
    pub const WORKSPACE: &str = "SWARM_WORKSPACE";
    pub const LOGS_DIR: &str = "SWARM_LOGS_DIR";
    pub const AGENT_COMMAND: &str = "SWARM_AGENT_COMMAND";
    pub const TASKS_DIR: &str = "SWARM_TASKS_DIR";
    pub const PROGRESS_FILE: &str = "SWARM_PROGRESS_FILE";
    pub const IDLE_SECONDS: &str = "SWARM_IDLE_SECONDS";
    pub const PUSH_ATTEMPTS: &str = "SWARM_PUSH_ATTEMPTS";
    pub const LOCK_ATTEMPTS: &str = "SWARM_LOCK_ATTEMPTS";
    pub const HISTORY_DEPTH: &str = "SWARM_HISTORY_DEPTH";
}

/// Opaque handle of a started worker: a pid for local processes, a container
/// id for Docker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub cpu_millis: Option<u32>,
    pub memory_bytes: Option<u64>,
}

/// Everything needed to start one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub identity: WorkerIdentity,
    pub upstream: PathBuf,
    pub branch: String,
    pub workspace: PathBuf,
    pub logs_dir: PathBuf,
    pub prompt_file: Option<PathBuf>,
    pub test_command: Option<String>,
    pub agent_command: String,
    pub tasks_dir: String,
    pub progress_file: String,
    pub idle_seconds: u64,
    pub push_attempts: u32,
    #[serde(default = "default_lock_attempts")]
    pub lock_attempts: u32,
    pub history_depth: usize,
    pub resources: ResourceLimits,
    /// Extra environment (API keys, user-provided variables).
    #[serde(default)]
    pub extra_env: BTreeMap<String, String>,
}

impl WorkerSpec {
    /// The worker contract as `(name, value)` pairs, extra environment last.
    pub fn env_vars(&self) -> Vec<(String, String)> {
        let mut vars = vec![
            (env::AGENT_ID.to_string(), self.identity.id.clone()),
            (env::AGENT_ROLE.to_string(), self.identity.role.clone()),
            (env::AGENT_PROVIDER.to_string(), self.identity.provider.to_string()),
            (env::AGENT_MODEL.to_string(), self.identity.model.clone()),
            (env::BRANCH.to_string(), self.branch.clone()),
            (env::UPSTREAM.to_string(), self.upstream.display().to_string()),
            (env::WORKSPACE.to_string(), self.workspace.display().to_string()),
            (env::LOGS_DIR.to_string(), self.logs_dir.display().to_string()),
            (env::AGENT_COMMAND.to_string(), self.agent_command.clone()),
            (env::TASKS_DIR.to_string(), self.tasks_dir.clone()),
            (env::PROGRESS_FILE.to_string(), self.progress_file.clone()),
            (env::IDLE_SECONDS.to_string(), self.idle_seconds.to_string()),
            (env::PUSH_ATTEMPTS.to_string(), self.push_attempts.to_string()),
            (env::LOCK_ATTEMPTS.to_string(), self.lock_attempts.to_string()),
            (env::HISTORY_DEPTH.to_string(), self.history_depth.to_string()),
        ];
        if let Some(prompt) = &self.prompt_file {
            vars.push((env::PROMPT_FILE.to_string(), prompt.display().to_string()));
        }
        if let Some(test_command) = &self.test_command {
            vars.push((env::TEST_COMMAND.to_string(), test_command.clone()));
        }
        vars.extend(self.extra_env.iter().map(|(k, v)| (k.clone(), v.clone())));
        vars
    }
}

fn default_lock_attempts() -> u32 {
    3
}

/// One row of the process table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerProcess {
    pub identity: WorkerIdentity,
    pub instance: InstanceId,
    pub started_at: DateTime<Utc>,
    /// Launcher-reported state ("running", "exited", ...).
    pub state: String,
}

impl WorkerProcess {
    pub fn is_running(&self) -> bool {
        self.state == "running"
    }
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("Failed to spawn worker: {0}")]
    SpawnFailed(String),
    #[error("Failed to signal worker: {0}")]
    SignalFailed(String),
    #[error("Failed to terminate worker: {0}")]
    TerminationFailed(String),
    #[error("Worker not found: {0}")]
    InstanceNotFound(String),
    #[error("Launcher unavailable: {0}")]
    Unavailable(String),
}

/// Starts and stops isolated worker instances.
///
/// Implemented by the local-process launcher and the Docker launcher. Every
/// worker runs in its own process so one worker's failure never reaches a
/// sibling.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Short name for logs ("process", "docker").
    fn kind(&self) -> &'static str;

    /// Start one worker.
    async fn start(&self, spec: &WorkerSpec) -> Result<WorkerProcess, LaunchError>;

    /// All workers this launcher knows about, with a fresh state.
    async fn list(&self) -> Result<Vec<WorkerProcess>, LaunchError>;

    /// Ask a worker to shut down gracefully.
    async fn signal(&self, worker: &WorkerProcess) -> Result<(), LaunchError>;

    async fn is_running(&self, worker: &WorkerProcess) -> Result<bool, LaunchError>;

    /// Force-terminate a worker.
    async fn kill(&self, worker: &WorkerProcess) -> Result<(), LaunchError>;

    /// Drop bookkeeping for an exited worker.
    async fn reap(&self, worker: &WorkerProcess) -> Result<(), LaunchError>;
}
