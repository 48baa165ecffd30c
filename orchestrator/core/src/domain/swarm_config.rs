// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Swarm Configuration - the declarative `swarm.yaml`
//
// Defines:
// - The target project (source, branch, test command)
// - Agent roles with provider/model/prompt/count
// - Runtime selection (local processes or Docker containers)
// - Worker loop tuning and resource limits
// - Locations of the shared repository, logs, task markers and progress file

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::domain::identity::Provider;
use crate::domain::runtime::ResourceLimits;

/// Starter configuration written by `swarm init`.
pub const DEFAULT_TEMPLATE: &str = include_str!("../../templates/swarm.yaml");

/// Default file name looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "swarm.yaml";

/// Environment variable pointing at a configuration file.
pub const CONFIG_PATH_ENV: &str = "SWARM_CONFIG_PATH";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
    #[error("{0} already exists")]
    AlreadyExists(PathBuf),
}

/// Top-level configuration for the entire swarm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmConfig {
    pub project: ProjectConfig,

    pub agents: Vec<AgentConfig>,

    /// Where workers run.
    #[serde(default)]
    pub runtime: RuntimeKind,

    #[serde(default)]
    pub docker: DockerConfig,

    #[serde(default)]
    pub worker: WorkerSettings,

    /// Per-worker limits; only enforced by the Docker runtime.
    #[serde(default)]
    pub resources: ResourceLimits,

    /// Bare shared repository, relative to the config's directory.
    #[serde(default = "default_upstream_dir")]
    pub upstream_dir: String,

    #[serde(default = "default_logs_dir")]
    pub logs_dir: String,

    /// Lock marker directory inside the shared repository.
    #[serde(default = "default_tasks_dir")]
    pub tasks_dir: String,

    /// Status document inside the shared repository.
    #[serde(default = "default_progress_file")]
    pub progress_file: String,
}

/// Settings for the target project the swarm will work on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default = "default_project_name")]
    pub name: String,

    /// Remote repository cloned as the initial shared history.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repo_url: String,

    /// Local directory whose files are seeded into the shared repository.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repo_path: String,

    #[serde(default = "default_branch")]
    pub branch: String,

    /// Command the agents run to verify their changes.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub test_command: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// Definition of a single agent role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub role: String,

    /// Prompt markdown file; defaults to `agents/prompts/<ROLE>.md`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub prompt: String,

    #[serde(default)]
    pub provider: Provider,

    /// Empty resolves to the provider default.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model: String,

    #[serde(default = "default_count")]
    pub count: usize,

    /// Appended to the worker's agent command.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub extra_args: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    #[default]
    Process,
    Docker,
}

/// Docker-related settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerConfig {
    #[serde(default = "default_image")]
    pub image: String,

    /// Provider name -> environment variable holding its API key.
    #[serde(default = "default_api_keys")]
    pub api_keys: BTreeMap<String, String>,

    /// Extra environment variables passed to every worker.
    #[serde(default)]
    pub extra_env: BTreeMap<String, String>,

    /// Host path -> container path.
    #[serde(default)]
    pub volumes: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            api_keys: default_api_keys(),
            extra_env: BTreeMap::new(),
            volumes: BTreeMap::new(),
            network: None,
        }
    }
}

/// Worker loop tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    /// External work generator; receives the rendered prompt on stdin.
    #[serde(default = "default_agent_command")]
    pub agent_command: String,

    #[serde(default = "default_idle_seconds")]
    pub idle_seconds: u64,

    #[serde(default = "default_push_attempts")]
    pub push_attempts: u32,

    #[serde(default = "default_lock_attempts")]
    pub lock_attempts: u32,

    /// Commits included in each work context.
    #[serde(default = "default_history_depth")]
    pub history_depth: usize,

    #[serde(default = "default_stop_grace_seconds")]
    pub stop_grace_seconds: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            agent_command: default_agent_command(),
            idle_seconds: default_idle_seconds(),
            push_attempts: default_push_attempts(),
            lock_attempts: default_lock_attempts(),
            history_depth: default_history_depth(),
            stop_grace_seconds: default_stop_grace_seconds(),
        }
    }
}

fn default_project_name() -> String {
    "my-project".to_string()
}
fn default_branch() -> String {
    "main".to_string()
}
fn default_count() -> usize {
    1
}
fn default_image() -> String {
    "coding-swarm:latest".to_string()
}
fn default_api_keys() -> BTreeMap<String, String> {
    Provider::ALL
        .iter()
        .map(|p| (p.as_str().to_string(), p.api_key_env().to_string()))
        .collect()
}
fn default_agent_command() -> String {
    "claude --print".to_string()
}
fn default_idle_seconds() -> u64 {
    10
}
fn default_push_attempts() -> u32 {
    5
}
fn default_lock_attempts() -> u32 {
    3
}
fn default_history_depth() -> usize {
    20
}
fn default_stop_grace_seconds() -> u64 {
    30
}
fn default_upstream_dir() -> String {
    ".swarm/upstream.git".to_string()
}
fn default_logs_dir() -> String {
    ".swarm/logs".to_string()
}
fn default_tasks_dir() -> String {
    "current_tasks".to_string()
}
fn default_progress_file() -> String {
    "PROGRESS.md".to_string()
}

impl AgentConfig {
    /// Model after provider defaulting.
    pub fn resolved_model(&self) -> &str {
        if self.model.trim().is_empty() {
            self.provider.default_model()
        } else {
            &self.model
        }
    }

    /// Prompt path after role defaulting.
    pub fn resolved_prompt(&self) -> String {
        if self.prompt.trim().is_empty() {
            format!("agents/prompts/{}.md", self.role.to_uppercase())
        } else {
            self.prompt.clone()
        }
    }
}

impl SwarmConfig {
    /// Parse configuration from YAML string
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        if yaml.trim().is_empty() {
            return Err(ConfigError::Invalid("Empty configuration file".to_string()));
        }
        let mut config: SwarmConfig = serde_yaml::from_str(yaml)?;
        config.normalize();
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    /// Discover configuration file using precedence order
    /// 1. Explicit path (flag)
    /// 2. SWARM_CONFIG_PATH environment variable
    /// 3. ./swarm.yaml
    pub fn discover(cli_path: Option<PathBuf>) -> PathBuf {
        if let Some(path) = cli_path {
            return path;
        }
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            if !path.trim().is_empty() {
                return PathBuf::from(path);
            }
        }
        PathBuf::from(DEFAULT_CONFIG_FILE)
    }

    /// Load, apply environment overrides and validate.
    pub fn load(cli_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let path = Self::discover(cli_path);
        tracing::debug!("Loading swarm configuration from {:?}", path);
        let mut config = Self::from_yaml_file(&path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(branch) = std::env::var("SWARM_BRANCH") {
            if !branch.trim().is_empty() {
                tracing::debug!("Overriding branch from SWARM_BRANCH: {}", branch);
                self.project.branch = branch.trim().to_string();
            }
        }
        if let Ok(val) = std::env::var("SWARM_IDLE_SECONDS") {
            match val.trim().parse::<u64>() {
                Ok(secs) => self.worker.idle_seconds = secs,
                Err(_) => tracing::warn!("Ignoring invalid SWARM_IDLE_SECONDS value: {}", val),
            }
        }
    }

    /// Fill provider/role defaults so downstream code sees concrete values.
    fn normalize(&mut self) {
        for agent in &mut self.agents {
            agent.role = agent.role.trim().to_string();
            if agent.model.trim().is_empty() {
                agent.model = agent.provider.default_model().to_string();
            }
            if agent.prompt.trim().is_empty() {
                agent.prompt = agent.resolved_prompt();
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agents.is_empty() {
            return Err(ConfigError::Invalid(
                "At least one agent must be defined in 'agents'".to_string(),
            ));
        }
        if self.project.branch.trim().is_empty() {
            return Err(ConfigError::Invalid("project.branch cannot be empty".to_string()));
        }

        let mut roles = HashSet::new();
        for agent in &self.agents {
            if agent.role.is_empty() {
                return Err(ConfigError::Invalid("Agent role cannot be empty".to_string()));
            }
            if !agent
                .role
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            {
                return Err(ConfigError::Invalid(format!(
                    "Agent role '{}' may only contain letters, digits, '-' and '_'",
                    agent.role
                )));
            }
            if agent.count == 0 {
                return Err(ConfigError::Invalid(format!(
                    "Agent '{}' must have count >= 1",
                    agent.role
                )));
            }
            // Identities are <role>-<index>; a repeated role would collide.
            if !roles.insert(agent.role.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "Agent role '{}' is defined more than once",
                    agent.role
                )));
            }
        }

        if self.worker.push_attempts == 0 || self.worker.lock_attempts == 0 {
            return Err(ConfigError::Invalid(
                "worker.push_attempts and worker.lock_attempts must be >= 1".to_string(),
            ));
        }
        if self.worker.agent_command.trim().is_empty() {
            return Err(ConfigError::Invalid("worker.agent_command cannot be empty".to_string()));
        }
        Ok(())
    }

    /// Total number of workers a launch would start.
    pub fn total_workers(&self) -> usize {
        self.agents.iter().map(|a| a.count).sum()
    }

    pub fn test_command(&self) -> Option<&str> {
        Some(self.project.test_command.trim()).filter(|c| !c.is_empty())
    }

    pub fn upstream_path(&self, base: &Path) -> PathBuf {
        base.join(&self.upstream_dir)
    }

    pub fn logs_path(&self, base: &Path) -> PathBuf {
        base.join(&self.logs_dir)
    }

    /// Private scratch area next to the shared repository.
    pub fn state_path(&self, base: &Path) -> PathBuf {
        self.upstream_path(base)
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| base.join(".swarm"))
    }
}

/// Write the starter template to `dest`.
pub fn generate_template(dest: &Path, force: bool) -> Result<PathBuf, ConfigError> {
    if dest.exists() && !force {
        return Err(ConfigError::AlreadyExists(dest.to_path_buf()));
    }
    std::fs::write(dest, DEFAULT_TEMPLATE).map_err(|source| ConfigError::Read {
        path: dest.to_path_buf(),
        source,
    })?;
    Ok(dest.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
project:
  name: demo
agents:
  - role: generalist
    count: 3
  - role: reviewer
    provider: gemini
"#;

    #[test]
    fn test_template_parses_and_validates() {
        let config = SwarmConfig::from_yaml_str(DEFAULT_TEMPLATE).unwrap();
        config.validate().unwrap();
        assert!(config.total_workers() >= 1);
    }

    #[test]
    fn test_defaults_are_resolved() {
        let config = SwarmConfig::from_yaml_str(MINIMAL).unwrap();
        assert_eq!(config.project.branch, "main");
        assert_eq!(config.runtime, RuntimeKind::Process);
        assert_eq!(config.tasks_dir, "current_tasks");
        assert_eq!(config.agents[0].model, "claude-opus-4-20250514");
        assert_eq!(config.agents[0].prompt, "agents/prompts/GENERALIST.md");
        assert_eq!(config.agents[1].model, "gemini-2.5-pro");
        assert_eq!(config.agents[1].count, 1);
        assert_eq!(config.total_workers(), 4);
        assert_eq!(config.docker.api_keys["openai"], "OPENAI_API_KEY");
        assert!(config.test_command().is_none());
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let yaml = "project: {}\nagents:\n  - role: a\n    provider: mistral\n";
        assert!(matches!(SwarmConfig::from_yaml_str(yaml), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_validation_errors() {
        let mut config = SwarmConfig::from_yaml_str(MINIMAL).unwrap();
        config.agents[1].role = "generalist".to_string();
        assert!(config.validate().is_err());

        let mut config = SwarmConfig::from_yaml_str(MINIMAL).unwrap();
        config.agents[0].count = 0;
        assert!(config.validate().is_err());

        let mut config = SwarmConfig::from_yaml_str(MINIMAL).unwrap();
        config.agents[0].role = "bad role".to_string();
        assert!(config.validate().is_err());

        let mut config = SwarmConfig::from_yaml_str(MINIMAL).unwrap();
        config.agents.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_file_rejected() {
        assert!(matches!(SwarmConfig::from_yaml_str("  \n"), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_generate_template_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("swarm.yaml");
        generate_template(&dest, false).unwrap();
        assert!(matches!(generate_template(&dest, false), Err(ConfigError::AlreadyExists(_))));
        generate_template(&dest, true).unwrap();
    }

    #[test]
    fn test_state_path_is_upstream_parent() {
        let config = SwarmConfig::from_yaml_str(MINIMAL).unwrap();
        assert_eq!(config.state_path(Path::new("/work")), PathBuf::from("/work/.swarm"));
    }
}
