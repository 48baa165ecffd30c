// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use crate::domain::identity::{Provider, WorkerIdentity};
use crate::domain::runtime::{env, InstanceId, LaunchError, WorkerLauncher, WorkerProcess, WorkerSpec};
use crate::domain::swarm_config::DockerConfig;
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StartContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::Docker;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const LABEL_IDENTITY: &str = "coding-swarm.identity";
const LABEL_ROLE: &str = "coding-swarm.role";
const LABEL_PROVIDER: &str = "coding-swarm.provider";
const LABEL_MODEL: &str = "coding-swarm.model";

const CONTAINER_UPSTREAM: &str = "/swarm/upstream.git";
const CONTAINER_WORKSPACE: &str = "/swarm/workspace";
const CONTAINER_LOGS: &str = "/swarm/logs";
const CONTAINER_PROMPTS: &str = "/swarm/prompts";

/// Runs each worker in its own container named `swarm-<id>`.
pub struct DockerLauncher {
    docker: Docker,
    image: String,
    network_mode: Option<String>,
    volumes: BTreeMap<String, String>,
    command: Vec<String>,
}

impl DockerLauncher {
    pub fn new(config: &DockerConfig, socket_path: Option<String>) -> Result<Self, LaunchError> {
        // Connect to Docker daemon (custom socket or auto-detect)
        let docker = if let Some(path) = socket_path {
            #[cfg(unix)]
            let result = Docker::connect_with_unix(&path, 120, bollard::API_DEFAULT_VERSION);

            #[cfg(windows)]
            let result = Docker::connect_with_named_pipe(&path, 120, bollard::API_DEFAULT_VERSION);

            result.map_err(|e| {
                LaunchError::Unavailable(format!(
                    "Failed to connect to Docker at {}: {}\n\n\
                     Ensure Docker is running and the socket path is correct.",
                    path, e
                ))
            })?
        } else {
            Docker::connect_with_local_defaults().map_err(|e| {
                LaunchError::Unavailable(format!(
                    "Failed to connect to Docker: {}\n\n\
                     Common causes:\n\
                     - Docker daemon not running (check: docker ps)\n\
                     - Permission denied accessing Docker socket\n\
                     - On Linux: Current user not in 'docker' group",
                    e
                ))
            })?
        };

        Ok(Self {
            docker,
            image: config.image.clone(),
            network_mode: config.network.clone(),
            volumes: config.volumes.clone(),
            command: vec!["swarm".to_string(), "worker".to_string()],
        })
    }

    /// Verify Docker daemon is accessible
    pub async fn healthcheck(&self) -> Result<(), LaunchError> {
        self.docker.ping().await.map_err(|e| {
            LaunchError::Unavailable(format!(
                "Cannot connect to Docker daemon: {}\n\nVerify with: docker ps",
                e
            ))
        })?;
        Ok(())
    }

    async fn ensure_image(&self) -> Result<(), LaunchError> {
        if self.docker.inspect_image(&self.image).await.is_ok() {
            return Ok(());
        }
        info!("Image {} not found locally, pulling", self.image);
        let options = Some(CreateImageOptions {
            from_image: self.image.clone(),
            ..Default::default()
        });
        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            if let Err(e) = result {
                return Err(LaunchError::SpawnFailed(format!(
                    "Failed to pull image {}: {}\n\nTry manually: docker pull {}",
                    self.image, e, self.image
                )));
            }
        }
        info!("Successfully pulled image: {}", self.image);
        Ok(())
    }

    /// Remove a leftover container with the same name from an earlier run.
    async fn remove_stale(&self, name: &str) {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        if self.docker.remove_container(name, Some(options)).await.is_ok() {
            debug!("Removed stale container {}", name);
        }
    }

    async fn send_signal(&self, worker: &WorkerProcess, signal: &str) -> Result<(), bollard::errors::Error> {
        self.docker
            .kill_container(worker.instance.as_str(), Some(KillContainerOptions { signal }))
            .await
    }
}

/// Host paths and the spec as seen from inside the container.
#[derive(Debug, Clone, PartialEq)]
struct ContainerLayout {
    binds: Vec<String>,
    env: Vec<String>,
}

fn absolute(path: &Path) -> Result<PathBuf, LaunchError> {
    path.canonicalize()
        .map_err(|e| LaunchError::SpawnFailed(format!("cannot resolve {:?}: {}", path, e)))
}

/// Rewrite `spec` paths to their container mount points.
fn container_layout(
    spec: &WorkerSpec,
    upstream: &Path,
    logs: &Path,
    extra_volumes: &BTreeMap<String, String>,
) -> ContainerLayout {
    let mut binds = vec![
        format!("{}:{}", upstream.display(), CONTAINER_UPSTREAM),
        format!("{}:{}", logs.display(), CONTAINER_LOGS),
    ];
    let mut inner = spec.clone();
    inner.upstream = PathBuf::from(CONTAINER_UPSTREAM);
    inner.workspace = PathBuf::from(CONTAINER_WORKSPACE);
    inner.logs_dir = PathBuf::from(CONTAINER_LOGS);
    if let Some(prompt) = &spec.prompt_file {
        if let (Some(dir), Some(file)) = (prompt.parent(), prompt.file_name()) {
            binds.push(format!("{}:{}:ro", dir.display(), CONTAINER_PROMPTS));
            inner.prompt_file = Some(Path::new(CONTAINER_PROMPTS).join(file));
        }
    }
    binds.extend(extra_volumes.iter().map(|(host, container)| format!("{}:{}", host, container)));

    ContainerLayout {
        binds,
        env: inner.env_vars().into_iter().map(|(k, v)| format!("{}={}", k, v)).collect(),
    }
}

fn labels(identity: &WorkerIdentity) -> HashMap<String, String> {
    HashMap::from([
        (LABEL_IDENTITY.to_string(), identity.id.clone()),
        (LABEL_ROLE.to_string(), identity.role.clone()),
        (LABEL_PROVIDER.to_string(), identity.provider.to_string()),
        (LABEL_MODEL.to_string(), identity.model.clone()),
    ])
}

fn identity_from_labels(labels: &HashMap<String, String>) -> Option<WorkerIdentity> {
    let id = labels.get(LABEL_IDENTITY)?;
    Some(WorkerIdentity::new(
        id.clone(),
        labels.get(LABEL_ROLE).cloned().unwrap_or_default(),
        labels
            .get(LABEL_PROVIDER)
            .and_then(|p| p.parse::<Provider>().ok())
            .unwrap_or_default(),
        labels.get(LABEL_MODEL).cloned().unwrap_or_default(),
    ))
}

#[async_trait]
impl WorkerLauncher for DockerLauncher {
    fn kind(&self) -> &'static str {
        "docker"
    }

    async fn start(&self, spec: &WorkerSpec) -> Result<WorkerProcess, LaunchError> {
        self.ensure_image().await?;

        std::fs::create_dir_all(&spec.logs_dir)
            .map_err(|e| LaunchError::SpawnFailed(format!("cannot create {:?}: {}", spec.logs_dir, e)))?;
        let mut resolved = spec.clone();
        if let Some(prompt) = &spec.prompt_file {
            resolved.prompt_file = Some(absolute(prompt)?);
        }
        let layout = container_layout(
            &resolved,
            &absolute(&spec.upstream)?,
            &absolute(&spec.logs_dir)?,
            &self.volumes,
        );

        let mut host_config = bollard::service::HostConfig {
            binds: Some(layout.binds),
            network_mode: self.network_mode.clone(),
            ..Default::default()
        };
        if let Some(memory_bytes) = spec.resources.memory_bytes {
            host_config.memory = Some(memory_bytes as i64);
        }
        if let Some(cpu_millis) = spec.resources.cpu_millis {
            // Docker nano_cpus: 1 CPU = 1e9 nano CPUs, 1 milli CPU = 1e6 nano CPUs
            host_config.nano_cpus = Some((cpu_millis as i64) * 1_000_000);
        }

        let name = spec.identity.container_name();
        self.remove_stale(&name).await;

        let options = CreateContainerOptions {
            name: name.clone(),
            platform: None,
        };
        let container_config = Config {
            image: Some(self.image.clone()),
            cmd: Some(self.command.clone()),
            env: Some(layout.env),
            labels: Some(labels(&spec.identity)),
            working_dir: Some("/swarm".to_string()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let res = self
            .docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| LaunchError::SpawnFailed(e.to_string()))?;

        self.docker
            .start_container(&res.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| LaunchError::SpawnFailed(format!("Failed to start container: {}", e)))?;

        info!(worker = %spec.identity.id, container = %name, "Started worker container");
        Ok(WorkerProcess {
            identity: spec.identity.clone(),
            instance: InstanceId::new(res.id),
            started_at: Utc::now(),
            state: "running".to_string(),
        })
    }

    async fn list(&self) -> Result<Vec<WorkerProcess>, LaunchError> {
        let options = ListContainersOptions::<String> {
            all: true,
            filters: HashMap::from([("label".to_string(), vec![LABEL_IDENTITY.to_string()])]),
            ..Default::default()
        };
        let summaries = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| LaunchError::Unavailable(e.to_string()))?;

        let mut processes: Vec<WorkerProcess> = summaries
            .into_iter()
            .filter_map(|summary| {
                let identity = identity_from_labels(summary.labels.as_ref()?)?;
                Some(WorkerProcess {
                    identity,
                    instance: InstanceId::new(summary.id?),
                    started_at: summary
                        .created
                        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
                        .unwrap_or_default(),
                    state: summary.state.unwrap_or_else(|| "unknown".to_string()),
                })
            })
            .collect();
        processes.sort_by(|a, b| a.identity.id.cmp(&b.identity.id));
        Ok(processes)
    }

    async fn signal(&self, worker: &WorkerProcess) -> Result<(), LaunchError> {
        self.send_signal(worker, "SIGTERM")
            .await
            .map_err(|e| LaunchError::SignalFailed(e.to_string()))
    }

    async fn is_running(&self, worker: &WorkerProcess) -> Result<bool, LaunchError> {
        let inspect = self
            .docker
            .inspect_container(worker.instance.as_str(), None)
            .await
            .map_err(|e| LaunchError::InstanceNotFound(e.to_string()))?;
        Ok(inspect.state.and_then(|s| s.running).unwrap_or(false))
    }

    async fn kill(&self, worker: &WorkerProcess) -> Result<(), LaunchError> {
        self.send_signal(worker, "SIGKILL")
            .await
            .map_err(|e| LaunchError::TerminationFailed(e.to_string()))
    }

    async fn reap(&self, worker: &WorkerProcess) -> Result<(), LaunchError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_container(worker.instance.as_str(), Some(options))
            .await
            .map_err(|e| LaunchError::TerminationFailed(e.to_string()))?;
        info!("Removed worker container: {}", worker.identity.container_name());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::runtime::ResourceLimits;

    fn spec() -> WorkerSpec {
        WorkerSpec {
            identity: WorkerIdentity::for_slot("reviewer", 0, Provider::Gemini, "gemini-2.5-pro"),
            upstream: PathBuf::from("/home/me/proj/.swarm/upstream.git"),
            branch: "main".to_string(),
            workspace: PathBuf::from("/home/me/proj/.swarm/workspaces/reviewer-0"),
            logs_dir: PathBuf::from("/home/me/proj/.swarm/logs"),
            prompt_file: Some(PathBuf::from("/home/me/proj/agents/prompts/REVIEWER.md")),
            test_command: None,
            agent_command: "gemini -p".to_string(),
            tasks_dir: "current_tasks".to_string(),
            progress_file: "PROGRESS.md".to_string(),
            idle_seconds: 10,
            push_attempts: 5,
            lock_attempts: 5,
            history_depth: 20,
            resources: ResourceLimits::default(),
            extra_env: BTreeMap::new(),
        }
    }

    #[test]
    fn test_container_layout_rewrites_paths() {
        let spec = spec();
        let volumes = BTreeMap::from([("/cache".to_string(), "/root/.cache".to_string())]);
        let layout = container_layout(&spec, &spec.upstream, &spec.logs_dir, &volumes);

        assert_eq!(
            layout.binds,
            vec![
                "/home/me/proj/.swarm/upstream.git:/swarm/upstream.git".to_string(),
                "/home/me/proj/.swarm/logs:/swarm/logs".to_string(),
                "/home/me/proj/agents/prompts:/swarm/prompts:ro".to_string(),
                "/cache:/root/.cache".to_string(),
            ]
        );
        assert!(layout.env.contains(&format!("{}=/swarm/upstream.git", env::UPSTREAM)));
        assert!(layout.env.contains(&format!("{}=/swarm/workspace", env::WORKSPACE)));
        assert!(layout.env.contains(&format!("{}=/swarm/prompts/REVIEWER.md", env::PROMPT_FILE)));
        assert!(layout.env.contains(&format!("{}=reviewer-0", env::AGENT_ID)));
    }

    #[test]
    fn test_labels_round_trip_identity() {
        let identity = spec().identity;
        assert_eq!(identity_from_labels(&labels(&identity)), Some(identity));
        assert_eq!(identity_from_labels(&HashMap::new()), None);
    }
}
