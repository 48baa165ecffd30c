// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Local process launcher
//!
//! Starts each worker as a separate OS process in its own process group and
//! records it in a JSON registry so later invocations (`status`, `stop`) can
//! find it. A registry pid only counts as the worker while it still leads
//! its own process group and, on Linux, carries the kernel start time recorded
//! at spawn. A recycled pid is treated as an exited worker and never signalled.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::domain::identity::WorkerIdentity;
use crate::domain::runtime::{InstanceId, LaunchError, WorkerLauncher, WorkerProcess, WorkerSpec};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RegistryEntry {
    identity: WorkerIdentity,
    pid: u32,
    started_at: DateTime<Utc>,
    /// Kernel start time in clock ticks since boot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    start_ticks: Option<u64>,
}

pub struct LocalProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
    registry: PathBuf,
    /// Children spawned by this process; waited on so exited workers are
    /// not mistaken for live zombies.
    children: Mutex<HashMap<u32, Child>>,
}

impl LocalProcessLauncher {
    /// Launch workers as `program args...` with the worker environment.
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, registry: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args,
            registry: registry.into(),
            children: Mutex::new(HashMap::new()),
        }
    }

    /// Re-execute the running binary as `<exe> worker`.
    pub fn for_current_exe(registry: impl Into<PathBuf>) -> Result<Self, LaunchError> {
        let exe = std::env::current_exe()
            .map_err(|e| LaunchError::Unavailable(format!("cannot resolve current executable: {}", e)))?;
        Ok(Self::new(exe, vec!["worker".to_string()], registry))
    }

    pub fn registry_path(&self) -> &Path {
        &self.registry
    }

    fn load_registry(&self) -> Result<Vec<RegistryEntry>, LaunchError> {
        match std::fs::read_to_string(&self.registry) {
            Ok(content) if content.trim().is_empty() => Ok(Vec::new()),
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                LaunchError::Unavailable(format!("corrupt registry {:?}: {}", self.registry, e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(LaunchError::Unavailable(format!("cannot read {:?}: {}", self.registry, e))),
        }
    }

    fn save_registry(&self, entries: &[RegistryEntry]) -> Result<(), LaunchError> {
        let io_err = |e: std::io::Error| LaunchError::Unavailable(format!("cannot write {:?}: {}", self.registry, e));
        if let Some(parent) = self.registry.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_string_pretty(entries)
            .map_err(|e| LaunchError::Unavailable(format!("cannot encode registry: {}", e)))?;
        let tmp = self.registry.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(io_err)?;
        std::fs::rename(&tmp, &self.registry).map_err(io_err)
    }

    async fn alive(&self, entry: &RegistryEntry) -> bool {
        let mut children = self.children.lock().await;
        if let Some(child) = children.get_mut(&entry.pid) {
            return matches!(child.try_wait(), Ok(None));
        }
        drop(children);
        is_same_process(entry)
    }

    /// The registry entry behind `worker`, if that process is still running.
    async fn live_entry(&self, worker: &WorkerProcess) -> Result<Option<RegistryEntry>, LaunchError> {
        let pid = parse_pid(worker)?;
        let Some(entry) = self.load_registry()?.into_iter().find(|e| e.pid == pid) else {
            return Ok(None);
        };
        Ok(self.alive(&entry).await.then_some(entry))
    }

    async fn to_process(&self, entry: RegistryEntry) -> WorkerProcess {
        let state = if self.alive(&entry).await { "running" } else { "exited" };
        WorkerProcess {
            identity: entry.identity,
            instance: InstanceId::new(entry.pid.to_string()),
            started_at: entry.started_at,
            state: state.to_string(),
        }
    }
}

#[async_trait]
impl WorkerLauncher for LocalProcessLauncher {
    fn kind(&self) -> &'static str {
        "process"
    }

    async fn start(&self, spec: &WorkerSpec) -> Result<WorkerProcess, LaunchError> {
        std::fs::create_dir_all(&spec.logs_dir)
            .map_err(|e| LaunchError::SpawnFailed(format!("cannot create {:?}: {}", spec.logs_dir, e)))?;
        let console_path = spec.logs_dir.join(format!("{}.console", spec.identity.id));
        let console = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&console_path)
            .map_err(|e| LaunchError::SpawnFailed(format!("cannot open {:?}: {}", console_path, e)))?;
        let console_err = console
            .try_clone()
            .map_err(|e| LaunchError::SpawnFailed(e.to_string()))?;

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(spec.env_vars())
            .stdin(Stdio::null())
            .stdout(Stdio::from(console))
            .stderr(Stdio::from(console_err));
        // Own process group: a Ctrl-C aimed at the launcher must not reach workers.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let child = command
            .spawn()
            .map_err(|e| LaunchError::SpawnFailed(format!("{:?}: {}", self.program, e)))?;
        let pid = child.id();
        let started_at = Utc::now();
        self.children.lock().await.insert(pid, child);

        let mut entries = self.load_registry()?;
        entries.retain(|e| e.identity.id != spec.identity.id);
        entries.push(RegistryEntry {
            identity: spec.identity.clone(),
            pid,
            started_at,
            start_ticks: process_start_ticks(pid),
        });
        self.save_registry(&entries)?;

        info!(worker = %spec.identity.id, pid, "Started worker process");
        Ok(WorkerProcess {
            identity: spec.identity.clone(),
            instance: InstanceId::new(pid.to_string()),
            started_at,
            state: "running".to_string(),
        })
    }

    async fn list(&self) -> Result<Vec<WorkerProcess>, LaunchError> {
        let mut processes = Vec::new();
        for entry in self.load_registry()? {
            processes.push(self.to_process(entry).await);
        }
        processes.sort_by(|a, b| a.identity.id.cmp(&b.identity.id));
        Ok(processes)
    }

    async fn signal(&self, worker: &WorkerProcess) -> Result<(), LaunchError> {
        let Some(entry) = self.live_entry(worker).await? else {
            debug!(worker = %worker.identity.id, "Worker process already gone, not signalling");
            return Ok(());
        };
        debug!(worker = %worker.identity.id, pid = entry.pid, "Sending SIGTERM");
        send_signal(entry.pid, Signal::Terminate).map_err(LaunchError::SignalFailed)
    }

    async fn is_running(&self, worker: &WorkerProcess) -> Result<bool, LaunchError> {
        Ok(self.live_entry(worker).await?.is_some())
    }

    async fn kill(&self, worker: &WorkerProcess) -> Result<(), LaunchError> {
        let Some(entry) = self.live_entry(worker).await? else {
            debug!(worker = %worker.identity.id, "Worker process already gone, not killing");
            return Ok(());
        };
        warn!(worker = %worker.identity.id, pid = entry.pid, "Sending SIGKILL");
        send_signal(entry.pid, Signal::Kill).map_err(LaunchError::TerminationFailed)
    }

    async fn reap(&self, worker: &WorkerProcess) -> Result<(), LaunchError> {
        let pid = parse_pid(worker)?;
        if let Some(mut child) = self.children.lock().await.remove(&pid) {
            if let Err(e) = child.try_wait() {
                debug!(pid, "Failed to reap child: {}", e);
            }
        }
        let mut entries = self.load_registry()?;
        entries.retain(|e| e.pid != pid);
        self.save_registry(&entries)
    }
}

fn parse_pid(worker: &WorkerProcess) -> Result<u32, LaunchError> {
    worker
        .instance
        .as_str()
        .parse::<u32>()
        .map_err(|_| LaunchError::InstanceNotFound(format!("invalid pid '{}'", worker.instance.as_str())))
}

enum Signal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: Signal) -> Result<(), String> {
    let signo = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid as i32, signo) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        // Already gone is the outcome we wanted.
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        return Err(format!("signal {} to {}: {}", signo, pid, err));
    }
    Ok(())
}

#[cfg(not(unix))]
fn send_signal(pid: u32, _signal: Signal) -> Result<(), String> {
    Err(format!("signalling process {} is not supported on this platform", pid))
}

#[cfg(target_os = "linux")]
fn process_start_ticks(pid: u32) -> Option<u64> {
    let stat = procfs::process::Process::new(pid as i32).and_then(|p| p.stat());
    match stat {
        Ok(stat) => Some(stat.starttime),
        Err(e) => {
            debug!(pid, "Cannot read process start time: {}", e);
            None
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn process_start_ticks(_pid: u32) -> Option<u64> {
    None
}

/// Whether the pid in `entry` still names the worker that was registered.
#[cfg(target_os = "linux")]
fn is_same_process(entry: &RegistryEntry) -> bool {
    let Ok(stat) = procfs::process::Process::new(entry.pid as i32).and_then(|p| p.stat()) else {
        return false;
    };
    // Workers are spawned as process group leaders.
    if stat.pgrp != entry.pid as i32 || stat.state == 'Z' {
        return false;
    }
    entry.start_ticks.is_none_or(|ticks| ticks == stat.starttime)
}

#[cfg(all(unix, not(target_os = "linux")))]
fn is_same_process(entry: &RegistryEntry) -> bool {
    let pid = entry.pid as i32;
    // SAFETY: signal 0 only performs the permission and existence check.
    let rc = unsafe { libc::kill(pid, 0) };
    let exists = rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM);
    // SAFETY: getpgid(2) has no memory-safety preconditions.
    exists && unsafe { libc::getpgid(pid) } == pid
}

#[cfg(not(unix))]
fn is_same_process(_entry: &RegistryEntry) -> bool {
    false
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::domain::identity::Provider;
    use crate::domain::runtime::ResourceLimits;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tempfile::TempDir;

    fn spec(dir: &Path, id: usize) -> WorkerSpec {
        WorkerSpec {
            identity: WorkerIdentity::for_slot("generalist", id, Provider::Anthropic, "claude-opus-4-20250514"),
            upstream: dir.join("upstream.git"),
            branch: "main".to_string(),
            workspace: dir.join(format!("ws-{}", id)),
            logs_dir: dir.join("logs"),
            prompt_file: None,
            test_command: None,
            agent_command: "true".to_string(),
            tasks_dir: "current_tasks".to_string(),
            progress_file: "PROGRESS.md".to_string(),
            idle_seconds: 1,
            push_attempts: 1,
            lock_attempts: 1,
            history_depth: 5,
            resources: ResourceLimits::default(),
            extra_env: BTreeMap::new(),
        }
    }

    async fn wait_until_exited(launcher: &LocalProcessLauncher, worker: &WorkerProcess) -> bool {
        for _ in 0..50 {
            if !launcher.is_running(worker).await.unwrap() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_start_passes_environment_and_registers() {
        let dir = TempDir::new().unwrap();
        let launcher = LocalProcessLauncher::new(
            "sh",
            vec!["-c".to_string(), "echo \"$SWARM_AGENT_ID on $SWARM_BRANCH\"".to_string()],
            dir.path().join("fleet.json"),
        );

        let worker = launcher.start(&spec(dir.path(), 0)).await.unwrap();
        assert_eq!(worker.identity.id, "generalist-0");
        assert!(wait_until_exited(&launcher, &worker).await);

        let console = std::fs::read_to_string(dir.path().join("logs/generalist-0.console")).unwrap();
        assert_eq!(console.trim(), "generalist-0 on main");

        let listed = launcher.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].state, "exited");

        launcher.reap(&worker).await.unwrap();
        assert!(launcher.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_signal_stops_long_running_worker() {
        let dir = TempDir::new().unwrap();
        let launcher = LocalProcessLauncher::new(
            "sh",
            vec!["-c".to_string(), "exec sleep 30".to_string()],
            dir.path().join("fleet.json"),
        );

        let worker = launcher.start(&spec(dir.path(), 1)).await.unwrap();
        assert!(launcher.is_running(&worker).await.unwrap());

        launcher.signal(&worker).await.unwrap();
        assert!(wait_until_exited(&launcher, &worker).await);
        // Signalling an exited process is not an error.
        launcher.kill(&worker).await.unwrap();
    }

    fn entry(id: usize, pid: u32, start_ticks: Option<u64>) -> RegistryEntry {
        RegistryEntry {
            identity: WorkerIdentity::for_slot("generalist", id, Provider::Anthropic, "claude-opus-4-20250514"),
            pid,
            started_at: Utc::now(),
            start_ticks,
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_recycled_pid_is_never_signalled() {
        use std::os::unix::process::CommandExt;

        let dir = TempDir::new().unwrap();
        let registry = dir.path().join("fleet.json");
        // Stand-ins for unrelated processes that inherited registered pids.
        let mut leader = Command::new("sleep").arg("30").process_group(0).spawn().unwrap();
        let mut member = Command::new("sleep").arg("30").spawn().unwrap();
        let ticks = process_start_ticks(leader.id()).unwrap();

        let launcher = LocalProcessLauncher::new("sh", vec![], &registry);
        launcher
            .save_registry(&[
                entry(0, leader.id(), Some(ticks + 1)),
                entry(1, member.id(), None),
                entry(2, leader.id(), Some(ticks)),
            ])
            .unwrap();

        let listed = launcher.list().await.unwrap();
        let states: Vec<_> = listed.iter().map(|w| w.state.as_str()).collect();
        assert_eq!(states, vec!["exited", "exited", "running"]);

        for worker in &listed[..2] {
            assert!(!launcher.is_running(worker).await.unwrap());
            launcher.signal(worker).await.unwrap();
            launcher.kill(worker).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(leader.try_wait().unwrap().is_none());
        assert!(member.try_wait().unwrap().is_none());

        leader.kill().unwrap();
        member.kill().unwrap();
        leader.wait().unwrap();
        member.wait().unwrap();
    }

    #[tokio::test]
    async fn test_registry_survives_new_launcher_instance() {
        let dir = TempDir::new().unwrap();
        let registry = dir.path().join("fleet.json");
        let first = LocalProcessLauncher::new("sh", vec!["-c".to_string(), "exec sleep 30".to_string()], &registry);
        let worker = first.start(&spec(dir.path(), 2)).await.unwrap();

        let second = LocalProcessLauncher::new("sh", vec![], &registry);
        let listed = second.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].is_running());

        first.kill(&worker).await.unwrap();
        assert!(wait_until_exited(&first, &worker).await);
    }
}
