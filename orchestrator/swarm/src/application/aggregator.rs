// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! State Aggregator
//!
//! Read-only observer of the swarm. It keeps a private mirror of the shared
//! branch, joins the lock records found there with the launcher's process
//! table and lists the session logs. Nothing it does is visible to workers.
//!
//! Snapshots are eventually consistent: unpublished worker commits are
//! absent, and a lock can briefly show an owner that has just exited.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use swarm_core::domain::runtime::{WorkerLauncher, WorkerProcess};
use swarm_core::domain::snapshot::{LockView, LogFileInfo, SwarmSnapshot};
use swarm_core::infrastructure::git_sync::{SyncClient, SyncError};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::task_lock::read_locks;

const LOG_EXTENSION: &str = "log";

#[derive(Debug, Error)]
pub enum AggregateError {
    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("Failed to read logs directory {path}: {source}")]
    Logs {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Blocking git task failed: {0}")]
    Join(String),
}

pub struct StateAggregator<L: WorkerLauncher> {
    launcher: Arc<L>,
    mirror: Arc<Mutex<SyncClient>>,
    tasks_dir: PathBuf,
    progress_file: PathBuf,
    logs_dir: PathBuf,
    history_depth: usize,
}

impl<L: WorkerLauncher> StateAggregator<L> {
    /// `mirror` should be a dedicated working copy; it is hard-reset on every
    /// snapshot.
    pub fn new(
        launcher: Arc<L>,
        mirror: SyncClient,
        tasks_dir: impl Into<PathBuf>,
        progress_file: impl Into<PathBuf>,
        logs_dir: impl Into<PathBuf>,
        history_depth: usize,
    ) -> Self {
        Self {
            launcher,
            mirror: Arc::new(Mutex::new(mirror)),
            tasks_dir: tasks_dir.into(),
            progress_file: progress_file.into(),
            logs_dir: logs_dir.into(),
            history_depth,
        }
    }

    /// Take one snapshot. An unreachable launcher yields an empty process
    /// table rather than an error.
    pub async fn snapshot(&self) -> Result<SwarmSnapshot, AggregateError> {
        let processes = match self.launcher.list().await {
            Ok(processes) => processes,
            Err(e) => {
                warn!("Process table unavailable: {}", e);
                Vec::new()
            }
        };

        let mirror = self.mirror.clone();
        let tasks_dir = self.tasks_dir.clone();
        let progress = self.progress_file.clone();
        let depth = self.history_depth;
        let (head, records, history, status_document) = tokio::task::spawn_blocking(move || {
            let mut sync = mirror.lock();
            let head = sync.mirror()?;
            let records = read_locks(&sync, &tasks_dir)?;
            let history = sync.recent_history(depth)?;
            let status = sync.read_file(&progress)?.unwrap_or_default();
            Ok::<_, SyncError>((head, records, history, status))
        })
        .await
        .map_err(|e| AggregateError::Join(e.to_string()))??;

        let locks = records
            .into_iter()
            .map(|record| LockView {
                owner_running: owner_running(&processes, &record.owner),
                record,
            })
            .collect();

        let snapshot = SwarmSnapshot {
            taken_at: Utc::now(),
            head: Some(head.to_string()),
            locks,
            history,
            processes,
            log_files: self.log_files().await?,
            status_document,
        };
        debug!(
            locks = snapshot.locks.len(),
            workers = snapshot.processes.len(),
            "Snapshot assembled"
        );
        Ok(snapshot)
    }

    /// Session logs, most recently modified first.
    pub async fn log_files(&self) -> Result<Vec<LogFileInfo>, AggregateError> {
        list_log_files(&self.logs_dir).await
    }

    /// Snapshot every `interval` until `shutdown` fires, handing each one to
    /// `sink`. Failed snapshots are logged and skipped.
    pub async fn watch<F>(&self, interval: Duration, shutdown: CancellationToken, mut sink: F)
    where
        F: FnMut(&SwarmSnapshot),
    {
        let mut tick = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    match self.snapshot().await {
                        Ok(snapshot) => sink(&snapshot),
                        Err(e) => warn!("Snapshot failed: {}", e),
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("Shutdown signal received, stopping watch");
                    break;
                }
            }
        }
    }
}

/// `*.log` files in `logs_dir`, most recently modified first. A missing
/// directory yields an empty list.
pub async fn list_log_files(logs_dir: &Path) -> Result<Vec<LogFileInfo>, AggregateError> {
    let logs_err = |source| AggregateError::Logs {
        path: logs_dir.to_path_buf(),
        source,
    };
    let mut dir = match tokio::fs::read_dir(logs_dir).await {
        Ok(dir) => dir,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(logs_err(e)),
    };

    let mut files = Vec::new();
    while let Some(entry) = dir.next_entry().await.map_err(logs_err)? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(LOG_EXTENSION) {
            continue;
        }
        let metadata = entry.metadata().await.map_err(logs_err)?;
        if !metadata.is_file() {
            continue;
        }
        files.push(LogFileInfo {
            name: entry.file_name().to_string_lossy().into_owned(),
            size_bytes: metadata.len(),
            modified: metadata.modified().ok().map(DateTime::<Utc>::from),
        });
    }
    files.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| a.name.cmp(&b.name)));
    Ok(files)
}

fn owner_running(processes: &[WorkerProcess], owner: &str) -> bool {
    processes.iter().any(|p| p.is_running() && p.identity.id == owner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::task_lock::TaskLock;
    use async_trait::async_trait;
    use swarm_core::domain::identity::{Provider, WorkerIdentity};
    use swarm_core::domain::runtime::{InstanceId, LaunchError, WorkerSpec};
    use swarm_core::infrastructure::upstream::{init_upstream_repo, operator_identity};
    use tempfile::TempDir;

    struct FixedLauncher {
        table: Vec<WorkerProcess>,
    }

    #[async_trait]
    impl WorkerLauncher for FixedLauncher {
        fn kind(&self) -> &'static str {
            "fixed"
        }
        async fn start(&self, _spec: &WorkerSpec) -> Result<WorkerProcess, LaunchError> {
            Err(LaunchError::Unavailable("read-only".to_string()))
        }
        async fn list(&self) -> Result<Vec<WorkerProcess>, LaunchError> {
            Ok(self.table.clone())
        }
        async fn signal(&self, _worker: &WorkerProcess) -> Result<(), LaunchError> {
            Ok(())
        }
        async fn is_running(&self, worker: &WorkerProcess) -> Result<bool, LaunchError> {
            Ok(worker.is_running())
        }
        async fn kill(&self, _worker: &WorkerProcess) -> Result<(), LaunchError> {
            Ok(())
        }
        async fn reap(&self, _worker: &WorkerProcess) -> Result<(), LaunchError> {
            Ok(())
        }
    }

    fn process(id: &str, state: &str) -> WorkerProcess {
        WorkerProcess {
            identity: WorkerIdentity::new(id, "generalist", Provider::Anthropic, "claude-opus-4-20250514"),
            instance: InstanceId::new(format!("pid-{}", id)),
            started_at: Utc::now(),
            state: state.to_string(),
        }
    }

    fn setup() -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let upstream = dir.path().join("upstream.git");
        init_upstream_repo(&upstream, None, "main", "current_tasks", "PROGRESS.md").unwrap();
        (dir, upstream)
    }

    fn task_lock(dir: &TempDir, upstream: &Path, id: &str) -> TaskLock {
        let identity = WorkerIdentity::new(id, "generalist", Provider::Anthropic, "claude-opus-4-20250514");
        let sync = SyncClient::initialize(upstream, "main", &dir.path().join(id), identity).unwrap();
        TaskLock::new(sync, "current_tasks", 3)
    }

    fn aggregator(dir: &TempDir, upstream: &Path, table: Vec<WorkerProcess>) -> StateAggregator<FixedLauncher> {
        let mirror = SyncClient::initialize(upstream, "main", &dir.path().join("_monitor"), operator_identity()).unwrap();
        StateAggregator::new(
            Arc::new(FixedLauncher { table }),
            mirror,
            "current_tasks",
            "PROGRESS.md",
            dir.path().join("logs"),
            10,
        )
    }

    #[tokio::test]
    async fn test_snapshot_joins_locks_with_process_table() {
        let (dir, upstream) = setup();
        task_lock(&dir, &upstream, "w0").acquire("parser", "").unwrap();
        task_lock(&dir, &upstream, "w1").acquire("docs", "").unwrap();

        let agg = aggregator(&dir, &upstream, vec![process("w0", "running"), process("w1", "exited")]);
        let snap = agg.snapshot().await.unwrap();

        assert_eq!(snap.locks.len(), 2);
        let docs = snap.locks.iter().find(|l| l.record.task_id == "docs").unwrap();
        assert!(!docs.owner_running);
        let parser = snap.locks.iter().find(|l| l.record.task_id == "parser").unwrap();
        assert!(parser.owner_running);
        assert_eq!(snap.orphaned_locks().count(), 1);
        assert!(snap.status_document.starts_with("# Progress"));
        assert_eq!(snap.history[0].summary, "w1: lock docs");
    }

    #[tokio::test]
    async fn test_unpublished_work_is_not_visible() {
        let (dir, upstream) = setup();
        let mut w0 = task_lock(&dir, &upstream, "w0");
        w0.sync().write_file(Path::new("draft.txt"), "local\n").unwrap();
        w0.sync_mut().commit_all("w0: draft").unwrap();

        let agg = aggregator(&dir, &upstream, vec![]);
        let before = agg.snapshot().await.unwrap();
        assert!(before.history.iter().all(|c| c.summary != "w0: draft"));

        w0.sync_mut().push_with_retry(3).unwrap();
        let after = agg.snapshot().await.unwrap();
        assert_eq!(after.history[0].summary, "w0: draft");
        assert_ne!(before.head, after.head);
    }

    #[tokio::test]
    async fn test_log_files_sorted_newest_first() {
        let (dir, upstream) = setup();
        let logs = dir.path().join("logs");
        std::fs::create_dir_all(&logs).unwrap();
        std::fs::write(logs.join("w0_20260101_000000.log"), "old").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        std::fs::write(logs.join("w1_20260101_000100.log"), "newer!").unwrap();
        std::fs::write(logs.join("w0.console"), "ignored").unwrap();

        let agg = aggregator(&dir, &upstream, vec![]);
        let files = agg.log_files().await.unwrap();
        let names: Vec<_> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["w1_20260101_000100.log", "w0_20260101_000000.log"]);
        assert_eq!(files[0].size_bytes, 6);
    }

    #[tokio::test]
    async fn test_watch_stops_on_cancel() {
        let (dir, upstream) = setup();
        let agg = aggregator(&dir, &upstream, vec![process("w0", "running")]);
        let token = CancellationToken::new();
        let mut seen = 0;

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            canceller.cancel();
        });
        agg.watch(Duration::from_millis(50), token, |snap| {
            assert_eq!(snap.running_workers(), 1);
            seen += 1;
        })
        .await;
        assert!(seen >= 1);
    }
}
