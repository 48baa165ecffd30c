// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Worker Loop
//!
//! The cycle every worker runs until it is told to stop:
//!
//! ```text
//! INIT → SYNC → BUILD_CONTEXT → EXECUTE → PUBLISH → IDLE → SYNC → ...
//! ```
//!
//! | Phase | Failure handling |
//! |-------|------------------|
//! | SYNC | Recoverable sync errors skip the cycle; an unavailable repository stops the worker |
//! | BUILD_CONTEXT | Missing instructions or status document are treated as empty |
//! | EXECUTE | Failure (or shutdown mid-run) is recorded; PUBLISH still runs |
//! | PUBLISH | Exhausted retries defer; local commits are kept for the next cycle |
//!
//! Lock markers the generator adds or deletes are kept out of the cycle commit
//! and replayed through [`TaskLock`] after the work is published. Claims that
//! lose to another worker are reported in the next cycle's context.
//!
//! Git work is blocking and runs on the blocking pool. The shutdown token is
//! observed while executing and while idle.

use chrono::Utc;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use swarm_core::domain::context::WorkContext;
use swarm_core::domain::identity::WorkerIdentity;
use swarm_core::domain::lock::ContestedClaim;
use swarm_core::domain::work::{ExecutionReport, WorkGenerator};
use swarm_core::infrastructure::git_sync::{PushOutcome, Reconciliation, SyncError};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::task_lock::{read_locks, LockError, MarkerResults, TaskLock};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("Blocking git task failed: {0}")]
    Join(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Init,
    Sync,
    BuildContext,
    Execute,
    Publish,
    Idle,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct WorkerLoopConfig {
    pub branch: String,
    pub tasks_dir: PathBuf,
    pub progress_file: PathBuf,
    /// Role instructions, re-read every cycle.
    pub prompt_file: Option<PathBuf>,
    pub test_command: Option<String>,
    pub idle: Duration,
    pub push_attempts: u32,
    pub history_depth: usize,
    /// Stop after this many cycles.
    pub max_cycles: Option<u64>,
}

impl Default for WorkerLoopConfig {
    fn default() -> Self {
        Self {
            branch: "main".to_string(),
            tasks_dir: PathBuf::from("current_tasks"),
            progress_file: PathBuf::from("PROGRESS.md"),
            prompt_file: None,
            test_command: None,
            idle: Duration::from_secs(10),
            push_attempts: 5,
            history_depth: 20,
            max_cycles: None,
        }
    }
}

/// What happened in one cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub iteration: u64,
    pub reconciliation: Option<Reconciliation>,
    /// `Err` carries the generator failure message.
    pub execution: Option<Result<ExecutionReport, String>>,
    pub committed: bool,
    pub push: Option<PushOutcome>,
    /// Claims and releases made through lock markers.
    pub markers: MarkerResults,
    /// Recoverable error that cut the cycle short.
    pub error: Option<String>,
}

impl CycleReport {
    fn new(iteration: u64) -> Self {
        Self {
            iteration,
            reconciliation: None,
            execution: None,
            committed: false,
            push: None,
            markers: MarkerResults::default(),
            error: None,
        }
    }

    pub fn published(&self) -> bool {
        self.push.as_ref().is_some_and(|p| !p.is_deferred())
    }
}

pub struct WorkerLoop<G: WorkGenerator> {
    identity: WorkerIdentity,
    workdir: PathBuf,
    lock: Arc<Mutex<TaskLock>>,
    generator: Arc<G>,
    config: WorkerLoopConfig,
    state: WorkerState,
    iteration: u64,
    /// Lost claims waiting to be reported in the next context.
    contested: Vec<ContestedClaim>,
    shutdown: CancellationToken,
}

impl<G: WorkGenerator + 'static> WorkerLoop<G> {
    pub fn new(lock: TaskLock, generator: Arc<G>, config: WorkerLoopConfig) -> Self {
        let identity = lock.sync().identity().clone();
        let workdir = lock.sync().workdir().to_path_buf();
        Self {
            identity,
            workdir,
            lock: Arc::new(Mutex::new(lock)),
            generator,
            config,
            state: WorkerState::Init,
            iteration: 0,
            contested: Vec::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Get a handle to trigger shutdown
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn identity(&self) -> &WorkerIdentity {
        &self.identity
    }

    /// Shared handle on the task lock, for claims made outside the cycle.
    pub fn task_lock(&self) -> Arc<Mutex<TaskLock>> {
        self.lock.clone()
    }

    /// Run cycles until shutdown or `max_cycles`. Returns the cycle count.
    pub async fn run(&mut self) -> Result<u64, WorkerError> {
        info!(worker = %self.identity, "Worker loop starting");

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            let report = self.run_cycle().await?;
            if let Some(error) = &report.error {
                warn!(iteration = report.iteration, "Cycle ended early: {}", error);
            }

            if self.config.max_cycles.is_some_and(|max| self.iteration >= max) {
                info!(cycles = self.iteration, "Cycle limit reached");
                break;
            }

            self.state = WorkerState::Idle;
            tokio::select! {
                _ = tokio::time::sleep(self.config.idle) => {}
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown signal received while idle");
                    break;
                }
            }
        }

        self.state = WorkerState::Stopped;
        info!(worker = %self.identity.id, cycles = self.iteration, "Worker loop stopped");
        Ok(self.iteration)
    }

    /// One SYNC → BUILD_CONTEXT → EXECUTE → PUBLISH pass.
    pub async fn run_cycle(&mut self) -> Result<CycleReport, WorkerError> {
        self.iteration += 1;
        let mut report = CycleReport::new(self.iteration);
        metrics::counter!("swarm_cycles_total").increment(1);

        self.state = WorkerState::Sync;
        match self.blocking(|lock| lock.sync_mut().refresh()).await? {
            Ok(reconciliation) => {
                debug!(?reconciliation, "Synchronized with shared branch");
                report.reconciliation = Some(reconciliation);
            }
            Err(e) if e.is_recoverable() => {
                report.error = Some(format!("sync failed: {}", e));
                return Ok(report);
            }
            Err(e) => return Err(e.into()),
        }

        self.state = WorkerState::BuildContext;
        let context = match self.build_context(self.contested.clone()).await? {
            Ok(context) => {
                self.contested.clear();
                context
            }
            Err(e) => {
                report.error = Some(format!("context assembly failed: {}", e));
                return Ok(report);
            }
        };

        self.state = WorkerState::Execute;
        let execution = tokio::select! {
            result = self.generator.execute(&context, &self.workdir) => {
                result.map_err(|e| e.to_string())
            }
            _ = self.shutdown.cancelled() => {
                Err("interrupted by shutdown".to_string())
            }
        };
        match &execution {
            Ok(r) => debug!(exit_code = ?r.exit_code, "Work generator finished"),
            Err(e) => {
                metrics::counter!("swarm_execute_failures_total").increment(1);
                warn!(iteration = self.iteration, "Work generator failed: {}", e);
            }
        }
        report.execution = Some(execution);

        self.state = WorkerState::Publish;
        let message = format!("{}: cycle {}", self.identity.id, self.iteration);
        let attempts = self.config.push_attempts;
        let published = self
            .blocking(move |lock| -> Result<(bool, PushOutcome, MarkerResults), LockError> {
                let edits = lock.withhold_marker_edits()?;
                let sync = lock.sync_mut();
                let committed = sync.commit_all(&message)?.is_some();
                let outcome = sync.push_with_retry(attempts)?;
                let markers = if edits.is_empty() {
                    MarkerResults::default()
                } else {
                    lock.apply_marker_edits(edits)?
                };
                Ok((committed, outcome, markers))
            })
            .await?;
        match published {
            Ok((committed, outcome, markers)) => {
                report.committed = committed;
                if outcome.is_deferred() {
                    metrics::counter!("swarm_push_deferred_total").increment(1);
                }
                report.push = Some(outcome);
                self.contested = markers.contested().collect();
                report.markers = markers;
            }
            Err(e) if e.is_recoverable() => report.error = Some(format!("publish failed: {}", e)),
            Err(e) => return Err(e.into()),
        }

        Ok(report)
    }

    async fn build_context(
        &self,
        contested_claims: Vec<ContestedClaim>,
    ) -> Result<Result<WorkContext, SyncError>, WorkerError> {
        let tasks_dir = self.config.tasks_dir.clone();
        let progress = self.config.progress_file.clone();
        let depth = self.config.history_depth;
        let gathered = self
            .blocking(move |lock| -> Result<_, SyncError> {
                let sync = lock.sync();
                let locks = read_locks(sync, &tasks_dir)?;
                let history = sync.recent_history(depth)?;
                let status = sync.read_file(&progress)?.unwrap_or_default();
                Ok((locks, history, status))
            })
            .await?;
        let (locks, history, status_document) = match gathered {
            Ok(parts) => parts,
            Err(e) => return Ok(Err(e)),
        };

        let instructions = match &self.config.prompt_file {
            Some(path) => match tokio::fs::read_to_string(path).await {
                Ok(text) => text,
                Err(e) => {
                    warn!("Cannot read prompt file {:?}: {}", path, e);
                    String::new()
                }
            },
            None => String::new(),
        };

        Ok(Ok(WorkContext {
            identity: self.identity.clone(),
            iteration: self.iteration,
            branch: self.config.branch.clone(),
            locks,
            contested_claims,
            history,
            status_document,
            instructions,
            test_command: self.config.test_command.clone(),
            built_at: Utc::now(),
        }))
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, WorkerError>
    where
        T: Send + 'static,
        F: FnOnce(&mut TaskLock) -> T + Send + 'static,
    {
        let lock = self.lock.clone();
        tokio::task::spawn_blocking(move || f(&mut lock.lock()))
            .await
            .map_err(|e| WorkerError::Join(e.to_string()))
    }
}
