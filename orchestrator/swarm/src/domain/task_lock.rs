// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Task Locks
//!
//! Advisory, repository-resident claims on tasks. A worker holds a task once
//! the commit adding `<tasks_dir>/<task>.lock` with its id on the first line
//! has been published to the shared branch.
//!
//! Mutual exclusion comes from the compare-and-swap publish of
//! [`SyncClient::try_publish`]: after every rejection the freshly fetched
//! remote tip is inspected before reconciling, so a competing claim is never
//! overwritten by local-preference merging. A claim is only published on top
//! of a tip that was seen to be free of a foreign claim.
//!
//! Agents claim and release tasks by editing markers in their working copy.
//! Those edits never reach the shared branch as part of an ordinary commit:
//! [`TaskLock::withhold_marker_edits`] takes them out of the working copy and
//! [`TaskLock::apply_marker_edits`] replays them through `acquire` and
//! `release`.
//!
//! Locks never expire. Stale claims left by dead workers are cleared with
//! [`TaskLock::force_release`].

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use swarm_core::domain::lock::{
    lock_path, sanitize_task_id, ContestedClaim, LockRecord, LOCK_EXTENSION,
};
use swarm_core::infrastructure::git_sync::{PublishAttempt, PushStatus, SyncClient, SyncError};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Invalid task id '{0}'")]
    InvalidTaskId(String),

    #[error("Task '{task_id}' is held by {holder}")]
    NotOwner { task_id: String, holder: String },

    #[error(transparent)]
    Sync(#[from] SyncError),
}

impl LockError {
    /// Whether retrying on a later cycle can succeed.
    pub fn is_recoverable(&self) -> bool {
        match self {
            LockError::Sync(e) => e.is_recoverable(),
            _ => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// The claim is published (or was already ours).
    Acquired,
    /// Another worker holds the task.
    Contested { holder: String },
    /// Publishing kept being rejected; the local claim was withdrawn.
    Deferred,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    /// No claim existed.
    Absent,
    /// Removal is committed locally and will be published on a later push.
    Deferred,
}

/// Marker edits found in the working copy and not yet committed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarkerEdits {
    /// Added or rewritten markers as `(task id, description)`.
    pub claims: Vec<(String, String)>,
    /// Task ids whose committed marker was deleted.
    pub releases: Vec<String>,
}

impl MarkerEdits {
    pub fn is_empty(&self) -> bool {
        self.claims.is_empty() && self.releases.is_empty()
    }
}

/// What became of each marker edit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarkerResults {
    pub claims: Vec<(String, AcquireOutcome)>,
    pub releases: Vec<(String, ReleaseOutcome)>,
}

impl MarkerResults {
    /// Claims that lost to a record published by another worker.
    pub fn contested(&self) -> impl Iterator<Item = ContestedClaim> + '_ {
        self.claims.iter().filter_map(|(task_id, outcome)| match outcome {
            AcquireOutcome::Contested { holder } => Some(ContestedClaim {
                task_id: task_id.clone(),
                holder: holder.clone(),
            }),
            _ => None,
        })
    }
}

/// Task claims for one worker, operating on that worker's working copy.
pub struct TaskLock {
    sync: SyncClient,
    tasks_dir: PathBuf,
    attempts: u32,
}

impl TaskLock {
    pub fn new(sync: SyncClient, tasks_dir: impl Into<PathBuf>, attempts: u32) -> Self {
        Self {
            sync,
            tasks_dir: tasks_dir.into(),
            attempts: attempts.max(1),
        }
    }

    pub fn sync(&self) -> &SyncClient {
        &self.sync
    }

    pub fn sync_mut(&mut self) -> &mut SyncClient {
        &mut self.sync
    }

    pub fn tasks_dir(&self) -> &Path {
        &self.tasks_dir
    }

    fn me(&self) -> &str {
        &self.sync.identity().id
    }

    fn marker(&self, task_id: &str) -> Result<PathBuf, LockError> {
        if sanitize_task_id(task_id).is_empty() {
            return Err(LockError::InvalidTaskId(task_id.to_string()));
        }
        Ok(lock_path(&self.tasks_dir, task_id))
    }

    /// Claim `task_id` for this worker.
    pub fn acquire(&mut self, task_id: &str, description: &str) -> Result<AcquireOutcome, LockError> {
        let path = self.marker(task_id)?;
        self.sync.refresh()?;

        if let Some(existing) = self.read_record(&path)? {
            if existing.owner == self.me() {
                debug!(task = task_id, "Task already held");
                return Ok(AcquireOutcome::Acquired);
            }
            return Ok(AcquireOutcome::Contested { holder: existing.owner });
        }

        let record = LockRecord::new(task_id.trim(), self.me(), description);
        match self.publish_claim(&path, &record) {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                // No unpublished claim may outlive a failed acquire.
                warn!(task = task_id, "Claim failed, withdrawing it: {}", e);
                if let Err(retract) = self.retract(&path, task_id) {
                    warn!(task = task_id, "Failed to withdraw claim: {}", retract);
                }
                Err(e)
            }
        }
    }

    fn publish_claim(&mut self, path: &Path, record: &LockRecord) -> Result<AcquireOutcome, LockError> {
        let task_id = record.task_id.as_str();
        self.sync.write_file(path, &record.render())?;
        self.sync.commit_all(&format!("{}: lock {}", self.me(), task_id))?;

        for attempt in 1..=self.attempts {
            match self.sync.try_publish()? {
                PublishAttempt::Accepted | PublishAttempt::UpToDate => {
                    metrics::counter!("swarm_locks_acquired_total").increment(1);
                    info!(task = task_id, attempt, "Acquired task lock");
                    return Ok(AcquireOutcome::Acquired);
                }
                PublishAttempt::Rejected => {
                    let remote = self.sync.fetch()?;
                    let holder = self
                        .sync
                        .read_remote_file(path)?
                        .and_then(|content| LockRecord::parse(&content, &file_stem(path)))
                        .map(|r| r.owner)
                        .filter(|owner| owner != self.me());
                    if let Some(holder) = holder {
                        self.retract(path, task_id)?;
                        self.sync.reconcile(remote)?;
                        metrics::counter!("swarm_locks_contested_total").increment(1);
                        info!(task = task_id, holder = %holder, "Task lock contested");
                        return Ok(AcquireOutcome::Contested { holder });
                    }
                    self.sync.reconcile(remote)?;
                }
            }
        }

        self.retract(path, task_id)?;
        warn!(task = task_id, attempts = self.attempts, "Task lock deferred after repeated rejections");
        Ok(AcquireOutcome::Deferred)
    }

    /// Release a claim held by this worker.
    pub fn release(&mut self, task_id: &str) -> Result<ReleaseOutcome, LockError> {
        self.release_inner(task_id, false)
    }

    /// Remove a claim regardless of who holds it.
    pub fn force_release(&mut self, task_id: &str) -> Result<ReleaseOutcome, LockError> {
        self.release_inner(task_id, true)
    }

    fn release_inner(&mut self, task_id: &str, force: bool) -> Result<ReleaseOutcome, LockError> {
        let path = self.marker(task_id)?;
        self.sync.refresh()?;

        let record = match self.read_record(&path)? {
            Some(record) => record,
            None if self.sync.read_file(&path)?.is_some() => {
                // Unparsable marker: only an operator may clear it.
                if !force {
                    return Err(LockError::NotOwner {
                        task_id: task_id.to_string(),
                        holder: "<unknown>".to_string(),
                    });
                }
                LockRecord::new(task_id, "<unknown>", "")
            }
            None => return Ok(ReleaseOutcome::Absent),
        };
        if !force && record.owner != self.me() {
            return Err(LockError::NotOwner {
                task_id: task_id.to_string(),
                holder: record.owner,
            });
        }

        self.sync.remove_file(&path)?;
        let verb = if force { "force-release" } else { "release" };
        self.sync.commit_all(&format!("{}: {} {}", self.me(), verb, task_id.trim()))?;

        let outcome = self.sync.push_with_retry(self.attempts)?;
        match outcome.status {
            PushStatus::Published | PushStatus::UpToDate => {
                metrics::counter!("swarm_locks_released_total").increment(1);
                info!(task = task_id, holder = %record.owner, force, "Released task lock");
                Ok(ReleaseOutcome::Released)
            }
            PushStatus::Deferred => Ok(ReleaseOutcome::Deferred),
        }
    }

    /// Take uncommitted marker edits out of the working copy, restoring every
    /// marker to its committed content.
    pub fn withhold_marker_edits(&mut self) -> Result<MarkerEdits, LockError> {
        let mut paths: BTreeSet<PathBuf> = self.sync.list_dir(&self.tasks_dir)?.into_iter().collect();
        paths.extend(self.sync.list_committed_dir(&self.tasks_dir)?);

        let mut edits = MarkerEdits::default();
        for path in paths.into_iter().filter(|p| is_marker(p)) {
            let working = self.sync.read_file(&path)?;
            let committed = self.sync.read_committed_file(&path)?;
            let stem = file_stem(&path);
            match (working, committed) {
                (Some(working), Some(committed)) if working == committed => {}
                (Some(working), committed) => {
                    let (task_id, description) = match LockRecord::parse(&working, &stem) {
                        Some(record) if lock_path(&self.tasks_dir, &record.task_id) == path => {
                            (record.task_id, record.description)
                        }
                        Some(record) => (stem, record.description),
                        None => (stem, String::new()),
                    };
                    match committed {
                        Some(content) => self.sync.write_file(&path, &content)?,
                        None => {
                            self.sync.remove_file(&path)?;
                        }
                    }
                    debug!(task = %task_id, "Withheld claim marker");
                    edits.claims.push((task_id, description));
                }
                (None, Some(committed)) => {
                    let task_id = LockRecord::parse(&committed, &stem)
                        .map(|r| r.task_id)
                        .filter(|id| lock_path(&self.tasks_dir, id) == path)
                        .unwrap_or(stem);
                    self.sync.write_file(&path, &committed)?;
                    debug!(task = %task_id, "Withheld marker deletion");
                    edits.releases.push(task_id);
                }
                (None, None) => {}
            }
        }
        Ok(edits)
    }

    /// Replay withheld edits: releases first, then claims.
    pub fn apply_marker_edits(&mut self, edits: MarkerEdits) -> Result<MarkerResults, LockError> {
        let mut results = MarkerResults::default();
        for task_id in edits.releases {
            match self.release(&task_id) {
                Ok(outcome) => results.releases.push((task_id, outcome)),
                Err(LockError::NotOwner { holder, .. }) => {
                    warn!(task = %task_id, holder = %holder, "Ignoring deletion of a lock held by another worker");
                }
                Err(e) => return Err(e),
            }
        }
        for (task_id, description) in edits.claims {
            match self.acquire(&task_id, &description) {
                Ok(outcome) => results.claims.push((task_id, outcome)),
                Err(LockError::InvalidTaskId(id)) => warn!(task = %id, "Ignoring marker with unusable name"),
                Err(e) => return Err(e),
            }
        }
        Ok(results)
    }

    /// Claims present in the working copy, sorted by task id.
    pub fn enumerate(&self) -> Result<Vec<LockRecord>, LockError> {
        Ok(read_locks(&self.sync, &self.tasks_dir)?)
    }

    /// Current claim on `task_id` in the working copy.
    pub fn holder(&self, task_id: &str) -> Result<Option<LockRecord>, LockError> {
        let path = self.marker(task_id)?;
        self.read_record(&path)
    }

    fn read_record(&self, path: &Path) -> Result<Option<LockRecord>, LockError> {
        Ok(self
            .sync
            .read_file(path)?
            .and_then(|content| LockRecord::parse(&content, &file_stem(path))))
    }

    /// Withdraw an unpublished local claim with a compensating commit. A
    /// marker owned by someone else is left alone.
    fn retract(&mut self, path: &Path, task_id: &str) -> Result<(), LockError> {
        let ours = self.read_record(path)?.is_some_and(|r| r.owner == self.me());
        if ours && self.sync.remove_file(path)? {
            self.sync
                .commit_all(&format!("{}: withdraw lock {}", self.me(), task_id.trim()))?;
        }
        Ok(())
    }
}

/// Parse every lock marker under `tasks_dir` in `sync`'s working copy.
pub fn read_locks(sync: &SyncClient, tasks_dir: &Path) -> Result<Vec<LockRecord>, SyncError> {
    let mut records = Vec::new();
    for path in sync.list_dir(tasks_dir)? {
        if !is_marker(&path) {
            continue;
        }
        let Some(content) = sync.read_file(&path)? else {
            continue;
        };
        match LockRecord::parse(&content, &file_stem(&path)) {
            Some(record) => records.push(record),
            None => warn!(path = %path.display(), "Ignoring malformed lock marker"),
        }
    }
    records.sort_by(|a, b| a.task_id.cmp(&b.task_id));
    Ok(records)
}

fn is_marker(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(LOCK_EXTENSION)
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use swarm_core::domain::identity::{Provider, WorkerIdentity};
    use swarm_core::infrastructure::upstream::init_upstream_repo;
    use tempfile::TempDir;

    fn setup() -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let upstream = dir.path().join("upstream.git");
        init_upstream_repo(&upstream, None, "main", "current_tasks", "PROGRESS.md").unwrap();
        (dir, upstream)
    }

    fn lock(dir: &TempDir, upstream: &Path, id: &str) -> TaskLock {
        let identity = WorkerIdentity::new(id, "generalist", Provider::Anthropic, "claude-opus-4-20250514");
        let sync = SyncClient::initialize(upstream, "main", &dir.path().join(id), identity).unwrap();
        TaskLock::new(sync, "current_tasks", 3)
    }

    #[test]
    fn test_acquire_is_idempotent() {
        let (dir, upstream) = setup();
        let mut a = lock(&dir, &upstream, "a");
        assert_eq!(a.acquire("parser", "rewrite it").unwrap(), AcquireOutcome::Acquired);
        let head = a.sync().head().unwrap();
        assert_eq!(a.acquire("parser", "").unwrap(), AcquireOutcome::Acquired);
        assert_eq!(a.sync().head().unwrap(), head);
    }

    #[test]
    fn test_second_worker_sees_contest() {
        let (dir, upstream) = setup();
        let mut a = lock(&dir, &upstream, "a");
        let mut b = lock(&dir, &upstream, "b");

        assert_eq!(a.acquire("parser", "").unwrap(), AcquireOutcome::Acquired);
        assert_eq!(
            b.acquire("parser", "").unwrap(),
            AcquireOutcome::Contested { holder: "a".to_string() }
        );
    }

    #[test]
    fn test_racing_acquire_loses_to_published_claim() {
        let (dir, upstream) = setup();
        let mut a = lock(&dir, &upstream, "a");
        let mut b = lock(&dir, &upstream, "b");

        // b stages its claim from a stale view before a publishes.
        b.sync_mut().refresh().unwrap();
        let path = lock_path(Path::new("current_tasks"), "parser");
        b.sync().write_file(&path, &LockRecord::new("parser", "b", "").render()).unwrap();
        b.sync_mut().commit_all("b: lock parser").unwrap();

        assert_eq!(a.acquire("parser", "").unwrap(), AcquireOutcome::Acquired);

        assert_eq!(b.sync_mut().try_publish().unwrap(), PublishAttempt::Rejected);
        // A fresh acquire by b must not clobber a's published claim.
        b.sync_mut().remove_file(&path).unwrap();
        b.sync_mut().commit_all("b: withdraw").unwrap();
        assert_eq!(
            b.acquire("parser", "").unwrap(),
            AcquireOutcome::Contested { holder: "a".to_string() }
        );
        b.sync_mut().push_with_retry(3).unwrap();

        a.sync_mut().refresh().unwrap();
        assert_eq!(a.holder("parser").unwrap().unwrap().owner, "a");
    }

    #[test]
    fn test_release_then_reacquire_by_other() {
        let (dir, upstream) = setup();
        let mut a = lock(&dir, &upstream, "a");
        let mut b = lock(&dir, &upstream, "b");

        assert_eq!(a.acquire("docs", "").unwrap(), AcquireOutcome::Acquired);
        assert!(matches!(b.release("docs"), Err(LockError::NotOwner { .. })));
        assert_eq!(a.release("docs").unwrap(), ReleaseOutcome::Released);
        assert_eq!(a.release("docs").unwrap(), ReleaseOutcome::Absent);
        assert_eq!(b.acquire("docs", "").unwrap(), AcquireOutcome::Acquired);
    }

    #[test]
    fn test_force_release_clears_foreign_claim() {
        let (dir, upstream) = setup();
        let mut a = lock(&dir, &upstream, "a");
        let mut operator = lock(&dir, &upstream, "operator");

        a.acquire("orphan", "").unwrap();
        assert_eq!(operator.force_release("orphan").unwrap(), ReleaseOutcome::Released);
        a.sync_mut().refresh().unwrap();
        assert!(a.holder("orphan").unwrap().is_none());
    }

    #[test]
    fn test_enumerate_sorted_and_skips_malformed() {
        let (dir, upstream) = setup();
        let mut a = lock(&dir, &upstream, "a");
        a.acquire("zeta", "").unwrap();
        a.acquire("alpha", "").unwrap();
        a.sync().write_file(Path::new("current_tasks/junk.lock"), "no owner here\n").unwrap();
        a.sync().write_file(Path::new("current_tasks/notes.txt"), "agent: x\n").unwrap();

        let tasks: Vec<_> = a.enumerate().unwrap().into_iter().map(|r| r.task_id).collect();
        assert_eq!(tasks, vec!["alpha".to_string(), "zeta".to_string()]);
    }

    #[test]
    fn test_failed_claim_is_withdrawn() {
        let (dir, upstream) = setup();
        let mut a = lock(&dir, &upstream, "a");
        let mut b = lock(&dir, &upstream, "b");

        // A ref nested under b's staging ref makes every push from b fail.
        let bare = git2::Repository::open_bare(&upstream).unwrap();
        let tip = bare.refname_to_id("refs/heads/main").unwrap();
        bare.reference("refs/swarm/staging/b/blocker", tip, false, "block").unwrap();

        let err = b.acquire("parser", "").unwrap_err();
        assert!(matches!(err, LockError::Sync(SyncError::Transport(_))), "{:?}", err);
        assert!(b.holder("parser").unwrap().is_none());
        let marker = Path::new("current_tasks/parser.lock");
        assert!(b.sync().read_committed_file(marker).unwrap().is_none());

        assert_eq!(a.acquire("parser", "").unwrap(), AcquireOutcome::Acquired);
        bare.find_reference("refs/swarm/staging/b/blocker").unwrap().delete().unwrap();

        // b's leftover commits publish later without touching a's claim.
        assert_eq!(b.sync_mut().push_with_retry(3).unwrap().status, PushStatus::Published);
        assert_eq!(b.holder("parser").unwrap().unwrap().owner, "a");
        a.sync_mut().refresh().unwrap();
        assert_eq!(a.holder("parser").unwrap().unwrap().owner, "a");
    }

    #[test]
    fn test_marker_edits_are_withheld_and_replayed() {
        let (dir, upstream) = setup();
        let mut a = lock(&dir, &upstream, "a");
        a.acquire("docs", "").unwrap();

        a.sync()
            .write_file(Path::new("current_tasks/parser.lock"), "agent: a\ntask: parser\ntable driven\n")
            .unwrap();
        assert!(a.sync().remove_file(Path::new("current_tasks/docs.lock")).unwrap());

        let edits = a.withhold_marker_edits().unwrap();
        assert_eq!(edits.claims, vec![("parser".to_string(), "table driven".to_string())]);
        assert_eq!(edits.releases, vec!["docs".to_string()]);
        assert!(a.sync_mut().commit_all("a: nothing left").unwrap().is_none());

        let results = a.apply_marker_edits(edits).unwrap();
        assert_eq!(results.releases, vec![("docs".to_string(), ReleaseOutcome::Released)]);
        assert_eq!(results.claims, vec![("parser".to_string(), AcquireOutcome::Acquired)]);
        assert_eq!(results.contested().count(), 0);

        let mut observer = lock(&dir, &upstream, "observer");
        observer.sync_mut().refresh().unwrap();
        assert_eq!(
            observer.enumerate().unwrap(),
            vec![LockRecord::new("parser", "a", "table driven")]
        );
    }

    #[test]
    fn test_marker_edits_cannot_take_foreign_locks() {
        let (dir, upstream) = setup();
        let mut a = lock(&dir, &upstream, "a");
        a.acquire("parser", "").unwrap();
        a.acquire("docs", "").unwrap();

        let mut b = lock(&dir, &upstream, "b");
        b.sync()
            .write_file(Path::new("current_tasks/parser.lock"), "agent: b\ntask: parser\n")
            .unwrap();
        assert!(b.sync().remove_file(Path::new("current_tasks/docs.lock")).unwrap());

        let edits = b.withhold_marker_edits().unwrap();
        assert!(b.sync_mut().commit_all("b: nothing left").unwrap().is_none());
        let results = b.apply_marker_edits(edits).unwrap();
        assert!(results.releases.is_empty());
        assert_eq!(
            results.claims,
            vec![("parser".to_string(), AcquireOutcome::Contested { holder: "a".to_string() })]
        );
        assert_eq!(
            results.contested().collect::<Vec<_>>(),
            vec![ContestedClaim {
                task_id: "parser".to_string(),
                holder: "a".to_string(),
            }]
        );

        let mut observer = lock(&dir, &upstream, "observer");
        observer.sync_mut().refresh().unwrap();
        let owners: Vec<_> = observer.enumerate().unwrap().into_iter().map(|r| r.owner).collect();
        assert_eq!(owners, vec!["a".to_string(), "a".to_string()]);
    }

    #[test]
    fn test_invalid_task_id() {
        let (dir, upstream) = setup();
        let mut a = lock(&dir, &upstream, "a");
        assert!(matches!(a.acquire("   ", ""), Err(LockError::InvalidTaskId(_))));
    }
}
