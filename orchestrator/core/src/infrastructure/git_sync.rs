// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Git Synchronization Client
//!
//! Wraps one worker's private working copy of the shared repository and
//! implements the publish/absorb cycle every worker runs.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Refresh, commit and publish against the shared bare repository
//!
//! # Publishing
//!
//! The shared branch is advanced with a compare-and-swap
//! (`git_reference_create_matching`) against the tip this client last
//! fetched. Objects are first transferred by force-pushing the local tip to a
//! per-worker staging ref, so the branch itself is only ever moved by the CAS
//! and never partially. A CAS that finds a different tip is a rejection: the
//! caller fetches, reconciles, and tries again.
//!
//! # Reconciliation
//!
//! Divergent local work is replayed onto the remote tip (rebase). If the
//! replay hits a conflict it is aborted and a three-way merge is made instead;
//! paths the merge cannot settle take the local side.

use chrono::{DateTime, Utc};
use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{
    Commit, ErrorCode, Index, IndexAddOption, ObjectType, Oid, PushOptions, RebaseOptions,
    RemoteCallbacks, Repository, ResetType, Signature, Sort,
};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::domain::context::HistoryEntry;
use crate::domain::identity::WorkerIdentity;

const REMOTE_NAME: &str = "origin";

/// Stage bits of `IndexEntry::flags`.
const INDEX_STAGE_MASK: u16 = 0x3000;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Shared repository unavailable at {path}: {reason}")]
    RepositoryUnavailable { path: PathBuf, reason: String },

    #[error("Unresolvable sync conflict: {0}")]
    Conflict(String),

    #[error("Transport failure: {0}")]
    Transport(#[source] git2::Error),

    #[error(transparent)]
    Git(#[from] git2::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Whether retrying on a later cycle can succeed.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, SyncError::RepositoryUnavailable { .. })
    }
}

/// How local history was brought in line with the remote tip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    UpToDate,
    FastForwarded,
    /// Local has unpublished commits on top of the remote tip.
    LocalAhead,
    Rebased { replayed: usize },
    /// Three-way merge; `conflicts` lists paths resolved to the local side.
    Merged { conflicts: Vec<String> },
}

impl Reconciliation {
    pub fn conflicts(&self) -> &[String] {
        match self {
            Reconciliation::Merged { conflicts } => conflicts,
            _ => &[],
        }
    }
}

/// Result of a single compare-and-swap attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishAttempt {
    Accepted,
    /// Nothing to publish: local tip equals the observed remote tip.
    UpToDate,
    /// The shared branch moved since our last fetch, or the local tip does
    /// not contain it.
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushStatus {
    Published,
    UpToDate,
    /// Attempts exhausted; local commits are kept for the next cycle.
    Deferred,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushOutcome {
    pub status: PushStatus,
    pub attempts: u32,
    pub reconciliations: Vec<Reconciliation>,
}

impl PushOutcome {
    pub fn is_deferred(&self) -> bool {
        self.status == PushStatus::Deferred
    }

    /// Every path resolved to the local side during this push.
    pub fn resolved_conflicts(&self) -> impl Iterator<Item = &String> {
        self.reconciliations.iter().flat_map(|r| r.conflicts().iter())
    }
}

/// A worker's private working copy of the shared repository.
pub struct SyncClient {
    repo: Repository,
    upstream: PathBuf,
    workdir: PathBuf,
    branch: String,
    identity: WorkerIdentity,
}

impl std::fmt::Debug for SyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncClient")
            .field("upstream", &self.upstream)
            .field("workdir", &self.workdir)
            .field("branch", &self.branch)
            .field("identity", &self.identity.id)
            .finish()
    }
}

impl SyncClient {
    /// Open `workdir` if it already holds a clone, otherwise clone `upstream`
    /// into it, and check out `branch`.
    pub fn initialize(
        upstream: &Path,
        branch: &str,
        workdir: &Path,
        identity: WorkerIdentity,
    ) -> Result<Self, SyncError> {
        let unavailable = |reason: String| SyncError::RepositoryUnavailable {
            path: upstream.to_path_buf(),
            reason,
        };

        let shared = Repository::open_bare(upstream).map_err(|e| unavailable(e.message().to_string()))?;
        if shared.find_reference(&branch_ref(branch)).is_err() {
            return Err(unavailable(format!("branch '{}' does not exist", branch)));
        }
        drop(shared);

        let url = upstream
            .to_str()
            .ok_or_else(|| unavailable("path is not valid UTF-8".to_string()))?;

        let repo = if workdir.join(".git").exists() {
            debug!(workdir = %workdir.display(), "Reopening existing working copy");
            Repository::open(workdir)?
        } else {
            std::fs::create_dir_all(workdir)?;
            info!(upstream = %upstream.display(), workdir = %workdir.display(), "Cloning shared repository");
            RepoBuilder::new()
                .branch(branch)
                .clone(url, workdir)
                .map_err(|e| unavailable(e.message().to_string()))?
        };

        let client = Self {
            repo,
            upstream: upstream.to_path_buf(),
            workdir: workdir.to_path_buf(),
            branch: branch.to_string(),
            identity,
        };
        client.ensure_on_branch()?;
        Ok(client)
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn upstream(&self) -> &Path {
        &self.upstream
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn identity(&self) -> &WorkerIdentity {
        &self.identity
    }

    /// Local branch tip.
    pub fn head(&self) -> Result<Oid, SyncError> {
        Ok(self.repo.refname_to_id(&branch_ref(&self.branch))?)
    }

    /// Remote tip as of the last fetch.
    pub fn remote_head(&self) -> Result<Oid, SyncError> {
        Ok(self.repo.refname_to_id(&tracking_ref(&self.branch))?)
    }

    /// Fetch the shared branch tip into the remote-tracking ref.
    pub fn fetch(&self) -> Result<Oid, SyncError> {
        let mut remote = self.repo.find_remote(REMOTE_NAME)?;
        let refspec = format!("+{}:{}", branch_ref(&self.branch), tracking_ref(&self.branch));
        remote
            .fetch(&[refspec.as_str()], None, None)
            .map_err(SyncError::Transport)?;
        self.remote_head()
    }

    /// Fetch the remote tip and reconcile local history with it.
    pub fn refresh(&mut self) -> Result<Reconciliation, SyncError> {
        let remote = self.fetch()?;
        self.reconcile(remote)
    }

    /// Bring the local branch in line with `remote`.
    pub fn reconcile(&mut self, remote: Oid) -> Result<Reconciliation, SyncError> {
        let local = self.head()?;
        if local == remote {
            return Ok(Reconciliation::UpToDate);
        }
        if self.repo.graph_descendant_of(remote, local)? {
            self.fast_forward(remote)?;
            debug!(to = %short(remote), "Fast-forwarded working copy");
            return Ok(Reconciliation::FastForwarded);
        }
        if self.repo.graph_descendant_of(local, remote)? {
            return Ok(Reconciliation::LocalAhead);
        }

        match self.rebase_onto(remote)? {
            Some(replayed) => {
                debug!(replayed, onto = %short(remote), "Rebased unpublished commits");
                Ok(Reconciliation::Rebased { replayed })
            }
            None => {
                let conflicts = self.merge_prefer_local(local, remote)?;
                Ok(Reconciliation::Merged { conflicts })
            }
        }
    }

    /// Stage every change in the working copy and commit it. A clean tree is a
    /// silent skip.
    pub fn commit_all(&mut self, message: &str) -> Result<Option<Oid>, SyncError> {
        let mut index = self.repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["*"].iter(), None)?;
        index.write()?;
        let tree_id = index.write_tree()?;

        let parent = self.repo.find_commit(self.head()?)?;
        if parent.tree_id() == tree_id {
            return Ok(None);
        }

        let tree = self.repo.find_tree(tree_id)?;
        let sig = self.signature()?;
        let oid = self
            .repo
            .commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])?;
        debug!(commit = %short(oid), message, "Committed working copy changes");
        Ok(Some(oid))
    }

    /// One compare-and-swap of the shared branch from the last fetched tip to
    /// the local tip. The local tip must contain the fetched tip; a caller
    /// that fetched without reconciling is rejected.
    pub fn try_publish(&mut self) -> Result<PublishAttempt, SyncError> {
        let local = self.head()?;
        let expected = self.remote_head()?;
        if local == expected {
            return Ok(PublishAttempt::UpToDate);
        }

        metrics::counter!("swarm_push_attempts_total").increment(1);

        if !self.repo.graph_descendant_of(local, expected)? {
            metrics::counter!("swarm_push_rejections_total").increment(1);
            debug!(
                local = %short(local),
                expected = %short(expected),
                "Local tip does not contain the fetched tip, publish rejected"
            );
            return Ok(PublishAttempt::Rejected);
        }

        let staging = format!("refs/swarm/staging/{}", self.identity.id);
        let mut callbacks = RemoteCallbacks::new();
        callbacks.push_update_reference(|refname, status| match status {
            Some(reason) => Err(git2::Error::from_str(&format!(
                "update of {} refused: {}",
                refname, reason
            ))),
            None => Ok(()),
        });
        let mut options = PushOptions::new();
        options.remote_callbacks(callbacks);

        let mut remote = self.repo.find_remote(REMOTE_NAME)?;
        remote
            .push(
                &[format!("+{}:{}", branch_ref(&self.branch), staging).as_str()],
                Some(&mut options),
            )
            .map_err(SyncError::Transport)?;

        let shared = Repository::open_bare(&self.upstream).map_err(|e| SyncError::RepositoryUnavailable {
            path: self.upstream.clone(),
            reason: e.message().to_string(),
        })?;
        let message = format!("publish {} by {}", short(local), self.identity.id);
        let cas = shared
            .reference_matching(&branch_ref(&self.branch), local, true, expected, &message)
            .map(|_| ());
        if let Ok(mut staged) = shared.find_reference(&staging) {
            if let Err(e) = staged.delete() {
                debug!("Failed to delete staging ref {}: {}", staging, e);
            }
        }

        match cas {
            Ok(()) => {
                self.repo
                    .reference(&tracking_ref(&self.branch), local, true, "publish")?;
                info!(commit = %short(local), "Published to shared branch");
                Ok(PublishAttempt::Accepted)
            }
            Err(e) if matches!(e.code(), ErrorCode::Modified | ErrorCode::Locked) => {
                metrics::counter!("swarm_push_rejections_total").increment(1);
                debug!(expected = %short(expected), "Shared branch moved, publish rejected: {}", e.message());
                Ok(PublishAttempt::Rejected)
            }
            Err(e) => Err(SyncError::Git(e)),
        }
    }

    /// Publish the local tip, reconciling and retrying on rejection up to
    /// `max_attempts` times. Exhaustion defers: local commits stay put.
    pub fn push_with_retry(&mut self, max_attempts: u32) -> Result<PushOutcome, SyncError> {
        let mut reconciliations = Vec::new();
        let mut attempts = 0;

        while attempts < max_attempts.max(1) {
            attempts += 1;
            match self.try_publish()? {
                PublishAttempt::Accepted => {
                    return Ok(PushOutcome {
                        status: PushStatus::Published,
                        attempts,
                        reconciliations,
                    });
                }
                PublishAttempt::UpToDate => {
                    return Ok(PushOutcome {
                        status: PushStatus::UpToDate,
                        attempts,
                        reconciliations,
                    });
                }
                PublishAttempt::Rejected => {
                    let reconciliation = self.refresh()?;
                    debug!(attempt = attempts, ?reconciliation, "Reconciled after rejected publish");
                    reconciliations.push(reconciliation);
                }
            }
        }

        warn!(attempts, "Publish deferred to next cycle, local commits retained");
        Ok(PushOutcome {
            status: PushStatus::Deferred,
            attempts,
            reconciliations,
        })
    }

    /// Read-only view: fetch and hard-reset to the remote tip, discarding any
    /// local state.
    pub fn mirror(&mut self) -> Result<Oid, SyncError> {
        let remote = self.fetch()?;
        let commit = self.repo.find_commit(remote)?;
        self.repo.reset(commit.as_object(), ResetType::Hard, None)?;
        Ok(remote)
    }

    /// Up to `limit` commits reachable from the local tip, newest first.
    pub fn recent_history(&self, limit: usize) -> Result<Vec<HistoryEntry>, SyncError> {
        let mut walk = self.repo.revwalk()?;
        walk.push(self.head()?)?;
        walk.set_sorting(Sort::TOPOLOGICAL | Sort::TIME)?;

        let mut entries = Vec::with_capacity(limit);
        for oid in walk.take(limit) {
            let commit = self.repo.find_commit(oid?)?;
            entries.push(history_entry(&commit));
        }
        Ok(entries)
    }

    /// Content of a repository-relative file at the last fetched remote tip.
    pub fn read_remote_file(&self, path: &Path) -> Result<Option<String>, SyncError> {
        self.read_blob_at(self.remote_head()?, path)
    }

    /// Content of a repository-relative file as last committed locally.
    pub fn read_committed_file(&self, path: &Path) -> Result<Option<String>, SyncError> {
        self.read_blob_at(self.head()?, path)
    }

    /// Repository-relative paths of files directly under `dir` as last
    /// committed locally, sorted.
    pub fn list_committed_dir(&self, dir: &Path) -> Result<Vec<PathBuf>, SyncError> {
        let tree = self.repo.find_commit(self.head()?)?.tree()?;
        let entry = match tree.get_path(dir) {
            Ok(entry) => entry,
            Err(e) if e.code() == ErrorCode::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let Some(subtree) = entry.to_object(&self.repo)?.into_tree().ok() else {
            return Ok(Vec::new());
        };
        let mut paths: Vec<PathBuf> = subtree
            .iter()
            .filter(|e| e.kind() == Some(ObjectType::Blob))
            .filter_map(|e| e.name().map(|name| dir.join(name)))
            .collect();
        paths.sort();
        Ok(paths)
    }

    fn read_blob_at(&self, commit: Oid, path: &Path) -> Result<Option<String>, SyncError> {
        let tree = self.repo.find_commit(commit)?.tree()?;
        let entry = match tree.get_path(path) {
            Ok(entry) => entry,
            Err(e) if e.code() == ErrorCode::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let object = entry.to_object(&self.repo)?;
        Ok(object
            .as_blob()
            .map(|blob| String::from_utf8_lossy(blob.content()).into_owned()))
    }

    /// Content of a repository-relative file in the working copy.
    pub fn read_file(&self, path: &Path) -> Result<Option<String>, SyncError> {
        match std::fs::read_to_string(self.workdir.join(path)) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn write_file(&self, path: &Path, content: &str) -> Result<(), SyncError> {
        let full = self.workdir.join(path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(full, content)?;
        Ok(())
    }

    /// Returns whether the file existed.
    pub fn remove_file(&self, path: &Path) -> Result<bool, SyncError> {
        match std::fs::remove_file(self.workdir.join(path)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Repository-relative paths of files directly under `dir` in the working
    /// copy, sorted.
    pub fn list_dir(&self, dir: &Path) -> Result<Vec<PathBuf>, SyncError> {
        let full = self.workdir.join(dir);
        let read = match std::fs::read_dir(&full) {
            Ok(read) => read,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut paths = Vec::new();
        for entry in read {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                paths.push(dir.join(entry.file_name()));
            }
        }
        paths.sort();
        Ok(paths)
    }

    fn signature(&self) -> Result<Signature<'static>, SyncError> {
        Ok(Signature::now(&self.identity.id, &self.identity.email())?)
    }

    /// Point HEAD at the configured branch, creating it from the
    /// remote-tracking ref when a reopened clone lacks it.
    fn ensure_on_branch(&self) -> Result<(), SyncError> {
        let local_ref = branch_ref(&self.branch);
        if self.repo.find_reference(&local_ref).is_err() {
            let remote = self.fetch()?;
            self.repo.reference(&local_ref, remote, false, "create swarm branch")?;
        }
        let on_branch = self
            .repo
            .head()
            .ok()
            .and_then(|h| h.name().map(|n| n == local_ref))
            .unwrap_or(false);
        if !on_branch {
            let target = self.repo.find_commit(self.repo.refname_to_id(&local_ref)?)?;
            self.repo
                .checkout_tree(target.as_object(), Some(CheckoutBuilder::new().safe()))?;
            self.repo.set_head(&local_ref)?;
        }
        Ok(())
    }

    fn fast_forward(&self, target: Oid) -> Result<(), SyncError> {
        let commit = self.repo.find_commit(target)?;
        self.repo
            .checkout_tree(commit.as_object(), Some(CheckoutBuilder::new().safe()))?;
        self.repo
            .reference(&branch_ref(&self.branch), target, true, "fast-forward")?;
        Ok(())
    }

    /// Replay unpublished commits onto `onto`. Returns `None` (after aborting)
    /// when a commit does not apply cleanly.
    fn rebase_onto(&self, onto: Oid) -> Result<Option<usize>, SyncError> {
        let head_ref = self.repo.find_reference(&branch_ref(&self.branch))?;
        let branch = self.repo.reference_to_annotated_commit(&head_ref)?;
        let upstream = self.repo.find_annotated_commit(onto)?;
        let sig = self.signature()?;

        let mut options = RebaseOptions::new();
        let mut rebase = self
            .repo
            .rebase(Some(&branch), Some(&upstream), None, Some(&mut options))?;

        let mut replayed = 0;
        while let Some(operation) = rebase.next() {
            if let Err(e) = operation {
                debug!("Rebase step failed, aborting: {}", e.message());
                rebase.abort()?;
                return Ok(None);
            }
            if self.repo.index()?.has_conflicts() {
                debug!("Rebase hit conflicts, aborting");
                rebase.abort()?;
                return Ok(None);
            }
            match rebase.commit(None, &sig, None) {
                Ok(_) => replayed += 1,
                // Patch already present upstream; nothing to commit.
                Err(e) if e.code() == ErrorCode::Applied => {}
                Err(e) => {
                    rebase.abort()?;
                    return Err(e.into());
                }
            }
        }
        rebase.finish(Some(&sig))?;
        Ok(Some(replayed))
    }

    /// Three-way merge of `remote` into `local`; unresolved paths take the
    /// local version. Returns the paths that had to be resolved.
    fn merge_prefer_local(&self, local: Oid, remote: Oid) -> Result<Vec<String>, SyncError> {
        let ours = self.repo.find_commit(local)?;
        let theirs = self.repo.find_commit(remote)?;
        let mut index = self.repo.merge_commits(&ours, &theirs, None)?;

        let conflicts = if index.has_conflicts() {
            resolve_prefer_local(&mut index)?
        } else {
            Vec::new()
        };
        if index.has_conflicts() {
            return Err(SyncError::Conflict(format!(
                "merge of {} into {} left conflicts after local-preference resolution",
                short(remote),
                short(local)
            )));
        }

        let tree = self.repo.find_tree(index.write_tree_to(&self.repo)?)?;
        let message = if conflicts.is_empty() {
            format!("Merge {} into {}", short(remote), self.branch)
        } else {
            format!(
                "Auto-merge {} into {}: kept local version of {} path(s)\n\n{}",
                short(remote),
                self.branch,
                conflicts.len(),
                conflicts.join("\n")
            )
        };
        let sig = self.signature()?;
        let merged = self
            .repo
            .commit(None, &sig, &sig, &message, &tree, &[&ours, &theirs])?;

        let commit = self.repo.find_commit(merged)?;
        self.repo
            .checkout_tree(commit.as_object(), Some(CheckoutBuilder::new().force()))?;
        self.repo
            .reference(&branch_ref(&self.branch), merged, true, "merge")?;

        if conflicts.is_empty() {
            debug!(commit = %short(merged), "Merged remote changes");
        } else {
            metrics::counter!("swarm_conflicts_resolved_total").increment(conflicts.len() as u64);
            warn!(
                commit = %short(merged),
                paths = ?conflicts,
                "Merge conflicts resolved by keeping the local version"
            );
        }
        Ok(conflicts)
    }
}

/// Replace every conflict in `index` with the local ("ours") entry; a path
/// deleted locally stays deleted.
fn resolve_prefer_local(index: &mut Index) -> Result<Vec<String>, SyncError> {
    let conflicts = index.conflicts()?.collect::<Result<Vec<_>, _>>()?;
    let mut paths = Vec::with_capacity(conflicts.len());

    for conflict in conflicts {
        let raw = conflict
            .our
            .as_ref()
            .or(conflict.their.as_ref())
            .or(conflict.ancestor.as_ref())
            .map(|entry| entry.path.clone())
            .unwrap_or_default();
        let path = String::from_utf8_lossy(&raw).into_owned();

        index.conflict_remove(Path::new(&path))?;
        if let Some(mut ours) = conflict.our {
            ours.flags &= !INDEX_STAGE_MASK;
            index.add(&ours)?;
        }
        paths.push(path);
    }
    Ok(paths)
}

fn history_entry(commit: &Commit<'_>) -> HistoryEntry {
    let author = commit.author();
    HistoryEntry {
        id: short(commit.id()),
        author: author.name().unwrap_or("unknown").to_string(),
        timestamp: DateTime::<Utc>::from_timestamp(commit.time().seconds(), 0).unwrap_or_default(),
        summary: commit.summary().unwrap_or("").to_string(),
    }
}

fn branch_ref(branch: &str) -> String {
    format!("refs/heads/{}", branch)
}

fn tracking_ref(branch: &str) -> String {
    format!("refs/remotes/{}/{}", REMOTE_NAME, branch)
}

fn short(oid: Oid) -> String {
    let mut s = oid.to_string();
    s.truncate(8);
    s
}
