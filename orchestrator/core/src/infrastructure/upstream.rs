// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Shared repository bootstrap
//!
//! Creates the bare repository every worker clones, either empty with a
//! scaffold commit or as a bare clone of the project's remote, and seeds a
//! local project tree into it.

use git2::build::RepoBuilder;
use git2::{Oid, Repository, RepositoryInitOptions, Signature};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::domain::identity::{Provider, WorkerIdentity};
use crate::infrastructure::git_sync::{SyncClient, SyncError};

const PROGRESS_TEMPLATE: &str = "# Progress\n\n\
This file is maintained by the swarm agents.\n\
Each agent updates it with status, completed tasks, and next steps.\n";

const AGENT_LOGS_DIR: &str = "agent_logs";

/// Directories never copied into the shared repository.
const SEED_EXCLUDES: &[&str] = &[".git", ".swarm"];

/// Identity used for commits made by operator tooling rather than a worker.
pub fn operator_identity() -> WorkerIdentity {
    WorkerIdentity::new("coding-swarm", "operator", Provider::default(), "-")
}

/// Create the shared bare repository at `upstream` unless one already exists.
///
/// With `repo_url` the repository is a bare clone of it; otherwise it gets a
/// single scaffold commit on `branch` holding the tasks directory and status
/// document. Returns `false` when the repository was already there.
pub fn init_upstream_repo(
    upstream: &Path,
    repo_url: Option<&str>,
    branch: &str,
    tasks_dir: &str,
    progress_file: &str,
) -> Result<bool, SyncError> {
    if upstream.join("HEAD").exists() {
        debug!(path = %upstream.display(), "Shared repository already initialized");
        return Ok(false);
    }
    std::fs::create_dir_all(upstream)?;

    if let Some(url) = repo_url.filter(|u| !u.trim().is_empty()) {
        info!(url, path = %upstream.display(), "Cloning project into shared repository");
        let repo = RepoBuilder::new()
            .bare(true)
            .clone(url, upstream)
            .map_err(|e| SyncError::RepositoryUnavailable {
                path: upstream.to_path_buf(),
                reason: format!("clone of {} failed: {}", url, e.message()),
            })?;
        if repo.find_reference(&format!("refs/heads/{}", branch)).is_err() {
            return Err(SyncError::RepositoryUnavailable {
                path: upstream.to_path_buf(),
                reason: format!("{} has no branch '{}'", url, branch),
            });
        }
        return Ok(true);
    }

    let mut options = RepositoryInitOptions::new();
    options.bare(true).initial_head(branch);
    let repo = Repository::init_opts(upstream, &options)?;

    let files = vec![
        (format!("{}/.gitkeep", tasks_dir.trim_end_matches('/')), Vec::new()),
        (format!("{}/.gitkeep", AGENT_LOGS_DIR), Vec::new()),
        (progress_file.to_string(), PROGRESS_TEMPLATE.as_bytes().to_vec()),
    ];
    let tree = repo.find_tree(build_tree(&repo, &files)?)?;
    let identity = operator_identity();
    let sig = Signature::now(&identity.id, &identity.email())?;
    repo.commit(
        Some(&format!("refs/heads/{}", branch)),
        &sig,
        &sig,
        "Initialize swarm shared repository",
        &tree,
        &[],
    )?;

    info!(path = %upstream.display(), branch, "Initialized shared repository");
    Ok(true)
}

/// Copy the files of `project_dir` into the shared repository as one commit.
///
/// `scratch` is a throwaway working copy location; it is removed afterwards.
/// Returns `None` when the shared repository already holds the same content.
pub fn seed_project_files(
    upstream: &Path,
    branch: &str,
    project_dir: &Path,
    scratch: &Path,
) -> Result<Option<Oid>, SyncError> {
    if scratch.exists() {
        std::fs::remove_dir_all(scratch)?;
    }
    let mut client = SyncClient::initialize(upstream, branch, scratch, operator_identity())?;

    let skip: Vec<PathBuf> = [upstream, scratch]
        .iter()
        .map(|p| p.canonicalize().unwrap_or_else(|_| p.to_path_buf()))
        .collect();

    let walker = WalkDir::new(project_dir).min_depth(1).into_iter().filter_entry(|entry| {
        let excluded_name = entry
            .file_name()
            .to_str()
            .map(|name| SEED_EXCLUDES.contains(&name))
            .unwrap_or(false);
        let path = entry.path().canonicalize().unwrap_or_else(|_| entry.path().to_path_buf());
        !excluded_name && !skip.iter().any(|s| path.starts_with(s))
    });

    let mut copied = 0usize;
    for entry in walker {
        let entry = entry.map_err(std::io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = match entry.path().strip_prefix(project_dir) {
            Ok(relative) => relative,
            Err(_) => continue,
        };
        let dest = scratch.join(relative);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(entry.path(), &dest)?;
        copied += 1;
    }
    debug!(copied, from = %project_dir.display(), "Copied project files");

    let commit = client.commit_all("Seed project files")?;
    if commit.is_some() {
        let outcome = client.push_with_retry(3)?;
        if outcome.is_deferred() {
            return Err(SyncError::Conflict(
                "shared branch kept moving while seeding project files".to_string(),
            ));
        }
        info!(copied, "Seeded project files into shared repository");
    }
    drop(client);
    std::fs::remove_dir_all(scratch)?;
    Ok(commit)
}

/// Build a tree from `(path, content)` pairs, creating nested trees for
/// `/`-separated paths.
fn build_tree(repo: &Repository, files: &[(String, Vec<u8>)]) -> Result<Oid, git2::Error> {
    let mut builder = repo.treebuilder(None)?;
    let mut subdirs: BTreeMap<String, Vec<(String, Vec<u8>)>> = BTreeMap::new();

    for (path, content) in files {
        match path.split_once('/') {
            Some((dir, rest)) => subdirs
                .entry(dir.to_string())
                .or_default()
                .push((rest.to_string(), content.clone())),
            None => {
                let blob = repo.blob(content)?;
                builder.insert(path.as_str(), blob, 0o100644)?;
            }
        }
    }
    for (dir, entries) in subdirs {
        let subtree = build_tree(repo, &entries)?;
        builder.insert(dir.as_str(), subtree, 0o040000)?;
    }
    builder.write()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_scaffold_commit_layout() {
        let dir = TempDir::new().unwrap();
        let upstream = dir.path().join("upstream.git");
        assert!(init_upstream_repo(&upstream, None, "main", "work/tasks", "STATUS.md").unwrap());

        let repo = Repository::open_bare(&upstream).unwrap();
        let tree = repo.find_reference("refs/heads/main").unwrap().peel_to_tree().unwrap();
        assert!(tree.get_path(Path::new("work/tasks/.gitkeep")).is_ok());
        assert!(tree.get_path(Path::new("agent_logs/.gitkeep")).is_ok());
        let progress = tree.get_path(Path::new("STATUS.md")).unwrap().to_object(&repo).unwrap();
        let text = String::from_utf8_lossy(progress.as_blob().unwrap().content()).into_owned();
        assert!(text.starts_with("# Progress"));
    }

    #[test]
    fn test_init_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let upstream = dir.path().join("upstream.git");
        assert!(init_upstream_repo(&upstream, None, "main", "current_tasks", "PROGRESS.md").unwrap());
        let tip = Repository::open_bare(&upstream).unwrap().refname_to_id("refs/heads/main").unwrap();
        assert!(!init_upstream_repo(&upstream, None, "main", "current_tasks", "PROGRESS.md").unwrap());
        let again = Repository::open_bare(&upstream).unwrap().refname_to_id("refs/heads/main").unwrap();
        assert_eq!(tip, again);
    }

    #[test]
    fn test_clone_from_url_requires_branch() {
        let dir = TempDir::new().unwrap();
        let origin = dir.path().join("origin.git");
        init_upstream_repo(&origin, None, "trunk", "current_tasks", "PROGRESS.md").unwrap();
        let url = origin.to_str().unwrap();

        let ok = dir.path().join("ok.git");
        assert!(init_upstream_repo(&ok, Some(url), "trunk", "current_tasks", "PROGRESS.md").unwrap());

        let bad = dir.path().join("bad.git");
        let err = init_upstream_repo(&bad, Some(url), "main", "current_tasks", "PROGRESS.md").unwrap_err();
        assert!(matches!(err, SyncError::RepositoryUnavailable { .. }));
    }

    #[test]
    fn test_seed_copies_project_and_skips_state_dirs() {
        let dir = TempDir::new().unwrap();
        let project = dir.path().join("project");
        std::fs::create_dir_all(project.join("src")).unwrap();
        std::fs::create_dir_all(project.join(".swarm")).unwrap();
        std::fs::write(project.join("src/main.rs"), "fn main() {}\n").unwrap();
        std::fs::write(project.join(".swarm/secret"), "x").unwrap();

        let upstream = project.join(".swarm/upstream.git");
        init_upstream_repo(&upstream, None, "main", "current_tasks", "PROGRESS.md").unwrap();

        let scratch = dir.path().join("seed");
        assert!(seed_project_files(&upstream, "main", &project, &scratch).unwrap().is_some());
        assert!(!scratch.exists());

        let repo = Repository::open_bare(&upstream).unwrap();
        let tree = repo.find_reference("refs/heads/main").unwrap().peel_to_tree().unwrap();
        assert!(tree.get_path(Path::new("src/main.rs")).is_ok());
        assert!(tree.get_path(Path::new(".swarm")).is_err());
        assert!(tree.get_path(Path::new("PROGRESS.md")).is_ok());

        // Seeding the same tree again is a no-op.
        assert!(seed_project_files(&upstream, "main", &project, &scratch).unwrap().is_none());
    }
}
