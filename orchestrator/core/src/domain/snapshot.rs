// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Swarm Snapshot
//!
//! Point-in-time view of the swarm assembled by the state aggregator. It is
//! eventually consistent: commits a worker has not yet published are not in
//! it, and the process table may be a poll behind the repository.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

use crate::domain::context::HistoryEntry;
use crate::domain::lock::LockRecord;
use crate::domain::runtime::WorkerProcess;

/// A lock record cross-referenced against the process table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockView {
    #[serde(flatten)]
    pub record: LockRecord,
    /// Whether a running worker currently carries the owning identity.
    pub owner_running: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogFileInfo {
    pub name: String,
    pub size_bytes: u64,
    pub modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwarmSnapshot {
    pub taken_at: DateTime<Utc>,
    /// Shared branch tip the snapshot was read from.
    pub head: Option<String>,
    pub locks: Vec<LockView>,
    pub history: Vec<HistoryEntry>,
    pub processes: Vec<WorkerProcess>,
    pub log_files: Vec<LogFileInfo>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status_document: String,
}

impl SwarmSnapshot {
    /// Locks whose owner is not among the running workers.
    pub fn orphaned_locks(&self) -> impl Iterator<Item = &LockView> {
        self.locks.iter().filter(|l| !l.owner_running)
    }

    pub fn running_workers(&self) -> usize {
        self.processes.iter().filter(|p| p.is_running()).count()
    }

    /// Plain-text dashboard. Colour is applied by the CLI.
    pub fn render(&self, max_commits: usize, max_logs: usize) -> String {
        let rule = "=".repeat(60);
        let mut out = String::new();
        let _ = writeln!(out, "{}", rule);
        let _ = writeln!(out, "  CODING SWARM DASHBOARD - {}", self.taken_at.format("%Y-%m-%d %H:%M:%S UTC"));
        if let Some(head) = &self.head {
            let _ = writeln!(out, "  shared tip: {}", &head[..head.len().min(8)]);
        }
        let _ = writeln!(out, "{}", rule);

        let _ = writeln!(out, "\nWorkers ({} running / {} known):", self.running_workers(), self.processes.len());
        if self.processes.is_empty() {
            let _ = writeln!(out, "   (none)");
        }
        for p in &self.processes {
            let tasks: Vec<&str> = self
                .locks
                .iter()
                .filter(|l| l.record.owner == p.identity.id)
                .map(|l| l.record.task_id.as_str())
                .collect();
            let _ = writeln!(
                out,
                "   {:<24} {:<9} {:<10} {:<26} {}",
                p.identity.id,
                p.state,
                p.identity.provider,
                p.identity.model,
                if tasks.is_empty() { "-".to_string() } else { tasks.join(", ") }
            );
        }

        let _ = writeln!(out, "\nActive Tasks ({}):", self.locks.len());
        if self.locks.is_empty() {
            let _ = writeln!(out, "   (none)");
        }
        for lock in &self.locks {
            let marker = if lock.owner_running { "" } else { "  [owner not running]" };
            let _ = writeln!(out, "   {}  <-  agent: {}{}", lock.record.task_id, lock.record.owner, marker);
        }

        let _ = writeln!(out, "\nRecent Commits ({}):", self.history.len());
        for c in self.history.iter().take(max_commits) {
            let _ = writeln!(
                out,
                "   {}  {:>16}  {:<20} {}",
                c.id,
                c.timestamp.format("%m-%d %H:%M:%S"),
                c.author,
                c.summary
            );
        }

        let _ = writeln!(out, "\nAgent Logs ({} files):", self.log_files.len());
        for log in self.log_files.iter().take(max_logs) {
            let _ = writeln!(out, "   {}  ({} bytes)", log.name, log.size_bytes);
        }

        let _ = writeln!(out, "\n{}", rule);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::identity::{Provider, WorkerIdentity};
    use crate::domain::runtime::InstanceId;

    fn snapshot() -> SwarmSnapshot {
        SwarmSnapshot {
            taken_at: Utc::now(),
            head: Some("0123456789abcdef".to_string()),
            locks: vec![
                LockView {
                    record: LockRecord::new("parser", "generalist-0", ""),
                    owner_running: true,
                },
                LockView {
                    record: LockRecord::new("docs", "writer-3", ""),
                    owner_running: false,
                },
            ],
            history: vec![],
            processes: vec![WorkerProcess {
                identity: WorkerIdentity::for_slot("generalist", 0, Provider::Anthropic, "claude-opus-4-20250514"),
                instance: InstanceId::new("4242"),
                started_at: Utc::now(),
                state: "running".to_string(),
            }],
            log_files: vec![],
            status_document: String::new(),
        }
    }

    #[test]
    fn test_orphaned_locks() {
        let snap = snapshot();
        let orphaned: Vec<_> = snap.orphaned_locks().map(|l| l.record.task_id.as_str()).collect();
        assert_eq!(orphaned, vec!["docs"]);
        assert_eq!(snap.running_workers(), 1);
    }

    #[test]
    fn test_render_lists_tasks_per_worker() {
        let text = snapshot().render(8, 5);
        assert!(text.contains("shared tip: 01234567"));
        assert!(text.contains("generalist-0"));
        assert!(text.contains("parser  <-  agent: generalist-0"));
        assert!(text.contains("docs  <-  agent: writer-3  [owner not running]"));
    }
}
