// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Lock Records
//!
//! A [`LockRecord`] is a plain-text marker committed to the shared repository
//! under the tasks directory, one file per claimed task:
//!
//! ```text
//! agent: generalist-0
//! task: parser rewrite
//! Replace the hand-written tokenizer with a table-driven one.
//! ```
//!
//! Line 1 names the owner. The `task:` line carries the unsanitized task id;
//! everything after it is free-form description.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// File extension of lock markers.
pub const LOCK_EXTENSION: &str = "lock";

/// A claimed task as materialized in the shared repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockRecord {
    pub task_id: String,
    pub owner: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl LockRecord {
    pub fn new(task_id: impl Into<String>, owner: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            owner: owner.into(),
            description: description.into(),
        }
    }

    /// Render the marker file content.
    pub fn render(&self) -> String {
        let mut out = format!("agent: {}\ntask: {}\n", self.owner, self.task_id);
        let description = self.description.trim();
        if !description.is_empty() {
            out.push_str(description);
            out.push('\n');
        }
        out
    }

    /// Parse marker content. `file_stem` is the fallback task id for markers
    /// written without a `task:` line. Returns `None` when the owner line is
    /// missing.
    pub fn parse(content: &str, file_stem: &str) -> Option<Self> {
        let mut lines = content.lines();
        let owner = lines
            .next()?
            .strip_prefix("agent:")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())?;

        let mut task_id = file_stem.to_string();
        let mut description = Vec::new();
        for (i, line) in lines.enumerate() {
            if i == 0 {
                if let Some(task) = line.strip_prefix("task:") {
                    task_id = task.trim().to_string();
                    continue;
                }
            }
            description.push(line);
        }

        Some(Self {
            task_id,
            owner,
            description: description.join("\n").trim().to_string(),
        })
    }

    /// Repository-relative path of this record's marker.
    pub fn path_in(&self, tasks_dir: &Path) -> PathBuf {
        lock_path(tasks_dir, &self.task_id)
    }
}

/// A claim this worker made on a task another worker had already published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContestedClaim {
    pub task_id: String,
    pub holder: String,
}

/// File-name-safe form of a task id: spaces and path separators become `_`.
pub fn sanitize_task_id(task_id: &str) -> String {
    task_id
        .trim()
        .chars()
        .map(|c| match c {
            ' ' | '/' | '\\' => '_',
            other => other,
        })
        .collect()
}

/// Repository-relative marker path for `task_id`.
pub fn lock_path(tasks_dir: &Path, task_id: &str) -> PathBuf {
    tasks_dir.join(format!("{}.{}", sanitize_task_id(task_id), LOCK_EXTENSION))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_and_parse() {
        let record = LockRecord::new("parser rewrite", "generalist-0", "Table-driven tokenizer.\nKeep the old API.");
        let content = record.render();
        assert!(content.starts_with("agent: generalist-0\n"));

        let parsed = LockRecord::parse(&content, "parser_rewrite").unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn test_parse_without_task_line_uses_file_stem() {
        let parsed = LockRecord::parse("agent: optimizer-1\nspeed up the allocator\n", "alloc").unwrap();
        assert_eq!(parsed.task_id, "alloc");
        assert_eq!(parsed.owner, "optimizer-1");
        assert_eq!(parsed.description, "speed up the allocator");
    }

    #[test]
    fn test_parse_rejects_missing_owner() {
        assert!(LockRecord::parse("", "x").is_none());
        assert!(LockRecord::parse("task: x\n", "x").is_none());
        assert!(LockRecord::parse("agent:   \n", "x").is_none());
    }

    #[test]
    fn test_lock_path_sanitizes() {
        let path = lock_path(Path::new("current_tasks"), "fix io/net layer");
        assert_eq!(path, PathBuf::from("current_tasks/fix_io_net_layer.lock"));
    }
}
