// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `swarm logs` - list session logs or tail one agent's log

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use std::path::{Path, PathBuf};

use crate::layout;
use swarm_coordination::application::list_log_files;
use swarm_core::domain::snapshot::LogFileInfo;

#[derive(Args, Debug)]
pub struct LogsArgs {
    /// Agent id (or any part of a log file name)
    pub agent_id: Option<String>,

    /// Number of lines to show
    #[arg(short = 'n', long, default_value = "50")]
    pub tail: usize,
}

pub async fn handle_command(args: LogsArgs, config_override: Option<PathBuf>) -> Result<()> {
    let (_, paths) = layout::load_config(config_override)?;
    let files = list_log_files(&paths.logs_dir).await?;

    let Some(agent_id) = args.agent_id else {
        if files.is_empty() {
            println!("No log files found yet.");
            return Ok(());
        }
        println!("{}", "Available log files:".bold());
        println!();
        for file in &files {
            println!("   {}  ({} bytes)", file.name, file.size_bytes);
        }
        return Ok(());
    };

    let Some(path) = find_log(&paths.logs_dir, &files, &agent_id) else {
        println!("No log files matching '{}'", agent_id);
        return Ok(());
    };
    let content = read_log(&path).await?;
    println!("{}", format!("==> {} <==", path.display()).dimmed());
    for line in tail_lines(&content, args.tail) {
        println!("{}", line);
    }
    Ok(())
}

/// Newest session log for `agent_id`. Exact `<id>_` prefixes win over
/// substring matches; the worker console file is the last resort.
pub fn find_log(logs_dir: &Path, files: &[LogFileInfo], agent_id: &str) -> Option<PathBuf> {
    let prefix = format!("{}_", agent_id);
    files
        .iter()
        .find(|f| f.name.starts_with(&prefix))
        .or_else(|| files.iter().find(|f| f.name.contains(agent_id)))
        .map(|f| logs_dir.join(&f.name))
        .or_else(|| {
            let console = logs_dir.join(format!("{}.console", agent_id));
            console.is_file().then_some(console)
        })
}

/// Log content, with invalid UTF-8 sequences replaced.
pub async fn read_log(path: &Path) -> Result<String> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {:?}", path))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

pub fn tail_lines(content: &str, count: usize) -> Vec<&str> {
    let lines: Vec<&str> = content.lines().collect();
    let start = lines.len().saturating_sub(count);
    lines[start..].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn info(name: &str) -> LogFileInfo {
        LogFileInfo {
            name: name.to_string(),
            size_bytes: 0,
            modified: None,
        }
    }

    #[test]
    fn test_tail_lines() {
        assert_eq!(tail_lines("a\nb\nc\n", 2), vec!["b", "c"]);
        assert_eq!(tail_lines("a\n", 10), vec!["a"]);
        assert!(tail_lines("", 5).is_empty());
    }

    #[tokio::test]
    async fn test_read_log_tolerates_invalid_utf8() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("generalist-0.console");
        std::fs::write(&path, b"build ok\n\xff\xfe garbage\nlast line\n").unwrap();

        let content = read_log(&path).await.unwrap();
        assert_eq!(tail_lines(&content, 2), vec!["\u{FFFD}\u{FFFD} garbage", "last line"]);
    }

    #[test]
    fn test_find_log_prefers_exact_prefix() {
        let dir = TempDir::new().unwrap();
        // Newest first, as listed by list_log_files
        let files = vec![
            info("generalist-10_20260102_000000.log"),
            info("generalist-1_20260101_000000.log"),
        ];
        let found = find_log(dir.path(), &files, "generalist-1").unwrap();
        assert!(found.ends_with("generalist-1_20260101_000000.log"));
    }

    #[test]
    fn test_find_log_falls_back_to_console() {
        let dir = TempDir::new().unwrap();
        assert!(find_log(dir.path(), &[], "reviewer-0").is_none());
        std::fs::write(dir.path().join("reviewer-0.console"), "boom\n").unwrap();
        let found = find_log(dir.path(), &[], "reviewer-0").unwrap();
        assert!(found.ends_with("reviewer-0.console"));
    }
}
