// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Command-backed work generator
//!
//! Runs the configured agent command through `sh -c` inside the worker's
//! working copy, feeding it the rendered work context on stdin. Output is
//! appended to the worker's session log.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::domain::context::WorkContext;
use crate::domain::work::{ExecuteError, ExecutionReport, WorkGenerator};
use crate::infrastructure::prompt_template_engine::{PromptContext, PromptTemplateEngine};

/// Lines of stderr kept in the execution report.
const REPORT_TAIL_LINES: usize = 20;

/// `<logs_dir>/<id>_<YYYYmmdd_HHMMSS>.log`
pub fn session_log_path(logs_dir: &Path, agent_id: &str, started: DateTime<Utc>) -> PathBuf {
    logs_dir.join(format!("{}_{}.log", agent_id, started.format("%Y%m%d_%H%M%S")))
}

pub struct CommandWorkGenerator {
    command: String,
    session_log: PathBuf,
    engine: PromptTemplateEngine,
    template: Option<String>,
    tasks_dir: String,
    progress_file: String,
    env: Vec<(String, String)>,
}

impl CommandWorkGenerator {
    pub fn new(command: impl Into<String>, session_log: PathBuf) -> Self {
        Self {
            command: command.into(),
            session_log,
            engine: PromptTemplateEngine::new(),
            template: None,
            tasks_dir: "current_tasks".to_string(),
            progress_file: "PROGRESS.md".to_string(),
            env: Vec::new(),
        }
    }

    /// Replace the built-in prompt template.
    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = Some(template.into());
        self
    }

    pub fn with_layout(mut self, tasks_dir: impl Into<String>, progress_file: impl Into<String>) -> Self {
        self.tasks_dir = tasks_dir.into();
        self.progress_file = progress_file.into();
        self
    }

    /// Extra environment for the agent command.
    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }

    pub fn render_prompt(&self, context: &WorkContext) -> Result<String, ExecuteError> {
        let prompt_context = PromptContext::from_work_context(context, &self.tasks_dir, &self.progress_file);
        self.engine
            .render_with_fallback(self.template.as_deref(), &prompt_context)
            .map_err(|e| ExecuteError::Render(format!("{:#}", e)))
    }

    async fn append_log(&self, iteration: u64, stdout: &[u8], stderr: &[u8]) -> std::io::Result<()> {
        if let Some(parent) = self.session_log.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.session_log)
            .await?;
        let header = format!("\n=== cycle {} output at {} ===\n", iteration, Utc::now().to_rfc3339());
        file.write_all(header.as_bytes()).await?;
        file.write_all(stdout).await?;
        if !stderr.is_empty() {
            file.write_all(b"\n--- stderr ---\n").await?;
            file.write_all(stderr).await?;
        }
        file.flush().await
    }
}

#[async_trait]
impl WorkGenerator for CommandWorkGenerator {
    async fn execute(&self, context: &WorkContext, workdir: &Path) -> Result<ExecutionReport, ExecuteError> {
        let prompt = self.render_prompt(context)?;

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(workdir)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecuteError::Spawn(format!("{}: {}", self.command, e)))?;

        // Feed stdin concurrently so a chatty command cannot fill its stdout
        // pipe while we are still writing.
        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                    debug!("Agent command closed stdin early: {}", e);
                }
            });
        }

        let output = child.wait_with_output().await?;
        if let Err(e) = self.append_log(context.iteration, &output.stdout, &output.stderr).await {
            warn!("Failed to append to session log {:?}: {}", self.session_log, e);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let lines: Vec<&str> = stderr.lines().collect();
        let logs = lines[lines.len().saturating_sub(REPORT_TAIL_LINES)..]
            .iter()
            .map(|l| l.to_string())
            .collect();

        match output.status.code() {
            Some(0) => Ok(ExecutionReport { exit_code: Some(0), logs }),
            Some(code) => Err(ExecuteError::NonZeroExit(code)),
            None => Err(ExecuteError::Killed),
        }
    }
}
