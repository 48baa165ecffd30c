// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Work Generation Seam
//!
//! The step that actually changes code is external to the swarm: any system
//! that can take a [`WorkContext`] and a working copy, edit files in place and
//! report what it did. The worker loop treats it as opaque and fallible.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::domain::context::WorkContext;

/// What the generator reports after a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub exit_code: Option<i32>,
    /// Captured log lines, when the generator does not stream them elsewhere.
    pub logs: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error("Failed to start work generator: {0}")]
    Spawn(String),
    #[error("Work generator exited with status {0}")]
    NonZeroExit(i32),
    #[error("Work generator terminated by signal")]
    Killed,
    #[error("Failed to render work context: {0}")]
    Render(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Produces modifications in a working copy from a context.
#[async_trait]
pub trait WorkGenerator: Send + Sync {
    async fn execute(&self, context: &WorkContext, workdir: &Path) -> Result<ExecutionReport, ExecuteError>;
}
