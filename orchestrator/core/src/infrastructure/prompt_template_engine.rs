// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Prompt Template Engine
//!
//! Renders a [`WorkContext`] into the prompt handed to the external work
//! generator, using Handlebars for placeholder substitution.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Transform a work context into generator input
//! - **Integration:** Worker loop BUILD_CONTEXT → work generator stdin
//!
//! # Supported Placeholders
//!
//! - `{{agent_id}}`, `{{role}}`, `{{provider}}`, `{{model}}` - Worker identity
//! - `{{iteration}}` - 1-based cycle counter
//! - `{{branch}}`, `{{tasks_dir}}`, `{{progress_file}}` - Repository layout
//! - `{{instructions}}` - Role prompt file content
//! - `{{test_command}}` - Project test command, if any
//! - `{{#each locks}}` - `task_id`, `owner`, `description`, `mine`
//! - `{{#each contested}}` - `task_id`, `holder` of claims lost last cycle
//! - `{{#each history}}` - `id`, `author`, `timestamp`, `summary`
//! - `{{status_document}}` - Current status document
//!
//! Output is not HTML-escaped.

use anyhow::{Context, Result};
use handlebars::Handlebars;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::domain::context::{HistoryEntry, WorkContext};
use crate::domain::lock::ContestedClaim;

const DEFAULT_TEMPLATE: &str = include_str!("../../templates/work_context.hbs");

/// A lock as presented to the template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptLock {
    pub task_id: String,
    pub owner: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Held by the worker the prompt is for.
    pub mine: bool,
}

/// Context data for prompt template rendering
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptContext {
    pub agent_id: String,
    pub role: String,
    pub provider: String,
    pub model: String,
    pub iteration: u64,
    pub branch: String,
    pub tasks_dir: String,
    pub progress_file: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub instructions: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_command: Option<String>,
    pub locks: Vec<PromptLock>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub contested: Vec<ContestedClaim>,
    pub history: Vec<HistoryEntry>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub status_document: String,

    /// Additional custom fields
    #[serde(flatten)]
    pub extras: HashMap<String, serde_json::Value>,
}

impl PromptContext {
    pub fn from_work_context(context: &WorkContext, tasks_dir: &str, progress_file: &str) -> Self {
        let me = &context.identity.id;
        Self {
            agent_id: me.clone(),
            role: context.identity.role.clone(),
            provider: context.identity.provider.to_string(),
            model: context.identity.model.clone(),
            iteration: context.iteration,
            branch: context.branch.clone(),
            tasks_dir: tasks_dir.to_string(),
            progress_file: progress_file.to_string(),
            instructions: context.instructions.trim().to_string(),
            test_command: context.test_command.clone(),
            locks: context
                .locks
                .iter()
                .map(|l| PromptLock {
                    task_id: l.task_id.clone(),
                    owner: l.owner.clone(),
                    description: l.description.clone(),
                    mine: &l.owner == me,
                })
                .collect(),
            contested: context.contested_claims.clone(),
            history: context.history.clone(),
            status_document: context.status_document.trim().to_string(),
            extras: HashMap::new(),
        }
    }

    /// Add extra field
    pub fn extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extras.insert(key.into(), value);
        self
    }
}

pub struct PromptTemplateEngine {
    handlebars: Handlebars<'static>,
}

impl PromptTemplateEngine {
    pub fn new() -> Self {
        let mut handlebars = Handlebars::new();
        handlebars.set_strict_mode(false); // Don't fail on missing variables
        handlebars.register_escape_fn(handlebars::no_escape);
        Self { handlebars }
    }

    pub fn render(&self, template: &str, context: &PromptContext) -> Result<String> {
        self.handlebars
            .render_template(template, context)
            .context("Failed to render prompt template")
    }

    /// Render with `template`, or the built-in template when none is given.
    pub fn render_with_fallback(&self, template: Option<&str>, context: &PromptContext) -> Result<String> {
        self.render(template.unwrap_or(Self::default_template()), context)
    }

    pub fn default_template() -> &'static str {
        DEFAULT_TEMPLATE
    }

    /// Validate template syntax without rendering
    pub fn validate_template(&self, template: &str) -> Result<()> {
        handlebars::template::Template::compile(template)
            .map(|_| ())
            .context("Invalid Handlebars template syntax")
    }
}

impl Default for PromptTemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}
