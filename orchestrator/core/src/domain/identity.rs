// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Worker Identity
//!
//! A [`WorkerIdentity`] names one running worker. The `id` doubles as the git
//! author of every commit the worker publishes, the container name suffix and
//! the session log prefix, so it must be unique among live workers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Model provider backing a worker's work generator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    Anthropic,
    Gemini,
    Openai,
}

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::Anthropic, Provider::Gemini, Provider::Openai];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Anthropic => "anthropic",
            Provider::Gemini => "gemini",
            Provider::Openai => "openai",
        }
    }

    /// Model used when an agent entry leaves `model` empty.
    pub fn default_model(&self) -> &'static str {
        match self {
            Provider::Anthropic => "claude-opus-4-20250514",
            Provider::Gemini => "gemini-2.5-pro",
            Provider::Openai => "o3",
        }
    }

    /// Environment variable conventionally holding this provider's API key.
    pub fn api_key_env(&self) -> &'static str {
        match self {
            Provider::Anthropic => "ANTHROPIC_API_KEY",
            Provider::Gemini => "GEMINI_API_KEY",
            Provider::Openai => "OPENAI_API_KEY",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "anthropic" => Ok(Provider::Anthropic),
            "gemini" => Ok(Provider::Gemini),
            "openai" => Ok(Provider::Openai),
            other => Err(format!(
                "Invalid provider '{}'. Valid providers: anthropic, gemini, openai",
                other
            )),
        }
    }
}

/// Identity of a single worker instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerIdentity {
    /// Unique id, `<role>-<index>` when assigned by the fleet manager.
    pub id: String,
    pub role: String,
    pub provider: Provider,
    pub model: String,
}

impl WorkerIdentity {
    pub fn new(id: impl Into<String>, role: impl Into<String>, provider: Provider, model: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: role.into(),
            provider,
            model: model.into(),
        }
    }

    /// Identity assigned to the `index`-th instance of `role`.
    pub fn for_slot(role: &str, index: usize, provider: Provider, model: &str) -> Self {
        Self::new(format!("{}-{}", role, index), role, provider, model)
    }

    /// Commit author email derived from the id.
    pub fn email(&self) -> String {
        format!("{}@coding-swarm.local", self.id)
    }

    /// Container name used by the Docker launcher.
    pub fn container_name(&self) -> String {
        format!("swarm-{}", self.id)
    }
}

impl fmt::Display for WorkerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}/{})", self.id, self.provider, self.model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_parse_is_case_insensitive() {
        assert_eq!("Gemini".parse::<Provider>().unwrap(), Provider::Gemini);
        assert_eq!(" openai ".parse::<Provider>().unwrap(), Provider::Openai);
        assert!("mistral".parse::<Provider>().is_err());
    }

    #[test]
    fn test_slot_identity() {
        let identity = WorkerIdentity::for_slot("test-writer", 2, Provider::Openai, "o3");
        assert_eq!(identity.id, "test-writer-2");
        assert_eq!(identity.role, "test-writer");
        assert_eq!(identity.email(), "test-writer-2@coding-swarm.local");
        assert_eq!(identity.container_name(), "swarm-test-writer-2");
    }
}
