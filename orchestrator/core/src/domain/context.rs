// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Work Context
//!
//! The immutable value a worker assembles once per cycle and hands to its
//! work generator. Nothing in the coordination path reads it back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::identity::WorkerIdentity;
use crate::domain::lock::{ContestedClaim, LockRecord};

/// One commit from the shared history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Abbreviated (8 character) commit id.
    pub id: String,
    pub author: String,
    pub timestamp: DateTime<Utc>,
    pub summary: String,
}

/// Everything a work generator is told about the swarm for one cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkContext {
    pub identity: WorkerIdentity,
    /// 1-based cycle counter of the owning worker.
    pub iteration: u64,
    pub branch: String,
    pub locks: Vec<LockRecord>,
    /// Claims from the previous cycle that lost to another worker.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contested_claims: Vec<ContestedClaim>,
    pub history: Vec<HistoryEntry>,
    pub status_document: String,
    pub instructions: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_command: Option<String>,
    pub built_at: DateTime<Utc>,
}

impl WorkContext {
    /// Locks held by this worker.
    pub fn own_locks(&self) -> impl Iterator<Item = &LockRecord> {
        self.locks.iter().filter(move |l| l.owner == self.identity.id)
    }

    /// Locks held by anyone else.
    pub fn foreign_locks(&self) -> impl Iterator<Item = &LockRecord> {
        self.locks.iter().filter(move |l| l.owner != self.identity.id)
    }
}
