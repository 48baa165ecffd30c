// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # `coding-swarm-coordination` - Multi-Worker Coordination Crate
//!
//! Everything that makes independent workers behave as a swarm while sharing
//! nothing but one git repository.
//!
//! ## Crate Layout
//!
//! | Module | Layer | Contents |
//! |--------|-------|----------|
//! | [`domain`] | Domain | `TaskLock` advisory claims over the shared repository |
//! | [`application`] | Application | `WorkerLoop`, `FleetManager`, `StateAggregator` |
//!
//! ## Key Concepts
//!
//! - **Task lock**: a marker file committed under the tasks directory. A claim
//!   is only held once the commit adding it has been published.
//! - **Cycle**: one SYNC → BUILD_CONTEXT → EXECUTE → PUBLISH pass of a worker.
//! - **Snapshot**: an eventually-consistent read of the shared branch joined
//!   with the process table.

pub mod application;
pub mod domain;

pub use domain::*;
