// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Coding Swarm Core
//!
//! Domain types shared by every swarm component, plus the infrastructure that
//! touches the outside world: the git-backed shared repository, worker
//! launchers and the external work generator.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Domain model and infrastructure adapters

pub mod domain;
pub mod infrastructure;

pub use domain::*;
