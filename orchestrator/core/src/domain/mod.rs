// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Swarm vocabulary shared by the coordination layer and the CLI

pub mod context;
pub mod identity;
pub mod lock;
pub mod runtime;
pub mod snapshot;
pub mod swarm_config;
pub mod work;
