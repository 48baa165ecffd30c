// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Application Layer
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Long-running swarm services built on the task lock and the
//!   core launchers

pub mod aggregator;
pub mod fleet;
pub mod worker_loop;

pub use aggregator::{list_log_files, AggregateError, StateAggregator};
pub use fleet::{
    plan_workers, FleetError, FleetLayout, FleetManager, LaunchFailure, LaunchReport, StopReport,
};
pub use worker_loop::{CycleReport, WorkerError, WorkerLoop, WorkerLoopConfig, WorkerState};
