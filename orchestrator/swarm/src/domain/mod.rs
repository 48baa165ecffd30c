// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Coordination Domain Layer
//!
//! | Module | Key Types |
//! |--------|-----------|
//! | [`task_lock`] | `TaskLock`, `AcquireOutcome`, `ReleaseOutcome` |

pub mod task_lock;

pub use task_lock::*;
