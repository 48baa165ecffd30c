// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod git_sync;
pub mod process;
pub mod prompt_template_engine;
pub mod runtime;
pub mod upstream;
pub mod work_generator;

pub use git_sync::{PushOutcome, PushStatus, Reconciliation, SyncClient, SyncError};
pub use process::LocalProcessLauncher;
pub use runtime::DockerLauncher;
