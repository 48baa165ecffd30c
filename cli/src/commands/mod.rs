// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for the swarm CLI

pub mod init;
pub mod launch;
pub mod logs;
pub mod status;
pub mod stop;
pub mod unlock;
pub mod worker;

pub use self::init::InitArgs;
pub use self::launch::LaunchArgs;
pub use self::logs::LogsArgs;
pub use self::status::StatusArgs;
pub use self::stop::StopArgs;
pub use self::unlock::UnlockArgs;
pub use self::worker::WorkerArgs;
