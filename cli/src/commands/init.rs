// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `swarm init` - write a starter configuration

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use std::path::PathBuf;

use swarm_core::domain::swarm_config::{generate_template, ConfigError};

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Where to write the template config
    #[arg(short, long, default_value = "swarm.yaml")]
    pub output: PathBuf,

    /// Overwrite an existing file
    #[arg(long)]
    pub force: bool,
}

pub async fn handle_command(args: InitArgs) -> Result<()> {
    match generate_template(&args.output, args.force) {
        Ok(path) => {
            println!("{}", format!("✓ Created {}", path.display()).green());
            println!("  Edit it, then run: swarm launch");
            Ok(())
        }
        Err(ConfigError::AlreadyExists(path)) => {
            anyhow::bail!(
                "{} already exists. Use -o to pick another name or --force to overwrite.",
                path.display()
            )
        }
        Err(e) => Err(e).context("Failed to write configuration template"),
    }
}
