// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use archon_core::domain::config::OpsConfig;

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show the resolved configuration (secrets redacted)
    Show {
        /// Show environment file paths checked
        #[arg(long)]
        paths: bool,
    },

    /// Validate configuration
    Validate {
        /// Environment file to validate (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },
}

pub async fn handle_command(command: ConfigCommand, env_file: Option<PathBuf>) -> Result<()> {
    match command {
        ConfigCommand::Show { paths } => show(env_file, paths).await,
        ConfigCommand::Validate { file } => validate(file.or(env_file)).await,
    }
}

async fn show(env_file: Option<PathBuf>, show_paths: bool) -> Result<()> {
    if show_paths {
        println!("{}", "Environment file discovery paths:".bold());
        if let Some(path) = &env_file {
            println!("  1. --env-file / ARCHON_ENV_FILE: {}", path.display());
        } else {
            println!("  1. --env-file / ARCHON_ENV_FILE: {}", "(not set)".dimmed());
        }
        println!("  2. ./.env");
        println!("  3. /mnt/user/appdata/archon/.env");
        println!();
    }

    let config = OpsConfig::load(env_file).context("Failed to load configuration")?;

    println!("{}", "Current configuration:".bold());
    match &config.source {
        Some(path) => println!("  Source: {}", path.display()),
        None => println!("  Source: {}", "(defaults and process environment)".dimmed()),
    }
    println!();
    let yaml = serde_yaml::to_string(&config).context("Failed to render configuration")?;
    println!("{}", yaml);

    Ok(())
}

async fn validate(env_file: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = OpsConfig::load(env_file).context("Failed to load configuration")?;

    config
        .validate()
        .context("Configuration validation failed")?;

    if config.backup.encryption {
        println!("{}", "✓ Backup encryption key present".green());
    }
    for service in &config.services {
        println!(
            "  {} → {}",
            service.name,
            service.liveness_url(&config.health.host).dimmed()
        );
    }
    println!("{}", "✓ Configuration is valid".green());

    Ok(())
}
