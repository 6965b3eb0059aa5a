// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Archon Operations CLI
//!
//! The `archon-ops` binary drives backup, restore, safety rollback, health
//! checks and maintenance for the four-service Archon stack on an Unraid host.
//!
//! ## Commands
//!
//! - `archon-ops backup full|incremental` - Create a backup artifact
//! - `archon-ops restore [name|latest] [--force] [--rollback]` - Restore with safety rollback
//! - `archon-ops health quick|comprehensive|monitor|report` - Service health
//! - `archon-ops maintenance full|quick|health|cleanup|update|security` - Upkeep
//! - `archon-ops list` / `verify` - Inspect stored artifacts
//! - `archon-ops config show|validate` - Configuration management
//!
//! Every invocation runs sequentially on a single-threaded runtime; an
//! external scheduler is expected to run one invocation per operation.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use std::path::PathBuf;

use archon_core::domain::artifact::{ArtifactRef, BackupMode};
use archon_core::domain::health::CheckMode;
use archon_core::application::MaintenanceTask;
use archon_ops::commands::{self, ConfigCommand};

/// Archon operations - backup, restore and health for the Archon stack
#[derive(Parser)]
#[command(name = "archon-ops")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Environment file with the stack configuration (overrides discovery)
    #[arg(
        short,
        long,
        global = true,
        env = "ARCHON_ENV_FILE",
        value_name = "FILE"
    )]
    env_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "ARCHON_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log output format
    #[arg(long, global = true, env = "ARCHON_LOG_FORMAT", value_enum, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a backup (full stops services for a consistent copy)
    #[command(name = "backup")]
    Backup {
        /// full or incremental
        #[arg(default_value = "full")]
        mode: BackupMode,
    },

    /// Restore a backup artifact, rolling back automatically on failure
    #[command(name = "restore")]
    Restore {
        /// Artifact name or "latest"
        #[arg(default_value = "latest")]
        target: ArtifactRef,

        /// Skip the interactive confirmation
        #[arg(long)]
        force: bool,

        /// Roll back an interrupted restore using its pending safety snapshot
        #[arg(long, conflicts_with = "force")]
        rollback: bool,
    },

    /// Check service health
    #[command(name = "health")]
    Health {
        /// quick, comprehensive, monitor or report
        #[arg(default_value = "quick")]
        mode: CheckMode,

        /// Print the report as JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Run maintenance tasks
    #[command(name = "maintenance")]
    Maintenance {
        /// full, quick, health, cleanup, update or security
        #[arg(default_value = "quick")]
        task: MaintenanceTask,

        /// Apply image updates even when AUTO_UPDATE is off
        #[arg(long)]
        force: bool,
    },

    /// List stored backup artifacts
    #[command(name = "list")]
    List {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Verify artifact checksums without restoring
    #[command(name = "verify")]
    Verify {
        /// Artifact name or "latest"
        #[arg(default_value = "latest")]
        target: ArtifactRef,
    },

    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level, cli.log_format)?;

    let env_file = cli.env_file;
    match cli.command {
        Some(Commands::Backup { mode }) => commands::backup::handle_command(mode, env_file).await,
        Some(Commands::Restore {
            target,
            force,
            rollback,
        }) => commands::restore::handle_command(target, force, rollback, env_file).await,
        Some(Commands::Health { mode, json }) => {
            commands::health::handle_command(mode, json, env_file).await
        }
        Some(Commands::Maintenance { task, force }) => {
            commands::maintenance::handle_command(task, force, env_file).await
        }
        Some(Commands::List { json }) => commands::list::handle_command(json, env_file).await,
        Some(Commands::Verify { target }) => commands::verify::handle_command(target, env_file).await,
        Some(Commands::Config { command }) => commands::config::handle_command(command, env_file).await,
        None => {
            eprintln!("{}", "No command specified. Use --help for usage.".yellow());
            std::process::exit(1);
        }
    }
}

/// Initialize tracing subscriber for logging
fn init_logging(level: &str, format: LogFormat) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    match format {
        LogFormat::Text => builder.compact().init(),
        LogFormat::Json => builder.json().flatten_event(true).init(),
    }

    Ok(())
}
