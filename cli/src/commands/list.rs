// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! List stored artifacts.

use anyhow::{Context, Result};
use colored::Colorize;
use std::path::PathBuf;

use archon_core::application::ArtifactCatalog;
use archon_core::application::catalog::ChecksumState;
use archon_core::domain::format_bytes;
use archon_core::infrastructure::layout::BackupLayout;

use crate::context::OpsContext;

pub async fn handle_command(json: bool, env_file: Option<PathBuf>) -> Result<()> {
    let ctx = OpsContext::load(env_file)?;
    let catalog = ArtifactCatalog::new(BackupLayout::new(ctx.config.paths.backups.clone()));
    let summaries = catalog.summaries().await.context("Failed to list artifacts")?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&summaries).context("Failed to serialize artifact list")?
        );
        return Ok(());
    }

    if summaries.is_empty() {
        println!(
            "{}",
            format!("No backups found under {}", ctx.config.paths.backups.display()).yellow()
        );
        return Ok(());
    }

    println!(
        "{:<32} {:<11} {:>10}  {:<9} {}",
        "NAME".bold(),
        "FORM".bold(),
        "SIZE".bold(),
        "CHECKSUM".bold(),
        "LATEST".bold()
    );
    for summary in &summaries {
        for (i, form) in summary.forms.iter().enumerate() {
            let name = if i == 0 { summary.name.to_string() } else { String::new() };
            let checksum = match form.checksum {
                ChecksumState::Recorded => "recorded".green(),
                ChecksumState::Missing => "missing".yellow(),
            };
            let latest = if i == 0 && summary.is_latest { "*".cyan().bold() } else { "".normal() };
            println!(
                "{:<32} {:<11} {:>10}  {:<9} {}",
                name,
                form.form.to_string(),
                format_bytes(form.size_bytes),
                checksum,
                latest
            );
        }
    }
    Ok(())
}
