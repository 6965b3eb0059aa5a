// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Backup command
//!
//! Commands: backup full, backup incremental

use anyhow::{bail, Result};
use colored::Colorize;
use std::path::PathBuf;

use archon_core::application::ArchiveEngine;
use archon_core::domain::artifact::BackupMode;
use archon_core::domain::format_bytes;
use archon_core::domain::notifier::Severity;

use crate::context::OpsContext;
use crate::output;
use crate::signals;

pub async fn handle_command(mode: BackupMode, env_file: Option<PathBuf>) -> Result<()> {
    let ctx = OpsContext::load(env_file)?;
    let engine = ArchiveEngine::new(ctx.config.clone(), ctx.controller()?, ctx.notifier.clone());
    let cancel = signals::cancel_on_signal();

    if mode == BackupMode::Full {
        output::status(
            Severity::Info,
            "Full backup: services are stopped during the copy and restarted afterwards",
        );
    }

    let spinner = output::spinner(format!("Creating {} backup", mode));
    let result = engine.create_backup(mode, &cancel).await;
    spinner.finish_and_clear();

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(e) => {
            output::status(Severity::Error, &format!("Backup failed: {}", e));
            bail!("backup failed");
        }
    };

    output::status(
        Severity::Success,
        &format!("Backup {} created in {:.1}s", outcome.name, outcome.duration_secs),
    );
    output::field("Mode", outcome.mode);
    output::field("Artifact", outcome.artifact.path.display());
    output::field("Storage form", outcome.artifact.form);
    output::field("SHA-256", &outcome.checksum);
    output::field(
        "Base snapshot",
        outcome
            .base
            .as_ref()
            .map_or_else(|| "-".dimmed().to_string(), |b| b.to_string()),
    );
    output::field(
        "Files",
        format!(
            "{} copied, {} hard-linked ({})",
            outcome.stats.copied_files,
            outcome.stats.linked_files,
            format_bytes(outcome.stats.total_bytes())
        ),
    );
    if !outcome.images.is_empty() {
        output::field("Images", outcome.images.join(", "));
    }
    if !outcome.retention.removed.is_empty() {
        output::field(
            "Expired removed",
            format!(
                "{} ({} freed)",
                outcome.retention.removed.len(),
                format_bytes(outcome.retention.freed_bytes)
            ),
        );
    }
    if let Some(report) = &outcome.report {
        output::field("Report", report.display());
    }
    Ok(())
}
