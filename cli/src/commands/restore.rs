// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Restore command
//!
//! Commands: restore [name|latest] [--force], restore --rollback

use anyhow::{bail, Context, Result};
use colored::Colorize;
use dialoguer::{Confirm, Input, Password};
use std::path::PathBuf;

use archon_core::application::{RestoreEngine, RestoreOutcome, RestorePlan};
use archon_core::domain::artifact::ArtifactRef;
use archon_core::domain::config::Secret;
use archon_core::domain::notifier::Severity;

use crate::context::OpsContext;
use crate::output;
use crate::signals;

const CONFIRMATION_PHRASE: &str = "RESTORE";

pub async fn handle_command(
    target: ArtifactRef,
    force: bool,
    rollback: bool,
    env_file: Option<PathBuf>,
) -> Result<()> {
    let ctx = OpsContext::load(env_file)?;
    let engine = RestoreEngine::new(
        ctx.config.clone(),
        ctx.controller()?,
        ctx.probe()?,
        ctx.notifier.clone(),
    );

    if rollback {
        return roll_back_interrupted(&engine).await;
    }

    let plan = match engine.plan(&target) {
        Ok(plan) => plan,
        Err(e) => {
            output::status(Severity::Error, &format!("Restore refused: {}", e));
            bail!("restore refused before any change was made");
        }
    };
    describe(&plan);

    let mut passphrase = None;
    if !force {
        if !confirm()? {
            output::status(Severity::Info, "Restore cancelled, nothing was changed");
            return Ok(());
        }
        if plan.needs_passphrase {
            let entered = Password::new()
                .with_prompt("Backup encryption passphrase")
                .interact()
                .context("Failed to read passphrase")?;
            passphrase = Some(Secret::new(entered));
        }
    }

    let cancel = signals::cancel_on_signal();
    let spinner = output::spinner(format!("Restoring {}", plan.artifact_name));
    let result = engine.restore(&target, passphrase, &cancel).await;
    spinner.finish_and_clear();

    match result {
        Ok(RestoreOutcome::Restored(summary)) => {
            output::status(
                Severity::Success,
                &format!(
                    "Restored {} and verified all services in {:.1}s",
                    summary.artifact_name, summary.duration_secs
                ),
            );
            output::field("Integrity", &summary.integrity);
            if !summary.images_loaded.is_empty() {
                output::field("Images loaded", summary.images_loaded.join(", "));
            }
            if let Some(report) = &summary.report {
                output::field("Report", report.display());
            }
            Ok(())
        }
        Ok(RestoreOutcome::RolledBack { summary, rollback }) => {
            output::status(
                Severity::Warning,
                &format!(
                    "Restore of {} failed and was rolled back to the pre-restore state",
                    summary.artifact_name
                ),
            );
            output::field("Cause", rollback.cause.as_deref().unwrap_or("-"));
            output::field("Trees restored", rollback.restored_trees.join(", "));
            if let Some(report) = &summary.report {
                output::field("Report", report.display());
            }
            bail!("restore rolled back");
        }
        Err(e) => {
            output::status(Severity::Error, &format!("Restore failed: {}", e));
            if e.is_pre_destructive_guard() {
                output::status(Severity::Info, "No live data was modified");
            }
            bail!("restore failed");
        }
    }
}

fn describe(plan: &RestorePlan) {
    output::heading("Restore plan");
    output::field("Artifact", &plan.artifact_name);
    output::field("Storage form", plan.form);
    output::field("Source", plan.artifact_path.display());
    println!();
    println!("{}", "The following will be DELETED and replaced:".red().bold());
    for (label, path) in &plan.targets {
        println!("  {} {} ({})", "-".red(), path.display(), label);
    }
    println!("  {} {} (merged, local credentials kept)", "-".red(), plan.env_file.display());
    if !plan.preserved.is_empty() {
        let preserved: Vec<String> = plan.preserved.iter().map(|p| p.display().to_string()).collect();
        println!("  Preserved from the current install: {}", preserved.join(", ").dimmed());
    }
    println!();
    println!(
        "A safety copy of the current state is stored under {} and restored automatically if the restore fails.",
        plan.safety_dir.display().to_string().bold()
    );
    println!();
}

fn confirm() -> Result<bool> {
    let phrase: String = Input::new()
        .with_prompt(format!("Type {} to continue", CONFIRMATION_PHRASE))
        .allow_empty(true)
        .interact_text()
        .context("Failed to read confirmation")?;
    if phrase.trim() != CONFIRMATION_PHRASE {
        return Ok(false);
    }
    Confirm::new()
        .with_prompt("Stop services and replace live data now?")
        .default(false)
        .interact()
        .context("Failed to read confirmation")
}

async fn roll_back_interrupted(engine: &RestoreEngine) -> Result<()> {
    let spinner = output::spinner("Rolling back interrupted restore");
    let result = engine.rollback_interrupted().await;
    spinner.finish_and_clear();

    match result {
        Ok(report) => {
            output::status(Severity::Success, "Pre-restore state reinstated");
            output::field("Safety snapshot", report.snapshot_dir.display());
            output::field("Trees restored", report.restored_trees.join(", "));
            Ok(())
        }
        Err(e) => {
            output::status(Severity::Error, &format!("Rollback failed: {}", e));
            bail!("rollback failed");
        }
    }
}
