// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Maintenance command
//!
//! Commands: maintenance full|quick|health|cleanup|update|security

use anyhow::{bail, Result};
use std::path::PathBuf;

use archon_core::application::{MaintenanceService, MaintenanceTask};
use archon_core::domain::format_bytes;
use archon_core::domain::notifier::Severity;

use crate::context::OpsContext;
use crate::output;

pub async fn handle_command(task: MaintenanceTask, force: bool, env_file: Option<PathBuf>) -> Result<()> {
    let ctx = OpsContext::load(env_file)?;
    let service = MaintenanceService::new(
        ctx.config.clone(),
        ctx.controller()?,
        ctx.probe()?,
        ctx.notifier.clone(),
    );

    let spinner = output::spinner(format!("Running {} maintenance", task));
    let outcome = service.run(task, force).await;
    spinner.finish_and_clear();
    let outcome = outcome?;

    output::heading(&format!("Maintenance: {}", outcome.task));

    if let Some(health) = &outcome.health {
        for service in &health.services {
            let severity = if service.is_passing() { Severity::Success } else { Severity::Error };
            output::status(severity, &format!("{}: {}", service.service, service.status));
        }
        for disk in health.low_disks() {
            output::status(
                Severity::Warning,
                &format!("{} low on space: {} free", disk.label, format_bytes(disk.free_bytes)),
            );
        }
    }

    if let Some(cleanup) = &outcome.cleanup {
        output::status(
            Severity::Info,
            &format!(
                "Cleanup: {} expired artifact(s) ({} freed), {} old file(s) pruned, {} image space reclaimed",
                cleanup.retention.removed.len(),
                format_bytes(cleanup.retention.freed_bytes),
                cleanup.pruned_files.len(),
                format_bytes(cleanup.image_bytes_reclaimed)
            ),
        );
    }

    if let Some(update) = &outcome.update {
        if update.applied {
            let severity = match update.healthy_after {
                Some(false) => Severity::Error,
                _ => Severity::Success,
            };
            output::status(
                severity,
                &format!("Images updated after {} pull attempt(s)", update.pull_attempts),
            );
        } else {
            output::status(Severity::Info, "Update skipped (AUTO_UPDATE is off, use --force)");
        }
    }

    if let Some(findings) = &outcome.security {
        if findings.is_empty() {
            output::status(Severity::Success, "Security audit: no findings");
        }
        for finding in findings {
            output::status(finding.severity, &finding.message);
        }
    }

    for error in &outcome.errors {
        output::status(Severity::Error, error);
    }
    if let Some(report) = &outcome.report {
        output::field("Report", report.display());
    }

    if !outcome.is_success() {
        bail!("maintenance '{}' finished with issues", task);
    }
    Ok(())
}
