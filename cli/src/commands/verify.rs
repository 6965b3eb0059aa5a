// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Verify artifact integrity without restoring.

use anyhow::{bail, Result};
use std::path::PathBuf;

use archon_core::application::ArtifactCatalog;
use archon_core::domain::artifact::ArtifactRef;
use archon_core::domain::notifier::Severity;
use archon_core::infrastructure::checksum::IntegrityStatus;
use archon_core::infrastructure::layout::BackupLayout;

use crate::context::OpsContext;
use crate::output;

pub async fn handle_command(target: ArtifactRef, env_file: Option<PathBuf>) -> Result<()> {
    let ctx = OpsContext::load(env_file)?;
    let catalog = ArtifactCatalog::new(BackupLayout::new(ctx.config.paths.backups.clone()));

    let spinner = output::spinner(format!("Verifying {}", target));
    let results = catalog.verify(&target).await;
    spinner.finish_and_clear();

    let results = match results {
        Ok(results) => results,
        Err(e) => {
            output::status(Severity::Error, &e.to_string());
            bail!("verification failed");
        }
    };

    let mut failed = 0;
    for verified in &results {
        let label = format!("{} ({})", verified.artifact.name, verified.artifact.form);
        match &verified.result {
            Ok(IntegrityStatus::Verified(digest)) => {
                output::status(Severity::Success, &format!("{}: {}", label, digest));
            }
            Ok(IntegrityStatus::Unrecorded) => {
                output::status(Severity::Warning, &format!("{}: no checksum recorded", label));
            }
            Err(e) => {
                failed += 1;
                output::status(Severity::Error, &format!("{}: {}", label, e));
            }
        }
    }

    if failed > 0 {
        bail!("{} of {} form(s) failed verification", failed, results.len());
    }
    Ok(())
}
