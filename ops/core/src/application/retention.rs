// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Backup retention.
//!
//! Artifacts whose creation time (encoded in the name) is older than the
//! retention window are deleted in every storage form together with their
//! sidecars. A Latest Pointer left referencing a missing snapshot is cleared
//! afterwards.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::fs;
use std::io;
use tracing::{info, warn};

use crate::domain::artifact::{ArtifactName, StorageForm};
use crate::infrastructure::fs_tree;
use crate::infrastructure::layout::BackupLayout;

#[derive(Debug, Clone, Default, Serialize)]
pub struct RetentionSummary {
    pub removed: Vec<(ArtifactName, StorageForm)>,
    pub freed_bytes: u64,
    pub cleared_latest: bool,
}

/// Delete expired artifacts. `keep` is never deleted (the run that just
/// produced it).
pub fn apply(
    layout: &BackupLayout,
    retention_days: u32,
    now: DateTime<Utc>,
    keep: Option<&ArtifactName>,
) -> io::Result<RetentionSummary> {
    let cutoff = now - ChronoDuration::days(i64::from(retention_days));
    let mut summary = RetentionSummary::default();

    for (name, artifacts) in layout.grouped()? {
        if keep == Some(&name) {
            continue;
        }
        let created = match name.created_at() {
            Some(ts) => ts,
            None => continue,
        };
        if created >= cutoff {
            continue;
        }

        for artifact in artifacts {
            let size = match artifact.form {
                StorageForm::Snapshot => fs_tree::tree_size(&artifact.path).map(|s| s.bytes).unwrap_or(0),
                _ => fs::metadata(&artifact.path).map(|m| m.len()).unwrap_or(0),
            };
            match fs_tree::remove_path(&artifact.path) {
                Ok(()) => {
                    fs_tree::remove_path(&artifact.checksum_path)?;
                    info!(artifact = %name, form = %artifact.form, "Removed expired artifact");
                    summary.freed_bytes += size;
                    summary.removed.push((name.clone(), artifact.form));
                }
                Err(e) => warn!(artifact = %name, form = %artifact.form, error = %e, "Failed to remove expired artifact"),
            }
        }
    }

    let latest = layout.latest();
    let dangling = match latest.load() {
        Ok(Some(pointer)) => !pointer.is_valid(),
        Ok(None) => false,
        Err(_) => true,
    };
    if dangling {
        warn!("Clearing Latest Pointer that no longer references a snapshot");
        latest.clear()?;
        summary.cleared_latest = true;
    }

    Ok(summary)
}
