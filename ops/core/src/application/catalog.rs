// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Artifact Catalog
//!
//! Read-only view of the backup root: listing, resolution of `latest` and of
//! named artifacts, and integrity verification.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Implements the `list` and `verify` operations and the
//!   artifact resolution used by restore

use serde::Serialize;
use std::path::PathBuf;
use tracing::{debug, warn};

use crate::application::blocking;
use crate::domain::artifact::{Artifact, ArtifactName, ArtifactRef, StorageForm};
use crate::domain::errors::{OpsError, OpsResult};
use crate::domain::pointer::LatestPointer;
use crate::infrastructure::checksum::{self, IntegrityStatus};
use crate::infrastructure::fs_tree;
use crate::infrastructure::layout::BackupLayout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumState {
    Recorded,
    Missing,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoredForm {
    pub form: StorageForm,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub checksum: ChecksumState,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArtifactSummary {
    pub name: ArtifactName,
    pub forms: Vec<StoredForm>,
    pub is_latest: bool,
}

#[derive(Debug)]
pub struct VerifiedForm {
    pub artifact: Artifact,
    pub result: OpsResult<IntegrityStatus>,
}

#[derive(Debug, Clone)]
pub struct ArtifactCatalog {
    layout: BackupLayout,
}

impl ArtifactCatalog {
    pub fn new(layout: BackupLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &BackupLayout {
        &self.layout
    }

    /// The Latest Pointer if it exists and its snapshot is still on disk.
    pub fn valid_latest(&self) -> Option<LatestPointer> {
        match self.layout.latest().load() {
            Ok(Some(pointer)) if pointer.is_valid() => Some(pointer),
            Ok(Some(pointer)) => {
                warn!(snapshot = %pointer.snapshot.display(), "Latest pointer references a missing snapshot");
                None
            }
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "Latest pointer unreadable");
                None
            }
        }
    }

    /// Resolve a reference to one stored form.
    ///
    /// `latest`: Latest Pointer, then newest archive, then newest snapshot.
    /// Named: snapshot, then compressed archive, then encrypted archive.
    pub fn resolve(&self, target: &ArtifactRef) -> OpsResult<Artifact> {
        let all = self.layout.list().map_err(|e| OpsError::io(self.layout.root(), e))?;

        match target {
            ArtifactRef::Latest => {
                if let Some(pointer) = self.valid_latest() {
                    debug!(name = %pointer.name, "Resolved latest via pointer");
                    return Ok(Artifact::new(pointer.name, StorageForm::Snapshot, pointer.snapshot));
                }
                if let Some(archive) = all.iter().filter(|a| a.is_archive()).max_by(|a, b| {
                    a.name.cmp(&b.name).then(b.form.cmp(&a.form))
                }) {
                    debug!(name = %archive.name, form = %archive.form, "Resolved latest via newest archive");
                    return Ok(archive.clone());
                }
                all.iter()
                    .filter(|a| a.form == StorageForm::Snapshot)
                    .max_by(|a, b| a.name.cmp(&b.name))
                    .cloned()
                    .ok_or_else(|| {
                        OpsError::NoBackupFound(format!("no artifacts under {}", self.layout.root().display()))
                    })
            }
            ArtifactRef::Named(name) => all
                .into_iter()
                .filter(|a| &a.name == name)
                .min_by(|a, b| a.form.cmp(&b.form))
                .ok_or_else(|| OpsError::NoBackupFound(name.to_string())),
        }
    }

    /// Every artifact grouped by name, newest first.
    pub async fn summaries(&self) -> OpsResult<Vec<ArtifactSummary>> {
        let layout = self.layout.clone();
        let latest = self.valid_latest().map(|p| p.name);
        let root = layout.root().to_path_buf();

        let mut summaries = blocking(root, move || {
            let mut out = Vec::new();
            for (name, artifacts) in layout.grouped()? {
                let mut forms = Vec::with_capacity(artifacts.len());
                for artifact in artifacts {
                    let size_bytes = match artifact.form {
                        StorageForm::Snapshot => fs_tree::tree_size(&artifact.path)?.bytes,
                        _ => std::fs::metadata(&artifact.path)?.len(),
                    };
                    forms.push(StoredForm {
                        form: artifact.form,
                        checksum: if artifact.has_checksum() {
                            ChecksumState::Recorded
                        } else {
                            ChecksumState::Missing
                        },
                        path: artifact.path,
                        size_bytes,
                    });
                }
                out.push(ArtifactSummary {
                    name,
                    forms,
                    is_latest: false,
                });
            }
            Ok(out)
        })
        .await?;

        summaries.reverse();
        for summary in &mut summaries {
            summary.is_latest = latest.as_ref() == Some(&summary.name);
        }
        Ok(summaries)
    }

    /// Verify every stored form of the referenced artifact.
    pub async fn verify(&self, target: &ArtifactRef) -> OpsResult<Vec<VerifiedForm>> {
        let resolved = self.resolve(target)?;
        let forms = self
            .layout
            .forms_of(&resolved.name)
            .map_err(|e| OpsError::io(self.layout.root(), e))?;

        let mut results = Vec::with_capacity(forms.len());
        for artifact in forms {
            let probe = artifact.clone();
            let result = match tokio::task::spawn_blocking(move || checksum::verify(&probe)).await {
                Ok(result) => result,
                Err(join) => Err(OpsError::Archive(format!("verification task failed: {}", join))),
            };
            results.push(VerifiedForm { artifact, result });
        }
        Ok(results)
    }
}
