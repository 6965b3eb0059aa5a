// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Safety-Rollback Coordinator
//!
//! Takes the pre-restore Safety Snapshot and hands back a [`SafetyGuard`]
//! that owns the compensating action. The guard is consumed by exactly one of
//! [`SafetyGuard::commit`] (verified restore, snapshot deleted) or
//! [`SafetyGuard::roll_back`] (snapshot copied back, services restarted), so
//! the compensation cannot run twice.
//!
//! The snapshot pointer is persisted to `.safety/pending.json` before the
//! guard is returned. If the process dies mid-restore the pointer survives,
//! blocks further restores, and `restore --rollback` replays the rollback via
//! [`RollbackCoordinator::recover_interrupted`].
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Implements the safety-rollback protocol around restore

use chrono::Utc;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::application::blocking;
use crate::domain::artifact::{ArtifactName, TIMESTAMP_FORMAT};
use crate::domain::config::OwnershipConfig;
use crate::domain::errors::{OpsError, OpsResult};
use crate::domain::path_guard::TargetPathGuard;
use crate::domain::pointer::{CapturedTree, SafetyPointer};
use crate::domain::rollback::{RollbackEvent, RollbackState};
use crate::domain::service::ServiceController;
use crate::infrastructure::fs_tree;
use crate::infrastructure::layout::BackupLayout;

const ENV_SNAPSHOT_FILE: &str = "env";

#[derive(Debug, Clone, Serialize)]
pub struct RollbackReport {
    pub snapshot_dir: PathBuf,
    pub restored_trees: Vec<String>,
    pub env_restored: bool,
    /// What caused the rollback (absent for operator-requested recovery)
    pub cause: Option<String>,
}

/// A live tree the restore is about to replace.
#[derive(Debug, Clone)]
pub struct LiveTree {
    pub label: String,
    pub path: PathBuf,
}

pub struct RollbackCoordinator {
    layout: BackupLayout,
    controller: Arc<dyn ServiceController>,
    guard: TargetPathGuard,
    ownership: OwnershipConfig,
}

impl RollbackCoordinator {
    pub fn new(
        layout: BackupLayout,
        controller: Arc<dyn ServiceController>,
        guard: TargetPathGuard,
        ownership: OwnershipConfig,
    ) -> Self {
        Self {
            layout,
            controller,
            guard,
            ownership,
        }
    }

    /// The persisted pointer of an interrupted restore, if any.
    pub fn pending(&self) -> OpsResult<Option<SafetyPointer>> {
        let store = self.layout.pending_safety();
        store.load().map_err(|e| OpsError::io(store.path(), e))
    }

    pub fn ensure_no_pending(&self) -> OpsResult<()> {
        let store = self.layout.pending_safety();
        if store.exists() {
            return Err(OpsError::PendingRollback(store.path().to_path_buf()));
        }
        Ok(())
    }

    /// Copy the live trees and env file into `.safety/<ts>/` and persist the pointer.
    pub async fn capture(
        &self,
        restoring: &ArtifactName,
        trees: &[LiveTree],
        env_file: &Path,
        preserved: &[PathBuf],
        preserved_root: &Path,
    ) -> OpsResult<SafetyGuard<'_>> {
        let safety_dir = self.layout.safety_dir();
        fs::create_dir_all(&safety_dir).map_err(|e| OpsError::io(&safety_dir, e))?;

        let ram_backed = fs_tree::is_ram_backed(&safety_dir).map_err(|e| OpsError::io(&safety_dir, e))?;
        if ram_backed {
            return Err(OpsError::UnsafeTargetPath {
                path: safety_dir,
                reason: "safety snapshot location is on a RAM-backed filesystem".to_string(),
            });
        }

        let sources: Vec<PathBuf> = trees.iter().map(|t| t.path.clone()).collect();
        let probe_dir = safety_dir.clone();
        let (required, available) = blocking(&safety_dir, move || {
            let mut required = 0;
            for source in &sources {
                required += fs_tree::tree_size(source)?.bytes;
            }
            Ok((required, fs_tree::free_space(&probe_dir)?.free))
        })
        .await?;
        if available < required {
            return Err(OpsError::InsufficientStorage {
                path: safety_dir,
                required,
                available,
            });
        }

        let mut stamp = Utc::now().format(TIMESTAMP_FORMAT).to_string();
        let mut suffix = 1;
        while safety_dir.join(&stamp).exists() {
            stamp = format!("{}_{}", Utc::now().format(TIMESTAMP_FORMAT), suffix);
            suffix += 1;
        }
        let snapshot_dir = safety_dir.join(stamp);
        info!(snapshot = %snapshot_dir.display(), "Taking safety snapshot");

        match self
            .copy_live(&snapshot_dir, trees, env_file, preserved, preserved_root, restoring)
            .await
        {
            Ok(pointer) => {
                let store = self.layout.pending_safety();
                if let Err(e) = store.store(&pointer) {
                    let _ = fs_tree::remove_path(&snapshot_dir);
                    return Err(OpsError::io(store.path(), e));
                }
                let state = RollbackState::Idle
                    .apply(RollbackEvent::SnapshotCompleted)
                    .unwrap_or(RollbackState::SnapshotTaken);
                Ok(SafetyGuard {
                    coordinator: self,
                    pointer: Some(pointer),
                    state,
                })
            }
            Err(e) => {
                let _ = fs_tree::remove_path(&snapshot_dir);
                Err(e)
            }
        }
    }

    async fn copy_live(
        &self,
        snapshot_dir: &Path,
        trees: &[LiveTree],
        env_file: &Path,
        preserved: &[PathBuf],
        preserved_root: &Path,
        restoring: &ArtifactName,
    ) -> OpsResult<SafetyPointer> {
        let mut captured = Vec::with_capacity(trees.len());
        for tree in trees {
            let dest = snapshot_dir.join(&tree.label);
            let (src, dst) = (tree.path.clone(), dest.clone());
            blocking(&tree.path, move || fs_tree::copy_tree(&src, &dst)).await?;
            captured.push(CapturedTree {
                label: tree.label.clone(),
                live_path: tree.path.clone(),
                snapshot_path: dest,
            });
        }

        let env_capture = if env_file.is_file() {
            let dest = snapshot_dir.join(ENV_SNAPSHOT_FILE);
            fs::copy(env_file, &dest).map_err(|e| OpsError::io(env_file, e))?;
            Some(CapturedTree {
                label: ENV_SNAPSHOT_FILE.to_string(),
                live_path: env_file.to_path_buf(),
                snapshot_path: dest,
            })
        } else {
            None
        };

        let preserved = preserved
            .iter()
            .filter(|rel| fs::symlink_metadata(preserved_root.join(rel)).is_ok())
            .cloned()
            .collect();

        Ok(SafetyPointer {
            created_at: Utc::now(),
            snapshot_dir: snapshot_dir.to_path_buf(),
            restoring: restoring.to_string(),
            trees: captured,
            env_file: env_capture,
            env_target: Some(env_file.to_path_buf()),
            preserved,
        })
    }

    /// Stop services, copy the captured content back, start services.
    ///
    /// On success the snapshot and pointer are removed. On failure both are
    /// kept and `RollbackFailed` names the snapshot location.
    async fn restore_snapshot(&self, pointer: &SafetyPointer) -> OpsResult<Vec<String>> {
        let fail = |reason: String| OpsError::RollbackFailed {
            snapshot: pointer.snapshot_dir.clone(),
            reason,
        };

        if let Err(e) = self.controller.stop_all().await {
            warn!(error = %e, "Failed to stop services before rollback, continuing");
        }

        let mut restored = Vec::with_capacity(pointer.trees.len());
        for tree in &pointer.trees {
            if !tree.snapshot_path.is_dir() {
                return Err(fail(format!("captured tree {} is missing", tree.snapshot_path.display())));
            }
            let planned = self
                .guard
                .validate_prospective(&tree.live_path)
                .map_err(|e| fail(e.to_string()))?;
            fs::create_dir_all(&planned).map_err(|e| fail(e.to_string()))?;
            let live = self.guard.validate(&planned).map_err(|e| fail(e.to_string()))?;
            let src = tree.snapshot_path.clone();
            blocking(&live.clone(), move || fs_tree::replace_tree(&src, &live))
                .await
                .map_err(|e| fail(e.to_string()))?;
            let (uid, gid, live) = (self.ownership.uid, self.ownership.gid, tree.live_path.clone());
            if let Err(e) = blocking(&live.clone(), move || fs_tree::chown_tree(&live, uid, gid)).await {
                warn!(error = %e, "Could not apply ownership after rollback");
            }
            info!(tree = %tree.label, path = %tree.live_path.display(), "Tree rolled back");
            restored.push(tree.label.clone());
        }

        match (&pointer.env_file, &pointer.env_target) {
            (Some(env), _) => {
                fs::copy(&env.snapshot_path, &env.live_path).map_err(|e| fail(e.to_string()))?;
                info!(path = %env.live_path.display(), "Environment file rolled back");
            }
            (None, Some(target)) => {
                fs_tree::remove_path(target).map_err(|e| fail(e.to_string()))?;
                info!(path = %target.display(), "Environment file absent before restore, removed");
            }
            (None, None) => {}
        }

        self.controller
            .start_all()
            .await
            .map_err(|e| fail(format!("data restored but services failed to start: {}", e)))?;

        self.discard(pointer).await;
        Ok(restored)
    }

    async fn discard(&self, pointer: &SafetyPointer) {
        let dir = pointer.snapshot_dir.clone();
        if let Err(e) = blocking(&dir.clone(), move || fs_tree::remove_path(&dir)).await {
            warn!(error = %e, "Failed to delete safety snapshot");
        }
        let store = self.layout.pending_safety();
        if let Err(e) = store.clear() {
            warn!(error = %e, path = %store.path().display(), "Failed to clear safety pointer");
        }
    }

    /// Replay the rollback of a restore that was interrupted.
    pub async fn recover_interrupted(&self) -> OpsResult<RollbackReport> {
        let pointer = self.pending()?.ok_or_else(|| {
            OpsError::NoBackupFound("no interrupted restore to roll back".to_string())
        })?;
        warn!(
            snapshot = %pointer.snapshot_dir.display(),
            restoring = %pointer.restoring,
            "Rolling back interrupted restore"
        );
        let restored = self.restore_snapshot(&pointer).await?;
        Ok(RollbackReport {
            snapshot_dir: pointer.snapshot_dir.clone(),
            restored_trees: restored,
            env_restored: pointer.env_file.is_some(),
            cause: None,
        })
    }
}

/// Holds the Safety Snapshot for the duration of one restore.
pub struct SafetyGuard<'a> {
    coordinator: &'a RollbackCoordinator,
    pointer: Option<SafetyPointer>,
    state: RollbackState,
}

impl SafetyGuard<'_> {
    pub fn state(&self) -> RollbackState {
        self.state
    }

    pub fn snapshot_dir(&self) -> Option<&Path> {
        self.pointer.as_ref().map(|p| p.snapshot_dir.as_path())
    }

    /// Captured copy of a live tree, by label.
    pub fn captured(&self, label: &str) -> Option<&Path> {
        self.pointer
            .as_ref()?
            .trees
            .iter()
            .find(|t| t.label == label)
            .map(|t| t.snapshot_path.as_path())
    }

    /// Captured env file, if one existed.
    pub fn captured_env(&self) -> Option<&Path> {
        self.pointer
            .as_ref()?
            .env_file
            .as_ref()
            .map(|e| e.snapshot_path.as_path())
    }

    pub fn preserved(&self) -> &[PathBuf] {
        self.pointer.as_ref().map(|p| p.preserved.as_slice()).unwrap_or(&[])
    }

    fn advance(&mut self, event: RollbackEvent) {
        match self.state.apply(event) {
            Ok(next) => self.state = next,
            Err(e) => warn!(error = %e, "Ignoring rollback transition"),
        }
    }

    /// Mark the start of the first destructive step.
    pub fn begin_destructive(&mut self) {
        self.advance(RollbackEvent::DestructiveStepStarted);
    }

    /// Restore verified: delete the snapshot.
    pub async fn commit(mut self) -> RollbackState {
        if let Some(pointer) = self.pointer.take() {
            self.advance(RollbackEvent::DestructiveStepStarted);
            self.advance(RollbackEvent::VerificationPassed);
            self.coordinator.discard(&pointer).await;
            info!("Restore verified, safety snapshot removed");
        }
        self.state
    }

    /// Put the captured content back and restart services.
    pub async fn roll_back(mut self, cause: &OpsError) -> OpsResult<RollbackReport> {
        let Some(pointer) = self.pointer.take() else {
            return Err(OpsError::RollbackFailed {
                snapshot: PathBuf::new(),
                reason: "safety snapshot already consumed".to_string(),
            });
        };
        warn!(cause = %cause, snapshot = %pointer.snapshot_dir.display(), "Rolling back restore");

        match self.coordinator.restore_snapshot(&pointer).await {
            Ok(restored) => {
                self.advance(RollbackEvent::RollbackCompleted);
                Ok(RollbackReport {
                    snapshot_dir: pointer.snapshot_dir.clone(),
                    restored_trees: restored,
                    env_restored: pointer.env_file.is_some(),
                    cause: Some(cause.to_string()),
                })
            }
            Err(e) => {
                error!(error = %e, "Rollback failed");
                Err(e)
            }
        }
    }
}

impl Drop for SafetyGuard<'_> {
    fn drop(&mut self) {
        if let Some(pointer) = &self.pointer {
            warn!(
                snapshot = %pointer.snapshot_dir.display(),
                "Restore ended without commit or rollback; safety snapshot left pending"
            );
        }
    }
}
