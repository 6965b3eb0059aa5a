// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Restore Engine
//!
//! Replaces the live data directories with the contents of a backup artifact.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Implements `restore [name|latest]` and `restore --rollback`
//!
//! # Sequence
//!
//! Everything up to "stop services" is read-only; every check that can refuse
//! the restore (pending rollback, integrity, decryption, path safety) runs
//! there.
//!
//! 1. Refuse if an interrupted restore left a pending Safety Snapshot
//! 2. Resolve the artifact, verify its checksum
//! 3. Validate the live target paths against the allow-list
//! 4. Decrypt/extract archives into `.scratch/`
//! 5. Stop services, take the Safety Snapshot
//! 6. Replace app-state and documents (paths re-validated right before each
//!    clear), merge configuration, put preserved files back so local copies
//!    win, load images, apply ownership
//! 7. Start services and verify each one with bounded retries
//! 8. Commit (snapshot deleted) or roll back (snapshot restored)

use chrono::Utc;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::application::blocking;
use crate::application::catalog::ArtifactCatalog;
use crate::application::rollback_coordinator::{LiveTree, RollbackCoordinator, RollbackReport, SafetyGuard};
use crate::domain::artifact::{
    Artifact, ArtifactRef, StorageForm, APPDATA_DIR, CONFIG_DIR, DOCUMENTS_DIR, IMAGES_DIR,
    MANIFEST_FILE, SANITIZED_ENV_FILE,
};
use crate::domain::config::{OpsConfig, Secret};
use crate::domain::errors::{OpsError, OpsResult};
use crate::domain::health::LivenessProbe;
use crate::domain::notifier::{Notifier, Severity};
use crate::domain::path_guard::TargetPathGuard;
use crate::domain::retry::RetryPolicy;
use crate::domain::rollback::RollbackState;
use crate::domain::service::{ManagedService, ServiceController, ServiceState};
use crate::infrastructure::checksum::{self, IntegrityStatus};
use crate::infrastructure::layout::BackupLayout;
use crate::infrastructure::reports::{ReportWriter, TextReport};
use crate::infrastructure::{archive, crypto, env_file, fs_tree};

/// What a restore will touch, computed without side effects.
#[derive(Debug, Clone, Serialize)]
pub struct RestorePlan {
    pub artifact_name: String,
    pub form: StorageForm,
    pub artifact_path: PathBuf,
    /// Resolved live directories that will be cleared and replaced
    pub targets: Vec<(String, PathBuf)>,
    pub env_file: PathBuf,
    pub preserved: Vec<PathBuf>,
    pub safety_dir: PathBuf,
    pub needs_passphrase: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreSummary {
    pub artifact_name: String,
    pub form: StorageForm,
    pub integrity: String,
    pub images_loaded: Vec<String>,
    pub verification_attempts: u32,
    pub duration_secs: f64,
    pub report: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RestoreOutcome {
    Restored(RestoreSummary),
    RolledBack {
        summary: RestoreSummary,
        rollback: RollbackReport,
    },
}

impl RestoreOutcome {
    pub fn is_restored(&self) -> bool {
        matches!(self, Self::Restored(_))
    }

    pub fn summary(&self) -> &RestoreSummary {
        match self {
            Self::Restored(summary) | Self::RolledBack { summary, .. } => summary,
        }
    }
}

/// Content prepared for the destructive phase.
struct Staged {
    root: PathBuf,
    /// Scratch directory to delete afterwards (archives only)
    scratch: Option<PathBuf>,
}

pub struct RestoreEngine {
    config: Arc<OpsConfig>,
    controller: Arc<dyn ServiceController>,
    probe: Arc<dyn LivenessProbe>,
    notifier: Arc<dyn Notifier>,
    catalog: ArtifactCatalog,
    coordinator: RollbackCoordinator,
    guard: TargetPathGuard,
    reports: ReportWriter,
    verify_policy: RetryPolicy,
}

impl RestoreEngine {
    pub fn new(
        config: Arc<OpsConfig>,
        controller: Arc<dyn ServiceController>,
        probe: Arc<dyn LivenessProbe>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let layout = BackupLayout::new(config.paths.backups.clone());
        let guard = TargetPathGuard::new(config.restore.allowed_bases.clone());
        let coordinator = RollbackCoordinator::new(
            layout.clone(),
            controller.clone(),
            guard.clone(),
            config.ownership,
        );
        let verify_policy = RetryPolicy::fixed(
            config.restore.verify_attempts,
            Duration::from_secs(config.restore.verify_interval_secs),
        );
        Self {
            reports: ReportWriter::new(config.paths.logs.clone()),
            catalog: ArtifactCatalog::new(layout),
            config,
            controller,
            probe,
            notifier,
            coordinator,
            guard,
            verify_policy,
        }
    }

    /// Replace the verification retry policy.
    pub fn with_verify_policy(mut self, policy: RetryPolicy) -> Self {
        self.verify_policy = policy;
        self
    }

    pub fn catalog(&self) -> &ArtifactCatalog {
        &self.catalog
    }

    fn live_trees(&self) -> [(&'static str, &Path); 2] {
        [
            (APPDATA_DIR, self.config.paths.appdata.as_path()),
            (DOCUMENTS_DIR, self.config.paths.documents.as_path()),
        ]
    }

    /// Resolve the artifact and validate targets without touching anything.
    pub fn plan(&self, target: &ArtifactRef) -> OpsResult<RestorePlan> {
        self.coordinator.ensure_no_pending()?;
        let artifact = self.catalog.resolve(target)?;
        let mut targets = Vec::new();
        for (label, path) in self.live_trees() {
            targets.push((label.to_string(), self.guard.validate(path)?));
        }
        Ok(RestorePlan {
            artifact_name: artifact.name.to_string(),
            form: artifact.form,
            artifact_path: artifact.path.clone(),
            targets,
            env_file: self.config.paths.env_file.clone(),
            preserved: self.config.restore.preserved_files.clone(),
            safety_dir: self.catalog.layout().safety_dir(),
            needs_passphrase: artifact.form == StorageForm::Encrypted
                && self.config.backup.passphrase.as_ref().map_or(true, |p| p.is_empty()),
        })
    }

    pub async fn restore(
        &self,
        target: &ArtifactRef,
        passphrase: Option<Secret>,
        cancel: &CancellationToken,
    ) -> OpsResult<RestoreOutcome> {
        let started = Instant::now();
        info!(%target, "Starting restore");

        let result = self.run(target, passphrase, cancel, started).await;
        match &result {
            Ok(RestoreOutcome::Restored(summary)) => {
                self.notifier
                    .notify(
                        Severity::Success,
                        "Archon restore completed",
                        &format!("Restored {} in {:.1}s", summary.artifact_name, summary.duration_secs),
                    )
                    .await;
            }
            Ok(RestoreOutcome::RolledBack { summary, rollback }) => {
                self.notifier
                    .notify(
                        Severity::Warning,
                        "Archon restore rolled back",
                        &format!(
                            "Restore of {} failed and was rolled back: {}",
                            summary.artifact_name,
                            rollback.cause.as_deref().unwrap_or("unknown cause")
                        ),
                    )
                    .await;
            }
            Err(e) => {
                error!(error = %e, "Restore failed");
                let mut report = TextReport::new("Archon Restore Report");
                report
                    .field("Status", "FAILED")
                    .field("Target", target)
                    .field("Error", e)
                    .field(
                        "Live data",
                        if e.is_pre_destructive_guard() { "untouched" } else { "see error" },
                    );
                if let Err(write_err) = self.reports.write_text("restore", &report) {
                    warn!(error = %write_err, "Failed to write restore report");
                }
                self.notifier
                    .notify(Severity::Error, "Archon restore failed", &e.to_string())
                    .await;
            }
        }
        result
    }

    async fn run(
        &self,
        target: &ArtifactRef,
        passphrase: Option<Secret>,
        cancel: &CancellationToken,
        started: Instant,
    ) -> OpsResult<RestoreOutcome> {
        self.coordinator.ensure_no_pending()?;

        let artifact = self.catalog.resolve(target)?;
        info!(name = %artifact.name, form = %artifact.form, path = %artifact.path.display(), "Resolved artifact");

        let to_verify = artifact.clone();
        let integrity = match tokio::task::spawn_blocking(move || checksum::verify(&to_verify)).await {
            Ok(result) => result?,
            Err(join) => return Err(OpsError::Archive(format!("verification task failed: {}", join))),
        };
        let integrity = match integrity {
            IntegrityStatus::Verified(digest) => digest,
            IntegrityStatus::Unrecorded => "not recorded".to_string(),
        };

        for (_, path) in self.live_trees() {
            self.guard.validate(path)?;
        }

        if cancel.is_cancelled() {
            return Err(OpsError::Cancelled);
        }
        let staged = self.stage(&artifact, passphrase).await?;
        let result = self.apply_staged(&artifact, &staged, integrity, cancel, started).await;

        if let Some(scratch) = &staged.scratch {
            let scratch = scratch.clone();
            if let Err(e) = blocking(&scratch.clone(), move || fs_tree::remove_path(&scratch)).await {
                warn!(error = %e, "Failed to clean scratch area");
            }
        }
        result
    }

    /// Make the artifact's content available as a directory tree.
    async fn stage(&self, artifact: &Artifact, passphrase: Option<Secret>) -> OpsResult<Staged> {
        if artifact.form == StorageForm::Snapshot {
            return Ok(Staged {
                root: artifact.path.clone(),
                scratch: None,
            });
        }

        let layout = self.catalog.layout();
        let scratch_root = layout.scratch_dir();
        fs::create_dir_all(&scratch_root).map_err(|e| OpsError::io(&scratch_root, e))?;
        if fs_tree::is_ram_backed(&scratch_root).map_err(|e| OpsError::io(&scratch_root, e))? {
            return Err(OpsError::UnsafeTargetPath {
                path: scratch_root,
                reason: "scratch area is on a RAM-backed filesystem".to_string(),
            });
        }
        let scratch = scratch_root.join(format!("{}-{}", artifact.name, std::process::id()));
        fs_tree::remove_path(&scratch).map_err(|e| OpsError::io(&scratch, e))?;
        fs::create_dir_all(&scratch).map_err(|e| OpsError::io(&scratch, e))?;

        let result = self.extract(artifact, &scratch, passphrase).await;
        match result {
            Ok(root) => Ok(Staged {
                root,
                scratch: Some(scratch),
            }),
            Err(e) => {
                let _ = fs_tree::remove_path(&scratch);
                Err(e)
            }
        }
    }

    async fn extract(&self, artifact: &Artifact, scratch: &Path, passphrase: Option<Secret>) -> OpsResult<PathBuf> {
        let archive_path = if artifact.form == StorageForm::Encrypted {
            let secret = passphrase
                .or_else(|| self.config.backup.passphrase.clone())
                .filter(|p| !p.is_empty())
                .ok_or_else(|| OpsError::DecryptionFailed("no passphrase available for encrypted archive".to_string()))?;
            let plain = scratch.join(format!("{}.tar", artifact.name));
            let (src, dest) = (artifact.path.clone(), plain.clone());
            info!(artifact = %artifact.path.display(), "Decrypting archive");
            let result = tokio::task::spawn_blocking(move || crypto::decrypt_file(&src, &dest, secret.expose())).await;
            match result {
                Ok(Ok(())) => plain,
                Ok(Err(e)) => return Err(OpsError::DecryptionFailed(e.to_string())),
                Err(join) => return Err(OpsError::Archive(format!("decryption task failed: {}", join))),
            }
        } else {
            artifact.path.clone()
        };

        let extract_dir = scratch.join("extract");
        let (src, dest) = (archive_path.clone(), extract_dir.clone());
        info!(archive = %archive_path.display(), "Extracting archive");
        let root = blocking(&archive_path, move || archive::unpack(&src, &dest))
            .await
            .map_err(|e| OpsError::Archive(format!("extraction failed: {}", e)))?;

        if !root.join(APPDATA_DIR).is_dir() && !root.join(MANIFEST_FILE).is_file() {
            return Err(OpsError::Archive(format!(
                "{} does not contain a backup snapshot",
                artifact.path.display()
            )));
        }
        Ok(root)
    }

    async fn apply_staged(
        &self,
        artifact: &Artifact,
        staged: &Staged,
        integrity: String,
        cancel: &CancellationToken,
        started: Instant,
    ) -> OpsResult<RestoreOutcome> {
        if let Err(e) = self.controller.stop_all().await {
            if let Err(restart) = self.controller.start_all().await {
                error!(error = %restart, "Failed to restart services after stop failure");
            }
            return Err(e.into());
        }

        let trees: Vec<LiveTree> = self
            .live_trees()
            .iter()
            .map(|(label, path)| LiveTree {
                label: label.to_string(),
                path: path.to_path_buf(),
            })
            .collect();

        let mut guard = match self
            .coordinator
            .capture(
                &artifact.name,
                &trees,
                &self.config.paths.env_file,
                &self.config.restore.preserved_files,
                &self.config.paths.appdata,
            )
            .await
        {
            Ok(guard) => guard,
            Err(e) => {
                if let Err(restart) = self.controller.start_all().await {
                    error!(error = %restart, "Failed to restart services after snapshot failure");
                }
                return Err(e);
            }
        };

        let mut summary = RestoreSummary {
            artifact_name: artifact.name.to_string(),
            form: artifact.form,
            integrity,
            images_loaded: Vec::new(),
            verification_attempts: 0,
            duration_secs: 0.0,
            report: None,
        };

        let outcome = self
            .destructive_steps(&mut guard, &staged.root, &mut summary, cancel)
            .await;
        summary.duration_secs = started.elapsed().as_secs_f64();

        match outcome {
            Ok(()) => {
                let state = guard.commit().await;
                debug_assert_eq!(state, RollbackState::Verified);
                summary.report = self.write_report(&summary, None);
                info!(name = %summary.artifact_name, "Restore completed and verified");
                Ok(RestoreOutcome::Restored(summary))
            }
            Err(cause) => {
                warn!(error = %cause, "Restore failed after destructive step, rolling back");
                let rollback = guard.roll_back(&cause).await?;
                summary.report = self.write_report(&summary, Some(&rollback));
                Ok(RestoreOutcome::RolledBack { summary, rollback })
            }
        }
    }

    async fn destructive_steps(
        &self,
        guard: &mut SafetyGuard<'_>,
        staged: &Path,
        summary: &mut RestoreSummary,
        cancel: &CancellationToken,
    ) -> OpsResult<()> {
        let checkpoint = || {
            if cancel.is_cancelled() {
                Err(OpsError::Cancelled)
            } else {
                Ok(())
            }
        };

        guard.begin_destructive();

        for (label, live) in self.live_trees() {
            checkpoint()?;
            let resolved = self.guard.validate(live)?;
            let source = staged.join(label);
            info!(tree = label, target = %resolved.display(), "Replacing live tree");
            blocking(&resolved.clone(), move || {
                fs_tree::clear_dir(&resolved)?;
                if source.is_dir() {
                    fs_tree::copy_tree(&source, &resolved)?;
                }
                Ok(())
            })
            .await?;
        }

        checkpoint()?;
        self.merge_config(guard, staged).await?;
        self.restore_preserved(guard).await?;

        checkpoint()?;
        summary.images_loaded = self.load_images(staged).await;

        let (uid, gid) = (self.config.ownership.uid, self.config.ownership.gid);
        for (_, live) in self.live_trees() {
            let live = live.to_path_buf();
            match blocking(&live.clone(), move || fs_tree::chown_tree(&live, uid, gid)).await {
                Ok(count) => debug!(count, uid, gid, "Ownership applied"),
                Err(e) => warn!(error = %e, "Could not apply ownership, continuing"),
            }
        }

        checkpoint()?;
        self.controller.start_all().await.map_err(|e| OpsError::ServiceStartFailed {
            service: self.config.compose.project.clone(),
            reason: e.to_string(),
        })?;

        tokio::select! {
            _ = cancel.cancelled() => Err(OpsError::Cancelled),
            attempts = self.verify_services() => {
                summary.verification_attempts = attempts?;
                Ok(())
            }
        }
    }

    /// Copy preserved paths from the safety snapshot over the fresh app-state tree.
    async fn restore_preserved(&self, guard: &SafetyGuard<'_>) -> OpsResult<()> {
        let Some(captured) = guard.captured(APPDATA_DIR) else {
            return Ok(());
        };
        let live = self.config.paths.appdata.clone();
        for rel in guard.preserved() {
            let (src, dest) = (captured.join(rel), live.join(rel));
            let label = rel.display().to_string();
            blocking(&dest.clone(), move || {
                fs_tree::remove_path(&dest)?;
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)?;
                }
                if fs::symlink_metadata(&src)?.is_dir() {
                    fs_tree::copy_tree(&src, &dest).map(|_| ())
                } else {
                    fs::copy(&src, &dest).map(|_| ())
                }
            })
            .await?;
            debug!(path = %label, "Preserved file kept");
        }
        Ok(())
    }

    /// Restored sanitized configuration plus local credential lines.
    async fn merge_config(&self, guard: &SafetyGuard<'_>, staged: &Path) -> OpsResult<()> {
        let incoming_path = staged.join(CONFIG_DIR).join(SANITIZED_ENV_FILE);
        let local_path = guard.captured_env().map(Path::to_path_buf);
        let env_path = self.config.paths.env_file.clone();

        let target = env_path.clone();
        let merged = blocking(&incoming_path.clone(), move || {
            let incoming = match fs::read_to_string(&incoming_path) {
                Ok(content) => content,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
                Err(e) => return Err(e),
            };
            let local = match &local_path {
                Some(path) => fs::read_to_string(path)?,
                None => String::new(),
            };
            fs_tree::write_atomic(&target, env_file::merge(&incoming, &local).as_bytes())?;
            Ok(true)
        })
        .await?;

        if merged {
            info!(path = %env_path.display(), "Configuration merged");
        } else {
            info!("Backup carries no configuration, keeping local environment file");
        }
        Ok(())
    }

    async fn load_images(&self, staged: &Path) -> Vec<String> {
        let dir = staged.join(IMAGES_DIR);
        let Ok(entries) = fs::read_dir(&dir) else {
            return Vec::new();
        };
        let mut archives: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "tar"))
            .collect();
        archives.sort();

        let mut loaded = Vec::new();
        for archive in archives {
            match self.controller.load_image(&archive).await {
                Ok(()) => loaded.push(
                    archive
                        .file_stem()
                        .map(|s| s.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                ),
                Err(e) => warn!(archive = %archive.display(), error = %e, "Image load failed, continuing"),
            }
        }
        loaded
    }

    async fn service_ready(&self, service: &ManagedService) -> Result<(), String> {
        let container = self
            .controller
            .container_state(service)
            .await
            .map_err(|e| e.to_string())?;
        if !container.is_running() {
            return Err(format!("container {:?}", container));
        }
        let probe = self.probe.probe(service).await;
        match ServiceState::observe(container, probe.ok) {
            ServiceState::RunningHealthy => Ok(()),
            _ => Err(probe.error.unwrap_or_else(|| "liveness probe failed".to_string())),
        }
    }

    /// Wait for every service to become healthy. Returns the attempts used.
    async fn verify_services(&self) -> OpsResult<u32> {
        let mut max_attempts = 0;
        for service in &self.config.services {
            let outcome = self
                .verify_policy
                .run(|_| self.service_ready(service), |ready| ready.is_ok())
                .await;
            max_attempts = max_attempts.max(outcome.attempts);
            if let Err(reason) = outcome.value {
                return Err(OpsError::ServiceVerificationFailed(format!(
                    "{} not healthy after {} attempt(s): {}",
                    service.name, outcome.attempts, reason
                )));
            }
            info!(service = %service.name, attempts = outcome.attempts, "Service verified");
        }
        Ok(max_attempts)
    }

    /// `restore --rollback`: replay the rollback of an interrupted restore.
    pub async fn rollback_interrupted(&self) -> OpsResult<RollbackReport> {
        match self.coordinator.recover_interrupted().await {
            Ok(report) => {
                self.notifier
                    .notify(
                        Severity::Warning,
                        "Archon interrupted restore rolled back",
                        &format!("Pre-restore state from {} reinstated", report.snapshot_dir.display()),
                    )
                    .await;
                let mut text = TextReport::new("Archon Restore Report");
                text.field("Status", "ROLLED BACK (operator request)")
                    .field("Safety snapshot", report.snapshot_dir.display())
                    .field("Trees restored", report.restored_trees.join(", "))
                    .field("Environment file", if report.env_restored { "restored" } else { "not captured" });
                if let Err(e) = self.reports.write_text("restore", &text) {
                    warn!(error = %e, "Failed to write restore report");
                }
                Ok(report)
            }
            Err(e) => {
                self.notifier
                    .notify(Severity::Error, "Archon rollback failed", &e.to_string())
                    .await;
                Err(e)
            }
        }
    }

    fn write_report(&self, summary: &RestoreSummary, rollback: Option<&RollbackReport>) -> Option<PathBuf> {
        let mut report = TextReport::new("Archon Restore Report");
        report
            .field("Status", if rollback.is_some() { "ROLLED BACK" } else { "SUCCESS" })
            .field("Artifact", &summary.artifact_name)
            .field("Storage form", summary.form)
            .field("Integrity", &summary.integrity)
            .field("Duration", format!("{:.1}s", summary.duration_secs))
            .field("Restored at", Utc::now().to_rfc3339())
            .section("Targets")
            .field("App data", self.config.paths.appdata.display())
            .field("Documents", self.config.paths.documents.display())
            .field("Environment", self.config.paths.env_file.display())
            .field(
                "Images loaded",
                if summary.images_loaded.is_empty() { "-".to_string() } else { summary.images_loaded.join(", ") },
            )
            .field("Verify attempts", summary.verification_attempts);
        if let Some(rollback) = rollback {
            report
                .section("Rollback")
                .field("Cause", rollback.cause.as_deref().unwrap_or("-"))
                .field("Safety snapshot", rollback.snapshot_dir.display())
                .field("Trees restored", rollback.restored_trees.join(", "));
        }
        match self.reports.write_text("restore", &report) {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(error = %e, "Failed to write restore report");
                None
            }
        }
    }
}
