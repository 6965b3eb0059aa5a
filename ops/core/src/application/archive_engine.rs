// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Archive Engine
//!
//! Creates backup artifacts in full or incremental mode.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Implements `backup {full|incremental}`
//!
//! # Run Order
//!
//! 1. Resolve the incremental base from the Latest Pointer (dangling pointer is cleared)
//! 2. Check free space on the backup root against the estimate plus margin
//! 3. Full mode: stop services; they are started again whatever the outcome
//! 4. Copy app-state and documents (hard-linking unchanged files against the base),
//!    write the sanitized env file, export images, write the manifest
//! 5. Seal the snapshot with a tree digest, then update the Latest Pointer
//! 6. Compress and/or encrypt, seal the final archive
//! 7. Apply retention, write the report, notify
//!
//! A failure in steps 3–5 discards the partial snapshot and leaves the Latest
//! Pointer untouched.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::application::{blocking, ServicePause};
use crate::application::retention::{self, RetentionSummary};
use crate::domain::artifact::{
    Artifact, ArtifactName, BackupManifest, BackupMode, APPDATA_DIR, CONFIG_DIR, DOCUMENTS_DIR,
    IMAGES_DIR, MANIFEST_FILE, SANITIZED_ENV_FILE,
};
use crate::domain::config::OpsConfig;
use crate::domain::errors::{OpsError, OpsResult};
use crate::domain::format_bytes;
use crate::domain::notifier::{Notifier, Severity};
use crate::domain::pointer::LatestPointer;
use crate::domain::service::ServiceController;
use crate::infrastructure::crypto::{self, KdfParams};
use crate::infrastructure::fs_tree::{self, CopyStats};
use crate::infrastructure::layout::BackupLayout;
use crate::infrastructure::reports::{ReportWriter, TextReport};
use crate::infrastructure::{archive, checksum, env_file};

#[derive(Debug, Clone)]
pub struct BackupOutcome {
    pub name: ArtifactName,
    pub mode: BackupMode,
    pub snapshot: PathBuf,
    /// The artifact in its final storage form
    pub artifact: Artifact,
    pub checksum: String,
    pub base: Option<ArtifactName>,
    pub stats: CopyStats,
    pub images: Vec<String>,
    pub retention: RetentionSummary,
    pub report: Option<PathBuf>,
    pub duration_secs: f64,
}

/// What the copy phase produced, before post-processing.
struct Captured {
    stats: CopyStats,
    images: Vec<String>,
    digest: String,
}

pub struct ArchiveEngine {
    config: Arc<OpsConfig>,
    controller: Arc<dyn ServiceController>,
    notifier: Arc<dyn Notifier>,
    layout: BackupLayout,
    reports: ReportWriter,
    kdf: KdfParams,
}

impl ArchiveEngine {
    pub fn new(
        config: Arc<OpsConfig>,
        controller: Arc<dyn ServiceController>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let layout = BackupLayout::new(config.paths.backups.clone());
        let reports = ReportWriter::new(config.paths.logs.clone());
        Self {
            config,
            controller,
            notifier,
            layout,
            reports,
            kdf: KdfParams::default(),
        }
    }

    /// Override the Argon2id cost used for new encrypted archives.
    pub fn with_kdf_params(mut self, kdf: KdfParams) -> Self {
        self.kdf = kdf;
        self
    }

    pub fn layout(&self) -> &BackupLayout {
        &self.layout
    }

    pub async fn create_backup(&self, mode: BackupMode, cancel: &CancellationToken) -> OpsResult<BackupOutcome> {
        let started = Instant::now();
        info!(%mode, root = %self.layout.root().display(), "Starting backup");

        match self.run(mode, cancel, started).await {
            Ok(outcome) => {
                let message = format!(
                    "{} backup {} completed: {} ({} copied, {} linked) in {:.1}s",
                    mode,
                    outcome.name,
                    format_bytes(outcome.stats.total_bytes()),
                    outcome.stats.copied_files,
                    outcome.stats.linked_files,
                    outcome.duration_secs
                );
                self.notifier.notify(Severity::Success, "Archon backup completed", &message).await;
                Ok(outcome)
            }
            Err(e) => {
                error!(%mode, error = %e, "Backup failed");
                let mut report = TextReport::new("Archon Backup Report");
                report
                    .field("Status", "FAILED")
                    .field("Mode", mode)
                    .field("Error", &e)
                    .field("Duration", format!("{:.1}s", started.elapsed().as_secs_f64()));
                if let Err(write_err) = self.reports.write_text("backup", &report) {
                    warn!(error = %write_err, "Failed to write backup report");
                }
                let severity = if matches!(e, OpsError::Cancelled) {
                    Severity::Warning
                } else {
                    Severity::Error
                };
                self.notifier
                    .notify(severity, "Archon backup failed", &format!("{} backup failed: {}", mode, e))
                    .await;
                Err(e)
            }
        }
    }

    async fn run(&self, mode: BackupMode, cancel: &CancellationToken, started: Instant) -> OpsResult<BackupOutcome> {
        let backup = &self.config.backup;
        let passphrase = if backup.encryption {
            match backup.passphrase.as_ref().filter(|p| !p.is_empty()) {
                Some(secret) => Some(secret.clone()),
                None => {
                    return Err(OpsError::Config(crate::domain::config::ConfigError::Invalid(
                        "BACKUP_ENCRYPTION is enabled but BACKUP_ENCRYPTION_KEY is not set".to_string(),
                    )))
                }
            }
        } else {
            None
        };

        let root = self.layout.root().to_path_buf();
        let layout = self.layout.clone();
        blocking(&root, move || layout.ensure()).await?;

        let base = match mode {
            BackupMode::Incremental => self.incremental_base()?,
            BackupMode::Full => None,
        };
        if mode == BackupMode::Incremental && base.is_none() {
            info!("No prior snapshot, incremental backup will copy everything");
        }

        self.check_space(mode, base.as_ref().map(|p| p.snapshot.clone())).await?;
        if cancel.is_cancelled() {
            return Err(OpsError::Cancelled);
        }

        let name = self.next_name(Utc::now());
        let snapshot = self.layout.snapshot(&name);
        info!(name = %name, snapshot = %snapshot.path.display(), "Creating snapshot");

        let capture = self.capture(&name, mode, &snapshot, base.as_ref(), cancel);
        let (captured, restarted) = if mode == BackupMode::Full {
            let paused = ServicePause::new(self.controller.as_ref()).run(capture).await?;
            (paused.work, paused.restart)
        } else {
            (capture.await, Ok(()))
        };

        let captured = match (captured, restarted) {
            (Ok(captured), Ok(())) => captured,
            (Err(e), restart) => {
                if let Err(restart_err) = restart {
                    error!(error = %restart_err, "Services failed to restart after aborted backup");
                }
                self.discard(&snapshot.path).await;
                return Err(e);
            }
            (Ok(_), Err(restart_err)) => {
                self.discard(&snapshot.path).await;
                return Err(OpsError::ServiceStartFailed {
                    service: self.config.compose.project.clone(),
                    reason: restart_err.to_string(),
                });
            }
        };

        // Snapshot is complete and sealed: publish it
        let completed_at = Utc::now();
        self.layout
            .latest()
            .store(&LatestPointer {
                name: name.clone(),
                snapshot: snapshot.path.clone(),
                completed_at,
            })
            .map_err(|e| OpsError::io(self.layout.latest().path(), e))?;
        info!(name = %name, "Latest pointer updated");

        let (artifact, digest) = self.post_process(&name, &snapshot, captured.digest.clone(), passphrase).await?;

        let layout = self.layout.clone();
        let retention_days = backup.retention_days;
        let keep = name.clone();
        let retention = blocking(&root, move || retention::apply(&layout, retention_days, completed_at, Some(&keep)))
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "Retention cleanup failed");
                RetentionSummary::default()
            });

        let mut outcome = BackupOutcome {
            name,
            mode,
            snapshot: snapshot.path.clone(),
            artifact,
            checksum: digest,
            base: base.map(|p| p.name),
            stats: captured.stats,
            images: captured.images,
            retention,
            report: None,
            duration_secs: started.elapsed().as_secs_f64(),
        };
        outcome.report = match self.reports.write_text("backup", &self.success_report(&outcome)) {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(error = %e, "Failed to write backup report");
                None
            }
        };
        info!(name = %outcome.name, artifact = %outcome.artifact.path.display(), "Backup completed");
        Ok(outcome)
    }

    /// Latest Pointer usable as the incremental base; a dangling pointer is cleared.
    fn incremental_base(&self) -> OpsResult<Option<LatestPointer>> {
        let store = self.layout.latest();
        match store.load() {
            Ok(Some(pointer)) if pointer.is_valid() => Ok(Some(pointer)),
            Ok(Some(pointer)) => {
                warn!(
                    snapshot = %pointer.snapshot.display(),
                    "Latest pointer references a missing snapshot, treating as no prior snapshot"
                );
                store.clear().map_err(|e| OpsError::io(store.path(), e))?;
                Ok(None)
            }
            Ok(None) => Ok(None),
            Err(e) => {
                warn!(error = %e, "Latest pointer unreadable, treating as no prior snapshot");
                store.clear().map_err(|e| OpsError::io(store.path(), e))?;
                Ok(None)
            }
        }
    }

    async fn check_space(&self, mode: BackupMode, base: Option<PathBuf>) -> OpsResult<()> {
        let appdata = self.config.paths.appdata.clone();
        let documents = self.config.paths.documents.clone();
        let root = self.layout.root().to_path_buf();
        let margin = self.config.backup.space_margin_percent;
        let compress = self.config.backup.compression || self.config.backup.encryption;

        let (required, available) = blocking(&root.clone(), move || {
            let base_app = base.as_ref().map(|b| b.join(APPDATA_DIR));
            let base_docs = base.as_ref().map(|b| b.join(DOCUMENTS_DIR));
            let mut estimate = fs_tree::estimate_unlinked_bytes(&appdata, base_app.as_deref())?
                + fs_tree::estimate_unlinked_bytes(&documents, base_docs.as_deref())?;
            if compress {
                // Archive pass needs room for a full-size copy of the snapshot
                estimate += fs_tree::tree_size(&appdata)?.bytes + fs_tree::tree_size(&documents)?.bytes;
            }
            let required = estimate + estimate * margin / 100;
            let available = fs_tree::free_space(&root)?.free;
            Ok((required, available))
        })
        .await?;

        debug!(%mode, required, available, "Free space check");
        if available < required {
            return Err(OpsError::InsufficientStorage {
                path: self.layout.root().to_path_buf(),
                required,
                available,
            });
        }
        Ok(())
    }

    /// Artifact names are second-resolution; step forward past existing ones.
    fn next_name(&self, now: DateTime<Utc>) -> ArtifactName {
        let mut ts = now;
        loop {
            let name = ArtifactName::from_timestamp(ts);
            let taken = self.layout.snapshot(&name).path.exists()
                || self.layout.compressed(&name).path.exists()
                || self.layout.encrypted(&name, true).path.exists()
                || self.layout.encrypted(&name, false).path.exists();
            if !taken {
                return name;
            }
            ts += ChronoDuration::seconds(1);
        }
    }

    async fn capture(
        &self,
        name: &ArtifactName,
        mode: BackupMode,
        snapshot: &Artifact,
        base: Option<&LatestPointer>,
        cancel: &CancellationToken,
    ) -> OpsResult<Captured> {
        let dir = snapshot.path.clone();
        let base_dir = base.map(|p| p.snapshot.clone());
        let mut stats = CopyStats::default();

        let trees = [
            (APPDATA_DIR, self.config.paths.appdata.clone()),
            (DOCUMENTS_DIR, self.config.paths.documents.clone()),
        ];
        for (label, source) in trees {
            if cancel.is_cancelled() {
                return Err(OpsError::Cancelled);
            }
            if !source.is_dir() {
                warn!(tree = label, path = %source.display(), "Source directory missing, recording empty tree");
            }
            let dest = dir.join(label);
            let link_base = base_dir.as_ref().map(|b| b.join(label));
            let copied = blocking(&source.clone(), move || fs_tree::link_tree(&source, &dest, link_base.as_deref())).await?;
            debug!(tree = label, ?copied, "Tree captured");
            stats.merge(copied);
        }

        if cancel.is_cancelled() {
            return Err(OpsError::Cancelled);
        }
        let env_path = self.config.paths.env_file.clone();
        let config_dir = dir.join(CONFIG_DIR);
        blocking(&env_path.clone(), move || {
            fs::create_dir_all(&config_dir)?;
            match fs::read_to_string(&env_path) {
                Ok(content) => fs::write(config_dir.join(SANITIZED_ENV_FILE), env_file::sanitize(&content)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    warn!(path = %env_path.display(), "Environment file missing, no configuration captured");
                    Ok(())
                }
                Err(e) => Err(e),
            }
        })
        .await?;

        let mut images = Vec::new();
        if mode == BackupMode::Full && self.config.backup.include_images {
            let images_dir = dir.join(IMAGES_DIR);
            fs::create_dir_all(&images_dir).map_err(|e| OpsError::io(&images_dir, e))?;
            for service in &self.config.services {
                if cancel.is_cancelled() {
                    return Err(OpsError::Cancelled);
                }
                let dest = images_dir.join(format!("{}.tar", service.name));
                match self.controller.export_image(service, &dest).await {
                    Ok(()) => images.push(service.name.clone()),
                    Err(e) => {
                        let _ = fs::remove_file(&dest);
                        warn!(service = %service.name, error = %e, "Image export failed, continuing without it");
                    }
                }
            }
        }

        let manifest = BackupManifest {
            name: name.clone(),
            mode,
            created_at: Utc::now(),
            host: hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unknown".to_string()),
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            appdata_source: self.config.paths.appdata.clone(),
            documents_source: self.config.paths.documents.clone(),
            base_snapshot: base.map(|p| p.name.clone()),
            images: images.clone(),
            copied_files: stats.copied_files,
            linked_files: stats.linked_files,
            total_bytes: stats.total_bytes(),
        };
        let manifest_path = dir.join(MANIFEST_FILE);
        let body = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| OpsError::Archive(format!("failed to encode manifest: {}", e)))?;
        fs::write(&manifest_path, body).map_err(|e| OpsError::io(&manifest_path, e))?;

        let sealed = snapshot.clone();
        let digest = match tokio::task::spawn_blocking(move || checksum::seal(&sealed)).await {
            Ok(result) => result?,
            Err(join) => return Err(OpsError::Archive(format!("checksum task failed: {}", join))),
        };

        Ok(Captured { stats, images, digest })
    }

    async fn post_process(
        &self,
        name: &ArtifactName,
        snapshot: &Artifact,
        snapshot_digest: String,
        passphrase: Option<crate::domain::config::Secret>,
    ) -> OpsResult<(Artifact, String)> {
        let compress = self.config.backup.compression;
        let final_artifact = match passphrase {
            Some(secret) => {
                let plain = self
                    .layout
                    .scratch_dir()
                    .join(format!("{}.tar{}", name, if compress { ".gz" } else { "" }));
                let target = self.layout.encrypted(name, compress);
                let (src, root_name, dest, kdf) = (snapshot.path.clone(), name.to_string(), target.path.clone(), self.kdf);
                info!(artifact = %target.path.display(), "Encrypting archive");
                let result = tokio::task::spawn_blocking(move || {
                    archive::pack(&src, &plain, &root_name, compress)
                        .map_err(|e| OpsError::io(&plain, e))?;
                    let encrypted = crypto::encrypt_file(&plain, &dest, secret.expose(), kdf)
                        .map_err(|e| OpsError::Archive(format!("encryption failed: {}", e)));
                    let _ = fs::remove_file(&plain);
                    encrypted
                })
                .await;
                match result {
                    Ok(Ok(bytes)) => debug!(bytes, "Encrypted archive written"),
                    Ok(Err(e)) => return Err(e),
                    Err(join) => return Err(OpsError::Archive(format!("encryption task failed: {}", join))),
                }
                target
            }
            None if compress => {
                let target = self.layout.compressed(name);
                let (src, root_name, dest) = (snapshot.path.clone(), name.to_string(), target.path.clone());
                info!(artifact = %target.path.display(), "Compressing snapshot");
                blocking(&dest.clone(), move || archive::pack(&src, &dest, &root_name, true)).await?;
                target
            }
            None => return Ok((snapshot.clone(), snapshot_digest)),
        };

        let sealed = final_artifact.clone();
        let digest = match tokio::task::spawn_blocking(move || checksum::seal(&sealed)).await {
            Ok(result) => result?,
            Err(join) => return Err(OpsError::Archive(format!("checksum task failed: {}", join))),
        };
        Ok((final_artifact, digest))
    }

    async fn discard(&self, path: &Path) {
        let target = path.to_path_buf();
        let mut sidecar = target.clone().into_os_string();
        sidecar.push(".sha256");
        let sidecar = PathBuf::from(sidecar);
        let result = blocking(&target.clone(), move || {
            fs_tree::remove_path(&target)?;
            fs_tree::remove_path(&sidecar)
        })
        .await;
        match result {
            Ok(()) => info!(path = %path.display(), "Discarded partial snapshot"),
            Err(e) => error!(path = %path.display(), error = %e, "Failed to discard partial snapshot"),
        }
    }

    fn success_report(&self, outcome: &BackupOutcome) -> TextReport {
        let mut report = TextReport::new("Archon Backup Report");
        report
            .field("Status", "SUCCESS")
            .field("Mode", outcome.mode)
            .field("Name", &outcome.name)
            .field("Duration", format!("{:.1}s", outcome.duration_secs))
            .section("Sources")
            .field("App data", self.config.paths.appdata.display())
            .field("Documents", self.config.paths.documents.display())
            .field("Environment", self.config.paths.env_file.display())
            .section("Artifact")
            .field("Snapshot", outcome.snapshot.display())
            .field("Final form", outcome.artifact.form)
            .field("Path", outcome.artifact.path.display())
            .field("SHA-256", &outcome.checksum)
            .field(
                "Incremental base",
                outcome.base.as_ref().map(|b| b.to_string()).unwrap_or_else(|| "-".to_string()),
            )
            .section("Contents")
            .field("Files copied", outcome.stats.copied_files)
            .field("Files linked", outcome.stats.linked_files)
            .field("Bytes copied", format_bytes(outcome.stats.copied_bytes))
            .field("Total size", format_bytes(outcome.stats.total_bytes()))
            .field(
                "Images",
                if outcome.images.is_empty() { "-".to_string() } else { outcome.images.join(", ") },
            )
            .section("Retention")
            .field("Retention window", format!("{} days", self.config.backup.retention_days))
            .field("Artifacts removed", outcome.retention.removed.len())
            .field("Space freed", format_bytes(outcome.retention.freed_bytes));
        report
    }
}
