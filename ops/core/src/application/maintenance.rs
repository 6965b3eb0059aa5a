// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Maintenance Service
//!
//! Routine upkeep tasks composed from the health monitor, retention and the
//! service controller.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Implements `maintenance {full|quick|health|cleanup|update|security}`
//!
//! A failing step is recorded and the remaining steps still run; the outcome
//! carries every error so the caller can exit non-zero.

use chrono::Utc;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::application::blocking;
use crate::application::health_monitor::HealthMonitor;
use crate::application::retention::{self, RetentionSummary};
use crate::domain::config::{is_sensitive_key, read_env_file, OpsConfig};
use crate::domain::errors::{OpsError, OpsResult};
use crate::domain::health::{CheckMode, HealthReport, LivenessProbe};
use crate::domain::notifier::{Notifier, Severity};
use crate::domain::retry::RetryPolicy;
use crate::domain::service::ServiceController;
use crate::infrastructure::fs_tree;
use crate::infrastructure::layout::BackupLayout;
use crate::infrastructure::reports::{prune_older_than, ReportWriter, TextReport};

/// Values commonly left in templates instead of a real credential.
const PLACEHOLDER_MARKERS: &[&str] = &["changeme", "change_me", "your_", "your-", "xxx", "replace", "example", "<"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MaintenanceTask {
    Full,
    Quick,
    Health,
    Cleanup,
    Update,
    Security,
}

impl FromStr for MaintenanceTask {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "quick" => Ok(Self::Quick),
            "health" => Ok(Self::Health),
            "cleanup" => Ok(Self::Cleanup),
            "update" => Ok(Self::Update),
            "security" => Ok(Self::Security),
            other => Err(format!(
                "Unknown maintenance task '{}'. Supported: full, quick, health, cleanup, update, security",
                other
            )),
        }
    }
}

impl fmt::Display for MaintenanceTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Full => "full",
            Self::Quick => "quick",
            Self::Health => "health",
            Self::Cleanup => "cleanup",
            Self::Update => "update",
            Self::Security => "security",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SecurityFinding {
    pub severity: Severity,
    pub message: String,
}

impl SecurityFinding {
    fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupSummary {
    pub retention: RetentionSummary,
    pub pruned_files: Vec<PathBuf>,
    pub scratch_cleared: bool,
    pub image_bytes_reclaimed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateSummary {
    /// False when auto-update is off and the run was not forced
    pub applied: bool,
    pub pull_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub healthy_after: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MaintenanceOutcome {
    pub task: MaintenanceTask,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleanup: Option<CleanupSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update: Option<UpdateSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security: Option<Vec<SecurityFinding>>,
    pub errors: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<PathBuf>,
    pub duration_secs: f64,
}

impl MaintenanceOutcome {
    fn new(task: MaintenanceTask) -> Self {
        Self {
            task,
            health: None,
            cleanup: None,
            update: None,
            security: None,
            errors: Vec::new(),
            report: None,
            duration_secs: 0.0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
            && self.health.as_ref().is_none_or(|h| h.is_healthy())
            && self.update.as_ref().and_then(|u| u.healthy_after).unwrap_or(true)
            && self
                .security
                .iter()
                .flatten()
                .all(|f| f.severity < Severity::Error)
    }
}

pub struct MaintenanceService {
    config: Arc<OpsConfig>,
    controller: Arc<dyn ServiceController>,
    notifier: Arc<dyn Notifier>,
    health: HealthMonitor,
    layout: BackupLayout,
    reports: ReportWriter,
    pull_policy: RetryPolicy,
}

impl MaintenanceService {
    pub fn new(
        config: Arc<OpsConfig>,
        controller: Arc<dyn ServiceController>,
        probe: Arc<dyn LivenessProbe>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let health = HealthMonitor::new(config.clone(), controller.clone(), probe, notifier.clone());
        Self {
            layout: BackupLayout::new(config.paths.backups.clone()),
            reports: ReportWriter::new(config.paths.logs.clone()),
            pull_policy: RetryPolicy::exponential(3, Duration::from_secs(5), Duration::from_secs(60)),
            config,
            controller,
            notifier,
            health,
        }
    }

    pub fn with_health_monitor(mut self, health: HealthMonitor) -> Self {
        self.health = health;
        self
    }

    pub fn with_pull_policy(mut self, policy: RetryPolicy) -> Self {
        self.pull_policy = policy;
        self
    }

    /// Run a maintenance task. `force` applies updates even when auto-update is off.
    pub async fn run(&self, task: MaintenanceTask, force: bool) -> OpsResult<MaintenanceOutcome> {
        let started = Instant::now();
        let mut outcome = MaintenanceOutcome::new(task);
        info!(%task, force, "Starting maintenance");

        let health_mode = match task {
            MaintenanceTask::Quick => Some(CheckMode::Quick),
            MaintenanceTask::Full | MaintenanceTask::Health => Some(CheckMode::Comprehensive),
            _ => None,
        };
        if let Some(mode) = health_mode {
            match self.health.check(mode).await {
                Ok((report, _)) => outcome.health = Some(report),
                Err(e) => outcome.errors.push(format!("health: {}", e)),
            }
        }

        if matches!(task, MaintenanceTask::Full | MaintenanceTask::Quick | MaintenanceTask::Cleanup) {
            match self.cleanup().await {
                Ok(summary) => outcome.cleanup = Some(summary),
                Err(e) => outcome.errors.push(format!("cleanup: {}", e)),
            }
        }

        if matches!(task, MaintenanceTask::Full | MaintenanceTask::Update) {
            match self.update(force).await {
                Ok(summary) => outcome.update = Some(summary),
                Err(e) => outcome.errors.push(format!("update: {}", e)),
            }
        }

        if matches!(task, MaintenanceTask::Full | MaintenanceTask::Security) {
            outcome.security = Some(self.security_audit().await);
        }

        outcome.duration_secs = started.elapsed().as_secs_f64();
        outcome.report = self.write_report(&outcome);

        let (severity, subject) = if outcome.is_success() {
            (Severity::Success, "Archon maintenance completed")
        } else {
            (Severity::Warning, "Archon maintenance completed with issues")
        };
        let mut message = format!("Task '{}' finished in {:.1}s", task, outcome.duration_secs);
        for error in &outcome.errors {
            message.push_str(&format!("\n{}", error));
        }
        self.notifier.notify(severity, subject, &message).await;
        Ok(outcome)
    }

    /// Retention, old reports and logs, scratch leftovers, dangling images.
    pub async fn cleanup(&self) -> OpsResult<CleanupSummary> {
        let layout = self.layout.clone();
        let retention_days = self.config.backup.retention_days;
        let retention = blocking(self.layout.root(), move || {
            retention::apply(&layout, retention_days, Utc::now(), None)
        })
        .await?;

        let logs = self.config.paths.logs.clone();
        let max_age = Duration::from_secs(u64::from(self.config.maintenance.log_retention_days) * 86_400);
        let pruned_files = blocking(&logs.clone(), move || {
            prune_older_than(&logs, max_age, |name| {
                name.contains("_report_") || name.ends_with(".log")
            })
        })
        .await?;
        info!(count = pruned_files.len(), "Old reports and logs pruned");

        let scratch = self.layout.scratch_dir();
        let scratch_cleared = scratch.is_dir();
        if scratch_cleared {
            blocking(&scratch.clone(), move || fs_tree::clear_dir(&scratch)).await?;
            info!("Scratch area cleared");
        }

        let image_bytes_reclaimed = match self.controller.prune_images().await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Image prune failed");
                0
            }
        };

        Ok(CleanupSummary {
            retention,
            pruned_files,
            scratch_cleared,
            image_bytes_reclaimed,
        })
    }

    /// Pull newer images and recreate changed services.
    pub async fn update(&self, force: bool) -> OpsResult<UpdateSummary> {
        if !self.config.maintenance.auto_update && !force {
            info!("Auto-update disabled, skipping image update");
            return Ok(UpdateSummary {
                applied: false,
                pull_attempts: 0,
                healthy_after: None,
            });
        }

        let pulled = self
            .pull_policy
            .run(
                |attempt| async move {
                    info!(attempt, "Pulling service images");
                    self.controller.pull_images().await
                },
                |result| result.is_ok(),
            )
            .await;
        if let Err(e) = pulled.value {
            return Err(OpsError::Service(e));
        }

        self.controller.start_all().await.map_err(|e| OpsError::ServiceStartFailed {
            service: self.config.compose.project.clone(),
            reason: e.to_string(),
        })?;

        let (report, _) = self.health.check(CheckMode::Quick).await?;
        Ok(UpdateSummary {
            applied: true,
            pull_attempts: pulled.attempts,
            healthy_after: Some(report.is_healthy()),
        })
    }

    /// File permissions, credentials, ownership and container privileges.
    pub async fn security_audit(&self) -> Vec<SecurityFinding> {
        let mut findings = Vec::new();
        let env_path = &self.config.paths.env_file;

        audit_env_permissions(env_path, &mut findings);
        match read_env_file(env_path) {
            Ok(map) => {
                for (key, value) in &map {
                    if is_sensitive_key(key) && looks_unset(value) {
                        findings.push(SecurityFinding::new(
                            Severity::Warning,
                            format!("{} is empty or still a placeholder", key),
                        ));
                    }
                }
            }
            Err(e) => findings.push(SecurityFinding::new(Severity::Warning, e.to_string())),
        }

        for (label, path) in [
            ("appdata", self.config.paths.appdata.as_path()),
            ("documents", self.config.paths.documents.as_path()),
        ] {
            audit_ownership(label, path, self.config.ownership.uid, self.config.ownership.gid, &mut findings);
        }

        for service in &self.config.services {
            match self.controller.is_privileged(service).await {
                Ok(true) => findings.push(SecurityFinding::new(
                    Severity::Error,
                    format!("{} runs as a privileged container", service.name),
                )),
                Ok(false) => {}
                Err(e) => warn!(service = %service.name, error = %e, "Could not inspect container privileges"),
            }
        }

        if !self.config.backup.encryption {
            findings.push(SecurityFinding::new(Severity::Info, "Backup encryption is disabled"));
        }

        for finding in &findings {
            match finding.severity {
                Severity::Error | Severity::Warning => warn!(severity = %finding.severity, "{}", finding.message),
                _ => info!("{}", finding.message),
            }
        }
        findings
    }

    fn write_report(&self, outcome: &MaintenanceOutcome) -> Option<PathBuf> {
        let mut report = TextReport::new("Archon Maintenance Report");
        report
            .field("Task", outcome.task)
            .field("Status", if outcome.is_success() { "SUCCESS" } else { "ISSUES FOUND" })
            .field("Duration", format!("{:.1}s", outcome.duration_secs));

        if let Some(health) = &outcome.health {
            report.section("Health").field("Mode", health.mode);
            for service in &health.services {
                report.field(&service.service, service.status);
            }
            for disk in &health.disks {
                report.field(
                    &format!("disk {}", disk.label),
                    format!(
                        "{} free{}",
                        crate::domain::format_bytes(disk.free_bytes),
                        if disk.ok { "" } else { " (LOW)" }
                    ),
                );
            }
        }
        if let Some(cleanup) = &outcome.cleanup {
            report
                .section("Cleanup")
                .field("Expired artifacts", cleanup.retention.removed.len())
                .field("Freed", crate::domain::format_bytes(cleanup.retention.freed_bytes))
                .field("Pruned files", cleanup.pruned_files.len())
                .field("Scratch cleared", cleanup.scratch_cleared)
                .field("Image space", crate::domain::format_bytes(cleanup.image_bytes_reclaimed));
        }
        if let Some(update) = &outcome.update {
            report
                .section("Update")
                .field("Applied", update.applied)
                .field("Pull attempts", update.pull_attempts)
                .field(
                    "Healthy after",
                    update.healthy_after.map_or("-".to_string(), |h| h.to_string()),
                );
        }
        if let Some(findings) = &outcome.security {
            report.section("Security");
            if findings.is_empty() {
                report.line("No findings");
            }
            for finding in findings {
                report.line(format!("[{}] {}", finding.severity, finding.message));
            }
        }
        if !outcome.errors.is_empty() {
            report.section("Errors");
            for error in &outcome.errors {
                report.line(error);
            }
        }

        match self.reports.write_text("maintenance", &report) {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(error = %e, "Failed to write maintenance report");
                None
            }
        }
    }
}

fn looks_unset(value: &str) -> bool {
    let lower = value.trim().to_ascii_lowercase();
    lower.is_empty() || PLACEHOLDER_MARKERS.iter().any(|m| lower.contains(m))
}

#[cfg(unix)]
fn audit_env_permissions(path: &Path, findings: &mut Vec<SecurityFinding>) {
    use std::os::unix::fs::PermissionsExt;
    match std::fs::metadata(path) {
        Ok(meta) => {
            let mode = meta.permissions().mode();
            if mode & 0o077 != 0 {
                findings.push(SecurityFinding::new(
                    Severity::Warning,
                    format!("{} is accessible by group/other (mode {:o}), expected 600", path.display(), mode & 0o777),
                ));
            }
        }
        Err(e) => findings.push(SecurityFinding::new(
            Severity::Warning,
            format!("{} unreadable: {}", path.display(), e),
        )),
    }
}

#[cfg(not(unix))]
fn audit_env_permissions(_path: &Path, _findings: &mut Vec<SecurityFinding>) {}

#[cfg(unix)]
fn audit_ownership(label: &str, path: &Path, uid: u32, gid: u32, findings: &mut Vec<SecurityFinding>) {
    use std::os::unix::fs::MetadataExt;
    if let Ok(meta) = std::fs::metadata(path) {
        if meta.uid() != uid || meta.gid() != gid {
            findings.push(SecurityFinding::new(
                Severity::Warning,
                format!(
                    "{} ({}) owned by {}:{}, expected {}:{}",
                    label,
                    path.display(),
                    meta.uid(),
                    meta.gid(),
                    uid,
                    gid
                ),
            ));
        }
    }
}

#[cfg(not(unix))]
fn audit_ownership(_label: &str, _path: &Path, _uid: u32, _gid: u32, _findings: &mut Vec<SecurityFinding>) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_parsing() {
        assert_eq!("Cleanup".parse::<MaintenanceTask>().unwrap(), MaintenanceTask::Cleanup);
        assert!("defrag".parse::<MaintenanceTask>().is_err());
        assert_eq!(MaintenanceTask::Security.to_string(), "security");
    }

    #[test]
    fn test_placeholder_detection() {
        assert!(looks_unset(""));
        assert!(looks_unset("your_openai_key_here"));
        assert!(looks_unset("<replace me>"));
        assert!(!looks_unset("sk-live-9f8a7b6c"));
    }

    #[cfg(unix)]
    #[test]
    fn test_env_permission_audit() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let env = dir.path().join(".env");
        std::fs::write(&env, "OPENAI_API_KEY=x\n").unwrap();

        std::fs::set_permissions(&env, std::fs::Permissions::from_mode(0o644)).unwrap();
        let mut findings = Vec::new();
        audit_env_permissions(&env, &mut findings);
        assert_eq!(findings.len(), 1);

        std::fs::set_permissions(&env, std::fs::Permissions::from_mode(0o600)).unwrap();
        findings.clear();
        audit_env_permissions(&env, &mut findings);
        assert!(findings.is_empty());
    }
}
