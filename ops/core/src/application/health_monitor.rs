// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Health Monitor
//!
//! Observes each managed service (container state plus one liveness probe),
//! optionally gathers resource usage, log error counts and free disk space,
//! and drives bounded recovery for services that fail.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Implements `health {quick|comprehensive|monitor|report}`
//!
//! # Recovery ladder
//!
//! restart → wait → re-check, up to `recovery_attempts` times, then one
//! forced recreation → wait → re-check. A service still failing after that is
//! reported as `recovery_failed`.

use chrono::Utc;
use regex::Regex;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::config::OpsConfig;
use crate::domain::errors::{OpsError, OpsResult};
use crate::domain::health::{
    CheckMode, DiskUsage, HealthReport, HealthStatus, LivenessProbe, ProbeResult, RecoveryAction,
    RecoveryRecord, ServiceHealth,
};
use crate::domain::notifier::{Notifier, Severity};
use crate::domain::retry::RetryPolicy;
use crate::domain::service::{ContainerState, ManagedService, ServiceController, ServiceState};
use crate::infrastructure::fs_tree;
use crate::infrastructure::reports::ReportWriter;

static LOG_ERROR_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(error|fatal|panic|exception|traceback)\b").expect("valid log marker pattern")
});

const GIB: u64 = 1024 * 1024 * 1024;

/// Count log lines carrying an error marker.
pub fn count_error_lines<S: AsRef<str>>(lines: &[S]) -> usize {
    lines
        .iter()
        .filter(|line| LOG_ERROR_MARKER.is_match(line.as_ref()))
        .count()
}

pub struct HealthMonitor {
    config: Arc<OpsConfig>,
    controller: Arc<dyn ServiceController>,
    probe: Arc<dyn LivenessProbe>,
    notifier: Arc<dyn Notifier>,
    reports: ReportWriter,
    recovery_wait: Duration,
}

impl HealthMonitor {
    pub fn new(
        config: Arc<OpsConfig>,
        controller: Arc<dyn ServiceController>,
        probe: Arc<dyn LivenessProbe>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            reports: ReportWriter::new(config.paths.logs.clone()),
            recovery_wait: Duration::from_secs(config.health.recovery_wait_secs),
            config,
            controller,
            probe,
            notifier,
        }
    }

    /// Override the pause between a recovery action and its re-check.
    pub fn with_recovery_wait(mut self, wait: Duration) -> Self {
        self.recovery_wait = wait;
        self
    }

    /// Run one check and persist its JSON report.
    ///
    /// `Monitor` is accepted and behaves as a single monitor frame.
    pub async fn check(&self, mode: CheckMode) -> OpsResult<(HealthReport, Option<PathBuf>)> {
        let report = self.collect(mode).await;
        let written = match self.reports.write_json("health", report.generated_at, &report) {
            Ok(path) => {
                info!(path = %path.display(), "Health report written");
                Some(path)
            }
            Err(e) => {
                warn!(error = %e, "Failed to write health report");
                None
            }
        };
        self.notify_failures(&report).await;
        Ok((report, written))
    }

    /// Repeat quick checks (with recovery when enabled) until cancelled.
    pub async fn monitor<F>(&self, cancel: &CancellationToken, mut on_frame: F) -> OpsResult<()>
    where
        F: FnMut(&HealthReport),
    {
        let interval = Duration::from_secs(self.config.health.monitor_interval_secs.max(1));
        let mut previously_failing = BTreeSet::new();
        info!(interval_secs = interval.as_secs(), "Health monitor started");

        loop {
            let report = tokio::select! {
                _ = cancel.cancelled() => break,
                report = self.collect(CheckMode::Monitor) => report,
            };
            on_frame(&report);

            let failing: BTreeSet<String> = report
                .failing_services()
                .iter()
                .map(|s| s.service.clone())
                .collect();
            if !failing.is_empty() && failing != previously_failing {
                self.notify_failures(&report).await;
            }
            previously_failing = failing;

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        info!("Health monitor stopped");
        Ok(())
    }

    async fn collect(&self, mode: CheckMode) -> HealthReport {
        let detailed = matches!(mode, CheckMode::Comprehensive | CheckMode::Report);
        let recover = self.config.health.auto_recovery
            && matches!(mode, CheckMode::Comprehensive | CheckMode::Monitor);

        let mut services = Vec::with_capacity(self.config.services.len());
        for service in &self.config.services {
            let mut health = self.observe(service).await;
            if recover && !health.is_passing() {
                self.recover(service, &mut health).await;
            }
            if detailed {
                self.enrich(service, &mut health).await;
            }
            services.push(health);
        }

        let disks = if detailed { self.disks() } else { Vec::new() };

        HealthReport {
            mode,
            generated_at: Utc::now(),
            host: hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unknown".to_string()),
            services,
            disks,
        }
    }

    /// Container state plus one liveness probe.
    async fn observe(&self, service: &ManagedService) -> ServiceHealth {
        let container = match self.controller.container_state(service).await {
            Ok(state) => state,
            Err(e) => {
                warn!(service = %service.name, error = %e, "Container state unavailable");
                ContainerState::Unknown
            }
        };
        let probe = if container.is_running() {
            self.probe.probe(service).await
        } else {
            ProbeResult::failed("container not running")
        };
        let state = ServiceState::observe(container, probe.ok);
        let status = match state {
            ServiceState::RunningHealthy => HealthStatus::Healthy,
            ServiceState::RunningUnhealthy => HealthStatus::Unhealthy,
            _ => HealthStatus::Down,
        };
        debug!(service = %service.name, ?container, %status, "Service observed");

        ServiceHealth {
            service: service.name.clone(),
            port: service.port,
            container,
            state,
            probe,
            status,
            metrics: None,
            log_errors: None,
            recovery: Vec::new(),
        }
    }

    /// Restarts up to the configured budget, then one recreate.
    async fn recover(&self, service: &ManagedService, health: &mut ServiceHealth) {
        let attempts = self.config.health.recovery_attempts;
        warn!(service = %service.name, status = %health.status, attempts, "Service failing, attempting recovery");

        let mut history = std::mem::take(&mut health.recovery);
        // Each attempt waits for the service to settle before observing it
        let restarts = RetryPolicy::fixed(attempts, Duration::ZERO)
            .run(
                |attempt| self.attempt_recovery(service, RecoveryAction::Restart, attempt),
                |(record, observed)| {
                    history.push(record.clone());
                    observed.is_passing()
                },
            )
            .await;

        let observed = if restarts.succeeded {
            Some(restarts.value.1)
        } else {
            let (record, observed) = self.attempt_recovery(service, RecoveryAction::Recreate, 1).await;
            let healthy = record.healthy_after;
            history.push(record);
            healthy.then_some(observed)
        };

        match observed {
            Some(observed) => {
                *health = ServiceHealth {
                    status: HealthStatus::Recovered,
                    recovery: history,
                    ..observed
                };
            }
            None => {
                let failure = OpsError::RecoveryFailed {
                    service: service.name.clone(),
                    attempts: history.len() as u32,
                };
                error!(error = %failure, "Recovery exhausted");
                health.recovery = history;
                health.status = HealthStatus::RecoveryFailed;
            }
        }
    }

    async fn attempt_recovery(
        &self,
        service: &ManagedService,
        action: RecoveryAction,
        attempt: u32,
    ) -> (RecoveryRecord, ServiceHealth) {
        let result = match action {
            RecoveryAction::Restart => self.controller.restart(service).await,
            RecoveryAction::Recreate => self.controller.recreate(service).await,
        };
        let action_error = result.err().map(|e| e.to_string());
        if let Some(reason) = &action_error {
            warn!(service = %service.name, ?action, attempt, %reason, "Recovery action failed");
        }

        tokio::time::sleep(self.recovery_wait).await;
        let observed = self.observe(service).await;
        let healthy_after = observed.is_passing();
        if healthy_after {
            info!(service = %service.name, ?action, attempt, "Service recovered");
        }
        let record = RecoveryRecord {
            action,
            attempt,
            healthy_after,
            error: action_error,
        };
        (record, observed)
    }

    /// Resource usage and log scan for running containers.
    async fn enrich(&self, service: &ManagedService, health: &mut ServiceHealth) {
        if !health.container.is_running() {
            return;
        }
        match self.controller.resource_usage(service).await {
            Ok(metrics) => health.metrics = Some(metrics),
            Err(e) => warn!(service = %service.name, error = %e, "Resource usage unavailable"),
        }
        match self
            .controller
            .recent_logs(service, self.config.health.log_lines)
            .await
        {
            Ok(lines) => {
                let errors = count_error_lines(&lines);
                if errors > 0 {
                    warn!(service = %service.name, errors, "Error markers in recent logs");
                }
                health.log_errors = Some(errors);
            }
            Err(e) => warn!(service = %service.name, error = %e, "Logs unavailable"),
        }
    }

    fn disks(&self) -> Vec<DiskUsage> {
        let min_free_bytes = self.config.health.min_free_gb.saturating_mul(GIB);
        self.config
            .storage_paths()
            .into_iter()
            .filter_map(|(label, path)| match fs_tree::free_space(path) {
                Ok(space) => Some(DiskUsage {
                    label: label.to_string(),
                    path: path.to_path_buf(),
                    total_bytes: space.total,
                    free_bytes: space.free,
                    min_free_bytes,
                    ok: space.free >= min_free_bytes,
                }),
                Err(e) => {
                    warn!(label, path = %path.display(), error = %e, "Free space unavailable");
                    None
                }
            })
            .collect()
    }

    async fn notify_failures(&self, report: &HealthReport) {
        if report.is_healthy() {
            return;
        }
        let mut lines: Vec<String> = report
            .failing_services()
            .iter()
            .map(|s| format!("{}: {}", s.service, s.status))
            .collect();
        lines.extend(report.low_disks().iter().map(|d| {
            format!(
                "{}: {} free (minimum {})",
                d.label,
                crate::domain::format_bytes(d.free_bytes),
                crate::domain::format_bytes(d.min_free_bytes)
            )
        }));
        let severity = if report
            .services
            .iter()
            .any(|s| matches!(s.status, HealthStatus::Down | HealthStatus::RecoveryFailed))
        {
            Severity::Error
        } else {
            Severity::Warning
        };
        self.notifier
            .notify(severity, "Archon health check failed", &lines.join("\n"))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_marker_scan() {
        let lines = [
            "INFO  server started",
            "ERROR failed to connect to supabase",
            "Traceback (most recent call last):",
            "user asked about errorless code",
            "FATAL: out of memory",
        ];
        assert_eq!(count_error_lines(&lines), 3);
    }
}
