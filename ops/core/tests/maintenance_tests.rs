// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

mod common;

use archon_core::application::{HealthMonitor, MaintenanceService, MaintenanceTask};
use archon_core::domain::notifier::Severity;
use archon_core::domain::retry::RetryPolicy;
use common::{Fixture, MockServiceController};
use std::collections::HashSet;
use std::fs;
use std::time::Duration;

fn service(fx: &Fixture) -> MaintenanceService {
    let health = HealthMonitor::new(
        fx.config.clone(),
        fx.controller.clone(),
        fx.probe.clone(),
        fx.notifier.clone(),
    )
    .with_recovery_wait(Duration::ZERO);
    MaintenanceService::new(
        fx.config.clone(),
        fx.controller.clone(),
        fx.probe.clone(),
        fx.notifier.clone(),
    )
    .with_health_monitor(health)
    .with_pull_policy(RetryPolicy::fixed(2, Duration::ZERO))
}

#[tokio::test]
async fn test_update_is_skipped_unless_enabled_or_forced() {
    let fx = Fixture::new();
    let maintenance = service(&fx);

    let skipped = maintenance.run(MaintenanceTask::Update, false).await.unwrap();
    let update = skipped.update.unwrap();
    assert!(!update.applied);
    assert_eq!(fx.controller.count("pull"), 0);

    let forced = maintenance.run(MaintenanceTask::Update, true).await.unwrap();
    let update = forced.update.as_ref().unwrap();
    assert!(update.applied);
    assert_eq!(update.pull_attempts, 1);
    assert_eq!(update.healthy_after, Some(true));
    assert_eq!(fx.controller.calls(), vec!["pull".to_string(), "start_all".to_string()]);
    assert!(forced.is_success());
}

#[tokio::test]
async fn test_security_audit_flags_privileged_containers_and_placeholders() {
    let controller = MockServiceController {
        privileged: HashSet::from(["archon-ui".to_string()]),
        ..Default::default()
    };
    let fx = Fixture::with(|_| {}, controller);
    fs::write(fx.env_file(), "OPENAI_API_KEY=changeme\nSUPABASE_SERVICE_KEY=\nLOG_LEVEL=INFO\n").unwrap();

    let outcome = service(&fx).run(MaintenanceTask::Security, false).await.unwrap();
    let findings = outcome.security.as_ref().unwrap();

    assert!(findings
        .iter()
        .any(|f| f.severity == Severity::Error && f.message.contains("archon-ui")));
    assert!(findings.iter().any(|f| f.message.contains("OPENAI_API_KEY")));
    assert!(findings.iter().any(|f| f.message.contains("SUPABASE_SERVICE_KEY")));
    assert!(!findings.iter().any(|f| f.message.contains("LOG_LEVEL")));
    assert!(!outcome.is_success());
    assert!(outcome.report.as_ref().is_some_and(|p| p.is_file()));
    assert_eq!(
        fx.notifier.sent().last().map(|(s, _)| *s),
        Some(Severity::Warning)
    );
}

#[tokio::test]
async fn test_cleanup_prunes_old_reports_and_scratch() {
    let fx = Fixture::new();
    let logs = &fx.config.paths.logs;
    fs::create_dir_all(logs).unwrap();
    let stale = logs.join("backup_report_20200101_000000.txt");
    let keep = logs.join("notes.txt");
    fs::write(&stale, "old").unwrap();
    fs::write(&keep, "operator notes").unwrap();
    let old = std::time::SystemTime::now() - Duration::from_secs(60 * 86_400);
    fs::File::options()
        .write(true)
        .open(&stale)
        .unwrap()
        .set_modified(old)
        .unwrap();

    let scratch = fx.backups().join(".scratch");
    fs::create_dir_all(scratch.join("leftover")).unwrap();
    fs::write(scratch.join("leftover/archive.tar"), "partial").unwrap();

    let outcome = service(&fx).run(MaintenanceTask::Cleanup, false).await.unwrap();
    let cleanup = outcome.cleanup.unwrap();

    assert_eq!(cleanup.pruned_files, vec![stale.clone()]);
    assert!(!stale.exists());
    assert!(keep.exists());
    assert!(cleanup.scratch_cleared);
    assert_eq!(fs::read_dir(&scratch).unwrap().count(), 0);
    assert_eq!(fx.controller.count("prune"), 1);
}
