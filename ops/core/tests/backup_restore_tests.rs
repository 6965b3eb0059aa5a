// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

mod common;

use archon_core::application::rollback_coordinator::LiveTree;
use archon_core::application::{ArchiveEngine, RestoreEngine, RestoreOutcome, RollbackCoordinator};
use archon_core::domain::artifact::{ArtifactName, ArtifactRef, BackupMode, StorageForm, CONFIG_DIR, SANITIZED_ENV_FILE};
use archon_core::domain::config::Secret;
use archon_core::domain::notifier::Severity;
use archon_core::domain::path_guard::TargetPathGuard;
use archon_core::domain::retry::RetryPolicy;
use archon_core::infrastructure::layout::BackupLayout;
use archon_core::OpsError;
use common::{fast_kdf, Fixture, MockServiceController};
use std::fs;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn archive_engine(fx: &Fixture) -> ArchiveEngine {
    ArchiveEngine::new(fx.config.clone(), fx.controller.clone(), fx.notifier.clone()).with_kdf_params(fast_kdf())
}

fn restore_engine(fx: &Fixture) -> RestoreEngine {
    RestoreEngine::new(
        fx.config.clone(),
        fx.controller.clone(),
        fx.probe.clone(),
        fx.notifier.clone(),
    )
    .with_verify_policy(RetryPolicy::fixed(2, Duration::ZERO))
}

fn read(path: impl AsRef<std::path::Path>) -> String {
    fs::read_to_string(path).unwrap()
}

#[tokio::test]
async fn test_full_backup_produces_checksummed_archive_and_latest() {
    let fx = Fixture::new();
    let engine = archive_engine(&fx);

    let outcome = engine
        .create_backup(BackupMode::Full, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.artifact.form, StorageForm::Compressed);
    let file_name = outcome.artifact.path.file_name().unwrap().to_str().unwrap().to_string();
    assert!(file_name.starts_with("archon_backup_") && file_name.ends_with(".tar.gz"));
    assert!(outcome.artifact.path.is_file());
    assert!(outcome.artifact.checksum_path.is_file());
    assert!(read(&outcome.artifact.checksum_path).starts_with(&outcome.checksum));

    let latest = engine.layout().latest().load().unwrap().unwrap();
    assert_eq!(latest.name, outcome.name);
    assert!(latest.is_valid());

    // Services paused for the copy and started again afterwards
    let calls = fx.controller.calls();
    assert_eq!(calls.first().map(String::as_str), Some("stop_all"));
    assert_eq!(calls.last().map(String::as_str), Some("start_all"));
    assert_eq!(outcome.images.len(), 4);

    // Credentials never leave the host
    let sanitized = read(outcome.snapshot.join(CONFIG_DIR).join(SANITIZED_ENV_FILE));
    assert!(sanitized.contains("LOG_LEVEL=INFO"));
    assert!(sanitized.contains("SUPABASE_URL="));
    assert!(!sanitized.contains("sk-live-1234"));
    assert!(!sanitized.contains("SUPABASE_SERVICE_KEY"));

    let reports: Vec<_> = fs::read_dir(&fx.config.paths.logs)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("backup_report_"))
        .collect();
    assert_eq!(reports.len(), 1);
    assert!(fx
        .notifier
        .sent()
        .iter()
        .any(|(severity, _)| *severity == Severity::Success));
}

#[tokio::test]
async fn test_incremental_backup_then_restore_latest_round_trips() {
    let fx = Fixture::new();
    let engine = archive_engine(&fx);
    let cancel = CancellationToken::new();

    let first = engine.create_backup(BackupMode::Full, &cancel).await.unwrap();
    fs::write(fx.documents().join("guide.md"), b"# Guide v2").unwrap();
    let second = engine.create_backup(BackupMode::Incremental, &cancel).await.unwrap();

    assert_eq!(second.base.as_ref(), Some(&first.name));
    assert!(second.stats.linked_files >= 2, "unchanged files should be hard-linked");
    assert!(second.name > first.name);
    // Incremental runs never pause the stack
    assert_eq!(fx.controller.count("stop_all"), 1);

    // Damage the live install
    fs::write(fx.appdata().join("server/state.db"), b"corrupted").unwrap();
    fs::write(fx.appdata().join("junk.txt"), b"junk").unwrap();
    fs::write(fx.appdata().join("settings.json"), b"{\"theme\":\"light\"}").unwrap();
    fs::remove_file(fx.documents().join("guide.md")).unwrap();
    fs::write(fx.env_file(), "OPENAI_API_KEY=sk-rotated-5678\nLOG_LEVEL=DEBUG\n").unwrap();

    let outcome = restore_engine(&fx)
        .restore(&ArtifactRef::Latest, None, &cancel)
        .await
        .unwrap();
    assert!(outcome.is_restored(), "unexpected outcome: {:?}", outcome);
    assert_eq!(outcome.summary().artifact_name, second.name.to_string());

    assert_eq!(read(fx.appdata().join("server/state.db")), "state-v1");
    assert!(!fx.appdata().join("junk.txt").exists());
    assert_eq!(read(fx.documents().join("guide.md")), "# Guide v2");
    // Preserved file keeps its pre-restore content
    assert_eq!(read(fx.appdata().join("settings.json")), "{\"theme\":\"light\"}");

    // Restored configuration plus the local credentials
    let env = read(fx.env_file());
    assert!(env.contains("LOG_LEVEL=INFO"));
    assert!(env.contains("OPENAI_API_KEY=sk-rotated-5678"));
    assert!(!env.contains("sk-live-1234"));

    let layout = BackupLayout::new(fx.backups());
    assert!(!layout.pending_safety().exists());
    assert_eq!(fs::read_dir(layout.safety_dir()).unwrap().count(), 0);
    assert_eq!(fx.controller.calls().last().map(String::as_str), Some("start_all"));
}

#[tokio::test]
async fn test_tampered_checksum_refuses_restore_before_stopping_services() {
    let fx = Fixture::new();
    let backup = archive_engine(&fx)
        .create_backup(BackupMode::Full, &CancellationToken::new())
        .await
        .unwrap();

    let layout = BackupLayout::new(fx.backups());
    let sidecar = layout.snapshot(&backup.name).checksum_path;
    fs::write(&sidecar, format!("{}  {}\n", "0".repeat(64), backup.name)).unwrap();
    fs::write(fx.appdata().join("server/state.db"), b"state-live").unwrap();
    let stops_before = fx.controller.count("stop_all");

    let err = restore_engine(&fx)
        .restore(&ArtifactRef::Latest, None, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, OpsError::IntegrityCheckFailed { .. }), "got {:?}", err);
    assert!(err.is_pre_destructive_guard());
    assert_eq!(fx.controller.count("stop_all"), stops_before);
    assert_eq!(read(fx.appdata().join("server/state.db")), "state-live");
    assert!(!layout.pending_safety().exists());
}

#[tokio::test]
async fn test_target_outside_allow_list_is_refused_without_deletion() {
    let fx = Fixture::with(
        |env| {
            env.insert("RESTORE_ALLOWED_BASES".to_string(), "/mnt/user,/mnt/cache".to_string());
        },
        MockServiceController::new(),
    );
    archive_engine(&fx)
        .create_backup(BackupMode::Incremental, &CancellationToken::new())
        .await
        .unwrap();
    fs::write(fx.appdata().join("server/state.db"), b"state-live").unwrap();

    let engine = restore_engine(&fx);
    assert!(matches!(
        engine.plan(&ArtifactRef::Latest),
        Err(OpsError::UnsafeTargetPath { .. })
    ));
    let err = engine
        .restore(&ArtifactRef::Latest, None, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, OpsError::UnsafeTargetPath { .. }), "got {:?}", err);
    assert_eq!(fx.controller.count("stop_all"), 0);
    assert_eq!(read(fx.appdata().join("server/state.db")), "state-live");
}

#[tokio::test]
async fn test_failed_verification_rolls_back_to_pre_restore_state() {
    let fx = Fixture::new();
    archive_engine(&fx)
        .create_backup(BackupMode::Full, &CancellationToken::new())
        .await
        .unwrap();

    fs::write(fx.appdata().join("server/state.db"), b"state-v2").unwrap();
    fs::write(fx.appdata().join("new-upload.bin"), b"payload").unwrap();
    fs::write(fx.env_file(), "LOG_LEVEL=WARN\nOPENAI_API_KEY=sk-live-1234\n").unwrap();
    fx.probe.fail("archon-server");

    let outcome = restore_engine(&fx)
        .restore(&ArtifactRef::Latest, None, &CancellationToken::new())
        .await
        .unwrap();

    let RestoreOutcome::RolledBack { rollback, .. } = outcome else {
        panic!("expected rollback, got {:?}", outcome);
    };
    assert!(rollback.cause.as_deref().unwrap_or_default().contains("archon-server"));
    assert_eq!(rollback.restored_trees, vec!["appdata".to_string(), "documents".to_string()]);

    assert_eq!(read(fx.appdata().join("server/state.db")), "state-v2");
    assert_eq!(read(fx.appdata().join("new-upload.bin")), "payload");
    assert_eq!(read(fx.env_file()), "LOG_LEVEL=WARN\nOPENAI_API_KEY=sk-live-1234\n");
    assert_eq!(fx.controller.calls().last().map(String::as_str), Some("start_all"));

    let layout = BackupLayout::new(fx.backups());
    assert!(!layout.pending_safety().exists());
    assert!(fx
        .notifier
        .sent()
        .iter()
        .any(|(severity, subject)| *severity == Severity::Warning && subject.contains("rolled back")));
}

#[tokio::test]
async fn test_cancelled_restore_rolls_back() {
    let cancel = CancellationToken::new();
    let controller = MockServiceController {
        cancel_on_stop: Some(cancel.clone()),
        ..Default::default()
    };
    let fx = Fixture::with(|_| {}, controller);
    archive_engine(&fx)
        .create_backup(BackupMode::Incremental, &CancellationToken::new())
        .await
        .unwrap();
    fs::write(fx.appdata().join("server/state.db"), b"state-v2").unwrap();

    let outcome = restore_engine(&fx)
        .restore(&ArtifactRef::Latest, None, &cancel)
        .await
        .unwrap();

    let RestoreOutcome::RolledBack { rollback, .. } = outcome else {
        panic!("expected rollback, got {:?}", outcome);
    };
    assert_eq!(rollback.cause.as_deref(), Some("Operation cancelled"));
    assert_eq!(read(fx.appdata().join("server/state.db")), "state-v2");
}

#[tokio::test]
async fn test_cancelled_full_backup_restarts_services_and_keeps_latest() {
    let fx = Fixture::new();
    let first = archive_engine(&fx)
        .create_backup(BackupMode::Incremental, &CancellationToken::new())
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let controller = MockServiceController {
        cancel_on_stop: Some(cancel.clone()),
        ..Default::default()
    };
    let controller = std::sync::Arc::new(controller);
    let engine = ArchiveEngine::new(fx.config.clone(), controller.clone(), fx.notifier.clone());

    let err = engine.create_backup(BackupMode::Full, &cancel).await.unwrap_err();
    assert!(matches!(err, OpsError::Cancelled), "got {:?}", err);
    assert_eq!(controller.calls(), vec!["stop_all".to_string(), "start_all".to_string()]);

    let layout = engine.layout();
    assert_eq!(layout.latest().load().unwrap().unwrap().name, first.name);
    let snapshots: Vec<_> = fs::read_dir(layout.snapshots_dir())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .collect();
    assert_eq!(snapshots.len(), 1, "partial snapshot must be discarded");
}

#[tokio::test]
async fn test_failed_stop_skips_full_backup_and_restarts_services() {
    let controller = MockServiceController {
        fail_stop: true,
        ..Default::default()
    };
    let fx = Fixture::with(|_| {}, controller);
    let engine = archive_engine(&fx);

    let err = engine
        .create_backup(BackupMode::Full, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, OpsError::Service(_)), "got {:?}", err);
    assert_eq!(fx.controller.calls(), vec!["stop_all".to_string(), "start_all".to_string()]);
    let layout = engine.layout();
    assert!(layout.latest().load().unwrap().is_none());
    let snapshots = fs::read_dir(layout.snapshots_dir())
        .map(|entries| entries.filter_map(|e| e.ok()).filter(|e| e.path().is_dir()).count())
        .unwrap_or(0);
    assert_eq!(snapshots, 0);
}

#[tokio::test]
async fn test_preserved_env_file_inside_appdata_keeps_local_copy() {
    let fx = Fixture::with(
        |env| {
            let home = env["ARCHON_HOME"].clone();
            env.insert("ARCHON_ENV_FILE".to_string(), format!("{}/data/.env", home));
        },
        MockServiceController::new(),
    );
    assert!(fx.env_file().starts_with(fx.appdata()));
    fs::write(fx.env_file(), "CUSTOM_SETTING=backup-time
LOG_LEVEL=INFO
OPENAI_API_KEY=sk-live-1234
").unwrap();
    archive_engine(&fx)
        .create_backup(BackupMode::Incremental, &CancellationToken::new())
        .await
        .unwrap();

    let operator = "CUSTOM_SETTING=operator
LOG_LEVEL=DEBUG
OPENAI_API_KEY=sk-rotated-5678
";
    fs::write(fx.env_file(), operator).unwrap();
    fs::write(fx.appdata().join("server/state.db"), b"corrupted").unwrap();

    let outcome = restore_engine(&fx)
        .restore(&ArtifactRef::Latest, None, &CancellationToken::new())
        .await
        .unwrap();

    assert!(outcome.is_restored(), "unexpected outcome: {:?}", outcome);
    assert_eq!(read(fx.appdata().join("server/state.db")), "state-v1");
    assert_eq!(read(fx.env_file()), operator);
}

#[tokio::test]
async fn test_rollback_removes_env_file_created_by_restore() {
    let fx = Fixture::new();
    archive_engine(&fx)
        .create_backup(BackupMode::Full, &CancellationToken::new())
        .await
        .unwrap();
    fs::remove_file(fx.env_file()).unwrap();
    fx.probe.fail("archon-server");

    let outcome = restore_engine(&fx)
        .restore(&ArtifactRef::Latest, None, &CancellationToken::new())
        .await
        .unwrap();

    assert!(
        matches!(outcome, RestoreOutcome::RolledBack { .. }),
        "expected rollback, got {:?}",
        outcome
    );
    assert!(!fx.env_file().exists());
    assert_eq!(read(fx.appdata().join("server/state.db")), "state-v1");
}

#[tokio::test]
async fn test_rollback_refuses_vanished_tree_outside_allowed_base() {
    let fx = Fixture::new();
    let root = fx.dir.path();
    fs::create_dir_all(root.join("allowed")).unwrap();
    let outside = root.join("outside/data");
    fs::create_dir_all(&outside).unwrap();
    fs::write(outside.join("state.db"), b"state").unwrap();

    let layout = BackupLayout::new(fx.backups());
    let coordinator = RollbackCoordinator::new(
        layout.clone(),
        fx.controller.clone(),
        TargetPathGuard::new(vec![root.join("allowed")]),
        fx.config.ownership,
    );
    let trees = vec![LiveTree {
        label: "data".to_string(),
        path: outside.clone(),
    }];
    let restoring = ArtifactName::parse("archon_backup_20260101_000000").unwrap();
    let guard = coordinator
        .capture(&restoring, &trees, fx.env_file(), &[], &outside)
        .await
        .unwrap();
    fs::remove_dir_all(root.join("outside")).unwrap();

    let err = guard.roll_back(&OpsError::Cancelled).await.unwrap_err();

    assert!(matches!(err, OpsError::RollbackFailed { .. }), "got {:?}", err);
    assert!(!root.join("outside").exists());
    assert!(layout.pending_safety().exists());
}

#[tokio::test]
async fn test_pending_safety_snapshot_blocks_restore_until_rolled_back() {
    let fx = Fixture::new();
    archive_engine(&fx)
        .create_backup(BackupMode::Incremental, &CancellationToken::new())
        .await
        .unwrap();

    // Simulate a restore that died after taking its safety snapshot
    let layout = BackupLayout::new(fx.backups());
    let coordinator = RollbackCoordinator::new(
        layout.clone(),
        fx.controller.clone(),
        TargetPathGuard::new(fx.config.restore.allowed_bases.clone()),
        fx.config.ownership,
    );
    let trees = vec![
        LiveTree {
            label: "appdata".to_string(),
            path: fx.appdata().to_path_buf(),
        },
        LiveTree {
            label: "documents".to_string(),
            path: fx.documents().to_path_buf(),
        },
    ];
    let restoring = ArtifactName::parse("archon_backup_20260101_000000").unwrap();
    let guard = coordinator
        .capture(&restoring, &trees, fx.env_file(), &[], fx.appdata())
        .await
        .unwrap();
    drop(guard);
    fs::remove_file(fx.appdata().join("server/state.db")).unwrap();
    fs::write(fx.documents().join("guide.md"), b"half-written").unwrap();

    let engine = restore_engine(&fx);
    let err = engine
        .restore(&ArtifactRef::Latest, None, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, OpsError::PendingRollback(_)), "got {:?}", err);

    let report = engine.rollback_interrupted().await.unwrap();
    assert_eq!(report.restored_trees.len(), 2);
    assert_eq!(read(fx.appdata().join("server/state.db")), "state-v1");
    assert_eq!(read(fx.documents().join("guide.md")), "# Guide v1");
    assert!(!layout.pending_safety().exists());

    assert!(engine.plan(&ArtifactRef::Latest).is_ok());
    assert!(matches!(
        engine.rollback_interrupted().await,
        Err(OpsError::NoBackupFound(_))
    ));
}

#[tokio::test]
async fn test_encrypted_archive_requires_the_right_passphrase() {
    let fx = Fixture::with(
        |env| {
            env.insert("BACKUP_ENCRYPTION".to_string(), "true".to_string());
            env.insert("BACKUP_ENCRYPTION_KEY".to_string(), "correct horse battery".to_string());
        },
        MockServiceController::new(),
    );
    let backup = archive_engine(&fx)
        .create_backup(BackupMode::Full, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(backup.artifact.form, StorageForm::Encrypted);
    assert!(backup.artifact.path.to_string_lossy().ends_with(".tar.gz.enc"));

    // Leave only the encrypted form on disk
    let layout = BackupLayout::new(fx.backups());
    fs::remove_dir_all(layout.snapshot(&backup.name).path).unwrap();
    fs::remove_file(layout.snapshot(&backup.name).checksum_path).unwrap();
    layout.latest().clear().unwrap();
    fs::write(fx.appdata().join("server/state.db"), b"state-v2").unwrap();

    let engine = restore_engine(&fx);
    let plan = engine.plan(&ArtifactRef::Latest).unwrap();
    assert_eq!(plan.form, StorageForm::Encrypted);
    assert!(!plan.needs_passphrase);

    let stops_before = fx.controller.count("stop_all");
    let err = engine
        .restore(&ArtifactRef::Latest, Some(Secret::new("wrong")), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, OpsError::DecryptionFailed(_)), "got {:?}", err);
    assert_eq!(fx.controller.count("stop_all"), stops_before);
    assert_eq!(read(fx.appdata().join("server/state.db")), "state-v2");

    let outcome = engine
        .restore(&ArtifactRef::Latest, None, &CancellationToken::new())
        .await
        .unwrap();
    assert!(outcome.is_restored(), "unexpected outcome: {:?}", outcome);
    assert_eq!(read(fx.appdata().join("server/state.db")), "state-v1");
    assert!(fx.controller.calls().iter().any(|c| c == "load:archon-server"));
    assert!(!layout.scratch_dir().exists() || fs::read_dir(layout.scratch_dir()).unwrap().count() == 0);
}
