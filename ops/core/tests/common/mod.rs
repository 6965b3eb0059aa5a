// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Shared fixtures for the integration tests: a recording service controller,
//! a scriptable liveness probe, a recording notifier and a temporary install.

#![allow(dead_code)]

use archon_core::domain::config::{EnvMap, OpsConfig};
use archon_core::domain::health::{LivenessProbe, ProbeResult};
use archon_core::domain::notifier::{Notifier, Severity};
use archon_core::domain::service::{
    ContainerState, ManagedService, ResourceMetrics, ServiceController, ServiceError,
};
use async_trait::async_trait;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub struct MockServiceController {
    pub calls: Mutex<Vec<String>>,
    /// Services whose container is not running
    pub down: Mutex<HashSet<String>>,
    pub fail_stop: bool,
    pub fail_start: bool,
    pub restart_heals: bool,
    /// Restart that brings a service back, counted per service
    pub heal_after_restarts: Option<usize>,
    pub recreate_heals: bool,
    pub privileged: HashSet<String>,
    /// Cancelled when services are stopped, to interrupt a run mid-way
    pub cancel_on_stop: Option<CancellationToken>,
}

impl MockServiceController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == call).count()
    }

    pub fn set_down(&self, service: &str) {
        self.down.lock().unwrap().insert(service.to_string());
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }
}

#[async_trait]
impl ServiceController for MockServiceController {
    async fn stop_all(&self) -> Result<(), ServiceError> {
        self.record("stop_all");
        if let Some(token) = &self.cancel_on_stop {
            token.cancel();
        }
        if self.fail_stop {
            return Err(ServiceError::StopFailed("mock stop failure".to_string()));
        }
        Ok(())
    }

    async fn start_all(&self) -> Result<(), ServiceError> {
        self.record("start_all");
        if self.fail_start {
            return Err(ServiceError::StartFailed("mock start failure".to_string()));
        }
        Ok(())
    }

    async fn container_state(&self, service: &ManagedService) -> Result<ContainerState, ServiceError> {
        if self.down.lock().unwrap().contains(&service.name) {
            Ok(ContainerState::Exited)
        } else {
            Ok(ContainerState::Running)
        }
    }

    async fn restart(&self, service: &ManagedService) -> Result<(), ServiceError> {
        let call = format!("restart:{}", service.name);
        self.record(call.clone());
        let healed_now = self.heal_after_restarts.is_some_and(|n| self.count(&call) >= n);
        if self.restart_heals || healed_now {
            self.down.lock().unwrap().remove(&service.name);
        }
        Ok(())
    }

    async fn recreate(&self, service: &ManagedService) -> Result<(), ServiceError> {
        self.record(format!("recreate:{}", service.name));
        if self.recreate_heals {
            self.down.lock().unwrap().remove(&service.name);
        }
        Ok(())
    }

    async fn resource_usage(&self, _service: &ManagedService) -> Result<ResourceMetrics, ServiceError> {
        Ok(ResourceMetrics {
            cpu_percent: 12.5,
            memory_bytes: 256 * 1024 * 1024,
            memory_limit_bytes: 1024 * 1024 * 1024,
            ..Default::default()
        })
    }

    async fn recent_logs(&self, service: &ManagedService, _lines: usize) -> Result<Vec<String>, ServiceError> {
        Ok(vec![
            format!("INFO {} ready", service.name),
            "ERROR upstream timed out".to_string(),
        ])
    }

    async fn is_privileged(&self, service: &ManagedService) -> Result<bool, ServiceError> {
        Ok(self.privileged.contains(&service.name))
    }

    async fn export_image(&self, service: &ManagedService, dest: &Path) -> Result<(), ServiceError> {
        self.record(format!("export:{}", service.name));
        fs::write(dest, format!("image of {}", service.name))
            .map_err(|e| ServiceError::ImageFailed(e.to_string()))
    }

    async fn load_image(&self, archive: &Path) -> Result<(), ServiceError> {
        let name = archive
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.record(format!("load:{}", name));
        Ok(())
    }

    async fn pull_images(&self) -> Result<(), ServiceError> {
        self.record("pull");
        Ok(())
    }

    async fn prune_images(&self) -> Result<u64, ServiceError> {
        self.record("prune");
        Ok(0)
    }
}

/// Probe that succeeds unless the service is in the failing set.
#[derive(Default)]
pub struct MockProbe {
    failing: Mutex<HashSet<String>>,
}

impl MockProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, service: &str) {
        self.failing.lock().unwrap().insert(service.to_string());
    }
}

#[async_trait]
impl LivenessProbe for MockProbe {
    async fn probe(&self, service: &ManagedService) -> ProbeResult {
        if self.failing.lock().unwrap().contains(&service.name) {
            ProbeResult {
                ok: false,
                status_code: Some(503),
                latency_ms: 1,
                error: Some("unexpected status 503 Service Unavailable".to_string()),
            }
        } else {
            ProbeResult {
                ok: true,
                status_code: Some(200),
                latency_ms: 1,
                error: None,
            }
        }
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(Severity, String)>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<(Severity, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, severity: Severity, subject: &str, _message: &str) {
        self.sent.lock().unwrap().push((severity, subject.to_string()));
    }
}

/// A temporary Archon install: live trees, env file, backup root and logs.
pub struct Fixture {
    pub dir: TempDir,
    pub controller: Arc<MockServiceController>,
    pub probe: Arc<MockProbe>,
    pub notifier: Arc<RecordingNotifier>,
    pub config: Arc<OpsConfig>,
}

pub const ENV_CONTENT: &str = "\
SUPABASE_URL=https://db.example.internal
SUPABASE_SERVICE_KEY=live-service-key
OPENAI_API_KEY=sk-live-1234
LOG_LEVEL=INFO
";

impl Fixture {
    pub fn new() -> Self {
        Self::with(|_| {}, MockServiceController::new())
    }

    /// Build a fixture, letting the caller adjust the environment map.
    pub fn with(adjust: impl FnOnce(&mut EnvMap), controller: MockServiceController) -> Self {
        // Keep test data off tmpfs: safety snapshots refuse RAM-backed storage
        let dir = tempfile::Builder::new()
            .prefix("archon-ops-")
            .tempdir_in(env!("CARGO_TARGET_TMPDIR"))
            .unwrap();
        let root = dir.path();
        let home = root.join("archon");
        let appdata = home.join("data");
        let documents = home.join("documents");
        fs::create_dir_all(appdata.join("server")).unwrap();
        fs::create_dir_all(&documents).unwrap();
        fs::write(appdata.join("server/state.db"), b"state-v1").unwrap();
        fs::write(appdata.join("settings.json"), b"{\"theme\":\"dark\"}").unwrap();
        fs::write(documents.join("guide.md"), b"# Guide v1").unwrap();
        fs::write(home.join(".env"), ENV_CONTENT).unwrap();

        let owner = current_owner(root);
        let mut map = EnvMap::new();
        for (key, value) in [
            ("ARCHON_HOME", home.display().to_string()),
            ("BACKUP_PATH", root.join("backups").display().to_string()),
            ("LOG_PATH", root.join("logs").display().to_string()),
            ("RESTORE_ALLOWED_BASES", root.display().to_string()),
            ("RESTORE_VERIFY_ATTEMPTS", "2".to_string()),
            ("RESTORE_VERIFY_INTERVAL", "0".to_string()),
            ("HEALTH_RECOVERY_WAIT", "0".to_string()),
            ("HEALTH_MIN_FREE_GB", "0".to_string()),
            ("BACKUP_INCLUDE_IMAGES", "true".to_string()),
            ("PUID", owner.0.to_string()),
            ("PGID", owner.1.to_string()),
        ] {
            map.insert(key.to_string(), value);
        }
        adjust(&mut map);

        let config = OpsConfig::from_env_map(&map).unwrap();
        config.validate().unwrap();

        Self {
            dir,
            controller: Arc::new(controller),
            probe: Arc::new(MockProbe::new()),
            notifier: Arc::new(RecordingNotifier::default()),
            config: Arc::new(config),
        }
    }

    pub fn appdata(&self) -> &Path {
        &self.config.paths.appdata
    }

    pub fn documents(&self) -> &Path {
        &self.config.paths.documents
    }

    pub fn env_file(&self) -> &Path {
        &self.config.paths.env_file
    }

    pub fn backups(&self) -> PathBuf {
        self.config.paths.backups.clone()
    }
}

#[cfg(unix)]
fn current_owner(path: &Path) -> (u32, u32) {
    use std::os::unix::fs::MetadataExt;
    let meta = fs::metadata(path).unwrap();
    (meta.uid(), meta.gid())
}

#[cfg(not(unix))]
fn current_owner(_path: &Path) -> (u32, u32) {
    (99, 100)
}

/// Fast Argon2 parameters for tests.
pub fn fast_kdf() -> archon_core::infrastructure::crypto::KdfParams {
    archon_core::infrastructure::crypto::KdfParams {
        m_cost_kib: 256,
        t_cost: 1,
        p_cost: 1,
    }
}
