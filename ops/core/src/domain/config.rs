// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Operations Configuration
//
// The stack is configured through a flat `.env` file plus process environment.
// This module turns that flat map into one typed, immutable `OpsConfig` that is
// built once at process start and passed by reference to every component:
// - Data locations (app-state, documents, backup storage, logs)
// - Backup retention and archive pipeline toggles
// - Restore safety allow-list and preserved files
// - Health probing and recovery budget
// - Notification channels
// - The four managed services

use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::domain::service::ManagedService;

/// Flat key/value view of the environment file and process environment.
pub type EnvMap = BTreeMap<String, String>;

/// Key-name fragments that mark a value as a credential.
pub const SENSITIVE_KEY_MARKERS: &[&str] = &["KEY", "TOKEN", "PASSWORD", "SECRET", "CREDENTIAL"];

/// True when an environment key carries a credential and must not leave the host.
pub fn is_sensitive_key(key: &str) -> bool {
    let upper = key.to_ascii_uppercase();
    SENSITIVE_KEY_MARKERS.iter().any(|marker| upper.contains(marker))
}

const DEFAULT_INSTALL_DIR: &str = "/mnt/user/appdata/archon";
const DEFAULT_BACKUP_DIR: &str = "/mnt/user/backups/archon";
const DEFAULT_NOTIFY_SCRIPT: &str = "/usr/local/emhttp/webGui/scripts/notify";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read environment file {}: {reason}", path.display())]
    EnvFile { path: PathBuf, reason: String },

    #[error("Invalid value for {key}: '{value}' (expected {expected})")]
    InvalidValue {
        key: String,
        value: String,
        expected: &'static str,
    },

    #[error("{0}")]
    Invalid(String),
}

/// Credential string that is wiped on drop and never printed.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(********)")
    }
}

impl Serialize for Secret {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("********")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OpsConfig {
    pub paths: PathsConfig,
    pub compose: ComposeConfig,
    pub backup: BackupConfig,
    pub restore: RestoreConfig,
    pub health: HealthConfig,
    pub maintenance: MaintenanceConfig,
    pub ownership: OwnershipConfig,
    pub notifications: NotificationConfig,
    pub services: Vec<ManagedService>,
    /// Environment file the configuration was read from, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PathsConfig {
    pub install_dir: PathBuf,
    pub env_file: PathBuf,
    pub appdata: PathBuf,
    pub documents: PathBuf,
    pub backups: PathBuf,
    pub logs: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComposeConfig {
    pub file: PathBuf,
    pub project: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupConfig {
    /// Artifacts older than this many days are deleted
    pub retention_days: u32,
    pub compression: bool,
    pub encryption: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<Secret>,
    /// Export service images in full backups
    pub include_images: bool,
    /// Extra free space required on top of the estimate, in percent
    pub space_margin_percent: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreConfig {
    pub allowed_bases: Vec<PathBuf>,
    /// Paths relative to the app-state tree that always survive a restore
    pub preserved_files: Vec<PathBuf>,
    pub verify_attempts: u32,
    pub verify_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthConfig {
    pub host: String,
    pub probe_timeout_secs: u64,
    pub auto_recovery: bool,
    pub recovery_attempts: u32,
    pub recovery_wait_secs: u64,
    pub monitor_interval_secs: u64,
    pub min_free_gb: u64,
    pub log_lines: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct MaintenanceConfig {
    pub auto_update: bool,
    pub log_retention_days: u32,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct OwnershipConfig {
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct NotificationConfig {
    pub enabled: bool,
    pub unraid_script: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
}

/// Typed accessors over the flat map with defaults.
struct EnvReader<'a> {
    map: &'a EnvMap,
}

impl<'a> EnvReader<'a> {
    fn raw(&self, key: &str) -> Option<&'a str> {
        self.map
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.raw(key).unwrap_or(default).to_string()
    }

    fn path(&self, key: &str, default: impl Into<PathBuf>) -> PathBuf {
        self.raw(key).map(PathBuf::from).unwrap_or_else(|| default.into())
    }

    fn flag(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.raw(key) {
            None => Ok(default),
            Some(val) => match val.to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(true),
                "false" | "0" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: val.to_string(),
                    expected: "true/false",
                }),
            },
        }
    }

    fn number<T: FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        match self.raw(key) {
            None => Ok(default),
            Some(val) => val.parse().map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value: val.to_string(),
                expected: "a non-negative integer",
            }),
        }
    }

    fn list(&self, key: &str, default: &[&str]) -> Vec<String> {
        match self.raw(key) {
            Some(val) => val
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            None => default.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl OpsConfig {
    /// Build the configuration from a flat environment map.
    pub fn from_env_map(map: &EnvMap) -> Result<Self, ConfigError> {
        let env = EnvReader { map };

        let install_dir = env.path("ARCHON_HOME", DEFAULT_INSTALL_DIR);
        let paths = PathsConfig {
            env_file: env.path("ARCHON_ENV_FILE", install_dir.join(".env")),
            appdata: env.path("APPDATA_PATH", install_dir.join("data")),
            documents: env.path("DOCUMENTS_PATH", install_dir.join("documents")),
            backups: env.path("BACKUP_PATH", DEFAULT_BACKUP_DIR),
            logs: env.path("LOG_PATH", install_dir.join("logs")),
            install_dir: install_dir.clone(),
        };

        let compose = ComposeConfig {
            file: env.path("COMPOSE_FILE", install_dir.join("docker-compose.yml")),
            project: env.string("COMPOSE_PROJECT_NAME", "archon"),
        };

        let backup = BackupConfig {
            retention_days: env.number("BACKUP_RETENTION_DAYS", 30)?,
            compression: env.flag("BACKUP_COMPRESSION", true)?,
            encryption: env.flag("BACKUP_ENCRYPTION", false)?,
            passphrase: env.raw("BACKUP_ENCRYPTION_KEY").map(Secret::new),
            include_images: env.flag("BACKUP_INCLUDE_IMAGES", true)?,
            space_margin_percent: env.number("BACKUP_SPACE_MARGIN_PERCENT", 10)?,
        };

        let restore = RestoreConfig {
            allowed_bases: env
                .list("RESTORE_ALLOWED_BASES", &["/mnt/user", "/mnt/cache"])
                .into_iter()
                .map(PathBuf::from)
                .collect(),
            preserved_files: env
                .list(
                    "RESTORE_PRESERVE_FILES",
                    &[".env", "settings.json", "credentials.json", "certs", "ssl"],
                )
                .into_iter()
                .map(PathBuf::from)
                .collect(),
            verify_attempts: env.number("RESTORE_VERIFY_ATTEMPTS", 12)?,
            verify_interval_secs: env.number("RESTORE_VERIFY_INTERVAL", 10)?,
        };

        let health = HealthConfig {
            host: env.string("SERVICE_HOST", "localhost"),
            probe_timeout_secs: env.number("HEALTH_CHECK_TIMEOUT", 5)?,
            auto_recovery: env.flag("AUTO_RECOVERY", true)?,
            recovery_attempts: env.number("HEALTH_RECOVERY_ATTEMPTS", 3)?,
            recovery_wait_secs: env.number("HEALTH_RECOVERY_WAIT", 10)?,
            monitor_interval_secs: env.number("HEALTH_MONITOR_INTERVAL", 30)?,
            min_free_gb: env.number("HEALTH_MIN_FREE_GB", 5)?,
            log_lines: env.number("HEALTH_LOG_LINES", 200)?,
        };

        let maintenance = MaintenanceConfig {
            auto_update: env.flag("AUTO_UPDATE", false)?,
            log_retention_days: env.number("LOG_RETENTION_DAYS", 14)?,
        };

        let ownership = OwnershipConfig {
            uid: env.number("PUID", 99)?,
            gid: env.number("PGID", 100)?,
        };

        let notifications = NotificationConfig {
            enabled: env.flag("NOTIFICATIONS_ENABLED", true)?,
            unraid_script: env.path("UNRAID_NOTIFY_SCRIPT", DEFAULT_NOTIFY_SCRIPT),
            webhook_url: env.raw("NOTIFY_WEBHOOK_URL").map(str::to_string),
        };

        let services = vec![
            ManagedService::new("archon-ui", env.number("ARCHON_UI_PORT", 3737)?, "/"),
            ManagedService::new("archon-server", env.number("ARCHON_SERVER_PORT", 8181)?, "/health"),
            ManagedService::new("archon-mcp", env.number("ARCHON_MCP_PORT", 8051)?, "/health"),
            ManagedService::new("archon-agents", env.number("ARCHON_AGENTS_PORT", 8052)?, "/health"),
        ];

        Ok(Self {
            paths,
            compose,
            backup,
            restore,
            health,
            maintenance,
            ownership,
            notifications,
            services,
            source: None,
        })
    }

    /// Discover the environment file using precedence order
    /// 1. ARCHON_ENV_FILE environment variable
    /// 2. ./.env (working directory)
    /// 3. /mnt/user/appdata/archon/.env (default install location)
    pub fn discover_env_file() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("ARCHON_ENV_FILE") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./.env");
        if cwd.exists() {
            return Some(cwd);
        }

        let installed = Path::new(DEFAULT_INSTALL_DIR).join(".env");
        if installed.exists() {
            return Some(installed);
        }

        None
    }

    /// Load the configuration once: env file (explicit or discovered) overlaid
    /// with the process environment.
    pub fn load(explicit: Option<PathBuf>) -> Result<Self, ConfigError> {
        let env_file = match explicit {
            Some(path) => {
                if !path.exists() {
                    return Err(ConfigError::EnvFile {
                        path,
                        reason: "file not found".to_string(),
                    });
                }
                Some(path)
            }
            None => Self::discover_env_file(),
        };

        let mut map = EnvMap::new();
        match &env_file {
            Some(path) => {
                tracing::info!("Loading configuration from {:?}", path);
                map = read_env_file(path)?;
            }
            None => {
                tracing::warn!("No environment file found in standard locations. Using defaults.");
            }
        }

        // Process environment wins over the file
        map.extend(std::env::vars());

        let mut config = Self::from_env_map(&map)?;
        if let Some(path) = env_file {
            if !map.contains_key("ARCHON_ENV_FILE") {
                config.paths.env_file = path.clone();
            }
            config.source = Some(path);
        }
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let paths = [
            ("ARCHON_HOME", &self.paths.install_dir),
            ("APPDATA_PATH", &self.paths.appdata),
            ("DOCUMENTS_PATH", &self.paths.documents),
            ("BACKUP_PATH", &self.paths.backups),
            ("LOG_PATH", &self.paths.logs),
        ];
        for (key, path) in paths {
            if !path.is_absolute() {
                return Err(ConfigError::Invalid(format!(
                    "{} must be an absolute path, got {:?}",
                    key, path
                )));
            }
        }

        for data in [&self.paths.appdata, &self.paths.documents] {
            if self.paths.backups.starts_with(data) {
                return Err(ConfigError::Invalid(format!(
                    "BACKUP_PATH {:?} must not live inside data directory {:?}",
                    self.paths.backups, data
                )));
            }
        }

        if self.backup.retention_days == 0 {
            return Err(ConfigError::Invalid(
                "BACKUP_RETENTION_DAYS must be at least 1".to_string(),
            ));
        }

        if self.restore.allowed_bases.is_empty() {
            return Err(ConfigError::Invalid(
                "RESTORE_ALLOWED_BASES cannot be empty".to_string(),
            ));
        }
        if let Some(root) = self
            .restore
            .allowed_bases
            .iter()
            .find(|b| !b.is_absolute() || b.parent().is_none())
        {
            return Err(ConfigError::Invalid(format!(
                "RESTORE_ALLOWED_BASES entry {:?} must be an absolute, non-root directory",
                root
            )));
        }

        if self.restore.preserved_files.iter().any(|p| p.is_absolute()) {
            return Err(ConfigError::Invalid(
                "RESTORE_PRESERVE_FILES entries must be relative to APPDATA_PATH".to_string(),
            ));
        }

        if self.health.recovery_attempts == 0 || self.restore.verify_attempts == 0 {
            return Err(ConfigError::Invalid(
                "Recovery and verification attempt counts must be at least 1".to_string(),
            ));
        }

        if self.health.probe_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "HEALTH_CHECK_TIMEOUT must be at least 1 second".to_string(),
            ));
        }

        let mut ports: Vec<u16> = self.services.iter().map(|s| s.port).collect();
        if ports.contains(&0) {
            return Err(ConfigError::Invalid("Service ports cannot be 0".to_string()));
        }
        ports.sort_unstable();
        ports.dedup();
        if ports.len() != self.services.len() {
            return Err(ConfigError::Invalid(
                "Service ports must be unique".to_string(),
            ));
        }

        Ok(())
    }

    /// Directories whose free space is watched by the health monitor.
    pub fn storage_paths(&self) -> Vec<(&'static str, &Path)> {
        vec![
            ("appdata", self.paths.appdata.as_path()),
            ("documents", self.paths.documents.as_path()),
            ("backups", self.paths.backups.as_path()),
        ]
    }

    pub fn service(&self, name: &str) -> Option<&ManagedService> {
        self.services.iter().find(|s| s.name == name)
    }
}

/// Parse an environment file into a map, keeping the last value for duplicate keys.
pub fn read_env_file(path: &Path) -> Result<EnvMap, ConfigError> {
    let iter = dotenvy::from_path_iter(path).map_err(|e| ConfigError::EnvFile {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let mut map = EnvMap::new();
    for item in iter {
        let (key, value) = item.map_err(|e| ConfigError::EnvFile {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        map.insert(key, value);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> EnvMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = OpsConfig::from_env_map(&EnvMap::new()).unwrap();
        assert_eq!(config.backup.retention_days, 30);
        assert!(config.backup.compression);
        assert!(!config.backup.encryption);
        assert_eq!(config.services.len(), 4);
        assert_eq!(config.paths.appdata, PathBuf::from("/mnt/user/appdata/archon/data"));
        assert_eq!(config.ownership.uid, 99);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overrides_and_lists() {
        let config = OpsConfig::from_env_map(&map(&[
            ("BACKUP_RETENTION_DAYS", "7"),
            ("BACKUP_ENCRYPTION", "yes"),
            ("BACKUP_ENCRYPTION_KEY", "hunter2"),
            ("RESTORE_ALLOWED_BASES", "/srv/data, /mnt/pool ,"),
            ("ARCHON_SERVER_PORT", "9181"),
        ]))
        .unwrap();

        assert_eq!(config.backup.retention_days, 7);
        assert!(config.backup.encryption);
        assert_eq!(config.backup.passphrase.as_ref().unwrap().expose(), "hunter2");
        assert_eq!(
            config.restore.allowed_bases,
            vec![PathBuf::from("/srv/data"), PathBuf::from("/mnt/pool")]
        );
        assert_eq!(config.service("archon-server").unwrap().port, 9181);
    }

    #[test]
    fn test_invalid_flag_rejected() {
        let result = OpsConfig::from_env_map(&map(&[("BACKUP_COMPRESSION", "maybe")]));
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_validation_rejects_backup_inside_data() {
        let config = OpsConfig::from_env_map(&map(&[
            ("APPDATA_PATH", "/mnt/user/appdata/archon/data"),
            ("BACKUP_PATH", "/mnt/user/appdata/archon/data/backups"),
        ]))
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_duplicate_ports() {
        let config = OpsConfig::from_env_map(&map(&[
            ("ARCHON_MCP_PORT", "8181"),
        ]))
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sensitive_keys() {
        assert!(is_sensitive_key("OPENAI_API_KEY"));
        assert!(is_sensitive_key("supabase_service_key"));
        assert!(is_sensitive_key("DB_PASSWORD"));
        assert!(is_sensitive_key("GITHUB_TOKEN"));
        assert!(!is_sensitive_key("SUPABASE_URL"));
        assert!(!is_sensitive_key("LOG_LEVEL"));
    }

    #[test]
    fn test_secret_redacted() {
        let secret = Secret::new("hunter2");
        assert_eq!(format!("{:?}", secret), "Secret(********)");
        assert_eq!(serde_json::to_string(&secret).unwrap(), "\"********\"");
    }

    #[test]
    fn test_read_env_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(&path, "# comment\nAPPDATA_PATH=/srv/a\nQUOTED=\"x y\"\n").unwrap();
        let parsed = read_env_file(&path).unwrap();
        assert_eq!(parsed.get("APPDATA_PATH").unwrap(), "/srv/a");
        assert_eq!(parsed.get("QUOTED").unwrap(), "x y");
    }
}
