// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Backup Artifact Domain Types
//!
//! An artifact is one timestamped disaster-recovery unit. It can exist in up
//! to three storage forms at once (snapshot directory, compressed archive,
//! encrypted archive); all forms share the same name.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Artifact naming, storage forms, snapshot content layout

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

pub const ARTIFACT_PREFIX: &str = "archon_backup_";
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Snapshot content layout
pub const APPDATA_DIR: &str = "appdata";
pub const DOCUMENTS_DIR: &str = "documents";
pub const CONFIG_DIR: &str = "config";
pub const SANITIZED_ENV_FILE: &str = "env.sanitized";
pub const IMAGES_DIR: &str = "images";
pub const MANIFEST_FILE: &str = "backup_info.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupMode {
    Full,
    Incremental,
}

impl fmt::Display for BackupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => f.write_str("full"),
            Self::Incremental => f.write_str("incremental"),
        }
    }
}

impl FromStr for BackupMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "incremental" | "incr" => Ok(Self::Incremental),
            other => Err(format!("Unknown backup mode '{}'. Supported: full, incremental", other)),
        }
    }
}

/// Name of an artifact, `archon_backup_<YYYYmmdd_HHMMSS>`.
///
/// Names sort chronologically as plain strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArtifactName(String);

impl ArtifactName {
    pub fn from_timestamp(ts: DateTime<Utc>) -> Self {
        Self(format!("{}{}", ARTIFACT_PREFIX, ts.format(TIMESTAMP_FORMAT)))
    }

    /// Parse a name, tolerating a storage-form suffix such as `.tar.gz.enc`.
    pub fn parse(raw: &str) -> Option<Self> {
        let base = raw
            .trim()
            .trim_end_matches('/')
            .trim_end_matches(".sha256")
            .trim_end_matches(".enc")
            .trim_end_matches(".gz")
            .trim_end_matches(".tar");
        let stamp = base.strip_prefix(ARTIFACT_PREFIX)?;
        NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).ok()?;
        Some(Self(base.to_string()))
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        let stamp = self.0.strip_prefix(ARTIFACT_PREFIX)?;
        NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT)
            .ok()
            .map(|naive| Utc.from_utc_datetime(&naive))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArtifactName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageForm {
    Snapshot,
    Compressed,
    Encrypted,
}

impl fmt::Display for StorageForm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Snapshot => f.write_str("snapshot"),
            Self::Compressed => f.write_str("compressed"),
            Self::Encrypted => f.write_str("encrypted"),
        }
    }
}

/// A located artifact in one storage form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub name: ArtifactName,
    pub form: StorageForm,
    /// Snapshot directory or archive file
    pub path: PathBuf,
    /// `<path>.sha256` sidecar (may not exist)
    pub checksum_path: PathBuf,
}

impl Artifact {
    pub fn new(name: ArtifactName, form: StorageForm, path: PathBuf) -> Self {
        let mut sidecar = path.clone().into_os_string();
        sidecar.push(".sha256");
        Self {
            name,
            form,
            path,
            checksum_path: PathBuf::from(sidecar),
        }
    }

    pub fn has_checksum(&self) -> bool {
        self.checksum_path.is_file()
    }

    pub fn is_archive(&self) -> bool {
        !matches!(self.form, StorageForm::Snapshot)
    }
}

/// What the operator asked to restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactRef {
    Latest,
    Named(ArtifactName),
}

impl FromStr for ArtifactRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("latest") {
            return Ok(Self::Latest);
        }
        let file_name = std::path::Path::new(s)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(s);
        ArtifactName::parse(file_name)
            .map(Self::Named)
            .ok_or_else(|| format!("'{}' is not a backup name (expected {}<YYYYmmdd_HHMMSS> or 'latest')", s, ARTIFACT_PREFIX))
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Latest => f.write_str("latest"),
            Self::Named(name) => write!(f, "{}", name),
        }
    }
}

/// `backup_info.json` stored at the root of every snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupManifest {
    pub name: ArtifactName,
    pub mode: BackupMode,
    pub created_at: DateTime<Utc>,
    pub host: String,
    pub tool_version: String,
    pub appdata_source: PathBuf,
    pub documents_source: PathBuf,
    /// Snapshot this one was hard-linked against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_snapshot: Option<ArtifactName>,
    #[serde(default)]
    pub images: Vec<String>,
    pub copied_files: u64,
    pub linked_files: u64,
    pub total_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_from_timestamp_roundtrips_time() {
        let ts = Utc.with_ymd_and_hms(2026, 3, 14, 1, 59, 26).unwrap();
        let name = ArtifactName::from_timestamp(ts);
        assert_eq!(name.as_str(), "archon_backup_20260314_015926");
        assert_eq!(name.created_at(), Some(ts));
    }

    #[test]
    fn test_parse_strips_storage_suffix() {
        let name = ArtifactName::parse("archon_backup_20260314_015926.tar.gz.enc").unwrap();
        assert_eq!(name.as_str(), "archon_backup_20260314_015926");
        assert!(ArtifactName::parse("archon_backup_garbage").is_none());
        assert!(ArtifactName::parse("other_20260314_015926").is_none());
    }

    #[test]
    fn test_names_sort_chronologically() {
        let a = ArtifactName::parse("archon_backup_20251231_235959").unwrap();
        let b = ArtifactName::parse("archon_backup_20260101_000000").unwrap();
        assert!(a < b);
    }

    #[test]
    fn test_artifact_ref_parse() {
        assert_eq!("latest".parse::<ArtifactRef>().unwrap(), ArtifactRef::Latest);
        let named: ArtifactRef = "/mnt/user/backups/archon/compressed/archon_backup_20260314_015926.tar.gz"
            .parse()
            .unwrap();
        assert_eq!(named.to_string(), "archon_backup_20260314_015926");
        assert!("yesterday".parse::<ArtifactRef>().is_err());
    }

    #[test]
    fn test_checksum_sidecar_path() {
        let name = ArtifactName::parse("archon_backup_20260314_015926").unwrap();
        let artifact = Artifact::new(
            name,
            StorageForm::Compressed,
            PathBuf::from("/b/compressed/archon_backup_20260314_015926.tar.gz"),
        );
        assert_eq!(
            artifact.checksum_path,
            PathBuf::from("/b/compressed/archon_backup_20260314_015926.tar.gz.sha256")
        );
    }
}
