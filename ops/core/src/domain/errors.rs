// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Operations Error Taxonomy
//!
//! Every failure a backup, restore or health run can end in. Integrity and
//! path-safety variants are always raised before a destructive step.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Shared error type for the application services

use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::domain::config::ConfigError;
use crate::domain::path_guard::PathGuardError;
use crate::domain::service::ServiceError;

#[derive(Debug, Error)]
pub enum OpsError {
    #[error(
        "Insufficient storage at {}: {} required, {} available",
        path.display(),
        crate::domain::format_bytes(*required),
        crate::domain::format_bytes(*available)
    )]
    InsufficientStorage {
        path: PathBuf,
        required: u64,
        available: u64,
    },

    #[error("Integrity check failed for {artifact}: expected {expected}, computed {actual}")]
    IntegrityCheckFailed {
        artifact: String,
        expected: String,
        actual: String,
    },

    #[error("Refusing to modify {}: {reason}", path.display())]
    UnsafeTargetPath { path: PathBuf, reason: String },

    #[error("No backup found: {0}")]
    NoBackupFound(String),

    #[error("Service {service} failed to start: {reason}")]
    ServiceStartFailed { service: String, reason: String },

    #[error("Service verification failed: {0}")]
    ServiceVerificationFailed(String),

    #[error("Recovery failed for {service} after {attempts} attempt(s)")]
    RecoveryFailed { service: String, attempts: u32 },

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error(
        "A previous restore was interrupted; safety snapshot pending at {}. Run `archon-ops restore --rollback` first",
        .0.display()
    )]
    PendingRollback(PathBuf),

    #[error("Rollback failed, safety snapshot retained at {}: {reason}", snapshot.display())]
    RollbackFailed { snapshot: PathBuf, reason: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl OpsError {
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Errors that must stop a run before anything is deleted or stopped.
    pub fn is_pre_destructive_guard(&self) -> bool {
        matches!(
            self,
            Self::IntegrityCheckFailed { .. }
                | Self::UnsafeTargetPath { .. }
                | Self::NoBackupFound(_)
                | Self::DecryptionFailed(_)
                | Self::PendingRollback(_)
                | Self::InsufficientStorage { .. }
        )
    }
}

impl From<PathGuardError> for OpsError {
    fn from(err: PathGuardError) -> Self {
        let path = err.path().to_path_buf();
        Self::UnsafeTargetPath {
            path,
            reason: err.to_string(),
        }
    }
}

pub type OpsResult<T> = Result<T, OpsError>;
