// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Persisted pointer records.
//!
//! The Latest Pointer and the Safety Snapshot pointer are the only mutable
//! shared state of the system. Both are small JSON records that are only
//! written after their referent is complete.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::domain::artifact::ArtifactName;

/// Reference to the newest fully written snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatestPointer {
    pub name: ArtifactName,
    pub snapshot: PathBuf,
    pub completed_at: DateTime<Utc>,
}

impl LatestPointer {
    /// A pointer is only usable while its snapshot directory still exists.
    pub fn is_valid(&self) -> bool {
        self.snapshot.is_dir()
    }
}

/// A live tree captured into the safety snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedTree {
    pub label: String,
    pub live_path: PathBuf,
    pub snapshot_path: PathBuf,
}

/// Record of the pre-restore safety snapshot, persisted before any destructive step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyPointer {
    pub created_at: DateTime<Utc>,
    pub snapshot_dir: PathBuf,
    pub restoring: String,
    pub trees: Vec<CapturedTree>,
    /// Copy of the environment file taken with the snapshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_file: Option<CapturedTree>,
    /// Live environment file location; removed on rollback when nothing was captured
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_target: Option<PathBuf>,
    /// Preserved files, relative to the app-state tree, that existed at capture time
    #[serde(default)]
    pub preserved: Vec<PathBuf>,
}
