// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! JSON pointer records persisted with write-temp, fsync, rename.
//!
//! A reader sees either the previous record or the new one, never a torn
//! write. Used for `latest.json` and `.safety/pending.json`.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use crate::domain::pointer::{LatestPointer, SafetyPointer};
use crate::infrastructure::fs_tree;

pub type LatestPointerStore = PointerStore<LatestPointer>;
pub type SafetyPointerStore = PointerStore<SafetyPointer>;

#[derive(Debug, Clone)]
pub struct PointerStore<T> {
    path: PathBuf,
    _record: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> PointerStore<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _record: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Load the record. A missing file is `Ok(None)`; a corrupt one is `InvalidData`.
    pub fn load(&self) -> io::Result<Option<T>> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    pub fn store(&self, record: &T) -> io::Result<()> {
        let mut body = serde_json::to_vec_pretty(record)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        body.push(b'\n');
        fs_tree::write_atomic(&self.path, &body)
    }

    pub fn clear(&self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::artifact::ArtifactName;
    use chrono::Utc;

    #[test]
    fn test_store_load_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = LatestPointerStore::new(dir.path().join("latest.json"));
        assert!(store.load().unwrap().is_none());

        let pointer = LatestPointer {
            name: ArtifactName::parse("archon_backup_20260101_000000").unwrap(),
            snapshot: dir.path().join("snapshots/archon_backup_20260101_000000"),
            completed_at: Utc::now(),
        };
        store.store(&pointer).unwrap();
        assert_eq!(store.load().unwrap(), Some(pointer));
        assert!(!dir.path().join("latest.json.tmp").exists());

        store.clear().unwrap();
        assert!(!store.exists());
        store.clear().unwrap();
    }

    #[test]
    fn test_corrupt_record_is_invalid_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pending.json");
        fs::write(&path, "{ not json").unwrap();
        let store = SafetyPointerStore::new(path);
        assert_eq!(store.load().unwrap_err().kind(), io::ErrorKind::InvalidData);
    }
}
