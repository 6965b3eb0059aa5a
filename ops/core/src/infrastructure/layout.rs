// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! On-disk layout of the backup root.
//!
//! ```text
//! <BACKUP_PATH>/
//!   snapshots/<name>/           snapshots/<name>.sha256
//!   compressed/<name>.tar.gz    compressed/<name>.tar.gz.sha256
//!   encrypted/<name>.tar.gz.enc encrypted/<name>.tar.gz.enc.sha256
//!   latest.json
//!   .safety/<ts>/  .safety/pending.json
//!   .scratch/
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::domain::artifact::{Artifact, ArtifactName, StorageForm};
use crate::infrastructure::pointer_store::{LatestPointerStore, SafetyPointerStore};

#[derive(Debug, Clone)]
pub struct BackupLayout {
    root: PathBuf,
}

impl BackupLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.root.join("snapshots")
    }

    pub fn compressed_dir(&self) -> PathBuf {
        self.root.join("compressed")
    }

    pub fn encrypted_dir(&self) -> PathBuf {
        self.root.join("encrypted")
    }

    pub fn safety_dir(&self) -> PathBuf {
        self.root.join(".safety")
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.root.join(".scratch")
    }

    pub fn latest(&self) -> LatestPointerStore {
        LatestPointerStore::new(self.root.join("latest.json"))
    }

    pub fn pending_safety(&self) -> SafetyPointerStore {
        SafetyPointerStore::new(self.safety_dir().join("pending.json"))
    }

    pub fn snapshot(&self, name: &ArtifactName) -> Artifact {
        Artifact::new(
            name.clone(),
            StorageForm::Snapshot,
            self.snapshots_dir().join(name.as_str()),
        )
    }

    pub fn compressed(&self, name: &ArtifactName) -> Artifact {
        Artifact::new(
            name.clone(),
            StorageForm::Compressed,
            self.compressed_dir().join(format!("{}.tar.gz", name)),
        )
    }

    /// Encrypted archive; `.tar.enc` when the plaintext was not gzip-compressed.
    pub fn encrypted(&self, name: &ArtifactName, compressed: bool) -> Artifact {
        let file = if compressed {
            format!("{}.tar.gz.enc", name)
        } else {
            format!("{}.tar.enc", name)
        };
        Artifact::new(name.clone(), StorageForm::Encrypted, self.encrypted_dir().join(file))
    }

    pub fn ensure(&self) -> io::Result<()> {
        for dir in [
            self.snapshots_dir(),
            self.compressed_dir(),
            self.encrypted_dir(),
            self.safety_dir(),
            self.scratch_dir(),
        ] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    fn scan(&self, dir: &Path, form: StorageForm) -> io::Result<Vec<Artifact>> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut found = Vec::new();
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if file_name.ends_with(".sha256")
                || file_name.ends_with(".partial")
                || file_name.ends_with(".tmp")
            {
                continue;
            }
            let is_dir = entry.file_type()?.is_dir();
            if is_dir != matches!(form, StorageForm::Snapshot) {
                continue;
            }
            if let Some(name) = ArtifactName::parse(file_name) {
                found.push(Artifact::new(name, form, path));
            }
        }
        Ok(found)
    }

    /// Every artifact in every storage form, oldest first.
    pub fn list(&self) -> io::Result<Vec<Artifact>> {
        let mut all = self.scan(&self.snapshots_dir(), StorageForm::Snapshot)?;
        all.extend(self.scan(&self.compressed_dir(), StorageForm::Compressed)?);
        all.extend(self.scan(&self.encrypted_dir(), StorageForm::Encrypted)?);
        all.sort_by(|a, b| a.name.cmp(&b.name).then(a.form.cmp(&b.form)));
        Ok(all)
    }

    /// Artifacts grouped by name, each group ordered snapshot, compressed, encrypted.
    pub fn grouped(&self) -> io::Result<BTreeMap<ArtifactName, Vec<Artifact>>> {
        let mut groups: BTreeMap<ArtifactName, Vec<Artifact>> = BTreeMap::new();
        for artifact in self.list()? {
            groups.entry(artifact.name.clone()).or_default().push(artifact);
        }
        Ok(groups)
    }

    /// All stored forms of one artifact.
    pub fn forms_of(&self, name: &ArtifactName) -> io::Result<Vec<Artifact>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|a| &a.name == name)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_ignores_sidecars_and_partials() {
        let dir = tempfile::tempdir().unwrap();
        let layout = BackupLayout::new(dir.path());
        layout.ensure().unwrap();

        let a = ArtifactName::parse("archon_backup_20260101_000000").unwrap();
        let b = ArtifactName::parse("archon_backup_20260102_000000").unwrap();
        fs::create_dir_all(layout.snapshot(&a).path).unwrap();
        fs::write(layout.snapshot(&a).checksum_path, "x").unwrap();
        fs::write(layout.compressed(&a).path, "x").unwrap();
        fs::write(layout.encrypted(&b, true).path, "x").unwrap();
        fs::write(layout.compressed_dir().join("archon_backup_20260103_000000.tar.gz.partial"), "x").unwrap();
        fs::write(layout.compressed_dir().join("notes.txt"), "x").unwrap();

        let listed = layout.list().unwrap();
        assert_eq!(listed.len(), 3);
        assert_eq!(listed[0].form, StorageForm::Snapshot);
        assert_eq!(listed[2].name, b);

        let groups = layout.grouped().unwrap();
        assert_eq!(groups.get(&a).map(Vec::len), Some(2));
        assert_eq!(layout.forms_of(&b).unwrap().len(), 1);
    }

    #[test]
    fn test_missing_root_lists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let layout = BackupLayout::new(dir.path().join("absent"));
        assert!(layout.list().unwrap().is_empty());
    }
}
