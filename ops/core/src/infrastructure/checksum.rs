// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! SHA-256 integrity hashes and `sha256sum`-style sidecar files.
//!
//! Archives are hashed byte for byte. Snapshot directories get a tree digest:
//! entries are visited in sorted order and each contributes its relative path,
//! its kind and its content, so renames and permission-free edits are caught.

use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;
use walkdir::WalkDir;

use crate::domain::artifact::{Artifact, StorageForm};
use crate::domain::errors::{OpsError, OpsResult};

const BUF_SIZE: usize = 64 * 1024;

fn hash_reader<R: Read>(hasher: &mut Sha256, mut reader: R) -> io::Result<u64> {
    let mut buf = vec![0u8; BUF_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            return Ok(total);
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
}

/// Hex SHA-256 of a file's bytes.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    hash_reader(&mut hasher, io::BufReader::new(file))?;
    Ok(hex::encode(hasher.finalize()))
}

/// Hex SHA-256 over a directory tree.
pub fn tree_digest(root: &Path) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .min_depth(1)
        .sort_by_file_name();

    for entry in walker {
        let entry = entry.map_err(|e| {
            let message = e.to_string();
            e.into_io_error()
                .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, message))
        })?;
        let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let rel = rel.to_string_lossy();
        let file_type = entry.file_type();

        if file_type.is_dir() {
            hasher.update(b"d\0");
            hasher.update(rel.as_bytes());
            hasher.update(b"\0");
        } else if file_type.is_symlink() {
            let target = fs::read_link(entry.path())?;
            hasher.update(b"l\0");
            hasher.update(rel.as_bytes());
            hasher.update(b"\0");
            hasher.update(target.to_string_lossy().as_bytes());
            hasher.update(b"\0");
        } else if file_type.is_file() {
            let len = entry.metadata().map(|m| m.len()).unwrap_or(0);
            hasher.update(b"f\0");
            hasher.update(rel.as_bytes());
            hasher.update(b"\0");
            hasher.update(len.to_be_bytes());
            hash_reader(&mut hasher, io::BufReader::new(fs::File::open(entry.path())?))?;
        }
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Digest of an artifact in whatever storage form it has.
pub fn artifact_digest(artifact: &Artifact) -> io::Result<String> {
    match artifact.form {
        StorageForm::Snapshot => tree_digest(&artifact.path),
        StorageForm::Compressed | StorageForm::Encrypted => sha256_file(&artifact.path),
    }
}

/// Write `<digest>  <file name>` to the sidecar.
pub fn write_sidecar(sidecar: &Path, digest: &str, subject: &Path) -> io::Result<()> {
    let name = subject
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = sidecar.with_extension("sha256.tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        writeln!(file, "{}  {}", digest, name)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, sidecar)
}

/// Read the recorded digest; `None` if the sidecar is not a valid hash line.
pub fn read_sidecar(sidecar: &Path) -> io::Result<Option<String>> {
    let content = fs::read_to_string(sidecar)?;
    let digest = content
        .split_whitespace()
        .next()
        .map(|d| d.to_ascii_lowercase())
        .filter(|d| d.len() == 64 && d.chars().all(|c| c.is_ascii_hexdigit()));
    Ok(digest)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityStatus {
    /// Sidecar present and matching
    Verified(String),
    /// No sidecar recorded; nothing to compare against
    Unrecorded,
}

/// Hash the artifact and record it next to it.
pub fn seal(artifact: &Artifact) -> OpsResult<String> {
    let digest = artifact_digest(artifact).map_err(|e| OpsError::io(&artifact.path, e))?;
    write_sidecar(&artifact.checksum_path, &digest, &artifact.path)
        .map_err(|e| OpsError::io(&artifact.checksum_path, e))?;
    Ok(digest)
}

/// Recompute an artifact's digest and compare it with its sidecar.
pub fn verify(artifact: &Artifact) -> OpsResult<IntegrityStatus> {
    if !artifact.has_checksum() {
        tracing::warn!(artifact = %artifact.name, form = %artifact.form, "No checksum recorded");
        return Ok(IntegrityStatus::Unrecorded);
    }

    let expected = read_sidecar(&artifact.checksum_path)
        .map_err(|e| OpsError::io(&artifact.checksum_path, e))?
        .ok_or_else(|| OpsError::IntegrityCheckFailed {
            artifact: artifact.name.to_string(),
            expected: "<unreadable checksum file>".to_string(),
            actual: "-".to_string(),
        })?;

    let actual = artifact_digest(artifact).map_err(|e| OpsError::io(&artifact.path, e))?;
    if actual != expected {
        tracing::error!(artifact = %artifact.name, %expected, %actual, "Checksum mismatch");
        return Err(OpsError::IntegrityCheckFailed {
            artifact: artifact.name.to_string(),
            expected,
            actual,
        });
    }
    Ok(IntegrityStatus::Verified(actual))
}
