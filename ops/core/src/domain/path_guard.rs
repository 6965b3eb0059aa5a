// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Target Path Guard Domain Service
//!
//! Decides whether a live data directory may be wiped and replaced during a
//! restore. A misconfigured `APPDATA_PATH` or `DOCUMENTS_PATH` must never turn
//! into a recursive delete of `/` or of another application's share.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Path-safety validation in front of every destructive write
//!
//! # Guarantees
//! - Rejects configured paths containing `..` components
//! - Resolves symlinks before comparing, so a link into `/etc` is caught
//! - Rejects the filesystem root and non-existent targets
//! - Requires the resolved path to sit strictly below an allow-listed base

use std::path::{Component, Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathGuardError {
    #[error("path traversal component in {}", .0.display())]
    PathTraversal(PathBuf),

    #[error("{} does not exist or cannot be resolved", .0.display())]
    Missing(PathBuf),

    #[error("{} is not a directory", .0.display())]
    NotADirectory(PathBuf),

    #[error("{} resolves to the filesystem root", .0.display())]
    FilesystemRoot(PathBuf),

    #[error("{} is outside the allowed base directories [{}]", path.display(), allowed)]
    OutsideAllowList { path: PathBuf, allowed: String },
}

impl PathGuardError {
    pub fn path(&self) -> &Path {
        match self {
            Self::PathTraversal(p)
            | Self::Missing(p)
            | Self::NotADirectory(p)
            | Self::FilesystemRoot(p) => p,
            Self::OutsideAllowList { path, .. } => path,
        }
    }
}

/// Allow-list based guard for restore targets.
#[derive(Debug, Clone)]
pub struct TargetPathGuard {
    allowed_bases: Vec<PathBuf>,
}

impl TargetPathGuard {
    pub fn new(allowed_bases: impl IntoIterator<Item = PathBuf>) -> Self {
        // Bases are resolved once so that `/mnt/user` behind a symlink still matches.
        let allowed_bases = allowed_bases
            .into_iter()
            .map(|base| std::fs::canonicalize(&base).unwrap_or(base))
            .collect();
        Self { allowed_bases }
    }

    pub fn allowed_bases(&self) -> &[PathBuf] {
        &self.allowed_bases
    }

    /// Validate a live directory and return its resolved real path.
    ///
    /// # Examples
    /// ```
    /// use archon_core::domain::path_guard::TargetPathGuard;
    /// use std::path::{Path, PathBuf};
    ///
    /// let guard = TargetPathGuard::new(vec![PathBuf::from("/mnt/user")]);
    /// assert!(guard.validate(Path::new("/")).is_err());
    /// assert!(guard.validate(Path::new("/mnt/user/../etc")).is_err());
    /// ```
    pub fn validate(&self, path: &Path) -> Result<PathBuf, PathGuardError> {
        if path.components().any(|c| c == Component::ParentDir) {
            tracing::warn!(path = %path.display(), "Restore target contains '..' component");
            return Err(PathGuardError::PathTraversal(path.to_path_buf()));
        }

        let resolved = std::fs::canonicalize(path)
            .map_err(|_| PathGuardError::Missing(path.to_path_buf()))?;

        if resolved.parent().is_none() {
            tracing::warn!(path = %path.display(), "Restore target resolves to filesystem root");
            return Err(PathGuardError::FilesystemRoot(path.to_path_buf()));
        }

        if !resolved.is_dir() {
            return Err(PathGuardError::NotADirectory(resolved));
        }

        self.ensure_inside(path, resolved)
    }

    /// Validate a directory that may not exist yet, without creating it.
    ///
    /// The nearest existing ancestor is resolved and the missing components
    /// are appended, so a symlinked parent cannot point the result elsewhere.
    /// Callers must still [`validate`](Self::validate) after creating it.
    pub fn validate_prospective(&self, path: &Path) -> Result<PathBuf, PathGuardError> {
        if path.exists() {
            return self.validate(path);
        }
        if path.components().any(|c| c == Component::ParentDir) {
            tracing::warn!(path = %path.display(), "Restore target contains '..' component");
            return Err(PathGuardError::PathTraversal(path.to_path_buf()));
        }

        let mut missing = Vec::new();
        let mut existing = path;
        while !existing.exists() {
            let (Some(parent), Some(name)) = (existing.parent(), existing.file_name()) else {
                return Err(PathGuardError::Missing(path.to_path_buf()));
            };
            missing.push(name.to_os_string());
            existing = parent;
        }
        let mut resolved = std::fs::canonicalize(existing)
            .map_err(|_| PathGuardError::Missing(path.to_path_buf()))?;
        if !resolved.is_dir() {
            return Err(PathGuardError::NotADirectory(resolved));
        }
        resolved.extend(missing.iter().rev());

        self.ensure_inside(path, resolved)
    }

    fn ensure_inside(&self, path: &Path, resolved: PathBuf) -> Result<PathBuf, PathGuardError> {
        let inside = self
            .allowed_bases
            .iter()
            .any(|base| resolved.starts_with(base) && resolved != *base);

        if !inside {
            tracing::warn!(
                path = %path.display(),
                resolved = %resolved.display(),
                "Restore target outside allowed base directories"
            );
            return Err(PathGuardError::OutsideAllowList {
                path: resolved,
                allowed: self
                    .allowed_bases
                    .iter()
                    .map(|b| b.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
            });
        }

        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prospective_path_checked_without_creating_it() {
        let base = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let guard = TargetPathGuard::new(vec![base.path().to_path_buf()]);

        let inside = base.path().join("appdata/data");
        let resolved = guard.validate_prospective(&inside).unwrap();
        assert_eq!(resolved, std::fs::canonicalize(base.path()).unwrap().join("appdata/data"));
        assert!(!inside.exists());

        let escaped = outside.path().join("data");
        assert!(matches!(
            guard.validate_prospective(&escaped),
            Err(PathGuardError::OutsideAllowList { .. })
        ));
        assert!(!escaped.exists());
        assert!(matches!(
            guard.validate_prospective(base.path()),
            Err(PathGuardError::OutsideAllowList { .. })
        ));
    }

    #[test]
    fn test_accepts_path_below_base() {
        let base = tempfile::tempdir().unwrap();
        let target = base.path().join("appdata");
        std::fs::create_dir(&target).unwrap();

        let guard = TargetPathGuard::new(vec![base.path().to_path_buf()]);
        let resolved = guard.validate(&target).unwrap();
        assert_eq!(resolved, std::fs::canonicalize(&target).unwrap());
    }

    #[test]
    fn test_rejects_base_itself() {
        let base = tempfile::tempdir().unwrap();
        let guard = TargetPathGuard::new(vec![base.path().to_path_buf()]);
        let result = guard.validate(base.path());
        assert!(matches!(result, Err(PathGuardError::OutsideAllowList { .. })));
    }

    #[test]
    fn test_rejects_root() {
        let guard = TargetPathGuard::new(vec![PathBuf::from("/")]);
        assert!(matches!(
            guard.validate(Path::new("/")),
            Err(PathGuardError::FilesystemRoot(_))
        ));
    }

    #[test]
    fn test_rejects_missing_directory() {
        let base = tempfile::tempdir().unwrap();
        let guard = TargetPathGuard::new(vec![base.path().to_path_buf()]);
        let result = guard.validate(&base.path().join("nope"));
        assert!(matches!(result, Err(PathGuardError::Missing(_))));
    }

    #[test]
    fn test_rejects_parent_components() {
        let base = tempfile::tempdir().unwrap();
        let guard = TargetPathGuard::new(vec![base.path().to_path_buf()]);
        let sneaky = base.path().join("a").join("..").join("..");
        assert!(matches!(
            guard.validate(&sneaky),
            Err(PathGuardError::PathTraversal(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_rejects_symlink_escaping_base() {
        let base = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let link = base.path().join("link");
        std::os::unix::fs::symlink(outside.path(), &link).unwrap();

        let guard = TargetPathGuard::new(vec![base.path().to_path_buf()]);
        assert!(matches!(
            guard.validate(&link),
            Err(PathGuardError::OutsideAllowList { .. })
        ));
    }
}
