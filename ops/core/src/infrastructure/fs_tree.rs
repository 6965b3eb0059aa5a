// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Filesystem Tree Operations
//!
//! Blocking helpers for copying, hard-linking, measuring and clearing
//! directory trees. Callers in the application layer run these on the
//! blocking pool.
//!
//! **Incremental linking:** a file is considered unchanged against the base
//! snapshot when its length and modification time match; unchanged files are
//! hard-linked instead of copied, the same rule `rsync --link-dest` uses.
//! Copies keep permissions and modification time so the next incremental run
//! can link against them.

use std::ffi::CString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeStats {
    pub files: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyStats {
    pub copied_files: u64,
    pub linked_files: u64,
    pub copied_bytes: u64,
    pub linked_bytes: u64,
}

impl CopyStats {
    pub fn merge(&mut self, other: CopyStats) {
        self.copied_files += other.copied_files;
        self.linked_files += other.linked_files;
        self.copied_bytes += other.copied_bytes;
        self.linked_bytes += other.linked_bytes;
    }

    pub fn total_bytes(&self) -> u64 {
        self.copied_bytes + self.linked_bytes
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceInfo {
    pub total: u64,
    pub free: u64,
}

fn walk_error(err: walkdir::Error) -> io::Error {
    let message = err.to_string();
    err.into_io_error()
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, message))
}

/// Count files and bytes below `root`. A missing root counts as empty.
pub fn tree_size(root: &Path) -> io::Result<TreeStats> {
    let mut stats = TreeStats::default();
    if !root.exists() {
        return Ok(stats);
    }
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(walk_error)?;
        if entry.file_type().is_file() {
            stats.files += 1;
            stats.bytes += entry.metadata().map_err(walk_error)?.len();
        }
    }
    Ok(stats)
}

fn same_content_hint(a: &fs::Metadata, b: &fs::Metadata) -> bool {
    a.len() == b.len() && a.modified().ok() == b.modified().ok()
}

/// Bytes that a linked copy of `src` against `base` would actually write.
pub fn estimate_unlinked_bytes(src: &Path, base: Option<&Path>) -> io::Result<u64> {
    let Some(base) = base else {
        return Ok(tree_size(src)?.bytes);
    };
    let mut bytes = 0;
    if !src.exists() {
        return Ok(0);
    }
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(walk_error)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let meta = entry.metadata().map_err(walk_error)?;
        let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let unchanged = fs::symlink_metadata(base.join(rel))
            .map(|b| b.is_file() && same_content_hint(&meta, &b))
            .unwrap_or(false);
        if !unchanged {
            bytes += meta.len();
        }
    }
    Ok(bytes)
}

fn copy_file_preserving(src: &Path, dst: &Path, mtime: Option<SystemTime>) -> io::Result<u64> {
    let bytes = fs::copy(src, dst)?;
    if let Some(mtime) = mtime {
        let file = fs::File::options().write(true).open(dst)?;
        file.set_modified(mtime)?;
    }
    Ok(bytes)
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> io::Result<()> {
    let target = fs::read_link(src)?;
    std::os::unix::fs::symlink(target, dst)
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dst: &Path) -> io::Result<()> {
    fs::copy(src, dst).map(|_| ())
}

/// Copy `src` into `dst`, hard-linking files that are unchanged in `base`.
///
/// With `base == None` this is a plain recursive copy. `dst` is created if
/// missing; existing files in `dst` are not removed.
pub fn link_tree(src: &Path, dst: &Path, base: Option<&Path>) -> io::Result<CopyStats> {
    let mut stats = CopyStats::default();
    fs::create_dir_all(dst)?;
    if !src.exists() {
        debug!(path = %src.display(), "Source tree missing, nothing to copy");
        return Ok(stats);
    }

    for entry in WalkDir::new(src).follow_links(false).min_depth(1) {
        let entry = entry.map_err(walk_error)?;
        let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dst.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
            let perms = entry.metadata().map_err(walk_error)?.permissions();
            fs::set_permissions(&target, perms)?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        } else if file_type.is_file() {
            let meta = entry.metadata().map_err(walk_error)?;
            let linked = match base {
                Some(base) => {
                    let candidate = base.join(rel);
                    match fs::symlink_metadata(&candidate) {
                        Ok(b) if b.is_file() && same_content_hint(&meta, &b) => {
                            fs::hard_link(&candidate, &target).is_ok()
                        }
                        _ => false,
                    }
                }
                None => false,
            };
            if linked {
                stats.linked_files += 1;
                stats.linked_bytes += meta.len();
            } else {
                stats.copied_bytes += copy_file_preserving(entry.path(), &target, meta.modified().ok())?;
                stats.copied_files += 1;
            }
        } else {
            warn!(path = %entry.path().display(), "Skipping special file");
        }
    }
    Ok(stats)
}

/// Plain recursive copy.
pub fn copy_tree(src: &Path, dst: &Path) -> io::Result<CopyStats> {
    link_tree(src, dst, None)
}

/// Remove everything inside `dir`, keeping the directory itself.
pub fn clear_dir(dir: &Path) -> io::Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        remove_path(&path)?;
    }
    Ok(())
}

/// Remove a file, symlink or directory tree. Missing paths are ignored.
pub fn remove_path(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Write `contents` to `path` via a temporary sibling, fsync and rename.
///
/// An existing file keeps its permission bits.
pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    use std::io::Write;

    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;

    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    let result = (|| {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(contents)?;
        if let Ok(meta) = fs::metadata(path) {
            file.set_permissions(meta.permissions())?;
        }
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();
    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }

    // Persist the rename itself
    if let Ok(dir) = fs::File::open(parent) {
        let _ = dir.sync_all();
    }
    Ok(())
}

/// Replace the contents of `dst` with a copy of `src`.
pub fn replace_tree(src: &Path, dst: &Path) -> io::Result<CopyStats> {
    clear_dir(dst)?;
    copy_tree(src, dst)
}

fn nearest_existing(path: &Path) -> PathBuf {
    let mut current = path.to_path_buf();
    while !current.exists() {
        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => return PathBuf::from("/"),
        }
    }
    current
}

#[cfg(unix)]
fn c_path(path: &Path) -> io::Result<CString> {
    use std::os::unix::ffi::OsStrExt;
    CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

/// Total and available bytes of the filesystem holding `path` (or its nearest
/// existing ancestor). Available counts what an unprivileged writer can use.
#[cfg(unix)]
pub fn free_space(path: &Path) -> io::Result<SpaceInfo> {
    let c_path = c_path(&nearest_existing(path))?;
    // SAFETY: statvfs only writes into the zeroed struct we own.
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    let fragment = stat.f_frsize as u64;
    Ok(SpaceInfo {
        total: stat.f_blocks as u64 * fragment,
        free: stat.f_bavail as u64 * fragment,
    })
}

#[cfg(not(unix))]
pub fn free_space(_path: &Path) -> io::Result<SpaceInfo> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "free space detection requires a unix host",
    ))
}

const TMPFS_MAGIC: i64 = 0x0102_1994;
const RAMFS_MAGIC: i64 = 0x8584_58f6;

/// True when `path` lives on a RAM-backed filesystem (tmpfs/ramfs).
#[cfg(target_os = "linux")]
pub fn is_ram_backed(path: &Path) -> io::Result<bool> {
    let c_path = c_path(&nearest_existing(path))?;
    // SAFETY: statfs only writes into the zeroed struct we own.
    let mut stat: libc::statfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    #[allow(clippy::unnecessary_cast)]
    let fs_type = stat.f_type as i64;
    Ok(fs_type == TMPFS_MAGIC || fs_type == RAMFS_MAGIC)
}

#[cfg(not(target_os = "linux"))]
pub fn is_ram_backed(_path: &Path) -> io::Result<bool> {
    let _ = (TMPFS_MAGIC, RAMFS_MAGIC);
    Ok(false)
}

/// Apply ownership to every entry below `root` (symlinks are not followed).
/// Returns the number of entries changed.
#[cfg(unix)]
pub fn chown_tree(root: &Path, uid: u32, gid: u32) -> io::Result<u64> {
    let mut changed = 0;
    if !root.exists() {
        return Ok(0);
    }
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(walk_error)?;
        std::os::unix::fs::lchown(entry.path(), Some(uid), Some(gid))?;
        changed += 1;
    }
    Ok(changed)
}

#[cfg(not(unix))]
pub fn chown_tree(_root: &Path, _uid: u32, _gid: u32) -> io::Result<u64> {
    Ok(0)
}
