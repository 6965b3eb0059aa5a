// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Tar (optionally gzip) packing and unpacking of snapshot directories.
//!
//! Archives hold a single top-level directory named after the artifact.
//! Output is written to a `.partial` file and renamed into place once the
//! encoder has been flushed, so a crashed run never leaves a truncated
//! archive under its final name.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

fn partial_path(dest: &Path) -> PathBuf {
    let mut raw = dest.as_os_str().to_os_string();
    raw.push(".partial");
    PathBuf::from(raw)
}

fn append_tree<W: Write>(builder: &mut tar::Builder<W>, src: &Path, root_name: &str) -> io::Result<()> {
    builder.follow_symlinks(false);
    builder.mode(tar::HeaderMode::Complete);
    builder.append_dir_all(root_name, src)
}

/// Pack `src` into `dest` as `<root_name>/...`, gzip-compressed when `compress`.
pub fn pack(src: &Path, dest: &Path, root_name: &str, compress: bool) -> io::Result<u64> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let partial = partial_path(dest);
    let file = BufWriter::new(fs::File::create(&partial)?);

    let result = if compress {
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        append_tree(&mut builder, src, root_name)
            .and_then(|_| builder.into_inner())
            .and_then(|encoder| encoder.finish())
            .and_then(|mut writer| writer.flush().map(|_| writer))
            .and_then(|writer| writer.into_inner().map_err(|e| e.into_error()))
            .and_then(|file| file.sync_all())
    } else {
        let mut builder = tar::Builder::new(file);
        append_tree(&mut builder, src, root_name)
            .and_then(|_| builder.into_inner())
            .and_then(|writer| writer.into_inner().map_err(|e| e.into_error()))
            .and_then(|file| file.sync_all())
    };

    if let Err(e) = result {
        let _ = fs::remove_file(&partial);
        return Err(e);
    }
    fs::rename(&partial, dest)?;
    Ok(fs::metadata(dest)?.len())
}

/// True when the file starts with the gzip magic bytes.
pub fn is_gzip(path: &Path) -> io::Result<bool> {
    let mut magic = [0u8; 2];
    let mut file = fs::File::open(path)?;
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(magic == GZIP_MAGIC),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Unpack an archive (gzip detected from content) into `dest`.
///
/// Returns the snapshot root: the single top-level directory if the archive
/// has one, otherwise `dest` itself. Entries escaping `dest` are rejected by
/// the tar reader.
pub fn unpack(archive: &Path, dest: &Path) -> io::Result<PathBuf> {
    fs::create_dir_all(dest)?;
    let reader = BufReader::new(fs::File::open(archive)?);
    let reader: Box<dyn Read> = if is_gzip(archive)? {
        Box::new(GzDecoder::new(reader))
    } else {
        Box::new(reader)
    };

    let mut tar = tar::Archive::new(reader);
    tar.set_preserve_permissions(true);
    tar.set_preserve_mtime(true);
    tar.set_overwrite(true);
    tar.unpack(dest)?;

    let mut top: Vec<PathBuf> = fs::read_dir(dest)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .collect();
    if top.len() == 1 && top[0].is_dir() {
        return Ok(top.remove(0));
    }
    Ok(dest.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree(root: &Path) {
        fs::create_dir_all(root.join("appdata/nested")).unwrap();
        fs::write(root.join("appdata/nested/db.json"), "{\"a\":1}").unwrap();
        fs::write(root.join("backup_info.json"), "{}").unwrap();
    }

    #[test]
    fn test_pack_and_unpack_compressed() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("snap");
        sample_tree(&src);

        let archive = dir.path().join("out/archon_backup_20260101_000000.tar.gz");
        pack(&src, &archive, "archon_backup_20260101_000000", true).unwrap();
        assert!(is_gzip(&archive).unwrap());
        assert!(!partial_path(&archive).exists());

        let root = unpack(&archive, &dir.path().join("scratch")).unwrap();
        assert!(root.ends_with("archon_backup_20260101_000000"));
        assert_eq!(
            fs::read_to_string(root.join("appdata/nested/db.json")).unwrap(),
            "{\"a\":1}"
        );
    }

    #[test]
    fn test_uncompressed_tar_detected() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("snap");
        sample_tree(&src);
        let archive = dir.path().join("plain.tar");
        pack(&src, &archive, "root", false).unwrap();
        assert!(!is_gzip(&archive).unwrap());
        let root = unpack(&archive, &dir.path().join("x")).unwrap();
        assert!(root.join("backup_info.json").is_file());
    }
}
