// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Run reports written to the logs directory.
//!
//! `<kind>_report_<YYYYmmdd_HHMMSS>.txt` for backup, restore and maintenance
//! runs; `health_report_<ts>.json` for health checks.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::domain::artifact::TIMESTAMP_FORMAT;

/// Plain-text report assembled line by line.
#[derive(Debug, Clone)]
pub struct TextReport {
    title: String,
    generated_at: DateTime<Utc>,
    body: String,
}

impl TextReport {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            generated_at: Utc::now(),
            body: String::new(),
        }
    }

    pub fn generated_at(&self) -> DateTime<Utc> {
        self.generated_at
    }

    pub fn section(&mut self, name: &str) -> &mut Self {
        let _ = write!(self.body, "\n[{}]\n", name);
        self
    }

    pub fn field(&mut self, key: &str, value: impl std::fmt::Display) -> &mut Self {
        let _ = writeln!(self.body, "{:<22} {}", format!("{}:", key), value);
        self
    }

    pub fn line(&mut self, text: impl AsRef<str>) -> &mut Self {
        self.body.push_str(text.as_ref());
        self.body.push('\n');
        self
    }

    pub fn render(&self) -> String {
        let rule = "=".repeat(self.title.len().max(40));
        format!(
            "{}\n{}\n{}\nGenerated: {}\n{}",
            rule,
            self.title,
            rule,
            self.generated_at.to_rfc3339(),
            self.body
        )
    }
}

#[derive(Debug, Clone)]
pub struct ReportWriter {
    dir: PathBuf,
}

impl ReportWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, kind: &str, at: DateTime<Utc>, ext: &str) -> PathBuf {
        self.dir
            .join(format!("{}_report_{}.{}", kind, at.format(TIMESTAMP_FORMAT), ext))
    }

    pub fn write_text(&self, kind: &str, report: &TextReport) -> io::Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(kind, report.generated_at(), "txt");
        fs::write(&path, report.render())?;
        Ok(path)
    }

    pub fn write_json<T: Serialize>(&self, kind: &str, at: DateTime<Utc>, value: &T) -> io::Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(kind, at, "json");
        let body = serde_json::to_vec_pretty(value)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(&path, body)?;
        Ok(path)
    }
}

/// Delete regular files in `dir` (non-recursive) whose mtime is older than
/// `max_age` and whose name satisfies `matches`. Returns deleted paths.
pub fn prune_older_than(
    dir: &Path,
    max_age: Duration,
    matches: impl Fn(&str) -> bool,
) -> io::Result<Vec<PathBuf>> {
    let cutoff = SystemTime::now()
        .checked_sub(max_age)
        .unwrap_or(SystemTime::UNIX_EPOCH);
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut removed = Vec::new();
    for entry in entries {
        let entry = entry?;
        let meta = entry.metadata()?;
        if !meta.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !matches(name) {
            continue;
        }
        if meta.modified()? < cutoff {
            fs::remove_file(entry.path())?;
            removed.push(entry.path());
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_report_layout() {
        let mut report = TextReport::new("Archon Backup Report");
        report.field("Status", "SUCCESS").section("Sources").line("appdata: /x");
        let text = report.render();
        assert!(text.contains("Archon Backup Report"));
        assert!(text.contains("Status:"));
        assert!(text.contains("[Sources]"));

        let dir = tempfile::tempdir().unwrap();
        let path = ReportWriter::new(dir.path()).write_text("backup", &report).unwrap();
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("backup_report_") && name.ends_with(".txt"));
    }

    #[test]
    fn test_prune_respects_age_and_filter() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("backup_report_old.txt");
        let keep = dir.path().join("other.log");
        fs::write(&old, "x").unwrap();
        fs::write(&keep, "x").unwrap();
        let past = SystemTime::now() - Duration::from_secs(30 * 86_400);
        for p in [&old, &keep] {
            fs::File::options().write(true).open(p).unwrap().set_modified(past).unwrap();
        }

        let removed = prune_older_than(dir.path(), Duration::from_secs(86_400), |n| n.contains("_report_")).unwrap();
        assert_eq!(removed, vec![old.clone()]);
        assert!(keep.exists());
    }
}
