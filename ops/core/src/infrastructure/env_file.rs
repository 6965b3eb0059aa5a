// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Line-level handling of the stack's `.env` file.
//!
//! Backups never carry credentials: sanitizing drops every assignment whose
//! key looks sensitive. On restore the sanitized file is merged with the
//! credential lines of the local file so the stack keeps working.

use crate::domain::config::is_sensitive_key;

const PRESERVED_HEADER: &str = "# Credentials preserved from the pre-restore environment";

/// Key of an assignment line (`KEY=value` or `export KEY=value`).
fn assignment_key(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if trimmed.starts_with('#') {
        return None;
    }
    let body = trimmed.strip_prefix("export ").unwrap_or(trimmed);
    let (key, _) = body.split_once('=')?;
    let key = key.trim();
    if key.is_empty() || key.contains(char::is_whitespace) {
        return None;
    }
    Some(key)
}

/// Drop credential assignments, keep everything else verbatim.
pub fn sanitize(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    for line in content.lines() {
        if assignment_key(line).is_some_and(is_sensitive_key) {
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// Credential assignment lines of a local env file.
pub fn credential_lines(content: &str) -> Vec<&str> {
    content
        .lines()
        .filter(|line| assignment_key(line).is_some_and(is_sensitive_key))
        .collect()
}

/// Restored (sanitized) configuration plus the local credential lines.
///
/// A credential present in both wins from the local file.
pub fn merge(restored: &str, local: &str) -> String {
    let credentials = credential_lines(local);
    let local_keys: Vec<&str> = credentials.iter().filter_map(|l| assignment_key(l)).collect();

    let mut out = String::with_capacity(restored.len() + local.len());
    for line in restored.lines() {
        if line.trim() == PRESERVED_HEADER {
            continue;
        }
        if assignment_key(line).is_some_and(|k| local_keys.contains(&k)) {
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }

    if !credentials.is_empty() {
        if !out.is_empty() && !out.ends_with("\n\n") {
            out.push('\n');
        }
        out.push_str(PRESERVED_HEADER);
        out.push('\n');
        for line in credentials {
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}
