// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Terminal output helpers.

use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

use archon_core::domain::notifier::Severity;

/// Spinner shown while a long copy/archive step runs.
pub fn spinner(message: impl Into<String>) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template(" {spinner:.cyan} {msg} [{elapsed_precise}]") {
        spinner.set_style(style.tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ "));
    }
    spinner.set_message(message.into());
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}

/// Severity-classified one-line status message.
pub fn status(severity: Severity, message: &str) {
    match severity {
        Severity::Info => println!("{} {}", "ℹ".blue(), message),
        Severity::Success => println!("{}", format!("✓ {}", message).green()),
        Severity::Warning => println!("{}", format!("⚠ {}", message).yellow()),
        Severity::Error => eprintln!("{}", format!("✗ {}", message).red()),
    }
}

pub fn heading(text: &str) {
    println!("{}", text.bold());
}

/// Left-aligned `key: value` line.
pub fn field(key: &str, value: impl std::fmt::Display) {
    println!("  {:<18} {}", format!("{}:", key), value);
}
