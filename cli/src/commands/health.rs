// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Health command
//!
//! Commands: health quick, health comprehensive, health monitor, health report

use anyhow::{bail, Context, Result};
use colored::Colorize;
use std::path::PathBuf;

use archon_core::application::HealthMonitor;
use archon_core::domain::format_bytes;
use archon_core::domain::health::{CheckMode, HealthReport, HealthStatus};
use archon_core::domain::notifier::Severity;

use crate::context::OpsContext;
use crate::output;
use crate::signals;

pub async fn handle_command(mode: CheckMode, json: bool, env_file: Option<PathBuf>) -> Result<()> {
    let ctx = OpsContext::load(env_file)?;
    let monitor = HealthMonitor::new(ctx.config.clone(), ctx.controller()?, ctx.probe()?, ctx.notifier.clone());

    if mode == CheckMode::Monitor {
        let cancel = signals::cancel_on_signal();
        monitor
            .monitor(&cancel, |report| {
                // Clear screen and home the cursor so each frame replaces the last
                print!("\x1B[2J\x1B[H");
                render(report);
                println!();
                println!("{}", "Press Ctrl+C to stop".dimmed());
            })
            .await?;
        return Ok(());
    }

    let (report, path) = monitor.check(mode).await?;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialize health report")?
        );
    } else {
        render(&report);
        if let Some(path) = path {
            println!();
            output::field("Report", path.display());
        }
    }

    if !report.is_healthy() {
        bail!(
            "health check failed: {} service(s) failing, {} disk(s) low on space",
            report.failing_services().len(),
            report.low_disks().len()
        );
    }
    Ok(())
}

fn render(report: &HealthReport) {
    output::heading(&format!(
        "Archon health ({}) on {} at {}",
        report.mode,
        report.host,
        report.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    println!();
    println!(
        "  {:<16} {:<6} {:<18} {:<8} {}",
        "SERVICE".bold(),
        "PORT".bold(),
        "STATUS".bold(),
        "LATENCY".bold(),
        "DETAIL".bold()
    );
    for service in &report.services {
        let status = match service.status {
            HealthStatus::Healthy => service.status.to_string().green(),
            HealthStatus::Recovered => service.status.to_string().cyan(),
            HealthStatus::Unhealthy => service.status.to_string().yellow(),
            HealthStatus::Down | HealthStatus::RecoveryFailed => service.status.to_string().red(),
        };
        let latency = service
            .probe
            .status_code
            .map(|_| format!("{}ms", service.probe.latency_ms))
            .unwrap_or_else(|| "-".to_string());
        let mut detail = service.probe.error.clone().unwrap_or_default();
        if let Some(metrics) = &service.metrics {
            detail = format!(
                "cpu {:.1}% mem {} net {}/{} io {}/{} {}",
                metrics.cpu_percent,
                format_bytes(metrics.memory_bytes),
                format_bytes(metrics.network_rx_bytes),
                format_bytes(metrics.network_tx_bytes),
                format_bytes(metrics.block_read_bytes),
                format_bytes(metrics.block_write_bytes),
                detail
            );
        }
        if let Some(errors) = service.log_errors.filter(|e| *e > 0) {
            detail = format!("{} log errors {}", errors, detail);
        }
        println!(
            "  {:<16} {:<6} {:<18} {:<8} {}",
            service.service,
            service.port,
            status,
            latency,
            detail.trim()
        );
        for step in &service.recovery {
            println!(
                "      {} {:?} #{} → {}",
                "↻".dimmed(),
                step.action,
                step.attempt,
                if step.healthy_after { "healthy".green() } else { "still failing".red() }
            );
        }
    }

    if !report.disks.is_empty() {
        println!();
        for disk in &report.disks {
            let line = format!(
                "{} ({}): {} free of {} (minimum {})",
                disk.label,
                disk.path.display(),
                format_bytes(disk.free_bytes),
                format_bytes(disk.total_bytes),
                format_bytes(disk.min_free_bytes)
            );
            output::status(if disk.ok { Severity::Success } else { Severity::Warning }, &line);
        }
    }

    println!();
    if report.is_healthy() {
        output::status(Severity::Success, "All services healthy");
    } else {
        output::status(
            Severity::Error,
            &format!("{} service(s) failing", report.failing_services().len()),
        );
    }
}
