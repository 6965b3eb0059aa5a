// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Health check domain types and the liveness probe port.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Structured, machine-readable health report

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::domain::service::{ContainerState, ManagedService, ResourceMetrics, ServiceState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckMode {
    Quick,
    Comprehensive,
    Monitor,
    Report,
}

impl FromStr for CheckMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "quick" => Ok(Self::Quick),
            "comprehensive" | "full" => Ok(Self::Comprehensive),
            "monitor" => Ok(Self::Monitor),
            "report" => Ok(Self::Report),
            other => Err(format!(
                "Unknown health check mode '{}'. Supported: quick, comprehensive, monitor, report",
                other
            )),
        }
    }
}

impl fmt::Display for CheckMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Quick => "quick",
            Self::Comprehensive => "comprehensive",
            Self::Monitor => "monitor",
            Self::Report => "report",
        };
        f.write_str(label)
    }
}

/// Outcome of a single liveness request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProbeResult {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            status_code: None,
            latency_ms: 0,
            error: Some(error.into()),
        }
    }
}

/// Liveness endpoint probe. Only HTTP 200 and 204 count as ready.
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    async fn probe(&self, service: &ManagedService) -> ProbeResult;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    /// Container running but liveness failed
    Unhealthy,
    /// Container not running
    Down,
    /// Failed initially, healthy after a recovery action
    Recovered,
    RecoveryFailed,
}

impl HealthStatus {
    pub fn is_passing(&self) -> bool {
        matches!(self, Self::Healthy | Self::Recovered)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Down => "down",
            Self::Recovered => "recovered",
            Self::RecoveryFailed => "recovery failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryAction {
    Restart,
    Recreate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryRecord {
    pub action: RecoveryAction,
    pub attempt: u32,
    pub healthy_after: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub service: String,
    pub port: u16,
    pub container: ContainerState,
    pub state: ServiceState,
    pub probe: ProbeResult,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<ResourceMetrics>,
    /// Error-level lines found in recent log output
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_errors: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recovery: Vec<RecoveryRecord>,
}

impl ServiceHealth {
    pub fn is_passing(&self) -> bool {
        self.status.is_passing()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskUsage {
    pub label: String,
    pub path: PathBuf,
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub min_free_bytes: u64,
    pub ok: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub mode: CheckMode,
    pub generated_at: DateTime<Utc>,
    pub host: String,
    pub services: Vec<ServiceHealth>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disks: Vec<DiskUsage>,
}

impl HealthReport {
    pub fn failing_services(&self) -> Vec<&ServiceHealth> {
        self.services.iter().filter(|s| !s.is_passing()).collect()
    }

    pub fn low_disks(&self) -> Vec<&DiskUsage> {
        self.disks.iter().filter(|d| !d.ok).collect()
    }

    pub fn is_healthy(&self) -> bool {
        self.failing_services().is_empty() && self.low_disks().is_empty()
    }
}
