// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Managed services and the controller seam used to drive them.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Service identity, lifecycle state and the `ServiceController` port

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use thiserror::Error;

/// One of the long-running processes of the stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedService {
    /// Compose service name (e.g. "archon-server")
    pub name: String,
    /// Container name as reported by the engine
    pub container: String,
    /// Host port the liveness endpoint listens on
    pub port: u16,
    /// Liveness path, e.g. "/health"
    pub health_path: String,
}

impl ManagedService {
    pub fn new(name: &str, port: u16, health_path: &str) -> Self {
        Self {
            name: name.to_string(),
            container: name.to_string(),
            port,
            health_path: health_path.to_string(),
        }
    }

    pub fn liveness_url(&self, host: &str) -> String {
        let path = if self.health_path.starts_with('/') {
            self.health_path.clone()
        } else {
            format!("/{}", self.health_path)
        };
        format!("http://{}:{}{}", host, self.port, path)
    }
}

impl fmt::Display for ManagedService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Raw container state as reported by the container engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    NotFound,
    Created,
    Running,
    Paused,
    Restarting,
    Exited,
    Dead,
    Unknown,
}

impl ContainerState {
    pub fn parse(status: &str) -> Self {
        match status.to_ascii_lowercase().as_str() {
            "created" => Self::Created,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "restarting" => Self::Restarting,
            "exited" | "removing" => Self::Exited,
            "dead" => Self::Dead,
            _ => Self::Unknown,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

/// Lifecycle state of a managed service, combining container state and liveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceState {
    Unknown,
    Stopped,
    Starting,
    RunningUnhealthy,
    RunningHealthy,
}

impl ServiceState {
    pub fn observe(container: ContainerState, live: bool) -> Self {
        match container {
            ContainerState::Running if live => Self::RunningHealthy,
            ContainerState::Running => Self::RunningUnhealthy,
            ContainerState::Created | ContainerState::Restarting => Self::Starting,
            ContainerState::NotFound
            | ContainerState::Exited
            | ContainerState::Dead
            | ContainerState::Paused => Self::Stopped,
            ContainerState::Unknown => Self::Unknown,
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::RunningHealthy)
    }
}

/// Point-in-time resource usage of a service container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceMetrics {
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub memory_limit_bytes: u64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
    pub block_read_bytes: u64,
    pub block_write_bytes: u64,
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Container engine unavailable: {0}")]
    EngineUnavailable(String),
    #[error("Failed to stop services: {0}")]
    StopFailed(String),
    #[error("Failed to start services: {0}")]
    StartFailed(String),
    #[error("Failed to restart {service}: {reason}")]
    RestartFailed { service: String, reason: String },
    #[error("Failed to recreate {service}: {reason}")]
    RecreateFailed { service: String, reason: String },
    #[error("Failed to inspect {service}: {reason}")]
    InspectFailed { service: String, reason: String },
    #[error("Image operation failed: {0}")]
    ImageFailed(String),
}

/// Port to the external orchestration tool that owns the four services.
///
/// Stop/start act on the stack as a unit; the per-service calls exist for
/// health recovery and inspection.
#[async_trait]
pub trait ServiceController: Send + Sync {
    async fn stop_all(&self) -> Result<(), ServiceError>;
    async fn start_all(&self) -> Result<(), ServiceError>;
    async fn container_state(&self, service: &ManagedService) -> Result<ContainerState, ServiceError>;
    async fn restart(&self, service: &ManagedService) -> Result<(), ServiceError>;
    async fn recreate(&self, service: &ManagedService) -> Result<(), ServiceError>;
    async fn resource_usage(&self, service: &ManagedService) -> Result<ResourceMetrics, ServiceError>;
    async fn recent_logs(&self, service: &ManagedService, lines: usize) -> Result<Vec<String>, ServiceError>;
    async fn is_privileged(&self, service: &ManagedService) -> Result<bool, ServiceError>;
    async fn export_image(&self, service: &ManagedService, dest: &Path) -> Result<(), ServiceError>;
    async fn load_image(&self, archive: &Path) -> Result<(), ServiceError>;
    async fn pull_images(&self) -> Result<(), ServiceError>;
    /// Remove dangling images, returning reclaimed bytes.
    async fn prune_images(&self) -> Result<u64, ServiceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_liveness_url_normalizes_path() {
        let svc = ManagedService::new("archon-server", 8181, "health");
        assert_eq!(svc.liveness_url("localhost"), "http://localhost:8181/health");
    }

    #[test]
    fn test_state_observation() {
        assert_eq!(
            ServiceState::observe(ContainerState::Running, true),
            ServiceState::RunningHealthy
        );
        assert_eq!(
            ServiceState::observe(ContainerState::Running, false),
            ServiceState::RunningUnhealthy
        );
        assert_eq!(
            ServiceState::observe(ContainerState::Exited, false),
            ServiceState::Stopped
        );
        assert_eq!(ContainerState::parse("RUNNING"), ContainerState::Running);
    }
}
