// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Compose-backed Service Controller
//!
//! Stack-wide lifecycle (stop, start, recreate, pull) goes through the
//! `docker compose` CLI so the compose file stays the single source of truth
//! for how the services are wired. Per-container queries (state, stats, logs,
//! restart, prune) go straight to the Docker Engine API via bollard.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure Layer
//! - **Purpose:** Implements the `ServiceController` port

use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::query_parameters::{
    InspectContainerOptions, LogsOptionsBuilder, PruneImagesOptions, RestartContainerOptions,
    StatsOptionsBuilder,
};
use bollard::Docker;
use futures::StreamExt;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::domain::config::ComposeConfig;
use crate::domain::service::{
    ContainerState, ManagedService, ResourceMetrics, ServiceController, ServiceError,
};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(600);

pub struct ComposeServiceController {
    docker: Docker,
    compose: ComposeConfig,
    /// Program plus leading args: `docker compose` or `docker-compose`
    compose_cmd: (PathBuf, Vec<String>),
    docker_cli: PathBuf,
}

impl ComposeServiceController {
    pub fn new(compose: ComposeConfig) -> Result<Self, ServiceError> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| {
            ServiceError::EngineUnavailable(format!(
                "Failed to connect to Docker: {}\n\n\
                 Common causes:\n\
                 - Docker daemon not running (check: docker ps)\n\
                 - Permission denied accessing /var/run/docker.sock",
                e
            ))
        })?;

        let docker_cli = which::which("docker").map_err(|_| {
            ServiceError::EngineUnavailable("docker CLI not found in PATH".to_string())
        })?;

        // Prefer the compose plugin, fall back to the standalone binary
        let compose_cmd = match which::which("docker-compose") {
            Ok(standalone) if !plugin_available(&docker_cli) => (standalone, Vec::new()),
            _ => (docker_cli.clone(), vec!["compose".to_string()]),
        };

        Ok(Self {
            docker,
            compose,
            compose_cmd,
            docker_cli,
        })
    }

    /// Verify the Docker daemon answers.
    pub async fn healthcheck(&self) -> Result<(), ServiceError> {
        self.docker
            .ping()
            .await
            .map_err(|e| ServiceError::EngineUnavailable(format!("Cannot reach Docker daemon: {}", e)))?;
        Ok(())
    }

    async fn run(program: &Path, args: &[String]) -> Result<String, String> {
        debug!(program = %program.display(), ?args, "Running command");
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args).kill_on_drop(true);

        match tokio::time::timeout(COMMAND_TIMEOUT, cmd.output()).await {
            Ok(Ok(output)) if output.status.success() => {
                Ok(String::from_utf8_lossy(&output.stdout).to_string())
            }
            Ok(Ok(output)) => Err(format!(
                "exit code {}: {}",
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            )),
            Ok(Err(e)) => Err(format!("failed to execute {}: {}", program.display(), e)),
            Err(_) => Err(format!("{} timed out after {:?}", program.display(), COMMAND_TIMEOUT)),
        }
    }

    async fn compose(&self, args: &[&str]) -> Result<String, String> {
        let (program, lead) = &self.compose_cmd;
        let mut full: Vec<String> = lead.clone();
        full.push("-f".to_string());
        full.push(self.compose.file.display().to_string());
        full.push("-p".to_string());
        full.push(self.compose.project.clone());
        full.extend(args.iter().map(|a| a.to_string()));
        Self::run(program, &full).await
    }

    async fn docker(&self, args: &[&str]) -> Result<String, String> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        Self::run(&self.docker_cli, &args).await
    }

    async fn inspect(&self, service: &ManagedService) -> Result<Option<Value>, ServiceError> {
        match self
            .docker
            .inspect_container(&service.container, None::<InspectContainerOptions>)
            .await
        {
            Ok(response) => serde_json::to_value(&response)
                .map(Some)
                .map_err(|e| ServiceError::InspectFailed {
                    service: service.name.clone(),
                    reason: e.to_string(),
                }),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(None),
            Err(e) => Err(ServiceError::InspectFailed {
                service: service.name.clone(),
                reason: e.to_string(),
            }),
        }
    }

    async fn image_of(&self, service: &ManagedService) -> Result<String, ServiceError> {
        let inspect = self.inspect(service).await?.ok_or_else(|| {
            ServiceError::ImageFailed(format!("container {} not found", service.container))
        })?;
        inspect
            .pointer("/Config/Image")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ServiceError::ImageFailed(format!("no image recorded for {}", service.name)))
    }
}

fn plugin_available(docker_cli: &Path) -> bool {
    std::process::Command::new(docker_cli)
        .args(["compose", "version"])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn as_u64(value: &Value, pointer: &str) -> u64 {
    value.pointer(pointer).and_then(Value::as_u64).unwrap_or(0)
}

/// Convert one Engine API stats sample into resource metrics.
///
/// CPU percent uses the same formula as `docker stats`: container CPU delta
/// over system CPU delta, scaled by the number of online CPUs.
pub fn metrics_from_stats(stats: &Value) -> ResourceMetrics {
    let cpu_delta = as_u64(stats, "/cpu_stats/cpu_usage/total_usage")
        .saturating_sub(as_u64(stats, "/precpu_stats/cpu_usage/total_usage"));
    let system_delta = as_u64(stats, "/cpu_stats/system_cpu_usage")
        .saturating_sub(as_u64(stats, "/precpu_stats/system_cpu_usage"));
    let online = match as_u64(stats, "/cpu_stats/online_cpus") {
        0 => stats
            .pointer("/cpu_stats/cpu_usage/percpu_usage")
            .and_then(Value::as_array)
            .map(|a| a.len() as u64)
            .filter(|n| *n > 0)
            .unwrap_or(1),
        n => n,
    };
    let cpu_percent = if system_delta > 0 {
        cpu_delta as f64 / system_delta as f64 * online as f64 * 100.0
    } else {
        0.0
    };

    // cgroup v2 reports inactive_file, v1 reports cache
    let usage = as_u64(stats, "/memory_stats/usage");
    let reclaimable = match as_u64(stats, "/memory_stats/stats/inactive_file") {
        0 => as_u64(stats, "/memory_stats/stats/cache"),
        n => n,
    };

    let (mut rx, mut tx) = (0u64, 0u64);
    if let Some(networks) = stats.get("networks").and_then(Value::as_object) {
        for net in networks.values() {
            rx += as_u64(net, "/rx_bytes");
            tx += as_u64(net, "/tx_bytes");
        }
    }

    let (mut read, mut write) = (0u64, 0u64);
    if let Some(entries) = stats
        .pointer("/blkio_stats/io_service_bytes_recursive")
        .and_then(Value::as_array)
    {
        for entry in entries {
            let value = as_u64(entry, "/value");
            match entry.get("op").and_then(Value::as_str).map(str::to_ascii_lowercase).as_deref() {
                Some("read") => read += value,
                Some("write") => write += value,
                _ => {}
            }
        }
    }

    ResourceMetrics {
        cpu_percent,
        memory_bytes: usage.saturating_sub(reclaimable),
        memory_limit_bytes: as_u64(stats, "/memory_stats/limit"),
        network_rx_bytes: rx,
        network_tx_bytes: tx,
        block_read_bytes: read,
        block_write_bytes: write,
    }
}

#[async_trait]
impl ServiceController for ComposeServiceController {
    async fn stop_all(&self) -> Result<(), ServiceError> {
        info!(project = %self.compose.project, "Stopping services");
        self.compose(&["stop"]).await.map_err(ServiceError::StopFailed)?;
        Ok(())
    }

    async fn start_all(&self) -> Result<(), ServiceError> {
        info!(project = %self.compose.project, "Starting services");
        self.compose(&["up", "-d"]).await.map_err(ServiceError::StartFailed)?;
        Ok(())
    }

    async fn container_state(&self, service: &ManagedService) -> Result<ContainerState, ServiceError> {
        let Some(inspect) = self.inspect(service).await? else {
            return Ok(ContainerState::NotFound);
        };
        Ok(inspect
            .pointer("/State/Status")
            .and_then(Value::as_str)
            .map(ContainerState::parse)
            .unwrap_or(ContainerState::Unknown))
    }

    async fn restart(&self, service: &ManagedService) -> Result<(), ServiceError> {
        info!(service = %service.name, "Restarting container");
        self.docker
            .restart_container(&service.container, None::<RestartContainerOptions>)
            .await
            .map_err(|e| ServiceError::RestartFailed {
                service: service.name.clone(),
                reason: e.to_string(),
            })
    }

    async fn recreate(&self, service: &ManagedService) -> Result<(), ServiceError> {
        info!(service = %service.name, "Force-recreating container");
        self.compose(&["up", "-d", "--force-recreate", "--no-deps", &service.name])
            .await
            .map(|_| ())
            .map_err(|reason| ServiceError::RecreateFailed {
                service: service.name.clone(),
                reason,
            })
    }

    async fn resource_usage(&self, service: &ManagedService) -> Result<ResourceMetrics, ServiceError> {
        let options = StatsOptionsBuilder::default().stream(false).one_shot(false).build();
        let mut stream = self.docker.stats(&service.container, Some(options));
        let sample = stream
            .next()
            .await
            .ok_or_else(|| ServiceError::InspectFailed {
                service: service.name.clone(),
                reason: "no stats sample returned".to_string(),
            })?
            .map_err(|e| ServiceError::InspectFailed {
                service: service.name.clone(),
                reason: e.to_string(),
            })?;
        let value = serde_json::to_value(&sample).map_err(|e| ServiceError::InspectFailed {
            service: service.name.clone(),
            reason: e.to_string(),
        })?;
        Ok(metrics_from_stats(&value))
    }

    async fn recent_logs(&self, service: &ManagedService, lines: usize) -> Result<Vec<String>, ServiceError> {
        let tail = lines.to_string();
        let options = LogsOptionsBuilder::default()
            .stdout(true)
            .stderr(true)
            .tail(&tail)
            .build();
        let mut stream = self.docker.logs(&service.container, Some(options));

        let mut collected = Vec::new();
        while let Some(item) = stream.next().await {
            match item {
                Ok(output @ (LogOutput::StdOut { .. } | LogOutput::StdErr { .. } | LogOutput::Console { .. })) => {
                    collected.extend(output.to_string().lines().map(str::to_string));
                }
                Ok(_) => {}
                Err(e) => {
                    return Err(ServiceError::InspectFailed {
                        service: service.name.clone(),
                        reason: e.to_string(),
                    })
                }
            }
        }
        Ok(collected)
    }

    async fn is_privileged(&self, service: &ManagedService) -> Result<bool, ServiceError> {
        Ok(self
            .inspect(service)
            .await?
            .and_then(|v| v.pointer("/HostConfig/Privileged").and_then(Value::as_bool))
            .unwrap_or(false))
    }

    async fn export_image(&self, service: &ManagedService, dest: &Path) -> Result<(), ServiceError> {
        let image = self.image_of(service).await?;
        info!(service = %service.name, %image, dest = %dest.display(), "Exporting image");
        let dest = dest.display().to_string();
        self.docker(&["save", "-o", &dest, &image])
            .await
            .map(|_| ())
            .map_err(ServiceError::ImageFailed)
    }

    async fn load_image(&self, archive: &Path) -> Result<(), ServiceError> {
        info!(archive = %archive.display(), "Loading image");
        let archive = archive.display().to_string();
        self.docker(&["load", "-i", &archive])
            .await
            .map(|_| ())
            .map_err(ServiceError::ImageFailed)
    }

    async fn pull_images(&self) -> Result<(), ServiceError> {
        info!(project = %self.compose.project, "Pulling images");
        self.compose(&["pull"]).await.map(|_| ()).map_err(ServiceError::ImageFailed)
    }

    async fn prune_images(&self) -> Result<u64, ServiceError> {
        let response = self
            .docker
            .prune_images(None::<PruneImagesOptions>)
            .await
            .map_err(|e| ServiceError::ImageFailed(e.to_string()))?;
        let reclaimed = response.space_reclaimed.unwrap_or(0).max(0) as u64;
        if reclaimed == 0 {
            warn!("Image prune reclaimed nothing");
        }
        Ok(reclaimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_metrics_from_stats() {
        let stats = json!({
            "cpu_stats": {
                "cpu_usage": { "total_usage": 400_000_000u64 },
                "system_cpu_usage": 10_000_000_000u64,
                "online_cpus": 4
            },
            "precpu_stats": {
                "cpu_usage": { "total_usage": 200_000_000u64 },
                "system_cpu_usage": 8_000_000_000u64
            },
            "memory_stats": {
                "usage": 300u64,
                "limit": 1000u64,
                "stats": { "inactive_file": 100u64 }
            },
            "networks": {
                "eth0": { "rx_bytes": 10u64, "tx_bytes": 20u64 },
                "eth1": { "rx_bytes": 1u64, "tx_bytes": 2u64 }
            },
            "blkio_stats": {
                "io_service_bytes_recursive": [
                    { "major": 8, "minor": 0, "op": "read", "value": 4096u64 },
                    { "major": 8, "minor": 0, "op": "Write", "value": 8192u64 }
                ]
            }
        });

        let metrics = metrics_from_stats(&stats);
        assert!((metrics.cpu_percent - 40.0).abs() < 1e-9);
        assert_eq!(metrics.memory_bytes, 200);
        assert_eq!(metrics.memory_limit_bytes, 1000);
        assert_eq!(metrics.network_rx_bytes, 11);
        assert_eq!(metrics.network_tx_bytes, 22);
        assert_eq!(metrics.block_read_bytes, 4096);
        assert_eq!(metrics.block_write_bytes, 8192);
    }

    #[test]
    fn test_metrics_from_empty_sample() {
        let metrics = metrics_from_stats(&json!({}));
        assert_eq!(metrics, ResourceMetrics::default());
    }
}
