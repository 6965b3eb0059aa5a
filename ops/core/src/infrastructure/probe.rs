// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! HTTP liveness probe.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::domain::health::{LivenessProbe, ProbeResult};
use crate::domain::service::ManagedService;

pub struct HttpLivenessProbe {
    client: Client,
    host: String,
}

impl HttpLivenessProbe {
    pub fn new(host: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            host: host.into(),
        })
    }
}

#[async_trait]
impl LivenessProbe for HttpLivenessProbe {
    async fn probe(&self, service: &ManagedService) -> ProbeResult {
        let url = service.liveness_url(&self.host);
        let started = Instant::now();

        match self.client.get(&url).send().await {
            Ok(response) => {
                let status = response.status();
                let latency_ms = started.elapsed().as_millis() as u64;
                let ok = status == StatusCode::OK || status == StatusCode::NO_CONTENT;
                debug!(service = %service.name, %url, status = status.as_u16(), latency_ms, "Liveness probe");
                ProbeResult {
                    ok,
                    status_code: Some(status.as_u16()),
                    latency_ms,
                    error: (!ok).then(|| format!("unexpected status {}", status)),
                }
            }
            Err(e) => {
                let reason = if e.is_timeout() {
                    "timed out".to_string()
                } else if e.is_connect() {
                    "connection refused".to_string()
                } else {
                    e.to_string()
                };
                debug!(service = %service.name, %url, %reason, "Liveness probe failed");
                ProbeResult {
                    latency_ms: started.elapsed().as_millis() as u64,
                    ..ProbeResult::failed(reason)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service_on(server: &mockito::ServerGuard, path: &str) -> ManagedService {
        ManagedService::new("archon-server", server.socket_address().port(), path)
    }

    #[tokio::test]
    async fn test_200_and_204_are_live() {
        let mut server = mockito::Server::new_async().await;
        let _health = server.mock("GET", "/health").with_status(200).create_async().await;
        let _root = server.mock("GET", "/").with_status(204).create_async().await;

        let probe = HttpLivenessProbe::new("127.0.0.1", Duration::from_secs(2)).unwrap();
        assert!(probe.probe(&service_on(&server, "/health")).await.ok);
        let result = probe.probe(&service_on(&server, "/")).await;
        assert!(result.ok);
        assert_eq!(result.status_code, Some(204));
    }

    #[tokio::test]
    async fn test_other_statuses_fail() {
        let mut server = mockito::Server::new_async().await;
        let _m = server.mock("GET", "/health").with_status(503).create_async().await;

        let probe = HttpLivenessProbe::new("127.0.0.1", Duration::from_secs(2)).unwrap();
        let result = probe.probe(&service_on(&server, "/health")).await;
        assert!(!result.ok);
        assert_eq!(result.status_code, Some(503));
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn test_unreachable_port_fails() {
        let probe = HttpLivenessProbe::new("127.0.0.1", Duration::from_millis(500)).unwrap();
        let service = ManagedService::new("archon-mcp", 1, "/health");
        let result = probe.probe(&service).await;
        assert!(!result.ok);
        assert!(result.status_code.is_none());
    }
}
