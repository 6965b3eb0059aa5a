// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Adapter wiring shared by the command handlers.
//!
//! The configuration is loaded once per invocation; the container engine is
//! only contacted by commands that need it, so `list`, `verify` and `config`
//! keep working when Docker is down.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use archon_core::domain::config::OpsConfig;
use archon_core::domain::health::LivenessProbe;
use archon_core::domain::notifier::Notifier;
use archon_core::domain::service::ServiceController;
use archon_core::infrastructure::compose::ComposeServiceController;
use archon_core::infrastructure::notifiers;
use archon_core::infrastructure::probe::HttpLivenessProbe;

pub struct OpsContext {
    pub config: Arc<OpsConfig>,
    pub notifier: Arc<dyn Notifier>,
}

impl OpsContext {
    /// Load and validate the configuration.
    pub fn load(env_file: Option<PathBuf>) -> Result<Self> {
        let config = OpsConfig::load(env_file).context("Failed to load configuration")?;
        config.validate().context("Configuration validation failed")?;
        let notifier = notifiers::from_config(&config.notifications);
        Ok(Self {
            config: Arc::new(config),
            notifier,
        })
    }

    pub fn controller(&self) -> Result<Arc<dyn ServiceController>> {
        let controller = ComposeServiceController::new(self.config.compose.clone())
            .context("Failed to initialize the container engine client")?;
        Ok(Arc::new(controller))
    }

    pub fn probe(&self) -> Result<Arc<dyn LivenessProbe>> {
        let probe = HttpLivenessProbe::new(
            self.config.health.host.clone(),
            Duration::from_secs(self.config.health.probe_timeout_secs),
        )
        .context("Failed to build HTTP client for liveness probes")?;
        Ok(Arc::new(probe))
    }
}
