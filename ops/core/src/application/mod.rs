// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Application services: one per operator-facing operation.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Orchestrate domain rules and infrastructure adapters into
//!   backup, restore, rollback, health and maintenance runs

pub mod archive_engine;
pub mod catalog;
pub mod health_monitor;
pub mod maintenance;
pub mod restore_engine;
pub mod retention;
pub mod rollback_coordinator;

pub use archive_engine::{ArchiveEngine, BackupOutcome};
pub use catalog::{ArtifactCatalog, ArtifactSummary};
pub use health_monitor::HealthMonitor;
pub use maintenance::{MaintenanceOutcome, MaintenanceService, MaintenanceTask};
pub use restore_engine::{RestoreEngine, RestoreOutcome, RestorePlan};
pub use rollback_coordinator::{RollbackCoordinator, RollbackReport};

use crate::domain::errors::{OpsError, OpsResult};
use crate::domain::service::{ServiceController, ServiceError};
use std::future::Future;
use std::path::PathBuf;
use tracing::error;

/// Run blocking filesystem work on the blocking pool and await it.
///
/// `path` names the location reported if the closure fails with an I/O error.
pub(crate) async fn blocking<T, F>(path: impl Into<PathBuf>, work: F) -> OpsResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> std::io::Result<T> + Send + 'static,
{
    let path = path.into();
    match tokio::task::spawn_blocking(work).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(OpsError::io(path, e)),
        Err(join) => Err(OpsError::Archive(format!("background task failed: {}", join))),
    }
}

/// Stops every managed service for the duration of a piece of work.
///
/// Services are started again whatever the work returns; the caller decides
/// what a failed restart means.
pub(crate) struct ServicePause<'a> {
    controller: &'a dyn ServiceController,
}

/// Work result plus the outcome of starting services again.
pub(crate) struct Paused<T> {
    pub work: OpsResult<T>,
    pub restart: Result<(), ServiceError>,
}

impl<'a> ServicePause<'a> {
    pub(crate) fn new(controller: &'a dyn ServiceController) -> Self {
        Self { controller }
    }

    /// Stop, run `work`, start. A failed stop restarts the stack and skips `work`.
    pub(crate) async fn run<T>(&self, work: impl Future<Output = OpsResult<T>>) -> OpsResult<Paused<T>> {
        if let Err(e) = self.controller.stop_all().await {
            if let Err(restart_err) = self.controller.start_all().await {
                error!(error = %restart_err, "Services failed to restart after stop failure");
            }
            return Err(e.into());
        }
        let work = work.await;
        let restart = self.controller.start_all().await;
        Ok(Paused { work, restart })
    }
}
