// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Archon Ops Core
//!
//! Backup, restore, safety-rollback and health monitoring for the four-service
//! Archon stack.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Domain types, application services and infrastructure adapters
//!   used by the `archon-ops` CLI

pub mod domain;
pub mod application;
pub mod infrastructure;

pub use domain::errors::{OpsError, OpsResult};
