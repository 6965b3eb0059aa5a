// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for the archon-ops CLI

pub mod backup;
pub mod config;
pub mod health;
pub mod list;
pub mod maintenance;
pub mod restore;
pub mod verify;

pub use self::config::ConfigCommand;
