// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Infrastructure layer: filesystem, archive, crypto and container-engine adapters.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure Layer
//! - **Purpose:** Implementations of the domain ports and the blocking I/O the
//!   application services orchestrate

pub mod archive;
pub mod checksum;
pub mod compose;
pub mod crypto;
pub mod env_file;
pub mod fs_tree;
pub mod layout;
pub mod notifiers;
pub mod pointer_store;
pub mod probe;
pub mod reports;
