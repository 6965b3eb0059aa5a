// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Safety-Rollback State Machine
//!
//! ## Transition Table
//! | From | Event | To |
//! |------|-------|----|
//! | `Idle` | snapshot completed | `SnapshotTaken` |
//! | `SnapshotTaken` | destructive step started | `Restoring` |
//! | `Restoring` | verification passed | `Verified` |
//! | `SnapshotTaken` / `Restoring` | rollback completed | `RolledBack` |
//!
//! `Verified` and `RolledBack` are terminal.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackState {
    Idle,
    SnapshotTaken,
    Restoring,
    Verified,
    RolledBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackEvent {
    SnapshotCompleted,
    DestructiveStepStarted,
    VerificationPassed,
    RollbackCompleted,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid rollback transition: {from:?} on {event:?}")]
pub struct InvalidTransition {
    pub from: RollbackState,
    pub event: RollbackEvent,
}

impl RollbackState {
    pub fn apply(self, event: RollbackEvent) -> Result<Self, InvalidTransition> {
        use RollbackEvent::*;
        use RollbackState::*;

        match (self, event) {
            (Idle, SnapshotCompleted) => Ok(SnapshotTaken),
            (SnapshotTaken, DestructiveStepStarted) => Ok(Restoring),
            (Restoring, DestructiveStepStarted) => Ok(Restoring),
            (Restoring, VerificationPassed) => Ok(Verified),
            (SnapshotTaken | Restoring, RollbackCompleted) => Ok(RolledBack),
            (from, event) => Err(InvalidTransition { from, event }),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Verified | Self::RolledBack)
    }

    /// A safety snapshot exists and must be kept until a terminal state.
    pub fn holds_snapshot(&self) -> bool {
        matches!(self, Self::SnapshotTaken | Self::Restoring)
    }
}

impl fmt::Display for RollbackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::SnapshotTaken => "snapshot-taken",
            Self::Restoring => "restoring",
            Self::Verified => "verified",
            Self::RolledBack => "rolled-back",
        };
        f.write_str(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let state = RollbackState::Idle
            .apply(RollbackEvent::SnapshotCompleted)
            .and_then(|s| s.apply(RollbackEvent::DestructiveStepStarted))
            .and_then(|s| s.apply(RollbackEvent::VerificationPassed))
            .unwrap();
        assert_eq!(state, RollbackState::Verified);
        assert!(state.is_terminal());
    }

    #[test]
    fn test_rollback_from_restoring() {
        let state = RollbackState::Restoring
            .apply(RollbackEvent::RollbackCompleted)
            .unwrap();
        assert_eq!(state, RollbackState::RolledBack);
    }

    #[test]
    fn test_cannot_restore_without_snapshot() {
        let err = RollbackState::Idle
            .apply(RollbackEvent::DestructiveStepStarted)
            .unwrap_err();
        assert_eq!(err.from, RollbackState::Idle);
    }

    #[test]
    fn test_terminal_states_reject_events() {
        assert!(RollbackState::Verified
            .apply(RollbackEvent::RollbackCompleted)
            .is_err());
        assert!(RollbackState::RolledBack
            .apply(RollbackEvent::VerificationPassed)
            .is_err());
    }
}
