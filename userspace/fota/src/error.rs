// Copyright 2026 Falconboot Contributors
// SPDX-License-Identifier: Apache-2.0

//! Update-cycle error taxonomy.
//!
//! Every error is local to a single cycle: the agent logs it, records it
//! for the status query, and returns to idle for the next poll. Only
//! transport errors are retried; a digest mismatch is never retried with
//! the same artifact, and local storage failures go straight to failed.

use thiserror::Error;

/// Failure of one update cycle.
#[derive(Debug, Error)]
pub enum UpdateError {
    /// Network fetch failed or timed out; retried up to a bounded count.
    #[error("transport: {0}")]
    Transport(String),

    /// Manifest malformed, signature invalid, or version constraints
    /// unsatisfiable. Not retried.
    #[error("manifest: {0}")]
    Manifest(String),

    /// Artifact digest mismatch. Aborts the cycle with no slot writes.
    #[error("integrity: {artifact}: expected {expected}, got {actual}")]
    Integrity {
        artifact: String,
        expected: String,
        actual: String,
    },

    /// Format/mount/extract/bundle write failure. The standby slot is
    /// untrustworthy until the next successful cycle.
    #[error("storage: {0}")]
    Storage(String),

    /// Boot state store unreadable; nothing past checking may run.
    #[error("boot state store unreadable")]
    StateCorrupt,

    /// Graceful shutdown between cycle steps.
    #[error("update cycle canceled")]
    Canceled,
}

impl UpdateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            UpdateError::Transport(_) => ErrorKind::Transport,
            UpdateError::Manifest(_) => ErrorKind::Manifest,
            UpdateError::Integrity { .. } => ErrorKind::Integrity,
            UpdateError::Storage(_) => ErrorKind::Storage,
            UpdateError::StateCorrupt => ErrorKind::StateCorrupt,
            UpdateError::Canceled => ErrorKind::Canceled,
        }
    }

    /// Only transport failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, UpdateError::Transport(_))
    }
}

/// Wire-friendly error class for the status query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorKind {
    Transport = 1,
    Manifest = 2,
    Integrity = 3,
    Storage = 4,
    StateCorrupt = 5,
    Canceled = 6,
}

impl ErrorKind {
    pub fn label(self) -> &'static str {
        match self {
            ErrorKind::Transport => "transport",
            ErrorKind::Manifest => "manifest",
            ErrorKind::Integrity => "integrity",
            ErrorKind::Storage => "storage",
            ErrorKind::StateCorrupt => "state-corrupt",
            ErrorKind::Canceled => "canceled",
        }
    }

    pub fn to_byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(ErrorKind::Transport),
            2 => Some(ErrorKind::Manifest),
            3 => Some(ErrorKind::Integrity),
            4 => Some(ErrorKind::Storage),
            5 => Some(ErrorKind::StateCorrupt),
            6 => Some(ErrorKind::Canceled),
            _ => None,
        }
    }
}

/// Collaborator-side failure (formatter, extractor, power control).
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ProvisionError(pub String);

impl From<ProvisionError> for UpdateError {
    fn from(err: ProvisionError) -> Self {
        UpdateError::Storage(err.0)
    }
}
