// Copyright 2026 Falconboot Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Firmware update domain library
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable (v1.0)
//! TEST_COVERAGE: Unit tests per module + end-to-end cycles in tests/fota_host
//!
//! PUBLIC API:
//!   - Manifest / ArtifactDescriptor: update manifest model + validation
//!   - UpdateEngine: one verified update cycle against injected
//!     collaborators (UpdateTransport, SlotProvisioner, PowerControl)
//!   - HttpTransport: blocking HTTP/1.1 implementation of UpdateTransport
//!   - control: framed operator protocol (status / check / rollback /
//!     mark-success)
//!   - UpdateError / ErrorKind: cycle-local error taxonomy
//!
//! DEPENDENCIES:
//!   - serde + serde_json: manifest documents
//!   - sha2 + hex: artifact digest verification
//!   - ed25519-dalek: detached manifest signatures
//!   - thiserror: std error enums
//!
//! ADR: docs/adr/0002-update-agent.md

#![forbid(unsafe_code)]

pub mod control;
pub mod digest;
pub mod engine;
pub mod error;
pub mod manifest;
pub mod transport;

pub use engine::{
    BootImageInfo, CycleOutcome, CyclePhase, EngineConfig, PhaseCell, PowerControl,
    SlotProvisioner, UpdateEngine, UpdateTransport,
};
pub use error::{ErrorKind, ProvisionError, UpdateError};
pub use manifest::{
    compare_versions, verify_manifest_signature, ArtifactDescriptor, Ed25519Verifier, Manifest,
    SignatureVerifier, VerifyError,
};
pub use transport::HttpTransport;
