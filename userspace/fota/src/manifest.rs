// Copyright 2026 Falconboot Contributors
// SPDX-License-Identifier: Apache-2.0

//! Update manifest model and signature verification.
//!
//! The manifest is a JSON document served per device. When a publisher
//! key is configured, a detached 64-byte ed25519 signature over the raw
//! manifest bytes must verify before the document is parsed.

use bootstate::VersionTag;
use core::cmp::Ordering;
use serde::Deserialize;

use crate::error::UpdateError;

/// Upper bound on a manifest document.
pub const MAX_MANIFEST_BYTES: usize = 256 * 1024;

/// Artifact names the installer understands.
pub const ARTIFACT_BOOT: &str = "boot";
pub const ARTIFACT_ROOTFS: &str = "rootfs";

/// One downloadable artifact.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ArtifactDescriptor {
    pub name: String,
    pub url: String,
    /// Hex-encoded SHA-256 of the artifact bytes.
    pub sha256: String,
    /// Expected size in bytes.
    pub size: u64,
}

impl ArtifactDescriptor {
    /// Decodes the expected digest, rejecting malformed hex.
    pub fn digest(&self) -> Result<[u8; 32], UpdateError> {
        let raw = hex::decode(&self.sha256)
            .map_err(|_| UpdateError::Manifest(format!("{}: sha256 not hex", self.name)))?;
        raw.as_slice()
            .try_into()
            .map_err(|_| UpdateError::Manifest(format!("{}: sha256 must be 32 bytes", self.name)))
    }
}

/// Parsed update manifest.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Manifest {
    pub update_available: bool,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub artifacts: Vec<ArtifactDescriptor>,
    #[serde(default)]
    pub min_version: Option<String>,
    #[serde(default)]
    pub mandatory: bool,
}

impl Manifest {
    /// Parses and validates a manifest document.
    ///
    /// Validation happens up front so nothing downstream can fail after
    /// artifacts have already been fetched: version tag bounds, digest
    /// hex, and the presence of the boot and rootfs artifacts.
    pub fn parse(bytes: &[u8]) -> Result<Self, UpdateError> {
        if bytes.len() > MAX_MANIFEST_BYTES {
            return Err(UpdateError::Manifest(format!(
                "document too large: {} bytes (max {})",
                bytes.len(),
                MAX_MANIFEST_BYTES
            )));
        }
        let manifest: Manifest = serde_json::from_slice(bytes)
            .map_err(|err| UpdateError::Manifest(format!("bad json: {err}")))?;
        if !manifest.update_available {
            return Ok(manifest);
        }

        if manifest.version.is_empty() {
            return Err(UpdateError::Manifest("version missing".into()));
        }
        VersionTag::parse(&manifest.version)
            .map_err(|_| UpdateError::Manifest(format!("version too long: {}", manifest.version)))?;
        for artifact in &manifest.artifacts {
            artifact.digest()?;
            if artifact.url.is_empty() {
                return Err(UpdateError::Manifest(format!("{}: url missing", artifact.name)));
            }
        }
        for required in [ARTIFACT_BOOT, ARTIFACT_ROOTFS] {
            if manifest.artifact(required).is_none() {
                return Err(UpdateError::Manifest(format!("artifact {required} missing")));
            }
        }
        Ok(manifest)
    }

    pub fn artifact(&self, name: &str) -> Option<&ArtifactDescriptor> {
        self.artifacts.iter().find(|artifact| artifact.name == name)
    }
}

/// Orders dotted version strings component-wise: numeric components
/// numerically, anything else lexically, missing components as zero.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (component_a, component_b) => {
                let component_a = component_a.unwrap_or("0");
                let component_b = component_b.unwrap_or("0");
                let ordering = match (component_a.parse::<u64>(), component_b.parse::<u64>()) {
                    (Ok(numeric_a), Ok(numeric_b)) => numeric_a.cmp(&numeric_b),
                    _ => component_a.cmp(component_b),
                };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
        }
    }
}

/// Signature verification failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyError {
    InvalidSignature,
    InvalidKey,
}

/// Detached-signature backend, injectable for tests.
pub trait SignatureVerifier {
    fn verify_ed25519(
        &self,
        public_key: &[u8; 32],
        message: &[u8],
        signature: &[u8; 64],
    ) -> Result<(), VerifyError>;
}

/// ed25519-dalek backed verifier.
pub struct Ed25519Verifier;

impl SignatureVerifier for Ed25519Verifier {
    fn verify_ed25519(
        &self,
        public_key: &[u8; 32],
        message: &[u8],
        signature: &[u8; 64],
    ) -> Result<(), VerifyError> {
        use ed25519_dalek::{Signature, Verifier, VerifyingKey};

        let key = VerifyingKey::from_bytes(public_key).map_err(|_| VerifyError::InvalidKey)?;
        let sig = Signature::from_bytes(signature);
        key.verify(message, &sig).map_err(|_| VerifyError::InvalidSignature)
    }
}

/// Checks a detached manifest signature over the raw document bytes.
pub fn verify_manifest_signature(
    verifier: &dyn SignatureVerifier,
    public_key: &[u8; 32],
    body: &[u8],
    signature: &[u8],
) -> Result<(), UpdateError> {
    let signature: &[u8; 64] = signature
        .try_into()
        .map_err(|_| UpdateError::Manifest("signature must be 64 bytes".into()))?;
    verifier
        .verify_ed25519(public_key, body, signature)
        .map_err(|err| match err {
            VerifyError::InvalidKey => UpdateError::Manifest("publisher key invalid".into()),
            VerifyError::InvalidSignature => {
                UpdateError::Manifest("signature verify failed".into())
            }
        })
}
