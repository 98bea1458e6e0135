// Copyright 2026 Falconboot Contributors
// SPDX-License-Identifier: Apache-2.0

//! Update cycle engine.
//!
//! One cycle walks Checking -> Downloading -> Verifying -> Installing ->
//! Switching. The ordering invariant: every artifact verifies before the
//! standby slot is touched, so the slot is either in its prior consistent
//! state or fully overwritten, never half-written and referenced. The
//! cancellation flag is honored at phase boundaries only, never
//! mid-artifact-write.
//!
//! Collaborators (transport, provisioner, power control) are injected so
//! the cycle runs against fakes without block devices or a network.

use std::cmp::Ordering as CmpOrdering;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use bootstate::{NvRegion, RedundantStore, Slot, VersionTag};
use falcon_boot::{FalconBundle, BUNDLE_MAX};

use crate::digest::{sha256_file, to_hex};
use crate::error::{ProvisionError, UpdateError};
use crate::manifest::{
    compare_versions, verify_manifest_signature, ArtifactDescriptor, Ed25519Verifier, Manifest,
    ARTIFACT_BOOT, ARTIFACT_ROOTFS,
};

/// Observable state of the update agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CyclePhase {
    Idle = 0,
    Checking = 1,
    Downloading = 2,
    Verifying = 3,
    Installing = 4,
    Switching = 5,
    Failed = 6,
}

impl CyclePhase {
    pub fn label(self) -> &'static str {
        match self {
            CyclePhase::Idle => "idle",
            CyclePhase::Checking => "checking",
            CyclePhase::Downloading => "downloading",
            CyclePhase::Verifying => "verifying",
            CyclePhase::Installing => "installing",
            CyclePhase::Switching => "switching",
            CyclePhase::Failed => "failed",
        }
    }

    pub fn to_byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(CyclePhase::Idle),
            1 => Some(CyclePhase::Checking),
            2 => Some(CyclePhase::Downloading),
            3 => Some(CyclePhase::Verifying),
            4 => Some(CyclePhase::Installing),
            5 => Some(CyclePhase::Switching),
            6 => Some(CyclePhase::Failed),
            _ => None,
        }
    }
}

/// Shared, lock-free phase cell for side-effect-free status queries.
#[derive(Clone)]
pub struct PhaseCell(Arc<AtomicU8>);

impl PhaseCell {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU8::new(CyclePhase::Idle as u8)))
    }

    pub fn get(&self) -> CyclePhase {
        CyclePhase::from_byte(self.0.load(Ordering::Relaxed)).unwrap_or(CyclePhase::Idle)
    }

    pub fn set(&self, phase: CyclePhase) {
        self.0.store(phase as u8, Ordering::Relaxed);
    }
}

impl Default for PhaseCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Remote side of the update protocol.
pub trait UpdateTransport {
    /// Fetches the manifest document, advertising the confirmed version
    /// and active slot of this device.
    fn fetch_manifest(&self, current_version: &str, active_slot: Slot)
        -> Result<Vec<u8>, UpdateError>;

    /// Fetches the detached signature over the raw manifest bytes.
    fn fetch_signature(&self) -> Result<Vec<u8>, UpdateError>;

    /// Downloads one artifact to `dest` with a bounded timeout.
    fn download(&self, url: &str, dest: &Path, expected_size: u64) -> Result<(), UpdateError>;
}

/// Where the provisioner placed the kernel inside the slot's boot area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootImageInfo {
    pub kernel_offset: u64,
    pub kernel_size: u32,
}

/// Standby-slot provisioning: format region, populate region, write the
/// falcon bundle. The agent is the sole writer of the standby slot.
pub trait SlotProvisioner {
    /// Clears the slot's boot area.
    fn wipe_boot(&mut self, slot: Slot) -> Result<(), ProvisionError>;

    /// Populates the boot area from a verified archive and reports where
    /// the kernel image landed.
    fn extract_boot(&mut self, slot: Slot, archive: &Path) -> Result<BootImageInfo, ProvisionError>;

    /// Recreates the slot's root filesystem.
    fn format_root(&mut self, slot: Slot) -> Result<(), ProvisionError>;

    /// Populates the root area from a verified archive.
    fn extract_root(&mut self, slot: Slot, archive: &Path) -> Result<(), ProvisionError>;

    /// Writes the slot's regenerated falcon argument bundle.
    fn write_falcon_bundle(&mut self, slot: Slot, bundle: &[u8]) -> Result<(), ProvisionError>;
}

/// Reboot coordination.
pub trait PowerControl {
    fn request_reboot(&self) -> Result<(), ProvisionError>;
}

/// Engine tunables, derived from daemon configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Download staging area; never the standby slot.
    pub scratch_dir: PathBuf,
    /// Additional attempts after a failed transfer.
    pub download_retries: u32,
    /// Manifest publisher key; signature checks are skipped when absent.
    pub publisher_key: Option<[u8; 32]>,
    /// Kernel command line per slot (root device differs).
    pub cmdline_a: String,
    pub cmdline_b: String,
}

impl EngineConfig {
    fn cmdline_for(&self, slot: Slot) -> &str {
        match slot {
            Slot::A => &self.cmdline_a,
            Slot::B => &self.cmdline_b,
        }
    }
}

/// Result of a completed cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing to do; no state was changed.
    NoUpdate,
    /// Standby slot installed and staged; a reboot was requested.
    Staged { version: String, slot: Slot },
}

/// Drives one update cycle at a time against injected collaborators.
pub struct UpdateEngine<T, P, C> {
    transport: T,
    provisioner: P,
    power: C,
    config: EngineConfig,
    phase: PhaseCell,
}

impl<T, P, C> UpdateEngine<T, P, C>
where
    T: UpdateTransport,
    P: SlotProvisioner,
    C: PowerControl,
{
    pub fn new(transport: T, provisioner: P, power: C, config: EngineConfig) -> Self {
        Self { transport, provisioner, power, config, phase: PhaseCell::new() }
    }

    /// Shared handle for status reporting.
    pub fn phase_cell(&self) -> PhaseCell {
        self.phase.clone()
    }

    /// Runs one full cycle. Errors leave the phase at `Failed` for the
    /// caller to record; scratch files are removed on every exit path.
    pub fn run_cycle<N: NvRegion>(
        &mut self,
        store: &mut RedundantStore<N>,
        cancel: &AtomicBool,
    ) -> Result<CycleOutcome, UpdateError> {
        let result = self.cycle_inner(store, cancel);
        self.cleanup_scratch();
        match result {
            Ok(_) => self.phase.set(CyclePhase::Idle),
            Err(_) => self.phase.set(CyclePhase::Failed),
        }
        result
    }

    fn cycle_inner<N: NvRegion>(
        &mut self,
        store: &mut RedundantStore<N>,
        cancel: &AtomicBool,
    ) -> Result<CycleOutcome, UpdateError> {
        self.phase.set(CyclePhase::Checking);
        let mut state = store.read().map_err(|_| UpdateError::StateCorrupt)?;
        let current = state.confirmed_version;

        let body = self.transport.fetch_manifest(current.as_str(), state.active_slot)?;
        if let Some(key) = self.config.publisher_key {
            let signature = self.transport.fetch_signature()?;
            verify_manifest_signature(&Ed25519Verifier, &key, &body, &signature)?;
        }
        let manifest = Manifest::parse(&body)?;
        if !manifest.update_available {
            log::debug!("fota: no update available (current {current})");
            return Ok(CycleOutcome::NoUpdate);
        }
        if compare_versions(&manifest.version, current.as_str()) == CmpOrdering::Equal {
            log::debug!("fota: already on {}", manifest.version);
            return Ok(CycleOutcome::NoUpdate);
        }
        if let Some(min) = &manifest.min_version {
            if compare_versions(current.as_str(), min) == CmpOrdering::Less {
                return Err(UpdateError::Manifest(format!(
                    "current version {current} below min_version {min}"
                )));
            }
        }
        let boot = self.required_artifact(&manifest, ARTIFACT_BOOT)?;
        let rootfs = self.required_artifact(&manifest, ARTIFACT_ROOTFS)?;
        let target = state.standby_slot();
        log::info!(
            "fota: {}update {} -> {} for standby slot {target}",
            if manifest.mandatory { "mandatory " } else { "" },
            current,
            manifest.version
        );

        checkpoint(cancel)?;
        self.phase.set(CyclePhase::Downloading);
        fs::create_dir_all(&self.config.scratch_dir)
            .map_err(|err| UpdateError::Storage(format!("scratch dir: {err}")))?;
        let boot_path = self.download_artifact(&boot)?;
        let rootfs_path = self.download_artifact(&rootfs)?;

        checkpoint(cancel)?;
        self.phase.set(CyclePhase::Verifying);
        self.verify_artifact(&boot, &boot_path)?;
        self.verify_artifact(&rootfs, &rootfs_path)?;

        checkpoint(cancel)?;
        self.phase.set(CyclePhase::Installing);
        self.provisioner.wipe_boot(target)?;
        let image = self.provisioner.extract_boot(target, &boot_path)?;
        self.provisioner.format_root(target)?;
        self.provisioner.extract_root(target, &rootfs_path)?;

        checkpoint(cancel)?;
        self.phase.set(CyclePhase::Switching);
        let version_tag = VersionTag::parse(&manifest.version)
            .map_err(|_| UpdateError::Manifest(format!("version too long: {}", manifest.version)))?;
        let bundle = FalconBundle::new(
            target,
            image.kernel_offset,
            image.kernel_size,
            self.config.cmdline_for(target),
        )
        .map_err(|err| UpdateError::Storage(format!("falcon bundle: {err}")))?;
        let mut encoded = [0u8; BUNDLE_MAX];
        let len = bundle.encode(&mut encoded);
        self.provisioner.write_falcon_bundle(target, &encoded[..len])?;

        state.set_pending_switch(target, version_tag);
        store
            .write(&state)
            .map_err(|err| UpdateError::Storage(format!("boot state: {err}")))?;
        log::info!("fota: slot {target} staged, pending switch recorded");

        if let Err(err) = self.power.request_reboot() {
            // The pending switch is durable; the next natural reboot
            // still adopts it.
            log::warn!("fota: reboot request failed: {err}");
        }
        Ok(CycleOutcome::Staged { version: manifest.version.clone(), slot: target })
    }

    fn required_artifact(
        &self,
        manifest: &Manifest,
        name: &str,
    ) -> Result<ArtifactDescriptor, UpdateError> {
        manifest
            .artifact(name)
            .cloned()
            .ok_or_else(|| UpdateError::Manifest(format!("artifact {name} missing")))
    }

    fn download_artifact(&self, artifact: &ArtifactDescriptor) -> Result<PathBuf, UpdateError> {
        let dest = self.config.scratch_dir.join(format!("{}.tar", artifact.name));
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.try_download(artifact, &dest) {
                Ok(()) => return Ok(dest),
                Err(err) => {
                    // Partial transfers never survive a failure.
                    let _ = fs::remove_file(&dest);
                    if !err.is_retryable() || attempt > self.config.download_retries {
                        return Err(err);
                    }
                    log::warn!(
                        "fota: download {} attempt {attempt} failed: {err}",
                        artifact.name
                    );
                }
            }
        }
    }

    fn try_download(&self, artifact: &ArtifactDescriptor, dest: &Path) -> Result<(), UpdateError> {
        self.transport.download(&artifact.url, dest, artifact.size)?;
        let actual = fs::metadata(dest)
            .map_err(|err| UpdateError::Transport(format!("{}: {err}", artifact.name)))?
            .len();
        if actual != artifact.size {
            return Err(UpdateError::Transport(format!(
                "{}: size mismatch: expected {}, got {actual}",
                artifact.name, artifact.size
            )));
        }
        Ok(())
    }

    fn verify_artifact(
        &self,
        artifact: &ArtifactDescriptor,
        path: &Path,
    ) -> Result<(), UpdateError> {
        let expected = artifact.digest()?;
        let actual = sha256_file(path)
            .map_err(|err| UpdateError::Storage(format!("read {}: {err}", artifact.name)))?;
        if actual != expected {
            return Err(UpdateError::Integrity {
                artifact: artifact.name.clone(),
                expected: to_hex(&expected),
                actual: to_hex(&actual),
            });
        }
        log::debug!("fota: artifact {} verified", artifact.name);
        Ok(())
    }

    fn cleanup_scratch(&self) {
        for name in [ARTIFACT_BOOT, ARTIFACT_ROOTFS] {
            let _ = fs::remove_file(self.config.scratch_dir.join(format!("{name}.tar")));
        }
    }
}

fn checkpoint(cancel: &AtomicBool) -> Result<(), UpdateError> {
    if cancel.load(Ordering::Relaxed) {
        Err(UpdateError::Canceled)
    } else {
        Ok(())
    }
}
