// Copyright 2026 Falconboot Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: End-to-end update cycles against in-memory collaborators
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: 11 tests
//!
//! TEST_SCENARIOS:
//!   - test_full_cycle_stages_standby(): happy-path install + switchover
//!   - test_staged_update_survives_power_cycle(): adopt + confirm flow
//!   - test_digest_mismatch_leaves_standby_untouched(): integrity abort
//!   - test_no_update_available_changes_nothing(): idle cycle
//!   - test_same_version_changes_nothing(): already-on-version cycle
//!   - test_transport_failure_retries_then_fails(): bounded retries
//!   - test_transport_failure_recovers_within_retry_budget()
//!   - test_min_version_gate_blocks_old_device(): manifest constraint
//!   - test_signature_verification_gates_manifest(): publisher key
//!   - test_corrupt_boot_state_refuses_cycle(): state-corrupt guard
//!   - test_cancellation_stops_before_download(): step-boundary cancel

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};

use bootstate::{BootState, MemNvRegion, RedundantStore, Slot, VersionTag};
use ed25519_dalek::{Signer, SigningKey};
use falcon_boot::FalconBundle;
use fota::engine::{
    BootImageInfo, CycleOutcome, CyclePhase, EngineConfig, PowerControl, SlotProvisioner,
    UpdateEngine, UpdateTransport,
};
use fota::error::{ProvisionError, UpdateError};
use sha2::{Digest, Sha256};

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

#[derive(Default)]
struct TransportLog {
    manifest_fetches: u32,
    download_attempts: u32,
}

struct FakeTransport {
    manifest: Vec<u8>,
    signature: Option<Vec<u8>>,
    artifacts: HashMap<String, Vec<u8>>,
    /// Downloads to fail before succeeding.
    failures_remaining: RefCell<u32>,
    log: Rc<RefCell<TransportLog>>,
}

impl FakeTransport {
    fn new(manifest: Vec<u8>, artifacts: HashMap<String, Vec<u8>>) -> Self {
        Self {
            manifest,
            signature: None,
            artifacts,
            failures_remaining: RefCell::new(0),
            log: Rc::new(RefCell::new(TransportLog::default())),
        }
    }
}

impl UpdateTransport for FakeTransport {
    fn fetch_manifest(&self, _current: &str, _slot: Slot) -> Result<Vec<u8>, UpdateError> {
        self.log.borrow_mut().manifest_fetches += 1;
        Ok(self.manifest.clone())
    }

    fn fetch_signature(&self) -> Result<Vec<u8>, UpdateError> {
        self.signature
            .clone()
            .ok_or_else(|| UpdateError::Transport("signature not published".into()))
    }

    fn download(&self, url: &str, dest: &Path, _size: u64) -> Result<(), UpdateError> {
        self.log.borrow_mut().download_attempts += 1;
        let mut failures = self.failures_remaining.borrow_mut();
        if *failures > 0 {
            *failures -= 1;
            // Leave a partial file behind; the engine must discard it.
            fs::write(dest, b"partial").map_err(|err| UpdateError::Storage(err.to_string()))?;
            return Err(UpdateError::Transport("connection reset".into()));
        }
        let bytes = self
            .artifacts
            .get(url)
            .ok_or_else(|| UpdateError::Transport(format!("404 for {url}")))?;
        fs::write(dest, bytes).map_err(|err| UpdateError::Storage(err.to_string()))?;
        Ok(())
    }
}

#[derive(Default)]
struct ProvisionRecord {
    wiped_boot: Vec<Slot>,
    formatted_root: Vec<Slot>,
    boot_payload: Option<(Slot, Vec<u8>)>,
    root_payload: Option<(Slot, Vec<u8>)>,
    bundle: Option<(Slot, Vec<u8>)>,
}

impl ProvisionRecord {
    fn untouched(&self) -> bool {
        self.wiped_boot.is_empty()
            && self.formatted_root.is_empty()
            && self.boot_payload.is_none()
            && self.root_payload.is_none()
            && self.bundle.is_none()
    }
}

struct FakeProvisioner {
    record: Rc<RefCell<ProvisionRecord>>,
}

impl SlotProvisioner for FakeProvisioner {
    fn wipe_boot(&mut self, slot: Slot) -> Result<(), ProvisionError> {
        self.record.borrow_mut().wiped_boot.push(slot);
        Ok(())
    }

    fn extract_boot(&mut self, slot: Slot, archive: &Path) -> Result<BootImageInfo, ProvisionError> {
        let bytes = fs::read(archive).map_err(|err| ProvisionError(err.to_string()))?;
        let size = bytes.len() as u32;
        self.record.borrow_mut().boot_payload = Some((slot, bytes));
        Ok(BootImageInfo { kernel_offset: 0, kernel_size: size })
    }

    fn format_root(&mut self, slot: Slot) -> Result<(), ProvisionError> {
        self.record.borrow_mut().formatted_root.push(slot);
        Ok(())
    }

    fn extract_root(&mut self, slot: Slot, archive: &Path) -> Result<(), ProvisionError> {
        let bytes = fs::read(archive).map_err(|err| ProvisionError(err.to_string()))?;
        self.record.borrow_mut().root_payload = Some((slot, bytes));
        Ok(())
    }

    fn write_falcon_bundle(&mut self, slot: Slot, bundle: &[u8]) -> Result<(), ProvisionError> {
        self.record.borrow_mut().bundle = Some((slot, bundle.to_vec()));
        Ok(())
    }
}

struct FakePower {
    rebooted: Rc<RefCell<bool>>,
}

impl PowerControl for FakePower {
    fn request_reboot(&self) -> Result<(), ProvisionError> {
        *self.rebooted.borrow_mut() = true;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

const BOOT_URL: &str = "http://updates.example/v1.1.0/boot.tar";
const ROOTFS_URL: &str = "http://updates.example/v1.1.0/rootfs.tar";

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn manifest_json(version: &str, boot: &[u8], rootfs: &[u8], min_version: Option<&str>) -> Vec<u8> {
    let mut doc = serde_json::json!({
        "update_available": true,
        "version": version,
        "artifacts": [
            {"name": "boot", "url": BOOT_URL, "sha256": sha256_hex(boot), "size": boot.len()},
            {"name": "rootfs", "url": ROOTFS_URL, "sha256": sha256_hex(rootfs), "size": rootfs.len()},
        ],
        "mandatory": false,
    });
    if let Some(min) = min_version {
        doc["min_version"] = serde_json::json!(min);
    }
    serde_json::to_vec(&doc).expect("manifest encodes")
}

fn store_with_version(version: &str) -> RedundantStore<MemNvRegion> {
    let mut state = BootState::safe_default();
    state.confirmed_version = VersionTag::parse(version).expect("tag fits");
    let mut store = RedundantStore::new(MemNvRegion::new());
    store.write(&state).expect("seed state");
    store
}

struct Harness {
    engine: UpdateEngine<FakeTransport, FakeProvisioner, FakePower>,
    record: Rc<RefCell<ProvisionRecord>>,
    transport_log: Rc<RefCell<TransportLog>>,
    rebooted: Rc<RefCell<bool>>,
    _scratch: tempfile::TempDir,
    scratch_dir: PathBuf,
}

fn harness(transport: FakeTransport) -> Harness {
    harness_with_key(transport, None)
}

fn harness_with_key(transport: FakeTransport, publisher_key: Option<[u8; 32]>) -> Harness {
    let scratch = tempfile::tempdir().expect("scratch dir");
    let scratch_dir = scratch.path().join("fota");
    let record = Rc::new(RefCell::new(ProvisionRecord::default()));
    let rebooted = Rc::new(RefCell::new(false));
    let transport_log = transport.log.clone();
    let config = EngineConfig {
        scratch_dir: scratch_dir.clone(),
        download_retries: 2,
        publisher_key,
        cmdline_a: "console=ttyO0 root=/dev/mmcblk0p2 ro".into(),
        cmdline_b: "console=ttyO0 root=/dev/mmcblk0p5 ro".into(),
    };
    let engine = UpdateEngine::new(
        transport,
        FakeProvisioner { record: record.clone() },
        FakePower { rebooted: rebooted.clone() },
        config,
    );
    Harness { engine, record, transport_log, rebooted, _scratch: scratch, scratch_dir }
}

fn run(
    harness: &mut Harness,
    store: &mut RedundantStore<MemNvRegion>,
) -> Result<CycleOutcome, UpdateError> {
    let cancel = AtomicBool::new(false);
    harness.engine.run_cycle(store, &cancel)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn test_full_cycle_stages_standby() {
    let boot = b"boot payload v1.1.0".to_vec();
    let rootfs = b"rootfs payload v1.1.0".to_vec();
    let manifest = manifest_json("1.1.0", &boot, &rootfs, None);
    let artifacts = HashMap::from([
        (BOOT_URL.to_string(), boot.clone()),
        (ROOTFS_URL.to_string(), rootfs.clone()),
    ]);
    let mut harness = harness(FakeTransport::new(manifest, artifacts));
    let mut store = store_with_version("1.0.0");

    let outcome = run(&mut harness, &mut store).expect("cycle succeeds");
    assert_eq!(outcome, CycleOutcome::Staged { version: "1.1.0".into(), slot: Slot::B });

    // The boot slot selector performs the actual flip: active stays A,
    // the pending switch points at the freshly written slot.
    let state = store.read().unwrap();
    assert_eq!(state.active_slot, Slot::A);
    assert_eq!(state.pending_switch, Some(Slot::B));
    assert_eq!(state.pending_version.unwrap().as_str(), "1.1.0");
    assert_eq!(state.confirmed_version.as_str(), "1.0.0");

    let record = harness.record.borrow();
    assert_eq!(record.wiped_boot, vec![Slot::B]);
    assert_eq!(record.formatted_root, vec![Slot::B]);
    assert_eq!(record.boot_payload, Some((Slot::B, boot)));
    assert_eq!(record.root_payload, Some((Slot::B, rootfs)));

    let (bundle_slot, bundle_bytes) = record.bundle.clone().expect("bundle regenerated");
    assert_eq!(bundle_slot, Slot::B);
    let bundle = FalconBundle::decode(&bundle_bytes).expect("bundle decodes");
    assert_eq!(bundle.slot, Slot::B);
    assert_eq!(bundle.cmdline(), "console=ttyO0 root=/dev/mmcblk0p5 ro");

    assert!(*harness.rebooted.borrow());
    assert_eq!(harness.engine.phase_cell().get(), CyclePhase::Idle);

    // Scratch is cleaned on the way out.
    assert!(!harness.scratch_dir.join("boot.tar").exists());
    assert!(!harness.scratch_dir.join("rootfs.tar").exists());
}

#[test]
fn test_staged_update_survives_power_cycle() {
    let boot = b"boot v2".to_vec();
    let rootfs = b"rootfs v2".to_vec();
    let manifest = manifest_json("2.0.0", &boot, &rootfs, None);
    let artifacts = HashMap::from([
        (BOOT_URL.to_string(), boot.clone()),
        (ROOTFS_URL.to_string(), rootfs.clone()),
    ]);
    let mut harness = harness(FakeTransport::new(manifest, artifacts));
    let mut store = store_with_version("1.0.0");
    run(&mut harness, &mut store).expect("cycle succeeds");

    // Power cycle: the selector adopts the pending switch with a fresh
    // attempt budget.
    let mut state = store.read().unwrap();
    let outcome = state.begin_boot_attempt();
    store.write(&state).unwrap();
    assert_eq!(outcome.slot, Slot::B);
    assert!(outcome.adopted_pending);
    assert_eq!(state.attempt_count, 1);
    assert_eq!(state.pending_switch, None);

    // The system comes up healthy and confirms.
    let promoted = state.mark_success();
    store.write(&state).unwrap();
    assert_eq!(promoted.unwrap().as_str(), "2.0.0");
    assert_eq!(store.read().unwrap().confirmed_version.as_str(), "2.0.0");
}

#[test]
fn test_digest_mismatch_leaves_standby_untouched() {
    let boot = b"boot payload".to_vec();
    let rootfs = b"rootfs payload".to_vec();
    let manifest = manifest_json("1.1.0", &boot, &rootfs, None);
    // The served rootfs differs from what the manifest advertises.
    let mut tampered = rootfs.clone();
    tampered[0] ^= 0xFF;
    let artifacts = HashMap::from([
        (BOOT_URL.to_string(), boot),
        (ROOTFS_URL.to_string(), tampered),
    ]);
    let mut harness = harness(FakeTransport::new(manifest, artifacts));
    let mut store = store_with_version("1.0.0");
    let before = store.read().unwrap();

    let err = run(&mut harness, &mut store).expect_err("integrity failure");
    assert!(matches!(err, UpdateError::Integrity { ref artifact, .. } if artifact == "rootfs"));

    assert!(harness.record.borrow().untouched());
    assert_eq!(store.read().unwrap(), before);
    assert!(!*harness.rebooted.borrow());
    // The engine parks in failed; the agent records the error and
    // returns the surface to idle.
    assert_eq!(harness.engine.phase_cell().get(), CyclePhase::Failed);
    assert!(!harness.scratch_dir.join("rootfs.tar").exists());
}

#[test]
fn test_no_update_available_changes_nothing() {
    let manifest = serde_json::to_vec(&serde_json::json!({"update_available": false})).unwrap();
    let mut harness = harness(FakeTransport::new(manifest, HashMap::new()));
    let mut store = store_with_version("1.0.0");
    let before = store.read().unwrap();

    assert_eq!(run(&mut harness, &mut store).unwrap(), CycleOutcome::NoUpdate);
    assert_eq!(store.read().unwrap(), before);
    assert!(harness.record.borrow().untouched());
    assert_eq!(harness.transport_log.borrow().download_attempts, 0);
}

#[test]
fn test_same_version_changes_nothing() {
    let boot = b"boot".to_vec();
    let rootfs = b"rootfs".to_vec();
    let manifest = manifest_json("1.0.0", &boot, &rootfs, None);
    let mut harness = harness(FakeTransport::new(manifest, HashMap::new()));
    let mut store = store_with_version("1.0.0");

    assert_eq!(run(&mut harness, &mut store).unwrap(), CycleOutcome::NoUpdate);
    assert!(harness.record.borrow().untouched());
    assert_eq!(harness.transport_log.borrow().download_attempts, 0);
}

#[test]
fn test_transport_failure_retries_then_fails() {
    let boot = b"boot".to_vec();
    let rootfs = b"rootfs".to_vec();
    let manifest = manifest_json("1.1.0", &boot, &rootfs, None);
    let artifacts = HashMap::from([
        (BOOT_URL.to_string(), boot),
        (ROOTFS_URL.to_string(), rootfs),
    ]);
    let transport = FakeTransport::new(manifest, artifacts);
    *transport.failures_remaining.borrow_mut() = 10;
    let mut harness = harness(transport);
    let mut store = store_with_version("1.0.0");

    let err = run(&mut harness, &mut store).expect_err("transport exhausted");
    assert!(matches!(err, UpdateError::Transport(_)), "{err}");
    // First attempt plus two retries for the first artifact.
    assert_eq!(harness.transport_log.borrow().download_attempts, 3);
    assert!(harness.record.borrow().untouched());
    // Partial downloads are discarded.
    assert!(!harness.scratch_dir.join("boot.tar").exists());
}

#[test]
fn test_transport_failure_recovers_within_retry_budget() {
    let boot = b"boot".to_vec();
    let rootfs = b"rootfs".to_vec();
    let manifest = manifest_json("1.1.0", &boot, &rootfs, None);
    let artifacts = HashMap::from([
        (BOOT_URL.to_string(), boot),
        (ROOTFS_URL.to_string(), rootfs),
    ]);
    let transport = FakeTransport::new(manifest, artifacts);
    *transport.failures_remaining.borrow_mut() = 2;
    let mut harness = harness(transport);
    let mut store = store_with_version("1.0.0");

    let outcome = run(&mut harness, &mut store).expect("recovers after retries");
    assert!(matches!(outcome, CycleOutcome::Staged { .. }));
}

#[test]
fn test_min_version_gate_blocks_old_device() {
    let boot = b"boot".to_vec();
    let rootfs = b"rootfs".to_vec();
    let manifest = manifest_json("3.0.0", &boot, &rootfs, Some("2.0.0"));
    let mut harness = harness(FakeTransport::new(manifest, HashMap::new()));
    let mut store = store_with_version("1.0.0");

    let err = run(&mut harness, &mut store).expect_err("below min_version");
    assert!(matches!(err, UpdateError::Manifest(_)), "{err}");
    assert_eq!(harness.transport_log.borrow().download_attempts, 0);
    assert!(harness.record.borrow().untouched());
}

#[test]
fn test_signature_verification_gates_manifest() {
    let signing_key = SigningKey::from_bytes(&[7u8; 32]);
    let publisher = signing_key.verifying_key().to_bytes();
    let manifest = serde_json::to_vec(&serde_json::json!({"update_available": false})).unwrap();
    let signature = signing_key.sign(&manifest);

    // Valid signature: the cycle proceeds normally.
    let mut transport = FakeTransport::new(manifest.clone(), HashMap::new());
    transport.signature = Some(signature.to_bytes().to_vec());
    let mut harness = harness_with_key(transport, Some(publisher));
    let mut store = store_with_version("1.0.0");
    assert_eq!(run(&mut harness, &mut store).unwrap(), CycleOutcome::NoUpdate);

    // Tampered signature: rejected before parsing.
    let mut bad = signature.to_bytes();
    bad[0] ^= 0xFF;
    let mut transport = FakeTransport::new(manifest.clone(), HashMap::new());
    transport.signature = Some(bad.to_vec());
    let mut harness = harness_with_key(transport, Some(publisher));
    let err = run(&mut harness, &mut store).expect_err("bad signature");
    assert!(matches!(err, UpdateError::Manifest(_)), "{err}");

    // Missing signature: transport error.
    let transport = FakeTransport::new(manifest, HashMap::new());
    let mut harness = harness_with_key(transport, Some(publisher));
    let err = run(&mut harness, &mut store).expect_err("missing signature");
    assert!(matches!(err, UpdateError::Transport(_)), "{err}");
}

#[test]
fn test_corrupt_boot_state_refuses_cycle() {
    let manifest = serde_json::to_vec(&serde_json::json!({"update_available": false})).unwrap();
    let mut harness = harness(FakeTransport::new(manifest, HashMap::new()));

    let mut region = MemNvRegion::new();
    region.copy_mut(0).fill(0xDD);
    region.copy_mut(1).fill(0xDD);
    let mut store = RedundantStore::new(region);

    let err = run(&mut harness, &mut store).expect_err("state corrupt");
    assert!(matches!(err, UpdateError::StateCorrupt));
    // Nothing past checking may run.
    assert_eq!(harness.transport_log.borrow().manifest_fetches, 0);
}

#[test]
fn test_cancellation_stops_before_download() {
    let boot = b"boot".to_vec();
    let rootfs = b"rootfs".to_vec();
    let manifest = manifest_json("1.1.0", &boot, &rootfs, None);
    let artifacts = HashMap::from([
        (BOOT_URL.to_string(), boot),
        (ROOTFS_URL.to_string(), rootfs),
    ]);
    let mut harness = harness(FakeTransport::new(manifest, artifacts));
    let mut store = store_with_version("1.0.0");

    let cancel = AtomicBool::new(false);
    cancel.store(true, Ordering::Relaxed);
    let err = harness.engine.run_cycle(&mut store, &cancel).expect_err("canceled");
    assert!(matches!(err, UpdateError::Canceled));
    // Checking ran, but no download started and no slot was touched.
    assert_eq!(harness.transport_log.borrow().manifest_fetches, 1);
    assert_eq!(harness.transport_log.borrow().download_attempts, 0);
    assert!(harness.record.borrow().untouched());
}
