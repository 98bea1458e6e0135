// Copyright 2026 Falconboot Contributors
// SPDX-License-Identifier: Apache-2.0
//
//! CONTEXT: Power-cycle sequences through the boot slot selector
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: 8 tests
//!
//! TEST_SCENARIOS:
//!   - test_rollback_after_attempt_limit(): three strikes flip the slot
//!   - test_mark_success_prevents_rollback(): confirmed boots never flip
//!   - test_pending_switch_power_cycle(): staged update adopted once
//!   - test_both_slots_failing_alternates_forever(): bounded thrashing
//!   - test_recovery_input_always_wins(): escape hatch precedence
//!   - test_missing_bundle_burns_attempt_budget(): fallback still counts
//!   - test_torn_record_write_recovers(): redundant copy survives
//!   - test_selector_scenario_from_midway(): {A,2,3} failure case

use bootstate::{BootState, MemNvRegion, NvRegion, RedundantStore, Slot, VersionTag, RECORD_SIZE};
use falcon_boot::{
    boot_cycle, BootPlan, BundleReadError, BundleSource, FalconBundle, FullBootReason,
    RecoveryInput, BUNDLE_MAX,
};

struct Pin(bool);

impl RecoveryInput for Pin {
    fn recovery_requested(&self) -> bool {
        self.0
    }
}

/// Both slots carry valid bundles.
struct GoodBundles;

impl BundleSource for GoodBundles {
    fn read_bundle(&self, slot: Slot, buf: &mut [u8; BUNDLE_MAX]) -> Result<usize, BundleReadError> {
        let cmdline = match slot {
            Slot::A => "console=ttyO0 root=/dev/mmcblk0p2 ro",
            Slot::B => "console=ttyO0 root=/dev/mmcblk0p5 ro",
        };
        let bundle = FalconBundle::new(slot, 0, 0x40_0000, cmdline).expect("bundle fits");
        Ok(bundle.encode(buf))
    }
}

/// No slot has a bundle (fresh device, or wiped boot areas).
struct NoBundles;

impl BundleSource for NoBundles {
    fn read_bundle(
        &self,
        _slot: Slot,
        _buf: &mut [u8; BUNDLE_MAX],
    ) -> Result<usize, BundleReadError> {
        Err(BundleReadError::Missing)
    }
}

fn fresh_store() -> RedundantStore<MemNvRegion> {
    let mut store = RedundantStore::new(MemNvRegion::new());
    store.write(&BootState::safe_default()).expect("seed state");
    store
}

fn power_cycle(store: &mut RedundantStore<MemNvRegion>) -> falcon_boot::BootDecision {
    boot_cycle(&Pin(false), store, &GoodBundles)
}

#[test]
fn test_rollback_after_attempt_limit() {
    let mut store = fresh_store();

    // Three unconfirmed boots of slot A.
    for attempt in 1..=3 {
        let decision = power_cycle(&mut store);
        let outcome = decision.outcome.unwrap();
        assert_eq!(outcome.slot, Slot::A, "attempt {attempt}");
        assert!(!outcome.rolled_back);
    }
    // The fourth power cycle selects the other slot with a reset counter.
    let decision = power_cycle(&mut store);
    let outcome = decision.outcome.unwrap();
    assert_eq!(outcome.slot, Slot::B);
    assert!(outcome.rolled_back);
    let state = store.read().unwrap();
    assert_eq!(state.active_slot, Slot::B);
    assert_eq!(state.attempt_count, 1);
}

#[test]
fn test_mark_success_prevents_rollback() {
    let mut store = fresh_store();

    for _ in 0..10 {
        let decision = power_cycle(&mut store);
        assert_eq!(decision.outcome.unwrap().slot, Slot::A);

        // Userspace comes up healthy and confirms; repeated confirmation
        // is harmless.
        let mut state = store.read().unwrap();
        state.mark_success();
        state.mark_success();
        store.write(&state).unwrap();
    }
    assert_eq!(store.read().unwrap().attempt_count, 0);
}

#[test]
fn test_pending_switch_power_cycle() {
    let mut store = fresh_store();
    let mut state = store.read().unwrap();
    state.set_pending_switch(Slot::B, VersionTag::parse("2.0.0").unwrap());
    store.write(&state).unwrap();

    let decision = power_cycle(&mut store);
    let outcome = decision.outcome.unwrap();
    assert_eq!(outcome.slot, Slot::B);
    assert!(outcome.adopted_pending);

    let state = store.read().unwrap();
    assert_eq!(state.active_slot, Slot::B);
    assert_eq!(state.pending_switch, None);
    assert_eq!(state.attempt_count, 1);
    // The version stays pending until the success monitor confirms it.
    assert_eq!(state.pending_version.unwrap().as_str(), "2.0.0");
    assert_eq!(state.confirmed_version.as_str(), "");
}

#[test]
fn test_both_slots_failing_alternates_forever() {
    let mut store = fresh_store();
    let mut selected = Vec::new();
    let mut both_failed_at = None;

    for boot in 1..=12 {
        let decision = power_cycle(&mut store);
        let outcome = decision.outcome.unwrap();
        selected.push(outcome.slot);
        if outcome.both_failed && both_failed_at.is_none() {
            both_failed_at = Some(boot);
        }
    }

    // Limit 3 per slot: A A A, then B B B, then back to A.
    let expected = [
        Slot::A, Slot::A, Slot::A,
        Slot::B, Slot::B, Slot::B,
        Slot::A, Slot::A, Slot::A,
        Slot::B, Slot::B, Slot::B,
    ];
    assert_eq!(selected, expected);
    // The escalation flag raises after 2 x limit unconfirmed boots and
    // stays up; the device keeps producing boot decisions regardless.
    assert_eq!(both_failed_at, Some(6));
    assert!(store.read().unwrap().both_failed);

    // Recovery tooling eventually confirms a boot; the flag clears.
    let mut state = store.read().unwrap();
    state.mark_success();
    store.write(&state).unwrap();
    assert!(!store.read().unwrap().both_failed);
}

#[test]
fn test_recovery_input_always_wins() {
    // Corrupt state, no bundles: the held button still reaches the full
    // bootloader without touching storage.
    let mut region = MemNvRegion::new();
    region.copy_mut(0).fill(0x99);
    region.copy_mut(1).fill(0x99);
    let mut store = RedundantStore::new(region);

    let decision = boot_cycle(&Pin(true), &mut store, &NoBundles);
    assert_eq!(decision.plan, BootPlan::Full { reason: FullBootReason::RecoveryRequested });
    assert_eq!(decision.outcome, None);
    assert!(store.read().is_err());
}

#[test]
fn test_missing_bundle_burns_attempt_budget() {
    let mut store = fresh_store();

    for _ in 0..3 {
        let decision = boot_cycle(&Pin(false), &mut store, &NoBundles);
        assert_eq!(
            decision.plan,
            BootPlan::Full { reason: FullBootReason::BundleMissing }
        );
    }
    // Even full-bootloader fallbacks count as attempts, so a slot whose
    // bundle never materializes still rolls over.
    let decision = boot_cycle(&Pin(false), &mut store, &NoBundles);
    assert!(decision.outcome.unwrap().rolled_back);
    assert_eq!(store.read().unwrap().active_slot, Slot::B);
}

#[test]
fn test_torn_record_write_recovers() {
    let mut store = fresh_store();
    power_cycle(&mut store);
    power_cycle(&mut store);

    // Tear whichever copy holds the newest record; the survivor must
    // still produce exactly one valid active slot.
    let mut region = store.into_region();
    let mut newest = 0u8;
    let mut best_seq = 0u32;
    for copy in 0..2u8 {
        let mut buf = [0u8; RECORD_SIZE];
        region.read_copy(copy, &mut buf).unwrap();
        let seq = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        if seq > best_seq {
            best_seq = seq;
            newest = copy;
        }
    }
    for byte in region.copy_mut(newest).iter_mut() {
        *byte ^= 0x0F;
    }

    let mut store = RedundantStore::new(region);
    let state = store.read().expect("older copy survives");
    assert!(matches!(state.active_slot, Slot::A | Slot::B));

    // And the next power cycle proceeds normally.
    let decision = power_cycle(&mut store);
    assert!(decision.outcome.is_some());
    assert!(!decision.state_recovered);
}

#[test]
fn test_selector_scenario_from_midway() {
    // Boot state {active=A, attempt_count=2, attempt_limit=3}; the boot
    // fails without confirmation. Next power cycle runs attempt 3 on A;
    // the one after selects B with a fresh counter.
    let mut store = RedundantStore::new(MemNvRegion::new());
    let mut state = BootState::safe_default();
    state.attempt_count = 2;
    store.write(&state).unwrap();

    let decision = power_cycle(&mut store);
    assert_eq!(decision.outcome.unwrap().slot, Slot::A);
    assert_eq!(store.read().unwrap().attempt_count, 3);

    let decision = power_cycle(&mut store);
    let outcome = decision.outcome.unwrap();
    assert_eq!(outcome.slot, Slot::B);
    assert!(outcome.rolled_back);
    assert_eq!(store.read().unwrap().attempt_count, 1);
}
