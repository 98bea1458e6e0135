// Copyright 2026 Falconboot Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Once-per-power-cycle slot selection and falcon boot planning
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable (v1.0)
//! TEST_COVERAGE: Unit tests here + boot scenarios in tests/fota_host
//!
//! PUBLIC API:
//!   - boot_cycle(): recovery check, selection, persistence, boot plan
//!   - FalconBundle: per-slot kernel + argument bundle codec
//!   - RecoveryInput / BundleSource: board-level collaborator traits
//!
//! The selector runs single-threaded in the pre-OS environment: no heap,
//! fixed buffers only, and it must hand over a decision even when the
//! state store or a bundle is damaged. The recovery input is sampled
//! before anything else so a held button always reaches the full
//! bootloader, corrupt state included.
//!
//! ADR: docs/adr/0001-ab-boot-control.md

#![cfg_attr(not(feature = "std"), no_std)]
#![forbid(unsafe_code)]

pub mod bundle;

pub use bundle::{BundleError, FalconBundle, BUNDLE_MAX, CMDLINE_MAX};

use bootstate::{NvRegion, RedundantStore, SelectOutcome, Slot};

/// Hardware escape-hatch input (held button, strapped GPIO).
pub trait RecoveryInput {
    fn recovery_requested(&self) -> bool;
}

/// Per-slot bundle storage, co-located with each slot's boot area.
pub trait BundleSource {
    /// Reads the raw bundle for `slot` into `buf`, returning its length.
    fn read_bundle(&self, slot: Slot, buf: &mut [u8; BUNDLE_MAX]) -> Result<usize, BundleReadError>;
}

/// Bundle retrieval failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleReadError {
    /// No bundle present for the slot.
    Missing,
    /// Storage read failed.
    Io,
}

/// Why the full, general-purpose bootloader was chosen over falcon boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FullBootReason {
    RecoveryRequested,
    BundleMissing,
    BundleInvalid,
}

/// What to boot this power cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootPlan {
    /// Load the slot's kernel directly with the bundled arguments.
    Falcon { slot: Slot, bundle: FalconBundle },
    /// Fall through to the full bootloader.
    Full { reason: FullBootReason },
}

/// Full result of one selector pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootDecision {
    pub plan: BootPlan,
    /// Selection bookkeeping; `None` when recovery preempted selection.
    pub outcome: Option<SelectOutcome>,
    /// The store was unreadable and the safe default was adopted.
    pub state_recovered: bool,
    /// Persisting the updated record failed; boot proceeds regardless.
    pub persist_failed: bool,
}

/// Runs the complete boot-time decision.
///
/// Invariants:
///   - the recovery input is sampled first, unconditionally;
///   - a corrupt store falls back to the safe default (slot A) instead of
///     halting;
///   - a store write failure never blocks boot;
///   - an absent or invalid bundle forces the full bootloader rather than
///     booting with stale arguments.
pub fn boot_cycle<R, B, N>(
    recovery: &R,
    store: &mut RedundantStore<N>,
    bundles: &B,
) -> BootDecision
where
    R: RecoveryInput,
    B: BundleSource,
    N: NvRegion,
{
    if recovery.recovery_requested() {
        return BootDecision {
            plan: BootPlan::Full { reason: FullBootReason::RecoveryRequested },
            outcome: None,
            state_recovered: false,
            persist_failed: false,
        };
    }

    let (mut state, state_recovered) = store.load_or_default();
    let outcome = state.begin_boot_attempt();
    let persist_failed = store.write(&state).is_err();

    let mut buf = [0u8; BUNDLE_MAX];
    let plan = match bundles.read_bundle(outcome.slot, &mut buf) {
        Ok(len) => match FalconBundle::decode(&buf[..len]) {
            Ok(bundle) if bundle.slot == outcome.slot => {
                BootPlan::Falcon { slot: outcome.slot, bundle }
            }
            Ok(_) | Err(_) => BootPlan::Full { reason: FullBootReason::BundleInvalid },
        },
        Err(_) => BootPlan::Full { reason: FullBootReason::BundleMissing },
    };

    BootDecision { plan, outcome: Some(outcome), state_recovered, persist_failed }
}
