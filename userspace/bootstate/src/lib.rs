// Copyright 2026 Falconboot Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Boot state record and A/B slot state machine
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable (v1.0)
//! TEST_COVERAGE: Unit tests here + scenario tests in tests/fota_host
//!
//! PUBLIC API:
//!   - Slot, VersionTag, BootState: the persistent boot record
//!   - BootState::begin_boot_attempt / mark_success / force_rollback /
//!     set_pending_switch: the slot state machine
//!   - store::RedundantStore: dual-copy power-loss-safe persistence
//!
//! DEPENDENCIES:
//!   - crc32fast: record integrity checksums
//!
//! ADR: docs/adr/0001-ab-boot-control.md

#![cfg_attr(not(feature = "std"), no_std)]
#![forbid(unsafe_code)]

pub mod store;

pub use store::{MemNvRegion, NvError, NvRegion, RedundantStore, StoreError};
#[cfg(feature = "std")]
pub use store::{FileError, FileNvRegion};

/// Persisted record size in bytes, padding included.
pub const RECORD_SIZE: usize = 96;

/// Record magic: "FBST" (Falconboot STate).
const RECORD_MAGIC: u32 = 0x4642_5354;
const RECORD_VERSION: u8 = 1;
const PENDING_NONE: u8 = 0xff;
const FLAG_BOTH_FAILED: u8 = 0b0000_0001;

/// Default consecutive-attempt budget before the selector flips slots.
pub const DEFAULT_ATTEMPT_LIMIT: u8 = 3;

/// One of the two symmetric boot slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    A,
    B,
}

impl Slot {
    pub fn other(self) -> Self {
        match self {
            Slot::A => Slot::B,
            Slot::B => Slot::A,
        }
    }

    pub fn letter(self) -> char {
        match self {
            Slot::A => 'a',
            Slot::B => 'b',
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            Slot::A => 0,
            Slot::B => 1,
        }
    }

    fn from_byte(byte: u8) -> Result<Self, RecordError> {
        match byte {
            0 => Ok(Slot::A),
            1 => Ok(Slot::B),
            _ => Err(RecordError::BadSlot),
        }
    }
}

impl core::fmt::Display for Slot {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.letter())
    }
}

/// Fixed-capacity version identifier (max 31 bytes of ASCII/UTF-8).
///
/// Alloc-free so the pre-OS selector can carry it in a fixed buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionTag {
    len: u8,
    bytes: [u8; Self::MAX],
}

impl VersionTag {
    /// Maximum tag length in bytes.
    pub const MAX: usize = 31;

    pub const fn empty() -> Self {
        Self { len: 0, bytes: [0; Self::MAX] }
    }

    /// Builds a tag from a string, rejecting oversized input.
    pub fn parse(text: &str) -> Result<Self, RecordError> {
        let raw = text.as_bytes();
        if raw.len() > Self::MAX {
            return Err(RecordError::TagTooLong);
        }
        let mut bytes = [0u8; Self::MAX];
        bytes[..raw.len()].copy_from_slice(raw);
        Ok(Self { len: raw.len() as u8, bytes })
    }

    pub fn as_str(&self) -> &str {
        // Construction only accepts valid UTF-8; decode re-checks.
        core::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or("")
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn write_to(&self, out: &mut [u8]) {
        out[0] = self.len;
        out[1..1 + self.len as usize].copy_from_slice(&self.bytes[..self.len as usize]);
    }

    fn read_from(buf: &[u8]) -> Result<Self, RecordError> {
        let len = buf[0] as usize;
        if len > Self::MAX {
            return Err(RecordError::TagTooLong);
        }
        core::str::from_utf8(&buf[1..1 + len]).map_err(|_| RecordError::BadUtf8)?;
        let mut bytes = [0u8; Self::MAX];
        bytes[..len].copy_from_slice(&buf[1..1 + len]);
        Ok(Self { len: len as u8, bytes })
    }
}

impl core::fmt::Display for VersionTag {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record decode failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordError {
    BadMagic,
    BadVersion,
    BadSlot,
    BadCrc,
    BadUtf8,
    TagTooLong,
}

/// The persistent boot record driving every slot decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootState {
    pub active_slot: Slot,
    pub attempt_count: u8,
    pub attempt_limit: u8,
    pub pending_switch: Option<Slot>,
    /// Raised after 2 x attempt_limit unconfirmed boots across both slots.
    pub both_failed: bool,
    /// Boot attempts since the last confirmed boot, both slots combined.
    pub unconfirmed_boots: u8,
    pub confirmed_version: VersionTag,
    /// Version installed to the standby slot, awaiting confirmation.
    pub pending_version: Option<VersionTag>,
}

/// Result of one selector pass over the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectOutcome {
    pub slot: Slot,
    pub adopted_pending: bool,
    pub rolled_back: bool,
    pub both_failed: bool,
}

impl BootState {
    /// Hard-coded fallback used when the store is unreadable.
    pub const fn safe_default() -> Self {
        Self {
            active_slot: Slot::A,
            attempt_count: 0,
            attempt_limit: DEFAULT_ATTEMPT_LIMIT,
            pending_switch: None,
            both_failed: false,
            unconfirmed_boots: 0,
            confirmed_version: VersionTag::empty(),
            pending_version: None,
        }
    }

    pub fn standby_slot(&self) -> Slot {
        self.active_slot.other()
    }

    /// Runs the once-per-power-cycle selection over the record.
    ///
    /// Order matters: a pending switch is adopted first and always gets a
    /// fresh attempt budget; only then is the rollback threshold applied.
    pub fn begin_boot_attempt(&mut self) -> SelectOutcome {
        let mut adopted_pending = false;
        let mut rolled_back = false;

        if let Some(target) = self.pending_switch.take() {
            self.active_slot = target;
            self.attempt_count = 0;
            adopted_pending = true;
        }

        if self.attempt_count >= self.attempt_limit {
            self.active_slot = self.active_slot.other();
            self.attempt_count = 0;
            rolled_back = true;
        }

        self.attempt_count = self.attempt_count.saturating_add(1);
        self.unconfirmed_boots = self.unconfirmed_boots.saturating_add(1);
        if self.unconfirmed_boots >= self.attempt_limit.saturating_mul(2) {
            self.both_failed = true;
        }

        SelectOutcome {
            slot: self.active_slot,
            adopted_pending,
            rolled_back,
            both_failed: self.both_failed,
        }
    }

    /// Confirms the running slot; the only path that ends a rollback
    /// countdown early. Idempotent. Returns the promoted version, if any.
    pub fn mark_success(&mut self) -> Option<VersionTag> {
        self.attempt_count = 0;
        self.unconfirmed_boots = 0;
        self.both_failed = false;
        if let Some(version) = self.pending_version.take() {
            self.confirmed_version = version;
            return Some(version);
        }
        None
    }

    /// Operator-initiated immediate flip, bypassing the counter.
    ///
    /// Discards any pending switch and pending version: they referred to an
    /// installation the operator is explicitly moving away from.
    pub fn force_rollback(&mut self) -> Slot {
        self.active_slot = self.active_slot.other();
        self.attempt_count = 0;
        self.pending_switch = None;
        self.pending_version = None;
        self.active_slot
    }

    /// Records a completed installation: the next power cycle adopts
    /// `target`, and `version` is promoted once that boot confirms.
    pub fn set_pending_switch(&mut self, target: Slot, version: VersionTag) {
        self.pending_switch = Some(target);
        self.pending_version = Some(version);
    }
}

impl Default for BootState {
    fn default() -> Self {
        Self::safe_default()
    }
}

/// Serializes a record with its sequence number and CRC.
pub(crate) fn encode_record(state: &BootState, seq: u32, out: &mut [u8; RECORD_SIZE]) {
    out.fill(0);
    out[0..4].copy_from_slice(&RECORD_MAGIC.to_le_bytes());
    out[4..8].copy_from_slice(&seq.to_le_bytes());
    out[8] = RECORD_VERSION;
    out[9] = state.active_slot.to_byte();
    out[10] = state.attempt_count;
    out[11] = state.attempt_limit;
    out[12] = state.pending_switch.map(Slot::to_byte).unwrap_or(PENDING_NONE);
    out[13] = if state.both_failed { FLAG_BOTH_FAILED } else { 0 };
    out[14] = state.unconfirmed_boots;
    // out[15] reserved
    state.confirmed_version.write_to(&mut out[16..48]);
    match state.pending_version {
        Some(version) => version.write_to(&mut out[48..80]),
        None => out[48] = 0,
    }
    let crc = crc32fast::hash(&out[..80]);
    out[80..84].copy_from_slice(&crc.to_le_bytes());
}

/// Parses and validates a record, returning it with its sequence number.
pub(crate) fn decode_record(buf: &[u8; RECORD_SIZE]) -> Result<(BootState, u32), RecordError> {
    let magic = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if magic != RECORD_MAGIC {
        return Err(RecordError::BadMagic);
    }
    let stored_crc = u32::from_le_bytes([buf[80], buf[81], buf[82], buf[83]]);
    if crc32fast::hash(&buf[..80]) != stored_crc {
        return Err(RecordError::BadCrc);
    }
    if buf[8] != RECORD_VERSION {
        return Err(RecordError::BadVersion);
    }

    let seq = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    let active_slot = Slot::from_byte(buf[9])?;
    let pending_switch = match buf[12] {
        PENDING_NONE => None,
        byte => Some(Slot::from_byte(byte)?),
    };
    let attempt_limit = if buf[11] == 0 { DEFAULT_ATTEMPT_LIMIT } else { buf[11] };
    let confirmed_version = VersionTag::read_from(&buf[16..48])?;
    let pending_version = {
        let tag = VersionTag::read_from(&buf[48..80])?;
        if tag.is_empty() { None } else { Some(tag) }
    };

    let state = BootState {
        active_slot,
        attempt_count: buf[10],
        attempt_limit,
        pending_switch,
        both_failed: buf[13] & FLAG_BOTH_FAILED != 0,
        unconfirmed_boots: buf[14],
        confirmed_version,
        pending_version,
    };
    Ok((state, seq))
}
