// Copyright 2026 Falconboot Contributors
// SPDX-License-Identifier: Apache-2.0

//! Falcon argument bundle codec.
//!
//! A bundle is a small fixed-format artifact written next to each slot's
//! boot area by the update agent and validated here at boot time. Layout:
//!
//! ```text
//! magic          u32  'FBAB'
//! version        u8
//! slot           u8   0 = A, 1 = B
//! reserved       u16
//! kernel_offset  u64  byte offset of the kernel image in the boot area
//! kernel_size    u32
//! cmdline_len    u16  + cmdline bytes (UTF-8, max 512)
//! crc            u32  CRC32 over everything before it
//! ```

use bootstate::Slot;

/// Bundle magic: "FBAB" (Falconboot A/B).
const BUNDLE_MAGIC: u32 = 0x4642_4142;
const BUNDLE_VERSION: u8 = 1;
const HEADER_SIZE: usize = 22;

/// Maximum kernel command line carried in a bundle.
pub const CMDLINE_MAX: usize = 512;

/// Maximum encoded bundle size (header + cmdline + crc, padded).
pub const BUNDLE_MAX: usize = 544;

/// Bundle encode/decode failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleError {
    Truncated,
    BadMagic,
    BadVersion,
    BadSlot,
    BadCrc,
    BadCmdline,
    CmdlineTooLong,
}

impl core::fmt::Display for BundleError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let text = match self {
            BundleError::Truncated => "bundle truncated",
            BundleError::BadMagic => "bundle magic mismatch",
            BundleError::BadVersion => "bundle version unsupported",
            BundleError::BadSlot => "bundle slot byte invalid",
            BundleError::BadCrc => "bundle checksum mismatch",
            BundleError::BadCmdline => "bundle cmdline not utf-8",
            BundleError::CmdlineTooLong => "bundle cmdline too long",
        };
        f.write_str(text)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for BundleError {}

/// Decoded per-slot kernel + argument bundle.
#[derive(Clone)]
pub struct FalconBundle {
    pub slot: Slot,
    pub kernel_offset: u64,
    pub kernel_size: u32,
    cmdline_len: u16,
    cmdline: [u8; CMDLINE_MAX],
}

impl FalconBundle {
    pub fn new(
        slot: Slot,
        kernel_offset: u64,
        kernel_size: u32,
        cmdline: &str,
    ) -> Result<Self, BundleError> {
        let raw = cmdline.as_bytes();
        if raw.len() > CMDLINE_MAX {
            return Err(BundleError::CmdlineTooLong);
        }
        let mut buf = [0u8; CMDLINE_MAX];
        buf[..raw.len()].copy_from_slice(raw);
        Ok(Self {
            slot,
            kernel_offset,
            kernel_size,
            cmdline_len: raw.len() as u16,
            cmdline: buf,
        })
    }

    pub fn cmdline(&self) -> &str {
        core::str::from_utf8(&self.cmdline[..self.cmdline_len as usize]).unwrap_or("")
    }

    /// Serializes into `out`, returning the encoded length.
    pub fn encode(&self, out: &mut [u8; BUNDLE_MAX]) -> usize {
        out.fill(0);
        out[0..4].copy_from_slice(&BUNDLE_MAGIC.to_le_bytes());
        out[4] = BUNDLE_VERSION;
        out[5] = match self.slot {
            Slot::A => 0,
            Slot::B => 1,
        };
        // out[6..8] reserved
        out[8..16].copy_from_slice(&self.kernel_offset.to_le_bytes());
        out[16..20].copy_from_slice(&self.kernel_size.to_le_bytes());
        out[20..22].copy_from_slice(&self.cmdline_len.to_le_bytes());
        let body_end = HEADER_SIZE + self.cmdline_len as usize;
        out[HEADER_SIZE..body_end].copy_from_slice(&self.cmdline[..self.cmdline_len as usize]);
        let crc = crc32fast::hash(&out[..body_end]);
        out[body_end..body_end + 4].copy_from_slice(&crc.to_le_bytes());
        body_end + 4
    }

    /// Parses and validates an encoded bundle.
    pub fn decode(bytes: &[u8]) -> Result<Self, BundleError> {
        if bytes.len() < HEADER_SIZE + 4 {
            return Err(BundleError::Truncated);
        }
        let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if magic != BUNDLE_MAGIC {
            return Err(BundleError::BadMagic);
        }
        if bytes[4] != BUNDLE_VERSION {
            return Err(BundleError::BadVersion);
        }
        let slot = match bytes[5] {
            0 => Slot::A,
            1 => Slot::B,
            _ => return Err(BundleError::BadSlot),
        };
        let cmdline_len = u16::from_le_bytes([bytes[20], bytes[21]]) as usize;
        if cmdline_len > CMDLINE_MAX {
            return Err(BundleError::CmdlineTooLong);
        }
        let body_end = HEADER_SIZE + cmdline_len;
        if bytes.len() < body_end + 4 {
            return Err(BundleError::Truncated);
        }
        let stored_crc = u32::from_le_bytes([
            bytes[body_end],
            bytes[body_end + 1],
            bytes[body_end + 2],
            bytes[body_end + 3],
        ]);
        if crc32fast::hash(&bytes[..body_end]) != stored_crc {
            return Err(BundleError::BadCrc);
        }
        let cmdline_bytes = &bytes[HEADER_SIZE..body_end];
        core::str::from_utf8(cmdline_bytes).map_err(|_| BundleError::BadCmdline)?;

        let mut cmdline = [0u8; CMDLINE_MAX];
        cmdline[..cmdline_len].copy_from_slice(cmdline_bytes);
        Ok(Self {
            slot,
            kernel_offset: u64::from_le_bytes([
                bytes[8], bytes[9], bytes[10], bytes[11], bytes[12], bytes[13], bytes[14],
                bytes[15],
            ]),
            kernel_size: u32::from_le_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]),
            cmdline_len: cmdline_len as u16,
            cmdline,
        })
    }
}

impl core::fmt::Debug for FalconBundle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FalconBundle")
            .field("slot", &self.slot)
            .field("kernel_offset", &self.kernel_offset)
            .field("kernel_size", &self.kernel_size)
            .field("cmdline", &self.cmdline())
            .finish()
    }
}

impl PartialEq for FalconBundle {
    fn eq(&self, other: &Self) -> bool {
        self.slot == other.slot
            && self.kernel_offset == other.kernel_offset
            && self.kernel_size == other.kernel_size
            && self.cmdline() == other.cmdline()
    }
}

impl Eq for FalconBundle {}
