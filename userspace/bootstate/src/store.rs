// Copyright 2026 Falconboot Contributors
// SPDX-License-Identifier: Apache-2.0

//! Dual-copy persistence for the boot record.
//!
//! The record lives as two fixed copies at a known location outside both
//! slots. A write bumps the sequence number and overwrites the older copy,
//! then syncs; a crash at any byte offset leaves at least one valid copy
//! for the next power cycle to pick up.

use crate::{decode_record, encode_record, BootState, RECORD_SIZE};

/// Number of redundant record copies.
pub const COPY_COUNT: u8 = 2;

/// Non-volatile region access failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NvError {
    /// Read/write failed.
    Io,
    /// Copy index out of range.
    OutOfRange,
}

/// Fixed-size non-volatile region holding the redundant record copies.
///
/// Alloc-free so the pre-OS selector can run against it with nothing but
/// stack buffers.
pub trait NvRegion {
    /// Reads one record copy into `buf`.
    fn read_copy(&self, copy: u8, buf: &mut [u8; RECORD_SIZE]) -> Result<(), NvError>;

    /// Writes one record copy from `buf`.
    fn write_copy(&mut self, copy: u8, buf: &[u8; RECORD_SIZE]) -> Result<(), NvError>;

    /// Flushes pending writes to durable storage.
    fn sync(&mut self) -> Result<(), NvError>;
}

/// Store-level failures surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    /// Underlying region I/O failed.
    Io,
    /// Neither copy validates; callers fall back to the safe default.
    Corrupt,
}

impl core::fmt::Display for StoreError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            StoreError::Io => write!(f, "boot state region i/o failed"),
            StoreError::Corrupt => write!(f, "no valid boot state copy"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for StoreError {}

/// Atomically-updatable boot state store over two redundant copies.
pub struct RedundantStore<N: NvRegion> {
    region: N,
}

impl<N: NvRegion> RedundantStore<N> {
    pub fn new(region: N) -> Self {
        Self { region }
    }

    /// Hands the region back (reopen-style tests).
    pub fn into_region(self) -> N {
        self.region
    }

    /// Newest valid copy, if any: (state, seq, copy index).
    fn scan(&self) -> Result<Option<(BootState, u32, u8)>, StoreError> {
        let mut newest: Option<(BootState, u32, u8)> = None;
        let mut io_failures = 0u8;
        let mut buf = [0u8; RECORD_SIZE];
        for copy in 0..COPY_COUNT {
            if self.region.read_copy(copy, &mut buf).is_err() {
                io_failures += 1;
                continue;
            }
            if let Ok((state, seq)) = decode_record(&buf) {
                let replace = match newest {
                    Some((_, best_seq, _)) => seq > best_seq,
                    None => true,
                };
                if replace {
                    newest = Some((state, seq, copy));
                }
            }
        }
        if newest.is_none() && io_failures == COPY_COUNT {
            return Err(StoreError::Io);
        }
        Ok(newest)
    }

    /// Reads the current record.
    pub fn read(&self) -> Result<BootState, StoreError> {
        match self.scan()? {
            Some((state, _, _)) => Ok(state),
            None => Err(StoreError::Corrupt),
        }
    }

    /// Reads the current record, falling back to the hard-coded safe
    /// default instead of failing closed. The flag reports whether the
    /// fallback was taken.
    pub fn load_or_default(&self) -> (BootState, bool) {
        match self.read() {
            Ok(state) => (state, false),
            Err(_) => (BootState::safe_default(), true),
        }
    }

    /// Persists the record. All-or-nothing: the older copy is overwritten
    /// with a higher sequence number, so a torn write is simply outvoted
    /// by the surviving copy.
    pub fn write(&mut self, state: &BootState) -> Result<(), StoreError> {
        let (seq, target) = match self.scan()? {
            Some((_, newest_seq, newest_copy)) => {
                (newest_seq.wrapping_add(1), (newest_copy + 1) % COPY_COUNT)
            }
            None => (1, 0),
        };
        let mut buf = [0u8; RECORD_SIZE];
        encode_record(state, seq, &mut buf);
        self.region.write_copy(target, &buf).map_err(|_| StoreError::Io)?;
        self.region.sync().map_err(|_| StoreError::Io)
    }
}

/// In-memory region for tests, with raw access for corruption fixtures.
pub struct MemNvRegion {
    copies: [[u8; RECORD_SIZE]; COPY_COUNT as usize],
}

impl MemNvRegion {
    pub fn new() -> Self {
        Self { copies: [[0; RECORD_SIZE]; COPY_COUNT as usize] }
    }

    /// Raw copy bytes, for corruption tests and fixtures.
    pub fn copy_mut(&mut self, copy: u8) -> &mut [u8; RECORD_SIZE] {
        &mut self.copies[copy as usize]
    }
}

impl Default for MemNvRegion {
    fn default() -> Self {
        Self::new()
    }
}

impl NvRegion for MemNvRegion {
    fn read_copy(&self, copy: u8, buf: &mut [u8; RECORD_SIZE]) -> Result<(), NvError> {
        let slot = self.copies.get(copy as usize).ok_or(NvError::OutOfRange)?;
        buf.copy_from_slice(slot);
        Ok(())
    }

    fn write_copy(&mut self, copy: u8, buf: &[u8; RECORD_SIZE]) -> Result<(), NvError> {
        let slot = self.copies.get_mut(copy as usize).ok_or(NvError::OutOfRange)?;
        slot.copy_from_slice(buf);
        Ok(())
    }

    fn sync(&mut self) -> Result<(), NvError> {
        Ok(())
    }
}

/// File region open/create failure (std only).
#[cfg(feature = "std")]
#[derive(Debug)]
pub struct FileError(pub std::io::Error);

#[cfg(feature = "std")]
impl core::fmt::Display for FileError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "boot state file: {}", self.0)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for FileError {}

/// File-backed region: both copies in one fixed-size file, fsynced on
/// every write. Used by the host-side daemon; firmware supplies its own
/// region over raw storage.
#[cfg(feature = "std")]
pub struct FileNvRegion {
    file: std::fs::File,
}

#[cfg(feature = "std")]
impl FileNvRegion {
    pub fn open(path: &std::path::Path) -> Result<Self, FileError> {
        use std::fs::OpenOptions;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(FileError)?;
        let expected = (RECORD_SIZE * COPY_COUNT as usize) as u64;
        let len = file.metadata().map_err(FileError)?.len();
        if len < expected {
            file.set_len(expected).map_err(FileError)?;
        }
        Ok(Self { file })
    }
}

#[cfg(feature = "std")]
impl NvRegion for FileNvRegion {
    fn read_copy(&self, copy: u8, buf: &mut [u8; RECORD_SIZE]) -> Result<(), NvError> {
        use std::os::unix::fs::FileExt;

        if copy >= COPY_COUNT {
            return Err(NvError::OutOfRange);
        }
        let offset = copy as u64 * RECORD_SIZE as u64;
        self.file.read_exact_at(buf, offset).map_err(|_| NvError::Io)
    }

    fn write_copy(&mut self, copy: u8, buf: &[u8; RECORD_SIZE]) -> Result<(), NvError> {
        use std::os::unix::fs::FileExt;

        if copy >= COPY_COUNT {
            return Err(NvError::OutOfRange);
        }
        let offset = copy as u64 * RECORD_SIZE as u64;
        self.file.write_all_at(buf, offset).map_err(|_| NvError::Io)
    }

    fn sync(&mut self) -> Result<(), NvError> {
        self.file.sync_all().map_err(|_| NvError::Io)
    }
}
