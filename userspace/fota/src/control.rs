// Copyright 2026 Falconboot Contributors
// SPDX-License-Identifier: Apache-2.0

//! Operator control protocol.
//!
//! Small framed byte protocol spoken over the daemon's Unix socket:
//! length-prefixed frames carrying magic, version, opcode, and a status
//! byte. The status query is side-effect free; check, rollback, and
//! mark-success are synchronous commands.

use std::io::{self, Read, Write};

use bootstate::Slot;

use crate::engine::CyclePhase;
use crate::error::ErrorKind;

pub const MAGIC0: u8 = b'F';
pub const MAGIC1: u8 = b'C';
pub const VERSION: u8 = 1;

pub const OP_STATUS: u8 = 1;
pub const OP_CHECK: u8 = 2;
pub const OP_ROLLBACK: u8 = 3;
pub const OP_MARK_SUCCESS: u8 = 4;

pub const STATUS_OK: u8 = 0;
/// An update cycle is already in flight; the command was rejected.
pub const STATUS_BUSY: u8 = 1;
pub const STATUS_FAILED: u8 = 2;
pub const STATUS_MALFORMED: u8 = 3;
pub const STATUS_UNSUPPORTED: u8 = 4;

/// Upper bound on a control frame.
pub const MAX_FRAME: usize = 4096;

const SLOT_NONE: u8 = 0xff;
const FLAG_BOTH_FAILED: u8 = 0b0000_0001;
const MAX_ERROR_MESSAGE: usize = 512;

/// Control protocol failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlError {
    Malformed,
    FrameTooLarge,
}

impl core::fmt::Display for ControlError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ControlError::Malformed => write!(f, "malformed control frame"),
            ControlError::FrameTooLarge => write!(f, "control frame too large"),
        }
    }
}

impl std::error::Error for ControlError {}

/// Last cycle failure, as reported by the status query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastError {
    pub kind: ErrorKind,
    pub message: String,
}

/// Agent snapshot returned by `OP_STATUS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub phase: CyclePhase,
    pub active_slot: Slot,
    pub pending_switch: Option<Slot>,
    pub both_failed: bool,
    pub attempt_count: u8,
    pub attempt_limit: u8,
    pub confirmed_version: String,
    pub pending_version: Option<String>,
    pub last_error: Option<LastError>,
}

fn slot_to_byte(slot: Slot) -> u8 {
    match slot {
        Slot::A => 0,
        Slot::B => 1,
    }
}

fn slot_from_byte(byte: u8) -> Result<Slot, ControlError> {
    match byte {
        0 => Ok(Slot::A),
        1 => Ok(Slot::B),
        _ => Err(ControlError::Malformed),
    }
}

pub fn encode_request(op: u8) -> Vec<u8> {
    vec![MAGIC0, MAGIC1, VERSION, op]
}

/// Validates a request frame and returns its opcode.
pub fn decode_request(frame: &[u8]) -> Result<u8, ControlError> {
    if frame.len() != 4 || frame[0] != MAGIC0 || frame[1] != MAGIC1 || frame[2] != VERSION {
        return Err(ControlError::Malformed);
    }
    Ok(frame[3])
}

pub fn encode_simple_response(op: u8, status: u8) -> Vec<u8> {
    vec![MAGIC0, MAGIC1, VERSION, op | 0x80, status]
}

/// Decodes a command response, returning its status byte.
pub fn decode_simple_response(expected_op: u8, frame: &[u8]) -> Result<u8, ControlError> {
    if frame.len() != 5 || frame[0] != MAGIC0 || frame[1] != MAGIC1 || frame[2] != VERSION {
        return Err(ControlError::Malformed);
    }
    if frame[3] != (expected_op | 0x80) {
        return Err(ControlError::Malformed);
    }
    Ok(frame[4])
}

pub fn encode_status_response(report: &StatusReport) -> Vec<u8> {
    let confirmed = report.confirmed_version.as_bytes();
    let pending = report.pending_version.as_deref().unwrap_or("").as_bytes();
    let message = report
        .last_error
        .as_ref()
        .map(|err| truncated(&err.message))
        .unwrap_or_default();

    let mut out = Vec::with_capacity(16 + confirmed.len() + pending.len() + message.len());
    out.push(MAGIC0);
    out.push(MAGIC1);
    out.push(VERSION);
    out.push(OP_STATUS | 0x80);
    out.push(STATUS_OK);
    out.push(report.phase.to_byte());
    out.push(slot_to_byte(report.active_slot));
    out.push(report.pending_switch.map(slot_to_byte).unwrap_or(SLOT_NONE));
    out.push(if report.both_failed { FLAG_BOTH_FAILED } else { 0 });
    out.push(report.attempt_count);
    out.push(report.attempt_limit);
    out.push(report.last_error.as_ref().map(|err| err.kind.to_byte()).unwrap_or(0));
    out.push(confirmed.len() as u8);
    out.extend_from_slice(confirmed);
    out.push(pending.len() as u8);
    out.extend_from_slice(pending);
    out.extend_from_slice(&(message.len() as u16).to_le_bytes());
    out.extend_from_slice(message.as_bytes());
    out
}

pub fn decode_status_response(frame: &[u8]) -> Result<StatusReport, ControlError> {
    if frame.len() < 13 || frame[0] != MAGIC0 || frame[1] != MAGIC1 || frame[2] != VERSION {
        return Err(ControlError::Malformed);
    }
    if frame[3] != (OP_STATUS | 0x80) || frame[4] != STATUS_OK {
        return Err(ControlError::Malformed);
    }
    let phase = CyclePhase::from_byte(frame[5]).ok_or(ControlError::Malformed)?;
    let active_slot = slot_from_byte(frame[6])?;
    let pending_switch = match frame[7] {
        SLOT_NONE => None,
        byte => Some(slot_from_byte(byte)?),
    };
    let both_failed = frame[8] & FLAG_BOTH_FAILED != 0;
    let attempt_count = frame[9];
    let attempt_limit = frame[10];
    let error_kind = frame[11];

    let mut pos = 12;
    let confirmed_version = read_short_string(frame, &mut pos)?;
    let pending_version = {
        let text = read_short_string(frame, &mut pos)?;
        if text.is_empty() { None } else { Some(text) }
    };

    if pos + 2 > frame.len() {
        return Err(ControlError::Malformed);
    }
    let message_len = u16::from_le_bytes([frame[pos], frame[pos + 1]]) as usize;
    pos += 2;
    if pos + message_len != frame.len() {
        return Err(ControlError::Malformed);
    }
    let message = std::str::from_utf8(&frame[pos..pos + message_len])
        .map_err(|_| ControlError::Malformed)?
        .to_string();

    let last_error = match ErrorKind::from_byte(error_kind) {
        Some(kind) => Some(LastError { kind, message }),
        None if error_kind == 0 => None,
        None => return Err(ControlError::Malformed),
    };

    Ok(StatusReport {
        phase,
        active_slot,
        pending_switch,
        both_failed,
        attempt_count,
        attempt_limit,
        confirmed_version,
        pending_version,
        last_error,
    })
}

fn read_short_string(frame: &[u8], pos: &mut usize) -> Result<String, ControlError> {
    if *pos >= frame.len() {
        return Err(ControlError::Malformed);
    }
    let len = frame[*pos] as usize;
    *pos += 1;
    if *pos + len > frame.len() {
        return Err(ControlError::Malformed);
    }
    let text = std::str::from_utf8(&frame[*pos..*pos + len])
        .map_err(|_| ControlError::Malformed)?
        .to_string();
    *pos += len;
    Ok(text)
}

fn truncated(message: &str) -> String {
    if message.len() <= MAX_ERROR_MESSAGE {
        return message.to_string();
    }
    let mut end = MAX_ERROR_MESSAGE;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_string()
}

/// Writes one length-prefixed frame.
pub fn write_frame(stream: &mut dyn Write, frame: &[u8]) -> io::Result<()> {
    if frame.len() > MAX_FRAME {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "frame exceeds maximum size"));
    }
    stream.write_all(&(frame.len() as u32).to_be_bytes())?;
    stream.write_all(frame)?;
    stream.flush()
}

/// Reads one length-prefixed frame.
pub fn read_frame(stream: &mut dyn Read) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "frame exceeds maximum size"));
    }
    let mut frame = vec![0u8; len];
    stream.read_exact(&mut frame)?;
    Ok(frame)
}
