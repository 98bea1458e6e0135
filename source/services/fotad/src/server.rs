// Copyright 2026 Falconboot Contributors
// SPDX-License-Identifier: Apache-2.0

//! Control socket server.
//!
//! One framed request per connection over the daemon's Unix socket. The
//! status query answers from the shared snapshot without touching the
//! agent; commands are routed through the command channel and gated on
//! the agent being idle.

use std::io;
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use fota::control;
use fota::engine::CyclePhase;

use crate::agent::{Command, StatusShared};

const ACCEPT_POLL: Duration = Duration::from_millis(100);
const IO_TIMEOUT: Duration = Duration::from_secs(5);
const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Accept loop; returns once the cancellation flag is raised.
pub fn serve(
    listener: UnixListener,
    tx: Sender<Command>,
    status: Arc<StatusShared>,
    cancel: Arc<AtomicBool>,
) {
    if let Err(err) = listener.set_nonblocking(true) {
        log::error!("fotad: control socket: {err}");
        return;
    }
    log::info!("fotad: control socket ready");
    loop {
        if cancel.load(Ordering::Relaxed) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_connection(stream, &tx, &status) {
                    log::debug!("fotad: control connection: {err}");
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(err) => {
                log::warn!("fotad: control accept: {err}");
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
    log::info!("fotad: control socket closed");
}

fn handle_connection(
    mut stream: UnixStream,
    tx: &Sender<Command>,
    status: &StatusShared,
) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(IO_TIMEOUT))?;
    stream.set_write_timeout(Some(IO_TIMEOUT))?;

    let frame = control::read_frame(&mut stream)?;
    let response = match control::decode_request(&frame) {
        Err(_) => control::encode_simple_response(0, control::STATUS_MALFORMED),
        Ok(control::OP_STATUS) => control::encode_status_response(&status.snapshot()),
        Ok(op @ (control::OP_CHECK | control::OP_ROLLBACK | control::OP_MARK_SUCCESS)) => {
            control::encode_simple_response(op, dispatch_command(op, tx, status))
        }
        Ok(op) => control::encode_simple_response(op, control::STATUS_UNSUPPORTED),
    };
    control::write_frame(&mut stream, &response)
}

fn dispatch_command(op: u8, tx: &Sender<Command>, status: &StatusShared) -> u8 {
    // One in-flight cycle at a time; commands are rejected, not queued.
    if status.phase() != CyclePhase::Idle {
        return control::STATUS_BUSY;
    }
    let (reply_tx, reply_rx) = mpsc::channel();
    let command = match op {
        control::OP_CHECK => Command::CheckNow { reply: reply_tx },
        control::OP_ROLLBACK => Command::Rollback { reply: reply_tx },
        control::OP_MARK_SUCCESS => Command::MarkSuccess { reply: reply_tx },
        _ => return control::STATUS_UNSUPPORTED,
    };
    if tx.send(command).is_err() {
        return control::STATUS_FAILED;
    }
    reply_rx.recv_timeout(REPLY_TIMEOUT).unwrap_or(control::STATUS_FAILED)
}
