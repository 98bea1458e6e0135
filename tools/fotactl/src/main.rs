// Copyright 2026 Falconboot Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Operator CLI for the update agent
//! OWNERS: @tools-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Protocol covered in the fota control module
//!
//! PUBLIC API:
//!   - CLI: fotactl [--socket <path>] status|check|rollback|mark-success

#![forbid(unsafe_code)]

use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

use fota::control::{
    self, StatusReport, OP_CHECK, OP_MARK_SUCCESS, OP_ROLLBACK, OP_STATUS, STATUS_BUSY, STATUS_OK,
};

const DEFAULT_SOCKET: &str = "/run/fotad.sock";
const IO_TIMEOUT: Duration = Duration::from_secs(15);

struct Args {
    socket: PathBuf,
    command: String,
}

fn print_usage() {
    println!("fotactl {} - operator interface for fotad", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Usage: fotactl [--socket <path>] <command>");
    println!();
    println!("Commands:");
    println!("  status        Show agent state, slots, and versions");
    println!("  check         Trigger an update check now");
    println!("  rollback      Flip the active slot immediately");
    println!("  mark-success  Confirm the current boot");
}

fn parse_args() -> Result<Option<Args>, String> {
    let mut socket = PathBuf::from(DEFAULT_SOCKET);
    let mut command = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--socket" => {
                socket = PathBuf::from(args.next().ok_or("--socket requires a path")?);
            }
            "--help" | "-h" => {
                print_usage();
                return Ok(None);
            }
            other if command.is_none() && !other.starts_with('-') => {
                command = Some(other.to_string());
            }
            other => return Err(format!("unexpected argument: {other}")),
        }
    }
    match command {
        Some(command) => Ok(Some(Args { socket, command })),
        None => {
            print_usage();
            Err("missing command".into())
        }
    }
}

fn roundtrip(socket: &PathBuf, request: Vec<u8>) -> Result<Vec<u8>, String> {
    let mut stream = UnixStream::connect(socket)
        .map_err(|err| format!("connect {}: {err}", socket.display()))?;
    stream.set_read_timeout(Some(IO_TIMEOUT)).map_err(|err| err.to_string())?;
    stream.set_write_timeout(Some(IO_TIMEOUT)).map_err(|err| err.to_string())?;
    control::write_frame(&mut stream, &request).map_err(|err| err.to_string())?;
    control::read_frame(&mut stream).map_err(|err| err.to_string())
}

fn print_status(report: &StatusReport) {
    println!("state:             {}", report.phase.label());
    println!("active slot:       {}", report.active_slot);
    println!("standby slot:      {}", report.active_slot.other());
    println!(
        "attempts:          {}/{}",
        report.attempt_count, report.attempt_limit
    );
    println!(
        "confirmed version: {}",
        if report.confirmed_version.is_empty() { "(none)" } else { &report.confirmed_version }
    );
    match &report.pending_version {
        Some(version) => println!("pending version:   {version}"),
        None => println!("pending version:   (none)"),
    }
    match report.pending_switch {
        Some(slot) => println!("pending switch:    slot {slot}"),
        None => println!("pending switch:    (none)"),
    }
    if report.both_failed {
        println!("warning:           both slots failing, device needs recovery");
    }
    match &report.last_error {
        Some(err) => println!("last error:        {}: {}", err.kind.label(), err.message),
        None => println!("last error:        (none)"),
    }
}

fn run_command(args: &Args) -> Result<(), String> {
    match args.command.as_str() {
        "status" => {
            let frame = roundtrip(&args.socket, control::encode_request(OP_STATUS))?;
            let report =
                control::decode_status_response(&frame).map_err(|err| err.to_string())?;
            print_status(&report);
            Ok(())
        }
        "check" | "rollback" | "mark-success" => {
            let op = match args.command.as_str() {
                "check" => OP_CHECK,
                "rollback" => OP_ROLLBACK,
                _ => OP_MARK_SUCCESS,
            };
            let frame = roundtrip(&args.socket, control::encode_request(op))?;
            let status =
                control::decode_simple_response(op, &frame).map_err(|err| err.to_string())?;
            match status {
                STATUS_OK => {
                    println!("{}: ok", args.command);
                    Ok(())
                }
                STATUS_BUSY => Err(format!("{}: agent busy, try again later", args.command)),
                other => Err(format!("{}: failed (status {other})", args.command)),
            }
        }
        other => Err(format!("unknown command: {other}")),
    }
}

fn main() -> std::process::ExitCode {
    let args = match parse_args() {
        Ok(Some(args)) => args,
        Ok(None) => return std::process::ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("fotactl: {err}");
            return std::process::ExitCode::FAILURE;
        }
    };
    match run_command(&args) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("fotactl: {err}");
            std::process::ExitCode::FAILURE
        }
    }
}
