// Copyright 2026 Falconboot Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: fotad entrypoint – argument handling and service wiring
//! OWNERS: @services-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: No tests (wiring only)
//! ADR: docs/adr/0002-update-agent.md

#![forbid(unsafe_code)]

use std::fs;
use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;

use bootstate::{FileNvRegion, RedundantStore};
use fota::control::STATUS_OK;
use fota::engine::{CycleOutcome, EngineConfig, UpdateEngine};
use fota::HttpTransport;

use fotad::agent::{self, Agent, Command, StatusShared};
use fotad::config::{DaemonConfig, DEFAULT_CONFIG_PATH};
use fotad::provision::{LinuxPower, LinuxProvisioner};
use fotad::server;

enum Mode {
    Daemon,
    CheckOnce,
    MarkSuccess,
}

struct Args {
    config: PathBuf,
    mode: Mode,
}

fn print_usage() {
    println!("fotad {} - A/B firmware update agent", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Usage: fotad [options]");
    println!();
    println!("Options:");
    println!("  --config <path>   Config file (default {DEFAULT_CONFIG_PATH})");
    println!("  --check           Run one update cycle and exit");
    println!("  --mark-success    Confirm the current boot and exit");
    println!("  --version         Show version and exit");
    println!("  --help            Show this help");
}

fn parse_args() -> Result<Option<Args>, Box<dyn std::error::Error>> {
    let mut config = PathBuf::from(DEFAULT_CONFIG_PATH);
    let mut mode = Mode::Daemon;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                config = PathBuf::from(
                    args.next().ok_or("--config requires a path")?,
                );
            }
            "--check" => mode = Mode::CheckOnce,
            "--mark-success" => mode = Mode::MarkSuccess,
            "--version" => {
                println!("fotad {}", env!("CARGO_PKG_VERSION"));
                return Ok(None);
            }
            "--help" => {
                print_usage();
                return Ok(None);
            }
            other => return Err(format!("unknown option: {other}").into()),
        }
    }
    Ok(Some(Args { config, mode }))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let Some(args) = parse_args()? else {
        return Ok(());
    };
    let config = DaemonConfig::load(&args.config)?;

    // Persistent data partition skeleton, created once.
    fs::create_dir_all(&config.data_dir)?;
    fs::create_dir_all(&config.scratch_dir)?;
    if let Some(parent) = config.state_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let region = FileNvRegion::open(&config.state_path)?;
    let mut store = RedundantStore::new(region);

    if let Mode::MarkSuccess = args.mode {
        if agent::mark_boot_success(&mut store, None) != STATUS_OK {
            return Err("boot confirmation failed".into());
        }
        return Ok(());
    }

    let transport = HttpTransport::new(
        HttpTransport::manifest_url(&config.server_url, &config.device_id),
        config.check_timeout(),
        config.download_timeout(),
    );
    let provisioner = LinuxProvisioner::new(&config);
    let engine_config = EngineConfig {
        scratch_dir: config.scratch_dir.clone(),
        download_retries: config.download_retries,
        publisher_key: config.publisher_key_bytes()?,
        cmdline_a: config.slot_a.cmdline.clone(),
        cmdline_b: config.slot_b.cmdline.clone(),
    };
    let mut engine = UpdateEngine::new(transport, provisioner, LinuxPower, engine_config);

    if let Mode::CheckOnce = args.mode {
        let cancel = AtomicBool::new(false);
        return match engine.run_cycle(&mut store, &cancel) {
            Ok(CycleOutcome::NoUpdate) => {
                println!("no update available");
                Ok(())
            }
            Ok(CycleOutcome::Staged { version, slot }) => {
                println!("staged {version} on slot {slot}; reboot requested");
                Ok(())
            }
            Err(err) => Err(format!("update check failed: {err}").into()),
        };
    }

    // Daemon mode.
    let cancel = Arc::new(AtomicBool::new(false));
    let (state, recovered) = store.load_or_default();
    if recovered {
        log::warn!("fotad: boot state unreadable, rewriting safe defaults");
        let _ = store.write(&state);
    }
    let status = StatusShared::new(engine.phase_cell(), state);
    let (tx, rx) = mpsc::channel();

    {
        let cancel = cancel.clone();
        let tx = tx.clone();
        ctrlc::set_handler(move || {
            cancel.store(true, Ordering::Relaxed);
            let _ = tx.send(Command::Shutdown);
        })?;
    }

    // Stale socket from a previous run.
    let _ = fs::remove_file(&config.control_socket);
    let listener = UnixListener::bind(&config.control_socket)?;
    let server_handle = {
        let tx = tx.clone();
        let status = status.clone();
        let cancel = cancel.clone();
        thread::spawn(move || server::serve(listener, tx, status, cancel))
    };
    let monitor_handle =
        agent::spawn_boot_monitor(tx.clone(), config.stabilize_delay(), cancel.clone());

    log::info!(
        "fotad {} started (device {}, slot {})",
        env!("CARGO_PKG_VERSION"),
        config.device_id,
        state.active_slot,
    );

    let mut agent = Agent::new(engine, store, status, rx, cancel, config.poll_interval());
    agent.run();

    let _ = monitor_handle.join();
    let _ = server_handle.join();
    let _ = fs::remove_file(&config.control_socket);
    Ok(())
}
