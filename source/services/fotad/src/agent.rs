// Copyright 2026 Falconboot Contributors
// SPDX-License-Identifier: Apache-2.0

//! Agent loop: one state machine fed by poll ticks and operator commands.
//!
//! All boot-state writes happen on this thread; the control server only
//! sends commands and reads shared snapshots. A manual trigger received
//! while a cycle is in flight is rejected as busy at the server, so one
//! cycle runs at a time and the standby slot keeps a single writer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bootstate::{BootState, NvRegion, RedundantStore};
use fota::control::{LastError, StatusReport, STATUS_FAILED, STATUS_OK};
use fota::engine::{
    CycleOutcome, CyclePhase, PhaseCell, PowerControl, SlotProvisioner, UpdateEngine,
    UpdateTransport,
};
use fota::error::UpdateError;

/// Commands fed to the agent loop.
pub enum Command {
    CheckNow { reply: Sender<u8> },
    Rollback { reply: Sender<u8> },
    MarkSuccess { reply: Sender<u8> },
    Shutdown,
}

struct StatusInner {
    state: BootState,
    last_error: Option<LastError>,
}

/// Snapshot surface shared with the control server. Side-effect free to
/// read; the agent refreshes it after every transition.
pub struct StatusShared {
    phase: PhaseCell,
    inner: Mutex<StatusInner>,
}

impl StatusShared {
    pub fn new(phase: PhaseCell, state: BootState) -> Arc<Self> {
        Arc::new(Self {
            phase,
            inner: Mutex::new(StatusInner { state, last_error: None }),
        })
    }

    pub fn phase(&self) -> CyclePhase {
        self.phase.get()
    }

    pub fn snapshot(&self) -> StatusReport {
        let inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let state = inner.state;
        StatusReport {
            phase: self.phase.get(),
            active_slot: state.active_slot,
            pending_switch: state.pending_switch,
            both_failed: state.both_failed,
            attempt_count: state.attempt_count,
            attempt_limit: state.attempt_limit,
            confirmed_version: state.confirmed_version.as_str().to_string(),
            pending_version: state.pending_version.map(|tag| tag.as_str().to_string()),
            last_error: inner.last_error.clone(),
        }
    }

    fn update_state(&self, state: &BootState) {
        let mut inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.state = *state;
    }

    fn set_error(&self, error: Option<LastError>) {
        let mut inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.last_error = error;
    }

    fn reset_phase(&self) {
        self.phase.set(CyclePhase::Idle);
    }
}

/// The long-running update agent.
pub struct Agent<T, P, C, N: NvRegion> {
    engine: UpdateEngine<T, P, C>,
    store: RedundantStore<N>,
    status: Arc<StatusShared>,
    rx: Receiver<Command>,
    cancel: Arc<AtomicBool>,
    poll_interval: Duration,
}

impl<T, P, C, N> Agent<T, P, C, N>
where
    T: UpdateTransport,
    P: SlotProvisioner,
    C: PowerControl,
    N: NvRegion,
{
    pub fn new(
        engine: UpdateEngine<T, P, C>,
        store: RedundantStore<N>,
        status: Arc<StatusShared>,
        rx: Receiver<Command>,
        cancel: Arc<AtomicBool>,
        poll_interval: Duration,
    ) -> Self {
        Self { engine, store, status, rx, cancel, poll_interval }
    }

    /// Main loop. Returns on shutdown command, signal, or a dropped
    /// command channel.
    pub fn run(&mut self) {
        let mut next_poll = Instant::now();
        loop {
            if self.cancel.load(Ordering::Relaxed) {
                break;
            }
            let now = Instant::now();
            if now >= next_poll {
                self.run_cycle();
                next_poll = Instant::now() + self.poll_interval;
                continue;
            }
            match self.rx.recv_timeout(next_poll - now) {
                Ok(Command::Shutdown) => break,
                Ok(Command::CheckNow { reply }) => {
                    let _ = reply.send(STATUS_OK);
                    self.run_cycle();
                    next_poll = Instant::now() + self.poll_interval;
                }
                Ok(Command::Rollback { reply }) => {
                    let _ = reply.send(self.do_rollback());
                }
                Ok(Command::MarkSuccess { reply }) => {
                    let _ = reply.send(mark_boot_success(&mut self.store, Some(&self.status)));
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        log::info!("fotad: agent stopped");
    }

    fn run_cycle(&mut self) {
        match self.engine.run_cycle(&mut self.store, &self.cancel) {
            Ok(CycleOutcome::NoUpdate) => {
                self.status.set_error(None);
            }
            Ok(CycleOutcome::Staged { version, slot }) => {
                log::info!("fotad: staged {version} on slot {slot}, awaiting reboot");
                self.status.set_error(None);
            }
            Err(UpdateError::Canceled) => {
                log::info!("fotad: update cycle canceled");
            }
            Err(err) => {
                log::error!("fotad: update cycle failed: {err}");
                self.status
                    .set_error(Some(LastError { kind: err.kind(), message: err.to_string() }));
            }
        }
        // Errors are cycle-local: back to idle until the next poll.
        self.status.reset_phase();
        let (state, _) = self.store.load_or_default();
        self.status.update_state(&state);
    }

    fn do_rollback(&mut self) -> u8 {
        let (mut state, recovered) = self.store.load_or_default();
        if recovered {
            log::warn!("fotad: boot state recovered to defaults before rollback");
        }
        let now_active = state.force_rollback();
        match self.store.write(&state) {
            Ok(()) => {
                log::info!("fotad: forced rollback, active slot now {now_active}");
                self.status.update_state(&state);
                STATUS_OK
            }
            Err(err) => {
                log::error!("fotad: rollback persist failed: {err}");
                STATUS_FAILED
            }
        }
    }
}

/// Confirms the current boot: resets the attempt budget and promotes a
/// pending version. Shared by the agent loop, the boot success monitor,
/// and the one-shot `--mark-success` mode.
pub fn mark_boot_success<N: NvRegion>(
    store: &mut RedundantStore<N>,
    status: Option<&Arc<StatusShared>>,
) -> u8 {
    let (mut state, recovered) = store.load_or_default();
    if recovered {
        log::warn!("fotad: boot state recovered to defaults");
    }
    let promoted = state.mark_success();
    match store.write(&state) {
        Ok(()) => {
            match promoted {
                Some(version) => {
                    log::info!("fotad: boot confirmed, version promoted to {version}")
                }
                None => log::info!("fotad: boot confirmed"),
            }
            if let Some(status) = status {
                status.update_state(&state);
            }
            STATUS_OK
        }
        Err(err) => {
            log::error!("fotad: boot confirmation persist failed: {err}");
            STATUS_FAILED
        }
    }
}

/// Boot success monitor: waits out the stabilization delay, then routes a
/// mark-success through the agent thread. Never fires at process start;
/// a boot that dies inside the delay keeps burning attempt budget, which
/// is exactly what makes rollback trigger.
pub fn spawn_boot_monitor(
    tx: Sender<Command>,
    delay: Duration,
    cancel: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let deadline = Instant::now() + delay;
        loop {
            if cancel.load(Ordering::Relaxed) {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(Duration::from_millis(500)));
        }
        let (reply_tx, reply_rx) = mpsc::channel();
        if tx.send(Command::MarkSuccess { reply: reply_tx }).is_ok() {
            let _ = reply_rx.recv_timeout(Duration::from_secs(30));
        }
    })
}
