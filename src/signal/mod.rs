//! Interruption handling
//!
//! On SIGINT/SIGTERM a mutating workflow must restore the `tmp` journal
//! slot before the process exits:
//! 1. First signal: request cancellation; the orchestrator notices, tears
//!    down the native build, restores the journal and rethrows.
//! 2. Second signal: exit immediately after the journal restore.
//! 3. Third and later signals: ignored.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use crate::env::CancelToken;

/// Exit code used when a run is cancelled by a signal.
pub const EXIT_CODE_INTERRUPTED: i32 = 80;

/// Shared signal state, written by the signal handler and polled by the
/// orchestrator.
#[derive(Debug, Default)]
pub struct SignalState {
    cancel_requested: AtomicBool,
    immediate_exit: AtomicBool,
    signal_count: AtomicU8,
}

/// Action decided for one received signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// First signal: cancel the workflow and recover
    InitiateRecovery,
    /// Second signal: exit as soon as the journal is restored
    ImmediateExit,
    /// Third+ signal: ignore
    Ignore,
}

impl SignalState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    pub fn is_immediate_exit(&self) -> bool {
        self.immediate_exit.load(Ordering::SeqCst)
    }

    /// Record one received signal and decide what to do about it.
    pub fn handle_signal(&self) -> SignalAction {
        let count = self.signal_count.fetch_add(1, Ordering::SeqCst);
        if count == 0 {
            self.cancel_requested.store(true, Ordering::SeqCst);
            SignalAction::InitiateRecovery
        } else if count == 1 {
            self.immediate_exit.store(true, Ordering::SeqCst);
            SignalAction::ImmediateExit
        } else {
            SignalAction::Ignore
        }
    }

    /// Reset state (tests only).
    pub fn reset(&self) {
        self.cancel_requested.store(false, Ordering::SeqCst);
        self.immediate_exit.store(false, Ordering::SeqCst);
        self.signal_count.store(0, Ordering::SeqCst);
    }
}

/// Installs the process signal handler and bridges it to a `CancelToken`
/// the native builder polls.
pub struct SignalHandler {
    state: Arc<SignalState>,
    cancel: CancelToken,
}

impl SignalHandler {
    pub fn new() -> Self {
        Self {
            state: Arc::new(SignalState::new()),
            cancel: CancelToken::new(),
        }
    }

    pub fn state(&self) -> Arc<SignalState> {
        Arc::clone(&self.state)
    }

    /// The token tripped on the first signal.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Install the SIGINT/SIGTERM handler. Call once at startup.
    pub fn install(&self) -> Result<(), ctrlc::Error> {
        let state = Arc::clone(&self.state);
        let cancel = self.cancel.clone();
        ctrlc::set_handler(move || match state.handle_signal() {
            SignalAction::InitiateRecovery => {
                cancel.cancel();
                eprintln!("\nInterrupted, restoring project...");
            }
            SignalAction::ImmediateExit => {
                eprintln!("\nSecond interrupt, exiting as soon as the project is restored...");
            }
            SignalAction::Ignore => {}
        })
    }
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new()
    }
}
