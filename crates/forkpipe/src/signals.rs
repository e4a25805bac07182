//! Signal state shared between handlers and normal control flow.
//!
//! Handlers never do more than an atomic store: the termination signal
//! number (first one wins) and a counter of SIGCHLD deliveries. Reaping,
//! killing, cleanup and output all happen in the code that observes these
//! flags through [`Interrupts::checkpoint`].
//!
//! Handlers are installed without `SA_RESTART`, so a blocking open, read,
//! write or sleep returns `EINTR` and gets a chance to look at the flags.

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::bridge::transport::{Interrupts, TransportError};

/// Signals that ask a process to stop.
pub const TERMINATION_SIGNALS: [Signal; 3] = [Signal::SIGTERM, Signal::SIGINT, Signal::SIGPIPE];

static STATE: SignalState = SignalState::new();

#[derive(Debug)]
pub struct SignalState {
    termination: AtomicI32,
    child_events: AtomicU32,
}

impl SignalState {
    pub const fn new() -> Self {
        Self {
            termination: AtomicI32::new(0),
            child_events: AtomicU32::new(0),
        }
    }

    /// The process-wide state the installed handlers write to.
    pub fn global() -> &'static SignalState {
        &STATE
    }

    pub fn termination(&self) -> Option<Signal> {
        match self.termination.load(Ordering::SeqCst) {
            0 => None,
            raw => Signal::try_from(raw).ok(),
        }
    }

    pub fn request_termination(&self, signal: Signal) {
        self.store_termination(signal as i32);
    }

    fn store_termination(&self, raw: i32) {
        // The first termination signal is the one that gets reported.
        let _ = self
            .termination
            .compare_exchange(0, raw, Ordering::SeqCst, Ordering::SeqCst);
    }

    pub fn record_child_event(&self) {
        self.child_events.fetch_add(1, Ordering::SeqCst);
    }

    /// Returns the number of SIGCHLD deliveries since the last call.
    pub fn take_child_events(&self) -> u32 {
        self.child_events.swap(0, Ordering::SeqCst)
    }

    /// Clears all flags.
    pub fn reset(&self) {
        self.termination.store(0, Ordering::SeqCst);
        self.child_events.store(0, Ordering::SeqCst);
    }
}

impl Default for SignalState {
    fn default() -> Self {
        Self::new()
    }
}

impl Interrupts for &SignalState {
    fn checkpoint(&mut self) -> Result<(), TransportError> {
        match self.termination() {
            Some(signal) => Err(TransportError::Interrupted(signal)),
            None => Ok(()),
        }
    }
}

extern "C" fn on_termination(signum: libc::c_int) {
    STATE.store_termination(signum);
}

extern "C" fn on_child(_signum: libc::c_int) {
    STATE.record_child_event();
}

fn install(signal: Signal, handler: SigHandler, flags: SaFlags) -> nix::Result<()> {
    let action = SigAction::new(handler, flags, SigSet::empty());
    // SAFETY: the handlers above only touch atomics in a static, which is
    // async-signal-safe.
    unsafe { signal::sigaction(signal, &action) }.map(drop)
}

/// Installs the supervisor's handlers: termination signals plus SIGCHLD.
///
/// Must run before the first fork so no child exit can go unnoticed.
pub fn install_supervisor() -> nix::Result<&'static SignalState> {
    for signal in TERMINATION_SIGNALS {
        install(signal, SigHandler::Handler(on_termination), SaFlags::empty())?;
    }
    install(Signal::SIGCHLD, SigHandler::Handler(on_child), SaFlags::SA_NOCLDSTOP)?;
    Ok(&STATE)
}

/// Installs a worker's handlers in a freshly forked child.
///
/// A termination request that reached the supervisor just before the fork
/// is kept, so the new worker stops right away.
pub fn install_worker() -> nix::Result<&'static SignalState> {
    STATE.take_child_events();
    for signal in TERMINATION_SIGNALS {
        install(signal, SigHandler::Handler(on_termination), SaFlags::empty())?;
    }
    install(Signal::SIGCHLD, SigHandler::SigDfl, SaFlags::empty())?;
    Ok(&STATE)
}
