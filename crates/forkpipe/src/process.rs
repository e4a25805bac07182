//! Worker process records: reaping, failure classification and teardown.

use std::fmt;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;

use crate::bridge::transport::{Interrupts, TransportError};
use crate::exit::ExitCode;
use crate::signals::SignalState;
use crate::status::{self, Arg};

const REAP_SLICE: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Supervisor,
    /// Worker A: sums the vector and forwards the aggregate.
    Sum,
    /// Worker B: applies the command and combines both results.
    Command,
}

impl Role {
    /// Prefix used on status lines.
    pub fn tag(self) -> &'static str {
        match self {
            Self::Supervisor => "[Parent]",
            Self::Sum => "[First Child]",
            Self::Command => "[Second Child]",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Supervisor => "supervisor",
            Self::Sum => "sum",
            Self::Command => "command",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Running,
    Exited(i32),
    Killed(Signal),
}

impl Liveness {
    pub fn is_running(self) -> bool {
        self == Self::Running
    }

    /// Neither running, a clean exit, nor the self-terminated sentinel.
    pub fn is_failure(self) -> bool {
        match self {
            Self::Running => false,
            Self::Exited(code) => ExitCode::is_worker_failure(code),
            Self::Killed(_) => true,
        }
    }
}

impl fmt::Display for Liveness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => f.write_str("running"),
            Self::Exited(code) => write!(f, "exit status {code}"),
            Self::Killed(signal) => write!(f, "signal {signal:?}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessRecord {
    pub role: Role,
    pub pid: Pid,
    pub liveness: Liveness,
}

impl ProcessRecord {
    pub fn is_running(&self) -> bool {
        self.liveness.is_running()
    }
}

/// The supervisor's view of its workers.
///
/// Records are only mutated from normal control flow: the SIGCHLD handler
/// merely counts deliveries, and [`Interrupts::checkpoint`] or the wait
/// loop turn those into non-blocking reaps.
#[derive(Debug)]
pub struct ProcessTable<'a> {
    signals: &'a SignalState,
    records: Vec<ProcessRecord>,
}

impl<'a> ProcessTable<'a> {
    pub fn new(signals: &'a SignalState) -> Self {
        Self {
            signals,
            records: Vec::with_capacity(2),
        }
    }

    pub fn track(&mut self, role: Role, pid: Pid) {
        tracing::debug!(%role, pid = pid.as_raw(), "Tracking worker");
        self.records.push(ProcessRecord {
            role,
            pid,
            liveness: Liveness::Running,
        });
    }

    pub fn records(&self) -> &[ProcessRecord] {
        &self.records
    }

    pub fn record(&self, role: Role) -> Option<&ProcessRecord> {
        self.records.iter().find(|r| r.role == role)
    }

    pub fn live_count(&self) -> usize {
        self.records.iter().filter(|r| r.is_running()).count()
    }

    /// The first worker that terminated abnormally, if any.
    pub fn first_failure(&self) -> Option<&ProcessRecord> {
        self.records.iter().find(|r| r.liveness.is_failure())
    }

    /// Reaps every tracked worker that has terminated, without blocking.
    ///
    /// Returns how many were reaped by this call.
    pub fn reap(&mut self) -> usize {
        let mut reaped = 0;
        for record in self.records.iter_mut().filter(|r| r.is_running()) {
            match waitpid(record.pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(status) => {
                    if let Some(liveness) = terminal(status) {
                        record.liveness = liveness;
                    } else {
                        continue;
                    }
                }
                Err(Errno::ECHILD) => {
                    tracing::warn!(role = %record.role, pid = record.pid.as_raw(), "Worker was reaped elsewhere");
                    record.liveness = Liveness::Exited(-1);
                }
                Err(e) => {
                    tracing::warn!(role = %record.role, error = %e, "waitpid failed");
                    continue;
                }
            }
            reaped += 1;
            report(record);
        }
        reaped
    }

    /// Stops every live worker: SIGTERM, up to `grace` for them to exit,
    /// then SIGKILL and a blocking reap.
    pub fn terminate_live(&mut self, grace: Duration) {
        for record in self.records.iter().filter(|r| r.is_running()) {
            status::out("[Parent] Killing child with PID %d\n", &[Arg::Int(record.pid.as_raw())]);
            send_signal(record, Signal::SIGTERM);
        }

        let deadline = Instant::now() + grace;
        loop {
            self.reap();
            if self.live_count() == 0 || Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(REAP_SLICE);
        }

        for record in self.records.iter_mut().filter(|r| r.is_running()) {
            tracing::warn!(role = %record.role, pid = record.pid.as_raw(), "Worker ignored SIGTERM, sending SIGKILL");
            send_signal(record, Signal::SIGKILL);
            record.liveness = reap_blocking(record.pid);
            report(record);
        }
    }
}

impl Interrupts for ProcessTable<'_> {
    fn checkpoint(&mut self) -> Result<(), TransportError> {
        if let Some(signal) = self.signals.termination() {
            return Err(TransportError::Interrupted(signal));
        }
        if self.signals.take_child_events() > 0 {
            self.reap();
        }
        match self.first_failure() {
            Some(record) => Err(TransportError::Aborted(format!(
                "{} worker (pid {}) terminated with {}",
                record.role, record.pid, record.liveness
            ))),
            None => Ok(()),
        }
    }
}

fn terminal(status: WaitStatus) -> Option<Liveness> {
    match status {
        WaitStatus::Exited(_, code) => Some(Liveness::Exited(code)),
        WaitStatus::Signaled(_, signal, _) => Some(Liveness::Killed(signal)),
        _ => None,
    }
}

fn reap_blocking(pid: Pid) -> Liveness {
    loop {
        match waitpid(pid, None) {
            Ok(status) => {
                if let Some(liveness) = terminal(status) {
                    return liveness;
                }
            }
            Err(Errno::EINTR) => {}
            Err(e) => {
                tracing::warn!(pid = pid.as_raw(), error = %e, "Blocking reap failed");
                return Liveness::Killed(Signal::SIGKILL);
            }
        }
    }
}

fn send_signal(record: &ProcessRecord, signal: Signal) {
    match signal::kill(record.pid, signal) {
        // Already gone; the next reap picks it up.
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::warn!(role = %record.role, ?signal, error = %e, "Failed to signal worker"),
    }
}

fn report(record: &ProcessRecord) {
    let pid = record.pid.as_raw();
    match record.liveness {
        Liveness::Exited(code) => {
            status::out("Child with PID %d exited with status %d\n", &[Arg::Int(pid), Arg::Int(code)]);
        }
        Liveness::Killed(signal) => {
            let name = format!("{signal:?}");
            status::out("Child with PID %d was killed by %s\n", &[Arg::Int(pid), Arg::Str(&name)]);
        }
        Liveness::Running => {}
    }
    tracing::debug!(role = %record.role, pid, liveness = %record.liveness, "Worker terminated");
}
