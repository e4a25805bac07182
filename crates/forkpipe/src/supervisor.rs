//! The supervisor: creates the channels, forks both workers, publishes the
//! input, then waits for the workers and tears the group down if needed.
//!
//! ```text
//! Init ─► Spawning ─► Publishing ─► Waiting ─► Done
//!   │         │            │           │
//!   └─────────┴────────────┴───────────┴─► Teardown(reason) ─► Done
//! ```

use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use nix::unistd::{ForkResult, fork};
use tokio_util::bytes::BytesMut;
use tokio_util::codec::Encoder;

use crate::bridge::codec::{CommandCodec, VectorCodec};
use crate::bridge::protocol::CommandDescriptor;
use crate::bridge::transport::{ChannelTransport, Direction, Interrupts, TransportError};
use crate::config::RunConfig;
use crate::error::{Error, SetupError};
use crate::exit::ExitCode;
use crate::input::{FixedInput, InputSource, RandomInput};
use crate::process::{ProcessTable, Role};
use crate::resources::ResourceSet;
use crate::signals::{self, SignalState};
use crate::status::{self, Arg};
use crate::worker;

const WAIT_SLICE: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownReason {
    /// Channels, handlers or fork could not be set up.
    Setup,
    /// A worker failed, or publishing to it did.
    Failure,
    /// The supervisor itself was asked to terminate.
    Signal(Signal),
}

impl TeardownReason {
    pub fn exit_code(self) -> ExitCode {
        match self {
            Self::Setup => ExitCode::Usage,
            Self::Failure => ExitCode::Teardown,
            Self::Signal(_) => ExitCode::Success,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Spawning,
    Publishing,
    Waiting,
    Teardown(TeardownReason),
    Done,
}

pub struct Supervisor {
    config: RunConfig,
    phase: Phase,
    exit_code: ExitCode,
    resources: ResourceSet,
    processes: ProcessTable<'static>,
    transport: Option<ChannelTransport>,
}

impl Supervisor {
    pub fn new(config: RunConfig) -> Self {
        Self {
            config,
            phase: Phase::Init,
            exit_code: ExitCode::Success,
            resources: ResourceSet::new(Role::Supervisor),
            processes: ProcessTable::new(SignalState::global()),
            transport: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Drives the state machine to `Done` and returns the process exit code.
    ///
    /// In the forked children this never returns: they run their role and
    /// exit from inside `Spawning`.
    pub fn run(mut self) -> ExitCode {
        loop {
            tracing::debug!(phase = ?self.phase, "Supervisor phase");
            self.phase = match self.phase {
                Phase::Init => self.init(),
                Phase::Spawning => self.spawn_workers(),
                Phase::Publishing => self.publish(),
                Phase::Waiting => self.wait(),
                Phase::Teardown(reason) => self.teardown(reason),
                Phase::Done => return self.exit_code,
            };
        }
    }

    fn init(&mut self) -> Phase {
        // Handlers first, so no child exit can slip past unnoticed.
        if let Err(e) = signals::install_supervisor() {
            report_error(&Error::Setup(SetupError::Signals(e)));
            return Phase::Teardown(TeardownReason::Setup);
        }

        match ChannelTransport::create(self.config.channel_kind, &self.config.fifo_dir, &mut self.resources) {
            Ok(transport) => {
                self.transport = Some(transport);
                Phase::Spawning
            }
            Err(e) => {
                report_error(&Error::Setup(SetupError::Channels(e)));
                Phase::Teardown(TeardownReason::Setup)
            }
        }
    }

    fn spawn_workers(&mut self) -> Phase {
        for role in [Role::Sum, Role::Command] {
            if let Err(e) = self.processes.checkpoint() {
                return self.after_error(e.into());
            }

            // SAFETY: the supervisor is single-threaded; the child only runs
            // its worker role and exits without returning here.
            match unsafe { fork() } {
                Ok(ForkResult::Child) => self.enter_child(role),
                Ok(ForkResult::Parent { child }) => self.processes.track(role, child),
                Err(source) => {
                    report_error(&Error::Setup(SetupError::Fork { role, source }));
                    return Phase::Teardown(TeardownReason::Setup);
                }
            }
        }
        Phase::Publishing
    }

    fn enter_child(&mut self, role: Role) -> ! {
        self.resources.forget_after_fork(role);
        let code = match self.transport.as_mut() {
            Some(transport) => worker::run_forked(role, transport, &self.config.worker, &mut self.resources),
            None => ExitCode::WorkerFailure,
        };
        code.exit()
    }

    fn publish(&mut self) -> Phase {
        match self.try_publish() {
            Ok(()) => Phase::Waiting,
            Err(e) => self.after_error(e),
        }
    }

    fn try_publish(&mut self) -> Result<(), Error> {
        let transport = self
            .transport
            .as_mut()
            .ok_or(TransportError::EndpointTaken("supervisor"))?;
        let endpoints = transport.supervisor_endpoints()?;
        let intr = &mut self.processes;
        let mut scope = self.resources.scope();

        let vector = match &self.config.input {
            Some(values) => FixedInput::new(values.clone()).generate(self.config.vector_len),
            None => match self.config.seed {
                Some(seed) => RandomInput::seeded(seed).generate(self.config.vector_len),
                None => RandomInput::from_entropy().generate(self.config.vector_len),
            },
        };
        let buffer = scope.hold_buffer(vector);
        let text = scope.hold_text(self.config.command.clone());
        status::out(
            "%s Generated random numbers: %a\n",
            &[Arg::Str(Role::Supervisor.tag()), Arg::Ints(scope.buffer(buffer)?.values())],
        );

        let to_sum = scope.adopt_channel(endpoints.to_sum.open(Direction::Write, intr)?);
        let to_command = scope.adopt_channel(endpoints.to_command.open(Direction::Write, intr)?);

        // The Command Worker's frame goes out in one write, before the Sum
        // Worker can possibly produce its aggregate on the same channel.
        let mut frame = BytesMut::new();
        let descriptor = CommandDescriptor::new(scope.text(text)?);
        CommandCodec.encode(&descriptor, &mut frame)?;
        let vector = scope.buffer(buffer)?.clone();
        VectorCodec.encode(&vector, &mut frame)?;
        scope.channel(to_command)?.send_bytes(&frame, intr)?;
        scope.release(to_command)?;
        tracing::debug!(bytes = frame.len(), "Published command frame");

        frame.clear();
        VectorCodec.encode(&vector, &mut frame)?;
        scope.channel(to_sum)?.send_bytes(&frame, intr)?;
        scope.release(to_sum)?;
        tracing::debug!(len = vector.len(), "Published vector");

        scope.finish();
        Ok(())
    }

    fn wait(&mut self) -> Phase {
        let started = Instant::now();
        loop {
            if let Err(e) = self.processes.checkpoint() {
                return self.after_error(e.into());
            }
            // Catches exits whose SIGCHLD arrived before they were tracked.
            self.processes.reap();
            if self.processes.first_failure().is_some() {
                return Phase::Teardown(TeardownReason::Failure);
            }

            let live = self.processes.live_count();
            if live == 0 {
                break;
            }
            status::out(
                "%s Waiting for children to finish, waited %d seconds, %d children remaining\n",
                &[
                    Arg::Str(Role::Supervisor.tag()),
                    Arg::Int(i32::try_from(started.elapsed().as_secs()).unwrap_or(i32::MAX)),
                    Arg::Int(i32::try_from(live).unwrap_or(i32::MAX)),
                ],
            );

            let tick = Instant::now() + self.config.wait_interval;
            while self.processes.live_count() > 0 {
                let now = Instant::now();
                if now >= tick {
                    break;
                }
                if let Err(e) = self.processes.checkpoint() {
                    return self.after_error(e.into());
                }
                std::thread::sleep((tick - now).min(WAIT_SLICE));
            }
        }

        self.release_channels();
        self.exit_code = ExitCode::Success;
        Phase::Done
    }

    fn teardown(&mut self, reason: TeardownReason) -> Phase {
        let tag = Role::Supervisor.tag();
        match reason {
            TeardownReason::Setup => {}
            TeardownReason::Failure => {
                if let Some(record) = self.processes.first_failure() {
                    let detail = format!("{} worker (pid {}) terminated with {}", record.role, record.pid, record.liveness);
                    status::err("%e%s Worker failure:%r %s\n", &[Arg::Str(tag), Arg::Str(&detail)]);
                }
            }
            TeardownReason::Signal(signal) => {
                let name = format!("{signal:?}");
                status::out("%s Received %s, terminating children\n", &[Arg::Str(tag), Arg::Str(&name)]);
            }
        }
        tracing::info!(?reason, live = self.processes.live_count(), "Tearing down");

        self.processes.terminate_live(self.config.kill_grace);
        self.release_channels();
        self.exit_code = reason.exit_code();
        Phase::Done
    }

    /// Removes channels and releases everything the supervisor still holds.
    /// Safe to reach from any phase.
    fn release_channels(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            for e in transport.destroy(&mut self.resources) {
                report_error(&Error::Resource(e));
            }
        }
        for e in self.resources.release_all().errors {
            report_error(&Error::Resource(e));
        }
    }

    fn after_error(&mut self, error: Error) -> Phase {
        let reason = teardown_reason(&error, &mut self.processes);
        if reason == TeardownReason::Failure && !matches!(error, Error::Transport(TransportError::Aborted(_))) {
            report_error(&error);
        }
        Phase::Teardown(reason)
    }
}

/// Decides how an error observed by the supervisor ends the run.
///
/// SIGPIPE means a worker closed its end early; if a worker failure explains
/// it, that failure is what gets reported.
fn teardown_reason(error: &Error, processes: &mut ProcessTable<'_>) -> TeardownReason {
    match error.interrupted_by() {
        Some(Signal::SIGPIPE) => {
            processes.reap();
            if processes.first_failure().is_some() {
                TeardownReason::Failure
            } else {
                TeardownReason::Signal(Signal::SIGPIPE)
            }
        }
        Some(signal) => TeardownReason::Signal(signal),
        None => TeardownReason::Failure,
    }
}

fn report_error(error: &Error) {
    tracing::error!(error = %error, "Supervisor error");
    let message = error.to_string();
    status::err("%e%s Error:%r %s\n", &[Arg::Str(Role::Supervisor.tag()), Arg::Str(&message)]);
}
