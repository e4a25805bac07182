//! Worker roles, run inside the forked children.
//!
//! - **Sum Worker** reads the vector from the sum channel and forwards its
//!   wrapping sum to the Command Worker.
//! - **Command Worker** reads the command tag and the vector, polls for the
//!   aggregate, then applies the command.
//!
//! Both acquire everything through a [`Scope`](crate::resources::Scope), so
//! any early return releases what was acquired so far, newest first.

use crate::bridge::codec::{AggregateCodec, CommandCodec, VectorCodec, poll_recv, recv, send};
use crate::bridge::protocol::{AggregateResult, Command};
use crate::bridge::transport::{
    ChannelTransport, CommandEndpoints, Direction, Interrupts, SumEndpoints, pause,
};
use crate::config::WorkerConfig;
use crate::error::Error;
use crate::exit::ExitCode;
use crate::process::Role;
use crate::resources::ResourceSet;
use crate::signals;
use crate::status::{self, Arg};

/// What the Command Worker computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandReport {
    pub command: Command,
    /// Aggregate received from the Sum Worker.
    pub received: i32,
    pub product: i32,
    /// `product + received`, wrapping.
    pub combined: i32,
}

pub struct SumWorker<'a> {
    config: &'a WorkerConfig,
}

impl<'a> SumWorker<'a> {
    pub fn new(config: &'a WorkerConfig) -> Self {
        Self { config }
    }

    /// Returns the sum it forwarded.
    pub fn run(
        &self,
        endpoints: SumEndpoints,
        resources: &mut ResourceSet,
        intr: &mut dyn Interrupts,
    ) -> Result<i32, Error> {
        let mut scope = resources.scope();
        let inbound = scope.adopt_channel(endpoints.inbound.open(Direction::Read, intr)?);
        let outbound = scope.adopt_channel(endpoints.outbound.open(Direction::Write, intr)?);

        if !self.config.sum_delay.is_zero() {
            tracing::debug!(delay = ?self.config.sum_delay, "Delaying before read");
            pause(self.config.sum_delay, intr)?;
        }

        let vector = recv(scope.channel(inbound)?, &mut VectorCodec, intr)?;
        tracing::debug!(len = vector.len(), "Received vector");
        let buffer = scope.hold_buffer(vector);
        let sum = scope.buffer(buffer)?.wrapping_sum();
        scope.release(buffer)?;

        send(scope.channel(outbound)?, &mut AggregateCodec, AggregateResult(sum), intr)?;
        scope.release(outbound)?;
        scope.release(inbound)?;
        scope.finish();

        status::out("%s Sum of random numbers: %d\n", &[Arg::Str(Role::Sum.tag()), Arg::Int(sum)]);
        Ok(sum)
    }
}

pub struct CommandWorker<'a> {
    config: &'a WorkerConfig,
}

impl<'a> CommandWorker<'a> {
    pub fn new(config: &'a WorkerConfig) -> Self {
        Self { config }
    }

    pub fn run(
        &self,
        endpoints: CommandEndpoints,
        resources: &mut ResourceSet,
        intr: &mut dyn Interrupts,
    ) -> Result<CommandReport, Error> {
        let tag = Role::Command.tag();
        let mut scope = resources.scope();
        let inbound = scope.adopt_channel(endpoints.inbound.open(Direction::Read, intr)?);

        let descriptor = recv(scope.channel(inbound)?, &mut CommandCodec, intr)?;
        let text = scope.hold_text(descriptor.into_tag());
        let vector = recv(scope.channel(inbound)?, &mut VectorCodec, intr)?;
        let buffer = scope.hold_buffer(vector);

        // The aggregate may not be written yet: the supervisor's frame and
        // the Sum Worker's aggregate share this channel.
        let received = poll_recv(scope.channel(inbound)?, &mut AggregateCodec, &self.config.poll, intr)?.value();
        scope.release(inbound)?;
        status::out("%s Received sum: %d\n", &[Arg::Str(tag), Arg::Int(received)]);

        let command_tag = scope.text(text)?;
        let command = match Command::parse(command_tag) {
            Ok(command) => command,
            Err(e) => {
                status::out("%s Unknown command: %s\n", &[Arg::Str(tag), Arg::Str(command_tag)]);
                return Err(e.into());
            }
        };

        let report = match command {
            Command::Multiply => {
                let product = scope.buffer(buffer)?.wrapping_product();
                let combined = product.wrapping_add(received);
                status::out("%s Product of random numbers: %d\n", &[Arg::Str(tag), Arg::Int(product)]);
                status::out(
                    "%s Sum of two children's results: %d\n",
                    &[Arg::Str(tag), Arg::Int(combined)],
                );
                CommandReport {
                    command,
                    received,
                    product,
                    combined,
                }
            }
        };

        scope.finish();
        Ok(report)
    }
}

/// Runs `role` in a freshly forked child and returns its exit code.
///
/// The caller has already cleared the inherited `ResourceSet`; this installs
/// the worker's signal handlers, takes the role's endpoints, closes every
/// other inherited descriptor and releases everything before returning.
pub fn run_forked(
    role: Role,
    transport: &mut ChannelTransport,
    config: &WorkerConfig,
    resources: &mut ResourceSet,
) -> ExitCode {
    let span = tracing::info_span!("worker", %role, pid = std::process::id());
    let _enter = span.enter();

    let signals = match signals::install_worker() {
        Ok(signals) => signals,
        Err(e) => {
            report_failure(role, &Error::Setup(crate::error::SetupError::Signals(e)));
            return ExitCode::WorkerFailure;
        }
    };
    let mut intr = signals;

    let result = match role {
        Role::Sum => transport
            .sum_endpoints()
            .map_err(Error::from)
            .and_then(|endpoints| {
                transport.close_unused();
                SumWorker::new(config).run(endpoints, resources, &mut intr)
            })
            .map(drop),
        Role::Command => transport
            .command_endpoints()
            .map_err(Error::from)
            .and_then(|endpoints| {
                transport.close_unused();
                CommandWorker::new(config).run(endpoints, resources, &mut intr)
            })
            .map(drop),
        Role::Supervisor => {
            tracing::error!("Supervisor role cannot run as a worker");
            return ExitCode::WorkerFailure;
        }
    };

    let released = resources.release_all();
    tracing::debug!(released = released.total(), "Worker released resources");

    match result {
        Ok(()) => {
            status::out("%s Exiting\n", &[Arg::Str(role.tag())]);
            ExitCode::Success
        }
        Err(e) => {
            report_failure(role, &e);
            e.worker_exit_code()
        }
    }
}

fn report_failure(role: Role, error: &Error) {
    match error.interrupted_by() {
        Some(signal) => {
            let name = format!("{signal:?}");
            tracing::debug!(%role, signal = %name, "Worker terminated by signal");
            status::out("%s Received %s, exiting\n", &[Arg::Str(role.tag()), Arg::Str(&name)]);
        }
        None => {
            tracing::error!(%role, error = %error, "Worker failed");
            let message = error.to_string();
            status::err("%e%s Error:%r %s\n", &[Arg::Str(role.tag()), Arg::Str(&message)]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::codec::ProtocolError;
    use crate::bridge::protocol::{CommandDescriptor, IntegerVector};
    use crate::bridge::transport::{ChannelEnd, Endpoint, TransportError};
    use crate::config::PollPolicy;
    use crate::signals::SignalState;
    use std::io;
    use std::os::fd::OwnedFd;
    use std::time::Duration;

    fn pipe() -> (OwnedFd, OwnedFd) {
        nix::unistd::pipe().unwrap()
    }

    fn writer(fd: OwnedFd) -> ChannelEnd {
        ChannelEnd::from_fd("test", Direction::Write, fd)
    }

    fn reader(fd: OwnedFd) -> ChannelEnd {
        ChannelEnd::from_fd("test", Direction::Read, fd)
    }

    fn quick_poll() -> WorkerConfig {
        WorkerConfig {
            poll: PollPolicy::new(3, Duration::from_millis(1), Duration::from_millis(2)),
            ..WorkerConfig::default()
        }
    }

    /// Writes the supervisor's frame for the Command Worker.
    fn publish_command(tx: &mut ChannelEnd, tag: &str, values: &[i32], intr: &mut dyn Interrupts) {
        send(tx, &mut CommandCodec, &CommandDescriptor::new(tag), intr).unwrap();
        send(tx, &mut VectorCodec, &IntegerVector::new(values.to_vec()), intr).unwrap();
    }

    #[test]
    fn sum_worker_forwards_the_sum() {
        let state = SignalState::new();
        let mut intr = &state;
        let (sum_rx, sum_tx) = pipe();
        let (agg_rx, agg_tx) = pipe();

        let mut tx = writer(sum_tx);
        send(&mut tx, &mut VectorCodec, &IntegerVector::new(vec![2, 5, 9]), &mut intr).unwrap();
        drop(tx);

        let mut resources = ResourceSet::new(Role::Sum);
        let endpoints = SumEndpoints {
            inbound: Endpoint::inherited("fifo1", sum_rx),
            outbound: Endpoint::inherited("fifo2", agg_tx),
        };
        let config = WorkerConfig::default();
        let sum = SumWorker::new(&config).run(endpoints, &mut resources, &mut intr).unwrap();

        assert_eq!(sum, 16);
        assert!(resources.is_empty());
        let aggregate = recv(&mut reader(agg_rx), &mut AggregateCodec, &mut intr).unwrap();
        assert_eq!(aggregate, AggregateResult(16));
    }

    #[test]
    fn command_worker_multiplies_and_combines() {
        let state = SignalState::new();
        let mut intr = &state;
        let (rx, tx) = pipe();

        let mut tx = writer(tx);
        publish_command(&mut tx, "multiply", &[2, 5, 9], &mut intr);
        send(&mut tx, &mut AggregateCodec, AggregateResult(16), &mut intr).unwrap();
        drop(tx);

        let mut resources = ResourceSet::new(Role::Command);
        let config = WorkerConfig::default();
        let report = CommandWorker::new(&config)
            .run(CommandEndpoints { inbound: Endpoint::inherited("fifo2", rx) }, &mut resources, &mut intr)
            .unwrap();

        assert_eq!(
            report,
            CommandReport {
                command: Command::Multiply,
                received: 16,
                product: 90,
                combined: 106,
            }
        );
        assert!(resources.is_empty());
    }

    #[test]
    fn empty_vector_has_unit_product() {
        let state = SignalState::new();
        let mut intr = &state;
        let (rx, tx) = pipe();

        let mut tx = writer(tx);
        publish_command(&mut tx, "multiply", &[], &mut intr);
        send(&mut tx, &mut AggregateCodec, AggregateResult(0), &mut intr).unwrap();
        drop(tx);

        let mut resources = ResourceSet::new(Role::Command);
        let config = WorkerConfig::default();
        let report = CommandWorker::new(&config)
            .run(CommandEndpoints { inbound: Endpoint::inherited("fifo2", rx) }, &mut resources, &mut intr)
            .unwrap();

        assert_eq!((report.product, report.combined), (1, 1));
    }

    #[test]
    fn unknown_command_is_a_protocol_failure() {
        let state = SignalState::new();
        let mut intr = &state;
        let (rx, tx) = pipe();

        let mut tx = writer(tx);
        publish_command(&mut tx, "unknown", &[2, 5, 9], &mut intr);
        send(&mut tx, &mut AggregateCodec, AggregateResult(16), &mut intr).unwrap();
        drop(tx);

        let mut resources = ResourceSet::new(Role::Command);
        let config = WorkerConfig::default();
        let err = CommandWorker::new(&config)
            .run(CommandEndpoints { inbound: Endpoint::inherited("fifo2", rx) }, &mut resources, &mut intr)
            .unwrap_err();

        assert!(matches!(err, Error::Protocol(ProtocolError::UnknownCommand(ref tag)) if tag == "unknown"));
        assert_eq!(err.worker_exit_code(), ExitCode::ProtocolFailure);
        assert!(resources.is_empty());
    }

    #[test]
    fn missing_aggregate_exhausts_the_poll() {
        let state = SignalState::new();
        let mut intr = &state;
        let (rx, tx) = pipe();

        let mut tx = writer(tx);
        publish_command(&mut tx, "multiply", &[1, 2], &mut intr);
        drop(tx);

        let mut resources = ResourceSet::new(Role::Command);
        let config = quick_poll();
        let err = CommandWorker::new(&config)
            .run(CommandEndpoints { inbound: Endpoint::inherited("fifo2", rx) }, &mut resources, &mut intr)
            .unwrap_err();

        assert!(matches!(
            err,
            Error::Transport(TransportError::PollExhausted { attempts: 3, .. })
        ));
        assert_eq!(err.worker_exit_code(), ExitCode::WorkerFailure);
        assert!(resources.is_empty());
    }

    #[test]
    fn read_fault_releases_everything() {
        let state = SignalState::new();
        let mut intr = &state;
        let (sum_rx, sum_tx) = pipe();
        let (_agg_rx, agg_tx) = pipe();

        // Header promises three values, only one arrives.
        let mut tx = writer(sum_tx);
        let mut frame = 3i32.to_ne_bytes().to_vec();
        frame.extend_from_slice(&7i32.to_ne_bytes());
        tx.send_bytes(&frame, &mut intr).unwrap();
        drop(tx);

        let mut resources = ResourceSet::new(Role::Sum);
        let baseline = resources.len();
        let config = WorkerConfig::default();
        let err = SumWorker::new(&config)
            .run(
                SumEndpoints {
                    inbound: Endpoint::inherited("fifo1", sum_rx),
                    outbound: Endpoint::inherited("fifo2", agg_tx),
                },
                &mut resources,
                &mut intr,
            )
            .unwrap_err();

        assert!(matches!(err, Error::Transport(TransportError::Closed { buffered: 8, .. })));
        assert_eq!(resources.len(), baseline);
        assert_eq!((resources.channels(), resources.buffers()), (0, 0));
    }

    #[test]
    fn write_fault_releases_everything() {
        let state = SignalState::new();
        let mut intr = &state;
        let (sum_rx, sum_tx) = pipe();
        let (agg_rx, agg_tx) = pipe();
        drop(agg_rx);

        let mut tx = writer(sum_tx);
        send(&mut tx, &mut VectorCodec, &IntegerVector::new(vec![1, 2, 3]), &mut intr).unwrap();
        drop(tx);

        let mut resources = ResourceSet::new(Role::Sum);
        let config = WorkerConfig::default();
        let err = SumWorker::new(&config)
            .run(
                SumEndpoints {
                    inbound: Endpoint::inherited("fifo1", sum_rx),
                    outbound: Endpoint::inherited("fifo2", agg_tx),
                },
                &mut resources,
                &mut intr,
            )
            .unwrap_err();

        assert!(matches!(
            err,
            Error::Transport(TransportError::Write { ref source, .. }) if source.kind() == io::ErrorKind::BrokenPipe
        ));
        assert_eq!(err.worker_exit_code(), ExitCode::WorkerFailure);
        assert!(resources.is_empty());
    }

    #[test]
    fn open_fault_closes_already_opened_channel() {
        let state = SignalState::new();
        let mut intr = &state;
        let dir = tempfile::tempdir().unwrap();
        let (sum_rx, sum_tx) = pipe();

        let mut resources = ResourceSet::new(Role::Sum);
        let config = WorkerConfig::default();
        let err = SumWorker::new(&config)
            .run(
                SumEndpoints {
                    inbound: Endpoint::inherited("fifo1", sum_rx),
                    outbound: Endpoint::named("fifo2", dir.path().join("fifo2")),
                },
                &mut resources,
                &mut intr,
            )
            .unwrap_err();

        assert!(matches!(err, Error::Transport(TransportError::Open { .. })));
        assert!(resources.is_empty());

        // The inbound read end was closed on the way out.
        let write = writer(sum_tx).send_bytes(&[0], &mut intr).unwrap_err();
        assert!(matches!(
            write,
            TransportError::Write { ref source, .. } if source.kind() == io::ErrorKind::BrokenPipe
        ));
    }

    #[test]
    fn termination_during_delay_self_terminates() {
        let state = SignalState::new();
        state.request_termination(nix::sys::signal::Signal::SIGTERM);
        let mut intr = &state;
        let (sum_rx, _sum_tx) = pipe();
        let (_agg_rx, agg_tx) = pipe();

        let mut resources = ResourceSet::new(Role::Sum);
        let config = WorkerConfig {
            sum_delay: Duration::from_secs(30),
            ..WorkerConfig::default()
        };
        let err = SumWorker::new(&config)
            .run(
                SumEndpoints {
                    inbound: Endpoint::inherited("fifo1", sum_rx),
                    outbound: Endpoint::inherited("fifo2", agg_tx),
                },
                &mut resources,
                &mut intr,
            )
            .unwrap_err();

        assert_eq!(err.worker_exit_code(), ExitCode::SelfTerminated);
        assert!(resources.is_empty());
    }

    #[test]
    fn workers_meet_over_named_pipes() {
        let dir = tempfile::tempdir().unwrap();
        let mut supervisor_resources = ResourceSet::new(Role::Supervisor);
        let mut transport = ChannelTransport::create(
            crate::config::ChannelKind::Named,
            dir.path(),
            &mut supervisor_resources,
        )
        .unwrap();
        let sum_endpoints = transport.sum_endpoints().unwrap();
        let command_endpoints = transport.command_endpoints().unwrap();
        let supervisor_endpoints = transport.supervisor_endpoints().unwrap();
        let config = WorkerConfig {
            poll: PollPolicy::new(400, Duration::from_millis(1), Duration::from_millis(20)),
            ..WorkerConfig::default()
        };

        let (sum, report) = std::thread::scope(|s| {
            let sum = s.spawn(|| {
                let state = SignalState::new();
                let mut intr = &state;
                let mut resources = ResourceSet::new(Role::Sum);
                SumWorker::new(&config).run(sum_endpoints, &mut resources, &mut intr)
            });
            let command = s.spawn(|| {
                let state = SignalState::new();
                let mut intr = &state;
                let mut resources = ResourceSet::new(Role::Command);
                CommandWorker::new(&config).run(command_endpoints, &mut resources, &mut intr)
            });

            let state = SignalState::new();
            let mut intr = &state;
            let mut to_sum = supervisor_endpoints.to_sum.open(Direction::Write, &mut intr).unwrap();
            let mut to_command = supervisor_endpoints.to_command.open(Direction::Write, &mut intr).unwrap();
            publish_command(&mut to_command, "multiply", &[2, 5, 9], &mut intr);
            send(&mut to_sum, &mut VectorCodec, &IntegerVector::new(vec![2, 5, 9]), &mut intr).unwrap();
            drop(to_sum);
            drop(to_command);

            (sum.join().unwrap(), command.join().unwrap())
        });

        assert_eq!(sum.unwrap(), 16);
        let report = report.unwrap();
        assert_eq!((report.received, report.product, report.combined), (16, 90, 106));

        assert!(transport.destroy(&mut supervisor_resources).is_empty());
        assert!(supervisor_resources.is_empty());
    }
}
