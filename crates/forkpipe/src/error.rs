//! Error taxonomy: setup, transport (I/O), protocol and resource failures.

use crate::bridge::codec::ProtocolError;
use crate::bridge::transport::TransportError;
use crate::exit::ExitCode;
use crate::resources::ResourceError;

/// Failures that abort the group before any worker produced side effects.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("failed to create channels: {0}")]
    Channels(#[source] TransportError),

    #[error("failed to install signal handlers: {0}")]
    Signals(#[source] nix::Error),

    #[error("fork failed for {role}: {source}")]
    Fork {
        role: crate::process::Role,
        #[source]
        source: nix::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Setup(#[from] SetupError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Resource(#[from] ResourceError),
}

impl Error {
    /// Exit code a worker uses when it fails with this error.
    pub fn worker_exit_code(&self) -> ExitCode {
        match self {
            Self::Transport(TransportError::Interrupted(_)) => ExitCode::SelfTerminated,
            Self::Protocol(ProtocolError::Io(_)) => ExitCode::WorkerFailure,
            Self::Protocol(_) => ExitCode::ProtocolFailure,
            Self::Setup(_) | Self::Transport(_) | Self::Resource(_) => ExitCode::WorkerFailure,
        }
    }

    /// Termination signal that caused this error, if any.
    pub fn interrupted_by(&self) -> Option<nix::sys::signal::Signal> {
        match self {
            Self::Transport(TransportError::Interrupted(signal)) => Some(*signal),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::Signal;

    #[test]
    fn interrupted_maps_to_sentinel() {
        let err = Error::from(TransportError::Interrupted(Signal::SIGTERM));
        assert_eq!(err.worker_exit_code(), ExitCode::SelfTerminated);
        assert_eq!(err.interrupted_by(), Some(Signal::SIGTERM));
    }

    #[test]
    fn protocol_errors_are_distinct_from_io_failures() {
        let unknown = Error::from(ProtocolError::UnknownCommand("divide".into()));
        assert_eq!(unknown.worker_exit_code(), ExitCode::ProtocolFailure);

        let io = Error::from(ProtocolError::Io(std::io::Error::other("boom")));
        assert_eq!(io.worker_exit_code(), ExitCode::WorkerFailure);

        let closed = Error::from(TransportError::Closed {
            channel: "fifo1".into(),
            buffered: 2,
        });
        assert_eq!(closed.worker_exit_code(), ExitCode::WorkerFailure);
        assert_eq!(closed.interrupted_by(), None);
    }
}
