//! Process exit codes shared by the supervisor and the workers.

/// Exit status of any process in the group.
///
/// The supervisor reads worker codes back through `waitpid`, so the numeric
/// values are part of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitCode {
    Success,
    /// Invalid argument or setup failure.
    Usage,
    /// Supervisor tore the group down after a worker failed.
    Teardown,
    /// Worker hit an I/O or resource failure.
    WorkerFailure,
    /// Worker received a malformed frame or an unknown command tag.
    ProtocolFailure,
    /// Worker exited because it was asked to terminate; never escalated.
    SelfTerminated,
}

impl ExitCode {
    pub const SELF_TERMINATED: i32 = 200;

    pub fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Usage => 1,
            Self::Teardown => 2,
            Self::WorkerFailure => 3,
            Self::ProtocolFailure => 4,
            Self::SelfTerminated => Self::SELF_TERMINATED,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Success),
            1 => Some(Self::Usage),
            2 => Some(Self::Teardown),
            3 => Some(Self::WorkerFailure),
            4 => Some(Self::ProtocolFailure),
            Self::SELF_TERMINATED => Some(Self::SelfTerminated),
            _ => None,
        }
    }

    /// Whether a worker exiting with `code` counts as a failure of the group.
    pub fn is_worker_failure(code: i32) -> bool {
        !matches!(
            Self::from_code(code),
            Some(Self::Success | Self::SelfTerminated)
        )
    }

    pub fn exit(self) -> ! {
        std::process::exit(self.code())
    }
}
