//! forkpipe: a supervisor and two forked workers exchanging binary frames
//! over named pipes, with signal-driven lifecycle supervision.

#[cfg(not(unix))]
compile_error!("forkpipe requires a Unix platform (fork, mkfifo, POSIX signals)");

mod error;
mod exit;

pub mod bridge;
pub mod config;
pub mod input;
pub mod logging;
pub mod process;
pub mod resources;
pub mod signals;
pub mod status;
pub mod supervisor;
pub mod worker;

pub use config::{ChannelKind, ConfigError, PollPolicy, RunConfig, WorkerConfig};
pub use error::{Error, SetupError};
pub use exit::ExitCode;
pub use process::{Liveness, ProcessRecord, ProcessTable, Role};
pub use resources::{ReleaseReport, ResourceError, ResourceId, ResourceSet};
pub use signals::SignalState;
pub use supervisor::{Phase, Supervisor, TeardownReason};
