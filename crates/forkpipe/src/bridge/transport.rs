//! Channel transport between the supervisor and the workers.
//!
//! Two variants:
//! - **NamedPipeTransport**: FIFOs in a directory, created before fork and
//!   opened by path in each process afterwards
//! - **AnonymousPipeTransport**: two `pipe(2)` pairs created before fork;
//!   each process keeps only the ends its role uses
//!
//! Every blocking call that returns `EINTR` consults an [`Interrupts`]
//! implementation, which decides whether to resume or abandon the call.

use std::ffi::CString;
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::stat::Mode;
use tokio_util::bytes::BytesMut;

use crate::config::ChannelKind;
use crate::resources::{ResourceError, ResourceId, ResourceSet};

/// Supervisor → Sum Worker.
pub const SUM_CHANNEL: &str = "fifo1";
/// Supervisor and Sum Worker → Command Worker.
pub const COMMAND_CHANNEL: &str = "fifo2";

const READ_CHUNK: usize = 4096;
const PAUSE_SLICE: Duration = Duration::from_millis(25);

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to create channel {}: {source}", .path.display())]
    Create {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },

    #[error("failed to create anonymous pipe: {0}")]
    Pipe(#[source] nix::Error),

    #[error("failed to open {channel} for {direction}: {source}")]
    Open {
        channel: String,
        direction: Direction,
        #[source]
        source: io::Error,
    },

    #[error("read on {channel} failed: {source}")]
    Read {
        channel: String,
        #[source]
        source: io::Error,
    },

    #[error("write on {channel} failed: {source}")]
    Write {
        channel: String,
        #[source]
        source: io::Error,
    },

    #[error("{channel} closed with {buffered} bytes of an incomplete frame buffered")]
    Closed { channel: String, buffered: usize },

    #[error("no frame on {channel} after {attempts} empty reads")]
    PollExhausted { channel: String, attempts: u32 },

    #[error("interrupted by {0:?}")]
    Interrupted(Signal),

    #[error("aborted: {0}")]
    Aborted(String),

    #[error("{0} endpoint was already handed out")]
    EndpointTaken(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => f.write_str("reading"),
            Self::Write => f.write_str("writing"),
        }
    }
}

/// Decides what happens when a blocking call is interrupted by a signal,
/// or fails while a signal may be pending.
pub trait Interrupts {
    /// `Ok` resumes the call, `Err` abandons it.
    fn checkpoint(&mut self) -> Result<(), TransportError>;
}

/// Sleeps for `duration` in short slices, checkpointing between them.
pub fn pause(duration: Duration, intr: &mut dyn Interrupts) -> Result<(), TransportError> {
    let deadline = Instant::now() + duration;
    loop {
        intr.checkpoint()?;
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        std::thread::sleep((deadline - now).min(PAUSE_SLICE));
    }
}

/// One open end of a channel, with a buffer for bytes read ahead of the
/// frame currently being decoded.
#[derive(Debug)]
pub struct ChannelEnd {
    label: String,
    direction: Direction,
    file: File,
    pending: BytesMut,
}

impl ChannelEnd {
    pub fn from_fd(label: impl Into<String>, direction: Direction, fd: OwnedFd) -> Self {
        Self {
            label: label.into(),
            direction,
            file: File::from(fd),
            pending: BytesMut::new(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_mut(&mut self) -> &mut BytesMut {
        &mut self.pending
    }

    /// Performs one `read(2)` and appends the bytes to the pending buffer.
    ///
    /// Returns the number of bytes read; zero means no writer is attached
    /// right now, which the caller interprets.
    pub fn fill(&mut self, intr: &mut dyn Interrupts) -> Result<usize, TransportError> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.file.read(&mut chunk) {
                Ok(n) => {
                    self.pending.extend_from_slice(&chunk[..n]);
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => intr.checkpoint()?,
                Err(source) => {
                    intr.checkpoint()?;
                    return Err(TransportError::Read {
                        channel: self.label.clone(),
                        source,
                    });
                }
            }
        }
    }

    /// Reads exactly `n` bytes, looping over short reads.
    pub fn recv_bytes(&mut self, n: usize, intr: &mut dyn Interrupts) -> Result<Vec<u8>, TransportError> {
        while self.pending.len() < n {
            if self.fill(intr)? == 0 {
                return Err(TransportError::Closed {
                    channel: self.label.clone(),
                    buffered: self.pending.len(),
                });
            }
        }
        Ok(self.pending.split_to(n).to_vec())
    }

    /// Writes all of `buf`, looping over short writes.
    pub fn send_bytes(&mut self, mut buf: &[u8], intr: &mut dyn Interrupts) -> Result<(), TransportError> {
        while !buf.is_empty() {
            match self.file.write(buf) {
                Ok(0) => {
                    return Err(TransportError::Write {
                        channel: self.label.clone(),
                        source: io::ErrorKind::WriteZero.into(),
                    });
                }
                Ok(n) => buf = &buf[n..],
                Err(e) if e.kind() == io::ErrorKind::Interrupted => intr.checkpoint()?,
                Err(source) => {
                    // EPIPE arrives together with SIGPIPE; let the pending
                    // signal win so the process self-terminates cleanly.
                    intr.checkpoint()?;
                    return Err(TransportError::Write {
                        channel: self.label.clone(),
                        source,
                    });
                }
            }
        }
        Ok(())
    }
}

/// A channel end that a process has been handed but not opened yet.
#[derive(Debug)]
pub enum Endpoint {
    Named { label: String, path: PathBuf },
    Inherited { label: String, fd: OwnedFd },
}

impl Endpoint {
    pub fn named(label: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::Named {
            label: label.into(),
            path: path.into(),
        }
    }

    pub fn inherited(label: impl Into<String>, fd: OwnedFd) -> Self {
        Self::Inherited {
            label: label.into(),
            fd,
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Self::Named { label, .. } | Self::Inherited { label, .. } => label,
        }
    }

    /// Opens the endpoint. For a FIFO this blocks until a peer opens the
    /// other side.
    pub fn open(self, direction: Direction, intr: &mut dyn Interrupts) -> Result<ChannelEnd, TransportError> {
        match self {
            Self::Named { label, path } => {
                tracing::trace!(channel = %label, path = %path.display(), %direction, "Opening FIFO");
                let fd = open_fifo(&label, &path, direction, intr)?;
                Ok(ChannelEnd::from_fd(label, direction, fd))
            }
            Self::Inherited { label, fd } => Ok(ChannelEnd::from_fd(label, direction, fd)),
        }
    }
}

fn open_fifo(
    label: &str,
    path: &Path,
    direction: Direction,
    intr: &mut dyn Interrupts,
) -> Result<OwnedFd, TransportError> {
    let open_error = |source| TransportError::Open {
        channel: label.to_string(),
        direction,
        source,
    };
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| open_error(io::Error::new(io::ErrorKind::InvalidInput, e)))?;
    let flags = libc::O_CLOEXEC
        | match direction {
            Direction::Read => libc::O_RDONLY,
            Direction::Write => libc::O_WRONLY,
        };

    // std's File::open retries on EINTR, which would make a blocked FIFO
    // open deaf to termination signals, so call open(2) directly.
    loop {
        // SAFETY: c_path is a valid NUL-terminated string that outlives the call.
        let fd = unsafe { libc::open(c_path.as_ptr(), flags) };
        if fd >= 0 {
            // SAFETY: open(2) just returned this descriptor; nothing else owns it.
            return Ok(unsafe { OwnedFd::from_raw_fd(fd) });
        }
        let err = io::Error::last_os_error();
        intr.checkpoint()?;
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(open_error(err));
        }
    }
}

fn fifo_mode() -> Mode {
    Mode::S_IRUSR | Mode::S_IWUSR | Mode::S_IRGRP | Mode::S_IWGRP | Mode::S_IROTH | Mode::S_IWOTH
}

/// Creates a FIFO at `path`. An existing entry is reused, not an error.
///
/// Returns whether a new FIFO was created.
pub fn create_fifo(path: &Path) -> Result<bool, TransportError> {
    match nix::unistd::mkfifo(path, fifo_mode()) {
        Ok(()) => Ok(true),
        Err(Errno::EEXIST) => {
            tracing::debug!(path = %path.display(), "FIFO already exists, reusing");
            Ok(false)
        }
        Err(source) => Err(TransportError::Create {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Removes a FIFO. A second removal fails with a (non-fatal) `ResourceError`.
pub fn remove_fifo(path: &Path) -> Result<(), ResourceError> {
    std::fs::remove_file(path).map_err(|source| ResourceError::Remove {
        path: path.to_path_buf(),
        source,
    })
}

/// Endpoints the Sum Worker opens.
#[derive(Debug)]
pub struct SumEndpoints {
    pub inbound: Endpoint,
    pub outbound: Endpoint,
}

/// Endpoints the Command Worker opens.
#[derive(Debug)]
pub struct CommandEndpoints {
    pub inbound: Endpoint,
}

/// Endpoints the supervisor publishes on.
#[derive(Debug)]
pub struct SupervisorEndpoints {
    pub to_sum: Endpoint,
    pub to_command: Endpoint,
}

/// Named-pipe transport.
///
/// Path format: `{dir}/fifo1`, `{dir}/fifo2`. Both paths are tracked in the
/// creating process's `ResourceSet`; only that process removes them.
#[derive(Debug)]
pub struct NamedPipeTransport {
    sum: PathBuf,
    command: PathBuf,
    tracked: Vec<ResourceId>,
}

impl NamedPipeTransport {
    pub fn create(dir: &Path, resources: &mut ResourceSet) -> Result<Self, TransportError> {
        let sum = dir.join(SUM_CHANNEL);
        let command = dir.join(COMMAND_CHANNEL);
        tracing::debug!(transport_type = "named", dir = %dir.display(), "Creating channels");

        create_fifo(&sum)?;
        let sum_id = resources.track_fifo(sum.clone());

        if let Err(e) = create_fifo(&command) {
            if let Err(cleanup) = resources.release(sum_id) {
                tracing::warn!(error = %cleanup, "Failed to remove first FIFO after setup error");
            }
            return Err(e);
        }
        let command_id = resources.track_fifo(command.clone());

        Ok(Self {
            sum,
            command,
            tracked: vec![sum_id, command_id],
        })
    }

    pub fn sum_path(&self) -> &Path {
        &self.sum
    }

    pub fn command_path(&self) -> &Path {
        &self.command
    }

    /// Removes both FIFOs. Safe to call repeatedly; later calls only
    /// report that the paths are already gone.
    pub fn destroy(&self, resources: &mut ResourceSet) -> Vec<ResourceError> {
        self.tracked
            .iter()
            .filter_map(|&id| resources.release(id).err())
            .collect()
    }
}

#[derive(Debug)]
struct PipePair {
    rx: Option<OwnedFd>,
    tx: Option<OwnedFd>,
}

impl PipePair {
    fn create() -> Result<Self, TransportError> {
        let (rx, tx) = nix::unistd::pipe().map_err(TransportError::Pipe)?;
        Ok(Self {
            rx: Some(rx),
            tx: Some(tx),
        })
    }
}

fn take_end(fd: &mut Option<OwnedFd>, label: &'static str) -> Result<Endpoint, TransportError> {
    fd.take()
        .map(|fd| Endpoint::inherited(label, fd))
        .ok_or(TransportError::EndpointTaken(label))
}

/// Anonymous-pipe transport.
///
/// All four descriptors exist in every process right after fork; each
/// process takes the ends for its role and drops the transport, closing the
/// rest. The command channel's write end is shared by the supervisor and the
/// Sum Worker.
#[derive(Debug)]
pub struct AnonymousPipeTransport {
    sum: PipePair,
    command: PipePair,
}

impl AnonymousPipeTransport {
    pub fn create() -> Result<Self, TransportError> {
        tracing::debug!(transport_type = "anonymous", "Creating channels");
        Ok(Self {
            sum: PipePair::create()?,
            command: PipePair::create()?,
        })
    }

    pub fn close_all(&mut self) {
        self.sum = PipePair { rx: None, tx: None };
        self.command = PipePair { rx: None, tx: None };
    }
}

#[derive(Debug)]
pub enum ChannelTransport {
    Named(NamedPipeTransport),
    Anonymous(AnonymousPipeTransport),
}

impl ChannelTransport {
    pub fn create(kind: ChannelKind, dir: &Path, resources: &mut ResourceSet) -> Result<Self, TransportError> {
        match kind {
            ChannelKind::Named => Ok(Self::Named(NamedPipeTransport::create(dir, resources)?)),
            ChannelKind::Anonymous => Ok(Self::Anonymous(AnonymousPipeTransport::create()?)),
        }
    }

    pub fn sum_endpoints(&mut self) -> Result<SumEndpoints, TransportError> {
        match self {
            Self::Named(t) => Ok(SumEndpoints {
                inbound: Endpoint::named(SUM_CHANNEL, &t.sum),
                outbound: Endpoint::named(COMMAND_CHANNEL, &t.command),
            }),
            Self::Anonymous(t) => Ok(SumEndpoints {
                inbound: take_end(&mut t.sum.rx, SUM_CHANNEL)?,
                outbound: take_end(&mut t.command.tx, COMMAND_CHANNEL)?,
            }),
        }
    }

    pub fn command_endpoints(&mut self) -> Result<CommandEndpoints, TransportError> {
        match self {
            Self::Named(t) => Ok(CommandEndpoints {
                inbound: Endpoint::named(COMMAND_CHANNEL, &t.command),
            }),
            Self::Anonymous(t) => Ok(CommandEndpoints {
                inbound: take_end(&mut t.command.rx, COMMAND_CHANNEL)?,
            }),
        }
    }

    /// Hands out the supervisor's write ends. On the anonymous variant this
    /// also closes the supervisor's copies of the read ends.
    pub fn supervisor_endpoints(&mut self) -> Result<SupervisorEndpoints, TransportError> {
        match self {
            Self::Named(t) => Ok(SupervisorEndpoints {
                to_sum: Endpoint::named(SUM_CHANNEL, &t.sum),
                to_command: Endpoint::named(COMMAND_CHANNEL, &t.command),
            }),
            Self::Anonymous(t) => {
                t.sum.rx = None;
                t.command.rx = None;
                Ok(SupervisorEndpoints {
                    to_sum: take_end(&mut t.sum.tx, SUM_CHANNEL)?,
                    to_command: take_end(&mut t.command.tx, COMMAND_CHANNEL)?,
                })
            }
        }
    }

    /// Closes inherited descriptors a forked child has no use for. Named
    /// FIFOs are left alone; the supervisor removes them.
    pub fn close_unused(&mut self) {
        if let Self::Anonymous(t) = self {
            t.close_all();
        }
    }

    /// Releases the shared channel resources: removes FIFOs, or closes any
    /// pipe ends still held.
    pub fn destroy(&mut self, resources: &mut ResourceSet) -> Vec<ResourceError> {
        match self {
            Self::Named(t) => t.destroy(resources),
            Self::Anonymous(t) => {
                t.close_all();
                Vec::new()
            }
        }
    }
}
