//! Per-process accounting of everything that must be released before exit.
//!
//! Each process owns one [`ResourceSet`]. Entries are released exactly once,
//! newest first, either explicitly, when a [`Scope`] ends, or by
//! [`ResourceSet::release_all`] on the way out.

use std::fmt;
use std::io;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;

use crate::bridge::protocol::IntegerVector;
use crate::bridge::transport::{ChannelEnd, remove_fifo};
use crate::process::Role;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceId(usize);

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("resource {0} was already released")]
    Released(ResourceId),

    #[error("resource {id} is not a {expected}")]
    WrongKind { id: ResourceId, expected: &'static str },

    #[error("failed to remove {}: {source}", .path.display())]
    Remove {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug)]
enum Resource {
    Channel(ChannelEnd),
    Buffer(IntegerVector),
    Text(String),
    Fifo(PathBuf),
}

impl Resource {
    fn kind(&self) -> &'static str {
        match self {
            Self::Channel(_) => "channel",
            Self::Buffer(_) => "buffer",
            Self::Text(_) => "text",
            Self::Fifo(_) => "fifo",
        }
    }
}

/// What a release pass did.
#[derive(Debug, Default)]
pub struct ReleaseReport {
    pub channels: usize,
    pub buffers: usize,
    pub texts: usize,
    pub fifos: usize,
    pub errors: Vec<ResourceError>,
}

impl ReleaseReport {
    pub fn total(&self) -> usize {
        self.channels + self.buffers + self.texts + self.fifos
    }
}

#[derive(Debug)]
pub struct ResourceSet {
    role: Role,
    slots: Vec<Option<Resource>>,
}

impl ResourceSet {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            slots: Vec::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    fn push(&mut self, resource: Resource) -> ResourceId {
        tracing::trace!(role = %self.role, kind = resource.kind(), id = self.slots.len(), "Acquired");
        self.slots.push(Some(resource));
        ResourceId(self.slots.len() - 1)
    }

    pub fn adopt_channel(&mut self, end: ChannelEnd) -> ResourceId {
        self.push(Resource::Channel(end))
    }

    pub fn hold_buffer(&mut self, vector: IntegerVector) -> ResourceId {
        self.push(Resource::Buffer(vector))
    }

    pub fn hold_text(&mut self, text: String) -> ResourceId {
        self.push(Resource::Text(text))
    }

    /// Records a FIFO path this process is responsible for removing.
    pub fn track_fifo(&mut self, path: PathBuf) -> ResourceId {
        self.push(Resource::Fifo(path))
    }

    fn get(&mut self, id: ResourceId) -> Result<&mut Resource, ResourceError> {
        self.slots
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or(ResourceError::Released(id))
    }

    pub fn channel(&mut self, id: ResourceId) -> Result<&mut ChannelEnd, ResourceError> {
        match self.get(id)? {
            Resource::Channel(end) => Ok(end),
            _ => Err(ResourceError::WrongKind { id, expected: "channel" }),
        }
    }

    pub fn buffer(&mut self, id: ResourceId) -> Result<&IntegerVector, ResourceError> {
        match self.get(id)? {
            Resource::Buffer(vector) => Ok(&*vector),
            _ => Err(ResourceError::WrongKind { id, expected: "buffer" }),
        }
    }

    pub fn text(&mut self, id: ResourceId) -> Result<&str, ResourceError> {
        match self.get(id)? {
            Resource::Text(text) => Ok(text.as_str()),
            _ => Err(ResourceError::WrongKind { id, expected: "text" }),
        }
    }

    /// Releases one resource. A FIFO whose removal fails still counts as
    /// released; the error is returned for reporting.
    pub fn release(&mut self, id: ResourceId) -> Result<(), ResourceError> {
        let resource = self
            .slots
            .get_mut(id.0)
            .and_then(Option::take)
            .ok_or(ResourceError::Released(id))?;
        tracing::trace!(role = %self.role, kind = resource.kind(), %id, "Releasing");
        match resource {
            Resource::Fifo(path) => remove_fifo(&path),
            Resource::Channel(end) => {
                drop(end);
                Ok(())
            }
            Resource::Buffer(_) | Resource::Text(_) => Ok(()),
        }
    }

    fn release_since(&mut self, mark: usize) -> ReleaseReport {
        let mut report = ReleaseReport::default();
        for index in (mark..self.slots.len()).rev() {
            match self.slots[index] {
                None => continue,
                Some(Resource::Channel(_)) => report.channels += 1,
                Some(Resource::Buffer(_)) => report.buffers += 1,
                Some(Resource::Text(_)) => report.texts += 1,
                Some(Resource::Fifo(_)) => report.fifos += 1,
            }
            if let Err(e) = self.release(ResourceId(index)) {
                tracing::warn!(role = %self.role, error = %e, "Release failed");
                report.errors.push(e);
            }
        }
        report
    }

    /// Releases everything, newest first. Calling it again is a no-op.
    pub fn release_all(&mut self) -> ReleaseReport {
        let report = self.release_since(0);
        if report.total() > 0 {
            tracing::debug!(
                role = %self.role,
                channels = report.channels,
                buffers = report.buffers,
                texts = report.texts,
                fifos = report.fifos,
                errors = report.errors.len(),
                "Released resources"
            );
        }
        report
    }

    /// Starts a scope: anything acquired through it is released when it ends.
    pub fn scope(&mut self) -> Scope<'_> {
        let mark = self.slots.len();
        Scope { set: self, mark }
    }

    /// Drops every entry without releasing it.
    ///
    /// A forked child inherits a copy of its parent's set; the parent
    /// remains responsible for those entries, FIFO paths in particular.
    pub fn forget_after_fork(&mut self, role: Role) {
        self.slots.clear();
        self.role = role;
    }

    pub fn channels(&self) -> usize {
        self.count("channel")
    }

    pub fn buffers(&self) -> usize {
        self.count("buffer")
    }

    pub fn texts(&self) -> usize {
        self.count("text")
    }

    pub fn fifos(&self) -> usize {
        self.count("fifo")
    }

    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn count(&self, kind: &str) -> usize {
        self.slots.iter().flatten().filter(|r| r.kind() == kind).count()
    }
}

impl Drop for ResourceSet {
    fn drop(&mut self) {
        if !self.is_empty() {
            tracing::warn!(role = %self.role, live = self.len(), "ResourceSet dropped with live resources");
            self.release_all();
        }
    }
}

/// Scoped acquisition on a [`ResourceSet`].
///
/// Dereferences to the set. Ending the scope, by [`Scope::finish`] or by
/// drop on an early return, releases what was acquired during it in
/// reverse order.
pub struct Scope<'a> {
    set: &'a mut ResourceSet,
    mark: usize,
}

impl Scope<'_> {
    pub fn finish(self) -> ReleaseReport {
        self.set.release_since(self.mark)
    }
}

impl Deref for Scope<'_> {
    type Target = ResourceSet;

    fn deref(&self) -> &ResourceSet {
        self.set
    }
}

impl DerefMut for Scope<'_> {
    fn deref_mut(&mut self) -> &mut ResourceSet {
        self.set
    }
}

impl Drop for Scope<'_> {
    fn drop(&mut self) {
        self.set.release_since(self.mark);
    }
}
