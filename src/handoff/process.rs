//! Processes as seen by the service.

use super::{Fd, ResourceTable};
use crate::config::ServiceConfig;
use crate::error::Result;
use crate::memory::RegionHandle;

/// Identity of a process registered with the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pid(u32);

impl Pid {
    /// Wrap a raw process id.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// The raw process id.
    pub const fn as_raw(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for Pid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A process: an identity plus the resource table it owns.
///
/// Every operation that changes a table is made by the process itself
/// (through [`Client`](crate::Client)) or by the service on its behalf;
/// nothing can push an entry into another process's table.
#[derive(Debug)]
pub struct Process {
    pid: Pid,
    table: ResourceTable,
}

impl Process {
    /// Create a process with an empty table sized by `config`.
    pub fn new(pid: Pid, config: &ServiceConfig) -> Self {
        Self {
            pid,
            table: ResourceTable::new(config),
        }
    }

    /// Create a process with explicit table capacity and ceiling.
    pub fn with_limits(pid: Pid, capacity: usize, open_limit: usize) -> Self {
        Self {
            pid,
            table: ResourceTable::with_limits(capacity, open_limit),
        }
    }

    /// The process id.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// The process's resource table.
    pub fn table(&self) -> &ResourceTable {
        &self.table
    }

    /// The region open under `fd`.
    pub fn resolve(&self, fd: Fd) -> Result<RegionHandle> {
        self.table.get(fd)
    }

    /// Change the open-handle ceiling (the `RLIMIT_NOFILE` analogue).
    pub fn set_open_limit(&self, limit: usize) {
        self.table.set_limit(limit);
    }

    /// Replace the process image: close every close-on-exec handle.
    /// Returns how many were closed.
    pub fn exec(&self) -> usize {
        let closed = self.table.close_on_exec();
        tracing::debug!(pid = %self.pid, closed = closed.len(), "exec closed handles");
        closed.len()
    }

    /// Tear the process down, closing every handle. Returns how many were
    /// closed.
    pub fn exit(&self) -> usize {
        let closed = self.table.close_all();
        tracing::debug!(pid = %self.pid, closed = closed.len(), "process exited");
        closed.len()
    }

    /// Cut the process off from a stopping service: close every handle and
    /// seal the table so an open or claim still in flight cannot land.
    pub(crate) fn detach(&self) -> usize {
        let closed = self.table.seal();
        tracing::debug!(pid = %self.pid, closed = closed.len(), "process detached");
        closed.len()
    }
}
