//! Per-process client facade.
//!
//! Every call names regions by the caller's own [`Fd`]s. A handle that is
//! not open in the caller's table fails with
//! [`Error::BadHandle`](crate::Error::BadHandle), which is what makes a
//! claimed handle usable only by the process that claimed it.
//!
//! # Readiness
//!
//! Nothing enforces that a published region holds meaningful data. The
//! convention is:
//!
//! 1. The producer writes, pins the range it wants protected, then
//!    publishes.
//! 2. The consumer claims, then pins before trusting the contents. A
//!    [`PinOutcome::WasPurged`] result means the data is gone and must be
//!    regenerated; reads keep failing with
//!    [`Error::StaleData`](crate::Error::StaleData) until the pages are
//!    rewritten.

use crate::error::Result;
use crate::handoff::{Fd, HandoffKey, Pid, Process};
use crate::memory::{Mapping, RegionHandle, RegionId};
use crate::pin::{PinOutcome, PinStatus};
use crate::service::Service;
use rustix::mm::ProtFlags;
use std::sync::Arc;

/// A process's view of the service.
#[derive(Debug, Clone)]
pub struct Client {
    service: Arc<Service>,
    process: Arc<Process>,
}

impl Client {
    pub(crate) fn new(service: Arc<Service>, process: Arc<Process>) -> Self {
        Self { service, process }
    }

    /// The process this client acts for.
    pub fn process(&self) -> &Arc<Process> {
        &self.process
    }

    /// The caller's pid.
    pub fn pid(&self) -> Pid {
        self.process.pid()
    }

    /// The service this client is bound to.
    pub fn service(&self) -> &Arc<Service> {
        &self.service
    }

    fn region(&self, fd: Fd) -> Result<RegionHandle> {
        self.service.ensure_running()?;
        self.process.resolve(fd)
    }

    /// Create a zero-filled region and open it in the caller's table.
    ///
    /// If the table is full the fresh region is destroyed again and
    /// [`Error::TooManyOpenHandles`](crate::Error::TooManyOpenHandles) is
    /// returned.
    pub fn create(&self, name: &str, size: usize) -> Result<Fd> {
        self.service.ensure_running()?;
        let region = self.service.store().create(name, size)?;
        let id = region.id();
        let fd = self.process.table().open(region, false)?;
        tracing::debug!(pid = %self.pid(), region = %id, fd = fd.as_raw(), "region opened");
        Ok(fd)
    }

    /// Id of the region open under `fd`.
    pub fn region_id(&self, fd: Fd) -> Result<RegionId> {
        Ok(self.region(fd)?.id())
    }

    /// Map the region into memory, readable and writable as its
    /// protection mask allows.
    pub fn map(&self, fd: Fd) -> Result<Mapping> {
        Mapping::new(self.region(fd)?)
    }

    /// Map the region with an explicit protection.
    pub fn map_with(&self, fd: Fd, prot: ProtFlags) -> Result<Mapping> {
        Mapping::with_prot(self.region(fd)?, prot)
    }

    /// Pin `[offset, offset + len)`; `len == 0` means to the end.
    pub fn pin(&self, fd: Fd, offset: usize, len: usize) -> Result<PinOutcome> {
        self.region(fd)?.pin(offset, len)
    }

    /// Unpin `[offset, offset + len)`; `len == 0` means to the end.
    ///
    /// Returns true if part of the range was purged while unpinned; the
    /// next [`pin`](Self::pin) still reports [`PinOutcome::WasPurged`].
    pub fn unpin(&self, fd: Fd, offset: usize, len: usize) -> Result<bool> {
        self.region(fd)?.unpin(offset, len)
    }

    /// Whether any page of the range is pinned.
    pub fn pin_status(&self, fd: Fd, offset: usize, len: usize) -> Result<PinStatus> {
        self.region(fd)?.pin_status(offset, len)
    }

    /// Copy bytes out of the region.
    pub fn read(&self, fd: Fd, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.region(fd)?.read(offset, buf)
    }

    /// Copy bytes into the region.
    pub fn write(&self, fd: Fd, offset: usize, data: &[u8]) -> Result<()> {
        self.region(fd)?.write(offset, data)
    }

    /// Region size in bytes.
    pub fn get_size(&self, fd: Fd) -> Result<usize> {
        Ok(self.region(fd)?.size())
    }

    /// Resize a region that has never been mapped or pinned.
    pub fn set_size(&self, fd: Fd, size: usize) -> Result<()> {
        self.region(fd)?.set_size(size)
    }

    /// The region's advisory name.
    pub fn get_name(&self, fd: Fd) -> Result<String> {
        Ok(self.region(fd)?.name())
    }

    /// Rename a region that has never been mapped.
    pub fn set_name(&self, fd: Fd, name: &str) -> Result<()> {
        self.region(fd)?.set_name(name)
    }

    /// The region's protection mask.
    pub fn get_prot_mask(&self, fd: Fd) -> Result<ProtFlags> {
        Ok(self.region(fd)?.prot_mask())
    }

    /// Narrow the region's protection mask.
    pub fn set_prot_mask(&self, fd: Fd, mask: ProtFlags) -> Result<()> {
        self.region(fd)?.set_prot_mask(mask)
    }

    /// Offer the region open under `fd` for handoff under `key`.
    pub fn publish(&self, fd: Fd, key: HandoffKey) -> Result<()> {
        let region = self.region(fd)?;
        self.service.registry().publish(key, &self.process, &region);
        Ok(())
    }

    /// Install the region offered under `key` into this process's table.
    pub fn claim(&self, key: HandoffKey) -> Result<Fd> {
        self.service.ensure_running()?;
        self.service.registry().claim(&self.process, key)
    }

    /// Close `fd`. The region is destroyed when this was its last handle
    /// and no mapping remains.
    pub fn close(&self, fd: Fd) -> Result<()> {
        let region = self.process.table().close(fd)?;
        let id = region.id();
        let destroyed = self.service.store().release(region);
        tracing::debug!(pid = %self.pid(), region = %id, fd = fd.as_raw(), destroyed, "handle closed");
        Ok(())
    }

    /// Mark `fd` close-on-exec or not.
    pub fn set_cloexec(&self, fd: Fd, cloexec: bool) -> Result<()> {
        self.process.table().set_cloexec(fd, cloexec)
    }
}
