//! Shared-memory regions.

use super::PageSet;
use super::store::StoreShared;
use crate::config::PageSize;
use crate::config::defaults::NAME_LEN;
use crate::error::{Error, Result};
use crate::observability;
use crate::pin::{self, PinOutcome, PinStatus, PinTracker};
use rustix::fd::{AsFd, BorrowedFd};
use rustix::mm::ProtFlags;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// System-assigned identity of a region. Never reused by a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionId(u64);

impl RegionId {
    /// Wrap a raw id (as carried by the control device).
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw id value.
    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for RegionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A counted reference to a region.
///
/// Every open resource-table entry and every live [`Mapping`](super::Mapping)
/// holds one. The region is destroyed and its pages returned when the last
/// handle is dropped.
pub type RegionHandle = Arc<Region>;

/// Mutable state of a region, guarded by the region's own lock.
struct RegionState {
    name: String,
    size: usize,
    pages: PageSet,
    pins: PinTracker,
    prot_mask: ProtFlags,
    mappings: usize,
    ever_mapped: bool,
}

/// A named, sized block of page-backed anonymous memory.
pub struct Region {
    id: RegionId,
    page_size: PageSize,
    store: Arc<StoreShared>,
    state: Mutex<RegionState>,
}

impl Region {
    pub(crate) fn new(
        id: RegionId,
        name: &str,
        size: usize,
        page_size: PageSize,
        store: Arc<StoreShared>,
    ) -> Result<Self> {
        let bytes = page_size
            .align(size)
            .ok_or_else(|| Error::InvalidArgument(format!("size {size} too large")))?;
        let pages = PageSet::new(name, bytes)?;
        let tracker = PinTracker::new(page_size.pages_for(size));
        Ok(Self {
            id,
            page_size,
            store,
            state: Mutex::new(RegionState {
                name: truncate_name(name),
                size,
                pages,
                pins: tracker,
                prot_mask: ProtFlags::READ | ProtFlags::WRITE | ProtFlags::EXEC,
                mappings: 0,
                ever_mapped: false,
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, RegionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The region's id.
    pub fn id(&self) -> RegionId {
        self.id
    }

    /// Size in bytes, as requested at creation.
    pub fn size(&self) -> usize {
        self.state().size
    }

    /// The advisory name.
    pub fn name(&self) -> String {
        self.state().name.clone()
    }

    /// Rename the region. Refused once the region has been mapped.
    pub fn set_name(&self, name: &str) -> Result<()> {
        let mut state = self.state();
        if state.ever_mapped {
            return Err(Error::InvalidArgument(format!(
                "region {} is mapped; name is fixed",
                self.id
            )));
        }
        state.name = truncate_name(name);
        Ok(())
    }

    /// Resize the region.
    ///
    /// Only allowed while the region has never been mapped and carries no
    /// pin state.
    pub fn set_size(&self, size: usize) -> Result<()> {
        if size == 0 {
            return Err(Error::InvalidArgument("size must be greater than 0".into()));
        }
        let mut state = self.state();
        if state.size == size {
            return Ok(());
        }
        if state.ever_mapped || !state.pins.is_pristine() {
            return Err(Error::InvalidArgument(format!(
                "region {} is in use; size is fixed",
                self.id
            )));
        }

        let old_len = state.pages.len();
        let new_len = self
            .page_size
            .align(size)
            .ok_or_else(|| Error::InvalidArgument(format!("size {size} too large")))?;
        if new_len > old_len {
            self.store.reserve(new_len - old_len)?;
        }
        if let Err(e) = state.pages.resize(new_len) {
            if new_len > old_len {
                self.store.unreserve(new_len - old_len);
            }
            return Err(e);
        }
        if new_len < old_len {
            self.store.unreserve(old_len - new_len);
        }

        state.size = size;
        state.pins = PinTracker::new(self.page_size.pages_for(size));
        tracing::debug!(region = %self.id, size, "region resized");
        Ok(())
    }

    /// Current protection mask for new mappings.
    pub fn prot_mask(&self) -> ProtFlags {
        self.state().prot_mask
    }

    /// Narrow the protection mask. Widening is refused.
    pub fn set_prot_mask(&self, mask: ProtFlags) -> Result<()> {
        let mut state = self.state();
        if !state.prot_mask.contains(mask) {
            return Err(Error::InvalidArgument(format!(
                "cannot widen protection of region {} from {:?} to {:?}",
                self.id, state.prot_mask, mask
            )));
        }
        state.prot_mask = mask;
        Ok(())
    }

    /// Pin `[offset, offset + len)`; `len == 0` pins to the end of the region.
    pub fn pin(&self, offset: usize, len: usize) -> Result<PinOutcome> {
        let mut state = self.state();
        let pages = pin::page_range(offset, len, self.page_size, state.size)?;
        let outcome = state.pins.pin(pages);
        tracing::trace!(region = %self.id, offset, len, ?outcome, "pin");
        Ok(outcome)
    }

    /// Unpin `[offset, offset + len)`; counts are floored at zero.
    ///
    /// Returns true if part of the range was purged while unpinned. The
    /// report does not consume the purge signal: the next pin still returns
    /// [`PinOutcome::WasPurged`].
    pub fn unpin(&self, offset: usize, len: usize) -> Result<bool> {
        let mut state = self.state();
        let pages = pin::page_range(offset, len, self.page_size, state.size)?;
        let was_purged = state.pins.is_purged(pages.clone());
        if state.pins.unpin(pages, self.store.tick()) {
            tracing::debug!(region = %self.id, "region fully unpinned, now purgeable");
        }
        Ok(was_purged)
    }

    /// Whether any page of the range is pinned.
    pub fn pin_status(&self, offset: usize, len: usize) -> Result<PinStatus> {
        let state = self.state();
        let pages = pin::page_range(offset, len, self.page_size, state.size)?;
        Ok(state.pins.status(pages))
    }

    /// Pin count of the page holding byte `offset`.
    pub fn pin_count(&self, offset: usize) -> u32 {
        self.state().pins.count_at(self.page_size.page_of(offset))
    }

    /// True if every page is unpinned and the region is on the reclaim list.
    pub fn is_purgeable(&self) -> bool {
        self.state().pins.is_purgeable()
    }

    /// Reclaim clock value at which the region became purgeable.
    pub fn unpinned_at(&self) -> Option<u64> {
        self.state().pins.unpinned_at()
    }

    /// Discard the pages if the region is purge-eligible.
    ///
    /// With `force`, any fully unpinned region is purged even if it never
    /// entered the reclaim list. Returns the number of pages discarded.
    pub fn purge(&self, force: bool) -> Result<usize> {
        let mut state = self.state();
        if !state.pins.counts().is_empty() {
            return Ok(0);
        }
        if !force && !state.pins.is_purgeable() {
            return Ok(0);
        }

        if let Err(e) = state.pages.discard() {
            tracing::warn!(region = %self.id, error = %e, "failed to discard region pages");
            return Err(e);
        }
        state.pins.mark_purged();
        let pages = state.pins.pages();
        observability::record_pages_purged(pages);
        tracing::debug!(region = %self.id, pages, "region purged");
        Ok(pages)
    }

    /// Copy `buf.len()` bytes starting at `offset` out of the region.
    ///
    /// The touched pages are pinned for the duration of the copy. Fails with
    /// [`Error::StaleData`] if any of them was purged and not rewritten.
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        let mut state = self.state();
        check_access(&state, offset, buf.len(), ProtFlags::READ, self.id)?;
        let pages = pin::touched_pages(offset, buf.len(), self.page_size);
        if pages.is_empty() {
            return Ok(());
        }

        let outcome = state.pins.pin_for_access(pages.clone());
        if outcome.was_purged() || state.pins.is_stale(pages.clone()) {
            state.pins.unpin_for_access(pages);
            return Err(Error::StaleData(self.id));
        }
        state.pages.read_at(offset, buf);
        state.pins.unpin_for_access(pages);
        Ok(())
    }

    /// Copy `data` into the region starting at `offset`.
    ///
    /// The touched pages are pinned for the duration of the copy. Fails with
    /// [`Error::StaleData`] if this pin is the first to observe a purge;
    /// otherwise the write re-validates any stale pages it touches.
    ///
    /// Re-validation is per page: bytes of a touched page that the write
    /// does not cover read back as zero afterwards. A holder that saw
    /// [`PinOutcome::WasPurged`] must rewrite whole pages it cares about.
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        let mut state = self.state();
        check_access(&state, offset, data.len(), ProtFlags::WRITE, self.id)?;
        let pages = pin::touched_pages(offset, data.len(), self.page_size);
        if pages.is_empty() {
            return Ok(());
        }

        if state.pins.pin_for_access(pages.clone()).was_purged() {
            state.pins.unpin_for_access(pages);
            return Err(Error::StaleData(self.id));
        }
        state.pages.write_at(offset, data);
        state.pins.mark_written(pages.clone());
        state.pins.unpin_for_access(pages);
        Ok(())
    }

    /// Number of live mappings.
    pub fn mappings(&self) -> usize {
        self.state().mappings
    }

    /// Run `f` with the backing descriptor while the region is locked and
    /// counted as mapped. Used by the mapping primitive.
    pub(crate) fn with_backing<T>(
        &self,
        prot: ProtFlags,
        f: impl FnOnce(BackingDescriptor<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut state = self.state();
        if !state.prot_mask.contains(prot) {
            return Err(Error::InvalidArgument(format!(
                "mapping protection {:?} exceeds mask {:?} of region {}",
                prot, state.prot_mask, self.id
            )));
        }
        let descriptor = BackingDescriptor {
            fd: state.pages.as_fd(),
            len: state.size,
            prot,
        };
        let value = f(descriptor)?;
        state.mappings += 1;
        state.ever_mapped = true;
        Ok(value)
    }

    pub(crate) fn unmapped(&self) {
        let mut state = self.state();
        state.mappings = state.mappings.saturating_sub(1);
    }

    fn backing_len(&self) -> usize {
        self.state().pages.len()
    }
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("Region")
            .field("id", &self.id)
            .field("name", &state.name)
            .field("size", &state.size)
            .field("mappings", &state.mappings)
            .finish()
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        let len = self.backing_len();
        self.store.forget(self.id, len);
        tracing::debug!(region = %self.id, "region destroyed");
    }
}

/// What the mapping primitive needs to map a region.
#[derive(Debug, Clone, Copy)]
pub struct BackingDescriptor<'a> {
    /// The backing memfd.
    pub fd: BorrowedFd<'a>,
    /// Region size in bytes.
    pub len: usize,
    /// Requested protection.
    pub prot: ProtFlags,
}

fn check_access(
    state: &RegionState,
    offset: usize,
    len: usize,
    prot: ProtFlags,
    id: RegionId,
) -> Result<()> {
    let end = offset
        .checked_add(len)
        .ok_or_else(|| Error::InvalidArgument("access range overflows".into()))?;
    if end > state.size {
        return Err(Error::InvalidArgument(format!(
            "access {offset}+{len} exceeds region {id} size {}",
            state.size
        )));
    }
    if !state.prot_mask.contains(prot) {
        return Err(Error::InvalidArgument(format!(
            "region {id} protection {:?} forbids {:?}",
            state.prot_mask, prot
        )));
    }
    Ok(())
}

fn truncate_name(name: &str) -> String {
    let max = NAME_LEN - 1;
    if name.len() <= max {
        return name.to_string();
    }
    let mut end = max;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}
