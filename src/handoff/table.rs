//! Per-process resource tables.

use crate::config::ServiceConfig;
use crate::error::{Error, Result};
use crate::memory::RegionHandle;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A small integer handle naming an open resource within one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fd(i32);

impl Fd {
    /// Wrap a raw handle value.
    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    /// The raw handle value.
    pub const fn as_raw(self) -> i32 {
        self.0
    }

    fn index(self) -> Option<usize> {
        usize::try_from(self.0).ok()
    }
}

impl std::fmt::Display for Fd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fd {}", self.0)
    }
}

#[derive(Debug)]
struct Entry {
    region: RegionHandle,
    cloexec: bool,
}

#[derive(Debug)]
enum Slot {
    Free,
    /// Allocated but not yet installed.
    Reserved,
    Open(Entry),
}

#[derive(Debug)]
struct TableState {
    slots: Vec<Slot>,
    /// No slot below this index is free.
    next_fd: usize,
    /// Set by [`ResourceTable::seal`]; no further installs.
    sealed: bool,
}

/// The table mapping a process's handles to open regions.
///
/// Slots are handed out lowest-free-first, in two steps: [`alloc`] reserves
/// a slot (failing at the process's open-handle ceiling and growing the
/// backing storage when it is merely too small), then [`install`] fills it.
/// Both steps, and [`close`], take the table's own lock, so concurrent opens
/// and closes within one process never hand out the same slot twice.
///
/// [`alloc`]: ResourceTable::alloc
/// [`install`]: ResourceTable::install
/// [`close`]: ResourceTable::close
#[derive(Debug)]
pub struct ResourceTable {
    state: Mutex<TableState>,
    limit: AtomicUsize,
}

impl ResourceTable {
    /// Create an empty table with the configured capacity and ceiling.
    pub fn new(config: &ServiceConfig) -> Self {
        Self::with_limits(config.initial_table_capacity, config.open_limit)
    }

    /// Create an empty table with explicit capacity and ceiling.
    pub fn with_limits(capacity: usize, limit: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity.min(limit));
        slots.resize_with(capacity.min(limit), || Slot::Free);
        Self {
            state: Mutex::new(TableState {
                slots,
                next_fd: 0,
                sealed: false,
            }),
            limit: AtomicUsize::new(limit),
        }
    }

    fn state(&self) -> MutexGuard<'_, TableState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The open-handle ceiling.
    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::Acquire)
    }

    /// Change the open-handle ceiling. Already-open handles above it stay open.
    pub fn set_limit(&self, limit: usize) {
        self.limit.store(limit, Ordering::Release);
    }

    /// Size of the backing storage, in slots.
    pub fn capacity(&self) -> usize {
        self.state().slots.len()
    }

    /// Number of open handles.
    pub fn len(&self) -> usize {
        self.state()
            .slots
            .iter()
            .filter(|slot| matches!(slot, Slot::Open(_)))
            .count()
    }

    /// Returns true if no handle is open.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reserve the lowest free slot.
    pub fn alloc(&self) -> Result<Fd> {
        let limit = self.limit();
        let mut state = self.state();
        if state.sealed {
            return Err(Error::ServiceStopped);
        }

        let start = state.next_fd;
        let index = state.slots[start.min(state.slots.len())..]
            .iter()
            .position(|slot| matches!(slot, Slot::Free))
            .map_or(state.slots.len().max(start), |pos| start + pos);

        if index >= limit || index >= i32::MAX as usize {
            return Err(Error::TooManyOpenHandles { limit });
        }
        if index >= state.slots.len() {
            let grown = (state.slots.len() * 2).max(index + 1).min(limit);
            tracing::trace!(from = state.slots.len(), to = grown, "expanding resource table");
            state.slots.resize_with(grown, || Slot::Free);
        }

        state.slots[index] = Slot::Reserved;
        state.next_fd = index + 1;
        Ok(Fd(index as i32))
    }

    /// Fill a slot reserved by [`alloc`](Self::alloc).
    ///
    /// Fails with [`Error::ServiceStopped`] once the table is sealed; the
    /// caller still owns the reservation and must
    /// [`unreserve`](Self::unreserve) it.
    pub fn install(&self, fd: Fd, region: RegionHandle, cloexec: bool) -> Result<()> {
        let mut state = self.state();
        if state.sealed {
            return Err(Error::ServiceStopped);
        }
        let slot = fd
            .index()
            .and_then(|i| state.slots.get_mut(i))
            .ok_or(Error::BadHandle(fd))?;
        if !matches!(slot, Slot::Reserved) {
            return Err(Error::BadHandle(fd));
        }
        *slot = Slot::Open(Entry { region, cloexec });
        Ok(())
    }

    /// Give back a reserved slot that will not be installed.
    pub fn unreserve(&self, fd: Fd) {
        let mut state = self.state();
        if let Some(i) = fd.index() {
            if matches!(state.slots.get(i), Some(Slot::Reserved)) {
                state.slots[i] = Slot::Free;
                state.next_fd = state.next_fd.min(i);
            }
        }
    }

    /// Allocate a slot and install `region` into it.
    pub fn open(&self, region: RegionHandle, cloexec: bool) -> Result<Fd> {
        let fd = self.alloc()?;
        if let Err(e) = self.install(fd, region, cloexec) {
            self.unreserve(fd);
            return Err(e);
        }
        Ok(fd)
    }

    /// The region open under `fd`.
    pub fn get(&self, fd: Fd) -> Result<RegionHandle> {
        let state = self.state();
        match fd.index().and_then(|i| state.slots.get(i)) {
            Some(Slot::Open(entry)) => Ok(RegionHandle::clone(&entry.region)),
            _ => Err(Error::BadHandle(fd)),
        }
    }

    /// Close `fd`, returning the reference it held.
    pub fn close(&self, fd: Fd) -> Result<RegionHandle> {
        let mut state = self.state();
        let index = fd.index().ok_or(Error::BadHandle(fd))?;
        let slot = state.slots.get_mut(index).ok_or(Error::BadHandle(fd))?;
        match std::mem::replace(slot, Slot::Free) {
            Slot::Open(entry) => {
                state.next_fd = state.next_fd.min(index);
                Ok(entry.region)
            }
            other => {
                *slot = other;
                Err(Error::BadHandle(fd))
            }
        }
    }

    /// Whether `fd` is closed on exec.
    pub fn is_cloexec(&self, fd: Fd) -> Result<bool> {
        let state = self.state();
        match fd.index().and_then(|i| state.slots.get(i)) {
            Some(Slot::Open(entry)) => Ok(entry.cloexec),
            _ => Err(Error::BadHandle(fd)),
        }
    }

    /// Set or clear close-on-exec for `fd`.
    pub fn set_cloexec(&self, fd: Fd, cloexec: bool) -> Result<()> {
        let mut state = self.state();
        match fd.index().and_then(|i| state.slots.get_mut(i)) {
            Some(Slot::Open(entry)) => {
                entry.cloexec = cloexec;
                Ok(())
            }
            _ => Err(Error::BadHandle(fd)),
        }
    }

    /// Close every handle matching `pred`, returning their references.
    fn close_where(&self, pred: impl Fn(&Entry) -> bool) -> Vec<RegionHandle> {
        let mut state = self.state();
        let mut closed = Vec::new();
        let mut lowest = state.next_fd;
        for (index, slot) in state.slots.iter_mut().enumerate() {
            if matches!(slot, Slot::Open(entry) if pred(entry)) {
                if let Slot::Open(entry) = std::mem::replace(slot, Slot::Free) {
                    closed.push(entry.region);
                    lowest = lowest.min(index);
                }
            }
        }
        state.next_fd = lowest;
        closed
    }

    /// Close every close-on-exec handle.
    pub fn close_on_exec(&self) -> Vec<RegionHandle> {
        self.close_where(|entry| entry.cloexec)
    }

    /// Close every handle.
    pub fn close_all(&self) -> Vec<RegionHandle> {
        self.close_where(|_| true)
    }

    /// Close every handle and refuse every later allocation or install.
    pub fn seal(&self) -> Vec<RegionHandle> {
        self.state().sealed = true;
        self.close_all()
    }

    /// True once [`seal`](Self::seal) has run.
    pub fn is_sealed(&self) -> bool {
        self.state().sealed
    }
}
