//! The region table.

use super::{Region, RegionHandle, RegionId};
use crate::config::{PageSize, ServiceConfig};
use crate::error::{Error, Result};
use crate::observability;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// State shared between the store and every region it created.
///
/// Regions keep this alive so that the last handle to drop can remove the
/// region from the table and return its bytes to the quota, even if that
/// happens on a thread that never touches the store itself.
pub(crate) struct StoreShared {
    regions: Mutex<HashMap<RegionId, Weak<Region>>>,
    bytes: AtomicUsize,
    quota: usize,
    clock: AtomicU64,
}

impl StoreShared {
    fn table(&self) -> MutexGuard<'_, HashMap<RegionId, Weak<Region>>> {
        self.regions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Account `bytes` against the quota.
    pub(crate) fn reserve(&self, bytes: usize) -> Result<()> {
        self.bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_add(bytes).filter(|&total| total <= self.quota)
            })
            .map(|_| ())
            .map_err(|current| {
                Error::OutOfMemory(format!(
                    "{bytes} bytes requested, {current} of {} in use",
                    self.quota
                ))
            })
    }

    pub(crate) fn unreserve(&self, bytes: usize) {
        self.bytes.fetch_sub(bytes, Ordering::AcqRel);
    }

    /// Advance the reclaim clock.
    pub(crate) fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Called by a region's destructor.
    pub(crate) fn forget(&self, id: RegionId, bytes: usize) {
        let mut table = self.table();
        if table.get(&id).is_some_and(|weak| weak.strong_count() == 0) {
            table.remove(&id);
        }
        drop(table);
        self.unreserve(bytes);
        observability::record_region_destroyed(self.bytes.load(Ordering::Acquire));
    }
}

/// Owner of the process-wide region table.
///
/// The table maps ids to *weak* references: regions are kept alive by the
/// resource tables and mappings that hold them, not by the store. The table
/// lock is only held to insert, look up or remove an entry; every region
/// has its own lock for pin and data operations.
///
/// # Example
///
/// ```rust
/// use ashfile::ServiceConfig;
/// use ashfile::memory::RegionStore;
///
/// let store = RegionStore::new(&ServiceConfig::testing());
/// let region = store.create("example", 4096).unwrap();
/// assert_eq!(store.len(), 1);
///
/// assert!(store.release(region));
/// assert!(store.is_empty());
/// ```
pub struct RegionStore {
    shared: Arc<StoreShared>,
    next_id: AtomicU64,
    page_size: PageSize,
}

impl RegionStore {
    /// Create an empty store.
    pub fn new(config: &ServiceConfig) -> Self {
        Self {
            shared: Arc::new(StoreShared {
                regions: Mutex::new(HashMap::new()),
                bytes: AtomicUsize::new(0),
                quota: config.memory_quota,
                clock: AtomicU64::new(0),
            }),
            next_id: AtomicU64::new(1),
            page_size: config.page_size,
        }
    }

    /// Page size used for sizing and pin alignment.
    pub fn page_size(&self) -> PageSize {
        self.page_size
    }

    /// Allocate a zeroed region of `size` bytes backed by
    /// `ceil(size / page_size)` pages.
    pub fn create(&self, name: &str, size: usize) -> Result<RegionHandle> {
        if size == 0 {
            return Err(Error::InvalidArgument("size must be greater than 0".into()));
        }
        let bytes = self
            .page_size
            .align(size)
            .ok_or_else(|| Error::InvalidArgument(format!("size {size} too large")))?;

        self.shared.reserve(bytes)?;
        let id = RegionId::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed));
        let region = match Region::new(id, name, size, self.page_size, Arc::clone(&self.shared)) {
            Ok(region) => Arc::new(region),
            Err(e) => {
                self.shared.unreserve(bytes);
                tracing::debug!(name, size, error = %e, "region allocation failed");
                return Err(e);
            }
        };

        self.shared.table().insert(id, Arc::downgrade(&region));
        observability::record_region_created(self.total_bytes());
        tracing::debug!(region = %id, name, size, "region created");
        Ok(region)
    }

    /// Look up a live region by id.
    pub fn lookup(&self, id: RegionId) -> Result<RegionHandle> {
        self.shared
            .table()
            .get(&id)
            .and_then(Weak::upgrade)
            .ok_or(Error::NotFound(id))
    }

    /// Drop one reference. Returns true if it was the last and the region
    /// was destroyed.
    pub fn release(&self, region: RegionHandle) -> bool {
        let id = region.id();
        match Arc::into_inner(region) {
            Some(region) => {
                drop(region);
                true
            }
            None => {
                tracing::trace!(region = %id, "region reference released");
                false
            }
        }
    }

    /// Snapshot of every live region.
    pub fn regions(&self) -> Vec<RegionHandle> {
        self.shared.table().values().filter_map(Weak::upgrade).collect()
    }

    /// Number of live regions.
    pub fn len(&self) -> usize {
        self.shared
            .table()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Returns true if no region is alive.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes of backing pages currently allocated.
    pub fn total_bytes(&self) -> usize {
        self.shared.bytes.load(Ordering::Acquire)
    }

    /// Purge every purge-eligible region. Returns the pages discarded.
    pub fn purge_all(&self) -> usize {
        let mut discarded = 0;
        for region in self.regions() {
            match region.purge(false) {
                Ok(pages) => discarded += pages,
                Err(e) => tracing::warn!(region = %region.id(), error = %e, "purge failed"),
            }
        }
        discarded
    }

    /// Purge purge-eligible regions, least recently unpinned first, until at
    /// least `target_pages` pages were discarded. Returns the pages discarded.
    pub fn reclaim(&self, target_pages: usize) -> usize {
        let mut candidates: Vec<(u64, RegionHandle)> = self
            .regions()
            .into_iter()
            .filter_map(|region| region.unpinned_at().map(|at| (at, region)))
            .collect();
        candidates.sort_by_key(|(at, _)| *at);

        let mut discarded = 0;
        for (_, region) in candidates {
            if discarded >= target_pages {
                break;
            }
            match region.purge(false) {
                Ok(pages) => discarded += pages,
                Err(e) => tracing::warn!(region = %region.id(), error = %e, "purge failed"),
            }
        }
        tracing::debug!(target_pages, discarded, "reclaim pass finished");
        discarded
    }

    /// Forget every region. Regions still referenced elsewhere stay alive
    /// until their holders drop them but can no longer be looked up.
    pub fn clear(&self) {
        self.shared.table().clear();
    }
}

impl std::fmt::Debug for RegionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionStore")
            .field("regions", &self.len())
            .field("bytes", &self.total_bytes())
            .finish()
    }
}
