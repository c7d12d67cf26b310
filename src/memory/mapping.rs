//! Mapping a region into the caller's address space.

use super::RegionHandle;
use crate::error::{Error, Result};
use rustix::mm::{MapFlags, ProtFlags};
use std::ptr::NonNull;

/// A live `mmap` of a region's pages.
///
/// The mapping holds a reference to its region, so the pages stay valid
/// while it exists even if every resource-table entry is closed. Writes
/// through the mapping bypass pin checks: callers re-validate with
/// [`Region::pin`](super::Region::pin) before trusting the contents.
///
/// # Example
///
/// ```rust
/// use ashfile::ServiceConfig;
/// use ashfile::memory::{Mapping, RegionStore};
/// use std::sync::Arc;
///
/// let store = RegionStore::new(&ServiceConfig::testing());
/// let region = store.create("mapped", 4096).unwrap();
/// region.write(0, b"hi").unwrap();
///
/// let mapping = Mapping::new(Arc::clone(&region)).unwrap();
/// assert_eq!(&mapping.as_slice()[..2], b"hi");
/// ```
pub struct Mapping {
    region: RegionHandle,
    ptr: NonNull<u8>,
    len: usize,
    prot: ProtFlags,
}

impl Mapping {
    /// Map the region readable, and writable if its mask allows.
    pub fn new(region: RegionHandle) -> Result<Self> {
        let prot = region.prot_mask() & (ProtFlags::READ | ProtFlags::WRITE);
        Self::with_prot(region, prot)
    }

    /// Map the region with `prot`, which must include read access and be
    /// within the region's mask.
    pub fn with_prot(region: RegionHandle, prot: ProtFlags) -> Result<Self> {
        if !prot.contains(ProtFlags::READ) {
            return Err(Error::InvalidArgument("mappings must be readable".into()));
        }
        let (ptr, len) = region.with_backing(prot, |backing| {
            // SAFETY: A null hint lets the kernel choose a fresh address;
            // the descriptor stays open for the call under the region lock.
            let ptr = unsafe {
                rustix::mm::mmap(
                    std::ptr::null_mut(),
                    backing.len,
                    backing.prot,
                    MapFlags::SHARED,
                    backing.fd,
                    0,
                )
            }
            .map_err(|e| Error::from_alloc(e, "mmap"))?;
            let ptr = NonNull::new(ptr.cast::<u8>())
                .ok_or_else(|| Error::OutOfMemory("mmap returned null".into()))?;
            Ok((ptr, backing.len))
        })?;

        tracing::trace!(region = %region.id(), len, ?prot, "region mapped");
        Ok(Self {
            region,
            ptr,
            len,
            prot,
        })
    }

    /// The mapped region.
    pub fn region(&self) -> &RegionHandle {
        &self.region
    }

    /// Mapped length in bytes (the region size).
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the mapping is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Protection the mapping was created with.
    pub fn prot(&self) -> ProtFlags {
        self.prot
    }

    /// Pointer to the first mapped byte.
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Mutable pointer, if the mapping is writable.
    pub fn as_mut_ptr(&self) -> Option<*mut u8> {
        self.prot
            .contains(ProtFlags::WRITE)
            .then_some(self.ptr.as_ptr())
    }

    /// The mapped bytes.
    ///
    /// Other holders of the region may write concurrently; the slice
    /// reflects whatever the shared pages contain at the time of each read.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: Mappings are always readable and valid for `len` bytes
        // while self lives.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// The mapped bytes, mutably.
    ///
    /// Returns `None` for read-only mappings.
    pub fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        let ptr = self.as_mut_ptr()?;
        // SAFETY: Writable mapping valid for `len` bytes; `&mut self`
        // excludes other borrows through this mapping.
        Some(unsafe { std::slice::from_raw_parts_mut(ptr, self.len) })
    }
}

impl std::fmt::Debug for Mapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mapping")
            .field("region", &self.region.id())
            .field("len", &self.len)
            .field("prot", &self.prot)
            .finish()
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: ptr/len are exactly what mmap returned in with_prot, and
        // every slice handed out borrows self, so none outlives this call.
        unsafe {
            let _ = rustix::mm::munmap(self.ptr.as_ptr().cast(), self.len);
        }
        self.region.unmapped();
    }
}

// SAFETY: The mapping is shared memory reachable from any thread; the
// region handle it holds is itself Send + Sync.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use crate::memory::RegionStore;
    use std::sync::Arc;

    #[test]
    fn test_mapping_sees_facade_writes() {
        let store = RegionStore::new(&ServiceConfig::testing());
        let region = store.create("map", 4096).unwrap();
        let mapping = Mapping::new(Arc::clone(&region)).unwrap();

        region.write(10, b"abc").unwrap();
        assert_eq!(&mapping.as_slice()[10..13], b"abc");
        assert_eq!(region.mappings(), 1);
    }

    #[test]
    fn test_two_mappings_share_pages() {
        let store = RegionStore::new(&ServiceConfig::testing());
        let region = store.create("map2", 4096).unwrap();
        let mut a = Mapping::new(Arc::clone(&region)).unwrap();
        let b = Mapping::new(Arc::clone(&region)).unwrap();

        a.as_mut_slice().unwrap()[0] = 42;
        assert_eq!(b.as_slice()[0], 42);

        drop(a);
        assert_eq!(region.mappings(), 1);
    }

    #[test]
    fn test_mapping_keeps_region_alive() {
        let store = RegionStore::new(&ServiceConfig::testing());
        let region = store.create("alive", 4096).unwrap();
        let id = region.id();
        let mapping = Mapping::new(Arc::clone(&region)).unwrap();

        assert!(!store.release(region));
        assert!(store.lookup(id).is_ok());
        drop(mapping);
        assert!(store.lookup(id).is_err());
    }

    #[test]
    fn test_read_only_mapping() {
        let store = RegionStore::new(&ServiceConfig::testing());
        let region = store.create("ro", 4096).unwrap();
        region.set_prot_mask(ProtFlags::READ).unwrap();

        let mut mapping = Mapping::new(Arc::clone(&region)).unwrap();
        assert!(mapping.as_mut_slice().is_none());
        assert!(matches!(
            Mapping::with_prot(Arc::clone(&region), ProtFlags::READ | ProtFlags::WRITE),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_purge_visible_through_mapping() {
        let store = RegionStore::new(&ServiceConfig::testing());
        let region = store.create("purged", 4096).unwrap();
        let mapping = Mapping::new(Arc::clone(&region)).unwrap();
        region.write(0, b"zzz").unwrap();

        region.purge(true).unwrap();
        assert_eq!(&mapping.as_slice()[..3], &[0, 0, 0]);
    }
}
