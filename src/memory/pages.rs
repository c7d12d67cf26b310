//! Backing pages of a region: an anonymous memfd plus the service's own
//! mapping of it.

use crate::error::{Error, Result};
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use rustix::fs::FallocateFlags;
use rustix::mm::{MapFlags, ProtFlags};
use std::ffi::CString;
use std::ptr::NonNull;

/// Page-backed storage for one region.
///
/// The pages live in a memfd, so they are reference-counted by the kernel,
/// zero-filled on creation and can be discarded individually with
/// `fallocate(PUNCH_HOLE)`. The service keeps a read/write mapping of the
/// whole file for byte-level access; clients get their own mappings of the
/// same fd through [`Mapping`](super::Mapping).
pub struct PageSet {
    fd: OwnedFd,
    ptr: NonNull<u8>,
    len: usize,
}

impl PageSet {
    /// Allocate `len` zeroed bytes. `len` must already be page aligned.
    pub fn new(name: &str, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::InvalidArgument("size must be greater than 0".into()));
        }

        let cname = CString::new(format!("ashfile/{}", memfd_label(name)))
            .map_err(|e| Error::InvalidArgument(e.to_string()))?;
        let fd = rustix::fs::memfd_create(&cname, rustix::fs::MemfdFlags::CLOEXEC)
            .map_err(|e| Error::from_alloc(e, "memfd_create"))?;
        rustix::fs::ftruncate(&fd, len as u64).map_err(|e| Error::from_alloc(e, "ftruncate"))?;

        let ptr = map_shared(&fd, len)?;
        Ok(Self { fd, ptr, len })
    }

    /// Length of the backing file in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the set holds no pages.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Change the backing length, remapping the service's view.
    pub fn resize(&mut self, len: usize) -> Result<()> {
        if len == 0 {
            return Err(Error::InvalidArgument("size must be greater than 0".into()));
        }
        if len == self.len {
            return Ok(());
        }

        rustix::fs::ftruncate(&self.fd, len as u64).map_err(|e| Error::from_alloc(e, "ftruncate"))?;
        let ptr = match map_shared(&self.fd, len) {
            Ok(ptr) => ptr,
            Err(e) => {
                let _ = rustix::fs::ftruncate(&self.fd, self.len as u64);
                return Err(e);
            }
        };

        // SAFETY: The old mapping came from map_shared with `self.len` bytes
        // and is replaced below; callers hold the region lock, so no copy is
        // in flight through it.
        unsafe {
            let _ = rustix::mm::munmap(self.ptr.as_ptr().cast(), self.len);
        }
        self.ptr = ptr;
        self.len = len;
        Ok(())
    }

    /// Discard every page. Later reads observe zeroes.
    pub fn discard(&self) -> Result<()> {
        rustix::fs::fallocate(
            &self.fd,
            FallocateFlags::PUNCH_HOLE | FallocateFlags::KEEP_SIZE,
            0,
            self.len as u64,
        )?;
        Ok(())
    }

    /// Copy bytes out of the pages starting at `offset`.
    ///
    /// The caller has checked that `offset + buf.len() <= self.len()`.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) {
        debug_assert!(offset + buf.len() <= self.len);
        // SAFETY: The range is within the mapping, which lives as long as self.
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), buf.as_mut_ptr(), buf.len());
        }
    }

    /// Copy bytes into the pages starting at `offset`.
    ///
    /// The caller has checked that `offset + data.len() <= self.len()`.
    pub fn write_at(&self, offset: usize, data: &[u8]) {
        debug_assert!(offset + data.len() <= self.len);
        // SAFETY: The range is within the mapping, which lives as long as self.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset), data.len());
        }
    }
}

impl AsFd for PageSet {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl std::fmt::Debug for PageSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageSet")
            .field("fd", &self.fd)
            .field("len", &self.len)
            .finish()
    }
}

impl Drop for PageSet {
    fn drop(&mut self) {
        // SAFETY: ptr/len describe the mapping created by map_shared, and
        // nothing borrows it once the page set is dropped.
        unsafe {
            let _ = rustix::mm::munmap(self.ptr.as_ptr().cast(), self.len);
        }
        // fd is closed when OwnedFd is dropped; the kernel frees the pages
        // once no other mapping references them
    }
}

// SAFETY: PageSet is Send + Sync because:
// - The mapping is shared memory that can be accessed from any thread
// - Byte copies are serialized by the owning region's lock
unsafe impl Send for PageSet {}
unsafe impl Sync for PageSet {}

/// Longest name passed to `memfd_create`, which refuses more than 249 bytes
/// including its own prefix.
const MEMFD_LABEL_MAX: usize = 200;

fn memfd_label(name: &str) -> &str {
    let mut end = name.len().min(MEMFD_LABEL_MAX);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

/// Map `len` bytes of `fd` read/write and shared.
fn map_shared<Fd: AsFd>(fd: Fd, len: usize) -> Result<NonNull<u8>> {
    // SAFETY: A null hint lets the kernel choose a fresh address, so no
    // existing mapping is replaced.
    let ptr = unsafe {
        rustix::mm::mmap(
            std::ptr::null_mut(),
            len,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            fd,
            0,
        )
    }
    .map_err(|e| Error::from_alloc(e, "mmap"))?;

    NonNull::new(ptr.cast::<u8>()).ok_or_else(|| Error::OutOfMemory("mmap returned null".into()))
}
