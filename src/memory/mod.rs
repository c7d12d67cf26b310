//! Shared-memory regions and their backing pages.
//!
//! This module is the region store: it allocates named, sized regions
//! backed by anonymous memfd pages, hands out counted references to them,
//! maps them into the caller's address space and returns the pages when
//! the last reference goes away.
//!
//! # Architecture
//!
//! - [`RegionStore`]: the id → region table, memory quota and reclaim pass
//! - [`Region`]: one region; its own lock guards pin state and byte access
//! - [`PageSet`]: the memfd and the service's own mapping of it
//! - [`Mapping`]: a caller-side `mmap` of a region
//!
//! # Example
//!
//! ```rust
//! use ashfile::ServiceConfig;
//! use ashfile::memory::RegionStore;
//!
//! let store = RegionStore::new(&ServiceConfig::testing());
//! let region = store.create("r1", 4096).unwrap();
//!
//! region.write(0, b"hello").unwrap();
//! region.pin(0, 0).unwrap();
//!
//! let mut buf = [0u8; 6];
//! region.read(0, &mut buf).unwrap();
//! assert_eq!(&buf, b"hello\0");
//! ```

mod mapping;
mod pages;
mod region;
mod store;

pub use mapping::Mapping;
pub use pages::PageSet;
pub use region::{BackingDescriptor, Region, RegionHandle, RegionId};
pub use store::RegionStore;
