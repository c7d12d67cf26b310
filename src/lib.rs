//! # ashfile
//!
//! Anonymous shared memory with pin/unpin reclaim and cross-process handle
//! handoff, modelled in user space on Linux.
//!
//! A [`Service`] plays the role of the kernel: it owns the region table,
//! the handoff registry and the registered processes. Each process talks to
//! it through a [`Client`] (or the raw [`device`] interface) using small
//! integer handles from its own resource table.
//!
//! ## Features
//!
//! - **Regions**: named, sized blocks of page-backed memory (memfd) that any
//!   holder can map
//! - **Pinning**: reference-counted per-page reservations; fully unpinned
//!   regions may be purged, and the next pin reports it exactly once
//! - **Handoff**: publish an open region under a key, claim it from another
//!   process straight into the claimer's own handle table
//!
//! ## Quick Start
//!
//! ```rust
//! use ashfile::prelude::*;
//!
//! let service = Service::start(ServiceConfig::testing());
//! let client = service.connect()?;
//!
//! let fd = client.create("r1", 4096)?;
//! client.write(fd, 0, b"hello")?;
//! assert_eq!(client.pin(fd, 0, 0)?, PinOutcome::Pinned);
//!
//! let mut buf = [0u8; 6];
//! client.read(fd, 0, &mut buf)?;
//! assert_eq!(&buf, b"hello\0");
//! # Ok::<(), ashfile::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod client;
pub mod config;
pub mod device;
pub mod error;
pub mod handoff;
pub mod memory;
pub mod observability;
pub mod pin;
pub mod service;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::client::Client;
    pub use crate::config::ServiceConfig;
    pub use crate::error::{Error, Result};
    pub use crate::handoff::{Fd, HandoffKey};
    pub use crate::memory::{Mapping, RegionId};
    pub use crate::pin::{PinOutcome, PinStatus};
    pub use crate::service::Service;
}

pub use client::Client;
pub use config::ServiceConfig;
pub use error::{Error, Result};
pub use handoff::{Fd, HandoffKey};
pub use service::Service;
