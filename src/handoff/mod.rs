//! Handing an open region from one process to another.
//!
//! A producer publishes a region under a [`HandoffKey`]; any consumer can
//! then claim it, which installs a fresh handle to the same region into the
//! consumer's *own* [`ResourceTable`], exactly as if the consumer had opened
//! the region itself. No socket or parent/child relationship is needed.
//!
//! # Architecture
//!
//! - [`HandoffRegistry`]: keyed offers, guarded by one short-held lock
//! - [`ResourceTable`]: a process's handle table with two-step
//!   allocate-then-install
//! - [`Process`]: a process identity plus its table

mod process;
mod registry;
mod table;

pub use process::{Pid, Process};
pub use registry::{HandoffKey, HandoffRegistry};
pub use table::{Fd, ResourceTable};
