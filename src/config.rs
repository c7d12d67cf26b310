//! Service configuration.
//!
//! [`ServiceConfig`] carries every tunable the service reads at start-up.
//! Recommended values live in [`defaults`].
//!
//! # Example
//!
//! ```rust
//! use ashfile::ServiceConfig;
//!
//! let config = ServiceConfig::default()
//!     .with_open_limit(64)
//!     .with_memory_quota(16 * 1024 * 1024);
//! assert_eq!(config.open_limit, 64);
//! ```

use crate::error::{Error, Result};
use crate::observability::TracingConfig;

/// Default limits and sizes.
pub mod defaults {
    /// Fallback page size when the OS cannot be queried.
    pub const PAGE_SIZE: usize = 4096;

    /// Maximum length of a region name, including the terminating NUL of
    /// the control-device payload.
    pub const NAME_LEN: usize = 256;

    /// Default per-process open-handle ceiling (the usual `RLIMIT_NOFILE`
    /// soft limit).
    pub const DEFAULT_OPEN_LIMIT: usize = 1024;

    /// Initial number of slots backing a fresh resource table.
    pub const INITIAL_TABLE_CAPACITY: usize = 64;

    /// Default cap on the total bytes of all live regions (unlimited).
    pub const DEFAULT_MEMORY_QUOTA: usize = usize::MAX;

    /// Query the OS page size.
    pub fn os_page_size() -> usize {
        let size = rustix::param::page_size();
        if size == 0 { PAGE_SIZE } else { size }
    }
}

/// A page size: a non-zero power of two.
///
/// All region sizing and pin-range arithmetic goes through this type, so a
/// service can never run with a page size that breaks alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSize(usize);

impl PageSize {
    /// Validate `size` as a page size.
    pub fn new(size: usize) -> Result<Self> {
        if !size.is_power_of_two() {
            return Err(Error::InvalidArgument(format!(
                "page size {size} is not a power of two"
            )));
        }
        Ok(Self(size))
    }

    /// The OS page size, or [`defaults::PAGE_SIZE`] if it cannot be used.
    pub fn os() -> Self {
        Self::new(defaults::os_page_size()).unwrap_or(Self(defaults::PAGE_SIZE))
    }

    /// Size in bytes.
    pub const fn get(self) -> usize {
        self.0
    }

    /// Round `size` up to a whole number of pages; `None` on overflow.
    pub fn align(self, size: usize) -> Option<usize> {
        size.checked_next_multiple_of(self.0)
    }

    /// Number of pages needed to back `size` bytes.
    pub fn pages_for(self, size: usize) -> usize {
        size.div_ceil(self.0)
    }

    /// Index of the page holding byte `offset`.
    pub fn page_of(self, offset: usize) -> usize {
        offset / self.0
    }

    /// True if `value` is a multiple of the page size.
    pub fn is_aligned(self, value: usize) -> bool {
        value % self.0 == 0
    }
}

impl Default for PageSize {
    fn default() -> Self {
        Self::os()
    }
}

impl std::fmt::Display for PageSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Configuration for a [`Service`](crate::Service).
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Page size used for region sizing and pin-range alignment.
    pub page_size: PageSize,
    /// Open-handle ceiling applied to newly registered processes.
    pub open_limit: usize,
    /// Initial backing capacity of a process's resource table.
    pub initial_table_capacity: usize,
    /// Maximum total size in bytes of all live regions.
    pub memory_quota: usize,
    /// Which spans the service emits.
    pub tracing: TracingConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            page_size: PageSize::os(),
            open_limit: defaults::DEFAULT_OPEN_LIMIT,
            initial_table_capacity: defaults::INITIAL_TABLE_CAPACITY,
            memory_quota: defaults::DEFAULT_MEMORY_QUOTA,
            tracing: TracingConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// A small configuration for tests: fixed 4 KiB pages, tight quota and
    /// handle limits.
    pub fn testing() -> Self {
        Self {
            page_size: PageSize(defaults::PAGE_SIZE),
            open_limit: 16,
            initial_table_capacity: 4,
            memory_quota: 64 * 1024 * 1024,
            tracing: TracingConfig::default(),
        }
    }

    /// Set the page size. Fails unless `size` is a non-zero power of two.
    pub fn with_page_size(mut self, size: usize) -> Result<Self> {
        self.page_size = PageSize::new(size)?;
        Ok(self)
    }

    /// Set the per-process open-handle ceiling.
    pub fn with_open_limit(mut self, open_limit: usize) -> Self {
        self.open_limit = open_limit;
        self
    }

    /// Set the initial resource-table capacity.
    pub fn with_initial_table_capacity(mut self, capacity: usize) -> Self {
        self.initial_table_capacity = capacity;
        self
    }

    /// Set the memory quota in bytes.
    pub fn with_memory_quota(mut self, memory_quota: usize) -> Self {
        self.memory_quota = memory_quota;
        self
    }

    /// Choose which spans the service emits.
    pub fn with_tracing(mut self, tracing: TracingConfig) -> Self {
        self.tracing = tracing;
        self
    }
}
