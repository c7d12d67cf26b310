//! Error types for ashfile.

use thiserror::Error;

use crate::handoff::Fd;
use crate::memory::RegionId;

/// Result type alias using ashfile's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for ashfile operations.
///
/// A failed operation leaves the region table, pin counts and handoff
/// offers exactly as they were before the call.
#[derive(Error, Debug)]
pub enum Error {
    /// Bad size, bad range or malformed request payload.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The region no longer exists.
    #[error("region {0} not found")]
    NotFound(RegionId),

    /// The handle is not open in the calling process's resource table.
    #[error("bad handle: {0}")]
    BadHandle(Fd),

    /// Backing pages could not be obtained.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// The calling process's resource table is at its open-handle ceiling.
    #[error("too many open handles (limit {limit})")]
    TooManyOpenHandles {
        /// The configured ceiling that was hit.
        limit: usize,
    },

    /// A claim found nothing published under the requested key.
    #[error("no resource published")]
    NoResourcePublished,

    /// The memory was purged while unpinned and has not been rewritten.
    #[error("stale data: region {0} was purged")]
    StaleData(RegionId),

    /// The service has been shut down.
    #[error("service stopped")]
    ServiceStopped,

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}

impl Error {
    /// Negative errno reported by the control device for this error.
    pub fn errno(&self) -> i32 {
        use rustix::io::Errno;

        let errno = match self {
            Error::InvalidArgument(_) => Errno::INVAL,
            Error::NotFound(_) => Errno::NOENT,
            Error::BadHandle(_) => Errno::BADF,
            Error::OutOfMemory(_) => Errno::NOMEM,
            Error::TooManyOpenHandles { .. } => Errno::MFILE,
            Error::NoResourcePublished => Errno::NODATA,
            Error::StaleData(_) => Errno::STALE,
            Error::ServiceStopped => Errno::SHUTDOWN,
            Error::System(errno) => *errno,
        };
        -errno.raw_os_error()
    }

    /// Map an allocation-time system error, folding memory exhaustion
    /// into [`Error::OutOfMemory`].
    pub(crate) fn from_alloc(errno: rustix::io::Errno, what: &str) -> Self {
        use rustix::io::Errno;

        match errno {
            Errno::NOMEM | Errno::NOSPC | Errno::FBIG => {
                Error::OutOfMemory(format!("{what}: {errno}"))
            }
            other => Error::System(other),
        }
    }
}
