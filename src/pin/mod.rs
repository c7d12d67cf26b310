//! Pin/unpin reservation accounting.
//!
//! A pin is a reference-counted promise that a range of a region will not be
//! reclaimed. When every page of a region is unpinned the region may be
//! purged under memory pressure; the next pin of a purged page reports
//! [`PinOutcome::WasPurged`] once so the holder knows the contents are gone.
//!
//! # Architecture
//!
//! - [`RangeCounts`]: sorted, disjoint `(range, count)` runs with
//!   split-on-overlap and merge-on-equal-count
//! - [`PinTracker`]: the per-region pin, purge and stale maps
//! - [`page_range`]: validation of caller-supplied byte ranges

mod ranges;
mod tracker;

pub use ranges::RangeCounts;
pub use tracker::{PinOutcome, PinStatus, PinTracker};

use crate::config::PageSize;
use crate::error::{Error, Result};
use std::ops::Range;

/// Convert a caller-supplied `(offset, len)` pin range into pages.
///
/// Both values must be multiples of the page size. A `len` of zero extends
/// the range to the end of the region.
pub fn page_range(offset: usize, len: usize, page: PageSize, size: usize) -> Result<Range<usize>> {
    if !page.is_aligned(offset) || !page.is_aligned(len) {
        return Err(Error::InvalidArgument(format!(
            "pin range {offset}+{len} is not page aligned"
        )));
    }
    let pages = page.pages_for(size);
    let first = page.page_of(offset);
    let last = if len == 0 {
        pages
    } else {
        offset
            .checked_add(len)
            .map(|end| page.page_of(end))
            .ok_or_else(|| Error::InvalidArgument("pin range overflows".into()))?
    };
    if first >= pages || last > pages {
        return Err(Error::InvalidArgument(format!(
            "pin range {offset}+{len} exceeds region size {size}"
        )));
    }
    Ok(first..last)
}

/// Pages touched by a byte access of `len` bytes at `offset`.
pub fn touched_pages(offset: usize, len: usize, page: PageSize) -> Range<usize> {
    let first = page.page_of(offset);
    if len == 0 {
        return first..first;
    }
    first..page.pages_for(offset + len)
}
