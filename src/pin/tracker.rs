//! Per-region pin accounting and purge bookkeeping.

use super::RangeCounts;
use std::ops::Range;

/// Result of a successful pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinOutcome {
    /// The range is pinned and its contents are intact.
    Pinned,
    /// The range is pinned, but some of it was purged while unpinned.
    ///
    /// Reported once per purge: the next pin of the same pages returns
    /// [`PinOutcome::Pinned`].
    WasPurged,
}

impl PinOutcome {
    /// True for [`PinOutcome::WasPurged`].
    pub fn was_purged(self) -> bool {
        self == PinOutcome::WasPurged
    }
}

/// Whether any page of a range is currently pinned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinStatus {
    /// At least one page has a non-zero pin count.
    Pinned,
    /// Every page has a pin count of zero.
    Unpinned,
}

/// Pin state of one region, in page units.
///
/// Tracks three per-page maps:
///
/// - `counts`: how many outstanding pins cover each page
/// - `purged`: pages discarded while unpinned, not yet re-pinned
/// - `stale`: pages re-pinned after a purge but not yet rewritten
///
/// A region becomes purge-eligible when an unpin leaves every count at zero.
/// The eligibility carries the reclaim clock value of that moment so the
/// reclaimer can purge the least recently unpinned regions first.
#[derive(Debug, Clone)]
pub struct PinTracker {
    pages: usize,
    counts: RangeCounts,
    purged: RangeCounts,
    stale: RangeCounts,
    unpinned_at: Option<u64>,
}

impl PinTracker {
    /// Create a tracker for a region of `pages` pages, nothing pinned.
    pub fn new(pages: usize) -> Self {
        Self {
            pages,
            counts: RangeCounts::new(),
            purged: RangeCounts::new(),
            stale: RangeCounts::new(),
            unpinned_at: None,
        }
    }

    /// Number of pages tracked.
    pub fn pages(&self) -> usize {
        self.pages
    }

    /// Pin `pages`, consuming the purge signal for them.
    pub fn pin(&mut self, pages: Range<usize>) -> PinOutcome {
        let lost: Vec<Range<usize>> = self.purged.runs_in(pages.clone()).map(|(r, _)| r).collect();
        let outcome = if lost.is_empty() {
            PinOutcome::Pinned
        } else {
            PinOutcome::WasPurged
        };
        for run in lost {
            self.purged.clear(run.clone());
            self.stale.set(run);
        }

        self.counts.increment(pages);
        self.unpinned_at = None;
        outcome
    }

    /// Unpin `pages`. Returns true if the region just became purge-eligible.
    pub fn unpin(&mut self, pages: Range<usize>, clock: u64) -> bool {
        self.counts.decrement(pages);
        if self.counts.is_empty() && self.unpinned_at.is_none() {
            self.unpinned_at = Some(clock);
            return true;
        }
        false
    }

    /// Pin `pages` for a single byte access.
    ///
    /// Like [`pin`](Self::pin) but keeps the region's place on the reclaim
    /// list, so that an access bracket leaves eligibility unchanged.
    pub fn pin_for_access(&mut self, pages: Range<usize>) -> PinOutcome {
        let unpinned_at = self.unpinned_at;
        let outcome = self.pin(pages);
        self.unpinned_at = unpinned_at;
        outcome
    }

    /// Drop the pin taken by [`pin_for_access`](Self::pin_for_access).
    pub fn unpin_for_access(&mut self, pages: Range<usize>) {
        self.counts.decrement(pages);
    }

    /// Reclaim clock value at which the region became purge-eligible.
    pub fn unpinned_at(&self) -> Option<u64> {
        self.unpinned_at.filter(|_| self.counts.is_empty())
    }

    /// True if every page is unpinned and the region sits on the reclaim list.
    pub fn is_purgeable(&self) -> bool {
        self.unpinned_at().is_some()
    }

    /// Record that every page was discarded. Leaves the reclaim list.
    pub fn mark_purged(&mut self) {
        self.purged.set(0..self.pages);
        self.stale.clear_all();
        self.unpinned_at = None;
    }

    /// Record that `pages` were rewritten after a purge.
    pub fn mark_written(&mut self, pages: Range<usize>) {
        self.stale.clear(pages);
    }

    /// True if any page of `pages` lost its contents and was not rewritten.
    pub fn is_stale(&self, pages: Range<usize>) -> bool {
        self.stale.any_in(pages.clone()) || self.purged.any_in(pages)
    }

    /// True if any page of `pages` is purged and not yet re-pinned.
    pub fn is_purged(&self, pages: Range<usize>) -> bool {
        self.purged.any_in(pages)
    }

    /// Pin status of `pages`.
    pub fn status(&self, pages: Range<usize>) -> PinStatus {
        if self.counts.any_in(pages) {
            PinStatus::Pinned
        } else {
            PinStatus::Unpinned
        }
    }

    /// Pin count of a single page.
    pub fn count_at(&self, page: usize) -> u32 {
        self.counts.count_at(page)
    }

    /// True if no page carries pin, purge or stale state.
    pub fn is_pristine(&self) -> bool {
        self.counts.is_empty()
            && self.purged.is_empty()
            && self.stale.is_empty()
            && self.unpinned_at.is_none()
    }

    /// The per-page pin counts.
    pub fn counts(&self) -> &RangeCounts {
        &self.counts
    }
}
