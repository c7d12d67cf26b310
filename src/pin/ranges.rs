//! Sorted, disjoint page ranges with a count per range.

use std::collections::BTreeMap;
use std::ops::Range;

/// One run of pages sharing the same count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    end: usize,
    count: u32,
}

/// Per-page counters stored as disjoint `[start, end)` runs.
///
/// Pages that are absent from the map have a count of zero. Runs are split
/// when an update partially overlaps them and adjacent runs with equal
/// counts are merged back together, so the map stays as small as the
/// pattern of counts allows.
///
/// # Example
///
/// ```rust
/// use ashfile::pin::RangeCounts;
///
/// let mut counts = RangeCounts::new();
/// counts.increment(0..4);
/// counts.increment(2..6);
/// assert_eq!(counts.count_at(1), 1);
/// assert_eq!(counts.count_at(3), 2);
///
/// counts.decrement(2..6);
/// assert_eq!(counts.runs().collect::<Vec<_>>(), vec![(0..4, 1)]);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeCounts {
    spans: BTreeMap<usize, Span>,
}

impl RangeCounts {
    /// Create an empty map (every page at zero).
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one to every page in `range`.
    pub fn increment(&mut self, range: Range<usize>) {
        self.update(range, |count| count.saturating_add(1));
    }

    /// Subtract one from every page in `range`, floored at zero.
    pub fn decrement(&mut self, range: Range<usize>) {
        self.update(range, |count| count.saturating_sub(1));
    }

    /// Mark every page in `range` with a count of one.
    pub fn set(&mut self, range: Range<usize>) {
        self.update(range, |_| 1);
    }

    /// Reset every page in `range` to zero.
    pub fn clear(&mut self, range: Range<usize>) {
        self.update(range, |_| 0);
    }

    /// Reset every page to zero.
    pub fn clear_all(&mut self) {
        self.spans.clear();
    }

    /// Count of a single page.
    pub fn count_at(&self, page: usize) -> u32 {
        match self.spans.range(..=page).next_back() {
            Some((_, span)) if span.end > page => span.count,
            _ => 0,
        }
    }

    /// True if any page in `range` has a non-zero count.
    pub fn any_in(&self, range: Range<usize>) -> bool {
        if range.is_empty() {
            return false;
        }
        if let Some((_, span)) = self.spans.range(..range.start).next_back() {
            if span.end > range.start {
                return true;
            }
        }
        self.spans.range(range).next().is_some()
    }

    /// True if every page is at zero.
    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    /// Total number of pages with a non-zero count.
    pub fn pages(&self) -> usize {
        self.spans.iter().map(|(start, span)| span.end - start).sum()
    }

    /// Iterate the non-zero runs in ascending order.
    pub fn runs(&self) -> impl Iterator<Item = (Range<usize>, u32)> + '_ {
        self.spans
            .iter()
            .map(|(&start, span)| (start..span.end, span.count))
    }

    /// Non-zero runs overlapping `range`, clipped to it.
    pub fn runs_in(&self, range: Range<usize>) -> impl Iterator<Item = (Range<usize>, u32)> + '_ {
        let head = self
            .spans
            .range(..range.start)
            .next_back()
            .filter(|(_, span)| span.end > range.start);
        let body = self.spans.range(range.clone());
        head.into_iter()
            .chain(body)
            .map(move |(&start, span)| {
                (start.max(range.start)..span.end.min(range.end), span.count)
            })
    }

    /// Apply `f` to the count of every page in `range`.
    fn update(&mut self, range: Range<usize>, f: impl Fn(u32) -> u32) {
        if range.is_empty() {
            return;
        }
        self.split_at(range.start);
        self.split_at(range.end);

        let inside: Vec<(usize, Span)> = self
            .spans
            .range(range.clone())
            .map(|(&start, span)| (start, *span))
            .collect();
        for (start, _) in &inside {
            self.spans.remove(start);
        }

        let mut cursor = range.start;
        for (start, span) in inside {
            if cursor < start {
                self.insert(cursor, start, f(0));
            }
            self.insert(start, span.end, f(span.count));
            cursor = span.end;
        }
        if cursor < range.end {
            self.insert(cursor, range.end, f(0));
        }

        self.coalesce(range);
    }

    fn insert(&mut self, start: usize, end: usize, count: u32) {
        if count > 0 && start < end {
            self.spans.insert(start, Span { end, count });
        }
    }

    /// Split the run containing `pos` (if any) so that `pos` starts a run.
    fn split_at(&mut self, pos: usize) {
        let Some((&start, &span)) = self.spans.range(..pos).next_back() else {
            return;
        };
        if span.end > pos {
            self.spans.insert(start, Span { end: pos, ..span });
            self.spans.insert(pos, span);
        }
    }

    /// Merge equal-count neighbours around `range`.
    fn coalesce(&mut self, range: Range<usize>) {
        let from = self
            .spans
            .range(..range.start)
            .next_back()
            .map_or(range.start, |(&start, _)| start);
        let keys: Vec<usize> = self.spans.range(from..=range.end).map(|(&k, _)| k).collect();

        let mut prev: Option<usize> = None;
        for key in keys {
            let Some(span) = self.spans.get(&key).copied() else {
                continue;
            };
            if let Some(prev_key) = prev {
                if let Some(prev_span) = self.spans.get_mut(&prev_key) {
                    if prev_span.end == key && prev_span.count == span.count {
                        prev_span.end = span.end;
                        self.spans.remove(&key);
                        continue;
                    }
                }
            }
            prev = Some(key);
        }
    }
}
