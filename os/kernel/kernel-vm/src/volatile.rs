//! # Volatile page ranges
//!
//! A [`VolatileRangeSet`] records which pages of one memory object a single
//! mapping has declared volatile, and whether the system has since purged
//! them. Page indices are object-relative and confined to the universe
//! `[0, total_pages)` fixed at construction.
//!
//! ## Invariants
//!
//! After every mutation the stored entries
//!
//! 1. are sorted by `base` and pairwise non-overlapping,
//! 2. never touch a neighbour with the same `was_purged` flag (such
//!    neighbours are merged into one entry),
//! 3. lie within the universe.
//!
//! Lookups rely on (1): every query binary-searches the entry list with
//! [`slice::partition_point`] for the first entry that can overlap (or
//! touch) the query and walks forward from there.
//!
//! ## Purge-state conflicts
//!
//! When [`add`](VolatileRangeSet::add) overlaps an entry that carries a
//! different `was_purged` flag, the incoming state wins for the overlapped
//! pages; the old entry keeps only what lies outside.
//!
//! ```text
//!   before:  [0 ─────────────── 100) purged=false
//!   add:           [10 ── 20)         purged=true
//!   after:   [0 ─ 10)[10 ── 20)[20 ─ 100)
//!             false    true      false
//! ```

use alloc::vec::Vec;
use core::ops::{ControlFlow, Range};

/// `count` pages starting at object page `base`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct VolatilePageRange {
    pub base: usize,
    pub count: usize,
    pub was_purged: bool,
}

impl VolatilePageRange {
    #[inline]
    #[must_use]
    pub const fn new(base: usize, count: usize) -> Self {
        Self {
            base,
            count,
            was_purged: false,
        }
    }

    #[inline]
    #[must_use]
    pub const fn with_purged(mut self, was_purged: bool) -> Self {
        self.was_purged = was_purged;
        self
    }

    /// One past the last page, saturating at `usize::MAX`.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> usize {
        self.base.saturating_add(self.count)
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[inline]
    #[must_use]
    pub const fn contains_page(&self, index: usize) -> bool {
        index >= self.base && index < self.end()
    }

    #[inline]
    #[must_use]
    pub const fn intersects(&self, other: &Self) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.base < other.end()
            && other.base < self.end()
    }

    #[inline]
    #[must_use]
    pub const fn intersects_or_adjacent(&self, other: &Self) -> bool {
        self.base <= other.end() && other.base <= self.end()
    }

    /// Same pages, ignoring `was_purged`.
    #[inline]
    #[must_use]
    pub const fn range_equals(&self, other: &Self) -> bool {
        self.base == other.base && self.count == other.count
    }

    /// The pages of `self` that also lie in `other`; keeps `self`'s flag.
    #[must_use]
    pub fn intersected(&self, other: &Self) -> Self {
        let base = self.base.max(other.base);
        let end = self.end().min(other.end());
        if end <= base {
            return Self::default().with_purged(self.was_purged);
        }
        Self {
            base,
            count: end - base,
            was_purged: self.was_purged,
        }
    }

    /// Grow `self` to also cover `other`. The two must touch.
    pub fn combine_intersecting_or_adjacent(&mut self, other: &Self) {
        debug_assert!(self.intersects_or_adjacent(other));
        let base = self.base.min(other.base);
        let end = self.end().max(other.end());
        self.base = base;
        self.count = end - base;
    }

    /// What remains of `self` before and after removing `other`.
    #[must_use]
    pub fn subtract_intersecting(&self, other: &Self) -> (Option<Self>, Option<Self>) {
        if !self.intersects(other) {
            return if self.end() <= other.base {
                (Some(*self), None)
            } else {
                (None, Some(*self))
            };
        }
        let before = (self.base < other.base).then(|| Self {
            base: self.base,
            count: other.base - self.base,
            was_purged: self.was_purged,
        });
        let after = (other.end() < self.end()).then(|| Self {
            base: other.end(),
            count: self.end() - other.end(),
            was_purged: self.was_purged,
        });
        (before, after)
    }
}

/// Sorted, non-overlapping, self-merging set of volatile page ranges.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VolatileRangeSet {
    ranges: Vec<VolatilePageRange>,
    total_pages: usize,
}

impl VolatileRangeSet {
    /// An empty set (everything non-volatile) over `[0, total_pages)`.
    #[must_use]
    pub const fn new(total_pages: usize) -> Self {
        Self {
            ranges: Vec::new(),
            total_pages,
        }
    }

    #[inline]
    #[must_use]
    pub const fn total_pages(&self) -> usize {
        self.total_pages
    }

    #[inline]
    #[must_use]
    pub fn ranges(&self) -> &[VolatilePageRange] {
        &self.ranges
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    /// Whether one entry covers the whole universe.
    #[must_use]
    pub fn is_all(&self) -> bool {
        matches!(
            self.ranges.as_slice(),
            [only] if only.base == 0 && only.count == self.total_pages
        )
    }

    fn universe(&self) -> VolatilePageRange {
        VolatilePageRange::new(0, self.total_pages)
    }

    /// `range` clipped to the universe, keeping its flag.
    fn clip(&self, range: VolatilePageRange) -> VolatilePageRange {
        self.universe()
            .intersected(&range)
            .with_purged(range.was_purged)
    }

    /// Indices of the entries that overlap or touch `range`.
    fn touching(&self, range: &VolatilePageRange) -> Range<usize> {
        let start = self.ranges.partition_point(|e| e.end() < range.base);
        let stop = self.ranges.partition_point(|e| e.base <= range.end());
        start..stop.max(start)
    }

    /// Indices of the entries that share at least one page with `range`.
    fn overlapping(&self, range: &VolatilePageRange) -> Range<usize> {
        let start = self.ranges.partition_point(|e| e.end() <= range.base);
        let stop = self.ranges.partition_point(|e| e.base < range.end());
        start..stop.max(start)
    }

    /// Mark `range` volatile with its `was_purged` flag.
    ///
    /// Returns `true` iff the stored entries changed.
    pub fn add(&mut self, range: VolatilePageRange) -> bool {
        let incoming = self.clip(range);
        if incoming.is_empty() {
            return false;
        }

        let window = self.touching(&incoming);
        let mut merged = incoming;
        let mut before = None;
        let mut after = None;
        for existing in &self.ranges[window.clone()] {
            if existing.was_purged == incoming.was_purged {
                merged.combine_intersecting_or_adjacent(existing);
            } else {
                let (left, right) = existing.subtract_intersecting(&incoming);
                before = before.or(left);
                after = after.or(right);
            }
        }

        let replacement: Vec<_> = before
            .into_iter()
            .chain(core::iter::once(merged))
            .chain(after)
            .collect();
        if self.ranges[window.clone()] == replacement[..] {
            return false;
        }
        self.ranges.splice(window, replacement);
        true
    }

    /// Make `range` non-volatile again.
    ///
    /// Returns `None` if nothing in `range` was volatile. Otherwise returns
    /// whether any of the removed pages had been purged.
    pub fn remove(&mut self, range: VolatilePageRange) -> Option<bool> {
        let range = self.clip(range);
        if range.is_empty() {
            return None;
        }

        let window = self.overlapping(&range);
        if window.is_empty() {
            return None;
        }

        let mut was_purged = false;
        let mut before = None;
        let mut after = None;
        for existing in &self.ranges[window.clone()] {
            was_purged |= existing.was_purged;
            let (left, right) = existing.subtract_intersecting(&range);
            before = before.or(left);
            after = after.or(right);
        }
        self.ranges.splice(window, before.into_iter().chain(after));
        Some(was_purged)
    }

    /// Whether any page of `range` is volatile.
    #[must_use]
    pub fn intersects(&self, range: VolatilePageRange) -> bool {
        let range = self.clip(range);
        !range.is_empty() && !self.overlapping(&range).is_empty()
    }

    #[must_use]
    pub fn contains(&self, page_index: usize) -> bool {
        self.intersects(VolatilePageRange::new(page_index, 1))
    }

    /// Call `f` with every stored entry that overlaps `range`, clipped to
    /// `range`, in ascending order. `f` may stop the walk early.
    pub fn for_each_intersecting_range<F>(
        &self,
        range: VolatilePageRange,
        mut f: F,
    ) -> ControlFlow<()>
    where
        F: FnMut(VolatilePageRange) -> ControlFlow<()>,
    {
        let range = self.clip(range);
        if range.is_empty() {
            return ControlFlow::Continue(());
        }
        for existing in &self.ranges[self.overlapping(&range)] {
            f(existing.intersected(&range))?;
        }
        ControlFlow::Continue(())
    }

    /// Replace the contents with `other`'s entries, clipped to this universe.
    pub fn copy_from(&mut self, other: &Self) {
        self.ranges.clear();
        for range in other.ranges() {
            self.add(*range);
        }
    }
}

/// Pages volatile in both `a` and `b`. Flags are taken from `a`.
#[must_use]
pub fn intersect_ranges(
    a: &[VolatilePageRange],
    b: &[VolatilePageRange],
) -> Vec<VolatilePageRange> {
    let mut out = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        let piece = a[i].intersected(&b[j]);
        if !piece.is_empty() {
            out.push(piece);
        }
        if a[i].end() <= b[j].end() {
            i += 1;
        } else {
            j += 1;
        }
    }
    out
}

/// Number of pages in `[0, total_pages)` not covered by `volatile`.
#[must_use]
pub fn count_nonvolatile(volatile: &[VolatilePageRange], total_pages: usize) -> usize {
    let covered: usize = volatile
        .iter()
        .map(|r| r.intersected(&VolatilePageRange::new(0, total_pages)).count)
        .sum();
    total_pages - covered
}
