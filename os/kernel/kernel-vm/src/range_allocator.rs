//! Virtual address range allocator.
//!
//! Free space is a list of disjoint ranges kept in address order, so that a
//! freed range can be merged with its neighbours on insertion. Allocation is
//! first fit.
//!
//! ```text
//!   available: [0x80_0000 ─────── 0x90_0000)   [0xa0_0000 ──── ceiling)
//!   allocate_specific(0x84_0000, 0x1000):
//!   available: [0x80_0000 ─ 0x84_0000) [0x84_1000 ─ 0x90_0000)   [...)
//! ```

use alloc::sync::Arc;
use alloc::vec::Vec;
use kernel_info::memory::{DEFAULT_MMAP_ALIGNMENT, USERSPACE_BASE, USERSPACE_CEILING};
use kernel_memory_addresses::{VirtualAddress, VirtualRange, page_round_up};
use kernel_sync::SpinLock;
use log::trace;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeAllocator {
    total: VirtualRange,
    /// Free ranges: sorted, disjoint and never touching each other.
    available: Vec<VirtualRange>,
}

impl RangeAllocator {
    #[must_use]
    pub fn new(total: VirtualRange) -> Self {
        let available = if total.is_empty() {
            Vec::new()
        } else {
            alloc::vec![total]
        };
        Self { total, available }
    }

    /// The allocator handed to every fresh userspace page directory.
    #[must_use]
    pub fn userspace() -> Self {
        Self::new(VirtualRange::new(
            VirtualAddress::new(USERSPACE_BASE),
            USERSPACE_CEILING - USERSPACE_BASE,
        ))
    }

    #[inline]
    #[must_use]
    pub const fn total_range(&self) -> VirtualRange {
        self.total
    }

    #[inline]
    #[must_use]
    pub fn available_ranges(&self) -> &[VirtualRange] {
        &self.available
    }

    /// Find `size` bytes (rounded up to pages) anywhere, aligned to
    /// `alignment` (at least a page; must be a power of two).
    pub fn allocate_anywhere(&mut self, size: u64, alignment: u64) -> Option<VirtualRange> {
        if size == 0 || !alignment.is_power_of_two() {
            return None;
        }
        let size = page_round_up(size)?;
        let alignment = alignment.max(DEFAULT_MMAP_ALIGNMENT);

        let (index, range) = self.available.iter().enumerate().find_map(|(i, free)| {
            let start = free.base().as_u64().checked_add(alignment - 1)? & !(alignment - 1);
            let candidate = VirtualRange::try_new(VirtualAddress::new(start), size)?;
            free.contains(&candidate).then_some((i, candidate))
        })?;

        self.carve_out(index, range);
        trace!("VM: allocated {range} anywhere");
        Some(range)
    }

    /// Claim exactly `[base, base + size)`; `size` is rounded up to pages.
    pub fn allocate_specific(&mut self, base: VirtualAddress, size: u64) -> Option<VirtualRange> {
        if size == 0 || !base.is_page_aligned() {
            return None;
        }
        let range = VirtualRange::try_new(base, page_round_up(size)?)?;
        let index = self.available.iter().position(|free| free.contains(&range))?;
        self.carve_out(index, range);
        trace!("VM: allocated {range} at requested address");
        Some(range)
    }

    fn carve_out(&mut self, index: usize, taken: VirtualRange) {
        let pieces: Vec<_> = self.available[index].carve(taken).collect();
        self.available.splice(index..=index, pieces);
    }

    /// Return `range` to the free list, merging it with touching neighbours.
    ///
    /// # Panics
    /// Panics if `range` lies outside the managed window or is (partly)
    /// free already.
    pub fn deallocate(&mut self, range: VirtualRange) {
        if range.is_empty() {
            return;
        }
        assert!(
            self.total.contains(&range),
            "deallocating {range} outside of {}",
            self.total
        );
        let index = self
            .available
            .partition_point(|free| free.base() < range.base());
        let overlaps = |i: usize| self.available.get(i).is_some_and(|free| free.intersects(&range));
        assert!(
            !overlaps(index) && !(index > 0 && overlaps(index - 1)),
            "double free of {range}"
        );

        let mut merged = range;
        let mut first = index;
        let mut last = index;
        if index > 0 && self.available[index - 1].end() == range.base() {
            first = index - 1;
            let previous = self.available[first];
            merged = VirtualRange::new(previous.base(), merged.size() + previous.size());
        }
        if let Some(next) = self.available.get(index)
            && next.base() == range.end()
        {
            last = index + 1;
            merged = VirtualRange::new(merged.base(), merged.size() + next.size());
        }
        self.available.splice(first..last, [merged]);
    }
}

/// Reference-counted range allocator owned by a page directory.
///
/// A forked child does not share its parent's free list: [`fork`](Self::fork)
/// snapshots it into a new allocator, so both sides hand out addresses
/// independently afterwards.
#[derive(Debug, Clone)]
pub struct SharedRangeAllocator(Arc<SpinLock<RangeAllocator>>);

impl SharedRangeAllocator {
    #[must_use]
    pub fn new(allocator: RangeAllocator) -> Self {
        Self(Arc::new(SpinLock::new(allocator)))
    }

    /// An independent copy of the current free list.
    #[must_use]
    pub fn fork(&self) -> Self {
        Self::new(self.snapshot())
    }

    #[must_use]
    pub fn snapshot(&self) -> RangeAllocator {
        self.0.lock().clone()
    }

    pub fn allocate_anywhere(&self, size: u64, alignment: u64) -> Option<VirtualRange> {
        self.0.with_lock(|a| a.allocate_anywhere(size, alignment))
    }

    pub fn allocate_specific(&self, base: VirtualAddress, size: u64) -> Option<VirtualRange> {
        self.0.with_lock(|a| a.allocate_specific(base, size))
    }

    /// # Panics
    /// See [`RangeAllocator::deallocate`].
    pub fn deallocate(&self, range: VirtualRange) {
        self.0.with_lock(|a| a.deallocate(range));
    }
}

impl Default for SharedRangeAllocator {
    fn default() -> Self {
        Self::new(RangeAllocator::userspace())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_info::memory::PAGE_SIZE;

    const BASE: u64 = 0x10_0000;

    fn small() -> RangeAllocator {
        RangeAllocator::new(VirtualRange::new(VirtualAddress::new(BASE), 16 * PAGE_SIZE))
    }

    fn range(page: u64, pages: u64) -> VirtualRange {
        VirtualRange::new(VirtualAddress::new(BASE + page * PAGE_SIZE), pages * PAGE_SIZE)
    }

    #[test]
    fn first_fit_rounds_size_up() {
        let mut a = small();
        assert_eq!(a.allocate_anywhere(1, PAGE_SIZE), Some(range(0, 1)));
        assert_eq!(a.allocate_anywhere(PAGE_SIZE + 1, PAGE_SIZE), Some(range(1, 2)));
        assert_eq!(a.available_ranges(), &[range(3, 13)]);
    }

    #[test]
    fn alignment_is_honoured() {
        let mut a = small();
        a.allocate_anywhere(PAGE_SIZE, PAGE_SIZE).unwrap();
        let aligned = a.allocate_anywhere(PAGE_SIZE, 4 * PAGE_SIZE).unwrap();
        assert_eq!(aligned, range(4, 1));
        assert_eq!(a.available_ranges(), &[range(1, 3), range(5, 11)]);
        assert_eq!(a.allocate_anywhere(PAGE_SIZE, 3 * PAGE_SIZE), None);
    }

    #[test]
    fn specific_allocation_and_conflicts() {
        let mut a = small();
        assert_eq!(
            a.allocate_specific(range(4, 2).base(), 2 * PAGE_SIZE),
            Some(range(4, 2))
        );
        assert_eq!(a.allocate_specific(range(5, 1).base(), PAGE_SIZE), None);
        assert_eq!(a.allocate_specific(VirtualAddress::new(BASE + 1), PAGE_SIZE), None);
        assert_eq!(a.allocate_specific(range(15, 1).base(), 2 * PAGE_SIZE), None);
    }

    #[test]
    fn deallocate_coalesces_both_sides() {
        let mut a = small();
        let x = a.allocate_specific(range(2, 2).base(), 2 * PAGE_SIZE).unwrap();
        let y = a.allocate_specific(range(4, 2).base(), 2 * PAGE_SIZE).unwrap();
        let z = a.allocate_specific(range(6, 2).base(), 2 * PAGE_SIZE).unwrap();
        a.deallocate(x);
        a.deallocate(z);
        assert_eq!(a.available_ranges(), &[range(0, 4), range(6, 10)]);
        a.deallocate(y);
        assert_eq!(a.available_ranges(), &[range(0, 16)]);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let mut a = small();
        let x = a.allocate_anywhere(PAGE_SIZE, PAGE_SIZE).unwrap();
        a.deallocate(x);
        a.deallocate(x);
    }

    #[test]
    fn fork_snapshots_the_free_list() {
        let parent = SharedRangeAllocator::new(small());
        let taken = parent.allocate_anywhere(PAGE_SIZE, PAGE_SIZE).unwrap();
        let child = parent.fork();
        assert_eq!(child.snapshot(), parent.snapshot());

        let next = child.allocate_anywhere(PAGE_SIZE, PAGE_SIZE).unwrap();
        assert_ne!(next, taken);
        assert_eq!(parent.allocate_anywhere(PAGE_SIZE, PAGE_SIZE), Some(next));
    }
}
