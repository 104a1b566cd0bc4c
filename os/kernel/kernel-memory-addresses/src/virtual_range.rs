use crate::{PAGE_SIZE, VirtualAddress, page_round_down, page_round_up};
use core::fmt;

/// A half-open virtual range `[base, base + size)`.
///
/// Construction through [`try_new`](Self::try_new) guarantees `base + size`
/// does not wrap, so [`end`](Self::end) never overflows.
///
/// ```rust
/// # use kernel_memory_addresses::*;
/// let whole = VirtualRange::new(VirtualAddress::new(0x1000), 0x4000);
/// let hole = VirtualRange::new(VirtualAddress::new(0x2000), 0x1000);
/// let pieces: Vec<_> = whole.carve(hole).collect();
/// assert_eq!(pieces, [
///     VirtualRange::new(VirtualAddress::new(0x1000), 0x1000),
///     VirtualRange::new(VirtualAddress::new(0x3000), 0x2000),
/// ]);
/// ```
#[derive(Copy, Clone, Default, Eq, PartialEq, Hash)]
pub struct VirtualRange {
    base: VirtualAddress,
    size: u64,
}

impl VirtualRange {
    /// # Panics
    /// Panics if `base + size` overflows.
    #[inline]
    #[must_use]
    pub const fn new(base: VirtualAddress, size: u64) -> Self {
        assert!(
            base.as_u64().checked_add(size).is_some(),
            "virtual range wraps around"
        );
        Self { base, size }
    }

    /// Like [`new`](Self::new), but `None` if the range would wrap.
    #[inline]
    #[must_use]
    pub const fn try_new(base: VirtualAddress, size: u64) -> Option<Self> {
        if base.as_u64().checked_add(size).is_some() {
            Some(Self { base, size })
        } else {
            None
        }
    }

    /// Smallest page-aligned range covering `[base, base + size)`.
    #[must_use]
    pub const fn expand_to_page_boundaries(base: u64, size: u64) -> Option<Self> {
        let Some(end) = base.checked_add(size) else {
            return None;
        };
        let Some(end) = page_round_up(end) else {
            return None;
        };
        let start = page_round_down(base);
        Some(Self {
            base: VirtualAddress::new(start),
            size: end - start,
        })
    }

    #[inline]
    #[must_use]
    pub const fn base(&self) -> VirtualAddress {
        self.base
    }

    #[inline]
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// First address past the range.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> VirtualAddress {
        VirtualAddress::new(self.base.as_u64() + self.size)
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }

    #[inline]
    #[must_use]
    pub const fn is_page_aligned(&self) -> bool {
        self.base.is_page_aligned() && self.size % PAGE_SIZE == 0
    }

    #[inline]
    #[must_use]
    pub const fn page_count(&self) -> usize {
        crate::pages_for(self.size)
    }

    #[inline]
    #[must_use]
    pub const fn contains_address(&self, addr: VirtualAddress) -> bool {
        addr.as_u64() >= self.base.as_u64() && addr.as_u64() < self.end().as_u64()
    }

    /// Whether `other` lies entirely within `self`.
    #[inline]
    #[must_use]
    pub const fn contains(&self, other: &Self) -> bool {
        other.base.as_u64() >= self.base.as_u64() && other.end().as_u64() <= self.end().as_u64()
    }

    /// Whether the two ranges share at least one byte.
    #[inline]
    #[must_use]
    pub const fn intersects(&self, other: &Self) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.base.as_u64() < other.end().as_u64()
            && other.base.as_u64() < self.end().as_u64()
    }

    /// The overlap of both ranges, `None` if they do not intersect.
    #[must_use]
    pub const fn intersect(&self, other: &Self) -> Option<Self> {
        if !self.intersects(other) {
            return None;
        }
        let start = if self.base.as_u64() > other.base.as_u64() {
            self.base.as_u64()
        } else {
            other.base.as_u64()
        };
        let end = if self.end().as_u64() < other.end().as_u64() {
            self.end().as_u64()
        } else {
            other.end().as_u64()
        };
        Some(Self {
            base: VirtualAddress::new(start),
            size: end - start,
        })
    }

    /// What is left of `self` after removing `taken`: at most two pieces,
    /// in ascending order.
    pub fn carve(self, taken: Self) -> impl Iterator<Item = Self> {
        let (before, after) = match self.intersect(&taken) {
            None => (Some(self), None),
            Some(hole) => {
                let before = (hole.base.as_u64() > self.base.as_u64()).then(|| Self {
                    base: self.base,
                    size: hole.base.offset_from(self.base),
                });
                let after = (hole.end().as_u64() < self.end().as_u64()).then(|| Self {
                    base: hole.end(),
                    size: self.end().offset_from(hole.end()),
                });
                (before, after)
            }
        };
        [before, after].into_iter().flatten()
    }
}

impl fmt::Debug for VirtualRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VR({}..{})", self.base, self.end())
    }
}

impl fmt::Display for VirtualRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.base, self.end())
    }
}
