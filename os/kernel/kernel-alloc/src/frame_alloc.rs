//! Physical frame allocation.
//!
//! The pool in [`crate::UserPhysicalPages`] does the accounting; a
//! [`FrameAlloc`] only knows which frames are free.

use alloc::vec;
use alloc::vec::Vec;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress};

/// Failures when handing a frame back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FrameAllocError {
    #[error("frame {0} is outside the managed region")]
    OutOfRange(PhysicalAddress),
    #[error("frame {0} is not page aligned")]
    Unaligned(PhysicalAddress),
    #[error("frame {0} was not allocated")]
    NotAllocated(PhysicalAddress),
}

/// Source of 4 KiB physical frames.
pub trait FrameAlloc {
    /// Allocate one 4 KiB frame. Must return page-aligned frames.
    fn alloc_4k(&mut self) -> Option<PhysicalAddress>;

    /// Return a frame obtained from [`alloc_4k`](Self::alloc_4k).
    ///
    /// # Errors
    /// Rejects frames this allocator never handed out.
    fn free_4k(&mut self, frame: PhysicalAddress) -> Result<(), FrameAllocError>;

    /// Total number of frames managed.
    fn capacity(&self) -> usize;

    /// Clear the contents of `frame`.
    ///
    /// Allocators that cannot reach frame memory (no direct map yet) leave
    /// this as a no-op.
    fn zero_4k(&mut self, frame: PhysicalAddress) {
        let _ = frame;
    }
}

/// Next-fit bitmap allocator over a contiguous physical region.
pub struct BitmapFrameAlloc {
    base: PhysicalAddress,
    frames: usize,
    /// One bit per frame, set while allocated.
    bitmap: Vec<u64>,
    /// Where the next search starts.
    cursor: usize,
}

impl BitmapFrameAlloc {
    /// Manage `frames` frames starting at the page-aligned `base`.
    ///
    /// # Panics
    /// Panics if `base` is not page aligned.
    #[must_use]
    pub fn new(base: PhysicalAddress, frames: usize) -> Self {
        assert!(base.is_page_aligned(), "frame region base must be page aligned");
        Self {
            base,
            frames,
            bitmap: vec![0; frames.div_ceil(64)],
            cursor: 0,
        }
    }

    /// Number of frames currently allocated.
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.bitmap.iter().map(|w| w.count_ones() as usize).sum()
    }

    #[inline]
    fn is_set(&self, index: usize) -> bool {
        self.bitmap[index / 64] & (1 << (index % 64)) != 0
    }

    #[inline]
    fn set(&mut self, index: usize, value: bool) {
        if value {
            self.bitmap[index / 64] |= 1 << (index % 64);
        } else {
            self.bitmap[index / 64] &= !(1 << (index % 64));
        }
    }

    fn index_of(&self, frame: PhysicalAddress) -> Result<usize, FrameAllocError> {
        if !frame.is_page_aligned() {
            return Err(FrameAllocError::Unaligned(frame));
        }
        let offset = frame
            .as_u64()
            .checked_sub(self.base.as_u64())
            .ok_or(FrameAllocError::OutOfRange(frame))?;
        let index =
            usize::try_from(offset / PAGE_SIZE).map_err(|_| FrameAllocError::OutOfRange(frame))?;
        if index >= self.frames {
            return Err(FrameAllocError::OutOfRange(frame));
        }
        Ok(index)
    }
}

impl FrameAlloc for BitmapFrameAlloc {
    fn alloc_4k(&mut self) -> Option<PhysicalAddress> {
        let index = (0..self.frames)
            .map(|i| (self.cursor + i) % self.frames)
            .find(|&i| !self.is_set(i))?;
        self.set(index, true);
        self.cursor = (index + 1) % self.frames;
        Some(self.base + index as u64 * PAGE_SIZE)
    }

    fn free_4k(&mut self, frame: PhysicalAddress) -> Result<(), FrameAllocError> {
        let index = self.index_of(frame)?;
        if !self.is_set(index) {
            return Err(FrameAllocError::NotAllocated(frame));
        }
        self.set(index, false);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: PhysicalAddress = PhysicalAddress::new(0x10_0000);

    #[test]
    fn hands_out_each_frame_once() {
        let mut frames = BitmapFrameAlloc::new(BASE, 70);
        let mut seen = Vec::new();
        while let Some(pa) = frames.alloc_4k() {
            assert!(pa.is_page_aligned());
            assert!(!seen.contains(&pa));
            seen.push(pa);
        }
        assert_eq!(seen.len(), 70);
        assert_eq!(frames.allocated(), 70);
    }

    #[test]
    fn freed_frames_are_reused() {
        let mut frames = BitmapFrameAlloc::new(BASE, 2);
        let a = frames.alloc_4k().unwrap();
        let _b = frames.alloc_4k().unwrap();
        assert!(frames.alloc_4k().is_none());
        frames.free_4k(a).unwrap();
        assert_eq!(frames.alloc_4k(), Some(a));
    }

    #[test]
    fn bogus_frees_are_rejected() {
        let mut frames = BitmapFrameAlloc::new(BASE, 4);
        assert_eq!(
            frames.free_4k(BASE),
            Err(FrameAllocError::NotAllocated(BASE))
        );
        let below = PhysicalAddress::new(0x1000);
        assert_eq!(frames.free_4k(below), Err(FrameAllocError::OutOfRange(below)));
        let past = BASE + 4 * PAGE_SIZE;
        assert_eq!(frames.free_4k(past), Err(FrameAllocError::OutOfRange(past)));
        let odd = BASE + 1;
        assert_eq!(frames.free_4k(odd), Err(FrameAllocError::Unaligned(odd)));
    }
}
