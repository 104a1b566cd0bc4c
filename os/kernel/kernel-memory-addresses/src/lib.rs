//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw memory addresses and virtual ranges used by
//! the page pool and the address-space manager.
//!
//! | Type                  | Description                                                    |
//! |-----------------------|----------------------------------------------------------------|
//! | [`PhysicalAddress`]   | A physical address, usually a frame base.                      |
//! | [`VirtualAddress`]    | A virtual (page-table translated) address.                     |
//! | [`VirtualRange`]      | `[base, base + size)` in virtual space, overflow-checked.      |
//!
//! ## Page rounding
//!
//! All rounding helpers work in units of [`PAGE_SIZE`] and come in checked
//! form where rounding up can overflow:
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! assert_eq!(page_round_down(0x1234), 0x1000);
//! assert_eq!(page_round_up(0x1234), Some(0x2000));
//! assert_eq!(page_round_up(u64::MAX), None);
//! assert!(is_page_aligned(0x3000));
//! ```
//!
//! ## Design Notes
//!
//! - The types are `#[repr(transparent)]` over `u64` and implement `Copy`,
//!   `Eq`, `Ord` and `Hash`, so they work as map keys.
//! - Sizes are byte counts (`u64`); page indices are `usize`.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

mod physical_address;
mod virtual_address;
mod virtual_range;

pub use kernel_info::memory::{PAGE_SHIFT, PAGE_SIZE};
pub use physical_address::PhysicalAddress;
pub use virtual_address::VirtualAddress;
pub use virtual_range::VirtualRange;

/// Round `value` down to the page boundary at or below it.
#[inline]
#[must_use]
pub const fn page_round_down(value: u64) -> u64 {
    value & !(PAGE_SIZE - 1)
}

/// Round `value` up to the next page boundary, or `None` on overflow.
#[inline]
#[must_use]
pub const fn page_round_up(value: u64) -> Option<u64> {
    match value.checked_add(PAGE_SIZE - 1) {
        Some(v) => Some(page_round_down(v)),
        None => None,
    }
}

#[inline]
#[must_use]
pub const fn is_page_aligned(value: u64) -> bool {
    value & (PAGE_SIZE - 1) == 0
}

/// Number of whole pages needed to cover `bytes`.
#[inline]
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn pages_for(bytes: u64) -> usize {
    bytes.div_ceil(PAGE_SIZE) as usize
}

/// Byte size of `pages` pages.
#[inline]
#[must_use]
pub const fn pages_to_bytes(pages: usize) -> u64 {
    (pages as u64) << PAGE_SHIFT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding() {
        assert_eq!(page_round_down(0), 0);
        assert_eq!(page_round_down(PAGE_SIZE - 1), 0);
        assert_eq!(page_round_down(PAGE_SIZE), PAGE_SIZE);
        assert_eq!(page_round_up(0), Some(0));
        assert_eq!(page_round_up(1), Some(PAGE_SIZE));
        assert_eq!(page_round_up(PAGE_SIZE), Some(PAGE_SIZE));
        assert_eq!(page_round_up(u64::MAX - 1), None);
    }

    #[test]
    fn page_counts() {
        assert_eq!(pages_for(0), 0);
        assert_eq!(pages_for(1), 1);
        assert_eq!(pages_for(3 * PAGE_SIZE), 3);
        assert_eq!(pages_to_bytes(3), 3 * PAGE_SIZE);
    }
}
