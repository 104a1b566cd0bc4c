//! # Memory Layout

/// Size of a page in bytes.
pub const PAGE_SIZE: u64 = 4096;

/// `log2(PAGE_SIZE)`.
pub const PAGE_SHIFT: u32 = 12;

/// Leaf entries per page table.
pub const PAGE_TABLE_ENTRIES: usize = 512;

/// Lowest address the userspace range allocator hands out.
///
/// Everything below stays unmapped so that null-ish pointers fault.
pub const USERSPACE_BASE: u64 = 0x0000_0000_0080_0000;

/// First address above the userspace range allocator window.
pub const USERSPACE_CEILING: u64 = 0x0000_7fff_ffff_0000;

/// End of userspace VA range after which Kernel space begins.
pub const LAST_USERSPACE_ADDRESS: u64 = 0x0000_7fff_ffff_ffff;

/// Alignment used when a mapping request does not ask for one.
pub const DEFAULT_MMAP_ALIGNMENT: u64 = PAGE_SIZE;

const _: () = {
    assert!(PAGE_SIZE == 1 << PAGE_SHIFT);
    assert!(PAGE_SIZE.is_power_of_two());
    assert!(USERSPACE_BASE.is_multiple_of(PAGE_SIZE));
    assert!(USERSPACE_CEILING.is_multiple_of(PAGE_SIZE));
    assert!(USERSPACE_BASE < USERSPACE_CEILING);
    assert!(USERSPACE_CEILING <= LAST_USERSPACE_ADDRESS);
    assert!(DEFAULT_MMAP_ALIGNMENT.is_multiple_of(PAGE_SIZE));
};
