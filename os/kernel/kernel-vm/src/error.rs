use kernel_memory_addresses::{VirtualAddress, VirtualRange};

/// Failures surfaced to the syscall layer.
///
/// Capacity and argument errors are reported before anything is mutated.
/// Broken internal invariants are not errors; they panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VmError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("invalid range {base} + {size:#x}")]
    InvalidRange { base: VirtualAddress, size: u64 },
    #[error("offset {offset:#x} + size {size:#x} exceeds object size {object_size:#x}")]
    OffsetOutOfBounds {
        offset: u64,
        size: u64,
        object_size: u64,
    },
    #[error("range {0} overlaps an existing region")]
    RangeOccupied(VirtualRange),
    #[error("no region at {0}")]
    NoSuchRegion(VirtualAddress),
    #[error("access violation at {0}")]
    AccessViolation(VirtualAddress),
    #[error("access to purged volatile page at {0}")]
    VolatileAccess(VirtualAddress),
    #[error("region is not backed by anonymous memory")]
    NotAnonymous,
}

impl VmError {
    pub(crate) const fn invalid_range(range: &VirtualRange) -> Self {
        Self::InvalidRange {
            base: range.base(),
            size: range.size(),
        }
    }
}
