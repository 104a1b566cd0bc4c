use crate::UserPhysicalPages;
use alloc::sync::{Arc, Weak};
use core::fmt;
use kernel_memory_addresses::PhysicalAddress;

/// A reference-counted handle to one physical frame.
///
/// Clones share the frame; the handle count is what copy-on-write uses to
/// decide whether a page is still shared. When the last handle goes away the
/// frame is returned to the pool it came from.
#[derive(Clone)]
pub struct PhysicalPage(Arc<Frame>);

struct Frame {
    address: PhysicalAddress,
    pool: Weak<UserPhysicalPages>,
}

impl PhysicalPage {
    pub(crate) fn new(address: PhysicalAddress, pool: Weak<UserPhysicalPages>) -> Self {
        Self(Arc::new(Frame { address, pool }))
    }

    #[inline]
    #[must_use]
    pub fn address(&self) -> PhysicalAddress {
        self.0.address
    }

    /// Number of live handles to this frame.
    #[inline]
    #[must_use]
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    #[inline]
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.release(self.address);
        }
    }
}

impl fmt::Debug for PhysicalPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysicalPage")
            .field("address", &self.0.address)
            .field("ref_count", &self.ref_count())
            .finish()
    }
}
