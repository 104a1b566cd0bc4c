//! # Memory objects
//!
//! A memory object is the backing store a [`Region`](crate::Region) maps a
//! window of. Two kinds exist:
//!
//! | Kind                        | Backing                          | Purgeable |
//! |-----------------------------|----------------------------------|-----------|
//! | [`AnonymousVmObject`]       | zero-fill pages, commit-accounted | yes       |
//! | [`InodeVmObject`]           | file pages, clean or dirty       | no        |
//!
//! Regions see the narrow [`VmObject`] trait, except that faults and `fork`
//! on anonymous memory go to the object itself. Purgeable-range controllers
//! talk to the anonymous object directly.
//!
//! Forked children share file objects. Anonymous objects are cloned with
//! [`AnonymousVmObject::try_clone_anonymous`].

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use kernel_memory_addresses::{PhysicalAddress, pages_for};

mod anonymous;
mod inode;

pub(crate) use anonymous::{CloneUndo, HeldView};
pub use anonymous::{AllocationStrategy, AnonymousVmObject};
pub(crate) use anonymous::AnonymousPages;
pub use inode::InodeVmObject;

/// What backs one page of an object, at the time it was sampled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    /// Reads as zeros; needs a new page (and a commit) on first touch.
    SharedZero,
    /// Reads as zeros; a committed credit is already set aside for it.
    LazyCommitted,
    /// Backed by a physical page.
    Resident {
        address: PhysicalAddress,
        /// Handles to the page across all objects sharing it.
        ref_count: usize,
        dirty: bool,
    },
}

impl PageState {
    #[inline]
    #[must_use]
    pub const fn is_resident(&self) -> bool {
        matches!(self, Self::Resident { .. })
    }

    #[inline]
    #[must_use]
    pub const fn address(&self) -> Option<PhysicalAddress> {
        match self {
            Self::Resident { address, .. } => Some(*address),
            _ => None,
        }
    }
}

/// Interface regions and address spaces use to inspect their backing.
///
/// The queries take the object's own lock, so they must not be called with
/// it held.
pub trait VmObject: Send + Sync + fmt::Debug {
    /// Size in bytes, a whole number of pages.
    fn size(&self) -> u64;

    fn page_count(&self) -> usize {
        pages_for(self.size())
    }

    fn is_anonymous(&self) -> bool {
        false
    }

    fn is_inode(&self) -> bool {
        false
    }

    /// Snapshot of pages `[first, first + count)`, truncated at the end of
    /// the object.
    fn page_states(&self, first: usize, count: usize) -> Vec<PageState>;

    /// Bytes of resident pages that match their backing store.
    fn amount_clean(&self) -> u64 {
        0
    }

    /// Whether any attached mapping has volatile pages.
    fn is_any_volatile(&self) -> bool {
        false
    }

    fn as_anonymous(self: Arc<Self>) -> Option<Arc<AnonymousVmObject>> {
        None
    }
}

/// Identity of an object, for de-duplication.
pub(crate) fn object_id(object: &Arc<dyn VmObject>) -> usize {
    Arc::as_ptr(object).cast::<()>().addr()
}
