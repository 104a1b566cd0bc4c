//! File-backed memory.

use crate::lock_order::VmObjectLock;
use crate::{PageState, VmObject};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use kernel_alloc::PhysicalPage;
use kernel_memory_addresses::{pages_for, pages_to_bytes};
use kernel_sync::{LockToken, OrderedLock};

#[derive(Debug)]
struct InodePage {
    page: PhysicalPage,
    dirty: bool,
}

/// Pages of a file, shared by every mapping of it.
///
/// Pages are populated by whoever reads the file in; this type only tracks
/// residency and dirtiness for the accounting queries.
pub struct InodeVmObject {
    size: u64,
    pages: OrderedLock<VmObjectLock, Vec<Option<InodePage>>>,
}

impl InodeVmObject {
    #[must_use]
    pub fn new(size: u64) -> Arc<Self> {
        let page_count = pages_for(size);
        Arc::new(Self {
            size: pages_to_bytes(page_count),
            pages: OrderedLock::new((0..page_count).map(|_| None).collect()),
        })
    }

    /// Install `page` as the contents of page `index`.
    ///
    /// # Panics
    /// Panics if `index` is outside the object.
    pub fn set_page(&self, index: usize, page: PhysicalPage, dirty: bool) {
        let root = LockToken::root();
        let mut pages = self.pages.lock(&root);
        pages[index] = Some(InodePage { page, dirty });
    }

    /// Mark page `index` dirty; returns `false` if it is not resident.
    pub fn mark_dirty(&self, index: usize) -> bool {
        self.set_dirty(index, true)
    }

    /// Mark page `index` clean (written back); returns `false` if it is not
    /// resident.
    pub fn mark_clean(&self, index: usize) -> bool {
        self.set_dirty(index, false)
    }

    fn set_dirty(&self, index: usize, dirty: bool) -> bool {
        let root = LockToken::root();
        let mut pages = self.pages.lock(&root);
        match pages.get_mut(index) {
            Some(Some(slot)) => {
                slot.dirty = dirty;
                true
            }
            _ => false,
        }
    }

    /// Bytes of resident pages that differ from the file.
    #[must_use]
    pub fn amount_dirty(&self) -> u64 {
        self.count_bytes(|dirty| dirty)
    }

    fn count_bytes(&self, keep: impl Fn(bool) -> bool) -> u64 {
        let root = LockToken::root();
        let pages = self.pages.lock(&root);
        let count = pages.iter().flatten().filter(|p| keep(p.dirty)).count();
        pages_to_bytes(count)
    }
}

impl fmt::Debug for InodeVmObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InodeVmObject")
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

impl VmObject for InodeVmObject {
    fn size(&self) -> u64 {
        self.size
    }

    fn is_inode(&self) -> bool {
        true
    }

    fn page_states(&self, first: usize, count: usize) -> Vec<PageState> {
        let root = LockToken::root();
        let pages = self.pages.lock(&root);
        pages
            .iter()
            .skip(first)
            .take(count)
            .map(|slot| match slot {
                Some(InodePage { page, dirty }) => PageState::Resident {
                    address: page.address(),
                    ref_count: page.ref_count(),
                    dirty: *dirty,
                },
                None => PageState::SharedZero,
            })
            .collect()
    }

    fn amount_clean(&self) -> u64 {
        self.count_bytes(|dirty| !dirty)
    }
}
