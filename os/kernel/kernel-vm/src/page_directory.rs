//! Software paging structure of one address space.
//!
//! Leaf entries are grouped into tables of [`PAGE_TABLE_ENTRIES`]. A table
//! is created on the first mapping that lands in it and released with its
//! last mapping; each table occupies one frame taken from the uncommitted
//! part of the pool, so mapping a page may fail with
//! [`VmError::OutOfMemory`].
//!
//! ```text
//!   virtual address:  [ table key (..=21) | index (20..=12) | offset (11..=0) ]
//! ```

use crate::lock_order::PageDirectoryLock;
use crate::{AddressSpace, SharedRangeAllocator, VmError};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::collections::btree_map::Entry;
use alloc::sync::{Arc, Weak};
use bitfield_struct::bitfield;
use core::fmt;
use kernel_alloc::{PhysicalPage, ShouldZeroFill, UserPhysicalPages};
use kernel_info::memory::PAGE_TABLE_ENTRIES;
use kernel_memory_addresses::{PAGE_SHIFT, PhysicalAddress, VirtualAddress};
use kernel_sync::{LockAfter, LockToken, OrderedLock, SpinLock};
use log::{trace, warn};

/// One leaf entry, laid out like an x86-64 PTE.
///
/// | Bits   | Field            |
/// |--------|------------------|
/// | 0      | `present`        |
/// | 1      | `writable`       |
/// | 2      | `user_access`    |
/// | 3      | `write_through`  |
/// | 4      | `cache_disabled` |
/// | 5      | `accessed`       |
/// | 6      | `dirty`          |
/// | 7..=11 | OS use           |
/// | 12..=51| frame number     |
/// | 63     | `no_execute`     |
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageTableEntry {
    pub present: bool,
    pub writable: bool,
    pub user_access: bool,
    pub write_through: bool,
    pub cache_disabled: bool,
    pub accessed: bool,
    pub dirty: bool,
    #[bits(5)]
    __os_available: u8,
    #[bits(40)]
    frame_number: u64,
    #[bits(11)]
    __reserved: u16,
    pub no_execute: bool,
}

impl PageTableEntry {
    /// A present user mapping of `frame`.
    #[inline]
    #[must_use]
    pub const fn user(
        frame: PhysicalAddress,
        writable: bool,
        executable: bool,
        cacheable: bool,
    ) -> Self {
        Self::new()
            .with_present(true)
            .with_user_access(true)
            .with_writable(writable)
            .with_no_execute(!executable)
            .with_cache_disabled(!cacheable)
            .with_frame_number(frame.frame_number())
    }

    #[inline]
    #[must_use]
    pub const fn physical_address(&self) -> PhysicalAddress {
        PhysicalAddress::from_frame_number(self.frame_number())
    }
}

struct PageTable {
    /// Frame the table itself lives in.
    _frame: PhysicalPage,
    entries: Box<[PageTableEntry]>,
    present: usize,
}

const fn table_key(vaddr: VirtualAddress) -> u64 {
    vaddr.as_u64() >> (PAGE_SHIFT + PAGE_TABLE_ENTRIES.trailing_zeros())
}

#[allow(clippy::cast_possible_truncation)]
const fn table_index(vaddr: VirtualAddress) -> usize {
    (vaddr.as_u64() >> PAGE_SHIFT) as usize & (PAGE_TABLE_ENTRIES - 1)
}

pub struct PageDirectory {
    root: PhysicalPage,
    pool: Arc<UserPhysicalPages>,
    range_allocator: SharedRangeAllocator,
    tables: OrderedLock<PageDirectoryLock, BTreeMap<u64, PageTable>>,
    space: SpinLock<Weak<AddressSpace>>,
}

impl PageDirectory {
    /// Create an empty userspace directory.
    ///
    /// With a `parent` allocator (fork), the new directory starts from a
    /// snapshot of the parent's free ranges.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if no frame is left for the root table.
    pub fn create_for_userspace(
        pool: &Arc<UserPhysicalPages>,
        parent: Option<&SharedRangeAllocator>,
    ) -> Result<Arc<Self>, VmError> {
        let Some(root) = pool.allocate_user_physical_page(ShouldZeroFill::Yes) else {
            warn!("VM: no frame for a page directory root");
            return Err(VmError::OutOfMemory);
        };
        Ok(Arc::new(Self {
            root,
            pool: Arc::clone(pool),
            range_allocator: parent
                .map_or_else(SharedRangeAllocator::default, SharedRangeAllocator::fork),
            tables: OrderedLock::new(BTreeMap::new()),
            space: SpinLock::new(Weak::new()),
        }))
    }

    #[inline]
    #[must_use]
    pub fn root_table(&self) -> PhysicalAddress {
        self.root.address()
    }

    #[inline]
    #[must_use]
    pub const fn range_allocator(&self) -> &SharedRangeAllocator {
        &self.range_allocator
    }

    pub fn set_space(&self, space: &Arc<AddressSpace>) {
        *self.space.lock() = Arc::downgrade(space);
    }

    /// The address space owning this directory, while it is alive.
    #[must_use]
    pub fn space(&self) -> Option<Arc<AddressSpace>> {
        self.space.lock().upgrade()
    }

    /// Install `entry` for the page containing `vaddr`.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if a new table is needed and no frame is
    /// available.
    pub fn map_page<P>(
        &self,
        token: &LockToken<P>,
        vaddr: VirtualAddress,
        entry: PageTableEntry,
    ) -> Result<(), VmError>
    where
        PageDirectoryLock: LockAfter<P>,
    {
        let mut tables = self.tables.lock(token);
        let table = match tables.entry(table_key(vaddr)) {
            Entry::Occupied(table) => table.into_mut(),
            Entry::Vacant(slot) => {
                let Some(frame) = self.pool.allocate_user_physical_page(ShouldZeroFill::Yes) else {
                    warn!("VM: no frame for a page table covering {vaddr}");
                    return Err(VmError::OutOfMemory);
                };
                slot.insert(PageTable {
                    _frame: frame,
                    entries: alloc::vec![PageTableEntry::new(); PAGE_TABLE_ENTRIES]
                        .into_boxed_slice(),
                    present: 0,
                })
            }
        };

        let slot = &mut table.entries[table_index(vaddr)];
        if !slot.present() {
            table.present += 1;
        }
        *slot = entry.with_present(true);
        trace!("VM: map {} -> {}", vaddr.page_base(), entry.physical_address());
        Ok(())
    }

    /// Remove the translation of the page containing `vaddr`. Returns
    /// whether it was mapped.
    pub fn unmap_page<P>(&self, token: &LockToken<P>, vaddr: VirtualAddress) -> bool
    where
        PageDirectoryLock: LockAfter<P>,
    {
        let mut tables = self.tables.lock(token);
        let key = table_key(vaddr);
        let Some(table) = tables.get_mut(&key) else {
            return false;
        };
        let slot = &mut table.entries[table_index(vaddr)];
        if !slot.present() {
            return false;
        }
        *slot = PageTableEntry::new();
        table.present -= 1;
        if table.present == 0 {
            tables.remove(&key);
        }
        true
    }

    /// The entry for the page containing `vaddr`, if present.
    #[must_use]
    pub fn entry(&self, vaddr: VirtualAddress) -> Option<PageTableEntry> {
        let root = LockToken::root();
        let tables = self.tables.lock(&root);
        tables
            .get(&table_key(vaddr))
            .map(|table| table.entries[table_index(vaddr)])
            .filter(PageTableEntry::present)
    }

    /// Physical address `vaddr` translates to.
    #[must_use]
    pub fn translate(&self, vaddr: VirtualAddress) -> Option<PhysicalAddress> {
        self.entry(vaddr)
            .map(|entry| entry.physical_address() + vaddr.page_offset())
    }

    #[must_use]
    pub fn mapped_pages(&self) -> usize {
        self.tables
            .lock(&LockToken::root())
            .values()
            .map(|table| table.present)
            .sum()
    }

    #[must_use]
    pub fn table_count(&self) -> usize {
        self.tables.lock(&LockToken::root()).len()
    }
}

impl fmt::Debug for PageDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageDirectory")
            .field("root", &self.root.address())
            .finish_non_exhaustive()
    }
}
