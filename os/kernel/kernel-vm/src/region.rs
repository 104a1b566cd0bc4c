//! # Regions
//!
//! A region maps a page-aligned window of a memory object into an address
//! space:
//!
//! ```text
//!   address space   base                       base + size
//!                    │◀──────── range ───────────▶│
//!   object     ──────┼────────────────────────────┼──────
//!                    offset_in_vmobject
//! ```
//!
//! Per-page copy-on-write bits decide whether a resident page is mapped
//! writable. Regions over anonymous memory own a
//! [`PurgeableRangeController`], so each mapping tracks its own volatile
//! ranges.

use crate::arena::ArenaId;
use crate::lock_order::{PageDirectoryLock, VmObjectLock};
use crate::purgeable::{RemoveVolatileOutcome, ViewMapping};
use crate::vmobject::CloneUndo;
use crate::volatile::VolatilePageRange;
use crate::{
    AnonymousVmObject, Bitmap, PageDirectory, PageState, PageTableEntry, PurgeableRangeController,
    SharedRangeAllocator, VmError, VmObject,
};
use alloc::string::String;
use alloc::sync::Arc;
use bitfield_struct::bitfield;
use core::{fmt, mem};
use kernel_alloc::CommitReservation;
use kernel_memory_addresses::{
    VirtualAddress, VirtualRange, is_page_aligned, page_round_down, page_round_up, pages_for,
    pages_to_bytes,
};
use kernel_sync::{LockAfter, LockToken};
use log::{debug, trace, warn};

pub type RegionId = ArenaId;

/// Access and mapping flags of a region.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct RegionFlags {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
    pub cacheable: bool,
    /// Shared with forked children instead of copied on write.
    pub shared: bool,
    pub stack: bool,
    /// May issue system calls from this region.
    pub syscall: bool,
    /// Created by `mmap`.
    pub mmap: bool,
}

impl RegionFlags {
    /// Cacheable read/write data.
    #[inline]
    #[must_use]
    pub const fn read_write() -> Self {
        Self::new()
            .with_read(true)
            .with_write(true)
            .with_cacheable(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeallocateRange {
    No,
    Yes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAccess {
    Read,
    Write,
    Execute,
}

/// Result of [`Region::set_volatile`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SetVolatileOutcome {
    /// The volatile range set changed.
    pub changed: bool,
    /// Some of the pages made non-volatile had been purged.
    pub was_purged: bool,
}

pub struct Region {
    id: RegionId,
    range: VirtualRange,
    offset_in_vmobject: u64,
    vmobject: Arc<dyn VmObject>,
    name: Option<String>,
    flags: RegionFlags,
    /// Empty while no page needs copying.
    cow_map: Bitmap,
    purgeable: Option<PurgeableRangeController>,
    page_directory: Option<Arc<PageDirectory>>,
    /// Allocator `range` is reserved in, while this region owns it.
    range_owner: Option<SharedRangeAllocator>,
}

/// What [`Region::clone_for_fork`] replaced, to put back if the fork fails.
pub(crate) struct ForkUndo {
    cow_map: Bitmap,
    object: CloneUndo,
}

impl Region {
    /// A new, unmapped region. The caller has checked that the window fits
    /// the object.
    #[must_use]
    pub fn new(
        range: VirtualRange,
        vmobject: Arc<dyn VmObject>,
        offset_in_vmobject: u64,
        name: Option<String>,
        flags: RegionFlags,
    ) -> Self {
        debug_assert!(range.is_page_aligned());
        debug_assert!(is_page_aligned(offset_in_vmobject));
        let purgeable = vmobject
            .is_anonymous()
            .then(|| PurgeableRangeController::new(&vmobject));
        Self {
            id: ArenaId::dangling(),
            range,
            offset_in_vmobject,
            vmobject,
            name,
            flags,
            cow_map: Bitmap::default(),
            purgeable,
            page_directory: None,
            range_owner: None,
        }
    }

    pub(crate) const fn assign_id(&mut self, id: RegionId) {
        self.id = id;
    }

    #[inline]
    #[must_use]
    pub const fn id(&self) -> RegionId {
        self.id
    }

    #[inline]
    #[must_use]
    pub const fn range(&self) -> VirtualRange {
        self.range
    }

    #[inline]
    #[must_use]
    pub const fn base(&self) -> VirtualAddress {
        self.range.base()
    }

    #[inline]
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.range.size()
    }

    #[inline]
    #[must_use]
    pub const fn offset_in_vmobject(&self) -> u64 {
        self.offset_in_vmobject
    }

    #[inline]
    #[must_use]
    pub const fn vmobject(&self) -> &Arc<dyn VmObject> {
        &self.vmobject
    }

    /// The backing object when it is anonymous memory.
    #[must_use]
    pub fn anonymous(&self) -> Option<&Arc<AnonymousVmObject>> {
        self.purgeable.as_ref()?.vmobject()
    }

    #[inline]
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn set_name(&mut self, name: Option<String>) {
        self.name = name;
    }

    #[inline]
    #[must_use]
    pub const fn flags(&self) -> RegionFlags {
        self.flags
    }

    #[inline]
    #[must_use]
    pub const fn is_shared(&self) -> bool {
        self.flags.shared()
    }

    #[inline]
    #[must_use]
    pub const fn purgeable(&self) -> Option<&PurgeableRangeController> {
        self.purgeable.as_ref()
    }

    #[inline]
    #[must_use]
    pub const fn is_mapped(&self) -> bool {
        self.page_directory.is_some()
    }

    /// Whether dropping the region hands its range back to the allocator.
    #[inline]
    #[must_use]
    pub const fn owns_range(&self) -> bool {
        self.range_owner.is_some()
    }

    #[inline]
    #[must_use]
    pub const fn page_count(&self) -> usize {
        self.range.page_count()
    }

    /// Object page backing the region's first page.
    #[inline]
    #[must_use]
    pub const fn first_page_index(&self) -> usize {
        pages_for(self.offset_in_vmobject)
    }

    #[must_use]
    pub fn page_index_from_address(&self, vaddr: VirtualAddress) -> usize {
        pages_for(page_round_down(vaddr.offset_from(self.base())))
    }

    #[must_use]
    pub fn vaddr_from_page_index(&self, index: usize) -> VirtualAddress {
        self.base() + pages_to_bytes(index)
    }

    #[inline]
    #[must_use]
    pub fn should_cow(&self, index: usize) -> bool {
        self.cow_map.get(index)
    }

    pub fn set_should_cow(&mut self, index: usize, cow: bool) {
        if self.cow_map.is_empty() {
            if !cow {
                return;
            }
            self.cow_map = Bitmap::new(self.page_count(), false);
        }
        self.cow_map.set(index, cow);
    }

    fn page_states(&self) -> alloc::vec::Vec<PageState> {
        self.vmobject
            .page_states(self.first_page_index(), self.page_count())
    }

    fn entry_for(&self, index: usize, state: PageState) -> Option<PageTableEntry> {
        let address = state.address()?;
        if !self.flags.read() {
            return None;
        }
        Some(PageTableEntry::user(
            address,
            self.flags.write() && !self.should_cow(index),
            self.flags.execute(),
            self.flags.cacheable(),
        ))
    }

    fn map_individual_page<P>(
        &self,
        token: &LockToken<P>,
        page_directory: &PageDirectory,
        index: usize,
        state: PageState,
    ) -> Result<(), VmError>
    where
        PageDirectoryLock: LockAfter<P>,
    {
        let vaddr = self.vaddr_from_page_index(index);
        match self.entry_for(index, state) {
            Some(entry) => page_directory.map_page(token, vaddr, entry),
            None => {
                page_directory.unmap_page(token, vaddr);
                Ok(())
            }
        }
    }

    /// Program `page_directory` with every resident page of the region.
    ///
    /// From then on the region owns its range in the directory's allocator.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if a page table cannot be allocated; pages
    /// mapped so far are unmapped again.
    pub fn map<P>(
        &mut self,
        token: &LockToken<P>,
        page_directory: &Arc<PageDirectory>,
    ) -> Result<(), VmError>
    where
        PageDirectoryLock: LockAfter<P>,
    {
        for (index, state) in self.page_states().into_iter().enumerate() {
            if let Err(error) = self.map_individual_page(token, page_directory, index, state) {
                for undo in 0..index {
                    page_directory.unmap_page(token, self.vaddr_from_page_index(undo));
                }
                return Err(error);
            }
        }

        self.page_directory = Some(Arc::clone(page_directory));
        self.range_owner
            .get_or_insert_with(|| page_directory.range_allocator().clone());
        if let Some(purgeable) = &self.purgeable {
            purgeable.set_mapping(Some(ViewMapping {
                page_directory: Arc::downgrade(page_directory),
                base: self.base(),
                first_page: self.first_page_index(),
                page_count: self.page_count(),
            }));
        }
        trace!("VM: mapped {:?} {}", self.name(), self.range);
        Ok(())
    }

    /// Re-program every page, e.g. after the COW bits changed.
    ///
    /// # Errors
    /// See [`map`](Self::map).
    pub fn remap<P>(&mut self, token: &LockToken<P>) -> Result<(), VmError>
    where
        PageDirectoryLock: LockAfter<P>,
    {
        match self.page_directory.clone() {
            Some(page_directory) => self.map(token, &page_directory),
            None => Ok(()),
        }
    }

    /// Re-program the page at `index`.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if a page table cannot be allocated.
    pub fn remap_page<P>(&self, token: &LockToken<P>, index: usize) -> Result<(), VmError>
    where
        PageDirectoryLock: LockAfter<P>,
    {
        let Some(page_directory) = &self.page_directory else {
            return Ok(());
        };
        let state = self
            .vmobject
            .page_states(self.first_page_index() + index, 1)
            .first()
            .copied()
            .unwrap_or(PageState::SharedZero);
        self.map_individual_page(token, page_directory, index, state)
    }

    /// Remove the region's translations, if any, and give up ownership of
    /// its range: handed back to the allocator with [`DeallocateRange::Yes`],
    /// left to the caller with [`DeallocateRange::No`].
    pub fn unmap<P>(&mut self, token: &LockToken<P>, deallocate: DeallocateRange)
    where
        PageDirectoryLock: LockAfter<P>,
    {
        if let Some(page_directory) = self.page_directory.take() {
            for index in 0..self.page_count() {
                page_directory.unmap_page(token, self.vaddr_from_page_index(index));
            }
            if let Some(purgeable) = &self.purgeable {
                purgeable.set_mapping(None);
            }
            debug!("VM: unmapped {:?} {}", self.name(), self.range);
        }
        if let Some(allocator) = self.range_owner.take()
            && deallocate == DeallocateRange::Yes
        {
            allocator.deallocate(self.range);
        }
    }

    /// Resolve a page fault at `vaddr`.
    ///
    /// # Errors
    /// - [`VmError::AccessViolation`] if the access is not permitted or the
    ///   page cannot be paged in.
    /// - [`VmError::VolatileAccess`] if the page was purged while volatile.
    /// - [`VmError::OutOfMemory`] if no page can be allocated.
    pub fn handle_fault<P>(
        &mut self,
        token: &LockToken<P>,
        vaddr: VirtualAddress,
        access: FaultAccess,
    ) -> Result<(), VmError>
    where
        VmObjectLock: LockAfter<P>,
        PageDirectoryLock: LockAfter<P>,
    {
        let allowed = match access {
            FaultAccess::Read => self.flags.read(),
            FaultAccess::Write => self.flags.write(),
            FaultAccess::Execute => self.flags.execute(),
        };
        if !allowed || !self.range.contains_address(vaddr) {
            return Err(VmError::AccessViolation(vaddr));
        }

        let index = self.page_index_from_address(vaddr);
        let object_index = self.first_page_index() + index;
        if self.purgeable.as_ref().is_some_and(|p| p.is_purged(object_index)) {
            return Err(VmError::VolatileAccess(vaddr));
        }

        let anonymous = self.anonymous().cloned();
        if access == FaultAccess::Write && self.should_cow(index) {
            let anonymous = anonymous.ok_or(VmError::AccessViolation(vaddr))?;
            trace!("VM: COW fault at {vaddr}");
            anonymous.handle_cow_fault(token, object_index)?;
            self.set_should_cow(index, false);
        } else if !self
            .vmobject
            .page_states(object_index, 1)
            .first()
            .is_some_and(PageState::is_resident)
        {
            let anonymous = anonymous.ok_or(VmError::AccessViolation(vaddr))?;
            trace!("VM: zero fault at {vaddr}");
            anonymous.fault_in_page(token, object_index)?;
        }
        self.remap_page(token, index)
    }

    /// Mark the bytes `[vaddr, vaddr + size)` volatile or non-volatile.
    ///
    /// Volatile ranges shrink to the pages fully inside the byte range;
    /// non-volatile ranges grow to every page the byte range touches.
    ///
    /// # Errors
    /// - [`VmError::NotAnonymous`] if the region is not anonymous memory.
    /// - [`VmError::InvalidRange`] if the bytes are not inside the region.
    /// - [`VmError::OutOfMemory`] if pages cannot be committed for a
    ///   non-volatile range.
    pub fn set_volatile<P>(
        &self,
        token: &LockToken<P>,
        vaddr: VirtualAddress,
        size: u64,
        volatile: bool,
    ) -> Result<SetVolatileOutcome, VmError>
    where
        VmObjectLock: LockAfter<P>,
    {
        let Some(purgeable) = &self.purgeable else {
            return Err(VmError::NotAnonymous);
        };
        let requested = VirtualRange::try_new(vaddr, size)
            .ok_or(VmError::InvalidRange { base: vaddr, size })?;
        if !self.range.contains(&requested) {
            return Err(VmError::invalid_range(&requested));
        }
        if requested.is_empty() {
            return Ok(SetVolatileOutcome::default());
        }

        let start = self.offset_in_vmobject + vaddr.offset_from(self.base());
        let end = start + size;
        let (first, last) = if volatile {
            (page_round_up(start), Some(page_round_down(end)))
        } else {
            (Some(page_round_down(start)), page_round_up(end))
        };
        let (Some(first), Some(last)) = (first, last) else {
            return Err(VmError::invalid_range(&requested));
        };
        let count = pages_for(last).saturating_sub(pages_for(first));
        let range = VolatilePageRange::new(pages_for(first), count);

        if volatile {
            Ok(SetVolatileOutcome {
                changed: purgeable.add_volatile_range(token, range),
                was_purged: false,
            })
        } else {
            Ok(match purgeable.remove_volatile_range(token, range)? {
                RemoveVolatileOutcome::Success { was_purged } => SetVolatileOutcome {
                    changed: true,
                    was_purged,
                },
                RemoveVolatileOutcome::SuccessNoChange => SetVolatileOutcome::default(),
            })
        }
    }

    /// An unmapped region over `range` (inside this one) with the same
    /// object, flags, COW bits and volatile ranges.
    ///
    /// The piece owns its part of this region's range. Whoever splits a
    /// region gives up the original's ownership with
    /// [`unmap`](Self::unmap)`(_, DeallocateRange::No)`.
    #[must_use]
    pub fn split_piece<P>(&self, token: &LockToken<P>, range: VirtualRange) -> Self
    where
        VmObjectLock: LockAfter<P>,
    {
        debug_assert!(self.range.contains(&range));
        let delta = range.base().offset_from(self.base());
        let skipped = pages_for(delta);

        let mut piece = Self::new(
            range,
            Arc::clone(&self.vmobject),
            self.offset_in_vmobject + delta,
            self.name.clone(),
            self.flags,
        );
        if !self.cow_map.is_empty() {
            piece.cow_map = Bitmap::new(piece.page_count(), false);
            for index in 0..piece.page_count() {
                piece.cow_map.set(index, self.cow_map.get(skipped + index));
            }
        }
        if let (Some(source), Some(target)) = (&self.purgeable, &piece.purgeable) {
            target.copy_purgeable_page_ranges(token, source);
        }
        piece.range_owner.clone_from(&self.range_owner);
        piece
    }

    /// The region a forked child gets in place of this one.
    ///
    /// Shared regions keep sharing the object. Private regions get a
    /// copy-on-write clone of it; both sides are then marked COW and this
    /// region is remapped read-only.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if the object cannot be cloned or this
    /// region cannot be remapped. This region and its object are left as
    /// they were.
    pub fn try_clone<P>(&mut self, token: &LockToken<P>) -> Result<Self, VmError>
    where
        VmObjectLock: LockAfter<P>,
        PageDirectoryLock: LockAfter<P>,
    {
        let (clone, undo) = self.clone_for_fork(token, None)?;
        if let Some(undo) = undo
            && let Err(error) = self.remap(token)
        {
            self.undo_fork(token, undo);
            return Err(error);
        }
        Ok(clone)
    }

    /// Commit what cloning this region for `fork` will need. `None` when
    /// the child shares the object.
    pub(crate) fn reserve_fork_credits<P>(
        &self,
        token: &LockToken<P>,
    ) -> Result<Option<CommitReservation>, VmError>
    where
        VmObjectLock: LockAfter<P>,
    {
        match self.anonymous() {
            Some(anonymous) if !self.is_shared() => anonymous.reserve_cow_credits(token).map(Some),
            _ => Ok(None),
        }
    }

    /// Build the child's region. A private anonymous region is marked COW
    /// but not remapped yet; the returned [`ForkUndo`] reverts that.
    /// Without `credits`, the COW credits are committed here.
    pub(crate) fn clone_for_fork<P>(
        &mut self,
        token: &LockToken<P>,
        credits: Option<CommitReservation>,
    ) -> Result<(Self, Option<ForkUndo>), VmError>
    where
        VmObjectLock: LockAfter<P>,
    {
        let private = self.anonymous().filter(|_| !self.is_shared()).cloned();
        let (vmobject, undo) = match private {
            Some(anonymous) => {
                let credits = match credits {
                    Some(credits) => credits,
                    None => anonymous.reserve_cow_credits(token)?,
                };
                let (clone, object) = anonymous.clone_with_credits(token, credits)?;
                let page_count = self.page_count();
                let cow_map = mem::replace(&mut self.cow_map, Bitmap::new(page_count, true));
                (clone as Arc<dyn VmObject>, Some(ForkUndo { cow_map, object }))
            }
            None => (Arc::clone(&self.vmobject), None),
        };

        let mut clone = Self::new(
            self.range,
            vmobject,
            self.offset_in_vmobject,
            self.name.clone(),
            self.flags,
        );
        clone.cow_map = self.cow_map.clone();
        if let (Some(source), Some(target)) = (&self.purgeable, &clone.purgeable) {
            target.copy_purgeable_page_ranges(token, source);
        }
        Ok((clone, undo))
    }

    /// Put back what [`clone_for_fork`](Self::clone_for_fork) changed and
    /// remap. A page that cannot be remapped stays unmapped and faults in
    /// again.
    pub(crate) fn undo_fork<P>(&mut self, token: &LockToken<P>, undo: ForkUndo)
    where
        VmObjectLock: LockAfter<P>,
        PageDirectoryLock: LockAfter<P>,
    {
        if let Some(anonymous) = self.anonymous() {
            anonymous.undo_clone(token, undo.object);
        }
        self.cow_map = undo.cow_map;
        if let Err(error) = self.remap(token) {
            warn!("VM: remapping {} after a failed fork: {error}", self.range);
        }
    }

    fn count_pages(&self, keep: impl Fn(&PageState) -> bool) -> u64 {
        pages_to_bytes(self.page_states().iter().filter(|s| keep(s)).count())
    }

    /// Bytes of the region backed by physical pages.
    #[must_use]
    pub fn amount_resident(&self) -> u64 {
        self.count_pages(PageState::is_resident)
    }

    /// Bytes of resident pages also referenced from elsewhere.
    #[must_use]
    pub fn amount_shared(&self) -> u64 {
        self.count_pages(
            |s| matches!(s, PageState::Resident { ref_count, .. } if *ref_count > 1),
        )
    }

    /// Bytes of resident pages that differ from their backing store.
    #[must_use]
    pub fn amount_dirty(&self) -> u64 {
        self.count_pages(|s| matches!(s, PageState::Resident { dirty: true, .. }))
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        self.unmap(&LockToken::root(), DeallocateRange::Yes);
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("id", &self.id)
            .field("range", &self.range)
            .field("offset", &self.offset_in_vmobject)
            .field("name", &self.name)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}
