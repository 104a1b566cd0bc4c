//! # Address spaces
//!
//! An [`AddressSpace`] owns one [`PageDirectory`] and the regions mapped
//! into it. Everything about the region set happens under the address-space
//! lock:
//!
//! ```text
//!   AddressSpace::lock(token) ─▶ AddressSpaceGuard ──deref──▶ Regions
//!                                  │                              │
//!                                  │ allocate / map / split       │ lookup, statistics
//!                                  ▼                              ▼
//!                            PageDirectory            Arena<Region> + lookup cache
//! ```
//!
//! Regions in one address space never overlap. The single-entry lookup
//! cache stores a [`RegionId`]; removing the region makes the id stale and
//! the next lookup falls back to a scan.

use crate::arena::Arena;
use crate::lock_order::AddressSpaceLock;
use crate::vmobject::object_id;
use crate::region::ForkUndo;
use crate::{
    AllocationStrategy, AnonymousVmObject, DeallocateRange, FaultAccess, PageDirectory, Region,
    RegionFlags, RegionId, VmError, VmObject,
};
use alloc::collections::BTreeSet;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::ops::{Deref, DerefMut};
use kernel_alloc::{CommitReservation, UserPhysicalPages};
use kernel_memory_addresses::{VirtualAddress, VirtualRange, is_page_aligned, page_round_up};
use kernel_sync::{LockAfter, LockToken, OrderedGuard, OrderedLock};
use log::debug;

pub struct AddressSpace {
    page_directory: Arc<PageDirectory>,
    regions: OrderedLock<AddressSpaceLock, Regions>,
}

impl AddressSpace {
    /// Create an empty address space. A forked child passes its `parent`,
    /// whose free address ranges it starts out with.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if the page directory cannot be created.
    pub fn try_create(
        pool: &Arc<UserPhysicalPages>,
        parent: Option<&Self>,
    ) -> Result<Arc<Self>, VmError> {
        let parent_ranges = parent.map(|p| p.page_directory.range_allocator());
        let page_directory = PageDirectory::create_for_userspace(pool, parent_ranges)?;
        let space = Arc::new(Self {
            page_directory: Arc::clone(&page_directory),
            regions: OrderedLock::new(Regions {
                arena: Arena::new(),
                lookup_cache: None,
                page_directory: Arc::clone(&page_directory),
                pool: Arc::clone(pool),
            }),
        });
        page_directory.set_space(&space);
        Ok(space)
    }

    #[inline]
    #[must_use]
    pub const fn page_directory(&self) -> &Arc<PageDirectory> {
        &self.page_directory
    }

    pub fn lock<'a, P>(&'a self, token: &'a LockToken<P>) -> AddressSpaceGuard<'a>
    where
        AddressSpaceLock: LockAfter<P>,
    {
        AddressSpaceGuard {
            guard: self.regions.lock(token),
        }
    }

    /// Reserve address space: anywhere when `hint` is `None` (or null),
    /// exactly at the page containing `hint` otherwise. `size` is rounded up
    /// to whole pages.
    #[must_use]
    pub fn allocate_range(
        &self,
        hint: Option<VirtualAddress>,
        size: u64,
        alignment: u64,
    ) -> Option<VirtualRange> {
        let size = page_round_up(size)?;
        let allocator = self.page_directory.range_allocator();
        match hint.filter(|hint| !hint.is_null()) {
            None => allocator.allocate_anywhere(size, alignment),
            Some(hint) => allocator.allocate_specific(hint.page_base(), size),
        }
    }

    /// Copy this address space for `fork`.
    ///
    /// The COW credits of every private region are committed before
    /// anything changes. If mapping the child fails afterwards, the parent's
    /// regions and objects are put back the way they were.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if the child's page directory, the COW
    /// credits or a mapping cannot be allocated.
    pub fn try_fork<P>(&self, token: &LockToken<P>) -> Result<Arc<Self>, VmError>
    where
        AddressSpaceLock: LockAfter<P>,
    {
        let mut parent = self.lock(token);
        let child = Self::try_create(&parent.pool, Some(self))?;
        let (regions, parent_token) = parent.guard.split();

        let credits = regions
            .arena
            .iter()
            .map(|(id, region)| Ok((id, region.reserve_fork_credits(parent_token)?)))
            .collect::<Result<Vec<_>, VmError>>()?;

        let mut undo = Vec::new();
        let forked = {
            let mut child_regions = child.lock(token);
            regions.fork_into(parent_token, &mut child_regions, credits, &mut undo)
        };
        if let Err(error) = forked {
            debug!("VM: fork failed ({error}), restoring {} regions", undo.len());
            for (id, undo) in undo.into_iter().rev() {
                if let Some(region) = regions.arena.get_mut(id) {
                    region.undo_fork(parent_token, undo);
                }
            }
            return Err(error);
        }
        debug!("VM: forked address space with {} regions", regions.len());
        Ok(child)
    }
}

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpace")
            .field("page_directory", &self.page_directory)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy)]
struct LookupCache {
    range: VirtualRange,
    region: RegionId,
}

/// The region set of an address space.
pub struct Regions {
    arena: Arena<Region>,
    lookup_cache: Option<LookupCache>,
    page_directory: Arc<PageDirectory>,
    pool: Arc<UserPhysicalPages>,
}

impl Regions {
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.arena.len()
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Region> {
        self.arena.iter().map(|(_, region)| region)
    }

    #[must_use]
    pub fn region(&self, id: RegionId) -> Option<&Region> {
        self.arena.get(id)
    }

    pub fn region_mut(&mut self, id: RegionId) -> Option<&mut Region> {
        self.arena.get_mut(id)
    }

    /// The range and region the lookup cache currently points at, if the
    /// region is still alive.
    #[must_use]
    pub fn cached_lookup(&self) -> Option<(VirtualRange, RegionId)> {
        self.lookup_cache
            .filter(|cache| self.arena.contains(cache.region))
            .map(|cache| (cache.range, cache.region))
    }

    fn insert(&mut self, mut region: Region) -> RegionId {
        self.arena
            .insert_with(move |id| {
                region.assign_id(id);
                region
            })
            .0
    }

    /// The region covering exactly `range` (size rounded up to pages).
    pub fn find_region_from_range(&mut self, range: VirtualRange) -> Option<&Region> {
        let range = VirtualRange::try_new(range.base(), page_round_up(range.size())?)?;
        let cached = self
            .lookup_cache
            .filter(|cache| cache.range == range && self.arena.contains(cache.region))
            .map(|cache| cache.region);
        let id = match cached {
            Some(id) => id,
            None => {
                let id = self.iter().find(|r| r.range() == range).map(Region::id)?;
                self.lookup_cache = Some(LookupCache { range, region: id });
                id
            }
        };
        self.arena.get(id)
    }

    /// The first region whose range contains all of `range`.
    #[must_use]
    pub fn find_region_containing(&self, range: VirtualRange) -> Option<&Region> {
        self.iter().find(|r| r.range().contains(&range))
    }

    /// Every region overlapping `range`, in storage order.
    #[must_use]
    pub fn find_regions_intersecting(&self, range: VirtualRange) -> Vec<&Region> {
        let mut found = Vec::new();
        let mut covered = 0;
        for region in self.iter() {
            let Some(overlap) = region.range().intersect(&range) else {
                continue;
            };
            found.push(region);
            covered += overlap.size();
            if covered == range.size() {
                break;
            }
        }
        found
    }

    /// Clone every region into `child`, then remap the parent's cloned
    /// regions read-only. `undo` collects what a failure has to put back.
    fn fork_into(
        &mut self,
        token: &LockToken<AddressSpaceLock>,
        child: &mut AddressSpaceGuard<'_>,
        credits: Vec<(RegionId, Option<CommitReservation>)>,
        undo: &mut Vec<(RegionId, ForkUndo)>,
    ) -> Result<(), VmError> {
        for (id, credits) in credits {
            let Some(region) = self.arena.get_mut(id) else {
                continue;
            };
            let (clone, restore) = region.clone_for_fork(token, credits)?;
            if let Some(restore) = restore {
                undo.push((id, restore));
            }
            child.add_and_map(clone)?;
        }
        for (id, _) in &*undo {
            if let Some(region) = self.arena.get_mut(*id) {
                region.remap(token)?;
            }
        }
        Ok(())
    }

    /// Remove `id` without unmapping it.
    pub fn take_region(&mut self, id: RegionId) -> Option<Region> {
        if self.lookup_cache.is_some_and(|cache| cache.region == id) {
            self.lookup_cache = None;
        }
        self.arena.remove(id)
    }

    /// Remove and destroy `id`; the region unmaps itself and returns its
    /// range to the allocator.
    pub fn deallocate_region(&mut self, id: RegionId) -> bool {
        self.take_region(id).is_some()
    }

    /// Destroy every region, at process exit.
    pub fn remove_all_regions(&mut self) {
        self.lookup_cache = None;
        let regions = self.arena.drain();
        debug!("VM: removing {} regions", regions.len());
        drop(regions);
    }

    #[must_use]
    pub fn amount_virtual(&self) -> u64 {
        self.iter().map(Region::size).sum()
    }

    #[must_use]
    pub fn amount_resident(&self) -> u64 {
        self.iter().map(Region::amount_resident).sum()
    }

    #[must_use]
    pub fn amount_shared(&self) -> u64 {
        self.iter().map(Region::amount_shared).sum()
    }

    #[must_use]
    pub fn amount_dirty_private(&self) -> u64 {
        self.iter()
            .filter(|r| !r.is_shared())
            .map(Region::amount_dirty)
            .sum()
    }

    /// Clean pages of file mappings, counting each object once.
    #[must_use]
    pub fn amount_clean_inode(&self) -> u64 {
        let mut seen = BTreeSet::new();
        self.iter()
            .map(Region::vmobject)
            .filter(|object| object.is_inode() && seen.insert(object_id(object)))
            .map(|object| object.amount_clean())
            .sum()
    }

    #[must_use]
    pub fn amount_purgeable_volatile(&self) -> u64 {
        self.amount_purgeable(true)
    }

    #[must_use]
    pub fn amount_purgeable_nonvolatile(&self) -> u64 {
        self.amount_purgeable(false)
    }

    fn amount_purgeable(&self, volatile: bool) -> u64 {
        self.iter()
            .filter(|r| r.vmobject().is_anonymous())
            .filter(|r| r.vmobject().is_any_volatile() == volatile)
            .map(Region::amount_resident)
            .sum()
    }
}

impl fmt::Debug for Regions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

/// Exclusive access to an address space's regions.
pub struct AddressSpaceGuard<'a> {
    guard: OrderedGuard<'a, AddressSpaceLock, Regions>,
}

impl AddressSpaceGuard<'_> {
    /// Token for the locks ordered after the address-space lock.
    #[inline]
    #[must_use]
    pub const fn token(&self) -> &LockToken<AddressSpaceLock> {
        self.guard.token()
    }

    /// Map fresh anonymous memory at `range`.
    ///
    /// # Errors
    /// - [`VmError::InvalidRange`] for an empty or unaligned range.
    /// - [`VmError::RangeOccupied`] if a region already overlaps `range`.
    /// - [`VmError::OutOfMemory`] if the object or its mapping cannot be
    ///   allocated.
    pub fn allocate_region(
        &mut self,
        range: VirtualRange,
        name: Option<String>,
        flags: RegionFlags,
        strategy: AllocationStrategy,
    ) -> Result<&Region, VmError> {
        if range.is_empty() || !range.is_page_aligned() {
            return Err(VmError::invalid_range(&range));
        }
        let object =
            AnonymousVmObject::try_create_with_size(&self.pool, range.size(), strategy)?;
        self.add_and_map(Region::new(range, object, 0, name, flags))
    }

    /// Map `range` onto `object` starting `offset` bytes into it.
    ///
    /// # Errors
    /// - [`VmError::OffsetOutOfBounds`] if the window overflows or does not
    ///   fit the object.
    /// - [`VmError::InvalidRange`] for an empty or unaligned range or offset.
    /// - [`VmError::RangeOccupied`] if a region already overlaps `range`.
    /// - [`VmError::OutOfMemory`] if the mapping cannot be allocated.
    pub fn allocate_region_with_object(
        &mut self,
        range: VirtualRange,
        object: Arc<dyn VmObject>,
        offset: u64,
        name: Option<String>,
        flags: RegionFlags,
        shared: bool,
    ) -> Result<&Region, VmError> {
        let out_of_bounds = VmError::OffsetOutOfBounds {
            offset,
            size: range.size(),
            object_size: object.size(),
        };
        let end = offset.checked_add(range.size()).ok_or(out_of_bounds)?;
        if end > object.size() {
            return Err(out_of_bounds);
        }
        if range.is_empty() || !range.is_page_aligned() || !is_page_aligned(offset) {
            return Err(VmError::invalid_range(&range));
        }
        let flags = flags.with_shared(shared);
        self.add_and_map(Region::new(range, object, offset, name, flags))
    }

    /// Map `region` and add it to the set.
    ///
    /// # Errors
    /// [`VmError::RangeOccupied`] on overlap, [`VmError::OutOfMemory`] if
    /// the mapping fails.
    pub fn add_and_map(&mut self, mut region: Region) -> Result<&Region, VmError> {
        let range = region.range();
        if self.iter().any(|r| r.range().intersects(&range)) {
            return Err(VmError::RangeOccupied(range));
        }
        let (regions, token) = self.guard.split();
        let page_directory = Arc::clone(&regions.page_directory);
        region.map(token, &page_directory)?;
        debug!("VM: new region {:?} {range}", region.name());
        let id = regions.insert(region);
        regions.region(id).ok_or(VmError::NoSuchRegion(range.base()))
    }

    /// Add the up to two pieces of `id` left over after removing `carve`.
    ///
    /// The original region stays in place; the caller removes it, gives up
    /// its range with [`DeallocateRange::No`] and deals with the carved-out
    /// middle. The pieces are not mapped but own their ranges.
    pub fn split_region_around_range(&mut self, id: RegionId, carve: VirtualRange) -> Vec<&Region> {
        let (regions, token) = self.guard.split();
        let Some(original) = regions.arena.get(id) else {
            return Vec::new();
        };
        let pieces: Vec<Region> = original
            .range()
            .carve(carve)
            .map(|piece| original.split_piece(token, piece))
            .collect();
        let ids: Vec<RegionId> = pieces.into_iter().map(|piece| regions.insert(piece)).collect();
        ids.into_iter().filter_map(|id| regions.arena.get(id)).collect()
    }

    /// Unmap `[base, base + size)` (`munmap`), splitting regions that
    /// extend past either end.
    ///
    /// # Errors
    /// - [`VmError::InvalidRange`] for an empty or overflowing range.
    /// - [`VmError::NoSuchRegion`] if nothing is mapped there.
    /// - [`VmError::OutOfMemory`] if a leftover piece cannot be remapped.
    pub fn unmap_range(&mut self, base: VirtualAddress, size: u64) -> Result<(), VmError> {
        let range = VirtualRange::expand_to_page_boundaries(base.as_u64(), size)
            .filter(|range| !range.is_empty())
            .ok_or(VmError::InvalidRange { base, size })?;

        if let Some(id) = self.find_region_from_range(range).map(Region::id) {
            self.deallocate_region(id);
            return Ok(());
        }

        if let Some(id) = self.find_region_containing(range).map(Region::id) {
            return self.carve_region(id, range);
        }

        let ids: Vec<RegionId> = self
            .find_regions_intersecting(range)
            .into_iter()
            .map(Region::id)
            .collect();
        if ids.is_empty() {
            return Err(VmError::NoSuchRegion(base));
        }
        for id in ids {
            self.carve_region(id, range)?;
        }
        Ok(())
    }

    /// Replace `id` by its pieces outside `carve`, and free the overlap.
    ///
    /// A piece that cannot be remapped stays in the set, unmapped, and
    /// still owns its range.
    fn carve_region(&mut self, id: RegionId, carve: VirtualRange) -> Result<(), VmError> {
        let pieces: Vec<RegionId> = self
            .split_region_around_range(id, carve)
            .into_iter()
            .map(Region::id)
            .collect();

        let (regions, token) = self.guard.split();
        let page_directory = Arc::clone(&regions.page_directory);
        let Some(mut original) = regions.take_region(id) else {
            return Ok(());
        };
        let overlap = original.range().intersect(&carve);
        let owned = original.owns_range();
        original.unmap(token, DeallocateRange::No);
        drop(original);
        if let Some(overlap) = overlap
            && owned
        {
            page_directory.range_allocator().deallocate(overlap);
        }

        for piece in pieces {
            if let Some(region) = regions.region_mut(piece) {
                region.map(token, &page_directory)?;
            }
        }
        Ok(())
    }

    /// Resolve a page fault at `vaddr`.
    ///
    /// # Errors
    /// [`VmError::NoSuchRegion`] if nothing is mapped at `vaddr`, otherwise
    /// see [`Region::handle_fault`].
    pub fn handle_fault(
        &mut self,
        vaddr: VirtualAddress,
        access: FaultAccess,
    ) -> Result<(), VmError> {
        let id = self
            .iter()
            .find(|r| r.range().contains_address(vaddr))
            .map(Region::id)
            .ok_or(VmError::NoSuchRegion(vaddr))?;
        let (regions, token) = self.guard.split();
        let region = regions.region_mut(id).ok_or(VmError::NoSuchRegion(vaddr))?;
        region.handle_fault(token, vaddr, access)
    }
}

impl Deref for AddressSpaceGuard<'_> {
    type Target = Regions;

    fn deref(&self) -> &Regions {
        &self.guard
    }
}

impl DerefMut for AddressSpaceGuard<'_> {
    fn deref_mut(&mut self) -> &mut Regions {
        &mut self.guard
    }
}
