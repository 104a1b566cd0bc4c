//! Anonymous (zero-fill) memory.
//!
//! ## Page slots
//!
//! ```text
//!              fault (uncommitted alloc, may fail)
//!   SharedZero ───────────────────────────────────▶ Present
//!      │  ▲                                            ▲
//!      │  │ range made volatile (uncommit)             │ fault (committed
//!      ▼  │                                            │ alloc, cannot fail)
//!   LazyCommitted ─────────────────────────────────────┘
//!      ▲
//!      └── range made non-volatile (reserve + mark)
//! ```
//!
//! `unused_committed_pages` counts the `LazyCommitted` slots: every one of
//! them owns a committed credit in the pool. Purging turns resident pages
//! in volatile ranges back into `SharedZero`.
//!
//! ## Views
//!
//! Every mapping of the object owns a purgeable-range controller. A page is
//! only *effectively* volatile when every attached view has it volatile;
//! only such pages are purged or lose their lazy commitment.

use crate::committed_cow::CommittedCowTicket;
use crate::lock_order::VmObjectLock;
use crate::purgeable::PurgeableView;
use crate::volatile::{VolatilePageRange, count_nonvolatile, intersect_ranges};
use crate::{Bitmap, PageState, VmError, VmObject};
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::{fmt, ptr};
use kernel_alloc::{CommitReservation, PhysicalPage, ShouldZeroFill, UserPhysicalPages};
use kernel_memory_addresses::{VirtualAddress, page_round_up, pages_for};
use kernel_sync::{LockAfter, LockToken, OrderedGuard, OrderedLock, SpinLock};
use log::{debug, trace, warn};

/// How an anonymous object obtains its pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationStrategy {
    /// Commit every page now, allocate on first touch.
    Reserve,
    /// Commit and allocate every page now.
    AllocateNow,
    /// Overcommit: allocate on first touch, which may fail.
    None,
}

/// Backing of one page of an anonymous object.
#[derive(Debug, Clone)]
pub(crate) enum PageSlot {
    SharedZero,
    LazyCommitted,
    Present(PhysicalPage),
}

impl PageSlot {
    fn state(&self) -> PageState {
        match self {
            Self::SharedZero => PageState::SharedZero,
            Self::LazyCommitted => PageState::LazyCommitted,
            Self::Present(page) => PageState::Resident {
                address: page.address(),
                ref_count: page.ref_count(),
                dirty: true,
            },
        }
    }
}

/// A view whose controller lock the caller already holds.
pub(crate) struct HeldView<'a> {
    pub(crate) view: &'a PurgeableView,
    pub(crate) ranges: &'a crate::VolatileRangeSet,
}

/// Page bookkeeping of an [`AnonymousVmObject`], guarded by the object lock.
pub(crate) struct AnonymousPages {
    slots: Vec<PageSlot>,
    /// Number of `LazyCommitted` slots; each holds one committed credit.
    unused_committed_pages: usize,
    /// Pages that must be copied before they are written. Empty until the
    /// object is first cloned.
    cow_map: Bitmap,
    shared_committed_cow_pages: Option<Arc<SpinLock<CommittedCowTicket>>>,
    views: Vec<Weak<PurgeableView>>,
    /// Intersection of all views' volatile ranges; `None` when stale.
    volatile_cache: Option<Vec<VolatilePageRange>>,
    pool: Arc<UserPhysicalPages>,
}

impl AnonymousPages {
    #[inline]
    fn page_count(&self) -> usize {
        self.slots.len()
    }

    /// Credits left in the COW ticket this object shares, if any.
    fn cow_credits(&self) -> Option<usize> {
        self.shared_committed_cow_pages
            .as_ref()
            .map(|ticket| ticket.lock().remaining())
    }

    pub(crate) const fn pool(&self) -> &Arc<UserPhysicalPages> {
        &self.pool
    }

    /// Pages volatile in every attached view.
    ///
    /// `held` supplies the range set of a view whose lock the caller already
    /// holds; that view is not locked again.
    pub(crate) fn effective_volatile_ranges(
        &mut self,
        token: &LockToken<VmObjectLock>,
        held: Option<&HeldView<'_>>,
    ) -> Vec<VolatilePageRange> {
        if held.is_none()
            && let Some(cached) = &self.volatile_cache
        {
            return cached.clone();
        }

        let mut effective: Option<Vec<VolatilePageRange>> = None;
        for view in self.views.iter().filter_map(Weak::upgrade) {
            let next = match held {
                Some(held) if ptr::eq(Arc::as_ptr(&view), held.view) => {
                    intersect_with(effective.take(), held.ranges.ranges())
                }
                _ => intersect_with(effective.take(), view.lock(token).ranges.ranges()),
            };
            let nothing_left = next.is_empty();
            effective = Some(next);
            if nothing_left {
                break;
            }
        }

        let effective = effective.unwrap_or_default();
        self.volatile_cache = Some(effective.clone());
        effective
    }

    fn cow_pages_needed(&mut self, token: &LockToken<VmObjectLock>) -> usize {
        let volatile = self.effective_volatile_ranges(token, None);
        count_nonvolatile(&volatile, self.page_count())
    }

    fn is_nonvolatile(&mut self, token: &LockToken<VmObjectLock>, index: usize) -> bool {
        !self
            .effective_volatile_ranges(token, None)
            .iter()
            .any(|r| r.contains_page(index))
    }

    pub(crate) fn volatile_ranges_changed(&mut self) {
        self.volatile_cache = None;
    }

    /// A view made `range` volatile. Lazy commitments that are now
    /// effectively volatile are given back to the pool.
    pub(crate) fn range_made_volatile(
        &mut self,
        token: &LockToken<VmObjectLock>,
        held: &HeldView<'_>,
        range: VolatilePageRange,
    ) {
        self.volatile_cache = None;
        if self.unused_committed_pages == 0 {
            return;
        }

        let mut uncommit = 0;
        for volatile in self.effective_volatile_ranges(token, Some(held)) {
            let piece = volatile.intersected(&range);
            if piece.is_empty() {
                continue;
            }
            for slot in &mut self.slots[piece.base..piece.end()] {
                if matches!(slot, PageSlot::LazyCommitted) {
                    *slot = PageSlot::SharedZero;
                    uncommit += 1;
                }
            }
        }

        if uncommit > 0 {
            debug!("VM: uncommitting {uncommit} lazy-commit pages of a volatile range");
            self.unused_committed_pages -= uncommit;
            self.pool.uncommit_user_physical_pages(uncommit);
        }
    }

    pub(crate) fn range_made_nonvolatile(&mut self, range: VolatilePageRange) {
        trace!("VM: pages {}..{} non-volatile", range.base, range.end());
        self.volatile_cache = None;
    }

    /// Credits needed so that every page of `range` is guaranteed backing.
    ///
    /// Pages marked copy-on-write are covered by the COW ticket instead.
    pub(crate) fn count_needed_commit_pages_for_nonvolatile_range(
        &self,
        range: VolatilePageRange,
    ) -> usize {
        (range.base..range.end())
            .filter(|&i| !self.cow_map.get(i))
            .filter(|&i| matches!(self.slots.get(i), Some(PageSlot::SharedZero)))
            .count()
    }

    /// Turn up to `budget` shared-zero pages of `range` into lazy commits,
    /// taking ownership of one already-committed credit each.
    ///
    /// # Panics
    /// Panics if `budget` is zero.
    pub(crate) fn mark_committed_pages_for_nonvolatile_range(
        &mut self,
        range: VolatilePageRange,
        budget: usize,
    ) -> usize {
        assert!(budget > 0, "marking pages without a budget");
        let mut marked = 0;
        for index in range.base..range.end() {
            if marked == budget {
                break;
            }
            if self.cow_map.get(index) {
                continue;
            }
            let Some(slot) = self.slots.get_mut(index) else {
                break;
            };
            if matches!(slot, PageSlot::SharedZero) {
                *slot = PageSlot::LazyCommitted;
                marked += 1;
            }
        }
        self.unused_committed_pages += marked;
        marked
    }

    pub(crate) fn is_any_volatile(&self, token: &LockToken<VmObjectLock>) -> bool {
        self.views
            .iter()
            .filter_map(Weak::upgrade)
            .any(|view| !view.lock(token).ranges.is_empty())
    }

    /// Record on every view that `range` lost its contents, and unmap it
    /// wherever the views are mapped.
    pub(crate) fn set_was_purged(
        &mut self,
        token: &LockToken<VmObjectLock>,
        range: VolatilePageRange,
    ) {
        for view in self.views.iter().filter_map(Weak::upgrade) {
            let mut guard = view.lock(token);
            let (state, view_token) = guard.split();
            state.ranges.add(range.with_purged(true));
            if let Some(mapping) = &state.mapping {
                mapping.unmap_pages(view_token, range);
            }
        }
        self.volatile_cache = None;
    }

    /// Discard every page that is effectively volatile.
    pub(crate) fn purge(&mut self, token: &LockToken<VmObjectLock>) -> usize {
        let mut purged_total = 0;
        let mut released = 0;
        for range in self.effective_volatile_ranges(token, None) {
            let mut purged = 0;
            for slot in &mut self.slots[range.base..range.end()] {
                match slot {
                    PageSlot::Present(_) => purged += 1,
                    PageSlot::LazyCommitted => released += 1,
                    PageSlot::SharedZero => {}
                }
                *slot = PageSlot::SharedZero;
            }
            if purged > 0 {
                trace!("VM: purged {purged} pages at {}..{}", range.base, range.end());
                purged_total += purged;
                self.set_was_purged(token, range);
            }
        }
        if released > 0 {
            self.unused_committed_pages -= released;
            self.pool.uncommit_user_physical_pages(released);
        }
        purged_total
    }

    /// Back `index` with a page (zero fault).
    fn fault_in_page(&mut self, index: usize) -> Result<(), VmError> {
        let slot = &mut self.slots[index];
        match slot {
            PageSlot::Present(_) => {}
            PageSlot::LazyCommitted => {
                assert!(
                    self.unused_committed_pages > 0,
                    "lazy-commit slot without a committed credit"
                );
                self.unused_committed_pages -= 1;
                *slot = PageSlot::Present(
                    self.pool
                        .allocate_committed_user_physical_page(ShouldZeroFill::Yes),
                );
            }
            PageSlot::SharedZero => {
                let Some(page) = self.pool.allocate_user_physical_page(ShouldZeroFill::Yes) else {
                    warn!("VM: zero fault on page {index} could not allocate a page");
                    return Err(VmError::OutOfMemory);
                };
                *slot = PageSlot::Present(page);
            }
        }
        if self.cow_map.get(index) {
            self.cow_map.set(index, false);
        }
        Ok(())
    }

    /// Give `index` a private copy of its page before a write.
    fn handle_cow_fault(
        &mut self,
        token: &LockToken<VmObjectLock>,
        index: usize,
    ) -> Result<(), VmError> {
        let shared = match &self.slots[index] {
            PageSlot::Present(page) => page.ref_count() > 1,
            _ => return self.fault_in_page(index),
        };

        let ticket = if self.is_nonvolatile(token, index) {
            self.shared_committed_cow_pages.clone()
        } else {
            None
        };

        if !shared {
            trace!("VM: COW page {index} is no longer shared, keeping it");
            self.cow_map.set(index, false);
            if let Some(ticket) = ticket {
                let mut credits = ticket.lock();
                if credits.remaining() > 0 && credits.return_one() {
                    self.shared_committed_cow_pages = None;
                }
            }
            return Ok(());
        }

        let committed = ticket.and_then(|ticket| {
            let mut credits = ticket.lock();
            (credits.remaining() > 0).then(|| credits.allocate_one())
        });
        let page = match committed {
            Some(page) => page,
            None => self
                .pool
                .allocate_user_physical_page(ShouldZeroFill::No)
                .ok_or_else(|| {
                    warn!("VM: COW fault on page {index} could not allocate a page");
                    VmError::OutOfMemory
                })?,
        };
        trace!("VM: COW copy of page {index} into {}", page.address());
        self.slots[index] = PageSlot::Present(page);
        self.cow_map.set(index, false);
        Ok(())
    }
}

fn intersect_with(
    acc: Option<Vec<VolatilePageRange>>,
    next: &[VolatilePageRange],
) -> Vec<VolatilePageRange> {
    match acc {
        None => next.to_vec(),
        Some(acc) => intersect_ranges(&acc, next),
    }
}

/// COW state of an object from before it was cloned.
pub(crate) struct CloneUndo {
    cow_map: Bitmap,
    ticket: Option<Arc<SpinLock<CommittedCowTicket>>>,
}

/// Zero-fill memory with commit accounting, purgeable through its views.
pub struct AnonymousVmObject {
    size: u64,
    pages: OrderedLock<VmObjectLock, AnonymousPages>,
}

impl AnonymousVmObject {
    /// Create an object of `size` bytes (rounded up to whole pages).
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if the strategy needs commitments the pool
    /// cannot make; [`VmError::InvalidRange`] if `size` overflows when
    /// rounded.
    pub fn try_create_with_size(
        pool: &Arc<UserPhysicalPages>,
        size: u64,
        strategy: AllocationStrategy,
    ) -> Result<Arc<Self>, VmError> {
        let Some(size) = page_round_up(size) else {
            return Err(VmError::InvalidRange {
                base: VirtualAddress::zero(),
                size,
            });
        };
        let page_count = pages_for(size);

        let (slots, unused_committed_pages) = match strategy {
            AllocationStrategy::None => (alloc::vec![PageSlot::SharedZero; page_count], 0),
            AllocationStrategy::Reserve | AllocationStrategy::AllocateNow => {
                if !pool.commit_user_physical_pages(page_count) {
                    warn!("VM: cannot commit {page_count} pages for an anonymous object");
                    return Err(VmError::OutOfMemory);
                }
                if strategy == AllocationStrategy::Reserve {
                    (alloc::vec![PageSlot::LazyCommitted; page_count], page_count)
                } else {
                    let slots = (0..page_count)
                        .map(|_| {
                            PageSlot::Present(
                                pool.allocate_committed_user_physical_page(ShouldZeroFill::Yes),
                            )
                        })
                        .collect();
                    (slots, 0)
                }
            }
        };

        Ok(Arc::new(Self::from_pages(
            size,
            AnonymousPages {
                slots,
                unused_committed_pages,
                cow_map: Bitmap::default(),
                shared_committed_cow_pages: None,
                views: Vec::new(),
                volatile_cache: None,
                pool: Arc::clone(pool),
            },
        )))
    }

    const fn from_pages(size: u64, pages: AnonymousPages) -> Self {
        Self {
            size,
            pages: OrderedLock::new(pages),
        }
    }

    /// Lock the page bookkeeping.
    pub(crate) fn lock_pages<'a, P>(
        &'a self,
        token: &'a LockToken<P>,
    ) -> OrderedGuard<'a, VmObjectLock, AnonymousPages>
    where
        VmObjectLock: LockAfter<P>,
    {
        self.pages.lock(token)
    }

    #[must_use]
    pub fn unused_committed_pages<P>(&self, token: &LockToken<P>) -> usize
    where
        VmObjectLock: LockAfter<P>,
    {
        self.lock_pages(token).unused_committed_pages
    }

    /// Credits left in the COW ticket this object shares, if any.
    #[must_use]
    pub fn cow_credits<P>(&self, token: &LockToken<P>) -> Option<usize>
    where
        VmObjectLock: LockAfter<P>,
    {
        self.lock_pages(token).cow_credits()
    }

    /// Discard all effectively volatile pages; returns how many were resident.
    pub fn purge<P>(&self, token: &LockToken<P>) -> usize
    where
        VmObjectLock: LockAfter<P>,
    {
        let mut guard = self.lock_pages(token);
        let (pages, token) = guard.split();
        pages.purge(token)
    }

    /// Make page `index` resident.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if the page was not committed and the pool is
    /// exhausted.
    pub fn fault_in_page<P>(&self, token: &LockToken<P>, index: usize) -> Result<(), VmError>
    where
        VmObjectLock: LockAfter<P>,
    {
        self.lock_pages(token).fault_in_page(index)
    }

    /// Resolve a write to the copy-on-write page `index`.
    ///
    /// Non-volatile pages draw on the shared COW ticket first. A page that
    /// nobody else references any more keeps its frame, and one credit goes
    /// back to the pool.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if no credit is available and the pool is
    /// exhausted.
    pub fn handle_cow_fault<P>(&self, token: &LockToken<P>, index: usize) -> Result<(), VmError>
    where
        VmObjectLock: LockAfter<P>,
    {
        let mut guard = self.lock_pages(token);
        let (pages, token) = guard.split();
        pages.handle_cow_fault(token, index)
    }

    /// Commit the credits a copy-on-write clone needs, one per page that is
    /// not effectively volatile. Nothing else changes.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if the pool cannot commit them.
    pub fn reserve_cow_credits<P>(&self, token: &LockToken<P>) -> Result<CommitReservation, VmError>
    where
        VmObjectLock: LockAfter<P>,
    {
        let mut guard = self.lock_pages(token);
        let (pages, token) = guard.split();
        let need = pages.cow_pages_needed(token);
        pages.pool.try_commit(need).ok_or_else(|| {
            warn!("VM: cannot commit {need} COW pages for clone");
            VmError::OutOfMemory
        })
    }

    /// Copy-on-write clone for `fork`.
    ///
    /// Both objects end up sharing every page read-only and one
    /// [`CommittedCowTicket`] holding a credit per non-volatile page. The
    /// clone does not inherit lazy commitments.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if the COW credits cannot be committed; the
    /// original is left untouched.
    pub fn try_clone_anonymous<P>(&self, token: &LockToken<P>) -> Result<Arc<Self>, VmError>
    where
        VmObjectLock: LockAfter<P>,
    {
        let credits = self.reserve_cow_credits(token)?;
        self.clone_with_credits(token, credits)
            .map(|(clone, _)| clone)
    }

    /// Clone using credits committed by
    /// [`reserve_cow_credits`](Self::reserve_cow_credits). Credits the clone
    /// does not need go back to the pool; a shortfall is committed here.
    ///
    /// The returned [`CloneUndo`] restores the original with
    /// [`undo_clone`](Self::undo_clone).
    pub(crate) fn clone_with_credits<P>(
        &self,
        token: &LockToken<P>,
        mut credits: CommitReservation,
    ) -> Result<(Arc<Self>, CloneUndo), VmError>
    where
        VmObjectLock: LockAfter<P>,
    {
        let mut guard = self.lock_pages(token);
        let (pages, token) = guard.split();

        let page_count = pages.page_count();
        let need = pages.cow_pages_needed(token);
        debug!("VM: cloning anonymous object, need {need} committed COW pages");
        let reserved = need.min(credits.pages());
        let shortfall = need - reserved;
        if shortfall > 0 && !pages.pool.commit_user_physical_pages(shortfall) {
            warn!("VM: cannot commit {shortfall} more COW pages for clone");
            return Err(VmError::OutOfMemory);
        }
        credits.consume(reserved);

        let ticket = (need > 0).then(|| {
            Arc::new(SpinLock::new(CommittedCowTicket::new(
                Arc::clone(&pages.pool),
                need,
            )))
        });
        let undo = CloneUndo {
            cow_map: core::mem::replace(&mut pages.cow_map, Bitmap::new(page_count, true)),
            ticket: core::mem::replace(&mut pages.shared_committed_cow_pages, ticket.clone()),
        };

        let mut slots = pages.slots.clone();
        let mut inherited = pages.unused_committed_pages;
        for slot in &mut slots {
            if inherited == 0 {
                break;
            }
            if matches!(slot, PageSlot::LazyCommitted) {
                *slot = PageSlot::SharedZero;
                inherited -= 1;
            }
        }

        let clone = Arc::new(Self::from_pages(
            self.size,
            AnonymousPages {
                slots,
                unused_committed_pages: 0,
                cow_map: Bitmap::new(page_count, true),
                shared_committed_cow_pages: ticket,
                views: Vec::new(),
                volatile_cache: None,
                pool: Arc::clone(&pages.pool),
            },
        ));
        Ok((clone, undo))
    }

    /// Put back the COW state a clone replaced. The clone keeps its own
    /// ticket; its credits go back to the pool once the clone is gone.
    pub(crate) fn undo_clone<P>(&self, token: &LockToken<P>, undo: CloneUndo)
    where
        VmObjectLock: LockAfter<P>,
    {
        let mut pages = self.lock_pages(token);
        pages.cow_map = undo.cow_map;
        pages.shared_committed_cow_pages = undo.ticket;
    }

    pub(crate) fn register_view(&self, view: &Arc<PurgeableView>) {
        let root = LockToken::root();
        let mut pages = self.lock_pages(&root);
        pages.views.push(Arc::downgrade(view));
        pages.volatile_cache = None;
    }

    pub(crate) fn unregister_view(&self, view: *const PurgeableView) {
        let root = LockToken::root();
        let mut pages = self.lock_pages(&root);
        pages.views.retain(|w| !ptr::eq(w.as_ptr(), view));
        pages.volatile_cache = None;
    }
}

impl Drop for AnonymousVmObject {
    fn drop(&mut self) {
        let pages = self.pages.get_mut();
        if pages.unused_committed_pages > 0 {
            pages
                .pool
                .uncommit_user_physical_pages(pages.unused_committed_pages);
        }
    }
}

impl fmt::Debug for AnonymousVmObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnonymousVmObject")
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

impl VmObject for AnonymousVmObject {
    fn size(&self) -> u64 {
        self.size
    }

    fn is_anonymous(&self) -> bool {
        true
    }

    fn page_states(&self, first: usize, count: usize) -> Vec<PageState> {
        let root = LockToken::root();
        let pages = self.lock_pages(&root);
        pages
            .slots
            .iter()
            .skip(first)
            .take(count)
            .map(PageSlot::state)
            .collect()
    }

    fn is_any_volatile(&self) -> bool {
        let root = LockToken::root();
        let guard = self.lock_pages(&root);
        guard.is_any_volatile(guard.token())
    }

    fn as_anonymous(self: Arc<Self>) -> Option<Arc<AnonymousVmObject>> {
        Some(self)
    }
}
