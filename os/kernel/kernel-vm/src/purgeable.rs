//! # Purgeable ranges
//!
//! Userspace marks pages of an anonymous mapping *volatile* to tell the
//! kernel their contents may be thrown away under memory pressure. Every
//! mapping keeps its own [`VolatileRangeSet`] in a
//! [`PurgeableRangeController`]; the object behind the mapping only purges
//! pages that *all* of its mappings agree are volatile.
//!
//! ```text
//!   Region A ──▶ controller A ──┐
//!                               ├──▶ AnonymousVmObject (weak list of views)
//!   Region B ──▶ controller B ──┘
//! ```
//!
//! Making a range non-volatile again must guarantee that every page in it
//! can be backed. That commitment is all or nothing: the pages are reserved
//! up front and nothing is changed if the pool cannot provide them.
//!
//! Operations that change the range set lock the object, so they take the
//! caller's [`LockToken`]. Calling one while a lock at the object's level or
//! below is held does not compile:
//!
//! ```compile_fail
//! use kernel_alloc::{BitmapFrameAlloc, UserPhysicalPages};
//! use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress};
//! use kernel_sync::{LockToken, OrderedLock};
//! use kernel_vm::lock_order::VmObjectLock;
//! use kernel_vm::{AllocationStrategy, AnonymousVmObject, PurgeableRangeController};
//! use kernel_vm::VolatilePageRange;
//!
//! let pool = UserPhysicalPages::new(BitmapFrameAlloc::new(PhysicalAddress::new(0x10_0000), 8));
//! let object =
//!     AnonymousVmObject::try_create_with_size(&pool, PAGE_SIZE, AllocationStrategy::None)
//!         .unwrap();
//! let controller = PurgeableRangeController::for_anonymous(object);
//!
//! let object_level = OrderedLock::<VmObjectLock, _>::new(());
//! let root = LockToken::root();
//! let held = object_level.lock(&root);
//! // VmObjectLock: LockAfter<VmObjectLock> is not implemented
//! controller.add_volatile_range(held.token(), VolatilePageRange::new(0, 1));
//! ```

use crate::lock_order::{PageDirectoryLock, PurgeableRangesLock, VmObjectLock};
use crate::vmobject::{AnonymousPages, HeldView};
use crate::volatile::{VolatilePageRange, VolatileRangeSet};
use crate::{AnonymousVmObject, PageDirectory, VmError, VmObject};
use alloc::sync::{Arc, Weak};
use core::fmt;
use core::ops::ControlFlow;
use kernel_alloc::CommitReservation;
use kernel_memory_addresses::{VirtualAddress, pages_to_bytes};
use kernel_sync::{LockAfter, LockToken, OrderedGuard, OrderedLock};
use log::debug;

/// Where a view's pages are currently mapped.
#[derive(Debug, Clone)]
pub(crate) struct ViewMapping {
    pub(crate) page_directory: Weak<PageDirectory>,
    /// Virtual address of object page `first_page`.
    pub(crate) base: VirtualAddress,
    pub(crate) first_page: usize,
    pub(crate) page_count: usize,
}

impl ViewMapping {
    /// Drop the translations of the object pages in `range` that fall
    /// inside this mapping.
    pub(crate) fn unmap_pages<P>(&self, token: &LockToken<P>, range: VolatilePageRange)
    where
        PageDirectoryLock: LockAfter<P>,
    {
        let Some(page_directory) = self.page_directory.upgrade() else {
            return;
        };
        let window = VolatilePageRange::new(self.first_page, self.page_count);
        let piece = range.intersected(&window);
        for page in piece.base..piece.end() {
            let vaddr = self.base + pages_to_bytes(page - self.first_page);
            page_directory.unmap_page(token, vaddr);
        }
    }
}

pub(crate) struct ViewState {
    pub(crate) ranges: VolatileRangeSet,
    pub(crate) mapping: Option<ViewMapping>,
}

/// The shared half of a controller, reachable from the object.
pub(crate) struct PurgeableView {
    state: OrderedLock<PurgeableRangesLock, ViewState>,
}

impl PurgeableView {
    fn new(total_pages: usize) -> Self {
        Self {
            state: OrderedLock::new(ViewState {
                ranges: VolatileRangeSet::new(total_pages),
                mapping: None,
            }),
        }
    }

    pub(crate) fn lock<'a, P>(
        &'a self,
        token: &'a LockToken<P>,
    ) -> OrderedGuard<'a, PurgeableRangesLock, ViewState>
    where
        PurgeableRangesLock: LockAfter<P>,
    {
        self.state.lock(token)
    }
}

/// Result of [`PurgeableRangeController::remove_volatile_range`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveVolatileOutcome {
    /// Pages became non-volatile. `was_purged` reports whether any of them
    /// lost their contents while volatile.
    Success { was_purged: bool },
    /// Nothing in the range was volatile.
    SuccessNoChange,
}

/// Volatile ranges of one mapping of an object.
pub struct PurgeableRangeController {
    vmobject: Option<Arc<AnonymousVmObject>>,
    view: Arc<PurgeableView>,
}

impl PurgeableRangeController {
    /// Attach a controller to `vmobject`. Objects that are not anonymous get
    /// a detached controller whose range set is always empty.
    #[must_use]
    pub fn new(vmobject: &Arc<dyn VmObject>) -> Self {
        match Arc::clone(vmobject).as_anonymous() {
            Some(anonymous) => Self::for_anonymous(anonymous),
            None => Self {
                vmobject: None,
                view: Arc::new(PurgeableView::new(0)),
            },
        }
    }

    #[must_use]
    pub fn for_anonymous(vmobject: Arc<AnonymousVmObject>) -> Self {
        let view = Arc::new(PurgeableView::new(vmobject.page_count()));
        vmobject.register_view(&view);
        Self {
            vmobject: Some(vmobject),
            view,
        }
    }

    #[inline]
    #[must_use]
    pub fn vmobject(&self) -> Option<&Arc<AnonymousVmObject>> {
        self.vmobject.as_ref()
    }

    /// Run `f` with the object lock and this view's lock held, in order.
    fn locked<P, R>(
        &self,
        token: &LockToken<P>,
        f: impl FnOnce(&mut AnonymousPages, &LockToken<VmObjectLock>, &mut ViewState) -> R,
    ) -> Option<R>
    where
        VmObjectLock: LockAfter<P>,
    {
        let object = self.vmobject.as_ref()?;
        let mut pages = object.lock_pages(token);
        let (pages, object_token) = pages.split();
        let mut state = self.view.lock(object_token);
        Some(f(pages, object_token, &mut state))
    }

    /// Mark `range` volatile. Returns whether the set changed.
    ///
    /// Lazily committed pages that become volatile in every mapping give
    /// their commitment back to the pool.
    pub fn add_volatile_range<P>(&self, token: &LockToken<P>, range: VolatilePageRange) -> bool
    where
        VmObjectLock: LockAfter<P>,
    {
        if range.is_empty() {
            return false;
        }
        self.locked(token, |pages, token, state| {
            let changed = state.ranges.add(range);
            if changed {
                let held = HeldView {
                    view: &self.view,
                    ranges: &state.ranges,
                };
                pages.range_made_volatile(token, &held, range);
            }
            changed
        })
        .unwrap_or(false)
    }

    /// Make `range` non-volatile, committing a page for every page in it
    /// that has no backing.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if the commitment cannot be made. The range
    /// set and the object are left exactly as they were.
    pub fn remove_volatile_range<P>(
        &self,
        token: &LockToken<P>,
        range: VolatilePageRange,
    ) -> Result<RemoveVolatileOutcome, VmError>
    where
        VmObjectLock: LockAfter<P>,
    {
        if range.is_empty() {
            return Ok(RemoveVolatileOutcome::SuccessNoChange);
        }
        self.locked(token, |pages, _, state| {
            Reserving {
                pages,
                ranges: &mut state.ranges,
                range,
            }
            .reserve()
            .map(Applying::apply)
            .map(Committing::commit)
        })
        .unwrap_or(Ok(RemoveVolatileOutcome::SuccessNoChange))
    }

    #[must_use]
    pub fn is_volatile_range(&self, range: VolatilePageRange) -> bool {
        self.view.lock(&LockToken::root()).ranges.intersects(range)
    }

    #[must_use]
    pub fn is_volatile(&self, page_index: usize) -> bool {
        self.view.lock(&LockToken::root()).ranges.contains(page_index)
    }

    /// Whether `page_index` is volatile and lost its contents.
    #[must_use]
    pub fn is_purged(&self, page_index: usize) -> bool {
        let mut purged = false;
        let _ = self
            .view
            .lock(&LockToken::root())
            .ranges
            .for_each_intersecting_range(VolatilePageRange::new(page_index, 1), |r| {
                purged = r.was_purged;
                ControlFlow::Break(())
            });
        purged
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.view.lock(&LockToken::root()).ranges.is_empty()
    }

    /// Record that `range` was purged.
    pub fn set_was_purged<P>(&self, token: &LockToken<P>, range: VolatilePageRange)
    where
        VmObjectLock: LockAfter<P>,
    {
        self.locked(token, |pages, token, state| {
            if state.ranges.add(range.with_purged(true)) {
                let held = HeldView {
                    view: &self.view,
                    ranges: &state.ranges,
                };
                pages.range_made_volatile(token, &held, range);
            }
        });
    }

    /// Snapshot of the volatile range set.
    #[must_use]
    pub fn volatile_ranges(&self) -> VolatileRangeSet {
        self.view.lock(&LockToken::root()).ranges.clone()
    }

    /// Replace this controller's ranges with `other`'s.
    pub fn copy_purgeable_page_ranges<P>(&self, token: &LockToken<P>, other: &Self)
    where
        VmObjectLock: LockAfter<P>,
    {
        let snapshot = other.volatile_ranges();
        self.locked(token, |pages, _, state| {
            state.ranges.copy_from(&snapshot);
            pages.volatile_ranges_changed();
        });
    }

    pub(crate) fn set_mapping(&self, mapping: Option<ViewMapping>) {
        self.view.lock(&LockToken::root()).mapping = mapping;
    }
}

impl Drop for PurgeableRangeController {
    fn drop(&mut self) {
        if let Some(object) = &self.vmobject {
            object.unregister_view(Arc::as_ptr(&self.view));
        }
    }
}

impl fmt::Debug for PurgeableRangeController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PurgeableRangeController")
            .field("attached", &self.vmobject.is_some())
            .field("ranges", &self.volatile_ranges())
            .finish()
    }
}

/// Count and commit the pages `range` needs.
struct Reserving<'a> {
    pages: &'a mut AnonymousPages,
    ranges: &'a mut VolatileRangeSet,
    range: VolatilePageRange,
}

/// Pages are committed; hand them to the object.
struct Applying<'a> {
    pages: &'a mut AnonymousPages,
    ranges: &'a mut VolatileRangeSet,
    range: VolatilePageRange,
    needed: usize,
    reservation: Option<CommitReservation>,
}

/// The object owns its commitments; update the range set.
struct Committing<'a> {
    pages: &'a mut AnonymousPages,
    ranges: &'a mut VolatileRangeSet,
    range: VolatilePageRange,
    needed: usize,
}

impl<'a> Reserving<'a> {
    fn reserve(self) -> Result<Applying<'a>, VmError> {
        let mut needed = 0;
        let _ = self.ranges.for_each_intersecting_range(self.range, |r| {
            needed += self.pages.count_needed_commit_pages_for_nonvolatile_range(r);
            ControlFlow::Continue(())
        });

        let reservation = if needed == 0 {
            None
        } else {
            let Some(reservation) = self.pages.pool().try_commit(needed) else {
                debug!("VM: cannot commit {needed} pages to make a range non-volatile");
                return Err(VmError::OutOfMemory);
            };
            Some(reservation)
        };

        Ok(Applying {
            pages: self.pages,
            ranges: self.ranges,
            range: self.range,
            needed,
            reservation,
        })
    }
}

impl<'a> Applying<'a> {
    fn apply(self) -> Committing<'a> {
        let Self {
            pages,
            ranges,
            range,
            needed,
            reservation,
        } = self;

        if let Some(mut reservation) = reservation {
            let mut remaining = needed;
            let _ = ranges.for_each_intersecting_range(range, |r| {
                if remaining == 0 {
                    return ControlFlow::Break(());
                }
                let marked = pages.mark_committed_pages_for_nonvolatile_range(r, remaining);
                reservation.consume(marked);
                remaining -= marked;
                ControlFlow::Continue(())
            });
            debug_assert_eq!(reservation.pages(), 0, "reserved pages left unmarked");
        }

        Committing {
            pages,
            ranges,
            range,
            needed,
        }
    }
}

impl Committing<'_> {
    fn commit(self) -> RemoveVolatileOutcome {
        match self.ranges.remove(self.range) {
            Some(was_purged) => {
                self.pages.range_made_nonvolatile(self.range);
                RemoveVolatileOutcome::Success { was_purged }
            }
            None => {
                assert_eq!(
                    self.needed, 0,
                    "committed pages for a range that was not volatile"
                );
                RemoveVolatileOutcome::SuccessNoChange
            }
        }
    }
}
