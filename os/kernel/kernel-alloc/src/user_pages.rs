use crate::{FrameAlloc, PhysicalPage};
use alloc::boxed::Box;
use alloc::sync::Arc;
use kernel_memory_addresses::PhysicalAddress;
use kernel_sync::SpinLock;
use log::{debug, trace};

/// Whether a freshly allocated page must be cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShouldZeroFill {
    No,
    Yes,
}

/// Snapshot of the pool's buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub total: usize,
    pub uncommitted: usize,
    pub committed: usize,
    pub used: usize,
}

struct PoolState {
    frames: Box<dyn FrameAlloc + Send>,
    total: usize,
    uncommitted: usize,
    committed: usize,
    used: usize,
}

impl PoolState {
    fn take_frame(&mut self, zero_fill: ShouldZeroFill) -> Option<PhysicalAddress> {
        let frame = self.frames.alloc_4k()?;
        if zero_fill == ShouldZeroFill::Yes {
            self.frames.zero_4k(frame);
        }
        self.used += 1;
        Some(frame)
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            total: self.total,
            uncommitted: self.uncommitted,
            committed: self.committed,
            used: self.used,
        }
    }
}

/// The global pool of user physical pages and its commit counters.
pub struct UserPhysicalPages {
    state: SpinLock<PoolState>,
}

impl UserPhysicalPages {
    /// Wrap a frame allocator; all of its frames start out uncommitted.
    pub fn new(frames: impl FrameAlloc + Send + 'static) -> Arc<Self> {
        let total = frames.capacity();
        debug!("MM: user physical page pool with {total} frames");
        Arc::new(Self {
            state: SpinLock::new(PoolState {
                frames: Box::new(frames),
                total,
                uncommitted: total,
                committed: 0,
                used: 0,
            }),
        })
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.state.lock().stats()
    }

    /// Reserve `count` pages for a later, infallible allocation.
    ///
    /// Returns `false` (and changes nothing) if not enough uncommitted pages
    /// remain. Committing zero pages always succeeds.
    #[must_use]
    pub fn commit_user_physical_pages(&self, count: usize) -> bool {
        if count == 0 {
            return true;
        }
        let mut state = self.state.lock();
        if state.uncommitted < count {
            debug!(
                "MM: cannot commit {count} pages, only {} uncommitted",
                state.uncommitted
            );
            return false;
        }
        state.uncommitted -= count;
        state.committed += count;
        trace!("MM: committed {count} pages");
        true
    }

    /// Give back `count` credits obtained from
    /// [`commit_user_physical_pages`](Self::commit_user_physical_pages).
    ///
    /// # Panics
    /// Uncommitting more than is committed means the accounting is already
    /// broken; this panics rather than corrupting the counters further.
    pub fn uncommit_user_physical_pages(&self, count: usize) {
        if count == 0 {
            return;
        }
        let mut state = self.state.lock();
        assert!(
            state.committed >= count,
            "MM: uncommitting {count} pages but only {} are committed",
            state.committed
        );
        state.committed -= count;
        state.uncommitted += count;
        trace!("MM: uncommitted {count} pages");
    }

    /// Scoped form of [`commit_user_physical_pages`](Self::commit_user_physical_pages).
    #[must_use]
    pub fn try_commit(self: &Arc<Self>, count: usize) -> Option<CommitReservation> {
        self.commit_user_physical_pages(count)
            .then(|| CommitReservation {
                pool: Arc::clone(self),
                pages: count,
            })
    }

    /// Turn one committed credit into a page.
    ///
    /// # Panics
    /// Panics if no credit is committed, or if the frame allocator has no
    /// frame although the counters say one is reserved.
    #[must_use]
    pub fn allocate_committed_user_physical_page(
        self: &Arc<Self>,
        zero_fill: ShouldZeroFill,
    ) -> PhysicalPage {
        let mut state = self.state.lock();
        assert!(state.committed > 0, "MM: no committed page to allocate");
        state.committed -= 1;
        let Some(frame) = state.take_frame(zero_fill) else {
            panic!("MM: committed page missing from frame allocator");
        };
        drop(state);
        PhysicalPage::new(frame, Arc::downgrade(self))
    }

    /// Allocate a page from uncommitted capacity; `None` when exhausted.
    #[must_use]
    pub fn allocate_user_physical_page(
        self: &Arc<Self>,
        zero_fill: ShouldZeroFill,
    ) -> Option<PhysicalPage> {
        let mut state = self.state.lock();
        if state.uncommitted == 0 {
            return None;
        }
        let frame = state.take_frame(zero_fill)?;
        state.uncommitted -= 1;
        drop(state);
        Some(PhysicalPage::new(frame, Arc::downgrade(self)))
    }

    /// Called when the last [`PhysicalPage`] handle for `frame` drops.
    pub(crate) fn release(&self, frame: PhysicalAddress) {
        let mut state = self.state.lock();
        if let Err(e) = state.frames.free_4k(frame) {
            panic!("MM: releasing page: {e}");
        }
        state.used -= 1;
        state.uncommitted += 1;
    }
}

/// Committed credits owned by a scope.
///
/// Whatever has not been [`consume`](Self::consume)d when the reservation
/// drops is uncommitted again.
pub struct CommitReservation {
    pool: Arc<UserPhysicalPages>,
    pages: usize,
}

impl CommitReservation {
    #[inline]
    #[must_use]
    pub const fn pages(&self) -> usize {
        self.pages
    }

    /// Hand `count` credits over to another owner, which from now on is
    /// responsible for uncommitting or allocating them.
    ///
    /// # Panics
    /// Panics if `count` exceeds what the reservation still holds.
    pub fn consume(&mut self, count: usize) {
        assert!(
            count <= self.pages,
            "MM: consuming {count} credits from a reservation of {}",
            self.pages
        );
        self.pages -= count;
    }
}

impl Drop for CommitReservation {
    fn drop(&mut self) {
        self.pool.uncommit_user_physical_pages(self.pages);
    }
}
