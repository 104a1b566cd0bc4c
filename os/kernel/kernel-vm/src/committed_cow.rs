//! Pre-committed credits for copy-on-write faults.
//!
//! When an anonymous object is cloned for `fork`, both sides may later write
//! to every shared non-volatile page. The clone commits one credit per such
//! page up front and hands the credits to a [`CommittedCowTicket`] shared by
//! parent and child, so a COW fault on a non-volatile page never fails for
//! lack of memory.

use alloc::sync::Arc;
use kernel_alloc::{PhysicalPage, ShouldZeroFill, UserPhysicalPages};
use log::trace;

/// Owner of `n` committed page credits.
///
/// The count only goes down. Whatever is left when the ticket drops is
/// uncommitted again.
pub struct CommittedCowTicket {
    pool: Arc<UserPhysicalPages>,
    committed_pages: usize,
}

impl CommittedCowTicket {
    /// Take ownership of `committed_pages` credits the caller already
    /// committed against `pool`.
    #[must_use]
    pub const fn new(pool: Arc<UserPhysicalPages>, committed_pages: usize) -> Self {
        Self {
            pool,
            committed_pages,
        }
    }

    #[inline]
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.committed_pages
    }

    /// Spend one credit on a fresh zero-filled page.
    ///
    /// # Panics
    /// Panics if no credit remains.
    #[must_use]
    pub fn allocate_one(&mut self) -> PhysicalPage {
        assert!(self.committed_pages > 0, "COW ticket has no credits left");
        self.committed_pages -= 1;
        self.pool
            .allocate_committed_user_physical_page(ShouldZeroFill::Yes)
    }

    /// Give one credit back to the pool; the fault did not need a copy.
    ///
    /// Returns `true` if that was the last credit.
    ///
    /// # Panics
    /// Panics if no credit remains.
    pub fn return_one(&mut self) -> bool {
        assert!(self.committed_pages > 0, "COW ticket has no credits left");
        self.committed_pages -= 1;
        self.pool.uncommit_user_physical_pages(1);
        self.committed_pages == 0
    }
}

impl Drop for CommittedCowTicket {
    fn drop(&mut self) {
        if self.committed_pages > 0 {
            trace!(
                "COW ticket returning {} unused credits",
                self.committed_pages
            );
            self.pool
                .uncommit_user_physical_pages(self.committed_pages);
        }
    }
}

impl core::fmt::Debug for CommittedCowTicket {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CommittedCowTicket")
            .field("committed_pages", &self.committed_pages)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;
    use kernel_alloc::BitmapFrameAlloc;
    use kernel_memory_addresses::PhysicalAddress;

    fn pool(frames: usize) -> Arc<UserPhysicalPages> {
        UserPhysicalPages::new(BitmapFrameAlloc::new(PhysicalAddress::new(0x10_0000), frames))
    }

    #[test]
    fn credits_are_conserved() {
        let pool = pool(16);
        let before = pool.stats().committed;
        assert!(pool.commit_user_physical_pages(5));

        let mut ticket = CommittedCowTicket::new(Arc::clone(&pool), 5);
        let pages: Vec<_> = (0..2).map(|_| ticket.allocate_one()).collect();
        assert!(!ticket.return_one());
        assert_eq!(ticket.remaining(), 2);
        drop(ticket);

        // Two credits became pages, the other three went back.
        assert_eq!(pool.stats().committed, before);
        assert_eq!(pool.stats().used, 2);
        drop(pages);
        assert_eq!(pool.stats().uncommitted, 16);
    }

    #[test]
    fn return_one_reports_the_last_credit() {
        let pool = pool(4);
        assert!(pool.commit_user_physical_pages(2));
        let mut ticket = CommittedCowTicket::new(Arc::clone(&pool), 2);
        assert!(!ticket.return_one());
        assert!(ticket.return_one());
        drop(ticket);
        assert_eq!(pool.stats().committed, 0);
    }

    #[test]
    #[should_panic(expected = "no credits left")]
    fn allocating_without_credit_is_fatal() {
        let pool = pool(4);
        let mut ticket = CommittedCowTicket::new(pool, 0);
        let _ = ticket.allocate_one();
    }
}
