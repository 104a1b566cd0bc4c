//! # Virtual Memory Core
//!
//! Per-process address spaces and the purgeable-memory machinery behind
//! them.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ AddressSpace                                                 │
//! │   • PageDirectory (software page tables + range allocator)   │
//! │   • Regions: Arena<Region> + single-entry lookup cache       │
//! └──────────────┬───────────────────────────────────────────────┘
//!                │ one per mapping
//! ┌──────────────▼───────────────────────────────────────────────┐
//! │ Region                                                       │
//! │   • window [offset, offset + size) of a VmObject             │
//! │   • RegionFlags, per-page COW bits                           │
//! │   • PurgeableRangeController (anonymous memory only)         │
//! └──────────────┬───────────────────────────────────────────────┘
//!                │ shared
//! ┌──────────────▼───────────────────────────────────────────────┐
//! │ VmObject: AnonymousVmObject | InodeVmObject                  │
//! │   • page slots, lazy commits, CommittedCowTicket             │
//! └──────────────┬───────────────────────────────────────────────┘
//!                │ commit / allocate
//! ┌──────────────▼───────────────────────────────────────────────┐
//! │ kernel_alloc::UserPhysicalPages                              │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Locking
//!
//! Locks are [`OrderedLock`](kernel_sync::OrderedLock)s whose levels are
//! declared in [`lock_order`]. Taking them in the wrong order does not
//! compile:
//!
//! ```text
//! AddressSpaceLock → VmObjectLock → PurgeableRangesLock → PageDirectoryLock
//! ```
//!
//! The physical pool's spin lock is a leaf below all of them.
//!
//! ## Errors
//!
//! Running out of memory and bad arguments are reported as [`VmError`]
//! before anything is changed. Broken invariants panic.
//!
//! ## Example
//!
//! ```
//! use kernel_alloc::{BitmapFrameAlloc, UserPhysicalPages};
//! use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress};
//! use kernel_sync::LockToken;
//! use kernel_vm::{AddressSpace, AllocationStrategy, FaultAccess, RegionFlags};
//!
//! let pool = UserPhysicalPages::new(BitmapFrameAlloc::new(PhysicalAddress::new(0x100_0000), 64));
//! let space = AddressSpace::try_create(&pool, None).unwrap();
//! let range = space.allocate_range(None, 4 * PAGE_SIZE, PAGE_SIZE).unwrap();
//!
//! let root = LockToken::root();
//! let mut regions = space.lock(&root);
//! regions
//!     .allocate_region(
//!         range,
//!         Some("heap".into()),
//!         RegionFlags::read_write(),
//!         AllocationStrategy::Reserve,
//!     )
//!     .unwrap();
//! regions.handle_fault(range.base(), FaultAccess::Write).unwrap();
//! assert_eq!(regions.amount_resident(), PAGE_SIZE);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

extern crate alloc;

mod address_space;
mod arena;
mod bitmap;
mod committed_cow;
mod error;
pub mod lock_order;
mod page_directory;
mod purgeable;
mod range_allocator;
mod region;
mod vmobject;
mod volatile;

pub use address_space::{AddressSpace, AddressSpaceGuard, Regions};
pub use arena::{Arena, ArenaId};
pub use bitmap::Bitmap;
pub use committed_cow::CommittedCowTicket;
pub use error::VmError;
pub use page_directory::{PageDirectory, PageTableEntry};
pub use purgeable::{PurgeableRangeController, RemoveVolatileOutcome};
pub use range_allocator::{RangeAllocator, SharedRangeAllocator};
pub use region::{DeallocateRange, FaultAccess, Region, RegionFlags, RegionId, SetVolatileOutcome};
pub use vmobject::{AllocationStrategy, AnonymousVmObject, InodeVmObject, PageState, VmObject};
pub use volatile::{VolatilePageRange, VolatileRangeSet, count_nonvolatile, intersect_ranges};
