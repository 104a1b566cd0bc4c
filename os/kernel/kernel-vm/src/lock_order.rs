//! Lock levels of the virtual-memory core.
//!
//! | Level                 | Guards                                        |
//! |-----------------------|-----------------------------------------------|
//! | [`AddressSpaceLock`]  | an address space's regions and lookup cache   |
//! | [`VmObjectLock`]      | a memory object's page slots and commit state |
//! | [`PurgeableRangesLock`] | one controller's volatile range set         |
//! | [`PageDirectoryLock`] | software page tables                          |
//!
//! The object lock is always taken before any controller lock attached to
//! it: the fault path materializes pages under the object lock and consults
//! the controllers from there. The page-directory lock is innermost since
//! purging remaps pages while both of the others are held.

use kernel_sync::{Unlocked, lock_order};

pub struct AddressSpaceLock;
pub struct VmObjectLock;
pub struct PurgeableRangesLock;
pub struct PageDirectoryLock;

lock_order!(
    Unlocked => AddressSpaceLock => VmObjectLock => PurgeableRangesLock => PageDirectoryLock
);
