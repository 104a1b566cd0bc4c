use kernel_alloc::{BitmapFrameAlloc, ShouldZeroFill, UserPhysicalPages};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress};
use kernel_sync::LockToken;
use kernel_vm::{
    AllocationStrategy, AnonymousVmObject, InodeVmObject, PageState, PurgeableRangeController,
    RemoveVolatileOutcome, VmError, VmObject, VolatilePageRange,
};
use std::sync::Arc;

fn pool(frames: usize) -> Arc<UserPhysicalPages> {
    UserPhysicalPages::new(BitmapFrameAlloc::new(PhysicalAddress::new(0x100_0000), frames))
}

fn object(
    pool: &Arc<UserPhysicalPages>,
    pages: u64,
    strategy: AllocationStrategy,
) -> Arc<AnonymousVmObject> {
    AnonymousVmObject::try_create_with_size(pool, pages * PAGE_SIZE, strategy).unwrap()
}

fn r(base: usize, count: usize) -> VolatilePageRange {
    VolatilePageRange::new(base, count)
}

#[test]
fn non_anonymous_objects_track_nothing() {
    let root = LockToken::root();
    let inode: Arc<dyn VmObject> = InodeVmObject::new(4 * PAGE_SIZE);
    let controller = PurgeableRangeController::new(&inode);
    assert!(controller.vmobject().is_none());
    assert!(!controller.add_volatile_range(&root, r(0, 4)));
    assert!(controller.is_empty());
    assert_eq!(controller.volatile_ranges().total_pages(), 0);
    assert_eq!(
        controller.remove_volatile_range(&root, r(0, 4)),
        Ok(RemoveVolatileOutcome::SuccessNoChange)
    );
}

#[test]
fn volatile_lazy_commits_go_back_to_the_pool() {
    let root = LockToken::root();
    let pool = pool(32);
    let object = object(&pool, 8, AllocationStrategy::Reserve);
    assert_eq!(pool.stats().committed, 8);

    let controller = PurgeableRangeController::for_anonymous(Arc::clone(&object));
    assert!(controller.add_volatile_range(&root, r(2, 4)));
    assert_eq!(object.unused_committed_pages(&root), 4);
    assert_eq!(pool.stats().committed, 4);
    assert!(controller.is_volatile(2));
    assert!(!controller.is_volatile(6));
    assert!(controller.is_volatile_range(r(0, 3)));

    assert_eq!(
        controller.remove_volatile_range(&root, r(0, 8)),
        Ok(RemoveVolatileOutcome::Success { was_purged: false })
    );
    assert_eq!(object.unused_committed_pages(&root), 8);
    assert_eq!(pool.stats().committed, 8);
    assert_eq!(
        controller.remove_volatile_range(&root, r(0, 8)),
        Ok(RemoveVolatileOutcome::SuccessNoChange)
    );

    drop(controller);
    drop(object);
    assert_eq!(pool.stats().committed, 0);
}

#[test]
fn failed_commit_changes_nothing() {
    let root = LockToken::root();
    let pool = pool(8);
    let object = object(&pool, 8, AllocationStrategy::Reserve);
    let controller = PurgeableRangeController::for_anonymous(Arc::clone(&object));
    assert!(controller.add_volatile_range(&root, r(0, 8)));
    assert_eq!(pool.stats().uncommitted, 8);

    let mut hog: Vec<_> = (0..8)
        .map(|_| pool.allocate_user_physical_page(ShouldZeroFill::No).unwrap())
        .collect();
    let ranges_before = controller.volatile_ranges();
    let stats_before = pool.stats();

    assert_eq!(
        controller.remove_volatile_range(&root, r(0, 8)),
        Err(VmError::OutOfMemory)
    );
    assert_eq!(controller.volatile_ranges(), ranges_before);
    assert_eq!(pool.stats(), stats_before);
    assert_eq!(object.unused_committed_pages(&root), 0);
    assert_eq!(
        object.page_states(0, 8),
        vec![PageState::SharedZero; 8],
        "no page was marked"
    );

    hog.truncate(4);
    assert_eq!(
        controller.remove_volatile_range(&root, r(0, 4)),
        Ok(RemoveVolatileOutcome::Success { was_purged: false })
    );
    assert_eq!(object.unused_committed_pages(&root), 4);
    assert_eq!(controller.volatile_ranges().ranges(), &[r(4, 4)]);
}

#[test]
fn purge_needs_every_view_to_agree() {
    let root = LockToken::root();
    let pool = pool(32);
    let object = object(&pool, 4, AllocationStrategy::None);
    let a = PurgeableRangeController::for_anonymous(Arc::clone(&object));
    let b = PurgeableRangeController::for_anonymous(Arc::clone(&object));
    for page in 0..4 {
        object.fault_in_page(&root, page).unwrap();
    }
    assert_eq!(pool.stats().used, 4);

    a.add_volatile_range(&root, r(0, 4));
    b.add_volatile_range(&root, r(2, 2));
    assert_eq!(object.purge(&root), 2);
    assert_eq!(pool.stats().used, 2);

    let states = object.page_states(0, 4);
    assert!(states[0].is_resident() && states[1].is_resident());
    assert_eq!(&states[2..], &[PageState::SharedZero, PageState::SharedZero]);
    assert!(!a.is_purged(1));
    assert!(a.is_purged(2));
    assert!(b.is_purged(3));

    assert_eq!(
        b.remove_volatile_range(&root, r(2, 2)),
        Ok(RemoveVolatileOutcome::Success { was_purged: true })
    );
    assert_eq!(object.unused_committed_pages(&root), 2);
    assert_eq!(object.purge(&root), 0);
}

#[test]
fn detached_views_no_longer_block_purging() {
    let root = LockToken::root();
    let pool = pool(16);
    let object = object(&pool, 4, AllocationStrategy::None);
    let a = PurgeableRangeController::for_anonymous(Arc::clone(&object));
    let b = PurgeableRangeController::for_anonymous(Arc::clone(&object));
    for page in 0..4 {
        object.fault_in_page(&root, page).unwrap();
    }
    a.add_volatile_range(&root, r(0, 4));
    assert_eq!(object.purge(&root), 0, "b still needs the pages");

    drop(b);
    assert_eq!(object.purge(&root), 4);
    assert_eq!(pool.stats().used, 0);
}

#[test]
fn set_was_purged_is_reported_on_removal() {
    let root = LockToken::root();
    let pool = pool(16);
    let object = object(&pool, 4, AllocationStrategy::Reserve);
    let controller = PurgeableRangeController::for_anonymous(Arc::clone(&object));
    controller.add_volatile_range(&root, r(0, 4));
    controller.set_was_purged(&root, r(1, 1));
    assert_eq!(
        controller.volatile_ranges().ranges(),
        &[r(0, 1), r(1, 1).with_purged(true), r(2, 2)]
    );
    assert_eq!(
        controller.remove_volatile_range(&root, r(0, 4)),
        Ok(RemoveVolatileOutcome::Success { was_purged: true })
    );
    assert_eq!(object.unused_committed_pages(&root), 4);
}

#[test]
fn copied_ranges_are_independent() {
    let root = LockToken::root();
    let pool = pool(16);
    let object = object(&pool, 8, AllocationStrategy::None);
    let a = PurgeableRangeController::for_anonymous(Arc::clone(&object));
    let b = PurgeableRangeController::for_anonymous(Arc::clone(&object));
    a.add_volatile_range(&root, r(0, 3));
    b.copy_purgeable_page_ranges(&root, &a);
    assert_eq!(b.volatile_ranges(), a.volatile_ranges());

    b.add_volatile_range(&root, r(5, 1));
    assert!(!a.is_volatile(5));
}

#[test]
fn out_of_memory_zero_fault_is_reported() {
    let root = LockToken::root();
    let pool = pool(1);
    let object = object(&pool, 2, AllocationStrategy::None);
    object.fault_in_page(&root, 0).unwrap();
    assert_eq!(object.fault_in_page(&root, 1), Err(VmError::OutOfMemory));
}

#[test]
fn empty_ranges_change_nothing() {
    let root = LockToken::root();
    let pool = pool(16);
    let object = object(&pool, 4, AllocationStrategy::Reserve);
    let controller = PurgeableRangeController::for_anonymous(Arc::clone(&object));
    assert!(controller.add_volatile_range(&root, r(0, 4)));
    let stats = pool.stats();

    assert!(!controller.add_volatile_range(&root, r(2, 0)));
    assert_eq!(
        controller.remove_volatile_range(&root, r(2, 0)),
        Ok(RemoveVolatileOutcome::SuccessNoChange)
    );
    assert_eq!(
        controller.remove_volatile_range(&root, r(4, 10)),
        Ok(RemoveVolatileOutcome::SuccessNoChange),
        "outside the object"
    );
    assert_eq!(controller.volatile_ranges().ranges(), &[r(0, 4)]);
    assert_eq!(pool.stats(), stats);
}
