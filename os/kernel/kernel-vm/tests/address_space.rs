use kernel_alloc::{BitmapFrameAlloc, ShouldZeroFill, UserPhysicalPages};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress, VirtualRange};
use kernel_sync::LockToken;
use kernel_vm::{
    AddressSpace, AllocationStrategy, AnonymousVmObject, DeallocateRange, FaultAccess,
    InodeVmObject, Region, RegionFlags, SetVolatileOutcome, VmError, VmObject,
};
use proptest::prelude::*;
use std::sync::Arc;

const BASE: u64 = 0x100_0000;

fn pool(frames: usize) -> Arc<UserPhysicalPages> {
    UserPhysicalPages::new(BitmapFrameAlloc::new(PhysicalAddress::new(0x1000_0000), frames))
}

fn pages(first: u64, count: u64) -> VirtualRange {
    VirtualRange::new(VirtualAddress::new(BASE + first * PAGE_SIZE), count * PAGE_SIZE)
}

fn page(index: u64) -> VirtualAddress {
    VirtualAddress::new(BASE + index * PAGE_SIZE)
}

/// Reserve `range` in the space's allocator, as a syscall would.
fn reserve(space: &AddressSpace, range: VirtualRange) -> VirtualRange {
    space
        .allocate_range(Some(range.base()), range.size(), PAGE_SIZE)
        .unwrap()
}

fn assert_disjoint(regions: &[&Region]) {
    for (i, a) in regions.iter().enumerate() {
        for b in &regions[i + 1..] {
            assert!(!a.range().intersects(&b.range()), "{a:?} overlaps {b:?}");
        }
    }
}

#[test]
fn exact_lookup_uses_and_invalidates_the_cache() {
    let pool = pool(64);
    let space = AddressSpace::try_create(&pool, None).unwrap();
    let range = space.allocate_range(None, 3 * PAGE_SIZE - 1, PAGE_SIZE).unwrap();
    assert_eq!(range.size(), 3 * PAGE_SIZE);

    let root = LockToken::root();
    let mut regions = space.lock(&root);
    let name = Some("data".into());
    let id = regions
        .allocate_region(range, name, RegionFlags::read_write(), AllocationStrategy::Reserve)
        .unwrap()
        .id();

    let query = VirtualRange::new(range.base(), 2 * PAGE_SIZE + 1);
    assert_eq!(regions.find_region_from_range(query).map(Region::id), Some(id));
    assert_eq!(regions.cached_lookup(), Some((range, id)));
    assert_eq!(regions.find_region_from_range(query).map(Region::name), Some(Some("data")));

    assert!(regions.deallocate_region(id));
    assert_eq!(regions.cached_lookup(), None);
    assert!(regions.find_region_from_range(range).is_none());
    assert!(!regions.deallocate_region(id));
    drop(regions);

    assert_eq!(
        space.allocate_range(Some(range.base()), range.size(), PAGE_SIZE),
        Some(range),
        "range went back to the allocator"
    );
    assert_eq!(pool.stats().committed, 0);
}

#[test]
fn containing_and_intersecting_lookups() {
    let pool = pool(64);
    let space = AddressSpace::try_create(&pool, None).unwrap();
    let root = LockToken::root();
    let mut regions = space.lock(&root);
    for (first, count) in [(0, 4), (4, 4), (10, 2)] {
        let range = reserve(&space, pages(first, count));
        regions
            .allocate_region(range, None, RegionFlags::read_write(), AllocationStrategy::None)
            .unwrap();
    }

    assert_eq!(
        regions.find_region_containing(pages(5, 2)).map(Region::range),
        Some(pages(4, 4))
    );
    assert!(regions.find_region_containing(pages(3, 2)).is_none());

    let hit: Vec<_> = regions
        .find_regions_intersecting(pages(2, 9))
        .into_iter()
        .map(Region::range)
        .collect();
    assert_eq!(hit, [pages(0, 4), pages(4, 4), pages(10, 2)]);
    assert!(regions.find_regions_intersecting(pages(8, 2)).is_empty());
}

#[test]
fn region_creation_is_validated() {
    let pool = pool(64);
    let space = AddressSpace::try_create(&pool, None).unwrap();
    let root = LockToken::root();
    let mut regions = space.lock(&root);
    let range = reserve(&space, pages(0, 4));
    regions
        .allocate_region(range, None, RegionFlags::read_write(), AllocationStrategy::None)
        .unwrap();

    let flags = RegionFlags::read_write();
    assert_eq!(
        regions
            .allocate_region(pages(2, 4), None, flags, AllocationStrategy::None)
            .map(Region::id),
        Err(VmError::RangeOccupied(pages(2, 4)))
    );

    let object: Arc<dyn VmObject> = InodeVmObject::new(4 * PAGE_SIZE);
    let flags = RegionFlags::new().with_read(true);
    let mut with_offset = |offset| {
        regions
            .allocate_region_with_object(
                pages(8, 2),
                Arc::clone(&object),
                offset,
                None,
                flags,
                true,
            )
            .map(Region::id)
    };
    assert!(matches!(with_offset(3 * PAGE_SIZE), Err(VmError::OffsetOutOfBounds { .. })));
    assert!(matches!(
        with_offset(u64::MAX - PAGE_SIZE),
        Err(VmError::OffsetOutOfBounds { .. })
    ));
    assert!(matches!(with_offset(100), Err(VmError::InvalidRange { .. })));

    let target = reserve(&space, pages(8, 2));
    let region = regions
        .allocate_region_with_object(target, object, 2 * PAGE_SIZE, None, flags, true)
        .unwrap();
    assert_eq!(region.first_page_index(), 2);
    assert!(region.is_shared());
    assert_eq!(regions.len(), 2);
}

#[test]
fn split_keeps_offsets_and_cow_bits() {
    let pool = pool(64);
    let space = AddressSpace::try_create(&pool, None).unwrap();
    let object =
        AnonymousVmObject::try_create_with_size(&pool, 140 * PAGE_SIZE, AllocationStrategy::None)
            .unwrap();
    let root = LockToken::root();
    let mut regions = space.lock(&root);

    let range = reserve(&space, pages(100, 100));
    let flags = RegionFlags::read_write();
    let id = regions
        .allocate_region_with_object(range, object, 40 * PAGE_SIZE, None, flags, false)
        .unwrap()
        .id();
    let original = regions.region_mut(id).unwrap();
    for index in [29, 30, 50, 99] {
        original.set_should_cow(index, true);
    }

    let pieces: Vec<_> = regions
        .split_region_around_range(id, pages(130, 20))
        .into_iter()
        .map(|r| (r.range(), r.offset_in_vmobject(), r.id()))
        .collect();
    assert_eq!(pieces.len(), 2);
    assert_eq!((pieces[0].0, pieces[0].1), (pages(100, 30), 40 * PAGE_SIZE));
    assert_eq!((pieces[1].0, pieces[1].1), (pages(150, 50), 90 * PAGE_SIZE));

    let left = regions.region(pieces[0].2).unwrap();
    assert!(left.should_cow(29));
    assert!(!left.should_cow(28));
    let right = regions.region(pieces[1].2).unwrap();
    assert!(right.should_cow(0));
    assert!(!right.should_cow(1));
    assert!(right.should_cow(49));

    let mut original = regions.take_region(id).unwrap();
    original.unmap(&LockToken::root(), DeallocateRange::No);
    drop(original);
    assert_disjoint(&regions.iter().collect::<Vec<_>>());
}

#[test]
fn unmapped_pieces_still_return_their_range() {
    let pool = pool(16);
    let space = AddressSpace::try_create(&pool, None).unwrap();
    let root = LockToken::root();
    let mut regions = space.lock(&root);
    let range = reserve(&space, pages(0, 6));
    let id = regions
        .allocate_region(range, None, RegionFlags::read_write(), AllocationStrategy::None)
        .unwrap()
        .id();

    let pieces: Vec<_> = regions
        .split_region_around_range(id, pages(2, 2))
        .into_iter()
        .map(|piece| {
            assert!(!piece.is_mapped());
            assert!(piece.owns_range());
            piece.id()
        })
        .collect();
    assert_eq!(pieces.len(), 2);

    let mut original = regions.take_region(id).unwrap();
    original.unmap(regions.token(), DeallocateRange::No);
    assert!(!original.owns_range());
    drop(original);
    assert_eq!(
        space.allocate_range(Some(page(0)), 6 * PAGE_SIZE, PAGE_SIZE),
        None,
        "the middle now belongs to the caller"
    );

    for piece in pieces {
        drop(regions.take_region(piece));
    }
    assert_eq!(
        space.allocate_range(Some(page(0)), 2 * PAGE_SIZE, PAGE_SIZE),
        Some(pages(0, 2))
    );
    assert_eq!(
        space.allocate_range(Some(page(4)), 2 * PAGE_SIZE, PAGE_SIZE),
        Some(pages(4, 2))
    );
}

#[test]
fn unmapping_the_middle_of_a_region() {
    let pool = pool(64);
    let space = AddressSpace::try_create(&pool, None).unwrap();
    let root = LockToken::root();
    let mut regions = space.lock(&root);
    let range = reserve(&space, pages(0, 10));
    regions
        .allocate_region(range, None, RegionFlags::read_write(), AllocationStrategy::Reserve)
        .unwrap();
    for index in 0..10 {
        regions.handle_fault(page(index), FaultAccess::Write).unwrap();
    }
    assert_eq!(space.page_directory().mapped_pages(), 10);

    regions.unmap_range(page(3) + 0x10, 2 * PAGE_SIZE - 0x20).unwrap();
    let ranges: Vec<_> = regions.iter().map(Region::range).collect();
    assert_eq!(ranges.len(), 2);
    assert!(ranges.contains(&pages(0, 3)));
    assert!(ranges.contains(&pages(5, 5)));

    let pd = space.page_directory();
    assert!(pd.translate(page(2)).is_some());
    assert!(pd.translate(page(3)).is_none());
    assert!(pd.translate(page(4)).is_none());
    assert!(pd.translate(page(5)).is_some());
    assert_eq!(pd.mapped_pages(), 8);
    assert_eq!(regions.amount_resident(), 8 * PAGE_SIZE);
    assert_eq!(regions.amount_virtual(), 8 * PAGE_SIZE);
    drop(regions);

    assert_eq!(
        space.allocate_range(Some(page(3)), 2 * PAGE_SIZE, PAGE_SIZE),
        Some(pages(3, 2))
    );
}

#[test]
fn unmapping_across_regions() {
    let pool = pool(64);
    let space = AddressSpace::try_create(&pool, None).unwrap();
    let root = LockToken::root();
    let mut regions = space.lock(&root);
    for first in [0, 4] {
        let range = reserve(&space, pages(first, 4));
        regions
            .allocate_region(range, None, RegionFlags::read_write(), AllocationStrategy::None)
            .unwrap();
    }

    regions.unmap_range(page(2), 4 * PAGE_SIZE).unwrap();
    let mut ranges: Vec<_> = regions.iter().map(Region::range).collect();
    ranges.sort_by_key(|r| r.base());
    assert_eq!(ranges, [pages(0, 2), pages(6, 2)]);

    assert_eq!(
        regions.unmap_range(page(3), PAGE_SIZE),
        Err(VmError::NoSuchRegion(page(3)))
    );
    assert!(matches!(regions.unmap_range(page(0), 0), Err(VmError::InvalidRange { .. })));

    regions.unmap_range(page(0), 2 * PAGE_SIZE).unwrap();
    assert_eq!(regions.len(), 1);
}

#[test]
fn faults_respect_permissions() {
    let pool = pool(64);
    let space = AddressSpace::try_create(&pool, None).unwrap();
    let root = LockToken::root();
    let mut regions = space.lock(&root);
    let range = reserve(&space, pages(0, 2));
    let flags = RegionFlags::new().with_read(true);
    regions
        .allocate_region(range, None, flags, AllocationStrategy::None)
        .unwrap();

    assert_eq!(
        regions.handle_fault(page(0), FaultAccess::Write),
        Err(VmError::AccessViolation(page(0)))
    );
    assert_eq!(
        regions.handle_fault(page(0), FaultAccess::Execute),
        Err(VmError::AccessViolation(page(0)))
    );
    assert_eq!(
        regions.handle_fault(page(7), FaultAccess::Read),
        Err(VmError::NoSuchRegion(page(7)))
    );

    regions.handle_fault(page(1), FaultAccess::Read).unwrap();
    let entry = space.page_directory().entry(page(1)).unwrap();
    assert!(entry.user_access());
    assert!(!entry.writable());
    assert!(entry.no_execute());
}

#[test]
fn volatile_ranges_round_to_pages() {
    let pool = pool(64);
    let space = AddressSpace::try_create(&pool, None).unwrap();
    let root = LockToken::root();
    let mut regions = space.lock(&root);
    let range = reserve(&space, pages(0, 4));
    let id = regions
        .allocate_region(range, None, RegionFlags::read_write(), AllocationStrategy::Reserve)
        .unwrap()
        .id();
    let token = regions.token();
    let region = regions.region(id).unwrap();
    let controller = region.purgeable().unwrap();

    let outcome = region.set_volatile(token, page(0) + 100, 2 * PAGE_SIZE, true).unwrap();
    assert!(outcome.changed);
    assert!(!controller.is_volatile(0));
    assert!(controller.is_volatile(1));
    assert!(!controller.is_volatile(2));
    assert_eq!(pool.stats().committed, 3);

    let outcome = region.set_volatile(token, page(0) + 100, 10, false).unwrap();
    assert!(!outcome.changed);
    let outcome = region.set_volatile(token, page(1) + 5, 1, false).unwrap();
    assert!(outcome.changed);
    assert!(!outcome.was_purged);
    assert!(controller.is_empty());
    assert_eq!(pool.stats().committed, 4);

    assert!(matches!(
        region.set_volatile(token, page(3), 2 * PAGE_SIZE, true),
        Err(VmError::InvalidRange { .. })
    ));
}

#[test]
fn zero_byte_volatility_changes_nothing() {
    let pool = pool(16);
    let space = AddressSpace::try_create(&pool, None).unwrap();
    let root = LockToken::root();
    let mut regions = space.lock(&root);
    let range = reserve(&space, pages(0, 4));
    let id = regions
        .allocate_region(range, None, RegionFlags::read_write(), AllocationStrategy::Reserve)
        .unwrap()
        .id();
    let token = regions.token();
    let region = regions.region(id).unwrap();
    region.set_volatile(token, page(0), 4 * PAGE_SIZE, true).unwrap();
    let stats = pool.stats();

    for vaddr in [page(0), page(2) + 0x80, page(4)] {
        for volatile in [false, true] {
            assert_eq!(
                region.set_volatile(token, vaddr, 0, volatile),
                Ok(SetVolatileOutcome::default()),
                "{vaddr} volatile={volatile}"
            );
        }
    }
    assert_eq!(region.purgeable().unwrap().volatile_ranges().len(), 1);
    assert_eq!(pool.stats(), stats);
}

#[test]
fn purged_pages_fault_until_made_nonvolatile() {
    let pool = pool(64);
    let space = AddressSpace::try_create(&pool, None).unwrap();
    let root = LockToken::root();
    let mut regions = space.lock(&root);
    let range = reserve(&space, pages(0, 2));
    let id = regions
        .allocate_region(range, None, RegionFlags::read_write(), AllocationStrategy::Reserve)
        .unwrap()
        .id();
    regions.handle_fault(page(0), FaultAccess::Write).unwrap();
    regions.handle_fault(page(1), FaultAccess::Write).unwrap();

    let region = regions.region(id).unwrap();
    region.set_volatile(regions.token(), page(0), 2 * PAGE_SIZE, true).unwrap();
    assert_eq!(regions.amount_purgeable_volatile(), 2 * PAGE_SIZE);
    assert_eq!(regions.amount_purgeable_nonvolatile(), 0);

    let object = Arc::clone(regions.region(id).unwrap().anonymous().unwrap());
    assert_eq!(object.purge(regions.token()), 2);
    assert!(space.page_directory().translate(page(0)).is_none());
    assert_eq!(
        regions.handle_fault(page(0), FaultAccess::Read),
        Err(VmError::VolatileAccess(page(0)))
    );

    let outcome = regions
        .region(id)
        .unwrap()
        .set_volatile(regions.token(), page(0), 2 * PAGE_SIZE, false)
        .unwrap();
    assert!(outcome.was_purged);
    regions.handle_fault(page(0), FaultAccess::Read).unwrap();
    assert!(space.page_directory().translate(page(0)).is_some());
    assert_eq!(regions.amount_purgeable_nonvolatile(), PAGE_SIZE);
}

#[test]
fn statistics() {
    let pool = pool(64);
    let space = AddressSpace::try_create(&pool, None).unwrap();
    let root = LockToken::root();
    let mut regions = space.lock(&root);

    let file = InodeVmObject::new(2 * PAGE_SIZE);
    for index in 0..2 {
        let frame = pool.allocate_user_physical_page(ShouldZeroFill::No).unwrap();
        file.set_page(index, frame, false);
    }
    assert!(file.mark_dirty(1));
    let file: Arc<dyn VmObject> = file;
    let flags = RegionFlags::new().with_read(true);
    for first in [0, 8] {
        let range = reserve(&space, pages(first, 2));
        regions
            .allocate_region_with_object(range, Arc::clone(&file), 0, None, flags, true)
            .unwrap();
    }

    let range = reserve(&space, pages(4, 3));
    regions
        .allocate_region(range, None, RegionFlags::read_write(), AllocationStrategy::None)
        .unwrap();
    regions.handle_fault(page(4), FaultAccess::Write).unwrap();
    regions.handle_fault(page(5), FaultAccess::Write).unwrap();

    assert_eq!(regions.amount_virtual(), 7 * PAGE_SIZE);
    assert_eq!(regions.amount_clean_inode(), PAGE_SIZE, "the file is counted once");
    assert_eq!(regions.amount_resident(), 6 * PAGE_SIZE);
    assert_eq!(regions.amount_dirty_private(), 2 * PAGE_SIZE);
    assert_eq!(regions.amount_purgeable_nonvolatile(), 2 * PAGE_SIZE);
    assert_eq!(regions.amount_purgeable_volatile(), 0);
    assert_eq!(regions.amount_shared(), 0);

    regions.remove_all_regions();
    assert!(regions.is_empty());
    assert_eq!(regions.amount_virtual(), 0);
    assert_eq!(space.page_directory().mapped_pages(), 0);
}

#[test]
fn set_volatile_needs_anonymous_memory() {
    let pool = pool(16);
    let space = AddressSpace::try_create(&pool, None).unwrap();
    let root = LockToken::root();
    let mut regions = space.lock(&root);
    let range = reserve(&space, pages(0, 1));
    let flags = RegionFlags::new().with_read(true);
    let region = regions
        .allocate_region_with_object(range, InodeVmObject::new(PAGE_SIZE), 0, None, flags, false)
        .unwrap();
    assert_eq!(
        region.set_volatile(&root, page(0), PAGE_SIZE, true),
        Err(VmError::NotAnonymous)
    );
}

#[derive(Debug, Clone)]
enum Op {
    Allocate { first: u64, count: u64 },
    Deallocate(usize),
    Unmap { first: u64, count: u64 },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..48_u64, 1..8_u64).prop_map(|(first, count)| Op::Allocate { first, count }),
        (0..16_usize).prop_map(Op::Deallocate),
        (0..48_u64, 1..8_u64).prop_map(|(first, count)| Op::Unmap { first, count }),
    ]
}

proptest! {
    #[test]
    fn regions_never_overlap(ops in prop::collection::vec(op(), 1..32)) {
        let pool = pool(16);
        let space = AddressSpace::try_create(&pool, None).unwrap();
        let root = LockToken::root();
        let mut regions = space.lock(&root);

        for op in ops {
            match op {
                Op::Allocate { first, count } => {
                    let size = count * PAGE_SIZE;
                    if let Some(range) = space.allocate_range(Some(page(first)), size, PAGE_SIZE) {
                        let flags = RegionFlags::read_write();
                        regions
                            .allocate_region(range, None, flags, AllocationStrategy::None)
                            .unwrap();
                    }
                }
                Op::Deallocate(n) => {
                    let ids: Vec<_> = regions.iter().map(Region::id).collect();
                    if !ids.is_empty() {
                        prop_assert!(regions.deallocate_region(ids[n % ids.len()]));
                    }
                }
                Op::Unmap { first, count } => {
                    let _ = regions.unmap_range(page(first), count * PAGE_SIZE);
                }
            }
            assert_disjoint(&regions.iter().collect::<Vec<_>>());
        }

        let mapped: u64 = regions.amount_virtual();
        drop(regions);
        let free: u64 = space
            .page_directory()
            .range_allocator()
            .snapshot()
            .available_ranges()
            .iter()
            .map(VirtualRange::size)
            .sum();
        let total = space.page_directory().range_allocator().snapshot().total_range().size();
        prop_assert_eq!(free + mapped, total);
    }
}
