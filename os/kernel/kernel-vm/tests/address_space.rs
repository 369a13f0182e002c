//! Region bookkeeping: mapping, unmapping and the program break.

use kernel_info::memory::USER_MMAP_TOP;
use kernel_memory_addresses::{PAGE_SIZE, PageRange, VirtualAddress};
use kernel_vm::{Access, FaultError, MapRequest, Violation, VmError, VmFlags, VmSpace};
use kernel_vmem::testing::TestMachine;

const HEAP: VirtualAddress = VirtualAddress::new(0x1000_0000);

fn read_byte(space: &VmSpace, va: VirtualAddress) -> u8 {
    let mut b = [0u8; 1];
    space.copy_in(va, &mut b).expect("copy_in");
    b[0]
}

#[test]
fn anonymous_maps_grow_down_from_the_ceiling() {
    let machine = TestMachine::small();
    let space = VmSpace::new(machine.paging).expect("space");

    let a = space
        .map(MapRequest::anonymous(3 * PAGE_SIZE, VmFlags::URW))
        .expect("map");
    let b = space
        .map(MapRequest::anonymous(100, VmFlags::UR))
        .expect("map");
    assert_eq!(a.as_u64(), USER_MMAP_TOP - 3 * PAGE_SIZE);
    assert_eq!(b.as_u64(), a.as_u64() - PAGE_SIZE);

    let info = space.find(a + PAGE_SIZE).expect("region");
    assert_eq!(info.range, PageRange::covering(a, 3 * PAGE_SIZE));
    assert_eq!(info.flags, VmFlags::URW);
    assert_eq!(info.object, None);
    assert_eq!(info.private_pages, 0);
    assert_eq!(space.regions().len(), 2);
    assert_eq!(space.resident_pages(), 0);
    assert!(space.find(a + 3 * PAGE_SIZE).is_none());
}

#[test]
fn bad_requests_are_rejected() {
    let machine = TestMachine::small();
    let space = VmSpace::new(machine.paging).expect("space");
    assert_eq!(
        space.map(MapRequest::anonymous(0, VmFlags::URW)),
        Err(VmError::InvalidRange)
    );
    assert_eq!(
        space.map(MapRequest::anonymous(PAGE_SIZE, VmFlags::URW).at(VirtualAddress::new(0x40_0010))),
        Err(VmError::InvalidRange)
    );
    assert_eq!(
        space.map(MapRequest::anonymous(PAGE_SIZE, VmFlags::URW).at(VirtualAddress::zero())),
        Err(VmError::InvalidRange)
    );
    assert_eq!(
        space.map(MapRequest::anonymous(USER_MMAP_TOP, VmFlags::URW)),
        Err(VmError::NoSpace)
    );
    assert!(space.regions().is_empty());
}

#[test]
fn unmapping_the_middle_splits_the_region() {
    let machine = TestMachine::small();
    let space = VmSpace::new(machine.paging).expect("space");
    let base = space
        .map(MapRequest::anonymous(4 * PAGE_SIZE, VmFlags::URW))
        .expect("map");
    for page in 0..4u8 {
        space
            .copy_out(base + u64::from(page) * PAGE_SIZE, &[page + 1])
            .expect("write");
    }

    space
        .unmap(PageRange::covering(base + PAGE_SIZE, 2 * PAGE_SIZE))
        .expect("unmap");

    let regions = space.regions();
    assert_eq!(regions.len(), 2);
    assert_eq!(regions[0].range, PageRange::covering(base, PAGE_SIZE));
    assert_eq!(regions[0].private_pages, 1);
    assert_eq!(regions[1].range, PageRange::covering(base + 3 * PAGE_SIZE, PAGE_SIZE));
    assert_eq!(regions[1].offset, 3 * PAGE_SIZE);
    assert_eq!(regions[1].private_pages, 1);
    assert_eq!(space.resident_pages(), 2);
    assert_eq!(read_byte(&space, base), 1);
    assert_eq!(read_byte(&space, base + 3 * PAGE_SIZE), 4);
    assert!(space.copy_in(base + PAGE_SIZE, &mut [0u8; 1]).is_err());
}

#[test]
fn unmap_returns_every_frame_and_table() {
    let machine = TestMachine::small();
    let space = VmSpace::new(machine.paging).expect("space");
    let free = machine.free_bytes();

    let base = space
        .map(MapRequest::anonymous(3 * PAGE_SIZE, VmFlags::URW))
        .expect("map");
    let range = PageRange::covering(base, 3 * PAGE_SIZE);
    space.prefault(range, Access::Write).expect("prefault");
    space.copy_out(base, b"dirty").expect("write");
    assert_eq!(space.resident_pages(), 3);
    assert!(space.pmap().table_frames() > 0);

    space.unmap(range).expect("unmap");
    assert_eq!(space.resident_pages(), 0);
    assert_eq!(space.pmap().table_frames(), 0);
    assert!(space.regions().is_empty());
    assert_eq!(machine.free_bytes(), free);

    // Holes are fine, and nothing changes.
    space.unmap(range).expect("unmap again");
    assert_eq!(machine.free_bytes(), free);

    let again = space
        .map(MapRequest::anonymous(PAGE_SIZE, VmFlags::URW).at(base))
        .expect("remap");
    assert_eq!(again, base);
    assert_eq!(read_byte(&space, base), 0);
}

#[test]
fn fixed_maps_replace_what_was_there() {
    let machine = TestMachine::small();
    let space = VmSpace::new(machine.paging).expect("space");
    let base = VirtualAddress::new(0x40_0000);
    space
        .map(MapRequest::anonymous(4 * PAGE_SIZE, VmFlags::URW).at(base))
        .expect("map");
    space
        .prefault(PageRange::covering(base, 4 * PAGE_SIZE), Access::Write)
        .expect("prefault");
    space.copy_out(base, &[0x11]).expect("write");
    space.copy_out(base + PAGE_SIZE, &[0x22]).expect("write");

    let hole = base + PAGE_SIZE;
    space
        .map(MapRequest::anonymous(PAGE_SIZE, VmFlags::UR).at(hole))
        .expect("fixed map");

    assert_eq!(space.regions().len(), 3);
    assert_eq!(space.find(hole).expect("region").flags, VmFlags::UR);
    assert_eq!(read_byte(&space, base), 0x11);
    assert_eq!(read_byte(&space, hole), 0);
    assert_eq!(space.resident_pages(), 4);
}

#[test]
fn dropping_a_space_frees_everything() {
    let machine = TestMachine::small();
    let free = machine.free_bytes();
    let space = VmSpace::new(machine.paging).expect("space");
    for _ in 0..3 {
        let base = space
            .map(MapRequest::anonymous(5 * PAGE_SIZE, VmFlags::URW))
            .expect("map");
        space
            .prefault(PageRange::covering(base, 5 * PAGE_SIZE), Access::Write)
            .expect("prefault");
    }
    assert!(machine.free_bytes() < free);
    drop(space);
    assert_eq!(machine.free_bytes(), free);
}

#[test]
fn sbrk_grows_and_shrinks_the_heap() {
    let machine = TestMachine::small();
    let space = VmSpace::new(machine.paging).expect("space");
    assert_eq!(space.sbrk(1), Err(VmError::InvalidRange));
    space.set_heap(HEAP).expect("heap");

    assert_eq!(space.sbrk(0), Ok(HEAP));
    assert_eq!(space.sbrk(5000), Ok(HEAP));
    assert_eq!(space.heap_break(), Some(HEAP + 5000));
    space.copy_out(HEAP + 4999, &[7]).expect("write at the break");

    // Still inside the second page.
    space.sbrk(3000).expect("sbrk");
    assert_eq!(space.regions().len(), 1);
    assert_eq!(space.find(HEAP).expect("heap").range.len(), 2);

    space.sbrk(200).expect("sbrk");
    let heap = space.find(HEAP).expect("heap");
    assert_eq!(space.regions().len(), 1);
    assert_eq!(heap.range, PageRange::covering(HEAP, 3 * PAGE_SIZE));
    assert_eq!(read_byte(&space, HEAP + 4999), 7);

    assert_eq!(space.sbrk(-8200), Ok(HEAP + 8200));
    assert_eq!(space.heap_break(), Some(HEAP));
    assert!(space.regions().is_empty());
    assert_eq!(space.resident_pages(), 0);
    assert_eq!(space.sbrk(-1), Err(VmError::InvalidRange));
}

#[test]
fn sbrk_stops_at_other_regions() {
    let machine = TestMachine::small();
    let space = VmSpace::new(machine.paging).expect("space");
    space.set_heap(HEAP).expect("heap");
    space
        .map(MapRequest::anonymous(PAGE_SIZE, VmFlags::UR).at(HEAP + 2 * PAGE_SIZE))
        .expect("map");

    space.sbrk(8192).expect("fits");
    assert_eq!(space.sbrk(1), Err(VmError::NoSpace));
    assert_eq!(space.heap_break(), Some(HEAP + 2 * PAGE_SIZE));
    assert_eq!(space.set_heap(HEAP + 2 * PAGE_SIZE), Err(VmError::Overlap));
}

#[test]
fn buffers_wrapping_the_address_space_are_rejected() {
    let machine = TestMachine::small();
    let space = VmSpace::new(machine.paging).expect("space");
    let top = VirtualAddress::new(u64::MAX - 1);
    let unmappable = Err(FaultError::SegmentationViolation {
        address: top,
        reason: Violation::Unmappable,
    });
    assert_eq!(space.copy_in(top, &mut [0u8; 4]), unmappable);
    assert_eq!(space.copy_out(top, &[1, 2, 3, 4]), unmappable);
    assert_eq!(space.resident_pages(), 0);
}
