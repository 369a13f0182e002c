//! Copy-on-write across `fork`.

use kernel_memory_addresses::{PAGE_SIZE, PageRange, VirtualAddress};
use kernel_vm::{Access, MapRequest, VmFlags, VmSpace};
use kernel_vmem::testing::TestMachine;

fn read_byte(space: &VmSpace, va: VirtualAddress) -> u8 {
    let mut b = [0u8; 1];
    space.copy_in(va, &mut b).expect("copy_in");
    b[0]
}

fn populated(machine: &TestMachine, pages: u64, flags: VmFlags) -> (VmSpace, VirtualAddress) {
    let space = VmSpace::new(machine.paging).expect("space");
    let base = space
        .map(MapRequest::anonymous(pages * PAGE_SIZE, flags))
        .expect("map");
    space
        .prefault(PageRange::covering(base, pages * PAGE_SIZE), Access::Write)
        .expect("prefault");
    for page in 0..pages {
        space
            .copy_out(base + page * PAGE_SIZE, &[0x10 + u8::try_from(page).unwrap()])
            .expect("copy_out");
    }
    (space, base)
}

#[test]
fn parent_write_after_fork_leaves_the_child_alone() {
    let machine = TestMachine::small();
    let (parent, base) = populated(&machine, 3, VmFlags::URW);
    let page2 = base + 2 * PAGE_SIZE;

    let child = parent.fork().expect("fork");
    assert_eq!(child.resident_pages(), 3);
    let shared = parent.slot(page2).expect("slot");
    assert_eq!(shared.refs(), 2);
    assert!(!parent.pmap().query(page2).unwrap().protection.is_writable());
    assert!(!child.pmap().query(page2).unwrap().protection.is_writable());

    parent.copy_out(page2, &[0xEE]).expect("parent write");

    assert_eq!(read_byte(&parent, page2), 0xEE);
    assert_eq!(read_byte(&child, page2), 0x12);
    let mine = parent.slot(page2).expect("parent slot");
    assert_eq!(mine.refs(), 1);
    assert!(!mine.is_copy());
    assert_ne!(mine.frame(), shared.frame());
    assert_eq!(child.slot(page2).expect("child slot").refs(), 1);

    // Untouched pages are still shared.
    assert_eq!(parent.slot(base).expect("slot").refs(), 2);
    assert_eq!(read_byte(&child, base), 0x10);
}

#[test]
fn child_write_copies_and_parent_regains_write_in_place() {
    let machine = TestMachine::small();
    let (parent, base) = populated(&machine, 2, VmFlags::URW);
    let child = parent.fork().expect("fork");

    child.copy_out(base, &[0x77]).expect("child write");
    assert_eq!(read_byte(&child, base), 0x77);
    assert_eq!(read_byte(&parent, base), 0x10);

    // The parent is now the only holder of its slot: no copy on write.
    let before = parent.slot(base).expect("slot").frame();
    parent.copy_out(base, &[0x55]).expect("parent write");
    assert_eq!(parent.slot(base).expect("slot").frame(), before);
    assert_eq!(read_byte(&parent, base), 0x55);
    assert_eq!(read_byte(&child, base), 0x77);
}

#[test]
fn exiting_in_either_order_frees_everything() {
    let machine = TestMachine::small();
    let free = machine.free_bytes();

    let (parent, base) = populated(&machine, 4, VmFlags::URW);
    let child = parent.fork().expect("fork");
    parent.copy_out(base + PAGE_SIZE, &[1]).expect("write");
    child.copy_out(base + 3 * PAGE_SIZE, &[2]).expect("write");
    let grandchild = child.fork().expect("fork");
    drop(child);
    assert_eq!(read_byte(&grandchild, base + 3 * PAGE_SIZE), 2);
    drop(parent);
    assert_eq!(read_byte(&grandchild, base), 0x10);
    drop(grandchild);

    assert_eq!(machine.free_bytes(), free);
}

#[test]
fn shared_regions_stay_shared() {
    let machine = TestMachine::small();
    let (parent, base) = populated(&machine, 2, VmFlags::URW | VmFlags::SHARED);
    let child = parent.fork().expect("fork");
    assert!(child.pmap().query(base).unwrap().protection.is_writable());

    child.copy_out(base, &[0xAB]).expect("child write");
    assert_eq!(read_byte(&parent, base), 0xAB);
    parent.copy_out(base + PAGE_SIZE, &[0xCD]).expect("parent write");
    assert_eq!(read_byte(&child, base + PAGE_SIZE), 0xCD);
}

#[test]
fn shared_regions_forked_before_any_touch_stay_shared() {
    let machine = TestMachine::small();
    let parent = VmSpace::new(machine.paging).expect("space");
    let base = parent
        .map(MapRequest::anonymous(2 * PAGE_SIZE, VmFlags::URW | VmFlags::SHARED))
        .expect("map");
    let child = parent.fork().expect("fork");
    assert_eq!(child.resident_pages(), 0);

    child.copy_out(base, &[0xAB]).expect("child write");
    assert_eq!(read_byte(&parent, base), 0xAB);
    parent.copy_out(base + PAGE_SIZE, &[0xCD]).expect("parent write");
    assert_eq!(read_byte(&child, base + PAGE_SIZE), 0xCD);
    assert_eq!(
        parent.pmap().query(base).unwrap().frame,
        child.pmap().query(base).unwrap().frame
    );
}

#[test]
fn concurrent_first_touches_of_a_shared_region_agree() {
    let machine = TestMachine::small();
    let parent = VmSpace::new(machine.paging).expect("space");
    let pages = 64;
    let range_len = pages * PAGE_SIZE;
    let base = parent
        .map(MapRequest::anonymous(range_len, VmFlags::URW | VmFlags::SHARED))
        .expect("map");
    let child = parent.fork().expect("fork");

    std::thread::scope(|s| {
        for space in [&parent, &child] {
            s.spawn(move || {
                space
                    .prefault(PageRange::covering(base, range_len), Access::Write)
                    .expect("prefault");
            });
        }
    });
    for page in 0..pages {
        let va = base + page * PAGE_SIZE;
        assert_eq!(
            parent.pmap().query(va).unwrap().frame,
            child.pmap().query(va).unwrap().frame
        );
    }
}

#[test]
fn read_only_regions_are_shared_without_copies() {
    let machine = TestMachine::small();
    let space = VmSpace::new(machine.paging).expect("space");
    let base = space
        .map(MapRequest::anonymous(PAGE_SIZE, VmFlags::UR))
        .expect("map");
    assert_eq!(read_byte(&space, base), 0);
    let child = space.fork().expect("fork");
    assert_eq!(read_byte(&child, base), 0);
    assert_eq!(
        space.pmap().query(base).unwrap().frame,
        child.pmap().query(base).unwrap().frame
    );
    assert!(child.copy_out(base, &[1]).is_err());
}

#[test]
fn heap_state_is_inherited() {
    let machine = TestMachine::small();
    let space = VmSpace::new(machine.paging).expect("space");
    space.set_heap(VirtualAddress::new(0x1000_0000)).expect("heap");
    space.sbrk(100).expect("sbrk");
    let child = space.fork().expect("fork");
    assert_eq!(child.heap_break(), space.heap_break());
    assert_eq!(child.sbrk(0).expect("sbrk"), VirtualAddress::new(0x1000_0064));
}
