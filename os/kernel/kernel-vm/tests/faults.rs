//! The fault resolver against anonymous and file-backed regions.

use core::cell::RefCell;
use kernel_memory_addresses::{PAGE_SIZE, PageRange, VirtualAddress};
use kernel_pmm::Zone;
use kernel_vm::{
    Access, FaultError, MapRequest, PageFaultError, Pager, ProcessSignals, Signal, Violation,
    VmEntry, VmError, VmFlags, VmObject, VmSpace, handle_page_fault,
};
use kernel_vmem::testing::TestMachine;

const BASE: VirtualAddress = VirtualAddress::new(0x40_0000);

/// Page *n* of the file is filled with *n + 1*.
struct Numbered;

impl Pager for Numbered {
    fn page_in(&self, offset: u64, page: &mut [u8; PAGE_SIZE as usize]) -> Result<(), VmError> {
        page.fill(u8::try_from(offset / PAGE_SIZE + 1).unwrap());
        Ok(())
    }
}

struct Broken;

impl Pager for Broken {
    fn page_in(&self, offset: u64, _page: &mut [u8; PAGE_SIZE as usize]) -> Result<(), VmError> {
        Err(VmError::PageIn { offset })
    }
}

#[derive(Default)]
struct Recorder(RefCell<Vec<Signal>>);

impl ProcessSignals for Recorder {
    fn send(&self, signal: Signal) {
        self.0.borrow_mut().push(signal);
    }
}

fn user(access: Access, present: bool) -> PageFaultError {
    PageFaultError::for_access(access, present, true)
}

fn read_byte(space: &VmSpace, va: VirtualAddress) -> u8 {
    let mut b = [0u8; 1];
    space.copy_in(va, &mut b).expect("copy_in");
    b[0]
}

#[test]
fn first_touch_zero_fills() {
    let machine = TestMachine::small();
    let space = VmSpace::new(machine.paging).expect("space");
    space
        .insert(VmEntry::new(BASE, 2 * PAGE_SIZE, VmFlags::URW))
        .expect("insert");

    space
        .handle_fault(BASE + 0x123, user(Access::Read, false))
        .expect("fault");
    let mapping = space.pmap().query(BASE).expect("mapped");
    assert!(mapping.protection.is_writable());
    assert_eq!(space.find(BASE).expect("region").private_pages, 1);
    assert_eq!(space.slot(BASE).expect("slot").refs(), 1);
    assert_eq!(read_byte(&space, BASE + 0x123), 0);
    assert_eq!(space.resident_pages(), 1);
}

#[test]
fn violations_are_reported() {
    let machine = TestMachine::small();
    let space = VmSpace::new(machine.paging).expect("space");
    space
        .insert(VmEntry::new(BASE, PAGE_SIZE, VmFlags::UR))
        .expect("insert");
    space
        .insert(VmEntry::new(BASE + PAGE_SIZE, PAGE_SIZE, VmFlags::KRW))
        .expect("insert");

    let miss = BASE + 8 * PAGE_SIZE;
    assert_eq!(
        space.handle_fault(miss, user(Access::Read, false)),
        Err(FaultError::SegmentationViolation {
            address: miss,
            reason: Violation::NotMapped
        })
    );
    assert_eq!(
        space.handle_fault(BASE, user(Access::Write, false)),
        Err(FaultError::SegmentationViolation {
            address: BASE,
            reason: Violation::AccessDenied(Access::Write)
        })
    );
    assert_eq!(
        space.handle_fault(BASE, user(Access::Execute, false)),
        Err(FaultError::SegmentationViolation {
            address: BASE,
            reason: Violation::AccessDenied(Access::Execute)
        })
    );

    // Kernel-only pages are reachable from the kernel only.
    let kernel = BASE + PAGE_SIZE;
    assert!(space.handle_fault(kernel, user(Access::Read, false)).is_err());
    space
        .handle_fault(kernel, PageFaultError::for_access(Access::Write, false, false))
        .expect("kernel write");
    // The kernel may also use user rights.
    space
        .handle_fault(BASE, PageFaultError::for_access(Access::Read, false, false))
        .expect("kernel read");
    assert_eq!(space.resident_pages(), 2);
}

#[test]
fn executable_regions_accept_instruction_fetches() {
    let machine = TestMachine::small();
    let space = VmSpace::new(machine.paging).expect("space");
    space
        .insert(VmEntry::new(BASE, PAGE_SIZE, VmFlags::URX))
        .expect("insert");
    space
        .handle_fault(BASE, user(Access::Execute, false))
        .expect("fetch");
    let prot = space.pmap().query(BASE).expect("mapped").protection;
    assert!(prot.is_executable());
    assert!(!prot.is_writable());
}

#[test]
#[should_panic(expected = "page fault")]
fn reserved_bits_are_fatal() {
    let machine = TestMachine::small();
    let space = VmSpace::new(machine.paging).expect("space");
    let code = PageFaultError::new().with_present(true).with_reserved_bit(true);
    let _ = space.handle_fault(BASE, code);
}

#[test]
fn unresolvable_faults_signal_the_process() {
    let machine = TestMachine::small();
    let space = VmSpace::new(machine.paging).expect("space");
    space
        .insert(VmEntry::new(BASE, PAGE_SIZE, VmFlags::URW))
        .expect("insert");
    let signals = Recorder::default();

    assert_eq!(
        handle_page_fault(&space, BASE, user(Access::Write, false), &signals),
        None
    );
    assert_eq!(
        handle_page_fault(&space, BASE + PAGE_SIZE, user(Access::Read, false), &signals),
        Some(Signal::SegmentationFault)
    );
    assert_eq!(*signals.0.borrow(), [Signal::SegmentationFault]);
}

#[test]
fn exhaustion_is_out_of_memory() {
    let machine = TestMachine::small();
    let space = VmSpace::new(machine.paging).expect("space");
    space
        .insert(VmEntry::new(BASE, 2 * PAGE_SIZE, VmFlags::URW))
        .expect("insert");
    // Tables for the region exist before memory runs out.
    space
        .handle_fault(BASE, user(Access::Write, false))
        .expect("first page");

    let mut hoard = Vec::new();
    for zone in [Zone::Normal, Zone::Dma] {
        while let Ok(frame) = machine.pmm.alloc_frame(zone) {
            hoard.push(frame);
        }
    }
    let signals = Recorder::default();
    let page = BASE + PAGE_SIZE;
    assert_eq!(
        space.handle_fault(page, user(Access::Write, false)),
        Err(FaultError::OutOfMemory)
    );
    assert_eq!(
        handle_page_fault(&space, page, user(Access::Write, false), &signals),
        Some(Signal::OutOfMemory)
    );
    assert_eq!(space.resident_pages(), 1);

    hoard.pop();
    space
        .handle_fault(page, user(Access::Write, false))
        .expect("after release");
}

#[test]
fn private_file_pages_are_copied_on_write() {
    let machine = TestMachine::small();
    let object = VmObject::new(Box::new(Numbered));
    let space = VmSpace::new(machine.paging).expect("space");
    let base = space
        .map(MapRequest::file(object.clone(), PAGE_SIZE, 2 * PAGE_SIZE, VmFlags::URW))
        .expect("map");

    // Reads map the page cache read-only behind a copy slot.
    assert_eq!(read_byte(&space, base), 2);
    let cached = object.page(machine.paging, PAGE_SIZE).expect("cached");
    let slot = space.slot(base).expect("slot");
    assert!(slot.is_copy());
    assert_eq!(slot.frame(), cached);
    let mapping = space.pmap().query(base).expect("mapped");
    assert_eq!(mapping.frame, cached.page());
    assert!(!mapping.protection.is_writable());

    space.copy_out(base, &[0xAA]).expect("write");
    let slot = space.slot(base).expect("slot");
    assert!(!slot.is_copy());
    assert_ne!(slot.frame(), cached);
    assert_eq!(read_byte(&space, base), 0xAA);
    assert_eq!(read_byte(&space, base + 1), 2);
    assert_eq!(machine.peek(&cached, 0), 2);

    // A write as the first touch copies straight away.
    space.copy_out(base + PAGE_SIZE, &[0xBB]).expect("write");
    let other = object.page(machine.paging, 2 * PAGE_SIZE).expect("cached");
    assert_eq!(machine.peek(&other, 0), 3);
    assert_eq!(read_byte(&space, base + PAGE_SIZE + 1), 3);
    assert_eq!(object.resident_pages(), 2);
}

#[test]
fn shared_file_pages_are_written_through() {
    let machine = TestMachine::small();
    let object = VmObject::new(Box::new(Numbered));
    let writer = VmSpace::new(machine.paging).expect("space");
    let reader = VmSpace::new(machine.paging).expect("space");
    let flags = VmFlags::URW | VmFlags::SHARED;
    let a = writer
        .map(MapRequest::file(object.clone(), 0, PAGE_SIZE, flags))
        .expect("map");
    let b = reader
        .map(MapRequest::file(object.clone(), 0, PAGE_SIZE, VmFlags::UR))
        .expect("map");

    writer.copy_out(a, &[0x5A]).expect("write");
    assert_eq!(read_byte(&reader, b), 0x5A);
    assert_eq!(machine.peek(&object.page(machine.paging, 0).expect("page"), 0), 0x5A);
    assert_eq!(writer.find(a).expect("region").private_pages, 0);
    assert_eq!(reader.find(b).expect("region").private_pages, 0);
    assert_eq!(object.resident_pages(), 1);
}

#[test]
fn forked_file_copies_stay_private() {
    let machine = TestMachine::small();
    let object = VmObject::new(Box::new(Numbered));
    let parent = VmSpace::new(machine.paging).expect("space");
    let base = parent
        .map(MapRequest::file(object.clone(), 0, PAGE_SIZE, VmFlags::URW))
        .expect("map");
    assert_eq!(read_byte(&parent, base), 1);

    let child = parent.fork().expect("fork");
    child.copy_out(base, &[0xC0]).expect("child write");
    assert_eq!(read_byte(&child, base), 0xC0);
    assert_eq!(read_byte(&parent, base), 1);
    let cached = object.page(machine.paging, 0).expect("page");
    assert_eq!(machine.peek(&cached, 0), 1);
    assert!(parent.slot(base).expect("slot").is_copy());

    parent.copy_out(base, &[0xD0]).expect("parent write");
    assert_eq!(machine.peek(&cached, 0), 1);
    assert_eq!(read_byte(&child, base), 0xC0);
}

#[test]
fn pager_failures_are_segmentation_violations() {
    let machine = TestMachine::small();
    let space = VmSpace::new(machine.paging).expect("space");
    let free = machine.free_bytes();
    let base = space
        .map(MapRequest::file(VmObject::new(Box::new(Broken)), 0, PAGE_SIZE, VmFlags::UR))
        .expect("map");
    assert_eq!(
        space.handle_fault(base, user(Access::Read, false)),
        Err(FaultError::SegmentationViolation {
            address: base,
            reason: Violation::PageInFailed
        })
    );
    space.unmap(PageRange::covering(base, PAGE_SIZE)).expect("unmap");
    assert_eq!(machine.free_bytes(), free);
}

#[test]
fn unaligned_object_offsets_are_rejected() {
    let machine = TestMachine::small();
    let space = VmSpace::new(machine.paging).expect("space");
    let object = VmObject::new(Box::new(Numbered));
    assert_eq!(
        space.map(MapRequest::file(object, 100, PAGE_SIZE, VmFlags::UR)),
        Err(VmError::InvalidRange)
    );
}
