//! Fake hardware for hosted tests: RAM backed by heap pages, an MMU that only
//! records what it was asked to do, and a machine builder tying both to a
//! [`PhysicalMemory`] and [`Paging`].

use crate::page_table::{Level, TableIndex};
use crate::{Mmu, Paging, PhysMapper};
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalPage, VirtualAddress};
use kernel_pmm::testing::leak_physical_memory;
use kernel_pmm::{Frame, PhysicalMemory, Zone, ZoneLayout};

#[repr(C, align(4096))]
struct Aligned4K([u8; PAGE_SIZE as usize]);

/// Heap pages standing in for physical memory; frame *n* is page *n*.
pub struct TestPhys {
    base: NonNull<Aligned4K>,
    frames: usize,
}

// SAFETY: windows hand out disjoint frames; `FrameMounts` serializes slots.
unsafe impl Send for TestPhys {}
// SAFETY: see above.
unsafe impl Sync for TestPhys {}

impl TestPhys {
    /// Fake RAM of `frames` zeroed pages, leaked for `'static` use.
    #[must_use]
    pub fn leak(frames: usize) -> &'static Self {
        let pages: Vec<Aligned4K> = (0..frames)
            .map(|_| Aligned4K([0; PAGE_SIZE as usize]))
            .collect();
        let base = NonNull::from(pages.leak()).cast::<Aligned4K>();
        Box::leak(Box::new(Self { base, frames }))
    }
}

impl PhysMapper for TestPhys {
    unsafe fn map_window(&self, _slot: usize, frame: PhysicalPage) -> NonNull<u8> {
        let idx = usize::try_from(frame.number()).unwrap_or(usize::MAX);
        assert!(idx < self.frames, "frame {frame} beyond fake RAM");
        // SAFETY: bounds checked above.
        unsafe { self.base.add(idx).cast() }
    }

    unsafe fn unmap_window(&self, _slot: usize) {}
}

/// An [`Mmu`] that records requests instead of touching hardware.
#[derive(Debug, Default)]
pub struct RecordingMmu {
    root: AtomicU64,
    loads: AtomicUsize,
    flushes: AtomicUsize,
    invalidations: spin::Mutex<Vec<VirtualAddress>>,
}

impl RecordingMmu {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::Relaxed)
    }

    /// Pages invalidated so far, in order.
    #[must_use]
    pub fn invalidations(&self) -> Vec<VirtualAddress> {
        self.invalidations.lock().clone()
    }

    pub fn clear_invalidations(&self) {
        self.invalidations.lock().clear();
    }
}

impl Mmu for RecordingMmu {
    fn active_root(&self) -> PhysicalPage {
        PhysicalPage::from_number(self.root.load(Ordering::Relaxed))
    }

    unsafe fn load_root(&self, root: PhysicalPage) {
        self.root.store(root.number(), Ordering::Relaxed);
        self.loads.fetch_add(1, Ordering::Relaxed);
    }

    fn flush_all(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    fn invalidate_page(&self, va: VirtualAddress) {
        self.invalidations.lock().push(va);
    }
}

/// A complete fake machine: buddy allocator, fake RAM, MMU and paging.
pub struct TestMachine {
    pub pmm: &'static PhysicalMemory,
    pub phys: &'static TestPhys,
    pub mmu: &'static RecordingMmu,
    pub paging: &'static Paging,
}

impl TestMachine {
    /// # Panics
    /// If `layout` leaves no frame for the live root.
    #[must_use]
    pub fn new(layout: ZoneLayout) -> Self {
        let pmm = leak_physical_memory(layout);
        let phys = TestPhys::leak(layout.frames());
        let mmu: &'static RecordingMmu = Box::leak(Box::new(RecordingMmu::new()));
        let paging = Paging::bootstrap(pmm, phys, mmu)
            .unwrap_or_else(|e| panic!("test machine without a root: {e}"));
        let paging: &'static Paging = Box::leak(Box::new(paging));
        // SAFETY: the recording MMU only stores the root.
        unsafe { paging.activate() };
        Self {
            pmm,
            phys,
            mmu,
            paging,
        }
    }

    /// 4 MiB of RAM, 512 KiB of it DMA, 128 KiB top blocks.
    ///
    /// # Panics
    /// Never.
    #[must_use]
    pub fn small() -> Self {
        let layout = ZoneLayout::new(4 * 1024 * 1024, 512 * 1024, 5)
            .unwrap_or_else(|e| panic!("bad test layout: {e}"));
        Self::new(layout)
    }

    /// A fresh normal-zone frame filled with `byte`.
    ///
    /// # Panics
    /// When the machine is out of memory.
    #[must_use]
    pub fn frame_with(&self, byte: u8) -> Frame {
        let frame = self
            .pmm
            .alloc_frame(Zone::Normal)
            .unwrap_or_else(|e| panic!("test machine: {e}"));
        self.paging.fill_frame(&frame, byte);
        frame
    }

    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        self.pmm.free_bytes()
    }

    /// Translate `va` through the live root the way the hardware would.
    #[must_use]
    pub fn live_lookup(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let mut table = self.paging.live_root();
        for level in [Level::Pml4, Level::Pdpt, Level::Pd, Level::Pt] {
            // SAFETY: tests are single threaded around this peek.
            let entry = unsafe { self.paging.mounts().mount(table) }
                .table()
                .get(TableIndex::of(va, level));
            if !entry.present() {
                return None;
            }
            table = entry.frame();
        }
        Some(table.base() + va.page_offset())
    }

    /// Read one byte of `frame`.
    ///
    /// # Panics
    /// If `offset` is outside the frame.
    #[must_use]
    pub fn peek(&self, frame: &Frame, offset: usize) -> u8 {
        let mut byte = [0u8; 1];
        self.paging
            .read_frame(frame, offset, &mut byte)
            .unwrap_or_else(|e| panic!("peek: {e}"));
        byte[0]
    }
}
