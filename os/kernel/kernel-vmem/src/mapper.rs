//! # Frame Mounting
//!
//! The kernel has no direct map of physical memory. To touch an arbitrary
//! frame it repoints one of a few reserved virtual windows at the frame,
//! performs the access, and releases the window again.
//!
//! [`FrameMounts`] owns the pool; each window carries a tag naming the frame
//! currently mounted (0 = free). A [`Mount`] guard hands out the window and
//! releases it on drop, including on early returns through `?`.

use crate::Mmu;
use crate::page_table::{PageTable, PageTableEntry};
use crate::Protection;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_info::memory::{MOUNT_WINDOW_BASE, MOUNT_WINDOWS};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalPage, VirtualAddress};

/// Hardware hook behind frame mounting.
///
/// Implementors make window `slot` show the contents of `frame`.
pub trait PhysMapper: Send + Sync {
    /// Point window `slot` at `frame` and return the window's address.
    ///
    /// # Safety
    /// `slot` must be below [`MOUNT_WINDOWS`] and not currently mapped.
    unsafe fn map_window(&self, slot: usize, frame: PhysicalPage) -> NonNull<u8>;

    /// Tear down window `slot`.
    ///
    /// # Safety
    /// No reference into the window may outlive this call.
    unsafe fn unmap_window(&self, slot: usize);
}

/// The pool of mount windows.
pub struct FrameMounts {
    mapper: &'static dyn PhysMapper,
    tags: [AtomicU64; MOUNT_WINDOWS],
}

impl FrameMounts {
    #[must_use]
    pub const fn new(mapper: &'static dyn PhysMapper) -> Self {
        Self {
            mapper,
            tags: [const { AtomicU64::new(0) }; MOUNT_WINDOWS],
        }
    }

    /// Mount `frame` into a free window, spinning while all windows are busy.
    ///
    /// Callers keep at most one other mount alive while calling this, and
    /// none across a call into code that may mount again. That keeps every
    /// waiter at one window or less, so some holder can always finish.
    ///
    /// # Safety
    /// While the returned guard lives, nobody else may access `frame`, neither
    /// through another mount nor through any other mapping.
    pub unsafe fn mount(&self, frame: PhysicalPage) -> Mount<'_> {
        let tag = frame.number() + 1;
        loop {
            for (slot, window) in self.tags.iter().enumerate() {
                if window
                    .compare_exchange(0, tag, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    // SAFETY: the slot was free and is now ours.
                    let ptr = unsafe { self.mapper.map_window(slot, frame) };
                    return Mount {
                        mounts: self,
                        slot,
                        ptr,
                    };
                }
            }
            core::hint::spin_loop();
        }
    }

    /// Frame currently mounted in `slot`, if any.
    #[must_use]
    pub fn mounted(&self, slot: usize) -> Option<PhysicalPage> {
        match self.tags.get(slot)?.load(Ordering::Acquire) {
            0 => None,
            tag => Some(PhysicalPage::from_number(tag - 1)),
        }
    }

    /// Number of windows in use.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.tags
            .iter()
            .filter(|t| t.load(Ordering::Relaxed) != 0)
            .count()
    }
}

/// A mounted frame; the window is released on drop.
pub struct Mount<'a> {
    mounts: &'a FrameMounts,
    slot: usize,
    ptr: NonNull<u8>,
}

impl Mount<'_> {
    /// The mounted frame as raw bytes.
    #[must_use]
    pub const fn bytes(&mut self) -> &mut [u8; PAGE_SIZE as usize] {
        // SAFETY: the window maps one whole frame exclusively owned by this guard.
        unsafe { self.ptr.cast::<[u8; PAGE_SIZE as usize]>().as_mut() }
    }

    /// The mounted frame viewed as a page table.
    #[must_use]
    pub const fn table(&mut self) -> &mut PageTable {
        // SAFETY: windows are page aligned and a page table is any bit pattern.
        unsafe { self.ptr.cast::<PageTable>().as_mut() }
    }
}

impl Drop for Mount<'_> {
    fn drop(&mut self) {
        // SAFETY: every borrow handed out by this guard ends with it.
        unsafe { self.mounts.mapper.unmap_window(self.slot) };
        self.mounts.tags[self.slot].store(0, Ordering::Release);
    }
}

/// Windows realized as entries of one reserved kernel page table.
///
/// The table covering [`MOUNT_WINDOW_BASE`] is set up at boot and must stay
/// mapped; slot *n* is the page `MOUNT_WINDOW_BASE + n * PAGE_SIZE`.
pub struct FixmapPhysMapper {
    table: NonNull<PageTable>,
    mmu: &'static dyn Mmu,
}

// SAFETY: slots are handed out exclusively by `FrameMounts`, so concurrent
// writers never touch the same entry.
unsafe impl Send for FixmapPhysMapper {}
// SAFETY: see above.
unsafe impl Sync for FixmapPhysMapper {}

impl FixmapPhysMapper {
    /// # Safety
    /// `table` must be the live page table mapping the window range, reachable
    /// at this virtual address for the lifetime of the kernel.
    #[must_use]
    pub const unsafe fn new(table: NonNull<PageTable>, mmu: &'static dyn Mmu) -> Self {
        Self { table, mmu }
    }

    fn window(slot: usize) -> VirtualAddress {
        VirtualAddress::new(MOUNT_WINDOW_BASE + slot as u64 * PAGE_SIZE)
    }

    fn entry(&self, slot: usize) -> *mut PageTableEntry {
        // SAFETY: slot < MOUNT_WINDOWS <= 512 and the table outlives us.
        unsafe {
            self.table
                .as_ptr()
                .cast::<PageTableEntry>()
                .add(slot)
        }
    }
}

impl PhysMapper for FixmapPhysMapper {
    unsafe fn map_window(&self, slot: usize, frame: PhysicalPage) -> NonNull<u8> {
        let entry = PageTableEntry::leaf(frame, Protection::KRW).with_global(true);
        // SAFETY: the slot is exclusively ours (caller contract).
        unsafe { self.entry(slot).write_volatile(entry) };
        let va = Self::window(slot);
        self.mmu.invalidate_page(va);
        // SAFETY: window addresses are never null.
        unsafe { NonNull::new_unchecked(va.as_mut_ptr()) }
    }

    unsafe fn unmap_window(&self, slot: usize) {
        // SAFETY: as above.
        unsafe { self.entry(slot).write_volatile(PageTableEntry::empty()) };
        self.mmu.invalidate_page(Self::window(slot));
    }
}
