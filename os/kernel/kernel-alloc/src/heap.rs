//! Global allocator front end.

use crate::{AllocFlags, Kvmem, MallocType, PageBacking};
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};
use log::error;

/// Tag for everything allocated through `alloc`.
pub static M_KERNEL_HEAP: MallocType = MallocType::new("kernel-heap", "Rust heap objects");

/// A kvmem instance usable as `#[global_allocator]` once initialized.
///
/// Requests before [`KernelHeap::init`] fail with a null pointer.
///
/// ```ignore
/// #[global_allocator]
/// static HEAP: KernelHeap<PmapBacking> = KernelHeap::new();
/// ```
pub struct KernelHeap<B: PageBacking> {
    kvmem: spin::Once<Kvmem<B>>,
}

impl<B: PageBacking> KernelHeap<B> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            kvmem: spin::Once::new(),
        }
    }

    /// Install the allocator; later calls are ignored.
    pub fn init(&self, kvmem: Kvmem<B>) -> &Kvmem<B> {
        self.kvmem.call_once(|| kvmem)
    }

    #[must_use]
    pub fn kvmem(&self) -> Option<&Kvmem<B>> {
        self.kvmem.get()
    }

    fn allocate(&self, layout: Layout, flags: AllocFlags) -> *mut u8 {
        let Some(kvmem) = self.kvmem.get() else {
            return ptr::null_mut();
        };
        match kvmem.allocate_aligned(layout.size(), layout.align(), &M_KERNEL_HEAP, flags) {
            Ok(p) => p.as_ptr(),
            Err(e) => {
                error!("kernel heap: {} bytes (align {}): {e}", layout.size(), layout.align());
                ptr::null_mut()
            }
        }
    }
}

impl<B: PageBacking> Default for KernelHeap<B> {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl<B: PageBacking> GlobalAlloc for KernelHeap<B> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.allocate(layout, AllocFlags::empty())
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        self.allocate(layout, AllocFlags::ZERO)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let (Some(kvmem), Some(ptr)) = (self.kvmem.get(), NonNull::new(ptr)) {
            kvmem.free(ptr);
        }
    }
}
