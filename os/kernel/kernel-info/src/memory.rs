//! # Memory Layout

use kernel_memory_addresses::PAGE_SIZE;

/// Lowest mappable user address; page zero stays unmapped to catch null dereferences.
pub const USER_BASE: u64 = PAGE_SIZE;

/// End (exclusive) of the user half of the address space.
pub const USER_END: u64 = 0x0000_8000_0000_0000;

/// Highest address (exclusive) at which kernel-chosen mmap placements end.
///
/// The space above it is left to the user stack.
pub const USER_MMAP_TOP: u64 = 0x0000_7F00_0000_0000;

/// Number of top-level (PML4) entries belonging to the user half.
pub const USER_TOP_LEVEL_ENTRIES: usize = 256;

/// First address of the kernel half of the address space.
pub const KERNEL_HALF_BASE: u64 = 0xFFFF_8000_0000_0000;

/// Base of the kernel allocator (kvmem) region.
pub const KVMEM_BASE: u64 = 0xFFFF_9000_0000_0000;

/// Size of the kernel allocator region in bytes.
pub const KVMEM_SIZE: u64 = 256 * 1024 * 1024;

/// Capacity of the kvmem node array.
pub const KVMEM_NODES: usize = 100_000;

/// Base of the frame-mount window range (one page table worth of slots).
pub const MOUNT_WINDOW_BASE: u64 = 0xFFFF_FFFF_7FE0_0000;

/// Number of simultaneously mountable frames.
///
/// A CPU holds at most two windows and waits for a window while holding at
/// most one, so the pool cannot run dry with fewer CPUs than windows.
pub const MOUNT_WINDOWS: usize = 16;

/// Where the kernel executes (VMA).
pub const KERNEL_BASE: u64 = 0xFFFF_FFFF_8000_0000;

/// End (exclusive) of the DMA zone; everything above belongs to the normal zone.
pub const DMA_ZONE_END: u64 = 16 * 1024 * 1024;

/// Smallest buddy block in bytes (one frame).
pub const BUDDY_MIN_BLOCK: u64 = PAGE_SIZE;

/// Highest buddy order; blocks of this order are `BUDDY_MIN_BLOCK << BUDDY_MAX_ORDER` bytes.
pub const BUDDY_MAX_ORDER: usize = 10;

/// Size of a top-order buddy block (4 MiB).
pub const BUDDY_MAX_BLOCK: u64 = BUDDY_MIN_BLOCK << BUDDY_MAX_ORDER;

const _: () = {
    assert!(USER_BASE.is_multiple_of(PAGE_SIZE));
    assert!(USER_MMAP_TOP < USER_END);
    assert!(USER_END == (USER_TOP_LEVEL_ENTRIES as u64) << 39);
    assert!(KVMEM_BASE >= KERNEL_HALF_BASE);
    assert!(KVMEM_BASE + KVMEM_SIZE <= MOUNT_WINDOW_BASE);
    assert!(KVMEM_SIZE.is_multiple_of(PAGE_SIZE));
    assert!(MOUNT_WINDOW_BASE.is_multiple_of(2 * 1024 * 1024));
    assert!(MOUNT_WINDOW_BASE + (MOUNT_WINDOWS as u64) * PAGE_SIZE <= KERNEL_BASE);
    assert!(MOUNT_WINDOWS <= 512);
    assert!(DMA_ZONE_END.is_multiple_of(BUDDY_MAX_BLOCK));
};
