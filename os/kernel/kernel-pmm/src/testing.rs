//! Helpers for tests that need a live [`PhysicalMemory`].
//!
//! Everything is leaked so that frames can carry the `'static` back-reference
//! they use to find their allocator.

use crate::{FrameInfo, PhysicalMemory, ZoneLayout};
use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

/// Build a physical memory manager for `layout` with leaked storage.
///
/// # Panics
/// Never for layouts accepted by [`ZoneLayout::new`].
#[must_use]
pub fn leak_physical_memory(layout: ZoneLayout) -> &'static PhysicalMemory {
    let words = vec![0u64; layout.bitmap_words()].leak();
    let frames: Vec<FrameInfo> = (0..layout.frames()).map(|_| FrameInfo::new()).collect();
    let pmm = PhysicalMemory::new(layout, words, frames.leak())
        .unwrap_or_else(|e| panic!("test layout rejected: {e}"));
    Box::leak(Box::new(pmm))
}
