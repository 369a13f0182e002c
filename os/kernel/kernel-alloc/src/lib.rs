//! # Kernel Virtual Memory Allocator (kvmem)
//!
//! General-purpose object allocator for the kernel. A flat virtual region is
//! carved into variable-size nodes; the bookkeeping lives in a separate node
//! array, never inside the objects.
//!
//! ```text
//!  node array                     kvmem region
//! ┌────┬──────┬──────┬──────┐    ┌──────┬────────────┬──────────────────┐
//! │ #0 │ addr │ size │ next ├──► │ used │    free    │      used        │
//! └────┴──────┴──────┴──────┘    └──────┴────────────┴──────────────────┘
//! ```
//!
//! * Allocation is first fit, starting at a cursor on the first free node, and
//!   splits the chosen node.
//! * Freeing merges the node with free neighbours and hands every whole page
//!   of the merged free node back to the [`PageBacking`].
//! * Every allocation carries a [`MallocType`] tag for accounting.
//! * Pages are populated on allocation through the [`PageBacking`]; in the
//!   kernel that is [`PmapBacking`], mapping buddy frames into the kernel pmap.
//!
//! [`KernelHeap`] exposes a kvmem instance as the global allocator.
//!
//! ## Consistency
//!
//! Double frees, frees below the region and frees of addresses that start no
//! node are fatal in [`Kvmem::free`]. [`Kvmem::try_free`] reports them instead.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod backing;
mod heap;
mod kvmem;
mod malloc_type;

pub use backing::{PageBacking, PmapBacking};
pub use heap::{KernelHeap, M_KERNEL_HEAP};
pub use kvmem::{Kvmem, MAX_NODE_SIZE, Node, NodeInfo};
pub use malloc_type::{MallocType, dump_types, types};

use bitflags::bitflags;
use kernel_memory_addresses::VirtualAddress;

/// Errors reported by the kernel allocator.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum KvmemError {
    #[error("kvmem region exhausted or no memory to back it")]
    OutOfMemory,
    #[error("no spare node records left")]
    NoFreeNodes,
    #[error("unsupported alignment {0}")]
    BadAlignment(usize),
    #[error("request of {0} bytes exceeds the largest node")]
    TooLarge(usize),
    #[error("invalid kvmem region")]
    InvalidRegion,
    #[error("{0} lies below the kvmem region")]
    BelowBase(VirtualAddress),
    #[error("{0} does not start an allocation")]
    NotAllocated(VirtualAddress),
    #[error("double free of {0}")]
    DoubleFree(VirtualAddress),
}

bitflags! {
    /// Allocation modifiers.
    #[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
    pub struct AllocFlags: u32 {
        /// Zero the object before returning it.
        const ZERO = 1 << 0;
    }
}
