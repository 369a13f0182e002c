//! # Pmap: Hardware Address Spaces
//!
//! The architecture layer of the virtual memory system. A [`Pmap`] is one
//! address space as the x86-64 MMU sees it: a four-level page-table tree whose
//! leaves reference physical [`Frame`](kernel_pmm::Frame)s.
//!
//! ```text
//!  PML4  →  PDPT  →  PD  →  PT  →  4 KiB frame
//! ```
//!
//! ## Single live root
//!
//! The hardware always walks one root table, owned by [`Paging`]. Its upper
//! half (entries 256..512) belongs to the kernel pmap and never changes owner.
//! The lower half belongs to whichever user pmap is current: [`Paging::switch`]
//! saves the outgoing pmap's user half into that pmap's own root, copies the
//! incoming pmap's user half into the live root and flushes the TLB.
//!
//! ## Table bookkeeping
//!
//! Intermediate tables are allocated lazily and zeroed before they are linked.
//! The frame registry count of a table frame equals the number of populated
//! entries in it; when a removal empties a table, the table is unlinked and
//! freed, cascading upward to (but never including) the root.
//!
//! Each leaf holds one frame reference. Replacing or removing a mapping
//! releases it.
//!
//! ## Frame access
//!
//! The kernel has no direct map. Tables and data frames are reached through
//! the [mount windows](mapper), see [`FrameMounts`].
//!
//! ## Locking
//!
//! Each pmap serializes its table edits with its own lock. Top-level entries
//! additionally go through the switch lock in [`Paging`], always taken after a
//! pmap lock. Forking locks the parent before the child.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod debug;
pub mod mapper;
mod mmu;
pub mod page_table;
mod paging;
mod pmap;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use mapper::{FixmapPhysMapper, FrameMounts, Mount, PhysMapper};
pub use mmu::{Mmu, X86Mmu};
pub use page_table::{Level, PageTable, PageTableEntry, TableIndex};
pub use paging::Paging;
pub use pmap::{KernelPmap, Mapping, Pmap};

use bitflags::bitflags;
use kernel_memory_addresses::VirtualAddress;

/// Errors reported by the pmap layer.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum PmapError {
    #[error("out of memory for page tables")]
    OutOfMemory,
    #[error("invalid argument: {what} ({value:#x})")]
    InvalidArgument { what: &'static str, value: u64 },
    #[error("address {0} lies outside this address space")]
    InvalidAddress(VirtualAddress),
    #[error("page table index {0} out of range")]
    InvalidIndex(usize),
}

bitflags! {
    /// Access rights of a mapping.
    ///
    /// x86-64 cannot express every combination: a user page is always
    /// kernel-accessible, write implies read, and a readable page is
    /// executable unless `NX` is set. [`Protection::normalized`] yields what
    /// the hardware will actually grant.
    #[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
    pub struct Protection: u32 {
        /// Kernel read.
        const KR = 1 << 0;
        /// Kernel write.
        const KW = 1 << 1;
        /// Kernel execute.
        const KX = 1 << 2;
        /// User read.
        const UR = 1 << 3;
        /// User write.
        const UW = 1 << 4;
        /// User execute.
        const UX = 1 << 5;
        /// Uncached (device memory).
        const NOCACHE = 1 << 6;

        const KRW = Self::KR.bits() | Self::KW.bits();
        const KRX = Self::KR.bits() | Self::KX.bits();
        const KRWX = Self::KRW.bits() | Self::KX.bits();
        const URW = Self::UR.bits() | Self::UW.bits();
        const URX = Self::UR.bits() | Self::UX.bits();
        const URWX = Self::URW.bits() | Self::UX.bits();
    }
}

impl Protection {
    const WRITE: Self = Self::KW.union(Self::UW);
    const EXEC: Self = Self::KX.union(Self::UX);
    const USER: Self = Self::UR.union(Self::UW).union(Self::UX);

    #[inline]
    #[must_use]
    pub const fn is_writable(self) -> bool {
        self.intersects(Self::WRITE)
    }

    #[inline]
    #[must_use]
    pub const fn is_executable(self) -> bool {
        self.intersects(Self::EXEC)
    }

    #[inline]
    #[must_use]
    pub const fn is_user(self) -> bool {
        self.intersects(Self::USER)
    }

    /// Same rights without any write permission.
    #[inline]
    #[must_use]
    pub const fn without_write(self) -> Self {
        self.difference(Self::WRITE)
    }

    /// The rights a mapping with `self` really grants on x86-64.
    #[must_use]
    pub const fn normalized(self) -> Self {
        let mut bits = self.bits();
        if self.is_user() {
            bits |= Self::UR.bits();
            if self.contains(Self::UW) {
                bits |= Self::KW.bits();
            }
            if self.contains(Self::UX) {
                bits |= Self::KX.bits();
            }
        }
        let mut out = Self::from_bits_truncate(bits);
        if !out.intersection(Self::all().difference(Self::NOCACHE)).is_empty() {
            out = out.union(Self::KR);
        }
        if out.is_user() && out.is_executable() {
            out = out.union(Self::EXEC);
        }
        if out.is_user() && out.is_writable() {
            out = out.union(Self::WRITE);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_follows_hardware() {
        assert_eq!(Protection::UR.normalized(), Protection::UR | Protection::KR);
        assert_eq!(Protection::UW.normalized(), Protection::URW | Protection::KRW);
        assert_eq!(Protection::KW.normalized(), Protection::KRW);
        assert_eq!(
            Protection::URX.normalized(),
            Protection::URX | Protection::KRX
        );
        assert_eq!(Protection::empty().normalized(), Protection::empty());
    }

    #[test]
    fn write_removal() {
        assert_eq!(Protection::URWX.without_write(), Protection::URX);
        assert!(!Protection::KRW.without_write().is_writable());
    }
}
