//! # Address Spaces and Page Faults
//!
//! The machine-independent half of virtual memory. A [`VmSpace`] describes a
//! process's address space as a sorted set of [`VmEntry`] regions and owns the
//! [`Pmap`](kernel_vmem::Pmap) realizing it. Nothing is mapped eagerly: pages
//! appear when the [fault resolver](VmSpace::handle_fault) runs.
//!
//! ```text
//!  VmSpace ──► VmEntry ──► VmAnon ──► VmAref ──► Frame   (private, copy-on-write)
//!                 │
//!                 └──────► VmObject ─────────────► Frame   (file page cache)
//! ```
//!
//! * A [`VmObject`] caches the pages of one file region, filled by a [`Pager`].
//!   It is shared by every entry mapping that region.
//! * A [`VmAnon`] is the private layer of an entry: page slots ([`VmAref`])
//!   keyed by offset. After `fork` parent and child share anons and slots; the
//!   first write on either side copies.
//!
//! ## Fault resolution
//!
//! 1. Find the entry; a missing entry or a forbidden access is a segmentation
//!    violation.
//! 2. Present page, private anon, private slot: copy a slot marked copy or
//!    re-grant the missing permission.
//! 3. Anon slot exists: map it, copying first when writing a shared slot.
//! 4. Object page exists or can be paged in: map it, copying into a private
//!    slot on writes to private mappings.
//! 5. Otherwise zero-fill a fresh slot.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod anon;
mod entry;
mod error_code;
mod fault;
mod flags;
mod object;
mod space;

pub use anon::{VmAnon, VmAref};
pub use entry::VmEntry;
pub use error_code::{Access, PageFaultError};
pub use fault::{ProcessSignals, Signal, handle_page_fault};
pub use flags::VmFlags;
pub use object::{Pager, VmObject};
pub use space::{Backing, MapRequest, RegionInfo, VmSpace};

use kernel_memory_addresses::VirtualAddress;
use kernel_pmm::BuddyError;
use kernel_vmem::PmapError;

/// Errors of address-space operations.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum VmError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("range overlaps an existing region")]
    Overlap,
    #[error("no free range large enough")]
    NoSpace,
    #[error("invalid address range")]
    InvalidRange,
    #[error("pager failed at object offset {offset:#x}")]
    PageIn { offset: u64 },
}

impl From<BuddyError> for VmError {
    fn from(_: BuddyError) -> Self {
        Self::OutOfMemory
    }
}

impl From<PmapError> for VmError {
    fn from(e: PmapError) -> Self {
        match e {
            PmapError::OutOfMemory => Self::OutOfMemory,
            PmapError::InvalidArgument { .. }
            | PmapError::InvalidAddress(_)
            | PmapError::InvalidIndex(_) => Self::InvalidRange,
        }
    }
}

/// Why a fault could not be resolved.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Violation {
    /// No region covers the address.
    NotMapped,
    /// The region forbids the access.
    AccessDenied(Access),
    /// The backing object could not provide the page.
    PageInFailed,
    /// The page-table layer refused the mapping.
    Unmappable,
}

impl core::fmt::Display for Violation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NotMapped => f.write_str("no region covers the address"),
            Self::AccessDenied(access) => write!(f, "{access} access not permitted"),
            Self::PageInFailed => f.write_str("page-in failed"),
            Self::Unmappable => f.write_str("address cannot be mapped"),
        }
    }
}

/// Terminal outcomes of the fault resolver.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FaultError {
    #[error("segmentation violation at {address}: {reason}")]
    SegmentationViolation {
        address: VirtualAddress,
        reason: Violation,
    },
    #[error("out of memory resolving a page fault")]
    OutOfMemory,
}

impl FaultError {
    pub(crate) const fn from_vm(address: VirtualAddress, e: VmError) -> Self {
        let reason = match e {
            VmError::OutOfMemory => return Self::OutOfMemory,
            VmError::PageIn { .. } => Violation::PageInFailed,
            VmError::Overlap | VmError::NoSpace | VmError::InvalidRange => Violation::Unmappable,
        };
        Self::SegmentationViolation { address, reason }
    }
}

impl From<BuddyError> for FaultError {
    fn from(_: BuddyError) -> Self {
        Self::OutOfMemory
    }
}
