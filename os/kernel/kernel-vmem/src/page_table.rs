//! # x86-64 Page Tables
//!
//! One entry type serves all four levels since this kernel only maps 4 KiB
//! leaves: every PML4E, PDPTE and PDE points at the next table, every PTE maps
//! a frame.
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```
//!
//! Permissions are decided at the leaf. Non-leaf entries are always present,
//! writable and (in the user half) user-accessible, so the intersection over
//! the walk equals the leaf's permissions.

use crate::{PmapError, Protection};
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalPage, VirtualAddress};

/// Entries per table.
pub const ENTRIES: usize = 512;

/// A single 64-bit page-table entry.
///
/// | Bits  | Field |
/// |-------|-------|
/// | 0     | `P` present |
/// | 1     | `RW` writable |
/// | 2     | `US` user accessible |
/// | 3     | `PWT` write-through |
/// | 4     | `PCD` cache disable |
/// | 5     | `A` accessed |
/// | 6     | `D` dirty (leaf only) |
/// | 7     | `PS` large page, always 0 here |
/// | 8     | `G` global (leaf only) |
/// | 9‒11  | OS available |
/// | 12‒51 | frame number |
/// | 52‒58 | OS available |
/// | 59‒62 | protection key |
/// | 63    | `NX` no execute |
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageTableEntry {
    pub present: bool,
    pub writable: bool,
    pub user_access: bool,
    pub write_through: bool,
    pub cache_disabled: bool,
    pub accessed: bool,
    pub dirty: bool,
    pub large_page: bool,
    pub global: bool,
    #[bits(3)]
    pub os_available_low: u8,
    /// Physical frame number (address bits 51:12).
    #[bits(40)]
    frame_number: u64,
    #[bits(7)]
    pub os_available_high: u8,
    #[bits(4)]
    pub protection_key: u8,
    pub no_execute: bool,
}

impl PageTableEntry {
    /// A not-present entry.
    #[inline]
    #[must_use]
    pub const fn empty() -> Self {
        Self::new()
    }

    /// Entry pointing at the next-level table `frame`.
    #[inline]
    #[must_use]
    pub const fn table(frame: PhysicalPage, user: bool) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user_access(user)
            .with_frame_number(frame.number())
    }

    /// Leaf entry mapping `frame` with `prot`.
    #[inline]
    #[must_use]
    pub const fn leaf(frame: PhysicalPage, prot: Protection) -> Self {
        Self::new()
            .with_present(true)
            .with_frame_number(frame.number())
            .with_protection(prot)
    }

    /// The frame this entry points at (table or page).
    #[inline]
    #[must_use]
    pub const fn frame(self) -> PhysicalPage {
        PhysicalPage::from_number(self.frame_number())
    }

    /// Replace the permission bits, keeping frame and status bits.
    #[inline]
    #[must_use]
    pub const fn with_protection(self, prot: Protection) -> Self {
        self.with_writable(prot.is_writable())
            .with_user_access(prot.is_user())
            .with_no_execute(!prot.is_executable())
            .with_cache_disabled(prot.contains(Protection::NOCACHE))
    }

    /// Permissions granted by a leaf entry.
    #[must_use]
    pub const fn protection(self) -> Protection {
        if !self.present() {
            return Protection::empty();
        }
        let mut bits = Protection::KR.bits();
        if self.writable() {
            bits |= Protection::KW.bits();
        }
        if !self.no_execute() {
            bits |= Protection::KX.bits();
        }
        if self.user_access() {
            bits |= Protection::UR.bits();
            if self.writable() {
                bits |= Protection::UW.bits();
            }
            if !self.no_execute() {
                bits |= Protection::UX.bits();
            }
        }
        if self.cache_disabled() {
            bits |= Protection::NOCACHE.bits();
        }
        Protection::from_bits_truncate(bits)
    }
}

/// Validated index into a page table (`0..512`).
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TableIndex(u16);

impl TableIndex {
    /// # Errors
    /// [`PmapError::InvalidIndex`] for indices of 512 and above.
    pub const fn new(idx: u16) -> Result<Self, PmapError> {
        if (idx as usize) < ENTRIES {
            Ok(Self(idx))
        } else {
            Err(PmapError::InvalidIndex(idx as usize))
        }
    }

    /// Index of `va` at `level`.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn of(va: VirtualAddress, level: Level) -> Self {
        Self(((va.as_u64() >> level.shift()) & 0x1FF) as u16)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// Paging level, from the root down.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Level {
    Pml4,
    Pdpt,
    Pd,
    Pt,
}

impl Level {
    /// Address bit where this level's index starts.
    #[inline]
    #[must_use]
    pub const fn shift(self) -> u32 {
        match self {
            Self::Pml4 => 39,
            Self::Pdpt => 30,
            Self::Pd => 21,
            Self::Pt => 12,
        }
    }

    /// Bytes covered by one entry at this level.
    #[inline]
    #[must_use]
    pub const fn entry_span(self) -> u64 {
        1 << self.shift()
    }

    /// The level below, or `None` at the leaf level.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Pml4 => Some(Self::Pdpt),
            Self::Pdpt => Some(Self::Pd),
            Self::Pd => Some(Self::Pt),
            Self::Pt => None,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Pml4 => "PML4",
            Self::Pdpt => "PDPT",
            Self::Pd => "PD",
            Self::Pt => "PT",
        }
    }
}

/// A 4 KiB-aligned table of 512 entries.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; ENTRIES],
}

impl PageTable {
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PageTableEntry::empty(); ENTRIES],
        }
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, idx: TableIndex) -> PageTableEntry {
        self.entries[idx.as_usize()]
    }

    #[inline]
    pub const fn set(&mut self, idx: TableIndex, entry: PageTableEntry) {
        self.entries[idx.as_usize()] = entry;
    }

    pub fn zero(&mut self) {
        self.entries.fill(PageTableEntry::empty());
    }

    /// Entries `range` as a slice.
    #[must_use]
    pub fn slice(&self, range: core::ops::Range<usize>) -> &[PageTableEntry] {
        &self.entries[range]
    }

    /// Entries `range` as a mutable slice.
    pub fn slice_mut(&mut self, range: core::ops::Range<usize>) -> &mut [PageTableEntry] {
        &mut self.entries[range]
    }

    /// Number of present entries.
    #[must_use]
    pub fn populated(&self) -> usize {
        self.entries.iter().filter(|e| e.present()).count()
    }
}
