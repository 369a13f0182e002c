//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw addresses and 4 KiB page bases used by the
//! frame allocator, the page-table manager and the address-space model.
//!
//! ## Overview
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`PhysicalAddress`] / [`PhysicalPage`] | Physical memory (frames, page tables). |
//! | [`VirtualAddress`] / [`VirtualPage`] | Translated addresses (user or kernel). |
//! | [`PageRange`] | A half-open run of virtual pages, iterable page by page. |
//!
//! All types are `#[repr(transparent)]` over `u64`, `Copy`, ordered and
//! hashable, so they can key `BTreeMap`s directly.
//!
//! ## Typical Usage
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0x0040_1234);
//! assert_eq!(va.page().base().as_u64(), 0x0040_1000);
//! assert_eq!(va.page_offset(), 0x234);
//!
//! let range = PageRange::covering(va, 0x2000);
//! assert_eq!(range.len(), 3);
//! ```
//!
//! Only 4 KiB pages exist in this kernel; there are no huge-page variants.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

use core::fmt;
use core::ops::{Add, Sub};

/// Size of a page and of a physical frame in bytes.
pub const PAGE_SIZE: u64 = 4096;

/// Number of low address bits covered by a page.
pub const PAGE_SHIFT: u32 = 12;

/// Mask of the in-page offset bits.
pub const PAGE_MASK: u64 = PAGE_SIZE - 1;

/// Round `value` down to a multiple of `align` (a power of two).
#[inline]
#[must_use]
pub const fn align_down(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

/// Round `value` up to a multiple of `align` (a power of two).
///
/// Saturates at the highest aligned value instead of wrapping.
#[inline]
#[must_use]
pub const fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    match value.checked_add(align - 1) {
        Some(v) => v & !(align - 1),
        None => u64::MAX & !(align - 1),
    }
}

/// Whether `value` sits on a page boundary.
#[inline]
#[must_use]
pub const fn is_page_aligned(value: u64) -> bool {
    value & PAGE_MASK == 0
}

/// Physical memory address.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalAddress(u64);

impl PhysicalAddress {
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// The frame containing this address.
    #[inline]
    #[must_use]
    pub const fn page(self) -> PhysicalPage {
        PhysicalPage(align_down(self.0, PAGE_SIZE))
    }

    /// Offset of this address within its frame.
    #[inline]
    #[must_use]
    pub const fn page_offset(self) -> u64 {
        self.0 & PAGE_MASK
    }

    #[inline]
    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        is_page_aligned(self.0)
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, rhs: u64) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PA(0x{:016X})", self.0)
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl Add<u64> for PhysicalAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl Sub<Self> for PhysicalAddress {
    type Output = u64;
    #[inline]
    fn sub(self, rhs: Self) -> Self::Output {
        self.0 - rhs.0
    }
}

impl From<u64> for PhysicalAddress {
    #[inline]
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Virtual memory address.
///
/// No canonicality is enforced on construction; use
/// [`VirtualAddress::is_canonical`] where the distinction matters.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(u64);

impl VirtualAddress {
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize as u64)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Interpret the address as a raw pointer.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as usize as *mut T
    }

    /// The page containing this address.
    #[inline]
    #[must_use]
    pub const fn page(self) -> VirtualPage {
        VirtualPage(align_down(self.0, PAGE_SIZE))
    }

    /// Offset of this address within its page.
    #[inline]
    #[must_use]
    pub const fn page_offset(self) -> u64 {
        self.0 & PAGE_MASK
    }

    #[inline]
    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        is_page_aligned(self.0)
    }

    /// Whether bits 63..48 replicate bit 47 (x86-64 4-level paging).
    #[inline]
    #[must_use]
    pub const fn is_canonical(self) -> bool {
        let upper = self.0 >> 47;
        upper == 0 || upper == 0x1_FFFF
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, rhs: u64) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA(0x{:016X})", self.0)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl Add<u64> for VirtualAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl Sub<Self> for VirtualAddress {
    type Output = u64;
    #[inline]
    fn sub(self, rhs: Self) -> Self::Output {
        self.0 - rhs.0
    }
}

impl From<u64> for VirtualAddress {
    #[inline]
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// A 4 KiB physical frame, identified by its base address.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalPage(u64);

impl PhysicalPage {
    /// Frame containing `addr` (aligns down).
    #[inline]
    #[must_use]
    pub const fn containing(addr: PhysicalAddress) -> Self {
        addr.page()
    }

    /// Frame with the given frame number (`base / PAGE_SIZE`).
    #[inline]
    #[must_use]
    pub const fn from_number(number: u64) -> Self {
        Self(number << PAGE_SHIFT)
    }

    /// Frame starting exactly at `addr`, or `None` if unaligned.
    #[inline]
    #[must_use]
    pub const fn from_aligned(addr: PhysicalAddress) -> Option<Self> {
        if addr.is_page_aligned() {
            Some(Self(addr.as_u64()))
        } else {
            None
        }
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        PhysicalAddress(self.0)
    }

    /// Frame number (`base / PAGE_SIZE`).
    #[inline]
    #[must_use]
    pub const fn number(self) -> u64 {
        self.0 >> PAGE_SHIFT
    }
}

impl fmt::Debug for PhysicalPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame(0x{:016X})", self.0)
    }
}

impl fmt::Display for PhysicalPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}/4K", self.0)
    }
}

/// A 4 KiB virtual page, identified by its base address.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualPage(u64);

impl VirtualPage {
    #[inline]
    #[must_use]
    pub const fn containing(addr: VirtualAddress) -> Self {
        addr.page()
    }

    #[inline]
    #[must_use]
    pub const fn from_aligned(addr: VirtualAddress) -> Option<Self> {
        if addr.is_page_aligned() {
            Some(Self(addr.as_u64()))
        } else {
            None
        }
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        VirtualAddress(self.0)
    }

    /// The page `count` pages after this one.
    #[inline]
    #[must_use]
    pub const fn forward(self, count: u64) -> Self {
        Self(self.0 + count * PAGE_SIZE)
    }
}

impl fmt::Debug for VirtualPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Page(0x{:016X})", self.0)
    }
}

impl fmt::Display for VirtualPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}/4K", self.0)
    }
}

/// Half-open range of virtual pages `[start, end)`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PageRange {
    start: u64,
    end: u64,
}

impl PageRange {
    /// Range between two page-aligned addresses; `end` is exclusive.
    ///
    /// Unaligned bounds are widened to the pages touching them.
    #[inline]
    #[must_use]
    pub const fn new(start: VirtualAddress, end: VirtualAddress) -> Self {
        let start = align_down(start.as_u64(), PAGE_SIZE);
        let end = align_up(end.as_u64(), PAGE_SIZE);
        if end < start {
            Self { start, end: start }
        } else {
            Self { start, end }
        }
    }

    /// Every page touched by `[addr, addr + len)`.
    #[inline]
    #[must_use]
    pub const fn covering(addr: VirtualAddress, len: u64) -> Self {
        Self::new(addr, VirtualAddress(addr.as_u64().saturating_add(len)))
    }

    #[inline]
    #[must_use]
    pub const fn start(&self) -> VirtualAddress {
        VirtualAddress(self.start)
    }

    #[inline]
    #[must_use]
    pub const fn end(&self) -> VirtualAddress {
        VirtualAddress(self.end)
    }

    /// Number of pages in the range.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> u64 {
        (self.end - self.start) / PAGE_SIZE
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.start == self.end
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, addr: VirtualAddress) -> bool {
        self.start <= addr.as_u64() && addr.as_u64() < self.end
    }
}

impl Iterator for PageRange {
    type Item = VirtualPage;

    fn next(&mut self) -> Option<Self::Item> {
        if self.start >= self.end {
            return None;
        }
        let page = VirtualPage(self.start);
        self.start += PAGE_SIZE;
        Some(page)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = usize::try_from(PageRange::len(self)).unwrap_or(usize::MAX);
        (n, Some(n))
    }
}
