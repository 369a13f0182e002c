//! # Boot Memory Map
//!
//! The physical memory description handed to the memory manager at boot.
//! Firmware descriptors are translated into [`MemoryRegion`]s by the loader
//! glue; this crate only defines the neutral shape.

use kernel_memory_addresses::PhysicalAddress;

/// What a physical range may be used for.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MemoryRegionKind {
    /// Free RAM, handed to the buddy allocator.
    Usable,
    /// Firmware or hardware reserved; never allocated.
    Reserved,
    /// The loaded kernel image.
    KernelImage,
    /// A module loaded alongside the kernel (initrd and friends).
    BootModule,
}

/// A half-open physical range `[start, end)`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemoryRegion {
    pub start: PhysicalAddress,
    pub end: PhysicalAddress,
    pub kind: MemoryRegionKind,
}

impl MemoryRegion {
    #[must_use]
    pub const fn new(start: u64, end: u64, kind: MemoryRegionKind) -> Self {
        Self {
            start: PhysicalAddress::new(start),
            end: PhysicalAddress::new(end),
            kind,
        }
    }

    /// Length in bytes; zero for inverted ranges.
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.end.as_u64().saturating_sub(self.start.as_u64())
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub const fn is_usable(&self) -> bool {
        matches!(self.kind, MemoryRegionKind::Usable)
    }
}

/// Borrowed view over the boot memory map.
#[derive(Copy, Clone, Debug)]
pub struct BootMemoryMap<'a> {
    regions: &'a [MemoryRegion],
}

impl<'a> BootMemoryMap<'a> {
    #[must_use]
    pub const fn new(regions: &'a [MemoryRegion]) -> Self {
        Self { regions }
    }

    pub fn regions(&self) -> impl Iterator<Item = &'a MemoryRegion> + 'a {
        self.regions.iter()
    }

    /// Ranges that must never be handed out.
    pub fn unusable(&self) -> impl Iterator<Item = &'a MemoryRegion> + 'a {
        self.regions.iter().filter(|r| !r.is_usable())
    }

    /// End of the highest usable region; the amount of memory to manage.
    #[must_use]
    pub fn total_memory(&self) -> u64 {
        self.regions
            .iter()
            .filter(|r| r.is_usable())
            .map(|r| r.end.as_u64())
            .max()
            .unwrap_or(0)
    }
}
