//! # Physical Memory Manager
//!
//! Owns every physical frame of the machine. Two layers live here:
//!
//! * the [buddy allocator](buddy) handing out power-of-two blocks per
//!   [`Zone`], and
//! * the [frame registry](frame) with per-frame reference counts and owners,
//!   plus the [`Frame`] handle tying both together.
//!
//! ## Storage
//!
//! Nothing here allocates from the heap: the buddy bitmaps and the registry
//! live in caller-provided `'static` storage, sized via
//! [`ZoneLayout::bitmap_words`] and [`ZoneLayout::frames`]. At boot that
//! storage comes from the kernel image; tests leak vectors.
//!
//! ## Locking
//!
//! Each zone sits behind its own [`spin::Mutex`], held for the duration of a
//! single allocate, free or reserve. Reference counts are atomics.
//!
//! ```rust
//! # use kernel_pmm::*;
//! # fn demo(pmm: &'static PhysicalMemory) -> Result<(), BuddyError> {
//! let frame = pmm.alloc_frame(Zone::Normal)?;
//! assert_eq!(frame.refs(), 1);
//! drop(frame); // back to the buddy allocator
//! # Ok(())
//! # }
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

#[cfg(any(test, feature = "test-support"))]
extern crate alloc;

pub mod buddy;
pub mod frame;
mod zone;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use buddy::BuddyZone;
pub use frame::{Frame, FrameInfo, FrameOwner, FrameRegistry, ObjectId};
pub use zone::{ZONES, Zone, ZoneLayout};

use core::fmt;
use kernel_info::boot::BootMemoryMap;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalPage};
use log::{info, trace};

/// Errors reported by the physical memory manager.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum BuddyError {
    #[error("out of physical memory")]
    OutOfMemory,
    #[error("request of {0} bytes exceeds the largest buddy block")]
    TooLarge(u64),
    #[error("zero-sized request")]
    ZeroSize,
    #[error("address {0:#x} is not a block boundary")]
    Misaligned(u64),
    #[error("block at {0:#x} freed twice")]
    DoubleFree(u64),
    #[error("address {0} belongs to no zone")]
    NoZone(PhysicalAddress),
    #[error("address {0} is not in zone {1:?}")]
    WrongZone(PhysicalAddress, Zone),
    #[error("bitmap storage too small: need {needed} words, got {got}")]
    StorageTooSmall { needed: usize, got: usize },
    #[error("frame registry too small: need {needed} entries, got {got}")]
    RegistryTooSmall { needed: usize, got: usize },
    #[error("invalid zone layout")]
    InvalidLayout,
}

/// The machine's physical memory: buddy zones plus the frame registry.
pub struct PhysicalMemory {
    layout: ZoneLayout,
    zones: [spin::Mutex<BuddyZone>; ZONES],
    registry: FrameRegistry,
}

impl PhysicalMemory {
    /// Set up allocators for `layout` with every managed block free.
    ///
    /// # Errors
    /// Storage smaller than the layout requires.
    pub fn new(
        layout: ZoneLayout,
        bitmap_storage: &'static mut [u64],
        frames: &'static [FrameInfo],
    ) -> Result<Self, BuddyError> {
        let needed = layout.bitmap_words();
        if bitmap_storage.len() < needed {
            return Err(BuddyError::StorageTooSmall {
                needed,
                got: bitmap_storage.len(),
            });
        }
        if frames.len() < layout.frames() {
            return Err(BuddyError::RegistryTooSmall {
                needed: layout.frames(),
                got: frames.len(),
            });
        }

        let (dma_base, _) = layout.zone_range(Zone::Dma);
        let (dma, rest) = BuddyZone::new(
            dma_base,
            layout.top_blocks(Zone::Dma),
            layout.max_order(),
            bitmap_storage,
        )?;
        let (normal_base, _) = layout.zone_range(Zone::Normal);
        let (normal, _) = BuddyZone::new(
            normal_base,
            layout.top_blocks(Zone::Normal),
            layout.max_order(),
            rest,
        )?;

        let pmm = Self {
            layout,
            zones: [spin::Mutex::new(dma), spin::Mutex::new(normal)],
            registry: FrameRegistry::new(frames),
        };
        for zone in Zone::ALL {
            let (start, end) = layout.zone_range(zone);
            info!(
                "pmm: zone {} [{start:#x}, {end:#x}) {} KiB in {} block(s) of {} KiB",
                zone.name(),
                (end - start) / 1024,
                layout.top_blocks(zone),
                layout.max_block() / 1024
            );
        }
        Ok(pmm)
    }

    /// Like [`PhysicalMemory::new`], then reserve every non-usable region of `map`.
    ///
    /// # Errors
    /// Storage smaller than the layout requires.
    pub fn from_boot_map(
        layout: ZoneLayout,
        map: BootMemoryMap<'_>,
        bitmap_storage: &'static mut [u64],
        frames: &'static [FrameInfo],
    ) -> Result<Self, BuddyError> {
        let pmm = Self::new(layout, bitmap_storage, frames)?;
        for region in map.unusable() {
            pmm.reserve(region.start, region.len());
        }
        info!(
            "pmm: {} KiB total, {} KiB free after boot reservations",
            pmm.total_bytes() / 1024,
            pmm.free_bytes() / 1024
        );
        Ok(pmm)
    }

    #[inline]
    #[must_use]
    pub const fn layout(&self) -> &ZoneLayout {
        &self.layout
    }

    #[inline]
    #[must_use]
    pub const fn registry(&self) -> &FrameRegistry {
        &self.registry
    }

    /// Allocate a block of at least `size` bytes from `zone`.
    ///
    /// # Errors
    /// [`BuddyError::OutOfMemory`] if the zone cannot satisfy the request.
    pub fn allocate(&self, zone: Zone, size: u64) -> Result<PhysicalAddress, BuddyError> {
        let addr = self.zones[zone.index()].lock().allocate(size)?;
        trace!("pmm: allocated {size:#x} bytes at {addr:#x} from {}", zone.name());
        Ok(PhysicalAddress::new(addr))
    }

    /// Return a block to the zone that manages it.
    ///
    /// # Errors
    /// The address belongs to no zone, is misaligned for `size`, or the block
    /// is already free.
    pub fn free(&self, addr: PhysicalAddress, size: u64) -> Result<(), BuddyError> {
        let zone = self.layout.zone_of(addr).ok_or(BuddyError::NoZone(addr))?;
        self.free_in(zone, addr, size)
    }

    /// Return a block to `zone`.
    ///
    /// # Errors
    /// As [`PhysicalMemory::free`], plus [`BuddyError::WrongZone`].
    pub fn free_in(&self, zone: Zone, addr: PhysicalAddress, size: u64) -> Result<(), BuddyError> {
        if self.layout.zone_of(addr) != Some(zone) {
            return Err(BuddyError::WrongZone(addr, zone));
        }
        self.zones[zone.index()].lock().free(addr.as_u64(), size)?;
        trace!("pmm: freed {size:#x} bytes at {addr} to {}", zone.name());
        Ok(())
    }

    /// Permanently take `[start, start + len)` out of service.
    ///
    /// Must run before the allocator serves real requests.
    pub fn reserve(&self, start: PhysicalAddress, len: u64) {
        let end = start.as_u64().saturating_add(len);
        for zone in &self.zones {
            zone.lock().reserve(start.as_u64(), end);
        }
    }

    /// Allocate one frame from `zone` with a reference count of one.
    ///
    /// The contents are whatever the previous owner left behind.
    ///
    /// # Errors
    /// [`BuddyError::OutOfMemory`].
    pub fn alloc_frame(&'static self, zone: Zone) -> Result<Frame, BuddyError> {
        let page = self.allocate(zone, PAGE_SIZE)?.page();
        let previous = self.registry.refs(page);
        assert_eq!(previous, 0, "allocated frame {page} still has {previous} reference(s)");
        self.registry.reset(page, 1);
        Ok(Frame::fresh(page, self))
    }

    /// Allocate a raw frame outside the reference-counted [`Frame`] scheme.
    ///
    /// Used for page tables, whose registry count tracks populated entries.
    ///
    /// # Errors
    /// [`BuddyError::OutOfMemory`].
    pub fn alloc_raw_frame(&self, zone: Zone) -> Result<PhysicalPage, BuddyError> {
        let page = self.allocate(zone, PAGE_SIZE)?.page();
        self.registry.reset(page, 0);
        Ok(page)
    }

    /// Release a frame obtained from [`PhysicalMemory::alloc_raw_frame`].
    ///
    /// # Errors
    /// As [`PhysicalMemory::free`].
    pub fn free_raw_frame(&self, page: PhysicalPage) -> Result<(), BuddyError> {
        self.registry.reset(page, 0);
        self.free(page.base(), PAGE_SIZE)
    }

    /// Free bytes over all zones.
    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        self.zones.iter().map(|z| z.lock().free_bytes()).sum()
    }

    /// Free bytes in one zone.
    #[must_use]
    pub fn zone_free_bytes(&self, zone: Zone) -> u64 {
        self.zones[zone.index()].lock().free_bytes()
    }

    /// Bytes managed by the buddy allocator over all zones.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.zones.iter().map(|z| z.lock().total_bytes()).sum()
    }

    /// Managed bytes currently allocated or reserved.
    #[must_use]
    pub fn used_bytes(&self) -> u64 {
        self.total_bytes() - self.free_bytes()
    }
}

impl fmt::Debug for PhysicalMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysicalMemory")
            .field("layout", &self.layout)
            .field("total", &self.total_bytes())
            .field("free", &self.free_bytes())
            .finish_non_exhaustive()
    }
}
