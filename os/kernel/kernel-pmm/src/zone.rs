//! # Memory Zones
//!
//! Physical memory is split into two zones with independent buddy bitmaps:
//!
//! | Zone | Range | Used for |
//! |------|-------|----------|
//! | [`Zone::Dma`] | `[0, dma_end)` | legacy DMA-capable buffers |
//! | [`Zone::Normal`] | `[dma_end, total)` | everything else |
//!
//! Each zone is managed in whole top-order blocks; a trailing remainder smaller
//! than one top-order block is left unmanaged.

use crate::BuddyError;
use kernel_info::memory::{BUDDY_MAX_ORDER, BUDDY_MIN_BLOCK, DMA_ZONE_END};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, align_down};

/// Number of zones.
pub const ZONES: usize = 2;

/// A physical memory zone.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Zone {
    Dma = 0,
    Normal = 1,
}

impl Zone {
    /// All zones in index order.
    pub const ALL: [Self; ZONES] = [Self::Dma, Self::Normal];

    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Dma => "DMA",
            Self::Normal => "NORMAL",
        }
    }
}

/// Geometry of physical memory as seen by the buddy allocator.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ZoneLayout {
    total: u64,
    dma_end: u64,
    max_order: usize,
}

impl ZoneLayout {
    /// Build a layout for `total` bytes of RAM.
    ///
    /// # Errors
    /// [`BuddyError::InvalidLayout`] if `max_order` exceeds the compiled-in
    /// maximum or `dma_end` is not a multiple of the top block size.
    pub const fn new(total: u64, dma_end: u64, max_order: usize) -> Result<Self, BuddyError> {
        if max_order > BUDDY_MAX_ORDER {
            return Err(BuddyError::InvalidLayout);
        }
        let top = BUDDY_MIN_BLOCK << max_order;
        if !dma_end.is_multiple_of(top) {
            return Err(BuddyError::InvalidLayout);
        }
        Ok(Self {
            total: align_down(total, PAGE_SIZE),
            dma_end,
            max_order,
        })
    }

    /// The kernel's standard layout: 16 MiB DMA zone, order-10 top blocks.
    #[must_use]
    pub const fn standard(total: u64) -> Self {
        Self {
            total: align_down(total, PAGE_SIZE),
            dma_end: DMA_ZONE_END,
            max_order: BUDDY_MAX_ORDER,
        }
    }

    #[inline]
    #[must_use]
    pub const fn total_memory(&self) -> u64 {
        self.total
    }

    #[inline]
    #[must_use]
    pub const fn max_order(&self) -> usize {
        self.max_order
    }

    /// Size of a top-order block in bytes.
    #[inline]
    #[must_use]
    pub const fn max_block(&self) -> u64 {
        BUDDY_MIN_BLOCK << self.max_order
    }

    /// Number of frames covered by the frame registry.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn frames(&self) -> usize {
        (self.total / PAGE_SIZE) as usize
    }

    /// The managed byte range `[start, end)` of `zone`, trimmed to whole top blocks.
    #[must_use]
    pub const fn zone_range(&self, zone: Zone) -> (u64, u64) {
        let (start, end) = match zone {
            Zone::Dma => (0, if self.dma_end < self.total { self.dma_end } else { self.total }),
            Zone::Normal => (self.dma_end, self.total),
        };
        if end <= start {
            return (start, start);
        }
        (start, start + align_down(end - start, self.max_block()))
    }

    /// Number of top-order blocks in `zone`.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn top_blocks(&self, zone: Zone) -> usize {
        let (start, end) = self.zone_range(zone);
        ((end - start) / self.max_block()) as usize
    }

    /// Number of bits tracked at `order` in `zone`.
    #[inline]
    #[must_use]
    pub const fn bits_at(&self, zone: Zone, order: usize) -> usize {
        self.top_blocks(zone) << (self.max_order - order)
    }

    /// Words of bitmap storage needed by every order of every zone.
    #[must_use]
    pub const fn bitmap_words(&self) -> usize {
        let mut words = 0;
        let mut z = 0;
        while z < ZONES {
            let zone = Zone::ALL[z];
            let mut order = 0;
            while order <= self.max_order {
                words += self.bits_at(zone, order).div_ceil(64);
                order += 1;
            }
            z += 1;
        }
        words
    }

    /// The zone managing `addr`, if any.
    #[must_use]
    pub const fn zone_of(&self, addr: PhysicalAddress) -> Option<Zone> {
        let a = addr.as_u64();
        let mut z = 0;
        while z < ZONES {
            let zone = Zone::ALL[z];
            let (start, end) = self.zone_range(zone);
            if start <= a && a < end {
                return Some(zone);
            }
            z += 1;
        }
        None
    }
}
