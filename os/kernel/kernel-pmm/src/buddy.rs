//! # Buddy Allocator
//!
//! One [`BuddyZone`] manages one [`Zone`](crate::Zone) with a bitmap per order.
//! A set bit means "allocated or unavailable at this order"; a clear bit is a
//! free block of that order.
//!
//! ```text
//! order 2  [0           ][1           ]      top order: no buddy
//! order 1  [0     ][1     ][2    ][3    ]
//! order 0  [0][1][2][3][4][5][6][7]
//! ```
//!
//! * **Allocation** at order *k* claims the lowest free bit (starting at the
//!   `first_free` cursor). With none free, one block is taken from order *k+1*;
//!   its left child is returned and its right child becomes free at *k*.
//! * **Free** at order *k* checks the buddy (`idx ^ 1`). A free buddy is
//!   claimed and the parent is freed one order up; otherwise the block itself is
//!   marked free. Freeing at the top order is terminal.
//!
//! The allocator never touches the memory it manages; all state lives in the
//! bitmaps, which are carved out of caller-provided storage.

use crate::BuddyError;
use kernel_info::memory::{BUDDY_MAX_ORDER, BUDDY_MIN_BLOCK};
use log::{debug, warn};

/// Bitmap and bookkeeping for one order.
#[derive(Debug, Default)]
struct OrderMap {
    words: &'static mut [u64],
    bits: usize,
    first_free: usize,
    usable: usize,
}

impl OrderMap {
    /// A bitmap of `bits` bits, all marked allocated.
    fn new(words: &'static mut [u64], bits: usize) -> Self {
        words.fill(u64::MAX);
        Self {
            words,
            bits,
            first_free: bits,
            usable: 0,
        }
    }

    #[inline]
    fn is_set(&self, idx: usize) -> bool {
        self.words[idx / 64] & (1 << (idx % 64)) != 0
    }

    #[inline]
    fn set(&mut self, idx: usize) {
        debug_assert!(!self.is_set(idx));
        self.words[idx / 64] |= 1 << (idx % 64);
        self.usable -= 1;
    }

    #[inline]
    fn clear(&mut self, idx: usize) {
        debug_assert!(self.is_set(idx));
        self.words[idx / 64] &= !(1 << (idx % 64));
        self.usable += 1;
        if idx < self.first_free {
            self.first_free = idx;
        }
    }

    /// Lowest free index at or after the cursor.
    fn find_free(&self) -> Option<usize> {
        if self.usable == 0 {
            return None;
        }
        let mut w = self.first_free / 64;
        while w < self.words.len() {
            let word = self.words[w];
            if word != u64::MAX {
                let idx = w * 64 + (!word).trailing_zeros() as usize;
                return (idx < self.bits).then_some(idx);
            }
            w += 1;
        }
        None
    }
}

/// Buddy bitmaps of a single zone.
#[derive(Debug)]
pub struct BuddyZone {
    base: u64,
    max_order: usize,
    orders: [OrderMap; BUDDY_MAX_ORDER + 1],
}

impl BuddyZone {
    /// Words of storage [`BuddyZone::new`] needs for `top_blocks` top-order blocks.
    #[must_use]
    pub const fn storage_words(top_blocks: usize, max_order: usize) -> usize {
        let mut words = 0;
        let mut order = 0;
        while order <= max_order {
            words += (top_blocks << (max_order - order)).div_ceil(64);
            order += 1;
        }
        words
    }

    /// Create a zone starting at physical address `base` with `top_blocks`
    /// free top-order blocks.
    ///
    /// Returns the zone and the storage left over.
    ///
    /// # Errors
    /// [`BuddyError::StorageTooSmall`] if `storage` cannot hold all bitmaps.
    pub fn new(
        base: u64,
        top_blocks: usize,
        max_order: usize,
        storage: &'static mut [u64],
    ) -> Result<(Self, &'static mut [u64]), BuddyError> {
        let needed = Self::storage_words(top_blocks, max_order);
        if storage.len() < needed {
            return Err(BuddyError::StorageTooSmall {
                needed,
                got: storage.len(),
            });
        }

        let mut rest = storage;
        let mut orders: [OrderMap; BUDDY_MAX_ORDER + 1] = core::array::from_fn(|order| {
            if order > max_order {
                return OrderMap::default();
            }
            let bits = top_blocks << (max_order - order);
            let (head, tail) = core::mem::take(&mut rest).split_at_mut(bits.div_ceil(64));
            rest = tail;
            OrderMap::new(head, bits)
        });

        for idx in 0..top_blocks {
            orders[max_order].clear(idx);
        }

        Ok((
            Self {
                base,
                max_order,
                orders,
            },
            rest,
        ))
    }

    #[inline]
    #[must_use]
    pub const fn base(&self) -> u64 {
        self.base
    }

    /// Block size in bytes at `order`.
    #[inline]
    #[must_use]
    pub const fn block_size(order: usize) -> u64 {
        BUDDY_MIN_BLOCK << order
    }

    /// Smallest order whose blocks hold `size` bytes.
    ///
    /// # Errors
    /// [`BuddyError::ZeroSize`] or [`BuddyError::TooLarge`].
    pub const fn order_for(&self, size: u64) -> Result<usize, BuddyError> {
        if size == 0 {
            return Err(BuddyError::ZeroSize);
        }
        let mut order = 0;
        while Self::block_size(order) < size {
            if order == self.max_order {
                return Err(BuddyError::TooLarge(size));
            }
            order += 1;
        }
        Ok(order)
    }

    /// Free bytes in this zone, summed over every order.
    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        (0..=self.max_order)
            .map(|order| self.orders[order].usable as u64 * Self::block_size(order))
            .sum()
    }

    /// Total bytes managed by this zone.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.orders[self.max_order].bits as u64 * Self::block_size(self.max_order)
    }

    /// Number of free blocks at `order`.
    #[must_use]
    pub fn free_blocks(&self, order: usize) -> usize {
        self.orders.get(order).map_or(0, |o| o.usable)
    }

    /// Allocate a block holding at least `size` bytes; returns its physical address.
    ///
    /// # Errors
    /// [`BuddyError::OutOfMemory`] when no block of a fitting order can be found
    /// up to and including the top order.
    pub fn allocate(&mut self, size: u64) -> Result<u64, BuddyError> {
        let order = self.order_for(size)?;
        let idx = self.alloc_order(order).ok_or(BuddyError::OutOfMemory)?;
        Ok(self.base + idx as u64 * Self::block_size(order))
    }

    fn alloc_order(&mut self, order: usize) -> Option<usize> {
        if let Some(idx) = self.orders[order].find_free() {
            let map = &mut self.orders[order];
            map.set(idx);
            map.first_free = idx + 1;
            return Some(idx);
        }

        if order == self.max_order {
            return None;
        }

        let parent = self.alloc_order(order + 1)?;
        let left = parent << 1;
        self.orders[order].clear(left | 1);
        Some(left)
    }

    /// Return the block at `addr` that was allocated with `size`.
    ///
    /// # Errors
    /// [`BuddyError::DoubleFree`] if the block is already free at its order,
    /// [`BuddyError::Misaligned`] if `addr` is not a block boundary of that order.
    pub fn free(&mut self, addr: u64, size: u64) -> Result<(), BuddyError> {
        let order = self.order_for(size)?;
        let block = Self::block_size(order);
        let offset = addr.checked_sub(self.base).ok_or(BuddyError::Misaligned(addr))?;
        if !offset.is_multiple_of(block) {
            return Err(BuddyError::Misaligned(addr));
        }
        let idx = usize::try_from(offset / block).map_err(|_| BuddyError::Misaligned(addr))?;
        if idx >= self.orders[order].bits {
            return Err(BuddyError::Misaligned(addr));
        }
        if !self.orders[order].is_set(idx) {
            return Err(BuddyError::DoubleFree(addr));
        }

        self.free_order(order, idx);
        Ok(())
    }

    fn free_order(&mut self, order: usize, idx: usize) {
        let buddy = idx ^ 1;
        if order < self.max_order && !self.orders[order].is_set(buddy) {
            self.orders[order].set(buddy);
            self.free_order(order + 1, idx >> 1);
        } else {
            self.orders[order].clear(idx);
        }
    }

    /// Mark every top-order block overlapping `[start, end)` unusable.
    ///
    /// Returns the number of blocks newly taken out of service. Blocks that
    /// are already split or allocated are left alone.
    pub fn reserve(&mut self, start: u64, end: u64) -> usize {
        let top = Self::block_size(self.max_order);
        let zone_end = self.base + self.total_bytes();
        let start = start.max(self.base);
        let end = end.min(zone_end);
        if start >= end {
            return 0;
        }

        #[allow(clippy::cast_possible_truncation)]
        let first = ((start - self.base) / top) as usize;
        #[allow(clippy::cast_possible_truncation)]
        let last = ((end - 1 - self.base) / top) as usize;

        let mut taken = 0;
        let map = &mut self.orders[self.max_order];
        for idx in first..=last {
            if map.is_set(idx) {
                warn!(
                    "buddy: reserve of {:#x} overlaps block {idx} which is already in use",
                    self.base + idx as u64 * top
                );
                continue;
            }
            map.set(idx);
            taken += 1;
        }
        if let Some(free) = map.find_free() {
            map.first_free = free;
        }
        debug!("buddy: reserved [{start:#x}, {end:#x}) as {taken} top-order block(s)");
        taken
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zone(top_blocks: usize, max_order: usize) -> BuddyZone {
        let words = vec![0u64; BuddyZone::storage_words(top_blocks, max_order)].leak();
        let (zone, rest) = BuddyZone::new(0, top_blocks, max_order, words).unwrap();
        assert!(rest.is_empty());
        zone
    }

    #[test]
    fn order_rounding() {
        let z = zone(1, 3);
        assert_eq!(z.order_for(1), Ok(0));
        assert_eq!(z.order_for(4096), Ok(0));
        assert_eq!(z.order_for(4097), Ok(1));
        assert_eq!(z.order_for(32 * 1024), Ok(3));
        assert_eq!(z.order_for(32 * 1024 + 1), Err(BuddyError::TooLarge(32 * 1024 + 1)));
        assert_eq!(z.order_for(0), Err(BuddyError::ZeroSize));
    }

    #[test]
    fn split_returns_left_child_and_frees_right() {
        let mut z = zone(1, 2);
        assert_eq!(z.allocate(4096), Ok(0));
        assert_eq!(z.free_blocks(0), 1);
        assert_eq!(z.free_blocks(1), 1);
        assert_eq!(z.free_blocks(2), 0);

        // The freed right child at order 0 is handed out next.
        assert_eq!(z.allocate(4096), Ok(4096));
        assert_eq!(z.allocate(4096), Ok(8192));
    }

    #[test]
    fn free_merges_back_to_top_order() {
        let mut z = zone(2, 2);
        let total = z.free_bytes();
        let a = z.allocate(4096).unwrap();
        let b = z.allocate(4096).unwrap();
        let c = z.allocate(8192).unwrap();
        assert_eq!(z.free_bytes(), total - 4 * 4096);

        z.free(b, 4096).unwrap();
        z.free(a, 4096).unwrap();
        z.free(c, 8192).unwrap();
        assert_eq!(z.free_bytes(), total);
        assert_eq!(z.free_blocks(2), 2);
        assert_eq!(z.free_blocks(0), 0);
    }

    #[test]
    fn exhaustion_is_reported() {
        let mut z = zone(1, 1);
        z.allocate(4096).unwrap();
        z.allocate(4096).unwrap();
        assert_eq!(z.allocate(4096), Err(BuddyError::OutOfMemory));
    }

    #[test]
    fn double_free_is_detected() {
        let mut z = zone(1, 2);
        let a = z.allocate(4096).unwrap();
        let _b = z.allocate(4096).unwrap();
        z.free(a, 4096).unwrap();
        assert_eq!(z.free(a, 4096), Err(BuddyError::DoubleFree(a)));
    }

    #[test]
    fn misaligned_free_is_rejected() {
        let mut z = zone(1, 2);
        let _ = z.allocate(8192).unwrap();
        assert_eq!(z.free(4096, 8192), Err(BuddyError::Misaligned(4096)));
    }

    #[test]
    fn reserve_takes_whole_top_blocks() {
        let mut z = zone(4, 1);
        let top = BuddyZone::block_size(1);
        assert_eq!(z.reserve(top + 100, top + 200), 1);
        assert_eq!(z.free_bytes(), 3 * top);

        // Allocation skips the reserved block.
        assert_eq!(z.allocate(top), Ok(0));
        assert_eq!(z.allocate(top), Ok(2 * top));
        assert_eq!(z.reserve(0, 1), 0);
    }
}
