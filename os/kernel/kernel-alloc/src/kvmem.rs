//! The node-list allocator.

use crate::{AllocFlags, KvmemError, MallocType, PageBacking};
use bitfield_struct::bitfield;
use core::fmt;
use core::ops::Range;
use core::ptr::NonNull;
use kernel_info::memory::{KVMEM_BASE, KVMEM_SIZE};
use kernel_memory_addresses::{PAGE_SIZE, PageRange, VirtualAddress, align_down, align_up};
use log::{info, trace, warn};

/// Allocation granule in bytes; node addresses and sizes count these.
const UNIT: u64 = 4;

/// Largest node, in units (just under 256 MiB).
pub const MAX_NODE_SIZE: u32 = (1 << 26) - 1;

/// Largest region, in units (1 GiB).
const MAX_REGION_UNITS: u64 = 1 << 28;

/// End-of-list marker.
const NIL: u32 = u32::MAX;

#[bitfield(u64)]
struct NodeBits {
    /// Offset into the region, in units.
    #[bits(28)]
    addr: u32,
    free: bool,
    /// Size in units; 0 marks a spare record.
    #[bits(26)]
    size: u32,
    #[bits(9)]
    __: u16,
}

/// One record of the node array.
#[derive(Copy, Clone)]
pub struct Node {
    bits: NodeBits,
    next: u32,
    tag: Option<&'static MallocType>,
}

impl Node {
    /// A spare record.
    pub const EMPTY: Self = Self {
        bits: NodeBits::new(),
        next: NIL,
        tag: None,
    };

    const fn free(addr: u32, size: u32, next: u32) -> Self {
        Self {
            bits: NodeBits::new()
                .with_addr(addr)
                .with_free(true)
                .with_size(size),
            next,
            tag: None,
        }
    }

    const fn is_spare(&self) -> bool {
        self.bits.size() == 0
    }

    const fn end(&self) -> u32 {
        self.bits.addr() + self.bits.size()
    }
}

impl Default for Node {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// A node as reported by [`Kvmem::for_each_node`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct NodeInfo {
    pub address: VirtualAddress,
    pub size: u64,
    pub free: bool,
    pub tag: Option<&'static str>,
}

/// A freed node after merging, and the run of free nodes around it, in units.
struct Freed {
    node: Range<u32>,
    run: Range<u32>,
}

/// Node array plus accounting; guarded by the kvmem lock.
struct NodeList {
    nodes: &'static mut [Node],
    /// First free node in list order, or [`NIL`].
    cursor: u32,
    /// Lowest index that may be a spare record.
    spare_hint: usize,
    used: u64,
    objects: usize,
}

impl NodeList {
    #[inline]
    fn at(&self, i: u32) -> &Node {
        &self.nodes[i as usize]
    }

    #[inline]
    fn at_mut(&mut self, i: u32) -> &mut Node {
        &mut self.nodes[i as usize]
    }

    /// Find `N` spare records without claiming them.
    #[allow(clippy::cast_possible_truncation)]
    fn spares<const N: usize>(&self, need: usize) -> Result<[u32; N], KvmemError> {
        let mut found = [NIL; N];
        let mut n = 0;
        let len = self.nodes.len();
        for k in 0..len {
            if n == need {
                break;
            }
            let i = (self.spare_hint + k) % len;
            if i != 0 && self.nodes[i].is_spare() {
                found[n] = i as u32;
                n += 1;
            }
        }
        if n < need {
            return Err(KvmemError::NoFreeNodes);
        }
        Ok(found)
    }

    fn retire(&mut self, i: u32) {
        *self.at_mut(i) = Node::EMPTY;
        self.spare_hint = self.spare_hint.min(i as usize);
    }

    /// Keep node `i` at `keep` units and turn the rest into free node `spare`.
    fn split(&mut self, i: u32, keep: u32, spare: u32) {
        let node = *self.at(i);
        *self.at_mut(spare) = Node::free(
            node.bits.addr() + keep,
            node.bits.size() - keep,
            node.next,
        );
        let node = self.at_mut(i);
        node.bits.set_size(keep);
        node.next = spare;
        self.spare_hint = self.spare_hint.max(spare as usize + 1) % self.nodes.len();
    }

    fn settle_cursor(&mut self) {
        while self.cursor != NIL && !self.at(self.cursor).bits.free() {
            self.cursor = self.at(self.cursor).next;
        }
    }

    /// First fit for `units` at a byte alignment of `align`. Returns the node.
    fn allocate(&mut self, units: u32, align: u64, tag: &'static MallocType) -> Result<u32, KvmemError> {
        let mut i = self.cursor;
        let mut pad = 0;
        while i != NIL {
            let node = self.at(i);
            if node.bits.free() {
                let offset = u64::from(node.bits.addr()) * UNIT;
                #[allow(clippy::cast_possible_truncation)]
                let p = ((align_up(offset, align) - offset) / UNIT) as u32;
                if u64::from(node.bits.size()) >= u64::from(p) + u64::from(units) {
                    pad = p;
                    break;
                }
            }
            i = node.next;
        }
        if i == NIL {
            return Err(KvmemError::OutOfMemory);
        }

        let size = self.at(i).bits.size();
        let need = usize::from(pad > 0) + usize::from(size > pad + units);
        let mut spares = self.spares::<2>(need)?.into_iter();

        if pad > 0 {
            let fragment = i;
            i = spares.next().unwrap_or(NIL);
            self.split(fragment, pad, i);
        }
        if self.at(i).bits.size() > units {
            let rest = spares.next().unwrap_or(NIL);
            self.split(i, units, rest);
        }

        let node = self.at_mut(i);
        node.bits.set_free(false);
        node.tag = Some(tag);
        let bytes = u64::from(units) * UNIT;
        self.used += bytes;
        self.objects += 1;
        #[allow(clippy::cast_possible_truncation)]
        tag.charge(bytes as usize);
        self.settle_cursor();
        Ok(i)
    }

    /// Free the node starting at unit offset `addr`.
    ///
    /// Neighbours merge while the result stays within [`MAX_NODE_SIZE`]; the
    /// returned run also spans free neighbours that could not be merged.
    fn release(&mut self, addr: u32, va: VirtualAddress) -> Result<Freed, KvmemError> {
        let mut prev = NIL;
        let mut cur = 0;
        let mut run_start = None;
        loop {
            let node = self.at(cur);
            if node.bits.addr() == addr {
                break;
            }
            if node.bits.addr() > addr || node.next == NIL {
                return Err(KvmemError::NotAllocated(va));
            }
            run_start = if node.bits.free() {
                run_start.or(Some(node.bits.addr()))
            } else {
                None
            };
            prev = cur;
            cur = node.next;
        }
        if self.at(cur).bits.free() {
            if let Some(tag) = self.at(cur).tag {
                warn!("kvmem: double free of a {} object", tag.name());
            }
            return Err(KvmemError::DoubleFree(va));
        }

        let node = self.at_mut(cur);
        node.bits.set_free(true);
        let tag = node.tag.take();
        let bytes = u64::from(node.bits.size()) * UNIT;
        self.used -= bytes;
        self.objects -= 1;
        if let Some(tag) = tag {
            #[allow(clippy::cast_possible_truncation)]
            tag.discharge(bytes as usize);
        }

        let next = self.at(cur).next;
        if next != NIL && self.fits_merged(cur, next) {
            let absorbed = *self.at(next);
            let node = self.at_mut(cur);
            node.bits.set_size(node.bits.size() + absorbed.bits.size());
            node.next = absorbed.next;
            self.retire(next);
        }
        if prev != NIL && self.fits_merged(prev, cur) {
            let absorbed = *self.at(cur);
            let node = self.at_mut(prev);
            node.bits.set_size(node.bits.size() + absorbed.bits.size());
            node.next = absorbed.next;
            self.retire(cur);
            cur = prev;
        }

        if self.cursor == NIL
            || self.at(self.cursor).is_spare()
            || self.at(cur).bits.addr() <= self.at(self.cursor).bits.addr()
        {
            self.cursor = cur;
        }

        let node = *self.at(cur);
        let mut run_end = node.end();
        let mut next = node.next;
        while next != NIL && self.at(next).bits.free() {
            run_end = self.at(next).end();
            next = self.at(next).next;
        }
        Ok(Freed {
            node: node.bits.addr()..node.end(),
            run: run_start.unwrap_or(node.bits.addr())..run_end,
        })
    }

    fn fits_merged(&self, a: u32, b: u32) -> bool {
        let (a, b) = (self.at(a), self.at(b));
        a.bits.free()
            && b.bits.free()
            && u64::from(a.bits.size()) + u64::from(b.bits.size()) <= u64::from(MAX_NODE_SIZE)
    }

    fn count(&self) -> usize {
        let mut n = 0;
        let mut i = 0;
        while i != NIL {
            n += 1;
            i = self.at(i).next;
        }
        n
    }
}

/// The kernel allocator over one virtual region.
pub struct Kvmem<B: PageBacking> {
    base: VirtualAddress,
    size: u64,
    list: spin::Mutex<NodeList>,
    backing: B,
}

impl<B: PageBacking> Kvmem<B> {
    /// Manage `[base, base + size)` with node records from `nodes`.
    ///
    /// # Errors
    /// [`KvmemError::InvalidRegion`] for an unaligned or oversized region,
    /// [`KvmemError::NoFreeNodes`] if `nodes` cannot even describe the empty
    /// region.
    #[allow(clippy::cast_possible_truncation)]
    pub fn new(
        base: VirtualAddress,
        size: u64,
        nodes: &'static mut [Node],
        backing: B,
    ) -> Result<Self, KvmemError> {
        let units = size / UNIT;
        if !base.is_page_aligned()
            || size == 0
            || !size.is_multiple_of(UNIT)
            || units > MAX_REGION_UNITS
            || base.checked_add(size).is_none()
        {
            return Err(KvmemError::InvalidRegion);
        }
        let initial = units.div_ceil(u64::from(MAX_NODE_SIZE)) as usize;
        if nodes.len() < initial || nodes.len() >= NIL as usize {
            return Err(KvmemError::NoFreeNodes);
        }

        nodes.fill(Node::EMPTY);
        let mut remaining = units;
        for (i, node) in nodes.iter_mut().take(initial).enumerate() {
            let chunk = remaining.min(u64::from(MAX_NODE_SIZE)) as u32;
            let next = if i + 1 == initial { NIL } else { i as u32 + 1 };
            *node = Node::free((i as u64 * u64::from(MAX_NODE_SIZE)) as u32, chunk, next);
            remaining -= u64::from(chunk);
        }

        info!(
            "kvmem: {} KiB at {base} with {} node records",
            size / 1024,
            nodes.len()
        );
        Ok(Self {
            base,
            size,
            list: spin::Mutex::new(NodeList {
                nodes,
                cursor: 0,
                spare_hint: initial,
                used: 0,
                objects: 0,
            }),
            backing,
        })
    }

    /// The kernel's kvmem region from the memory layout.
    ///
    /// # Errors
    /// As [`Kvmem::new`].
    pub fn standard(nodes: &'static mut [Node], backing: B) -> Result<Self, KvmemError> {
        Self::new(VirtualAddress::new(KVMEM_BASE), KVMEM_SIZE, nodes, backing)
    }

    #[must_use]
    pub const fn base(&self) -> VirtualAddress {
        self.base
    }

    #[must_use]
    pub const fn backing(&self) -> &B {
        &self.backing
    }

    /// Allocate `size` bytes tagged with `tag`.
    ///
    /// # Errors
    /// [`KvmemError::OutOfMemory`] if no node fits or pages cannot be
    /// populated, [`KvmemError::NoFreeNodes`] if splitting needs records that
    /// are not available.
    pub fn allocate(
        &self,
        size: usize,
        tag: &'static MallocType,
        flags: AllocFlags,
    ) -> Result<NonNull<u8>, KvmemError> {
        self.allocate_aligned(size, UNIT as usize, tag, flags)
    }

    /// Allocate `size` bytes at an `align`-byte boundary (at most one page).
    ///
    /// # Errors
    /// As [`Kvmem::allocate`], plus [`KvmemError::BadAlignment`].
    pub fn allocate_aligned(
        &self,
        size: usize,
        align: usize,
        tag: &'static MallocType,
        flags: AllocFlags,
    ) -> Result<NonNull<u8>, KvmemError> {
        if !align.is_power_of_two() || align as u64 > PAGE_SIZE {
            return Err(KvmemError::BadAlignment(align));
        }
        let units = u32::try_from((size as u64).div_ceil(UNIT).max(1))
            .ok()
            .filter(|&u| u <= MAX_NODE_SIZE)
            .ok_or(KvmemError::TooLarge(size))?;

        let mut list = self.list.lock();
        let i = list.allocate(units, (align as u64).max(UNIT), tag)?;
        let addr = list.at(i).bits.addr();
        let va = self.address(addr);
        let bytes = u64::from(units) * UNIT;

        let first = align_down(va.as_u64(), PAGE_SIZE);
        let end = align_up(va.as_u64() + bytes, PAGE_SIZE);
        for page in (first..end).step_by(PAGE_SIZE as usize) {
            if let Err(e) = self.backing.populate(VirtualAddress::new(page)) {
                warn!("kvmem: cannot back {page:#x} for a {} object: {e}", tag.name());
                let freed = list
                    .release(addr, va)
                    .unwrap_or_else(|e| panic!("kvmem: rollback failed: {e}"));
                self.release_pages(&freed);
                return Err(KvmemError::OutOfMemory);
            }
        }
        drop(list);

        trace!("kvmem: {size} bytes at {va} for {}", tag.name());
        let ptr = NonNull::new(va.as_mut_ptr::<u8>()).ok_or(KvmemError::OutOfMemory)?;
        if flags.contains(AllocFlags::ZERO) {
            // SAFETY: the node covers at least `size` bytes, all backed above.
            unsafe { ptr.write_bytes(0, size) };
        }
        Ok(ptr)
    }

    /// Free the allocation starting at `ptr`, reporting inconsistencies.
    ///
    /// # Errors
    /// [`KvmemError::BelowBase`], [`KvmemError::NotAllocated`] or
    /// [`KvmemError::DoubleFree`]; the allocator is unchanged in each case.
    pub fn try_free(&self, ptr: NonNull<u8>) -> Result<(), KvmemError> {
        let va = VirtualAddress::from_ptr(ptr.as_ptr());
        if va < self.base {
            return Err(KvmemError::BelowBase(va));
        }
        let offset = va - self.base;
        if offset >= self.size || !offset.is_multiple_of(UNIT) {
            return Err(KvmemError::NotAllocated(va));
        }
        #[allow(clippy::cast_possible_truncation)]
        let addr = (offset / UNIT) as u32;

        let mut list = self.list.lock();
        let freed = list.release(addr, va)?;
        self.release_pages(&freed);
        trace!("kvmem: freed {va}");
        Ok(())
    }

    /// Free the allocation starting at `ptr`.
    ///
    /// # Panics
    /// On double free, on addresses below the region and on addresses that
    /// start no allocation.
    pub fn free(&self, ptr: NonNull<u8>) {
        if let Err(e) = self.try_free(ptr) {
            panic!("kvmem: {e}");
        }
    }

    /// Hand back every page touching the freed node that lies wholly inside
    /// free memory, including pages that straddle into unmerged neighbours.
    fn release_pages(&self, freed: &Freed) {
        let start = self.address(freed.node.start).as_u64();
        let end = self.address(freed.node.end).as_u64();
        let first = align_up(self.address(freed.run.start).as_u64(), PAGE_SIZE)
            .max(align_down(start, PAGE_SIZE));
        let last = align_down(self.address(freed.run.end).as_u64(), PAGE_SIZE)
            .min(align_up(end, PAGE_SIZE));
        if first < last {
            self.backing
                .release(PageRange::new(VirtualAddress::new(first), VirtualAddress::new(last)));
        }
    }

    fn address(&self, units: u32) -> VirtualAddress {
        self.base + u64::from(units) * UNIT
    }

    /// Bytes handed out and not yet freed (rounded to units).
    #[must_use]
    pub fn used_bytes(&self) -> u64 {
        self.list.lock().used
    }

    /// Allocations not yet freed.
    #[must_use]
    pub fn live_objects(&self) -> usize {
        self.list.lock().objects
    }

    /// Number of nodes in the list.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.list.lock().count()
    }

    /// Call `f` for every node in address order, under the allocator lock.
    ///
    /// `f` must not allocate from this instance.
    pub fn for_each_node(&self, mut f: impl FnMut(NodeInfo)) {
        let list = self.list.lock();
        let mut i = 0;
        while i != NIL {
            let node = list.at(i);
            f(NodeInfo {
                address: self.address(node.bits.addr()),
                size: u64::from(node.bits.size()) * UNIT,
                free: node.bits.free(),
                tag: node.tag.map(MallocType::name),
            });
            i = node.next;
        }
    }

    /// Log every node.
    pub fn dump_nodes(&self) {
        info!("kvmem: nodes of {}", self.base);
        let list = self.list.lock();
        let mut i = 0;
        while i != NIL {
            let node = list.at(i);
            let size = u64::from(node.bits.size()) * UNIT;
            info!(
                "  node[{i:6}] {} {:>10} B ({:>6} KiB) {:<4} {}",
                self.address(node.bits.addr()),
                size,
                size / 1024,
                if node.bits.free() { "free" } else { "used" },
                node.tag.map_or("", MallocType::name)
            );
            i = node.next;
        }
    }
}

impl<B: PageBacking> fmt::Debug for Kvmem<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let list = self.list.lock();
        f.debug_struct("Kvmem")
            .field("base", &self.base)
            .field("size", &self.size)
            .field("used", &list.used)
            .field("objects", &list.objects)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::vec::Vec;

    #[repr(C, align(4096))]
    struct Page([u8; 4096]);

    /// Host memory posing as the kvmem region; records page population.
    #[derive(Default)]
    struct HostBacking {
        populated: spin::Mutex<BTreeSet<u64>>,
        releases: AtomicUsize,
        budget: Option<AtomicUsize>,
    }

    impl PageBacking for HostBacking {
        fn populate(&self, page: VirtualAddress) -> Result<(), KvmemError> {
            let mut populated = self.populated.lock();
            if populated.contains(&page.as_u64()) {
                return Ok(());
            }
            if let Some(budget) = &self.budget {
                if budget
                    .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |b| b.checked_sub(1))
                    .is_err()
                {
                    return Err(KvmemError::OutOfMemory);
                }
            }
            populated.insert(page.as_u64());
            Ok(())
        }

        fn release(&self, range: PageRange) {
            let mut populated = self.populated.lock();
            for page in range {
                if populated.remove(&page.base().as_u64()) {
                    self.releases.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    fn kvmem_with(pages: usize, records: usize, backing: HostBacking) -> Kvmem<HostBacking> {
        let region: Vec<Page> = (0..pages).map(|_| Page([0xCC; 4096])).collect();
        let region = region.leak();
        let base = VirtualAddress::from_ptr(region.as_ptr());
        let nodes = std::vec![Node::EMPTY; records].leak();
        Kvmem::new(base, pages as u64 * PAGE_SIZE, nodes, backing).unwrap()
    }

    fn kvmem(pages: usize) -> Kvmem<HostBacking> {
        kvmem_with(pages, 64, HostBacking::default())
    }

    fn layout(k: &Kvmem<HostBacking>) -> Vec<(u64, u64, bool)> {
        let mut out = Vec::new();
        k.for_each_node(|n| out.push((n.address - k.base(), n.size, n.free)));
        out
    }

    static M_TEST: MallocType = MallocType::new("kvmem-test", "kvmem unit tests");

    #[test]
    fn first_fit_splits_and_free_merges() {
        let k = kvmem(4);
        let a = k.allocate(10, &M_TEST, AllocFlags::empty()).unwrap();
        let b = k.allocate(100, &M_TEST, AllocFlags::empty()).unwrap();
        assert_eq!(VirtualAddress::from_ptr(a.as_ptr()), k.base());
        assert_eq!(VirtualAddress::from_ptr(b.as_ptr()), k.base() + 12);
        assert_eq!(
            layout(&k),
            [(0, 12, false), (12, 100, false), (112, 4 * 4096 - 112, true)]
        );
        assert_eq!(k.used_bytes(), 112);
        assert_eq!(k.live_objects(), 2);

        k.free(a);
        k.free(b);
        assert_eq!(layout(&k), [(0, 4 * 4096, true)]);
        assert_eq!(k.used_bytes(), 0);
    }

    #[test]
    fn freed_hole_is_reused_first() {
        let k = kvmem(4);
        let a = k.allocate(64, &M_TEST, AllocFlags::empty()).unwrap();
        let _b = k.allocate(64, &M_TEST, AllocFlags::empty()).unwrap();
        k.free(a);
        let c = k.allocate(32, &M_TEST, AllocFlags::empty()).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn alignment_splits_off_a_leading_fragment() {
        let k = kvmem(4);
        let _a = k.allocate(4, &M_TEST, AllocFlags::empty()).unwrap();
        let b = k
            .allocate_aligned(64, 256, &M_TEST, AllocFlags::empty())
            .unwrap();
        assert_eq!(VirtualAddress::from_ptr(b.as_ptr()) - k.base(), 256);
        assert_eq!(layout(&k)[1], (4, 252, true));

        let c = k.allocate(200, &M_TEST, AllocFlags::empty()).unwrap();
        assert_eq!(VirtualAddress::from_ptr(c.as_ptr()) - k.base(), 4);
        assert_eq!(
            k.allocate_aligned(8, 8192, &M_TEST, AllocFlags::empty()),
            Err(KvmemError::BadAlignment(8192))
        );
    }

    #[test]
    fn zero_flag_clears_memory() {
        let k = kvmem(2);
        let p = k.allocate(64, &M_TEST, AllocFlags::ZERO).unwrap();
        let bytes = unsafe { core::slice::from_raw_parts(p.as_ptr(), 64) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn pages_follow_allocations() {
        let k = kvmem(8);
        let a = k.allocate(3 * 4096, &M_TEST, AllocFlags::empty()).unwrap();
        let b = k.allocate(100, &M_TEST, AllocFlags::empty()).unwrap();
        assert_eq!(k.backing().populated.lock().len(), 4);

        // Page 3 is shared with `b` and must stay.
        k.free(a);
        assert_eq!(k.backing().releases.load(Ordering::Relaxed), 3);
        assert_eq!(k.backing().populated.lock().len(), 1);

        k.free(b);
        assert!(k.backing().populated.lock().is_empty());
    }

    #[test]
    fn pages_straddling_unmerged_free_nodes_are_released() {
        // Never dereferenced: no allocation here asks for zeroed memory.
        let base = VirtualAddress::new(0x1000_0000_0000);
        let nodes = std::vec![Node::EMPTY; 16].leak();
        let k = Kvmem::new(base, (1 << 29) + PAGE_SIZE, nodes, HostBacking::default()).unwrap();
        let max = usize::try_from(u64::from(MAX_NODE_SIZE) * UNIT).unwrap();

        // Two maximal nodes meeting in the middle of a page.
        let a = k.allocate(max, &M_TEST, AllocFlags::empty()).unwrap();
        let b = k.allocate(max, &M_TEST, AllocFlags::empty()).unwrap();
        assert_eq!(k.backing().populated.lock().len(), 2 * 65536);

        k.free(a);
        assert_eq!(k.backing().populated.lock().len(), 65537);

        // Neither neighbour can absorb `b`, yet its edge pages are all free.
        k.free(b);
        assert_eq!(k.node_count(), 3);
        assert!(layout(&k).iter().all(|&(_, _, free)| free));
        assert!(k.backing().populated.lock().is_empty());
        assert_eq!(k.backing().releases.load(Ordering::Relaxed), 2 * 65536);
    }

    #[test]
    fn failed_population_rolls_back() {
        let backing = HostBacking {
            budget: Some(AtomicUsize::new(1)),
            ..HostBacking::default()
        };
        let k = kvmem_with(8, 64, backing);
        let before = layout(&k);
        assert_eq!(
            k.allocate(2 * 4096, &M_TEST, AllocFlags::empty()),
            Err(KvmemError::OutOfMemory)
        );
        assert_eq!(layout(&k), before);
        assert_eq!(k.live_objects(), 0);
        assert!(k.backing().populated.lock().is_empty());
    }

    #[test]
    fn inconsistent_frees_are_reported() {
        let k = kvmem(2);
        let a = k.allocate(16, &M_TEST, AllocFlags::empty()).unwrap();
        let inside = unsafe { a.add(4) };
        assert_eq!(
            k.try_free(inside),
            Err(KvmemError::NotAllocated(VirtualAddress::from_ptr(inside.as_ptr())))
        );
        k.free(a);
        assert_eq!(
            k.try_free(a),
            Err(KvmemError::DoubleFree(VirtualAddress::from_ptr(a.as_ptr())))
        );
        let below = NonNull::new((k.base().as_u64() - 4096) as *mut u8).unwrap();
        assert!(matches!(k.try_free(below), Err(KvmemError::BelowBase(_))));
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_is_fatal() {
        let k = kvmem(1);
        let a = k.allocate(16, &M_TEST, AllocFlags::empty()).unwrap();
        k.free(a);
        k.free(a);
    }

    #[test]
    fn running_out_of_records() {
        let k = kvmem_with(4, 3, HostBacking::default());
        let _a = k.allocate(8, &M_TEST, AllocFlags::empty()).unwrap();
        let _b = k.allocate(8, &M_TEST, AllocFlags::empty()).unwrap();
        assert_eq!(
            k.allocate(8, &M_TEST, AllocFlags::empty()),
            Err(KvmemError::NoFreeNodes)
        );
        // The tail node itself still fits exactly.
        assert!(k.allocate(4 * 4096 - 16, &M_TEST, AllocFlags::empty()).is_ok());
    }

    #[test]
    fn exhausted_region() {
        let k = kvmem(1);
        let _all = k.allocate(4096, &M_TEST, AllocFlags::empty()).unwrap();
        assert_eq!(
            k.allocate(4, &M_TEST, AllocFlags::empty()),
            Err(KvmemError::OutOfMemory)
        );
    }

    #[test]
    fn tags_count_objects() {
        static M_TAGGED: MallocType = MallocType::new("kvmem-tagged", "tag accounting test");
        let k = kvmem(2);
        let a = k.allocate(10, &M_TAGGED, AllocFlags::empty()).unwrap();
        let b = k.allocate(20, &M_TAGGED, AllocFlags::empty()).unwrap();
        assert_eq!(M_TAGGED.objects(), 2);
        assert_eq!(M_TAGGED.bytes(), 12 + 20);
        k.free(a);
        k.free(b);
        assert_eq!(M_TAGGED.objects(), 0);
        assert_eq!(M_TAGGED.bytes(), 0);
    }

    #[test]
    fn large_regions_start_with_several_nodes() {
        let nodes = std::vec![Node::EMPTY; 8].leak();
        let k = Kvmem::standard(nodes, HostBacking::default()).unwrap();
        assert_eq!(k.node_count(), 2);
        let mut sizes = Vec::new();
        k.for_each_node(|n| sizes.push(n.size));
        assert_eq!(sizes, [u64::from(MAX_NODE_SIZE) * 4, 4]);
    }

    mod round_trip {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn allocate_then_free_restores_layout(
                sizes in prop::collection::vec((1usize..6000, 0u32..6), 1..40),
                order in prop::collection::vec(any::<prop::sample::Index>(), 40),
            ) {
                let k = kvmem_with(64, 128, HostBacking::default());
                let before = layout(&k);

                let mut live = Vec::new();
                for (size, align_shift) in sizes {
                    let align = 4usize << align_shift;
                    let p = k.allocate_aligned(size, align, &M_TEST, AllocFlags::empty()).unwrap();
                    prop_assert_eq!(p.as_ptr() as usize % align, 0);
                    live.push(p);
                }
                for idx in order {
                    if live.is_empty() {
                        break;
                    }
                    let p = live.swap_remove(idx.index(live.len()));
                    k.free(p);
                }
                for p in live {
                    k.free(p);
                }

                prop_assert_eq!(layout(&k), before);
                prop_assert_eq!(k.node_count(), 1);
                prop_assert_eq!(k.used_bytes(), 0);
                prop_assert!(k.backing().populated.lock().is_empty());
            }
        }
    }
}
