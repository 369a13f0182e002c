//! Per-address-space page tables.

use crate::page_table::{Level, PageTableEntry, TableIndex};
use crate::{Paging, PmapError, Protection};
use alloc::sync::Arc;
use core::fmt;
use kernel_info::memory::{KERNEL_HALF_BASE, USER_END};
use kernel_memory_addresses::{PageRange, PhysicalAddress, PhysicalPage, VirtualAddress};
use kernel_pmm::Frame;
use log::{debug, warn};

/// Levels below the root, in walk order.
const LOWER: [Level; 3] = [Level::Pdpt, Level::Pd, Level::Pt];

/// Which half of the address space a pmap manages.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Half {
    User,
    Kernel,
}

impl Half {
    const fn contains(self, va: VirtualAddress) -> bool {
        match self {
            Self::User => va.as_u64() < USER_END,
            Self::Kernel => va.as_u64() >= KERNEL_HALF_BASE,
        }
    }
}

/// Counters guarded by the pmap lock.
#[derive(Debug, Default)]
pub(crate) struct Occupancy {
    resident: usize,
    tables: usize,
}

/// Root plus lock; shared by user pmaps and the kernel pmap.
pub(crate) struct PmapCore {
    root: PhysicalPage,
    half: Half,
    lock: spin::Mutex<Occupancy>,
}

impl PmapCore {
    pub(crate) const fn new(root: PhysicalPage, half: Half) -> Self {
        Self {
            root,
            half,
            lock: spin::Mutex::new(Occupancy {
                resident: 0,
                tables: 0,
            }),
        }
    }

    pub(crate) const fn root(&self) -> PhysicalPage {
        self.root
    }

    pub(crate) const fn half(&self) -> Half {
        self.half
    }
}

/// A leaf translation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Mapping {
    pub frame: PhysicalPage,
    pub protection: Protection,
}

/// What a walk visitor did with a leaf.
pub(crate) enum Visit {
    /// Untouched.
    Keep,
    /// Rewritten in place; write it back and invalidate.
    Changed,
    /// The visitor took over the frame reference; clear the entry.
    Clear,
}

type Visitor<'v> =
    dyn FnMut(VirtualAddress, &mut PageTableEntry) -> Result<Visit, PmapError> + 'v;

impl Paging {
    fn check_page(core: &PmapCore, va: VirtualAddress) -> Result<(), PmapError> {
        if !va.is_page_aligned() {
            return Err(PmapError::InvalidArgument {
                what: "unaligned address",
                value: va.as_u64(),
            });
        }
        if !core.half.contains(va) {
            return Err(PmapError::InvalidAddress(va));
        }
        Ok(())
    }

    fn check_range(core: &PmapCore, range: PageRange) -> Result<(), PmapError> {
        if range.is_empty() {
            return Ok(());
        }
        let last = VirtualAddress::new(range.end().as_u64() - 1);
        if !core.half.contains(range.start()) {
            return Err(PmapError::InvalidAddress(range.start()));
        }
        if !core.half.contains(last) {
            return Err(PmapError::InvalidAddress(last));
        }
        Ok(())
    }

    fn read_entry(&self, table: PhysicalPage, idx: TableIndex) -> PageTableEntry {
        // SAFETY: tables below the root are only touched under the pmap lock.
        unsafe { self.mounts().mount(table) }.table().get(idx)
    }

    fn write_entry(&self, table: PhysicalPage, idx: TableIndex, entry: PageTableEntry) -> PageTableEntry {
        // SAFETY: as in `read_entry`.
        let mut mount = unsafe { self.mounts().mount(table) };
        let old = mount.table().get(idx);
        mount.table().set(idx, entry);
        old
    }

    pub(crate) fn map_page(
        &self,
        core: &PmapCore,
        va: VirtualAddress,
        frame: Frame,
        prot: Protection,
    ) -> Result<(), PmapError> {
        Self::check_page(core, va)?;
        if prot.is_empty() {
            return Err(PmapError::InvalidArgument {
                what: "empty protection",
                value: 0,
            });
        }
        let mut occ = core.lock.lock();
        self.map_locked(core, &mut occ, va, frame, prot)
    }

    /// Install `frame` at `va`, creating missing tables first.
    ///
    /// Either every missing table is obtained or nothing is linked.
    fn map_locked(
        &self,
        core: &PmapCore,
        occ: &mut Occupancy,
        va: VirtualAddress,
        frame: Frame,
        prot: Protection,
    ) -> Result<(), PmapError> {
        let top_idx = TableIndex::of(va, Level::Pml4);
        let user = core.half == Half::User;

        let mut path: [Option<PhysicalPage>; 3] = [None; 3];
        let mut entry = self.with_top(core, |t| t.get(top_idx));
        for (depth, level) in LOWER.iter().enumerate() {
            if !entry.present() {
                break;
            }
            path[depth] = Some(entry.frame());
            if *level != Level::Pt {
                entry = self.read_entry(entry.frame(), TableIndex::of(va, *level));
            }
        }

        let mut tables = [PhysicalPage::from_number(0); 3];
        let mut fresh = [false; 3];
        for depth in 0..LOWER.len() {
            if let Some(existing) = path[depth] {
                tables[depth] = existing;
                continue;
            }
            match self.alloc_table() {
                Ok(table) => {
                    tables[depth] = table;
                    fresh[depth] = true;
                }
                Err(e) => {
                    for d in (0..depth).filter(|&d| fresh[d]) {
                        self.free_table(tables[d]);
                    }
                    warn!("pmap: no memory for page tables at {va}");
                    return Err(e);
                }
            }
        }

        for depth in (0..LOWER.len()).filter(|&d| fresh[d]) {
            let link = PageTableEntry::table(tables[depth], user);
            if depth == 0 {
                self.with_top(core, |t| t.set(top_idx, link));
            } else {
                let parent = tables[depth - 1];
                self.write_entry(parent, TableIndex::of(va, LOWER[depth - 1]), link);
                self.pmm().registry().incref(parent);
            }
            occ.tables += 1;
        }

        let pt = tables[2];
        let leaf = PageTableEntry::leaf(frame.into_raw(), prot);
        let old = self.write_entry(pt, TableIndex::of(va, Level::Pt), leaf);
        if old.present() {
            // SAFETY: the replaced entry owned one reference.
            drop(unsafe { Frame::from_raw(self.pmm(), old.frame()) });
            self.invalidate(core, va);
        } else {
            self.pmm().registry().incref(pt);
            occ.resident += 1;
        }
        Ok(())
    }

    pub(crate) fn unmap_range(&self, core: &PmapCore, range: PageRange) -> Result<(), PmapError> {
        Self::check_range(core, range)?;
        let mut occ = core.lock.lock();
        self.clear_locked(core, &mut occ, range)
    }

    fn clear_locked(&self, core: &PmapCore, occ: &mut Occupancy, range: PageRange) -> Result<(), PmapError> {
        let pmm = self.pmm();
        self.walk(core, occ, range, &mut |_, entry| {
            // SAFETY: the cleared entry owned one reference.
            drop(unsafe { Frame::from_raw(pmm, entry.frame()) });
            Ok(Visit::Clear)
        })
    }

    pub(crate) fn protect_range(
        &self,
        core: &PmapCore,
        range: PageRange,
        prot: Protection,
    ) -> Result<(), PmapError> {
        Self::check_range(core, range)?;
        let mut occ = core.lock.lock();
        if prot.is_empty() {
            return self.clear_locked(core, &mut occ, range);
        }
        self.walk(core, &mut occ, range, &mut |_, entry| {
            let updated = entry.with_protection(prot);
            if updated == *entry {
                return Ok(Visit::Keep);
            }
            *entry = updated;
            Ok(Visit::Changed)
        })
    }

    pub(crate) fn query(&self, core: &PmapCore, va: VirtualAddress) -> Option<Mapping> {
        if !core.half.contains(va) {
            return None;
        }
        let _occ = core.lock.lock();
        let mut entry = self.with_top(core, |t| t.get(TableIndex::of(va, Level::Pml4)));
        for level in LOWER {
            if !entry.present() {
                return None;
            }
            entry = self.read_entry(entry.frame(), TableIndex::of(va, level));
        }
        entry.present().then(|| Mapping {
            frame: entry.frame(),
            protection: entry.protection(),
        })
    }

    /// Mirror every mapping of `parent` in `range` into `child`.
    fn fork_locked(
        &self,
        parent: &PmapCore,
        child: &PmapCore,
        range: PageRange,
        strip_write: bool,
    ) -> Result<(), PmapError> {
        Self::check_range(parent, range)?;
        Self::check_range(child, range)?;
        if parent.root == child.root {
            return Err(PmapError::InvalidArgument {
                what: "fork into itself",
                value: parent.root.base().as_u64(),
            });
        }
        let mut occ = parent.lock.lock();
        let mut child_occ = child.lock.lock();
        let pmm = self.pmm();
        self.walk(parent, &mut occ, range, &mut |va, entry| {
            let mut visit = Visit::Keep;
            if strip_write && entry.writable() {
                *entry = entry.with_writable(false);
                visit = Visit::Changed;
            }
            // SAFETY: the parent's locked table keeps the frame referenced.
            let frame = unsafe { Frame::acquire(pmm, entry.frame()) };
            self.map_locked(child, &mut child_occ, va, frame, entry.protection())?;
            Ok(visit)
        })
    }

    /// Visit every present leaf of `core` inside `range`.
    ///
    /// Tables emptied by [`Visit::Clear`] are released on the way back up.
    #[allow(clippy::cast_possible_truncation)]
    fn walk(
        &self,
        core: &PmapCore,
        occ: &mut Occupancy,
        range: PageRange,
        visit: &mut Visitor<'_>,
    ) -> Result<(), PmapError> {
        if range.is_empty() {
            return Ok(());
        }
        let start = range.start().as_u64();
        let end = range.end().as_u64();
        let first = TableIndex::of(range.start(), Level::Pml4).as_usize();
        let last = TableIndex::of(VirtualAddress::new(end - 1), Level::Pml4).as_usize();

        for top in first..=last {
            let idx = TableIndex::new(top as u16)?;
            let entry = self.with_top(core, |t| t.get(idx));
            if !entry.present() {
                continue;
            }
            let base = canonical((top as u64) << Level::Pml4.shift());
            if self.walk_table(core, occ, entry.frame(), Level::Pdpt, base, start..end, visit)? {
                self.with_top(core, |t| t.set(idx, PageTableEntry::empty()));
                self.free_table(entry.frame());
                occ.tables -= 1;
            }
        }
        Ok(())
    }

    /// Returns whether the table became empty.
    ///
    /// No window stays mounted across the recursion or the visitor, so a walk
    /// holds at most one window at any time.
    #[allow(clippy::too_many_arguments, clippy::cast_possible_truncation)]
    fn walk_table(
        &self,
        core: &PmapCore,
        occ: &mut Occupancy,
        table: PhysicalPage,
        level: Level,
        base: u64,
        range: core::ops::Range<u64>,
        visit: &mut Visitor<'_>,
    ) -> Result<bool, PmapError> {
        let span = level.entry_span();
        let first = range.start.saturating_sub(base) / span;
        let last = ((range.end - 1 - base) / span).min(511);
        let registry = self.pmm().registry();

        let mut cleared = false;
        let mut next_index = first;
        while let Some((i, mut entry)) = self.next_present(table, next_index, last) {
            next_index = i + 1;
            let idx = TableIndex::new(i as u16)?;
            let va = base + i * span;
            match level.next() {
                None => match visit(VirtualAddress::new(va), &mut entry)? {
                    Visit::Keep => {}
                    Visit::Changed => {
                        self.write_entry(table, idx, entry);
                        self.invalidate(core, VirtualAddress::new(va));
                    }
                    Visit::Clear => {
                        self.write_entry(table, idx, PageTableEntry::empty());
                        self.invalidate(core, VirtualAddress::new(va));
                        registry.decref(table);
                        occ.resident -= 1;
                        cleared = true;
                    }
                },
                Some(next) => {
                    let child = entry.frame();
                    if self.walk_table(core, occ, child, next, va, range.clone(), visit)? {
                        self.write_entry(table, idx, PageTableEntry::empty());
                        self.free_table(child);
                        registry.decref(table);
                        occ.tables -= 1;
                        cleared = true;
                    }
                }
            }
        }
        Ok(cleared && registry.refs(table) == 0)
    }

    /// The first present entry of `table` in `from..=last`, with its index.
    #[allow(clippy::cast_possible_truncation)]
    fn next_present(&self, table: PhysicalPage, from: u64, last: u64) -> Option<(u64, PageTableEntry)> {
        // SAFETY: tables below the root are only touched under the pmap lock.
        let mut mount = unsafe { self.mounts().mount(table) };
        let entries = mount.table();
        (from..=last).find_map(|i| {
            let entry = entries.get(TableIndex::new(i as u16).ok()?);
            entry.present().then_some((i, entry))
        })
    }
}

/// Sign-extend bit 47.
const fn canonical(va: u64) -> u64 {
    if va & (1 << 47) != 0 {
        va | 0xFFFF_0000_0000_0000
    } else {
        va
    }
}

/// A user address space as seen by the MMU.
///
/// Dropping the last reference unmaps everything, releasing every frame
/// reference and table, then frees the root.
pub struct Pmap {
    paging: &'static Paging,
    core: PmapCore,
}

impl Pmap {
    pub(crate) const fn new(paging: &'static Paging, core: PmapCore) -> Self {
        Self { paging, core }
    }

    #[inline]
    #[must_use]
    pub const fn paging(&self) -> &'static Paging {
        self.paging
    }

    /// The root table holding this pmap's entries while it is not current.
    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysicalPage {
        self.core.root
    }

    #[must_use]
    pub fn is_current(&self) -> bool {
        self.paging.is_live(&self.core)
    }

    /// Map `frame` at `va`, replacing (and releasing) any previous mapping.
    ///
    /// # Errors
    /// Unaligned or kernel-half addresses, an empty `prot`, or no memory for
    /// intermediate tables. On error nothing changed.
    pub fn add(&self, va: VirtualAddress, frame: Frame, prot: Protection) -> Result<(), PmapError> {
        self.paging.map_page(&self.core, va, frame, prot)
    }

    /// Unmap every page in `range`. Unmapped holes are skipped.
    ///
    /// # Errors
    /// `range` reaches outside the user half.
    pub fn remove(&self, range: PageRange) -> Result<(), PmapError> {
        self.paging.unmap_range(&self.core, range)
    }

    /// Change the rights of every mapped page in `range`; an empty `prot` unmaps.
    ///
    /// # Errors
    /// `range` reaches outside the user half.
    pub fn protect(&self, range: PageRange, prot: Protection) -> Result<(), PmapError> {
        self.paging.protect_range(&self.core, range, prot)
    }

    /// Physical address `va` translates to.
    #[must_use]
    pub fn lookup(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.query(va)
            .map(|m| m.frame.base() + va.page_offset())
    }

    /// The leaf mapping covering `va`.
    #[must_use]
    pub fn query(&self, va: VirtualAddress) -> Option<Mapping> {
        self.paging.query(&self.core, va.page().base())
    }

    /// Share every mapping in `range` with `child`.
    ///
    /// With `strip_write` both sides end up read-only, so the first write on
    /// either side faults. `child` must not be locked by anyone else.
    ///
    /// # Errors
    /// No memory for the child's tables. The parent may be left partially
    /// write-protected, and the child holds whatever was mirrored so far.
    pub fn fork_range(&self, child: &Self, range: PageRange, strip_write: bool) -> Result<(), PmapError> {
        self.paging
            .fork_locked(&self.core, &child.core, range, strip_write)
    }

    /// A new pmap sharing all user mappings copy-on-write.
    ///
    /// # Errors
    /// No memory for the child; the partial child is released.
    pub fn clone_for_fork(&self) -> Result<Arc<Self>, PmapError> {
        let child = self.paging.create()?;
        self.fork_range(&child, user_range(), true)?;
        debug!(
            "pmap: forked {} into {} ({} pages)",
            self.root(),
            child.root(),
            child.resident_pages()
        );
        Ok(child)
    }

    /// Number of mapped leaf pages.
    #[must_use]
    pub fn resident_pages(&self) -> usize {
        self.core.lock.lock().resident
    }

    /// Number of intermediate tables, excluding the root.
    #[must_use]
    pub fn table_frames(&self) -> usize {
        self.core.lock.lock().tables
    }

    /// Log the walk for `va`.
    pub fn dump_walk(&self, va: VirtualAddress) {
        self.paging.dump_walk(&self.core, va);
    }
}

impl Drop for Pmap {
    fn drop(&mut self) {
        let mut occ = self.core.lock.lock();
        if let Err(e) = self.paging.clear_locked(&self.core, &mut occ, user_range()) {
            warn!("pmap: teardown of {} failed: {e}", self.core.root);
        }
        debug_assert_eq!(occ.resident, 0);
        debug_assert_eq!(occ.tables, 0);
        drop(occ);
        self.paging.free_table(self.core.root);
        debug!("pmap: destroyed {}", self.core.root);
    }
}

impl fmt::Debug for Pmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pmap")
            .field("root", &self.core.root)
            .field("resident", &self.resident_pages())
            .field("tables", &self.table_frames())
            .finish()
    }
}

const fn user_range() -> PageRange {
    PageRange::new(VirtualAddress::new(0), VirtualAddress::new(USER_END))
}

/// Handle on the kernel half of the live root.
#[derive(Copy, Clone)]
pub struct KernelPmap<'a> {
    paging: &'a Paging,
}

impl<'a> KernelPmap<'a> {
    pub(crate) const fn new(paging: &'a Paging) -> Self {
        Self { paging }
    }

    /// Map `frame` at kernel address `va`.
    ///
    /// # Errors
    /// As [`Pmap::add`], for the kernel half.
    pub fn add(&self, va: VirtualAddress, frame: Frame, prot: Protection) -> Result<(), PmapError> {
        self.paging.map_page(self.paging.kernel_core(), va, frame, prot)
    }

    /// # Errors
    /// `range` reaches outside the kernel half.
    pub fn remove(&self, range: PageRange) -> Result<(), PmapError> {
        self.paging.unmap_range(self.paging.kernel_core(), range)
    }

    /// # Errors
    /// `range` reaches outside the kernel half.
    pub fn protect(&self, range: PageRange, prot: Protection) -> Result<(), PmapError> {
        self.paging.protect_range(self.paging.kernel_core(), range, prot)
    }

    #[must_use]
    pub fn lookup(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.query(va).map(|m| m.frame.base() + va.page_offset())
    }

    #[must_use]
    pub fn query(&self, va: VirtualAddress) -> Option<Mapping> {
        self.paging.query(self.paging.kernel_core(), va.page().base())
    }

    #[must_use]
    pub fn resident_pages(&self) -> usize {
        self.paging.kernel_core().lock.lock().resident
    }

    #[must_use]
    pub fn table_frames(&self) -> usize {
        self.paging.kernel_core().lock.lock().tables
    }

    pub fn dump_walk(&self, va: VirtualAddress) {
        self.paging.dump_walk(self.paging.kernel_core(), va);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestMachine;
    use kernel_info::memory::KVMEM_BASE;
    use kernel_memory_addresses::PAGE_SIZE;
    use kernel_pmm::Zone;

    const VA: VirtualAddress = VirtualAddress::new(0x0000_0000_4000_0000);

    fn page_range(va: VirtualAddress, pages: u64) -> PageRange {
        PageRange::covering(va, pages * PAGE_SIZE)
    }

    #[test]
    fn add_lookup_remove() {
        let m = TestMachine::small();
        let free = m.free_bytes();
        let pmap = m.paging.create().unwrap();
        let frame = m.frame_with(7);
        let page = frame.page();

        pmap.add(VA, frame, Protection::URW).unwrap();
        assert_eq!(pmap.lookup(VA + 0x123), Some(page.base() + 0x123));
        assert_eq!(
            pmap.query(VA),
            Some(Mapping {
                frame: page,
                protection: Protection::URW.normalized()
            })
        );
        assert_eq!(pmap.resident_pages(), 1);
        assert_eq!(pmap.table_frames(), 3);
        assert_eq!(m.pmm.registry().refs(page), 1);

        pmap.remove(page_range(VA, 1)).unwrap();
        assert_eq!(pmap.lookup(VA), None);
        assert_eq!(pmap.resident_pages(), 0);
        assert_eq!(pmap.table_frames(), 0);

        drop(pmap);
        assert_eq!(m.free_bytes(), free);
    }

    #[test]
    fn table_counts_track_populated_entries() {
        let m = TestMachine::small();
        let pmap = m.paging.create().unwrap();
        for i in 0..4 {
            pmap.add(VA + i * PAGE_SIZE, m.frame_with(0), Protection::URW).unwrap();
        }
        assert_eq!(pmap.table_frames(), 3);

        pmap.remove(page_range(VA, 2)).unwrap();
        assert_eq!(pmap.resident_pages(), 2);
        assert_eq!(pmap.table_frames(), 3);

        pmap.remove(page_range(VA, 4)).unwrap();
        assert_eq!(pmap.table_frames(), 0);
    }

    #[test]
    fn replacing_a_mapping_releases_the_old_frame() {
        let m = TestMachine::small();
        let pmap = m.paging.create().unwrap();
        let a = m.frame_with(1);
        let b = m.frame_with(2);
        pmap.add(VA, a.clone(), Protection::URW).unwrap();
        assert_eq!(a.refs(), 2);
        pmap.add(VA, b.clone(), Protection::UR).unwrap();
        assert_eq!(a.refs(), 1);
        assert_eq!(b.refs(), 2);
        assert_eq!(pmap.resident_pages(), 1);
    }

    #[test]
    fn rejects_invalid_addresses() {
        let m = TestMachine::small();
        let pmap = m.paging.create().unwrap();
        assert_eq!(
            pmap.add(VA + 1, m.frame_with(0), Protection::UR),
            Err(PmapError::InvalidArgument {
                what: "unaligned address",
                value: VA.as_u64() + 1
            })
        );
        let kernel_va = VirtualAddress::new(KVMEM_BASE);
        assert_eq!(
            pmap.add(kernel_va, m.frame_with(0), Protection::UR),
            Err(PmapError::InvalidAddress(kernel_va))
        );
        assert_eq!(
            m.paging.kernel().add(VA, m.frame_with(0), Protection::KRW),
            Err(PmapError::InvalidAddress(VA))
        );
        assert_eq!(pmap.resident_pages(), 0);
    }

    #[test]
    fn failed_add_changes_nothing() {
        let m = TestMachine::small();
        let pmap = m.paging.create().unwrap();
        let frame = m.frame_with(3);

        let mut hoard = alloc::vec::Vec::new();
        for zone in Zone::ALL {
            while let Ok(f) = m.pmm.alloc_frame(zone) {
                hoard.push(f);
            }
        }
        // Leave two frames: not enough for three tables.
        hoard.pop();
        hoard.pop();
        let free = m.free_bytes();

        assert_eq!(
            pmap.add(VA, frame.clone(), Protection::URW),
            Err(PmapError::OutOfMemory)
        );
        assert_eq!(m.free_bytes(), free);
        assert_eq!(frame.refs(), 1);
        assert_eq!(pmap.table_frames(), 0);
        assert_eq!(pmap.lookup(VA), None);
    }

    #[test]
    fn protect_changes_rights_in_place() {
        let m = TestMachine::small();
        let pmap = m.paging.create().unwrap();
        let frame = m.frame_with(0);
        pmap.add(VA, frame.clone(), Protection::URW).unwrap();

        pmap.protect(page_range(VA, 1), Protection::UR).unwrap();
        let mapping = pmap.query(VA).unwrap();
        assert_eq!(mapping.frame, frame.page());
        assert!(!mapping.protection.is_writable());

        pmap.protect(page_range(VA, 1), Protection::empty()).unwrap();
        assert_eq!(pmap.query(VA), None);
        assert_eq!(frame.refs(), 1);
    }

    #[test]
    fn fork_shares_frames_read_only() {
        let m = TestMachine::small();
        let parent = m.paging.create().unwrap();
        let frame = m.frame_with(9);
        parent.add(VA, frame.clone(), Protection::URW).unwrap();
        parent
            .add(VA + PAGE_SIZE, m.frame_with(1), Protection::URX)
            .unwrap();

        let child = parent.clone_for_fork().unwrap();
        assert_eq!(child.resident_pages(), 2);
        assert_eq!(frame.refs(), 3);
        for pmap in [&parent, &child] {
            let mapping = pmap.query(VA).unwrap();
            assert_eq!(mapping.frame, frame.page());
            assert!(!mapping.protection.is_writable());
            assert!(mapping.protection.contains(Protection::UR));
        }

        drop(child);
        assert_eq!(frame.refs(), 2);
    }

    #[test]
    fn fork_range_can_keep_write_for_shared_mappings() {
        let m = TestMachine::small();
        let parent = m.paging.create().unwrap();
        let child = m.paging.create().unwrap();
        parent.add(VA, m.frame_with(0), Protection::URW).unwrap();
        parent.fork_range(&child, page_range(VA, 1), false).unwrap();
        assert!(parent.query(VA).unwrap().protection.is_writable());
        assert!(child.query(VA).unwrap().protection.is_writable());
        assert_eq!(parent.lookup(VA), child.lookup(VA));
    }

    #[test]
    fn forking_a_current_pmap_reads_the_live_root() {
        let m = TestMachine::small();
        let parent = m.paging.create().unwrap();
        m.paging.switch(&parent);
        parent.add(VA, m.frame_with(0), Protection::URW).unwrap();

        let child = parent.clone_for_fork().unwrap();
        assert_eq!(child.lookup(VA), parent.lookup(VA));
        assert!(m.mmu.invalidations().contains(&VA));
    }

    #[test]
    fn concurrent_forks_and_switches_make_progress() {
        let m = TestMachine::small();
        let paging = m.paging;
        std::thread::scope(|s| {
            for worker in 0..4u64 {
                let m = &m;
                s.spawn(move || {
                    let parent = paging.create().unwrap();
                    let child = paging.create().unwrap();
                    // One page per page directory: every fork walks all levels.
                    for i in 0..3 {
                        let va = VirtualAddress::new(0x1000_0000 * (worker + 1) + i * 0x20_0000);
                        parent.add(va, m.frame_with(0), Protection::URW).unwrap();
                    }
                    let range = PageRange::new(
                        VirtualAddress::new(0x1000_0000 * (worker + 1)),
                        VirtualAddress::new(0x1000_0000 * (worker + 2)),
                    );
                    for _ in 0..500 {
                        parent.fork_range(&child, range, true).unwrap();
                        paging.switch(&child);
                        paging.switch(&parent);
                    }
                    assert_eq!(child.resident_pages(), 3);
                });
            }
        });
        assert_eq!(paging.mounts().in_use(), 0);
    }

    #[test]
    fn kernel_mappings_live_in_the_live_root() {
        let m = TestMachine::small();
        let kernel = m.paging.kernel();
        let va = VirtualAddress::new(KVMEM_BASE);
        let frame = m.frame_with(5);
        kernel.add(va, frame.clone(), Protection::KRW).unwrap();
        assert_eq!(m.live_lookup(va), Some(frame.address()));
        assert_eq!(kernel.resident_pages(), 1);

        kernel.remove(page_range(va, 1)).unwrap();
        assert_eq!(kernel.lookup(va), None);
        assert_eq!(kernel.table_frames(), 0);
        assert_eq!(frame.refs(), 1);
    }

    #[test]
    fn dropping_a_pmap_returns_all_memory() {
        let m = TestMachine::small();
        let free = m.free_bytes();
        let pmap = m.paging.create().unwrap();
        for i in 0..20 {
            let va = VirtualAddress::new(0x1000_0000 + i * 0x20_0000);
            pmap.add(va, m.frame_with(0), Protection::URW).unwrap();
        }
        assert!(m.free_bytes() < free);
        drop(pmap);
        assert_eq!(m.free_bytes(), free);
    }
}
