//! Address spaces.

use crate::fault::Fault;
use crate::{
    Access, FaultError, PageFaultError, Violation, VmAnon, VmAref, VmEntry, VmError, VmFlags,
    VmObject,
};
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use kernel_info::memory::{USER_BASE, USER_END, USER_MMAP_TOP};
use kernel_memory_addresses::{PAGE_SIZE, PageRange, VirtualAddress, align_up};
use kernel_pmm::{Frame, ObjectId};
use kernel_vmem::{Paging, Pmap};
use log::{debug, trace, warn};

/// Rights of the program break region.
const HEAP_FLAGS: VmFlags = VmFlags::URW;

/// Where the pages of a new mapping come from.
#[derive(Debug, Clone)]
pub enum Backing {
    /// Zero-filled on first touch.
    Zero,
    /// Pages of `object` starting at byte `offset`.
    Object { object: Arc<VmObject>, offset: u64 },
}

/// An `mmap` request.
#[derive(Debug, Clone)]
pub struct MapRequest {
    /// Fixed address; anything already mapped there is unmapped first.
    /// `None` lets the address space choose.
    pub address: Option<VirtualAddress>,
    pub length: u64,
    pub flags: VmFlags,
    pub backing: Backing,
}

impl MapRequest {
    #[must_use]
    pub const fn anonymous(length: u64, flags: VmFlags) -> Self {
        Self {
            address: None,
            length,
            flags,
            backing: Backing::Zero,
        }
    }

    #[must_use]
    pub const fn file(object: Arc<VmObject>, offset: u64, length: u64, flags: VmFlags) -> Self {
        Self {
            address: None,
            length,
            flags,
            backing: Backing::Object { object, offset },
        }
    }

    #[must_use]
    pub const fn at(mut self, address: VirtualAddress) -> Self {
        self.address = Some(address);
        self
    }
}

/// A region as reported by [`VmSpace::find`] and [`VmSpace::regions`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RegionInfo {
    pub range: PageRange,
    pub flags: VmFlags,
    pub offset: u64,
    pub object: Option<ObjectId>,
    /// Slots in the anon layer.
    pub private_pages: usize,
}

impl From<&VmEntry> for RegionInfo {
    fn from(e: &VmEntry) -> Self {
        Self {
            range: e.range(),
            flags: e.flags(),
            offset: e.offset(),
            object: e.object().map(|o| o.id()),
            private_pages: e.anon().map_or(0, |a| a.len()),
        }
    }
}

#[derive(Debug, Copy, Clone)]
struct Heap {
    base: VirtualAddress,
    brk: VirtualAddress,
}

/// The region map of a space; guarded by the space lock.
pub(crate) struct Entries {
    map: BTreeMap<u64, VmEntry>,
    heap: Option<Heap>,
}

impl Entries {
    const fn new() -> Self {
        Self {
            map: BTreeMap::new(),
            heap: None,
        }
    }

    fn key_of(&self, va: VirtualAddress) -> Option<u64> {
        self.map
            .range(..=va.as_u64())
            .next_back()
            .filter(|(_, e)| e.contains(va))
            .map(|(k, _)| *k)
    }

    fn find(&self, va: VirtualAddress) -> Option<&VmEntry> {
        self.key_of(va).and_then(|k| self.map.get(&k))
    }

    pub(crate) fn find_mut(&mut self, va: VirtualAddress) -> Option<&mut VmEntry> {
        self.key_of(va).and_then(|k| self.map.get_mut(&k))
    }

    fn overlaps(&self, start: u64, end: u64) -> bool {
        self.map
            .range(..end)
            .next_back()
            .is_some_and(|(_, e)| e.end().as_u64() > start)
    }

    /// Highest `size`-byte gap below [`USER_MMAP_TOP`].
    fn find_gap(&self, size: u64) -> Result<VirtualAddress, VmError> {
        let mut top = USER_MMAP_TOP;
        for e in self.map.range(..USER_MMAP_TOP).rev().map(|(_, e)| e) {
            let end = e.end().as_u64();
            if end <= top && top - end >= size {
                return Ok(VirtualAddress::new(top - size));
            }
            top = top.min(e.base().as_u64());
        }
        if top >= USER_BASE && top - USER_BASE >= size {
            Ok(VirtualAddress::new(top - size))
        } else {
            Err(VmError::NoSpace)
        }
    }

    fn insert(&mut self, mut entry: VmEntry) -> Result<VirtualAddress, VmError> {
        let size = entry.size();
        if size == 0 || !size.is_multiple_of(PAGE_SIZE) || !entry.base().is_page_aligned() {
            return Err(VmError::InvalidRange);
        }
        if entry.base().as_u64() == 0 {
            entry.set_base(self.find_gap(size)?);
        }
        let start = entry.base().as_u64();
        let end = start.checked_add(size).ok_or(VmError::InvalidRange)?;
        if start < USER_BASE || end > USER_END {
            return Err(VmError::InvalidRange);
        }
        if self.overlaps(start, end) {
            return Err(VmError::Overlap);
        }
        // Shared zero-fill pages must live in one anon from the start, so a
        // fork before the first touch still shares them.
        if entry.flags().is_shared() && entry.object().is_none() && entry.anon.is_none() {
            entry.anon = Some(VmAnon::new());
        }
        trace!("vm_space: {entry:?}");
        self.map.insert(start, entry);
        Ok(VirtualAddress::new(start))
    }
}

/// A process's address space: its regions plus the pmap realizing them.
pub struct VmSpace {
    pmap: Arc<Pmap>,
    inner: spin::Mutex<Entries>,
}

impl VmSpace {
    /// An empty address space with a fresh pmap.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if no root table can be allocated.
    pub fn new(paging: &'static Paging) -> Result<Self, VmError> {
        Ok(Self::with_pmap(paging.create()?))
    }

    #[must_use]
    pub const fn with_pmap(pmap: Arc<Pmap>) -> Self {
        Self {
            pmap,
            inner: spin::Mutex::new(Entries::new()),
        }
    }

    #[must_use]
    pub const fn pmap(&self) -> &Arc<Pmap> {
        &self.pmap
    }

    #[must_use]
    pub fn paging(&self) -> &'static Paging {
        self.pmap.paging()
    }

    /// Make this space's pmap the current one; returns the previous pmap.
    pub fn activate(&self) -> Option<Arc<Pmap>> {
        self.paging().switch(&self.pmap)
    }

    /// Add `entry`. A base of zero picks the highest free range below the
    /// mmap ceiling.
    ///
    /// # Errors
    /// [`VmError::InvalidRange`] for unaligned, empty or non-user ranges,
    /// [`VmError::Overlap`], [`VmError::NoSpace`].
    pub fn insert(&self, entry: VmEntry) -> Result<VirtualAddress, VmError> {
        self.inner.lock().insert(entry)
    }

    /// The region covering `va`.
    #[must_use]
    pub fn find(&self, va: VirtualAddress) -> Option<RegionInfo> {
        self.inner.lock().find(va).map(RegionInfo::from)
    }

    /// Every region in address order.
    #[must_use]
    pub fn regions(&self) -> Vec<RegionInfo> {
        self.inner.lock().map.values().map(RegionInfo::from).collect()
    }

    /// The anon slot backing `va`, if the page has one.
    #[must_use]
    pub fn slot(&self, va: VirtualAddress) -> Option<Arc<VmAref>> {
        let inner = self.inner.lock();
        let entry = inner.find(va)?;
        entry.anon()?.slot(entry.offset_of(va))
    }

    /// Pages currently mapped in the pmap.
    #[must_use]
    pub fn resident_pages(&self) -> usize {
        self.pmap.resident_pages()
    }

    /// Establish a mapping; `length` is rounded up to whole pages.
    ///
    /// # Errors
    /// As [`VmSpace::insert`]; [`VmError::InvalidRange`] for unaligned fixed
    /// addresses or object offsets.
    pub fn map(&self, request: MapRequest) -> Result<VirtualAddress, VmError> {
        let length = align_up(request.length, PAGE_SIZE);
        if length == 0 {
            return Err(VmError::InvalidRange);
        }
        let base = request.address.unwrap_or_default();
        let mut entry = VmEntry::new(base, length, request.flags);
        if let Backing::Object { object, offset } = request.backing {
            if !offset.is_multiple_of(PAGE_SIZE) {
                return Err(VmError::InvalidRange);
            }
            entry = entry.with_object(object, offset);
        }

        let mut inner = self.inner.lock();
        if request.address.is_some() {
            if !base.is_page_aligned() || base.as_u64() < USER_BASE {
                return Err(VmError::InvalidRange);
            }
            let end = base.checked_add(length).ok_or(VmError::InvalidRange)?;
            self.unmap_locked(&mut inner, PageRange::new(base, end))?;
        }
        let base = inner.insert(entry)?;
        debug!(
            "vm_space: mapped {base}..{} {:?}",
            base + length,
            request.flags
        );
        Ok(base)
    }

    /// Remove every mapping in `range`, cutting regions that straddle it.
    ///
    /// Unmapping holes is not an error.
    ///
    /// # Errors
    /// [`VmError::InvalidRange`] for unaligned or non-user ranges.
    pub fn unmap(&self, range: PageRange) -> Result<(), VmError> {
        self.unmap_locked(&mut self.inner.lock(), range)
    }

    fn unmap_locked(&self, inner: &mut Entries, range: PageRange) -> Result<(), VmError> {
        if range.is_empty() {
            return Ok(());
        }
        let (start, end) = (range.start().as_u64(), range.end().as_u64());
        if !range.start().is_page_aligned() || !range.end().is_page_aligned() || end > USER_END {
            return Err(VmError::InvalidRange);
        }

        self.pmap.remove(range)?;

        let keys: Vec<u64> = inner
            .map
            .range(..end)
            .rev()
            .take_while(|(_, e)| e.end().as_u64() > start)
            .map(|(k, _)| *k)
            .collect();
        for key in keys {
            let Some(mut entry) = inner.map.remove(&key) else {
                continue;
            };
            if entry.end().as_u64() > end {
                let tail = entry.split_off(range.end());
                inner.map.insert(end, tail);
            }
            if entry.base().as_u64() < start {
                let middle = entry.split_off(range.start());
                drop(middle);
                inner.map.insert(key, entry);
            } else {
                trace!("vm_space: dropped {entry:?}");
            }
        }
        Ok(())
    }

    /// Start the program break at `base`.
    ///
    /// # Errors
    /// [`VmError::InvalidRange`] for unaligned or non-user addresses,
    /// [`VmError::Overlap`] if a region already covers `base`.
    pub fn set_heap(&self, base: VirtualAddress) -> Result<(), VmError> {
        if !base.is_page_aligned() || base.as_u64() < USER_BASE || base.as_u64() >= USER_MMAP_TOP {
            return Err(VmError::InvalidRange);
        }
        let mut inner = self.inner.lock();
        if inner.find(base).is_some() {
            return Err(VmError::Overlap);
        }
        inner.heap = Some(Heap { base, brk: base });
        Ok(())
    }

    /// Current program break.
    #[must_use]
    pub fn heap_break(&self) -> Option<VirtualAddress> {
        self.inner.lock().heap.map(|h| h.brk)
    }

    /// Move the program break by `increment` bytes; returns the old break.
    ///
    /// # Errors
    /// [`VmError::InvalidRange`] without a heap or when shrinking below its
    /// base, [`VmError::NoSpace`] when growth runs into another region.
    pub fn sbrk(&self, increment: i64) -> Result<VirtualAddress, VmError> {
        let mut inner = self.inner.lock();
        let Some(heap) = inner.heap else {
            return Err(VmError::InvalidRange);
        };
        let old = heap.brk;
        let new = old
            .as_u64()
            .checked_add_signed(increment)
            .filter(|&brk| brk >= heap.base.as_u64() && brk <= USER_MMAP_TOP)
            .ok_or(VmError::InvalidRange)?;

        let old_end = align_up(old.as_u64(), PAGE_SIZE);
        let new_end = align_up(new, PAGE_SIZE);
        if new_end > old_end {
            if inner.overlaps(old_end, new_end) {
                return Err(VmError::NoSpace);
            }
            let grown = inner
                .find_mut(VirtualAddress::new(old_end - 1))
                .filter(|e| e.end().as_u64() == old_end && e.flags() == HEAP_FLAGS && old_end > heap.base.as_u64());
            if let Some(entry) = grown {
                entry.grow(new_end - old_end);
            } else {
                let entry = VmEntry::new(VirtualAddress::new(old_end), new_end - old_end, HEAP_FLAGS);
                inner.insert(entry)?;
            }
        } else if new_end < old_end {
            self.unmap_locked(
                &mut inner,
                PageRange::new(VirtualAddress::new(new_end), VirtualAddress::new(old_end)),
            )?;
        }

        inner.heap = Some(Heap {
            base: heap.base,
            brk: VirtualAddress::new(new),
        });
        trace!("vm_space: break {old} -> {new:#x}");
        Ok(old)
    }

    /// A copy-on-write clone of this space.
    ///
    /// Regions, objects and anons are shared; private anons are marked copy
    /// and private writable pages lose write access on both sides.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`]; the partial child is released.
    pub fn fork(&self) -> Result<Self, VmError> {
        let inner = self.inner.lock();
        let child = self.paging().create()?;
        let mut map = BTreeMap::new();
        for (&key, entry) in &inner.map {
            let copy = entry.fork();
            self.pmap
                .fork_range(&child, entry.range(), entry.flags().is_private_writable())?;
            map.insert(key, copy);
        }
        debug!(
            "vm_space: forked {} regions, {} pages",
            map.len(),
            child.resident_pages()
        );
        Ok(Self {
            pmap: child,
            inner: spin::Mutex::new(Entries {
                map,
                heap: inner.heap,
            }),
        })
    }

    /// Resolve a hardware page fault at `address`.
    ///
    /// # Errors
    /// [`FaultError::SegmentationViolation`] or [`FaultError::OutOfMemory`].
    ///
    /// # Panics
    /// When the CPU reports a reserved bit in a paging structure.
    pub fn handle_fault(&self, address: VirtualAddress, code: PageFaultError) -> Result<(), FaultError> {
        assert!(
            !code.reserved_bit(),
            "page fault at {address}: {}",
            code.explain()
        );
        let fault = Fault::new(address, code);
        self.resolve(&mut self.inner.lock(), &fault)
    }

    /// Populate `range` as if user mode performed `access` on every page.
    ///
    /// # Errors
    /// As [`VmSpace::handle_fault`], for the first page that fails.
    pub fn prefault(&self, range: PageRange, access: Access) -> Result<(), FaultError> {
        let mut inner = self.inner.lock();
        for page in range {
            self.touch(&mut inner, page.base(), access)?;
        }
        Ok(())
    }

    /// Write `data` at user address `va`, faulting pages in as needed.
    ///
    /// # Errors
    /// As [`VmSpace::handle_fault`] for a user write.
    pub fn copy_out(&self, va: VirtualAddress, data: &[u8]) -> Result<(), FaultError> {
        Self::check_span(va, data.len())?;
        let mut inner = self.inner.lock();
        let mut done = 0;
        while done < data.len() {
            let at = va + done as u64;
            let frame = self.user_frame(&mut inner, at, Access::Write)?;
            let offset = page_offset(at);
            let n = (PAGE_SIZE as usize - offset).min(data.len() - done);
            self.paging()
                .write_frame(&frame, offset, &data[done..done + n])
                .map_err(|e| FaultError::from_vm(at, e.into()))?;
            done += n;
        }
        Ok(())
    }

    /// Read user memory at `va` into `buf`, faulting pages in as needed.
    ///
    /// # Errors
    /// As [`VmSpace::handle_fault`] for a user read.
    pub fn copy_in(&self, va: VirtualAddress, buf: &mut [u8]) -> Result<(), FaultError> {
        Self::check_span(va, buf.len())?;
        let mut inner = self.inner.lock();
        let mut done = 0;
        while done < buf.len() {
            let at = va + done as u64;
            let frame = self.user_frame(&mut inner, at, Access::Read)?;
            let offset = page_offset(at);
            let n = (PAGE_SIZE as usize - offset).min(buf.len() - done);
            self.paging()
                .read_frame(&frame, offset, &mut buf[done..done + n])
                .map_err(|e| FaultError::from_vm(at, e.into()))?;
            done += n;
        }
        Ok(())
    }

    /// User buffers must not wrap around the address space.
    fn check_span(va: VirtualAddress, len: usize) -> Result<(), FaultError> {
        match va.checked_add(len as u64) {
            Some(_) => Ok(()),
            None => Err(FaultError::from_vm(va, VmError::InvalidRange)),
        }
    }

    /// Fault `page` in unless it is already mapped for `access`.
    fn touch(&self, inner: &mut Entries, page: VirtualAddress, access: Access) -> Result<(), FaultError> {
        let mapping = self.pmap.query(page);
        let sufficient = mapping.is_some_and(|m| match access {
            Access::Read => m.protection.is_user(),
            Access::Write => m.protection.is_user() && m.protection.is_writable(),
            Access::Execute => m.protection.is_user() && m.protection.is_executable(),
        });
        if sufficient {
            return Ok(());
        }
        let code = PageFaultError::for_access(access, mapping.is_some(), true);
        self.resolve(inner, &Fault::new(page, code))
    }

    fn user_frame(&self, inner: &mut Entries, va: VirtualAddress, access: Access) -> Result<Frame, FaultError> {
        self.touch(inner, va.page().base(), access)?;
        let mapping = self
            .pmap
            .query(va)
            .ok_or(FaultError::SegmentationViolation {
                address: va,
                reason: Violation::NotMapped,
            })?;
        // SAFETY: the pmap maps the frame and the space lock keeps it there.
        Ok(unsafe { Frame::acquire(self.paging().pmm(), mapping.frame) })
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn page_offset(va: VirtualAddress) -> usize {
    va.page_offset() as usize
}

impl Drop for VmSpace {
    fn drop(&mut self) {
        let Self { pmap, inner } = self;
        let entries = inner.get_mut();
        for entry in entries.map.values() {
            if let Err(e) = pmap.remove(entry.range()) {
                warn!("vm_space: unmapping {entry:?} failed: {e}");
            }
        }
        let regions = entries.map.len();
        entries.map.clear();
        debug!("vm_space: released {regions} regions of {}", pmap.root());
    }
}

impl fmt::Debug for VmSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("VmSpace")
            .field("pmap", &self.pmap)
            .field("regions", &inner.map.len())
            .field("heap", &inner.heap)
            .finish()
    }
}
