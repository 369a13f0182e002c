//! The machine-wide paging state: live root, mount windows, current pmap.

use crate::mapper::{FrameMounts, PhysMapper};
use crate::page_table::PageTable;
use crate::pmap::{Half, KernelPmap, Pmap, PmapCore};
use crate::{Mmu, PmapError};
use alloc::sync::Arc;
use core::ops::Range;
use kernel_info::memory::USER_TOP_LEVEL_ENTRIES;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalPage, VirtualAddress};
use kernel_pmm::{Frame, PhysicalMemory, Zone};
use log::{debug, info};

/// Top-level entries owned by user pmaps.
const USER_HALF: Range<usize> = 0..USER_TOP_LEVEL_ENTRIES;

/// Owner of the live root table and the kernel pmap.
pub struct Paging {
    pmm: &'static PhysicalMemory,
    mounts: FrameMounts,
    mmu: &'static dyn Mmu,
    live_root: PhysicalPage,
    /// The switch lock: the user pmap whose entries are in the live root.
    current: spin::Mutex<Option<Arc<Pmap>>>,
    kernel: PmapCore,
}

impl Paging {
    /// Set up paging around a fresh, empty live root.
    ///
    /// The root is not loaded; see [`Paging::activate`].
    ///
    /// # Errors
    /// [`PmapError::OutOfMemory`] if no frame is left for the root.
    pub fn bootstrap(
        pmm: &'static PhysicalMemory,
        mapper: &'static dyn PhysMapper,
        mmu: &'static dyn Mmu,
    ) -> Result<Self, PmapError> {
        let mut paging = Self::with_root(pmm, mapper, mmu, PhysicalPage::from_number(0));
        let root = paging.alloc_table()?;
        paging.live_root = root;
        paging.kernel = PmapCore::new(root, Half::Kernel);
        info!("paging: fresh live root at {root}");
        Ok(paging)
    }

    /// Adopt the root the hardware is already using.
    ///
    /// Tables installed before this call (by the boot loader) are not
    /// reference counted and must never be unmapped through the kernel pmap.
    #[must_use]
    pub fn from_current(
        pmm: &'static PhysicalMemory,
        mapper: &'static dyn PhysMapper,
        mmu: &'static dyn Mmu,
    ) -> Self {
        let root = mmu.active_root();
        info!("paging: adopted live root at {root}");
        Self::with_root(pmm, mapper, mmu, root)
    }

    fn with_root(
        pmm: &'static PhysicalMemory,
        mapper: &'static dyn PhysMapper,
        mmu: &'static dyn Mmu,
        root: PhysicalPage,
    ) -> Self {
        Self {
            pmm,
            mounts: FrameMounts::new(mapper),
            mmu,
            live_root: root,
            current: spin::Mutex::new(None),
            kernel: PmapCore::new(root, Half::Kernel),
        }
    }

    /// Load the live root into the MMU.
    ///
    /// # Safety
    /// The kernel half of the live root must map the running kernel.
    pub unsafe fn activate(&self) {
        // SAFETY: forwarded to the caller.
        unsafe { self.mmu.load_root(self.live_root) };
    }

    #[inline]
    #[must_use]
    pub const fn pmm(&self) -> &'static PhysicalMemory {
        self.pmm
    }

    #[inline]
    #[must_use]
    pub const fn mounts(&self) -> &FrameMounts {
        &self.mounts
    }

    #[inline]
    #[must_use]
    pub const fn live_root(&self) -> PhysicalPage {
        self.live_root
    }

    /// The permanently resident kernel pmap.
    #[inline]
    #[must_use]
    pub const fn kernel(&self) -> KernelPmap<'_> {
        KernelPmap::new(self)
    }

    pub(crate) const fn kernel_core(&self) -> &PmapCore {
        &self.kernel
    }

    /// Create an empty user pmap.
    ///
    /// # Errors
    /// [`PmapError::OutOfMemory`] if no frame is left for the root.
    pub fn create(&'static self) -> Result<Arc<Pmap>, PmapError> {
        let root = self.alloc_table()?;
        debug!("pmap: created with root {root}");
        Ok(Arc::new(Pmap::new(self, PmapCore::new(root, Half::User))))
    }

    /// Make `next` the current user pmap and return the previous one.
    ///
    /// Switching to the pmap that is already current changes nothing.
    pub fn switch(&self, next: &Arc<Pmap>) -> Option<Arc<Pmap>> {
        let mut current = self.current.lock();
        if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, next)) {
            return Some(Arc::clone(next));
        }

        // SAFETY: the switch lock excludes every other top-level access.
        let mut live = unsafe { self.mounts.mount(self.live_root) };
        if let Some(prev) = current.as_ref() {
            let mut saved = unsafe { self.mounts.mount(prev.root()) };
            saved
                .table()
                .slice_mut(USER_HALF)
                .copy_from_slice(live.table().slice(USER_HALF));
        }
        {
            let mut incoming = unsafe { self.mounts.mount(next.root()) };
            live.table()
                .slice_mut(USER_HALF)
                .copy_from_slice(incoming.table().slice(USER_HALF));
        }
        drop(live);
        self.mmu.flush_all();

        debug!("paging: switched to pmap {}", next.root());
        current.replace(Arc::clone(next))
    }

    /// Leave only the kernel half live and return the previous user pmap.
    pub fn switch_to_kernel(&self) -> Option<Arc<Pmap>> {
        let mut current = self.current.lock();
        let prev = current.take()?;

        // SAFETY: as in `switch`.
        let mut live = unsafe { self.mounts.mount(self.live_root) };
        {
            let mut saved = unsafe { self.mounts.mount(prev.root()) };
            saved
                .table()
                .slice_mut(USER_HALF)
                .copy_from_slice(live.table().slice(USER_HALF));
        }
        live.table().slice_mut(USER_HALF).fill(crate::PageTableEntry::empty());
        drop(live);
        self.mmu.flush_all();

        debug!("paging: switched to kernel only");
        Some(prev)
    }

    /// The current user pmap, if any.
    #[must_use]
    pub fn current(&self) -> Option<Arc<Pmap>> {
        self.current.lock().clone()
    }

    /// Whether `core`'s translations are the ones the hardware uses.
    pub(crate) fn is_live(&self, core: &PmapCore) -> bool {
        match core.half() {
            Half::Kernel => true,
            Half::User => self
                .current
                .lock()
                .as_ref()
                .is_some_and(|c| c.root() == core.root()),
        }
    }

    /// Run `f` on the top-level table that holds `core`'s entries right now.
    pub(crate) fn with_top<R>(&self, core: &PmapCore, f: impl FnOnce(&mut PageTable) -> R) -> R {
        let current = self.current.lock();
        let table = match core.half() {
            Half::Kernel => self.live_root,
            Half::User if current.as_ref().is_some_and(|c| c.root() == core.root()) => {
                self.live_root
            }
            Half::User => core.root(),
        };
        // SAFETY: top-level tables are only touched under the switch lock.
        let mut mount = unsafe { self.mounts.mount(table) };
        f(mount.table())
    }

    pub(crate) fn invalidate(&self, core: &PmapCore, va: VirtualAddress) {
        if self.is_live(core) {
            self.mmu.invalidate_page(va);
        }
    }

    /// Allocate and zero a page-table frame, preferring the normal zone.
    pub(crate) fn alloc_table(&self) -> Result<PhysicalPage, PmapError> {
        let table = self
            .pmm
            .alloc_raw_frame(Zone::Normal)
            .or_else(|_| self.pmm.alloc_raw_frame(Zone::Dma))
            .map_err(|_| PmapError::OutOfMemory)?;
        // SAFETY: the frame was just allocated and is not yet linked anywhere.
        unsafe { self.mounts.mount(table) }.table().zero();
        Ok(table)
    }

    /// # Panics
    /// If the buddy allocator reports the frame as already free.
    pub(crate) fn free_table(&self, table: PhysicalPage) {
        if let Err(e) = self.pmm.free_raw_frame(table) {
            panic!("releasing page table {table}: {e}");
        }
    }

    /// Fill `frame` with zeros.
    pub fn zero_frame(&self, frame: &Frame) {
        self.fill_frame(frame, 0);
    }

    /// Fill `frame` with `byte`.
    pub fn fill_frame(&self, frame: &Frame, byte: u8) {
        // SAFETY: frame contents are plain bytes; the caller holds a reference.
        unsafe { self.mounts.mount(frame.page()) }.bytes().fill(byte);
    }

    /// Copy the full contents of `src` into `dst`.
    pub fn copy_frame(&self, src: &Frame, dst: &Frame) {
        if src.page() == dst.page() {
            return;
        }
        // SAFETY: two distinct frames, each mounted once.
        let mut from = unsafe { self.mounts.mount(src.page()) };
        let mut to = unsafe { self.mounts.mount(dst.page()) };
        to.bytes().copy_from_slice(from.bytes());
    }

    /// Read `buf.len()` bytes at `offset` within `frame`.
    ///
    /// # Errors
    /// [`PmapError::InvalidArgument`] if the span leaves the frame.
    pub fn read_frame(&self, frame: &Frame, offset: usize, buf: &mut [u8]) -> Result<(), PmapError> {
        let span = Self::span(offset, buf.len())?;
        // SAFETY: as in `fill_frame`.
        let mut mount = unsafe { self.mounts.mount(frame.page()) };
        buf.copy_from_slice(&mount.bytes()[span]);
        Ok(())
    }

    /// Write `data` at `offset` within `frame`.
    ///
    /// # Errors
    /// [`PmapError::InvalidArgument`] if the span leaves the frame.
    pub fn write_frame(&self, frame: &Frame, offset: usize, data: &[u8]) -> Result<(), PmapError> {
        let span = Self::span(offset, data.len())?;
        // SAFETY: as in `fill_frame`.
        let mut mount = unsafe { self.mounts.mount(frame.page()) };
        mount.bytes()[span].copy_from_slice(data);
        Ok(())
    }

    fn span(offset: usize, len: usize) -> Result<Range<usize>, PmapError> {
        match offset.checked_add(len) {
            Some(end) if end as u64 <= PAGE_SIZE => Ok(offset..end),
            _ => Err(PmapError::InvalidArgument {
                what: "frame offset",
                value: offset as u64,
            }),
        }
    }
}
