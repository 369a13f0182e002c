use crate::{VmAnon, VmFlags, VmObject};
use alloc::sync::Arc;
use core::fmt;
use kernel_memory_addresses::{PageRange, VirtualAddress};

/// A region `[base, base + size)` of an address space.
///
/// Pages are looked up in the anon layer first, then in the object; regions
/// without an object are zero-filled. Slots and object pages are keyed by
/// offset: `address - base + offset`.
pub struct VmEntry {
    base: VirtualAddress,
    size: u64,
    flags: VmFlags,
    object: Option<Arc<VmObject>>,
    offset: u64,
    pub(crate) anon: Option<Arc<VmAnon>>,
}

impl VmEntry {
    /// A zero-fill region.
    #[must_use]
    pub const fn new(base: VirtualAddress, size: u64, flags: VmFlags) -> Self {
        Self {
            base,
            size,
            flags,
            object: None,
            offset: 0,
            anon: None,
        }
    }

    /// A region backed by `object`, starting at byte `offset` of it.
    #[must_use]
    pub fn with_object(mut self, object: Arc<VmObject>, offset: u64) -> Self {
        self.object = Some(object);
        self.offset = offset;
        self
    }

    #[inline]
    #[must_use]
    pub const fn base(&self) -> VirtualAddress {
        self.base
    }

    #[inline]
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// One past the last byte; saturates for regions that were never
    /// validated by an address space.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> VirtualAddress {
        VirtualAddress::new(self.base.as_u64().saturating_add(self.size))
    }

    #[must_use]
    pub const fn flags(&self) -> VmFlags {
        self.flags
    }

    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    #[must_use]
    pub const fn object(&self) -> Option<&Arc<VmObject>> {
        self.object.as_ref()
    }

    #[must_use]
    pub const fn anon(&self) -> Option<&Arc<VmAnon>> {
        self.anon.as_ref()
    }

    #[must_use]
    pub fn range(&self) -> PageRange {
        PageRange::new(self.base, self.end())
    }

    #[must_use]
    pub fn contains(&self, va: VirtualAddress) -> bool {
        va >= self.base && va < self.end()
    }

    /// Slot and object key of the page at `va`.
    #[must_use]
    pub fn offset_of(&self, va: VirtualAddress) -> u64 {
        va.page().base() - self.base + self.offset
    }

    pub(crate) fn set_base(&mut self, base: VirtualAddress) {
        self.base = base;
    }

    pub(crate) fn grow(&mut self, bytes: u64) {
        self.size += bytes;
    }

    /// Make the anon layer private to this entry, duplicating a shared one.
    ///
    /// `SHARED` regions keep their common anon.
    pub(crate) fn private_anon(&mut self) -> Option<&Arc<VmAnon>> {
        if !self.flags.is_shared()
            && let Some(anon) = self.anon.as_mut()
            && VmAnon::refs(anon) > 1
        {
            let copy = anon.duplicate();
            copy.set_copy(anon.is_copy());
            *anon = copy;
        }
        self.anon.as_ref()
    }

    /// The child's copy of this region after a fork. Both sides then share
    /// the object and the anon; a private anon is marked copy.
    pub(crate) fn fork(&self) -> Self {
        if let Some(anon) = &self.anon
            && !self.flags.is_shared()
        {
            anon.set_copy(true);
        }
        Self {
            base: self.base,
            size: self.size,
            flags: self.flags,
            object: self.object.clone(),
            offset: self.offset,
            anon: self.anon.clone(),
        }
    }

    /// Cut the region at `at`; `self` keeps the head, the tail is returned.
    pub(crate) fn split_off(&mut self, at: VirtualAddress) -> Self {
        debug_assert!(at > self.base && at < self.end() && at.is_page_aligned());
        let head = at - self.base;
        let split = self.offset + head;
        let anon = if self.flags.is_shared() {
            self.anon.clone()
        } else {
            self.private_anon().map(|anon| anon.split_off(split))
        };
        let tail = Self {
            base: at,
            size: self.size - head,
            flags: self.flags,
            object: self.object.clone(),
            offset: split,
            anon,
        };
        self.size = head;
        tail
    }
}

impl fmt::Debug for VmEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmEntry")
            .field("base", &self.base)
            .field("size", &self.size)
            .field("flags", &self.flags)
            .field("offset", &self.offset)
            .field("object", &self.object.as_ref().map(|o| o.id().get()))
            .field("anon", &self.anon)
            .finish()
    }
}
