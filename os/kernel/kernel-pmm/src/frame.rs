//! # Frame Registry
//!
//! Per-frame metadata: a reference count and an optional owner (the object
//! and offset a page-cache frame belongs to). The registry holds no policy;
//! releasing a frame once its count reaches zero is the job of [`Frame`].

use crate::PhysicalMemory;
use core::fmt;
use core::num::NonZeroU64;
use core::sync::atomic::{AtomicU32, Ordering};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalPage};

/// Opaque identity of a page-cache object owning a frame.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ObjectId(NonZeroU64);

impl ObjectId {
    #[must_use]
    pub const fn new(id: NonZeroU64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0.get()
    }
}

/// Owner of a frame: an object and the byte offset within it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FrameOwner {
    pub object: ObjectId,
    pub offset: u64,
}

/// Metadata of one physical frame.
#[derive(Debug)]
pub struct FrameInfo {
    refs: AtomicU32,
    owner: spin::Mutex<Option<FrameOwner>>,
}

impl FrameInfo {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            refs: AtomicU32::new(0),
            owner: spin::Mutex::new(None),
        }
    }
}

impl Default for FrameInfo {
    fn default() -> Self {
        Self::new()
    }
}

/// Metadata table covering frames `0..len`.
pub struct FrameRegistry {
    frames: &'static [FrameInfo],
}

impl FrameRegistry {
    #[must_use]
    pub const fn new(frames: &'static [FrameInfo]) -> Self {
        Self { frames }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.frames.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    #[inline]
    fn info(&self, frame: PhysicalPage) -> &FrameInfo {
        let idx = usize::try_from(frame.number()).unwrap_or(usize::MAX);
        self.frames
            .get(idx)
            .unwrap_or_else(|| panic!("frame {frame} is outside the frame registry"))
    }

    /// Current reference count.
    #[must_use]
    pub fn refs(&self, frame: PhysicalPage) -> u32 {
        self.info(frame).refs.load(Ordering::Acquire)
    }

    /// Add one reference; returns the new count.
    pub fn incref(&self, frame: PhysicalPage) -> u32 {
        self.info(frame).refs.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drop one reference; returns the new count.
    ///
    /// # Panics
    /// When the count is already zero; that is a reference-counting bug.
    pub fn decref(&self, frame: PhysicalPage) -> u32 {
        let prev = self
            .info(frame)
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| r.checked_sub(1))
            .unwrap_or_else(|_| panic!("frame {frame}: reference count underflow"));
        prev - 1
    }

    /// Overwrite the count; used when a frame enters service.
    pub fn reset(&self, frame: PhysicalPage, refs: u32) {
        self.info(frame).refs.store(refs, Ordering::Release);
    }

    #[must_use]
    pub fn owner(&self, frame: PhysicalPage) -> Option<FrameOwner> {
        *self.info(frame).owner.lock()
    }

    pub fn set_owner(&self, frame: PhysicalPage, owner: FrameOwner) {
        *self.info(frame).owner.lock() = Some(owner);
    }

    pub fn clear_owner(&self, frame: PhysicalPage) {
        *self.info(frame).owner.lock() = None;
    }
}

/// An owned reference to a 4 KiB frame.
///
/// Cloning adds a registry reference; dropping the last reference returns the
/// frame to the buddy allocator. Frames are not zeroed on allocation.
pub struct Frame {
    page: PhysicalPage,
    pmm: &'static PhysicalMemory,
}

impl Frame {
    /// Wrap a freshly allocated frame whose count was set to one.
    pub(crate) const fn fresh(page: PhysicalPage, pmm: &'static PhysicalMemory) -> Self {
        Self { page, pmm }
    }

    /// Adopt one reference previously released by [`Frame::into_raw`].
    ///
    /// # Safety
    /// The caller must own one outstanding reference to `page` (for example the
    /// one held by a page-table entry being cleared).
    #[must_use]
    pub const unsafe fn from_raw(pmm: &'static PhysicalMemory, page: PhysicalPage) -> Self {
        Self { page, pmm }
    }

    /// Take a new reference to a frame somebody else keeps alive.
    ///
    /// # Safety
    /// `page` must currently have a non-zero reference count that cannot drop
    /// to zero concurrently (for example because a locked page table maps it).
    #[must_use]
    pub unsafe fn acquire(pmm: &'static PhysicalMemory, page: PhysicalPage) -> Self {
        let refs = pmm.registry().incref(page);
        debug_assert!(refs > 1, "acquired a frame nobody owned");
        Self { page, pmm }
    }

    /// Leak this reference into a raw page; pair with [`Frame::from_raw`].
    #[must_use]
    pub fn into_raw(self) -> PhysicalPage {
        let page = self.page;
        core::mem::forget(self);
        page
    }

    #[inline]
    #[must_use]
    pub const fn page(&self) -> PhysicalPage {
        self.page
    }

    #[inline]
    #[must_use]
    pub const fn address(&self) -> PhysicalAddress {
        self.page.base()
    }

    #[inline]
    #[must_use]
    pub const fn pmm(&self) -> &'static PhysicalMemory {
        self.pmm
    }

    /// Current number of references (handles plus page-table mappings).
    #[must_use]
    pub fn refs(&self) -> u32 {
        self.pmm.registry().refs(self.page)
    }
}

impl Clone for Frame {
    fn clone(&self) -> Self {
        self.pmm.registry().incref(self.page);
        Self {
            page: self.page,
            pmm: self.pmm,
        }
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        let registry = self.pmm.registry();
        if registry.decref(self.page) == 0 {
            registry.clear_owner(self.page);
            if let Err(e) = self.pmm.free(self.page.base(), PAGE_SIZE) {
                panic!("releasing frame {}: {e}", self.page);
            }
        }
    }
}

impl PartialEq for Frame {
    fn eq(&self, other: &Self) -> bool {
        self.page == other.page
    }
}

impl Eq for Frame {}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("page", &self.page)
            .field("refs", &self.refs())
            .finish()
    }
}
