//! The private copy-on-write layer.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use kernel_pmm::Frame;
use log::trace;

/// One anonymous page: a frame plus the number of anons holding it.
///
/// A slot held by one anon and not marked copy may be written in place;
/// anything else is copied before a write.
pub struct VmAref {
    frame: spin::Mutex<Frame>,
    refs: AtomicUsize,
    copy: AtomicBool,
}

impl VmAref {
    /// A slot held by no anon yet.
    #[must_use]
    pub fn new(frame: Frame) -> Arc<Self> {
        Arc::new(Self {
            frame: spin::Mutex::new(frame),
            refs: AtomicUsize::new(0),
            copy: AtomicBool::new(false),
        })
    }

    /// A new reference to the slot's frame.
    #[must_use]
    pub fn frame(&self) -> Frame {
        self.frame.lock().clone()
    }

    /// Swap in `frame`, returning the previous one.
    pub fn replace_frame(&self, frame: Frame) -> Frame {
        core::mem::replace(&mut *self.frame.lock(), frame)
    }

    /// Number of anons holding this slot.
    #[must_use]
    pub fn refs(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    /// The frame is not ours to write (it belongs to a page cache object).
    #[must_use]
    pub fn is_copy(&self) -> bool {
        self.copy.load(Ordering::Acquire)
    }

    pub fn set_copy(&self, copy: bool) {
        self.copy.store(copy, Ordering::Release);
    }
}

impl fmt::Debug for VmAref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmAref")
            .field("frame", &self.frame.lock().page())
            .field("refs", &self.refs())
            .field("copy", &self.is_copy())
            .finish()
    }
}

/// An anon's hold on a slot; counts in [`VmAref::refs`].
struct Slot(Arc<VmAref>);

impl Slot {
    fn new(aref: Arc<VmAref>) -> Self {
        aref.refs.fetch_add(1, Ordering::AcqRel);
        Self(aref)
    }
}

impl Clone for Slot {
    fn clone(&self) -> Self {
        Self::new(self.0.clone())
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        let prev = self
            .0
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| r.checked_sub(1))
            .unwrap_or_else(|_| panic!("vm_aref reference count underflow"));
        debug_assert!(prev > 0);
    }
}

/// Slots of a region keyed by page-aligned offset.
///
/// Shared between address spaces after a fork; the number of holders is the
/// `Arc` strong count.
#[derive(Default)]
pub struct VmAnon {
    slots: spin::Mutex<BTreeMap<u64, Slot>>,
    copy: AtomicBool,
}

impl VmAnon {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of holders of `anon`.
    #[must_use]
    pub fn refs(anon: &Arc<Self>) -> usize {
        Arc::strong_count(anon)
    }

    /// A private anon sharing every slot of this one.
    #[must_use]
    pub fn duplicate(&self) -> Arc<Self> {
        let slots = self.slots.lock().clone();
        trace!("vm_anon: duplicated {} slots", slots.len());
        Arc::new(Self {
            slots: spin::Mutex::new(slots),
            copy: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn slot(&self, offset: u64) -> Option<Arc<VmAref>> {
        self.slots.lock().get(&offset).map(|s| s.0.clone())
    }

    /// Put `aref` at `offset`, returning the slot it replaced.
    pub fn insert(&self, offset: u64, aref: Arc<VmAref>) -> Option<Arc<VmAref>> {
        self.slots
            .lock()
            .insert(offset, Slot::new(aref))
            .map(|old| old.0.clone())
    }

    /// Put `aref` at `offset` unless a slot is already there; returns the
    /// slot that ends up at `offset`.
    pub fn insert_or_get(&self, offset: u64, aref: Arc<VmAref>) -> Arc<VmAref> {
        self.slots
            .lock()
            .entry(offset)
            .or_insert_with(|| Slot::new(aref))
            .0
            .clone()
    }

    /// Put `aref` at `offset` if the slot there is still `expected` (or gone);
    /// returns the slot that ends up at `offset`.
    pub fn replace(&self, offset: u64, expected: &Arc<VmAref>, aref: Arc<VmAref>) -> Arc<VmAref> {
        let mut slots = self.slots.lock();
        match slots.get_mut(&offset) {
            Some(current) if !Arc::ptr_eq(&current.0, expected) => current.0.clone(),
            Some(current) => {
                *current = Slot::new(aref.clone());
                aref
            }
            None => {
                slots.insert(offset, Slot::new(aref.clone()));
                aref
            }
        }
    }

    /// Drop every slot in `[start, end)`; returns how many were dropped.
    pub fn remove_range(&self, start: u64, end: u64) -> usize {
        let mut slots = self.slots.lock();
        let mut tail = slots.split_off(&start);
        let mut rest = tail.split_off(&end);
        slots.append(&mut rest);
        tail.len()
    }

    /// Move every slot at or after `offset` into a new anon.
    #[must_use]
    pub fn split_off(&self, offset: u64) -> Arc<Self> {
        let tail = self.slots.lock().split_off(&offset);
        Arc::new(Self {
            slots: spin::Mutex::new(tail),
            copy: AtomicBool::new(self.is_copy()),
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    /// Must be duplicated before any holder mutates it.
    #[must_use]
    pub fn is_copy(&self) -> bool {
        self.copy.load(Ordering::Acquire)
    }

    pub fn set_copy(&self, copy: bool) {
        self.copy.store(copy, Ordering::Release);
    }
}

impl fmt::Debug for VmAnon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmAnon")
            .field("slots", &self.len())
            .field("copy", &self.is_copy())
            .finish()
    }
}
