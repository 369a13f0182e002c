//! Allocation tags.
//!
//! A [`MallocType`] is a `static` describing one kind of kernel object. The
//! allocator counts live objects and bytes per type; types join a global,
//! intrusive registry the first time they are used.

use core::fmt;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use log::info;

static REGISTRY: AtomicPtr<MallocType> = AtomicPtr::new(ptr::null_mut());

/// Accounting tag for kvmem allocations.
///
/// ```rust
/// # use kernel_alloc::MallocType;
/// static M_RINGBUF: MallocType = MallocType::new("ring-buffer", "ring buffer storage");
/// assert_eq!(M_RINGBUF.objects(), 0);
/// ```
pub struct MallocType {
    name: &'static str,
    description: &'static str,
    objects: AtomicUsize,
    bytes: AtomicUsize,
    registered: AtomicBool,
    next: AtomicPtr<Self>,
}

impl MallocType {
    #[must_use]
    pub const fn new(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            description,
            objects: AtomicUsize::new(0),
            bytes: AtomicUsize::new(0),
            registered: AtomicBool::new(false),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub const fn description(&self) -> &'static str {
        self.description
    }

    /// Live objects of this type.
    #[must_use]
    pub fn objects(&self) -> usize {
        self.objects.load(Ordering::Relaxed)
    }

    /// Bytes held by live objects of this type.
    #[must_use]
    pub fn bytes(&self) -> usize {
        self.bytes.load(Ordering::Relaxed)
    }

    pub(crate) fn charge(&'static self, bytes: usize) {
        self.objects.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
        self.register();
    }

    pub(crate) fn discharge(&self, bytes: usize) {
        self.objects.fetch_sub(1, Ordering::Relaxed);
        self.bytes.fetch_sub(bytes, Ordering::Relaxed);
    }

    fn register(&'static self) {
        if self.registered.swap(true, Ordering::AcqRel) {
            return;
        }
        let me = ptr::from_ref(self).cast_mut();
        let mut head = REGISTRY.load(Ordering::Acquire);
        loop {
            self.next.store(head, Ordering::Relaxed);
            match REGISTRY.compare_exchange_weak(head, me, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }
}

impl fmt::Debug for MallocType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MallocType")
            .field("name", &self.name)
            .field("objects", &self.objects())
            .field("bytes", &self.bytes())
            .finish()
    }
}

/// Every type that has been allocated at least once, most recent first.
pub fn types() -> impl Iterator<Item = &'static MallocType> {
    // SAFETY: the registry only ever holds pointers to `'static` types.
    let head = unsafe { REGISTRY.load(Ordering::Acquire).as_ref() };
    core::iter::successors(head, |t| unsafe { t.next.load(Ordering::Acquire).as_ref() })
}

/// Log the accounting of every registered type.
pub fn dump_types() {
    info!("{:<20} {:>8} {:>12}  description", "type", "objects", "bytes");
    for t in types() {
        info!(
            "{:<20} {:>8} {:>12}  {}",
            t.name,
            t.objects(),
            t.bytes(),
            t.description
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static M_TEST_REGISTRY: MallocType = MallocType::new("test-registry", "registry test");

    #[test]
    fn first_charge_registers_once() {
        M_TEST_REGISTRY.charge(16);
        M_TEST_REGISTRY.charge(8);
        assert_eq!(M_TEST_REGISTRY.objects(), 2);
        assert_eq!(M_TEST_REGISTRY.bytes(), 24);
        assert_eq!(
            types().filter(|t| t.name() == "test-registry").count(),
            1
        );
        M_TEST_REGISTRY.discharge(16);
        M_TEST_REGISTRY.discharge(8);
        assert_eq!(M_TEST_REGISTRY.objects(), 0);
    }
}
