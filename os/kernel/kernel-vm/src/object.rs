//! File-backed page cache objects.

use crate::VmError;
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::fmt;
use core::num::NonZeroU64;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_memory_addresses::PAGE_SIZE;
use kernel_pmm::{Frame, FrameOwner, ObjectId, Zone};
use kernel_vmem::Paging;
use log::{debug, warn};

static NEXT_OBJECT: AtomicU64 = AtomicU64::new(1);

/// Fills object pages from the backing store.
pub trait Pager: Send + Sync {
    /// Read the page at byte `offset` of the object into `page`.
    ///
    /// May block. Bytes past the end of the backing store must be zero.
    /// `page` is a mounted window; the pager must not mount frames itself.
    ///
    /// # Errors
    /// [`VmError::PageIn`] when the backing store fails.
    fn page_in(&self, offset: u64, page: &mut [u8; PAGE_SIZE as usize]) -> Result<(), VmError>;
}

/// The resident pages of one file region.
pub struct VmObject {
    id: ObjectId,
    pager: Box<dyn Pager>,
    pages: spin::Mutex<BTreeMap<u64, Frame>>,
}

impl VmObject {
    #[must_use]
    pub fn new(pager: Box<dyn Pager>) -> Arc<Self> {
        let id = NEXT_OBJECT.fetch_add(1, Ordering::Relaxed);
        Arc::new(Self {
            id: ObjectId::new(NonZeroU64::new(id).unwrap_or(NonZeroU64::MIN)),
            pager,
            pages: spin::Mutex::new(BTreeMap::new()),
        })
    }

    #[must_use]
    pub const fn id(&self) -> ObjectId {
        self.id
    }

    /// The frame caching `offset`, paging it in on a miss.
    ///
    /// # Errors
    /// [`VmError::InvalidRange`] for unaligned offsets,
    /// [`VmError::OutOfMemory`] and [`VmError::PageIn`] on a failed page-in.
    pub fn page(&self, paging: &Paging, offset: u64) -> Result<Frame, VmError> {
        if !offset.is_multiple_of(PAGE_SIZE) {
            return Err(VmError::InvalidRange);
        }
        if let Some(frame) = self.pages.lock().get(&offset) {
            return Ok(frame.clone());
        }

        let pmm = paging.pmm();
        let frame = pmm
            .alloc_frame(Zone::Normal)
            .or_else(|_| pmm.alloc_frame(Zone::Dma))?;
        {
            // SAFETY: the frame is fresh and referenced only by us.
            let mut mount = unsafe { paging.mounts().mount(frame.page()) };
            if let Err(e) = self.pager.page_in(offset, mount.bytes()) {
                warn!("vm_object {}: page-in at {offset:#x} failed: {e}", self.id.get());
                return Err(e);
            }
        }
        debug!("vm_object {}: paged in {offset:#x} to {}", self.id.get(), frame.page());
        Ok(self.insert(offset, frame))
    }

    /// Cache `frame` at `offset` unless a page is already resident there;
    /// returns the resident page.
    pub fn insert(&self, offset: u64, frame: Frame) -> Frame {
        let mut pages = self.pages.lock();
        pages
            .entry(offset)
            .or_insert_with(|| {
                frame.pmm().registry().set_owner(
                    frame.page(),
                    FrameOwner {
                        object: self.id,
                        offset,
                    },
                );
                frame
            })
            .clone()
    }

    #[must_use]
    pub fn resident_pages(&self) -> usize {
        self.pages.lock().len()
    }
}

impl fmt::Debug for VmObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmObject")
            .field("id", &self.id.get())
            .field("resident", &self.resident_pages())
            .finish_non_exhaustive()
    }
}
