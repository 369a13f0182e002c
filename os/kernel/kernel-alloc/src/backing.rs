use crate::KvmemError;
use kernel_memory_addresses::{PageRange, VirtualAddress};
use kernel_pmm::Zone;
use kernel_vmem::{Paging, Protection};
use log::{trace, warn};

/// Supplies physical memory behind kvmem pages.
///
/// Both calls arrive with the kvmem lock held and must not allocate from
/// kvmem.
pub trait PageBacking: Send + Sync {
    /// Make `page` usable. Populating an already backed page succeeds.
    ///
    /// # Errors
    /// [`KvmemError::OutOfMemory`] when no memory is left.
    fn populate(&self, page: VirtualAddress) -> Result<(), KvmemError>;

    /// The pages of `range` no longer hold any allocation. Some of them may
    /// never have been populated.
    fn release(&self, range: PageRange);
}

/// Backs kvmem pages with buddy frames mapped into the kernel pmap.
#[derive(Copy, Clone)]
pub struct PmapBacking {
    paging: &'static Paging,
}

impl PmapBacking {
    #[must_use]
    pub const fn new(paging: &'static Paging) -> Self {
        Self { paging }
    }
}

impl PageBacking for PmapBacking {
    fn populate(&self, page: VirtualAddress) -> Result<(), KvmemError> {
        let kernel = self.paging.kernel();
        if kernel.query(page).is_some() {
            return Ok(());
        }
        let pmm = self.paging.pmm();
        let frame = pmm
            .alloc_frame(Zone::Normal)
            .or_else(|_| pmm.alloc_frame(Zone::Dma))
            .map_err(|_| KvmemError::OutOfMemory)?;
        trace!("kvmem: backing {page} with {}", frame.page());
        kernel
            .add(page, frame, Protection::KRW)
            .map_err(|e| {
                warn!("kvmem: mapping {page} failed: {e}");
                KvmemError::OutOfMemory
            })
    }

    fn release(&self, range: PageRange) {
        if let Err(e) = self.paging.kernel().remove(range) {
            warn!("kvmem: unmapping {}..{} failed: {e}", range.start(), range.end());
        }
    }
}
