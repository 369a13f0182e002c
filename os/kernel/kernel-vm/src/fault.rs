//! The page-fault resolver.

use crate::space::Entries;
use crate::{Access, FaultError, PageFaultError, Violation, VmAnon, VmAref, VmEntry, VmError, VmSpace};
use kernel_memory_addresses::{PAGE_SIZE, PageRange, VirtualAddress};
use kernel_pmm::{Frame, Zone};
use kernel_vmem::{Paging, Pmap, Protection};
use log::{debug, trace, warn};

/// Signals the fault path can raise against the faulting process.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Signal {
    SegmentationFault,
    OutOfMemory,
}

/// Delivery of [`Signal`]s to the process owning a [`VmSpace`].
pub trait ProcessSignals {
    fn send(&self, signal: Signal);
}

/// Trap-layer entry: resolve the fault or signal the process.
///
/// Returns the signal that was sent, if any.
pub fn handle_page_fault(
    space: &VmSpace,
    address: VirtualAddress,
    code: PageFaultError,
    signals: &dyn ProcessSignals,
) -> Option<Signal> {
    let err = space.handle_fault(address, code).err()?;
    warn!("page fault at {address} ({}): {err}", code.explain());
    let signal = match err {
        FaultError::SegmentationViolation { .. } => Signal::SegmentationFault,
        FaultError::OutOfMemory => Signal::OutOfMemory,
    };
    signals.send(signal);
    Some(signal)
}

pub(crate) struct Fault {
    address: VirtualAddress,
    page: VirtualAddress,
    access: Access,
    present: bool,
    user: bool,
}

impl Fault {
    pub(crate) fn new(address: VirtualAddress, code: PageFaultError) -> Self {
        Self {
            address,
            page: address.page().base(),
            access: code.access(),
            present: code.present(),
            user: code.user(),
        }
    }

    const fn violation(&self, reason: Violation) -> FaultError {
        FaultError::SegmentationViolation {
            address: self.address,
            reason,
        }
    }
}

impl VmSpace {
    pub(crate) fn resolve(&self, entries: &mut Entries, fault: &Fault) -> Result<(), FaultError> {
        let Some(entry) = entries.find_mut(fault.page) else {
            return Err(fault.violation(Violation::NotMapped));
        };
        if !entry.flags().permits(fault.access, fault.user) {
            return Err(fault.violation(Violation::AccessDenied(fault.access)));
        }
        let cx = Resolver {
            pmap: self.pmap(),
            paging: self.paging(),
            page: fault.page,
            access: fault.access,
            offset: entry.offset_of(fault.page),
        };
        cx.run(entry, fault.present)
            .map_err(|e| FaultError::from_vm(fault.address, e))
    }
}

struct Resolver<'a> {
    pmap: &'a Pmap,
    paging: &'static Paging,
    page: VirtualAddress,
    access: Access,
    offset: u64,
}

impl Resolver<'_> {
    fn run(&self, entry: &mut VmEntry, present: bool) -> Result<(), VmError> {
        if present && self.present(entry)? {
            trace!("fault {}: re-granted", self.page);
            return Ok(());
        }
        if entry.anon.is_some() && self.anon(entry)? {
            trace!("fault {}: anon slot", self.page);
            return Ok(());
        }
        if entry.object().is_some() {
            trace!("fault {}: object page", self.page);
            return self.object(entry);
        }
        trace!("fault {}: zero fill", self.page);
        self.zero_fill(entry)
    }

    /// A present page of a private anon with a private slot.
    fn present(&self, entry: &VmEntry) -> Result<bool, VmError> {
        let Some(anon) = entry.anon() else {
            return Ok(false);
        };
        if VmAnon::refs(anon) != 1 {
            return Ok(false);
        }
        let Some(aref) = anon.slot(self.offset) else {
            return Ok(false);
        };
        if aref.refs() != 1 {
            return Ok(false);
        }

        let prot = entry.flags().protection();
        if aref.is_copy() {
            let copy = self.copy(&aref.frame())?;
            self.map(copy.clone(), prot)?;
            drop(aref.replace_frame(copy));
            aref.set_copy(false);
            debug!("fault {}: copied page cache frame", self.page);
        } else {
            self.pmap
                .protect(PageRange::covering(self.page, PAGE_SIZE), prot)?;
        }
        Ok(true)
    }

    fn anon(&self, entry: &mut VmEntry) -> Result<bool, VmError> {
        let prot = entry.flags().protection();
        let Some(anon) = entry.anon.as_mut() else {
            return Ok(false);
        };
        if anon.is_copy() {
            if VmAnon::refs(anon) > 1 {
                *anon = anon.duplicate();
            }
            anon.set_copy(false);
        }
        let Some(aref) = anon.slot(self.offset) else {
            return Ok(false);
        };

        if self.access != Access::Write {
            self.map(aref.frame(), prot.without_write())?;
        } else if aref.refs() == 1 && !aref.is_copy() {
            self.map(aref.frame(), prot)?;
        } else {
            let copy = self.copy(&aref.frame())?;
            let slot = anon.replace(self.offset, &aref, VmAref::new(copy));
            self.map_slot(&slot, prot)?;
            debug!("fault {}: copied shared slot", self.page);
        }
        Ok(true)
    }

    fn object(&self, entry: &mut VmEntry) -> Result<(), VmError> {
        let flags = entry.flags();
        let prot = flags.protection();
        let Some(object) = entry.object() else {
            return Err(VmError::InvalidRange);
        };
        let frame = object.page(self.paging, self.offset)?;
        if !flags.is_private_writable() {
            return self.map(frame, prot);
        }

        let aref = if self.access == Access::Write {
            VmAref::new(self.copy(&frame)?)
        } else {
            let aref = VmAref::new(frame);
            aref.set_copy(true);
            aref
        };
        let anon = entry.anon.get_or_insert_with(VmAnon::new);
        let slot = anon.insert_or_get(self.offset, aref);
        self.map_slot(&slot, prot)
    }

    fn zero_fill(&self, entry: &mut VmEntry) -> Result<(), VmError> {
        let prot = entry.flags().protection();
        let frame = self.alloc()?;
        self.paging.zero_frame(&frame);
        // Another space sharing the anon may have filled the slot meanwhile;
        // its frame wins and ours is released.
        let anon = entry.anon.get_or_insert_with(VmAnon::new);
        let slot = anon.insert_or_get(self.offset, VmAref::new(frame));
        self.map_slot(&slot, prot)
    }

    /// Map the frame of `slot`, read-only unless the slot is ours to write.
    fn map_slot(&self, slot: &VmAref, prot: Protection) -> Result<(), VmError> {
        if slot.is_copy() || slot.refs() > 1 {
            self.map(slot.frame(), prot.without_write())
        } else {
            self.map(slot.frame(), prot)
        }
    }

    fn map(&self, frame: Frame, prot: Protection) -> Result<(), VmError> {
        self.pmap.add(self.page, frame, prot)?;
        Ok(())
    }

    fn alloc(&self) -> Result<Frame, VmError> {
        let pmm = self.paging.pmm();
        Ok(pmm
            .alloc_frame(Zone::Normal)
            .or_else(|_| pmm.alloc_frame(Zone::Dma))?)
    }

    fn copy(&self, src: &Frame) -> Result<Frame, VmError> {
        let frame = self.alloc()?;
        self.paging.copy_frame(src, &frame);
        Ok(frame)
    }
}
