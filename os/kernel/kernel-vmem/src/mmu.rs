//! # MMU Control
//!
//! The few privileged operations the pmap layer needs from the CPU.

use kernel_memory_addresses::{PhysicalPage, VirtualAddress};

/// Translation-root and TLB control.
pub trait Mmu: Send + Sync {
    /// Root table the hardware currently walks.
    fn active_root(&self) -> PhysicalPage;

    /// Make `root` the hardware root. Implies a full flush.
    ///
    /// # Safety
    /// `root` must be a valid top-level table mapping the running kernel.
    unsafe fn load_root(&self, root: PhysicalPage);

    /// Drop every non-global cached translation.
    fn flush_all(&self);

    /// Drop the cached translation of one page.
    fn invalidate_page(&self, va: VirtualAddress);
}

/// The x86-64 implementation (`CR3`, `INVLPG`).
#[derive(Debug, Default, Copy, Clone)]
pub struct X86Mmu;

#[cfg(target_arch = "x86_64")]
impl Mmu for X86Mmu {
    fn active_root(&self) -> PhysicalPage {
        let cr3: u64;
        // SAFETY: reading CR3 has no side effects; the kernel runs in ring 0.
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        PhysicalPage::from_number((cr3 & 0x000F_FFFF_FFFF_F000) >> 12)
    }

    unsafe fn load_root(&self, root: PhysicalPage) {
        let cr3 = root.base().as_u64();
        // SAFETY: the caller guarantees `root` maps the running kernel, so
        // execution continues at the same addresses after the switch.
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
    }

    fn flush_all(&self) {
        // SAFETY: reloading the root that is already active changes no
        // translation; it only drops the non-global TLB entries.
        unsafe {
            let cr3: u64;
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
    }

    fn invalidate_page(&self, va: VirtualAddress) {
        // SAFETY: INVLPG only drops a cached translation and never faults,
        // whatever `va` is.
        unsafe {
            core::arch::asm!("invlpg [{}]", in(reg) va.as_u64(), options(nostack, preserves_flags));
        }
    }
}
