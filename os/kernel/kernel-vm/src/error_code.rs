use bitfield_struct::bitfield;
use core::fmt;

/// Kind of memory access that faulted.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Access {
    Read,
    Write,
    Execute,
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Execute => "execute",
        })
    }
}

/// The error code the CPU pushes for a page fault.
///
/// Intel SDM Vol. 3A, §6.15 "Page-Fault Exception (#PF)".
#[bitfield(u64)]
pub struct PageFaultError {
    /// Set for protection violations on present pages, clear for misses.
    pub present: bool,
    pub write: bool,
    /// Access from CPL 3.
    pub user: bool,
    pub reserved_bit: bool,
    pub instruction_fetch: bool,
    pub protection_key: bool,
    pub shadow_stack: bool,
    #[bits(57)]
    __: u64,
}

impl PageFaultError {
    /// Error code describing `access` from user or kernel mode.
    #[must_use]
    pub const fn for_access(access: Access, present: bool, user: bool) -> Self {
        Self::new()
            .with_present(present)
            .with_user(user)
            .with_write(matches!(access, Access::Write))
            .with_instruction_fetch(matches!(access, Access::Execute))
    }

    #[must_use]
    pub const fn access(&self) -> Access {
        if self.instruction_fetch() {
            Access::Execute
        } else if self.write() {
            Access::Write
        } else {
            Access::Read
        }
    }

    #[must_use]
    pub const fn explain(&self) -> &'static str {
        if self.reserved_bit() {
            "Reserved bit set in a paging structure"
        } else if !self.present() {
            "Non-present page"
        } else if self.instruction_fetch() {
            if self.user() {
                "User-mode instruction fetch on protected page"
            } else {
                "Kernel instruction fetch on protected page"
            }
        } else if self.write() {
            "Write access to protected page"
        } else {
            "Read access to protected page"
        }
    }
}
