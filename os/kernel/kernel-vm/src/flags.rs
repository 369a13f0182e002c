use crate::Access;
use bitflags::bitflags;
use kernel_vmem::Protection;

bitflags! {
    /// Permissions and sharing mode of a region.
    ///
    /// The permission bits match [`Protection`] one to one.
    #[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
    pub struct VmFlags: u32 {
        const KR = 1 << 0;
        const KW = 1 << 1;
        const KX = 1 << 2;
        const UR = 1 << 3;
        const UW = 1 << 4;
        const UX = 1 << 5;
        const NOCACHE = 1 << 6;
        /// Writes reach the backing store and every sharer; no copy-on-write.
        const SHARED = 1 << 7;

        const KRW = Self::KR.bits() | Self::KW.bits();
        const KRX = Self::KR.bits() | Self::KX.bits();
        const KRWX = Self::KRW.bits() | Self::KX.bits();
        const URW = Self::UR.bits() | Self::UW.bits();
        const URX = Self::UR.bits() | Self::UX.bits();
        const URWX = Self::URW.bits() | Self::UX.bits();
    }
}

impl VmFlags {
    const PERM: Self = Self::KRWX.union(Self::URWX).union(Self::NOCACHE);
    const WRITE: Self = Self::KW.union(Self::UW);

    /// Page-table rights for pages of this region.
    #[must_use]
    pub const fn protection(self) -> Protection {
        Protection::from_bits_truncate(self.intersection(Self::PERM).bits())
    }

    #[must_use]
    pub const fn is_writable(self) -> bool {
        self.intersects(Self::WRITE)
    }

    #[must_use]
    pub const fn is_shared(self) -> bool {
        self.contains(Self::SHARED)
    }

    /// Writable without `SHARED`: writes must stay in this address space.
    #[must_use]
    pub const fn is_private_writable(self) -> bool {
        self.is_writable() && !self.is_shared()
    }

    /// Whether `access` is allowed. User-mode accesses need the user bit;
    /// kernel-mode accesses accept either.
    #[must_use]
    pub const fn permits(self, access: Access, user: bool) -> bool {
        let (u, k) = match access {
            Access::Read => (Self::UR, Self::KR),
            Access::Write => (Self::UW, Self::KW),
            Access::Execute => (Self::UX, Self::KX),
        };
        self.contains(u) || (!user && self.contains(k))
    }
}
