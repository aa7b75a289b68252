//! EPT paging-structure entries.
//!
//! Intel® 64 and IA-32 Architectures Software Developer's Manual: 29.3.2 EPT Translation Mechanism
//!
//! Every level of the hierarchy uses the same 64-bit layout for the fields this crate cares about:
//! permission bits 2:0, memory type bits 5:3 and the ignore-PAT bit 6 (leaf only), and the
//! frame address in bits 51:12. An entry is present iff any of its permission bits is set.
use super::EptError;
use crate::vm::Gpa;
use keos::addressing::{Pa, PAGE_SHIFT};
use num_enum::TryFromPrimitive;

/// EPT memory types.
///
/// Intel® 64 and IA-32 Architectures Software Developer's Manual: 29.3.7 EPT and Memory Typing
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
pub enum MemoryType {
    /// Uncacheable.
    Uncacheable = 0,
    /// Write combining.
    WriteCombining = 1,
    /// Write through.
    WriteThrough = 4,
    /// Write protected.
    WriteProtected = 5,
    /// Write back.
    WriteBack = 6,
}

impl MemoryType {
    /// Flags that encode this memory type in a leaf entry.
    #[inline]
    pub const fn into_flags(self) -> EpteFlags {
        EpteFlags::from_bits_truncate((self as usize) << 3)
    }
}

bitflags::bitflags! {
    /// Table 29-6. Format of an EPT Page-Table Entry that Maps a 4-KByte Page
    ///
    /// Non-leaf entries interpret the same permission bits and ignore the memory type bits.
    pub struct EpteFlags: usize {
        /// indicates whether reads are allowed from the region controlled by this entry
        const READ = 1 << 0;
        /// indicates whether writes are allowed to the region controlled by this entry
        const WRITE = 1 << 1;
        /// If the “mode-based execute control for EPT” VM-execution control is 0, execute access;
        /// indicates whether instruction fetches are allowed from the region controlled by this entry
        const EXECUTE = 1 << 2;
        // bit 5-3. EPT memory type for this 4-KByte page (see Section 29.3.7)
        #[doc(hidden)]
        const BIT3 = 1 << 3;
        #[doc(hidden)]
        const BIT4 = 1 << 4;
        #[doc(hidden)]
        const BIT5 = 1 << 5;
        /// Ignore PAT memory type for this 4-KByte page (see Section 29.3.7)
        const IGNORE_PAT = 1 << 6;
        /// indicates whether software has accessed the region referenced by this entry.
        /// Ignored if bit 6 of EPTP is 0
        const ACCESSED = 1 << 8;
        /// indicates whether software has written to the 4-KByte page referenced by this entry.
        /// Ignored if bit 6 of EPTP is 0
        const DIRTY = 1 << 9;
        /// If the “mode-based execute control for EPT” VM-execution control is 1, indicates whether instruction
        /// fetches are allowed from user-mode linear addresses in the region controlled by this entry.
        const USER_EXECUTE = 1 << 10;
        /// Suppress #VE. If the “EPT-violation #VE” VM-execution control is 1, EPT violations caused by
        /// accesses to this page are convertible to virtualization exceptions only if this bit is 0.
        const SUPPRESS_VE = 1 << 63;

        /// All access rights.
        const FULL = Self::READ.bits() | Self::WRITE.bits() | Self::EXECUTE.bits();
        /// Memory type field.
        const MEMORY_TYPE = Self::BIT3.bits() | Self::BIT4.bits() | Self::BIT5.bits();
        /// Write-back memory that ignores the guest PAT, the type of guest RAM.
        const WB_IPAT = (6 << 3) | Self::IGNORE_PAT.bits();
    }
}

impl EpteFlags {
    /// Memory type encoded in these flags.
    #[inline]
    pub fn memory_type(&self) -> Option<MemoryType> {
        MemoryType::try_from(((*self & Self::MEMORY_TYPE).bits() >> 3) as u8).ok()
    }

    /// Validate the access rights of a leaf entry.
    ///
    /// A leaf with no access right is non-present, and a writable but unreadable leaf is an EPT
    /// misconfiguration.
    pub(crate) fn check_leaf(self) -> Result<Self, EptError> {
        let rights = self & Self::FULL;
        if rights.is_empty() || (rights.contains(Self::WRITE) && !rights.contains(Self::READ)) {
            Err(EptError::InvalidPermission)
        } else {
            Ok(self)
        }
    }
}

/// Bits 51:12 of an entry.
const ADDR_MASK: usize = 0x000f_ffff_ffff_f000;

/// An entry of any level of an EPT hierarchy.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Epte(usize);

impl Epte {
    /// The non-present entry.
    pub const EMPTY: Self = Self(0);

    /// Whether this entry references a frame.
    #[inline]
    pub const fn is_present(&self) -> bool {
        self.0 & EpteFlags::FULL.bits() != 0
    }

    /// Get a physical address pointed by this entry.
    #[inline]
    pub fn pa(&self) -> Option<Pa> {
        if self.is_present() {
            Pa::new(self.0 & ADDR_MASK)
        } else {
            None
        }
    }

    /// Get a flags this entry.
    #[inline]
    pub const fn flags(&self) -> EpteFlags {
        EpteFlags::from_bits_truncate(self.0)
    }

    /// Set physical address of this entry.
    ///
    /// # WARNING
    /// Permission of this entry is not changed.
    #[inline]
    pub fn set_pa(&mut self, pa: Pa) -> Result<&mut Self, EptError> {
        if !pa.is_page_aligned() {
            Err(EptError::Unaligned)
        } else {
            self.0 = pa.into_usize() | (self.0 & !ADDR_MASK);
            Ok(self)
        }
    }

    /// Set a permission of this entry.
    #[inline]
    pub fn set_perm(&mut self, perm: EpteFlags) -> &mut Self {
        self.0 = perm.bits() | (self.0 & ADDR_MASK);
        self
    }

    /// Raw value of this entry.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }
}

impl core::fmt::Debug for Epte {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Epte")
            .field("pa", &self.pa())
            .field("flags", &self.flags())
            .finish()
    }
}

/// Levels of the EPT hierarchy, named by the table that is indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EptLevel {
    /// EPT PML4 table, indexed by bits 47:39.
    Pml4 = 3,
    /// EPT page-directory-pointer table, indexed by bits 38:30.
    Pdpt = 2,
    /// EPT page directory, indexed by bits 29:21.
    Pd = 1,
    /// EPT page table, indexed by bits 20:12.
    Pt = 0,
}

impl EptLevel {
    /// Levels from the root down to the leaf table.
    pub const WALK: [EptLevel; 4] = [Self::Pml4, Self::Pdpt, Self::Pd, Self::Pt];

    /// Index of `gpa` within a table of this level.
    #[inline]
    pub const fn index(self, gpa: Gpa) -> usize {
        (gpa.into_usize() >> (PAGE_SHIFT + 9 * self as usize)) & 0x1ff
    }

    /// The level of the tables referenced by entries of this level.
    #[inline]
    pub const fn next(self) -> Option<EptLevel> {
        match self {
            Self::Pml4 => Some(Self::Pdpt),
            Self::Pdpt => Some(Self::Pd),
            Self::Pd => Some(Self::Pt),
            Self::Pt => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presence_follows_permission() {
        let mut e = Epte::EMPTY;
        assert!(!e.is_present());
        e.set_pa(Pa::new(0x1234_5000).unwrap()).unwrap();
        assert!(!e.is_present());
        assert_eq!(e.pa(), None);

        e.set_perm(EpteFlags::READ | EpteFlags::WB_IPAT);
        assert!(e.is_present());
        assert_eq!(e.pa(), Pa::new(0x1234_5000));
        assert_eq!(e.flags().memory_type(), Some(MemoryType::WriteBack));
        assert_eq!(e.into_usize(), 0x1234_5000 | 0x71);

        // Permission changes keep the address; address changes keep the permission.
        e.set_perm(EpteFlags::FULL);
        e.set_pa(Pa::new(0x6000).unwrap()).unwrap();
        assert_eq!(e.into_usize(), 0x6007);
        assert_eq!(
            e.set_pa(Pa::new(0x6010).unwrap()).err(),
            Some(EptError::Unaligned)
        );
    }

    #[test]
    fn memory_types() {
        assert_eq!(
            MemoryType::WriteBack.into_flags() | EpteFlags::IGNORE_PAT,
            EpteFlags::WB_IPAT
        );
        assert_eq!(
            MemoryType::Uncacheable.into_flags().memory_type(),
            Some(MemoryType::Uncacheable)
        );
        assert_eq!((EpteFlags::BIT4).memory_type(), None);
    }

    #[test]
    fn leaf_permission() {
        assert!(EpteFlags::READ.check_leaf().is_ok());
        assert!(EpteFlags::EXECUTE.check_leaf().is_ok());
        assert!((EpteFlags::READ | EpteFlags::WRITE).check_leaf().is_ok());
        assert_eq!(
            EpteFlags::WB_IPAT.check_leaf(),
            Err(EptError::InvalidPermission)
        );
        assert_eq!(
            (EpteFlags::WRITE | EpteFlags::EXECUTE).check_leaf(),
            Err(EptError::InvalidPermission)
        );
    }

    #[test]
    fn gpa_indices() {
        let gpa = Gpa::new((3 << 39) | (5 << 30) | (7 << 21) | (9 << 12) | 0x123).unwrap();
        assert_eq!(EptLevel::Pml4.index(gpa), 3);
        assert_eq!(EptLevel::Pdpt.index(gpa), 5);
        assert_eq!(EptLevel::Pd.index(gpa), 7);
        assert_eq!(EptLevel::Pt.index(gpa), 9);
        assert_eq!(EptLevel::Pml4.next(), Some(EptLevel::Pdpt));
        assert_eq!(EptLevel::Pt.next(), None);
    }
}
