//! Extended Page Table.
//!
//! ## Background
//! A guest believes it owns a flat physical address space. The hypervisor backs that space with
//! frames of the host, and the processor translates every guest-physical address (GPA) through a
//! second hierarchy of page tables, the EPT, whose root is named by the EPTP field of the VMCS.
//!
//! The hierarchy is a 4-level radix tree indexed by successive 9-bit slices of the GPA. Hardware
//! combines the permissions of every level, so intermediate entries always grant full access and
//! only leaves restrict it.
//!
//! ## Ownership
//! Each present intermediate entry holds one reference to the table page below it, and each present
//! leaf holds one reference to the guest page it maps. References are taken only when an entry is
//! installed and dropped only when it is removed by [`EptManager::free_guest_memory`] or replaced by
//! an overwrite. The root table belongs to the guest; this module never takes or drops a reference to
//! it.
mod bootstrap;
mod entry;
mod map;
mod table;
mod teardown;
mod walk;

pub use entry::{EptLevel, Epte, EpteFlags, MemoryType};
pub use table::{EptTable, ENTRIES};

pub(crate) use table::EptSlot;

use abyss::x86_64::invept::EptInvalidator;
use alloc::sync::Arc;
use core::ptr::NonNull;
use keos::{addressing::Pa, mm::FrameAllocator};

/// Possible errors of EPT operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EptError {
    /// The root table is absent or not a frame of the allocator.
    #[error("invalid EPT root")]
    InvalidRoot,
    /// Probe-only lookup reached an absent intermediate level.
    #[error("no such mapping")]
    NotFound,
    /// Failed to allocate a page for a new table.
    #[error("out of memory")]
    OutOfMemory,
    /// Non-overwriting map onto a present leaf.
    #[error("guest-physical address is already mapped")]
    AlreadyMapped,
    /// Unaligned address
    #[error("unaligned address")]
    Unaligned,
    /// Host address is not backed by a frame of the allocator.
    #[error("invalid host address")]
    InvalidAddress,
    /// Leaf permission that grants nothing, or write without read.
    #[error("invalid permission")]
    InvalidPermission,
}

/// Extended-page-table pointer.
///
/// Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.6.11 Extended-Page-Table Pointer (EPTP)
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Eptp(u64);

impl Eptp {
    /// EPT page-walk length minus one, in bits 5:3.
    const WALK_LENGTH_4: u64 = 3 << 3;

    /// EPTP of the hierarchy rooted at `root`, walked with 4 levels and write-back paging-structure
    /// accesses.
    #[inline]
    pub const fn new(root: Pa) -> Self {
        Self(root.page_down().into_usize() as u64 | Self::WALK_LENGTH_4 | MemoryType::WriteBack as u64)
    }

    /// Raw value for the VMCS EPTP field.
    #[inline]
    pub const fn into_u64(self) -> u64 {
        self.0
    }

    /// Memory type used to access the paging structures.
    #[inline]
    pub fn memory_type(&self) -> Option<MemoryType> {
        MemoryType::try_from((self.0 & 0x7) as u8).ok()
    }

    /// Number of levels of the hierarchy.
    #[inline]
    pub const fn walk_length(&self) -> usize {
        ((self.0 >> 3) & 0x7) as usize + 1
    }
}

impl core::fmt::Debug for Eptp {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Eptp(0x{:x})", self.0)
    }
}

/// Manager of the EPT hierarchies of guests.
///
/// The manager holds no per-guest state: every operation names the root of the hierarchy it works
/// on. Frames come from the allocator the manager was built with, which is shared by every guest.
/// Operations on one hierarchy must not run concurrently with each other; different hierarchies
/// may be worked on from different cores.
pub struct EptManager<A: FrameAllocator, I: EptInvalidator> {
    alloc: Arc<A>,
    invalidator: I,
}

impl<A: FrameAllocator, I: EptInvalidator> EptManager<A, I> {
    /// Create a manager that draws frames from `alloc` and drops cached translations through
    /// `invalidator`.
    pub fn new(alloc: Arc<A>, invalidator: I) -> Self {
        Self { alloc, invalidator }
    }

    /// The physical page allocator of this manager.
    #[inline]
    pub fn allocator(&self) -> &Arc<A> {
        &self.alloc
    }

    /// The invalidator translations are flushed through.
    #[inline]
    pub fn invalidator(&self) -> &I {
        &self.invalidator
    }

    /// Entry `index` of the table at `table`.
    ///
    /// The entry is read out by value. `table` must be a frame of the allocator that is currently
    /// referenced, i.e. a root owned by a guest or a table installed in a hierarchy.
    pub fn entry_at(&self, table: Pa, index: usize) -> Result<Epte, EptError> {
        if index >= ENTRIES {
            return Err(EptError::InvalidAddress);
        }
        let referenced = self
            .alloc
            .pa_to_page(table)
            .map_or(false, |page| self.alloc.ref_count(page) != 0);
        if !referenced {
            return Err(EptError::InvalidAddress);
        }
        let table = self.table(table).ok_or(EptError::InvalidAddress)?;
        Ok(unsafe { EptSlot::new(table, index) }.get())
    }

    /// Host mapping of the table at `pa`.
    fn table(&self, pa: Pa) -> Option<NonNull<EptTable>> {
        if pa == Pa::ZERO || !pa.is_page_aligned() {
            return None;
        }
        self.alloc
            .pa_to_va(pa)
            .and_then(|va| NonNull::new(va.as_ptr::<EptTable>()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eptp_encoding() {
        let eptp = Eptp::new(Pa::new(0x1234_5000).unwrap());
        assert_eq!(eptp.into_u64(), 0x1234_501e);
        assert_eq!(eptp.walk_length(), 4);
        assert_eq!(eptp.memory_type(), Some(MemoryType::WriteBack));
    }
}
