//! EPT tables and typed access to their slots.
use super::entry::Epte;
use core::{marker::PhantomData, ptr::NonNull};
use keos::addressing::PAGE_SIZE;
use static_assertions::const_assert_eq;

/// Number of entries in a table.
pub const ENTRIES: usize = 512;

/// A table of any level of an EPT hierarchy. Occupies exactly one page.
#[repr(C, align(4096))]
pub struct EptTable(pub [Epte; ENTRIES]);

const_assert_eq!(core::mem::size_of::<EptTable>(), PAGE_SIZE);
const_assert_eq!(core::mem::align_of::<EptTable>(), PAGE_SIZE);

/// One slot of an EPT table.
///
/// A slot is the pair of a table and an index into it. It stays valid while the table it points
/// into is part of a hierarchy, so slots never outlive the manager operation that produced them.
#[derive(Clone, Copy)]
pub(crate) struct EptSlot<'a> {
    table: NonNull<EptTable>,
    index: usize,
    _l: PhantomData<&'a EptTable>,
}

impl<'a> EptSlot<'a> {
    /// Slot `index` of `table`.
    ///
    /// # Safety
    /// `table` must point to a live table that nobody else mutates for `'a`.
    #[inline]
    pub(crate) unsafe fn new(table: NonNull<EptTable>, index: usize) -> Self {
        debug_assert!(index < ENTRIES);
        Self {
            table,
            index,
            _l: PhantomData,
        }
    }

    /// Index of this slot within its table.
    #[inline]
    pub(crate) fn index(&self) -> usize {
        self.index
    }

    /// Read the entry in this slot.
    #[inline]
    pub(crate) fn get(&self) -> Epte {
        unsafe { (*self.table.as_ptr()).0[self.index] }
    }

    /// Replace the entry in this slot.
    #[inline]
    pub(crate) fn set(&self, epte: Epte) {
        unsafe { (*self.table.as_ptr()).0[self.index] = epte }
    }
}

impl core::fmt::Debug for EptSlot<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EptSlot")
            .field("table", &self.table)
            .field("index", &self.index)
            .field("entry", &self.get())
            .finish()
    }
}
