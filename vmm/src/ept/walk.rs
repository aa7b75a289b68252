use super::{EptError, EptLevel, EptManager, EptSlot, EptTable, Epte, EpteFlags};
use crate::vm::Gpa;
use abyss::x86_64::invept::EptInvalidator;
use core::ptr::NonNull;
use keos::{addressing::Pa, mm::FrameAllocator};

impl<A: FrameAllocator, I: EptInvalidator> EptManager<A, I> {
    /// Walk the hierarchy rooted at `root` down to the leaf slot of `gpa`.
    ///
    /// With `create`, missing intermediate tables are allocated on the way. The leaf slot itself is
    /// neither read nor filled.
    ///
    /// Tables created before a failure stay installed; the hierarchy remains valid input to
    /// [`EptManager::free_guest_memory`].
    pub(crate) fn lookup(
        &self,
        root: Pa,
        gpa: Gpa,
        create: bool,
    ) -> Result<EptSlot<'_>, EptError> {
        let mut table = self.table(root).ok_or(EptError::InvalidRoot)?;
        for level in [EptLevel::Pml4, EptLevel::Pdpt, EptLevel::Pd] {
            let slot = unsafe { EptSlot::new(table, level.index(gpa)) };
            let next = match slot.get().pa() {
                Some(pa) => pa,
                None if create => self.create_table(slot, level)?,
                None => return Err(EptError::NotFound),
            };
            table = self.table(next).ok_or(EptError::InvalidAddress)?;
        }
        Ok(unsafe { EptSlot::new(table, EptLevel::Pt.index(gpa)) })
    }

    /// Install a fresh table into the empty `slot` of a `level` table.
    fn create_table(&self, slot: EptSlot<'_>, level: EptLevel) -> Result<Pa, EptError> {
        let page = self.alloc.alloc(true).ok_or(EptError::OutOfMemory)?;
        let mut epte = Epte::EMPTY;
        epte.set_pa(page.pa())?.set_perm(EpteFlags::FULL);
        self.alloc.increment_ref(page);
        slot.set(epte);
        log::trace!(
            "new {:?} table {:?} at index {}",
            level.next(),
            page.pa(),
            slot.index()
        );
        Ok(page.pa())
    }

    /// Host mapping of the table referenced by `epte`.
    pub(super) fn table_of(&self, epte: Epte) -> Option<NonNull<EptTable>> {
        epte.pa().and_then(|pa| self.table(pa))
    }
}
