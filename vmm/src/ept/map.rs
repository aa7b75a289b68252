use super::{EptError, EptManager, EptSlot, Epte, EpteFlags};
use crate::vm::Gpa;
use abyss::x86_64::invept::EptInvalidator;
use keos::{
    addressing::{Pa, Va},
    mm::{FrameAllocator, Page},
};

impl<A: FrameAllocator, I: EptInvalidator> EptManager<A, I> {
    /// Every leaf is installed here.
    ///
    /// Takes one reference to `page`, then drops the reference of the frame the slot mapped before,
    /// if any. Re-installing the frame that is already mapped therefore keeps its count.
    fn install_leaf(&self, slot: EptSlot<'_>, page: Page, flags: EpteFlags) -> Result<(), EptError> {
        let mut epte = Epte::EMPTY;
        epte.set_pa(page.pa())?.set_perm(flags.check_leaf()?);
        self.alloc.increment_ref(page);
        let old = slot.get();
        slot.set(epte);
        if let Some(old) = old.pa().and_then(|pa| self.alloc.pa_to_page(pa)) {
            self.alloc.decrement_ref(old);
        }
        log::trace!("leaf {:?} -> {:?} ({:?})", slot, page.pa(), flags);
        Ok(())
    }

    /// Map `page` at `gpa` with `flags`.
    ///
    /// A present leaf at `gpa` is replaced, and the replaced frame loses the reference the leaf held.
    pub fn insert_page(
        &self,
        root: Pa,
        page: Page,
        gpa: Gpa,
        flags: EpteFlags,
    ) -> Result<(), EptError> {
        if !gpa.is_page_aligned() {
            return Err(EptError::Unaligned);
        }
        let flags = flags.check_leaf()?;
        let slot = self.lookup(root, gpa, true)?;
        self.install_leaf(slot, page, flags)
    }

    /// Map the frame behind the host address `hva` at `gpa`.
    ///
    /// The leaf gets the access rights of `perm` and always the write-back, ignore-PAT memory type.
    /// If `gpa` is already mapped, fails with [`EptError::AlreadyMapped`] unless `overwrite` is set.
    pub fn map_host_to_guest(
        &self,
        root: Pa,
        hva: Va,
        gpa: Gpa,
        perm: EpteFlags,
        overwrite: bool,
    ) -> Result<(), EptError> {
        if !hva.is_page_aligned() || !gpa.is_page_aligned() {
            return Err(EptError::Unaligned);
        }
        let page = self
            .alloc
            .va_to_pa(hva)
            .and_then(|pa| self.alloc.pa_to_page(pa))
            .ok_or(EptError::InvalidAddress)?;
        let flags = ((perm - EpteFlags::MEMORY_TYPE - EpteFlags::IGNORE_PAT) | EpteFlags::WB_IPAT)
            .check_leaf()?;
        let slot = self.lookup(root, gpa, true)?;
        if slot.get().is_present() && !overwrite {
            return Err(EptError::AlreadyMapped);
        }
        self.install_leaf(slot, page, flags)
    }

    /// Host physical address that `gpa` translates to, or `None` if `gpa` is unmapped.
    pub fn gpa_to_hpa(&self, root: Pa, gpa: Gpa) -> Result<Option<Pa>, EptError> {
        match self.lookup(root, gpa, false) {
            Ok(slot) => Ok(slot.get().pa().map(|pa| pa + gpa.page_offset())),
            Err(EptError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Host virtual address that `gpa` translates to, or `None` if `gpa` is unmapped.
    pub fn translate(&self, root: Pa, gpa: Gpa) -> Result<Option<Va>, EptError> {
        Ok(self
            .gpa_to_hpa(root, gpa)?
            .and_then(|pa| self.alloc.pa_to_va(pa)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ept::{EptLevel, MemoryType};
    use alloc::sync::Arc;
    use keos::mm::PagePool;

    struct NoInvalidate;

    impl EptInvalidator for NoInvalidate {
        fn invalidate(&self, _eptp: u64) {}
    }

    fn manager(pages: usize) -> (EptManager<PagePool, NoInvalidate>, Pa) {
        let pool = Arc::new(PagePool::with_capacity(pages));
        let root = pool.alloc(true).unwrap();
        pool.increment_ref(root);
        (EptManager::new(pool, NoInvalidate), root.pa())
    }

    fn hva(ept: &EptManager<PagePool, NoInvalidate>, page: Page) -> Va {
        ept.allocator().pa_to_va(page.pa()).unwrap()
    }

    #[test]
    fn insert_takes_one_reference() {
        let (ept, root) = manager(16);
        let alloc = ept.allocator();
        let page = alloc.alloc(true).unwrap();
        let gpa = Gpa::new(0x10_0000).unwrap();

        ept.insert_page(root, page, gpa, EpteFlags::FULL).unwrap();
        assert_eq!(alloc.ref_count(page), 1);
        assert_eq!(ept.translate(root, gpa), Ok(Some(hva(&ept, page))));
        assert_eq!(
            ept.translate(root, gpa + 0x10),
            Ok(Some(hva(&ept, page) + 0x10))
        );

        // Re-inserting the mapped frame keeps one reference.
        ept.insert_page(root, page, gpa, EpteFlags::READ).unwrap();
        assert_eq!(alloc.ref_count(page), 1);
        assert_eq!(
            ept.lookup(root, gpa, false).unwrap().get().flags(),
            EpteFlags::READ
        );
    }

    #[test]
    fn insert_replaces_and_releases() {
        let (ept, root) = manager(16);
        let alloc = ept.allocator();
        let (a, b) = (alloc.alloc(true).unwrap(), alloc.alloc(true).unwrap());
        let gpa = Gpa::new(0x3000).unwrap();
        ept.insert_page(root, a, gpa, EpteFlags::FULL).unwrap();
        let used = alloc.used_pages();
        ept.insert_page(root, b, gpa, EpteFlags::FULL).unwrap();
        assert_eq!(alloc.ref_count(b), 1);
        // `a` lost its only reference and went back to the pool.
        assert_eq!(alloc.used_pages(), used - 1);
        assert_eq!(ept.translate(root, gpa), Ok(Some(hva(&ept, b))));
    }

    #[test]
    fn rejected_inserts() {
        let (ept, root) = manager(16);
        let alloc = ept.allocator();
        let page = alloc.alloc(true).unwrap();
        let used = alloc.used_pages();
        assert_eq!(
            ept.insert_page(root, page, Gpa::new(0x1234).unwrap(), EpteFlags::FULL),
            Err(EptError::Unaligned)
        );
        assert_eq!(
            ept.insert_page(root, page, Gpa::new(0x1000).unwrap(), EpteFlags::WB_IPAT),
            Err(EptError::InvalidPermission)
        );
        assert_eq!(
            ept.insert_page(root, page, Gpa::new(0x1000).unwrap(), EpteFlags::WRITE),
            Err(EptError::InvalidPermission)
        );
        assert_eq!(
            ept.insert_page(Pa::ZERO, page, Gpa::new(0x1000).unwrap(), EpteFlags::FULL),
            Err(EptError::InvalidRoot)
        );
        // Nothing was allocated or referenced.
        assert_eq!(alloc.used_pages(), used);
        assert_eq!(alloc.ref_count(page), 0);
    }

    #[test]
    fn map_host_to_guest_overwrite() {
        let (ept, root) = manager(16);
        let alloc = ept.allocator();
        let (a, b) = (alloc.alloc(true).unwrap(), alloc.alloc(true).unwrap());
        alloc.increment_ref(a);
        alloc.increment_ref(b);
        let gpa = Gpa::new(0x7000).unwrap();

        ept.map_host_to_guest(root, hva(&ept, a), gpa, EpteFlags::READ, false)
            .unwrap();
        assert_eq!(alloc.ref_count(a), 2);
        let epte = ept.lookup(root, gpa, false).unwrap().get();
        assert_eq!(epte.flags(), EpteFlags::READ | EpteFlags::WB_IPAT);
        assert_eq!(epte.flags().memory_type(), Some(MemoryType::WriteBack));

        assert_eq!(
            ept.map_host_to_guest(root, hva(&ept, b), gpa, EpteFlags::FULL, false),
            Err(EptError::AlreadyMapped)
        );
        assert_eq!(alloc.ref_count(a), 2);
        assert_eq!(alloc.ref_count(b), 1);
        assert_eq!(ept.translate(root, gpa), Ok(Some(hva(&ept, a))));

        ept.map_host_to_guest(root, hva(&ept, b), gpa, EpteFlags::FULL, true)
            .unwrap();
        assert_eq!(alloc.ref_count(a), 1);
        assert_eq!(alloc.ref_count(b), 2);
        assert_eq!(ept.translate(root, gpa), Ok(Some(hva(&ept, b))));
    }

    #[test]
    fn caller_memory_type_is_ignored() {
        let (ept, root) = manager(16);
        let page = ept.allocator().alloc(true).unwrap();
        let gpa = Gpa::new(0x5000).unwrap();
        ept.map_host_to_guest(
            root,
            hva(&ept, page),
            gpa,
            EpteFlags::FULL | MemoryType::Uncacheable.into_flags(),
            false,
        )
        .unwrap();
        let flags = ept.lookup(root, gpa, false).unwrap().get().flags();
        assert_eq!(flags, EpteFlags::FULL | EpteFlags::WB_IPAT);
    }

    #[test]
    fn map_host_to_guest_rejects_foreign_memory() {
        let (ept, root) = manager(16);
        let outside = [0u8; 8192];
        let va = Va::new(outside.as_ptr() as usize).unwrap();
        let va = Va::new(keos::addressing::align_up(va.into_usize(), 0x1000)).unwrap();
        assert_eq!(
            ept.map_host_to_guest(root, va, Gpa::new(0).unwrap(), EpteFlags::FULL, false),
            Err(EptError::InvalidAddress)
        );
        let page = ept.allocator().alloc(true).unwrap();
        let unaligned = hva(&ept, page) + 8;
        assert_eq!(
            ept.map_host_to_guest(root, unaligned, Gpa::new(0).unwrap(), EpteFlags::FULL, false),
            Err(EptError::Unaligned)
        );
    }

    #[test]
    fn translate_unmapped() {
        let (ept, root) = manager(16);
        let page = ept.allocator().alloc(true).unwrap();
        ept.insert_page(root, page, Gpa::new(0x20_0000).unwrap(), EpteFlags::FULL)
            .unwrap();
        // Absent intermediate level.
        assert_eq!(ept.translate(root, Gpa::new(0x8000_0000).unwrap()), Ok(None));
        // Present page table, absent leaf.
        assert_eq!(ept.translate(root, Gpa::new(0x20_1000).unwrap()), Ok(None));
        assert_eq!(
            ept.translate(Pa::ZERO, Gpa::new(0x20_0000).unwrap()),
            Err(EptError::InvalidRoot)
        );
    }

    #[test]
    fn neighbouring_pages_use_distinct_leaves() {
        let (ept, root) = manager(16);
        let alloc = ept.allocator();
        let (a, b) = (alloc.alloc(true).unwrap(), alloc.alloc(true).unwrap());
        // Straddles a page-table boundary.
        let lo = Gpa::new(0x1f_f000).unwrap();
        let hi = lo + 0x1000;
        ept.insert_page(root, a, lo, EpteFlags::FULL).unwrap();
        ept.insert_page(root, b, hi, EpteFlags::FULL).unwrap();
        assert_ne!(EptLevel::Pd.index(lo), EptLevel::Pd.index(hi));
        assert_eq!(alloc.ref_count(a), 1);
        assert_eq!(alloc.ref_count(b), 1);
        assert_eq!(ept.translate(root, lo), Ok(Some(hva(&ept, a))));
        assert_eq!(ept.translate(root, hi), Ok(Some(hva(&ept, b))));
    }
}
