use super::{EptError, EptManager, EpteFlags};
use crate::vm::{Gpa, GuestInfo, EXT_MEM_START, LOW_MEM_END};
use abyss::x86_64::invept::EptInvalidator;
use keos::{
    addressing::{Pa, PAGE_SIZE},
    mm::FrameAllocator,
};

impl<A: FrameAllocator, I: EptInvalidator> EptManager<A, I> {
    /// Back the guest's RAM with fresh zeroed pages.
    ///
    /// Maps `[0, LOW_MEM_END)` and `[EXT_MEM_START, info.phys_size)` page by page with full access.
    /// The legacy hole in between is left unmapped for device and firmware emulation.
    pub fn bootstrap_identity_map(&self, root: Pa, info: &GuestInfo) -> Result<(), EptError> {
        for range in [0..LOW_MEM_END, EXT_MEM_START..info.phys_size] {
            if range.is_empty() {
                continue;
            }
            log::debug!("guest ram {:#x}..{:#x}", range.start, range.end);
            for gpa in range.step_by(PAGE_SIZE) {
                let gpa = Gpa::new(gpa).ok_or(EptError::InvalidAddress)?;
                let page = self.alloc.alloc(true).ok_or(EptError::OutOfMemory)?;
                if let Err(e) = self.insert_page(root, page, gpa, EpteFlags::FULL | EpteFlags::WB_IPAT)
                {
                    self.alloc.free(page);
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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

    #[test]
    fn low_and_extended_memory() {
        let (ept, root) = manager(1024);
        let info = GuestInfo {
            phys_size: 0x20_0000,
            entry: 0,
        };
        ept.bootstrap_identity_map(root, &info).unwrap();

        let mapped = |gpa: usize| ept.translate(root, Gpa::new(gpa).unwrap()).unwrap();
        assert!(mapped(0).is_some());
        assert!(mapped(LOW_MEM_END - PAGE_SIZE).is_some());
        assert!(mapped(LOW_MEM_END).is_none());
        assert!(mapped(EXT_MEM_START - PAGE_SIZE).is_none());
        assert!(mapped(EXT_MEM_START).is_some());
        assert!(mapped(info.phys_size - PAGE_SIZE).is_some());
        assert!(mapped(info.phys_size).is_none());

        // One root, one table of each level for the first 2MiB, one page per mapped frame.
        let frames = (LOW_MEM_END + info.phys_size - EXT_MEM_START) / PAGE_SIZE;
        assert_eq!(ept.allocator().used_pages(), 1 + 3 + frames);

        // Fresh pages are distinct and zeroed.
        let a = mapped(0).unwrap();
        let b = mapped(PAGE_SIZE).unwrap();
        assert_ne!(a, b);
        assert_eq!(unsafe { a.as_ref::<[u8; PAGE_SIZE]>() }, Some(&[0; PAGE_SIZE]));
    }

    #[test]
    fn small_guest_skips_extended_memory() {
        let (ept, root) = manager(256);
        let info = GuestInfo {
            phys_size: 0x8_0000,
            entry: 0,
        };
        ept.bootstrap_identity_map(root, &info).unwrap();
        assert_eq!(
            ept.allocator().used_pages(),
            1 + 3 + LOW_MEM_END / PAGE_SIZE
        );
    }

    #[test]
    fn out_of_memory() {
        let (ept, root) = manager(64);
        let info = GuestInfo {
            phys_size: 0x20_0000,
            entry: 0,
        };
        assert_eq!(
            ept.bootstrap_identity_map(root, &info),
            Err(EptError::OutOfMemory)
        );
        assert_eq!(ept.allocator().free_pages(), 0);
        // What was built is still torn down completely.
        ept.free_guest_memory(root).unwrap();
        assert_eq!(ept.allocator().used_pages(), 1);
    }
}
