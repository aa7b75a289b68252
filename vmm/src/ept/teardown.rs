use super::{EptError, EptLevel, EptManager, EptSlot, EptTable, Epte, Eptp, ENTRIES};
use abyss::x86_64::invept::EptInvalidator;
use core::ptr::NonNull;
use keos::{addressing::Pa, mm::FrameAllocator};

impl<A: FrameAllocator, I: EptInvalidator> EptManager<A, I> {
    /// Release every table and guest page reachable from `root`.
    ///
    /// Leaves are released before the table holding them. The root itself is kept, emptied. Cached
    /// translations of the hierarchy are invalidated if anything was released, so calling this on
    /// an empty hierarchy does nothing.
    ///
    /// Returns the number of references dropped.
    pub fn free_guest_memory(&self, root: Pa) -> Result<usize, EptError> {
        let table = self.table(root).ok_or(EptError::InvalidRoot)?;
        let released = unsafe { self.free_level(table, EptLevel::Pml4) };
        if released != 0 {
            let eptp = Eptp::new(root);
            self.invalidator.invalidate(eptp.into_u64());
            log::debug!("released {} frames of {:?}", released, eptp);
        }
        Ok(released)
    }

    /// # Safety
    /// `table` must be a `level` table of a hierarchy that nobody else walks.
    unsafe fn free_level(&self, table: NonNull<EptTable>, level: EptLevel) -> usize {
        let mut released = 0;
        for index in 0..ENTRIES {
            let slot = EptSlot::new(table, index);
            let epte = slot.get();
            let Some(pa) = epte.pa() else {
                continue;
            };
            slot.set(Epte::EMPTY);
            if let (Some(next), Some(child)) = (level.next(), self.table_of(epte)) {
                released += self.free_level(child, next);
            }
            if let Some(page) = self.alloc.pa_to_page(pa) {
                self.alloc.decrement_ref(page);
                released += 1;
            }
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ept::EpteFlags, vm::Gpa};
    use alloc::{sync::Arc, vec::Vec};
    use core::sync::atomic::{AtomicUsize, Ordering};
    use keos::mm::PagePool;

    #[derive(Default)]
    struct Recorder {
        count: AtomicUsize,
        last: AtomicUsize,
    }

    impl EptInvalidator for Recorder {
        fn invalidate(&self, eptp: u64) {
            self.count.fetch_add(1, Ordering::SeqCst);
            self.last.store(eptp as usize, Ordering::SeqCst);
        }
    }

    #[test]
    fn teardown_releases_everything_but_root() {
        let pool = Arc::new(PagePool::with_capacity(64));
        let recorder = Arc::new(Recorder::default());
        let ept = EptManager::new(pool.clone(), recorder.clone());
        let root = pool.alloc(true).unwrap();
        pool.increment_ref(root);

        let gpas = [0x0, 0x1000, 0x20_0000, 0x4000_0000, 0x80_0000_0000];
        let pages = gpas
            .iter()
            .map(|gpa| {
                let page = pool.alloc(true).unwrap();
                ept.insert_page(root.pa(), page, Gpa::new(*gpa).unwrap(), EpteFlags::FULL)
                    .unwrap();
                page
            })
            .collect::<Vec<_>>();
        let used = pool.used_pages();
        assert!(used > 1 + pages.len());

        // Every table and page was referenced once, so each release frees a frame.
        assert_eq!(ept.free_guest_memory(root.pa()), Ok(used - 1));
        assert_eq!(pool.used_pages(), 1);
        assert_eq!(pool.ref_count(root), 1);
        assert!(pages.iter().all(|p| pool.ref_count(*p) == 0));
        for gpa in gpas {
            assert_eq!(ept.translate(root.pa(), Gpa::new(gpa).unwrap()), Ok(None));
        }
        assert_eq!(recorder.count.load(Ordering::SeqCst), 1);
        assert_eq!(
            recorder.last.load(Ordering::SeqCst) as u64,
            Eptp::new(root.pa()).into_u64()
        );

        // Second teardown is a no-op.
        assert_eq!(ept.free_guest_memory(root.pa()), Ok(0));
        assert_eq!(recorder.count.load(Ordering::SeqCst), 1);
        assert_eq!(pool.used_pages(), 1);
    }

    #[test]
    fn shared_pages_survive_teardown() {
        let pool = Arc::new(PagePool::with_capacity(16));
        let ept = EptManager::new(pool.clone(), Recorder::default());
        let root = pool.alloc(true).unwrap();
        pool.increment_ref(root);
        let shared = pool.alloc(true).unwrap();
        pool.increment_ref(shared);

        for gpa in [0x1000, 0x2000, 0x3000] {
            ept.insert_page(root.pa(), shared, Gpa::new(gpa).unwrap(), EpteFlags::READ)
                .unwrap();
        }
        assert_eq!(pool.ref_count(shared), 4);
        assert_eq!(ept.free_guest_memory(root.pa()), Ok(3 + 3));
        assert_eq!(pool.ref_count(shared), 1);
        assert_eq!(pool.used_pages(), 2);
    }

    #[test]
    fn invalid_root() {
        let pool = Arc::new(PagePool::with_capacity(1));
        let ept = EptManager::new(pool, Recorder::default());
        assert_eq!(ept.free_guest_memory(Pa::ZERO), Err(EptError::InvalidRoot));
        assert_eq!(ept.invalidator.count.load(Ordering::SeqCst), 0);
    }
}
