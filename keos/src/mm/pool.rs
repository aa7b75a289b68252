//! Bounded pool of physical pages.
//!
//! The pool owns a contiguous run of 4KiB frames and hands them out at synthetic physical addresses
//! starting from a configurable base. Frame `i` lives at `base + i * PAGE_SIZE`. Allocation state is a
//! bitmap and a reference count per frame, both behind one [`SpinLock`].
use super::{FrameAllocator, Page};
use crate::addressing::{Pa, Va, PAGE_SHIFT, PAGE_SIZE};
use crate::sync::SpinLock;
use alloc::{boxed::Box, vec, vec::Vec};
use core::cell::UnsafeCell;

#[repr(C, align(4096))]
struct Frame(UnsafeCell<[u8; PAGE_SIZE]>);

struct Arena {
    // 0: used, 1: unused
    bitmap: Vec<u64>,
    refcnt: Vec<u32>,
    free: usize,
}

impl Arena {
    fn new(cnt: usize) -> Self {
        let mut bitmap = vec![u64::MAX; (cnt + 63) / 64];
        // Pad back.
        if cnt % 64 != 0 {
            if let Some(last) = bitmap.last_mut() {
                *last = (1 << (cnt % 64)) - 1;
            }
        }
        Self {
            bitmap,
            refcnt: vec![0; cnt],
            free: cnt,
        }
    }
    fn is_used(&self, index: usize) -> bool {
        let (pos, ofs) = (index / 64, index % 64);
        self.bitmap[pos] & (1 << ofs) == 0
    }
    fn set_used(&mut self, index: usize) {
        let (pos, ofs) = (index / 64, index % 64);
        debug_assert_ne!(self.bitmap[pos] & (1 << ofs), 0);
        self.bitmap[pos] &= !(1 << ofs);
        self.free -= 1;
    }
    fn set_unused(&mut self, index: usize) {
        let (pos, ofs) = (index / 64, index % 64);
        debug_assert_eq!(self.bitmap[pos] & (1 << ofs), 0);
        self.bitmap[pos] |= 1 << ofs;
        self.free += 1;
    }
    fn alloc(&mut self) -> Option<usize> {
        // search first qword that contains one.
        let pos = self.bitmap.iter().position(|qword| *qword != 0)?;
        let index = pos * 64 + self.bitmap[pos].trailing_zeros() as usize;
        self.set_used(index);
        Some(index)
    }
}

/// A bounded physical page allocator backed by host memory.
pub struct PagePool {
    frames: Box<[Frame]>,
    base: Pa,
    arena: SpinLock<Arena>,
}

// Frame contents are only reached through addresses the pool hands out. Whoever holds a reference to a
// frame is responsible for synchronizing access to its bytes.
unsafe impl Sync for PagePool {}

impl PagePool {
    /// Physical address of the first frame of a pool created by [`PagePool::with_capacity`].
    pub const DEFAULT_BASE: usize = 0x1_0000_0000;

    /// Create a pool of `pages` frames whose first frame is at physical address `base`.
    ///
    /// Returns `None` if `base` is zero or not page aligned, or if the pool does not fit
    /// in the physical address space.
    pub fn new(base: Pa, pages: usize) -> Option<Self> {
        if base == Pa::ZERO || !base.is_page_aligned() {
            return None;
        }
        Pa::new(
            base.into_usize()
                .checked_add(pages.checked_mul(PAGE_SIZE)?)?,
        )?;
        // All-zero bytes are a valid `Frame`.
        let frames = unsafe { Box::<[Frame]>::new_zeroed_slice(pages).assume_init() };
        Some(Self {
            frames,
            base,
            arena: SpinLock::new(Arena::new(pages)),
        })
    }

    /// Create a pool of `pages` frames at [`PagePool::DEFAULT_BASE`].
    ///
    /// # Panics
    /// Panics if the pool would reach past the physical address width. Use [`PagePool::new`] to
    /// handle that case.
    pub fn with_capacity(pages: usize) -> Self {
        match Pa::new(Self::DEFAULT_BASE).and_then(|base| Self::new(base, pages)) {
            Some(pool) => pool,
            None => panic!("Pool of {} pages does not fit in physical memory.", pages),
        }
    }

    /// Total number of frames in this pool.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    /// Number of frames that can still be allocated.
    #[inline]
    pub fn free_pages(&self) -> usize {
        self.arena.lock().free
    }

    /// Number of frames currently allocated.
    #[inline]
    pub fn used_pages(&self) -> usize {
        self.capacity() - self.free_pages()
    }

    /// Index of the frame containing `pa`.
    fn frame_index(&self, pa: Pa) -> Option<usize> {
        let ofs = pa.into_usize().checked_sub(self.base.into_usize())?;
        let index = ofs >> PAGE_SHIFT;
        (index < self.frames.len()).then_some(index)
    }

    fn page_index(&self, page: Page) -> Option<usize> {
        if page.pa().is_page_aligned() {
            self.frame_index(page.pa())
        } else {
            None
        }
    }
}

impl FrameAllocator for PagePool {
    fn alloc(&self, zero: bool) -> Option<Page> {
        let index = self.arena.lock().alloc()?;
        if zero {
            // The frame is unreachable from anyone else until it is returned.
            unsafe { (*self.frames[index].0.get()).fill(0) };
        }
        let page = Page(self.base + (index << PAGE_SHIFT));
        log::trace!("alloc {:?}", page.pa());
        Some(page)
    }

    fn free(&self, page: Page) {
        let Some(index) = self.page_index(page) else {
            log::warn!("free of foreign page {:?}", page.pa());
            return;
        };
        let mut arena = self.arena.lock();
        if !arena.is_used(index) {
            log::warn!("double free of {:?}", page.pa());
        } else if arena.refcnt[index] != 0 {
            log::warn!(
                "refusing to free {:?} with {} references",
                page.pa(),
                arena.refcnt[index]
            );
        } else {
            arena.set_unused(index);
        }
    }

    fn ref_count(&self, page: Page) -> usize {
        self.page_index(page)
            .map(|index| self.arena.lock().refcnt[index] as usize)
            .unwrap_or(0)
    }

    fn increment_ref(&self, page: Page) {
        if let Some(index) = self.page_index(page) {
            let mut arena = self.arena.lock();
            debug_assert!(arena.is_used(index), "reference to free page {:?}", page.pa());
            arena.refcnt[index] += 1;
        }
    }

    fn decrement_ref(&self, page: Page) {
        let Some(index) = self.page_index(page) else {
            return;
        };
        let mut arena = self.arena.lock();
        match arena.refcnt[index] {
            0 => log::warn!("reference count underflow on {:?}", page.pa()),
            1 => {
                arena.refcnt[index] = 0;
                arena.set_unused(index);
                log::trace!("free {:?}", page.pa());
            }
            _ => arena.refcnt[index] -= 1,
        }
    }

    fn pa_to_page(&self, pa: Pa) -> Option<Page> {
        let page = Page(pa);
        self.page_index(page).map(|_| page)
    }

    fn pa_to_va(&self, pa: Pa) -> Option<Va> {
        let index = self.frame_index(pa)?;
        Va::new(self.frames[index].0.get() as usize + pa.page_offset())
    }

    fn va_to_pa(&self, va: Va) -> Option<Pa> {
        let start = self.frames.as_ptr() as usize;
        let ofs = va.into_usize().checked_sub(start)?;
        if ofs < self.frames.len() * PAGE_SIZE {
            Some(self.base + ofs)
        } else {
            None
        }
    }
}

impl core::fmt::Debug for PagePool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PagePool")
            .field("base", &self.base)
            .field("capacity", &self.capacity())
            .field("free", &self.free_pages())
            .finish()
    }
}
