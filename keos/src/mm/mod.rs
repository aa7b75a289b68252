//! Physical memory management.
//!
//! Physical pages are shared between the host kernel and the guests it runs. A frame may at the same time
//! back a page table of the host, a table of a guest's extended page table, and a page of guest memory.
//! Rather than giving each user an owning handle, every frame carries a reference count: each mapping that
//! refers to the frame holds one reference, and the frame goes back to the free list when the last
//! reference is dropped.
//!
//! A freshly allocated page starts with **zero** references. The first mapping that installs it takes the
//! first reference.
mod pool;

pub use pool::PagePool;

use crate::addressing::{Pa, Va, PAGE_SIZE};

/// Why a page could not be accessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The page is not managed by this allocator.
    #[error("page is not managed by this allocator")]
    Unmanaged,
    /// The access runs past the end of the page.
    #[error("access past the end of the page")]
    OutOfBounds,
}

/// A physical page representation.
///
/// `Page` only names a frame handed out by a [`FrameAllocator`]; it does not own it.
/// Whether the frame is alive is decided by its reference count.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Page(Pa);

impl Page {
    /// Get physical address of this page.
    #[inline]
    pub const fn pa(&self) -> Pa {
        self.0
    }
}

/// The physical page allocator.
///
/// Implementations are shared between every guest under construction, so all methods take `&self` and
/// must be atomic with respect to each other.
pub trait FrameAllocator: Send + Sync {
    /// Allocate a page. If `zero` is set, the page is filled with zeros.
    ///
    /// Returns `None` when no frame is left. The returned page has a reference count of zero.
    fn alloc(&self, zero: bool) -> Option<Page>;

    /// Return an unreferenced page to the allocator.
    fn free(&self, page: Page);

    /// Current number of references to `page`.
    fn ref_count(&self, page: Page) -> usize;

    /// Take a reference to `page`.
    fn increment_ref(&self, page: Page);

    /// Drop a reference to `page`, freeing it when no reference is left.
    fn decrement_ref(&self, page: Page);

    /// Find the page that starts at `pa`.
    fn pa_to_page(&self, pa: Pa) -> Option<Page>;

    /// Kernel virtual address through which physical address `pa` is accessed.
    fn pa_to_va(&self, pa: Pa) -> Option<Va>;

    /// Physical address behind the kernel virtual address `va`.
    fn va_to_pa(&self, va: Va) -> Option<Pa>;

    /// Copy `src` into `page` starting at byte `ofs`.
    ///
    /// The caller must be the only one accessing the page, e.g. the page is not yet visible to a guest.
    fn write_page(&self, page: Page, ofs: usize, src: &[u8]) -> Result<(), Error> {
        let va = page_range(self, page, ofs, src.len())?;
        unsafe {
            core::ptr::copy_nonoverlapping(src.as_ptr(), va.as_ptr::<u8>(), src.len());
        }
        Ok(())
    }

    /// Copy bytes of `page` starting at byte `ofs` into `dst`.
    fn read_page(&self, page: Page, ofs: usize, dst: &mut [u8]) -> Result<(), Error> {
        let va = page_range(self, page, ofs, dst.len())?;
        unsafe {
            core::ptr::copy_nonoverlapping(va.as_ptr::<u8>(), dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }
}

/// Kernel address of the `len` bytes of `page` starting at `ofs`.
fn page_range<A: FrameAllocator + ?Sized>(
    alloc: &A,
    page: Page,
    ofs: usize,
    len: usize,
) -> Result<Va, Error> {
    if ofs.checked_add(len).map_or(true, |end| end > PAGE_SIZE) {
        return Err(Error::OutOfBounds);
    }
    alloc
        .pa_to_va(page.pa())
        .map(|va| va + ofs)
        .ok_or(Error::Unmanaged)
}
