//! Guest image loader.
//!
//! The guest starts by running a boot sector at [`GUEST_ENTRY`], which in turn jumps into the guest
//! kernel. Both are copied into guest memory here before the guest runs.
//!
//! Guest memory is filled one page at a time. Each page is assembled in a scratch frame, starting
//! from the page currently mapped at that address if any, and the scratch frame then replaces the
//! mapping. A segment that starts or ends in the middle of a page therefore keeps the bytes of its
//! neighbours on the shared page.
pub mod elf;

use crate::{
    ept::{EptError, EpteFlags},
    vm::{Gpa, Guest, BOOT_SECTOR_SIZE, GUEST_ENTRY},
    VmError,
};
use abyss::x86_64::invept::EptInvalidator;
use alloc::vec;
use elf::{Elf, ElfError, PType, Peeker};
use keos::{
    addressing::{align_down, align_up, PAGE_SIZE},
    fs::{self, ImageFile, ImageStore},
    mm::FrameAllocator,
};

/// Peeker over a file of the image store.
pub struct FilePeeker<'a, F: ImageFile>(pub &'a F);

impl<F: ImageFile> Peeker for FilePeeker<'_, F> {
    type Error = fs::Error;

    fn peek_bytes(&self, pos: usize, slice: &mut [u8]) -> Result<(), Self::Error> {
        self.0.read_exact_at(pos, slice)
    }
}

impl From<ElfError<fs::Error>> for VmError {
    fn from(e: ElfError<fs::Error>) -> Self {
        match e {
            ElfError::Peek(fs::Error::UnexpectedEof) => VmError::BadImage("truncated image"),
            ElfError::Peek(e) => VmError::IoFailure(e),
            ElfError::Malformed(why) => VmError::BadImage(why),
        }
    }
}

/// Load the ELF kernel image at `path` into `guest`.
///
/// Every loadable segment is placed at its physical address. Returns the entry point of the image.
pub fn load_kernel_image<A, I, S>(
    guest: &mut Guest<'_, A, I>,
    store: &S,
    path: &str,
) -> Result<usize, VmError>
where
    A: FrameAllocator,
    I: EptInvalidator,
    S: ImageStore + ?Sized,
{
    let file = store.open(path)?;
    let elf = Elf::from_peeker(FilePeeker(&file))?;
    for phdr in elf.phdrs() {
        let phdr = phdr?;
        if phdr.type_() != Some(PType::Load) {
            continue;
        }
        log::debug!(
            "{}: segment {:#x}..{:#x} from {:#x} ({:#x} bytes in file)",
            path,
            phdr.paddr(),
            phdr.paddr() + phdr.memsz(),
            phdr.offset(),
            phdr.filesz()
        );
        map_in_guest(
            guest,
            &file,
            phdr.paddr(),
            phdr.offset(),
            phdr.filesz(),
            phdr.memsz(),
        )?;
    }
    log::info!("{} loaded, entry {:#x}", path, elf.entry());
    Ok(elf.entry())
}

/// Load the boot sector at `path` into `guest` at [`GUEST_ENTRY`].
pub fn load_boot_sector<A, I, S>(
    guest: &mut Guest<'_, A, I>,
    store: &S,
    path: &str,
) -> Result<(), VmError>
where
    A: FrameAllocator,
    I: EptInvalidator,
    S: ImageStore + ?Sized,
{
    let file = store.open(path)?;
    if file.size() > BOOT_SECTOR_SIZE {
        return Err(VmError::BadImage("boot sector larger than 512 bytes"));
    }
    log::debug!("{}: boot sector at {:#x}", path, GUEST_ENTRY);
    map_in_guest(guest, &file, GUEST_ENTRY, 0, file.size(), BOOT_SECTOR_SIZE)
}

/// Copy `filesz` bytes of `file` at `offset` to guest-physical `gpa`, and zero the rest of the
/// `memsz` bytes starting at `gpa`.
pub fn map_in_guest<A, I, F>(
    guest: &mut Guest<'_, A, I>,
    file: &F,
    gpa: usize,
    offset: usize,
    filesz: usize,
    memsz: usize,
) -> Result<(), VmError>
where
    A: FrameAllocator,
    I: EptInvalidator,
    F: ImageFile + ?Sized,
{
    if filesz > memsz {
        return Err(VmError::BadImage("segment file size exceeds memory size"));
    }
    if offset
        .checked_add(filesz)
        .map_or(true, |end| end > file.size())
    {
        return Err(VmError::BadImage("segment past end of file"));
    }
    let end = gpa.checked_add(memsz).ok_or(VmError::GpaOutOfRange)?;
    if end > guest.info().phys_size {
        return Err(VmError::GpaOutOfRange);
    }

    let ept = guest.ept();
    let root = guest.root()?;
    let alloc = ept.allocator();
    let file_end = gpa + filesz;
    let mut buf = vec![0u8; PAGE_SIZE];

    for page_gpa in (align_down(gpa, PAGE_SIZE)..align_up(end, PAGE_SIZE)).step_by(PAGE_SIZE) {
        let page_end = page_gpa + PAGE_SIZE;
        let page_gpa = Gpa::new(page_gpa).ok_or(VmError::GpaOutOfRange)?;

        match ept
            .gpa_to_hpa(root, page_gpa)?
            .and_then(|pa| alloc.pa_to_page(pa))
        {
            Some(old) => alloc
                .read_page(old, 0, &mut buf)
                .map_err(|_| EptError::InvalidAddress)?,
            None => buf.fill(0),
        }

        // File-backed part of this page.
        let (lo, hi) = (gpa.max(page_gpa.into_usize()), file_end.min(page_end));
        if lo < hi {
            let base = page_gpa.into_usize();
            file.read_exact_at(offset + (lo - gpa), &mut buf[lo - base..hi - base])?;
        }
        // Zero-filled part of this page.
        let (lo, hi) = (file_end.max(page_gpa.into_usize()), end.min(page_end));
        if lo < hi {
            let base = page_gpa.into_usize();
            buf[lo - base..hi - base].fill(0);
        }

        let scratch = alloc.alloc(false).ok_or(EptError::OutOfMemory)?;
        let installed = alloc
            .write_page(scratch, 0, &buf)
            .ok()
            .and_then(|_| alloc.pa_to_va(scratch.pa()))
            .ok_or(EptError::InvalidAddress)
            .and_then(|hva| ept.map_host_to_guest(root, hva, page_gpa, EpteFlags::FULL, true));
        if let Err(e) = installed {
            alloc.free(scratch);
            return Err(e.into());
        }
    }
    Ok(())
}
