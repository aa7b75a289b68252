//! Guest control structure.
//!
//! A [`Guest`] owns the root of its extended page table and the description of its memory. It is
//! built by [`spawn_guest`], which backs the guest's RAM, loads the guest kernel and the boot sector
//! that starts it, and tears everything down again if any step fails.
use crate::{
    ept::{EptError, EptManager, EpteFlags, Eptp},
    loader, VmError,
};
use abyss::x86_64::invept::EptInvalidator;
use keos::{
    addressing::{Pa, Va, PAGE_MASK},
    fs::ImageStore,
    mm::FrameAllocator,
};

/// Guest address at which the boot sector is loaded and run.
pub const GUEST_ENTRY: usize = 0x7000;
/// End of the low conventional memory.
pub const LOW_MEM_END: usize = 0xA0000;
/// Start of the extended memory, after the legacy device and BIOS hole.
pub const EXT_MEM_START: usize = 0x100000;
/// Size of a boot sector.
pub const BOOT_SECTOR_SIZE: usize = 512;
/// Default path of the guest kernel image.
pub const GUEST_KERNEL: &str = "/vmm/kernel";
/// Default path of the guest boot sector.
pub const GUEST_BOOT: &str = "/vmm/boot";

/// Guest physical address
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Gpa(usize);

impl Gpa {
    /// Create a new guest physical address with a check.
    ///
    /// A 4-level EPT translates 48 bits of guest-physical address.
    #[inline]
    pub const fn new(addr: usize) -> Option<Self> {
        if addr < (1 << 48) {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// Cast into usize.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Returns true if this address is at the start of a page.
    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & PAGE_MASK == 0
    }

    /// Offset of this address within its page.
    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 & PAGE_MASK
    }
}

impl core::ops::Add<usize> for Gpa {
    type Output = Self;

    fn add(self, other: usize) -> Self::Output {
        Self(self.0 + other)
    }
}

impl core::ops::AddAssign<usize> for Gpa {
    fn add_assign(&mut self, other: usize) {
        self.0 += other
    }
}

impl core::ops::Sub<usize> for Gpa {
    type Output = Self;

    fn sub(self, other: usize) -> Self::Output {
        Self(self.0 - other)
    }
}

impl core::fmt::Debug for Gpa {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Gpa(0x{:x})", self.0)
    }
}
impl core::fmt::Display for Gpa {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Gpa(0x{:x})", self.0)
    }
}

/// Memory layout of a guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestInfo {
    /// Size of the guest's physical memory in bytes.
    pub phys_size: usize,
    /// Guest address the first instruction is fetched from.
    pub entry: usize,
}

/// How to build a guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestConfig<'a> {
    /// Size of the guest's physical memory. Page aligned and beyond [`EXT_MEM_START`].
    pub phys_size: usize,
    /// Path of the guest kernel image.
    pub kernel: &'a str,
    /// Path of the boot sector.
    pub boot: &'a str,
}

impl GuestConfig<'static> {
    /// Guest of `phys_size` bytes booted from the default images.
    pub const fn new(phys_size: usize) -> Self {
        Self {
            phys_size,
            kernel: GUEST_KERNEL,
            boot: GUEST_BOOT,
        }
    }
}

/// A guest under construction or ready to run.
///
/// Dropping a guest tears down its memory; [`Guest::destroy`] does the same and reports failures.
pub struct Guest<'a, A: FrameAllocator, I: EptInvalidator> {
    ept: &'a EptManager<A, I>,
    root: Option<Pa>,
    info: GuestInfo,
    kernel_entry: Option<usize>,
}

impl<'a, A: FrameAllocator, I: EptInvalidator> Guest<'a, A, I> {
    /// Create a guest of `phys_size` bytes with an empty EPT.
    pub fn new(ept: &'a EptManager<A, I>, phys_size: usize) -> Result<Self, VmError> {
        if phys_size & PAGE_MASK != 0 || phys_size <= EXT_MEM_START || Gpa::new(phys_size).is_none()
        {
            return Err(VmError::GpaOutOfRange);
        }
        let alloc = ept.allocator();
        let root = alloc.alloc(true).ok_or(EptError::OutOfMemory)?;
        alloc.increment_ref(root);
        log::info!("guest {:?} created with {:#x} bytes", root.pa(), phys_size);
        Ok(Self {
            ept,
            root: Some(root.pa()),
            info: GuestInfo {
                phys_size,
                entry: GUEST_ENTRY,
            },
            kernel_entry: None,
        })
    }

    /// Root of this guest's EPT.
    #[inline]
    pub fn root(&self) -> Result<Pa, EptError> {
        self.root.ok_or(EptError::InvalidRoot)
    }

    /// EPTP to run this guest with.
    #[inline]
    pub fn eptp(&self) -> Result<Eptp, EptError> {
        self.root().map(Eptp::new)
    }

    /// Memory layout of this guest.
    #[inline]
    pub fn info(&self) -> &GuestInfo {
        &self.info
    }

    /// Entry point of the loaded guest kernel.
    #[inline]
    pub fn kernel_entry(&self) -> Option<usize> {
        self.kernel_entry
    }

    /// The EPT manager this guest was built with.
    #[inline]
    pub fn ept(&self) -> &'a EptManager<A, I> {
        self.ept
    }

    /// Back this guest's RAM with fresh pages.
    pub fn bootstrap(&mut self) -> Result<(), VmError> {
        Ok(self.ept.bootstrap_identity_map(self.root()?, &self.info)?)
    }

    /// Map the host page at `hva` into this guest at `gpa`.
    ///
    /// Both addresses must be page aligned, `gpa` must lie in the guest's memory, and `perm` must
    /// grant read or execute access. An existing mapping is never replaced.
    pub fn ept_map(&self, hva: Va, gpa: Gpa, perm: EpteFlags) -> Result<(), VmError> {
        if !hva.is_page_aligned() || !gpa.is_page_aligned() {
            return Err(EptError::Unaligned.into());
        }
        if gpa.into_usize() >= self.info.phys_size {
            return Err(VmError::GpaOutOfRange);
        }
        perm.check_leaf()?;
        self.ept
            .map_host_to_guest(self.root()?, hva, gpa, perm, false)
            .map_err(|e| {
                log::warn!("ept_map {:?} -> {:?} refused: {}", hva, gpa, e);
                e.into()
            })
    }

    /// Host address `gpa` translates to in this guest.
    pub fn translate(&self, gpa: Gpa) -> Result<Option<Va>, VmError> {
        Ok(self.ept.translate(self.root()?, gpa)?)
    }

    /// Tear down this guest's memory and release its EPT root.
    pub fn destroy(mut self) -> Result<(), VmError> {
        self.teardown()
    }

    fn teardown(&mut self) -> Result<(), VmError> {
        let Some(root) = self.root.take() else {
            return Ok(());
        };
        let released = self.ept.free_guest_memory(root)?;
        let alloc = self.ept.allocator();
        let page = alloc.pa_to_page(root).ok_or(EptError::InvalidRoot)?;
        alloc.decrement_ref(page);
        log::info!("guest {:?} destroyed, {} frames released", root, released);
        Ok(())
    }
}

impl<A: FrameAllocator, I: EptInvalidator> Drop for Guest<'_, A, I> {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            log::warn!("failed to tear down guest: {}", e);
        }
    }
}

impl<A: FrameAllocator, I: EptInvalidator> core::fmt::Debug for Guest<'_, A, I> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Guest")
            .field("root", &self.root)
            .field("info", &self.info)
            .field("kernel_entry", &self.kernel_entry)
            .finish()
    }
}

/// Build a guest as described by `config` from images of `store`.
///
/// On failure the partially built guest is destroyed before the error is returned.
pub fn spawn_guest<'a, A, I, S>(
    ept: &'a EptManager<A, I>,
    store: &S,
    config: &GuestConfig<'_>,
) -> Result<Guest<'a, A, I>, VmError>
where
    A: FrameAllocator,
    I: EptInvalidator,
    S: ImageStore,
{
    let mut guest = Guest::new(ept, config.phys_size)?;
    let build = |guest: &mut Guest<'a, A, I>| -> Result<(), VmError> {
        guest.bootstrap()?;
        guest.kernel_entry = Some(loader::load_kernel_image(guest, store, config.kernel)?);
        loader::load_boot_sector(guest, store, config.boot)?;
        guest.info.entry = GUEST_ENTRY;
        Ok(())
    };
    match build(&mut guest) {
        Ok(()) => {
            log::info!(
                "guest {:?} ready, kernel entry {:x?}",
                guest.root,
                guest.kernel_entry
            );
            Ok(guest)
        }
        Err(e) => {
            log::warn!("guest construction failed: {}", e);
            if let Err(teardown) = guest.destroy() {
                log::warn!("failed to tear down guest: {}", teardown);
            }
            Err(e)
        }
    }
}
