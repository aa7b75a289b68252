use super::le;
use num_enum::TryFromPrimitive;

/// Size of `e_ident`.
pub(super) const IDENT_SIZE: usize = 16;
/// Size of the largest file header.
pub(super) const MAX_SIZE: usize = 64;

/// Object file type.
#[derive(PartialEq, Eq, Debug, Copy, Clone, TryFromPrimitive)]
#[repr(u16)]
pub enum EType {
    /// No file type.
    None = 0,
    /// Relocatable file.
    Rel = 1,
    /// Executable file.
    Exec = 2,
    /// Shared object file.
    Dyn = 3,
    /// Core file.
    Core = 4,
}

/// Signify 32- or 64-bit format.
#[derive(PartialEq, Eq, Debug, Copy, Clone, TryFromPrimitive)]
#[repr(u8)]
pub enum Bit {
    /// ELFCLASS32.
    Bit32 = 1,
    /// ELFCLASS64.
    Bit64 = 2,
}

impl Bit {
    /// Size of the file header of this class.
    #[inline]
    pub(super) const fn header_size(self) -> usize {
        match self {
            Self::Bit32 => 52,
            Self::Bit64 => 64,
        }
    }

    /// Size of a program header of this class.
    #[inline]
    pub(super) const fn phdr_size(self) -> usize {
        match self {
            Self::Bit32 => 0x20,
            Self::Bit64 => 0x38,
        }
    }
}

/// Signify little or big endianness.
#[derive(PartialEq, Eq, Debug, Copy, Clone, TryFromPrimitive)]
#[repr(u8)]
pub enum Endian {
    /// ELFDATA2LSB.
    Little = 1,
    /// ELFDATA2MSB.
    Big = 2,
}

/// The fields of a file header the loader uses, widened to native size.
#[derive(Debug, Clone, Copy)]
pub(super) struct Header {
    pub class: Bit,
    pub e_type: u16,
    pub e_machine: u16,
    pub entry: usize,
    pub phoff: usize,
    pub phentsize: usize,
    pub phnum: usize,
}

impl Header {
    /// Validate `e_ident` and return the class of the image.
    pub fn check_ident(ident: &[u8; IDENT_SIZE]) -> Result<Bit, &'static str> {
        if &ident[..4] != b"\x7FELF" {
            return Err("bad magic");
        }
        let class = Bit::try_from(ident[4]).map_err(|_| "unknown class")?;
        // Support only little endian
        match Endian::try_from(ident[5]) {
            Ok(Endian::Little) => Ok(class),
            Ok(Endian::Big) => Err("big-endian image"),
            Err(_) => Err("unknown data encoding"),
        }
    }

    /// Decode the file header `raw` of an image of `class`.
    pub fn parse(class: Bit, raw: &[u8]) -> Result<Self, &'static str> {
        let e_type = u16::from_le_bytes(le(raw, 16));
        let e_machine = u16::from_le_bytes(le(raw, 18));
        let (entry, phoff, phentsize, phnum) = match class {
            Bit::Bit32 => (
                u32::from_le_bytes(le(raw, 24)) as u64,
                u32::from_le_bytes(le(raw, 28)) as u64,
                u16::from_le_bytes(le(raw, 42)),
                u16::from_le_bytes(le(raw, 44)),
            ),
            Bit::Bit64 => (
                u64::from_le_bytes(le(raw, 24)),
                u64::from_le_bytes(le(raw, 32)),
                u16::from_le_bytes(le(raw, 54)),
                u16::from_le_bytes(le(raw, 56)),
            ),
        };
        let (phentsize, phnum) = (phentsize as usize, phnum as usize);
        if phnum != 0 && phentsize < class.phdr_size() {
            return Err("program header entry too small");
        }
        Ok(Self {
            class,
            e_type,
            e_machine,
            entry: usize::try_from(entry).map_err(|_| "entry out of range")?,
            phoff: usize::try_from(phoff).map_err(|_| "program header offset out of range")?,
            phentsize,
            phnum,
        })
    }
}
