use super::{le, Bit, Elf, ElfError, Peeker};
use num_enum::TryFromPrimitive;

/// Program header iterator created by [`Elf::phdrs`] method.
pub struct PhdrIterator<'a, T>
where
    T: Peeker,
{
    pub(super) base: usize,
    pub(super) stride: usize,
    pub(super) size: usize,
    pub(super) cursor: usize,
    pub(super) elf: &'a Elf<T>,
}

/// Segment type.
#[repr(u32)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, TryFromPrimitive)]
pub enum PType {
    /// Unused entry.
    Null = 0x0,
    /// Loadable segment.
    Load = 0x1,
    /// Dynamic linking information.
    Dynamic = 0x2,
    /// Interpreter path.
    Interp = 0x3,
    /// Auxiliary information.
    Note = 0x4,
    /// Reserved.
    Shlib = 0x5,
    /// The program header table itself.
    Phdr = 0x6,
    /// Thread-local storage template.
    Tls = 0x7,
    /// Exception handling frame.
    GnuEhFrame = 0x6474e550,
    /// Stack executability.
    GnuStack = 0x6474e551,
    /// Read-only after relocation.
    GnuRelro = 0x6474e552,
}

/// Program Header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Phdr {
    p_type: u32,
    p_flags: u32,
    p_offset: usize,
    p_vaddr: usize,
    p_paddr: usize,
    p_filesz: usize,
    p_memsz: usize,
    p_align: usize,
}

impl Phdr {
    fn parse(bit: Bit, raw: &[u8]) -> Result<Self, &'static str> {
        let field = |v: u64| usize::try_from(v).map_err(|_| "program header field out of range");
        match bit {
            Bit::Bit32 => {
                let word = |ofs| u32::from_le_bytes(le(raw, ofs)) as usize;
                Ok(Self {
                    p_type: u32::from_le_bytes(le(raw, 0)),
                    p_offset: word(4),
                    p_vaddr: word(8),
                    p_paddr: word(12),
                    p_filesz: word(16),
                    p_memsz: word(20),
                    p_flags: u32::from_le_bytes(le(raw, 24)),
                    p_align: word(28),
                })
            }
            Bit::Bit64 => {
                let xword = |ofs| field(u64::from_le_bytes(le(raw, ofs)));
                Ok(Self {
                    p_type: u32::from_le_bytes(le(raw, 0)),
                    p_flags: u32::from_le_bytes(le(raw, 4)),
                    p_offset: xword(8)?,
                    p_vaddr: xword(16)?,
                    p_paddr: xword(24)?,
                    p_filesz: xword(32)?,
                    p_memsz: xword(40)?,
                    p_align: xword(48)?,
                })
            }
        }
    }

    /// Segment type, or `None` for types this reader does not know.
    #[inline]
    pub fn type_(&self) -> Option<PType> {
        PType::try_from(self.p_type).ok()
    }

    /// Segment permission flags.
    #[inline]
    pub fn flags(&self) -> u32 {
        self.p_flags
    }

    /// Offset of the segment in the file.
    #[inline]
    pub fn offset(&self) -> usize {
        self.p_offset
    }

    /// Virtual address of the segment.
    #[inline]
    pub fn vaddr(&self) -> usize {
        self.p_vaddr
    }

    /// Physical address of the segment.
    #[inline]
    pub fn paddr(&self) -> usize {
        self.p_paddr
    }

    /// Bytes of the segment stored in the file.
    #[inline]
    pub fn filesz(&self) -> usize {
        self.p_filesz
    }

    /// Bytes of the segment in memory.
    #[inline]
    pub fn memsz(&self) -> usize {
        self.p_memsz
    }

    /// Alignment of the segment.
    #[inline]
    pub fn align(&self) -> usize {
        self.p_align
    }
}

impl<'a, T> core::iter::Iterator for PhdrIterator<'a, T>
where
    T: Peeker,
{
    type Item = Result<Phdr, ElfError<T::Error>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.size {
            return None;
        }
        let bit = self.elf.bit();
        let mut raw = [0; 0x38];
        let raw = &mut raw[..bit.phdr_size()];
        let pos = self
            .cursor
            .checked_mul(self.stride)
            .and_then(|ofs| ofs.checked_add(self.base));
        self.cursor += 1;
        let Some(pos) = pos else {
            return Some(Err(ElfError::Malformed("program header offset overflows")));
        };
        Some(
            self.elf
                .peeker()
                .peek_bytes(pos, raw)
                .map_err(ElfError::Peek)
                .and_then(|_| Phdr::parse(bit, raw).map_err(ElfError::Malformed)),
        )
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.size - self.cursor;
        (left, Some(left))
    }
}
