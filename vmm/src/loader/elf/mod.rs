//! Minimal ELF reader.
//!
//! Only what the loader needs: the file header and the program headers of little-endian 32- and
//! 64-bit images. Fields are decoded byte by byte, so the image may live anywhere a [`Peeker`]
//! can read from.
mod header;
mod phdr;

use header::Header;

pub use header::{Bit, EType, Endian};
pub use phdr::{PType, Phdr, PhdrIterator};

/// Byte peekable object.
pub trait Peeker {
    /// Error of a failed peek.
    type Error;
    /// Fill `slice` with the bytes at `pos`.
    fn peek_bytes(&self, pos: usize, slice: &mut [u8]) -> Result<(), Self::Error>;
}

impl Peeker for [u8] {
    type Error = ();

    fn peek_bytes(&self, pos: usize, slice: &mut [u8]) -> Result<(), ()> {
        let src = pos
            .checked_add(slice.len())
            .and_then(|end| self.get(pos..end))
            .ok_or(())?;
        slice.copy_from_slice(src);
        Ok(())
    }
}

impl<P: Peeker + ?Sized> Peeker for &P {
    type Error = P::Error;

    fn peek_bytes(&self, pos: usize, slice: &mut [u8]) -> Result<(), Self::Error> {
        (**self).peek_bytes(pos, slice)
    }
}

/// Why an image could not be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfError<E> {
    /// The underlying peeker failed.
    Peek(E),
    /// The image is not an ELF this reader understands.
    Malformed(&'static str),
}

/// Read `N` little-endian bytes at `ofs` of `raw`.
#[inline]
fn le<const N: usize>(raw: &[u8], ofs: usize) -> [u8; N] {
    let mut b = [0; N];
    b.copy_from_slice(&raw[ofs..ofs + N]);
    b
}

/// Generic ELF representation.
pub struct Elf<T>
where
    T: Peeker,
{
    header: Header,
    peeker: T,
}

impl<T> Elf<T>
where
    T: Peeker,
{
    /// Parse the file header of the image behind `peeker`.
    pub fn from_peeker(peeker: T) -> Result<Elf<T>, ElfError<T::Error>> {
        let mut ident = [0; header::IDENT_SIZE];
        peeker.peek_bytes(0, &mut ident).map_err(ElfError::Peek)?;
        let class = Header::check_ident(&ident).map_err(ElfError::Malformed)?;

        let mut raw = [0; header::MAX_SIZE];
        let raw = &mut raw[..class.header_size()];
        peeker.peek_bytes(0, raw).map_err(ElfError::Peek)?;
        let header = Header::parse(class, raw).map_err(ElfError::Malformed)?;
        Ok(Elf { header, peeker })
    }

    /// The peeker this image is read from.
    #[inline]
    pub fn peeker(&self) -> &T {
        &self.peeker
    }

    /// 32- or 64-bit image.
    #[inline]
    pub fn bit(&self) -> Bit {
        self.header.class
    }

    /// Object file type.
    #[inline]
    pub fn type_(&self) -> Option<EType> {
        EType::try_from(self.header.e_type).ok()
    }

    /// Raw machine identifier.
    #[inline]
    pub fn machine(&self) -> u16 {
        self.header.e_machine
    }

    /// Get entry point of this binary.
    #[inline]
    pub fn entry(&self) -> usize {
        self.header.entry
    }

    /// Number of program headers.
    #[inline]
    pub fn phnum(&self) -> usize {
        self.header.phnum
    }

    /// Get iterator that iterates over program headers in this binary.
    pub fn phdrs(&self) -> PhdrIterator<'_, T> {
        PhdrIterator {
            base: self.header.phoff,
            stride: self.header.phentsize,
            size: self.header.phnum,
            cursor: 0,
            elf: self,
        }
    }
}
