//! Guest image store.
//!
//! Guest kernels and boot sectors are kept as flat, fixed-size files. (No directory!)
//! A file is only ever read, at arbitrary offsets.
use alloc::{collections::BTreeMap, string::String, sync::Arc};

/// Possible error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// No file with the requested name.
    #[error("no such file")]
    NotFound,
    /// File ended before the requested range was read.
    #[error("unexpected end of file")]
    UnexpectedEof,
    /// Disk operation has an error.
    #[error("disk error")]
    DiskError,
}

/// An opened file.
pub trait ImageFile {
    /// Get size of this file.
    fn size(&self) -> usize;

    /// Read from file starting from `ofs` to `buf`.
    ///
    /// Returns the number of bytes read, which is less than `buf.len()` only when the end of
    /// the file is reached.
    fn read_at(&self, ofs: usize, buf: &mut [u8]) -> Result<usize, Error>;

    /// Fill `buf` with the bytes of the file starting from `ofs`.
    fn read_exact_at(&self, ofs: usize, buf: &mut [u8]) -> Result<(), Error> {
        if self.read_at(ofs, buf)? == buf.len() {
            Ok(())
        } else {
            Err(Error::UnexpectedEof)
        }
    }
}

/// A store that guest images are opened from.
pub trait ImageStore {
    /// The file type of this store.
    type File: ImageFile;

    /// Open a file with `name`.
    fn open(&self, name: &str) -> Result<Self::File, Error>;
}

impl<S: ImageStore + ?Sized> ImageStore for &S {
    type File = S::File;

    fn open(&self, name: &str) -> Result<Self::File, Error> {
        (**self).open(name)
    }
}

/// A file system whose contents live in memory.
#[derive(Default, Clone)]
pub struct RamFs {
    files: BTreeMap<String, Arc<[u8]>>,
}

impl RamFs {
    /// Create an empty file system.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a file that contains `contents`, replacing any file of the same name.
    pub fn insert(&mut self, name: &str, contents: &[u8]) {
        self.files.insert(String::from(name), Arc::from(contents));
    }

    /// Remove the file named `name`.
    pub fn remove(&mut self, name: &str) -> Result<(), Error> {
        self.files.remove(name).map(|_| ()).ok_or(Error::NotFound)
    }
}

impl ImageStore for RamFs {
    type File = RamFile;

    fn open(&self, name: &str) -> Result<RamFile, Error> {
        self.files
            .get(name)
            .map(|contents| RamFile {
                contents: contents.clone(),
            })
            .ok_or(Error::NotFound)
    }
}

/// A file of [`RamFs`].
#[derive(Clone)]
pub struct RamFile {
    contents: Arc<[u8]>,
}

impl ImageFile for RamFile {
    #[inline]
    fn size(&self) -> usize {
        self.contents.len()
    }

    fn read_at(&self, ofs: usize, buf: &mut [u8]) -> Result<usize, Error> {
        let len = buf.len().min(self.contents.len().saturating_sub(ofs));
        if len != 0 {
            buf[..len].copy_from_slice(&self.contents[ofs..ofs + len]);
        }
        Ok(len)
    }
}
