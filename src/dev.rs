//! Byte-source adapters.
//!
//! The decoder never owns its storage: every read goes through a
//! [`ByteSource`], a positional, seek-free abstraction over a raw image.
//! Offsets passed to a source are absolute within that source; the
//! [`FileRange`] wrapper re-bases a source so that a filesystem embedded in
//! a larger container (a partitioned disk image, say) is seen starting at
//! offset 0.
//!
//! Sources are infallible about partiality: a read either fills the whole
//! destination buffer or fails with an I/O error.

use std::fs::File;

use crate::errors::{CanFail, FsResult, XfsError};

/// A read-only, random-access stream of bytes.
pub trait ByteSource: Send + Sync {
    /// Fills `buf` with the bytes at `offset`.
    ///
    /// # Errors
    ///
    /// Fails with [`XfsError::Io`] if the underlying storage errors or holds
    /// fewer than `buf.len()` bytes past `offset`.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> CanFail<XfsError>;

    /// Total size of the source in bytes.
    fn size(&self) -> u64;

    /// Convenience wrapper allocating the destination buffer.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`ByteSource::read_at`].
    fn read(&self, offset: u64, length: usize) -> FsResult<Vec<u8>> {
        let mut buf = vec![0u8; length];
        self.read_at(offset, &mut buf)?;
        Ok(buf)
    }
}

#[cfg(unix)]
impl ByteSource for File {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> CanFail<XfsError> {
        use std::os::unix::fs::FileExt;

        FileExt::read_exact_at(self, buf, offset)?;
        Ok(())
    }

    fn size(&self) -> u64 {
        self.metadata().map_or(0, |meta| meta.len())
    }
}

impl ByteSource for Vec<u8> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> CanFail<XfsError> {
        let start = usize::try_from(offset)
            .map_err(|_| XfsError::InvalidArgument("offset exceeds addressable range"))?;
        let end = start
            .checked_add(buf.len())
            .filter(|&end| end <= self.len())
            .ok_or_else(|| {
                XfsError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "read past end of in-memory source",
                ))
            })?;

        buf.copy_from_slice(&self[start..end]);
        Ok(())
    }

    fn size(&self) -> u64 {
        self.len() as u64
    }
}

/// A view over a sub-range of another [`ByteSource`].
///
/// Adds a fixed `origin` to every offset, and optionally caps the visible
/// length, so the wrapped filesystem observes offset 0 at an arbitrary point
/// of the container.
pub struct FileRange<S> {
    inner: S,
    origin: u64,
    length: Option<u64>,
}

impl<S: ByteSource> FileRange<S> {
    /// Wraps `inner`, exposing the bytes starting at `origin`.
    pub fn new(inner: S, origin: u64) -> Self {
        Self {
            inner,
            origin,
            length: None,
        }
    }

    /// Wraps `inner`, exposing exactly `length` bytes starting at `origin`.
    pub fn with_length(inner: S, origin: u64, length: u64) -> Self {
        Self {
            inner,
            origin,
            length: Some(length),
        }
    }
}

impl<S: ByteSource> ByteSource for FileRange<S> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> CanFail<XfsError> {
        if let Some(length) = self.length {
            let end = offset.checked_add(buf.len() as u64);
            if end.is_none() || end.unwrap_or(u64::MAX) > length {
                return Err(XfsError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "read past end of file range",
                )));
            }
        }
        let base = self
            .origin
            .checked_add(offset)
            .ok_or(XfsError::InvalidArgument("offset exceeds addressable range"))?;

        self.inner.read_at(base, buf)
    }

    fn size(&self) -> u64 {
        let available = self.inner.size().saturating_sub(self.origin);
        self.length.map_or(available, |len| len.min(available))
    }
}
