//! Error definitions for the `fzxfs` library.
//!
//! Every failure surfaced by the public API is an [`XfsError`]. Decoders
//! fail fast and without side effects; outer layers wrap the failure with a
//! frame describing the operation in progress (see [`XfsError::wrap`]), so a
//! caller that logs the chain sees something like:
//!
//! ```text
//! while reading inode 128 block-map: corrupt structure: bad bmbt block magic
//! ```

use thiserror::Error;

/// `CanFail` is a return type for operations that are allowed to fail, and
/// don't need to return anything.
pub type CanFail<E> = Result<(), E>;

/// Standard result alias used throughout the library.
pub type FsResult<T> = Result<T, XfsError>;

/// Broad classification of an [`XfsError`], ignoring any context frames
/// wrapped around it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorClass {
    InvalidArgument,
    Io,
    Corrupt,
    Unsupported,
    NotFound,
    Aborted,
    Internal,
}

/// The error type of the library.
///
/// `Corrupt` and `Unsupported` are never downgraded to `NotFound`: a caller
/// asking for a path that crosses damaged metadata is told about the damage.
#[derive(Debug, Error)]
pub enum XfsError {
    /// A caller-supplied value violated a documented precondition.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The byte source failed a read, or returned fewer bytes than asked
    /// for. Truncated reads are never partial successes.
    #[error("i/o failure")]
    Io(#[from] std::io::Error),

    /// On-disk bytes violated the XFS format: bad magic, out-of-range size,
    /// overlapping extents, an unknown critical feature bit, a checksum
    /// mismatch under the fatal CRC policy.
    #[error("corrupt structure: {0}")]
    Corrupt(&'static str),

    /// A known XFS feature this library deliberately does not implement
    /// (realtime subvolume, bigtime timestamps, rmap/uuid forks, ...).
    #[error("unsupported feature: {0}")]
    Unsupported(&'static str),

    /// Path component or inode absent.
    #[error("not found")]
    NotFound,

    /// [`signal_abort`](crate::fs::xfs::XfsVolume::signal_abort) was
    /// observed. Not re-triable: the volume must be reopened.
    #[error("operation aborted")]
    Aborted,

    /// An in-process invariant broke. This is a bug in the library, not in
    /// the image.
    #[error("internal error: {0}")]
    Internal(&'static str),

    /// A failure annotated with the operation that was in progress.
    #[error("{context}")]
    Context {
        context: String,
        #[source]
        source: Box<XfsError>,
    },
}

impl XfsError {
    /// Wraps the error in a context frame.
    #[must_use]
    pub fn wrap(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The classification of the innermost error, unwrapping context frames.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidArgument(_) => ErrorClass::InvalidArgument,
            Self::Io(_) => ErrorClass::Io,
            Self::Corrupt(_) => ErrorClass::Corrupt,
            Self::Unsupported(_) => ErrorClass::Unsupported,
            Self::NotFound => ErrorClass::NotFound,
            Self::Aborted => ErrorClass::Aborted,
            Self::Internal(_) => ErrorClass::Internal,
            Self::Context { source, .. } => source.class(),
        }
    }
}

/// Extension adding [`XfsError::wrap`] directly on results.
pub(crate) trait ResultExt<T> {
    fn context(self, msg: impl FnOnce() -> String) -> FsResult<T>;
}

impl<T> ResultExt<T> for FsResult<T> {
    fn context(self, msg: impl FnOnce() -> String) -> FsResult<T> {
        self.map_err(|err| err.wrap(msg()))
    }
}
