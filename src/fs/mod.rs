//! File-system related code.
//!
//! Hosts the XFS decoder itself ([`xfs`]) together with the handful of
//! filesystem-independent types of the public object model: the cursor
//! movement description ([`Seek`]) and the classification of file objects
//! ([`FileKind`]).

pub mod xfs;

/// `Seek` provides a way to move the internal cursor of a file entry, or to
/// retrieve the current position using `Seek::Current`.
#[derive(Clone, Copy, Debug)]
pub enum Seek {
    /// Moves the cursor backwards by the provided number of bytes,
    /// saturating at the beginning of the stream.
    Backward(u64),

    /// Does not move the cursor, used to retrieve the current position.
    Current,

    /// Moves the cursor forward by the provided number of bytes, saturating
    /// at the end of the stream.
    Forward(u64),

    /// Places the cursor at an absolute byte offset.
    Absolute(u64),
}

/// Kind of a filesystem object, derived from the type nibble of its inode's
/// file mode.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum FileKind {
    Fifo,
    CharacterDevice,
    Directory,
    BlockDevice,
    Regular,
    SymbolicLink,
    Socket,
}

impl core::fmt::Display for FileKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let kind = match self {
            Self::Fifo => "fifo",
            Self::CharacterDevice => "character device",
            Self::Directory => "directory",
            Self::BlockDevice => "block device",
            Self::Regular => "regular file",
            Self::SymbolicLink => "symbolic link",
            Self::Socket => "socket",
        };

        f.write_str(kind)
    }
}
