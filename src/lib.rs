//! `fzxfs` — read-only decoder for the XFS on-disk filesystem.
//!
//! Given a raw image (optionally a slice of a larger container, see
//! [`dev::FileRange`]), the library decodes the superblock, walks the
//! allocation-group metadata, and exposes the filesystem as a navigable
//! object model: [`fs::xfs::XfsVolume`] at the top, [`fs::xfs::FileEntry`]
//! handles below it, with byte streams, directory enumeration and extended
//! attributes hanging off each entry.
//!
//! The library never writes: there is no journal replay, no repair, and no
//! mutation of the backing image. Both XFS format versions 4 and 5 are
//! understood, including CRC-protected (v5) metadata.
//!
//! ```no_run
//! use fzxfs::fs::xfs::{VolumeOptions, XfsVolume};
//!
//! let image = std::fs::File::open("/tmp/disk.img")?;
//! let volume = XfsVolume::open(Box::new(image), VolumeOptions::default())?;
//!
//! for entry in volume.root()?.children()? {
//!     let entry = entry?;
//!     println!("{}", String::from(entry.name.clone()));
//! }
//! # Ok::<(), fzxfs::XfsError>(())
//! ```

pub mod dev;
pub mod errors;
pub mod fs;

pub use crate::dev::{ByteSource, FileRange};
pub use crate::errors::{CanFail, FsResult, XfsError};
