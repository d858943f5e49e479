//! XFS file-entry façade.
//!
//! A [`FileEntry`] pairs a decoded inode with the directory context it was
//! reached through (for name recall) and exposes the public per-object
//! surface: metadata accessors, positional and cursor-based stream reads
//! with hole zero-fill, children enumeration for directories, symbolic-link
//! target retrieval, and the extended-attribute list.
//!
//! Entries hold a strong reference to the volume internals, so an entry
//! outliving [`XfsVolume::close`](crate::fs::xfs::XfsVolume::close) keeps
//! working until it is dropped; `signal_abort` is the mechanism to cut such
//! readers off.

use core::fmt;
use std::sync::Arc;

use crate::errors::{FsResult, ResultExt, XfsError};
use crate::fs::xfs::attr::{AttrEntry, AttrNamespace, AttrReader};
use crate::fs::xfs::dir::{DirEntry, DirIter, Filename, XfsDirectory};
use crate::fs::xfs::extent::{load_data_fork_map, ExtentTree};
use crate::fs::xfs::inode::{
    ExtendedInodeFlags, FileMode, ForkFormat, Inode, InodeFlags, InodeNumber,
};
use crate::fs::xfs::sb::FormatVersion;
use crate::fs::xfs::XfsFs;
use crate::fs::{FileKind, Seek};

/// Symbolic-link remote block magic, version 5: `XSLM`.
const XFS_SYMLINK_MAGIC: u32 = 0x5853_4C4D;

/// Header size of a v5 remote symbolic-link block.
const SYMLINK_HDR_SIZE: usize = 56;

/// Byte offset of the `crc` field within a v5 symbolic-link block.
const SYMLINK_CRC_OFFSET: usize = 12;

/// Longest symbolic-link target the format permits.
const SYMLINK_MAX_TARGET: u64 = 1024;

/// A handle onto one filesystem object.
pub struct FileEntry {
    fs: Arc<XfsFs>,
    inode: Arc<Inode>,
    name: Option<Filename>,
    cursor: u64,

    /// Data-fork block map, resolved eagerly for streamable kinds.
    map: Option<ExtentTree>,
}

impl fmt::Debug for FileEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!(
            "xfs file entry | inode = {}    size = {}    mode = {:#o}    links = {}",
            self.inode.number,
            self.inode.byte_size(),
            self.inode.mode.0,
            self.inode.link_count,
        ))
    }
}

impl FileEntry {
    /// Builds an entry from a decoded inode.
    ///
    /// Regular files and extent-mapped symbolic links get their block map
    /// resolved here, so format damage in the map surfaces at open time
    /// rather than on the first read.
    pub(crate) fn new(
        fs: Arc<XfsFs>,
        inode: Arc<Inode>,
        name: Option<Filename>,
    ) -> FsResult<Self> {
        let streamable = matches!(
            inode.mode.kind(),
            Some(FileKind::Regular | FileKind::SymbolicLink)
        );
        let map = if streamable
            && matches!(
                inode.data_fork_format,
                ForkFormat::Extents | ForkFormat::Btree
            ) {
            Some(load_data_fork_map(&fs, &inode).map_err(|err| {
                err.wrap(format!("while reading inode {} block-map", inode.number))
            })?)
        } else {
            None
        };

        Ok(Self {
            fs,
            inode,
            name,
            cursor: 0,
            map,
        })
    }

    /// Absolute inode number of the entry.
    pub fn inode_number(&self) -> InodeNumber {
        self.inode.number
    }

    /// Name the entry was reached through, when it was reached through a
    /// directory walk.
    pub fn name(&self) -> Option<&Filename> {
        self.name.as_ref()
    }

    /// The kind of object, from the inode's mode.
    ///
    /// # Errors
    ///
    /// [`XfsError::Corrupt`] if the mode's type nibble is invalid.
    pub fn kind(&self) -> FsResult<FileKind> {
        self.inode.kind()
    }

    /// Logical size of the entry's content, in bytes.
    pub fn size(&self) -> u64 {
        self.inode.byte_size()
    }

    /// UNIX mode bits, type nibble included.
    pub fn mode(&self) -> FileMode {
        self.inode.mode
    }

    pub fn owner_identifier(&self) -> u32 {
        self.inode.uid
    }

    pub fn group_identifier(&self) -> u32 {
        self.inode.gid
    }

    /// Project identifier; 0 on filesystems without project quotas.
    pub fn project_identifier(&self) -> u32 {
        self.inode.project_id
    }

    pub fn link_count(&self) -> u32 {
        self.inode.link_count
    }

    pub fn generation(&self) -> u32 {
        self.inode.generation
    }

    /// Last access time, in signed nanoseconds since the epoch.
    pub fn access_time(&self) -> i64 {
        self.inode.access_time_ns
    }

    /// Last content-modification time, in signed nanoseconds since the
    /// epoch.
    pub fn modification_time(&self) -> i64 {
        self.inode.modification_time_ns
    }

    /// Last inode-change time, in signed nanoseconds since the epoch.
    pub fn inode_change_time(&self) -> i64 {
        self.inode.inode_change_time_ns
    }

    /// Creation time, in signed nanoseconds since the epoch; `None` on
    /// inode format versions that predate it.
    pub fn creation_time(&self) -> Option<i64> {
        self.inode.creation_time_ns
    }

    pub fn flags(&self) -> InodeFlags {
        self.inode.flags
    }

    /// Extended inode flags; `None` before inode format version 3.
    pub fn extended_flags(&self) -> Option<ExtendedInodeFlags> {
        self.inode.extended_flags
    }

    /// The 32-bit device identifier of a block or character device entry.
    pub fn device_identifier(&self) -> Option<u32> {
        self.inode.device_id()
    }

    /// Checks whether the entry has neither content nor extents.
    pub fn is_empty(&self) -> bool {
        self.inode.byte_size() == 0 && self.inode.data_extent_count == 0
    }

    /// Reads up to `length` content bytes starting at `offset`.
    ///
    /// Holes and unwritten (preallocated) regions read back as zeros;
    /// reads are clamped at the entry's size, so a read starting past the
    /// end returns an empty buffer.
    ///
    /// # Errors
    ///
    /// [`XfsError::InvalidArgument`] unless the entry is a regular file;
    /// decoding and I/O errors from the underlying volume otherwise.
    pub fn read_at(&self, offset: u64, length: usize) -> FsResult<Vec<u8>> {
        if self.inode.mode.kind() != Some(FileKind::Regular) {
            return Err(XfsError::InvalidArgument(
                "stream reads are only valid on regular files",
            ));
        }
        if self.inode.flags.contains(InodeFlags::REALTIME) {
            return Err(XfsError::Unsupported("realtime subvolume data"));
        }

        self.read_stream(offset, length)
            .context(|| format!("while reading inode {} content", self.inode.number))
    }

    /// Reads from the internal cursor, advancing it by the number of bytes
    /// read. Returns 0 at end of file.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`FileEntry::read_at`].
    pub fn read(&mut self, buf: &mut [u8]) -> FsResult<usize> {
        let data = self.read_at(self.cursor, buf.len())?;
        buf[..data.len()].copy_from_slice(&data);
        self.cursor += data.len() as u64;

        Ok(data.len())
    }

    /// Moves the internal cursor and returns its new position.
    pub fn seek(&mut self, seek: Seek) -> u64 {
        self.cursor = match seek {
            Seek::Backward(count) => self.cursor.saturating_sub(count),
            Seek::Current => self.cursor,
            Seek::Forward(count) => self.cursor.saturating_add(count).min(self.size()),
            Seek::Absolute(position) => position.min(self.size()),
        };

        self.cursor
    }

    /// Opens the entry as a directory for lookups.
    ///
    /// # Errors
    ///
    /// [`XfsError::InvalidArgument`] unless the entry is a directory.
    pub fn directory(&self) -> FsResult<XfsDirectory> {
        XfsDirectory::from_inode(Arc::clone(&self.fs), Arc::clone(&self.inode))
    }

    /// Iterates the entry's children. Valid for directories only.
    ///
    /// # Errors
    ///
    /// [`XfsError::InvalidArgument`] unless the entry is a directory.
    pub fn children(&self) -> FsResult<DirIter> {
        self.directory()?.entries()
    }

    /// Number of children of a directory entry, honoring the `.`/`..`
    /// policy the volume was opened with.
    ///
    /// # Errors
    ///
    /// [`XfsError::InvalidArgument`] unless the entry is a directory.
    pub fn number_of_children(&self) -> FsResult<u64> {
        let mut count = 0u64;
        for child in self.children()? {
            child?;
            count += 1;
        }

        Ok(count)
    }

    /// Opens the `index`-th child, in enumeration order.
    ///
    /// # Errors
    ///
    /// [`XfsError::NotFound`] when the directory has fewer children.
    pub fn child_by_index(&self, index: u64) -> FsResult<FileEntry> {
        for (position, child) in self.children()?.enumerate() {
            let child = child?;
            if position as u64 == index {
                return self.open_child(child);
            }
        }

        Err(XfsError::NotFound)
    }

    /// Looks up one child by name, using the directory's hash index where
    /// the shape has one.
    ///
    /// # Errors
    ///
    /// [`XfsError::NotFound`] when no child carries the name.
    pub fn child_by_name(&self, name: &[u8]) -> FsResult<FileEntry> {
        let entry = self.directory()?.lookup(name)?;

        self.open_child(entry)
    }

    fn open_child(&self, entry: DirEntry) -> FsResult<FileEntry> {
        let inode = self.fs.inode(entry.inode_number)?;

        FileEntry::new(Arc::clone(&self.fs), inode, Some(entry.name))
    }

    /// The target of a symbolic link, as raw bytes.
    ///
    /// Short targets live inline in the inode; longer ones are stored in
    /// extents and, on v5 filesystems, carry per-block headers.
    ///
    /// # Errors
    ///
    /// [`XfsError::InvalidArgument`] unless the entry is a symbolic link.
    pub fn symlink_target(&self) -> FsResult<Filename> {
        if self.inode.mode.kind() != Some(FileKind::SymbolicLink) {
            return Err(XfsError::InvalidArgument(
                "entry is not a symbolic link",
            ));
        }
        let size = self.inode.byte_size();
        if size == 0 || size > SYMLINK_MAX_TARGET {
            return Err(XfsError::Corrupt("symbolic link target size out of range"));
        }
        let size = size as usize;

        match self.inode.data_fork_format {
            ForkFormat::Local => {
                if self.inode.data_fork.len() < size {
                    return Err(XfsError::Corrupt("inline symbolic link truncated"));
                }

                Ok(Filename(self.inode.data_fork[..size].to_vec()))
            }
            ForkFormat::Extents => self.read_remote_symlink(size),
            _ => Err(XfsError::Corrupt("unexpected symbolic link fork format")),
        }
    }

    /// Gathers a symbolic-link target stored in extents.
    fn read_remote_symlink(&self, size: usize) -> FsResult<Filename> {
        let map = self
            .map
            .as_ref()
            .ok_or(XfsError::Corrupt("symbolic link without a block map"))?;
        let v5 = self.fs.superblock().version == FormatVersion::V5;

        let mut target = Vec::with_capacity(size);
        let mut file_block = 0u64;
        while target.len() < size {
            let extent = map
                .lookup(file_block)
                .ok_or(XfsError::Corrupt("hole in symbolic link target"))?;
            let fsblock = extent.fsblock + (file_block - extent.logical);
            let block = self.fs.read_fsblock(fsblock)?;

            let payload = if v5 {
                let magic = u32::from_be_bytes(block[..4].try_into().unwrap_or_default());
                if magic != XFS_SYMLINK_MAGIC {
                    return Err(XfsError::Corrupt("bad symbolic link block magic"));
                }
                self.fs
                    .check_block_crc(&block, SYMLINK_CRC_OFFSET, "symbolic link block")?;
                &block[SYMLINK_HDR_SIZE..]
            } else {
                &block[..]
            };

            let take = payload.len().min(size - target.len());
            target.extend_from_slice(&payload[..take]);
            file_block += 1;
        }

        Ok(Filename(target))
    }

    /// Decodes every extended attribute of the entry.
    pub fn attributes(&self) -> FsResult<Vec<AttrEntry>> {
        AttrReader::from_inode(Arc::clone(&self.fs), Arc::clone(&self.inode))?.entries()
    }

    /// Looks up one extended attribute by namespace and name.
    ///
    /// # Errors
    ///
    /// [`XfsError::NotFound`] when the attribute does not exist.
    pub fn attribute(&self, namespace: AttrNamespace, name: &[u8]) -> FsResult<AttrEntry> {
        AttrReader::from_inode(Arc::clone(&self.fs), Arc::clone(&self.inode))?
            .lookup(namespace, name)
    }

    /// Stream read over the data fork, splitting the request along extent
    /// and hole boundaries.
    fn read_stream(&self, offset: u64, length: usize) -> FsResult<Vec<u8>> {
        let size = self.inode.byte_size();
        if offset >= size {
            return Ok(Vec::new());
        }
        let length = usize::try_from(size - offset)
            .map(|rest| rest.min(length))
            .unwrap_or(length);
        let mut out = vec![0u8; length];

        match self.inode.data_fork_format {
            ForkFormat::Local => {
                // Inline data: bounded by the fork itself.
                let start = offset as usize;
                let end = (start + length).min(self.inode.data_fork.len());
                if start < end {
                    out[..end - start].copy_from_slice(&self.inode.data_fork[start..end]);
                }
            }
            ForkFormat::Extents | ForkFormat::Btree => {
                self.read_mapped(offset, &mut out)?;
            }
            ForkFormat::Dev => {
                return Err(XfsError::Internal("device inode reached the stream reader"))
            }
            ForkFormat::Uuid => return Err(XfsError::Unsupported("uuid-format fork")),
            ForkFormat::Rmap => return Err(XfsError::Unsupported("reverse-mapping fork")),
        }

        Ok(out)
    }

    /// Fills `out` from the extent map, zero-filling holes and unwritten
    /// regions. Reads are coalesced per contiguous physical run.
    fn read_mapped(&self, offset: u64, out: &mut [u8]) -> FsResult<()> {
        let map = self
            .map
            .as_ref()
            .ok_or(XfsError::Internal("mapped read without a block map"))?;
        let block_size = u64::from(self.fs.superblock().block_size);

        let mut position = offset;
        let end = offset + out.len() as u64;
        while position < end {
            let file_block = position / block_size;
            let within = position % block_size;

            let run = match map.lookup(file_block) {
                Some(extent) if !extent.unwritten => {
                    let run_end = extent.end().saturating_mul(block_size).min(end);
                    let run_len = (run_end - position) as usize;
                    let fsblock = extent.fsblock + (file_block - extent.logical);
                    let byte = self
                        .fs
                        .superblock()
                        .fsblock_to_byte(fsblock)
                        .ok_or(XfsError::Corrupt("extent outside filesystem geometry"))?
                        + within;

                    let data = self.fs.read_bytes(byte, run_len)?;
                    let at = (position - offset) as usize;
                    out[at..at + run_len].copy_from_slice(&data);
                    run_len as u64
                }
                Some(extent) => {
                    // Unwritten extent: already zero-filled.
                    extent.end().saturating_mul(block_size).min(end) - position
                }
                None => {
                    let hole_end = map
                        .next_extent_start(file_block)
                        .map_or(end, |next| next.saturating_mul(block_size).min(end));

                    hole_end - position
                }
            };

            position += run;
        }

        Ok(())
    }
}
