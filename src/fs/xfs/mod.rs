//! Read-only XFS filesystem decoder.
//!
//! [`XfsVolume`] is the entry point: it owns the byte source, the decoded
//! superblock geometry and a bounded inode cache, and hands out
//! [`FileEntry`] handles. Entries keep the volume internals alive through
//! reference counting, so dropping the volume handle never invalidates an
//! entry mid-read; [`XfsVolume::signal_abort`] is the mechanism to stop
//! outstanding readers.
//!
//! Per the concurrency contract a volume serializes internally: the inode
//! cache takes a single lock across lookup and decode, so one inode is
//! never decoded twice concurrently.

use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use spin::Mutex;
use uuid::Uuid;

use crate::dev::ByteSource;
use crate::errors::{CanFail, FsResult, ResultExt, XfsError};
use crate::fs::FileKind;

pub mod attr;
pub mod dir;
pub mod extent;
pub mod file;
pub mod inode;
pub mod sb;

pub use attr::{AttrEntry, AttrNamespace};
pub use dir::{DirEntry, DirFileType, DirIter, Filename, XfsDirectory};
pub use extent::Extent;
pub use file::FileEntry;
pub use inode::{ExtendedInodeFlags, FileMode, ForkFormat, InodeFlags, InodeNumber};
pub use sb::FormatVersion;

use inode::Inode;
use sb::{Superblock, SB_SIZE, XFS_SB_MAGIC};

/// Bound on the number of decoded inodes kept in memory.
const INODE_CACHE_CAPACITY: usize = 1024;

/// What to do when a v5 metadata checksum does not match.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum CrcPolicy {
    /// Treat the mismatch as corruption and fail the operation.
    #[default]
    Fatal,

    /// Log the mismatch and keep decoding.
    Warn,
}

/// Options applied when opening a volume.
#[derive(Clone, Copy, Debug)]
pub struct VolumeOptions {
    /// Checksum verification policy for v5 metadata.
    pub crc_policy: CrcPolicy,

    /// Emit `.` and `..` from directory enumeration.
    pub dot_entries: bool,

    /// Follow symbolic links during path lookups.
    pub follow_symlinks: bool,

    /// Bound on chained symbolic links during one path lookup; a longer
    /// chain resolves as not found.
    pub symlink_depth: u8,
}

impl Default for VolumeOptions {
    fn default() -> Self {
        Self {
            crc_policy: CrcPolicy::Fatal,
            dot_entries: false,
            follow_symlinks: false,
            symlink_depth: 40,
        }
    }
}

/// Bounded inode cache with least-recently-used eviction. Entries are
/// immutable once inserted.
struct InodeCache {
    entries: HashMap<u64, CacheSlot>,
    stamp: u64,
}

struct CacheSlot {
    inode: Arc<Inode>,
    last_used: u64,
}

impl InodeCache {
    fn new() -> Self {
        Self {
            entries: HashMap::with_capacity(INODE_CACHE_CAPACITY),
            stamp: 0,
        }
    }

    fn get(&mut self, number: InodeNumber) -> Option<Arc<Inode>> {
        self.stamp += 1;
        let stamp = self.stamp;
        let slot = self.entries.get_mut(&u64::from(number))?;
        slot.last_used = stamp;

        Some(Arc::clone(&slot.inode))
    }

    fn insert(&mut self, inode: Arc<Inode>) {
        if self.entries.len() >= INODE_CACHE_CAPACITY {
            if let Some((&evict, _)) = self
                .entries
                .iter()
                .min_by_key(|(_, slot)| slot.last_used)
            {
                self.entries.remove(&evict);
            }
        }

        self.stamp += 1;
        self.entries.insert(
            u64::from(inode.number),
            CacheSlot {
                inode,
                last_used: self.stamp,
            },
        );
    }
}

/// Shared state of one mounted volume: byte source, geometry, inode cache
/// and the abort flag.
pub(crate) struct XfsFs {
    source: Box<dyn ByteSource>,
    sb: Superblock,
    options: VolumeOptions,
    aborted: AtomicBool,
    inode_cache: Mutex<InodeCache>,
}

impl XfsFs {
    pub(crate) fn superblock(&self) -> &Superblock {
        &self.sb
    }

    pub(crate) fn options(&self) -> &VolumeOptions {
        &self.options
    }

    /// Fails with [`XfsError::Aborted`] once the abort flag is raised.
    /// Polled before every block read, at every directory-enumeration step
    /// and at every btree descent.
    pub(crate) fn check_abort(&self) -> CanFail<XfsError> {
        if self.aborted.load(Ordering::Relaxed) {
            return Err(XfsError::Aborted);
        }

        Ok(())
    }

    /// Reads raw bytes at an absolute offset within the filesystem.
    pub(crate) fn read_bytes(&self, offset: u64, length: usize) -> FsResult<Vec<u8>> {
        self.check_abort()?;

        self.source.read(offset, length)
    }

    /// Reads one filesystem block by its packed block number.
    ///
    /// # Errors
    ///
    /// [`XfsError::Corrupt`] when the block number falls outside the
    /// allocation-group geometry.
    pub(crate) fn read_fsblock(&self, fsblock: u64) -> FsResult<Vec<u8>> {
        let offset = self
            .sb
            .fsblock_to_byte(fsblock)
            .ok_or(XfsError::Corrupt("block number outside geometry"))?;
        let block_size = usize::try_from(self.sb.block_size)
            .map_err(|_| XfsError::Internal("block size exceeds addressable range"))?;

        self.read_bytes(offset, block_size)
    }

    /// Verifies the CRC32C a v5 metadata block stores about itself.
    ///
    /// No-op on v4 volumes. Under [`CrcPolicy::Warn`] a mismatch is logged
    /// and decoding continues.
    pub(crate) fn check_block_crc(
        &self,
        block: &[u8],
        crc_offset: usize,
        what: &'static str,
    ) -> CanFail<XfsError> {
        if !self.sb.has_crc() {
            return Ok(());
        }
        if crc_offset + 4 > block.len() {
            return Err(XfsError::Corrupt("checksum field outside block"));
        }

        let stored = u32::from_be_bytes(
            block[crc_offset..crc_offset + 4]
                .try_into()
                .unwrap_or_default(),
        );
        if sb::crc_with_hole(block, crc_offset) != stored {
            match self.options.crc_policy {
                CrcPolicy::Fatal => {
                    log::error!(target: "xfs", "checksum mismatch in {what}");
                    return Err(XfsError::Corrupt("metadata block checksum mismatch"));
                }
                CrcPolicy::Warn => {
                    log::warn!(target: "xfs", "checksum mismatch in {what} ignored");
                }
            }
        }

        Ok(())
    }

    /// Fetches an inode through the cache, decoding it on first use.
    ///
    /// The cache lock is held across the decode: concurrent lookups of the
    /// same inode number decode it exactly once, with the loser observing
    /// the winner's record.
    pub(crate) fn inode(&self, number: InodeNumber) -> FsResult<Arc<Inode>> {
        self.check_abort()?;

        let mut cache = self.inode_cache.lock();
        if let Some(inode) = cache.get(number) {
            return Ok(inode);
        }

        let offset = self.sb.inode_position(number).ok_or(XfsError::NotFound)?;
        let data = self
            .read_bytes(offset, usize::from(self.sb.inode_size))
            .context(|| format!("while reading inode {number}"))?;
        let inode = Arc::new(
            Inode::decode(number, &data, &self.sb, self.options.crc_policy)
                .context(|| format!("while decoding inode {number}"))?,
        );

        cache.insert(Arc::clone(&inode));
        Ok(inode)
    }
}

/// A mounted read-only XFS volume.
pub struct XfsVolume {
    fs: Arc<XfsFs>,
}

impl XfsVolume {
    /// Opens the filesystem found at offset 0 of `source`.
    ///
    /// Filesystems embedded deeper in a container are opened through
    /// [`crate::dev::FileRange`].
    ///
    /// # Errors
    ///
    /// Superblock validation failures ([`XfsError::Corrupt`],
    /// [`XfsError::Unsupported`]) and byte-source failures
    /// ([`XfsError::Io`]).
    pub fn open(source: Box<dyn ByteSource>, options: VolumeOptions) -> FsResult<Self> {
        let sector = source
            .read(0, SB_SIZE)
            .context(|| "while reading the primary superblock".to_string())?;
        let sb = Superblock::decode(&sector, options.crc_policy)?;

        log::info!(
            target: "xfs",
            "opened xfs v{} filesystem    label = {:?}    block_size = {}    ags = {} x {} blocks    inodes = {}",
            match sb.version {
                FormatVersion::V4 => 4,
                FormatVersion::V5 => 5,
            },
            sb.label(),
            sb.block_size,
            sb.ag_count,
            sb.ag_blocks,
            sb.inode_count,
        );

        Ok(Self {
            fs: Arc::new(XfsFs {
                source,
                sb,
                options,
                aborted: AtomicBool::new(false),
                inode_cache: Mutex::new(InodeCache::new()),
            }),
        })
    }

    /// Cheap probe for the superblock magic, without a full open.
    ///
    /// # Errors
    ///
    /// [`XfsError::Io`] when the first sector cannot be read.
    pub fn check_signature(source: &dyn ByteSource) -> FsResult<bool> {
        let mut magic = [0u8; 4];
        source.read_at(0, &mut magic)?;

        Ok(u32::from_be_bytes(magic) == XFS_SB_MAGIC)
    }

    /// Raises the abort flag. In-flight and future operations on this
    /// volume fail with [`XfsError::Aborted`] at their next polling point;
    /// the flag cannot be lowered again.
    pub fn signal_abort(&self) {
        self.fs.aborted.store(true, Ordering::Relaxed);
    }

    /// Drops this handle. File entries already handed out keep the shared
    /// state alive until they are dropped themselves.
    pub fn close(self) {}

    /// Opens the root directory of the volume.
    ///
    /// # Errors
    ///
    /// Decoding failures of the root inode.
    pub fn root(&self) -> FsResult<FileEntry> {
        self.file_entry_by_inode(self.fs.sb.root_inode)
    }

    /// Opens a file entry by its absolute inode number.
    ///
    /// # Errors
    ///
    /// [`XfsError::NotFound`] when a component of the inode number is
    /// outside the volume's geometry; decoding failures otherwise.
    pub fn file_entry_by_inode(&self, number: impl Into<InodeNumber>) -> FsResult<FileEntry> {
        let inode = self.fs.inode(number.into())?;

        FileEntry::new(Arc::clone(&self.fs), inode, None)
    }

    /// Opens a file entry by walking `path` from the root, one directory
    /// lookup per component.
    ///
    /// Symbolic links are not followed unless the volume was opened with
    /// `follow_symlinks`; with it, a chain longer than `symlink_depth`
    /// resolves as not found.
    ///
    /// # Errors
    ///
    /// [`XfsError::NotFound`] for a missing component;
    /// [`XfsError::InvalidArgument`] when an intermediate component is not
    /// a directory.
    pub fn file_entry_by_path(&self, path: &str) -> FsResult<FileEntry> {
        let mut components: Vec<Vec<u8>> = path
            .split('/')
            .filter(|part| !part.is_empty())
            .map(|part| part.as_bytes().to_vec())
            .collect();
        components.reverse();

        let mut links_seen = 0u8;
        let mut current = self.root()?;
        while let Some(component) = components.pop() {
            let next = current.child_by_name(&component)?;

            if next.kind()? == FileKind::SymbolicLink && self.fs.options.follow_symlinks {
                links_seen += 1;
                if links_seen > self.fs.options.symlink_depth {
                    return Err(XfsError::NotFound);
                }

                let target = next.symlink_target()?;
                let absolute = target.0.first() == Some(&b'/');
                for part in target.0.split(|&byte| byte == b'/').rev() {
                    if !part.is_empty() {
                        components.push(part.to_vec());
                    }
                }
                if absolute {
                    current = self.root()?;
                }
                continue;
            }

            current = next;
        }

        Ok(current)
    }

    /// The volume label, with NUL padding removed.
    pub fn label(&self) -> String {
        self.fs.sb.label()
    }

    /// The user-visible filesystem identifier.
    pub fn uuid(&self) -> Uuid {
        self.fs.sb.uuid
    }

    /// Major on-disk format version.
    pub fn format_version(&self) -> FormatVersion {
        self.fs.sb.version
    }

    /// Filesystem block size, in bytes.
    pub fn block_size(&self) -> u32 {
        self.fs.sb.block_size
    }

    /// Number of allocated inodes on the volume.
    pub fn number_of_file_entries(&self) -> u64 {
        self.fs.sb.inode_count
    }
}
