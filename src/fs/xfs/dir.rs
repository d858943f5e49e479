//! XFS directory decoding.
//!
//! Directories come in four on-disk shapes, escalating with size:
//!
//! 1. *Short form*: the entry list lives inline in the inode's data fork.
//! 2. *Block*: a single directory block holding entries plus a hash-sorted
//!    lookup trailer.
//! 3. *Leaf*: entries spread over data blocks, with a separate hash-sorted
//!    leaf block at a well-known logical offset.
//! 4. *Node*: the leaf structure grows into a btree indexed by name hash.
//!
//! Enumeration always walks the data space in logical order, so every shape
//! yields the same entries; the hash structures only accelerate lookups by
//! name. Directory blocks may span several filesystem blocks
//! (`sb_dirblklog`), and the data space, leaf space and free-index space
//! are separated by fixed 32 GiB strides of logical offset.

use core::fmt;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};

use crate::errors::{FsResult, XfsError};
use crate::fs::xfs::extent::{load_data_fork_map, ExtentTree};
use crate::fs::xfs::inode::{ForkFormat, Inode, InodeNumber};
use crate::fs::xfs::sb::FormatVersion;
use crate::fs::xfs::XfsFs;
use crate::fs::FileKind;

/// Single-block directory magic, version 4: `XD2B`.
const XFS_DIR2_BLOCK_MAGIC: u32 = 0x5844_3242;

/// Single-block directory magic, version 5: `XDB3`.
const XFS_DIR3_BLOCK_MAGIC: u32 = 0x5844_4233;

/// Directory data block magic, version 4: `XD2D`.
const XFS_DIR2_DATA_MAGIC: u32 = 0x5844_3244;

/// Directory data block magic, version 5: `XDD3`.
const XFS_DIR3_DATA_MAGIC: u32 = 0x5844_4433;

/// Leaf block magic (single-leaf directories), versions 4 and 5.
const XFS_DIR2_LEAF1_MAGIC: u16 = 0xD2F1;
const XFS_DIR3_LEAF1_MAGIC: u16 = 0x3DF1;

/// Leaf block magic (node directories), versions 4 and 5.
const XFS_DIR2_LEAFN_MAGIC: u16 = 0xD2FF;
const XFS_DIR3_LEAFN_MAGIC: u16 = 0x3DFF;

/// Hash-btree intermediate node magic, versions 4 and 5.
const XFS_DA_NODE_MAGIC: u16 = 0xFEBE;
const XFS_DA3_NODE_MAGIC: u16 = 0x3EBE;

/// Tag marking an unused region inside a data block.
const XFS_DIR2_DATA_FREE_TAG: u16 = 0xFFFF;

/// Logical byte offset separating the data space from the leaf space of a
/// directory fork (32 GiB).
const XFS_DIR2_LEAF_OFFSET: u64 = 1 << 35;

/// Byte offset of the `crc` field within a v5 directory data block.
const DIR3_DATA_CRC_OFFSET: usize = 4;

/// Byte offset of the `crc` field within a v5 da-block header.
const DA3_BLKINFO_CRC_OFFSET: usize = 12;

/// Upper bound on hash-btree depth; anything deeper is treated as a cycle.
const DA_MAX_DEPTH: u16 = 6;

/// Computes the XFS directory name hash.
///
/// Every hash-indexed directory and attribute structure sorts on this
/// 32-bit value; the polynomial folds four name bytes per round with a
/// 28-bit rotation.
pub(crate) fn name_hash(name: &[u8]) -> u32 {
    let mut hash: u32 = 0;
    let mut chunks = name.chunks_exact(4);
    for chunk in &mut chunks {
        hash = (u32::from(chunk[0]) << 21)
            ^ (u32::from(chunk[1]) << 14)
            ^ (u32::from(chunk[2]) << 7)
            ^ u32::from(chunk[3])
            ^ hash.rotate_left(28);
    }

    match *chunks.remainder() {
        [a, b, c] => {
            (u32::from(a) << 14) ^ (u32::from(b) << 7) ^ u32::from(c) ^ hash.rotate_left(21)
        }
        [a, b] => (u32::from(a) << 7) ^ u32::from(b) ^ hash.rotate_left(14),
        [a] => u32::from(a) ^ hash.rotate_left(7),
        _ => hash,
    }
}

/// File name associated to a [`DirEntry`].
///
/// XFS stores names as raw bytes with no mandated encoding; conversion to
/// `String` is lossy only for non-UTF-8 names.
#[derive(Clone, Debug, Default, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Filename(pub Vec<u8>);

impl Filename {
    /// Returns an [`Iterator`] over the characters of the file name.
    pub fn chars(&self) -> impl Iterator<Item = char> + '_ {
        self.0.iter().copied().map(char::from)
    }
}

impl From<Filename> for String {
    fn from(value: Filename) -> Self {
        String::from_utf8_lossy(&value.0).into_owned()
    }
}

impl From<&str> for Filename {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl fmt::Display for Filename {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

/// File type code carried by a directory entry when the `ftype` feature is
/// enabled. Advisory: the authoritative type lives in the target inode's
/// mode.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct DirFileType(pub u8);

impl DirFileType {
    pub const UNKNOWN: Self = Self(0);
    pub const REGULAR: Self = Self(1);
    pub const DIRECTORY: Self = Self(2);
    pub const CHAR_DEVICE: Self = Self(3);
    pub const BLOCK_DEVICE: Self = Self(4);
    pub const FIFO: Self = Self(5);
    pub const SOCKET: Self = Self(6);
    pub const SYMLINK: Self = Self(7);

    /// Maps the code onto a [`FileKind`], when it carries one.
    #[must_use]
    pub fn kind(self) -> Option<FileKind> {
        match self {
            Self::REGULAR => Some(FileKind::Regular),
            Self::DIRECTORY => Some(FileKind::Directory),
            Self::CHAR_DEVICE => Some(FileKind::CharacterDevice),
            Self::BLOCK_DEVICE => Some(FileKind::BlockDevice),
            Self::FIFO => Some(FileKind::Fifo),
            Self::SOCKET => Some(FileKind::Socket),
            Self::SYMLINK => Some(FileKind::SymbolicLink),
            _ => None,
        }
    }
}

/// A decoded directory entry, independent of the on-disk shape it came
/// from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DirEntry {
    /// Name associated to this entry.
    pub name: Filename,

    /// Absolute inode number of the target.
    pub inode_number: InodeNumber,

    /// File type hint; `None` on filesystems without the `ftype` feature.
    pub file_type: Option<DirFileType>,
}

impl DirEntry {
    fn is_dot_entry(&self) -> bool {
        self.name.0 == b"." || self.name.0 == b".."
    }
}

/// Representation of a directory in the XFS filesystem.
#[derive(Clone)]
pub struct XfsDirectory {
    fs: Arc<XfsFs>,
    inode: Arc<Inode>,
    map: Option<Arc<ExtentTree>>,
}

impl fmt::Debug for XfsDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!(
            "xfs directory | inode = {}    size = {}    mode = {:#o}",
            self.inode.number,
            self.inode.byte_size(),
            self.inode.mode.0,
        ))
    }
}

impl XfsDirectory {
    /// Materializes a directory from its inode.
    ///
    /// # Errors
    ///
    /// [`XfsError::InvalidArgument`] if the inode is not a directory;
    /// decoding errors from the block map for extent-mapped shapes.
    pub(crate) fn from_inode(fs: Arc<XfsFs>, inode: Arc<Inode>) -> FsResult<Self> {
        if inode.mode.kind() != Some(FileKind::Directory) {
            return Err(XfsError::InvalidArgument("inode is not a directory"));
        }

        let map = match inode.data_fork_format {
            ForkFormat::Local => None,
            ForkFormat::Extents | ForkFormat::Btree => {
                Some(Arc::new(load_data_fork_map(&fs, &inode).map_err(|err| {
                    err.wrap(format!("while reading inode {} block-map", inode.number))
                })?))
            }
            ForkFormat::Uuid | ForkFormat::Rmap => {
                return Err(XfsError::Unsupported("directory fork format"))
            }
            ForkFormat::Dev => return Err(XfsError::Corrupt("directory with device fork")),
        };

        Ok(Self { fs, inode, map })
    }

    /// Iterates the directory's entries in storage order.
    ///
    /// `.` and `..` are omitted unless the volume was opened with
    /// `dot_entries` set.
    ///
    /// # Errors
    ///
    /// Decoding errors from the inline fork; block-shape errors surface
    /// through the iterator items.
    pub fn entries(&self) -> FsResult<DirIter> {
        let state = match self.inode.data_fork_format {
            ForkFormat::Local => {
                let (parent, mut entries) = parse_short_form(
                    &self.inode.data_fork,
                    self.fs.superblock().has_ftype(),
                )?;
                if self.fs.options().dot_entries {
                    let mut synthesized = vec![
                        DirEntry {
                            name: Filename::from("."),
                            inode_number: self.inode.number,
                            file_type: Some(DirFileType::DIRECTORY),
                        },
                        DirEntry {
                            name: Filename::from(".."),
                            inode_number: parent,
                            file_type: Some(DirFileType::DIRECTORY),
                        },
                    ];
                    synthesized.append(&mut entries);
                    entries = synthesized;
                }
                DirIterState::Local {
                    entries: entries.into_iter(),
                }
            }
            _ => DirIterState::Blocks {
                dir_blocks: self.data_space_blocks(),
                position: 0,
                buf: None,
            },
        };

        Ok(DirIter {
            dir: self.clone(),
            state,
        })
    }

    /// Looks up one name, using the hash index whenever the shape has one.
    ///
    /// # Errors
    ///
    /// [`XfsError::NotFound`] when no entry carries the name; decoding
    /// errors are surfaced as-is and never downgraded.
    pub fn lookup(&self, name: &[u8]) -> FsResult<DirEntry> {
        if name.is_empty() || name.len() > 255 {
            return Err(XfsError::InvalidArgument("directory entry name length"));
        }

        match self.inode.data_fork_format {
            ForkFormat::Local => {
                let (parent, entries) = parse_short_form(
                    &self.inode.data_fork,
                    self.fs.superblock().has_ftype(),
                )?;
                if name == b".." {
                    return Ok(DirEntry {
                        name: Filename::from(".."),
                        inode_number: parent,
                        file_type: Some(DirFileType::DIRECTORY),
                    });
                }
                if name == b"." {
                    return Ok(DirEntry {
                        name: Filename::from("."),
                        inode_number: self.inode.number,
                        file_type: Some(DirFileType::DIRECTORY),
                    });
                }

                entries
                    .into_iter()
                    .find(|entry| entry.name.0 == name)
                    .ok_or(XfsError::NotFound)
            }
            _ => self.lookup_hashed(name),
        }
    }

    /// Lookup path for the block, leaf and node shapes.
    fn lookup_hashed(&self, name: &[u8]) -> FsResult<DirEntry> {
        let first = self
            .read_dir_block(0)?
            .ok_or(XfsError::Corrupt("directory without a first data block"))?;
        let magic = u32::from_be_bytes(first[..4].try_into().unwrap_or_default());

        match magic {
            XFS_DIR2_BLOCK_MAGIC | XFS_DIR3_BLOCK_MAGIC => self.lookup_in_block(&first, name),
            XFS_DIR2_DATA_MAGIC | XFS_DIR3_DATA_MAGIC => self.lookup_via_leaf(name),
            _ => Err(XfsError::Corrupt("bad directory block magic")),
        }
    }

    /// Binary-searches the hash trailer of a single-block directory.
    fn lookup_in_block(&self, block: &[u8], name: &[u8]) -> FsResult<DirEntry> {
        self.check_data_block(block)?;

        let tail = block.len() - 8;
        let count = usize::try_from(u32::from_be_bytes(
            block[tail..tail + 4].try_into().unwrap_or_default(),
        ))
        .map_err(|_| XfsError::Corrupt("directory tail count out of range"))?;
        let leaf_base = tail
            .checked_sub(count * 8)
            .ok_or(XfsError::Corrupt("directory tail exceeds block"))?;

        let hash = name_hash(name);
        let leaf = &block[leaf_base..tail];
        for address in hash_lookup_addresses(leaf, count, hash) {
            let offset = usize::try_from(address)
                .ok()
                .and_then(|addr| addr.checked_mul(8))
                .filter(|&offset| offset < leaf_base)
                .ok_or(XfsError::Corrupt("directory hash address out of range"))?;

            let (entry, _) =
                decode_data_entry(block, offset, self.fs.superblock().has_ftype())?
                    .ok_or(XfsError::Corrupt("hash address points at free space"))?;
            if entry.name.0 == name {
                return Ok(entry);
            }
        }

        Err(XfsError::NotFound)
    }

    /// Hash lookup through a separate leaf block, or through the hash
    /// btree of a node directory.
    fn lookup_via_leaf(&self, name: &[u8]) -> FsResult<DirEntry> {
        let leaf_db = XFS_DIR2_LEAF_OFFSET / u64::from(self.fs.superblock().dir_block_size());
        let hash = name_hash(name);

        let mut db = leaf_db;
        let mut depth = 0u16;
        loop {
            self.fs.check_abort()?;
            if depth > DA_MAX_DEPTH {
                return Err(XfsError::Corrupt("hash btree deeper than permitted"));
            }
            depth += 1;

            let block = self
                .read_dir_block(db)?
                .ok_or(XfsError::Corrupt("hole in directory leaf space"))?;
            let info_magic = u16::from_be_bytes(block[8..10].try_into().unwrap_or_default());

            match info_magic {
                XFS_DIR2_LEAF1_MAGIC | XFS_DIR3_LEAF1_MAGIC | XFS_DIR2_LEAFN_MAGIC
                | XFS_DIR3_LEAFN_MAGIC => {
                    return self.search_leaf_block(&block, name, hash);
                }
                XFS_DA_NODE_MAGIC | XFS_DA3_NODE_MAGIC => {
                    db = self.descend_da_node(&block, hash)?;
                }
                _ => return Err(XfsError::Corrupt("bad directory leaf magic")),
            }
        }
    }

    /// Picks the child of a hash-btree node covering `hash`.
    ///
    /// Node entries are (hashval, child) pairs sorted by the highest hash
    /// reachable through the child; the first covering one wins.
    fn descend_da_node(&self, block: &[u8], hash: u32) -> FsResult<u64> {
        let children = da_node_entries(&self.fs, block, "directory node block")?;

        children
            .into_iter()
            .find(|&(hashval, _)| hash <= hashval)
            .map(|(_, before)| u64::from(before))
            .ok_or(XfsError::NotFound)
    }

    /// Hash-searches one leaf block, resolving matches through the data
    /// space.
    fn search_leaf_block(&self, block: &[u8], name: &[u8], hash: u32) -> FsResult<DirEntry> {
        let v5 = self.fs.superblock().version == FormatVersion::V5;
        if v5 {
            self.fs
                .check_block_crc(block, DA3_BLKINFO_CRC_OFFSET, "directory leaf block")?;
        }
        let (hdr_size, count_at) = if v5 { (64, 56) } else { (16, 12) };
        let count = usize::from(u16::from_be_bytes(
            block[count_at..count_at + 2].try_into().unwrap_or_default(),
        ));
        if hdr_size + count * 8 > block.len() {
            return Err(XfsError::Corrupt("directory leaf entries exceed block"));
        }

        let dir_block_size = u64::from(self.fs.superblock().dir_block_size());
        let leaf = &block[hdr_size..hdr_size + count * 8];
        for address in hash_lookup_addresses(leaf, count, hash) {
            let byte = u64::from(address) * 8;
            let db = byte / dir_block_size;
            let offset = usize::try_from(byte % dir_block_size)
                .map_err(|_| XfsError::Corrupt("directory hash address out of range"))?;

            let data = self
                .read_dir_block(db)?
                .ok_or(XfsError::Corrupt("hash address points into a hole"))?;
            self.check_data_block(&data)?;

            let (entry, _) = decode_data_entry(&data, offset, self.fs.superblock().has_ftype())?
                .ok_or(XfsError::Corrupt("hash address points at free space"))?;
            if entry.name.0 == name {
                return Ok(entry);
            }
        }

        Err(XfsError::NotFound)
    }

    /// Directory blocks of the data space, in logical order.
    fn data_space_blocks(&self) -> Vec<u64> {
        let Some(map) = self.map.as_deref() else {
            return Vec::new();
        };
        let dir_fsblocks = u64::from(self.fs.superblock().dir_block_fsblocks());
        let leaf_boundary = XFS_DIR2_LEAF_OFFSET >> self.fs.superblock().block_log;

        let mut dir_blocks = Vec::new();
        for extent in map.range(0, leaf_boundary) {
            let first = extent.logical / dir_fsblocks;
            let last = (extent.end().min(leaf_boundary) - 1) / dir_fsblocks;
            for db in first..=last {
                if dir_blocks.last() != Some(&db) {
                    dir_blocks.push(db);
                }
            }
        }

        dir_blocks
    }

    /// Reads one directory block, stitching its filesystem blocks through
    /// the extent map. `None` when the whole directory block is a hole.
    fn read_dir_block(&self, db: u64) -> FsResult<Option<Vec<u8>>> {
        let map = self
            .map
            .as_deref()
            .ok_or(XfsError::Internal("inline directory has no block map"))?;
        let sb = self.fs.superblock();
        let per = u64::from(sb.dir_block_fsblocks());
        let block_size = usize::try_from(sb.block_size)
            .map_err(|_| XfsError::Internal("block size exceeds addressable range"))?;

        let mut buf = vec![0u8; block_size * per as usize];
        let mut any_data = false;
        for index in 0..per {
            let file_block = db * per + index;
            if let Some(extent) = map.lookup(file_block) {
                if extent.unwritten {
                    continue;
                }
                let fsblock = extent.fsblock + (file_block - extent.logical);
                let data = self.fs.read_fsblock(fsblock)?;
                let at = usize::try_from(index).unwrap_or(0) * block_size;
                buf[at..at + block_size].copy_from_slice(&data);
                any_data = true;
            }
        }

        Ok(any_data.then_some(buf))
    }

    /// Verifies the magic (and v5 checksum) of a data-space block.
    fn check_data_block(&self, block: &[u8]) -> FsResult<()> {
        let magic = u32::from_be_bytes(block[..4].try_into().unwrap_or_default());
        match magic {
            XFS_DIR2_BLOCK_MAGIC | XFS_DIR2_DATA_MAGIC => {
                if self.fs.superblock().version == FormatVersion::V5 {
                    return Err(XfsError::Corrupt("v4 directory block on a v5 filesystem"));
                }
            }
            XFS_DIR3_BLOCK_MAGIC | XFS_DIR3_DATA_MAGIC => {
                self.fs
                    .check_block_crc(block, DIR3_DATA_CRC_OFFSET, "directory data block")?;
            }
            _ => return Err(XfsError::Corrupt("bad directory block magic")),
        }

        Ok(())
    }

    /// Scannable entry region of a data-space block: past the header, and
    /// short of the hash trailer for the single-block shape.
    fn data_block_region(&self, block: &[u8]) -> FsResult<(usize, usize)> {
        let magic = u32::from_be_bytes(block[..4].try_into().unwrap_or_default());
        let header = match magic {
            XFS_DIR2_BLOCK_MAGIC | XFS_DIR2_DATA_MAGIC => 16,
            XFS_DIR3_BLOCK_MAGIC | XFS_DIR3_DATA_MAGIC => 64,
            _ => return Err(XfsError::Corrupt("bad directory block magic")),
        };

        let end = match magic {
            XFS_DIR2_BLOCK_MAGIC | XFS_DIR3_BLOCK_MAGIC => {
                let tail = block.len() - 8;
                let count = usize::try_from(u32::from_be_bytes(
                    block[tail..tail + 4].try_into().unwrap_or_default(),
                ))
                .map_err(|_| XfsError::Corrupt("directory tail count out of range"))?;

                tail.checked_sub(count * 8)
                    .ok_or(XfsError::Corrupt("directory tail exceeds block"))?
            }
            _ => block.len(),
        };

        Ok((header, end))
    }
}

/// Iterator over a directory's entries. Each step polls the volume's abort
/// flag, so a cancelled enumeration fails within one step.
pub struct DirIter {
    dir: XfsDirectory,
    state: DirIterState,
}

enum DirIterState {
    Local {
        entries: std::vec::IntoIter<DirEntry>,
    },
    Blocks {
        dir_blocks: Vec<u64>,
        position: usize,
        /// Current block buffer with the scan cursor and region end.
        buf: Option<(Vec<u8>, usize, usize)>,
    },
}

impl DirIter {
    fn advance(&mut self) -> FsResult<Option<DirEntry>> {
        if let DirIterState::Local { entries } = &mut self.state {
            return Ok(entries.next());
        }

        self.next_from_blocks()
    }

    fn next_from_blocks(&mut self) -> FsResult<Option<DirEntry>> {
        let DirIterState::Blocks {
            dir_blocks,
            position,
            buf,
        } = &mut self.state
        else {
            return Err(XfsError::Internal("directory iterator state mismatch"));
        };

        loop {
            if let Some((block, cursor, end)) = buf {
                if *cursor + 8 <= *end {
                    let decoded = decode_data_entry(
                        block,
                        *cursor,
                        self.dir.fs.superblock().has_ftype(),
                    )?;
                    match decoded {
                        Some((entry, next)) => {
                            *cursor = next;
                            return Ok(Some(entry));
                        }
                        None => {
                            let skip = usize::from(u16::from_be_bytes(
                                block[*cursor + 2..*cursor + 4].try_into().unwrap_or_default(),
                            ));
                            if skip < 8 {
                                return Err(XfsError::Corrupt("free region shorter than its tag"));
                            }
                            *cursor += skip;
                            continue;
                        }
                    }
                }
                *buf = None;
            }

            let Some(db) = dir_blocks.get(*position).copied() else {
                return Ok(None);
            };
            *position += 1;

            let Some(block) = self.dir.read_dir_block(db)? else {
                continue;
            };
            self.dir.check_data_block(&block)?;
            let (start, end) = self.dir.data_block_region(&block)?;
            *buf = Some((block, start, end));
        }
    }
}

impl Iterator for DirIter {
    type Item = FsResult<DirEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Err(err) = self.dir.fs.check_abort() {
                return Some(Err(err));
            }

            match self.advance() {
                Ok(Some(entry)) => {
                    if !self.dir.fs.options().dot_entries && entry.is_dot_entry() {
                        continue;
                    }
                    return Some(Ok(entry));
                }
                Ok(None) => return None,
                Err(err) => return Some(Err(err)),
            }
        }
    }
}

/// Parses the entry table of a hash-btree intermediate node, shared by the
/// directory and attribute readers.
///
/// Validates the node magic (and, on v5, the block checksum) and returns
/// the `(hashval, child)` pairs in order.
pub(crate) fn da_node_entries(
    fs: &XfsFs,
    block: &[u8],
    what: &'static str,
) -> FsResult<Vec<(u32, u32)>> {
    if block.len() < 16 {
        return Err(XfsError::Corrupt("da node block smaller than its header"));
    }
    let info_magic = u16::from_be_bytes(block[8..10].try_into().unwrap_or_default());
    let v5 = fs.superblock().version == FormatVersion::V5;
    let expected = if v5 {
        XFS_DA3_NODE_MAGIC
    } else {
        XFS_DA_NODE_MAGIC
    };
    if info_magic != expected {
        return Err(XfsError::Corrupt("bad da node magic"));
    }
    if v5 {
        fs.check_block_crc(block, DA3_BLKINFO_CRC_OFFSET, what)?;
    }

    let (hdr_size, count_at) = if v5 { (64, 56) } else { (16, 12) };
    let count = usize::from(u16::from_be_bytes(
        block[count_at..count_at + 2].try_into().unwrap_or_default(),
    ));
    if hdr_size + count * 8 > block.len() {
        return Err(XfsError::Corrupt("da node entries exceed block"));
    }

    let mut entries = Vec::with_capacity(count);
    for index in 0..count {
        let at = hdr_size + index * 8;
        entries.push((
            u32::from_be_bytes(block[at..at + 4].try_into().unwrap_or_default()),
            u32::from_be_bytes(block[at + 4..at + 8].try_into().unwrap_or_default()),
        ));
    }

    Ok(entries)
}

/// Decodes the inline short-form directory of a `local` data fork.
///
/// Returns the parent inode recorded in the header together with the
/// entries.
fn parse_short_form(fork: &[u8], has_ftype: bool) -> FsResult<(InodeNumber, Vec<DirEntry>)> {
    if fork.len() < 2 {
        return Err(XfsError::Corrupt("short-form directory header truncated"));
    }
    let count = fork[0];
    let i8_count = fork[1];
    let ino_width: usize = if i8_count > 0 { 8 } else { 4 };
    let entry_count = if count > 0 { count } else { i8_count };

    let mut cursor = 2usize;
    let parent = read_short_form_ino(fork, &mut cursor, ino_width)?;

    let mut entries = Vec::with_capacity(usize::from(entry_count));
    for _ in 0..entry_count {
        if cursor + 3 > fork.len() {
            return Err(XfsError::Corrupt("short-form directory entry truncated"));
        }
        let name_len = usize::from(fork[cursor]);
        // The 16-bit offset field mirrors the entry's position in an
        // expanded block directory; unused when reading.
        cursor += 3;

        if cursor + name_len > fork.len() {
            return Err(XfsError::Corrupt("short-form directory name out of bounds"));
        }
        let name = Filename(fork[cursor..cursor + name_len].to_vec());
        cursor += name_len;

        let file_type = if has_ftype {
            if cursor >= fork.len() {
                return Err(XfsError::Corrupt("short-form directory entry truncated"));
            }
            let file_type = DirFileType(fork[cursor]);
            cursor += 1;
            Some(file_type)
        } else {
            None
        };

        let inode_number = read_short_form_ino(fork, &mut cursor, ino_width)?;
        entries.push(DirEntry {
            name,
            inode_number,
            file_type,
        });
    }

    Ok((parent, entries))
}

fn read_short_form_ino(fork: &[u8], cursor: &mut usize, width: usize) -> FsResult<InodeNumber> {
    if *cursor + width > fork.len() {
        return Err(XfsError::Corrupt("short-form inode number out of bounds"));
    }
    let raw = &fork[*cursor..*cursor + width];
    *cursor += width;

    let number = if width == 8 {
        u64::from_be_bytes(raw.try_into().unwrap_or_default())
    } else {
        u64::from(u32::from_be_bytes(raw.try_into().unwrap_or_default()))
    };

    Ok(InodeNumber(number))
}

/// Decodes the data-block entry at `offset`.
///
/// Returns `None` for a free region (the caller advances by the region's
/// recorded length), or the entry plus the offset of the next one.
fn decode_data_entry(
    block: &[u8],
    offset: usize,
    has_ftype: bool,
) -> FsResult<Option<(DirEntry, usize)>> {
    if offset + 8 > block.len() {
        return Err(XfsError::Corrupt("directory entry out of bounds"));
    }
    let tag = u16::from_be_bytes(block[offset..offset + 2].try_into().unwrap_or_default());
    if tag == XFS_DIR2_DATA_FREE_TAG {
        return Ok(None);
    }

    let inode_number = u64::from_be_bytes(
        block[offset..offset + 8].try_into().unwrap_or_default(),
    );
    let name_at = offset + 9;
    let name_len = usize::from(block[offset + 8]);
    if name_len == 0 {
        return Err(XfsError::Corrupt("empty directory entry name"));
    }

    let ftype_len = usize::from(has_ftype);
    let fixed = 8 + 1 + name_len + ftype_len + 2;
    let entry_size = (fixed + 7) & !7;
    if offset + entry_size > block.len() {
        return Err(XfsError::Corrupt("directory entry out of bounds"));
    }

    let name = Filename(block[name_at..name_at + name_len].to_vec());
    let file_type = has_ftype.then(|| DirFileType(block[name_at + name_len]));

    Ok(Some((
        DirEntry {
            name,
            inode_number: InodeNumber(inode_number),
            file_type,
        },
        offset + entry_size,
    )))
}

/// Binary-searches a hash-sorted `(hash, address)` array and yields the
/// addresses of every non-stale entry carrying `hash`.
fn hash_lookup_addresses(leaf: &[u8], count: usize, hash: u32) -> Vec<u32> {
    let entry = |index: usize| -> (u32, u32) {
        let at = index * 8;
        (
            u32::from_be_bytes(leaf[at..at + 4].try_into().unwrap_or_default()),
            u32::from_be_bytes(leaf[at + 4..at + 8].try_into().unwrap_or_default()),
        )
    };

    let mut low = 0usize;
    let mut high = count;
    while low < high {
        let mid = (low + high) / 2;
        if entry(mid).0 < hash {
            low = mid + 1;
        } else {
            high = mid;
        }
    }

    let mut addresses = Vec::new();
    let mut index = low;
    while index < count {
        let (hashval, address) = entry(index);
        if hashval != hash {
            break;
        }
        // Address 0 marks a stale leaf entry.
        if address != 0 {
            addresses.push(address);
        }
        index += 1;
    }

    addresses
}
