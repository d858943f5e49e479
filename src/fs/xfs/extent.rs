//! XFS block-map ("bmbt") decoding.
//!
//! A fork in `extents` format is a packed array of 128-bit extent records;
//! a fork in `btree` format holds the root of a block-map btree whose
//! leaves are those same records. Either way the whole map is materialized
//! into an [`ExtentTree`], an ordered in-memory extent list, and logical
//! lookups binary-search it. Logical blocks not covered by any extent are
//! holes and read back as zeros.

use core::cmp::Ordering;

use bytemuck::{Pod, Zeroable};

use crate::errors::{FsResult, XfsError};
use crate::fs::xfs::inode::{ForkFormat, Inode};
use crate::fs::xfs::sb::FormatVersion;
use crate::fs::xfs::XfsFs;

/// On-disk size of a packed extent record, in bytes.
pub(crate) const EXTENT_RECORD_SIZE: usize = 16;

/// Block-map btree block magic, version 4: `BMAP`.
const XFS_BMAP_MAGIC: u32 = 0x424D_4150;

/// Block-map btree block magic, version 5: `BMA3`.
const XFS_BMAP3_MAGIC: u32 = 0x424D_4133;

/// Byte offset of the `crc` field within a v5 long-format btree block.
const BTREE_LBLOCK_CRC_OFFSET: usize = 64;

/// Upper bound on the height of a block-map btree; anything deeper is
/// treated as a cycle.
const BMBT_MAX_LEVELS: u16 = 9;

/// Raw on-disk extent record: two big-endian 64-bit words with a packed
/// bit layout (MSB to LSB): 1 flag bit, 54 bits of logical block offset,
/// 52 bits of physical block number, 21 bits of block count.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct DiskExtentRec {
    pub l0: u64,
    pub l1: u64,
}

/// A decoded extent: a contiguous run of physical blocks mapped to a
/// contiguous run of logical file blocks.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Extent {
    /// First logical file block covered by this extent.
    pub logical: u64,

    /// First physical block backing the run, packed `(ag, ag_block)` form.
    pub fsblock: u64,

    /// Number of blocks in the run.
    pub count: u64,

    /// Preallocated but never written; reads back as zeros.
    pub unwritten: bool,
}

impl Extent {
    /// Unpacks a raw record by shift-and-mask from its two 64-bit words.
    pub(crate) fn decode(rec: DiskExtentRec) -> Self {
        let l0 = u64::from_be(rec.l0);
        let l1 = u64::from_be(rec.l1);

        Self {
            logical: (l0 >> 9) & 0x003F_FFFF_FFFF_FFFF,
            fsblock: ((l0 & 0x1FF) << 43) | (l1 >> 21),
            count: l1 & 0x001F_FFFF,
            unwritten: (l0 >> 63) != 0,
        }
    }

    /// First logical block past the extent.
    pub(crate) fn end(&self) -> u64 {
        self.logical + self.count
    }

    /// Checks whether the extent covers the given logical block.
    pub(crate) fn contains(&self, file_block: u64) -> bool {
        self.logical <= file_block && file_block < self.end()
    }
}

/// In-memory block map of one inode fork: every extent, in logical order.
#[derive(Clone, Debug, Default)]
pub(crate) struct ExtentTree {
    pub(crate) extents: Vec<Extent>,
}

impl ExtentTree {
    /// Decodes the packed extent array of an `extents`-format fork.
    ///
    /// # Errors
    ///
    /// [`XfsError::Corrupt`] if the declared record count exceeds the fork
    /// or the records violate the ordering invariant.
    pub(crate) fn from_extents_fork(fork: &[u8], record_count: u32) -> FsResult<Self> {
        let count = usize::try_from(record_count)
            .map_err(|_| XfsError::Corrupt("extent count out of range"))?;
        let bytes = count
            .checked_mul(EXTENT_RECORD_SIZE)
            .filter(|&bytes| bytes <= fork.len())
            .ok_or(XfsError::Corrupt("extent records exceed fork size"))?;

        let mut extents = Vec::with_capacity(count);
        for chunk in fork[..bytes].chunks_exact(EXTENT_RECORD_SIZE) {
            extents.push(Extent::decode(bytemuck::pod_read_unaligned(chunk)));
        }

        let tree = Self { extents };
        tree.check_ordering()?;

        Ok(tree)
    }

    /// Loads the entire block-map btree of a `btree`-format fork into
    /// memory.
    ///
    /// The fork holds a root header and a `(key, pointer)` array; child
    /// blocks live on disk and are read through the volume. Descent depth
    /// is bounded by the root's height field, so a corrupted sibling cycle
    /// terminates with an error instead of spinning.
    pub(crate) fn from_btree_fork(fs: &XfsFs, inode: &Inode, fork: &[u8]) -> FsResult<Self> {
        if fork.len() < 4 {
            return Err(XfsError::Corrupt("bmbt root smaller than its header"));
        }
        let level = u16::from_be_bytes(fork[..2].try_into().unwrap_or_default());
        let numrecs = u16::from_be_bytes(fork[2..4].try_into().unwrap_or_default());

        if level == 0 || level > BMBT_MAX_LEVELS {
            return Err(XfsError::Corrupt("bmbt root height out of range"));
        }

        // Keys and pointers are laid out for the maximum record count that
        // fits the root, not the current one.
        let maxrecs = (fork.len() - 4) / EXTENT_RECORD_SIZE;
        if usize::from(numrecs) > maxrecs {
            return Err(XfsError::Corrupt("bmbt root record count out of range"));
        }
        let ptr_base = 4 + maxrecs * 8;

        let mut extents = Vec::new();
        for rec in 0..usize::from(numrecs) {
            let at = ptr_base + rec * 8;
            let ptr = u64::from_be_bytes(
                fork[at..at + 8]
                    .try_into()
                    .map_err(|_| XfsError::Corrupt("bmbt root pointer out of bounds"))?,
            );

            descend_bmbt_node(fs, inode, ptr, level - 1, &mut extents)?;
        }

        let tree = Self { extents };
        tree.check_ordering()?;

        Ok(tree)
    }

    /// Returns the extent covering the given logical file block, if any.
    /// `None` means the block is a hole.
    pub(crate) fn lookup(&self, file_block: u64) -> Option<&Extent> {
        let index = self
            .extents
            .binary_search_by(|extent| {
                if extent.contains(file_block) {
                    Ordering::Equal
                } else if extent.logical > file_block {
                    Ordering::Greater
                } else {
                    Ordering::Less
                }
            })
            .ok()?;

        self.extents.get(index)
    }

    /// Logical start of the first extent past `file_block`, used to bound
    /// hole lengths.
    pub(crate) fn next_extent_start(&self, file_block: u64) -> Option<u64> {
        let index = self
            .extents
            .partition_point(|extent| extent.logical <= file_block);

        self.extents.get(index).map(|extent| extent.logical)
    }

    /// Iterates the extents whose logical range intersects
    /// `[from_block, to_block)`.
    pub(crate) fn range(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> impl Iterator<Item = &Extent> + '_ {
        self.extents
            .iter()
            .filter(move |extent| extent.logical < to_block && extent.end() > from_block)
    }

    /// Logical offsets must be strictly ascending with disjoint ranges.
    fn check_ordering(&self) -> FsResult<()> {
        for pair in self.extents.windows(2) {
            if pair[0].end() > pair[1].logical {
                return Err(XfsError::Corrupt("extents out of order or overlapping"));
            }
        }

        Ok(())
    }
}

/// Reads one bmbt node or leaf and collects its records, descending into
/// children.
fn descend_bmbt_node(
    fs: &XfsFs,
    inode: &Inode,
    fsblock: u64,
    expected_level: u16,
    extents: &mut Vec<Extent>,
) -> FsResult<()> {
    fs.check_abort()?;

    let block = fs.read_fsblock(fsblock)?;
    let header_size = check_bmbt_header(fs, inode, &block, expected_level)?;
    let numrecs = usize::from(u16::from_be_bytes(
        block[6..8].try_into().unwrap_or_default(),
    ));

    if expected_level == 0 {
        let end = header_size + numrecs * EXTENT_RECORD_SIZE;
        if end > block.len() {
            return Err(XfsError::Corrupt("bmbt leaf records exceed block"));
        }
        for chunk in block[header_size..end].chunks_exact(EXTENT_RECORD_SIZE) {
            extents.push(Extent::decode(bytemuck::pod_read_unaligned(chunk)));
        }

        return Ok(());
    }

    let maxrecs = (block.len() - header_size) / EXTENT_RECORD_SIZE;
    if numrecs > maxrecs {
        return Err(XfsError::Corrupt("bmbt node record count out of range"));
    }
    let ptr_base = header_size + maxrecs * 8;
    for rec in 0..numrecs {
        let at = ptr_base + rec * 8;
        let ptr = u64::from_be_bytes(
            block[at..at + 8]
                .try_into()
                .map_err(|_| XfsError::Corrupt("bmbt node pointer out of bounds"))?,
        );

        descend_bmbt_node(fs, inode, ptr, expected_level - 1, extents)?;
    }

    Ok(())
}

/// Validates a long-format btree block header against the volume's format
/// family and the expected tree level; returns the header size.
fn check_bmbt_header(
    fs: &XfsFs,
    inode: &Inode,
    block: &[u8],
    expected_level: u16,
) -> FsResult<usize> {
    if block.len() < 24 {
        return Err(XfsError::Corrupt("bmbt block smaller than its header"));
    }
    let magic = u32::from_be_bytes(block[..4].try_into().unwrap_or_default());
    let level = u16::from_be_bytes(block[4..6].try_into().unwrap_or_default());

    let (expected_magic, header_size) = match fs.superblock().version {
        FormatVersion::V4 => (XFS_BMAP_MAGIC, 24),
        FormatVersion::V5 => (XFS_BMAP3_MAGIC, 72),
    };
    if magic != expected_magic {
        return Err(XfsError::Corrupt("bad bmbt block magic"));
    }
    if level != expected_level {
        return Err(XfsError::Corrupt("bmbt level mismatch"));
    }
    if header_size == 72 {
        fs.check_block_crc(block, BTREE_LBLOCK_CRC_OFFSET, "bmbt block")?;

        let owner = u64::from_be_bytes(block[56..64].try_into().unwrap_or_default());
        if owner != u64::from(inode.number) {
            return Err(XfsError::Corrupt("bmbt block owner mismatch"));
        }
    }

    Ok(header_size)
}

/// Builds the block map for whichever fork layout the inode uses for its
/// data fork.
pub(crate) fn load_data_fork_map(fs: &XfsFs, inode: &Inode) -> FsResult<ExtentTree> {
    load_fork_map(
        fs,
        inode,
        inode.data_fork_format,
        &inode.data_fork,
        inode.data_extent_count,
    )
}

/// Builds the block map for the attribute fork.
pub(crate) fn load_attr_fork_map(fs: &XfsFs, inode: &Inode) -> FsResult<ExtentTree> {
    load_fork_map(
        fs,
        inode,
        inode.attr_fork_format,
        &inode.attr_fork,
        u32::from(inode.attr_extent_count),
    )
}

fn load_fork_map(
    fs: &XfsFs,
    inode: &Inode,
    format: ForkFormat,
    fork: &[u8],
    record_count: u32,
) -> FsResult<ExtentTree> {
    match format {
        ForkFormat::Extents => ExtentTree::from_extents_fork(fork, record_count),
        ForkFormat::Btree => ExtentTree::from_btree_fork(fs, inode, fork),
        ForkFormat::Local | ForkFormat::Dev => {
            Err(XfsError::Internal("inline fork has no block map"))
        }
        ForkFormat::Uuid => Err(XfsError::Unsupported("uuid-format fork")),
        ForkFormat::Rmap => Err(XfsError::Unsupported("reverse-mapping fork")),
    }
}
