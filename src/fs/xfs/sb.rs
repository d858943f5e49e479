//! XFS superblock related structures.
//!
//! The superblock occupies the first sector of the filesystem and carries
//! everything needed to address the rest of it: block and inode geometry,
//! allocation-group layout, and the three feature-bit families (version
//! flags, secondary features, v5 compat/ro-compat/incompat sets).
//!
//! Secondary copies exist at the start of every allocation group; only the
//! primary at offset 0 is consulted here.

use bytemuck::{Pod, Zeroable};
use uuid::Uuid;

use crate::errors::{FsResult, XfsError};
use crate::fs::xfs::inode::InodeNumber;
use crate::fs::xfs::CrcPolicy;

/// XFS superblock magic: `XFSB`.
pub(crate) const XFS_SB_MAGIC: u32 = 0x5846_5342;

/// On-disk size of the decoded superblock region, in bytes.
pub(crate) const SB_SIZE: usize = 512;

/// Byte offset of the `crc` field within the superblock sector.
const SB_CRC_OFFSET: usize = 224;

/// Defines a standard structure for flag-related fields of the superblock.
macro_rules! xfs_flag_field {
    ($struct_name: tt, $size: ident, $desc: literal) => {
        #[derive(
            Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Pod, Zeroable,
        )]
        #[repr(transparent)]
        #[doc = $desc]
        pub struct $struct_name(pub(crate) $size);

        impl $struct_name {
            /// Empty flag set.
            pub const EMPTY_SET: Self = Self(0);

            /// Checks if this set is a subset of (included in) the set
            /// passed as argument.
            #[must_use]
            pub fn is_subset_of(self, flags: Self) -> bool {
                (self | flags) ^ flags == Self::EMPTY_SET
            }

            /// Checks if this set includes every flag of the set passed as
            /// argument.
            #[must_use]
            pub fn includes(self, flags: Self) -> bool {
                flags.is_subset_of(self)
            }

            /// Returns the flags of this set that are absent from the set
            /// passed as argument.
            #[must_use]
            pub fn difference(self, flags: Self) -> Self {
                Self(self.0 & !flags.0)
            }

            /// Checks if no flag is set.
            #[must_use]
            pub fn is_empty(self) -> bool {
                self == Self::EMPTY_SET
            }
        }

        impl core::ops::BitAnd for $struct_name {
            type Output = Self;

            fn bitand(self, rhs: Self) -> Self::Output {
                Self(self.0 & rhs.0)
            }
        }

        impl core::ops::BitOr for $struct_name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self::Output {
                Self(self.0 | rhs.0)
            }
        }

        impl core::ops::BitXor for $struct_name {
            type Output = Self;

            fn bitxor(self, rhs: Self) -> Self::Output {
                Self(self.0 ^ rhs.0)
            }
        }
    };
}

xfs_flag_field!(
    VersionFlags,
    u16,
    "Feature flags stored in the upper 12 bits of the superblock version \
field. Relevant for version 4 filesystems; version 5 moved feature \
negotiation to the dedicated compat/ro-compat/incompat sets."
);

impl VersionFlags {
    /// Extended attributes are in use.
    pub const ATTR: Self = Self(0x0010);

    /// 32-bit link counts (version 2 inodes).
    pub const NLINK: Self = Self(0x0020);

    /// Quotas are enabled on the filesystem.
    pub const QUOTA: Self = Self(0x0040);

    /// Inode chunk alignment is in use.
    pub const ALIGN: Self = Self(0x0080);

    /// Stripe-unit data alignment is in use.
    pub const DALIGN: Self = Self(0x0100);

    pub const SHARED: Self = Self(0x0200);

    /// Version 2 journal format.
    pub const LOGV2: Self = Self(0x0400);

    /// Non-512-byte sector size in use.
    pub const SECTOR: Self = Self(0x0800);

    /// Unwritten extents are tracked (always set on current filesystems).
    pub const EXTFLG: Self = Self(0x1000);

    /// Version 2 directories. Mandatory: version 1 directories predate the
    /// formats this library decodes.
    pub const DIRV2: Self = Self(0x2000);

    pub const BORG: Self = Self(0x4000);

    /// The secondary feature field (`features2`) is valid.
    pub const MOREBITS: Self = Self(0x8000);
}

xfs_flag_field!(
    SecondaryFeatureSet,
    u32,
    "Secondary feature flags (`sb_features2`), valid when \
[`VersionFlags::MOREBITS`] is advertised."
);

impl SecondaryFeatureSet {
    /// Superblock free-space counters are lazily maintained.
    pub const LAZY_SB_COUNTERS: Self = Self(0x0002);

    /// Attribute forks may start at a dynamic offset within the inode
    /// (attr2 format).
    pub const ATTR2: Self = Self(0x0008);

    /// Parent pointers are stored in attributes.
    pub const PARENT: Self = Self(0x0010);

    /// 32-bit project identifiers.
    pub const PROJECT_ID_32BIT: Self = Self(0x0080);

    pub const CRC: Self = Self(0x0100);

    /// Directory entries carry a file-type byte.
    pub const FTYPE: Self = Self(0x0200);
}

xfs_flag_field!(
    CompatFeatureSet,
    u32,
    "Version 5 compatible feature set. Unknown flags do not prevent any \
access."
);

xfs_flag_field!(
    ReadOnlyCompatFeatureSet,
    u32,
    "Version 5 read-only compatible feature set. Unknown flags would \
prevent writing, which this library never does; they are logged and \
ignored."
);

impl ReadOnlyCompatFeatureSet {
    /// A free-inode btree is maintained per allocation group.
    pub const FREE_INODE_BTREE: Self = Self(0x1);

    /// Reverse-mapping btrees are maintained.
    pub const RMAP_BTREE: Self = Self(0x2);

    /// Blocks may be shared between files (reflink).
    pub const REFLINK: Self = Self(0x4);

    /// The inode btree records carry block counts.
    pub const INODE_BTREE_COUNTERS: Self = Self(0x8);
}

xfs_flag_field!(
    IncompatFeatureSet,
    u32,
    "Version 5 incompatible feature set. The filesystem must not be \
interpreted by an implementation that does not understand every flag set \
here."
);

impl IncompatFeatureSet {
    /// Directory entries carry a file-type byte (the v5 equivalent of
    /// [`SecondaryFeatureSet::FTYPE`]).
    pub const FTYPE: Self = Self(0x1);

    /// Inode chunks may be sparsely allocated.
    pub const SPARSE_INODES: Self = Self(0x2);

    /// Metadata is stamped with `meta_uuid` instead of the user-visible
    /// `uuid`.
    pub const META_UUID: Self = Self(0x4);

    /// Nanosecond-counter timestamps (not implemented here).
    pub const BIGTIME: Self = Self(0x8);

    /// The filesystem was left in need of repair (not implemented here).
    pub const NEEDS_REPAIR: Self = Self(0x10);

    /// 64-bit extent counters (not implemented here).
    pub const LARGE_EXTENT_COUNTS: Self = Self(0x20);

    /// Every flag this library recognizes, implemented or not.
    pub const KNOWN_SET: Self =
        Self(Self::FTYPE.0 | Self::SPARSE_INODES.0 | Self::META_UUID.0 | 0x8 | 0x10 | 0x20);

    /// The subset of [`IncompatFeatureSet::KNOWN_SET`] that the decoder
    /// actually implements.
    pub const SUPPORTED_SET: Self = Self(Self::FTYPE.0 | Self::SPARSE_INODES.0 | Self::META_UUID.0);
}

/// Major on-disk format version of the filesystem.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum FormatVersion {
    /// Version 4 layout: no metadata checksums, feature bits split between
    /// the version field and `features2`.
    V4,

    /// Version 5 layout: CRC32C-protected metadata, self-describing block
    /// headers, dedicated feature sets.
    V5,
}

/// Raw on-disk superblock. All integer fields are big-endian.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct DiskSb {
    /// Magic number, `XFSB`.
    pub magicnum: u32,

    /// Size of a filesystem block, in bytes.
    pub blocksize: u32,

    /// Number of blocks available for data and metadata.
    pub dblocks: u64,

    pub rblocks: u64,
    pub rextents: u64,

    /// User-visible filesystem identifier.
    pub uuid: [u8; 16],

    /// First block of the journal.
    pub logstart: u64,

    /// Root directory inode number.
    pub rootino: u64,

    pub rbmino: u64,
    pub rsumino: u64,
    pub rextsize: u32,

    /// Size of each allocation group, in blocks.
    pub agblocks: u32,

    /// Number of allocation groups.
    pub agcount: u32,

    pub rbmblocks: u32,
    pub logblocks: u32,

    /// Low nibble: format version. Upper bits: [`VersionFlags`].
    pub versionnum: u16,

    /// Size of a sector, in bytes.
    pub sectsize: u16,

    /// Size of an inode record, in bytes.
    pub inodesize: u16,

    /// Number of inodes per filesystem block.
    pub inopblock: u16,

    /// Volume label, NUL-padded.
    pub fname: [u8; 12],

    /// `log2(blocksize)`.
    pub blocklog: u8,

    /// `log2(sectsize)`.
    pub sectlog: u8,

    /// `log2(inodesize)`.
    pub inodelog: u8,

    /// `log2(inopblock)`.
    pub inopblog: u8,

    /// `ceil(log2(agblocks))`; the bit width of AG-relative block numbers
    /// inside packed block and inode numbers.
    pub agblklog: u8,

    pub rextslog: u8,

    /// Non-zero while mkfs is still writing the filesystem.
    pub inprogress: u8,

    pub imax_pct: u8,

    /// Number of allocated inodes on the filesystem.
    pub icount: u64,

    pub ifree: u64,
    pub fdblocks: u64,
    pub frextents: u64,
    pub uquotino: u64,
    pub gquotino: u64,
    pub qflags: u16,
    pub flags: u8,
    pub shared_vn: u8,
    pub inoalignmt: u32,
    pub unit: u32,
    pub width: u32,

    /// `log2` of the directory block size, in filesystem blocks.
    pub dirblklog: u8,

    pub logsectlog: u8,
    pub logsectsize: u16,
    pub logsunit: u32,

    /// [`SecondaryFeatureSet`] bits.
    pub features2: u32,

    /// Mirror of `features2`, maintained for a historic write bug.
    pub bad_features2: u32,

    // Version 5 fields from here on.
    pub features_compat: u32,
    pub features_ro_compat: u32,
    pub features_incompat: u32,
    pub features_log_incompat: u32,

    /// CRC32C of the superblock sector, this field zeroed.
    pub crc: u32,

    pub spino_align: u32,
    pub pquotino: u64,
    pub lsn: i64,

    /// Metadata identifier, valid when [`IncompatFeatureSet::META_UUID`]
    /// is set; equal to `uuid` otherwise.
    pub meta_uuid: [u8; 16],

    pub rrmapino: u64,
}

/// Parsed superblock and derived geometry, immutable once the volume is
/// open.
#[derive(Clone, Debug)]
pub struct Superblock {
    pub(crate) version: FormatVersion,

    pub(crate) block_size: u32,
    pub(crate) block_log: u8,
    pub(crate) sector_size: u16,

    /// Total number of data blocks on the filesystem.
    pub(crate) block_count: u64,

    pub(crate) ag_count: u32,
    pub(crate) ag_blocks: u32,

    /// Bit width of the AG-relative block component of packed block and
    /// inode numbers.
    pub(crate) ag_block_log: u8,

    pub(crate) inode_size: u16,
    pub(crate) inode_log: u8,
    pub(crate) inodes_per_block: u16,

    /// Bit width of the inode-within-block component of an inode number.
    pub(crate) inode_per_block_log: u8,

    pub(crate) dir_block_log: u8,

    pub(crate) root_inode: InodeNumber,
    pub(crate) inode_count: u64,

    pub(crate) label: [u8; 12],
    pub(crate) uuid: Uuid,

    /// The identifier stamped into v5 metadata blocks.
    pub(crate) meta_uuid: Uuid,

    pub(crate) version_flags: VersionFlags,
    pub(crate) features2: SecondaryFeatureSet,
    pub(crate) compat: CompatFeatureSet,
    pub(crate) ro_compat: ReadOnlyCompatFeatureSet,
    pub(crate) incompat: IncompatFeatureSet,
}

impl Superblock {
    /// Decodes and validates the primary superblock from the first sector
    /// of the filesystem.
    ///
    /// # Errors
    ///
    /// - [`XfsError::Corrupt`] for a bad magic, inconsistent geometry, an
    ///   unknown incompatible feature bit, or (under
    ///   [`CrcPolicy::Fatal`]) a checksum mismatch.
    /// - [`XfsError::Unsupported`] for format versions other than 4 and 5
    ///   and for known-but-unimplemented incompatible features.
    pub(crate) fn decode(data: &[u8], crc_policy: CrcPolicy) -> FsResult<Self> {
        if data.len() < SB_SIZE {
            return Err(XfsError::InvalidArgument(
                "superblock decoding requires a full 512-byte sector",
            ));
        }
        let raw: DiskSb = bytemuck::pod_read_unaligned(&data[..core::mem::size_of::<DiskSb>()]);

        if u32::from_be(raw.magicnum) != XFS_SB_MAGIC {
            return Err(XfsError::Corrupt("bad superblock magic"));
        }

        let versionnum = u16::from_be(raw.versionnum);
        let version = match versionnum & 0x000F {
            4 => FormatVersion::V4,
            5 => FormatVersion::V5,
            _ => return Err(XfsError::Unsupported("superblock format version")),
        };
        let version_flags = VersionFlags(versionnum & 0xFFF0);

        if version == FormatVersion::V4 && !version_flags.includes(VersionFlags::DIRV2) {
            return Err(XfsError::Unsupported("version 1 directories"));
        }

        let block_size = u32::from_be(raw.blocksize);
        if !block_size.is_power_of_two()
            || !(512..=65536).contains(&block_size)
            || 1u32.checked_shl(raw.blocklog.into()) != Some(block_size)
        {
            return Err(XfsError::Corrupt("invalid block size"));
        }

        let sector_size = u16::from_be(raw.sectsize);
        if !sector_size.is_power_of_two() || !(512..=32768).contains(&sector_size) {
            return Err(XfsError::Corrupt("invalid sector size"));
        }

        let inode_size = u16::from_be(raw.inodesize);
        if ![256, 512, 1024, 2048].contains(&inode_size) {
            return Err(XfsError::Unsupported("inode size"));
        }
        let inodes_per_block = u16::from_be(raw.inopblock);
        if 1u16.checked_shl(raw.inodelog.into()) != Some(inode_size)
            || 1u16.checked_shl(raw.inopblog.into()) != Some(inodes_per_block)
            || u32::from(inodes_per_block) * u32::from(inode_size) != block_size
        {
            return Err(XfsError::Corrupt("inconsistent inode geometry"));
        }

        let ag_count = u32::from_be(raw.agcount);
        let ag_blocks = u32::from_be(raw.agblocks);
        if ag_count == 0 || ag_blocks == 0 {
            return Err(XfsError::Corrupt("empty allocation group geometry"));
        }
        let ag_span = 1u64.checked_shl(raw.agblklog.into()).unwrap_or(0);
        if ag_span == 0
            || u64::from(ag_blocks) > ag_span
            || (raw.agblklog > 0 && u64::from(ag_blocks) <= ag_span / 2)
        {
            return Err(XfsError::Corrupt("allocation group block log mismatch"));
        }

        let block_count = u64::from_be(raw.dblocks);
        if block_count > u64::from(ag_count) * u64::from(ag_blocks) {
            return Err(XfsError::Corrupt("block count exceeds allocation groups"));
        }

        if raw.dirblklog >= 8 {
            return Err(XfsError::Corrupt("invalid directory block log"));
        }

        let features2 = if version_flags.includes(VersionFlags::MOREBITS) {
            SecondaryFeatureSet(u32::from_be(raw.features2))
        } else {
            SecondaryFeatureSet::EMPTY_SET
        };

        let compat = CompatFeatureSet(u32::from_be(raw.features_compat));
        let ro_compat = ReadOnlyCompatFeatureSet(u32::from_be(raw.features_ro_compat));
        let incompat = IncompatFeatureSet(u32::from_be(raw.features_incompat));

        if version == FormatVersion::V5 {
            let unknown = incompat.difference(IncompatFeatureSet::KNOWN_SET);
            if !unknown.is_empty() {
                log::error!(
                    target: "xfs",
                    "unknown incompatible feature bits {:#010x}",
                    unknown.0
                );
                return Err(XfsError::Corrupt("unknown incompatible feature"));
            }
            let unimplemented = incompat.difference(IncompatFeatureSet::SUPPORTED_SET);
            if !unimplemented.is_empty() {
                return Err(XfsError::Unsupported(
                    "incompatible feature known but not implemented",
                ));
            }

            let crc_ok = Self::verify_crc(&data[..SB_SIZE]);
            if !crc_ok {
                match crc_policy {
                    CrcPolicy::Fatal => {
                        return Err(XfsError::Corrupt("superblock checksum mismatch"))
                    }
                    CrcPolicy::Warn => {
                        log::warn!(target: "xfs", "superblock checksum mismatch ignored");
                    }
                }
            }
        }

        if raw.inprogress != 0 {
            log::warn!(target: "xfs", "filesystem is marked as still being created");
        }

        let uuid = Uuid::from_bytes(raw.uuid);
        let meta_uuid = if incompat.includes(IncompatFeatureSet::META_UUID) {
            Uuid::from_bytes(raw.meta_uuid)
        } else {
            uuid
        };

        Ok(Self {
            version,
            block_size,
            block_log: raw.blocklog,
            sector_size,
            block_count,
            ag_count,
            ag_blocks,
            ag_block_log: raw.agblklog,
            inode_size,
            inode_log: raw.inodelog,
            inodes_per_block,
            inode_per_block_log: raw.inopblog,
            dir_block_log: raw.dirblklog,
            root_inode: InodeNumber(u64::from_be(raw.rootino)),
            inode_count: u64::from_be(raw.icount),
            label: raw.fname,
            uuid,
            meta_uuid,
            version_flags,
            features2,
            compat,
            ro_compat,
            incompat,
        })
    }

    /// Compares the stored superblock checksum against a freshly computed
    /// one.
    pub(crate) fn verify_crc(sector: &[u8]) -> bool {
        let stored = u32::from_be_bytes(
            sector[SB_CRC_OFFSET..SB_CRC_OFFSET + 4]
                .try_into()
                .unwrap_or_default(),
        );

        crc_with_hole(sector, SB_CRC_OFFSET) == stored
    }

    /// Checks whether directory entries carry a file-type byte.
    pub(crate) fn has_ftype(&self) -> bool {
        match self.version {
            FormatVersion::V5 => self.incompat.includes(IncompatFeatureSet::FTYPE),
            FormatVersion::V4 => self.features2.includes(SecondaryFeatureSet::FTYPE),
        }
    }

    /// Checks whether metadata carries CRC32C checksums.
    pub(crate) fn has_crc(&self) -> bool {
        self.version == FormatVersion::V5
    }

    /// Checks whether inodes use 32-bit link counts (version 2 inodes).
    pub(crate) fn has_nlink(&self) -> bool {
        self.version == FormatVersion::V5 || self.version_flags.includes(VersionFlags::NLINK)
    }

    /// Checks whether project identifiers are 32 bits wide.
    pub(crate) fn has_project_id_32bit(&self) -> bool {
        self.features2
            .includes(SecondaryFeatureSet::PROJECT_ID_32BIT)
    }

    /// Size of a directory block, in bytes. Directory blocks may span
    /// several filesystem blocks.
    pub(crate) fn dir_block_size(&self) -> u32 {
        self.block_size << self.dir_block_log
    }

    /// Number of filesystem blocks per directory block.
    pub(crate) fn dir_block_fsblocks(&self) -> u32 {
        1 << self.dir_block_log
    }

    /// Splits a packed filesystem block number into its
    /// `(ag_index, ag_block)` components.
    ///
    /// Packed block numbers reserve the low [`Superblock::ag_block_log`]
    /// bits for the AG-relative block; `ag_blocks` is not required to be a
    /// power of two, so the byte offset must be computed from the split
    /// parts rather than by shifting the packed value.
    pub(crate) fn fsblock_to_ag(&self, fsblock: u64) -> (u32, u32) {
        let ag = (fsblock >> self.ag_block_log) as u32;
        let ag_block = (fsblock & ((1u64 << self.ag_block_log) - 1)) as u32;

        (ag, ag_block)
    }

    /// Byte offset of an AG-relative block within the filesystem.
    pub(crate) fn ag_block_to_byte(&self, ag: u32, ag_block: u32) -> u64 {
        (u64::from(ag) * u64::from(self.ag_blocks) + u64::from(ag_block)) << self.block_log
    }

    /// Byte offset of a packed filesystem block number, if its components
    /// are within the filesystem's geometry.
    pub(crate) fn fsblock_to_byte(&self, fsblock: u64) -> Option<u64> {
        let (ag, ag_block) = self.fsblock_to_ag(fsblock);
        if ag >= self.ag_count || ag_block >= self.ag_blocks {
            return None;
        }

        Some(self.ag_block_to_byte(ag, ag_block))
    }

    /// Splits an absolute inode number into its
    /// `(ag_index, ag_block, inode_in_block)` components.
    pub(crate) fn ino_split(&self, ino: InodeNumber) -> (u32, u32, u32) {
        let agino_bits = self.inode_per_block_log + self.ag_block_log;
        let ag = (ino.0 >> agino_bits) as u32;
        let ag_block = ((ino.0 >> self.inode_per_block_log) & ((1 << self.ag_block_log) - 1)) as u32;
        let offset = (ino.0 & ((1 << self.inode_per_block_log) - 1)) as u32;

        (ag, ag_block, offset)
    }

    /// Packs `(ag_index, ag_block, inode_in_block)` into an absolute inode
    /// number.
    pub(crate) fn ino_join(&self, ag: u32, ag_block: u32, offset: u32) -> InodeNumber {
        let packed = (u64::from(ag) << (self.inode_per_block_log + self.ag_block_log))
            | (u64::from(ag_block) << self.inode_per_block_log)
            | u64::from(offset);

        InodeNumber(packed)
    }

    /// Byte position and record size of an inode on disk, or `None` if any
    /// component of the inode number falls outside the geometry.
    pub(crate) fn inode_position(&self, ino: InodeNumber) -> Option<u64> {
        let (ag, ag_block, offset) = self.ino_split(ino);
        if ag >= self.ag_count
            || ag_block >= self.ag_blocks
            || offset >= u32::from(self.inodes_per_block)
        {
            return None;
        }

        Some(self.ag_block_to_byte(ag, ag_block) + u64::from(offset) * u64::from(self.inode_size))
    }

    /// The volume label, with trailing NUL padding removed.
    pub(crate) fn label(&self) -> String {
        self.label
            .iter()
            .copied()
            .filter(|&b| b != 0)
            .map(char::from)
            .collect()
    }
}

/// CRC32C of `data` with the four bytes at `hole` treated as zero, the way
/// every v5 structure stores its own checksum.
pub(crate) fn crc_with_hole(data: &[u8], hole: usize) -> u32 {
    let crc = crc32c::crc32c(&data[..hole]);
    let crc = crc32c::crc32c_append(crc, &[0u8; 4]);

    crc32c::crc32c_append(crc, &data[hole + 4..])
}
