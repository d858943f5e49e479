//! XFS inode related structures.
//!
//! Inodes are the base records holding data about filesystem objects. The
//! on-disk record exists in three format versions: v1 (16-bit link counts),
//! v2 (32-bit link counts, project identifiers) and v3 (CRC-protected,
//! creation time, extended flags). All three decode into the same
//! normalized [`Inode`], with the v3-only fields surfaced as options.
//!
//! Each inode carries up to two *forks*: the data fork describing the
//! object's content, and an optional attribute fork holding extended
//! attributes. A fork is either inline (`local`), a packed extent list, a
//! block-map btree root, a device identifier, or one of the exotic formats
//! this library does not interpret.

use core::fmt::{Display, Formatter};

use bytemuck::{Pod, Zeroable};

use crate::errors::{FsResult, XfsError};
use crate::fs::xfs::sb::{crc_with_hole, Superblock};
use crate::fs::xfs::CrcPolicy;
use crate::fs::FileKind;

/// Inode record signature: `IN`.
pub(crate) const XFS_DINODE_MAGIC: u16 = 0x494E;

/// Size of the fixed inode header for format versions 1 and 2.
pub(crate) const INODE_CORE_SIZE_V1: usize = 96;

/// Size of the fixed inode header for format version 3.
pub(crate) const INODE_CORE_SIZE_V3: usize = 176;

/// Byte offset of the `crc` field within a v3 inode record.
const INODE_CRC_OFFSET: usize = 100;

/// A 64-bit absolute inode number.
///
/// The bit layout packs `(ag_index, ag_block, inode_in_block)`; the split
/// widths come from the superblock geometry.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct InodeNumber(pub(crate) u64);

impl InodeNumber {
    /// Inode 0 marks an unused directory entry.
    pub const NONE: Self = Self(0);
}

impl Display for InodeNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.write_fmt(format_args!("{}", self.0))
    }
}

impl From<u64> for InodeNumber {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<InodeNumber> for u64 {
    fn from(value: InodeNumber) -> Self {
        value.0
    }
}

/// File mode / type representation.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct FileMode(pub u16);

impl FileMode {
    /// Mask isolating the file-type nibble.
    pub const S_IFMT: Self = Self(0o170000);

    /// FIFO.
    pub const S_IFIFO: Self = Self(0o010000);

    /// Character device.
    pub const S_IFCHR: Self = Self(0o020000);

    /// Directory.
    pub const S_IFDIR: Self = Self(0o040000);

    /// Block device.
    pub const S_IFBLK: Self = Self(0o060000);

    /// Regular file.
    pub const S_IFREG: Self = Self(0o100000);

    /// Symbolic link.
    pub const S_IFLNK: Self = Self(0o120000);

    /// Socket.
    pub const S_IFSOCK: Self = Self(0o140000);

    /// The type encoded in the mode's type nibble, if it is a known one.
    #[must_use]
    pub fn kind(self) -> Option<FileKind> {
        match Self(self.0 & Self::S_IFMT.0) {
            Self::S_IFIFO => Some(FileKind::Fifo),
            Self::S_IFCHR => Some(FileKind::CharacterDevice),
            Self::S_IFDIR => Some(FileKind::Directory),
            Self::S_IFBLK => Some(FileKind::BlockDevice),
            Self::S_IFREG => Some(FileKind::Regular),
            Self::S_IFLNK => Some(FileKind::SymbolicLink),
            Self::S_IFSOCK => Some(FileKind::Socket),
            _ => None,
        }
    }

    /// The permission bits, with the type nibble masked off.
    #[must_use]
    pub fn permissions(self) -> u16 {
        self.0 & 0o7777
    }
}

impl Display for FileMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        let mut symbolic = String::with_capacity(9);
        for shift in [6u16, 3, 0] {
            let bits = (self.0 >> shift) & 0o7;
            symbolic.push(if bits & 0o4 != 0 { 'r' } else { '-' });
            symbolic.push(if bits & 0o2 != 0 { 'w' } else { '-' });
            symbolic.push(if bits & 0o1 != 0 { 'x' } else { '-' });
        }

        f.write_str(&symbolic)
    }
}

/// Inode flags (`di_flags`).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct InodeFlags(pub u16);

impl InodeFlags {
    /// The file data lives on the realtime subvolume.
    pub const REALTIME: Self = Self(0x0001);

    /// The file has preallocated extents.
    pub const PREALLOC: Self = Self(0x0002);

    /// Checks if every flag of `flags` is set.
    #[must_use]
    pub fn contains(self, flags: Self) -> bool {
        self.0 & flags.0 == flags.0
    }
}

/// Extended inode flags (`di_flags2`, v3 only).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, PartialOrd, Ord, Hash, Pod, Zeroable)]
#[repr(transparent)]
pub struct ExtendedInodeFlags(pub u64);

impl ExtendedInodeFlags {
    /// Blocks of this file may be shared with other files.
    pub const REFLINK: Self = Self(0x0002);

    /// A copy-on-write extent size hint is set.
    pub const COW_EXTSIZE: Self = Self(0x0004);
}

/// Storage format of an inode fork.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ForkFormat {
    /// The fork holds a 32-bit device identifier (block and character
    /// device inodes only).
    Dev,

    /// The fork content is stored inline: a short-form directory, an
    /// inline attribute list, or a symbolic-link target.
    Local,

    /// The fork is a packed array of extent records.
    Extents,

    /// The fork holds the root of a block-map btree whose leaves are
    /// extent records.
    Btree,

    /// UUID-format fork; surfaced as unsupported when dereferenced.
    Uuid,

    /// Reverse-mapping btree fork; surfaced as unsupported when
    /// dereferenced.
    Rmap,
}

impl ForkFormat {
    fn from_raw(raw: u8) -> FsResult<Self> {
        match raw {
            0 => Ok(Self::Dev),
            1 => Ok(Self::Local),
            2 => Ok(Self::Extents),
            3 => Ok(Self::Btree),
            4 => Ok(Self::Uuid),
            5 => Ok(Self::Rmap),
            _ => Err(XfsError::Corrupt("unknown inode fork format")),
        }
    }
}

/// On-disk inode timestamp: seconds and nanoseconds, both big-endian.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct DiskTimestamp {
    pub sec: u32,
    pub nsec: u32,
}

impl DiskTimestamp {
    /// Combines the pair into signed nanoseconds since the epoch.
    fn to_nanoseconds(self) -> i64 {
        i64::from(u32::from_be(self.sec) as i32) * 1_000_000_000
            + i64::from(u32::from_be(self.nsec))
    }
}

/// Raw fixed header shared by all inode format versions (96 bytes). All
/// integer fields are big-endian.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct DiskInodeCore {
    /// Signature, `IN`.
    pub magic: u16,

    /// File mode and type.
    pub mode: u16,

    /// Inode format version: 1, 2 or 3.
    pub version: u8,

    /// Data fork format tag.
    pub format: u8,

    /// Number of links (v1 inodes only).
    pub onlink: u16,

    pub uid: u32,
    pub gid: u32,

    /// Number of links (v2 and later).
    pub nlink: u32,

    pub projid: u16,
    pub projid_hi: u16,
    pub pad: [u8; 6],
    pub flushiter: u16,

    pub atime: DiskTimestamp,
    pub mtime: DiskTimestamp,
    pub ctime: DiskTimestamp,

    /// Logical size of the object, in bytes.
    pub size: i64,

    /// Number of blocks attributed to the inode, across both forks.
    pub nblocks: u64,

    /// Extent-size allocation hint, in blocks.
    pub extsize: u32,

    /// Number of extents in the data fork.
    pub nextents: u32,

    /// Number of extents in the attribute fork.
    pub anextents: u16,

    /// Offset of the attribute fork within the fork region, in 8-byte
    /// units. Zero means no attribute fork.
    pub forkoff: u8,

    /// Attribute fork format tag.
    pub aformat: u8,

    pub dmevmask: u32,
    pub dmstate: u16,

    /// Inode flags.
    pub flags: u16,

    /// Generation number.
    pub gen: u32,
}

/// Raw v3 extension of the inode header (bytes 96..176). All integer
/// fields are big-endian.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct DiskInodeV3Ext {
    pub next_unlinked: u32,

    /// CRC32C of the full inode record, this field zeroed.
    pub crc: u32,

    pub change_count: u64,
    pub lsn: u64,

    /// Extended inode flags.
    pub flags2: u64,

    /// Copy-on-write extent-size hint, in blocks.
    pub cow_extsize: u32,

    pub pad2: [u8; 12],

    /// Creation time.
    pub crtime: DiskTimestamp,

    /// The inode's own absolute number, for self-verification.
    pub ino: u64,

    /// Metadata UUID of the owning filesystem.
    pub uuid: [u8; 16],
}

/// Normalized inode record, immutable once decoded. Shared by every file
/// entry referencing the same inode number.
#[derive(Clone, Debug)]
pub struct Inode {
    pub(crate) number: InodeNumber,
    pub(crate) format_version: u8,
    pub(crate) mode: FileMode,
    pub(crate) uid: u32,
    pub(crate) gid: u32,

    /// 0 on filesystems without project identifiers.
    pub(crate) project_id: u32,

    pub(crate) link_count: u32,

    /// Logical size in bytes; negative sizes never leave the decoder.
    pub(crate) size: i64,

    pub(crate) access_time_ns: i64,
    pub(crate) modification_time_ns: i64,
    pub(crate) inode_change_time_ns: i64,

    /// Creation time; absent before format version 3.
    pub(crate) creation_time_ns: Option<i64>,

    pub(crate) generation: u32,
    pub(crate) flags: InodeFlags,
    pub(crate) extended_flags: Option<ExtendedInodeFlags>,
    pub(crate) extent_size_hint: u32,
    pub(crate) cow_extent_size_hint: Option<u32>,

    pub(crate) data_fork_format: ForkFormat,
    pub(crate) attr_fork_format: ForkFormat,
    pub(crate) data_extent_count: u32,
    pub(crate) attr_extent_count: u16,

    /// Raw bytes of the data fork region.
    pub(crate) data_fork: Vec<u8>,

    /// Raw bytes of the attribute fork region; empty when no attribute
    /// fork exists.
    pub(crate) attr_fork: Vec<u8>,
}

impl Inode {
    /// Decodes a full on-disk inode record.
    ///
    /// `data` must hold exactly `superblock.inode_size` bytes.
    ///
    /// # Errors
    ///
    /// [`XfsError::Corrupt`] for a bad signature, an unknown format
    /// version or fork format, fork bounds escaping the record, or (under
    /// [`CrcPolicy::Fatal`]) a v3 checksum/self-identity mismatch.
    pub(crate) fn decode(
        number: InodeNumber,
        data: &[u8],
        sb: &Superblock,
        crc_policy: CrcPolicy,
    ) -> FsResult<Self> {
        if data.len() != usize::from(sb.inode_size) {
            return Err(XfsError::InvalidArgument(
                "inode decoding requires a full inode record",
            ));
        }
        let core: DiskInodeCore = bytemuck::pod_read_unaligned(&data[..INODE_CORE_SIZE_V1]);

        if u16::from_be(core.magic) != XFS_DINODE_MAGIC {
            return Err(XfsError::Corrupt("bad inode signature"));
        }

        let format_version = core.version;
        if !(1..=3).contains(&format_version) {
            return Err(XfsError::Corrupt("unknown inode format version"));
        }
        if (format_version == 3) != sb.has_crc() {
            return Err(XfsError::Corrupt("inode format version does not match filesystem"));
        }

        let ext: Option<DiskInodeV3Ext> = if format_version == 3 {
            let ext: DiskInodeV3Ext =
                bytemuck::pod_read_unaligned(&data[INODE_CORE_SIZE_V1..INODE_CORE_SIZE_V3]);

            Self::check_v3_identity(number, data, &ext, sb, crc_policy)?;
            Some(ext)
        } else {
            None
        };

        let link_count = if format_version == 1 {
            u32::from(u16::from_be(core.onlink))
        } else {
            u32::from_be(core.nlink)
        };

        let project_id = if format_version == 1 {
            0
        } else if sb.has_project_id_32bit() {
            u32::from(u16::from_be(core.projid))
                | (u32::from(u16::from_be(core.projid_hi)) << 16)
        } else {
            u32::from(u16::from_be(core.projid))
        };

        let data_fork_format = ForkFormat::from_raw(core.format)?;
        let attr_fork_format = ForkFormat::from_raw(core.aformat)?;

        let core_size = if format_version == 3 {
            INODE_CORE_SIZE_V3
        } else {
            INODE_CORE_SIZE_V1
        };
        let fork_region = data.len() - core_size;
        let attr_offset = usize::from(core.forkoff) * 8;
        if attr_offset > fork_region {
            return Err(XfsError::Corrupt("attribute fork offset exceeds inode"));
        }

        let (data_fork, attr_fork) = if core.forkoff == 0 {
            (data[core_size..].to_vec(), Vec::new())
        } else {
            (
                data[core_size..core_size + attr_offset].to_vec(),
                data[core_size + attr_offset..].to_vec(),
            )
        };

        let data_extent_count = u32::from_be(core.nextents);
        let attr_extent_count = u16::from_be(core.anextents);

        Ok(Self {
            number,
            format_version,
            mode: FileMode(u16::from_be(core.mode)),
            uid: u32::from_be(core.uid),
            gid: u32::from_be(core.gid),
            project_id,
            link_count,
            size: i64::from_be(core.size),
            access_time_ns: core.atime.to_nanoseconds(),
            modification_time_ns: core.mtime.to_nanoseconds(),
            inode_change_time_ns: core.ctime.to_nanoseconds(),
            creation_time_ns: ext.as_ref().map(|ext| ext.crtime.to_nanoseconds()),
            generation: u32::from_be(core.gen),
            flags: InodeFlags(u16::from_be(core.flags)),
            extended_flags: ext
                .as_ref()
                .map(|ext| ExtendedInodeFlags(u64::from_be(ext.flags2))),
            extent_size_hint: u32::from_be(core.extsize),
            cow_extent_size_hint: ext.as_ref().map(|ext| u32::from_be(ext.cow_extsize)),
            data_fork_format,
            attr_fork_format,
            data_extent_count,
            attr_extent_count,
            data_fork,
            attr_fork,
        })
    }

    /// v3 inodes are self-describing: they carry a CRC over the whole
    /// record, their own inode number and the filesystem's metadata UUID.
    fn check_v3_identity(
        number: InodeNumber,
        data: &[u8],
        ext: &DiskInodeV3Ext,
        sb: &Superblock,
        crc_policy: CrcPolicy,
    ) -> FsResult<()> {
        let stored = u32::from_be(ext.crc);
        let computed = crc_with_hole(data, INODE_CRC_OFFSET);

        if stored != computed {
            match crc_policy {
                CrcPolicy::Fatal => return Err(XfsError::Corrupt("inode checksum mismatch")),
                CrcPolicy::Warn => log::warn!(
                    target: "xfs",
                    "inode {} checksum mismatch ignored",
                    number
                ),
            }
        }
        if u64::from_be(ext.ino) != number.0 {
            return Err(XfsError::Corrupt("inode self-number mismatch"));
        }
        if ext.uuid != *sb.meta_uuid.as_bytes() {
            return Err(XfsError::Corrupt("inode metadata identifier mismatch"));
        }

        Ok(())
    }

    /// The kind of object this inode describes.
    ///
    /// # Errors
    ///
    /// [`XfsError::Corrupt`] when the type nibble holds none of the known
    /// kinds.
    pub(crate) fn kind(&self) -> FsResult<FileKind> {
        self.mode
            .kind()
            .ok_or(XfsError::Corrupt("unknown file type in inode mode"))
    }

    /// Logical size of the object, clamped to zero for defensive reads of
    /// damaged records.
    pub(crate) fn byte_size(&self) -> u64 {
        u64::try_from(self.size).unwrap_or(0)
    }

    /// The 32-bit device identifier of a block or character device inode.
    pub(crate) fn device_id(&self) -> Option<u32> {
        if self.data_fork_format != ForkFormat::Dev || self.data_fork.len() < 4 {
            return None;
        }

        Some(u32::from_be_bytes(self.data_fork[..4].try_into().ok()?))
    }
}
