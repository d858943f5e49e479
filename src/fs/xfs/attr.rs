//! XFS extended-attribute decoding.
//!
//! Attribute forks reuse the directory playbook one size down: a short
//! inline list (`local` fork), a single hash-sorted leaf block, or a
//! hash-indexed btree of leaves for very large attribute sets. Values small
//! enough to fit a leaf are stored next to their name; larger ones live
//! out-of-line in dedicated remote-value blocks of the attribute fork.

use core::fmt;
use std::sync::Arc;

use crate::errors::{FsResult, XfsError};
use crate::fs::xfs::dir::{da_node_entries, name_hash, Filename};
use crate::fs::xfs::extent::{load_attr_fork_map, ExtentTree};
use crate::fs::xfs::inode::{ForkFormat, Inode};
use crate::fs::xfs::sb::FormatVersion;
use crate::fs::xfs::XfsFs;

/// Attribute leaf block magic, version 4.
const XFS_ATTR_LEAF_MAGIC: u16 = 0xFBEE;

/// Attribute leaf block magic, version 5.
const XFS_ATTR3_LEAF_MAGIC: u16 = 0x3BEE;

/// Hash-btree intermediate node magic, versions 4 and 5.
const XFS_DA_NODE_MAGIC: u16 = 0xFEBE;
const XFS_DA3_NODE_MAGIC: u16 = 0x3EBE;

/// Remote-value block magic, version 5: `XARM`.
const XFS_ATTR3_RMT_MAGIC: u32 = 0x5841_524D;

/// Header size of a v5 remote-value block.
const ATTR3_RMT_HDR_SIZE: usize = 56;

/// Byte offset of the `crc` field within a v5 da-block header.
const DA3_BLKINFO_CRC_OFFSET: usize = 12;

/// Byte offset of the `crc` field within a v5 remote-value block.
const ATTR3_RMT_CRC_OFFSET: usize = 12;

/// Upper bound on hash-btree depth; anything deeper is treated as a cycle.
const DA_MAX_DEPTH: u16 = 6;

/// Entry flag: the value is stored inside the leaf block.
const XFS_ATTR_LOCAL: u8 = 0x01;

/// Entry flag: `root` (trusted) namespace.
const XFS_ATTR_ROOT: u8 = 0x02;

/// Entry flag: `secure` namespace.
const XFS_ATTR_SECURE: u8 = 0x04;

/// Entry flag: parent-pointer namespace.
const XFS_ATTR_PARENT: u8 = 0x08;

/// Entry flag: the entry is mid-update and must be ignored.
const XFS_ATTR_INCOMPLETE: u8 = 0x80;

/// Namespace an extended attribute belongs to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum AttrNamespace {
    /// Unprivileged user attributes.
    User,

    /// Trusted attributes, readable by privileged processes only.
    Root,

    /// Security-module attributes.
    Secure,

    /// Directory parent pointers.
    Parent,
}

impl AttrNamespace {
    fn from_flags(flags: u8) -> Self {
        if flags & XFS_ATTR_ROOT != 0 {
            Self::Root
        } else if flags & XFS_ATTR_SECURE != 0 {
            Self::Secure
        } else if flags & XFS_ATTR_PARENT != 0 {
            Self::Parent
        } else {
            Self::User
        }
    }
}

impl fmt::Display for AttrNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::User => "user",
            Self::Root => "root",
            Self::Secure => "secure",
            Self::Parent => "parent",
        })
    }
}

/// A decoded extended attribute.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AttrEntry {
    pub namespace: AttrNamespace,
    pub name: Filename,
    pub value: Vec<u8>,
}

/// Reader over one inode's attribute fork.
pub(crate) struct AttrReader {
    fs: Arc<XfsFs>,
    inode: Arc<Inode>,
    map: Option<ExtentTree>,
}

impl AttrReader {
    /// Materializes the attribute fork of an inode. Inodes without an
    /// attribute fork yield an empty reader.
    pub(crate) fn from_inode(fs: Arc<XfsFs>, inode: Arc<Inode>) -> FsResult<Self> {
        let map = if inode.attr_fork.is_empty() {
            None
        } else {
            match inode.attr_fork_format {
                ForkFormat::Local => None,
                ForkFormat::Extents | ForkFormat::Btree => {
                    Some(load_attr_fork_map(&fs, &inode).map_err(|err| {
                        err.wrap(format!(
                            "while reading inode {} attribute block-map",
                            inode.number
                        ))
                    })?)
                }
                _ => return Err(XfsError::Unsupported("attribute fork format")),
            }
        };

        Ok(Self { fs, inode, map })
    }

    /// Decodes every attribute of the fork.
    pub(crate) fn entries(&self) -> FsResult<Vec<AttrEntry>> {
        if self.inode.attr_fork.is_empty() {
            return Ok(Vec::new());
        }

        match self.inode.attr_fork_format {
            ForkFormat::Local => parse_short_form(&self.inode.attr_fork),
            _ => {
                let mut entries = Vec::new();
                self.walk_block(0, 0, &mut entries)?;
                Ok(entries)
            }
        }
    }

    /// Looks up one attribute by namespace and name, descending the hash
    /// index where the shape has one.
    ///
    /// # Errors
    ///
    /// [`XfsError::NotFound`] when the attribute does not exist.
    pub(crate) fn lookup(&self, namespace: AttrNamespace, name: &[u8]) -> FsResult<AttrEntry> {
        if self.inode.attr_fork.is_empty() {
            return Err(XfsError::NotFound);
        }

        match self.inode.attr_fork_format {
            ForkFormat::Local => parse_short_form(&self.inode.attr_fork)?
                .into_iter()
                .find(|entry| entry.namespace == namespace && entry.name.0 == name)
                .ok_or(XfsError::NotFound),
            _ => self.lookup_hashed(namespace, name),
        }
    }

    /// Hash descent through node blocks down to the one leaf that can hold
    /// the name, then a linear scan of that leaf.
    fn lookup_hashed(&self, namespace: AttrNamespace, name: &[u8]) -> FsResult<AttrEntry> {
        let hash = name_hash(name);

        let mut fork_block = 0u64;
        let mut depth = 0u16;
        loop {
            self.fs.check_abort()?;
            if depth > DA_MAX_DEPTH {
                return Err(XfsError::Corrupt("attribute btree deeper than permitted"));
            }
            depth += 1;

            let block = self
                .read_fork_block(fork_block)?
                .ok_or(XfsError::Corrupt("hole in attribute fork metadata"))?;
            let info_magic = u16::from_be_bytes(block[8..10].try_into().unwrap_or_default());

            match info_magic {
                XFS_ATTR_LEAF_MAGIC | XFS_ATTR3_LEAF_MAGIC => {
                    let mut entries = Vec::new();
                    self.parse_leaf_filtered(&block, Some(hash), &mut entries)?;

                    return entries
                        .into_iter()
                        .find(|entry| entry.namespace == namespace && entry.name.0 == name)
                        .ok_or(XfsError::NotFound);
                }
                XFS_DA_NODE_MAGIC | XFS_DA3_NODE_MAGIC => {
                    let children = da_node_entries(&self.fs, &block, "attribute node block")?;
                    fork_block = children
                        .into_iter()
                        .find(|&(hashval, _)| hash <= hashval)
                        .map(|(_, before)| u64::from(before))
                        .ok_or(XfsError::NotFound)?;
                }
                _ => return Err(XfsError::Corrupt("bad attribute block magic")),
            }
        }
    }

    /// Recursive walk of the attribute btree, collecting leaf entries in
    /// hash order.
    fn walk_block(&self, fork_block: u64, depth: u16, out: &mut Vec<AttrEntry>) -> FsResult<()> {
        self.fs.check_abort()?;
        if depth > DA_MAX_DEPTH {
            return Err(XfsError::Corrupt("attribute btree deeper than permitted"));
        }

        let block = self
            .read_fork_block(fork_block)?
            .ok_or(XfsError::Corrupt("hole in attribute fork metadata"))?;
        let info_magic = u16::from_be_bytes(block[8..10].try_into().unwrap_or_default());

        match info_magic {
            XFS_ATTR_LEAF_MAGIC | XFS_ATTR3_LEAF_MAGIC => {
                self.parse_leaf_filtered(&block, None, out)
            }
            XFS_DA_NODE_MAGIC | XFS_DA3_NODE_MAGIC => {
                let children = da_node_entries(&self.fs, &block, "attribute node block")?;
                for (_hashval, before) in children {
                    self.walk_block(u64::from(before), depth + 1, out)?;
                }
                Ok(())
            }
            _ => Err(XfsError::Corrupt("bad attribute block magic")),
        }
    }

    /// Decodes the entries of one attribute leaf block, optionally
    /// restricted to one hash value.
    fn parse_leaf_filtered(
        &self,
        block: &[u8],
        hash: Option<u32>,
        out: &mut Vec<AttrEntry>,
    ) -> FsResult<()> {
        let v5 = self.fs.superblock().version == FormatVersion::V5;
        let info_magic = u16::from_be_bytes(block[8..10].try_into().unwrap_or_default());
        if v5 != (info_magic == XFS_ATTR3_LEAF_MAGIC) {
            return Err(XfsError::Corrupt("attribute leaf magic version mismatch"));
        }
        if v5 {
            self.fs
                .check_block_crc(block, DA3_BLKINFO_CRC_OFFSET, "attribute leaf block")?;
        }

        let (hdr_size, count_at) = if v5 { (80, 56) } else { (32, 12) };
        let count = usize::from(u16::from_be_bytes(
            block[count_at..count_at + 2].try_into().unwrap_or_default(),
        ));
        if hdr_size + count * 8 > block.len() {
            return Err(XfsError::Corrupt("attribute leaf entries exceed block"));
        }

        for index in 0..count {
            let at = hdr_size + index * 8;
            let hashval = u32::from_be_bytes(block[at..at + 4].try_into().unwrap_or_default());
            if hash.is_some_and(|hash| hash != hashval) {
                continue;
            }
            let name_index = usize::from(u16::from_be_bytes(
                block[at + 4..at + 6].try_into().unwrap_or_default(),
            ));
            let flags = block[at + 6];
            if flags & XFS_ATTR_INCOMPLETE != 0 {
                continue;
            }

            out.push(self.decode_leaf_name(block, name_index, flags)?);
        }

        Ok(())
    }

    /// Decodes the name structure referenced by one leaf entry.
    fn decode_leaf_name(&self, block: &[u8], at: usize, flags: u8) -> FsResult<AttrEntry> {
        let namespace = AttrNamespace::from_flags(flags);

        if flags & XFS_ATTR_LOCAL != 0 {
            if at + 3 > block.len() {
                return Err(XfsError::Corrupt("attribute name out of bounds"));
            }
            let value_len = usize::from(u16::from_be_bytes(
                block[at..at + 2].try_into().unwrap_or_default(),
            ));
            let name_len = usize::from(block[at + 2]);
            let name_at = at + 3;
            if name_at + name_len + value_len > block.len() {
                return Err(XfsError::Corrupt("attribute value out of bounds"));
            }

            Ok(AttrEntry {
                namespace,
                name: Filename(block[name_at..name_at + name_len].to_vec()),
                value: block[name_at + name_len..name_at + name_len + value_len].to_vec(),
            })
        } else {
            if at + 9 > block.len() {
                return Err(XfsError::Corrupt("attribute name out of bounds"));
            }
            let value_block = u32::from_be_bytes(block[at..at + 4].try_into().unwrap_or_default());
            let value_len = u32::from_be_bytes(
                block[at + 4..at + 8].try_into().unwrap_or_default(),
            );
            let name_len = usize::from(block[at + 8]);
            let name_at = at + 9;
            if name_at + name_len > block.len() {
                return Err(XfsError::Corrupt("attribute name out of bounds"));
            }

            Ok(AttrEntry {
                namespace,
                name: Filename(block[name_at..name_at + name_len].to_vec()),
                value: self.read_remote_value(value_block, value_len)?,
            })
        }
    }

    /// Gathers an out-of-line value from its remote blocks.
    fn read_remote_value(&self, value_block: u32, value_len: u32) -> FsResult<Vec<u8>> {
        let total = usize::try_from(value_len)
            .map_err(|_| XfsError::Corrupt("remote attribute value length"))?;
        let v5 = self.fs.superblock().version == FormatVersion::V5;

        let mut value = Vec::with_capacity(total);
        let mut fork_block = u64::from(value_block);
        while value.len() < total {
            let block = self
                .read_fork_block(fork_block)?
                .ok_or(XfsError::Corrupt("hole in remote attribute value"))?;

            let payload = if v5 {
                let magic = u32::from_be_bytes(block[..4].try_into().unwrap_or_default());
                if magic != XFS_ATTR3_RMT_MAGIC {
                    return Err(XfsError::Corrupt("bad remote attribute block magic"));
                }
                self.fs.check_block_crc(
                    &block,
                    ATTR3_RMT_CRC_OFFSET,
                    "remote attribute block",
                )?;
                &block[ATTR3_RMT_HDR_SIZE..]
            } else {
                &block[..]
            };

            let take = payload.len().min(total - value.len());
            value.extend_from_slice(&payload[..take]);
            fork_block += 1;
        }

        Ok(value)
    }

    /// Reads one filesystem block of the attribute fork through its extent
    /// map. `None` for holes.
    fn read_fork_block(&self, fork_block: u64) -> FsResult<Option<Vec<u8>>> {
        let map = self
            .map
            .as_ref()
            .ok_or(XfsError::Internal("inline attribute fork has no block map"))?;

        let Some(extent) = map.lookup(fork_block) else {
            return Ok(None);
        };
        if extent.unwritten {
            return Ok(None);
        }
        let fsblock = extent.fsblock + (fork_block - extent.logical);

        self.fs.read_fsblock(fsblock).map(Some)
    }
}

/// Decodes the inline short-form attribute list of a `local` attribute
/// fork.
fn parse_short_form(fork: &[u8]) -> FsResult<Vec<AttrEntry>> {
    if fork.len() < 4 {
        return Err(XfsError::Corrupt("short-form attribute header truncated"));
    }
    let total_size = usize::from(u16::from_be_bytes(fork[..2].try_into().unwrap_or_default()));
    let count = fork[2];
    if total_size > fork.len() {
        return Err(XfsError::Corrupt("short-form attributes exceed fork"));
    }

    let mut entries = Vec::with_capacity(usize::from(count));
    let mut cursor = 4usize;
    for _ in 0..count {
        if cursor + 3 > total_size {
            return Err(XfsError::Corrupt("short-form attribute entry truncated"));
        }
        let name_len = usize::from(fork[cursor]);
        let value_len = usize::from(fork[cursor + 1]);
        let flags = fork[cursor + 2];
        cursor += 3;

        if cursor + name_len + value_len > total_size {
            return Err(XfsError::Corrupt("short-form attribute out of bounds"));
        }
        let name = Filename(fork[cursor..cursor + name_len].to_vec());
        cursor += name_len;
        let value = fork[cursor..cursor + value_len].to_vec();
        cursor += value_len;

        if flags & XFS_ATTR_INCOMPLETE != 0 {
            continue;
        }
        entries.push(AttrEntry {
            namespace: AttrNamespace::from_flags(flags),
            name,
            value,
        });
    }

    Ok(entries)
}
