//! Fabricated XFS images for the end-to-end tests.
//!
//! The builder lays out a one-allocation-group filesystem with a 4096-byte
//! block size and 512-byte inodes, then lets each test place inodes,
//! directory blocks, leaf/node hash blocks and symbolic-link blocks at
//! chosen filesystem blocks. Checksummed v5 structures get their CRC32C
//! filled in the same way the decoder verifies it.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use fzxfs::{ByteSource, CanFail, XfsError};

pub const BLOCK_SIZE: usize = 4096;
pub const INODE_SIZE: usize = 512;
pub const AG_BLOCKS: u32 = 256;
pub const AG_BLK_LOG: u8 = 8;
pub const INOPBLOG: u8 = 3;

/// Root directory inode used by every fixture.
pub const ROOT_INO: u64 = 128;

/// First filesystem block handed out for file and directory content.
pub const FIRST_DATA_BLOCK: u64 = 32;

/// Logical file block where the directory leaf space begins
/// (32 GiB / 4096).
pub const LEAF_FILE_BLOCK: u64 = (1 << 35) / BLOCK_SIZE as u64;

pub const FIXTURE_UUID: [u8; 16] = *b"fzxfs-test-image";

/// CRC32C of `data` with four bytes zeroed at `hole`.
pub fn crc_with_hole(data: &[u8], hole: usize) -> u32 {
    let mut copy = data.to_vec();
    copy[hole..hole + 4].fill(0);

    crc32c::crc32c(&copy)
}

/// The directory name hash, reimplemented independently of the library.
pub fn name_hash(name: &[u8]) -> u32 {
    let mut hash: u32 = 0;
    let mut rest = name;
    while rest.len() >= 4 {
        hash = (u32::from(rest[0]) << 21)
            ^ (u32::from(rest[1]) << 14)
            ^ (u32::from(rest[2]) << 7)
            ^ u32::from(rest[3])
            ^ hash.rotate_left(28);
        rest = &rest[4..];
    }
    match *rest {
        [a, b, c] => {
            (u32::from(a) << 14) ^ (u32::from(b) << 7) ^ u32::from(c) ^ hash.rotate_left(21)
        }
        [a, b] => (u32::from(a) << 7) ^ u32::from(b) ^ hash.rotate_left(14),
        [a] => u32::from(a) ^ hash.rotate_left(7),
        _ => hash,
    }
}

/// Packs one extent record with the 1/54/52/21 bit layout.
pub fn pack_extent(logical: u64, fsblock: u64, count: u64, unwritten: bool) -> [u8; 16] {
    let l0 = (u64::from(unwritten) << 63)
        | ((logical & 0x003F_FFFF_FFFF_FFFF) << 9)
        | (fsblock >> 43);
    let l1 = ((fsblock & 0x7FF_FFFF_FFFF) << 21) | (count & 0x001F_FFFF);

    let mut rec = [0u8; 16];
    rec[..8].copy_from_slice(&l0.to_be_bytes());
    rec[8..].copy_from_slice(&l1.to_be_bytes());
    rec
}

/// Extent fork bytes for a run list.
pub fn extent_fork(extents: &[(u64, u64, u64)]) -> Vec<u8> {
    let mut fork = Vec::with_capacity(extents.len() * 16);
    for &(logical, fsblock, count) in extents {
        fork.extend_from_slice(&pack_extent(logical, fsblock, count, false));
    }
    fork
}

/// Short-form directory fork bytes (4-byte inode numbers, ftype enabled).
pub fn sf_dir(parent: u64, entries: &[(&[u8], u64, u8)]) -> Vec<u8> {
    let mut fork = vec![entries.len() as u8, 0];
    fork.extend_from_slice(&(parent as u32).to_be_bytes());
    for &(name, ino, ftype) in entries {
        fork.push(name.len() as u8);
        fork.extend_from_slice(&0u16.to_be_bytes());
        fork.extend_from_slice(name);
        fork.push(ftype);
        fork.extend_from_slice(&(ino as u32).to_be_bytes());
    }
    fork
}

/// Short-form attribute fork bytes.
pub fn sf_attr(entries: &[(&[u8], &[u8], u8)]) -> Vec<u8> {
    let mut fork = vec![0u8, 0, entries.len() as u8, 0];
    for &(name, value, flags) in entries {
        fork.push(name.len() as u8);
        fork.push(value.len() as u8);
        fork.push(flags);
        fork.extend_from_slice(name);
        fork.extend_from_slice(value);
    }
    let total = fork.len() as u16;
    fork[..2].copy_from_slice(&total.to_be_bytes());
    fork
}

/// Everything needed to serialize one inode record.
pub struct InodeSpec {
    pub mode: u16,
    pub size: i64,
    pub format: u8,
    pub nextents: u32,
    pub data_fork: Vec<u8>,
    pub forkoff: u8,
    pub aformat: u8,
    pub anextents: u16,
    pub attr_fork: Vec<u8>,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
}

impl InodeSpec {
    fn base(mode: u16, size: i64, format: u8) -> Self {
        Self {
            mode,
            size,
            format,
            nextents: 0,
            data_fork: Vec::new(),
            forkoff: 0,
            aformat: 2,
            anextents: 0,
            attr_fork: Vec::new(),
            nlink: 1,
            uid: 1000,
            gid: 1000,
        }
    }

    pub fn dir_local(fork: Vec<u8>) -> Self {
        let size = fork.len() as i64;
        Self {
            data_fork: fork,
            nlink: 2,
            ..Self::base(0o040755, size, 1)
        }
    }

    pub fn dir_extents(size: i64, extents: &[(u64, u64, u64)]) -> Self {
        Self {
            nextents: extents.len() as u32,
            data_fork: extent_fork(extents),
            nlink: 2,
            ..Self::base(0o040755, size, 2)
        }
    }

    pub fn file_extents(size: i64, extents: &[(u64, u64, u64)]) -> Self {
        Self {
            nextents: extents.len() as u32,
            data_fork: extent_fork(extents),
            ..Self::base(0o100644, size, 2)
        }
    }

    pub fn symlink_local(target: &[u8]) -> Self {
        Self {
            data_fork: target.to_vec(),
            ..Self::base(0o120777, target.len() as i64, 1)
        }
    }

    pub fn symlink_extents(target_len: i64, extents: &[(u64, u64, u64)]) -> Self {
        Self {
            nextents: extents.len() as u32,
            data_fork: extent_fork(extents),
            ..Self::base(0o120777, target_len, 2)
        }
    }

    /// Attaches a short-form attribute fork at the given 8-byte fork
    /// offset.
    pub fn with_local_attrs(mut self, forkoff: u8, fork: Vec<u8>) -> Self {
        self.forkoff = forkoff;
        self.aformat = 1;
        self.attr_fork = fork;
        self
    }

    /// Attaches an extent-mapped attribute fork.
    pub fn with_extent_attrs(mut self, forkoff: u8, extents: &[(u64, u64, u64)]) -> Self {
        self.forkoff = forkoff;
        self.aformat = 2;
        self.anextents = extents.len() as u16;
        self.attr_fork = extent_fork(extents);
        self
    }
}

pub struct ImageBuilder {
    pub data: Vec<u8>,
    pub v5: bool,
}

impl ImageBuilder {
    pub fn new(v5: bool) -> Self {
        let mut builder = Self {
            data: vec![0u8; AG_BLOCKS as usize * BLOCK_SIZE],
            v5,
        };
        builder.write_superblock();
        builder
    }

    fn put_u16(&mut self, at: usize, value: u16) {
        self.data[at..at + 2].copy_from_slice(&value.to_be_bytes());
    }

    fn put_u32(&mut self, at: usize, value: u32) {
        self.data[at..at + 4].copy_from_slice(&value.to_be_bytes());
    }

    fn put_u64(&mut self, at: usize, value: u64) {
        self.data[at..at + 8].copy_from_slice(&value.to_be_bytes());
    }

    fn write_superblock(&mut self) {
        self.put_u32(0, 0x5846_5342); // XFSB
        self.put_u32(4, BLOCK_SIZE as u32);
        self.put_u64(8, u64::from(AG_BLOCKS)); // dblocks
        self.data[32..48].copy_from_slice(&FIXTURE_UUID);
        self.put_u64(56, ROOT_INO);
        self.put_u32(84, AG_BLOCKS);
        self.put_u32(88, 1); // agcount

        let versionnum: u16 = if self.v5 {
            5 | 0x0020 | 0x1000 | 0x2000
        } else {
            4 | 0x0020 | 0x1000 | 0x2000 | 0x8000
        };
        self.put_u16(100, versionnum);
        self.put_u16(102, 512); // sectsize
        self.put_u16(104, INODE_SIZE as u16);
        self.put_u16(106, (BLOCK_SIZE / INODE_SIZE) as u16);
        self.data[108..117].copy_from_slice(b"fzxfstest");
        self.data[120] = 12; // blocklog
        self.data[121] = 9; // sectlog
        self.data[122] = 9; // inodelog
        self.data[123] = INOPBLOG;
        self.data[124] = AG_BLK_LOG;
        self.data[127] = 25; // imax_pct
        self.put_u64(128, 64); // icount

        if self.v5 {
            self.put_u32(216, 0x1); // incompat: ftype
        } else {
            // morebits features2: ftype | attr2
            self.put_u32(200, 0x0200 | 0x0008);
            self.put_u32(204, 0x0200 | 0x0008);
        }

        if self.v5 {
            let crc = crc_with_hole(&self.data[..512], 224);
            self.put_u32(224, crc);
        }
    }

    /// Absolute byte offset of an inode record.
    pub fn inode_offset(&self, ino: u64) -> usize {
        let block = ino >> INOPBLOG;
        let index = ino & ((1 << INOPBLOG) - 1);

        block as usize * BLOCK_SIZE + index as usize * INODE_SIZE
    }

    pub fn write_inode(&mut self, ino: u64, spec: &InodeSpec) {
        let at = self.inode_offset(ino);
        let version: u8 = if self.v5 { 3 } else { 2 };
        let core_size: usize = if self.v5 { 176 } else { 96 };

        self.data[at..at + INODE_SIZE].fill(0);
        self.data[at..at + 2].copy_from_slice(b"IN");
        self.put_u16(at + 2, spec.mode);
        self.data[at + 4] = version;
        self.data[at + 5] = spec.format;
        self.put_u32(at + 8, spec.uid);
        self.put_u32(at + 12, spec.gid);
        self.put_u32(at + 16, spec.nlink);
        self.put_u32(at + 32, 1_600_000_000); // atime sec
        self.put_u32(at + 36, 111); // atime nsec
        self.put_u32(at + 40, 1_600_000_100);
        self.put_u32(at + 44, 222);
        self.put_u32(at + 48, 1_600_000_200);
        self.put_u32(at + 52, 333);
        self.put_u64(at + 56, spec.size as u64);
        self.put_u32(at + 76, spec.nextents);
        self.put_u16(at + 80, spec.anextents);
        self.data[at + 82] = spec.forkoff;
        self.data[at + 83] = spec.aformat;
        self.put_u32(at + 92, 7); // generation

        if self.v5 {
            self.put_u32(at + 144, 1_600_000_300); // crtime sec
            self.put_u32(at + 148, 444);
            self.put_u64(at + 152, ino);
            let uuid_at = at + 160;
            self.data[uuid_at..uuid_at + 16].copy_from_slice(&FIXTURE_UUID);
        }

        let data_at = at + core_size;
        self.data[data_at..data_at + spec.data_fork.len()].copy_from_slice(&spec.data_fork);
        if spec.forkoff != 0 {
            let attr_at = data_at + usize::from(spec.forkoff) * 8;
            self.data[attr_at..attr_at + spec.attr_fork.len()]
                .copy_from_slice(&spec.attr_fork);
        }

        if self.v5 {
            let crc = crc_with_hole(&self.data[at..at + INODE_SIZE], 100);
            self.put_u32(at + 100, crc);
        }
    }

    /// Fills one filesystem block with a repeated byte.
    pub fn write_file_block(&mut self, fsblock: u64, fill: u8) {
        let at = fsblock as usize * BLOCK_SIZE;
        self.data[at..at + BLOCK_SIZE].fill(fill);
    }

    /// Writes one directory data (or single-block) block and returns the
    /// `(hash, address)` pairs of its entries, given the directory block
    /// index `db` the block will occupy in the directory's address space.
    pub fn write_dir_data_block(
        &mut self,
        fsblock: u64,
        db: u64,
        block_form: bool,
        owner: u64,
        entries: &[(&[u8], u64, u8)],
    ) -> Vec<(u32, u32)> {
        let at = fsblock as usize * BLOCK_SIZE;
        self.data[at..at + BLOCK_SIZE].fill(0);

        let magic: u32 = match (self.v5, block_form) {
            (true, true) => 0x5844_4233,  // XDB3
            (true, false) => 0x5844_4433, // XDD3
            (false, true) => 0x5844_3242, // XD2B
            (false, false) => 0x5844_3244, // XD2D
        };
        self.put_u32(at, magic);
        let header: usize = if self.v5 { 64 } else { 16 };
        if self.v5 {
            self.put_u64(at + 40, owner);
        }

        let mut pairs = Vec::new();
        let mut cursor = header;
        for &(name, ino, ftype) in entries {
            let offset = cursor;
            self.put_u64(at + cursor, ino);
            self.data[at + cursor + 8] = name.len() as u8;
            self.data[at + cursor + 9..at + cursor + 9 + name.len()].copy_from_slice(name);
            self.data[at + cursor + 9 + name.len()] = ftype;

            let fixed = 8 + 1 + name.len() + 1 + 2;
            let entry_size = (fixed + 7) & !7;
            // The tag mirrors the entry's own offset.
            self.put_u16(at + cursor + entry_size - 2, offset as u16);
            cursor += entry_size;

            let address = (db * BLOCK_SIZE as u64 + offset as u64) / 8;
            pairs.push((name_hash(name), address as u32));
        }

        let tail = if block_form {
            let tail = BLOCK_SIZE - 8 - entries.len() * 8;
            // Hash-sorted trailer plus the (count, stale) tail.
            let mut sorted = pairs.clone();
            sorted.sort_unstable();
            for (index, &(hash, address)) in sorted.iter().enumerate() {
                self.put_u32(at + tail + index * 8, hash);
                self.put_u32(at + tail + index * 8 + 4, address);
            }
            self.put_u32(at + BLOCK_SIZE - 8, entries.len() as u32);
            tail
        } else {
            BLOCK_SIZE
        };

        // Mark the unused remainder as one free region.
        if tail - cursor >= 8 {
            self.put_u16(at + cursor, 0xFFFF);
            self.put_u16(at + cursor + 2, (tail - cursor) as u16);
        }

        if self.v5 {
            let crc = crc_with_hole(&self.data[at..at + BLOCK_SIZE], 4);
            self.put_u32(at + 4, crc);
        }

        pairs
    }

    /// Writes a leaf (hash table) block. `node_form` selects the leafn
    /// magic used inside node directories.
    pub fn write_leaf_block(
        &mut self,
        fsblock: u64,
        node_form: bool,
        owner: u64,
        pairs: &mut Vec<(u32, u32)>,
    ) {
        let at = fsblock as usize * BLOCK_SIZE;
        self.data[at..at + BLOCK_SIZE].fill(0);
        pairs.sort_unstable();

        let magic: u16 = match (self.v5, node_form) {
            (true, false) => 0x3DF1,
            (true, true) => 0x3DFF,
            (false, false) => 0xD2F1,
            (false, true) => 0xD2FF,
        };
        self.put_u16(at + 8, magic);

        let (header, count_at) = if self.v5 { (64, 56) } else { (16, 12) };
        if self.v5 {
            self.put_u64(at + 48, owner);
        }
        self.put_u16(at + count_at, pairs.len() as u16);
        for (index, &(hash, address)) in pairs.iter().enumerate() {
            self.put_u32(at + header + index * 8, hash);
            self.put_u32(at + header + index * 8 + 4, address);
        }

        if self.v5 {
            let crc = crc_with_hole(&self.data[at..at + BLOCK_SIZE], 12);
            self.put_u32(at + 12, crc);
        }
    }

    /// Writes a hash-btree intermediate node whose entries are
    /// `(highest_hash_in_child, child_dir_block)` pairs.
    pub fn write_node_block(
        &mut self,
        fsblock: u64,
        owner: u64,
        level: u16,
        children: &[(u32, u32)],
    ) {
        let at = fsblock as usize * BLOCK_SIZE;
        self.data[at..at + BLOCK_SIZE].fill(0);

        let magic: u16 = if self.v5 { 0x3EBE } else { 0xFEBE };
        self.put_u16(at + 8, magic);

        let (header, count_at, level_at) = if self.v5 { (64, 56, 58) } else { (16, 12, 14) };
        if self.v5 {
            self.put_u64(at + 48, owner);
        }
        self.put_u16(at + count_at, children.len() as u16);
        self.put_u16(at + level_at, level);
        for (index, &(hash, before)) in children.iter().enumerate() {
            self.put_u32(at + header + index * 8, hash);
            self.put_u32(at + header + index * 8 + 4, before);
        }

        if self.v5 {
            let crc = crc_with_hole(&self.data[at..at + BLOCK_SIZE], 12);
            self.put_u32(at + 12, crc);
        }
    }

    /// Writes a remote symbolic-link block (v5 carries the `XSLM` header).
    pub fn write_symlink_block(&mut self, fsblock: u64, owner: u64, target: &[u8]) {
        let at = fsblock as usize * BLOCK_SIZE;
        self.data[at..at + BLOCK_SIZE].fill(0);

        if self.v5 {
            self.put_u32(at, 0x5853_4C4D); // XSLM
            self.put_u32(at + 4, 0); // offset
            self.put_u32(at + 8, target.len() as u32);
            self.data[at + 16..at + 32].copy_from_slice(&FIXTURE_UUID);
            self.put_u64(at + 32, owner);
            self.data[at + 56..at + 56 + target.len()].copy_from_slice(target);
            let crc = crc_with_hole(&self.data[at..at + BLOCK_SIZE], 12);
            self.put_u32(at + 12, crc);
        } else {
            self.data[at..at + target.len()].copy_from_slice(target);
        }
    }

    /// Writes an attribute leaf block with local and remote entries.
    /// `entries` holds `(name, flags, value)`; values of remote entries
    /// are `(value_block, value_len)` references instead of bytes.
    pub fn write_attr_leaf_block(
        &mut self,
        fsblock: u64,
        owner: u64,
        local: &[(&[u8], u8, &[u8])],
        remote: &[(&[u8], u8, u32, u32)],
    ) {
        let at = fsblock as usize * BLOCK_SIZE;
        self.data[at..at + BLOCK_SIZE].fill(0);

        let magic: u16 = if self.v5 { 0x3BEE } else { 0xFBEE };
        self.put_u16(at + 8, magic);
        let (header, count_at) = if self.v5 { (80, 56) } else { (32, 12) };
        if self.v5 {
            self.put_u64(at + 48, owner);
        }

        let count = local.len() + remote.len();
        self.put_u16(at + count_at, count as u16);

        // Name structures grow down from the end of the block.
        let mut name_cursor = BLOCK_SIZE;
        let mut table = Vec::new();
        for &(name, flags, value) in local {
            let need = 3 + name.len() + value.len();
            name_cursor -= (need + 3) & !3;
            let name_at = at + name_cursor;
            self.put_u16(name_at, value.len() as u16);
            self.data[name_at + 2] = name.len() as u8;
            self.data[name_at + 3..name_at + 3 + name.len()].copy_from_slice(name);
            self.data[name_at + 3 + name.len()..name_at + 3 + name.len() + value.len()]
                .copy_from_slice(value);
            table.push((name_hash(name), name_cursor as u16, flags | 0x01));
        }
        for &(name, flags, value_block, value_len) in remote {
            let need = 9 + name.len();
            name_cursor -= (need + 3) & !3;
            let name_at = at + name_cursor;
            self.put_u32(name_at, value_block);
            self.put_u32(name_at + 4, value_len);
            self.data[name_at + 8] = name.len() as u8;
            self.data[name_at + 9..name_at + 9 + name.len()].copy_from_slice(name);
            table.push((name_hash(name), name_cursor as u16, flags));
        }

        table.sort_unstable();
        for (index, &(hash, name_index, flags)) in table.iter().enumerate() {
            let entry_at = at + header + index * 8;
            self.put_u32(entry_at, hash);
            self.put_u16(entry_at + 4, name_index);
            self.data[entry_at + 6] = flags;
        }

        if self.v5 {
            let crc = crc_with_hole(&self.data[at..at + BLOCK_SIZE], 12);
            self.put_u32(at + 12, crc);
        }
    }

    /// Writes a remote attribute value block (v5 carries the `XARM`
    /// header).
    pub fn write_attr_remote_block(&mut self, fsblock: u64, owner: u64, value: &[u8]) {
        let at = fsblock as usize * BLOCK_SIZE;
        self.data[at..at + BLOCK_SIZE].fill(0);

        if self.v5 {
            self.put_u32(at, 0x5841_524D); // XARM
            self.put_u32(at + 4, 0);
            self.put_u32(at + 8, value.len() as u32);
            self.data[at + 16..at + 32].copy_from_slice(&FIXTURE_UUID);
            self.put_u64(at + 32, owner);
            self.data[at + 56..at + 56 + value.len()].copy_from_slice(value);
            let crc = crc_with_hole(&self.data[at..at + BLOCK_SIZE], 12);
            self.put_u32(at + 12, crc);
        } else {
            self.data[at..at + value.len()].copy_from_slice(value);
        }
    }

    pub fn into_image(self) -> Vec<u8> {
        self.data
    }
}

/// Byte source counting every read, for the bounded-lookup assertions.
pub struct CountingSource {
    image: Vec<u8>,
    pub reads: Arc<AtomicUsize>,
}

impl CountingSource {
    pub fn new(image: Vec<u8>) -> (Self, Arc<AtomicUsize>) {
        let reads = Arc::new(AtomicUsize::new(0));
        (
            Self {
                image,
                reads: Arc::clone(&reads),
            },
            reads,
        )
    }
}

impl ByteSource for CountingSource {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> CanFail<XfsError> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.image.read_at(offset, buf)
    }

    fn size(&self) -> u64 {
        self.image.len() as u64
    }
}
