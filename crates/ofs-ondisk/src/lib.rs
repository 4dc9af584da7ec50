#![forbid(unsafe_code)]
//! On-disk structures for OublieFS.
//!
//! Pure parsing and serialization, no I/O. Every function works on byte
//! slices the caller has already fetched; the volume layer decides which
//! blocks to read and write.
//!
//! Layout, in block order:
//!
//! | Range | Contents |
//! |-------|----------|
//! | 0 | superblock |
//! | `1 ..= nr_istore_blocks` | inode store, `INODES_PER_BLOCK` records per block |
//! | next `nr_ifree_blocks` | inode-free bitmap (bit set = free) |
//! | next `nr_bfree_blocks` | block-free bitmap (bit set = free) |
//! | rest | data and index blocks |

use ofs_types::{
    BITS_PER_BLOCK, BLOCK_SIZE, BlockNumber, INDEX_ENTRIES_PER_BLOCK, INODES_PER_BLOCK, OFS_MAGIC,
    ParseError, is_directory, is_regular, read_le_u32, write_le_u32,
};
use serde::{Deserialize, Serialize};

// ── Superblock ──────────────────────────────────────────────────────────────

/// Superblock field offsets (all fields little-endian u32).
const SB_MAGIC: usize = 0x00;
const SB_NR_BLOCKS: usize = 0x04;
const SB_NR_INODES: usize = 0x08;
const SB_NR_ISTORE_BLOCKS: usize = 0x0C;
const SB_NR_IFREE_BLOCKS: usize = 0x10;
const SB_NR_BFREE_BLOCKS: usize = 0x14;
const SB_NR_FREE_INODES: usize = 0x18;
const SB_NR_FREE_BLOCKS: usize = 0x1C;

/// In-memory superblock. Free counts change on every allocation; the rest is
/// fixed at mkfs time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub nr_blocks: u32,
    pub nr_inodes: u32,
    pub nr_istore_blocks: u32,
    pub nr_ifree_blocks: u32,
    pub nr_bfree_blocks: u32,
    pub nr_free_inodes: u32,
    pub nr_free_blocks: u32,
}

impl Superblock {
    /// Parse a superblock from block 0, rejecting a wrong magic.
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        let magic = read_le_u32(bytes, SB_MAGIC)?;
        if magic != OFS_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: OFS_MAGIC,
                actual: magic,
            });
        }

        Ok(Self {
            nr_blocks: read_le_u32(bytes, SB_NR_BLOCKS)?,
            nr_inodes: read_le_u32(bytes, SB_NR_INODES)?,
            nr_istore_blocks: read_le_u32(bytes, SB_NR_ISTORE_BLOCKS)?,
            nr_ifree_blocks: read_le_u32(bytes, SB_NR_IFREE_BLOCKS)?,
            nr_bfree_blocks: read_le_u32(bytes, SB_NR_BFREE_BLOCKS)?,
            nr_free_inodes: read_le_u32(bytes, SB_NR_FREE_INODES)?,
            nr_free_blocks: read_le_u32(bytes, SB_NR_FREE_BLOCKS)?,
        })
    }

    /// Serialize into the leading bytes of a block-sized buffer.
    pub fn write_to_bytes(&self, bytes: &mut [u8]) -> Result<(), ParseError> {
        write_le_u32(bytes, SB_MAGIC, OFS_MAGIC)?;
        write_le_u32(bytes, SB_NR_BLOCKS, self.nr_blocks)?;
        write_le_u32(bytes, SB_NR_INODES, self.nr_inodes)?;
        write_le_u32(bytes, SB_NR_ISTORE_BLOCKS, self.nr_istore_blocks)?;
        write_le_u32(bytes, SB_NR_IFREE_BLOCKS, self.nr_ifree_blocks)?;
        write_le_u32(bytes, SB_NR_BFREE_BLOCKS, self.nr_bfree_blocks)?;
        write_le_u32(bytes, SB_NR_FREE_INODES, self.nr_free_inodes)?;
        write_le_u32(bytes, SB_NR_FREE_BLOCKS, self.nr_free_blocks)?;
        Ok(())
    }

    /// Compute mkfs geometry for a device of `nr_blocks` blocks.
    ///
    /// One inode per block, store and bitmap sizes by ceiling division, one
    /// inode (the root) and one data block (the root's index block) already
    /// consumed.
    pub fn for_device(nr_blocks: u32) -> Result<Self, ParseError> {
        let nr_inodes = nr_blocks;
        let nr_istore_blocks = nr_inodes.div_ceil(INODES_PER_BLOCK);
        let nr_ifree_blocks = nr_inodes.div_ceil(BITS_PER_BLOCK);
        let nr_bfree_blocks = nr_blocks.div_ceil(BITS_PER_BLOCK);
        let overhead = 1 + nr_istore_blocks + nr_ifree_blocks + nr_bfree_blocks;

        // Need the overhead blocks, the root's index block, and at least one
        // block a first file could claim.
        if nr_blocks < overhead + 2 {
            return Err(ParseError::InvalidField {
                field: "nr_blocks",
                reason: "device too small for filesystem overhead",
            });
        }
        let nr_data_blocks = nr_blocks - overhead;

        Ok(Self {
            nr_blocks,
            nr_inodes,
            nr_istore_blocks,
            nr_ifree_blocks,
            nr_bfree_blocks,
            nr_free_inodes: nr_inodes - 1,
            nr_free_blocks: nr_data_blocks - 1,
        })
    }

    /// Check the fixed geometry against itself and the device size.
    ///
    /// Free counts are live state and only bounded here, not recomputed.
    pub fn validate_geometry(&self, device_blocks: u64) -> Result<(), ParseError> {
        if u64::from(self.nr_blocks) > device_blocks {
            return Err(ParseError::InvalidField {
                field: "nr_blocks",
                reason: "exceeds device size",
            });
        }
        if self.nr_istore_blocks < self.nr_inodes.div_ceil(INODES_PER_BLOCK) {
            return Err(ParseError::InvalidField {
                field: "nr_istore_blocks",
                reason: "inode store too small for nr_inodes",
            });
        }
        if self.nr_ifree_blocks < self.nr_inodes.div_ceil(BITS_PER_BLOCK) {
            return Err(ParseError::InvalidField {
                field: "nr_ifree_blocks",
                reason: "inode bitmap too small for nr_inodes",
            });
        }
        if self.nr_bfree_blocks < self.nr_blocks.div_ceil(BITS_PER_BLOCK) {
            return Err(ParseError::InvalidField {
                field: "nr_bfree_blocks",
                reason: "block bitmap too small for nr_blocks",
            });
        }
        if self.data_start().0 >= self.nr_blocks {
            return Err(ParseError::InvalidField {
                field: "nr_blocks",
                reason: "no data blocks after filesystem overhead",
            });
        }
        if self.nr_free_inodes > self.nr_inodes {
            return Err(ParseError::InvalidField {
                field: "nr_free_inodes",
                reason: "exceeds nr_inodes",
            });
        }
        if self.nr_free_blocks > self.nr_blocks {
            return Err(ParseError::InvalidField {
                field: "nr_free_blocks",
                reason: "exceeds nr_blocks",
            });
        }
        Ok(())
    }

    /// First inode-store block.
    #[must_use]
    pub fn istore_start(&self) -> BlockNumber {
        BlockNumber(1)
    }

    /// First inode-free bitmap block.
    #[must_use]
    pub fn ifree_start(&self) -> BlockNumber {
        BlockNumber(1 + self.nr_istore_blocks)
    }

    /// First block-free bitmap block.
    #[must_use]
    pub fn bfree_start(&self) -> BlockNumber {
        BlockNumber(1 + self.nr_istore_blocks + self.nr_ifree_blocks)
    }

    /// First data block.
    #[must_use]
    pub fn data_start(&self) -> BlockNumber {
        BlockNumber(1 + self.nr_istore_blocks + self.nr_ifree_blocks + self.nr_bfree_blocks)
    }
}

// ── Inode records ───────────────────────────────────────────────────────────

/// Inode record field offsets within its 40-byte slot.
const INO_MODE: usize = 0x00;
const INO_UID: usize = 0x04;
const INO_GID: usize = 0x08;
const INO_SIZE: usize = 0x0C;
const INO_CTIME: usize = 0x10;
const INO_ATIME: usize = 0x14;
const INO_MTIME: usize = 0x18;
const INO_BLOCKS: usize = 0x1C;
const INO_NLINK: usize = 0x20;
const INO_INDEX_BLOCK: usize = 0x24;

/// One on-disk inode record.
///
/// `blocks` counts the index block itself plus allocated data blocks.
/// A record of all zeroes is a free inode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskInode {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u32,
    pub ctime: u32,
    pub atime: u32,
    pub mtime: u32,
    pub blocks: u32,
    pub nlink: u32,
    pub index_block: u32,
}

impl DiskInode {
    /// Parse a record from its 40-byte slot.
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            mode: read_le_u32(bytes, INO_MODE)?,
            uid: read_le_u32(bytes, INO_UID)?,
            gid: read_le_u32(bytes, INO_GID)?,
            size: read_le_u32(bytes, INO_SIZE)?,
            ctime: read_le_u32(bytes, INO_CTIME)?,
            atime: read_le_u32(bytes, INO_ATIME)?,
            mtime: read_le_u32(bytes, INO_MTIME)?,
            blocks: read_le_u32(bytes, INO_BLOCKS)?,
            nlink: read_le_u32(bytes, INO_NLINK)?,
            index_block: read_le_u32(bytes, INO_INDEX_BLOCK)?,
        })
    }

    /// Serialize into a 40-byte slot.
    pub fn write_to_bytes(&self, bytes: &mut [u8]) -> Result<(), ParseError> {
        write_le_u32(bytes, INO_MODE, self.mode)?;
        write_le_u32(bytes, INO_UID, self.uid)?;
        write_le_u32(bytes, INO_GID, self.gid)?;
        write_le_u32(bytes, INO_SIZE, self.size)?;
        write_le_u32(bytes, INO_CTIME, self.ctime)?;
        write_le_u32(bytes, INO_ATIME, self.atime)?;
        write_le_u32(bytes, INO_MTIME, self.mtime)?;
        write_le_u32(bytes, INO_BLOCKS, self.blocks)?;
        write_le_u32(bytes, INO_NLINK, self.nlink)?;
        write_le_u32(bytes, INO_INDEX_BLOCK, self.index_block)?;
        Ok(())
    }

    /// Free-inode predicate: a record with every field zero.
    #[must_use]
    pub fn is_free(&self) -> bool {
        *self == Self::default()
    }

    #[must_use]
    pub fn is_directory(&self) -> bool {
        is_directory(self.mode)
    }

    #[must_use]
    pub fn is_regular(&self) -> bool {
        is_regular(self.mode)
    }
}

// ── File index blocks ───────────────────────────────────────────────────────

/// Read one slot of a file's index block. Slot 0 holds the first data block;
/// zero means a hole.
pub fn index_block_slot(bytes: &[u8], slot: usize) -> Result<u32, ParseError> {
    if slot >= INDEX_ENTRIES_PER_BLOCK {
        return Err(ParseError::InvalidField {
            field: "slot",
            reason: "past index block capacity",
        });
    }
    read_le_u32(bytes, slot * 4)
}

/// Store a data block number in one slot of a file's index block.
pub fn set_index_block_slot(bytes: &mut [u8], slot: usize, value: u32) -> Result<(), ParseError> {
    if slot >= INDEX_ENTRIES_PER_BLOCK {
        return Err(ParseError::InvalidField {
            field: "slot",
            reason: "past index block capacity",
        });
    }
    write_le_u32(bytes, slot * 4, value)
}
