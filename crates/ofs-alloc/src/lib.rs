#![forbid(unsafe_code)]
//! Inode and block allocation over the on-disk free maps.
//!
//! Polarity follows the on-disk format: a set bit marks a FREE object, a
//! cleared bit a used one. Scans always start at bit zero, so freed slots
//! are reused lowest-first.
//!
//! The [`Allocator`] holds both maps and the superblock in memory and
//! writes back the touched map block plus the superblock on every state
//! change. Write-backs are not retried; after a failed one the in-memory
//! state is ahead of the device and the volume must stop accepting writes.
//! The worst case is leaked free space, never a doubly handed-out object.

use ofs_block::BlockDevice;
use ofs_error::{OfsError, Result};
use ofs_ondisk::Superblock;
use ofs_types::{BITS_PER_BLOCK, BLOCK_SIZE, BlockNumber, InodeNumber};

// ── Free-map operations ─────────────────────────────────────────────────────

/// Get bit `idx` from a free-map byte slice. A set bit means free.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx >= bitmap.len() {
        return false;
    }
    (bitmap[byte_idx] >> bit_idx) & 1 == 1
}

/// Set bit `idx` in a free-map byte slice, marking the object free.
pub fn bitmap_set(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] |= 1 << bit_idx;
    }
}

/// Clear bit `idx` in a free-map byte slice, marking the object used.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] &= !(1 << bit_idx);
    }
}

/// Count free (set) bits among the first `count` bits of `bitmap`.
#[must_use]
pub fn bitmap_count_free(bitmap: &[u8], count: u32) -> u32 {
    let full_bytes = (count / 8) as usize;
    let remainder = count % 8;
    let mut free = 0u32;

    for &byte in bitmap.iter().take(full_bytes) {
        free += byte.count_ones();
    }

    if remainder > 0 && full_bytes < bitmap.len() {
        let byte = bitmap[full_bytes];
        for bit in 0..remainder {
            if (byte >> bit) & 1 == 1 {
                free += 1;
            }
        }
    }

    free
}

/// Find the first free (set) bit among the first `count` bits of `bitmap`.
#[must_use]
pub fn bitmap_find_free(bitmap: &[u8], count: u32) -> Option<u32> {
    (0..count).find(|&idx| bitmap_get(bitmap, idx))
}

// ── Allocator ───────────────────────────────────────────────────────────────

/// In-memory allocation state: the superblock free counts plus both free
/// maps, loaded once at mount and written through on every change.
#[derive(Debug, Clone)]
pub struct Allocator {
    sb: Superblock,
    ifree: Vec<u8>,
    bfree: Vec<u8>,
}

impl Allocator {
    /// Load both free maps from a device whose superblock is already parsed.
    pub fn load(dev: &dyn BlockDevice, sb: Superblock) -> Result<Self> {
        let ifree = read_map(dev, sb.ifree_start(), sb.nr_ifree_blocks)?;
        let bfree = read_map(dev, sb.bfree_start(), sb.nr_bfree_blocks)?;
        Ok(Self { sb, ifree, bfree })
    }

    /// Build the freshly formatted state for `sb`.
    ///
    /// Inode 0 (the root directory) and every block up to and including the
    /// root's index block at `data_start` start out used; the rest is free.
    /// Nothing is written; call [`Allocator::flush`] to persist.
    #[must_use]
    pub fn formatted(sb: Superblock) -> Self {
        let mut ifree = vec![0_u8; sb.nr_ifree_blocks as usize * BLOCK_SIZE as usize];
        for ino in 1..sb.nr_inodes {
            bitmap_set(&mut ifree, ino);
        }

        let mut bfree = vec![0_u8; sb.nr_bfree_blocks as usize * BLOCK_SIZE as usize];
        for block in sb.data_start().0 + 1..sb.nr_blocks {
            bitmap_set(&mut bfree, block);
        }

        Self { sb, ifree, bfree }
    }

    /// Current superblock, including live free counts.
    #[must_use]
    pub fn superblock(&self) -> &Superblock {
        &self.sb
    }

    /// Allocate the lowest-numbered free inode.
    ///
    /// A zero free count fails fast with `NoSpace` before any scan. A
    /// positive count with no free bit in the map is an on-disk
    /// inconsistency and reports `Corruption`.
    pub fn allocate_inode(&mut self, dev: &dyn BlockDevice) -> Result<InodeNumber> {
        if self.sb.nr_free_inodes == 0 {
            return Err(OfsError::NoSpace);
        }
        let Some(bit) = bitmap_find_free(&self.ifree, self.sb.nr_inodes) else {
            return Err(OfsError::Corruption {
                block: u64::from(self.sb.ifree_start().0),
                detail: format!(
                    "superblock counts {} free inodes but the map has none",
                    self.sb.nr_free_inodes
                ),
            });
        };

        bitmap_clear(&mut self.ifree, bit);
        self.sb.nr_free_inodes -= 1;
        write_map_block(dev, &self.ifree, self.sb.ifree_start(), bit)?;
        self.write_superblock(dev)?;
        Ok(InodeNumber(bit))
    }

    /// Return an inode to the free map.
    pub fn free_inode(&mut self, dev: &dyn BlockDevice, ino: InodeNumber) -> Result<()> {
        if ino.0 >= self.sb.nr_inodes {
            return Err(OfsError::Corruption {
                block: u64::from(self.sb.ifree_start().0),
                detail: format!("free_inode: inode {ino} out of range"),
            });
        }
        if bitmap_get(&self.ifree, ino.0) {
            return Err(OfsError::Corruption {
                block: u64::from(map_block(self.sb.ifree_start(), ino.0).0),
                detail: format!("double free: inode {ino} already free"),
            });
        }

        bitmap_set(&mut self.ifree, ino.0);
        self.sb.nr_free_inodes += 1;
        write_map_block(dev, &self.ifree, self.sb.ifree_start(), ino.0)?;
        self.write_superblock(dev)
    }

    /// Allocate the lowest-numbered free block.
    ///
    /// Metadata blocks are permanently cleared in the map, so the result is
    /// always at or past `data_start`.
    pub fn allocate_block(&mut self, dev: &dyn BlockDevice) -> Result<BlockNumber> {
        if self.sb.nr_free_blocks == 0 {
            return Err(OfsError::NoSpace);
        }
        let Some(bit) = bitmap_find_free(&self.bfree, self.sb.nr_blocks) else {
            return Err(OfsError::Corruption {
                block: u64::from(self.sb.bfree_start().0),
                detail: format!(
                    "superblock counts {} free blocks but the map has none",
                    self.sb.nr_free_blocks
                ),
            });
        };

        bitmap_clear(&mut self.bfree, bit);
        self.sb.nr_free_blocks -= 1;
        write_map_block(dev, &self.bfree, self.sb.bfree_start(), bit)?;
        self.write_superblock(dev)?;
        Ok(BlockNumber(bit))
    }

    /// Return a data block to the free map.
    ///
    /// Rejects blocks inside the metadata region; callers never hand those
    /// out, so seeing one means the caller's metadata was corrupt.
    pub fn free_block(&mut self, dev: &dyn BlockDevice, block: BlockNumber) -> Result<()> {
        if block.0 >= self.sb.nr_blocks {
            return Err(OfsError::Corruption {
                block: u64::from(block.0),
                detail: "free_block: block out of range".to_owned(),
            });
        }
        if block.0 < self.sb.data_start().0 {
            return Err(OfsError::Corruption {
                block: u64::from(block.0),
                detail: "free_block: would free a metadata block".to_owned(),
            });
        }
        if bitmap_get(&self.bfree, block.0) {
            return Err(OfsError::Corruption {
                block: u64::from(map_block(self.sb.bfree_start(), block.0).0),
                detail: format!("double free: block {block} already free"),
            });
        }

        bitmap_set(&mut self.bfree, block.0);
        self.sb.nr_free_blocks += 1;
        write_map_block(dev, &self.bfree, self.sb.bfree_start(), block.0)?;
        self.write_superblock(dev)
    }

    /// Write both full maps and the superblock.
    pub fn flush(&self, dev: &dyn BlockDevice) -> Result<()> {
        write_map(dev, &self.ifree, self.sb.ifree_start(), self.sb.nr_ifree_blocks)?;
        write_map(dev, &self.bfree, self.sb.bfree_start(), self.sb.nr_bfree_blocks)?;
        self.write_superblock(dev)
    }

    fn write_superblock(&self, dev: &dyn BlockDevice) -> Result<()> {
        let mut block = vec![0_u8; BLOCK_SIZE as usize];
        self.sb
            .write_to_bytes(&mut block)
            .map_err(|err| OfsError::Format(err.to_string()))?;
        dev.write_block(BlockNumber(0), &block)
    }
}

/// Map block holding `bit` within a free-map region.
fn map_block(region_start: BlockNumber, bit: u32) -> BlockNumber {
    BlockNumber(region_start.0 + bit / BITS_PER_BLOCK)
}

fn read_map(dev: &dyn BlockDevice, start: BlockNumber, nr_blocks: u32) -> Result<Vec<u8>> {
    let mut map = Vec::with_capacity(nr_blocks as usize * BLOCK_SIZE as usize);
    for i in 0..nr_blocks {
        let buf = dev.read_block(BlockNumber(start.0 + i))?;
        map.extend_from_slice(buf.as_slice());
    }
    Ok(map)
}

fn write_map(dev: &dyn BlockDevice, map: &[u8], start: BlockNumber, nr_blocks: u32) -> Result<()> {
    for i in 0..nr_blocks {
        let byte = i as usize * BLOCK_SIZE as usize;
        dev.write_block(BlockNumber(start.0 + i), &map[byte..byte + BLOCK_SIZE as usize])?;
    }
    Ok(())
}

/// Write only the map block whose bit changed.
fn write_map_block(
    dev: &dyn BlockDevice,
    map: &[u8],
    region_start: BlockNumber,
    bit: u32,
) -> Result<()> {
    let byte = (bit / BITS_PER_BLOCK) as usize * BLOCK_SIZE as usize;
    dev.write_block(
        map_block(region_start, bit),
        &map[byte..byte + BLOCK_SIZE as usize],
    )
}

// ── Tests ───────────────────────────────────────────────────────────────────
