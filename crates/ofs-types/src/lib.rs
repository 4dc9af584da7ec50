#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ── On-disk geometry ────────────────────────────────────────────────────────

/// Superblock magic, little-endian "FLBO" on disk.
pub const OFS_MAGIC: u32 = 0x4F42_4C46;

/// Fixed block size; every on-disk structure occupies exactly one block.
pub const BLOCK_SIZE: u32 = 4096;

/// Maximum filename length, excluding any terminator. Names are stored
/// NUL-padded in fixed slots.
pub const FILENAME_LEN: usize = 28;

/// One directory entry: 4-byte inode number followed by the padded name.
pub const DIR_ENTRY_SIZE: usize = 4 + FILENAME_LEN;

/// Directory capacity. 128 entries of 32 bytes fill one block exactly.
pub const MAX_SUBFILES: usize = 128;

/// Packed on-disk inode record size in bytes (ten u32 fields).
pub const INODE_RECORD_SIZE: usize = 40;

/// Inode records per inode-store block (the block tail is unused padding).
pub const INODES_PER_BLOCK: u32 = BLOCK_SIZE / INODE_RECORD_SIZE as u32;

/// Slots in a file's index block (u32 data block numbers).
pub const INDEX_ENTRIES_PER_BLOCK: usize = BLOCK_SIZE as usize / 4;

/// Largest representable file. `blocks` counts the index block itself, so a
/// file spans at most `INDEX_ENTRIES_PER_BLOCK - 1` data blocks.
pub const MAX_FILE_SIZE: u64 = (INDEX_ENTRIES_PER_BLOCK as u64 - 1) * BLOCK_SIZE as u64;

/// Bitmap bits held by a single block.
pub const BITS_PER_BLOCK: u32 = BLOCK_SIZE * 8;

// ── POSIX file mode constants ───────────────────────────────────────────────

/// File type mask (upper 4 bits of mode).
pub const S_IFMT: u32 = 0o170_000;
/// Directory.
pub const S_IFDIR: u32 = 0o040_000;
/// Regular file.
pub const S_IFREG: u32 = 0o100_000;

#[must_use]
pub fn is_directory(mode: u32) -> bool {
    mode & S_IFMT == S_IFDIR
}

#[must_use]
pub fn is_regular(mode: u32) -> bool {
    mode & S_IFMT == S_IFREG
}

/// Only regular files and directories exist in this filesystem.
#[must_use]
pub fn is_supported_mode(mode: u32) -> bool {
    is_directory(mode) || is_regular(mode)
}

// ── Identifier newtypes ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u32);

/// Byte offset on a `ByteDevice` (pread/pwrite semantics).
///
/// Unit-carrying wrapper to prevent mixing bytes and blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteOffset(pub u64);

impl BlockNumber {
    /// Byte offset of this block's first byte. Cannot overflow: a u32 block
    /// number times the block size fits in 44 bits.
    #[must_use]
    pub fn to_byte_offset(self) -> ByteOffset {
        ByteOffset(u64::from(self.0) * u64::from(BLOCK_SIZE))
    }
}

impl InodeNumber {
    /// The root directory occupies inode 0.
    pub const ROOT: Self = Self(0);
}

impl ByteOffset {
    /// Add a byte count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }

    /// Narrow to `usize`, returning `ParseError::IntegerConversion` on overflow.
    pub fn to_usize(self) -> Result<usize, ParseError> {
        usize::try_from(self.0).map_err(|_| ParseError::IntegerConversion {
            field: "byte_offset",
        })
    }
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ByteOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Inode store addressing ──────────────────────────────────────────────────

/// Block of the inode store holding `ino`. The store starts right after the
/// superblock, so block 1 holds inodes `0..INODES_PER_BLOCK`.
#[must_use]
pub fn inode_store_block(ino: InodeNumber) -> BlockNumber {
    BlockNumber(ino.0 / INODES_PER_BLOCK + 1)
}

/// Byte offset of `ino`'s record within its inode-store block.
#[must_use]
pub fn inode_offset_in_block(ino: InodeNumber) -> usize {
    (ino.0 % INODES_PER_BLOCK) as usize * INODE_RECORD_SIZE
}

// ── Byte-level parse helpers ────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u32, actual: u32 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn ensure_slice_mut(
    data: &mut [u8],
    offset: usize,
    len: usize,
) -> Result<&mut [u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&mut data[offset..end])
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    let bytes = ensure_slice_mut(data, offset, 4)?;
    bytes.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

#[inline]
pub fn write_bytes(data: &mut [u8], offset: usize, src: &[u8]) -> Result<(), ParseError> {
    let bytes = ensure_slice_mut(data, offset, src.len())?;
    bytes.copy_from_slice(src);
    Ok(())
}

/// Decode a NUL-padded fixed-width name field.
#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry_is_self_consistent() {
        assert_eq!(DIR_ENTRY_SIZE * MAX_SUBFILES, BLOCK_SIZE as usize);
        assert_eq!(INODES_PER_BLOCK, 102);
        assert_eq!(INDEX_ENTRIES_PER_BLOCK, 1024);
        assert_eq!(MAX_FILE_SIZE, 1023 * 4096);
        assert_eq!(BITS_PER_BLOCK, 32_768);
    }

    #[test]
    fn test_read_write_helpers_round_trip() {
        let mut buf = [0_u8; 12];
        write_le_u32(&mut buf, 0, 0x1234_5678).expect("write");
        write_le_u32(&mut buf, 8, 0x90AB_CDEF).expect("write");
        assert_eq!(read_le_u32(&buf, 0).expect("read"), 0x1234_5678);
        assert_eq!(read_le_u32(&buf, 4).expect("read"), 0, "untouched middle");
        assert_eq!(read_le_u32(&buf, 8).expect("read"), 0x90AB_CDEF);
    }

    #[test]
    fn test_read_out_of_bounds_reports_offset() {
        let buf = [0_u8; 6];
        let err = read_le_u32(&buf, 4).expect_err("oob");
        assert_eq!(
            err,
            ParseError::InsufficientData {
                needed: 4,
                offset: 4,
                actual: 2
            }
        );
    }

    #[test]
    fn test_write_out_of_bounds_rejected() {
        let mut buf = [0_u8; 6];
        assert!(write_le_u32(&mut buf, 4, 1).is_err());
        assert!(write_bytes(&mut buf, 5, &[1, 2]).is_err());
    }

    #[test]
    fn test_trim_nul_padded() {
        assert_eq!(trim_nul_padded(b"notes.txt\0\0\0"), "notes.txt");
        assert_eq!(trim_nul_padded(b"full-width-name"), "full-width-name");
        assert_eq!(trim_nul_padded(b"\0\0\0"), "");
    }

    #[test]
    fn test_mode_helpers() {
        assert!(is_directory(S_IFDIR | 0o755));
        assert!(!is_directory(S_IFREG | 0o644));
        assert!(is_regular(S_IFREG | 0o644));
        assert!(is_supported_mode(S_IFDIR | 0o700));
        assert!(is_supported_mode(S_IFREG));
        assert!(!is_supported_mode(0o120_000)); // symlink
        assert!(!is_supported_mode(0));
    }

    #[test]
    fn test_inode_store_addressing() {
        assert_eq!(inode_store_block(InodeNumber(0)), BlockNumber(1));
        assert_eq!(inode_offset_in_block(InodeNumber(0)), 0);
        assert_eq!(inode_store_block(InodeNumber(101)), BlockNumber(1));
        assert_eq!(inode_offset_in_block(InodeNumber(101)), 101 * 40);
        assert_eq!(inode_store_block(InodeNumber(102)), BlockNumber(2));
        assert_eq!(inode_offset_in_block(InodeNumber(102)), 0);
    }

    #[test]
    fn test_block_to_byte_offset() {
        assert_eq!(BlockNumber(0).to_byte_offset(), ByteOffset(0));
        assert_eq!(BlockNumber(3).to_byte_offset(), ByteOffset(3 * 4096));
        assert_eq!(
            BlockNumber(u32::MAX).to_byte_offset(),
            ByteOffset(u64::from(u32::MAX) * 4096)
        );
    }
}
