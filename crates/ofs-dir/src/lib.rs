#![forbid(unsafe_code)]
//! Directory block operations.
//!
//! A directory's content is one index block holding a fixed table of
//! 32-byte entries: a little-endian inode number followed by a NUL-padded
//! name. Live entries stay packed from slot 0, so the first zero inode
//! word ends every scan. Inode 0 is the root directory and never appears
//! as a child; a zero word always means a free slot.
//!
//! Everything here works on a single block's bytes. Callers own block I/O,
//! locking, and inode bookkeeping.

use ofs_error::{OfsError, Result};
use ofs_types::{
    DIR_ENTRY_SIZE, FILENAME_LEN, InodeNumber, MAX_SUBFILES, ensure_slice, ensure_slice_mut,
    read_le_u32, trim_nul_padded, write_le_u32,
};
use serde::{Deserialize, Serialize};

/// One live directory entry, decoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub ino: InodeNumber,
    pub name: String,
}

/// Check a name against the on-disk entry format.
///
/// Names are raw bytes to the format; the string interface exists for
/// callers. `/` and NUL are rejected because one is the path separator and
/// the other is the slot padding byte.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(OfsError::InvalidArgument("empty file name".to_owned()));
    }
    if name == "." || name == ".." {
        return Err(OfsError::InvalidArgument(format!("reserved name: {name}")));
    }
    if name.bytes().any(|b| b == b'/' || b == 0) {
        return Err(OfsError::InvalidArgument(format!(
            "name contains '/' or NUL: {name:?}"
        )));
    }
    if name.len() > FILENAME_LEN {
        return Err(OfsError::NameTooLong);
    }
    Ok(())
}

/// Look up a name. `Ok(None)` when absent; the scan stops at the first
/// zero slot.
pub fn find_entry(block: &[u8], name: &str) -> Result<Option<InodeNumber>> {
    validate_name(name)?;
    for slot in 0..MAX_SUBFILES {
        let ino = entry_ino(block, slot)?;
        if ino == 0 {
            return Ok(None);
        }
        if slot_matches(block, slot, name)? {
            return Ok(Some(InodeNumber(ino)));
        }
    }
    Ok(None)
}

/// Name currently pointing at `ino`, if any.
pub fn find_name_by_ino(block: &[u8], ino: InodeNumber) -> Result<Option<String>> {
    for slot in 0..MAX_SUBFILES {
        let entry = entry_ino(block, slot)?;
        if entry == 0 {
            return Ok(None);
        }
        if entry == ino.0 {
            return Ok(Some(trim_nul_padded(entry_name_bytes(block, slot)?)));
        }
    }
    Ok(None)
}

/// Insert `(ino, name)` into the first free slot.
///
/// Does not check for duplicate names; callers decide whether a collision
/// is an error. A full table is `TooManyEntries`; the caller may run
/// eviction and retry, insertion itself never does.
pub fn insert_entry(block: &mut [u8], name: &str, ino: InodeNumber) -> Result<()> {
    validate_name(name)?;
    for slot in 0..MAX_SUBFILES {
        if entry_ino(block, slot)? == 0 {
            return write_slot(block, slot, ino, name);
        }
    }
    Err(OfsError::TooManyEntries)
}

/// Remove the entry pointing at `ino`, keeping the table packed: the tail
/// shifts left one slot and the vacated last slot is zeroed.
///
/// Returns `false` when no live entry references `ino`.
pub fn remove_entry_by_ino(block: &mut [u8], ino: InodeNumber) -> Result<bool> {
    let mut target = None;
    let mut live = 0;
    for slot in 0..MAX_SUBFILES {
        let entry = entry_ino(block, slot)?;
        if entry == 0 {
            break;
        }
        if entry == ino.0 && target.is_none() {
            target = Some(slot);
        }
        live += 1;
    }
    let Some(slot) = target else {
        return Ok(false);
    };

    block.copy_within((slot + 1) * DIR_ENTRY_SIZE..live * DIR_ENTRY_SIZE, slot * DIR_ENTRY_SIZE);
    block[(live - 1) * DIR_ENTRY_SIZE..live * DIR_ENTRY_SIZE].fill(0);
    Ok(true)
}

/// Rewrite the name of the entry pointing at `ino`. The slot and inode
/// number stay where they are.
///
/// Returns `false` when no live entry references `ino`.
pub fn rename_entry(block: &mut [u8], ino: InodeNumber, new_name: &str) -> Result<bool> {
    validate_name(new_name)?;
    for slot in 0..MAX_SUBFILES {
        let entry = entry_ino(block, slot)?;
        if entry == 0 {
            return Ok(false);
        }
        if entry == ino.0 {
            let area = entry_name_bytes_mut(block, slot)?;
            area.fill(0);
            area[..new_name.len()].copy_from_slice(new_name.as_bytes());
            return Ok(true);
        }
    }
    Ok(false)
}

/// Empty-directory check: with the table packed, slot 0 being free means
/// every slot is.
pub fn is_empty(block: &[u8]) -> Result<bool> {
    Ok(entry_ino(block, 0)? == 0)
}

/// Full-directory check: no free slot left. Callers decide whether to
/// evict or fail before attempting an insert.
pub fn is_full(block: &[u8]) -> Result<bool> {
    for slot in 0..MAX_SUBFILES {
        if entry_ino(block, slot)? == 0 {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Decode every live entry in table order.
pub fn list_entries(block: &[u8]) -> Result<Vec<DirEntry>> {
    let mut entries = Vec::new();
    for slot in 0..MAX_SUBFILES {
        let ino = entry_ino(block, slot)?;
        if ino == 0 {
            break;
        }
        entries.push(DirEntry {
            ino: InodeNumber(ino),
            name: trim_nul_padded(entry_name_bytes(block, slot)?),
        });
    }
    Ok(entries)
}

// ── Slot access ─────────────────────────────────────────────────────────────

fn corrupt_entry(slot: usize) -> impl FnOnce(ofs_types::ParseError) -> OfsError {
    move |err| OfsError::Corruption {
        block: 0,
        detail: format!("directory entry {slot}: {err}"),
    }
}

fn entry_ino(block: &[u8], slot: usize) -> Result<u32> {
    read_le_u32(block, slot * DIR_ENTRY_SIZE).map_err(corrupt_entry(slot))
}

fn entry_name_bytes(block: &[u8], slot: usize) -> Result<&[u8]> {
    ensure_slice(block, slot * DIR_ENTRY_SIZE + 4, FILENAME_LEN).map_err(corrupt_entry(slot))
}

fn entry_name_bytes_mut(block: &mut [u8], slot: usize) -> Result<&mut [u8]> {
    ensure_slice_mut(block, slot * DIR_ENTRY_SIZE + 4, FILENAME_LEN).map_err(corrupt_entry(slot))
}

/// Name comparison without decoding: equal prefix, then a padding NUL
/// unless the name fills the slot.
fn slot_matches(block: &[u8], slot: usize, name: &str) -> Result<bool> {
    let bytes = entry_name_bytes(block, slot)?;
    let name = name.as_bytes();
    Ok(&bytes[..name.len()] == name && bytes[name.len()..].first().copied().unwrap_or(0) == 0)
}

fn write_slot(block: &mut [u8], slot: usize, ino: InodeNumber, name: &str) -> Result<()> {
    write_le_u32(block, slot * DIR_ENTRY_SIZE, ino.0).map_err(corrupt_entry(slot))?;
    let area = entry_name_bytes_mut(block, slot)?;
    area.fill(0);
    area[..name.len()].copy_from_slice(name.as_bytes());
    Ok(())
}
