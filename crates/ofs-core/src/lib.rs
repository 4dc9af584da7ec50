#![forbid(unsafe_code)]
//! Volume operations for OublieFS.
//!
//! [`Volume`] mounts a formatted block device and exposes the filesystem
//! operations: lookup, create, mkdir, unlink, rmdir, rename, file content
//! reads and writes, plus the reclamation pass that deletes a victim file
//! when a directory's fixed entry table fills up (see [`evict`]).
//!
//! Responsibility split with the lower crates: `ofs-ondisk` and `ofs-dir`
//! only transform bytes, `ofs-alloc` owns the free maps. Everything
//! stateful (block I/O, locking, timestamps, eviction) happens here.
//!
//! # Locking
//!
//! One mutex per inode, created on first use. Directory mutations hold
//! the directory's lock; removals hold the parent and the target; a
//! cross-directory rename holds both parents. Whenever an operation needs
//! more than one inode lock it takes them in ascending inode order, which
//! rules out lock cycles between operations. The inode store serializes
//! record writes behind one further lock because records share blocks,
//! and the allocator sits behind its own mutex. Neither of those two is
//! ever held while acquiring the other.
//!
//! The reclamation walk pins one directory at a time, only while copying
//! its entry table, and re-validates its victim under the parent's lock
//! right before deletion.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use ofs_alloc::Allocator;
use ofs_block::BlockDevice;
use ofs_error::{OfsError, Result};
use ofs_ondisk::{index_block_slot, set_index_block_slot, DiskInode, Superblock};
use ofs_types::{
    inode_offset_in_block, inode_store_block, BlockNumber, InodeNumber, BLOCK_SIZE,
    INDEX_ENTRIES_PER_BLOCK, INODE_RECORD_SIZE, MAX_FILE_SIZE, S_IFDIR, S_IFMT,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

pub mod evict;

pub use evict::{EvictCandidate, EvictionStrategy, LargestSize, OldestMtime};
pub use ofs_dir::DirEntry;

fn zero_block() -> Vec<u8> {
    vec![0_u8; BLOCK_SIZE as usize]
}

fn corruption(block: BlockNumber, detail: impl fmt::Display) -> OfsError {
    OfsError::Corruption {
        block: u64::from(block.0),
        detail: detail.to_string(),
    }
}

// ── Injected capabilities ───────────────────────────────────────────────────

/// Time source for inode timestamps, injectable for deterministic tests.
pub trait Clock: Send + Sync {
    /// Seconds since the Unix epoch, truncated to the on-disk width.
    fn now_secs(&self) -> u32;
}

/// Wall-clock time via [`SystemTime`].
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> u32 {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_secs());
        u32::try_from(secs).unwrap_or(u32::MAX)
    }
}

/// Answers whether a file is currently in use and therefore not
/// evictable.
///
/// The volume itself has no notion of open handles; the embedding layer
/// does. Reclamation consults this before considering any candidate and
/// once more before deleting the chosen victim.
pub trait FileUsage: Send + Sync {
    /// True while `ino` must not be evicted.
    fn in_use(&self, ino: InodeNumber) -> bool;
}

/// Treats every file as closed. The default for offline images.
#[derive(Debug, Default)]
pub struct NoFilesInUse;

impl FileUsage for NoFilesInUse {
    fn in_use(&self, _ino: InodeNumber) -> bool {
        false
    }
}

/// Per-volume tunables injected at open time.
pub struct VolumeOptions {
    /// Victim comparator used when a create must reclaim space.
    pub strategy: Box<dyn EvictionStrategy>,
    /// Oracle telling reclamation which files are currently in use.
    pub usage: Arc<dyn FileUsage>,
    /// Timestamp source for inode metadata.
    pub clock: Arc<dyn Clock>,
}

impl Default for VolumeOptions {
    fn default() -> Self {
        Self {
            strategy: Box::new(OldestMtime),
            usage: Arc::new(NoFilesInUse),
            clock: Arc::new(SystemClock),
        }
    }
}

impl fmt::Debug for VolumeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VolumeOptions")
            .field("strategy", &self.strategy.name())
            .finish_non_exhaustive()
    }
}

// ── Operation inputs and outputs ────────────────────────────────────────────

/// Flag bits accepted by [`Volume::rename`], mirroring `renameat2`.
///
/// Exchange and whiteout are not supported and rejected up front; the
/// default is a plain move that never replaces an existing target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RenameFlags {
    /// Atomically swap source and target. Always rejected.
    pub exchange: bool,
    /// Leave a whiteout at the source. Always rejected.
    pub whiteout: bool,
}

/// Inode attributes as returned by stat and the namespace operations.
///
/// Timestamps are epoch seconds exactly as stored on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeAttr {
    /// Inode number.
    pub ino: InodeNumber,
    /// File type and permission bits.
    pub mode: u32,
    /// Owner user id.
    pub uid: u32,
    /// Owner group id.
    pub gid: u32,
    /// Size in bytes.
    pub size: u32,
    /// Creation time.
    pub ctime: u32,
    /// Last access time.
    pub atime: u32,
    /// Last modification time.
    pub mtime: u32,
    /// Allocated block count, including the index block.
    pub blocks: u32,
    /// Link count.
    pub nlink: u32,
}

impl InodeAttr {
    fn from_record(ino: InodeNumber, inode: &DiskInode) -> Self {
        Self {
            ino,
            mode: inode.mode,
            uid: inode.uid,
            gid: inode.gid,
            size: inode.size,
            ctime: inode.ctime,
            atime: inode.atime,
            mtime: inode.mtime,
            blocks: inode.blocks,
            nlink: inode.nlink,
        }
    }

    /// True for directories.
    #[must_use]
    pub fn is_directory(&self) -> bool {
        ofs_types::is_directory(self.mode)
    }

    /// True for regular files.
    #[must_use]
    pub fn is_regular(&self) -> bool {
        ofs_types::is_regular(self.mode)
    }
}

/// Outcome of a successful reclamation pass.
#[derive(Debug, Clone, Serialize)]
pub struct ReclaimReport {
    /// Inode of the deleted file.
    pub victim: InodeNumber,
    /// Directory it was deleted from.
    pub parent: InodeNumber,
    /// Name it was deleted under.
    pub name: String,
    /// Strategy that picked it.
    pub strategy: &'static str,
}

// ── Inode lock table ────────────────────────────────────────────────────────

/// Lock-per-inode table, populated lazily. Lock handles are `Arc`s so a
/// caller can hold one across its own table accesses.
#[derive(Default)]
struct InodeLocks {
    table: Mutex<HashMap<u32, Arc<Mutex<()>>>>,
}

impl InodeLocks {
    fn acquire(&self, ino: InodeNumber) -> Arc<Mutex<()>> {
        Arc::clone(self.table.lock().entry(ino.0).or_default())
    }
}

// ── Volume ──────────────────────────────────────────────────────────────────

/// A mounted OublieFS image.
///
/// All operations are synchronous and run to completion on the calling
/// thread; the volume is `Send + Sync` and may be shared behind an `Arc`.
/// Metadata writes go straight through to the device, so a fault on the
/// write-back path leaves memory ahead of disk; the worst case is leaked
/// free space, never a doubly handed-out block or inode.
pub struct Volume {
    dev: Arc<dyn BlockDevice>,
    /// Geometry copy. Live free counters are in the allocator.
    geometry: Superblock,
    allocator: Mutex<Allocator>,
    locks: InodeLocks,
    /// Serializes read-modify-write of inode store blocks, which hold
    /// many records each.
    istore_lock: Mutex<()>,
    strategy: Box<dyn EvictionStrategy>,
    usage: Arc<dyn FileUsage>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Volume")
            .field("nr_blocks", &self.geometry.nr_blocks)
            .field("nr_inodes", &self.geometry.nr_inodes)
            .field("strategy", &self.strategy.name())
            .finish_non_exhaustive()
    }
}

impl Volume {
    /// Open a formatted image with default options.
    pub fn open(dev: Arc<dyn BlockDevice>) -> Result<Self> {
        Self::open_with_options(dev, VolumeOptions::default())
    }

    /// Open a formatted image.
    ///
    /// Parses and validates the superblock against the device geometry
    /// and loads both free maps. Returns [`OfsError::Format`] when the
    /// image is not an OublieFS volume or its geometry is impossible.
    pub fn open_with_options(dev: Arc<dyn BlockDevice>, options: VolumeOptions) -> Result<Self> {
        if dev.block_size() != BLOCK_SIZE {
            return Err(OfsError::Format(format!(
                "unsupported block size {} (expected {BLOCK_SIZE})",
                dev.block_size()
            )));
        }
        let raw = dev.read_block(BlockNumber(0))?;
        let sb = Superblock::parse_from_bytes(raw.as_slice())
            .map_err(|err| OfsError::Format(err.to_string()))?;
        sb.validate_geometry(dev.block_count())
            .map_err(|err| OfsError::Format(err.to_string()))?;
        let allocator = Allocator::load(dev.as_ref(), sb)?;
        debug!(
            nr_blocks = sb.nr_blocks,
            nr_inodes = sb.nr_inodes,
            free_blocks = sb.nr_free_blocks,
            free_inodes = sb.nr_free_inodes,
            strategy = options.strategy.name(),
            "volume opened"
        );
        Ok(Self {
            dev,
            geometry: sb,
            allocator: Mutex::new(allocator),
            locks: InodeLocks::default(),
            istore_lock: Mutex::new(()),
            strategy: options.strategy,
            usage: options.usage,
            clock: options.clock,
        })
    }

    /// Write a fresh filesystem onto `dev` and return its superblock.
    ///
    /// Lays out the inode store, both free maps, and an empty root
    /// directory owning the first data block. Any previous metadata on
    /// the device is zeroed; old data blocks are left alone because every
    /// block is scrubbed when it is next handed out.
    pub fn format(dev: &dyn BlockDevice, clock: &dyn Clock) -> Result<Superblock> {
        if dev.block_size() != BLOCK_SIZE {
            return Err(OfsError::Format(format!(
                "unsupported block size {} (expected {BLOCK_SIZE})",
                dev.block_size()
            )));
        }
        let nr_blocks = u32::try_from(dev.block_count())
            .map_err(|_| OfsError::Format("device exceeds the 32-bit block address space".into()))?;
        let sb = Superblock::for_device(nr_blocks).map_err(|err| OfsError::Format(err.to_string()))?;

        let zero = zero_block();
        for block in 1..sb.data_start().0 {
            dev.write_block(BlockNumber(block), &zero)?;
        }
        Allocator::formatted(sb).flush(dev)?;

        // Root directory: inode 0, an empty entry table in the first
        // data block.
        let now = clock.now_secs();
        let root = DiskInode {
            mode: S_IFDIR | 0o755,
            uid: 0,
            gid: 0,
            size: BLOCK_SIZE,
            ctime: now,
            atime: now,
            mtime: now,
            blocks: 1,
            nlink: 2,
            index_block: sb.data_start().0,
        };
        let mut first = dev.read_block(sb.istore_start())?.into_inner();
        root.write_to_bytes(&mut first[..INODE_RECORD_SIZE])
            .map_err(|err| corruption(sb.istore_start(), err))?;
        dev.write_block(sb.istore_start(), &first)?;
        dev.write_block(sb.data_start(), &zero)?;
        dev.sync()?;

        info!(
            nr_blocks = sb.nr_blocks,
            nr_inodes = sb.nr_inodes,
            data_start = sb.data_start().0,
            "formatted volume"
        );
        Ok(sb)
    }

    /// Current superblock, including live free counters.
    #[must_use]
    pub fn superblock(&self) -> Superblock {
        *self.allocator.lock().superblock()
    }

    /// Flush free maps and counters, then sync the device.
    pub fn sync(&self) -> Result<()> {
        self.allocator.lock().flush(self.dev.as_ref())?;
        self.dev.sync()
    }

    // ── Namespace operations ────────────────────────────────────────────

    /// Resolve `name` in `parent`.
    ///
    /// Refreshes the directory's access time on every successful
    /// resolution; read-only volumes still resolve, skipping the refresh.
    /// Returns [`OfsError::NotFound`] when no entry matches.
    pub fn lookup(&self, parent: InodeNumber, name: &str) -> Result<InodeAttr> {
        let parent_lock = self.locks.acquire(parent);
        let _dir_guard = parent_lock.lock();
        let mut parent_inode = self.read_live_dir(parent)?;
        let table = self.read_dir_table(parent, &parent_inode)?;
        let Some(ino) = ofs_dir::find_entry(&table, name)? else {
            return Err(OfsError::NotFound(name.to_owned()));
        };
        parent_inode.atime = self.clock.now_secs();
        match self.write_inode(parent, &parent_inode) {
            Ok(()) | Err(OfsError::ReadOnly) => {}
            Err(err) => return Err(err),
        }
        trace!(parent = parent.0, ino = ino.0, name, "lookup");
        Ok(InodeAttr::from_record(ino, &self.read_live_inode(ino)?))
    }

    /// Attributes of a live inode.
    pub fn stat(&self, ino: InodeNumber) -> Result<InodeAttr> {
        Ok(InodeAttr::from_record(ino, &self.read_live_inode(ino)?))
    }

    /// Every entry of a directory in table order.
    pub fn readdir(&self, dir: InodeNumber) -> Result<Vec<DirEntry>> {
        let dir_lock = self.locks.acquire(dir);
        let _dir_guard = dir_lock.lock();
        let inode = self.read_live_dir(dir)?;
        let table = self.read_dir_table(dir, &inode)?;
        ofs_dir::list_entries(&table)
    }

    /// Create a regular file or directory named `name` under `parent`.
    ///
    /// `mode` must carry `S_IFREG` or `S_IFDIR`; any other file type is
    /// rejected with [`OfsError::InvalidArgument`]. A full parent
    /// triggers one reclamation pass over its subtree before the create
    /// is retried; if no slot could be freed the create fails with
    /// [`OfsError::TooManyEntries`].
    pub fn create(&self, parent: InodeNumber, name: &str, mode: u32) -> Result<InodeAttr> {
        if !ofs_types::is_supported_mode(mode) {
            return Err(OfsError::InvalidArgument(format!(
                "mode {mode:#o}: only regular files and directories are supported"
            )));
        }
        ofs_dir::validate_name(name)?;

        let parent_lock = self.locks.acquire(parent);
        let mut reclaimed = false;
        loop {
            let dir_guard = parent_lock.lock();
            let mut parent_inode = self.read_live_dir(parent)?;
            let mut table = self.read_dir_table(parent, &parent_inode)?;
            if ofs_dir::find_entry(&table, name)?.is_some() {
                return Err(OfsError::AlreadyExists);
            }
            if ofs_dir::is_full(&table)? {
                if reclaimed {
                    return Err(OfsError::TooManyEntries);
                }
                // One reclamation pass over the parent's subtree, then a
                // single retry. The walk and the deletion take their own
                // locks, so the parent lock cannot be held across them.
                drop(dir_guard);
                if self.evict_once(parent)?.is_none() {
                    return Err(OfsError::TooManyEntries);
                }
                reclaimed = true;
                continue;
            }
            return self.create_locked(parent, &mut parent_inode, &mut table, name, mode);
        }
    }

    /// Create a directory. `mode` carries permission bits only.
    pub fn mkdir(&self, parent: InodeNumber, name: &str, mode: u32) -> Result<InodeAttr> {
        self.create(parent, name, S_IFDIR | (mode & !S_IFMT))
    }

    /// Remove the regular file `name` from `parent`, releasing its
    /// content.
    ///
    /// Content cleanup is best effort: blocks that cannot be scrubbed
    /// are leaked rather than freed with stale data, and an unreadable
    /// index block leaks all of the file's data blocks, but the inode
    /// and its index block number always return to the free maps.
    pub fn unlink(&self, parent: InodeNumber, name: &str) -> Result<()> {
        loop {
            let Some(target) = self.peek_entry(parent, name)? else {
                return Err(OfsError::NotFound(name.to_owned()));
            };
            if target == parent {
                return Err(corruption(
                    inode_store_block(parent),
                    format!("directory {} lists itself as {name}", parent.0),
                ));
            }
            let (first, second) = self.ordered_locks(parent, target);
            let _outer_guard = first.lock();
            let _inner_guard = second.lock();

            let mut parent_inode = self.read_live_dir(parent)?;
            let mut table = self.read_dir_table(parent, &parent_inode)?;
            if ofs_dir::find_entry(&table, name)? != Some(target) {
                // The entry changed while unlocked; resolve again.
                continue;
            }
            let target_inode = self.read_live_inode(target)?;
            if target_inode.is_directory() {
                return Err(OfsError::InvalidArgument(format!(
                    "{name} is a directory, use rmdir"
                )));
            }
            return self.remove_entry_and_inode(
                parent,
                &mut parent_inode,
                &mut table,
                target,
                &target_inode,
            );
        }
    }

    /// Remove the empty directory `name` from `parent`.
    ///
    /// Fails with [`OfsError::NotEmpty`] while the target still has
    /// entries or extra links; otherwise cleanup is identical to
    /// [`Volume::unlink`].
    pub fn rmdir(&self, parent: InodeNumber, name: &str) -> Result<()> {
        loop {
            let Some(target) = self.peek_entry(parent, name)? else {
                return Err(OfsError::NotFound(name.to_owned()));
            };
            if target == parent {
                return Err(corruption(
                    inode_store_block(parent),
                    format!("directory {} lists itself as {name}", parent.0),
                ));
            }
            let (first, second) = self.ordered_locks(parent, target);
            let _outer_guard = first.lock();
            let _inner_guard = second.lock();

            let mut parent_inode = self.read_live_dir(parent)?;
            let mut table = self.read_dir_table(parent, &parent_inode)?;
            if ofs_dir::find_entry(&table, name)? != Some(target) {
                continue;
            }
            let target_inode = self.read_live_inode(target)?;
            if !target_inode.is_directory() {
                return Err(OfsError::InvalidArgument(format!("{name} is not a directory")));
            }
            let target_table = self.read_dir_table(target, &target_inode)?;
            if target_inode.nlink > 2 || !ofs_dir::is_empty(&target_table)? {
                return Err(OfsError::NotEmpty);
            }
            return self.remove_entry_and_inode(
                parent,
                &mut parent_inode,
                &mut table,
                target,
                &target_inode,
            );
        }
    }

    /// Move or rename an entry.
    ///
    /// Within one directory only the stored name changes; the entry
    /// keeps its slot and inode. Across directories the target must have
    /// a free slot (a move never evicts on its own behalf) and a name
    /// collision fails with [`OfsError::AlreadyExists`] rather than
    /// replacing the target.
    pub fn rename(
        &self,
        src_parent: InodeNumber,
        src_name: &str,
        dst_parent: InodeNumber,
        dst_name: &str,
        flags: RenameFlags,
    ) -> Result<()> {
        if flags.exchange || flags.whiteout {
            return Err(OfsError::InvalidArgument(
                "exchange and whiteout renames are not supported".to_owned(),
            ));
        }
        ofs_dir::validate_name(dst_name)?;
        if src_parent == dst_parent {
            self.rename_within(src_parent, src_name, dst_name)
        } else {
            self.rename_across(src_parent, src_name, dst_parent, dst_name)
        }
    }

    // ── File content ────────────────────────────────────────────────────

    /// Read up to `len` bytes of a regular file starting at `offset`.
    ///
    /// Reads past end-of-file return the available prefix (empty at or
    /// past the end); holes read as zeroes.
    pub fn read_file_data(&self, ino: InodeNumber, offset: u64, len: u32) -> Result<Vec<u8>> {
        let file_lock = self.locks.acquire(ino);
        let _file_guard = file_lock.lock();
        let inode = self.read_live_inode(ino)?;
        if !inode.is_regular() {
            return Err(OfsError::InvalidArgument(format!(
                "inode {} is not a regular file",
                ino.0
            )));
        }
        let size = u64::from(inode.size);
        if offset >= size || len == 0 {
            return Ok(Vec::new());
        }
        let end = size.min(offset + u64::from(len));
        let index_block = BlockNumber(inode.index_block);
        let index = self.dev.read_block(index_block)?;
        let block_size = u64::from(BLOCK_SIZE);

        let mut out = Vec::with_capacity((end - offset) as usize);
        let mut pos = offset;
        while pos < end {
            let slot = (pos / block_size) as usize;
            let in_block = (pos % block_size) as usize;
            let take = ((end - pos) as usize).min(BLOCK_SIZE as usize - in_block);
            let data_block = index_block_slot(index.as_slice(), slot)
                .map_err(|err| corruption(index_block, err))?;
            if data_block == 0 {
                out.resize(out.len() + take, 0);
            } else {
                let buf = self.dev.read_block(BlockNumber(data_block))?;
                out.extend_from_slice(&buf.as_slice()[in_block..in_block + take]);
            }
            pos += take as u64;
        }
        trace!(ino = ino.0, offset, len = out.len(), "read");
        Ok(out)
    }

    /// Write `data` into a regular file at `offset`, growing it as
    /// needed.
    ///
    /// Returns the number of bytes written. A write reaching the
    /// single-index-block limit or exhausting the device after partial
    /// progress returns short; writing at or past the limit, or to
    /// something that is not a regular file, is
    /// [`OfsError::InvalidArgument`].
    pub fn write_file_data(&self, ino: InodeNumber, offset: u64, data: &[u8]) -> Result<u32> {
        let file_lock = self.locks.acquire(ino);
        let _file_guard = file_lock.lock();
        let mut inode = self.read_live_inode(ino)?;
        if !inode.is_regular() {
            return Err(OfsError::InvalidArgument(format!(
                "inode {} is not a regular file",
                ino.0
            )));
        }
        if offset >= MAX_FILE_SIZE {
            return Err(OfsError::InvalidArgument(format!(
                "offset {offset} is past the maximum file size"
            )));
        }
        if data.is_empty() {
            return Ok(0);
        }
        let end = MAX_FILE_SIZE.min(offset + data.len() as u64);
        let writable = (end - offset) as usize;
        let index_block = BlockNumber(inode.index_block);
        let mut index = self.dev.read_block(index_block)?.into_inner();
        let mut index_dirty = false;
        let block_size = u64::from(BLOCK_SIZE);

        let mut written = 0_usize;
        while written < writable {
            let pos = offset + written as u64;
            let slot = (pos / block_size) as usize;
            let in_block = (pos % block_size) as usize;
            let take = (writable - written).min(BLOCK_SIZE as usize - in_block);
            let slot_value =
                index_block_slot(&index, slot).map_err(|err| corruption(index_block, err))?;
            if slot_value == 0 {
                let fresh = match self.allocator.lock().allocate_block(self.dev.as_ref()) {
                    Ok(block) => block,
                    Err(OfsError::NoSpace) if written > 0 => {
                        debug!(ino = ino.0, written, "write stopped early, device full");
                        break;
                    }
                    Err(err) => return Err(err),
                };
                // Fresh blocks are written whole, zero-filled around the
                // fragment, so stale contents never become visible.
                let mut buf = zero_block();
                buf[in_block..in_block + take].copy_from_slice(&data[written..written + take]);
                if let Err(err) = self.dev.write_block(fresh, &buf) {
                    if let Err(free_err) =
                        self.allocator.lock().free_block(self.dev.as_ref(), fresh)
                    {
                        warn!(block = fresh.0, error = %free_err, "write rollback: block not released");
                    }
                    return Err(err);
                }
                set_index_block_slot(&mut index, slot, fresh.0)
                    .map_err(|err| corruption(index_block, err))?;
                index_dirty = true;
                inode.blocks += 1;
            } else if take == BLOCK_SIZE as usize {
                self.dev
                    .write_block(BlockNumber(slot_value), &data[written..written + take])?;
            } else {
                let mut buf = self.dev.read_block(BlockNumber(slot_value))?.into_inner();
                buf[in_block..in_block + take].copy_from_slice(&data[written..written + take]);
                self.dev.write_block(BlockNumber(slot_value), &buf)?;
            }
            written += take;
        }

        if index_dirty {
            self.dev.write_block(index_block, &index)?;
        }
        let end_pos = offset + written as u64;
        if end_pos > u64::from(inode.size) {
            inode.size = end_pos as u32;
        }
        let now = self.clock.now_secs();
        inode.mtime = now;
        inode.ctime = now;
        self.write_inode(ino, &inode)?;
        trace!(ino = ino.0, offset, written, "wrote");
        Ok(written as u32)
    }

    // ── Reclamation ─────────────────────────────────────────────────────

    /// Force one reclamation pass over the tree under `start`.
    ///
    /// This is the maintenance entry point; creates trigger the same
    /// pass on their own when a directory fills up. Returns
    /// [`OfsError::NotFound`] when nothing under `start` was evictable.
    pub fn reclaim(&self, start: InodeNumber) -> Result<ReclaimReport> {
        self.read_live_dir(start)?;
        match self.evict_once(start)? {
            Some(report) => Ok(report),
            None => Err(OfsError::NotFound(format!(
                "no evictable file under inode {}",
                start.0
            ))),
        }
    }

    fn evict_once(&self, start: InodeNumber) -> Result<Option<ReclaimReport>> {
        let Some(victim) = evict::find_victim(self, self.strategy.as_ref(), start)? else {
            return Ok(None);
        };
        if victim.ino == victim.parent {
            return Ok(None);
        }
        let (first, second) = self.ordered_locks(victim.parent, victim.ino);
        let _outer_guard = first.lock();
        let _inner_guard = second.lock();

        // The walk's locks are long gone; confirm the victim is still
        // where it was and still eligible before deleting anything.
        let mut parent_inode = match self.read_live_dir(victim.parent) {
            Ok(inode) => inode,
            Err(OfsError::NotFound(_) | OfsError::InvalidArgument(_)) => {
                debug!(parent = victim.parent.0, "eviction: victim's directory vanished since scan");
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        let mut table = self.read_dir_table(victim.parent, &parent_inode)?;
        let name = match ofs_dir::find_entry(&table, &victim.name)? {
            Some(ino) if ino == victim.ino => victim.name.clone(),
            _ => match ofs_dir::find_name_by_ino(&table, victim.ino)? {
                Some(current) => {
                    debug!(
                        ino = victim.ino.0,
                        was = %victim.name,
                        now = %current,
                        "eviction: victim renamed since scan"
                    );
                    current
                }
                None => {
                    debug!(ino = victim.ino.0, "eviction: victim vanished since scan");
                    return Ok(None);
                }
            },
        };
        let target_inode = match self.read_live_inode(victim.ino) {
            Ok(inode) => inode,
            Err(OfsError::NotFound(_)) => return Ok(None),
            Err(err) => return Err(err),
        };
        if !target_inode.is_regular() || self.file_in_use(victim.ino) {
            debug!(ino = victim.ino.0, "eviction: victim no longer eligible");
            return Ok(None);
        }

        self.remove_entry_and_inode(
            victim.parent,
            &mut parent_inode,
            &mut table,
            victim.ino,
            &target_inode,
        )?;
        info!(
            ino = victim.ino.0,
            parent = victim.parent.0,
            name = %name,
            strategy = self.strategy.name(),
            "evicted file to free directory space"
        );
        Ok(Some(ReclaimReport {
            victim: victim.ino,
            parent: victim.parent,
            name,
            strategy: self.strategy.name(),
        }))
    }

    // ── Internals ───────────────────────────────────────────────────────

    pub(crate) fn file_in_use(&self, ino: InodeNumber) -> bool {
        self.usage.in_use(ino)
    }

    fn read_inode(&self, ino: InodeNumber) -> Result<DiskInode> {
        if ino.0 >= self.geometry.nr_inodes {
            return Err(OfsError::NotFound(format!("inode {}", ino.0)));
        }
        let block = inode_store_block(ino);
        let raw = self.dev.read_block(block)?;
        let offset = inode_offset_in_block(ino);
        DiskInode::parse_from_bytes(&raw.as_slice()[offset..offset + INODE_RECORD_SIZE])
            .map_err(|err| corruption(block, err))
    }

    pub(crate) fn read_live_inode(&self, ino: InodeNumber) -> Result<DiskInode> {
        let inode = self.read_inode(ino)?;
        if inode.is_free() {
            return Err(OfsError::NotFound(format!("inode {}", ino.0)));
        }
        Ok(inode)
    }

    fn read_live_dir(&self, ino: InodeNumber) -> Result<DiskInode> {
        let inode = self.read_live_inode(ino)?;
        if !inode.is_directory() {
            return Err(OfsError::InvalidArgument(format!(
                "inode {} is not a directory",
                ino.0
            )));
        }
        Ok(inode)
    }

    fn write_inode(&self, ino: InodeNumber, inode: &DiskInode) -> Result<()> {
        let _serialized = self.istore_lock.lock();
        let block = inode_store_block(ino);
        let mut raw = self.dev.read_block(block)?.into_inner();
        let offset = inode_offset_in_block(ino);
        inode
            .write_to_bytes(&mut raw[offset..offset + INODE_RECORD_SIZE])
            .map_err(|err| corruption(block, err))?;
        self.dev.write_block(block, &raw)
    }

    pub(crate) fn read_dir_table(&self, dir: InodeNumber, inode: &DiskInode) -> Result<Vec<u8>> {
        if inode.index_block == 0 {
            return Err(corruption(
                inode_store_block(dir),
                format!("directory {} is live but has no index block", dir.0),
            ));
        }
        Ok(self
            .dev
            .read_block(BlockNumber(inode.index_block))?
            .into_inner())
    }

    /// Resolve a name without taking locks. Removal paths use it to
    /// learn which inode locks they need; the result is re-validated
    /// once those locks are held.
    fn peek_entry(&self, parent: InodeNumber, name: &str) -> Result<Option<InodeNumber>> {
        let parent_inode = self.read_live_dir(parent)?;
        let table = self.read_dir_table(parent, &parent_inode)?;
        ofs_dir::find_entry(&table, name)
    }

    /// Lock handle for a single inode. The reclamation walk uses it to
    /// pin one directory at a time while copying its entry table.
    pub(crate) fn lock_for(&self, ino: InodeNumber) -> Arc<Mutex<()>> {
        self.locks.acquire(ino)
    }

    /// Lock handles for two distinct inodes, ordered ascending by inode
    /// number. Callers lock the first handle before the second.
    fn ordered_locks(&self, a: InodeNumber, b: InodeNumber) -> (Arc<Mutex<()>>, Arc<Mutex<()>>) {
        if a.0 <= b.0 {
            (self.locks.acquire(a), self.locks.acquire(b))
        } else {
            (self.locks.acquire(b), self.locks.acquire(a))
        }
    }

    /// Allocation, record, and entry insertion for create. The caller
    /// holds the parent lock and has verified the name is free and the
    /// table has room.
    fn create_locked(
        &self,
        parent: InodeNumber,
        parent_inode: &mut DiskInode,
        table: &mut Vec<u8>,
        name: &str,
        mode: u32,
    ) -> Result<InodeAttr> {
        let ino = self.allocator.lock().allocate_inode(self.dev.as_ref())?;
        // Bound as its own statement so the allocator guard is released
        // before the failure arm re-enters the allocator to roll back.
        let allocated = self.allocator.lock().allocate_block(self.dev.as_ref());
        let index_block = match allocated {
            Ok(block) => block,
            Err(err) => {
                self.rollback_allocation(ino, None);
                return Err(err);
            }
        };

        // A new index block is scrubbed before anything references it,
        // so the file can never see its previous owner's contents.
        if let Err(err) = self.dev.write_block(index_block, &zero_block()) {
            self.rollback_allocation(ino, Some(index_block));
            return Err(err);
        }

        let now = self.clock.now_secs();
        let is_dir = ofs_types::is_directory(mode);
        let record = DiskInode {
            mode,
            uid: 0,
            gid: 0,
            size: if is_dir { BLOCK_SIZE } else { 0 },
            ctime: now,
            atime: now,
            mtime: now,
            blocks: 1,
            nlink: if is_dir { 2 } else { 1 },
            index_block: index_block.0,
        };
        if let Err(err) = self.write_inode(ino, &record) {
            self.rollback_allocation(ino, Some(index_block));
            return Err(err);
        }

        let inserted = match ofs_dir::insert_entry(table, name, ino) {
            Ok(()) => self
                .dev
                .write_block(BlockNumber(parent_inode.index_block), table),
            Err(err) => Err(err),
        };
        if let Err(err) = inserted {
            // The entry never became durable; release everything.
            if let Err(zero_err) = self.write_inode(ino, &DiskInode::default()) {
                warn!(ino = ino.0, error = %zero_err, "create rollback: inode record not zeroed");
            }
            self.rollback_allocation(ino, Some(index_block));
            return Err(err);
        }

        parent_inode.mtime = now;
        parent_inode.ctime = now;
        if is_dir {
            parent_inode.nlink += 1;
        }
        self.write_inode(parent, parent_inode)?;

        debug!(parent = parent.0, ino = ino.0, name, dir = is_dir, "created");
        Ok(InodeAttr::from_record(ino, &record))
    }

    /// Release a partially created inode after a later step failed.
    /// Rollback failures are logged and swallowed; the original error is
    /// the one the caller sees.
    fn rollback_allocation(&self, ino: InodeNumber, index_block: Option<BlockNumber>) {
        let mut allocator = self.allocator.lock();
        if let Err(err) = allocator.free_inode(self.dev.as_ref(), ino) {
            warn!(ino = ino.0, error = %err, "create rollback: inode not released");
        }
        if let Some(block) = index_block {
            if let Err(err) = allocator.free_block(self.dev.as_ref(), block) {
                warn!(block = block.0, error = %err, "create rollback: index block not released");
            }
        }
    }

    fn rename_within(&self, parent: InodeNumber, src_name: &str, dst_name: &str) -> Result<()> {
        let parent_lock = self.locks.acquire(parent);
        let _dir_guard = parent_lock.lock();
        let mut parent_inode = self.read_live_dir(parent)?;
        let mut table = self.read_dir_table(parent, &parent_inode)?;
        let Some(ino) = ofs_dir::find_entry(&table, src_name)? else {
            return Err(OfsError::NotFound(src_name.to_owned()));
        };
        if src_name == dst_name {
            return Ok(());
        }
        if ofs_dir::find_entry(&table, dst_name)?.is_some() {
            return Err(OfsError::AlreadyExists);
        }
        if !ofs_dir::rename_entry(&mut table, ino, dst_name)? {
            return Err(corruption(
                BlockNumber(parent_inode.index_block),
                format!("entry for inode {} vanished during rename", ino.0),
            ));
        }
        self.dev
            .write_block(BlockNumber(parent_inode.index_block), &table)?;
        let now = self.clock.now_secs();
        parent_inode.mtime = now;
        parent_inode.ctime = now;
        self.write_inode(parent, &parent_inode)?;
        debug!(parent = parent.0, ino = ino.0, from = src_name, to = dst_name, "renamed in place");
        Ok(())
    }

    fn rename_across(
        &self,
        src_parent: InodeNumber,
        src_name: &str,
        dst_parent: InodeNumber,
        dst_name: &str,
    ) -> Result<()> {
        let (first, second) = self.ordered_locks(src_parent, dst_parent);
        let _outer_guard = first.lock();
        let _inner_guard = second.lock();

        let mut src_inode = self.read_live_dir(src_parent)?;
        let mut src_table = self.read_dir_table(src_parent, &src_inode)?;
        let Some(ino) = ofs_dir::find_entry(&src_table, src_name)? else {
            return Err(OfsError::NotFound(src_name.to_owned()));
        };
        let moved = self.read_live_inode(ino)?;
        if moved.is_directory() && self.subtree_contains(ino, dst_parent)? {
            return Err(OfsError::InvalidArgument(
                "cannot move a directory into its own subtree".to_owned(),
            ));
        }

        let mut dst_inode = self.read_live_dir(dst_parent)?;
        let mut dst_table = self.read_dir_table(dst_parent, &dst_inode)?;
        if ofs_dir::find_entry(&dst_table, dst_name)?.is_some() {
            return Err(OfsError::AlreadyExists);
        }
        // A move never evicts on its own behalf; a full target is final.
        if ofs_dir::is_full(&dst_table)? {
            return Err(OfsError::TooManyEntries);
        }

        let now = self.clock.now_secs();

        // Target side first so the file is never unreachable.
        ofs_dir::insert_entry(&mut dst_table, dst_name, ino)?;
        self.dev
            .write_block(BlockNumber(dst_inode.index_block), &dst_table)?;
        dst_inode.mtime = now;
        dst_inode.ctime = now;
        if moved.is_directory() {
            dst_inode.nlink += 1;
        }
        self.write_inode(dst_parent, &dst_inode)?;

        if !ofs_dir::remove_entry_by_ino(&mut src_table, ino)? {
            return Err(corruption(
                BlockNumber(src_inode.index_block),
                format!("entry for inode {} vanished during rename", ino.0),
            ));
        }
        self.dev
            .write_block(BlockNumber(src_inode.index_block), &src_table)?;
        src_inode.mtime = now;
        src_inode.ctime = now;
        if moved.is_directory() {
            src_inode.nlink = src_inode.nlink.saturating_sub(1);
        }
        self.write_inode(src_parent, &src_inode)?;

        debug!(
            ino = ino.0,
            src = src_parent.0,
            dst = dst_parent.0,
            name = dst_name,
            "moved"
        );
        Ok(())
    }

    /// True when `needle` is `root` or lies anywhere under it. Keeps a
    /// directory from being moved into its own subtree.
    fn subtree_contains(&self, root: InodeNumber, needle: InodeNumber) -> Result<bool> {
        if root == needle {
            return Ok(true);
        }
        let mut queue = vec![root];
        let mut visited = HashSet::new();
        while let Some(dir) = queue.pop() {
            if !visited.insert(dir.0) {
                continue;
            }
            let inode = match self.read_live_dir(dir) {
                Ok(inode) => inode,
                Err(OfsError::NotFound(_) | OfsError::InvalidArgument(_)) => continue,
                Err(err) => return Err(err),
            };
            let table = self.read_dir_table(dir, &inode)?;
            for entry in ofs_dir::list_entries(&table)? {
                if entry.ino == needle {
                    return Ok(true);
                }
                queue.push(entry.ino);
            }
        }
        Ok(false)
    }

    /// Shared removal path for unlink, rmdir, and eviction. The caller
    /// holds the parent and target locks and has already authorized the
    /// removal.
    fn remove_entry_and_inode(
        &self,
        parent: InodeNumber,
        parent_inode: &mut DiskInode,
        table: &mut Vec<u8>,
        target: InodeNumber,
        target_inode: &DiskInode,
    ) -> Result<()> {
        if !ofs_dir::remove_entry_by_ino(table, target)? {
            return Err(corruption(
                BlockNumber(parent_inode.index_block),
                format!("entry for inode {} vanished during removal", target.0),
            ));
        }
        self.dev
            .write_block(BlockNumber(parent_inode.index_block), table)?;

        let now = self.clock.now_secs();
        parent_inode.mtime = now;
        parent_inode.ctime = now;
        if target_inode.is_directory() {
            parent_inode.nlink = parent_inode.nlink.saturating_sub(1);
        }
        self.write_inode(parent, parent_inode)?;

        if target_inode.index_block == 0 {
            warn!(ino = target.0, "removal: live inode had no index block");
        } else {
            self.release_file_content(target, target_inode);
        }

        self.write_inode(target, &DiskInode::default())?;
        let mut allocator = self.allocator.lock();
        allocator.free_inode(self.dev.as_ref(), target)?;
        if target_inode.index_block != 0 {
            allocator.free_block(self.dev.as_ref(), BlockNumber(target_inode.index_block))?;
        }
        drop(allocator);

        debug!(parent = parent.0, ino = target.0, "removed");
        Ok(())
    }

    /// Zero and free the target's data blocks, then zero its index
    /// block.
    ///
    /// Faults here are logged and skipped: a block that cannot be
    /// scrubbed stays allocated (leaked) instead of being handed out
    /// with stale contents, and an unreadable index block leaks every
    /// data block the file owned.
    fn release_file_content(&self, target: InodeNumber, target_inode: &DiskInode) {
        let index_block = BlockNumber(target_inode.index_block);
        let index = match self.dev.read_block(index_block) {
            Ok(buf) => buf,
            Err(err) => {
                warn!(
                    ino = target.0,
                    block = index_block.0,
                    error = %err,
                    "removal: index block unreadable, data blocks leaked"
                );
                return;
            }
        };
        if target_inode.is_regular() {
            let zero = zero_block();
            for slot in 0..INDEX_ENTRIES_PER_BLOCK {
                let data_block = match index_block_slot(index.as_slice(), slot) {
                    Ok(value) => value,
                    Err(err) => {
                        warn!(ino = target.0, slot, error = %err, "removal: index block truncated");
                        break;
                    }
                };
                if data_block == 0 {
                    continue;
                }
                if data_block < self.geometry.data_start().0 || data_block >= self.geometry.nr_blocks
                {
                    warn!(
                        ino = target.0,
                        block = data_block,
                        "removal: index entry out of range, skipping"
                    );
                    continue;
                }
                if let Err(err) = self.dev.write_block(BlockNumber(data_block), &zero) {
                    warn!(
                        ino = target.0,
                        block = data_block,
                        error = %err,
                        "removal: data block not scrubbed, leaked"
                    );
                    continue;
                }
                if let Err(err) = self
                    .allocator
                    .lock()
                    .free_block(self.dev.as_ref(), BlockNumber(data_block))
                {
                    warn!(ino = target.0, block = data_block, error = %err, "removal: data block not freed");
                }
            }
        }
        if let Err(err) = self.dev.write_block(index_block, &zero_block()) {
            warn!(
                ino = target.0,
                block = index_block.0,
                error = %err,
                "removal: index block not scrubbed"
            );
        }
    }
}

impl Drop for Volume {
    fn drop(&mut self) {
        match self.sync() {
            Ok(()) | Err(OfsError::ReadOnly) => {}
            Err(err) => warn!(error = %err, "volume close: final sync failed"),
        }
    }
}
