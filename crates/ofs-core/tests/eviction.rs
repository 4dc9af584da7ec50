#![forbid(unsafe_code)]

use ofs_block::{BlockBuf, BlockDevice};
use ofs_core::{
    Clock, EvictionStrategy, FileUsage, InodeAttr, LargestSize, OldestMtime, Volume, VolumeOptions,
};
use ofs_error::{OfsError, Result};
use ofs_types::{BlockNumber, InodeNumber, BLOCK_SIZE, MAX_SUBFILES, S_IFREG};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

// ── Test doubles ────────────────────────────────────────────────────────────

/// Sparse in-memory block device. Unwritten blocks read as zeroes.
struct MemBlockDevice {
    blocks: Mutex<HashMap<u32, Vec<u8>>>,
    count: u64,
}

impl MemBlockDevice {
    fn new(count: u64) -> Self {
        Self {
            blocks: Mutex::new(HashMap::new()),
            count,
        }
    }
}

impl BlockDevice for MemBlockDevice {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        if u64::from(block.0) >= self.count {
            return Err(OfsError::Io(std::io::Error::other(format!(
                "read past device end: block {}",
                block.0
            ))));
        }
        let blocks = self.blocks.lock();
        Ok(BlockBuf::new(blocks.get(&block.0).cloned().unwrap_or_else(
            || vec![0_u8; BLOCK_SIZE as usize],
        )))
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        assert_eq!(data.len(), BLOCK_SIZE as usize);
        if u64::from(block.0) >= self.count {
            return Err(OfsError::Io(std::io::Error::other(format!(
                "write past device end: block {}",
                block.0
            ))));
        }
        self.blocks.lock().insert(block.0, data.to_vec());
        Ok(())
    }

    fn block_size(&self) -> u32 {
        BLOCK_SIZE
    }

    fn block_count(&self) -> u64 {
        self.count
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

struct ManualClock(AtomicU32);

impl ManualClock {
    fn new(start: u32) -> Arc<Self> {
        Arc::new(Self(AtomicU32::new(start)))
    }

    fn advance(&self, secs: u32) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }

    fn set(&self, secs: u32) {
        self.0.store(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_secs(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Usage oracle backed by a set of pinned inode numbers.
#[derive(Default)]
struct InUseSet(Mutex<HashSet<u32>>);

impl InUseSet {
    fn mark(&self, ino: InodeNumber) {
        self.0.lock().insert(ino.0);
    }

    fn release(&self, ino: InodeNumber) {
        self.0.lock().remove(&ino.0);
    }
}

impl FileUsage for InUseSet {
    fn in_use(&self, ino: InodeNumber) -> bool {
        self.0.lock().contains(&ino.0)
    }
}

const ROOT: InodeNumber = InodeNumber::ROOT;

fn fresh_device(blocks: u64, clock: &Arc<ManualClock>) -> Arc<MemBlockDevice> {
    let dev = Arc::new(MemBlockDevice::new(blocks));
    Volume::format(dev.as_ref(), clock.as_ref()).expect("format");
    dev
}

fn open_with(
    dev: Arc<MemBlockDevice>,
    clock: Arc<ManualClock>,
    strategy: Box<dyn EvictionStrategy>,
    usage: Arc<dyn FileUsage>,
) -> Volume {
    Volume::open_with_options(
        dev,
        VolumeOptions {
            strategy,
            usage,
            clock,
        },
    )
    .expect("open volume")
}

fn open_default(dev: Arc<MemBlockDevice>, clock: Arc<ManualClock>) -> Volume {
    Volume::open_with_options(
        dev,
        VolumeOptions {
            clock,
            ..VolumeOptions::default()
        },
    )
    .expect("open volume")
}

/// Create `MAX_SUBFILES` files in `dir`, each one second apart.
fn fill_directory(
    volume: &Volume,
    clock: &ManualClock,
    dir: InodeNumber,
    prefix: &str,
) -> Vec<InodeAttr> {
    (0..MAX_SUBFILES)
        .map(|i| {
            clock.advance(1);
            volume
                .create(dir, &format!("{prefix}-{i:03}"), S_IFREG | 0o644)
                .unwrap()
        })
        .collect()
}

#[test]
fn scenario_1_overflowing_create_evicts_the_oldest_file() {
    let clock = ManualClock::new(50_000);
    let dev = fresh_device(512, &clock);
    let volume = open_default(dev, Arc::clone(&clock));

    fill_directory(&volume, &clock, ROOT, "file");
    assert_eq!(volume.readdir(ROOT).unwrap().len(), MAX_SUBFILES);
    let full = volume.superblock();

    clock.advance(1);
    let newcomer = volume.create(ROOT, "file-128", S_IFREG | 0o644).unwrap();

    // The first file carried the smallest mtime and paid for the slot.
    let err = volume.lookup(ROOT, "file-000").unwrap_err();
    assert_eq!(err.to_errno(), libc::ENOENT);
    assert!(volume.lookup(ROOT, "file-001").is_ok());
    assert_eq!(volume.lookup(ROOT, "file-128").unwrap().ino, newcomer.ino);
    assert_eq!(volume.readdir(ROOT).unwrap().len(), MAX_SUBFILES);

    // One out, one in: the allocator balance is unchanged.
    let sb = volume.superblock();
    assert_eq!(sb.nr_free_inodes, full.nr_free_inodes);
    assert_eq!(sb.nr_free_blocks, full.nr_free_blocks);
}

#[test]
fn scenario_2_pinned_files_cannot_be_evicted() {
    let clock = ManualClock::new(60_000);
    let dev = fresh_device(512, &clock);
    let usage = Arc::new(InUseSet::default());
    let volume = open_with(
        dev,
        Arc::clone(&clock),
        Box::new(OldestMtime),
        usage.clone(),
    );

    let files = fill_directory(&volume, &clock, ROOT, "file");
    for file in &files {
        usage.mark(file.ino);
    }
    let full = volume.superblock();

    let err = volume.create(ROOT, "overflow", S_IFREG | 0o644).unwrap_err();
    assert_eq!(err.to_errno(), libc::EMLINK);
    assert_eq!(volume.readdir(ROOT).unwrap().len(), MAX_SUBFILES);
    let sb = volume.superblock();
    assert_eq!(sb.nr_free_inodes, full.nr_free_inodes);
    assert_eq!(sb.nr_free_blocks, full.nr_free_blocks);

    // Releasing one pin makes that file the only legal victim, age aside.
    usage.release(files[77].ino);
    volume.create(ROOT, "overflow", S_IFREG | 0o644).unwrap();
    let err = volume.lookup(ROOT, "file-077").unwrap_err();
    assert_eq!(err.to_errno(), libc::ENOENT);
    assert!(volume.lookup(ROOT, "file-000").is_ok());
    assert_eq!(volume.readdir(ROOT).unwrap().len(), MAX_SUBFILES);
}

#[test]
fn scenario_3_strategies_pick_different_victims() {
    for (strategy, expected_victim, expected_survivor, expected_name) in [
        (
            Box::new(OldestMtime) as Box<dyn EvictionStrategy>,
            "aged.dat",
            "big.dat",
            "oldest-mtime",
        ),
        (
            Box::new(LargestSize) as Box<dyn EvictionStrategy>,
            "big.dat",
            "aged.dat",
            "largest-size",
        ),
    ] {
        let clock = ManualClock::new(100);
        let dev = fresh_device(512, &clock);
        let volume = open_with(
            dev,
            Arc::clone(&clock),
            strategy,
            Arc::new(InUseSet::default()),
        );

        let aged = volume.create(ROOT, "aged.dat", S_IFREG | 0o644).unwrap();
        volume.write_file_data(aged.ino, 0, &[0x61; 512]).unwrap();
        clock.set(200);
        let big = volume.create(ROOT, "big.dat", S_IFREG | 0o644).unwrap();
        volume
            .write_file_data(big.ino, 0, &vec![0x62; 3 * BLOCK_SIZE as usize])
            .unwrap();

        let report = volume.reclaim(ROOT).unwrap();
        assert_eq!(report.name, expected_victim);
        assert_eq!(report.parent, ROOT);
        assert_eq!(report.strategy, expected_name);
        let err = volume.lookup(ROOT, expected_victim).unwrap_err();
        assert_eq!(err.to_errno(), libc::ENOENT);
        assert!(volume.lookup(ROOT, expected_survivor).is_ok());
    }
}

#[test]
fn scenario_4_eviction_stays_inside_the_parent_subtree() {
    let clock = ManualClock::new(10);
    let dev = fresh_device(512, &clock);
    let volume = open_default(dev, Arc::clone(&clock));

    // A root-level file older than everything below the subdirectory.
    let old_root = volume.create(ROOT, "old-root.dat", S_IFREG | 0o644).unwrap();
    clock.set(100);
    let boxdir = volume.mkdir(ROOT, "box", 0o755).unwrap();
    fill_directory(&volume, &clock, boxdir.ino, "box");

    // Overflowing the subdirectory only considers the subdirectory's
    // own subtree, so the older root file survives.
    clock.advance(1);
    volume.create(boxdir.ino, "box-128", S_IFREG | 0o644).unwrap();
    assert!(volume.lookup(ROOT, "old-root.dat").is_ok());
    let err = volume.lookup(boxdir.ino, "box-000").unwrap_err();
    assert_eq!(err.to_errno(), libc::ENOENT);

    // Reclaiming from the root walks the whole tree: first the root
    // file, then the oldest file nested inside the subdirectory.
    let report = volume.reclaim(ROOT).unwrap();
    assert_eq!(report.victim, old_root.ino);
    assert_eq!(report.parent, ROOT);

    let report = volume.reclaim(ROOT).unwrap();
    assert_eq!(report.name, "box-001");
    assert_eq!(report.parent, boxdir.ino);
}

#[test]
fn scenario_5_reclaim_reports_the_victim_or_fails() {
    let clock = ManualClock::new(70_000);
    let dev = fresh_device(512, &clock);
    let volume = open_default(dev, Arc::clone(&clock));

    // Nothing to evict on an empty volume.
    let err = volume.reclaim(ROOT).unwrap_err();
    assert_eq!(err.to_errno(), libc::ENOENT);

    // Directories are walked but never chosen.
    let adir = volume.mkdir(ROOT, "a", 0o755).unwrap();
    let err = volume.reclaim(ROOT).unwrap_err();
    assert_eq!(err.to_errno(), libc::ENOENT);

    let nested = volume.create(adir.ino, "victim.log", S_IFREG | 0o644).unwrap();
    let report = volume.reclaim(ROOT).unwrap();
    assert_eq!(report.victim, nested.ino);
    assert_eq!(report.parent, adir.ino);
    assert_eq!(report.name, "victim.log");
    assert_eq!(report.strategy, "oldest-mtime");
    assert!(volume.stat(adir.ino).unwrap().is_directory());
    assert_eq!(volume.lookup(adir.ino, "victim.log").unwrap_err().to_errno(), libc::ENOENT);

    // Reclaim starts at a directory, nothing else.
    let plain = volume.create(ROOT, "plain", S_IFREG | 0o644).unwrap();
    let err = volume.reclaim(plain.ino).unwrap_err();
    assert_eq!(err.to_errno(), libc::EINVAL);
    let err = volume.reclaim(InodeNumber(400)).unwrap_err();
    assert_eq!(err.to_errno(), libc::ENOENT);
}

#[test]
fn scenario_6_mtime_ties_keep_the_first_entry() {
    let clock = ManualClock::new(80_000);
    let dev = fresh_device(512, &clock);
    let volume = open_default(dev, Arc::clone(&clock));

    // Same mtime, same size. The entry earlier in table order wins.
    volume.create(ROOT, "first.log", S_IFREG | 0o644).unwrap();
    volume.create(ROOT, "second.log", S_IFREG | 0o644).unwrap();

    let report = volume.reclaim(ROOT).unwrap();
    assert_eq!(report.name, "first.log");
    assert!(volume.lookup(ROOT, "second.log").is_ok());
}

#[test]
fn scenario_7_directories_never_pay_for_the_slot() {
    let clock = ManualClock::new(90_000);
    let dev = fresh_device(512, &clock);
    let volume = open_default(dev, Arc::clone(&clock));

    for i in 0..MAX_SUBFILES {
        clock.advance(1);
        volume.mkdir(ROOT, &format!("dir-{i:03}"), 0o755).unwrap();
    }
    let full = volume.superblock();

    let err = volume.create(ROOT, "squeezed", S_IFREG | 0o644).unwrap_err();
    assert_eq!(err.to_errno(), libc::EMLINK);

    assert_eq!(volume.readdir(ROOT).unwrap().len(), MAX_SUBFILES);
    assert!(volume.lookup(ROOT, "dir-000").is_ok());
    assert!(volume.lookup(ROOT, "dir-127").is_ok());
    let sb = volume.superblock();
    assert_eq!(sb.nr_free_inodes, full.nr_free_inodes);
    assert_eq!(sb.nr_free_blocks, full.nr_free_blocks);
}
