#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use ofs_alloc::bitmap_count_free;
use ofs_block::{BlockDevice, ByteBlockDevice, FileByteDevice};
use ofs_core::{EvictionStrategy, LargestSize, OldestMtime, SystemClock, Volume, VolumeOptions};
use ofs_ondisk::Superblock;
use ofs_types::{BLOCK_SIZE, BlockNumber, InodeNumber};
use serde::Serialize;
use std::env;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Serialize)]
struct InspectOutput {
    nr_blocks: u32,
    nr_inodes: u32,
    nr_istore_blocks: u32,
    nr_ifree_blocks: u32,
    nr_bfree_blocks: u32,
    data_start: u32,
    recorded_free_inodes: u32,
    recorded_free_blocks: u32,
    counted_free_inodes: u32,
    counted_free_blocks: u32,
}

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    tracing_subscriber::fmt::init();

    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };

    match command.as_str() {
        "mkfs" => {
            let Some(path) = args.next() else {
                bail!("mkfs requires an image path");
            };
            let remaining: Vec<String> = args.collect();
            let mut blocks = None;
            let mut iter = remaining.iter();
            while let Some(arg) = iter.next() {
                match arg.as_str() {
                    "--blocks" => {
                        let Some(value) = iter.next() else {
                            bail!("--blocks requires a value");
                        };
                        blocks = Some(
                            value
                                .parse::<u64>()
                                .with_context(|| format!("invalid block count: {value}"))?,
                        );
                    }
                    other => bail!("unknown argument: {other}"),
                }
            }
            mkfs(Path::new(&path), blocks)
        }
        "inspect" => {
            let Some(path) = args.next() else {
                bail!("inspect requires a path argument");
            };
            let json = args.any(|arg| arg == "--json");
            inspect(Path::new(&path), json)
        }
        "ls" => {
            let Some(path) = args.next() else {
                bail!("ls requires a path argument");
            };
            let dir = match args.next() {
                Some(raw) => raw
                    .parse::<u32>()
                    .with_context(|| format!("invalid inode number: {raw}"))?,
                None => InodeNumber::ROOT.0,
            };
            ls(Path::new(&path), dir)
        }
        "reclaim" => {
            let Some(path) = args.next() else {
                bail!("reclaim requires a path argument");
            };
            let remaining: Vec<String> = args.collect();
            let mut strategy_name = "oldest".to_owned();
            let mut dir = InodeNumber::ROOT.0;
            let mut json = false;
            let mut iter = remaining.iter();
            while let Some(arg) = iter.next() {
                match arg.as_str() {
                    "--strategy" => {
                        let Some(value) = iter.next() else {
                            bail!("--strategy requires a value");
                        };
                        strategy_name = value.clone();
                    }
                    "--dir" => {
                        let Some(value) = iter.next() else {
                            bail!("--dir requires a value");
                        };
                        dir = value
                            .parse::<u32>()
                            .with_context(|| format!("invalid inode number: {value}"))?;
                    }
                    "--json" => json = true,
                    other => bail!("unknown argument: {other}"),
                }
            }
            reclaim(Path::new(&path), &strategy_name, dir, json)
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("ofs-cli\n");
    println!("USAGE:");
    println!("  ofs-cli mkfs <image-path> [--blocks N]");
    println!("  ofs-cli inspect <image-path> [--json]");
    println!("  ofs-cli ls <image-path> [inode]");
    println!("  ofs-cli reclaim <image-path> [--strategy oldest|largest] [--dir INODE] [--json]");
}

fn open_block_device(path: &Path) -> Result<ByteBlockDevice<FileByteDevice>> {
    let device = FileByteDevice::open(path)
        .with_context(|| format!("failed to open filesystem image: {}", path.display()))?;
    ByteBlockDevice::new(device, BLOCK_SIZE).with_context(|| {
        format!(
            "image is not a multiple of {BLOCK_SIZE} bytes: {}",
            path.display()
        )
    })
}

fn open_volume(path: &Path) -> Result<Volume> {
    let dev: Arc<dyn BlockDevice> = Arc::new(open_block_device(path)?);
    Volume::open(dev).with_context(|| format!("failed to open filesystem image: {}", path.display()))
}

fn mkfs(path: &Path, blocks: Option<u64>) -> Result<()> {
    let device = match blocks {
        Some(count) => FileByteDevice::create(path, count * u64::from(BLOCK_SIZE))
            .with_context(|| format!("failed to create image {}", path.display()))?,
        None => FileByteDevice::open(path)
            .with_context(|| format!("failed to open image {}", path.display()))?,
    };
    let dev = ByteBlockDevice::new(device, BLOCK_SIZE).with_context(|| {
        format!(
            "image is not a multiple of {BLOCK_SIZE} bytes: {}",
            path.display()
        )
    })?;
    let sb = Volume::format(&dev, &SystemClock)
        .with_context(|| format!("failed to format {}", path.display()))?;

    println!("formatted {}", path.display());
    println!("nr_blocks: {}", sb.nr_blocks);
    println!("nr_inodes: {}", sb.nr_inodes);
    println!("inode_store_blocks: {}", sb.nr_istore_blocks);
    println!("bitmap_blocks: {}", sb.nr_ifree_blocks + sb.nr_bfree_blocks);
    println!("data_start: {}", sb.data_start().0);
    println!("free_inodes: {}", sb.nr_free_inodes);
    println!("free_blocks: {}", sb.nr_free_blocks);
    Ok(())
}

fn inspect(path: &Path, json: bool) -> Result<()> {
    let dev = open_block_device(path)?;
    let raw = dev.read_block(BlockNumber(0))?;
    let sb = Superblock::parse_from_bytes(raw.as_slice())
        .with_context(|| format!("image is not an OublieFS volume: {}", path.display()))?;

    // Recount both free maps so stale counters are visible next to the
    // recorded ones.
    let ifree = read_bitmap(&dev, sb.ifree_start(), sb.nr_ifree_blocks)?;
    let bfree = read_bitmap(&dev, sb.bfree_start(), sb.nr_bfree_blocks)?;
    let output = InspectOutput {
        nr_blocks: sb.nr_blocks,
        nr_inodes: sb.nr_inodes,
        nr_istore_blocks: sb.nr_istore_blocks,
        nr_ifree_blocks: sb.nr_ifree_blocks,
        nr_bfree_blocks: sb.nr_bfree_blocks,
        data_start: sb.data_start().0,
        recorded_free_inodes: sb.nr_free_inodes,
        recorded_free_blocks: sb.nr_free_blocks,
        counted_free_inodes: bitmap_count_free(&ifree, sb.nr_inodes),
        counted_free_blocks: bitmap_count_free(&bfree, sb.nr_blocks),
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize output")?
        );
    } else {
        println!("OublieFS Inspector");
        println!("nr_blocks: {}", output.nr_blocks);
        println!("nr_inodes: {}", output.nr_inodes);
        println!("inode_store_blocks: {}", output.nr_istore_blocks);
        println!("inode_map_blocks: {}", output.nr_ifree_blocks);
        println!("block_map_blocks: {}", output.nr_bfree_blocks);
        println!("data_start: {}", output.data_start);
        println!("recorded_free_inodes: {}", output.recorded_free_inodes);
        println!("recorded_free_blocks: {}", output.recorded_free_blocks);
        println!("counted_free_inodes: {}", output.counted_free_inodes);
        println!("counted_free_blocks: {}", output.counted_free_blocks);
    }

    Ok(())
}

fn read_bitmap(dev: &dyn BlockDevice, start: BlockNumber, count: u32) -> Result<Vec<u8>> {
    let mut map = Vec::with_capacity(count as usize * BLOCK_SIZE as usize);
    for i in 0..count {
        let block = dev.read_block(BlockNumber(start.0 + i))?;
        map.extend_from_slice(block.as_slice());
    }
    Ok(map)
}

fn ls(path: &Path, dir: u32) -> Result<()> {
    let volume = open_volume(path)?;
    let entries = volume
        .readdir(InodeNumber(dir))
        .with_context(|| format!("failed to list inode {dir}"))?;
    for entry in &entries {
        let attr = volume.stat(entry.ino)?;
        let kind = if attr.is_directory() { 'd' } else { '-' };
        let perm = attr.mode & 0o7777;
        println!(
            "{kind} {perm:04o} {size:>10} {mtime:>10} ino={ino:<5} {name}",
            size = attr.size,
            mtime = attr.mtime,
            ino = attr.ino.0,
            name = entry.name
        );
    }
    println!("{} entries", entries.len());
    Ok(())
}

fn reclaim(path: &Path, strategy_name: &str, dir: u32, json: bool) -> Result<()> {
    let strategy: Box<dyn EvictionStrategy> = match strategy_name {
        "oldest" | "oldest-mtime" => Box::new(OldestMtime),
        "largest" | "largest-size" => Box::new(LargestSize),
        other => bail!("unknown strategy: {other} (expected oldest or largest)"),
    };

    let dev: Arc<dyn BlockDevice> = Arc::new(open_block_device(path)?);
    let volume = Volume::open_with_options(
        dev,
        VolumeOptions {
            strategy,
            ..VolumeOptions::default()
        },
    )
    .with_context(|| format!("failed to open filesystem image: {}", path.display()))?;

    let report = volume
        .reclaim(InodeNumber(dir))
        .with_context(|| format!("no file could be reclaimed under inode {dir}"))?;
    volume.sync().context("sync image")?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serialize output")?
        );
    } else {
        println!("evicted: {}", report.name);
        println!("inode: {}", report.victim.0);
        println!("parent: {}", report.parent.0);
        println!("strategy: {}", report.strategy);
    }

    Ok(())
}
