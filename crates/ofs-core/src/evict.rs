//! Victim selection for directory-overflow reclamation.
//!
//! When a create lands in a full directory, the volume runs one
//! reclamation pass: walk the tree from a starting directory, consider
//! every regular file that is not currently in use, and keep the single
//! best candidate under the volume's [`EvictionStrategy`]. Selection never
//! mutates anything and pins only the directory it is currently reading;
//! the volume deletes the winner through the ordinary removal path
//! afterwards, re-validating it under the parent directory's lock because
//! the tree may have changed between scan and deletion.

use std::cmp::Ordering;
use std::collections::{HashSet, VecDeque};

use ofs_dir::list_entries;
use ofs_error::Result;
use ofs_types::InodeNumber;
use tracing::{debug, info, warn};

use crate::Volume;

// ── Strategies ──────────────────────────────────────────────────────────────

/// A candidate file seen during the reclamation walk.
///
/// Carries inode numbers rather than records so the two-phase
/// scan-then-delete never holds live metadata across the gap; the volume
/// re-reads everything it needs before deleting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictCandidate {
    /// The file itself.
    pub ino: InodeNumber,
    /// Directory holding its entry at scan time.
    pub parent: InodeNumber,
    /// Name it was found under at scan time.
    pub name: String,
    /// Modification time at scan time.
    pub mtime: u32,
    /// Size in bytes at scan time.
    pub size: u32,
}

/// Ranks reclamation candidates.
///
/// `compare(victim, candidate)` returning [`Ordering::Greater`] means
/// `candidate` is the better victim and replaces the running one; `Less`
/// or `Equal` keeps the current victim, so ties go to the candidate seen
/// first in traversal order.
pub trait EvictionStrategy: Send + Sync {
    /// Short identifier used in logs and reclaim reports.
    fn name(&self) -> &'static str;

    /// Rank `candidate` against the current `victim`.
    fn compare(&self, victim: &EvictCandidate, candidate: &EvictCandidate) -> Ordering;
}

/// Prefer the file with the oldest modification time. The default.
#[derive(Debug, Clone, Copy, Default)]
pub struct OldestMtime;

impl EvictionStrategy for OldestMtime {
    fn name(&self) -> &'static str {
        "oldest-mtime"
    }

    fn compare(&self, victim: &EvictCandidate, candidate: &EvictCandidate) -> Ordering {
        victim.mtime.cmp(&candidate.mtime)
    }
}

/// Prefer the largest file, freeing the most blocks per pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct LargestSize;

impl EvictionStrategy for LargestSize {
    fn name(&self) -> &'static str {
        "largest-size"
    }

    fn compare(&self, victim: &EvictCandidate, candidate: &EvictCandidate) -> Ordering {
        candidate.size.cmp(&victim.size)
    }
}

fn replaces(
    strategy: &dyn EvictionStrategy,
    victim: &EvictCandidate,
    candidate: &EvictCandidate,
) -> bool {
    strategy.compare(victim, candidate).is_gt()
}

// ── Selection walk ──────────────────────────────────────────────────────────

/// Walk the tree under `start` and pick the best eligible victim.
///
/// Traversal is breadth-first with a directory's entries ranked in table
/// order before anything deeper, which keeps tie-breaking deterministic
/// for a given tree. Directories that vanish or fail to read mid-walk are
/// skipped rather than aborting the pass; each directory is locked only
/// while its table is copied, so the walk never holds two locks and
/// concurrent mutation elsewhere in the tree is expected.
pub(crate) fn find_victim(
    volume: &Volume,
    strategy: &dyn EvictionStrategy,
    start: InodeNumber,
) -> Result<Option<EvictCandidate>> {
    let mut best: Option<EvictCandidate> = None;
    let mut queue = VecDeque::from([start]);
    let mut visited = HashSet::new();
    let mut skipped_in_use = 0_u32;

    while let Some(dir) = queue.pop_front() {
        if !visited.insert(dir.0) {
            warn!(dir = dir.0, "reclaim walk: directory visited twice, cycle in tree");
            continue;
        }
        let dir_lock = volume.lock_for(dir);
        let guard = dir_lock.lock();
        let dir_inode = match volume.read_live_inode(dir) {
            Ok(inode) if inode.is_directory() => inode,
            Ok(_) => {
                debug!(dir = dir.0, "reclaim walk: no longer a directory, skipping");
                continue;
            }
            Err(err) => {
                warn!(dir = dir.0, error = %err, "reclaim walk: unreadable directory, skipping");
                continue;
            }
        };
        let table = match volume.read_dir_table(dir, &dir_inode) {
            Ok(table) => table,
            Err(err) => {
                warn!(dir = dir.0, error = %err, "reclaim walk: unreadable entry table, skipping");
                continue;
            }
        };
        drop(guard);

        for entry in list_entries(&table)? {
            let child = match volume.read_live_inode(entry.ino) {
                Ok(child) => child,
                Err(err) => {
                    warn!(
                        dir = dir.0,
                        ino = entry.ino.0,
                        name = %entry.name,
                        error = %err,
                        "reclaim walk: unreadable child inode, skipping"
                    );
                    continue;
                }
            };
            if child.is_directory() {
                queue.push_back(entry.ino);
                continue;
            }
            if !child.is_regular() {
                continue;
            }
            if volume.file_in_use(entry.ino) {
                info!(ino = entry.ino.0, name = %entry.name, "reclaim walk: file in use, not evictable");
                skipped_in_use += 1;
                continue;
            }
            let candidate = EvictCandidate {
                ino: entry.ino,
                parent: dir,
                name: entry.name,
                mtime: child.mtime,
                size: child.size,
            };
            best = Some(match best.take() {
                None => candidate,
                Some(victim) if replaces(strategy, &victim, &candidate) => candidate,
                Some(victim) => victim,
            });
        }
    }

    match &best {
        Some(victim) => debug!(
            ino = victim.ino.0,
            parent = victim.parent.0,
            strategy = strategy.name(),
            "reclaim walk: victim selected"
        ),
        None => debug!(
            start = start.0,
            skipped_in_use, "reclaim walk: no evictable file found"
        ),
    }
    Ok(best)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(ino: u32, mtime: u32, size: u32) -> EvictCandidate {
        EvictCandidate {
            ino: InodeNumber(ino),
            parent: InodeNumber(0),
            name: format!("f{ino}"),
            mtime,
            size,
        }
    }

    #[test]
    fn oldest_mtime_prefers_older_files() {
        let old = candidate(1, 100, 4096);
        let new = candidate(2, 200, 4096);
        assert!(replaces(&OldestMtime, &new, &old));
        assert!(!replaces(&OldestMtime, &old, &new));
    }

    #[test]
    fn largest_size_prefers_bigger_files() {
        let small = candidate(1, 100, 512);
        let big = candidate(2, 100, 8192);
        assert!(replaces(&LargestSize, &small, &big));
        assert!(!replaces(&LargestSize, &big, &small));
    }

    #[test]
    fn ties_keep_the_first_found_candidate() {
        let first = candidate(1, 100, 4096);
        let second = candidate(2, 100, 4096);
        assert_eq!(OldestMtime.compare(&first, &second), Ordering::Equal);
        assert_eq!(LargestSize.compare(&first, &second), Ordering::Equal);
        assert!(!replaces(&OldestMtime, &first, &second));
        assert!(!replaces(&LargestSize, &first, &second));
    }

    #[test]
    fn strategies_disagree_when_age_and_size_disagree() {
        // Older but smaller against newer but larger.
        let dusty = candidate(1, 100, 512);
        let heavy = candidate(2, 200, 65536);
        assert!(!replaces(&OldestMtime, &dusty, &heavy));
        assert!(replaces(&LargestSize, &dusty, &heavy));
    }

    #[test]
    fn strategy_names_are_stable() {
        assert_eq!(OldestMtime.name(), "oldest-mtime");
        assert_eq!(LargestSize.name(), "largest-size");
    }
}
