//! Quota enforcement and clean scheduling of the [`FileCache`](super::FileCache).
//!
//! A clean pass measures the cache directory and, once it exceeds 125% of its target, evicts
//! the files with the oldest access time until usage is down to 75% of the target. Since
//! many processes may share one cache directory, passes are coordinated through two marker
//! files in the cache root: one holding the next scheduled clean time, and one acting as a
//! cross-process lock while a pass is running.

use std::collections::BinaryHeap;
use std::fs::{self, Metadata};
use std::io;
use std::path::{Path, PathBuf};

use filetime::FileTime;

use super::filename::{CLEAN_LOCK_FILENAME, CLEAN_TIME_FILENAME};
use super::lock::FileLock;
use super::FileCacheConfig;
use crate::clock::duration_ms;

/// What a single clean pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanReport {
    /// Bytes used by files before cleaning.
    pub size_before: u64,
    /// Number of files and directories before cleaning.
    pub inodes_before: u64,
    /// Whether usage was below the thresholds, so that nothing had to be evicted.
    pub below_threshold: bool,
    pub evicted_files: u64,
    pub freed_bytes: u64,
    pub removed_dirs: u64,
    /// `false` if any listing, stat or deletion failed during the pass.
    pub success: bool,
}

/// An eviction candidate.
///
/// Orders by access time first, so that a max-heap of these keeps the most recently used
/// file on top.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct FileInfo {
    atime: FileTime,
    size: u64,
    path: PathBuf,
}

/// Walks all files below `dir`, calling `visit` for each of them.
///
/// Directories are counted as inodes but not visited. The marker files in the root are
/// skipped. Returns `false` if any listing or stat failed.
fn walk(
    root: &Path,
    dir: &Path,
    inodes: &mut u64,
    visit: &mut dyn FnMut(PathBuf, &Metadata),
) -> bool {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(
                error = &e as &dyn std::error::Error,
                path = %dir.display(),
                "Failed to list cache directory"
            );
            return false;
        }
    };

    let mut success = true;
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(_) => {
                success = false;
                continue;
            }
        };
        let path = entry.path();
        let metadata = match fs::symlink_metadata(&path) {
            Ok(metadata) => metadata,
            // deleted concurrently
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => {
                tracing::warn!(
                    error = &e as &dyn std::error::Error,
                    path = %path.display(),
                    "Failed to stat cache file"
                );
                success = false;
                continue;
            }
        };

        if metadata.is_dir() {
            *inodes += 1;
            success &= walk(root, &path, inodes, visit);
        } else if dir != root || !is_marker(&path) {
            *inodes += 1;
            visit(path, &metadata);
        }
    }
    success
}

fn is_marker(path: &Path) -> bool {
    path.file_name()
        .is_some_and(|name| name == CLEAN_TIME_FILENAME || name == CLEAN_LOCK_FILENAME)
}

fn scaled(target: u64, factor: f64) -> u64 {
    (target as f64 * factor) as u64
}

/// Runs one clean pass over the cache directory at `root`.
///
/// This does not look at the schedule or the clean lock, see [`clean_with_locking`].
pub fn clean(root: &Path, config: &FileCacheConfig) -> CleanReport {
    let mut report = CleanReport::default();

    let mut size = 0;
    let mut inodes = 0;
    let measured = walk(root, root, &mut inodes, &mut |_, metadata| {
        size += metadata.len();
    });
    report.size_before = size;
    report.inodes_before = inodes;

    let size_exceeded = size >= scaled(config.target_size, 1.25);
    let inodes_exceeded = config
        .target_inode_count
        .is_some_and(|target| inodes >= scaled(target, 1.25));
    if !size_exceeded && !inodes_exceeded {
        tracing::debug!(size, inodes, "Cache usage is below threshold, not cleaning");
        report.below_threshold = true;
        report.success = measured;
        return report;
    }

    let bytes_to_free = size.saturating_sub(scaled(config.target_size, 0.75));
    let files_to_free = config
        .target_inode_count
        .map_or(0, |target| inodes.saturating_sub(scaled(target, 0.75)));
    tracing::info!(size, inodes, bytes_to_free, files_to_free, "Cleaning file cache");

    // Keep only the oldest files that are needed to free enough space: whenever the
    // newest candidate is not needed, it is popped off again.
    let mut candidates = BinaryHeap::new();
    let mut candidate_bytes = 0u64;
    let mut inodes = 0;
    let listed = walk(root, root, &mut inodes, &mut |path, metadata| {
        let size = metadata.len();
        candidates.push(FileInfo {
            atime: FileTime::from_last_access_time(metadata),
            size,
            path,
        });
        candidate_bytes += size;

        while let Some(newest) = candidates.peek() {
            let remaining_bytes = candidate_bytes - newest.size;
            let remaining_files = candidates.len() as u64 - 1;
            if remaining_bytes < bytes_to_free || remaining_files < files_to_free {
                break;
            }
            candidate_bytes = remaining_bytes;
            candidates.pop();
        }
    });

    let mut deleted = true;
    for file in candidates.into_sorted_vec() {
        match fs::remove_file(&file.path) {
            Ok(()) => {
                report.evicted_files += 1;
                report.freed_bytes += file.size;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(
                    error = &e as &dyn std::error::Error,
                    path = %file.path.display(),
                    "Failed to evict cache file"
                );
                deleted = false;
            }
        }
    }

    let pruned = prune_empty_dirs(root, true, &mut report.removed_dirs);
    report.success = measured && listed && deleted && pruned;

    tracing::info!(
        "Evicted {} files and {} directories, totaling {} bytes",
        report.evicted_files,
        report.removed_dirs,
        report.freed_bytes
    );
    report
}

/// Removes all empty directories below `dir`. The root itself is kept.
fn prune_empty_dirs(dir: &Path, is_root: bool, removed: &mut u64) -> bool {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return true,
        Err(_) => return false,
    };

    let mut success = true;
    for entry in entries.flatten() {
        let path = entry.path();
        if entry.file_type().is_ok_and(|t| t.is_dir()) {
            success &= prune_empty_dirs(&path, false, removed);
        }
    }

    if !is_root {
        let is_empty = fs::read_dir(dir).is_ok_and(|mut entries| entries.next().is_none());
        if is_empty {
            match fs::remove_dir(dir) {
                Ok(()) => *removed += 1,
                // a concurrent write may have created a file in the meantime
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::debug!(
                        error = &e as &dyn std::error::Error,
                        path = %dir.display(),
                        "Failed to remove empty cache directory"
                    );
                }
            }
        }
    }
    success
}

/// The decision of [`should_clean`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanSchedule {
    pub should_clean: bool,
    /// When the next clean is due. This is `now + interval` when cleaning now, or the
    /// persisted time otherwise.
    pub next_clean_ms: i64,
}

/// Decides whether a clean is due, based on the clean time persisted in the cache root.
///
/// A missing or unreadable marker, or a persisted time more than one interval in the future,
/// means cleaning right away.
pub fn should_clean(root: &Path, now_ms: i64, interval_ms: i64) -> CleanSchedule {
    let clean_now = CleanSchedule {
        should_clean: true,
        next_clean_ms: now_ms.saturating_add(interval_ms),
    };

    let path = root.join(CLEAN_TIME_FILENAME);
    let contents = match fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(e) => {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(
                    error = &e as &dyn std::error::Error,
                    "Failed to read clean time, cleaning now"
                );
            }
            return clean_now;
        }
    };
    let Ok(persisted) = contents.trim().parse::<i64>() else {
        tracing::warn!(contents = %contents.trim(), "Malformed clean time, cleaning now");
        return clean_now;
    };

    if persisted > now_ms.saturating_add(interval_ms) {
        tracing::warn!(
            persisted,
            now_ms,
            "Clean time is too far in the future, cleaning now"
        );
        return clean_now;
    }
    if now_ms >= persisted {
        return clean_now;
    }

    CleanSchedule {
        should_clean: false,
        next_clean_ms: persisted,
    }
}

/// Persists the next clean time into the cache root.
pub fn write_clean_time(root: &Path, next_clean_ms: i64) -> io::Result<()> {
    fs::write(root.join(CLEAN_TIME_FILENAME), next_clean_ms.to_string())
}

/// Runs a clean pass while holding the clean lock of the cache root.
///
/// Returns `Ok(None)` without cleaning if another process holds the lock. The next clean time
/// is persisted before cleaning, so that other processes back off for a whole interval.
pub fn clean_with_locking(
    root: &Path,
    config: &FileCacheConfig,
    now_ms: i64,
) -> io::Result<Option<CleanReport>> {
    let lock_path = root.join(CLEAN_LOCK_FILENAME);
    let Some(_lock) = FileLock::try_acquire(&lock_path, config.clean_lock_timeout)? else {
        tracing::debug!(root = %root.display(), "Clean lock is held elsewhere, skipping");
        return Ok(None);
    };

    let next_clean_ms = now_ms.saturating_add(duration_ms(config.clean_interval));
    if let Err(e) = write_clean_time(root, next_clean_ms) {
        tracing::warn!(
            error = &e as &dyn std::error::Error,
            "Failed to persist next clean time"
        );
    }

    Ok(Some(clean(root, config)))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn config(target_size: u64) -> FileCacheConfig {
        FileCacheConfig {
            target_size,
            ..Default::default()
        }
    }

    fn create_file(root: &Path, name: &str, size: usize, atime: i64) -> PathBuf {
        let path = root.join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, vec![b'x'; size]).unwrap();
        filetime::set_file_atime(&path, FileTime::from_unix_time(atime, 0)).unwrap();
        path
    }

    #[test]
    fn test_below_threshold_does_nothing() {
        let dir = tempfile::tempdir().unwrap();
        create_file(dir.path(), "a", 100, 1000);
        create_file(dir.path(), "b", 100, 2000);

        let report = clean(dir.path(), &config(200));
        assert!(report.below_threshold);
        assert!(report.success);
        assert_eq!(report.size_before, 200);
        assert_eq!(report.evicted_files, 0);
        assert!(dir.path().join("a").exists());
    }

    #[test]
    fn test_evicts_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        // 1500 bytes for a target of 1000, so 750 bytes need to go
        let oldest = create_file(root, "sub/oldest", 300, 1000);
        let older = create_file(root, "other/older", 300, 2000);
        let old = create_file(root, "old", 300, 3000);
        let newer = create_file(root, "sub/newer", 300, 4000);
        let newest = create_file(root, "newest", 300, 5000);
        write_clean_time(root, 42).unwrap();

        let report = clean(root, &config(1000));
        assert!(report.success);
        assert!(!report.below_threshold);
        assert_eq!(report.size_before, 1500);
        assert_eq!(report.evicted_files, 3);
        assert_eq!(report.freed_bytes, 900);

        assert!(!oldest.exists());
        assert!(!older.exists());
        assert!(!old.exists());
        assert!(newer.exists());
        assert!(newest.exists());
        assert!(root.join(CLEAN_TIME_FILENAME).exists());

        // `other` is now empty and pruned, `sub` still holds a file
        assert_eq!(report.removed_dirs, 1);
        assert!(!root.join("other").exists());
        assert!(root.join("sub").exists());
    }

    #[test]
    fn test_cleans_down_to_target() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..30 {
            create_file(dir.path(), &format!("dir{}/file{i}", i % 4), 50, 1000 + i);
        }

        let report = clean(dir.path(), &config(1000));
        assert!(report.success);
        let remaining = report.size_before - report.freed_bytes;
        assert!(remaining <= 750);
        assert!(remaining > 700);
    }

    #[test]
    fn test_inode_target() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..20 {
            create_file(dir.path(), &format!("f{i:02}"), 1, 1000 + i);
        }
        let config = FileCacheConfig {
            target_size: 1_000_000,
            target_inode_count: Some(10),
            ..Default::default()
        };

        let report = clean(dir.path(), &config);
        assert_eq!(report.inodes_before, 20);
        assert_eq!(report.evicted_files, 13);
        assert!(!dir.path().join("f12").exists());
        assert!(dir.path().join("f13").exists());
    }

    #[test]
    fn test_should_clean_without_marker() {
        let dir = tempfile::tempdir().unwrap();
        let schedule = should_clean(dir.path(), 10_000, 1_000);
        assert_eq!(
            schedule,
            CleanSchedule {
                should_clean: true,
                next_clean_ms: 11_000
            }
        );

        fs::write(dir.path().join(CLEAN_TIME_FILENAME), "garbage").unwrap();
        assert!(should_clean(dir.path(), 10_000, 1_000).should_clean);
    }

    #[test]
    fn test_should_clean_follows_marker() {
        let dir = tempfile::tempdir().unwrap();
        write_clean_time(dir.path(), 10_500).unwrap();

        let before = should_clean(dir.path(), 10_000, 1_000);
        assert!(!before.should_clean);
        assert_eq!(before.next_clean_ms, 10_500);

        assert!(should_clean(dir.path(), 10_500, 1_000).should_clean);
        assert!(should_clean(dir.path(), 12_000, 1_000).should_clean);
    }

    #[test]
    fn test_should_clean_heals_far_future_marker() {
        let dir = tempfile::tempdir().unwrap();
        write_clean_time(dir.path(), 50_000).unwrap();

        let schedule = should_clean(dir.path(), 10_000, 1_000);
        assert!(schedule.should_clean);
        assert_eq!(schedule.next_clean_ms, 11_000);
    }

    #[test]
    fn test_clean_with_locking() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        create_file(root, "a", 2000, 1000);
        let config = FileCacheConfig {
            target_size: 1000,
            clean_interval: Duration::from_secs(10),
            ..Default::default()
        };

        let lock_path = root.join(CLEAN_LOCK_FILENAME);
        let held = FileLock::try_acquire(&lock_path, Duration::from_secs(60))
            .unwrap()
            .unwrap();
        assert_eq!(clean_with_locking(root, &config, 5_000).unwrap(), None);
        assert!(root.join("a").exists());
        drop(held);

        let report = clean_with_locking(root, &config, 5_000).unwrap().unwrap();
        assert_eq!(report.evicted_files, 1);
        assert!(!root.join(CLEAN_LOCK_FILENAME).exists());
        let persisted = fs::read_to_string(root.join(CLEAN_TIME_FILENAME)).unwrap();
        assert_eq!(persisted, "15000");
    }
}
