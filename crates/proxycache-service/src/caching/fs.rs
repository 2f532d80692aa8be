use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use filetime::FileTime;
use rand::Rng;
use tempfile::NamedTempFile;

use super::cleanup::{self, CleanReport};
use super::filename::key_path;
use super::worker::SlotWorker;
use super::{CacheInterface, Callback, FileCacheConfig, KeyState, Lookup, SharedBuffer};
use crate::clock::{duration_ms, ClockRef};

/// Counters of a [`FileCache`].
#[derive(Debug, Default)]
pub struct FileCacheStats {
    cleanups: AtomicU64,
    evictions: AtomicU64,
    bytes_freed: AtomicU64,
    skipped_cleanups: AtomicU64,
    write_errors: AtomicU64,
}

impl FileCacheStats {
    /// Number of clean passes that ran, including ones that found usage below threshold.
    pub fn cleanups(&self) -> u64 {
        self.cleanups.load(Ordering::Relaxed)
    }

    /// Number of evicted files.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn bytes_freed(&self) -> u64 {
        self.bytes_freed.load(Ordering::Relaxed)
    }

    /// Number of due clean passes skipped because another process held the clean lock.
    pub fn skipped_cleanups(&self) -> u64 {
        self.skipped_cleanups.load(Ordering::Relaxed)
    }

    pub fn write_errors(&self) -> u64 {
        self.write_errors.load(Ordering::Relaxed)
    }
}

/// The part of a [`FileCache`] shared with its background clean job.
#[derive(Debug)]
struct Cleaner {
    name: String,
    root: PathBuf,
    config: FileCacheConfig,
    clock: ClockRef,
    next_clean_ms: AtomicI64,
    stats: FileCacheStats,
}

impl Cleaner {
    /// Cleans if the persisted schedule says so. Runs on the clean worker.
    fn run_scheduled(&self) {
        let now_ms = self.clock.now_ms();
        let interval_ms = duration_ms(self.config.clean_interval);
        let schedule = cleanup::should_clean(&self.root, now_ms, interval_ms);
        self.next_clean_ms
            .store(schedule.next_clean_ms, Ordering::Release);
        if !schedule.should_clean {
            return;
        }

        if let Err(e) = self.clean_now(now_ms) {
            tracing::error!(
                error = &e as &dyn std::error::Error,
                cache = %self.name,
                "Failed to clean file cache"
            );
        }
    }

    fn clean_now(&self, now_ms: i64) -> io::Result<Option<CleanReport>> {
        let start = Instant::now();
        let report = cleanup::clean_with_locking(&self.root, &self.config, now_ms)?;
        metric!(timer("disk_cache.clean.duration") = start.elapsed(), "cache" => &self.name);

        match report {
            Some(report) => self.record(&report),
            None => {
                self.stats.skipped_cleanups.fetch_add(1, Ordering::Relaxed);
                metric!(counter("disk_cache.skipped_cleanups") += 1, "cache" => &self.name);
            }
        }
        Ok(report)
    }

    fn record(&self, report: &CleanReport) {
        let stats = &self.stats;
        stats.cleanups.fetch_add(1, Ordering::Relaxed);
        stats
            .evictions
            .fetch_add(report.evicted_files, Ordering::Relaxed);
        stats
            .bytes_freed
            .fetch_add(report.freed_bytes, Ordering::Relaxed);

        metric!(counter("disk_cache.cleanups") += 1, "cache" => &self.name);
        metric!(counter("disk_cache.evictions") += report.evicted_files as i64, "cache" => &self.name);
        metric!(counter("disk_cache.bytes_freed") += report.freed_bytes as i64, "cache" => &self.name);
        metric!(gauge("disk_cache.size.bytes") = report.size_before - report.freed_bytes, "cache" => &self.name);
    }
}

/// The persistent tier, storing one file per key below a root directory.
///
/// Reads and writes happen synchronously on the calling thread. Writes go to a temporary file
/// that is renamed into place, so readers never observe partial files. After a write, a
/// quota clean is scheduled on a background thread if one is due.
///
/// Access times are bumped on every hit, as eviction picks the files with the oldest access
/// time and many filesystems are mounted with `noatime`.
pub struct FileCache {
    cleaner: Arc<Cleaner>,
    worker: SlotWorker,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for FileCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileCache")
            .field("name", &self.cleaner.name)
            .field("root", &self.cleaner.root)
            .finish()
    }
}

impl FileCache {
    /// Opens the cache at `root`, creating the directory if needed.
    ///
    /// The first clean check is scheduled at a random offset within one clean interval, so
    /// that many processes started at once do not all check at the same time.
    pub fn new<R: Rng>(
        name: impl Into<String>,
        root: impl Into<PathBuf>,
        config: FileCacheConfig,
        clock: ClockRef,
        rng: &mut R,
    ) -> io::Result<Self> {
        let name = name.into();
        let root = root.into();
        std::fs::create_dir_all(&root)?;

        let interval_ms = duration_ms(config.clean_interval);
        let offset_ms = if interval_ms > 0 {
            rng.gen_range(0..interval_ms)
        } else {
            0
        };
        let next_clean_ms = clock.now_ms().saturating_add(offset_ms);

        let worker = SlotWorker::start("file-cache-cleaner")?;
        tracing::debug!(cache = %name, root = %root.display(), "Opened file cache");

        Ok(Self {
            cleaner: Arc::new(Cleaner {
                name,
                root,
                config,
                clock,
                next_clean_ms: AtomicI64::new(next_clean_ms),
                stats: FileCacheStats::default(),
            }),
            worker,
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn root(&self) -> &Path {
        &self.cleaner.root
    }

    pub fn stats(&self) -> &FileCacheStats {
        &self.cleaner.stats
    }

    /// The time of the next clean check, in milliseconds since the unix epoch.
    pub fn next_clean_ms(&self) -> i64 {
        self.cleaner.next_clean_ms.load(Ordering::Acquire)
    }

    /// Whether a clean check is currently running in the background.
    pub fn is_cleaning(&self) -> bool {
        self.worker.is_busy()
    }

    /// Runs a clean pass right away on the calling thread, ignoring the schedule.
    ///
    /// Returns `Ok(None)` if another process holds the clean lock.
    pub fn clean_now(&self) -> io::Result<Option<CleanReport>> {
        let now_ms = self.cleaner.clock.now_ms();
        self.cleaner.clean_now(now_ms)
    }

    /// Hands a clean check to the background worker if one is due.
    fn check_clean(&self) {
        let now_ms = self.cleaner.clock.now_ms();
        if now_ms < self.next_clean_ms() {
            return;
        }
        let cleaner = Arc::clone(&self.cleaner);
        self.worker.run_if_not_busy(move || cleaner.run_scheduled());
    }

    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    fn path(&self, key: &str) -> PathBuf {
        key_path(&self.cleaner.root, key)
    }
}

impl CacheInterface for FileCache {
    fn name(&self) -> String {
        format!("FileCache({})", self.cleaner.name)
    }

    fn get(&self, key: &str, callback: Callback) {
        if self.is_shut_down() {
            return callback(Lookup::not_found());
        }

        let path = self.path(key);
        let lookup = match std::fs::read(&path) {
            Ok(contents) => {
                // not being able to bump the atime only makes the entry an earlier eviction
                // candidate
                filetime::set_file_atime(&path, FileTime::now()).ok();
                metric!(counter("caches.file.hit") += 1, "cache" => &self.cleaner.name);
                Lookup::found(contents.into())
            }
            Err(_) => {
                metric!(counter("caches.file.miss") += 1, "cache" => &self.cleaner.name);
                Lookup::not_found()
            }
        };
        callback(lookup)
    }

    fn put(&self, key: &str, value: SharedBuffer) {
        if self.is_shut_down() {
            return;
        }

        let path = self.path(key);
        if let Err(e) = write_file(&path, &value) {
            self.cleaner
                .stats
                .write_errors
                .fetch_add(1, Ordering::Relaxed);
            metric!(counter("disk_cache.write_errors") += 1, "cache" => &self.cleaner.name);
            tracing::error!(
                error = &e as &dyn std::error::Error,
                path = %path.display(),
                "Failed to write cache file"
            );
        }
        self.check_clean();
    }

    fn delete(&self, key: &str) {
        let path = self.path(key);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    path = %path.display(),
                    "Failed to delete cache file"
                );
            }
        }
    }

    fn query(&self, key: &str) -> KeyState {
        if !self.is_shut_down() && self.path(key).is_file() {
            KeyState::Available
        } else {
            KeyState::NotFound
        }
    }

    fn shut_down(&self) {
        self.shut_down.store(true, Ordering::Release);
        self.worker.shut_down();
    }
}

/// Writes `contents` into a sibling temp file and renames it over `path`.
fn write_file(path: &Path, contents: &[u8]) -> io::Result<()> {
    let parent = path.parent().ok_or_else(|| {
        io::Error::new(io::ErrorKind::Other, "no parent directory to persist item")
    })?;
    std::fs::create_dir_all(parent)?;

    let mut temp_file = NamedTempFile::new_in(parent)?;
    temp_file.write_all(contents)?;
    persist_tempfile(temp_file, path)
}

fn persist_tempfile(mut temp_file: NamedTempFile, path: &Path) -> io::Result<()> {
    let parent = path.parent().ok_or_else(|| {
        io::Error::new(io::ErrorKind::Other, "no parent directory to persist item")
    })?;

    // A concurrent clean pass may prune the parent directory between creating the temp
    // file and renaming it, so the directory is recreated a few times.
    const MAX_RETRIES: usize = 2;
    let mut retries = 0;
    loop {
        retries += 1;

        if let Err(e) = std::fs::create_dir_all(parent) {
            if retries > MAX_RETRIES {
                return Err(e);
            }
            continue;
        }

        match temp_file.persist(path) {
            Ok(_) => return Ok(()),
            Err(e) => {
                temp_file = e.file;
                if retries > MAX_RETRIES {
                    return Err(e.error);
                }
            }
        }
    }
}
