//! Helpers for testing the caches.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. When dropped too early, the file cache creates the directory
//!    again lazily after it has been deleted, and leaks it. To avoid this, assign it to a variable
//!    in the test function (e.g. `let cache_dir = test::tempdir()`).

use std::fs;
use std::path::{Path, PathBuf};

use filetime::FileTime;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `proxycache` crates and mutes all
///    other logs (such as hyper or reqwest).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("proxycache_service=trace,proxycache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped. Use it as a guard to
/// automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// Writes `size` bytes to `path`, creating parent directories, and sets its access time.
///
/// The access time is given in seconds since the epoch, which orders files for eviction.
pub fn write_file_with_atime(path: impl AsRef<Path>, size: usize, atime_secs: i64) {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, vec![b'x'; size]).unwrap();
    set_atime(path, atime_secs);
}

/// Sets the access time of `path`, keeping its modification time.
pub fn set_atime(path: impl AsRef<Path>, atime_secs: i64) {
    filetime::set_file_atime(path, FileTime::from_unix_time(atime_secs, 0)).unwrap();
}

/// Lists all files below `dir`, relative to it and sorted.
pub fn list_files(dir: impl AsRef<Path>) -> Vec<PathBuf> {
    fn walk(root: &Path, dir: &Path, files: &mut Vec<PathBuf>) {
        for entry in fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                walk(root, &path, files);
            } else {
                files.push(path.strip_prefix(root).unwrap().to_owned());
            }
        }
    }

    let dir = dir.as_ref();
    let mut files = Vec::new();
    walk(dir, dir, &mut files);
    files.sort();
    files
}
