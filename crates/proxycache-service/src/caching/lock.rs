use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

/// A cross-process lock backed by the existence of a file.
///
/// The lock is released by removing the file when dropped. A lock file whose mtime is older
/// than the timeout is considered abandoned by a crashed holder and is taken over. Taking
/// over moves the abandoned file aside and creates a fresh one, so of several processes
/// racing for the same abandoned lock only one wins.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
}

impl FileLock {
    /// Tries to take the lock at `path` without waiting.
    ///
    /// Returns `Ok(None)` if somebody else holds a lock that is not yet timed out.
    pub fn try_acquire(path: &Path, timeout: Duration) -> io::Result<Option<Self>> {
        match create_new(path) {
            Ok(_) => return Ok(Some(Self::new(path))),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e),
        }

        let modified = match std::fs::metadata(path).and_then(|m| m.modified()) {
            Ok(modified) => modified,
            // released in the meantime, the next attempt will pick it up
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO);
        if age < timeout {
            return Ok(None);
        }

        tracing::warn!(
            path = %path.display(),
            age = ?age,
            "Taking over abandoned lock"
        );
        if !remove_stale(path, modified)? {
            return Ok(None);
        }
        match create_new(path) {
            Ok(_) => Ok(Some(Self::new(path))),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn new(path: &Path) -> Self {
        Self {
            path: path.to_owned(),
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    path = %self.path.display(),
                    "Failed to release lock"
                );
            }
        }
    }
}

fn create_new(path: &Path) -> io::Result<File> {
    OpenOptions::new().write(true).create_new(true).open(path)
}

/// Removes the lock file at `path` if it is still the one last modified at `stale_since`.
///
/// Returns `false` if somebody else got to it first.
fn remove_stale(path: &Path, stale_since: SystemTime) -> io::Result<bool> {
    static NEXT: AtomicU64 = AtomicU64::new(0);

    let mut aside = path.as_os_str().to_owned();
    aside.push(format!(
        ".stale.{}.{}",
        std::process::id(),
        NEXT.fetch_add(1, Ordering::Relaxed)
    ));
    let aside = PathBuf::from(aside);

    match std::fs::rename(path, &aside) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    }

    let modified = std::fs::metadata(&aside).and_then(|m| m.modified())?;
    if modified != stale_since {
        // a fresh lock was created after we looked, put it back unless it was replaced
        if let Err(e) = std::fs::hard_link(&aside, path) {
            if e.kind() != io::ErrorKind::AlreadyExists {
                let _ = std::fs::remove_file(&aside);
                return Err(e);
            }
        }
        std::fs::remove_file(&aside)?;
        return Ok(false);
    }

    std::fs::remove_file(&aside)?;
    Ok(true)
}
