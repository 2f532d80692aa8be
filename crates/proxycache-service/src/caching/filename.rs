//! Maps cache keys to filesystem paths.
//!
//! Keys are arbitrary strings (usually URLs). Every byte outside of `[A-Za-z0-9_.-]` is
//! escaped as `,XX`, with `/` kept as a directory separator so related keys share a
//! directory. Segments longer than a single filename are split into chunks, each but the
//! last ending in `,-`.
//!
//! The filename of a key always ends in `,`, which no directory name does. This keeps
//! `a` and `a/b` apart, as `a,` and `a/b,`.
//!
//! Since `!` is always escaped, filenames containing it can never collide with a key, and
//! are used for the cache's own marker files and for hashed keys.

use std::fmt::Write;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

/// The longest path we create, including the cache root.
pub const MAX_PATH_LEN: usize = 4096;

/// The longest single path component we create, before the chunk or file suffix.
const MAX_SEGMENT_LEN: usize = 128;

/// Name of the file holding the next scheduled clean time.
pub const CLEAN_TIME_FILENAME: &str = "!clean!time!";

/// Name of the file used as a cross-process lock while cleaning.
pub const CLEAN_LOCK_FILENAME: &str = "!clean!lock!";

/// Prefix of the filenames of keys too long to be escaped.
const HASHED_PREFIX: &str = "!hashed!";

/// Returns the path of the file storing `key` below `root`.
///
/// Falls back to a hash of the key if the escaped path would be too long.
pub fn key_path(root: &Path, key: &str) -> PathBuf {
    let path = root.join(escape_key(key));
    if path.as_os_str().len() <= MAX_PATH_LEN {
        return path;
    }
    root.join(format!("{HASHED_PREFIX}{}", hash_key(key)))
}

/// A hex-encoded SHA-256 digest of `key`.
pub fn hash_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// Escapes `key` into a relative path.
pub fn escape_key(key: &str) -> String {
    let mut escaped = String::with_capacity(key.len() + key.len() / 4 + 1);
    for (i, segment) in key.split('/').enumerate() {
        if i > 0 {
            escaped.push('/');
        }
        escape_segment(segment, &mut escaped);
    }
    escaped.push(',');
    escaped
}

fn escape_segment(segment: &str, out: &mut String) {
    if segment.is_empty() {
        // keeps `a//b` distinct from `a/b`
        out.push(',');
        return;
    }

    let mut written = 0;
    for (i, byte) in segment.bytes().enumerate() {
        let is_safe = byte.is_ascii_alphanumeric()
            || byte == b'_'
            || byte == b'-'
            || (byte == b'.' && i > 0);
        let len = if is_safe { 1 } else { 3 };

        if written + len > MAX_SEGMENT_LEN {
            out.push_str(",-/");
            written = 0;
        }
        if is_safe {
            out.push(byte as char);
        } else {
            // writing into a `String` cannot fail
            let _ = write!(out, ",{byte:02X}");
        }
        written += len;
    }
}
