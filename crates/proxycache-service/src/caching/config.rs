use std::time::Duration;

use serde::Deserialize;

/// Configuration of the in-process memory tier.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct MemoryCacheConfig {
    /// Capacity (in bytes) of keys and values held in memory.
    ///
    /// Defaults to `100 MiB (= 104_857_600)`.
    pub capacity: u64,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 100 * 1024 * 1024,
        }
    }
}

/// Configuration of the on-disk tier and its quota enforcement.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct FileCacheConfig {
    /// The size (in bytes) the cache directory is cleaned down towards.
    ///
    /// Cleaning starts once usage exceeds 125% of this value, and evicts the least recently
    /// accessed files until usage is at 75%.
    pub target_size: u64,

    /// An optional limit on the number of files and directories, with the same thresholds
    /// as [`target_size`](Self::target_size).
    pub target_inode_count: Option<u64>,

    /// How often any one process attempts to clean the cache.
    #[serde(with = "humantime_serde")]
    pub clean_interval: Duration,

    /// After this time a held clean lock is considered abandoned and may be taken over.
    #[serde(with = "humantime_serde")]
    pub clean_lock_timeout: Duration,
}

impl Default for FileCacheConfig {
    fn default() -> Self {
        Self {
            target_size: 100 * 1024 * 1024,
            target_inode_count: None,
            clean_interval: Duration::from_secs(3600),
            clean_lock_timeout: Duration::from_secs(60),
        }
    }
}

/// Limits of the [`CacheBatcher`](super::CacheBatcher).
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct BatcherConfig {
    /// Maximum number of lookups (single or batched) outstanding against the backend.
    pub max_parallel_lookups: usize,
    /// Maximum number of lookups waiting for a free slot. More lookups are dropped.
    pub max_queue_size: usize,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            max_parallel_lookups: 16,
            max_queue_size: 200,
        }
    }
}

/// Configuration of the networked tier.
///
/// Entries are stored as objects under `base_url`, which must end with a `/`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RemoteCacheConfig {
    /// The base URL of the object store.
    pub base_url: url::Url,

    /// Timeout for establishing a connection and receiving response headers.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Timeout for a whole fetch or store, including the body.
    #[serde(default = "default_store_timeout", with = "humantime_serde")]
    pub store_timeout: Duration,
}

fn default_connect_timeout() -> Duration {
    Duration::from_millis(500)
}

fn default_store_timeout() -> Duration {
    Duration::from_secs(60)
}

impl RemoteCacheConfig {
    pub fn new(base_url: url::Url) -> Self {
        Self {
            base_url,
            connect_timeout: default_connect_timeout(),
            store_timeout: default_store_timeout(),
        }
    }
}
