//! # Caching infrastructure
//!
//! Every rewritten resource, and every failure to produce one, ends up in a cache. This module
//! contains the key-value layers those caches are built from, the central [`CacheError`] type,
//! and [`Caches`], which assembles the layers according to the [`Config`].
//!
//! ## Cache Layers
//!
//! All layers implement the callback-based [`CacheInterface`], so they can be stacked freely:
//!
//! - [`MemoryCache`]: A bounded in-process cache, evicting by size.
//! - [`FileCache`]: Persists entries as files below a directory, which is periodically cleaned
//!   down to a quota. Multiple processes may share one directory.
//! - [`RemoteCache`]: Stores entries as objects of an HTTP object store.
//! - [`CacheBatcher`]: Limits the number of lookups outstanding against a slow backend, and
//!   turns the backlog into batched lookups.
//! - [`ThreadsafeCache`]: Makes a backend that needs exclusive access usable from many threads.
//!
//! The HTTP semantics on top of these live in [`crate::http`].
//!
//! A lookup goes through the following steps:
//! - First, it goes to the memory tier.
//! - On miss, it goes to the remote tier if one is configured, and to the file tier otherwise.
//! - A hit in the second tier is copied back into the memory tier.
//! - A fresh response is written to both tiers.
//!
//! ### Metrics
//!
//! Each metric is tagged with the `cache` it belongs to:
//!
//! - `caches.memory.hit` / `caches.memory.miss`: Lookups of the memory tier.
//! - `caches.file.hit` / `caches.file.miss`: Lookups of the file tier.
//! - `caches.remote.hit` / `caches.remote.miss`: Lookups of the remote tier.
//! - `caches.remote.error` / `caches.remote.write_error`: Failed requests to the remote tier.
//! - `caches.batcher.batch_size`: The number of lookups flushed in one batch.
//! - `caches.batcher.dropped`: Lookups rejected because the queue was full.
//! - `disk_cache.cleanups` / `disk_cache.skipped_cleanups`: Cleanups of the file tier, and
//!   those skipped because another process held the lock.
//! - `disk_cache.evictions` / `disk_cache.bytes_freed`: Files removed by cleanups.
//! - `disk_cache.size.bytes`: The size of the cache directory before a cleanup.
//! - `disk_cache.clean.duration`: Time spent cleaning.
//! - `disk_cache.write_errors`: Files that could not be written.
//!
//! ### Configuration
//!
//! The memory tier is always active. The file tier is gated by the [`Config::cache_dir`] option,
//! and the remote tier by [`Config::remote`]. Without either of them, only the memory tier
//! is used.

use std::sync::Arc;

use anyhow::Context;

use crate::clock::ClockRef;
use crate::config::Config;
use crate::http::{HttpCache, HttpCacheInterface, WriteThroughHttpCache};

mod batcher;
mod buffer;
mod cache_error;
mod cleanup;
mod config;
mod filename;
mod fs;
mod interface;
mod lock;
mod memory;
mod remote;
mod threadsafe;
mod worker;

pub use batcher::CacheBatcher;
pub use buffer::SharedBuffer;
pub use cache_error::{CacheEntry, CacheError};
pub use cleanup::CleanReport;
pub use config::{BatcherConfig, FileCacheConfig, MemoryCacheConfig, RemoteCacheConfig};
pub use filename::{escape_key, key_path};
pub use fs::{FileCache, FileCacheStats};
pub use interface::{
    CacheInterface, CacheInterfaceExt, Callback, KeyCallback, KeyState, Lookup, SharedCache,
};
pub use memory::MemoryCache;
pub use remote::RemoteCache;
pub use threadsafe::ThreadsafeCache;

/// All caches of a process, assembled from the [`Config`].
#[derive(Clone)]
pub struct Caches {
    /// The in-process tier.
    pub memory: Arc<MemoryCache>,
    /// The on-disk tier, if a `cache_dir` is configured.
    pub file: Option<Arc<FileCache>>,
    /// The networked tier, if configured.
    pub remote: Option<Arc<RemoteCache>>,
    /// The HTTP cache over all configured tiers.
    pub http: Arc<dyn HttpCacheInterface>,
}

impl std::fmt::Debug for Caches {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Caches")
            .field("memory", &self.memory)
            .field("file", &self.file)
            .field("remote", &self.remote)
            .field("http", &self.http.name())
            .finish()
    }
}

impl Caches {
    /// Opens all caches named by `config`.
    ///
    /// A configured remote tier needs to be created from within a tokio runtime, which it uses
    /// for its requests.
    pub fn from_config(config: &Config, clock: ClockRef) -> anyhow::Result<Self> {
        let memory = Arc::new(MemoryCache::new("memory", config.memory.capacity));

        let file = match config.cache_dir {
            Some(ref dir) => {
                let cache = FileCache::new(
                    "file",
                    dir,
                    config.file_cache,
                    clock.clone(),
                    &mut rand::thread_rng(),
                )
                .with_context(|| format!("failed to open cache directory {}", dir.display()))?;
                Some(Arc::new(cache))
            }
            None => None,
        };

        let remote = match config.remote {
            Some(ref remote_config) => {
                let runtime = tokio::runtime::Handle::try_current()
                    .context("the remote cache needs a tokio runtime")?;
                let cache = RemoteCache::new("remote", remote_config, runtime)
                    .context("failed to create remote cache client")?;
                Some(Arc::new(cache))
            }
            None => None,
        };

        let tier2: Option<SharedCache> = match (&remote, &file) {
            (Some(remote), _) => Some(Arc::new(CacheBatcher::new(
                remote.clone(),
                config.batcher,
            ))),
            (None, Some(file)) => Some(file.clone()),
            (None, None) => None,
        };

        let http: Arc<dyn HttpCacheInterface> = match tier2 {
            Some(tier2) => Arc::new(WriteThroughHttpCache::new(
                memory.clone(),
                tier2,
                clock,
                config.http_cache,
                config.write_through,
            )),
            None => Arc::new(HttpCache::new(
                "http",
                memory.clone(),
                clock,
                config.http_cache,
            )),
        };

        tracing::info!(
            file = file.is_some(),
            remote = remote.is_some(),
            "Caches initialized"
        );

        Ok(Self {
            memory,
            file,
            remote,
            http,
        })
    }

    /// Waits for writes and deletes still in flight to the remote tier.
    pub async fn flush(&self) {
        if let Some(ref remote) = self.remote {
            remote.flush().await;
        }
    }

    /// Shuts down all tiers, including those not reachable through [`Caches::http`].
    pub fn shut_down(&self) {
        self.http.shut_down();
        if let Some(ref file) = self.file {
            file.shut_down();
        }
        if let Some(ref remote) = self.remote {
            remote.shut_down();
        }
    }
}
