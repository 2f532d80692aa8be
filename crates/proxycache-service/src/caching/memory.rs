use std::sync::atomic::{AtomicBool, Ordering};

use super::{CacheInterface, Callback, KeyState, Lookup, SharedBuffer};

type InMemoryCache = moka::sync::Cache<String, SharedBuffer>;

/// The in-process fast tier.
///
/// A size-bounded LRU-ish cache (moka's TinyLFU) weighted by key and value bytes. Lookups
/// complete synchronously on the calling thread.
pub struct MemoryCache {
    name: String,
    cache: InMemoryCache,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCache")
            .field("name", &self.name)
            .field("in-memory items", &self.cache.entry_count())
            .field("weighted size", &self.cache.weighted_size())
            .finish()
    }
}

impl MemoryCache {
    /// Creates a cache holding roughly `capacity` bytes of keys and values.
    pub fn new(name: impl Into<String>, capacity: u64) -> Self {
        let name = name.into();
        let cache = InMemoryCache::builder()
            .max_capacity(capacity)
            .name(&name)
            // NOTE: the key counts towards the weight as well
            .weigher(|k: &String, v: &SharedBuffer| {
                u32::try_from(k.len() + v.len()).unwrap_or(u32::MAX)
            })
            .build();

        Self {
            name,
            cache,
            shut_down: AtomicBool::new(false),
        }
    }

    /// The number of cached entries, after processing pending evictions.
    pub fn entry_count(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }

    /// The total weight of all cached entries, after processing pending evictions.
    pub fn weighted_size(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.weighted_size()
    }

    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}

impl CacheInterface for MemoryCache {
    fn name(&self) -> String {
        format!("MemoryCache({})", self.name)
    }

    fn get(&self, key: &str, callback: Callback) {
        if self.is_shut_down() {
            return callback(Lookup::not_found());
        }
        let lookup = match self.cache.get(key) {
            Some(value) => {
                metric!(counter("caches.memory.hit") += 1, "cache" => &self.name);
                Lookup::found(value)
            }
            None => {
                metric!(counter("caches.memory.miss") += 1, "cache" => &self.name);
                Lookup::not_found()
            }
        };
        callback(lookup)
    }

    fn put(&self, key: &str, value: SharedBuffer) {
        if self.is_shut_down() {
            return;
        }
        self.cache.insert(key.to_owned(), value);
    }

    fn delete(&self, key: &str) {
        self.cache.invalidate(key);
    }

    fn query(&self, key: &str) -> KeyState {
        if !self.is_shut_down() && self.cache.contains_key(key) {
            KeyState::Available
        } else {
            KeyState::NotFound
        }
    }

    fn shut_down(&self) {
        self.shut_down.store(true, Ordering::Release);
    }
}
