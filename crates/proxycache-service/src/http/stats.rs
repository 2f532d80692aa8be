use std::ops::Add;
use std::sync::atomic::{AtomicU64, Ordering};

/// A snapshot of the counters of an [`HttpCache`](super::HttpCache).
///
/// Every counter is only ever incremented by the cache instance owning it, so the counts of
/// several caches can be added up.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HttpCacheCounts {
    /// Lookups that returned a fresh and valid response.
    pub hits: u64,
    /// Lookups that did not return a response.
    pub misses: u64,
    /// Lookups for which the backend returned a value.
    pub backend_hits: u64,
    pub backend_misses: u64,
    /// Lookups that surfaced an expired or invalidated response as fallback.
    pub fallbacks: u64,
    /// Lookups that found an expired response.
    pub expirations: u64,
    pub inserts: u64,
    /// Inserts replacing a stale or invalidated entry.
    pub reinserts: u64,
    pub deletes: u64,
    /// Remembered failures.
    pub failure_puts: u64,
}

impl Add for HttpCacheCounts {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self {
            hits: self.hits + other.hits,
            misses: self.misses + other.misses,
            backend_hits: self.backend_hits + other.backend_hits,
            backend_misses: self.backend_misses + other.backend_misses,
            fallbacks: self.fallbacks + other.fallbacks,
            expirations: self.expirations + other.expirations,
            inserts: self.inserts + other.inserts,
            reinserts: self.reinserts + other.reinserts,
            deletes: self.deletes + other.deletes,
            failure_puts: self.failure_puts + other.failure_puts,
        }
    }
}

#[derive(Debug, Default)]
pub(super) struct HttpCacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub backend_hits: AtomicU64,
    pub backend_misses: AtomicU64,
    pub fallbacks: AtomicU64,
    pub expirations: AtomicU64,
    pub inserts: AtomicU64,
    pub reinserts: AtomicU64,
    pub deletes: AtomicU64,
    pub failure_puts: AtomicU64,
}

impl HttpCacheStats {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HttpCacheCounts {
        let get = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        HttpCacheCounts {
            hits: get(&self.hits),
            misses: get(&self.misses),
            backend_hits: get(&self.backend_hits),
            backend_misses: get(&self.backend_misses),
            fallbacks: get(&self.fallbacks),
            expirations: get(&self.expirations),
            inserts: get(&self.inserts),
            reinserts: get(&self.reinserts),
            deletes: get(&self.deletes),
            failure_puts: get(&self.failure_puts),
        }
    }
}

/// A snapshot of the counters the [`WriteThroughHttpCache`](super::WriteThroughHttpCache)
/// keeps on top of its two tiers.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WriteThroughCounts {
    pub tier1_hits: u64,
    pub tier2_hits: u64,
    /// Lookups that missed in both tiers.
    pub misses: u64,
    /// Tier 2 hits that were written back into tier 1.
    pub backfills: u64,
}

#[derive(Debug, Default)]
pub(super) struct WriteThroughStats {
    pub tier1_hits: AtomicU64,
    pub tier2_hits: AtomicU64,
    pub misses: AtomicU64,
    pub backfills: AtomicU64,
}

impl WriteThroughStats {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> WriteThroughCounts {
        let get = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        WriteThroughCounts {
            tier1_hits: get(&self.tier1_hits),
            tier2_hits: get(&self.tier2_hits),
            misses: get(&self.misses),
            backfills: get(&self.backfills),
        }
    }
}
