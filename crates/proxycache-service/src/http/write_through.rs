use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::stats::WriteThroughStats;
use super::{
    FailureKind, FindCallback, FindHooksRef, FindOutcome, FindResult, HttpCache, HttpCacheConfig,
    HttpCacheCounts, HttpCacheInterface, HttpValue, ResponseHeaders, Uncacheable,
    WriteThroughConfig, WriteThroughCounts,
};
use crate::caching::SharedCache;
use crate::clock::ClockRef;

struct WriteThroughInner {
    tier1: HttpCache,
    tier2: HttpCache,
    /// `u64::MAX` means unlimited.
    tier1_max_size: AtomicU64,
    stats: WriteThroughStats,
}

impl WriteThroughInner {
    /// Whether an entry is small enough to be written to tier 1.
    fn fits_tier1(&self, key: &str, value: &HttpValue) -> bool {
        let max_size = self.tier1_max_size.load(Ordering::Relaxed);
        ((key.len() + value.size()) as u64) < max_size
    }

    /// Completes a lookup that tier 1 could not serve, based on the tier 2 outcome.
    fn tier2_done(&self, key: &str, tier1: FindOutcome, tier2: FindOutcome) -> FindOutcome {
        if let Some(value) = tier2.value.as_ref().filter(|_| tier2.is_found()) {
            WriteThroughStats::incr(&self.stats.tier2_hits);
            if self.fits_tier1(key, value) {
                WriteThroughStats::incr(&self.stats.backfills);
                // tier 1 still holding a stale copy means this replaces it
                self.tier1.store(key, value, tier1.stale.is_some());
            }
            return tier2;
        }

        WriteThroughStats::incr(&self.stats.misses);
        let result = match (tier2.result, tier1.result) {
            (failure @ FindResult::RecentFailure(_), _) => failure,
            (_, failure @ FindResult::RecentFailure(_)) => failure,
            _ => FindResult::NotFound,
        };
        let stale = freshest(tier1.stale, tier2.stale);
        FindOutcome {
            result,
            value: None,
            stale,
        }
    }
}

/// Picks the fallback with the more recent `Date`.
fn freshest(a: Option<HttpValue>, b: Option<HttpValue>) -> Option<HttpValue> {
    let date = |value: &HttpValue| value.headers().caching().map_or(i64::MIN, |c| c.date_ms);
    match (a, b) {
        (Some(a), Some(b)) => Some(if date(&b) > date(&a) { b } else { a }),
        (a, b) => a.or(b),
    }
}

/// Composes a fast "tier 1" and a slow "tier 2" [`HttpCache`].
///
/// Lookups go to tier 1 first and only fall through to tier 2 on a miss. Tier 2 hits are
/// written back into tier 1. Writes always go to tier 2, and to tier 1 if the entry is below
/// the tier 1 size limit, so that a single large entry does not evict many small hot ones.
///
/// Both tiers share one [`HttpCacheConfig`], and all setters apply to both of them.
#[derive(Clone)]
pub struct WriteThroughHttpCache {
    inner: Arc<WriteThroughInner>,
}

impl std::fmt::Debug for WriteThroughHttpCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteThroughHttpCache")
            .field("tier1", &self.inner.tier1)
            .field("tier2", &self.inner.tier2)
            .finish()
    }
}

impl WriteThroughHttpCache {
    pub fn new(
        tier1: SharedCache,
        tier2: SharedCache,
        clock: ClockRef,
        config: HttpCacheConfig,
        write_through: WriteThroughConfig,
    ) -> Self {
        let tier1 = HttpCache::new("tier1", tier1, clock.clone(), config);
        let tier2 = HttpCache::new("tier2", tier2, clock, config);
        Self {
            inner: Arc::new(WriteThroughInner {
                tier1,
                tier2,
                tier1_max_size: AtomicU64::new(write_through.tier1_max_size.unwrap_or(u64::MAX)),
                stats: WriteThroughStats::default(),
            }),
        }
    }

    pub fn tier1(&self) -> &HttpCache {
        &self.inner.tier1
    }

    pub fn tier2(&self) -> &HttpCache {
        &self.inner.tier2
    }

    pub fn set_tier1_max_size(&self, max_size: Option<u64>) {
        self.inner
            .tier1_max_size
            .store(max_size.unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    pub fn set_force_caching(&self, force: bool) {
        self.inner.tier1.set_force_caching(force);
        self.inner.tier2.set_force_caching(force);
    }

    pub fn set_disable_html_caching_on_https(&self, disable: bool) {
        self.inner.tier1.set_disable_html_caching_on_https(disable);
        self.inner.tier2.set_disable_html_caching_on_https(disable);
    }

    pub fn set_failure_ttl(&self, kind: FailureKind, ttl: Duration) {
        self.inner.tier1.set_failure_ttl(kind, ttl);
        self.inner.tier2.set_failure_ttl(kind, ttl);
    }

    pub fn set_max_cacheable_size(&self, max_size: Option<u64>) {
        self.inner.tier1.set_max_cacheable_size(max_size);
        self.inner.tier2.set_max_cacheable_size(max_size);
    }

    pub fn set_implicit_ttl(&self, ttl: Duration) {
        self.inner.tier1.set_implicit_ttl(ttl);
        self.inner.tier2.set_implicit_ttl(ttl);
    }

    /// The counters of the composition itself.
    pub fn write_through_stats(&self) -> WriteThroughCounts {
        self.inner.stats.snapshot()
    }
}

impl HttpCacheInterface for WriteThroughHttpCache {
    fn name(&self) -> String {
        format!(
            "WriteThroughHttpCache(tier1={}, tier2={})",
            self.inner.tier1.name(),
            self.inner.tier2.name()
        )
    }

    fn find(&self, key: &str, hooks: FindHooksRef, callback: FindCallback) {
        let inner = Arc::clone(&self.inner);
        let owned_key = key.to_owned();
        let tier2_hooks = Arc::clone(&hooks);

        self.inner.tier1.find(
            key,
            hooks,
            Box::new(move |tier1| {
                if tier1.is_found() {
                    WriteThroughStats::incr(&inner.stats.tier1_hits);
                    return callback(tier1);
                }

                let tier2_inner = Arc::clone(&inner);
                let tier2_key = owned_key.clone();
                inner.tier2.find(
                    &tier2_key,
                    tier2_hooks,
                    Box::new(move |tier2| {
                        let outcome = tier2_inner.tier2_done(&owned_key, tier1, tier2);
                        callback(outcome);
                    }),
                );
            }),
        );
    }

    fn put(&self, key: &str, headers: &ResponseHeaders, body: &[u8]) -> Result<(), Uncacheable> {
        let value = self.inner.tier2.prepare(key, headers, body)?;
        self.inner.tier2.store(key, &value, false);
        if self.inner.fits_tier1(key, &value) {
            self.inner.tier1.store(key, &value, false);
        }
        Ok(())
    }

    fn delete(&self, key: &str) {
        self.inner.tier1.delete(key);
        self.inner.tier2.delete(key);
    }

    fn remember_failure(&self, key: &str, kind: FailureKind) {
        self.inner.tier1.remember_failure(key, kind);
        self.inner.tier2.remember_failure(key, kind);
    }

    fn set_ignore_failure_puts(&self) {
        self.inner.tier1.set_ignore_failure_puts();
        self.inner.tier2.set_ignore_failure_puts();
    }

    /// The counters of both tiers added up.
    fn stats(&self) -> HttpCacheCounts {
        self.inner.tier1.stats() + self.inner.tier2.stats()
    }

    fn shut_down(&self) {
        self.inner.tier1.shut_down();
        self.inner.tier2.shut_down();
    }
}
