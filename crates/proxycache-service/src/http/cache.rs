use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use sha2::{Digest, Sha256};

use super::stats::HttpCacheStats;
use super::{
    Caching, FailureKind, FindCallback, FindHooks, FindHooksRef, FindOutcome, HttpCacheConfig,
    HttpCacheCounts, HttpCacheInterface, HttpValue, ResponseHeaders, Uncacheable,
};
use crate::caching::{Lookup, SharedCache};
use crate::clock::{duration_ms, ClockRef};

struct HttpCacheInner {
    name: String,
    cache: SharedCache,
    clock: ClockRef,
    config: RwLock<HttpCacheConfig>,
    ignore_failure_puts: AtomicBool,
    stats: HttpCacheStats,
}

impl HttpCacheInner {
    fn config(&self) -> HttpCacheConfig {
        *self.config.read().unwrap()
    }

    /// Turns the backend's answer into the outcome of a lookup.
    fn resolve(&self, key: &str, lookup: Lookup, hooks: &dyn FindHooks) -> FindOutcome {
        let stats = &self.stats;
        let Some(buffer) = lookup.into_value() else {
            HttpCacheStats::incr(&stats.backend_misses);
            HttpCacheStats::incr(&stats.misses);
            return FindOutcome::not_found();
        };
        HttpCacheStats::incr(&stats.backend_hits);

        let value = match HttpValue::decode(buffer) {
            Ok(value) => value,
            Err(e) => {
                tracing::debug!(
                    error = &e as &dyn std::error::Error,
                    key,
                    "Dropping unreadable cache entry"
                );
                HttpCacheStats::incr(&stats.misses);
                return FindOutcome::not_found();
            }
        };

        let now_ms = self.clock.now_ms();
        let headers = value.headers();
        let unexpired = headers
            .caching()
            .is_some_and(|caching| now_ms < caching.expiration_ms());

        if let Some(kind) = FailureKind::from_status_code(headers.status_code()) {
            HttpCacheStats::incr(&stats.misses);
            return match unexpired {
                true => FindOutcome::recent_failure(kind),
                false => FindOutcome::not_found(),
            };
        }

        if !unexpired && !self.config().force_caching {
            HttpCacheStats::incr(&stats.expirations);
            HttpCacheStats::incr(&stats.misses);
            HttpCacheStats::incr(&stats.fallbacks);
            metric!(counter("http_cache.expired") += 1, "cache" => &self.name);
            return FindOutcome::not_found().with_stale(Some(value));
        }

        if !hooks.is_cache_valid(key, headers) {
            HttpCacheStats::incr(&stats.misses);
            HttpCacheStats::incr(&stats.fallbacks);
            metric!(counter("http_cache.invalidated") += 1, "cache" => &self.name);
            return FindOutcome::not_found().with_stale(Some(value));
        }

        if !hooks.is_fresh(headers) {
            metric!(counter("http_cache.hit_not_fresh") += 1, "cache" => &self.name);
        }
        HttpCacheStats::incr(&stats.hits);
        metric!(counter("http_cache.hit") += 1, "cache" => &self.name);
        FindOutcome::found(value)
    }
}

/// Applies HTTP caching semantics on top of a key-value backend.
///
/// Responses are only stored when their headers allow it, and are only returned while
/// fresh and accepted by the caller's [`FindHooks`]. Recent failures to produce a response
/// can be remembered for a short time.
#[derive(Clone)]
pub struct HttpCache {
    inner: Arc<HttpCacheInner>,
}

impl std::fmt::Debug for HttpCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpCache")
            .field("name", &self.inner.name)
            .field("cache", &self.inner.cache.name())
            .field("config", &self.inner.config())
            .finish()
    }
}

impl HttpCache {
    pub fn new(
        name: impl Into<String>,
        cache: SharedCache,
        clock: ClockRef,
        config: HttpCacheConfig,
    ) -> Self {
        Self {
            inner: Arc::new(HttpCacheInner {
                name: name.into(),
                cache,
                clock,
                config: RwLock::new(config),
                ignore_failure_puts: AtomicBool::new(false),
                stats: HttpCacheStats::default(),
            }),
        }
    }

    pub fn config(&self) -> HttpCacheConfig {
        self.inner.config()
    }

    pub fn set_force_caching(&self, force: bool) {
        self.inner.config.write().unwrap().force_caching = force;
    }

    pub fn set_disable_html_caching_on_https(&self, disable: bool) {
        self.inner.config.write().unwrap().disable_html_caching_on_https = disable;
    }

    pub fn set_failure_ttl(&self, kind: FailureKind, ttl: Duration) {
        self.inner.config.write().unwrap().set_failure_ttl(kind, ttl);
    }

    pub fn set_max_cacheable_size(&self, max_size: Option<u64>) {
        self.inner.config.write().unwrap().max_cacheable_size = max_size;
    }

    pub fn set_implicit_ttl(&self, ttl: Duration) {
        self.inner.config.write().unwrap().implicit_ttl = ttl;
    }

    pub fn is_ignoring_failure_puts(&self) -> bool {
        self.inner.ignore_failure_puts.load(Ordering::Relaxed)
    }

    /// Checks whether a response may be stored, and encodes it for the backend.
    ///
    /// Cookies are stripped from the stored headers, and a weak `ETag` derived from the body
    /// is added if the response has none.
    pub fn prepare(
        &self,
        key: &str,
        headers: &ResponseHeaders,
        body: &[u8],
    ) -> Result<HttpValue, Uncacheable> {
        let config = self.config();
        debug_assert!(headers.status_code() != 0, "response without status code");
        if headers.status_code() == 0 {
            return Err(Uncacheable::MissingStatus);
        }

        if config.disable_html_caching_on_https && key.starts_with("https://") && headers.is_html()
        {
            return Err(Uncacheable::HtmlOverHttps);
        }
        if let Some(max_size) = config.max_cacheable_size {
            let declared = headers.content_length().unwrap_or(0);
            if declared > max_size || body.len() as u64 > max_size {
                return Err(Uncacheable::TooLarge);
            }
        }

        let now_ms = self.inner.clock.now_ms();
        let implicit_ttl_ms = duration_ms(config.implicit_ttl);
        let mut headers = headers.clone();
        let caching = headers.compute_caching(now_ms, implicit_ttl_ms);

        if config.force_caching {
            if caching.is_none() {
                headers.set_caching(Caching {
                    date_ms: now_ms,
                    ttl_ms: implicit_ttl_ms,
                    explicit: false,
                });
            }
        } else {
            if !headers.is_storable() {
                return Err(Uncacheable::Forbidden);
            }
            if !headers.has_acceptable_vary() {
                return Err(Uncacheable::Vary);
            }
            let caching = caching.ok_or(Uncacheable::Status(headers.status_code()))?;
            if headers.has_cookies() && !caching.explicit {
                return Err(Uncacheable::Cookies);
            }
            if caching.expiration_ms() <= now_ms {
                return Err(Uncacheable::Expired);
            }
        }

        headers.strip_cookies();
        if !headers.has("etag") {
            headers.add("ETag", synthesize_etag(body));
        }

        let value = HttpValue::encode(&headers, body).map_err(|e| {
            tracing::error!(error = &e as &dyn std::error::Error, "Failed to encode response");
            Uncacheable::Encoding
        })?;
        if config
            .max_cacheable_size
            .is_some_and(|max_size| value.size() as u64 > max_size)
        {
            return Err(Uncacheable::TooLarge);
        }
        Ok(value)
    }

    /// Writes an already prepared value into the backend.
    ///
    /// `reinsert` marks writes replacing an entry that was found stale or invalid.
    pub fn store(&self, key: &str, value: &HttpValue, reinsert: bool) {
        let stats = &self.inner.stats;
        HttpCacheStats::incr(match reinsert {
            true => &stats.reinserts,
            false => &stats.inserts,
        });
        metric!(counter("http_cache.insert") += 1, "cache" => &self.inner.name);
        self.inner.cache.put(key, value.buffer().clone());
    }
}

impl HttpCacheInterface for HttpCache {
    fn name(&self) -> String {
        format!("HttpCache({})", self.inner.cache.name())
    }

    fn find(&self, key: &str, hooks: FindHooksRef, callback: FindCallback) {
        let inner = Arc::clone(&self.inner);
        let owned_key = key.to_owned();
        self.inner.cache.get(
            key,
            Box::new(move |lookup| {
                let outcome = inner.resolve(&owned_key, lookup, &*hooks);
                callback(outcome);
            }),
        );
    }

    fn put(&self, key: &str, headers: &ResponseHeaders, body: &[u8]) -> Result<(), Uncacheable> {
        match self.prepare(key, headers, body) {
            Ok(value) => {
                self.store(key, &value, false);
                Ok(())
            }
            Err(reason) => {
                tracing::trace!(key, reason = %reason, "Not caching response");
                metric!(counter("http_cache.uncacheable") += 1, "reason" => reason.as_ref());
                Err(reason)
            }
        }
    }

    fn delete(&self, key: &str) {
        HttpCacheStats::incr(&self.inner.stats.deletes);
        self.inner.cache.delete(key);
    }

    fn remember_failure(&self, key: &str, kind: FailureKind) {
        if self.is_ignoring_failure_puts() {
            return;
        }

        let ttl = self.config().failure_ttl(kind);
        let mut headers = ResponseHeaders::new(kind.status_code());
        headers.set_caching(Caching {
            date_ms: self.inner.clock.now_ms(),
            ttl_ms: duration_ms(ttl),
            explicit: true,
        });
        match HttpValue::encode(&headers, &[]) {
            Ok(value) => {
                HttpCacheStats::incr(&self.inner.stats.failure_puts);
                metric!(counter("http_cache.failure_put") += 1, "kind" => kind.as_ref());
                self.inner.cache.put(key, value.buffer().clone());
            }
            Err(e) => {
                tracing::error!(error = &e as &dyn std::error::Error, "Failed to encode failure");
            }
        }
    }

    fn set_ignore_failure_puts(&self) {
        self.inner.ignore_failure_puts.store(true, Ordering::Relaxed);
    }

    fn stats(&self) -> HttpCacheCounts {
        self.inner.stats.snapshot()
    }

    fn shut_down(&self) {
        self.inner.cache.shut_down();
    }
}

/// A weak `ETag` derived from a hash of the body.
fn synthesize_etag(body: &[u8]) -> String {
    let digest = Sha256::digest(body);
    format!("W/\"PSA-{}\"", hex::encode(&digest[..9]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caching::{CacheInterface, KeyState, MemoryCache};
    use crate::clock::ManualClock;
    use crate::http::{AcceptAll, FindResult, HttpCacheExt};

    const START_MS: i64 = 1_700_000_000_000;

    fn setup() -> (HttpCache, Arc<ManualClock>, Arc<MemoryCache>) {
        let clock = Arc::new(ManualClock::new(START_MS));
        let backend = Arc::new(MemoryCache::new("backend", 1 << 20));
        let cache = HttpCache::new("test", backend.clone(), clock.clone(), Default::default());
        (cache, clock, backend)
    }

    fn css(cache_control: &str) -> ResponseHeaders {
        ResponseHeaders::with_headers(
            200,
            [("Content-Type", "text/css"), ("Cache-Control", cache_control)],
        )
    }

    async fn find(cache: &HttpCache, key: &str) -> FindOutcome {
        cache.find_async(key, Arc::new(AcceptAll)).await
    }

    #[tokio::test]
    async fn test_round_trip() {
        let (cache, _, _) = setup();
        let headers = css("max-age=300");
        cache.put("http://a.com/a.css", &headers, b"a{}").unwrap();

        let outcome = find(&cache, "http://a.com/a.css").await;
        assert_eq!(outcome.result, FindResult::Found);
        assert_eq!(outcome.body(), Some(&b"a{}"[..]));
        let found = outcome.headers().unwrap();
        assert_eq!(found.status_code(), 200);
        assert_eq!(found.lookup1("content-type"), Some("text/css"));
        assert_eq!(found.lookup1("cache-control"), Some("max-age=300"));

        let stats = cache.stats();
        assert_eq!(stats.inserts, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.backend_hits, 1);
    }

    #[tokio::test]
    async fn test_expiry() {
        let (cache, clock, _) = setup();
        cache.put("k", &css("max-age=300"), b"body").unwrap();

        clock.advance(Duration::from_secs(299));
        assert!(find(&cache, "k").await.is_found());

        clock.advance(Duration::from_secs(2));
        let outcome = find(&cache, "k").await;
        assert_eq!(outcome.result, FindResult::NotFound);
        assert_eq!(outcome.stale.unwrap().body(), b"body");
        assert_eq!(cache.stats().expirations, 1);
        assert_eq!(cache.stats().fallbacks, 1);
    }

    #[tokio::test]
    async fn test_force_caching() {
        let (cache, clock, _) = setup();
        cache.set_force_caching(true);
        cache
            .put("k", &ResponseHeaders::with_headers(200, [("Cache-Control", "no-store")]), b"x")
            .unwrap();
        clock.advance(Duration::from_secs(3600));
        assert!(find(&cache, "k").await.is_found());
    }

    #[tokio::test]
    async fn test_uncacheable_responses() {
        let (cache, _, backend) = setup();
        assert_eq!(cache.put("k", &css("private, max-age=60"), b""), Err(Uncacheable::Forbidden));
        assert_eq!(cache.put("k", &css("no-store"), b""), Err(Uncacheable::Forbidden));
        assert_eq!(cache.put("k", &css("max-age=0"), b""), Err(Uncacheable::Expired));
        assert_eq!(
            cache.put("k", &ResponseHeaders::new(404), b""),
            Err(Uncacheable::Status(404))
        );

        let mut vary = css("max-age=60");
        vary.add("Vary", "User-Agent");
        assert_eq!(cache.put("k", &vary, b""), Err(Uncacheable::Vary));

        let cookies = ResponseHeaders::with_headers(200, [("Set-Cookie", "a=b")]);
        assert_eq!(cache.put("k", &cookies, b""), Err(Uncacheable::Cookies));

        assert_eq!(backend.query("k"), KeyState::NotFound);
        assert_eq!(cache.stats().inserts, 0);
    }

    #[tokio::test]
    async fn test_size_ceiling() {
        let (cache, _, _) = setup();
        cache.set_max_cacheable_size(Some(100));

        let headers = css("max-age=60");
        assert_eq!(cache.put("k", &headers, &[0; 101]), Err(Uncacheable::TooLarge));
        // the headers count towards the limit as well
        assert_eq!(cache.put("k", &headers, &[0; 90]), Err(Uncacheable::TooLarge));

        let mut declared = css("max-age=60");
        declared.add("Content-Length", "5000");
        assert_eq!(cache.put("k", &declared, b""), Err(Uncacheable::TooLarge));

        cache.set_max_cacheable_size(None);
        assert!(cache.put("k", &headers, &[0; 101]).is_ok());
    }

    #[tokio::test]
    async fn test_html_over_https() {
        let (cache, _, _) = setup();
        cache.set_disable_html_caching_on_https(true);
        let html = ResponseHeaders::with_headers(
            200,
            [("Content-Type", "text/html; charset=utf-8"), ("Cache-Control", "max-age=60")],
        );
        assert_eq!(
            cache.put("https://a.com/", &html, b"<html>"),
            Err(Uncacheable::HtmlOverHttps)
        );
        assert!(cache.put("http://a.com/", &html, b"<html>").is_ok());
        assert!(cache.put("https://a.com/a.css", &css("max-age=60"), b"").is_ok());
    }

    #[tokio::test]
    async fn test_cookies_are_stripped() {
        let (cache, _, _) = setup();
        let mut headers = css("max-age=60");
        headers.add("Set-Cookie", "session=secret");
        cache.put("k", &headers, b"x").unwrap();

        let outcome = find(&cache, "k").await;
        assert!(outcome.is_found());
        assert!(!outcome.headers().unwrap().has_cookies());
    }

    #[tokio::test]
    async fn test_etag() {
        let (cache, _, _) = setup();
        cache.put("synthesized", &css("max-age=60"), b"x").unwrap();
        let etag = find(&cache, "synthesized").await;
        let etag = etag.headers().unwrap().lookup1("etag").unwrap().to_owned();
        assert!(etag.starts_with("W/\"PSA-"));
        assert_eq!(etag, synthesize_etag(b"x"));

        let mut headers = css("max-age=60");
        headers.add("ETag", "\"original\"");
        cache.put("kept", &headers, b"x").unwrap();
        let outcome = find(&cache, "kept").await;
        assert_eq!(outcome.headers().unwrap().lookup1("etag"), Some("\"original\""));
    }

    #[tokio::test]
    async fn test_revalidation_hook() {
        struct InvalidatedBefore(i64);

        impl FindHooks for InvalidatedBefore {
            fn is_cache_valid(&self, _key: &str, headers: &ResponseHeaders) -> bool {
                headers.caching().is_some_and(|c| c.date_ms >= self.0)
            }
        }

        let (cache, clock, backend) = setup();
        cache.put("k", &css("max-age=300"), b"old").unwrap();
        clock.advance(Duration::from_secs(10));

        let hooks = Arc::new(InvalidatedBefore(START_MS + 5_000));
        let outcome = cache.find_async("k", hooks).await;
        assert_eq!(outcome.result, FindResult::NotFound);
        assert_eq!(outcome.stale.unwrap().body(), b"old");
        // invalidated entries stay in the backend
        assert_eq!(backend.query("k"), KeyState::Available);
        assert_eq!(cache.stats().expirations, 0);
    }

    #[tokio::test]
    async fn test_remember_fetch_failed() {
        let (cache, clock, _) = setup();
        cache.remember_fetch_failed("k");

        let outcome = find(&cache, "k").await;
        assert_eq!(outcome.result, FindResult::RecentFailure(FailureKind::FetchFailed));
        assert!(outcome.value.is_none());

        clock.advance(Duration::from_secs(299));
        assert_eq!(
            find(&cache, "k").await.result,
            FindResult::RecentFailure(FailureKind::FetchFailed)
        );
        clock.advance(Duration::from_secs(1));
        assert_eq!(find(&cache, "k").await.result, FindResult::NotFound);
    }

    #[tokio::test]
    async fn test_dropped_ttl() {
        let (cache, clock, _) = setup();
        cache.remember_dropped("k");
        clock.advance(Duration::from_secs(9));
        assert_eq!(
            find(&cache, "k").await.result,
            FindResult::RecentFailure(FailureKind::Dropped)
        );
        clock.advance(Duration::from_secs(1));
        assert_eq!(find(&cache, "k").await.result, FindResult::NotFound);
    }

    #[tokio::test]
    async fn test_ignore_failure_puts() {
        let (cache, clock, _) = setup();
        cache.remember_not_cacheable("before");
        cache.set_ignore_failure_puts();
        cache.remember_not_cacheable("after");

        assert_eq!(
            find(&cache, "before").await.result,
            FindResult::RecentFailure(FailureKind::NotCacheable)
        );
        assert_eq!(find(&cache, "after").await.result, FindResult::NotFound);
        assert_eq!(cache.stats().failure_puts, 1);

        clock.advance(Duration::from_secs(300));
        assert_eq!(find(&cache, "before").await.result, FindResult::NotFound);
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_a_miss() {
        let (cache, _, backend) = setup();
        backend.put("k", "garbage".into());
        let outcome = find(&cache, "k").await;
        assert_eq!(outcome.result, FindResult::NotFound);
        assert!(outcome.stale.is_none());
    }
}
