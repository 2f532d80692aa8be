use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rand::SeedableRng;
use rand::rngs::StdRng;

use proxycache_service::caching::{Caches, FileCache, FileCacheConfig, MemoryCache};
use proxycache_service::clock::{ClockRef, ManualClock};
use proxycache_service::config::Config;
use proxycache_service::http::{
    AcceptAll, FailureKind, FindResult, HttpCacheConfig, HttpCacheExt, HttpCacheInterface,
    ResponseHeaders, WriteThroughConfig, WriteThroughHttpCache,
};
use proxycache_test as test;

const START_MS: i64 = 1_700_000_000_000;

fn css(max_age: u64) -> ResponseHeaders {
    let mut headers = ResponseHeaders::new(200);
    headers.add("Content-Type", "text/css");
    headers.add("Cache-Control", format!("max-age={max_age}"));
    headers
}

fn file_cache(root: &Path, clock: ClockRef) -> Arc<FileCache> {
    let config = FileCacheConfig {
        clean_interval: Duration::from_secs(3600),
        ..Default::default()
    };
    let cache = FileCache::new("file", root, config, clock, &mut StdRng::seed_from_u64(42));
    Arc::new(cache.unwrap())
}

#[tokio::test]
async fn test_round_trip_through_configured_stack() {
    test::setup();
    let cache_dir = test::tempdir();
    let clock = Arc::new(ManualClock::new(START_MS));
    let config = Config {
        cache_dir: Some(cache_dir.path().to_owned()),
        ..Default::default()
    };
    let caches = Caches::from_config(&config, clock).unwrap();

    let key = "https://example.com/style.css";
    let mut headers = css(300);
    headers.add("X-Origin", "edge-1");
    caches.http.put(key, &headers, b"body { color: red }").unwrap();

    let outcome = caches.http.find_async(key, Arc::new(AcceptAll)).await;
    assert_eq!(outcome.result, FindResult::Found);
    assert_eq!(outcome.body(), Some(&b"body { color: red }"[..]));
    let found = outcome.headers().unwrap();
    assert_eq!(found.status_code(), 200);
    assert_eq!(found.lookup1("x-origin"), Some("edge-1"));
    assert_eq!(found.lookup1("content-type"), Some("text/css"));
    assert!(found.lookup1("etag").unwrap().starts_with("W/\"PSA-"));

    caches.shut_down();
}

#[tokio::test]
async fn test_expiry_across_tiers() {
    test::setup();
    let cache_dir = test::tempdir();
    let clock = Arc::new(ManualClock::new(START_MS));
    let cache = WriteThroughHttpCache::new(
        Arc::new(MemoryCache::new("memory", 1 << 20)),
        file_cache(cache_dir.path(), clock.clone()),
        clock.clone(),
        HttpCacheConfig::default(),
        WriteThroughConfig::default(),
    );

    cache.put("a", &css(300), b"a").unwrap();

    clock.advance(Duration::from_secs(299));
    let outcome = cache.find_async("a", Arc::new(AcceptAll)).await;
    assert_eq!(outcome.result, FindResult::Found);

    clock.advance(Duration::from_secs(2));
    let outcome = cache.find_async("a", Arc::new(AcceptAll)).await;
    assert_eq!(outcome.result, FindResult::NotFound);
    // expired entries are kept, and offered as fallback
    assert_eq!(outcome.stale.as_ref().map(|v| v.body()), Some(&b"a"[..]));
    assert_eq!(cache.tier1().stats().expirations, 1);
    assert_eq!(cache.tier2().stats().expirations, 1);
    assert!(cache_dir.path().join("a,").is_file());

    cache.shut_down();
}

#[tokio::test]
async fn test_disk_backfills_new_memory_tier() {
    test::setup();
    let cache_dir = test::tempdir();
    let clock = Arc::new(ManualClock::new(START_MS));
    let file = file_cache(cache_dir.path(), clock.clone());

    let writer = WriteThroughHttpCache::new(
        Arc::new(MemoryCache::new("memory", 1 << 20)),
        file.clone(),
        clock.clone(),
        HttpCacheConfig::default(),
        WriteThroughConfig::default(),
    );
    writer.put("a", &css(600), b"shared").unwrap();

    // a second process shares the disk tier but starts with an empty memory tier
    let reader = WriteThroughHttpCache::new(
        Arc::new(MemoryCache::new("memory", 1 << 20)),
        file,
        clock,
        HttpCacheConfig::default(),
        WriteThroughConfig::default(),
    );

    let outcome = reader.find_async("a", Arc::new(AcceptAll)).await;
    assert_eq!(outcome.result, FindResult::Found);
    assert_eq!(outcome.body(), Some(&b"shared"[..]));
    assert_eq!(reader.tier1().stats().inserts, 1);
    assert_eq!(reader.tier1().stats().reinserts, 0);
    assert_eq!(reader.write_through_stats().backfills, 1);

    let outcome = reader.find_async("a", Arc::new(AcceptAll)).await;
    assert_eq!(outcome.result, FindResult::Found);
    let counts = reader.write_through_stats();
    assert_eq!(counts.tier1_hits, 1);
    assert_eq!(counts.tier2_hits, 1);
    assert_eq!(reader.tier2().stats().backend_hits, 1);
    assert_eq!(reader.tier1().stats().inserts, 1);

    reader.shut_down();
}

#[tokio::test]
async fn test_negative_caching_expires() {
    test::setup();
    let cache_dir = test::tempdir();
    let clock = Arc::new(ManualClock::new(START_MS));
    let config = Config {
        cache_dir: Some(cache_dir.path().to_owned()),
        ..Default::default()
    };
    let caches = Caches::from_config(&config, clock.clone()).unwrap();
    let http = &caches.http;

    http.remember_fetch_failed("failed");
    let outcome = http.find_async("failed", Arc::new(AcceptAll)).await;
    assert_eq!(
        outcome.result,
        FindResult::RecentFailure(FailureKind::FetchFailed)
    );

    http.set_ignore_failure_puts();
    http.remember_not_cacheable("ignored");
    let outcome = http.find_async("ignored", Arc::new(AcceptAll)).await;
    assert_eq!(outcome.result, FindResult::NotFound);

    // remembered before ignoring, so still in effect
    clock.advance(Duration::from_secs(299));
    let outcome = http.find_async("failed", Arc::new(AcceptAll)).await;
    assert_eq!(
        outcome.result,
        FindResult::RecentFailure(FailureKind::FetchFailed)
    );

    clock.advance(Duration::from_secs(2));
    let outcome = http.find_async("failed", Arc::new(AcceptAll)).await;
    assert_eq!(outcome.result, FindResult::NotFound);
    assert!(outcome.stale.is_none());

    caches.shut_down();
}

#[tokio::test]
async fn test_delete_removes_file() {
    test::setup();
    let cache_dir = test::tempdir();
    let clock = Arc::new(ManualClock::new(START_MS));
    let config = Config {
        cache_dir: Some(cache_dir.path().to_owned()),
        ..Default::default()
    };
    let caches = Caches::from_config(&config, clock).unwrap();

    caches.http.put("dir/a", &css(60), b"a").unwrap();
    assert_eq!(
        test::list_files(cache_dir.path()),
        vec![PathBuf::from("dir/a,")]
    );

    caches.http.delete("dir/a");
    let outcome = caches.http.find_async("dir/a", Arc::new(AcceptAll)).await;
    assert_eq!(outcome.result, FindResult::NotFound);
    assert!(!cache_dir.path().join("dir/a,").exists());

    caches.shut_down();
}
