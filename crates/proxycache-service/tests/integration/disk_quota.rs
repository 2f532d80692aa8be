use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rand::SeedableRng;
use rand::rngs::StdRng;

use proxycache_service::caching::{
    CacheInterface, CacheInterfaceExt, FileCache, FileCacheConfig, SharedBuffer,
};
use proxycache_service::clock::ManualClock;
use proxycache_test as test;

fn open(root: &std::path::Path, target_size: u64) -> FileCache {
    let config = FileCacheConfig {
        target_size,
        clean_interval: Duration::from_secs(600),
        ..Default::default()
    };
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    FileCache::new("file", root, config, clock, &mut StdRng::seed_from_u64(1)).unwrap()
}

#[tokio::test]
async fn test_clean_evicts_oldest_first() {
    test::setup();
    let cache_dir = test::tempdir();
    let root = cache_dir.path();

    // 15 files of 100 bytes at 150% of the target, oldest first
    for i in 0..15 {
        let dir = match i {
            0..=3 => "old",
            4..=9 => "mixed",
            _ => "new",
        };
        test::write_file_with_atime(root.join(dir).join(i.to_string()), 100, 1_000_000 + i);
    }

    let cache = open(root, 1000);
    let report = cache.clean_now().unwrap().unwrap();
    assert!(report.success);
    assert_eq!(report.size_before, 1500);
    assert_eq!(report.evicted_files, 8);
    assert_eq!(report.freed_bytes, 800);
    assert_eq!(report.removed_dirs, 1);
    assert_eq!(cache.stats().evictions(), 8);
    assert_eq!(cache.stats().bytes_freed(), 800);

    let expected: Vec<PathBuf> = [
        "!clean!time!",
        "mixed/8",
        "mixed/9",
        "new/10",
        "new/11",
        "new/12",
        "new/13",
        "new/14",
    ]
    .into_iter()
    .map(PathBuf::from)
    .collect();
    assert_eq!(test::list_files(root), expected);
    assert!(!root.join("old").exists());

    cache.shut_down();
}

#[tokio::test]
async fn test_clean_below_threshold_keeps_everything() {
    test::setup();
    let cache_dir = test::tempdir();
    let root = cache_dir.path();
    for i in 0..12 {
        test::write_file_with_atime(root.join(format!("f{i}")), 100, 1_000_000 + i);
    }

    let cache = open(root, 1000);
    let report = cache.clean_now().unwrap().unwrap();
    assert!(report.below_threshold);
    assert_eq!(report.evicted_files, 0);
    assert_eq!(test::list_files(root).len(), 13);

    cache.shut_down();
}

#[tokio::test]
async fn test_hits_protect_from_eviction() {
    test::setup();
    let cache_dir = test::tempdir();
    let root = cache_dir.path();
    let cache = open(root, 1000);

    for i in 0..15 {
        cache.put(&format!("k{i}"), SharedBuffer::new(vec![0; 100]));
        test::set_atime(root.join(format!("k{i},")), 1_000_000 + i);
    }

    // reading bumps the access time of the oldest entry
    assert!(cache.lookup("k0").await.is_found());

    cache.clean_now().unwrap().unwrap();
    assert!(cache.lookup("k0").await.is_found());
    assert!(!cache.lookup("k1").await.is_found());
    assert!(cache.lookup("k14").await.is_found());

    cache.shut_down();
}
