use std::sync::{Arc, Mutex};

use proxycache_service::caching::{
    BatcherConfig, CacheBatcher, CacheInterface, Callback, KeyCallback, KeyState, Lookup,
    SharedBuffer,
};
use proxycache_test as test;

/// Holds on to every lookup until it is released.
#[derive(Default)]
struct GatedCache {
    pending: Mutex<Vec<(String, Callback)>>,
    batch_sizes: Mutex<Vec<usize>>,
}

impl GatedCache {
    fn num_pending(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Completes the oldest pending lookup as a hit.
    fn release_one(&self) -> bool {
        let next = {
            let mut pending = self.pending.lock().unwrap();
            if pending.is_empty() {
                return false;
            }
            pending.remove(0)
        };
        let (key, callback) = next;
        callback(Lookup::found(SharedBuffer::from(key.as_str())));
        true
    }
}

impl CacheInterface for GatedCache {
    fn name(&self) -> String {
        "GatedCache".into()
    }

    fn get(&self, key: &str, callback: Callback) {
        self.pending
            .lock()
            .unwrap()
            .push((key.to_owned(), callback));
    }

    fn multi_get(&self, requests: Vec<KeyCallback>) {
        self.batch_sizes.lock().unwrap().push(requests.len());
        let mut pending = self.pending.lock().unwrap();
        for KeyCallback { key, callback } in requests {
            pending.push((key, callback));
        }
    }

    fn put(&self, _key: &str, _value: SharedBuffer) {}

    fn delete(&self, _key: &str) {}

    fn query(&self, _key: &str) -> KeyState {
        KeyState::NotFound
    }

    fn shut_down(&self) {}
}

type Results = Arc<Mutex<Vec<(String, bool)>>>;

fn record(results: &Results, key: &str) -> Callback {
    let results = Arc::clone(results);
    let key = key.to_owned();
    Box::new(move |lookup| results.lock().unwrap().push((key, lookup.is_found())))
}

#[tokio::test]
async fn test_overload_is_dropped_and_queue_batched() {
    test::setup();
    let backend = Arc::new(GatedCache::default());
    let batcher = CacheBatcher::new(
        backend.clone(),
        BatcherConfig {
            max_parallel_lookups: 2,
            max_queue_size: 3,
        },
    );
    let results = Results::default();

    for i in 0..7 {
        let key = format!("k{i}");
        batcher.get(&key, record(&results, &key));
    }

    // two in flight, three queued, the rest dropped right away
    assert_eq!(backend.num_pending(), 2);
    assert_eq!(batcher.queue_len(), 3);
    assert_eq!(batcher.dropped_count(), 2);
    assert_eq!(
        *results.lock().unwrap(),
        vec![("k5".to_owned(), false), ("k6".to_owned(), false)]
    );

    // the first completion flushes the whole queue as one batch
    assert!(backend.release_one());
    assert_eq!(batcher.queue_len(), 0);
    assert_eq!(batcher.last_batch_size(), 3);
    assert_eq!(*backend.batch_sizes.lock().unwrap(), vec![3]);

    while backend.release_one() {}
    let results = results.lock().unwrap();
    assert_eq!(results.len(), 7);
    let mut hits: Vec<_> = results
        .iter()
        .filter(|(_, found)| *found)
        .map(|(key, _)| key.as_str())
        .collect();
    hits.sort();
    assert_eq!(hits, ["k0", "k1", "k2", "k3", "k4"]);
    assert_eq!(batcher.num_in_flight(), 0);
}

#[tokio::test]
async fn test_writes_bypass_admission_control() {
    let backend = Arc::new(GatedCache::default());
    let batcher = CacheBatcher::new(
        backend.clone(),
        BatcherConfig {
            max_parallel_lookups: 1,
            max_queue_size: 0,
        },
    );
    let results = Results::default();

    batcher.get("a", record(&results, "a"));
    batcher.get("b", record(&results, "b"));
    assert_eq!(batcher.dropped_count(), 1);

    batcher.put("b", SharedBuffer::from("b"));
    batcher.delete("b");
    assert_eq!(batcher.dropped_count(), 1);

    batcher.shut_down();
    backend.release_one();
    assert_eq!(results.lock().unwrap().len(), 2);
}
