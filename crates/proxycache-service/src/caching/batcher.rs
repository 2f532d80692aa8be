//! Admission control in front of slow backends.
//!
//! The [`CacheBatcher`] allows a bounded number of lookups to be outstanding against the
//! wrapped backend at any time. Lookups beyond that limit are queued, and whenever an
//! outstanding lookup completes the whole queue is flushed as a single
//! [`multi_get`](CacheInterface::multi_get). Once the queue is full, further lookups are
//! answered with an immediate miss.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::{
    BatcherConfig, CacheInterface, Callback, KeyCallback, KeyState, Lookup, SharedBuffer,
    SharedCache,
};

struct BatcherState {
    queue: Vec<KeyCallback>,
    in_flight: usize,
    shut_down: bool,
}

struct BatcherInner {
    cache: SharedCache,
    config: BatcherConfig,
    state: Mutex<BatcherState>,
    dropped: AtomicU64,
    last_batch_size: AtomicUsize,
}

/// Bounds the concurrent and queued lookups against a backend.
///
/// Only `get` traffic is throttled, writes pass straight through.
#[derive(Clone)]
pub struct CacheBatcher {
    inner: Arc<BatcherInner>,
}

impl std::fmt::Debug for CacheBatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheBatcher")
            .field("cache", &self.inner.cache.name())
            .field("config", &self.inner.config)
            .field("in_flight", &self.num_in_flight())
            .field("queued", &self.queue_len())
            .finish()
    }
}

impl CacheBatcher {
    pub fn new(cache: SharedCache, config: BatcherConfig) -> Self {
        Self {
            inner: Arc::new(BatcherInner {
                cache,
                config: BatcherConfig {
                    max_parallel_lookups: config.max_parallel_lookups.max(1),
                    ..config
                },
                state: Mutex::new(BatcherState {
                    queue: Vec::new(),
                    in_flight: 0,
                    shut_down: false,
                }),
                dropped: AtomicU64::new(0),
                last_batch_size: AtomicUsize::new(0),
            }),
        }
    }

    /// The number of lookups answered with a miss because the queue was full.
    pub fn dropped_count(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// The size of the most recently issued queued batch.
    pub fn last_batch_size(&self) -> usize {
        self.inner.last_batch_size.load(Ordering::Relaxed)
    }

    /// The number of lookups currently outstanding against the backend.
    pub fn num_in_flight(&self) -> usize {
        self.inner.state.lock().unwrap().in_flight
    }

    /// The number of lookups waiting for a free slot.
    pub fn queue_len(&self) -> usize {
        self.inner.state.lock().unwrap().queue.len()
    }
}

impl BatcherInner {
    fn name(&self) -> String {
        format!(
            "Batcher(cache={},parallelism={},max={})",
            self.cache.name(),
            self.config.max_parallel_lookups,
            self.config.max_queue_size
        )
    }

    /// Issues a single lookup which already owns one of the in-flight slots.
    fn issue_single(self: &Arc<Self>, key: &str, callback: Callback) {
        let this = Arc::clone(self);
        self.cache.get(
            key,
            Box::new(move |lookup| {
                callback(lookup);
                this.lookup_done();
            }),
        );
    }

    /// Issues a queued batch which already owns one of the in-flight slots.
    fn issue_batch(self: &Arc<Self>, batch: Vec<KeyCallback>) {
        let group = Arc::new(BatchGroup {
            batcher: Arc::clone(self),
            remaining: AtomicUsize::new(batch.len()),
        });
        let requests = batch
            .into_iter()
            .map(|KeyCallback { key, callback }| {
                let group = Arc::clone(&group);
                let callback: Callback = Box::new(move |lookup| {
                    callback(lookup);
                    group.done();
                });
                KeyCallback { key, callback }
            })
            .collect();
        self.cache.multi_get(requests);
    }

    /// Called once a single lookup or a whole batch completed.
    ///
    /// The freed slot is either handed to the current queue contents, or released.
    fn lookup_done(self: &Arc<Self>) {
        let batch = {
            let mut state = self.state.lock().unwrap();
            if state.queue.is_empty() {
                state.in_flight -= 1;
                return;
            }
            std::mem::take(&mut state.queue)
        };

        tracing::trace!("Flushing {} queued lookups to {}", batch.len(), self.cache.name());
        self.last_batch_size.store(batch.len(), Ordering::Relaxed);
        metric!(time_raw("caches.batcher.batch_size") = batch.len() as u64);
        self.issue_batch(batch);
    }
}

/// Tracks the outstanding lookups of one batch.
///
/// Each per-key callback decrements the countdown, the one reaching zero frees the batch's
/// in-flight slot. Completions may race from arbitrary threads.
struct BatchGroup {
    batcher: Arc<BatcherInner>,
    remaining: AtomicUsize,
}

impl BatchGroup {
    fn done(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.batcher.lookup_done();
        }
    }
}

impl CacheInterface for CacheBatcher {
    fn name(&self) -> String {
        self.inner.name()
    }

    fn get(&self, key: &str, callback: Callback) {
        let mut state = self.inner.state.lock().unwrap();
        if state.shut_down {
            drop(state);
            return callback(Lookup::not_found());
        }

        if state.in_flight < self.inner.config.max_parallel_lookups {
            state.in_flight += 1;
            drop(state);
            self.inner.issue_single(key, callback);
        } else if state.queue.len() < self.inner.config.max_queue_size {
            state.queue.push(KeyCallback::new(key, callback));
        } else {
            drop(state);
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            metric!(counter("caches.batcher.dropped") += 1);
            tracing::trace!("Dropping lookup for {key}, the batcher queue is full");
            callback(Lookup::not_found());
        }
    }

    fn put(&self, key: &str, value: SharedBuffer) {
        self.inner.cache.put(key, value)
    }

    fn delete(&self, key: &str) {
        self.inner.cache.delete(key)
    }

    fn query(&self, key: &str) -> KeyState {
        self.inner.cache.query(key)
    }

    fn shut_down(&self) {
        let queued = {
            let mut state = self.inner.state.lock().unwrap();
            state.shut_down = true;
            std::mem::take(&mut state.queue)
        };
        for KeyCallback { callback, .. } in queued {
            callback(Lookup::not_found());
        }
        self.inner.cache.shut_down();
    }

    fn is_healthy(&self) -> bool {
        self.inner.cache.is_healthy()
    }
}
