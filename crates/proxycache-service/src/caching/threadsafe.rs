use std::sync::{Arc, Mutex};

use super::{CacheInterface, Callback, KeyCallback, KeyState, Lookup, SharedBuffer};

/// Serializes all access to a backend that is not safe to share between threads.
///
/// Callbacks that the wrapped backend fires synchronously are held back until the lock is
/// released, so they can freely call into this cache again.
pub struct ThreadsafeCache<C> {
    inner: Mutex<C>,
}

impl<C> ThreadsafeCache<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner: Mutex::new(inner),
        }
    }

    pub fn into_inner(self) -> C {
        self.inner.into_inner().unwrap()
    }
}

/// Hands a callback's result back to the caller once the lock has been dropped.
struct Deferred {
    locked: bool,
    result: Option<Lookup>,
    callback: Option<Callback>,
}

type DeferredRef = Arc<Mutex<Deferred>>;

fn defer_callback(callback: Callback) -> (DeferredRef, Callback) {
    let deferred = Arc::new(Mutex::new(Deferred {
        locked: true,
        result: None,
        callback: Some(callback),
    }));
    let wrapped = {
        let deferred = Arc::clone(&deferred);
        Box::new(move |lookup: Lookup| {
            let mut guard = deferred.lock().unwrap();
            if guard.locked {
                guard.result = Some(lookup);
            } else if let Some(callback) = guard.callback.take() {
                drop(guard);
                callback(lookup);
            }
        }) as Callback
    };
    (deferred, wrapped)
}

fn release(deferred: DeferredRef) {
    let mut guard = deferred.lock().unwrap();
    guard.locked = false;
    if let Some(result) = guard.result.take() {
        if let Some(callback) = guard.callback.take() {
            drop(guard);
            callback(result);
        }
    }
}

impl<C: CacheInterface + Send> CacheInterface for ThreadsafeCache<C> {
    fn name(&self) -> String {
        format!("ThreadsafeCache({})", self.inner.lock().unwrap().name())
    }

    fn get(&self, key: &str, callback: Callback) {
        let (deferred, wrapped) = defer_callback(callback);
        self.inner.lock().unwrap().get(key, wrapped);
        release(deferred);
    }

    fn multi_get(&self, requests: Vec<KeyCallback>) {
        let mut pending = Vec::with_capacity(requests.len());
        let requests = requests
            .into_iter()
            .map(|KeyCallback { key, callback }| {
                let (deferred, wrapped) = defer_callback(callback);
                pending.push(deferred);
                KeyCallback::new(key, wrapped)
            })
            .collect();
        self.inner.lock().unwrap().multi_get(requests);
        pending.into_iter().for_each(release);
    }

    fn put(&self, key: &str, value: SharedBuffer) {
        self.inner.lock().unwrap().put(key, value)
    }

    fn delete(&self, key: &str) {
        self.inner.lock().unwrap().delete(key)
    }

    fn query(&self, key: &str) -> KeyState {
        self.inner.lock().unwrap().query(key)
    }

    fn shut_down(&self) {
        self.inner.lock().unwrap().shut_down()
    }

    fn is_healthy(&self) -> bool {
        self.inner.lock().unwrap().is_healthy()
    }
}
