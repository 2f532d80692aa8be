use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use reqwest::StatusCode;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use url::Url;

use super::{
    CacheEntry, CacheError, CacheInterface, Callback, KeyState, Lookup, RemoteCacheConfig,
    SharedBuffer,
};

#[derive(Default)]
struct RemoteState {
    /// Callbacks of lookups that are still running, by lookup id.
    pending: HashMap<u64, Callback>,
    /// Number of uploads in flight, per key.
    uploads: HashMap<String, usize>,
}

struct RemoteInner {
    client: reqwest::Client,
    base_url: Url,
    store_timeout: Duration,
    state: Mutex<RemoteState>,
    next_id: AtomicU64,
    healthy: AtomicBool,
    shut_down: AtomicBool,
    /// Number of `PUT` and `DELETE` requests that did not finish yet.
    writes: AtomicUsize,
    writes_done: Notify,
}

impl RemoteInner {
    fn url(&self, key: &str) -> Option<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut().ok()?.pop_if_empty().push(key);
        Some(url)
    }

    /// Runs `request` with the store timeout, keeping track of the backend's health.
    async fn send(&self, request: reqwest::RequestBuilder) -> CacheEntry<reqwest::Response> {
        let timeout = self.store_timeout;
        let result = match tokio::time::timeout(timeout, request.send()).await {
            Err(_) => Err(CacheError::Timeout(timeout)),
            Ok(result) => result.map_err(|e| {
                if e.is_connect() {
                    self.healthy.store(false, Ordering::Relaxed);
                }
                CacheError::from(e)
            }),
        };
        if result.is_ok() {
            self.healthy.store(true, Ordering::Relaxed);
        }
        result
    }

    async fn fetch(&self, url: Url) -> CacheEntry<Bytes> {
        let response = self.send(self.client.get(url)).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(CacheError::NotFound),
            status if status.is_success() => {
                let timeout = self.store_timeout;
                tokio::time::timeout(timeout, response.bytes())
                    .await
                    .map_err(|_| CacheError::Timeout(timeout))?
                    .map_err(CacheError::from)
            }
            status => Err(CacheError::RemoteError(format!("status {status}"))),
        }
    }

    async fn store(&self, url: Url, body: Vec<u8>) -> CacheEntry {
        let response = self.send(self.client.put(url).body(body)).await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            status => Err(CacheError::RemoteError(format!("status {status}"))),
        }
    }

    async fn remove(&self, url: Url) -> CacheEntry {
        let response = self.send(self.client.delete(url)).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(()),
            status if status.is_success() => Ok(()),
            status => Err(CacheError::RemoteError(format!("status {status}"))),
        }
    }

    /// Completes the lookup `id`, unless shutdown already did.
    fn complete(&self, id: u64, lookup: Lookup) {
        let callback = self.state.lock().unwrap().pending.remove(&id);
        if let Some(callback) = callback {
            callback(lookup);
        }
    }

    fn write_done(&self) {
        if self.writes.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.writes_done.notify_waiters();
        }
    }

    fn upload_done(&self, key: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(count) = state.uploads.get_mut(key) {
            *count -= 1;
            if *count == 0 {
                state.uploads.remove(key);
            }
        }
    }
}

/// The networked tier: a key-value binding to an HTTP object store.
///
/// Entries are stored with `GET`, `PUT` and `DELETE` requests to `{base_url}/{key}`, with
/// the key escaped as a single path segment. Requests run on the given `tokio` runtime, so
/// this can be used from any thread.
///
/// A `404` or any failure is reported as a miss. Failed writes are logged and abandoned.
#[derive(Clone)]
pub struct RemoteCache {
    name: String,
    runtime: Handle,
    inner: Arc<RemoteInner>,
}

impl std::fmt::Debug for RemoteCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteCache")
            .field("name", &self.name)
            .field("base_url", &self.inner.base_url.as_str())
            .finish()
    }
}

impl RemoteCache {
    pub fn new(
        name: impl Into<String>,
        config: &RemoteCacheConfig,
        runtime: Handle,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()?;

        Ok(Self {
            name: name.into(),
            runtime,
            inner: Arc::new(RemoteInner {
                client,
                base_url: config.base_url.clone(),
                store_timeout: config.store_timeout,
                state: Default::default(),
                next_id: AtomicU64::new(0),
                healthy: AtomicBool::new(true),
                shut_down: AtomicBool::new(false),
                writes: AtomicUsize::new(0),
                writes_done: Notify::new(),
            }),
        })
    }

    /// The number of lookups that did not complete yet.
    pub fn num_pending(&self) -> usize {
        self.inner.state.lock().unwrap().pending.len()
    }

    /// Waits until all writes and deletes issued so far have finished.
    pub async fn flush(&self) {
        loop {
            let done = self.inner.writes_done.notified();
            if self.inner.writes.load(Ordering::Acquire) == 0 {
                return;
            }
            done.await;
        }
    }

    fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    fn spawn<F, Fut>(&self, f: F)
    where
        F: FnOnce(Arc<RemoteInner>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.runtime.spawn(f(Arc::clone(&self.inner)));
    }

    fn spawn_write<F, Fut>(&self, f: F)
    where
        F: FnOnce(Arc<RemoteInner>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner.writes.fetch_add(1, Ordering::AcqRel);
        let inner = Arc::clone(&self.inner);
        let write = f(Arc::clone(&self.inner));
        self.runtime.spawn(async move {
            write.await;
            inner.write_done();
        });
    }
}

impl CacheInterface for RemoteCache {
    fn name(&self) -> String {
        format!("RemoteCache({})", self.name)
    }

    fn get(&self, key: &str, callback: Callback) {
        if self.is_shut_down() {
            return callback(Lookup::not_found());
        }
        let Some(url) = self.inner.url(key) else {
            return callback(Lookup::not_found());
        };

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .state
            .lock()
            .unwrap()
            .pending
            .insert(id, callback);

        let name = self.name.clone();
        self.spawn(move |inner| async move {
            let lookup = match inner.fetch(url).await {
                Ok(body) => {
                    metric!(counter("caches.remote.hit") += 1, "cache" => &name);
                    Lookup::found(SharedBuffer::new(Vec::from(body)))
                }
                Err(CacheError::NotFound) => {
                    metric!(counter("caches.remote.miss") += 1, "cache" => &name);
                    Lookup::not_found()
                }
                Err(e) => {
                    metric!(counter("caches.remote.error") += 1, "cache" => &name);
                    tracing::debug!(
                        error = &e as &dyn std::error::Error,
                        "Remote cache lookup failed"
                    );
                    Lookup::not_found()
                }
            };
            inner.complete(id, lookup);
        });
    }

    fn put(&self, key: &str, value: SharedBuffer) {
        if self.is_shut_down() {
            return;
        }
        let Some(url) = self.inner.url(key) else {
            return;
        };

        *self
            .inner
            .state
            .lock()
            .unwrap()
            .uploads
            .entry(key.to_owned())
            .or_default() += 1;

        let key = key.to_owned();
        let name = self.name.clone();
        self.spawn_write(move |inner| async move {
            if let Err(e) = inner.store(url, value.to_vec()).await {
                metric!(counter("caches.remote.write_error") += 1, "cache" => &name);
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    key = %key,
                    "Failed to store entry in remote cache"
                );
            }
            inner.upload_done(&key);
        });
    }

    fn delete(&self, key: &str) {
        let Some(url) = self.inner.url(key) else {
            return;
        };
        self.spawn_write(move |inner| async move {
            if let Err(e) = inner.remove(url).await {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    "Failed to delete entry from remote cache"
                );
            }
        });
    }

    /// Reports keys with an upload still in flight as [`KeyState::InTransit`].
    ///
    /// Answering anything else would need a round-trip, so all other keys are reported as
    /// [`KeyState::NotFound`].
    fn query(&self, key: &str) -> KeyState {
        if self.inner.state.lock().unwrap().uploads.contains_key(key) {
            KeyState::InTransit
        } else {
            KeyState::NotFound
        }
    }

    fn shut_down(&self) {
        self.inner.shut_down.store(true, Ordering::Release);
        let pending: Vec<_> = {
            let mut state = self.inner.state.lock().unwrap();
            state.pending.drain().map(|(_, callback)| callback).collect()
        };
        for callback in pending {
            callback(Lookup::not_found());
        }
    }

    fn is_healthy(&self) -> bool {
        !self.is_shut_down() && self.inner.healthy.load(Ordering::Relaxed)
    }
}
