use std::future::Future;
use std::sync::Arc;

use tokio::sync::oneshot;

use super::SharedBuffer;

/// The state of a key as reported by a cache backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyState {
    /// The key was found and a value is attached.
    Available,
    /// The key is currently being written and may become available shortly.
    InTransit,
    /// The key is not in the cache, or the backend could not serve it.
    NotFound,
}

impl AsRef<str> for KeyState {
    fn as_ref(&self) -> &str {
        match self {
            Self::Available => "available",
            Self::InTransit => "in_transit",
            Self::NotFound => "not_found",
        }
    }
}

/// The outcome of a single key lookup, handed to the [`Callback`].
#[derive(Debug, Clone)]
pub struct Lookup {
    pub state: KeyState,
    pub value: Option<SharedBuffer>,
}

impl Lookup {
    pub fn found(value: SharedBuffer) -> Self {
        Self {
            state: KeyState::Available,
            value: Some(value),
        }
    }

    pub fn not_found() -> Self {
        Self {
            state: KeyState::NotFound,
            value: None,
        }
    }

    pub fn is_found(&self) -> bool {
        self.state == KeyState::Available && self.value.is_some()
    }

    /// Returns the value, but only for an [`Available`](KeyState::Available) lookup.
    pub fn into_value(self) -> Option<SharedBuffer> {
        match self.state {
            KeyState::Available => self.value,
            _ => None,
        }
    }
}

/// Completion handler of a lookup.
///
/// Ownership of the callback moves into the backend on `get`, and the backend calls it
/// exactly once, possibly on another thread and possibly before `get` returns.
pub type Callback = Box<dyn FnOnce(Lookup) + Send + 'static>;

/// A single key of a [`CacheInterface::multi_get`] batch.
pub struct KeyCallback {
    pub key: String,
    pub callback: Callback,
}

impl KeyCallback {
    pub fn new(key: impl Into<String>, callback: Callback) -> Self {
        Self {
            key: key.into(),
            callback,
        }
    }
}

impl std::fmt::Debug for KeyCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyCallback").field("key", &self.key).finish()
    }
}

/// The asynchronous key-value contract implemented by every backend and decorator.
///
/// Nothing in here fails with an error: unreadable, missing, or dropped entries are reported
/// as [`KeyState::NotFound`], and write failures are logged by the backend.
pub trait CacheInterface {
    /// Human readable name used in logs and metric tags.
    fn name(&self) -> String;

    /// Looks up `key` and eventually invokes `callback` exactly once.
    fn get(&self, key: &str, callback: Callback);

    /// Looks up many keys at once.
    ///
    /// The per-key callbacks may fire in any order. Backends with expensive round-trips
    /// should override this, the default just issues one `get` per key.
    fn multi_get(&self, requests: Vec<KeyCallback>) {
        for KeyCallback { key, callback } in requests {
            self.get(&key, callback);
        }
    }

    /// Stores `value` under `key`. Fire-and-forget.
    fn put(&self, key: &str, value: SharedBuffer);

    /// Removes `key`.
    fn delete(&self, key: &str);

    /// A best-effort, synchronous check of the key state.
    ///
    /// This must not be used in place of `get`.
    fn query(&self, key: &str) -> KeyState;

    /// Resolves all outstanding work with [`KeyState::NotFound`], and makes every later
    /// lookup fail fast.
    fn shut_down(&self);

    /// Whether the backend is currently able to serve requests.
    fn is_healthy(&self) -> bool {
        true
    }
}

/// A thread-safe, shareable cache backend.
pub type SharedCache = Arc<dyn CacheInterface + Send + Sync>;

impl<T: CacheInterface + ?Sized> CacheInterface for Arc<T> {
    fn name(&self) -> String {
        (**self).name()
    }

    fn get(&self, key: &str, callback: Callback) {
        (**self).get(key, callback)
    }

    fn multi_get(&self, requests: Vec<KeyCallback>) {
        (**self).multi_get(requests)
    }

    fn put(&self, key: &str, value: SharedBuffer) {
        (**self).put(key, value)
    }

    fn delete(&self, key: &str) {
        (**self).delete(key)
    }

    fn query(&self, key: &str) -> KeyState {
        (**self).query(key)
    }

    fn shut_down(&self) {
        (**self).shut_down()
    }

    fn is_healthy(&self) -> bool {
        (**self).is_healthy()
    }
}

/// `async` adapters on top of the callback based [`CacheInterface`].
pub trait CacheInterfaceExt: CacheInterface {
    /// Looks up `key`, resolving once the backend invoked the callback.
    ///
    /// A backend that drops the callback without calling it resolves to a miss.
    fn lookup(&self, key: &str) -> impl Future<Output = Lookup> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        self.get(
            key,
            Box::new(move |lookup| {
                tx.send(lookup).ok();
            }),
        );
        async move { rx.await.unwrap_or_else(|_| Lookup::not_found()) }
    }

    /// Looks up all `keys` with one `multi_get`, returning the lookups in key order.
    fn lookup_many(&self, keys: &[&str]) -> impl Future<Output = Vec<Lookup>> + Send + 'static {
        let mut receivers = Vec::with_capacity(keys.len());
        let requests = keys
            .iter()
            .map(|key| {
                let (tx, rx) = oneshot::channel();
                receivers.push(rx);
                KeyCallback::new(
                    *key,
                    Box::new(move |lookup| {
                        tx.send(lookup).ok();
                    }),
                )
            })
            .collect();
        self.multi_get(requests);

        async move {
            let mut lookups = Vec::with_capacity(receivers.len());
            for rx in receivers {
                lookups.push(rx.await.unwrap_or_else(|_| Lookup::not_found()));
            }
            lookups
        }
    }
}

impl<T: CacheInterface + ?Sized> CacheInterfaceExt for T {}
