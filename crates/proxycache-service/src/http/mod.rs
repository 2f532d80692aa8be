//! # HTTP caching on top of the key-value caches
//!
//! The [`HttpCache`] stores complete responses (headers and body, see [`HttpValue`]) in any
//! [`CacheInterface`](crate::caching::CacheInterface) backend, and decides:
//!
//! - whether a response may be stored at all, based on its status code, `Cache-Control`,
//!   `Vary`, cookies and size,
//! - whether a stored response may still be served, based on its freshness and the caller's
//!   [`FindHooks`],
//! - whether a recent attempt to produce a response failed, which is remembered for a short
//!   time with [`remember_failure`](HttpCacheInterface::remember_failure).
//!
//! The [`WriteThroughHttpCache`] composes a fast and a slow [`HttpCache`], backfilling the fast
//! tier from the slow one.
//!
//! ### Metrics
//!
//! All metrics are tagged with the `cache` they belong to:
//!
//! - `http_cache.hit`: Lookups returning a fresh and valid response.
//! - `http_cache.expired`: Lookups finding an expired response.
//! - `http_cache.invalidated`: Lookups finding a response rejected by the caller.
//! - `http_cache.insert`: Responses written to a backend.
//! - `http_cache.uncacheable`: Responses that were not stored, tagged with the `reason`.
//! - `http_cache.failure_put`: Remembered failures, tagged with their `kind`.
//!
//! The per-instance [`HttpCacheCounts`] hold the same information for tests and
//! introspection.

use std::future::Future;

use tokio::sync::oneshot;

mod cache;
mod config;
mod headers;
mod outcome;
mod stats;
mod value;
mod write_through;

pub use cache::HttpCache;
pub use config::{HttpCacheConfig, WriteThroughConfig};
pub use headers::{parse_http_date, Caching, Directive, ResponseHeaders};
pub use outcome::{
    AcceptAll, FailureKind, FindCallback, FindHooks, FindHooksRef, FindOutcome, FindResult,
    Uncacheable,
};
pub use stats::{HttpCacheCounts, WriteThroughCounts};
pub use value::HttpValue;
pub use write_through::WriteThroughHttpCache;

/// The interface of the HTTP caching layer.
pub trait HttpCacheInterface: Send + Sync {
    /// Human readable name used in logs.
    fn name(&self) -> String;

    /// Looks up `key`, and eventually invokes `callback` exactly once.
    fn find(&self, key: &str, hooks: FindHooksRef, callback: FindCallback);

    /// Stores the response if its headers allow it.
    ///
    /// The response is still usable by the caller if it is not stored.
    fn put(&self, key: &str, headers: &ResponseHeaders, body: &[u8]) -> Result<(), Uncacheable>;

    fn delete(&self, key: &str);

    /// Remembers that producing the response for `key` failed recently.
    fn remember_failure(&self, key: &str, kind: FailureKind);

    /// Makes all further [`remember_failure`](Self::remember_failure) calls no-ops.
    ///
    /// Failures remembered before stay in effect until they expire.
    fn set_ignore_failure_puts(&self);

    fn stats(&self) -> HttpCacheCounts;

    fn shut_down(&self);
}

/// Convenience methods on top of [`HttpCacheInterface`].
pub trait HttpCacheExt: HttpCacheInterface {
    /// Looks up `key`, resolving once the lookup completed.
    fn find_async(
        &self,
        key: &str,
        hooks: FindHooksRef,
    ) -> impl Future<Output = FindOutcome> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        self.find(
            key,
            hooks,
            Box::new(move |outcome| {
                tx.send(outcome).ok();
            }),
        );
        async move { rx.await.unwrap_or_else(|_| FindOutcome::not_found()) }
    }

    fn remember_fetch_failed(&self, key: &str) {
        self.remember_failure(key, FailureKind::FetchFailed)
    }

    fn remember_not_cacheable(&self, key: &str) {
        self.remember_failure(key, FailureKind::NotCacheable)
    }

    fn remember_dropped(&self, key: &str) {
        self.remember_failure(key, FailureKind::Dropped)
    }
}

impl<T: HttpCacheInterface + ?Sized> HttpCacheExt for T {}
