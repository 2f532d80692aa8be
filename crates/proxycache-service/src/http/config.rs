use std::time::Duration;

use serde::Deserialize;

use super::FailureKind;

/// Caching policy of an [`HttpCache`](super::HttpCache).
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HttpCacheConfig {
    /// How long a failed fetch is remembered.
    #[serde(with = "humantime_serde")]
    pub fetch_failed_ttl: Duration,
    /// How long a response that was not cacheable is remembered.
    #[serde(with = "humantime_serde")]
    pub not_cacheable_ttl: Duration,
    /// How long a fetch dropped under load is remembered.
    #[serde(with = "humantime_serde")]
    pub dropped_ttl: Duration,
    /// Freshness of implicitly cacheable responses without `Cache-Control` or `Expires`.
    #[serde(with = "humantime_serde")]
    pub implicit_ttl: Duration,
    /// Responses larger than this (in bytes, headers included) are never stored.
    pub max_cacheable_size: Option<u64>,
    /// Stores every response and ignores expiration on lookups. Meant for tests.
    pub force_caching: bool,
    /// Never stores HTML that was fetched over `https`.
    pub disable_html_caching_on_https: bool,
}

impl Default for HttpCacheConfig {
    fn default() -> Self {
        Self {
            fetch_failed_ttl: Duration::from_secs(300),
            not_cacheable_ttl: Duration::from_secs(300),
            dropped_ttl: Duration::from_secs(10),
            implicit_ttl: Duration::from_secs(300),
            max_cacheable_size: None,
            force_caching: false,
            disable_html_caching_on_https: false,
        }
    }
}

impl HttpCacheConfig {
    /// The time a failure of the given kind is remembered.
    pub fn failure_ttl(&self, kind: FailureKind) -> Duration {
        match kind {
            FailureKind::FetchFailed => self.fetch_failed_ttl,
            FailureKind::NotCacheable => self.not_cacheable_ttl,
            FailureKind::Dropped => self.dropped_ttl,
        }
    }

    pub fn set_failure_ttl(&mut self, kind: FailureKind, ttl: Duration) {
        match kind {
            FailureKind::FetchFailed => self.fetch_failed_ttl = ttl,
            FailureKind::NotCacheable => self.not_cacheable_ttl = ttl,
            FailureKind::Dropped => self.dropped_ttl = ttl,
        }
    }
}

/// Configuration of the [`WriteThroughHttpCache`](super::WriteThroughHttpCache).
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WriteThroughConfig {
    /// Entries whose key and value together reach this size (in bytes) are only stored in
    /// tier 2. Unlimited by default.
    pub tier1_max_size: Option<u64>,
}
