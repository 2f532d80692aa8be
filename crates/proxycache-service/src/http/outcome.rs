use std::sync::Arc;

use thiserror::Error;

use super::{HttpValue, ResponseHeaders};

/// The kinds of failures that are remembered for a while.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Fetching the resource failed.
    FetchFailed,
    /// The resource was fetched, but may not be cached.
    NotCacheable,
    /// The fetch was dropped, for example under load.
    Dropped,
}

impl FailureKind {
    /// The status code marking a remembered failure in a stored response.
    ///
    /// These are outside of the range of real HTTP status codes.
    pub fn status_code(self) -> u16 {
        match self {
            Self::FetchFailed => 10001,
            Self::NotCacheable => 10002,
            Self::Dropped => 10003,
        }
    }

    pub fn from_status_code(status_code: u16) -> Option<Self> {
        match status_code {
            10001 => Some(Self::FetchFailed),
            10002 => Some(Self::NotCacheable),
            10003 => Some(Self::Dropped),
            _ => None,
        }
    }
}

impl AsRef<str> for FailureKind {
    fn as_ref(&self) -> &str {
        match self {
            Self::FetchFailed => "fetch_failed",
            Self::NotCacheable => "not_cacheable",
            Self::Dropped => "dropped",
        }
    }
}

/// The result of a lookup through the HTTP layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindResult {
    Found,
    NotFound,
    /// A recent attempt to produce the resource failed and is remembered.
    RecentFailure(FailureKind),
}

/// Everything a lookup through the HTTP layer produced.
#[derive(Debug, Clone)]
pub struct FindOutcome {
    pub result: FindResult,
    /// The response, for [`FindResult::Found`].
    pub value: Option<HttpValue>,
    /// An expired or invalidated response the caller may fall back to while refetching.
    pub stale: Option<HttpValue>,
}

impl FindOutcome {
    pub fn found(value: HttpValue) -> Self {
        Self {
            result: FindResult::Found,
            value: Some(value),
            stale: None,
        }
    }

    pub fn not_found() -> Self {
        Self {
            result: FindResult::NotFound,
            value: None,
            stale: None,
        }
    }

    pub fn recent_failure(kind: FailureKind) -> Self {
        Self {
            result: FindResult::RecentFailure(kind),
            value: None,
            stale: None,
        }
    }

    pub fn with_stale(mut self, stale: Option<HttpValue>) -> Self {
        self.stale = stale;
        self
    }

    pub fn is_found(&self) -> bool {
        self.result == FindResult::Found
    }

    pub fn headers(&self) -> Option<&ResponseHeaders> {
        self.value.as_ref().map(HttpValue::headers)
    }

    pub fn body(&self) -> Option<&[u8]> {
        self.value.as_ref().map(HttpValue::body)
    }
}

/// Caller-supplied checks applied to every response found in a backend.
pub trait FindHooks: Send + Sync {
    /// Whether the stored response may still be used, for example because it was stored
    /// after the last invalidation of its URL.
    ///
    /// A rejected response is reported as a miss, but stays in the backend.
    fn is_cache_valid(&self, key: &str, headers: &ResponseHeaders) -> bool {
        let _ = (key, headers);
        true
    }

    /// Whether the response is considered fresh by the caller. Only used for metrics.
    fn is_fresh(&self, headers: &ResponseHeaders) -> bool {
        let _ = headers;
        true
    }
}

/// [`FindHooks`] accepting every response.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl FindHooks for AcceptAll {}

pub type FindHooksRef = Arc<dyn FindHooks>;

/// Completion handler of a lookup through the HTTP layer, called exactly once.
pub type FindCallback = Box<dyn FnOnce(FindOutcome) + Send + 'static>;

/// Why a response was not stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Uncacheable {
    #[error("missing status code")]
    MissingStatus,
    #[error("status {0} is not cacheable without explicit freshness")]
    Status(u16),
    #[error("cache-control forbids storing")]
    Forbidden,
    #[error("varies on request headers other than accept-encoding")]
    Vary,
    #[error("sets cookies without explicit freshness")]
    Cookies,
    #[error("already expired")]
    Expired,
    #[error("html over https")]
    HtmlOverHttps,
    #[error("larger than the maximum cacheable size")]
    TooLarge,
    #[error("headers could not be serialized")]
    Encoding,
}

impl AsRef<str> for Uncacheable {
    fn as_ref(&self) -> &str {
        match self {
            Self::MissingStatus => "missing_status",
            Self::Status(_) => "status",
            Self::Forbidden => "forbidden",
            Self::Vary => "vary",
            Self::Cookies => "cookies",
            Self::Expired => "expired",
            Self::HtmlOverHttps => "html_over_https",
            Self::TooLarge => "too_large",
            Self::Encoding => "encoding",
        }
    }
}
