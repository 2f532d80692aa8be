//! Response headers and their HTTP caching semantics.

use serde::{Deserialize, Serialize};

/// Status codes that may be cached without explicit freshness information.
const IMPLICITLY_CACHEABLE_STATUS: &[u16] = &[200, 203, 300, 301, 410];

/// Headers that never make it into a cache entry.
const COOKIE_HEADERS: &[&str] = &["set-cookie", "set-cookie2"];

/// A single `Cache-Control` directive, with the name lower-cased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive<'a> {
    pub name: String,
    pub value: Option<&'a str>,
}

/// The freshness of a response as computed by [`ResponseHeaders::compute_caching`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caching {
    /// When the response was generated, from the `Date` header or the time it was received.
    pub date_ms: i64,
    /// How long after `date_ms` the response stays fresh.
    pub ttl_ms: i64,
    /// Whether the freshness was given explicitly by `Cache-Control` or `Expires`.
    pub explicit: bool,
}

impl Caching {
    pub fn expiration_ms(&self) -> i64 {
        self.date_ms.saturating_add(self.ttl_ms)
    }
}

/// Status line and headers of a response.
///
/// Header names keep their case and order, but lookups are case-insensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseHeaders {
    status_code: u16,
    headers: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    caching: Option<Caching>,
}

impl ResponseHeaders {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            ..Default::default()
        }
    }

    /// Builds headers from a list of `(name, value)` pairs.
    pub fn with_headers<'a>(
        status_code: u16,
        headers: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Self {
        let mut this = Self::new(status_code);
        for (name, value) in headers {
            this.add(name, value);
        }
        this
    }

    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push((name.into(), value.into()));
    }

    /// Replaces all values of `name` with a single `value`.
    pub fn replace(&mut self, name: &str, value: impl Into<String>) {
        self.remove_all(name);
        self.add(name, value);
    }

    /// Removes all values of `name`, returning whether there were any.
    pub fn remove_all(&mut self, name: &str) -> bool {
        let len = self.headers.len();
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.headers.len() != len
    }

    pub fn has(&self, name: &str) -> bool {
        self.lookup(name).next().is_some()
    }

    /// All values of `name`, in order.
    pub fn lookup<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The value of `name`, if there is exactly one.
    pub fn lookup1(&self, name: &str) -> Option<&str> {
        let mut values = self
            .headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str());
        let value = values.next()?;
        values.next().is_none().then_some(value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// Whether any `Content-Type` names an HTML document.
    pub fn is_html(&self) -> bool {
        self.lookup("content-type").any(|value| {
            let mime = value.split(';').next().unwrap_or_default().trim();
            mime.eq_ignore_ascii_case("text/html")
                || mime.eq_ignore_ascii_case("application/xhtml+xml")
        })
    }

    /// The declared `Content-Length`, if valid.
    pub fn content_length(&self) -> Option<u64> {
        self.lookup1("content-length")?.trim().parse().ok()
    }

    /// All `Cache-Control` directives, across all header values.
    pub fn cache_control(&self) -> Vec<Directive<'_>> {
        self.lookup("cache-control")
            .flat_map(|value| value.split(','))
            .filter_map(|directive| {
                let directive = directive.trim();
                if directive.is_empty() {
                    return None;
                }
                let (name, value) = match directive.split_once('=') {
                    Some((name, value)) => {
                        (name.trim(), Some(value.trim().trim_matches('"')))
                    }
                    None => (directive, None),
                };
                Some(Directive {
                    name: name.to_ascii_lowercase(),
                    value,
                })
            })
            .collect()
    }

    pub fn has_cache_control(&self, name: &str) -> bool {
        self.cache_control().iter().any(|d| d.name == name)
    }

    /// Whether the response may be stored by a shared cache at all.
    ///
    /// This does not look at freshness, see [`compute_caching`](Self::compute_caching).
    pub fn is_storable(&self) -> bool {
        let directives = self.cache_control();
        let forbidden = directives
            .iter()
            .any(|d| matches!(d.name.as_str(), "no-store" | "no-cache" | "private"));
        let pragma_no_cache = self
            .lookup("pragma")
            .any(|v| v.trim().eq_ignore_ascii_case("no-cache"));
        !forbidden && !pragma_no_cache
    }

    /// Whether `Vary` only names headers a cache can ignore.
    pub fn has_acceptable_vary(&self) -> bool {
        self.lookup("vary")
            .flat_map(|value| value.split(','))
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .all(|name| name.eq_ignore_ascii_case("accept-encoding"))
    }

    pub fn has_cookies(&self) -> bool {
        COOKIE_HEADERS.iter().any(|name| self.has(name))
    }

    /// Removes `Set-Cookie` and `Set-Cookie2`, returning whether there were any.
    pub fn strip_cookies(&mut self) -> bool {
        let mut stripped = false;
        for name in COOKIE_HEADERS {
            stripped |= self.remove_all(name);
        }
        stripped
    }

    /// The freshness computed by the last call to [`compute_caching`](Self::compute_caching).
    pub fn caching(&self) -> Option<Caching> {
        self.caching
    }

    pub fn set_caching(&mut self, caching: Caching) {
        self.caching = Some(caching);
    }

    /// Computes and remembers how long this response stays fresh.
    ///
    /// `s-maxage` takes precedence over `max-age`, which takes precedence over `Expires`.
    /// Without any of those, the `implicit_ttl_ms` applies to implicitly cacheable status
    /// codes. Returns `None` for responses that are never fresh.
    pub fn compute_caching(&mut self, now_ms: i64, implicit_ttl_ms: i64) -> Option<Caching> {
        let date_ms = self
            .lookup1("date")
            .and_then(parse_http_date)
            .unwrap_or(now_ms);

        let explicit_ttl_ms = {
            let directives = self.cache_control();
            let max_age = |name: &str| {
                directives
                    .iter()
                    .find(|d| d.name == name)
                    .map(|d| d.value.and_then(|v| v.parse::<i64>().ok()).unwrap_or(0))
            };

            if let Some(seconds) = max_age("s-maxage").or_else(|| max_age("max-age")) {
                Some(seconds.max(0).saturating_mul(1000))
            } else if let Some(expires) = self.lookup1("expires") {
                // an invalid `Expires` means already expired
                let expires_ms = parse_http_date(expires).unwrap_or(date_ms);
                Some(expires_ms.saturating_sub(date_ms).max(0))
            } else {
                None
            }
        };

        let caching = match explicit_ttl_ms {
            Some(ttl_ms) => Caching {
                date_ms,
                ttl_ms,
                explicit: true,
            },
            None if IMPLICITLY_CACHEABLE_STATUS.contains(&self.status_code) => Caching {
                date_ms,
                ttl_ms: implicit_ttl_ms,
                explicit: false,
            },
            None => {
                self.caching = None;
                return None;
            }
        };
        self.caching = Some(caching);
        Some(caching)
    }
}

/// Parses an HTTP date (RFC 2822 style, as in `Date` and `Expires`) into unix milliseconds.
pub fn parse_http_date(value: &str) -> Option<i64> {
    chrono::DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|date| date.timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DATE: &str = "Tue, 15 Nov 1994 08:12:31 GMT";
    const DATE_MS: i64 = 784_887_151_000;

    #[test]
    fn test_case_insensitive_lookup() {
        let mut headers = ResponseHeaders::with_headers(
            200,
            [("Content-Type", "text/css"), ("X-Multi", "a"), ("x-multi", "b")],
        );
        assert_eq!(headers.lookup1("content-type"), Some("text/css"));
        assert_eq!(headers.lookup("X-MULTI").collect::<Vec<_>>(), ["a", "b"]);
        assert_eq!(headers.lookup1("x-multi"), None);

        headers.replace("x-multi", "c");
        assert_eq!(headers.lookup1("X-Multi"), Some("c"));
        assert!(headers.remove_all("CONTENT-TYPE"));
        assert!(!headers.has("content-type"));
    }

    #[test]
    fn test_parse_http_date() {
        assert_eq!(parse_http_date(DATE), Some(DATE_MS));
        assert_eq!(parse_http_date("yesterday"), None);
    }

    #[test]
    fn test_max_age() {
        let mut headers = ResponseHeaders::with_headers(
            200,
            [("Date", DATE), ("Cache-Control", "public, max-age=300")],
        );
        let caching = headers.compute_caching(0, 1).unwrap();
        assert_eq!(caching.date_ms, DATE_MS);
        assert_eq!(caching.ttl_ms, 300_000);
        assert!(caching.explicit);
        assert_eq!(caching.expiration_ms(), DATE_MS + 300_000);
        assert_eq!(headers.caching(), Some(caching));
    }

    #[test]
    fn test_s_maxage_wins() {
        let mut headers = ResponseHeaders::with_headers(
            200,
            [("Cache-Control", "max-age=10"), ("Cache-Control", "s-maxage=20")],
        );
        let caching = headers.compute_caching(1000, 1).unwrap();
        assert_eq!(caching.date_ms, 1000);
        assert_eq!(caching.ttl_ms, 20_000);
    }

    #[test]
    fn test_expires() {
        let mut headers = ResponseHeaders::with_headers(
            200,
            [("Date", DATE), ("Expires", "Tue, 15 Nov 1994 08:22:31 GMT")],
        );
        assert_eq!(headers.compute_caching(0, 1).unwrap().ttl_ms, 600_000);

        let mut headers = ResponseHeaders::with_headers(200, [("Expires", "0")]);
        assert_eq!(headers.compute_caching(0, 1).unwrap().ttl_ms, 0);
    }

    #[test]
    fn test_implicit_ttl() {
        let mut headers = ResponseHeaders::new(200);
        let caching = headers.compute_caching(5, 300_000).unwrap();
        assert!(!caching.explicit);
        assert_eq!(caching.ttl_ms, 300_000);

        let mut headers = ResponseHeaders::new(404);
        assert_eq!(headers.compute_caching(5, 300_000), None);

        // explicit freshness applies to any status
        let mut headers =
            ResponseHeaders::with_headers(404, [("Cache-Control", "max-age=60")]);
        assert_eq!(headers.compute_caching(5, 300_000).unwrap().ttl_ms, 60_000);
    }

    #[test]
    fn test_storable() {
        let storable = |value: &str| {
            ResponseHeaders::with_headers(200, [("Cache-Control", value)]).is_storable()
        };
        assert!(storable("public, max-age=60"));
        assert!(!storable("private, max-age=60"));
        assert!(!storable("no-store"));
        assert!(!storable("max-age=60, No-Cache"));

        let pragma = ResponseHeaders::with_headers(200, [("Pragma", "no-cache")]);
        assert!(!pragma.is_storable());
    }

    #[test]
    fn test_vary() {
        let vary = |value: &str| ResponseHeaders::with_headers(200, [("Vary", value)]);
        assert!(ResponseHeaders::new(200).has_acceptable_vary());
        assert!(vary("Accept-Encoding").has_acceptable_vary());
        assert!(!vary("Accept-Encoding, User-Agent").has_acceptable_vary());
        assert!(!vary("*").has_acceptable_vary());
    }

    #[test]
    fn test_strip_cookies() {
        let mut headers = ResponseHeaders::with_headers(
            200,
            [
                ("Set-Cookie", "a=1"),
                ("Content-Type", "text/html"),
                ("set-cookie2", "b=2"),
            ],
        );
        assert!(headers.has_cookies());
        assert!(headers.strip_cookies());
        assert!(!headers.has_cookies());
        assert_eq!(headers.len(), 1);
        assert!(headers.is_html());
    }
}
