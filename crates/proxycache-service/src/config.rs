use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{de, Deserialize, Deserializer};
use tracing::level_filters::LevelFilter;

use crate::caching::{BatcherConfig, FileCacheConfig, MemoryCacheConfig, RemoteCacheConfig};
use crate::http::{HttpCacheConfig, WriteThroughConfig};

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A tag name to report the hostname to, for each metric. Defaults to not sending such a tag.
    pub hostname_tag: Option<String>,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: match env::var("STATSD_SERVER") {
                Ok(metrics_statsd) => Some(metrics_statsd),
                Err(_) => None,
            },
            prefix: "proxycache".into(),
            hostname_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root directory of the disk tier. Default is not to cache on disk.
    pub cache_dir: Option<PathBuf>,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// The in-process memory tier.
    pub memory: MemoryCacheConfig,

    /// Quota and clean schedule of the disk tier.
    pub file_cache: FileCacheConfig,

    /// HTTP caching policy, shared by all tiers.
    pub http_cache: HttpCacheConfig,

    pub write_through: WriteThroughConfig,

    /// Admission control in front of the networked tier.
    pub batcher: BatcherConfig,

    /// The networked tier. Takes the place of the disk tier behind the memory tier when set.
    pub remote: Option<RemoteCacheConfig>,
}

impl Config {
    /// Loads the config from the YAML file at `path`, or the defaults without a path.
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    pub fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        // check for empty files explicitly
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::get(None).unwrap();
        assert_eq!(cfg.cache_dir, None);
        assert!(cfg.remote.is_none());
        assert_eq!(cfg.batcher.max_parallel_lookups, 16);
        assert_eq!(cfg.batcher.max_queue_size, 200);
        assert_eq!(cfg.http_cache.fetch_failed_ttl, Duration::from_secs(300));
        assert_eq!(cfg.http_cache.dropped_ttl, Duration::from_secs(10));
        assert_eq!(cfg.file_cache.clean_interval, Duration::from_secs(3600));
    }

    #[test]
    fn test_partial_sections() {
        // Setting single values keeps the defaults of their siblings.
        let yaml = r#"
            cache_dir: /tmp/proxycache
            file_cache:
              target_size: 1048576
              clean_interval: 10m
            http_cache:
              dropped_ttl: 30s
              disable_html_caching_on_https: true
            write_through:
              tier1_max_size: 65536
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.cache_dir, Some(PathBuf::from("/tmp/proxycache")));
        assert_eq!(cfg.file_cache.target_size, 1048576);
        assert_eq!(cfg.file_cache.clean_interval, Duration::from_secs(600));
        assert_eq!(
            cfg.file_cache.clean_lock_timeout,
            FileCacheConfig::default().clean_lock_timeout
        );
        assert_eq!(cfg.http_cache.dropped_ttl, Duration::from_secs(30));
        assert_eq!(cfg.http_cache.fetch_failed_ttl, Duration::from_secs(300));
        assert!(cfg.http_cache.disable_html_caching_on_https);
        assert_eq!(cfg.write_through.tier1_max_size, Some(65536));
        assert_eq!(cfg.memory, MemoryCacheConfig::default());
    }

    #[test]
    fn test_remote() {
        let yaml = r#"
            remote:
              base_url: "http://cache.internal:8080/objects/"
              store_timeout: 5s
            batcher:
              max_queue_size: 10
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        let remote = cfg.remote.unwrap();
        assert_eq!(remote.base_url.as_str(), "http://cache.internal:8080/objects/");
        assert_eq!(remote.store_timeout, Duration::from_secs(5));
        assert_eq!(remote.connect_timeout, Duration::from_millis(500));
        assert_eq!(cfg.batcher.max_queue_size, 10);
        assert_eq!(cfg.batcher.max_parallel_lookups, 16);
    }

    #[test]
    fn test_logging() {
        let yaml = r#"
            logging:
              level: debug
              format: json
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.logging.level, LevelFilter::DEBUG);
        assert_eq!(cfg.logging.format, LogFormat::Json);

        let yaml = r#"
            logging:
              level: loud
        "#;
        assert!(Config::from_reader(yaml.as_bytes()).is_err());
    }

    #[test]
    fn test_unknown_fields() {
        // Unknown fields should not cause failure
        let yaml = r#"
            http_cache:
              not_a_setting: 1
        "#;
        assert!(Config::from_reader(yaml.as_bytes()).is_ok());
    }

    #[test]
    fn test_empty_file() {
        assert!(Config::from_reader("  \n".as_bytes()).is_err());
    }
}
