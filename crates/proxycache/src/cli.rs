//! Exposes the command line application.
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use proxycache_service::caching::Caches;
use proxycache_service::clock::SystemClock;
use proxycache_service::config::Config;
use proxycache_service::http::{
    AcceptAll, FindOutcome, FindResult, HttpCacheExt, HttpCacheInterface,
};
use proxycache_service::metrics;

use crate::logging;

/// Proxycache commands.
#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Command {
    /// Clean the cache directory down to its configured quota.
    Cleanup,

    /// Look up a key in all cache tiers and print what they hold.
    Inspect {
        /// The cache key.
        key: String,
    },

    /// Remove a key from all cache tiers.
    Delete {
        /// The cache key.
        key: String,
    },
}

/// Command line interface parser.
#[derive(Parser, Debug)]
#[command(name = "proxycache", version)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    // SAFETY: No other threads are running at this point.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        let mut tags = config.metrics.custom_tags.clone();
        if let Some(ref tag) = config.metrics.hostname_tag {
            if let Some(name) = hostname::get().ok().and_then(|s| s.into_string().ok()) {
                tags.insert(tag.clone(), name);
            }
        }
        metrics::configure_statsd(&config.metrics.prefix, statsd, tags)?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the runtime")?;

    runtime.block_on(async move {
        let caches = Caches::from_config(&config, Arc::new(SystemClock))?;
        let result = match cli.command {
            Command::Cleanup => cleanup(&caches),
            Command::Inspect { ref key } => inspect(&caches, key).await,
            Command::Delete { ref key } => {
                caches.http.delete(key);
                Ok(())
            }
        };
        caches.flush().await;
        caches.shut_down();
        result
    })
}

fn cleanup(caches: &Caches) -> Result<()> {
    let file = caches
        .file
        .as_ref()
        .context("no cache_dir configured, nothing to clean")?;

    match file.clean_now().context("failed to clean up caches")? {
        Some(report) => {
            tracing::info!(
                size_before = report.size_before,
                inodes_before = report.inodes_before,
                evicted_files = report.evicted_files,
                freed_bytes = report.freed_bytes,
                removed_dirs = report.removed_dirs,
                "Cleaned {}",
                file.root().display()
            );
            if !report.success {
                anyhow::bail!("some files could not be cleaned up");
            }
        }
        None => tracing::info!("Another process is cleaning the cache directory"),
    }
    Ok(())
}

async fn inspect(caches: &Caches, key: &str) -> Result<()> {
    let outcome = caches.http.find_async(key, Arc::new(AcceptAll)).await;
    match outcome.result {
        FindResult::Found => println!("{key}: found"),
        FindResult::NotFound => println!("{key}: not found"),
        FindResult::RecentFailure(kind) => println!("{key}: recent failure ({})", kind.as_ref()),
    }
    print_values(&outcome);
    Ok(())
}

fn print_values(outcome: &FindOutcome) {
    let values = [("value", outcome.value.as_ref()), ("stale", outcome.stale.as_ref())];
    for (label, value) in values {
        let Some(value) = value else {
            continue;
        };
        let headers = value.headers();
        println!("{label}: HTTP {}, {} body bytes", headers.status_code(), value.body().len());
        for (name, header) in headers.iter() {
            println!("  {name}: {header}");
        }
        if let Some(caching) = headers.caching() {
            println!(
                "  (date {} ms, ttl {} ms, explicit: {})",
                caching.date_ms, caching.ttl_ms, caching.explicit
            );
        }
    }
}
