//! Proxycache.
//!
//! Maintenance commands for the caches of the resource rewriting proxy: enforce the quota of a
//! shared cache directory, and inspect or remove what the cache tiers hold for a key.

#![warn(
    missing_docs,
    missing_debug_implementations,
    unused_crate_dependencies,
    clippy::all
)]

mod cli;
mod logging;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
