#[macro_use]
pub mod metrics;

pub mod caching;
pub mod clock;
pub mod config;
pub mod http;
pub mod logging;
