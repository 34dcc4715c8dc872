//! Community calendar: events, venues and sources in SQLite, calendar feed
//! import, duplicate squashing, swappable search, and a JSON HTTP surface.

pub mod config;
pub mod dates;
pub mod db;
pub mod import;
pub mod models;
pub mod search;
pub mod server;
pub mod source_parser;
pub mod utils;

use std::sync::Arc;

use anyhow::anyhow;
use tracing_subscriber::EnvFilter;

use config::ConfigStore;
use import::HttpFetcher;

/// Console logging; `RUST_LOG` wins over the verbosity flag.
pub fn init_tracing(verbose: bool) -> anyhow::Result<()> {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbose)
        .compact()
        .try_init()
        .map_err(|err| anyhow!(err))
}

/// Serves the HTTP API until interrupted.
pub fn run(config: ConfigStore) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(server::serve(config, Arc::new(HttpFetcher)))
}
