//! hkv-server - process entry point: parse CLI/config, wire up logging, bind
//! the storage engine, and hand off to the reactor.

use std::sync::Arc;

use clap::Parser as _;
use tracing_subscriber::EnvFilter;

use hkv_common::Storage;
use hkv_engine::StripedCache;
use hkv_server::{Cli, ServerConfig};

fn main() -> anyhow::Result<()> {
    let config = Cli::parse().resolve()?;
    init_logging(&config);

    tracing::info!(
        bind_addr = %config.bind_addr,
        shard_count = config.shard_count,
        reactor_mode = ?config.reactor_mode,
        "starting hkv-server",
    );

    let storage: Arc<dyn Storage> = Arc::new(StripedCache::new(config.shard_count, config.cache_bytes)?);
    hkv_server::run(config, storage)
}

fn init_logging(config: &ServerConfig) {
    let filter = EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
