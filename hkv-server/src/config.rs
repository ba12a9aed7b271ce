//! # Server Configuration
//!
//! Purpose: centralize every tunable — cache sizing, pool watermarks,
//! backpressure thresholds, and the reactor's concurrency mode — behind one
//! struct loadable from a TOML file and overridable by CLI flags.
//!
//! ## Design Principles
//! 1. **One source of truth**: `ServerConfig` is what both `main` and the
//!    reactor read; nothing downstream re-derives a tunable from an env var.
//! 2. **File, then flags**: load the optional TOML file first, then apply any
//!    CLI flags the user actually passed, so flags always win.
//! 3. **Fail at the boundary**: a malformed config file or an inconsistent
//!    combination of values is an error surfaced at startup, not a panic
//!    deep in the reactor.

use std::path::Path;

use clap::{Parser as ClapParser, ValueEnum};
use serde::{Deserialize, Serialize};

/// Which concurrency contract the reactor runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReactorMode {
    /// One event-loop thread owns every connection; handlers are fully
    /// serialized across sockets.
    SingleThreaded,
    /// The poll thread dispatches each ready connection's handler as a task
    /// on the worker pool; a connection's own mutex serializes its handlers.
    Multithreaded,
}

/// Fully-resolved server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub shard_count: usize,
    pub cache_bytes: usize,
    pub reactor_mode: ReactorMode,
    pub pool_low_watermark: usize,
    pub pool_high_watermark: usize,
    pub pool_idle_time_ms: u64,
    pub pool_max_queue_size: usize,
    pub output_high_watermark: usize,
    pub output_low_watermark: usize,
    pub log_filter: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_addr: "127.0.0.1:11311".to_string(),
            shard_count: 8,
            cache_bytes: 8 * hkv_engine::PER_SHARD_FLOOR,
            reactor_mode: ReactorMode::Multithreaded,
            pool_low_watermark: 2,
            pool_high_watermark: 16,
            pool_idle_time_ms: 5_000,
            pool_max_queue_size: 1024,
            output_high_watermark: 100,
            output_low_watermark: 20,
            log_filter: "info".to_string(),
        }
    }
}

impl ServerConfig {
    /// Loads a TOML config file, falling back to defaults for any field it
    /// does not mention.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: ServerConfig = toml::from_str(&text)?;
        Ok(config)
    }
}

/// Command-line flags. Any flag left unset keeps the config-file (or
/// default) value.
#[derive(Debug, ClapParser)]
#[command(name = "hkv-server", version, about = "Memcached-style in-memory key/value server")]
pub struct Cli {
    /// Path to a TOML config file.
    #[arg(long)]
    pub config: Option<std::path::PathBuf>,

    #[arg(long)]
    pub bind_addr: Option<String>,

    #[arg(long)]
    pub shard_count: Option<usize>,

    #[arg(long)]
    pub cache_bytes: Option<usize>,

    #[arg(long, value_enum)]
    pub reactor_mode: Option<ReactorMode>,

    #[arg(long)]
    pub pool_low_watermark: Option<usize>,

    #[arg(long)]
    pub pool_high_watermark: Option<usize>,

    #[arg(long)]
    pub log_filter: Option<String>,
}

impl Cli {
    /// Resolves the final configuration: defaults, overridden by an optional
    /// config file, overridden by any flags present on the command line.
    pub fn resolve(self) -> anyhow::Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::from_file(path)?,
            None => ServerConfig::default(),
        };

        if let Some(v) = self.bind_addr {
            config.bind_addr = v;
        }
        if let Some(v) = self.shard_count {
            config.shard_count = v;
        }
        if let Some(v) = self.cache_bytes {
            config.cache_bytes = v;
        }
        if let Some(v) = self.reactor_mode {
            config.reactor_mode = v;
        }
        if let Some(v) = self.pool_low_watermark {
            config.pool_low_watermark = v;
        }
        if let Some(v) = self.pool_high_watermark {
            config.pool_high_watermark = v;
        }
        if let Some(v) = self.log_filter {
            config.log_filter = v;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_internally_consistent() {
        let config = ServerConfig::default();
        assert!(config.pool_low_watermark <= config.pool_high_watermark);
        assert!(config.output_low_watermark < config.output_high_watermark);
    }

    #[test]
    fn parses_minimal_toml_overrides() {
        let toml_text = "bind_addr = \"0.0.0.0:9999\"\nshard_count = 4\n";
        let config: ServerConfig = toml::from_str(toml_text).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:9999");
        assert_eq!(config.shard_count, 4);
        // Untouched fields keep their defaults.
        assert_eq!(config.pool_low_watermark, ServerConfig::default().pool_low_watermark);
    }
}
