//! hkv-server - Reactor, connection state machine, and process bootstrap
//!
//! The socket accept loop, signal handling, configuration, and logging live
//! here alongside the connection state machine they drive.

pub mod config;
pub mod connection;
pub mod metrics;
pub mod server;

pub use config::{Cli, ReactorMode, ServerConfig};
pub use server::{run, Server};
