//! hkv-common - Shared error types and wire protocol for HybridKV
//!
//! This crate defines the Memcached-style ASCII protocol (parser, command
//! dispatch, and the `Storage` trait the engine crate implements) plus the
//! error enum shared by the engine, pool, and server crates.

pub mod error;
pub mod protocol;

pub use error::{HkvError, HkvResult};
pub use protocol::{dispatch, CommandHeader, ParseOutcome, Parser, ProtocolError, Storage};
