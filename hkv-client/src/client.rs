//! # Synchronous Client API
//!
//! Purpose: expose a compact, blocking API for issuing Memcached-ASCII
//! commands to an hkv-server instance over plain TCP.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `KVClient` hides pooling and protocol details.
//! 2. **Borrow-Friendly API**: accept `&[u8]` to avoid unnecessary copies.
//! 3. **Fail Fast**: protocol violations surface immediately as errors.
//! 4. **Performance First**: prefer direct TCP writes and buffer reuse.

use std::fmt;
use std::time::Duration;

use crate::pool::{ConnectionPool, PoolConfig};
use crate::wire::Response;

/// Result type for the sync client.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by the sync client.
#[derive(Debug)]
pub enum ClientError {
    /// Network or IO failure while reading/writing.
    Io(std::io::Error),
    /// Wire framing or parse error.
    Protocol,
    /// Server returned a `CLIENT_ERROR` or `SERVER_ERROR` reply.
    Server { message: Vec<u8> },
    /// Response type did not match the expected command response.
    UnexpectedResponse,
    /// Pool is at capacity and no idle connections are available.
    PoolExhausted,
    /// Address could not be parsed into a socket address.
    InvalidAddress,
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Io(err) => write!(f, "io error: {}", err),
            ClientError::Protocol => write!(f, "protocol error"),
            ClientError::Server { message } => {
                write!(f, "server error: {}", String::from_utf8_lossy(message))
            }
            ClientError::UnexpectedResponse => write!(f, "unexpected response"),
            ClientError::PoolExhausted => write!(f, "connection pool exhausted"),
            ClientError::InvalidAddress => write!(f, "invalid address"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        ClientError::Io(err)
    }
}

/// Configuration for the synchronous client and its pool.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server address, e.g. "127.0.0.1:11311".
    pub addr: String,
    /// Maximum idle connections kept in the pool.
    pub max_idle: usize,
    /// Maximum total connections (idle + in-use).
    pub max_total: usize,
    /// Optional TCP read timeout.
    pub read_timeout: Option<Duration>,
    /// Optional TCP write timeout.
    pub write_timeout: Option<Duration>,
    /// Optional TCP connect timeout.
    pub connect_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            addr: "127.0.0.1:11311".to_string(),
            max_idle: 8,
            max_total: 16,
            read_timeout: None,
            write_timeout: None,
            connect_timeout: None,
        }
    }
}

/// Synchronous client with connection pooling.
///
/// This is a facade over the pool and the wire encoder/decoder. Each call
/// acquires a connection, executes one command, and returns the connection
/// to the pool.
pub struct KVClient {
    pool: ConnectionPool,
}

impl KVClient {
    /// Creates a client with default configuration.
    pub fn connect(addr: impl Into<String>) -> ClientResult<Self> {
        let mut config = ClientConfig::default();
        config.addr = addr.into();
        Self::with_config(config)
    }

    /// Creates a client with a custom configuration.
    pub fn with_config(config: ClientConfig) -> ClientResult<Self> {
        let pool = ConnectionPool::new(PoolConfig {
            addr: config.addr,
            max_idle: config.max_idle,
            max_total: config.max_total,
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
            connect_timeout: config.connect_timeout,
        })?;
        Ok(KVClient { pool })
    }

    /// Fetches a value by key. Returns `Ok(None)` on a cache miss.
    pub fn get(&self, key: &[u8]) -> ClientResult<Option<Vec<u8>>> {
        let mut conn = self.pool.acquire()?;
        match conn.exec_get(key)? {
            Response::Value(data) => Ok(Some(data)),
            Response::End => Ok(None),
            Response::ClientError(message) | Response::ServerError(message) => {
                Err(ClientError::Server { message })
            }
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Unconditionally stores a value for a key.
    ///
    /// Returns `Ok(false)` when the server declined the entry (e.g. it
    /// exceeds the configured maximum entry size) instead of surfacing an
    /// error — the request was well-formed, the server simply rejected it.
    pub fn set(&self, key: &[u8], value: &[u8]) -> ClientResult<bool> {
        let mut conn = self.pool.acquire()?;
        match conn.exec_with_value("set", key, value)? {
            Response::Stored => Ok(true),
            Response::ServerError(_) => Ok(false),
            Response::ClientError(message) => Err(ClientError::Server { message }),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Stores a value only if the key is absent. Returns `false` if the key
    /// already exists.
    pub fn add(&self, key: &[u8], value: &[u8]) -> ClientResult<bool> {
        let mut conn = self.pool.acquire()?;
        match conn.exec_with_value("add", key, value)? {
            Response::Stored => Ok(true),
            Response::NotStored => Ok(false),
            Response::ClientError(message) | Response::ServerError(message) => {
                Err(ClientError::Server { message })
            }
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Stores a value only if the key already exists. Returns `false` if the
    /// key was absent.
    pub fn replace(&self, key: &[u8], value: &[u8]) -> ClientResult<bool> {
        let mut conn = self.pool.acquire()?;
        match conn.exec_with_value("replace", key, value)? {
            Response::Stored => Ok(true),
            Response::NotStored => Ok(false),
            Response::ClientError(message) | Response::ServerError(message) => {
                Err(ClientError::Server { message })
            }
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Deletes a key. Returns `true` when a key was removed.
    pub fn delete(&self, key: &[u8]) -> ClientResult<bool> {
        let mut conn = self.pool.acquire()?;
        match conn.exec_delete(key)? {
            Response::Deleted => Ok(true),
            Response::NotFound => Ok(false),
            Response::ClientError(message) | Response::ServerError(message) => {
                Err(ClientError::Server { message })
            }
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Fetches the server's version string.
    pub fn version(&self) -> ClientResult<Vec<u8>> {
        let mut conn = self.pool.acquire()?;
        match conn.exec_version()? {
            Response::Version(text) => Ok(text),
            Response::ClientError(message) | Response::ServerError(message) => {
                Err(ClientError::Server { message })
            }
            _ => Err(ClientError::UnexpectedResponse),
        }
    }
}
