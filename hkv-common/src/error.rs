//! # Error Types
//!
//! Shared error enum for the storage engine, the wire protocol, and the
//! thread pool. Every fallible boundary in the workspace returns `HkvResult`
//! so callers at the process edge can fold everything into `anyhow::Error`
//! without inventing a second error hierarchy per crate.
//!
//! ## Design Principles
//! 1. **Typed, not stringly**: each rejection reason is its own variant so
//!    callers can match on it instead of parsing messages.
//! 2. **No panics for admission rejection**: oversized entries, full queues,
//!    and bad configuration are values, not unwinds.
//! 3. **`thiserror` at the boundary**: `Display`/`Error` come for free, and
//!    `anyhow` composes these without any `From` boilerplate at the top.

use thiserror::Error;

/// Convenience alias used throughout the workspace.
pub type HkvResult<T> = Result<T, HkvError>;

/// Errors surfaced by the storage engine, the wire protocol, and the pool.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum HkvError {
    /// Requested key has no resident entry.
    #[error("key not found")]
    NotFound,

    /// `key.len() + value.len()` exceeds the shard's configured budget; the
    /// entry was rejected outright, never partially admitted.
    #[error("entry of {entry_len} bytes exceeds the {max_size} byte shard budget")]
    EntryTooLarge { entry_len: usize, max_size: usize },

    /// A striped cache was asked for a per-shard byte budget below the
    /// configured floor (1 MiB by default).
    #[error("per-shard budget {per_shard} bytes is below the {floor} byte floor")]
    ShardBudgetTooSmall { per_shard: usize, floor: usize },

    /// Thread pool constructor received an inconsistent watermark pair.
    #[error("invalid thread pool watermarks: low={low}, high={high}")]
    InvalidWatermarks { low: usize, high: usize },

    /// A malformed wire request that cannot be resynchronized.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Generic configuration problem surfaced at construction time.
    #[error("configuration error: {0}")]
    Config(String),
}
