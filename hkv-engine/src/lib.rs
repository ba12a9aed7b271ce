//! hkv-engine - Byte-budgeted LRU storage for HybridKV
//!
//! Exposes a single-shard [`LruShard`] and the concurrent [`StripedCache`]
//! built from it. Both implement no expiry, no replication, and no
//! authentication; they only ever reject or admit entries by byte size.

pub mod lru;
pub mod striped;

pub use hkv_common::Storage;
pub use lru::LruShard;
pub use striped::{StripedCache, PER_SHARD_FLOOR};
