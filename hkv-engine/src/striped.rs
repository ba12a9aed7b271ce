//! # Striped Cache
//!
//! Fans a key space out across `N` independent [`LruShard`]s, each guarded by
//! its own lock, so operations on distinct shards run fully in parallel.
//!
//! ## Design Principles
//! 1. **Shared hasher, one seed**: a single `ahash::RandomState` is built at
//!    construction and reused for every `shard_index` call; it is never
//!    re-seeded per call.
//! 2. **Modulo routing over arbitrary `N`**: unlike a power-of-two mask,
//!    plain `hash % N` lets the caller pick any shard count `N >= 1`,
//!    matching the data model's only constraint on `N`.
//! 3. **Per-shard floor enforced at construction**: a total budget spread too
//!    thin across too many shards is rejected up front as a configuration
//!    error rather than silently built.

use std::hash::{BuildHasher, Hasher};

use ahash::RandomState;
use parking_lot::Mutex;

use hkv_common::{HkvError, HkvResult, Storage};

use crate::lru::LruShard;

/// Minimum bytes a single shard may be budgeted; below this the constructor
/// rejects the configuration rather than building an unusably small cache.
pub const PER_SHARD_FLOOR: usize = 1024 * 1024;

struct ShardSlot {
    inner: Mutex<LruShard>,
}

/// A fixed fan-out array of independently locked LRU shards.
pub struct StripedCache {
    shards: Vec<ShardSlot>,
    hash_state: RandomState,
}

impl StripedCache {
    /// Builds a cache of `count` shards sharing `total_max_bytes` evenly.
    ///
    /// Fails if the resulting per-shard budget would fall below
    /// [`PER_SHARD_FLOOR`], or if `count` is zero.
    pub fn new(count: usize, total_max_bytes: usize) -> HkvResult<Self> {
        if count == 0 {
            return Err(HkvError::Config("shard count must be at least 1".into()));
        }

        let per_shard = total_max_bytes / count;
        if per_shard < PER_SHARD_FLOOR {
            return Err(HkvError::ShardBudgetTooSmall {
                per_shard,
                floor: PER_SHARD_FLOOR,
            });
        }

        let shards = (0..count)
            .map(|_| ShardSlot {
                inner: Mutex::new(LruShard::new(per_shard)),
            })
            .collect();

        Ok(StripedCache {
            shards,
            hash_state: RandomState::new(),
        })
    }

    /// Number of shards in the fan-out array.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Total bytes resident across all shards.
    pub fn used_bytes(&self) -> usize {
        self.shards
            .iter()
            .map(|slot| slot.inner.lock().used_bytes())
            .sum()
    }

    fn shard_index(&self, key: &[u8]) -> usize {
        let mut hasher = self.hash_state.build_hasher();
        hasher.write(key);
        (hasher.finish() as usize) % self.shards.len()
    }

    fn shard(&self, key: &[u8]) -> &ShardSlot {
        &self.shards[self.shard_index(key)]
    }
}

impl Storage for StripedCache {
    fn put(&self, key: &[u8], value: &[u8]) -> bool {
        self.shard(key).inner.lock().put(key, value)
    }

    fn put_if_absent(&self, key: &[u8], value: &[u8]) -> bool {
        self.shard(key).inner.lock().put_if_absent(key, value)
    }

    fn set(&self, key: &[u8], value: &[u8]) -> bool {
        self.shard(key).inner.lock().set(key, value)
    }

    fn delete(&self, key: &[u8]) -> bool {
        self.shard(key).inner.lock().delete(key)
    }

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.shard(key).inner.lock().get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_budget_below_floor() {
        let err = StripedCache::new(8, 4 * 1024 * 1024).unwrap_err();
        assert!(matches!(err, HkvError::ShardBudgetTooSmall { .. }));
    }

    #[test]
    fn rejects_zero_shards() {
        assert!(StripedCache::new(0, PER_SHARD_FLOOR).is_err());
    }

    #[test]
    fn accepts_budget_at_floor() {
        let cache = StripedCache::new(4, 4 * PER_SHARD_FLOOR).unwrap();
        assert_eq!(cache.shard_count(), 4);
    }

    #[test]
    fn distinct_shards_operate_independently() {
        let cache = StripedCache::new(4, 4 * PER_SHARD_FLOOR).unwrap();
        assert!(cache.put(b"a", b"1"));
        assert!(cache.put(b"b", b"2"));
        assert_eq!(cache.get(b"a"), Some(b"1".to_vec()));
        assert_eq!(cache.get(b"b"), Some(b"2".to_vec()));
        assert!(cache.delete(b"a"));
        assert_eq!(cache.get(b"a"), None);
        assert_eq!(cache.get(b"b"), Some(b"2".to_vec()));
    }

    #[test]
    fn striped_equivalence_for_a_single_key() {
        // Any sequence of operations touching one key behaves exactly like a
        // bare LruShard sized at total/N, since only one shard is ever hit.
        let cache = StripedCache::new(4, 4 * PER_SHARD_FLOOR).unwrap();
        let mut baseline = LruShard::new(PER_SHARD_FLOOR);

        for (op, key, value) in [
            ("put", &b"only-key"[..], &b"v1"[..]),
            ("set", &b"only-key"[..], &b"v2"[..]),
        ] {
            match op {
                "put" => {
                    assert_eq!(cache.put(key, value), baseline.put(key, value));
                }
                "set" => {
                    assert_eq!(cache.set(key, value), baseline.set(key, value));
                }
                _ => unreachable!(),
            }
        }
        assert_eq!(cache.get(b"only-key"), baseline.get(b"only-key"));
    }
}
