//! Fixed-size sharded map used for in-process limiter state.
//!
//! Each key lives in exactly one shard and every read or write of that key
//! happens under the shard's mutex, so two callers touching the same key are
//! serialised while callers on different shards never contend. Sweeps walk the
//! shards one at a time and take the same locks as foreground traffic.

use std::collections::HashMap;
use std::hash::{BuildHasher, RandomState};
use std::sync::{Mutex, MutexGuard, PoisonError};

pub const DEFAULT_SHARDS: usize = 32;

#[derive(Debug)]
pub struct ShardedMap<V> {
    shards: Box<[Mutex<HashMap<String, V>>]>,
    hasher: RandomState,
}

impl<V> ShardedMap<V> {
    pub fn new(shard_count: usize) -> Self {
        let shard_count = shard_count.max(1);
        let shards = (0..shard_count)
            .map(|_| Mutex::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            shards,
            hasher: RandomState::new(),
        }
    }

    fn shard_for(&self, key: &str) -> MutexGuard<'_, HashMap<String, V>> {
        let index = (self.hasher.hash_one(key) as usize) % self.shards.len();
        // State is always left consistent between statements, so a panic in
        // another holder does not invalidate the map.
        self.shards[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` on the entry for `key`, creating it with `init` if missing.
    pub fn with_entry<R>(
        &self,
        key: &str,
        init: impl FnOnce() -> V,
        f: impl FnOnce(&mut V) -> R,
    ) -> R {
        let mut shard = self.shard_for(key);
        let entry = shard.entry(key.to_string()).or_insert_with(init);
        f(entry)
    }

    /// Runs `f` on the entry for `key` if present.
    pub fn with_existing<R>(&self, key: &str, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        let mut shard = self.shard_for(key);
        shard.get_mut(key).map(f)
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        self.shard_for(key).remove(key)
    }

    /// Keeps only entries for which `keep` returns true. Returns how many
    /// entries were evicted.
    pub fn retain(&self, mut keep: impl FnMut(&str, &mut V) -> bool) -> usize {
        let mut evicted = 0;
        for shard in self.shards.iter() {
            let mut shard = shard.lock().unwrap_or_else(PoisonError::into_inner);
            let before = shard.len();
            shard.retain(|key, value| keep(key, value));
            evicted += before - shard.len();
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.lock().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V> Default for ShardedMap<V> {
    fn default() -> Self {
        Self::new(DEFAULT_SHARDS)
    }
}
