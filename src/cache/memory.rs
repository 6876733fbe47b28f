//! In-process memory tier: sharded, TTL-checked, LRU-bounded.
//!
//! Keys are spread across independent shards so unrelated keys never
//! contend on one lock. Within a shard an `IndexMap` keeps entries in
//! access order: a hit moves the entry to the back, eviction past
//! capacity pops the front.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::time::Instant;

use async_trait::async_trait;
use indexmap::IndexMap;

use super::{CacheEntry, CacheTier, Tier};
use crate::error::Result;

struct MemEntry {
    value: Vec<u8>,
    created_at: Instant,
    ttl: std::time::Duration,
}

pub struct MemoryTier {
    shards: Vec<Mutex<IndexMap<String, MemEntry>>>,
    shard_capacity: usize,
}

impl MemoryTier {
    pub fn new(capacity: usize, shards: usize) -> Self {
        let shards = shards.max(1);
        let shard_capacity = (capacity / shards).max(1);
        Self {
            shards: (0..shards).map(|_| Mutex::new(IndexMap::new())).collect(),
            shard_capacity,
        }
    }

    fn shard(&self, key: &str) -> &Mutex<IndexMap<String, MemEntry>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    /// Entries currently held, expired or not.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().unwrap().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheTier for MemoryTier {
    fn tier(&self) -> Tier {
        Tier::Memory
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let mut map = self.shard(key).lock().unwrap();
        let Some(entry) = map.get(key) else {
            return Ok(None);
        };
        if entry.created_at.elapsed() >= entry.ttl {
            map.shift_remove(key);
            return Ok(None);
        }
        // Move to back to mark as most recently used.
        let entry = map.shift_remove(key).unwrap();
        let out = CacheEntry {
            key: key.to_string(),
            value: entry.value.clone(),
            created_at: entry.created_at,
            ttl: entry.ttl,
            tier_origin: Tier::Memory,
        };
        map.insert(key.to_string(), entry);
        Ok(Some(out))
    }

    async fn put(&self, entry: CacheEntry) -> Result<()> {
        let mut map = self.shard(&entry.key).lock().unwrap();
        map.shift_remove(&entry.key);
        map.insert(
            entry.key,
            MemEntry {
                value: entry.value,
                created_at: entry.created_at,
                ttl: entry.ttl,
            },
        );
        while map.len() > self.shard_capacity {
            map.shift_remove_index(0);
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.shard(key).lock().unwrap().shift_remove(key);
        Ok(())
    }

    async fn remove_prefix(&self, prefix: &str) -> Result<usize> {
        let mut removed = 0;
        for shard in &self.shards {
            let mut map = shard.lock().unwrap();
            let before = map.len();
            map.retain(|key, _| !key.starts_with(prefix));
            removed += before - map.len();
        }
        Ok(removed)
    }

    async fn clear(&self) -> Result<()> {
        for shard in &self.shards {
            shard.lock().unwrap().clear();
        }
        Ok(())
    }
}
