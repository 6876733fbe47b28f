//! Tiered cache store
//!
//! What this module provides
//! - A key-value store composed of interchangeable tiers consulted in
//!   increasing-latency order, with backfill of faster tiers on a hit
//!
//! Exports
//! - Models
//!   - `CacheEntry { key, value, created_at, ttl, tier_origin }`
//!   - `Tier::{Memory, Remote, Disk}`
//!   - `CacheStats` with per-tier hit breakdown
//! - Traits
//!   - `CacheTier`: the contract any backing tier must satisfy
//! - Services
//!   - `TieredCache` with `get`/`put`/`invalidate`/`invalidate_all`
//!
//! Implementation strategy
//! - `get` probes memory → remote → disk; a hit in a slower tier
//!   backfills every faster tier before returning
//! - `put` writes all configured tiers; tier write failures are logged
//!   and swallowed — a cache write never fails the calling operation
//! - Each tier enforces its own expiry on read; an expired entry is
//!   purged at the tier that held it and treated as a miss
//! - Total tier unavailability degrades the store to always-miss
//!
//! Composition
//! - `TieredCache::builder().memory(&cfg).remote(tier).disk(dir)?.build()`
//!
//! Testing strategy
//! - Fake tiers with scriptable failures assert degradation and
//!   swallowed writes; tier hit counters verify backfill

pub mod disk;
pub mod memory;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::error::Result;

pub use disk::DiskTier;
pub use memory::MemoryTier;

/// Which tier an entry was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Memory,
    Remote,
    Disk,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Memory => f.write_str("memory"),
            Tier::Remote => f.write_str("remote"),
            Tier::Disk => f.write_str("disk"),
        }
    }
}

/// One cached value with its expiry bookkeeping.
///
/// Owned by the cache store; callers receive clones and never mutate
/// an entry in place.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub value: Vec<u8>,
    pub created_at: Instant,
    pub ttl: Duration,
    pub tier_origin: Tier,
}

impl CacheEntry {
    pub fn new(key: impl Into<String>, value: Vec<u8>, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            value,
            created_at: Instant::now(),
            ttl,
            tier_origin: Tier::Memory,
        }
    }

    /// An entry is never returned once its TTL has elapsed.
    pub fn expired(&self) -> bool {
        self.created_at.elapsed() >= self.ttl
    }

    /// TTL left before this entry expires.
    pub fn remaining(&self) -> Duration {
        self.ttl.saturating_sub(self.created_at.elapsed())
    }
}

/// Contract a backing tier must satisfy.
///
/// Implementations enforce their own expiry on read and report
/// unavailability as `UpstreamError::CacheUnavailable`; the tiered
/// store degrades past an unavailable tier rather than failing.
#[async_trait]
pub trait CacheTier: Send + Sync {
    fn tier(&self) -> Tier;

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>>;

    async fn put(&self, entry: CacheEntry) -> Result<()>;

    async fn remove(&self, key: &str) -> Result<()>;

    /// Remove every entry whose key starts with `prefix`; returns how
    /// many were dropped.
    async fn remove_prefix(&self, prefix: &str) -> Result<usize>;

    async fn clear(&self) -> Result<()>;
}

#[derive(Default)]
struct TierCounters {
    hits: AtomicU64,
}

/// Snapshot of cache effectiveness counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Hits broken down by the tier that served them.
    pub tier_hits: Vec<(Tier, u64)>,
}

/// Tiered cache store: memory → remote → disk.
pub struct TieredCache {
    tiers: Vec<Arc<dyn CacheTier>>,
    counters: Vec<TierCounters>,
    misses: AtomicU64,
}

impl TieredCache {
    pub fn builder() -> TieredCacheBuilder {
        TieredCacheBuilder::default()
    }

    /// Memory tier plus optional disk tier, per configuration.
    pub fn from_config(config: &CacheConfig) -> Result<Self> {
        let mut builder = Self::builder().memory(config);
        if let Some(dir) = &config.disk_dir {
            builder = builder.disk(dir)?;
        }
        Ok(builder.build())
    }

    /// Probe tiers in increasing-latency order; backfill faster tiers on
    /// a slow-tier hit so subsequent reads are served from memory.
    pub async fn get(&self, key: &str) -> Option<CacheEntry> {
        for (idx, tier) in self.tiers.iter().enumerate() {
            match tier.get(key).await {
                Ok(Some(entry)) => {
                    self.counters[idx].hits.fetch_add(1, Ordering::Relaxed);
                    debug!(key, tier = %tier.tier(), "cache hit");
                    self.backfill(&entry, idx).await;
                    return Some(entry);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(key, tier = %tier.tier(), error = %e, "cache tier unavailable on read");
                }
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!(key, "cache miss");
        None
    }

    /// Write to every configured tier. Best-effort: tier failures are
    /// logged and swallowed.
    pub async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) {
        let entry = CacheEntry::new(key, value, ttl);
        for tier in &self.tiers {
            if let Err(e) = tier.put(entry.clone()).await {
                warn!(key, tier = %tier.tier(), error = %e, "cache tier write failed");
            }
        }
        debug!(key, ttl_secs = ttl.as_secs(), "cache set");
    }

    pub async fn invalidate(&self, key: &str) {
        for tier in &self.tiers {
            if let Err(e) = tier.remove(key).await {
                warn!(key, tier = %tier.tier(), error = %e, "cache tier invalidate failed");
            }
        }
    }

    /// Drop every key starting with `prefix` from all tiers; returns
    /// the number of entries removed across tiers.
    pub async fn invalidate_prefix(&self, prefix: &str) -> usize {
        let mut removed = 0;
        for tier in &self.tiers {
            match tier.remove_prefix(prefix).await {
                Ok(n) => removed += n,
                Err(e) => {
                    warn!(prefix, tier = %tier.tier(), error = %e, "cache tier prefix invalidate failed");
                }
            }
        }
        removed
    }

    pub async fn invalidate_all(&self) {
        for tier in &self.tiers {
            if let Err(e) = tier.clear().await {
                warn!(tier = %tier.tier(), error = %e, "cache tier clear failed");
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        let tier_hits: Vec<(Tier, u64)> = self
            .tiers
            .iter()
            .zip(&self.counters)
            .map(|(t, c)| (t.tier(), c.hits.load(Ordering::Relaxed)))
            .collect();
        CacheStats {
            hits: tier_hits.iter().map(|(_, h)| h).sum(),
            misses: self.misses.load(Ordering::Relaxed),
            tier_hits,
        }
    }

    async fn backfill(&self, entry: &CacheEntry, found_at: usize) {
        for tier in &self.tiers[..found_at] {
            if let Err(e) = tier.put(entry.clone()).await {
                warn!(key = %entry.key, tier = %tier.tier(), error = %e, "cache backfill failed");
            }
        }
    }
}

/// Assembles tiers in probe order.
#[derive(Default)]
pub struct TieredCacheBuilder {
    memory: Option<Arc<dyn CacheTier>>,
    remote: Option<Arc<dyn CacheTier>>,
    disk: Option<Arc<dyn CacheTier>>,
}

impl TieredCacheBuilder {
    pub fn memory(mut self, config: &CacheConfig) -> Self {
        self.memory = Some(Arc::new(MemoryTier::new(
            config.memory_capacity,
            config.memory_shards,
        )));
        self
    }

    /// Plug in a shared remote store; any `CacheTier` implementation.
    pub fn remote(mut self, tier: Arc<dyn CacheTier>) -> Self {
        self.remote = Some(tier);
        self
    }

    pub fn disk(mut self, dir: impl AsRef<std::path::Path>) -> Result<Self> {
        self.disk = Some(Arc::new(DiskTier::new(dir)?));
        Ok(self)
    }

    pub fn build(self) -> TieredCache {
        let tiers: Vec<Arc<dyn CacheTier>> = [self.memory, self.remote, self.disk]
            .into_iter()
            .flatten()
            .collect();
        let counters = tiers.iter().map(|_| TierCounters::default()).collect();
        TieredCache {
            tiers,
            counters,
            misses: AtomicU64::new(0),
        }
    }
}
