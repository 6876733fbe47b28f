//! Configuration for the upstream core
//!
//! Every tunable lives here: breaker thresholds,
//! rolling-window bounds, retry budgets, worker-pool size, per-source
//! ceilings, and cache TTL classes. Nothing is hard-coded.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::connector::SourceId;

/// Top-level configuration for the core
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Cache store configuration
    pub cache: CacheConfig,

    /// Circuit breaker configuration
    pub breaker: BreakerConfig,

    /// Retry configuration
    pub retry: RetryConfig,

    /// Batch scheduler configuration
    pub scheduler: SchedulerConfig,

    /// Cache TTL classes per source
    pub ttl: TtlClasses,
}

/// Cache store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum entries held by the in-process memory tier
    pub memory_capacity: usize,

    /// Number of independent shards in the memory tier
    pub memory_shards: usize,

    /// Directory for the durable on-disk tier; disabled when unset
    pub disk_dir: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_capacity: 1000,
            memory_shards: 16,
            disk_dir: None,
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Failure ratio within the rolling window that opens the circuit
    pub failure_ratio: f32,

    /// Minimum samples in the window before the ratio is evaluated
    pub min_samples: usize,

    /// Maximum samples kept in the rolling window
    pub window_size: usize,

    /// Maximum age of a sample before it drops out of the window
    pub window_age: Duration,

    /// How long an open circuit waits before allowing trial calls
    pub cooldown: Duration,

    /// Consecutive trial successes required to close a half-open circuit
    pub trial_successes: u32,

    /// Trial calls allowed in flight at once while half-open
    pub half_open_max_trials: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_ratio: 0.5,
            min_samples: 5,
            window_size: 32,
            window_age: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
            trial_successes: 3,
            half_open_max_trials: 1,
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt
    pub max_retries: usize,

    /// Initial retry delay
    pub initial_delay: Duration,

    /// Maximum retry delay
    pub max_delay: Duration,

    /// Exponential backoff multiplier
    pub backoff_multiplier: f32,

    /// Jitter to add randomness to retries
    pub jitter: bool,

    /// Per-attempt timeout applied to each connector call
    pub call_timeout: Duration,

    /// Wall-clock bound on an attempt sequence regardless of retries
    /// remaining; unset means only job deadlines bound it
    pub max_elapsed: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
            call_timeout: Duration::from_secs(30),
            max_elapsed: None,
        }
    }
}

/// Batch scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Size of the worker pool
    pub workers: usize,

    /// In-flight ceiling for sources without an explicit override
    pub default_source_ceiling: usize,

    /// Per-source in-flight ceilings
    pub source_ceilings: HashMap<SourceId, usize>,

    /// Maximum jobs admitted but not yet resolved; submissions beyond
    /// this are rejected with a capacity error
    pub max_outstanding: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            default_source_ceiling: 4,
            source_ceilings: HashMap::new(),
            max_outstanding: 1000,
        }
    }
}

/// Cache TTL classes, resolved per source when results are written back.
///
/// Volatile sources get short TTLs, stable ones long; the defaults
/// mirror typical volatility of the four stock sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtlClasses {
    pub classes: HashMap<SourceId, Duration>,
    pub default_ttl: Duration,
}

impl TtlClasses {
    pub fn for_source(&self, source: &SourceId) -> Duration {
        self.classes.get(source).copied().unwrap_or(self.default_ttl)
    }
}

impl Default for TtlClasses {
    fn default() -> Self {
        let mut classes = HashMap::new();
        classes.insert(SourceId::from("docs"), Duration::from_secs(1800));
        classes.insert(SourceId::from("issues"), Duration::from_secs(600));
        classes.insert(SourceId::from("codeindex"), Duration::from_secs(3600));
        classes.insert(SourceId::from("generator"), Duration::from_secs(7200));
        Self {
            classes,
            default_ttl: Duration::from_secs(300),
        }
    }
}

/// Configuration builder
pub struct ConfigBuilder {
    config: CoreConfig,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: CoreConfig::default(),
        }
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.config.scheduler.workers = workers;
        self
    }

    pub fn max_outstanding(mut self, max: usize) -> Self {
        self.config.scheduler.max_outstanding = max;
        self
    }

    pub fn source_ceiling(mut self, source: impl Into<SourceId>, ceiling: usize) -> Self {
        self.config
            .scheduler
            .source_ceilings
            .insert(source.into(), ceiling);
        self
    }

    pub fn default_source_ceiling(mut self, ceiling: usize) -> Self {
        self.config.scheduler.default_source_ceiling = ceiling;
        self
    }

    pub fn memory_capacity(mut self, capacity: usize) -> Self {
        self.config.cache.memory_capacity = capacity;
        self
    }

    pub fn disk_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.cache.disk_dir = Some(dir.into());
        self
    }

    pub fn max_retries(mut self, retries: usize) -> Self {
        self.config.retry.max_retries = retries;
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.config.retry.call_timeout = timeout;
        self
    }

    pub fn breaker_cooldown(mut self, cooldown: Duration) -> Self {
        self.config.breaker.cooldown = cooldown;
        self
    }

    pub fn ttl_class(mut self, source: impl Into<SourceId>, ttl: Duration) -> Self {
        self.config.ttl.classes.insert(source.into(), ttl);
        self
    }

    pub fn build(self) -> CoreConfig {
        self.config
    }
}

/// Load configuration from environment variables
pub fn from_env() -> CoreConfig {
    let mut config = CoreConfig::default();

    if let Ok(workers) = std::env::var("UPSTREAM_WORKERS") {
        if let Ok(n) = workers.parse::<usize>() {
            config.scheduler.workers = n;
        }
    }

    if let Ok(max) = std::env::var("UPSTREAM_MAX_OUTSTANDING") {
        if let Ok(n) = max.parse::<usize>() {
            config.scheduler.max_outstanding = n;
        }
    }

    if let Ok(capacity) = std::env::var("UPSTREAM_MEMORY_CAPACITY") {
        if let Ok(n) = capacity.parse::<usize>() {
            config.cache.memory_capacity = n;
        }
    }

    if let Ok(dir) = std::env::var("UPSTREAM_DISK_CACHE_DIR") {
        if !dir.is_empty() {
            config.cache.disk_dir = Some(PathBuf::from(dir));
        }
    }

    if let Ok(retries) = std::env::var("UPSTREAM_MAX_RETRIES") {
        if let Ok(n) = retries.parse::<usize>() {
            config.retry.max_retries = n;
        }
    }

    if let Ok(cooldown) = std::env::var("UPSTREAM_BREAKER_COOLDOWN_SECS") {
        if let Ok(secs) = cooldown.parse::<u64>() {
            config.breaker.cooldown = Duration::from_secs(secs);
        }
    }

    config
}

/// Load configuration from a TOML file
pub fn from_file(
    path: impl AsRef<std::path::Path>,
) -> std::result::Result<CoreConfig, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let config: CoreConfig = toml::from_str(&contents)?;
    Ok(config)
}
