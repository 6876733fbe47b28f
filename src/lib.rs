//! # tower-upstream
//!
//! A Tower-based resilience and throughput core for slow, unreliable
//! upstream data sources. It sits between a query-dispatching agent
//! and a set of upstream integrations (a document store, an issue
//! tracker, a local file index, a text-generation service) and takes
//! care of the three things that are easy to get wrong:
//!
//! - **Tiered caching**: memory → remote → disk reads with backfill,
//!   best-effort writes, and caller-supplied TTLs, so expensive calls
//!   are never repeated.
//! - **Circuit breaking + bounded retry**: per-source breaker state
//!   over a rolling outcome window, composed with exponential-backoff
//!   retries that stop the moment a circuit opens.
//! - **Batch scheduling**: a fixed worker pool pulling from a shared
//!   priority queue, per-source concurrency ceilings, cooperative
//!   deadline cancellation, and backpressure on outstanding jobs.
//!
//! The core consumes upstreams through a single [`connector`] seam and
//! knows nothing about wire protocols; plug in anything that can
//! answer a `CallRequest`.
//!
//! ## Getting Started
//!
//! ```rust,no_run
//! use serde_json::json;
//! use tower_upstream::{
//!     connector_fn, BatchOptions, CoreConfig, QueryJob, Scheduler,
//! };
//!
//! # async fn example() -> tower_upstream::Result<()> {
//! let docs = connector_fn(|req| async move {
//!     // Talk to the real document store here.
//!     Ok(json!({ "answer_for": req.payload }))
//! });
//!
//! let scheduler = Scheduler::builder(CoreConfig::default())
//!     .connector("docs", docs)
//!     .build()?;
//!
//! let batch = scheduler
//!     .submit_batch(
//!         vec![QueryJob::new("q1", "docs", "fingerprint:q1", json!("how do retries work?"))],
//!         BatchOptions::default(),
//!     )
//!     .await?;
//!
//! for outcome in &batch.outcomes {
//!     println!("{}: {:?}", outcome.job_id, outcome.status);
//! }
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod connector;
pub mod error;
pub mod observability;
pub mod resilience;
pub mod scheduler;

// Public re-exports for convenience
pub use cache::{CacheEntry, CacheStats, CacheTier, Tier, TieredCache};
pub use config::{BreakerConfig, CacheConfig, ConfigBuilder, CoreConfig, RetryConfig, SchedulerConfig, TtlClasses};
pub use connector::{connector_fn, CallRequest, Connector, ConnectorSvc, SourceId};
pub use error::{ErrorClass, Result, UpstreamError};
pub use observability::{collector_fn, null_collector, CollectorSvc, MetricRecord};
pub use resilience::{BreakerRegistry, BreakerSnapshot, CircuitState, Health};
pub use scheduler::{
    BatchCounts, BatchOptions, BatchResult, JobOutcome, JobStatus, QueryJob, Scheduler,
    SchedulerBuilder, SchedulerStats,
};

// Re-export the cancellation token connectors are handed
pub use tokio_util::sync::CancellationToken;
