//! Observability: metric records emitted by the scheduler
//!
//! What this module provides
//! - A collector seam the scheduler pushes job outcome counters and
//!   latency histograms through; tracing spans live at the call sites
//!
//! Exports
//! - Models
//!   - `MetricRecord::{Counter{name, value}, Histogram{name, value}}`
//! - Services
//!   - `MetricsCollector: Service<MetricRecord, Response=()>`
//!   - `CollectorSvc` boxed form, `collector_fn`, `null_collector`
//!
//! Implementation strategy
//! - Emission is best-effort; a failing collector never affects a job
//! - Keep overhead minimal; avoid heavy allocations in hot paths
//!
//! Testing strategy
//! - A fake collector capturing records asserts counts and histograms

use tower::util::BoxCloneSyncService;
use tower::Service;

use crate::error::UpstreamError;

/// One metric update pushed by the scheduler.
#[derive(Debug, Clone)]
pub enum MetricRecord {
    Counter { name: &'static str, value: u64 },
    Histogram { name: &'static str, value: u64 },
}

pub trait MetricsCollector:
    Service<MetricRecord, Response = (), Error = UpstreamError>
{
}
impl<T> MetricsCollector for T where
    T: Service<MetricRecord, Response = (), Error = UpstreamError>
{
}

/// Boxed, cloneable collector the scheduler holds.
pub type CollectorSvc = BoxCloneSyncService<MetricRecord, (), UpstreamError>;

/// Lift an async closure into a boxed collector.
pub fn collector_fn<F, Fut>(f: F) -> CollectorSvc
where
    F: FnMut(MetricRecord) -> Fut + Clone + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<(), UpstreamError>> + Send + 'static,
{
    BoxCloneSyncService::new(tower::service_fn(f))
}

/// Collector that drops every record.
pub fn null_collector() -> CollectorSvc {
    collector_fn(|_record: MetricRecord| async { Ok(()) })
}
