//! Batch scheduler: bounded workers, priority dispatch, cache short-circuiting
//!
//! What this module provides
//! - `submit_batch`: execute independent query jobs across a fixed
//!   worker pool with per-source ceilings and cache admission
//!
//! Exports
//! - Models
//!   - `QueryJob`, `JobOutcome`, `JobStatus`, `BatchResult`, `BatchOptions`
//!   - `SchedulerStats` snapshot
//! - Services
//!   - `Scheduler` (owns the pool) and `SchedulerBuilder`
//!
//! Implementation strategy
//! - A fixed set of worker tasks pulls from one shared priority queue;
//!   no per-job spawning
//! - Admission consults the cache by fingerprint first; hits resolve
//!   without touching a worker slot
//! - Per-source semaphores cap in-flight calls per upstream; a source
//!   at its ceiling parks jobs rather than blocking a worker, so one
//!   saturated source never starves the others
//! - Outcomes land in submission-order slots; completion order is free
//! - Deadlines cancel cooperatively through each job's token; an
//!   elapsed batch deadline fills remaining slots with `TimedOut`
//! - A configurable outstanding-job ceiling rejects submissions whole
//!   with a capacity error before any job runs
//!
//! Composition
//! - `SchedulerBuilder::new(config).connector("docs", svc).build()?`
//!
//! Testing strategy
//! - Scripted connectors with latency injection assert order
//!   preservation, priority under saturation, source isolation, and
//!   capacity rejection

mod queue;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{CacheStats, CacheTier, TieredCache};
use crate::config::{CoreConfig, TtlClasses};
use crate::connector::{CallRequest, ConnectorSvc, SourceId};
use crate::error::{Result, UpstreamError};
use crate::observability::{null_collector, CollectorSvc, MetricRecord};
use crate::resilience::{wrap_connector, BreakerRegistry, BreakerSnapshot, CircuitState, Health};

use queue::{JobQueue, Popped, QueuedJob, SourceLimits};

/// One independent query to run against an upstream source.
#[derive(Debug, Clone)]
pub struct QueryJob {
    pub id: String,
    pub source: SourceId,
    /// Scheduling order only; never affects correctness of results.
    pub priority: i32,
    /// Cache key derived from the query's semantic content and target.
    pub fingerprint: String,
    pub payload: Value,
    pub deadline: Option<Instant>,
}

impl QueryJob {
    pub fn new(
        id: impl Into<String>,
        source: impl Into<SourceId>,
        fingerprint: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            priority: 0,
            fingerprint: fingerprint.into(),
            payload,
            deadline: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_deadline_in(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }
}

/// Terminal state of one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    CacheHit,
    Success,
    Failure,
    CircuitOpen,
    TimedOut,
}

/// Produced exactly once per submitted job.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub job_id: String,
    pub status: JobStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub latency: Duration,
}

/// Aggregate counts over a batch's outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchCounts {
    pub total: usize,
    pub cache_hits: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub circuit_open: usize,
    pub timed_out: usize,
}

/// Outcomes positionally aligned with the submitted job list.
#[derive(Debug)]
pub struct BatchResult {
    pub batch_id: Uuid,
    pub outcomes: Vec<JobOutcome>,
    pub counts: BatchCounts,
    pub elapsed: Duration,
}

impl BatchResult {
    pub fn success_rate(&self) -> f64 {
        let productive = self.counts.cache_hits + self.counts.succeeded;
        productive as f64 / self.counts.total.max(1) as f64
    }
}

/// Per-submission knobs.
#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    /// Bound on the whole batch; unresolved jobs become `TimedOut`.
    pub deadline: Option<Duration>,
    /// External cancellation; behaves like an elapsed deadline.
    pub cancel: Option<CancellationToken>,
    /// Write-back TTL overrides for this batch, by source.
    pub ttl_overrides: HashMap<SourceId, Duration>,
}

/// Point-in-time view of scheduler load.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerStats {
    pub workers: usize,
    pub queue_depth: usize,
    pub in_flight: usize,
    pub outstanding: usize,
    pub max_outstanding: usize,
}

struct BatchState {
    slots: Vec<Option<JobOutcome>>,
    filled: usize,
}

/// Shared between the submitting caller and the workers running its jobs.
pub(crate) struct BatchShared {
    ids: Vec<String>,
    state: Mutex<BatchState>,
    done: Notify,
    pub(crate) cancel: CancellationToken,
}

impl BatchShared {
    fn new(ids: Vec<String>, cancel: CancellationToken) -> Self {
        let slots = ids.iter().map(|_| None).collect();
        Self {
            ids,
            state: Mutex::new(BatchState { slots, filled: 0 }),
            done: Notify::new(),
            cancel,
        }
    }

    /// Record a terminal outcome for one slot. The first writer wins;
    /// later attempts (a worker draining a cancelled entry) are no-ops.
    fn resolve(&self, index: usize, outcome: JobOutcome, outstanding: &AtomicUsize) -> bool {
        let complete = {
            let mut state = self.state.lock().unwrap();
            if state.slots[index].is_some() {
                return false;
            }
            state.slots[index] = Some(outcome);
            state.filled += 1;
            state.filled == state.slots.len()
        };
        outstanding.fetch_sub(1, Ordering::SeqCst);
        if complete {
            // notify_one stores a permit, so the submitter cannot miss
            // completion even if it has not started waiting yet.
            self.done.notify_one();
        }
        true
    }

    fn is_complete(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.filled == state.slots.len()
    }

    /// Resolve every still-empty slot as `TimedOut`.
    fn fill_timed_out(&self, reason: &str, outstanding: &AtomicUsize) {
        let empty: Vec<usize> = {
            let state = self.state.lock().unwrap();
            state
                .slots
                .iter()
                .enumerate()
                .filter(|(_, s)| s.is_none())
                .map(|(i, _)| i)
                .collect()
        };
        for index in empty {
            self.resolve(
                index,
                JobOutcome {
                    job_id: self.ids[index].clone(),
                    status: JobStatus::TimedOut,
                    result: None,
                    error: Some(reason.to_string()),
                    latency: Duration::ZERO,
                },
                outstanding,
            );
        }
    }

    fn take_outcomes(&self) -> Vec<JobOutcome> {
        let mut state = self.state.lock().unwrap();
        state
            .slots
            .iter_mut()
            .map(|slot| slot.take().expect("batch complete"))
            .collect()
    }
}

struct Inner {
    connectors: HashMap<SourceId, ConnectorSvc>,
    cache: TieredCache,
    breakers: Arc<BreakerRegistry>,
    limits: SourceLimits,
    queue: JobQueue,
    ttl: TtlClasses,
    collector: CollectorSvc,
    shutdown: CancellationToken,
    outstanding: AtomicUsize,
    in_flight: AtomicUsize,
    max_outstanding: usize,
    worker_count: usize,
    seq: AtomicU64,
}

impl Inner {
    async fn emit(&self, record: MetricRecord) {
        let collector = self.collector.clone();
        if let Err(e) = collector.oneshot(record).await {
            debug!(error = %e, "metrics collector rejected record");
        }
    }
}

/// Assembles connectors, cache tiers, and configuration into a running
/// scheduler.
pub struct SchedulerBuilder {
    config: CoreConfig,
    connectors: HashMap<SourceId, ConnectorSvc>,
    remote_tier: Option<Arc<dyn CacheTier>>,
    collector: CollectorSvc,
}

impl SchedulerBuilder {
    pub fn new(config: CoreConfig) -> Self {
        Self {
            config,
            connectors: HashMap::new(),
            remote_tier: None,
            collector: null_collector(),
        }
    }

    /// Register the connector for a source. It is wrapped in the
    /// resilience stack at build time.
    pub fn connector(mut self, source: impl Into<SourceId>, svc: ConnectorSvc) -> Self {
        self.connectors.insert(source.into(), svc);
        self
    }

    /// Plug a shared remote tier between memory and disk.
    pub fn remote_cache(mut self, tier: Arc<dyn CacheTier>) -> Self {
        self.remote_tier = Some(tier);
        self
    }

    pub fn collector(mut self, collector: CollectorSvc) -> Self {
        self.collector = collector;
        self
    }

    pub fn build(self) -> Result<Scheduler> {
        let mut cache_builder = TieredCache::builder().memory(&self.config.cache);
        if let Some(tier) = self.remote_tier {
            cache_builder = cache_builder.remote(tier);
        }
        if let Some(dir) = &self.config.cache.disk_dir {
            cache_builder = cache_builder.disk(dir)?;
        }

        let breakers = Arc::new(BreakerRegistry::new(self.config.breaker.clone()));
        let connectors = self
            .connectors
            .into_iter()
            .map(|(source, svc)| {
                let wrapped = wrap_connector(svc, breakers.clone(), &self.config.retry);
                (source, wrapped)
            })
            .collect();

        let scheduler_cfg = &self.config.scheduler;
        let inner = Arc::new(Inner {
            connectors,
            cache: cache_builder.build(),
            breakers,
            limits: SourceLimits::new(
                scheduler_cfg.default_source_ceiling,
                scheduler_cfg.source_ceilings.clone(),
            ),
            queue: JobQueue::new(),
            ttl: self.config.ttl.clone(),
            collector: self.collector,
            shutdown: CancellationToken::new(),
            outstanding: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_outstanding: scheduler_cfg.max_outstanding,
            worker_count: scheduler_cfg.workers.max(1),
            seq: AtomicU64::new(0),
        });

        let workers = (0..inner.worker_count)
            .map(|id| tokio::spawn(worker_loop(inner.clone(), id)))
            .collect();
        info!(workers = inner.worker_count, "scheduler started");

        Ok(Scheduler {
            inner,
            workers: Mutex::new(workers),
        })
    }
}

/// Executes batches of query jobs; owns the worker pool for its lifetime.
pub struct Scheduler {
    inner: Arc<Inner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn builder(config: CoreConfig) -> SchedulerBuilder {
        SchedulerBuilder::new(config)
    }

    /// Run every job to a terminal outcome and return them in
    /// submission order.
    ///
    /// Only batch-level construction problems (malformed job list,
    /// capacity) return `Err`; per-job failures are folded into the
    /// result and never abort the batch.
    pub async fn submit_batch(
        &self,
        jobs: Vec<QueryJob>,
        options: BatchOptions,
    ) -> Result<BatchResult> {
        let started = Instant::now();
        let batch_id = Uuid::new_v4();
        self.validate(&jobs)?;
        self.reserve(jobs.len())?;

        let inner = &self.inner;
        let cancel = inner.shutdown.child_token();
        let batch = Arc::new(BatchShared::new(
            jobs.iter().map(|j| j.id.clone()).collect(),
            cancel.clone(),
        ));

        // Propagate an external cancellation into this batch.
        let link = options.cancel.map(|user| {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                user.cancelled().await;
                cancel.cancel();
            })
        });

        debug!(%batch_id, jobs = batch.ids.len(), "batch submitted");

        for (index, job) in jobs.into_iter().enumerate() {
            if job.deadline.is_some_and(|d| Instant::now() >= d) {
                batch.resolve(
                    index,
                    JobOutcome {
                        job_id: job.id,
                        status: JobStatus::TimedOut,
                        result: None,
                        error: Some("deadline elapsed before dispatch".to_string()),
                        latency: Duration::ZERO,
                    },
                    &inner.outstanding,
                );
                continue;
            }

            if let Some(outcome) = self.probe_cache(&job).await {
                inner.emit(MetricRecord::Counter { name: "jobs_cache_hit", value: 1 }).await;
                batch.resolve(index, outcome, &inner.outstanding);
                continue;
            }

            let ttl = options
                .ttl_overrides
                .get(&job.source)
                .copied()
                .unwrap_or_else(|| inner.ttl.for_source(&job.source));
            inner.queue.push(QueuedJob {
                seq: inner.seq.fetch_add(1, Ordering::SeqCst),
                job,
                index,
                batch: batch.clone(),
                ttl,
            });
        }

        let deadline = options.deadline.map(|d| started + d);
        loop {
            let notified = batch.done.notified();
            if batch.is_complete() {
                break;
            }
            tokio::select! {
                _ = notified => {}
                _ = cancel.cancelled() => {
                    batch.fill_timed_out("batch cancelled", &inner.outstanding);
                    break;
                }
                _ = sleep_until_opt(deadline) => {
                    cancel.cancel();
                    batch.fill_timed_out("batch deadline elapsed", &inner.outstanding);
                    break;
                }
            }
        }

        if let Some(link) = link {
            link.abort();
        }

        let outcomes = batch.take_outcomes();
        let counts = count(&outcomes);
        info!(
            %batch_id,
            total = counts.total,
            cache_hits = counts.cache_hits,
            succeeded = counts.succeeded,
            failed = counts.failed,
            "batch completed"
        );
        Ok(BatchResult {
            batch_id,
            outcomes,
            counts,
            elapsed: started.elapsed(),
        })
    }

    /// Cache effectiveness counters.
    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    pub async fn invalidate(&self, key: &str) {
        self.inner.cache.invalidate(key).await;
    }

    /// Drop cached results whose fingerprint starts with `prefix`.
    pub async fn invalidate_prefix(&self, prefix: &str) -> usize {
        self.inner.cache.invalidate_prefix(prefix).await
    }

    pub async fn invalidate_all(&self) {
        self.inner.cache.invalidate_all().await;
    }

    /// Circuit state for a source; `Closed` if it never made a call.
    pub fn circuit_status(&self, source: &SourceId) -> CircuitState {
        self.inner.breakers.status(source)
    }

    pub fn breaker_snapshots(&self) -> Vec<BreakerSnapshot> {
        self.inner.breakers.snapshots()
    }

    pub fn health(&self) -> Health {
        self.inner.breakers.health()
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            workers: self.inner.worker_count,
            queue_depth: self.inner.queue.depth(),
            in_flight: self.inner.in_flight.load(Ordering::SeqCst),
            outstanding: self.inner.outstanding.load(Ordering::SeqCst),
            max_outstanding: self.inner.max_outstanding,
        }
    }

    /// Stop the worker pool. In-flight batches resolve their remaining
    /// jobs as `TimedOut`.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for worker in workers {
            let _ = worker.await;
        }
        info!("scheduler stopped");
    }

    fn validate(&self, jobs: &[QueryJob]) -> Result<()> {
        let mut seen = HashSet::new();
        for job in jobs {
            if job.id.is_empty() {
                return Err(UpstreamError::MalformedBatch("empty job id".to_string()));
            }
            if !seen.insert(job.id.as_str()) {
                return Err(UpstreamError::MalformedBatch(format!(
                    "duplicate job id '{}'",
                    job.id
                )));
            }
            if !self.inner.connectors.contains_key(&job.source) {
                return Err(UpstreamError::MalformedBatch(format!(
                    "no connector registered for source '{}'",
                    job.source
                )));
            }
        }
        Ok(())
    }

    /// Reserve outstanding-job capacity for a whole batch, or reject it
    /// before any job runs.
    fn reserve(&self, n: usize) -> Result<()> {
        let inner = &self.inner;
        let mut current = inner.outstanding.load(Ordering::SeqCst);
        loop {
            if current + n > inner.max_outstanding {
                return Err(UpstreamError::CapacityExceeded {
                    outstanding: current,
                    limit: inner.max_outstanding,
                });
            }
            match inner.outstanding.compare_exchange(
                current,
                current + n,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    async fn probe_cache(&self, job: &QueryJob) -> Option<JobOutcome> {
        let started = Instant::now();
        let entry = self.inner.cache.get(&job.fingerprint).await?;
        match serde_json::from_slice(&entry.value) {
            Ok(value) => Some(JobOutcome {
                job_id: job.id.clone(),
                status: JobStatus::CacheHit,
                result: Some(value),
                error: None,
                latency: started.elapsed(),
            }),
            Err(e) => {
                warn!(fingerprint = %job.fingerprint, error = %e, "corrupt cache entry, invalidating");
                self.inner.cache.invalidate(&job.fingerprint).await;
                None
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}

async fn worker_loop(inner: Arc<Inner>, id: usize) {
    debug!(worker = id, "worker started");
    loop {
        let popped = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            popped = inner.queue.pop(&inner.limits) => popped,
        };
        match popped {
            Popped::Expired(entry) => {
                let reason = if entry.batch.cancel.is_cancelled() {
                    "batch cancelled"
                } else {
                    "deadline elapsed before dispatch"
                };
                entry.batch.resolve(
                    entry.index,
                    JobOutcome {
                        job_id: entry.job.id.clone(),
                        status: JobStatus::TimedOut,
                        result: None,
                        error: Some(reason.to_string()),
                        latency: Duration::ZERO,
                    },
                    &inner.outstanding,
                );
            }
            Popped::Ready(entry, permit) => {
                inner.in_flight.fetch_add(1, Ordering::SeqCst);
                let source = entry.job.source.clone();
                run_job(&inner, entry).await;
                inner.in_flight.fetch_sub(1, Ordering::SeqCst);
                drop(permit);
                inner.queue.unpark(&source);
            }
        }
    }
    debug!(worker = id, "worker stopped");
}

async fn run_job(inner: &Arc<Inner>, entry: QueuedJob) {
    let QueuedJob {
        job,
        index,
        batch,
        ttl,
        ..
    } = entry;
    let started = Instant::now();
    let svc = inner
        .connectors
        .get(&job.source)
        .expect("validated at submission")
        .clone();

    let cancel = batch.cancel.child_token();
    let request = CallRequest {
        source: job.source.clone(),
        payload: job.payload.clone(),
        cancel: cancel.clone(),
        deadline: job.deadline,
        attempt: 0,
    };

    let call = svc.oneshot(request);
    tokio::pin!(call);
    let result = tokio::select! {
        result = &mut call => result,
        _ = batch.cancel.cancelled() => {
            cancel.cancel();
            Err(UpstreamError::DeadlineExceeded)
        }
        _ = sleep_until_opt(job.deadline) => {
            cancel.cancel();
            Err(UpstreamError::DeadlineExceeded)
        }
    };
    let latency = started.elapsed();

    let outcome = match result {
        Ok(value) => {
            match serde_json::to_vec(&value) {
                Ok(bytes) => inner.cache.put(&job.fingerprint, bytes, ttl).await,
                Err(e) => warn!(job_id = %job.id, error = %e, "result not cacheable"),
            }
            JobOutcome {
                job_id: job.id,
                status: JobStatus::Success,
                result: Some(value),
                error: None,
                latency,
            }
        }
        Err(e @ UpstreamError::CircuitOpen { .. }) => JobOutcome {
            job_id: job.id,
            status: JobStatus::CircuitOpen,
            result: None,
            error: Some(e.to_string()),
            latency,
        },
        Err(UpstreamError::DeadlineExceeded) => JobOutcome {
            job_id: job.id,
            status: JobStatus::TimedOut,
            result: None,
            error: Some(UpstreamError::DeadlineExceeded.to_string()),
            latency,
        },
        Err(e) => JobOutcome {
            job_id: job.id,
            status: JobStatus::Failure,
            result: None,
            error: Some(e.to_string()),
            latency,
        },
    };

    inner
        .emit(MetricRecord::Counter {
            name: status_counter(outcome.status),
            value: 1,
        })
        .await;
    inner
        .emit(MetricRecord::Histogram {
            name: "job_latency_ms",
            value: latency.as_millis() as u64,
        })
        .await;
    batch.resolve(index, outcome, &inner.outstanding);
}

fn status_counter(status: JobStatus) -> &'static str {
    match status {
        JobStatus::CacheHit => "jobs_cache_hit",
        JobStatus::Success => "jobs_succeeded",
        JobStatus::Failure => "jobs_failed",
        JobStatus::CircuitOpen => "jobs_circuit_open",
        JobStatus::TimedOut => "jobs_timed_out",
    }
}

fn count(outcomes: &[JobOutcome]) -> BatchCounts {
    let mut counts = BatchCounts {
        total: outcomes.len(),
        ..Default::default()
    };
    for outcome in outcomes {
        match outcome.status {
            JobStatus::CacheHit => counts.cache_hits += 1,
            JobStatus::Success => counts.succeeded += 1,
            JobStatus::Failure => counts.failed += 1,
            JobStatus::CircuitOpen => counts.circuit_open += 1,
            JobStatus::TimedOut => counts.timed_out += 1,
        }
    }
    counts
}
