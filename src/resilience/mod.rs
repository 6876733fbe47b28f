//! Resilience layers: per-attempt timeout, circuit breaking, bounded retry
//!
//! What this module provides
//! - The wrapper stack between the scheduler and a raw connector:
//!   `Retry → CircuitBreaker → AttemptTimeout → Connector`
//!
//! Exports
//! - Models
//!   - `RetrySchedule` (exponential backoff with jitter and a cap)
//!   - `CircuitState`, `Admission`, `BreakerSnapshot`, `Health`
//! - Layers
//!   - `AttemptTimeoutLayer` (per-attempt bound, surfaces a retryable error)
//!   - `CircuitBreakerLayer` (stateful gate keyed by the request's source)
//!   - `RetryLayer` (bounded re-attempts, deadline- and cancel-aware)
//! - Utils
//!   - `wrap_connector` assembling the full stack around a boxed connector
//!
//! Implementation strategy
//! - The breaker sits inside the retry loop, so every attempt passes
//!   through it and lands in the rolling window as one outcome sample
//! - A `CircuitOpen` error is never retried; retries stop the moment
//!   the circuit opens
//! - Backoff sleeps race the request's cancellation token and stop
//!   early rather than sleeping past the deadline
//!
//! Composition
//! - `wrap_connector(svc, registry.clone(), &config.retry)` per source
//!
//! Testing strategy
//! - Scripted `connector_fn` fakes (fail-fail-succeed patterns) with
//!   atomic invocation counters assert attempt counts and short-circuits

pub mod breaker;

pub use breaker::{Admission, Breaker, BreakerRegistry, BreakerSnapshot, CircuitState, Health};

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::time::{sleep, timeout};
use tower::util::BoxCloneSyncService;
use tower::{Layer, Service, ServiceExt};
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::connector::{CallRequest, ConnectorSvc};
use crate::error::{is_retryable, Result, UpstreamError};

type CallFuture = Pin<Box<dyn Future<Output = Result<Value>> + Send>>;

/// Exponential backoff schedule for one attempt sequence
#[derive(Debug, Clone)]
pub struct RetrySchedule {
    config: RetryConfig,
    attempt: usize,
    next_delay: Duration,
}

impl RetrySchedule {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            next_delay: config.initial_delay,
            config: config.clone(),
            attempt: 0,
        }
    }

    /// Check if we should retry
    pub fn should_retry(&self) -> bool {
        self.attempt < self.config.max_retries
    }

    /// Get the current attempt number
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// Calculate next delay with exponential backoff
    pub fn next_delay(&mut self) -> Duration {
        let mut delay = self.next_delay;

        // Add jitter if enabled
        if self.config.jitter {
            use rand::Rng;
            let mut rng = rand::thread_rng();
            let jitter = rng.gen_range(0.0..0.3);
            let jitter_ms = (delay.as_millis() as f64 * jitter) as u64;
            delay += Duration::from_millis(jitter_ms);
        }

        // Update for next iteration
        self.attempt += 1;
        self.next_delay = Duration::from_secs_f32(
            (self.next_delay.as_secs_f32() * self.config.backoff_multiplier)
                .min(self.config.max_delay.as_secs_f32()),
        );

        delay
    }

    /// Reset the schedule
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.next_delay = self.config.initial_delay;
    }
}

// ===== Per-attempt timeout =====

/// Bounds each individual connector call; an elapsed attempt surfaces
/// as a retryable connector error, not a terminal deadline.
pub struct AttemptTimeoutLayer {
    timeout: Duration,
}

impl AttemptTimeoutLayer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[derive(Clone)]
pub struct AttemptTimeout<S> {
    inner: S,
    timeout: Duration,
}

impl<S> Layer<S> for AttemptTimeoutLayer {
    type Service = AttemptTimeout<S>;
    fn layer(&self, inner: S) -> Self::Service {
        AttemptTimeout {
            inner,
            timeout: self.timeout,
        }
    }
}

impl<S> Service<CallRequest> for AttemptTimeout<S>
where
    S: Service<CallRequest, Response = Value, Error = UpstreamError> + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Value;
    type Error = UpstreamError;
    type Future = CallFuture;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: CallRequest) -> Self::Future {
        let dur = self.timeout;
        let fut = self.inner.call(req);
        Box::pin(async move {
            match timeout(dur, fut).await {
                Ok(result) => result,
                Err(_) => Err(UpstreamError::retryable(format!(
                    "call timed out after {dur:?}"
                ))),
            }
        })
    }
}

// ===== Circuit breaker gate =====

/// Routes each request through the breaker owned by its source.
pub struct CircuitBreakerLayer {
    registry: Arc<BreakerRegistry>,
}

impl CircuitBreakerLayer {
    pub fn new(registry: Arc<BreakerRegistry>) -> Self {
        Self { registry }
    }
}

#[derive(Clone)]
pub struct CircuitGate<S> {
    inner: S,
    registry: Arc<BreakerRegistry>,
}

impl<S> Layer<S> for CircuitBreakerLayer {
    type Service = CircuitGate<S>;
    fn layer(&self, inner: S) -> Self::Service {
        CircuitGate {
            inner,
            registry: self.registry.clone(),
        }
    }
}

impl<S> Service<CallRequest> for CircuitGate<S>
where
    S: Service<CallRequest, Response = Value, Error = UpstreamError> + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Value;
    type Error = UpstreamError;
    type Future = CallFuture;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: CallRequest) -> Self::Future {
        let breaker = self.registry.breaker(&req.source);
        let admission = match breaker.admit() {
            Ok(admission) => admission,
            Err(e) => return Box::pin(std::future::ready(Err(e))),
        };
        let fut = self.inner.call(req);
        Box::pin(async move {
            let out = fut.await;
            breaker.record(admission, out.is_ok());
            out
        })
    }
}

// ===== Retry =====

/// Bounded re-attempts with exponential backoff.
pub struct RetryLayer {
    config: RetryConfig,
}

impl RetryLayer {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }
}

#[derive(Clone)]
pub struct Retry<S> {
    inner: S,
    config: RetryConfig,
}

impl<S> Layer<S> for RetryLayer
where
    S: Clone,
{
    type Service = Retry<S>;
    fn layer(&self, inner: S) -> Self::Service {
        Retry {
            inner,
            config: self.config.clone(),
        }
    }
}

impl<S> Service<CallRequest> for Retry<S>
where
    S: Service<CallRequest, Response = Value, Error = UpstreamError>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
{
    type Response = Value;
    type Error = UpstreamError;
    type Future = CallFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: CallRequest) -> Self::Future {
        let mut inner = self.inner.clone();
        let config = self.config.clone();
        Box::pin(async move {
            let mut schedule = RetrySchedule::new(&config);
            let deadline = effective_deadline(&req, &config);
            loop {
                let mut attempt_req = req.clone();
                attempt_req.attempt = schedule.attempt();
                let result = inner.ready().await?.call(attempt_req).await;
                let error = match result {
                    Ok(value) => {
                        if schedule.attempt() > 0 {
                            debug!(
                                attempts = schedule.attempt() + 1,
                                source = %req.source,
                                "call succeeded after retries"
                            );
                        }
                        return Ok(value);
                    }
                    Err(e) => e,
                };

                // Retries happen only while the circuit is not open.
                if matches!(error, UpstreamError::CircuitOpen { .. }) {
                    return Err(error);
                }
                if !is_retryable(&error) {
                    debug!(source = %req.source, error = %error, "non-retryable error");
                    return Err(error);
                }
                if !schedule.should_retry() {
                    let attempts = schedule.attempt() + 1;
                    warn!(
                        source = %req.source,
                        attempts,
                        error = %error,
                        "retries exhausted"
                    );
                    return Err(UpstreamError::RetryExhausted {
                        attempts,
                        last: Box::new(error),
                    });
                }

                let delay = schedule.next_delay();
                if let Some(deadline) = deadline {
                    if Instant::now() + delay >= deadline {
                        return Err(UpstreamError::DeadlineExceeded);
                    }
                }
                warn!(
                    source = %req.source,
                    attempt = schedule.attempt(),
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "attempt failed, retrying"
                );
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = req.cancel.cancelled() => return Err(UpstreamError::DeadlineExceeded),
                }
            }
        })
    }
}

fn effective_deadline(req: &CallRequest, config: &RetryConfig) -> Option<Instant> {
    let budget = config.max_elapsed.map(|d| Instant::now() + d);
    match (req.deadline, budget) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Wrap a raw connector in the full resilience stack.
pub fn wrap_connector(
    connector: ConnectorSvc,
    registry: Arc<BreakerRegistry>,
    config: &RetryConfig,
) -> ConnectorSvc {
    let attempt = AttemptTimeoutLayer::new(config.call_timeout).layer(connector);
    let gated = CircuitBreakerLayer::new(registry).layer(attempt);
    let retried = RetryLayer::new(config.clone()).layer(gated);
    BoxCloneSyncService::new(retried)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BreakerConfig;
    use crate::connector::{connector_fn, SourceId};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_retries: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
            jitter: false,
            call_timeout: Duration::from_secs(1),
            max_elapsed: None,
        }
    }

    fn fast_breaker() -> BreakerConfig {
        BreakerConfig {
            failure_ratio: 0.5,
            min_samples: 3,
            window_size: 8,
            window_age: Duration::from_secs(60),
            cooldown: Duration::from_millis(50),
            trial_successes: 1,
            half_open_max_trials: 1,
        }
    }

    fn req(source: &str) -> CallRequest {
        CallRequest::new(SourceId::from(source), serde_json::json!("q"))
    }

    #[tokio::test]
    async fn retry_eventually_succeeds() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_cl = count.clone();
        let flaky = connector_fn(move |_req: CallRequest| {
            let n = count_cl.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(UpstreamError::retryable("transient"))
                } else {
                    Ok(serde_json::json!("ok"))
                }
            }
        });
        let mut svc = RetryLayer::new(fast_retry()).layer(flaky);
        let out = svc.ready().await.unwrap().call(req("docs")).await.unwrap();
        assert_eq!(out, serde_json::json!("ok"));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn always_failing_connector_makes_exact_attempts() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_cl = count.clone();
        let broken = connector_fn(move |_req: CallRequest| {
            count_cl.fetch_add(1, Ordering::SeqCst);
            async move { Err::<Value, _>(UpstreamError::retryable("down")) }
        });
        let mut svc = RetryLayer::new(fast_retry()).layer(broken);
        let err = svc
            .ready()
            .await
            .unwrap()
            .call(req("docs"))
            .await
            .unwrap_err();
        // max_retries = 2 means 3 invocations total.
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(matches!(
            err,
            UpstreamError::RetryExhausted { attempts: 3, .. }
        ));
    }

    #[tokio::test]
    async fn non_retryable_error_propagates_immediately() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_cl = count.clone();
        let bad = connector_fn(move |_req: CallRequest| {
            count_cl.fetch_add(1, Ordering::SeqCst);
            async move { Err::<Value, _>(UpstreamError::non_retryable("bad request")) }
        });
        let mut svc = RetryLayer::new(fast_retry()).layer(bad);
        let err = svc
            .ready()
            .await
            .unwrap()
            .call(req("docs"))
            .await
            .unwrap_err();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(matches!(err, UpstreamError::Connector { .. }));
    }

    #[tokio::test]
    async fn open_circuit_short_circuits_without_invoking() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_cl = count.clone();
        let broken = connector_fn(move |_req: CallRequest| {
            count_cl.fetch_add(1, Ordering::SeqCst);
            async move { Err::<Value, _>(UpstreamError::retryable("down")) }
        });
        let registry = Arc::new(BreakerRegistry::new(fast_breaker()));
        let mut svc = wrap_connector(broken, registry.clone(), &fast_retry());

        let err = svc
            .ready()
            .await
            .unwrap()
            .call(req("docs"))
            .await
            .unwrap_err();
        // 3 attempts all failed; the last sample (min_samples 3, ratio 1.0)
        // opened the circuit as the retry budget ran out.
        assert!(matches!(err, UpstreamError::RetryExhausted { .. }));
        assert_eq!(registry.status(&SourceId::from("docs")), CircuitState::Open);

        let invoked_before = count.load(Ordering::SeqCst);
        let err = svc
            .ready()
            .await
            .unwrap()
            .call(req("docs"))
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::CircuitOpen { .. }));
        assert_eq!(count.load(Ordering::SeqCst), invoked_before);
    }

    #[tokio::test]
    async fn every_attempt_is_one_breaker_sample() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_cl = count.clone();
        let flaky = connector_fn(move |_req: CallRequest| {
            let n = count_cl.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(UpstreamError::retryable("hiccup"))
                } else {
                    Ok(serde_json::json!("ok"))
                }
            }
        });
        let registry = Arc::new(BreakerRegistry::new(fast_breaker()));
        let mut svc = wrap_connector(flaky, registry.clone(), &fast_retry());

        svc.ready().await.unwrap().call(req("docs")).await.unwrap();
        let snapshots = registry.snapshots();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].total_calls, 2);
        assert_eq!(snapshots[0].failed_calls, 1);
    }

    #[tokio::test]
    async fn half_open_recovery_closes_circuit() {
        let fail = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let fail_cl = fail.clone();
        let recovering = connector_fn(move |_req: CallRequest| {
            let failing = fail_cl.load(Ordering::SeqCst);
            async move {
                if failing {
                    Err(UpstreamError::retryable("down"))
                } else {
                    Ok(serde_json::json!("recovered"))
                }
            }
        });
        let registry = Arc::new(BreakerRegistry::new(fast_breaker()));
        let mut svc = wrap_connector(recovering, registry.clone(), &fast_retry());

        let _ = svc.ready().await.unwrap().call(req("docs")).await;
        assert_eq!(registry.status(&SourceId::from("docs")), CircuitState::Open);

        fail.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(60)).await;
        let out = svc.ready().await.unwrap().call(req("docs")).await.unwrap();
        assert_eq!(out, serde_json::json!("recovered"));
        assert_eq!(
            registry.status(&SourceId::from("docs")),
            CircuitState::Closed
        );
    }

    #[tokio::test]
    async fn attempt_timeout_surfaces_retryable_error() {
        let slow = connector_fn(|_req: CallRequest| async move {
            sleep(Duration::from_millis(50)).await;
            Ok(serde_json::json!("late"))
        });
        let mut svc = AttemptTimeoutLayer::new(Duration::from_millis(5)).layer(slow);
        let err = svc
            .ready()
            .await
            .unwrap()
            .call(req("docs"))
            .await
            .unwrap_err();
        assert!(is_retryable(&err));
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn deadline_stops_retry_loop() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_cl = count.clone();
        let broken = connector_fn(move |_req: CallRequest| {
            count_cl.fetch_add(1, Ordering::SeqCst);
            async move { Err::<Value, _>(UpstreamError::retryable("down")) }
        });
        let config = RetryConfig {
            max_retries: 100,
            initial_delay: Duration::from_millis(20),
            jitter: false,
            ..fast_retry()
        };
        let mut svc = RetryLayer::new(config).layer(broken);
        let mut request = req("docs");
        request.deadline = Some(Instant::now() + Duration::from_millis(30));

        let start = Instant::now();
        let err = svc.ready().await.unwrap().call(request).await.unwrap_err();
        assert!(matches!(err, UpstreamError::DeadlineExceeded));
        assert!(start.elapsed() < Duration::from_millis(200));
        assert!(count.load(Ordering::SeqCst) < 5);
    }

    #[tokio::test]
    async fn cancellation_unblocks_backoff_wait() {
        let broken = connector_fn(|_req: CallRequest| async move {
            Err::<Value, _>(UpstreamError::retryable("down"))
        });
        let config = RetryConfig {
            max_retries: 3,
            initial_delay: Duration::from_secs(5),
            jitter: false,
            ..fast_retry()
        };
        let mut svc = RetryLayer::new(config).layer(broken);
        let request = req("docs");
        let cancel = request.cancel.clone();

        let handle = tokio::spawn(async move {
            svc.ready().await.unwrap().call(request).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let start = Instant::now();
        cancel.cancel();
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, UpstreamError::DeadlineExceeded));
        // Unblocked promptly, not after the 5s backoff.
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    mod schedule_props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn delays_never_exceed_cap(
                max_retries in 1usize..8,
                initial_ms in 1u64..500,
                multiplier in 1.0f32..4.0,
                max_ms in 1u64..2000,
            ) {
                let config = RetryConfig {
                    max_retries,
                    initial_delay: Duration::from_millis(initial_ms),
                    max_delay: Duration::from_millis(max_ms),
                    backoff_multiplier: multiplier,
                    jitter: false,
                    call_timeout: Duration::from_secs(1),
                    max_elapsed: None,
                };
                let cap = config.max_delay.max(config.initial_delay);
                let monotone = config.initial_delay <= config.max_delay;
                let mut schedule = RetrySchedule::new(&config);
                let mut last = Duration::ZERO;
                while schedule.should_retry() {
                    let delay = schedule.next_delay();
                    prop_assert!(delay <= cap);
                    if monotone {
                        prop_assert!(delay >= last);
                        last = delay;
                    }
                }
                prop_assert_eq!(schedule.attempt(), max_retries);
            }
        }
    }
}
