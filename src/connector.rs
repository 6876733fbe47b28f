//! Connector contract between the core and upstream integrations
//!
//! What this module provides
//! - The single seam through which the core talks to an upstream source
//!
//! Exports
//! - Models
//!   - `SourceId` newtype naming an upstream connector ("docs", "issues", ...)
//!   - `CallRequest { source, payload, cancel, attempt }`
//! - Services
//!   - `Connector`: any `Service<CallRequest, Response = Value, Error = UpstreamError>`
//!   - `ConnectorSvc`: boxed, cloneable connector for registration maps
//! - Utils
//!   - `connector_fn` to lift an async closure into a `ConnectorSvc`
//!
//! Implementation strategy
//! - The core has no knowledge of HTTP, WebSocket, or any wire protocol;
//!   a connector owns all of that and surfaces errors classified as
//!   retryable or not via `UpstreamError::Connector`
//! - Cancellation propagates through the request's `CancellationToken`;
//!   connectors are expected to abandon work promptly once it fires
//!
//! Composition
//! - `SchedulerBuilder::new(config).connector("docs", connector_fn(|req| async { ... }))`
//! - Wrap with the resilience stack via `resilience::wrap_connector`
//!
//! Testing strategy
//! - `connector_fn` closures with scripted failure patterns and atomic
//!   invocation counters stand in for real upstreams throughout the suite

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tower::util::BoxCloneSyncService;
use tower::Service;

use crate::error::UpstreamError;

/// Opaque name of an upstream connector.
///
/// Used as the partition key for circuit-breaker state and per-source
/// concurrency limits. Cheap to clone and hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(Arc<str>);

impl SourceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SourceId {
    fn from(s: &str) -> Self {
        Self(Arc::from(s))
    }
}

impl From<String> for SourceId {
    fn from(s: String) -> Self {
        Self(Arc::from(s.as_str()))
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// `UpstreamError::CircuitOpen` names its data-source field `source`, which
// thiserror treats as the error source and therefore requires to implement
// `std::error::Error`.
impl std::error::Error for SourceId {}

impl Serialize for SourceId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for SourceId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::from(s))
    }
}

/// One call into an upstream connector.
#[derive(Debug, Clone)]
pub struct CallRequest {
    /// Which upstream this call targets.
    pub source: SourceId,
    /// Opaque payload; its meaning belongs entirely to the connector.
    pub payload: Value,
    /// Fires when the caller no longer wants the result.
    pub cancel: CancellationToken,
    /// Wall-clock bound on the call including retries; the retry policy
    /// stops rather than sleep past it.
    pub deadline: Option<std::time::Instant>,
    /// Zero-based attempt number, set by the retry policy.
    pub attempt: usize,
}

impl CallRequest {
    pub fn new(source: SourceId, payload: Value) -> Self {
        Self {
            source,
            payload,
            cancel: CancellationToken::new(),
            deadline: None,
            attempt: 0,
        }
    }
}

/// Any Tower service with the connector signature.
pub trait Connector:
    Service<CallRequest, Response = Value, Error = UpstreamError> + Send + 'static
{
}

impl<T> Connector for T where
    T: Service<CallRequest, Response = Value, Error = UpstreamError> + Send + 'static
{
}

/// Boxed, cloneable connector, the form the scheduler's routing map holds.
pub type ConnectorSvc = BoxCloneSyncService<CallRequest, Value, UpstreamError>;

/// Lift an async closure into a boxed connector.
pub fn connector_fn<F, Fut>(f: F) -> ConnectorSvc
where
    F: FnMut(CallRequest) -> Fut + Clone + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Value, UpstreamError>> + Send + 'static,
{
    BoxCloneSyncService::new(tower::service_fn(f))
}
