//! Per-source circuit breaker state machine and registry.
//!
//! Each `SourceId` owns one breaker, created lazily on first call and
//! kept for the life of the process. State transitions and window
//! updates happen under that breaker's own lock; unrelated sources
//! never contend.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use tracing::{info, warn};

use crate::config::BreakerConfig;
use crate::connector::SourceId;
use crate::error::{Result, UpstreamError};

/// Classic circuit-breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls pass through; outcomes are sampled into the rolling window.
    Closed,
    /// Calls are short-circuited until the cooldown elapses.
    Open,
    /// A limited number of trial calls probe whether the source recovered.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => f.write_str("closed"),
            CircuitState::Open => f.write_str("open"),
            CircuitState::HalfOpen => f.write_str("half-open"),
        }
    }
}

/// How a call was let through, echoed back when its outcome is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Admitted with the circuit closed.
    Normal,
    /// Admitted as a half-open trial.
    Trial,
}

/// Observable counters for one breaker.
#[derive(Debug, Clone)]
pub struct BreakerSnapshot {
    pub source: SourceId,
    pub state: CircuitState,
    pub total_calls: u64,
    pub failed_calls: u64,
    pub failure_rate: f64,
    /// How long ago the circuit last opened, if it ever did.
    pub open_for: Option<std::time::Duration>,
}

struct BreakerCore {
    state: CircuitState,
    /// Rolling outcome window: (sampled_at, success).
    window: VecDeque<(Instant, bool)>,
    opened_at: Option<Instant>,
    trial_successes: u32,
    trials_in_flight: u32,
    total_calls: u64,
    failed_calls: u64,
}

pub struct Breaker {
    source: SourceId,
    config: BreakerConfig,
    core: Mutex<BreakerCore>,
}

impl Breaker {
    fn new(source: SourceId, config: BreakerConfig) -> Self {
        Self {
            source,
            config,
            core: Mutex::new(BreakerCore {
                state: CircuitState::Closed,
                window: VecDeque::new(),
                opened_at: None,
                trial_successes: 0,
                trials_in_flight: 0,
                total_calls: 0,
                failed_calls: 0,
            }),
        }
    }

    /// Decide whether a call may proceed right now.
    pub fn admit(&self) -> Result<Admission> {
        let mut core = self.core.lock().unwrap();
        match core.state {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::Open => {
                let opened_at = core.opened_at.expect("open circuit has opened_at");
                if opened_at.elapsed() >= self.config.cooldown {
                    core.state = CircuitState::HalfOpen;
                    core.trial_successes = 0;
                    core.trials_in_flight = 1;
                    info!(source = %self.source, "circuit entering half-open state");
                    Ok(Admission::Trial)
                } else {
                    Err(UpstreamError::CircuitOpen {
                        source: self.source.clone(),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if core.trials_in_flight < self.config.half_open_max_trials {
                    core.trials_in_flight += 1;
                    Ok(Admission::Trial)
                } else {
                    Err(UpstreamError::CircuitOpen {
                        source: self.source.clone(),
                    })
                }
            }
        }
    }

    /// Record one attempt outcome. Must be called exactly once per
    /// successful `admit`.
    pub fn record(&self, admission: Admission, success: bool) {
        let mut core = self.core.lock().unwrap();
        core.total_calls += 1;
        if !success {
            core.failed_calls += 1;
        }

        match (core.state, admission) {
            (CircuitState::HalfOpen, Admission::Trial) => {
                core.trials_in_flight = core.trials_in_flight.saturating_sub(1);
                if success {
                    core.trial_successes += 1;
                    if core.trial_successes >= self.config.trial_successes {
                        core.state = CircuitState::Closed;
                        core.window.clear();
                        core.opened_at = None;
                        info!(source = %self.source, "circuit closed after successful trials");
                    }
                } else {
                    core.state = CircuitState::Open;
                    core.opened_at = Some(Instant::now());
                    core.trial_successes = 0;
                    warn!(source = %self.source, "trial call failed, circuit reopened");
                }
            }
            (CircuitState::Closed, _) => {
                let now = Instant::now();
                core.window.push_back((now, success));
                self.prune_window(&mut core, now);
                let samples = core.window.len();
                let failures = core.window.iter().filter(|(_, ok)| !ok).count();
                if samples >= self.config.min_samples
                    && failures as f32 / samples as f32 >= self.config.failure_ratio
                {
                    core.state = CircuitState::Open;
                    core.opened_at = Some(now);
                    warn!(
                        source = %self.source,
                        failures,
                        samples,
                        "failure ratio exceeded, circuit opened"
                    );
                }
            }
            // A call admitted earlier finished after the state moved on;
            // it still counts toward the totals above.
            _ => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.core.lock().unwrap().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let core = self.core.lock().unwrap();
        BreakerSnapshot {
            source: self.source.clone(),
            state: core.state,
            total_calls: core.total_calls,
            failed_calls: core.failed_calls,
            failure_rate: core.failed_calls as f64 / core.total_calls.max(1) as f64,
            open_for: core.opened_at.map(|t| t.elapsed()),
        }
    }

    fn prune_window(&self, core: &mut BreakerCore, now: Instant) {
        while core.window.len() > self.config.window_size {
            core.window.pop_front();
        }
        while let Some((at, _)) = core.window.front() {
            if now.duration_since(*at) > self.config.window_age {
                core.window.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Registry-wide health summary across all breakers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Health {
    Healthy,
    /// At least one source has an open circuit.
    Degraded { open_sources: Vec<SourceId> },
}

/// Lazily creates and hands out one breaker per source.
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: RwLock<HashMap<SourceId, Arc<Breaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    pub fn breaker(&self, source: &SourceId) -> Arc<Breaker> {
        if let Some(b) = self.breakers.read().unwrap().get(source) {
            return b.clone();
        }
        let mut breakers = self.breakers.write().unwrap();
        breakers
            .entry(source.clone())
            .or_insert_with(|| Arc::new(Breaker::new(source.clone(), self.config.clone())))
            .clone()
    }

    /// State for a source; `Closed` for sources that never made a call.
    pub fn status(&self, source: &SourceId) -> CircuitState {
        self.breakers
            .read()
            .unwrap()
            .get(source)
            .map(|b| b.state())
            .unwrap_or(CircuitState::Closed)
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        self.breakers
            .read()
            .unwrap()
            .values()
            .map(|b| b.snapshot())
            .collect()
    }

    pub fn health(&self) -> Health {
        let mut open_sources: Vec<SourceId> = self
            .breakers
            .read()
            .unwrap()
            .iter()
            .filter(|(_, b)| b.state() == CircuitState::Open)
            .map(|(s, _)| s.clone())
            .collect();
        if open_sources.is_empty() {
            Health::Healthy
        } else {
            open_sources.sort();
            Health::Degraded { open_sources }
        }
    }
}
