//! Circuit Breaker Implementation
//!
//! Guards calls to a flaky dependency (usually an agent that ends in an LLM
//! call). Consecutive failures trip the breaker open; after the reset timeout
//! a limited number of trial calls decide between closing again and reopening.

use crate::config::duration_ms;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Circuit breaker errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CircuitBreakerError {
    #[error("circuit breaker '{name}' is open")]
    Open { name: String },

    #[error("circuit breaker '{name}' is half-open and at max concurrent calls ({max_calls})")]
    HalfOpenSaturated { name: String, max_calls: u32 },

    #[error("circuit breaker configuration invalid: {reason}")]
    ConfigurationError { reason: String },
}

/// Outcome of [`CircuitBreaker::call`]
#[derive(Debug, Error)]
pub enum BreakerCallError<E> {
    /// The breaker refused the call; the operation never ran
    #[error(transparent)]
    Rejected(#[from] CircuitBreakerError),

    /// The operation ran and failed
    #[error("{0}")]
    Failed(E),
}

impl<E> BreakerCallError<E> {
    pub fn is_rejected(&self) -> bool {
        matches!(self, BreakerCallError::Rejected(_))
    }
}

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Calls flow through normally
    #[default]
    Closed,

    /// Calls are rejected
    Open,

    /// Trial calls decide whether the dependency recovered
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Configuration for circuit breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in Closed before the breaker opens
    pub failure_threshold: u32,

    /// Consecutive successes in HalfOpen before the breaker closes
    pub success_threshold: u32,

    /// Time spent Open before a trial call is let through
    #[serde(rename = "reset_timeout_ms", with = "duration_ms")]
    pub reset_timeout: Duration,

    /// Trial calls allowed at once while HalfOpen
    pub max_concurrent_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            reset_timeout: Duration::from_secs(30),
            max_concurrent_calls: 2,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<(), CircuitBreakerError> {
        if self.failure_threshold == 0 {
            return Err(CircuitBreakerError::ConfigurationError {
                reason: "failure_threshold must be at least 1".to_string(),
            });
        }
        if self.success_threshold == 0 {
            return Err(CircuitBreakerError::ConfigurationError {
                reason: "success_threshold must be at least 1".to_string(),
            });
        }
        if self.max_concurrent_calls == 0 {
            return Err(CircuitBreakerError::ConfigurationError {
                reason: "max_concurrent_calls must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerMetrics {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub concurrent_calls: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub total_calls: u64,
    pub rejected_calls: u64,
}

/// Called with (breaker name, from, to) after every transition
pub type StateChangeListener = Arc<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>;

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    concurrent_calls: u32,
    last_failure_time: Option<DateTime<Utc>>,
    last_state_change: Instant,
    /// Bumped on every transition; permits from an older generation are stale
    generation: u64,
}

impl BreakerInner {
    fn transition(&mut self, to: CircuitState) -> Option<(CircuitState, CircuitState)> {
        if self.state == to {
            return None;
        }
        let from = self.state;
        self.state = to;
        self.last_state_change = Instant::now();
        self.failure_count = 0;
        self.success_count = 0;
        self.concurrent_calls = 0;
        self.generation += 1;
        Some((from, to))
    }
}

/// Circuit breaker implementation
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    total_calls: AtomicU64,
    rejected_calls: AtomicU64,
    listener: Option<StateChangeListener>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                concurrent_calls: 0,
                last_failure_time: None,
                last_state_change: Instant::now(),
                generation: 0,
            }),
            total_calls: AtomicU64::new(0),
            rejected_calls: AtomicU64::new(0),
            listener: None,
        }
    }

    pub fn with_default_config(name: impl Into<String>) -> Self {
        Self::new(name, CircuitBreakerConfig::default())
    }

    pub fn with_listener(mut self, listener: StateChangeListener) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state without triggering the Open -> HalfOpen check
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Run `operation` through the breaker
    ///
    /// A rejected call never invokes `operation`. The lock is not held while
    /// the operation runs.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, BreakerCallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.try_acquire()?;
        match operation().await {
            Ok(value) => {
                permit.record_success();
                Ok(value)
            }
            Err(err) => {
                permit.record_failure();
                Err(BreakerCallError::Failed(err))
            }
        }
    }

    /// Reserve a call slot; the permit must be completed with an outcome
    pub fn try_acquire(&self) -> Result<CallPermit<'_>, CircuitBreakerError> {
        self.total_calls.fetch_add(1, Ordering::Relaxed);

        let mut transition = None;
        let verdict: Result<u64, CircuitBreakerError> = {
            let mut inner = self.inner.lock();

            if inner.state == CircuitState::Open
                && inner.last_state_change.elapsed() >= self.config.reset_timeout
            {
                transition = inner.transition(CircuitState::HalfOpen);
            }

            match inner.state {
                CircuitState::Closed => {
                    inner.concurrent_calls += 1;
                    Ok(inner.generation)
                }
                CircuitState::Open => Err(CircuitBreakerError::Open {
                    name: self.name.clone(),
                }),
                CircuitState::HalfOpen => {
                    if inner.concurrent_calls >= self.config.max_concurrent_calls {
                        Err(CircuitBreakerError::HalfOpenSaturated {
                            name: self.name.clone(),
                            max_calls: self.config.max_concurrent_calls,
                        })
                    } else {
                        inner.concurrent_calls += 1;
                        Ok(inner.generation)
                    }
                }
            }
        };

        self.notify(transition);

        match verdict {
            Ok(generation) => Ok(CallPermit {
                breaker: self,
                generation,
                completed: false,
            }),
            Err(err) => {
                self.rejected_calls.fetch_add(1, Ordering::Relaxed);
                debug!(breaker = %self.name, error = %err, "Call rejected");
                Err(err)
            }
        }
    }

    fn on_success(&self, generation: u64) {
        let transition = {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                debug!(breaker = %self.name, "Ignoring success from a previous breaker state");
                return;
            }
            inner.concurrent_calls = inner.concurrent_calls.saturating_sub(1);

            match inner.state {
                CircuitState::Closed => {
                    inner.failure_count = 0;
                    None
                }
                CircuitState::HalfOpen => {
                    inner.success_count += 1;
                    if inner.success_count >= self.config.success_threshold {
                        inner.transition(CircuitState::Closed)
                    } else {
                        None
                    }
                }
                CircuitState::Open => None,
            }
        };
        self.notify(transition);
    }

    fn on_failure(&self, generation: u64) {
        let transition = {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                debug!(breaker = %self.name, "Ignoring failure from a previous breaker state");
                return;
            }
            inner.concurrent_calls = inner.concurrent_calls.saturating_sub(1);
            inner.failure_count += 1;
            inner.last_failure_time = Some(Utc::now());

            match inner.state {
                CircuitState::Closed if inner.failure_count >= self.config.failure_threshold => {
                    inner.transition(CircuitState::Open)
                }
                CircuitState::HalfOpen => inner.transition(CircuitState::Open),
                _ => None,
            }
        };
        self.notify(transition);
    }

    fn release(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.generation == generation {
            inner.concurrent_calls = inner.concurrent_calls.saturating_sub(1);
        }
    }

    fn notify(&self, transition: Option<(CircuitState, CircuitState)>) {
        let Some((from, to)) = transition else {
            return;
        };

        match to {
            CircuitState::Open => {
                warn!(breaker = %self.name, from = %from, "Circuit breaker opening - blocking requests")
            }
            CircuitState::HalfOpen => {
                info!(breaker = %self.name, "Circuit breaker half-open - testing recovery")
            }
            CircuitState::Closed => {
                info!(breaker = %self.name, "Circuit breaker closed - dependency recovered")
            }
        }

        if let Some(listener) = &self.listener {
            listener(&self.name, from, to);
        }
    }

    /// Force the breaker open, e.g. when a dependency is known to be down
    pub fn force_open(&self) {
        let transition = self.inner.lock().transition(CircuitState::Open);
        self.notify(transition);
    }

    /// Back to Closed with all counters cleared
    pub fn reset(&self) {
        let transition = {
            let mut inner = self.inner.lock();
            let transition = inner.transition(CircuitState::Closed);
            if transition.is_none() {
                inner.generation += 1;
            }
            inner.failure_count = 0;
            inner.success_count = 0;
            inner.concurrent_calls = 0;
            inner.last_failure_time = None;
            transition
        };
        self.total_calls.store(0, Ordering::Relaxed);
        self.rejected_calls.store(0, Ordering::Relaxed);
        self.notify(transition);
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let inner = self.inner.lock();
        CircuitBreakerMetrics {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            concurrent_calls: inner.concurrent_calls,
            last_failure_time: inner.last_failure_time,
            total_calls: self.total_calls.load(Ordering::Relaxed),
            rejected_calls: self.rejected_calls.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("config", &self.config)
            .finish()
    }
}

/// Admission ticket for one call; dropping it without an outcome only frees the slot
///
/// A permit belongs to the breaker state it was admitted in. Once the breaker
/// transitions, the outcome of an older permit is ignored and its slot is
/// already freed.
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    completed: bool,
}

impl CallPermit<'_> {
    pub fn record_success(mut self) {
        self.completed = true;
        self.breaker.on_success(self.generation);
    }

    pub fn record_failure(mut self) {
        self.completed = true;
        self.breaker.on_failure(self.generation);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.completed {
            self.breaker.release(self.generation);
        }
    }
}
