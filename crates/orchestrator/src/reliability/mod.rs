//! Agent Reliability Module
//!
//! Circuit breakers and retries for agent calls. The runner keeps one breaker
//! per dispatch target in a [`CircuitBreakerRegistry`].

pub mod circuit_breaker;
pub mod retry_policy;

pub use circuit_breaker::{
    BreakerCallError, CallPermit, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError,
    CircuitBreakerMetrics, CircuitState, StateChangeListener,
};
pub use retry_policy::{Retrier, RetryError, RetryOutcome, RetryPolicy};

use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// Named circuit breakers sharing one configuration
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    listener: Option<StateChangeListener>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
            listener: None,
        }
    }

    /// Listener attached to every breaker created from now on
    pub fn with_listener(mut self, listener: StateChangeListener) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Breaker for `name`, created on first use
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            return existing.clone();
        }

        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(breaker = %name, "Creating circuit breaker");
                let breaker = CircuitBreaker::new(name, self.config.clone());
                let breaker = match &self.listener {
                    Some(listener) => breaker.with_listener(listener.clone()),
                    None => breaker,
                };
                Arc::new(breaker)
            })
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|entry| entry.clone())
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    /// Metrics of every breaker, sorted by name
    pub fn metrics(&self) -> Vec<CircuitBreakerMetrics> {
        let mut metrics: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| entry.value().metrics())
            .collect();
        metrics.sort_by(|a, b| a.name.cmp(&b.name));
        metrics
    }

    pub fn reset_all(&self) {
        for entry in self.breakers.iter() {
            entry.value().reset();
        }
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl std::fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("config", &self.config)
            .field("breakers", &self.breakers.len())
            .finish()
    }
}
