//! Retry Policy Implementation
//!
//! Re-executes an operation with exponential backoff and jitter. Errors are
//! classified by the error router; only codes in the policy's retryable set
//! are retried.

use super::circuit_breaker::{BreakerCallError, CircuitBreaker, CircuitBreakerError};
use crate::config::duration_ms;
use crate::error_routing::{categorize_message, ErrorCode};
use agentflow_core::{ContextError, RunContext};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Retry policy errors
#[derive(Debug, Error)]
pub enum RetryError {
    #[error("operation failed after {attempts} attempts: {source:#}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("non-retryable {code} after {attempts} attempt(s): {source:#}")]
    NonRetryable {
        code: ErrorCode,
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("attempt rejected: {0}")]
    CircuitOpen(#[from] CircuitBreakerError),

    #[error("retry cancelled after {attempts} attempts: {reason}")]
    Cancelled { attempts: u32, reason: ContextError },
}

/// Retry policy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,

    #[serde(rename = "initial_delay_ms", with = "duration_ms")]
    pub initial_delay: Duration,

    #[serde(rename = "max_delay_ms", with = "duration_ms")]
    pub max_delay: Duration,

    pub backoff_factor: f64,

    /// Randomize each delay by +/-10%, never above `max_delay`
    pub jitter: bool,

    /// Codes worth another attempt; everything else fails immediately
    pub retryable_errors: HashSet<ErrorCode>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter: true,
            retryable_errors: [ErrorCode::Timeout, ErrorCode::Network, ErrorCode::Llm]
                .into_iter()
                .collect(),
        }
    }
}

impl RetryPolicy {
    /// Single attempt
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Short delays for interactive paths and tests
    pub fn fast() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(200),
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retryable(mut self, codes: impl IntoIterator<Item = ErrorCode>) -> Self {
        self.retryable_errors = codes.into_iter().collect();
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn is_retryable(&self, code: ErrorCode) -> bool {
        self.retryable_errors.contains(&code)
    }

    /// Total attempts allowed
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Un-jittered delay before retry number `retry` (1-based)
    pub fn base_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1) as i32;
        let millis = self.initial_delay.as_millis() as f64 * self.backoff_factor.powi(exponent);
        let max_millis = self.max_delay.as_millis() as f64;

        if !millis.is_finite() || millis >= max_millis {
            self.max_delay
        } else {
            Duration::from_millis(millis.max(0.0) as u64)
        }
    }

    /// Delay before retry number `retry`, jittered when enabled
    pub fn delay_for(&self, retry: u32) -> Duration {
        let delay = self.base_delay(retry);
        if !self.jitter || delay.is_zero() {
            return delay;
        }

        let factor = rand::thread_rng().gen_range(0.9..=1.1);
        let jittered = Duration::from_millis((delay.as_millis() as f64 * factor) as u64);
        jittered.min(self.max_delay)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.backoff_factor < 1.0 {
            return Err(format!(
                "backoff_factor must be >= 1.0, got {}",
                self.backoff_factor
            ));
        }
        if self.max_delay < self.initial_delay {
            return Err("max_delay must not be shorter than initial_delay".to_string());
        }
        Ok(())
    }
}

/// What happened during [`Retrier::execute`]
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, RetryError>,
    /// Attempts that actually invoked the operation
    pub attempts: u32,
    /// Rendered error of every failed attempt, oldest first
    pub error_history: Vec<String>,
    pub total_duration: Duration,
}

impl<T> RetryOutcome<T> {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn last_error(&self) -> Option<&RetryError> {
        self.result.as_ref().err()
    }

    pub fn into_result(self) -> Result<T, RetryError> {
        self.result
    }
}

/// Runs operations under a [`RetryPolicy`]
#[derive(Debug, Clone, Default)]
pub struct Retrier {
    policy: RetryPolicy,
}

impl Retrier {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Execute `operation` until it succeeds, fails non-retryably or the budget runs out
    pub async fn execute<T, F, Fut>(&self, ctx: &RunContext, operation: F) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.run(ctx, None, operation).await
    }

    /// Like [`Retrier::execute`], with every attempt gated by `breaker`
    ///
    /// A rejected attempt ends the run at once and is not counted.
    pub async fn execute_with_circuit_breaker<T, F, Fut>(
        &self,
        ctx: &RunContext,
        breaker: &CircuitBreaker,
        operation: F,
    ) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.run(ctx, Some(breaker), operation).await
    }

    async fn run<T, F, Fut>(
        &self,
        ctx: &RunContext,
        breaker: Option<&CircuitBreaker>,
        mut operation: F,
    ) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let started = Instant::now();
        let max_attempts = self.policy.max_attempts();
        let mut attempts = 0u32;
        let mut error_history = Vec::new();

        let result = loop {
            if let Some(reason) = ctx.err() {
                break Err(RetryError::Cancelled { attempts, reason });
            }

            let outcome = match breaker {
                Some(breaker) => match breaker.call(&mut operation).await {
                    Ok(value) => Ok(value),
                    Err(BreakerCallError::Failed(err)) => Err(err),
                    Err(BreakerCallError::Rejected(rejection)) => {
                        warn!(
                            breaker = %breaker.name(),
                            attempts,
                            "Circuit breaker rejected attempt, not retrying"
                        );
                        break Err(RetryError::CircuitOpen(rejection));
                    }
                },
                None => operation().await,
            };
            attempts += 1;

            let err = match outcome {
                Ok(value) => {
                    if attempts > 1 {
                        info!(attempts, "Operation succeeded after retry");
                    }
                    break Ok(value);
                }
                Err(err) => err,
            };

            let rendered = format!("{:#}", err);
            let code = categorize_message(&rendered).code;
            error_history.push(rendered);

            if !self.policy.is_retryable(code) {
                debug!(attempt = attempts, code = %code, "Error is not retryable");
                break Err(RetryError::NonRetryable {
                    code,
                    attempts,
                    source: err,
                });
            }

            if attempts >= max_attempts {
                warn!(attempts, code = %code, "Retry budget exhausted");
                break Err(RetryError::Exhausted {
                    attempts,
                    source: err,
                });
            }

            let delay = self.policy.delay_for(attempts);
            debug!(
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                code = %code,
                "Attempt failed, retrying"
            );

            if let Err(reason) = ctx.sleep(delay).await {
                break Err(RetryError::Cancelled { attempts, reason });
            }
        };

        RetryOutcome {
            result,
            attempts,
            error_history,
            total_duration: started.elapsed(),
        }
    }
}
