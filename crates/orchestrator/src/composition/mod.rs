//! Multi-agent composition
//!
//! Composite agents wrap other [`Agent`]s and are agents themselves, so they
//! nest freely and can be registered with any orchestrator through
//! `AgentAdapter`.
//!
//! - [`ParallelAgent`]: every sub-agent on its own copy of the input, outputs merged
//! - [`SequentialAgent`]: sub-agents chained output to input
//! - [`LoopAgent`]: one sub-agent repeated until a condition, a cap or the deadline
//!
//! A failing composite reports a [`CompositionFailure`] carrying the state
//! accumulated before the failure; through the `Agent` trait it arrives as an
//! `anyhow::Error` that can be downcast back.

pub mod builder;
pub mod loop_agent;
pub mod parallel;
pub mod sequential;

pub use builder::{CompositionBuilder, CompositionMode};
pub use loop_agent::{LoopAgent, LoopCondition};
pub use parallel::ParallelAgent;
pub use sequential::SequentialAgent;

use crate::config::duration_ms;
use agentflow_common::TimeoutConfigBase;
use agentflow_core::{Agent, ContextError, State};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// What a parallel composition does with sub-agent errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStrategy {
    /// Signal the remaining sub-agents to stop and report the first error
    FailFast,
    /// Run everything, report all errors together
    #[default]
    CollectAll,
    /// Log errors and return the partial merged state
    Continue,
}

/// How a parallel composition combines sub-agent outputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateStrategy {
    /// Union of all outputs, last completion wins on collisions
    #[default]
    Merge,
    /// Output of the last sub-agent to complete replaces the state
    Overwrite,
    /// Each output merged under its agent's name as `agent.key`
    Isolate,
}

/// Settings shared by composite agents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiAgentConfig {
    /// Deadline for the whole composition; zero disables it
    #[serde(rename = "timeout_ms", with = "duration_ms")]
    pub timeout: Duration,
    pub max_concurrency: usize,
    pub error_strategy: ErrorStrategy,
    pub state_strategy: StateStrategy,
}

impl Default for MultiAgentConfig {
    fn default() -> Self {
        Self::from_timeout_base(&TimeoutConfigBase::default())
    }
}

impl MultiAgentConfig {
    pub fn from_timeout_base(base: &TimeoutConfigBase) -> Self {
        Self {
            timeout: base.operation_timeout().unwrap_or(Duration::ZERO),
            max_concurrency: base.max_concurrency,
            error_strategy: ErrorStrategy::CollectAll,
            state_strategy: StateStrategy::Merge,
        }
    }

    /// Short deadline, small fan-out
    pub fn fast() -> Self {
        Self::from_timeout_base(&TimeoutConfigBase::fast())
    }

    /// Long deadline, wide fan-out
    pub fn production() -> Self {
        Self::from_timeout_base(&TimeoutConfigBase::slow())
    }

    pub fn timeout(&self) -> Option<Duration> {
        (!self.timeout.is_zero()).then_some(self.timeout)
    }
}

fn summarize(errors: &[CompositionError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Composition errors
#[derive(Debug, Error)]
pub enum CompositionError {
    #[error("agent {name} (index {index}): {source:#}")]
    Agent {
        name: String,
        index: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error("parallel execution errors: [{}]", summarize(.errors))]
    Multiple { errors: Vec<CompositionError> },

    #[error("loop agent {name}: context cancelled after {iterations} iterations: {reason}")]
    Cancelled {
        name: String,
        iterations: u32,
        reason: ContextError,
    },

    #[error("loop agent {name} iteration {iteration}: {source:#}")]
    Iteration {
        name: String,
        iteration: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("composition '{name}': {reason}")]
    InvalidConfig { name: String, reason: String },
}

/// A failed composite run with the state it had reached
#[derive(Debug, Error)]
#[error("{error}")]
pub struct CompositionFailure {
    pub error: CompositionError,
    pub partial_state: State,
}

impl CompositionFailure {
    pub fn new(error: CompositionError, partial_state: State) -> Self {
        Self {
            error,
            partial_state,
        }
    }

    /// Recover the failure from an error returned through [`Agent::run`]
    pub fn from_agent_error(error: &anyhow::Error) -> Option<&CompositionFailure> {
        error.downcast_ref::<CompositionFailure>()
    }
}

pub type CompositionResult = Result<State, CompositionFailure>;

/// Parallel composite with a deadline and the default strategies
pub fn create_parallel_workflow(
    name: impl Into<String>,
    timeout: Duration,
    agents: Vec<Arc<dyn Agent>>,
) -> Arc<dyn Agent> {
    let config = MultiAgentConfig {
        timeout,
        ..MultiAgentConfig::default()
    };
    Arc::new(ParallelAgent::with_config(name, config, agents))
}

pub fn create_sequential_workflow(
    name: impl Into<String>,
    agents: Vec<Arc<dyn Agent>>,
) -> Arc<dyn Agent> {
    Arc::new(SequentialAgent::new(name, agents))
}

/// Input -> processing -> output chain
pub fn create_processing_pipeline(
    name: impl Into<String>,
    input: Arc<dyn Agent>,
    processing: Arc<dyn Agent>,
    output: Arc<dyn Agent>,
) -> Arc<dyn Agent> {
    Arc::new(SequentialAgent::new(name, vec![input, processing, output]))
}

/// Loop that stops once `state[condition_key] == expected`
pub fn create_conditional_loop(
    name: impl Into<String>,
    max_iterations: u32,
    timeout: Duration,
    condition_key: impl Into<String>,
    expected: Value,
    agent: Arc<dyn Agent>,
) -> Arc<dyn Agent> {
    let condition_key = condition_key.into();
    let condition: LoopCondition =
        Arc::new(move |state: &State| state.get(&condition_key) == Some(&expected));
    Arc::new(
        LoopAgent::new(name, agent, max_iterations)
            .with_timeout(timeout)
            .with_condition(condition),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentflow_core::{agent_fn, RunContext};
    use serde_json::json;

    #[test]
    fn test_config_defaults_and_presets() {
        let config = MultiAgentConfig::default();
        assert_eq!(config.timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.max_concurrency, 10);
        assert_eq!(config.error_strategy, ErrorStrategy::CollectAll);
        assert_eq!(config.state_strategy, StateStrategy::Merge);

        assert!(MultiAgentConfig::fast().timeout() < MultiAgentConfig::production().timeout());

        let disabled = MultiAgentConfig {
            timeout: Duration::ZERO,
            ..MultiAgentConfig::default()
        };
        assert!(disabled.timeout().is_none());
    }

    #[test]
    fn test_config_json() {
        let config: MultiAgentConfig = serde_json::from_str(
            r#"{"timeout_ms": 500, "error_strategy": "fail_fast", "state_strategy": "isolate"}"#,
        )
        .expect("parse");
        assert_eq!(config.timeout, Duration::from_millis(500));
        assert_eq!(config.error_strategy, ErrorStrategy::FailFast);
        assert_eq!(config.state_strategy, StateStrategy::Isolate);
        assert_eq!(config.max_concurrency, 10);
    }

    #[tokio::test]
    async fn test_conditional_loop_helper() {
        let step = agent_fn("step", |_ctx, mut state| async move {
            let n = state.get("n").and_then(|v| v.as_i64()).unwrap_or(0) + 1;
            state.set("n", n);
            if n == 2 {
                state.set("status", "done");
            }
            Ok(state)
        });
        let looped = create_conditional_loop(
            "until-done",
            10,
            Duration::from_secs(5),
            "status",
            json!("done"),
            step,
        );

        let output = looped
            .run(&RunContext::background(), State::new())
            .await
            .expect("loop succeeds");
        assert_eq!(output.get("n"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_failure_is_recoverable_from_anyhow() {
        let ok = agent_fn("ok", |_ctx, mut state| async move {
            state.set("ok", true);
            Ok(state)
        });
        let broken = agent_fn("broken", |_ctx, _state| async move {
            Err::<State, _>(anyhow::anyhow!("invalid output"))
        });
        let pipeline = create_processing_pipeline("pipeline", ok.clone(), broken, ok);

        let err = pipeline
            .run(&RunContext::background(), State::new())
            .await
            .expect_err("pipeline fails");

        let failure = CompositionFailure::from_agent_error(&err).expect("composition failure");
        assert_eq!(failure.partial_state.get("ok"), Some(&json!(true)));
        assert_eq!(err.to_string(), "agent broken (index 1): invalid output");
    }
}
