//! Fluent builder for parallel, sequential and loop composites

use super::{
    CompositionError, ErrorStrategy, LoopAgent, LoopCondition, MultiAgentConfig, ParallelAgent,
    SequentialAgent, StateStrategy,
};
use agentflow_core::{Agent, State};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Shape of the composite a builder produces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositionMode {
    Parallel,
    Sequential,
    Loop { max_iterations: u32 },
}

/// Fluent construction of composite agents
///
/// ```ignore
/// let research = CompositionBuilder::new("research")
///     .with_agent(web)
///     .with_agent(papers)
///     .as_parallel()
///     .with_timeout(Duration::from_secs(10))
///     .build()?;
/// ```
pub struct CompositionBuilder {
    name: String,
    agents: Vec<Arc<dyn Agent>>,
    mode: Option<CompositionMode>,
    config: MultiAgentConfig,
    condition: Option<LoopCondition>,
}

impl CompositionBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            agents: Vec::new(),
            mode: None,
            config: MultiAgentConfig::default(),
            condition: None,
        }
    }

    pub fn with_agent(mut self, agent: Arc<dyn Agent>) -> Self {
        self.agents.push(agent);
        self
    }

    pub fn with_agents(mut self, agents: impl IntoIterator<Item = Arc<dyn Agent>>) -> Self {
        self.agents.extend(agents);
        self
    }

    pub fn as_parallel(mut self) -> Self {
        self.mode = Some(CompositionMode::Parallel);
        self
    }

    pub fn as_sequential(mut self) -> Self {
        self.mode = Some(CompositionMode::Sequential);
        self
    }

    pub fn as_loop(mut self, max_iterations: u32) -> Self {
        self.mode = Some(CompositionMode::Loop { max_iterations });
        self
    }

    /// Stop predicate for loop compositions
    pub fn until<F>(mut self, condition: F) -> Self
    where
        F: Fn(&State) -> bool + Send + Sync + 'static,
    {
        self.condition = Some(Arc::new(condition));
        self
    }

    pub fn with_config(mut self, config: MultiAgentConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.config.max_concurrency = max_concurrency;
        self
    }

    pub fn with_error_strategy(mut self, strategy: ErrorStrategy) -> Self {
        self.config.error_strategy = strategy;
        self
    }

    pub fn with_state_strategy(mut self, strategy: StateStrategy) -> Self {
        self.config.state_strategy = strategy;
        self
    }

    pub fn build(self) -> Result<Arc<dyn Agent>, CompositionError> {
        let name = self.name.clone();
        let invalid = |reason: String| CompositionError::InvalidConfig {
            name: name.clone(),
            reason,
        };

        if self.agents.is_empty() {
            return Err(invalid("requires at least one agent".to_string()));
        }

        let Some(mode) = self.mode else {
            return Err(invalid(
                "mode not specified - use as_parallel(), as_sequential(), or as_loop()".to_string(),
            ));
        };

        let agent: Arc<dyn Agent> = match mode {
            CompositionMode::Parallel => {
                Arc::new(ParallelAgent::with_config(self.name, self.config, self.agents))
            }
            CompositionMode::Sequential => Arc::new(SequentialAgent::new(self.name, self.agents)),
            CompositionMode::Loop { max_iterations } => {
                if self.agents.len() != 1 {
                    return Err(invalid(format!(
                        "loop composition requires exactly one agent, got {}",
                        self.agents.len()
                    )));
                }
                if max_iterations == 0 {
                    return Err(invalid("max_iterations must be at least 1".to_string()));
                }

                let mut agents = self.agents;
                let inner = agents.remove(0);
                let mut looped = LoopAgent::new(self.name, inner, max_iterations)
                    .with_timeout(self.config.timeout);
                if let Some(condition) = self.condition {
                    looped = looped.with_condition(condition);
                }
                Arc::new(looped)
            }
        };
        Ok(agent)
    }
}

impl fmt::Debug for CompositionBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositionBuilder")
            .field("name", &self.name)
            .field("agents", &self.agents.len())
            .field("mode", &self.mode)
            .field("config", &self.config)
            .field("has_condition", &self.condition.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentflow_core::{agent_fn, RunContext};
    use rstest::rstest;
    use serde_json::json;

    fn noop(name: &'static str) -> Arc<dyn Agent> {
        agent_fn(name, |_ctx, state| async move { Ok(state) })
    }

    #[rstest]
    #[case::no_agents(CompositionBuilder::new("c").as_parallel(), "requires at least one agent")]
    #[case::no_mode(CompositionBuilder::new("c").with_agent(noop("a")), "mode not specified")]
    #[case::loop_two(
        CompositionBuilder::new("c").with_agent(noop("a")).with_agent(noop("b")).as_loop(3),
        "exactly one agent, got 2"
    )]
    #[case::loop_zero(CompositionBuilder::new("c").with_agent(noop("a")).as_loop(0), "at least 1")]
    fn test_build_validation(#[case] builder: CompositionBuilder, #[case] expected: &str) {
        let err = builder.build().err().expect("invalid composition");
        let message = err.to_string();
        assert!(message.starts_with("composition 'c': "), "{message}");
        assert!(message.contains(expected), "{message}");
    }

    #[tokio::test]
    async fn test_nested_compositions() {
        let left = agent_fn("left", |_ctx, mut state| async move {
            state.set("left", true);
            Ok(state)
        });
        let right = agent_fn("right", |_ctx, mut state| async move {
            state.set("right", true);
            Ok(state)
        });
        let gather = CompositionBuilder::new("gather")
            .with_agents([left, right])
            .as_parallel()
            .with_max_concurrency(2)
            .with_state_strategy(StateStrategy::Merge)
            .build()
            .expect("parallel");

        let bump = agent_fn("bump", |_ctx, mut state| async move {
            let n = state.get("rounds").and_then(|v| v.as_i64()).unwrap_or(0) + 1;
            state.set("rounds", n);
            Ok(state)
        });
        let refine = CompositionBuilder::new("refine")
            .with_agent(bump)
            .as_loop(10)
            .until(|state: &State| state.get("rounds") == Some(&json!(3)))
            .build()
            .expect("loop");

        let pipeline = CompositionBuilder::new("pipeline")
            .with_agents([gather, refine])
            .as_sequential()
            .build()
            .expect("sequential");
        assert_eq!(pipeline.name(), "pipeline");

        let output = pipeline
            .run(&RunContext::background(), State::new())
            .await
            .expect("pipeline runs");
        assert_eq!(output.get("left"), Some(&json!(true)));
        assert_eq!(output.get("right"), Some(&json!(true)));
        assert_eq!(output.get("rounds"), Some(&json!(3)));
    }
}
