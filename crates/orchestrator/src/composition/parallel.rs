//! Concurrent fan-out composite with bounded concurrency

use super::{
    CompositionError, CompositionFailure, CompositionResult, ErrorStrategy, MultiAgentConfig,
    StateStrategy,
};
use agentflow_core::{Agent, RunContext, State};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Runs every sub-agent concurrently on a copy of the input state
///
/// At most `max_concurrency` sub-agents run at once and all of them share the
/// composition deadline. Outputs are folded into the input in completion
/// order according to the configured [`StateStrategy`].
pub struct ParallelAgent {
    name: String,
    config: MultiAgentConfig,
    agents: Vec<Arc<dyn Agent>>,
}

impl ParallelAgent {
    pub fn new(name: impl Into<String>, agents: Vec<Arc<dyn Agent>>) -> Self {
        Self::with_config(name, MultiAgentConfig::default(), agents)
    }

    pub fn with_config(
        name: impl Into<String>,
        config: MultiAgentConfig,
        agents: Vec<Arc<dyn Agent>>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            agents,
        }
    }

    pub fn config(&self) -> &MultiAgentConfig {
        &self.config
    }

    pub fn agents(&self) -> &[Arc<dyn Agent>] {
        &self.agents
    }

    fn fold(&self, merged: &mut State, agent: &str, output: State) {
        match self.config.state_strategy {
            StateStrategy::Merge => merged.merge(&output),
            StateStrategy::Overwrite => *merged = output,
            StateStrategy::Isolate => merged.merge_namespaced(agent, &output),
        }
    }

    pub async fn execute(&self, ctx: &RunContext, input: State) -> CompositionResult {
        if self.agents.is_empty() {
            return Ok(input);
        }

        let run_ctx = match self.config.timeout() {
            Some(timeout) => ctx.with_timeout(timeout),
            None => ctx.child(),
        };
        let permits = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));

        let mut tasks = JoinSet::new();
        let mut pending = BTreeMap::new();
        for (index, agent) in self.agents.iter().enumerate() {
            let agent = agent.clone();
            let ctx = run_ctx.clone();
            let permits = permits.clone();
            let state = input.clone();
            pending.insert(index, agent.name().to_string());

            tasks.spawn(async move {
                let result = match ctx.run(permits.acquire_owned()).await {
                    Ok(Ok(_permit)) => agent.run(&ctx, state).await,
                    Ok(Err(closed)) => Err(anyhow::Error::new(closed)),
                    Err(reason) => Err(anyhow::Error::new(reason)),
                };
                (index, result)
            });
        }

        let mut merged = input;
        let mut errors = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (index, result) = match joined {
                Ok(done) => done,
                Err(err) => {
                    warn!(composition = %self.name, error = %err, "Parallel sub-agent task aborted");
                    continue;
                }
            };
            let name = pending.remove(&index).unwrap_or_default();

            match result {
                Ok(output) => {
                    debug!(composition = %self.name, agent = %name, index, "Parallel sub-agent finished");
                    self.fold(&mut merged, &name, output);
                }
                Err(source) => {
                    if self.config.error_strategy == ErrorStrategy::FailFast && errors.is_empty() {
                        run_ctx.cancel();
                    }
                    errors.push(CompositionError::Agent {
                        name,
                        index,
                        source,
                    });
                }
            }
        }

        // Tasks that panicked never reported back
        for (index, name) in pending {
            errors.push(CompositionError::Agent {
                name,
                index,
                source: anyhow::anyhow!("agent task panicked"),
            });
        }

        if errors.is_empty() {
            return Ok(merged);
        }

        match self.config.error_strategy {
            ErrorStrategy::FailFast => {
                let first = errors.remove(0);
                Err(CompositionFailure::new(first, merged))
            }
            ErrorStrategy::CollectAll => Err(CompositionFailure::new(
                CompositionError::Multiple { errors },
                merged,
            )),
            ErrorStrategy::Continue => {
                for error in &errors {
                    warn!(composition = %self.name, error = %error, "Parallel sub-agent failed, continuing");
                }
                Ok(merged)
            }
        }
    }
}

#[async_trait]
impl Agent for ParallelAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &RunContext, state: State) -> anyhow::Result<State> {
        Ok(self.execute(ctx, state).await?)
    }
}
