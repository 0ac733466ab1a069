//! Pipeline composite that threads state through its sub-agents

use super::{CompositionError, CompositionFailure, CompositionResult};
use agentflow_core::{Agent, RunContext, State};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Chains sub-agents, each one receiving the previous output
pub struct SequentialAgent {
    name: String,
    agents: Vec<Arc<dyn Agent>>,
}

impl SequentialAgent {
    pub fn new(name: impl Into<String>, agents: Vec<Arc<dyn Agent>>) -> Self {
        Self {
            name: name.into(),
            agents,
        }
    }

    pub fn agents(&self) -> &[Arc<dyn Agent>] {
        &self.agents
    }

    pub async fn execute(&self, ctx: &RunContext, input: State) -> CompositionResult {
        let mut state = input;
        for (index, agent) in self.agents.iter().enumerate() {
            debug!(composition = %self.name, agent = %agent.name(), index, "Running sequential sub-agent");
            match agent.run(ctx, state.clone()).await {
                Ok(output) => state = output,
                Err(source) => {
                    let error = CompositionError::Agent {
                        name: agent.name().to_string(),
                        index,
                        source,
                    };
                    return Err(CompositionFailure::new(error, state));
                }
            }
        }
        Ok(state)
    }
}

#[async_trait]
impl Agent for SequentialAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &RunContext, state: State) -> anyhow::Result<State> {
        Ok(self.execute(ctx, state).await?)
    }
}
