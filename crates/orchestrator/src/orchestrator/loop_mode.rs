//! One agent repeated until it reports completion

use super::{Orchestrator, OrchestratorCore, OrchestratorError, OrchestratorKind};
use agentflow_core::{
    AgentHandler, AgentResult, CallbackRegistry, Event, RunContext, State, LOOP_COMPLETED_KEY,
};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

pub const DEFAULT_MAX_ITERATIONS: u32 = 5;

/// Re-runs a single agent on its own output
///
/// Stops after `max_iterations` or as soon as the output state carries
/// `loop_completed = true`.
pub struct LoopOrchestrator {
    core: OrchestratorCore,
    agent: String,
    max_iterations: u32,
}

impl LoopOrchestrator {
    pub fn new(callbacks: Arc<CallbackRegistry>, agent: impl Into<String>, max_iterations: u32) -> Self {
        Self {
            core: OrchestratorCore::new(OrchestratorKind::Loop, callbacks),
            agent: agent.into(),
            max_iterations: max_iterations.max(1),
        }
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }
}

fn is_completed(state: &State) -> bool {
    matches!(state.get(LOOP_COMPLETED_KEY), Some(Value::Bool(true)))
}

#[async_trait]
impl Orchestrator for LoopOrchestrator {
    fn kind(&self) -> OrchestratorKind {
        OrchestratorKind::Loop
    }

    async fn register_agent(
        &self,
        name: &str,
        handler: Arc<dyn AgentHandler>,
    ) -> Result<(), OrchestratorError> {
        self.core.agents().register(name, handler).await
    }

    async fn dispatch(&self, ctx: &RunContext, event: &Event) -> Result<AgentResult, OrchestratorError> {
        let handler = self.core.agents().get(&self.agent).await.ok_or_else(|| {
            OrchestratorError::UnknownRoute {
                route: self.agent.clone(),
                event_id: event.id(),
            }
        })?;

        let start = Utc::now();
        let mut state = State::from_event(event);

        for iteration in 0..self.max_iterations {
            if let Some(reason) = ctx.err() {
                return Err(OrchestratorError::Cancelled(reason));
            }

            debug!(agent = %self.agent, iteration, "Running loop iteration");
            let result = self
                .core
                .run_agent(ctx, event, &self.agent, handler.as_ref(), state)
                .await
                .map_err(|source| OrchestratorError::LoopIterationFailed {
                    agent: self.agent.clone(),
                    iteration,
                    source,
                })?;
            state = result.output_state;

            if is_completed(&state) {
                info!(agent = %self.agent, iteration, "Loop completed early");
                break;
            }
        }

        Ok(AgentResult::completed(state, start))
    }

    async fn has_agent(&self, name: &str) -> bool {
        self.core.agents().contains(name).await
    }

    async fn handlers(&self) -> Vec<(String, Arc<dyn AgentHandler>)> {
        self.core.agents().snapshot().await
    }

    async fn stop(&self) {
        self.core.stop();
    }

    fn callback_registry(&self) -> Arc<CallbackRegistry> {
        self.core.callbacks().clone()
    }
}
