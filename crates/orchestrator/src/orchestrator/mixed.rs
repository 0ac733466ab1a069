//! Collaborative phase followed by a sequential phase

use super::collaborative::fan_out;
use super::sequential::run_sequence;
use super::{Orchestrator, OrchestratorCore, OrchestratorError, OrchestratorKind};
use agentflow_core::{AgentHandler, AgentResult, CallbackRegistry, Event, RunContext, State};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};

/// Runs the collaborative agents together, then pipes their merged output
/// through the sequential agents
pub struct MixedOrchestrator {
    core: OrchestratorCore,
    collaborative: Vec<String>,
    sequential: Vec<String>,
}

impl MixedOrchestrator {
    pub fn new(
        callbacks: Arc<CallbackRegistry>,
        collaborative: Vec<String>,
        sequential: Vec<String>,
    ) -> Self {
        Self {
            core: OrchestratorCore::new(OrchestratorKind::Mixed, callbacks),
            collaborative,
            sequential,
        }
    }

    async fn collaborative_phase(
        &self,
        ctx: &RunContext,
        event: &Event,
        base: State,
    ) -> Result<State, OrchestratorError> {
        let mut handlers = Vec::with_capacity(self.collaborative.len());
        for name in &self.collaborative {
            match self.core.agents().get(name).await {
                Some(handler) => handlers.push((name.clone(), handler)),
                None => warn!(agent = %name, "Collaborative agent not registered, skipping"),
            }
        }
        if handlers.is_empty() {
            return Ok(base);
        }

        let outcome = fan_out(self.core.callbacks(), ctx, event, handlers, &base).await;
        if outcome.succeeded == 0 {
            return Err(OrchestratorError::AllAgentsFailed {
                failures: outcome.failures,
            });
        }
        for failure in &outcome.failures {
            warn!(agent = %failure.agent, error = %failure.error, "Collaborative agent failed");
        }

        // Keep the event fields the parallel agents did not rewrite
        let mut state = base;
        state.merge(&outcome.merged);
        Ok(state)
    }
}

#[async_trait]
impl Orchestrator for MixedOrchestrator {
    fn kind(&self) -> OrchestratorKind {
        OrchestratorKind::Mixed
    }

    async fn register_agent(
        &self,
        name: &str,
        handler: Arc<dyn AgentHandler>,
    ) -> Result<(), OrchestratorError> {
        self.core.agents().register(name, handler).await
    }

    async fn dispatch(&self, ctx: &RunContext, event: &Event) -> Result<AgentResult, OrchestratorError> {
        if self.collaborative.is_empty() && self.sequential.is_empty() {
            return Err(OrchestratorError::NoAgentsConfigured { mode: "mixed" });
        }

        let start = Utc::now();
        let state = self
            .collaborative_phase(ctx, event, State::from_event(event))
            .await?;
        debug!(event_id = %event.id(), "Collaborative phase finished");

        let state = run_sequence(&self.core, ctx, event, &self.sequential, state).await?;
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
