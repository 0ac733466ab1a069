//! Fixed agent sequence, each agent fed the previous output

use super::{Orchestrator, OrchestratorCore, OrchestratorError, OrchestratorKind};
use agentflow_core::{AgentHandler, AgentResult, CallbackRegistry, Event, RunContext, State};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};

/// Run `names` one after another starting from `state`
///
/// Names without a registered handler are skipped.
pub(crate) async fn run_sequence(
    core: &OrchestratorCore,
    ctx: &RunContext,
    event: &Event,
    names: &[String],
    mut state: State,
) -> Result<State, OrchestratorError> {
    for name in names {
        if let Some(reason) = ctx.err() {
            return Err(OrchestratorError::Cancelled(reason));
        }

        let Some(handler) = core.agents().get(name).await else {
            warn!(agent = %name, event_id = %event.id(), "Sequential agent not registered, skipping");
            continue;
        };

        debug!(agent = %name, event_id = %event.id(), "Running sequential step");
        let result = core
            .run_agent(ctx, event, name, handler.as_ref(), state)
            .await
            .map_err(|source| OrchestratorError::SequentialStepFailed {
                agent: name.clone(),
                source,
            })?;
        state = result.output_state;
    }
    Ok(state)
}

/// Processes each event through a configured agent pipeline
pub struct SequentialOrchestrator {
    core: OrchestratorCore,
    sequence: Vec<String>,
}

impl SequentialOrchestrator {
    pub fn new(callbacks: Arc<CallbackRegistry>, sequence: Vec<String>) -> Self {
        Self {
            core: OrchestratorCore::new(OrchestratorKind::Sequential, callbacks),
            sequence,
        }
    }

    pub fn sequence(&self) -> &[String] {
        &self.sequence
    }
}

#[async_trait]
impl Orchestrator for SequentialOrchestrator {
    fn kind(&self) -> OrchestratorKind {
        OrchestratorKind::Sequential
    }

    async fn register_agent(
        &self,
        name: &str,
        handler: Arc<dyn AgentHandler>,
    ) -> Result<(), OrchestratorError> {
        self.core.agents().register(name, handler).await
    }

    async fn dispatch(&self, ctx: &RunContext, event: &Event) -> Result<AgentResult, OrchestratorError> {
        if self.sequence.is_empty() {
            return Err(OrchestratorError::NoAgentsConfigured { mode: "sequential" });
        }

        let start = Utc::now();
        let state = run_sequence(
            &self.core,
            ctx,
            event,
            &self.sequence,
            State::from_event(event),
        )
        .await?;
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
