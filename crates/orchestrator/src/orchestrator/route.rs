//! Single-target dispatch by the `route` metadata key

use super::{Orchestrator, OrchestratorCore, OrchestratorError, OrchestratorKind};
use agentflow_core::{AgentHandler, AgentResult, CallbackRegistry, Event, RunContext, State};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

/// Dispatches each event to exactly the agent named by its route
pub struct RouteOrchestrator {
    core: OrchestratorCore,
}

impl RouteOrchestrator {
    pub fn new(callbacks: Arc<CallbackRegistry>) -> Self {
        Self {
            core: OrchestratorCore::new(OrchestratorKind::Route, callbacks),
        }
    }
}

#[async_trait]
impl Orchestrator for RouteOrchestrator {
    fn kind(&self) -> OrchestratorKind {
        OrchestratorKind::Route
    }

    async fn register_agent(
        &self,
        name: &str,
        handler: Arc<dyn AgentHandler>,
    ) -> Result<(), OrchestratorError> {
        self.core.agents().register(name, handler).await
    }

    async fn dispatch(&self, ctx: &RunContext, event: &Event) -> Result<AgentResult, OrchestratorError> {
        let route = event
            .route()
            .filter(|route| !route.is_empty())
            .ok_or_else(|| OrchestratorError::MissingRoute {
                event_id: event.id(),
            })?;

        let handler = match self.core.agents().get(&route).await {
            Some(handler) => handler,
            None => {
                warn!(route = %route, event_id = %event.id(), "No handler registered for route");
                return Err(OrchestratorError::UnknownRoute {
                    route,
                    event_id: event.id(),
                });
            }
        };

        if let Some(reason) = ctx.err() {
            return Err(OrchestratorError::Cancelled(reason));
        }

        debug!(route = %route, event_id = %event.id(), "Routing event");

        self.core
            .run_agent(ctx, event, &route, handler.as_ref(), State::from_event(event))
            .await
            .map_err(|source| OrchestratorError::AgentFailed {
                agent: route,
                source,
            })
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
