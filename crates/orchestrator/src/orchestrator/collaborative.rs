//! Fan-out to every registered agent, fan-in by state merge

use super::{
    run_agent_with_hooks, AgentFailure, Orchestrator, OrchestratorCore, OrchestratorError,
    OrchestratorKind,
};
use agentflow_core::{AgentHandler, AgentResult, CallbackRegistry, Event, RunContext, State};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Merged result of a collaborative dispatch plus the agents that failed
#[derive(Debug, Clone, Serialize)]
pub struct CollaborativeOutcome {
    pub result: AgentResult,
    pub failures: Vec<AgentFailure>,
}

pub(crate) struct FanOut {
    pub merged: State,
    pub succeeded: usize,
    pub failures: Vec<AgentFailure>,
}

/// Run `handlers` concurrently, each on its own copy of `base`
///
/// Successful outputs are merged into an empty state in completion order.
/// Every task is awaited; a panicking agent counts as a failure.
pub(crate) async fn fan_out(
    callbacks: &Arc<CallbackRegistry>,
    ctx: &RunContext,
    event: &Event,
    handlers: Vec<(String, Arc<dyn AgentHandler>)>,
    base: &State,
) -> FanOut {
    let mut pending: BTreeSet<String> = BTreeSet::new();
    let mut tasks = JoinSet::new();

    for (name, handler) in handlers {
        pending.insert(name.clone());
        let callbacks = callbacks.clone();
        let ctx = ctx.clone();
        let event = event.clone();
        let state = base.clone();

        tasks.spawn(async move {
            let result =
                run_agent_with_hooks(&callbacks, &ctx, &event, &name, handler.as_ref(), state).await;
            (name, result)
        });
    }

    let mut merged = State::new();
    let mut succeeded = 0;
    let mut failures = Vec::new();

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((name, Ok(result))) => {
                pending.remove(&name);
                debug!(agent = %name, "Collaborative agent completed");
                merged.merge(&result.output_state);
                succeeded += 1;
            }
            Ok((name, Err(err))) => {
                pending.remove(&name);
                failures.push(AgentFailure {
                    agent: name,
                    error: format!("{:#}", err),
                });
            }
            Err(join_err) => {
                warn!(error = %join_err, "Collaborative agent task aborted");
            }
        }
    }

    // Tasks that never reported back panicked or were aborted
    for name in pending {
        failures.push(AgentFailure {
            agent: name,
            error: "agent task panicked".to_string(),
        });
    }

    FanOut {
        merged,
        succeeded,
        failures,
    }
}

/// Broadcasts each event to all registered agents
pub struct CollaborativeOrchestrator {
    core: OrchestratorCore,
}

impl CollaborativeOrchestrator {
    pub fn new(callbacks: Arc<CallbackRegistry>) -> Self {
        Self {
            core: OrchestratorCore::new(OrchestratorKind::Collaborative, callbacks),
        }
    }

    /// Dispatch and report per-agent failures next to the merged result
    ///
    /// Fails when no agents are registered or when every agent failed.
    pub async fn dispatch_with_outcomes(
        &self,
        ctx: &RunContext,
        event: &Event,
    ) -> Result<CollaborativeOutcome, OrchestratorError> {
        let start = Utc::now();
        let handlers = self.core.agents().snapshot().await;

        if handlers.is_empty() {
            warn!(event_id = %event.id(), "Collaborative dispatch with no registered agents");
            return Err(OrchestratorError::NoAgentsConfigured {
                mode: "collaborative",
            });
        }

        let total = handlers.len();
        debug!(event_id = %event.id(), agents = total, "Broadcasting event");

        let outcome = fan_out(
            self.core.callbacks(),
            ctx,
            event,
            handlers,
            &State::from_event(event),
        )
        .await;

        if outcome.succeeded == 0 {
            return Err(OrchestratorError::AllAgentsFailed {
                failures: outcome.failures,
            });
        }

        for failure in &outcome.failures {
            warn!(
                agent = %failure.agent,
                error = %failure.error,
                event_id = %event.id(),
                "Collaborative agent failed, continuing with partial results"
            );
        }

        debug!(
            event_id = %event.id(),
            succeeded = outcome.succeeded,
            failed = outcome.failures.len(),
            "Collaborative dispatch merged"
        );

        Ok(CollaborativeOutcome {
            result: AgentResult::completed(outcome.merged, start),
            failures: outcome.failures,
        })
    }
}

#[async_trait]
impl Orchestrator for CollaborativeOrchestrator {
    fn kind(&self) -> OrchestratorKind {
        OrchestratorKind::Collaborative
    }

    async fn register_agent(
        &self,
        name: &str,
        handler: Arc<dyn AgentHandler>,
    ) -> Result<(), OrchestratorError> {
        self.core.agents().register(name, handler).await
    }

    async fn dispatch(&self, ctx: &RunContext, event: &Event) -> Result<AgentResult, OrchestratorError> {
        self.dispatch_with_outcomes(ctx, event)
            .await
            .map(|outcome| outcome.result)
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
