//! Event orchestrators
//!
//! An orchestrator maps an incoming [`Event`] to one or more registered
//! [`AgentHandler`]s and aggregates their results.
//!
//! # Strategies
//!
//! - [`RouteOrchestrator`]: single target taken from the `route` metadata key
//! - [`CollaborativeOrchestrator`]: fan-out to every agent, merge the outputs
//! - [`SequentialOrchestrator`]: fixed agent sequence, each fed the previous output
//! - [`LoopOrchestrator`]: one agent repeated until `loop_completed` or the iteration cap
//! - [`MixedOrchestrator`]: collaborative phase followed by a sequential phase
//!
//! Every strategy fires the agent-level hooks (`BeforeAgentRun`,
//! `AfterAgentRun`, `AgentError`) around each handler call. Hook failures are
//! logged and never fail the dispatch.

pub mod collaborative;
pub mod factory;
pub mod loop_mode;
pub mod mixed;
pub mod route;
pub mod sequential;

pub use collaborative::{CollaborativeOrchestrator, CollaborativeOutcome};
pub use factory::{OrchestratorConfig, OrchestratorFactory, OrchestratorKind};
pub use loop_mode::LoopOrchestrator;
pub use mixed::MixedOrchestrator;
pub use route::RouteOrchestrator;
pub use sequential::SequentialOrchestrator;

use agentflow_core::{
    AgentHandler, AgentResult, CallbackArgs, CallbackRegistry, ContextError, Event, HookPoint,
    RunContext, State,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Failure of one agent inside a multi-agent dispatch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentFailure {
    pub agent: String,
    pub error: String,
}

impl fmt::Display for AgentFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.agent, self.error)
    }
}

fn summarize(failures: &[AgentFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Orchestration errors
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("agent '{name}' is already registered")]
    DuplicateAgent { name: String },

    #[error("agent name cannot be empty")]
    EmptyAgentName,

    #[error("event {event_id} has no '{key}' metadata to route on", key = agentflow_core::MetadataKeys::ROUTE)]
    MissingRoute { event_id: String },

    #[error("no agent handler registered for route '{route}' (event {event_id})")]
    UnknownRoute { route: String, event_id: String },

    #[error("agent {agent} failed: {source:#}")]
    AgentFailed {
        agent: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("all {} agents failed: {}", .failures.len(), summarize(.failures))]
    AllAgentsFailed { failures: Vec<AgentFailure> },

    #[error("sequential agent {agent} failed: {source:#}")]
    SequentialStepFailed {
        agent: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("loop agent {agent} failed at iteration {iteration}: {source:#}")]
    LoopIterationFailed {
        agent: String,
        iteration: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("{mode} orchestration has no agents configured")]
    NoAgentsConfigured { mode: &'static str },

    #[error("invalid orchestrator configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("dispatch interrupted: {0}")]
    Cancelled(#[from] ContextError),
}

impl OrchestratorError {
    /// Agent blamed for the failure, when one is known
    pub fn failed_agent(&self) -> Option<&str> {
        match self {
            OrchestratorError::AgentFailed { agent, .. }
            | OrchestratorError::SequentialStepFailed { agent, .. }
            | OrchestratorError::LoopIterationFailed { agent, .. } => Some(agent),
            OrchestratorError::UnknownRoute { route, .. } => Some(route),
            _ => None,
        }
    }
}

/// Capability set shared by all orchestration strategies
#[async_trait]
pub trait Orchestrator: Send + Sync {
    fn kind(&self) -> OrchestratorKind;

    /// Register `handler` under `name`; names are unique per orchestrator
    async fn register_agent(
        &self,
        name: &str,
        handler: Arc<dyn AgentHandler>,
    ) -> Result<(), OrchestratorError>;

    async fn dispatch(&self, ctx: &RunContext, event: &Event) -> Result<AgentResult, OrchestratorError>;

    async fn has_agent(&self, name: &str) -> bool;

    /// Registered handlers sorted by name
    async fn handlers(&self) -> Vec<(String, Arc<dyn AgentHandler>)>;

    /// Release orchestrator resources; safe to call repeatedly
    async fn stop(&self);

    fn callback_registry(&self) -> Arc<CallbackRegistry>;
}

/// Name -> handler map behind a read-preferring lock
#[derive(Default)]
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, Arc<dyn AgentHandler>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(
        &self,
        name: &str,
        handler: Arc<dyn AgentHandler>,
    ) -> Result<(), OrchestratorError> {
        if name.trim().is_empty() {
            return Err(OrchestratorError::EmptyAgentName);
        }

        let mut agents = self.agents.write().await;
        if agents.contains_key(name) {
            return Err(OrchestratorError::DuplicateAgent {
                name: name.to_string(),
            });
        }
        agents.insert(name.to_string(), handler);
        debug!(agent = %name, "Registered agent handler");
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn AgentHandler>> {
        self.agents.read().await.get(name).cloned()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.agents.read().await.contains_key(name)
    }

    pub async fn len(&self) -> usize {
        self.agents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.agents.read().await.is_empty()
    }

    /// Handlers sorted by name; the lock is released before returning
    pub async fn snapshot(&self) -> Vec<(String, Arc<dyn AgentHandler>)> {
        let mut entries: Vec<_> = self
            .agents
            .read()
            .await
            .iter()
            .map(|(name, handler)| (name.clone(), handler.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

impl fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentRegistry").finish_non_exhaustive()
    }
}

/// Run one handler between the agent-level hooks
///
/// `BeforeAgentRun` may rewrite the input state, `AfterAgentRun` may rewrite
/// the output state. `AgentError` fires with the input state when the
/// handler fails; the handler's error is returned unchanged.
pub async fn run_agent_with_hooks(
    callbacks: &CallbackRegistry,
    ctx: &RunContext,
    event: &Event,
    agent: &str,
    handler: &dyn AgentHandler,
    state: State,
) -> anyhow::Result<AgentResult> {
    let before = callbacks
        .invoke(
            CallbackArgs::new(ctx.clone(), HookPoint::BeforeAgentRun, event.clone(), state)
                .with_agent(agent),
        )
        .await;
    if let Some(err) = &before.error {
        warn!(agent = %agent, hook = %HookPoint::BeforeAgentRun, error = %format!("{:#}", err), "Hook failed");
    }
    let input = before.state;

    debug!(agent = %agent, event_id = %event.id(), "Running agent");

    match handler.run(ctx, event, input.clone()).await {
        Ok(mut result) => {
            let after = callbacks
                .invoke(
                    CallbackArgs::new(
                        ctx.clone(),
                        HookPoint::AfterAgentRun,
                        event.clone(),
                        result.output_state.clone(),
                    )
                    .with_agent(agent)
                    .with_result(result.clone()),
                )
                .await;
            if let Some(err) = &after.error {
                warn!(agent = %agent, hook = %HookPoint::AfterAgentRun, error = %format!("{:#}", err), "Hook failed");
            }
            result.output_state = after.state;
            Ok(result)
        }
        Err(err) => {
            let hook = callbacks
                .invoke(
                    CallbackArgs::new(ctx.clone(), HookPoint::AgentError, event.clone(), input)
                        .with_agent(agent)
                        .with_error(format!("{:#}", err)),
                )
                .await;
            if let Some(hook_err) = &hook.error {
                warn!(agent = %agent, hook = %HookPoint::AgentError, error = %format!("{:#}", hook_err), "Hook failed");
            }
            Err(err)
        }
    }
}

/// Registry and callbacks shared by every strategy
pub(crate) struct OrchestratorCore {
    kind: OrchestratorKind,
    agents: AgentRegistry,
    callbacks: Arc<CallbackRegistry>,
}

impl OrchestratorCore {
    pub(crate) fn new(kind: OrchestratorKind, callbacks: Arc<CallbackRegistry>) -> Self {
        Self {
            kind,
            agents: AgentRegistry::new(),
            callbacks,
        }
    }

    pub(crate) fn agents(&self) -> &AgentRegistry {
        &self.agents
    }

    pub(crate) fn callbacks(&self) -> &Arc<CallbackRegistry> {
        &self.callbacks
    }

    pub(crate) async fn run_agent(
        &self,
        ctx: &RunContext,
        event: &Event,
        agent: &str,
        handler: &dyn AgentHandler,
        state: State,
    ) -> anyhow::Result<AgentResult> {
        run_agent_with_hooks(&self.callbacks, ctx, event, agent, handler, state).await
    }

    pub(crate) fn stop(&self) {
        info!(orchestrator = %self.kind, "Orchestrator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentflow_core::{handler_fn, noop_handler, EventData};
    use parking_lot::Mutex;
    use serde_json::json;

    #[tokio::test]
    async fn test_registry_rejects_duplicates_and_empty_names() {
        let registry = AgentRegistry::new();
        registry
            .register("planner", noop_handler())
            .await
            .expect("first registration");

        assert!(matches!(
            registry.register("planner", noop_handler()).await,
            Err(OrchestratorError::DuplicateAgent { .. })
        ));
        assert!(matches!(
            registry.register(" ", noop_handler()).await,
            Err(OrchestratorError::EmptyAgentName)
        ));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_snapshot_is_sorted() {
        let registry = AgentRegistry::new();
        for name in ["writer", "analyst", "critic"] {
            registry.register(name, noop_handler()).await.expect("register");
        }
        let names: Vec<_> = registry.snapshot().await.into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["analyst", "critic", "writer"]);
    }

    #[tokio::test]
    async fn test_hooks_wrap_successful_run() {
        let callbacks = CallbackRegistry::new();
        callbacks
            .register(HookPoint::BeforeAgentRun, "seed", |args: CallbackArgs| async move {
                let mut state = args.state;
                state.set("seeded", true);
                Ok::<_, anyhow::Error>(Some(state))
            })
            .expect("register before");
        callbacks
            .register(HookPoint::AfterAgentRun, "stamp", |args: CallbackArgs| async move {
                assert_eq!(args.agent_id, "echo");
                assert!(args.agent_result.is_some());
                let mut state = args.state;
                state.set_meta("stamped", "yes");
                Ok::<_, anyhow::Error>(Some(state))
            })
            .expect("register after");

        let handler = handler_fn(|_ctx, _event, mut state| async move {
            assert_eq!(state.get("seeded"), Some(&json!(true)));
            state.set("echoed", true);
            Ok(AgentResult::new(state))
        });

        let result = run_agent_with_hooks(
            &callbacks,
            &RunContext::background(),
            &Event::routed("echo", EventData::new()),
            "echo",
            handler.as_ref(),
            State::new(),
        )
        .await
        .expect("run succeeds");

        assert_eq!(result.output_state.get("echoed"), Some(&json!(true)));
        assert_eq!(result.output_state.get_meta("stamped"), Some("yes"));
    }

    #[tokio::test]
    async fn test_agent_error_hook_sees_failure_and_hook_errors_are_not_fatal() {
        let callbacks = CallbackRegistry::new();
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        callbacks
            .register(HookPoint::AgentError, "capture", move |args: CallbackArgs| {
                let sink = sink.clone();
                async move {
                    *sink.lock() = args.error.clone();
                    Ok::<Option<State>, anyhow::Error>(None)
                }
            })
            .expect("register error hook");
        callbacks
            .register(HookPoint::BeforeAgentRun, "broken", |_args: CallbackArgs| async {
                Err::<Option<State>, _>(anyhow::anyhow!("hook exploded"))
            })
            .expect("register before");

        let handler = handler_fn(|_ctx, _event, _state| async move {
            Err::<AgentResult, _>(anyhow::anyhow!("model overloaded"))
        });

        let err = run_agent_with_hooks(
            &callbacks,
            &RunContext::background(),
            &Event::routed("llm", EventData::new()),
            "llm",
            handler.as_ref(),
            State::new(),
        )
        .await
        .expect_err("handler fails");

        assert_eq!(err.to_string(), "model overloaded");
        assert_eq!(seen.lock().as_deref(), Some("model overloaded"));
    }

    #[test]
    fn test_all_agents_failed_lists_every_failure() {
        let err = OrchestratorError::AllAgentsFailed {
            failures: vec![
                AgentFailure {
                    agent: "a".to_string(),
                    error: "timeout".to_string(),
                },
                AgentFailure {
                    agent: "b".to_string(),
                    error: "invalid input".to_string(),
                },
            ],
        };
        assert_eq!(
            err.to_string(),
            "all 2 agents failed: a: timeout; b: invalid input"
        );
        assert!(err.failed_agent().is_none());
    }
}
