//! Agent contracts and adapters
//!
//! [`Agent`] is the composable unit (state in, state out). [`AgentHandler`] is
//! what orchestrators dispatch events to. [`AgentAdapter`] lifts any agent into
//! a handler and [`AgentHandlerFn`] wraps plain async closures.

use crate::context::RunContext;
use crate::domain::{AgentResult, State};
use crate::events::Event;
use crate::*;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

/// Unit of work transforming a [`State`]
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, ctx: &RunContext, state: State) -> anyhow::Result<State>;
}

/// Optional setup/teardown capability of a handler
#[async_trait]
pub trait AgentLifecycle: Send + Sync {
    async fn initialize(&self) -> anyhow::Result<()>;

    async fn shutdown(&self) -> anyhow::Result<()>;
}

/// Event-driven agent registered with an orchestrator
#[async_trait]
pub trait AgentHandler: Send + Sync {
    async fn run(&self, ctx: &RunContext, event: &Event, state: State) -> anyhow::Result<AgentResult>;

    /// Lifecycle capability, when the handler has one
    fn lifecycle(&self) -> Option<&dyn AgentLifecycle> {
        None
    }
}

/// Handler backed by an async closure
pub struct AgentHandlerFn<F> {
    func: F,
}

impl<F, Fut> AgentHandlerFn<F>
where
    F: Fn(RunContext, Event, State) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<AgentResult>> + Send,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F, Fut> AgentHandler for AgentHandlerFn<F>
where
    F: Fn(RunContext, Event, State) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<AgentResult>> + Send,
{
    async fn run(&self, ctx: &RunContext, event: &Event, state: State) -> anyhow::Result<AgentResult> {
        (self.func)(ctx.clone(), event.clone(), state).await
    }
}

/// Shared handler from an async closure
pub fn handler_fn<F, Fut>(func: F) -> Arc<dyn AgentHandler>
where
    F: Fn(RunContext, Event, State) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<AgentResult>> + Send + 'static,
{
    Arc::new(AgentHandlerFn::new(func))
}

/// Handler that returns its input state untouched
pub fn noop_handler() -> Arc<dyn AgentHandler> {
    handler_fn(|_ctx, _event, state| async move { Ok(AgentResult::new(state)) })
}

/// Named agent backed by an async closure
pub struct FnAgent<F> {
    name: String,
    func: F,
}

impl<F, Fut> FnAgent<F>
where
    F: Fn(RunContext, State) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<State>> + Send,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

#[async_trait]
impl<F, Fut> Agent for FnAgent<F>
where
    F: Fn(RunContext, State) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<State>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &RunContext, state: State) -> anyhow::Result<State> {
        (self.func)(ctx.clone(), state).await
    }
}

/// Shared agent from an async closure
pub fn agent_fn<F, Fut>(name: impl Into<String>, func: F) -> Arc<dyn Agent>
where
    F: Fn(RunContext, State) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<State>> + Send + 'static,
{
    Arc::new(FnAgent::new(name, func))
}

/// Exposes an [`Agent`] as an [`AgentHandler`], timing each run
pub struct AgentAdapter {
    agent: Arc<dyn Agent>,
    lifecycle: Option<Arc<dyn AgentLifecycle>>,
}

impl AgentAdapter {
    pub fn new(agent: Arc<dyn Agent>) -> Self {
        Self {
            agent,
            lifecycle: None,
        }
    }

    /// Attach setup/teardown hooks run by the runner
    pub fn with_lifecycle(mut self, lifecycle: Arc<dyn AgentLifecycle>) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    pub fn into_handler(self) -> Arc<dyn AgentHandler> {
        Arc::new(self)
    }

    pub fn agent(&self) -> &Arc<dyn Agent> {
        &self.agent
    }
}

#[async_trait]
impl AgentHandler for AgentAdapter {
    async fn run(&self, ctx: &RunContext, event: &Event, state: State) -> anyhow::Result<AgentResult> {
        let start = Utc::now();
        let name = self.agent.name().to_string();

        debug!(agent = %name, event_id = %event.id(), "Running agent");

        match self.agent.run(ctx, state).await {
            Ok(output) => {
                let result = AgentResult::completed(output, start);
                debug!(
                    agent = %name,
                    duration_ms = result.duration.as_millis() as u64,
                    "Agent completed"
                );
                Ok(result)
            }
            Err(err) => {
                debug!(agent = %name, error = %format!("{:#}", err), "Agent failed");
                Err(err)
            }
        }
    }

    fn lifecycle(&self) -> Option<&dyn AgentLifecycle> {
        self.lifecycle.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventData, EventMetadata};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn event() -> Event {
        Event::new("agent", EventData::new(), EventMetadata::new())
    }

    #[tokio::test]
    async fn test_handler_fn_receives_state() {
        let handler = handler_fn(|_ctx, event, mut state| async move {
            state.set("seen", event.target_agent_id());
            Ok(AgentResult::new(state))
        });

        let result = handler
            .run(&RunContext::background(), &event(), State::new())
            .await
            .expect("handler succeeds");

        assert_eq!(result.output_state.get("seen"), Some(&json!("agent")));
        assert!(handler.lifecycle().is_none());
    }

    #[tokio::test]
    async fn test_adapter_times_successful_run() {
        let agent = agent_fn("doubler", |_ctx, mut state| async move {
            let value = state.get("n").and_then(|v| v.as_i64()).unwrap_or(0);
            state.set("n", value * 2);
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            Ok(state)
        });
        let handler = AgentAdapter::new(agent).into_handler();

        let mut input = State::new();
        input.set("n", 21);
        let result = handler
            .run(&RunContext::background(), &event(), input)
            .await
            .expect("adapter succeeds");

        assert_eq!(result.output_state.get("n"), Some(&json!(42)));
        assert!(result.is_success());
        assert!(result.end_time >= result.start_time);
    }

    #[tokio::test]
    async fn test_adapter_propagates_failure() {
        let agent = agent_fn("broken", |_ctx, _state| async move {
            Err::<State, _>(anyhow::anyhow!("validation failed: missing field"))
        });
        let handler = AgentAdapter::new(agent).into_handler();

        let err = handler
            .run(&RunContext::background(), &event(), State::new())
            .await
            .expect_err("adapter fails");
        assert!(err.to_string().contains("validation failed"));
    }

    struct CountingLifecycle {
        initialized: AtomicU32,
    }

    #[async_trait]
    impl AgentLifecycle for CountingLifecycle {
        async fn initialize(&self) -> anyhow::Result<()> {
            self.initialized.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn shutdown(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_adapter_exposes_lifecycle() {
        let lifecycle = Arc::new(CountingLifecycle {
            initialized: AtomicU32::new(0),
        });
        let agent = agent_fn("stateful", |_ctx, state| async move { Ok(state) });
        let handler = AgentAdapter::new(agent)
            .with_lifecycle(lifecycle.clone())
            .into_handler();

        let capability = handler.lifecycle().expect("lifecycle attached");
        capability.initialize().await.expect("initialize");

        assert_eq!(lifecycle.initialized.load(Ordering::SeqCst), 1);
    }
}
