//! Runner Integration Tests
//!
//! Drives complete event flows through the runner:
//! - Route dispatch, follow-up chains and session persistence
//! - Collaborative and sequential orchestration behind the queue
//! - Error routing and circuit breaking for failing agents
//! - Agent lifecycle management and execution tracing
//! - Runtime configuration loaded from disk

use agentflow_common::init_test_logging;
use agentflow_core::{
    handler_fn, AgentHandler, AgentLifecycle, AgentResult, Event, EventData, MemorySessionStore,
    MetadataKeys, RunContext, SessionStore, State,
};
use agentflow_orchestrator::{
    CircuitBreakerConfig, CircuitState, ErrorRouterConfig, InMemoryTraceLogger, OrchestratorConfig,
    OrchestratorFactory, Runner, RunnerConfig, RuntimeConfig, TraceKind,
};
use anyhow::Result;
use async_trait::async_trait;
use mockall::mock;
use once_cell::sync::Lazy;
use serde_json::json;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

static TRACING: Lazy<()> = Lazy::new(init_test_logging);

mock! {
    pub Handler {}

    #[async_trait]
    impl AgentHandler for Handler {
        async fn run(&self, ctx: &RunContext, event: &Event, state: State) -> anyhow::Result<AgentResult>;
    }
}

fn runner_for(config: OrchestratorConfig, runner_config: RunnerConfig) -> Result<Runner> {
    Lazy::force(&TRACING);
    let orchestrator = OrchestratorFactory::default().create(&config)?;
    Ok(Runner::new(orchestrator, runner_config))
}

fn counting(counter: Arc<AtomicU32>, key: &'static str) -> Arc<dyn AgentHandler> {
    handler_fn(move |_ctx, _event, mut state| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            state.set(key, true);
            Ok(AgentResult::new(state))
        }
    })
}

async fn wait_for_count(counter: &AtomicU32, expected: u32) {
    for _ in 0..400 {
        if counter.load(Ordering::SeqCst) >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!(
        "counter stuck at {}, expected {}",
        counter.load(Ordering::SeqCst),
        expected
    );
}

async fn wait_for_session<F>(store: &MemorySessionStore, session_id: &str, done: F) -> State
where
    F: Fn(&State) -> bool,
{
    for _ in 0..400 {
        if let Ok(session) = store.get_session(session_id).await {
            if done(&session.state) {
                return session.state;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("session {session_id} never reached the expected state");
}

fn event_in_session(route: &str, session_id: &str) -> Event {
    let event = Event::routed(route, EventData::new());
    event.set_metadata(MetadataKeys::SESSION_ID, session_id);
    event
}

/// Test that a routed event reaches its agent exactly once
#[tokio::test]
async fn test_route_dispatches_exactly_once() -> Result<()> {
    let mut handler = MockHandler::new();
    handler
        .expect_run()
        .times(1)
        .withf(|_ctx, event, _state| event.data_value("prompt") == Some(json!("hello")))
        .returning(|_ctx, _event, mut state| {
            state.set("reply", "hi");
            Ok(AgentResult::new(state))
        });

    let runner = runner_for(OrchestratorConfig::route(), RunnerConfig::default())?;
    let store = Arc::new(MemorySessionStore::new());
    let runner = runner.with_session_store(store.clone());
    runner.register_agent("greeter", Arc::new(handler)).await?;

    runner.start(&RunContext::background()).await?;
    let event = event_in_session("greeter", "s-once");
    event.set_data("prompt", "hello");
    runner.emit(event).await?;

    let state = wait_for_session(&store, "s-once", |state| state.get("reply").is_some()).await;
    assert_eq!(state.get("prompt"), Some(&json!("hello")));

    // Mock expectations are verified on drop, after the loop is gone
    runner.stop().await;
    Ok(())
}

/// Test a three step chain driven by route metadata
#[tokio::test]
async fn test_follow_up_chain_persists_session() -> Result<()> {
    let runner = runner_for(OrchestratorConfig::route(), RunnerConfig::default())?;
    let store = Arc::new(MemorySessionStore::new());
    let runner = runner.with_session_store(store.clone());

    runner
        .register_agent(
            "planner",
            handler_fn(|_ctx, _event, mut state| async move {
                state.set("plan", "outline");
                state.set_meta(MetadataKeys::ROUTE, "writer");
                Ok(AgentResult::new(state))
            }),
        )
        .await?;
    runner
        .register_agent(
            "writer",
            handler_fn(|_ctx, event, mut state| async move {
                assert_eq!(event.source_agent_id(), "planner");
                assert_eq!(state.get("plan"), Some(&json!("outline")));
                state.set("draft", "first draft");
                state.set_meta(MetadataKeys::ROUTE, "reviewer");
                Ok(AgentResult::new(state))
            }),
        )
        .await?;
    runner
        .register_agent(
            "reviewer",
            handler_fn(|_ctx, _event, mut state| async move {
                state.set("approved", true);
                Ok(AgentResult::new(state))
            }),
        )
        .await?;

    runner.start(&RunContext::background()).await?;
    runner.emit(event_in_session("planner", "s-chain")).await?;

    let state = wait_for_session(&store, "s-chain", |state| state.get("approved").is_some()).await;
    assert_eq!(state.get("plan"), Some(&json!("outline")));
    assert_eq!(state.get("draft"), Some(&json!("first draft")));
    assert_eq!(state.get_meta(MetadataKeys::SESSION_ID), Some("s-chain"));

    runner.stop().await;
    Ok(())
}

/// Test that collaborative dispatch merges every agent's output
#[tokio::test]
async fn test_collaborative_runner_merges_outputs() -> Result<()> {
    let runner = runner_for(OrchestratorConfig::collaborative(), RunnerConfig::default())?;
    let store = Arc::new(MemorySessionStore::new());
    let runner = runner.with_session_store(store.clone());

    let calls = Arc::new(AtomicU32::new(0));
    runner.register_agent("web", counting(calls.clone(), "web")).await?;
    runner.register_agent("papers", counting(calls.clone(), "papers")).await?;
    runner.register_agent("notes", counting(calls.clone(), "notes")).await?;

    runner.start(&RunContext::background()).await?;
    runner.emit(event_in_session("research", "s-collab")).await?;

    let state = wait_for_session(&store, "s-collab", |state| state.get("notes").is_some()).await;
    assert_eq!(state.get("web"), Some(&json!(true)));
    assert_eq!(state.get("papers"), Some(&json!(true)));
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    runner.stop().await;
    Ok(())
}

/// Test that a failing agent trips its breaker and later events are rejected
#[tokio::test]
async fn test_circuit_breaker_opens_for_failing_agent() -> Result<()> {
    let mut config = RunnerConfig::default();
    config.error_router = ErrorRouterConfig::minimal("error-handler");
    config.circuit_breaker = CircuitBreakerConfig {
        failure_threshold: 2,
        reset_timeout: Duration::from_secs(60),
        ..CircuitBreakerConfig::default()
    };
    let runner = runner_for(OrchestratorConfig::route(), config)?;

    let attempts = Arc::new(AtomicU32::new(0));
    let attempt_counter = attempts.clone();
    runner
        .register_agent(
            "flaky",
            handler_fn(move |_ctx, _event, _state| {
                let attempts = attempt_counter.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err::<AgentResult, _>(anyhow::anyhow!("upstream service unavailable"))
                }
            }),
        )
        .await?;
    let handled = Arc::new(AtomicU32::new(0));
    runner
        .register_agent("error-handler", counting(handled.clone(), "handled"))
        .await?;

    runner.start(&RunContext::background()).await?;
    for _ in 0..3 {
        runner.emit(Event::routed("flaky", EventData::new())).await?;
    }

    wait_for_count(&handled, 3).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 2);

    let breaker = runner
        .circuit_breakers()
        .get("flaky")
        .expect("breaker created on first dispatch");
    assert_eq!(breaker.state(), CircuitState::Open);

    runner.stop().await;
    Ok(())
}

/// Test that failed events are retried up to the router's limit
#[tokio::test]
async fn test_retry_until_success() -> Result<()> {
    let mut config = RunnerConfig::default();
    config.retry_failed_events = true;
    config.error_router = ErrorRouterConfig {
        retry_delay_ms: 10,
        enable_circuit_breaker: false,
        ..ErrorRouterConfig::minimal("error-handler")
    };
    let runner = runner_for(OrchestratorConfig::route(), config)?;
    let store = Arc::new(MemorySessionStore::new());
    let runner = runner.with_session_store(store.clone());

    let attempts = Arc::new(AtomicU32::new(0));
    let attempt_counter = attempts.clone();
    runner
        .register_agent(
            "summarizer",
            handler_fn(move |_ctx, event, mut state| {
                let attempts = attempt_counter.clone();
                async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                        return Err(anyhow::anyhow!("request timeout"));
                    }
                    state.set("retries_seen", event.metadata_value(MetadataKeys::RETRY_COUNT));
                    Ok(AgentResult::new(state))
                }
            }),
        )
        .await?;

    runner.start(&RunContext::background()).await?;
    runner.emit(event_in_session("summarizer", "s-retry")).await?;

    let state = wait_for_session(&store, "s-retry", |state| state.get("retries_seen").is_some()).await;
    assert_eq!(state.get("retries_seen"), Some(&json!("2")));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    runner.stop().await;
    Ok(())
}

struct LifecycleAgent {
    initialized: AtomicBool,
    shut_down: AtomicBool,
}

#[async_trait]
impl AgentLifecycle for LifecycleAgent {
    async fn initialize(&self) -> anyhow::Result<()> {
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        self.shut_down.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl AgentHandler for LifecycleAgent {
    async fn run(&self, _ctx: &RunContext, _event: &Event, state: State) -> anyhow::Result<AgentResult> {
        Ok(AgentResult::new(state))
    }

    fn lifecycle(&self) -> Option<&dyn AgentLifecycle> {
        Some(self)
    }
}

/// Test that start and stop drive agent lifecycles
#[tokio::test]
async fn test_agent_lifecycle_follows_runner() -> Result<()> {
    let agent = Arc::new(LifecycleAgent {
        initialized: AtomicBool::new(false),
        shut_down: AtomicBool::new(false),
    });
    let runner = runner_for(OrchestratorConfig::route(), RunnerConfig::default())?;
    runner.register_agent("indexer", agent.clone()).await?;

    assert!(!agent.initialized.load(Ordering::SeqCst));
    runner.start(&RunContext::background()).await?;
    assert!(agent.initialized.load(Ordering::SeqCst));
    assert!(!agent.shut_down.load(Ordering::SeqCst));

    runner.stop().await;
    assert!(agent.shut_down.load(Ordering::SeqCst));
    Ok(())
}

/// Test that a cancelled parent context stops the dispatch loop
#[tokio::test]
async fn test_parent_cancellation_stops_processing() -> Result<()> {
    let runner = runner_for(OrchestratorConfig::route(), RunnerConfig::default())?;
    let calls = Arc::new(AtomicU32::new(0));
    runner.register_agent("worker", counting(calls.clone(), "done")).await?;

    let parent = RunContext::background();
    runner.start(&parent).await?;
    runner.emit(Event::routed("worker", EventData::new())).await?;
    wait_for_count(&calls, 1).await;

    parent.cancel();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let _ = runner.try_emit(Event::routed("worker", EventData::new()));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    runner.stop().await;
    Ok(())
}

/// Test that every hook of a dispatch lands in the session trace
#[tokio::test]
async fn test_trace_records_full_dispatch() -> Result<()> {
    let logger = Arc::new(InMemoryTraceLogger::new());
    let runner = runner_for(OrchestratorConfig::route(), RunnerConfig::default())?
        .with_trace_logger(logger.clone())?;
    let calls = Arc::new(AtomicU32::new(0));
    runner.register_agent("writer", counting(calls.clone(), "written")).await?;

    runner.start(&RunContext::background()).await?;
    runner.emit(event_in_session("writer", "s-trace")).await?;

    let mut kinds = Vec::new();
    for _ in 0..400 {
        kinds = runner
            .dump_trace("s-trace")?
            .into_iter()
            .map(|entry| entry.kind)
            .collect::<Vec<_>>();
        if kinds.contains(&TraceKind::EventEnd) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(
        kinds,
        vec![
            TraceKind::EventStart,
            TraceKind::AgentStart,
            TraceKind::AgentEnd,
            TraceKind::EventEnd
        ]
    );
    assert_eq!(logger.session_ids(), vec!["s-trace".to_string()]);

    runner.stop().await;
    Ok(())
}

/// Test a sequential pipeline configured from a JSON file
#[tokio::test]
async fn test_runtime_config_from_file() -> Result<()> {
    let mut file = tempfile::NamedTempFile::new()?;
    write!(
        file,
        r#"{{
            "runner": {{"queue_size": 16, "emit_timeout_ms": 250}},
            "orchestrator": {{"kind": "sequential", "sequence": ["draft", "review"]}}
        }}"#
    )?;

    let config = RuntimeConfig::from_file(file.path())?;
    assert_eq!(config.runner.queue.queue_size, 16);

    let runner = runner_for(config.orchestrator.clone(), config.runner.clone())?;
    let store = Arc::new(MemorySessionStore::new());
    let runner = runner.with_session_store(store.clone());
    runner
        .register_agent(
            "draft",
            handler_fn(|_ctx, _event, mut state| async move {
                state.set("text", "draft");
                Ok(AgentResult::new(state))
            }),
        )
        .await?;
    runner
        .register_agent(
            "review",
            handler_fn(|_ctx, _event, mut state| async move {
                let text = state
                    .get("text")
                    .and_then(|value| value.as_str())
                    .unwrap_or_default()
                    .to_string();
                state.set("text", format!("{text} (reviewed)"));
                Ok(AgentResult::new(state))
            }),
        )
        .await?;

    runner.start(&RunContext::background()).await?;
    runner.emit(event_in_session("draft", "s-config")).await?;

    let state = wait_for_session(&store, "s-config", |state| state.get("text").is_some()).await;
    assert_eq!(state.get("text"), Some(&json!("draft (reviewed)")));

    runner.stop().await;
    Ok(())
}
