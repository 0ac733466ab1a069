//! Agent orchestration runtime
//!
//! This crate dispatches events to agents and keeps the system running when
//! agents fail. It builds on the model in `agentflow-core`.
//!
//! # Architecture
//!
//! - **Orchestrator**: routes an event to one agent (route), all agents
//!   (collaborative), a pipeline (sequential), a repeated agent (loop) or a
//!   fan-out followed by a pipeline (mixed)
//! - **Runner**: bounded event queue with a single dispatch loop, lifecycle
//!   hooks, follow-up events and error routing
//! - **Composition**: parallel, sequential and loop composite agents plus a builder
//! - **Reliability**: circuit breakers and a retrier with jittered backoff
//! - **Error routing**: classification, recovery action and handler selection
//! - **Trace**: per-session record of every hook invocation
//!
//! # Usage
//!
//! ```no_run
//! use agentflow_core::{handler_fn, AgentResult, Event, EventData, RunContext};
//! use agentflow_orchestrator::{OrchestratorConfig, OrchestratorFactory, Runner, RunnerConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let orchestrator = OrchestratorFactory::default().create(&OrchestratorConfig::route())?;
//!     let runner = Runner::new(orchestrator, RunnerConfig::default());
//!
//!     runner
//!         .register_agent(
//!             "summarizer",
//!             handler_fn(|_ctx, _event, mut state| async move {
//!                 state.set("summary", "short");
//!                 Ok(AgentResult::new(state))
//!             }),
//!         )
//!         .await?;
//!
//!     runner.start(&RunContext::background()).await?;
//!     runner.emit(Event::routed("summarizer", EventData::new())).await?;
//!     runner.stop().await;
//!     Ok(())
//! }
//! ```

pub mod composition;
pub mod config;
pub mod error_routing;
pub mod orchestrator;
pub mod reliability;
pub mod runner;
pub mod trace;

pub use composition::{
    create_conditional_loop, create_parallel_workflow, create_processing_pipeline,
    create_sequential_workflow, CompositionBuilder, CompositionError, CompositionFailure,
    CompositionMode, ErrorStrategy, LoopAgent, LoopCondition, MultiAgentConfig, ParallelAgent,
    SequentialAgent, StateStrategy,
};
pub use config::{ConfigError, RuntimeConfig};
pub use error_routing::{
    categorize_error, categorize_message, create_error_event, determine_error_handler,
    determine_recovery_action, increment_retry_count, is_retryable_error, ErrorClass, ErrorCode,
    ErrorEventData, ErrorRouterConfig, ErrorSeverity, RecoveryAction,
};
pub use orchestrator::{
    run_agent_with_hooks, AgentFailure, AgentRegistry, CollaborativeOrchestrator,
    CollaborativeOutcome, LoopOrchestrator, MixedOrchestrator, Orchestrator, OrchestratorConfig,
    OrchestratorError, OrchestratorFactory, OrchestratorKind, RouteOrchestrator,
    SequentialOrchestrator,
};
pub use reliability::{
    BreakerCallError, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError,
    CircuitBreakerMetrics, CircuitBreakerRegistry, CircuitState, Retrier, RetryError,
    RetryOutcome, RetryPolicy,
};
pub use runner::{Runner, RunnerConfig, RunnerError};
pub use trace::{
    register_trace_hooks, InMemoryTraceLogger, NoopTraceLogger, TraceEntry, TraceKind, TraceLogger,
};
