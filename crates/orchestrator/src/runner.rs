//! Event runner: bounded queue, single dispatch loop and failure routing
//!
//! Every dequeued event goes through
//! `BeforeEventHandling -> Orchestrator::dispatch -> error routing -> AfterEventHandling`.
//! Successful results that name a next route are re-enqueued as follow-up
//! events; failures become error events addressed to an error handler, or
//! are retried when automatic retry is enabled.

use crate::error_routing::{
    build_error_event, create_error_event, increment_retry_count, ErrorRouterConfig,
    RecoveryAction,
};
use crate::orchestrator::{Orchestrator, OrchestratorError};
use crate::reliability::{BreakerCallError, CircuitBreakerConfig, CircuitBreakerRegistry};
use crate::trace::{register_trace_hooks, TraceEntry, TraceLogger};
use agentflow_common::{OperationTimer, QueueConfigBase};
use agentflow_core::{
    noop_handler, AgentHandler, AgentResult, Callback, CallbackArgs, CallbackRegistry, CoreError,
    Event, EventData, EventMetadata, EventStatus, HookPoint, MetadataKeys, RunContext, Session,
    SessionStore, State,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Target reported when an event names no agent
pub const UNKNOWN_AGENT: &str = "unknown";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Queue capacity and emit timeout; an emit timeout of 0 makes `emit` non-blocking
    #[serde(flatten)]
    pub queue: QueueConfigBase,
    /// Re-enqueue failed events whose recovery action is Retry
    pub retry_failed_events: bool,
    pub error_router: ErrorRouterConfig,
    /// Per-target breaker settings, used when the router enables breakers
    pub circuit_breaker: CircuitBreakerConfig,
}

impl RunnerConfig {
    pub fn with_queue(queue: QueueConfigBase) -> Self {
        Self {
            queue,
            ..Self::default()
        }
    }
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("runner is not running")]
    NotRunning,

    #[error("runner already started")]
    AlreadyStarted,

    #[error("event queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("runner stopped while emitting")]
    Stopped,

    #[error("trace logger is not set")]
    TraceLoggerNotSet,

    #[error("failed to read trace: {0:#}")]
    Trace(anyhow::Error),

    #[error("agent {agent} failed to initialize: {source:#}")]
    AgentInitialization {
        agent: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error(transparent)]
    Callback(#[from] CoreError),
}

struct RunningLoop {
    ctx: RunContext,
    task: JoinHandle<()>,
}

struct RunnerInner {
    config: RunnerConfig,
    orchestrator: Arc<dyn Orchestrator>,
    callbacks: Arc<CallbackRegistry>,
    breakers: CircuitBreakerRegistry,
    trace_logger: RwLock<Option<Arc<dyn TraceLogger>>>,
    session_store: RwLock<Option<Arc<dyn SessionStore>>>,
    sender: RwLock<Option<mpsc::Sender<Event>>>,
}

/// Drives events from a bounded queue through an [`Orchestrator`]
pub struct Runner {
    inner: Arc<RunnerInner>,
    running: Mutex<Option<RunningLoop>>,
}

impl Runner {
    pub fn new(orchestrator: Arc<dyn Orchestrator>, config: RunnerConfig) -> Self {
        let callbacks = orchestrator.callback_registry();
        let breakers = CircuitBreakerRegistry::new(config.circuit_breaker.clone());
        Self {
            inner: Arc::new(RunnerInner {
                config,
                orchestrator,
                callbacks,
                breakers,
                trace_logger: RwLock::new(None),
                session_store: RwLock::new(None),
                sender: RwLock::new(None),
            }),
            running: Mutex::new(None),
        }
    }

    /// Runner with `agents` registered and a no-op handler installed under
    /// the default error handler name unless one was supplied
    pub async fn with_agents<I>(
        orchestrator: Arc<dyn Orchestrator>,
        config: RunnerConfig,
        agents: I,
    ) -> Result<Self, RunnerError>
    where
        I: IntoIterator<Item = (String, Arc<dyn AgentHandler>)>,
    {
        let error_handler = config.error_router.error_handler_name.clone();
        let runner = Self::new(orchestrator, config);

        for (name, handler) in agents {
            runner.register_agent(&name, handler).await?;
        }
        if !runner.inner.orchestrator.has_agent(&error_handler).await {
            debug!(handler = %error_handler, "Installing default error handler");
            runner.register_agent(&error_handler, noop_handler()).await?;
        }
        Ok(runner)
    }

    /// Record every hook invocation into `logger`
    pub fn with_trace_logger(self, logger: Arc<dyn TraceLogger>) -> Result<Self, RunnerError> {
        register_trace_hooks(&self.inner.callbacks, logger.clone())?;
        *self.inner.trace_logger.write() = Some(logger);
        Ok(self)
    }

    /// Save the final state of each event under its session id
    pub fn with_session_store(self, store: Arc<dyn SessionStore>) -> Self {
        *self.inner.session_store.write() = Some(store);
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.inner.config
    }

    pub fn orchestrator(&self) -> Arc<dyn Orchestrator> {
        self.inner.orchestrator.clone()
    }

    pub fn callback_registry(&self) -> Arc<CallbackRegistry> {
        self.inner.callbacks.clone()
    }

    pub fn circuit_breakers(&self) -> &CircuitBreakerRegistry {
        &self.inner.breakers
    }

    pub fn trace_logger(&self) -> Option<Arc<dyn TraceLogger>> {
        self.inner.trace_logger.read().clone()
    }

    pub async fn register_agent(
        &self,
        name: &str,
        handler: Arc<dyn AgentHandler>,
    ) -> Result<(), RunnerError> {
        Ok(self.inner.orchestrator.register_agent(name, handler).await?)
    }

    pub fn register_callback<C>(
        &self,
        hook: HookPoint,
        name: impl Into<String>,
        callback: C,
    ) -> Result<(), RunnerError>
    where
        C: Callback + 'static,
    {
        Ok(self.inner.callbacks.register(hook, name, callback)?)
    }

    pub fn unregister_callback(&self, hook: HookPoint, name: &str) -> bool {
        self.inner.callbacks.unregister(hook, name)
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Initialize agent lifecycles and spawn the dispatch loop
    ///
    /// The loop stops when `ctx` is cancelled or [`Runner::stop`] is called.
    pub async fn start(&self, ctx: &RunContext) -> Result<(), RunnerError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(RunnerError::AlreadyStarted);
        }

        for (name, handler) in self.inner.orchestrator.handlers().await {
            if let Some(lifecycle) = handler.lifecycle() {
                lifecycle
                    .initialize()
                    .await
                    .map_err(|source| RunnerError::AgentInitialization {
                        agent: name.clone(),
                        source,
                    })?;
                debug!(agent = %name, "Agent initialized");
            }
        }

        let capacity = self.inner.config.queue.queue_size.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        *self.inner.sender.write() = Some(sender);

        let loop_ctx = ctx.child();
        let task = tokio::spawn(run_loop(self.inner.clone(), loop_ctx.clone(), receiver));
        *running = Some(RunningLoop {
            ctx: loop_ctx,
            task,
        });

        info!(
            orchestrator = %self.inner.orchestrator.kind(),
            queue_size = capacity,
            "Runner started"
        );
        Ok(())
    }

    /// Enqueue `event`, waiting up to the configured emit timeout for space
    pub async fn emit(&self, event: Event) -> Result<(), RunnerError> {
        let sender = self.inner.sender().ok_or(RunnerError::NotRunning)?;
        let capacity = self.inner.config.queue.queue_size;
        let timeout = self.inner.config.queue.emit_timeout();
        let event_id = event.id();

        let sent = if timeout.is_zero() {
            sender.try_send(event).map_err(|err| match err {
                TrySendError::Full(_) => RunnerError::QueueFull { capacity },
                TrySendError::Closed(_) => RunnerError::Stopped,
            })
        } else {
            sender
                .send_timeout(event, timeout)
                .await
                .map_err(|err| match err {
                    SendTimeoutError::Timeout(_) => RunnerError::QueueFull { capacity },
                    SendTimeoutError::Closed(_) => RunnerError::Stopped,
                })
        };

        match &sent {
            Ok(()) => debug!(event_id = %event_id, "Event queued"),
            Err(err) => warn!(event_id = %event_id, error = %err, "Emit failed"),
        }
        sent
    }

    /// Enqueue without waiting
    pub fn try_emit(&self, event: Event) -> Result<(), RunnerError> {
        self.inner.enqueue(event)
    }

    /// Stop the loop, shut down agent lifecycles and stop the orchestrator
    ///
    /// Events still queued are dropped. Safe to call repeatedly; the runner
    /// can be started again afterwards.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            debug!("Runner already stopped");
            return;
        };

        self.inner.sender.write().take();
        running.ctx.cancel();
        if let Err(err) = running.task.await {
            error!(error = %err, "Runner loop terminated abnormally");
        }

        for (name, handler) in self.inner.orchestrator.handlers().await {
            if let Some(lifecycle) = handler.lifecycle() {
                if let Err(err) = lifecycle.shutdown().await {
                    warn!(agent = %name, error = %format!("{:#}", err), "Agent shutdown failed");
                }
            }
        }
        self.inner.orchestrator.stop().await;
        info!("Runner stopped");
    }

    /// Trace entries recorded for `session_id`
    pub fn dump_trace(&self, session_id: &str) -> Result<Vec<TraceEntry>, RunnerError> {
        let logger = self.trace_logger().ok_or(RunnerError::TraceLoggerNotSet)?;
        logger.get_trace(session_id).map_err(RunnerError::Trace)
    }
}

async fn run_loop(inner: Arc<RunnerInner>, ctx: RunContext, mut receiver: mpsc::Receiver<Event>) {
    debug!("Runner loop started");
    loop {
        let event = tokio::select! {
            biased;
            reason = ctx.done() => {
                debug!(reason = %reason, "Runner loop exiting");
                break;
            }
            next = receiver.recv() => match next {
                Some(event) => event,
                None => break,
            },
        };
        inner.process_event(&ctx, event).await;
    }
}

/// Route metadata, else target agent id, else [`UNKNOWN_AGENT`]
fn dispatch_target(event: &Event) -> String {
    event
        .route()
        .or_else(|| Some(event.target_agent_id()).filter(|target| !target.is_empty()))
        .unwrap_or_else(|| UNKNOWN_AGENT.to_string())
}

fn is_error_event(event: &Event) -> bool {
    event.metadata_value(MetadataKeys::STATUS).as_deref() == Some(EventStatus::ERROR)
}

impl RunnerInner {
    fn sender(&self) -> Option<mpsc::Sender<Event>> {
        self.sender.read().clone()
    }

    fn enqueue(&self, event: Event) -> Result<(), RunnerError> {
        let sender = self.sender().ok_or(RunnerError::NotRunning)?;
        sender.try_send(event).map_err(|err| match err {
            TrySendError::Full(_) => RunnerError::QueueFull {
                capacity: self.config.queue.queue_size,
            },
            TrySendError::Closed(_) => RunnerError::Stopped,
        })
    }

    async fn process_event(self: &Arc<Self>, ctx: &RunContext, event: Event) {
        let session_id = match event.session_id() {
            Some(session_id) => session_id,
            None => {
                let session_id = event.id();
                debug!(event_id = %session_id, "Event has no session id, using event id");
                event.set_metadata(MetadataKeys::SESSION_ID, session_id.clone());
                session_id
            }
        };
        let event_ctx = ctx.child();
        let target = dispatch_target(&event);

        let mut timer = OperationTimer::new("process_event");
        timer.add_field("event_id", event.id());
        timer.add_field("session_id", &session_id);
        timer.add_field("target", &target);

        let before = self
            .callbacks
            .invoke(CallbackArgs::new(
                event_ctx.clone(),
                HookPoint::BeforeEventHandling,
                event.clone(),
                State::from_event(&event),
            ))
            .await;
        if let Some(err) = before.error {
            error!(
                event_id = %event.id(),
                error = %format!("{:#}", err),
                "BeforeEventHandling hook failed, skipping event"
            );
            timer.finish_with_result::<(), _>(&Err(err));
            return;
        }
        let current = before.state;

        debug!(event_id = %event.id(), session_id = %session_id, target = %target, "Dispatching event");
        let outcome = self.dispatch(&event_ctx, &event, &target).await;

        let (final_state, error_text) = match &outcome {
            Ok(result) => {
                self.handle_success(&event, &session_id, &target, result).await;
                (result.output_state.clone(), None)
            }
            Err((failed_agent, err)) => {
                self.handle_failure(&event_ctx, &event, failed_agent, err).await;
                (current, Some(format!("{:#}", err)))
            }
        };

        let mut args = CallbackArgs::new(
            event_ctx.clone(),
            HookPoint::AfterEventHandling,
            event.clone(),
            final_state,
        )
        .with_agent(target.clone());
        if let Some(error_text) = &error_text {
            args = args.with_error(error_text);
        }
        let after = self.callbacks.invoke(args).await;
        if let Some(err) = &after.error {
            warn!(event_id = %event.id(), error = %format!("{:#}", err), "AfterEventHandling hook failed");
        }

        timer.finish_with_result(&outcome.map(|_| ()).map_err(|(_, err)| err));
    }

    /// Dispatch through the target's breaker when breakers are enabled
    async fn dispatch(
        &self,
        ctx: &RunContext,
        event: &Event,
        target: &str,
    ) -> Result<AgentResult, (String, anyhow::Error)> {
        let blame = |err: &OrchestratorError| {
            err.failed_agent()
                .map(str::to_string)
                .unwrap_or_else(|| target.to_string())
        };

        if !self.config.error_router.enable_circuit_breaker {
            return self
                .orchestrator
                .dispatch(ctx, event)
                .await
                .map_err(|err| (blame(&err), anyhow::Error::new(err)));
        }

        let breaker = self.breakers.get_or_create(target);
        match breaker.call(|| self.orchestrator.dispatch(ctx, event)).await {
            Ok(result) => Ok(result),
            Err(BreakerCallError::Rejected(rejection)) => {
                warn!(target = %target, event_id = %event.id(), "Circuit open, event rejected");
                Err((target.to_string(), anyhow::Error::new(rejection)))
            }
            Err(BreakerCallError::Failed(err)) => Err((blame(&err), anyhow::Error::new(err))),
        }
    }

    async fn handle_success(&self, event: &Event, session_id: &str, agent: &str, result: &AgentResult) {
        debug!(event_id = %event.id(), agent = %agent, "Event handled");

        let store = self.session_store.read().clone();
        if let Some(store) = store {
            let session = Session::new(session_id, result.output_state.clone());
            if let Err(err) = store.save_session(session).await {
                warn!(session_id = %session_id, error = %err, "Failed to save session");
            }
        }

        // A route copied through from the incoming event is not a request for a follow-up
        let output = &result.output_state;
        let current_route = event.route();
        let Some(next_route) = output
            .get_meta(MetadataKeys::ROUTE)
            .filter(|route| !route.is_empty() && current_route.as_deref() != Some(*route))
        else {
            return;
        };

        let data: EventData = output.data().clone();
        let mut metadata: EventMetadata = output.meta().clone();
        metadata.insert(MetadataKeys::SESSION_ID.to_string(), session_id.to_string());
        metadata.insert(MetadataKeys::STATUS.to_string(), EventStatus::SUCCESS.to_string());

        let follow_up = Event::new(next_route, data, metadata);
        follow_up.set_source_agent_id(agent);
        debug!(event_id = %follow_up.id(), route = %next_route, "Enqueueing follow-up event");
        if let Err(err) = self.enqueue(follow_up) {
            error!(event_id = %event.id(), error = %err, "Failed to enqueue follow-up event");
        }
    }

    async fn handle_failure(
        self: &Arc<Self>,
        ctx: &RunContext,
        event: &Event,
        failed_agent: &str,
        err: &anyhow::Error,
    ) {
        error!(
            event_id = %event.id(),
            agent = %failed_agent,
            error = %format!("{:#}", err),
            "Agent execution failed"
        );

        if is_error_event(event) {
            error!(event_id = %event.id(), "Error handler failed, not re-routing");
            return;
        }

        let router = &self.config.error_router;
        let (mut error_event, error_data) = create_error_event(event, failed_agent, err, router);

        if self.config.retry_failed_events && error_data.recovery_action == RecoveryAction::Retry {
            self.schedule_retry(ctx, increment_retry_count(event));
            return;
        }

        let handler = error_event.route().unwrap_or_default();
        if !self.orchestrator.has_agent(&handler).await && handler != router.error_handler_name {
            debug!(
                handler = %handler,
                fallback = %router.error_handler_name,
                "Error handler not registered, using default"
            );
            error_event = build_error_event(&error_data, &router.error_handler_name);
        }

        info!(
            event_id = %event.id(),
            error_event_id = %error_event.id(),
            handler = %error_event.route().unwrap_or_default(),
            error_code = %error_data.error_code,
            recovery_action = %error_data.recovery_action,
            "Routing failure to error handler"
        );
        if let Err(enqueue_err) = self.enqueue(error_event) {
            error!(event_id = %event.id(), error = %enqueue_err, "Failed to enqueue error event");
        }
    }

    fn schedule_retry(self: &Arc<Self>, ctx: &RunContext, retry: Event) {
        let delay = self.config.error_router.retry_delay();
        let inner = Arc::clone(self);
        let ctx = ctx.clone();
        info!(
            event_id = %retry.id(),
            retry_count = ?retry.metadata_value(MetadataKeys::RETRY_COUNT),
            delay_ms = delay.as_millis() as u64,
            "Scheduling event retry"
        );

        tokio::spawn(async move {
            if ctx.sleep(delay).await.is_err() {
                debug!(event_id = %retry.id(), "Runner stopped before retry");
                return;
            }
            if let Err(err) = inner.enqueue(retry) {
                error!(error = %err, "Failed to enqueue retry");
            }
        });
    }
}
