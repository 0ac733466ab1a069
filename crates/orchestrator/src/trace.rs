//! Per-session execution trace recorded through lifecycle hooks

use agentflow_core::{
    AgentResult, CallbackArgs, CallbackRegistry, CoreError, HookPoint, State,
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Stage a [`TraceEntry`] was recorded at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceKind {
    EventStart,
    EventEnd,
    AgentStart,
    AgentEnd,
    AgentError,
}

impl TraceKind {
    fn for_hook(hook: HookPoint) -> Option<Self> {
        match hook {
            HookPoint::BeforeEventHandling => Some(TraceKind::EventStart),
            HookPoint::AfterEventHandling => Some(TraceKind::EventEnd),
            HookPoint::BeforeAgentRun => Some(TraceKind::AgentStart),
            HookPoint::AfterAgentRun => Some(TraceKind::AgentEnd),
            HookPoint::AgentError => Some(TraceKind::AgentError),
            HookPoint::AllHooks => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: TraceKind,
    pub event_id: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub agent_id: String,
    pub state: State,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub hook: HookPoint,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_agent_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source_agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_result: Option<AgentResult>,
}

impl TraceEntry {
    /// Snapshot of a hook invocation; `None` for the catch-all hook point
    pub fn from_callback(args: &CallbackArgs) -> Option<Self> {
        let kind = TraceKind::for_hook(args.hook)?;
        Some(Self {
            timestamp: Utc::now(),
            kind,
            event_id: args.event.id(),
            session_id: args.event.session_id().unwrap_or_default(),
            agent_id: args.agent_id.clone(),
            state: args.state.clone(),
            error: args.error.clone(),
            hook: args.hook,
            target_agent_id: args.event.target_agent_id(),
            source_agent_id: args.event.source_agent_id(),
            agent_result: args.agent_result.clone(),
        })
    }
}

/// Storage for trace entries grouped by session
pub trait TraceLogger: Send + Sync {
    fn log(&self, entry: TraceEntry) -> anyhow::Result<()>;

    /// Entries for `session_id` in recording order; empty when unknown
    fn get_trace(&self, session_id: &str) -> anyhow::Result<Vec<TraceEntry>>;
}

#[derive(Default)]
pub struct InMemoryTraceLogger {
    sessions: RwLock<HashMap<String, Vec<TraceEntry>>>,
}

impl InMemoryTraceLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn clear(&self) {
        self.sessions.write().clear();
    }
}

impl TraceLogger for InMemoryTraceLogger {
    fn log(&self, entry: TraceEntry) -> anyhow::Result<()> {
        self.sessions
            .write()
            .entry(entry.session_id.clone())
            .or_default()
            .push(entry);
        Ok(())
    }

    fn get_trace(&self, session_id: &str) -> anyhow::Result<Vec<TraceEntry>> {
        Ok(self
            .sessions
            .read()
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }
}

impl fmt::Debug for InMemoryTraceLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryTraceLogger")
            .field("sessions", &self.sessions.read().len())
            .finish()
    }
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTraceLogger;

impl TraceLogger for NoopTraceLogger {
    fn log(&self, _entry: TraceEntry) -> anyhow::Result<()> {
        Ok(())
    }

    fn get_trace(&self, _session_id: &str) -> anyhow::Result<Vec<TraceEntry>> {
        Ok(Vec::new())
    }
}

const TRACE_HOOKS: [(HookPoint, &str); 5] = [
    (HookPoint::BeforeEventHandling, "trace_before_event"),
    (HookPoint::AfterEventHandling, "trace_after_event"),
    (HookPoint::BeforeAgentRun, "trace_before_agent"),
    (HookPoint::AfterAgentRun, "trace_after_agent"),
    (HookPoint::AgentError, "trace_agent_error"),
];

async fn record(logger: Arc<dyn TraceLogger>, args: CallbackArgs) -> anyhow::Result<Option<State>> {
    if let Some(entry) = TraceEntry::from_callback(&args) {
        logger.log(entry)?;
    }
    Ok(None)
}

/// Record every lifecycle hook into `logger`
///
/// The trace callbacks never change the state they observe.
pub fn register_trace_hooks(
    registry: &CallbackRegistry,
    logger: Arc<dyn TraceLogger>,
) -> Result<(), CoreError> {
    for (hook, name) in TRACE_HOOKS {
        let logger = logger.clone();
        registry.register(hook, name, move |args: CallbackArgs| {
            record(logger.clone(), args)
        })?;
    }
    debug!("Trace hooks registered");
    Ok(())
}
