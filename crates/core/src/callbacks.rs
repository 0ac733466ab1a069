//! Named callbacks fired at lifecycle hook points
//!
//! Callbacks for a hook run in registration order, followed by the callbacks
//! registered for [`HookPoint::AllHooks`]. Each one sees the state produced by
//! the previous one. A failing callback does not stop the chain: the last
//! error is reported together with the final state.

use crate::context::RunContext;
use crate::domain::{AgentResult, State};
use crate::error::{CoreError, CoreResult};
use crate::events::Event;
use crate::*;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// Lifecycle stages at which callbacks fire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookPoint {
    BeforeEventHandling,
    AfterEventHandling,
    BeforeAgentRun,
    AfterAgentRun,
    AgentError,
    AllHooks,
}

impl HookPoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookPoint::BeforeEventHandling => "BeforeEventHandling",
            HookPoint::AfterEventHandling => "AfterEventHandling",
            HookPoint::BeforeAgentRun => "BeforeAgentRun",
            HookPoint::AfterAgentRun => "AfterAgentRun",
            HookPoint::AgentError => "AgentError",
            HookPoint::AllHooks => "AllHooks",
        }
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a callback may inspect
#[derive(Debug, Clone)]
pub struct CallbackArgs {
    pub ctx: RunContext,
    pub hook: HookPoint,
    pub event: Event,
    pub state: State,
    pub agent_id: String,
    pub agent_result: Option<AgentResult>,
    pub error: Option<String>,
}

impl CallbackArgs {
    pub fn new(ctx: RunContext, hook: HookPoint, event: Event, state: State) -> Self {
        Self {
            ctx,
            hook,
            event,
            state,
            agent_id: String::new(),
            agent_result: None,
            error: None,
        }
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = agent_id.into();
        self
    }

    pub fn with_result(mut self, result: AgentResult) -> Self {
        self.agent_result = Some(result);
        self
    }

    pub fn with_error(mut self, error: impl ToString) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

/// Callback contract; `Ok(None)` leaves the state unchanged
#[async_trait]
pub trait Callback: Send + Sync {
    async fn call(&self, args: CallbackArgs) -> anyhow::Result<Option<State>>;
}

#[async_trait]
impl<F, Fut> Callback for F
where
    F: Fn(CallbackArgs) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Option<State>>> + Send,
{
    async fn call(&self, args: CallbackArgs) -> anyhow::Result<Option<State>> {
        (self)(args).await
    }
}

/// Final state of a hook invocation and the last error seen, if any
#[derive(Debug)]
pub struct HookOutcome {
    pub state: State,
    pub error: Option<anyhow::Error>,
}

impl HookOutcome {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Clone)]
struct RegisteredCallback {
    name: String,
    callback: Arc<dyn Callback>,
}

/// Thread-safe registry of named callbacks per hook point
#[derive(Default)]
pub struct CallbackRegistry {
    callbacks: RwLock<HashMap<HookPoint, Vec<RegisteredCallback>>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` under `name` for `hook`
    pub fn register<C>(&self, hook: HookPoint, name: impl Into<String>, callback: C) -> CoreResult<()>
    where
        C: Callback + 'static,
    {
        self.register_shared(hook, name, Arc::new(callback))
    }

    /// Register an already shared callback, e.g. one installed on several hooks
    pub fn register_shared(
        &self,
        hook: HookPoint,
        name: impl Into<String>,
        callback: Arc<dyn Callback>,
    ) -> CoreResult<()> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(CoreError::InvalidArgument {
                reason: "callback name cannot be empty".to_string(),
            });
        }

        let mut callbacks = self.callbacks.write();
        let entries = callbacks.entry(hook).or_default();
        if entries.iter().any(|entry| entry.name == name) {
            return Err(CoreError::DuplicateName { hook, name });
        }

        debug!(hook = %hook, callback = %name, "Registered callback");
        entries.push(RegisteredCallback { name, callback });
        Ok(())
    }

    /// Remove a callback; returns whether it was registered
    pub fn unregister(&self, hook: HookPoint, name: &str) -> bool {
        let mut callbacks = self.callbacks.write();
        let removed = match callbacks.get_mut(&hook) {
            Some(entries) => {
                let before = entries.len();
                entries.retain(|entry| entry.name != name);
                entries.len() != before
            }
            None => false,
        };

        if removed {
            debug!(hook = %hook, callback = %name, "Unregistered callback");
        } else {
            warn!(hook = %hook, callback = %name, "Callback not found for unregister");
        }
        removed
    }

    /// Names registered for `hook`, in registration order
    pub fn callback_names(&self, hook: HookPoint) -> Vec<String> {
        self.callbacks
            .read()
            .get(&hook)
            .map(|entries| entries.iter().map(|entry| entry.name.clone()).collect())
            .unwrap_or_default()
    }

    /// Run the callbacks for `args.hook`, then the `AllHooks` callbacks
    pub async fn invoke(&self, args: CallbackArgs) -> HookOutcome {
        let hook = args.hook;
        let chain = self.snapshot(hook);

        let mut state = args.state.clone();
        let mut last_error = None;

        if chain.is_empty() {
            return HookOutcome { state, error: None };
        }

        debug!(hook = %hook, callbacks = chain.len(), "Invoking callbacks");

        for entry in chain {
            let mut call_args = args.clone();
            call_args.state = state.clone();

            match entry.callback.call(call_args).await {
                Ok(Some(next)) => state = next,
                Ok(None) => {}
                Err(err) => {
                    warn!(
                        hook = %hook,
                        callback = %entry.name,
                        error = %format!("{:#}", err),
                        "Callback failed"
                    );
                    last_error = Some(err);
                }
            }
        }

        HookOutcome {
            state,
            error: last_error,
        }
    }

    // Copy the chain so no lock is held across callback awaits
    fn snapshot(&self, hook: HookPoint) -> Vec<RegisteredCallback> {
        let callbacks = self.callbacks.read();
        let mut chain: Vec<RegisteredCallback> = callbacks.get(&hook).cloned().unwrap_or_default();
        if hook != HookPoint::AllHooks {
            if let Some(global) = callbacks.get(&HookPoint::AllHooks) {
                chain.extend(global.iter().cloned());
            }
        }
        chain
    }
}

impl fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let callbacks = self.callbacks.read();
        let summary: HashMap<&HookPoint, usize> =
            callbacks.iter().map(|(hook, entries)| (hook, entries.len())).collect();
        f.debug_struct("CallbackRegistry")
            .field("callbacks", &summary)
            .finish()
    }
}
