//! Orchestrator construction from configuration

use super::loop_mode::DEFAULT_MAX_ITERATIONS;
use super::{
    CollaborativeOrchestrator, LoopOrchestrator, MixedOrchestrator, Orchestrator,
    OrchestratorError, RouteOrchestrator, SequentialOrchestrator,
};
use agentflow_core::CallbackRegistry;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Orchestration strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorKind {
    #[default]
    Route,
    Collaborative,
    /// Same behavior as `Collaborative`
    Parallel,
    Sequential,
    Loop,
    Mixed,
}

impl OrchestratorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrchestratorKind::Route => "route",
            OrchestratorKind::Collaborative => "collaborative",
            OrchestratorKind::Parallel => "parallel",
            OrchestratorKind::Sequential => "sequential",
            OrchestratorKind::Loop => "loop",
            OrchestratorKind::Mixed => "mixed",
        }
    }
}

impl fmt::Display for OrchestratorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which orchestrator to build and the agent names it needs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub kind: OrchestratorKind,
    /// Agent order for `sequential`
    pub sequence: Vec<String>,
    /// Agent repeated by `loop`
    pub loop_agent: Option<String>,
    pub max_iterations: u32,
    /// First phase of `mixed`
    pub collaborative_agents: Vec<String>,
    /// Second phase of `mixed`
    pub sequential_agents: Vec<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            kind: OrchestratorKind::Route,
            sequence: Vec::new(),
            loop_agent: None,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            collaborative_agents: Vec::new(),
            sequential_agents: Vec::new(),
        }
    }
}

impl OrchestratorConfig {
    pub fn route() -> Self {
        Self::default()
    }

    pub fn collaborative() -> Self {
        Self {
            kind: OrchestratorKind::Collaborative,
            ..Self::default()
        }
    }

    pub fn sequential(sequence: Vec<String>) -> Self {
        Self {
            kind: OrchestratorKind::Sequential,
            sequence,
            ..Self::default()
        }
    }

    pub fn looping(agent: impl Into<String>, max_iterations: u32) -> Self {
        Self {
            kind: OrchestratorKind::Loop,
            loop_agent: Some(agent.into()),
            max_iterations,
            ..Self::default()
        }
    }

    pub fn mixed(collaborative_agents: Vec<String>, sequential_agents: Vec<String>) -> Self {
        Self {
            kind: OrchestratorKind::Mixed,
            collaborative_agents,
            sequential_agents,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), OrchestratorError> {
        let invalid = |reason: &str| {
            Err(OrchestratorError::InvalidConfig {
                reason: reason.to_string(),
            })
        };

        match self.kind {
            OrchestratorKind::Sequential if self.sequence.is_empty() => {
                invalid("sequential orchestration needs a non-empty sequence")
            }
            OrchestratorKind::Loop if self.loop_agent.as_deref().map_or(true, str::is_empty) => {
                invalid("loop orchestration needs loop_agent")
            }
            OrchestratorKind::Loop if self.max_iterations == 0 => {
                invalid("max_iterations must be at least 1")
            }
            OrchestratorKind::Mixed
                if self.collaborative_agents.is_empty() && self.sequential_agents.is_empty() =>
            {
                invalid("mixed orchestration needs collaborative or sequential agents")
            }
            _ => Ok(()),
        }
    }
}

/// Builds orchestrators that share one callback registry
#[derive(Debug, Clone)]
pub struct OrchestratorFactory {
    callbacks: Arc<CallbackRegistry>,
}

impl OrchestratorFactory {
    pub fn new(callbacks: Arc<CallbackRegistry>) -> Self {
        Self { callbacks }
    }

    pub fn callback_registry(&self) -> Arc<CallbackRegistry> {
        self.callbacks.clone()
    }

    pub fn create(&self, config: &OrchestratorConfig) -> Result<Arc<dyn Orchestrator>, OrchestratorError> {
        config.validate()?;
        let callbacks = self.callbacks.clone();

        let orchestrator: Arc<dyn Orchestrator> = match config.kind {
            OrchestratorKind::Route => Arc::new(RouteOrchestrator::new(callbacks)),
            OrchestratorKind::Collaborative => Arc::new(CollaborativeOrchestrator::new(callbacks)),
            OrchestratorKind::Parallel => {
                debug!("Parallel orchestration maps to collaborative dispatch");
                Arc::new(CollaborativeOrchestrator::new(callbacks))
            }
            OrchestratorKind::Sequential => Arc::new(SequentialOrchestrator::new(
                callbacks,
                config.sequence.clone(),
            )),
            OrchestratorKind::Loop => Arc::new(LoopOrchestrator::new(
                callbacks,
                config.loop_agent.clone().unwrap_or_default(),
                config.max_iterations,
            )),
            OrchestratorKind::Mixed => Arc::new(MixedOrchestrator::new(
                callbacks,
                config.collaborative_agents.clone(),
                config.sequential_agents.clone(),
            )),
        };

        info!(kind = %config.kind, "Created orchestrator");
        Ok(orchestrator)
    }
}

impl Default for OrchestratorFactory {
    fn default() -> Self {
        Self::new(Arc::new(CallbackRegistry::new()))
    }
}
