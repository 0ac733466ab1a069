//! Runtime configuration aggregated from every component

use crate::composition::MultiAgentConfig;
use crate::orchestrator::OrchestratorConfig;
use crate::reliability::RetryPolicy;
use crate::runner::RunnerConfig;
use agentflow_common::{init_structured_logging, LoggingConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Serde adapter storing a `Duration` as whole milliseconds
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config field {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Every tunable of the runtime in one document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub runner: RunnerConfig,
    pub orchestrator: OrchestratorConfig,
    pub retry: RetryPolicy,
    pub composition: MultiAgentConfig,
    pub logging: LoggingConfig,
}

impl RuntimeConfig {
    /// Parse and validate a JSON document; absent sections keep their defaults
    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "Loading runtime config");
        Self::from_json_str(&content)
    }

    /// Install the global tracing subscriber from the `logging` section
    ///
    /// Fails when a global subscriber is already set.
    pub fn init_logging(&self) -> anyhow::Result<()> {
        init_structured_logging(self.logging.clone())
    }

    pub fn to_json_pretty(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let runner = &self.runner;
        if runner.queue.queue_size == 0 {
            return Err(ConfigError::Invalid {
                field: "runner.queue_size",
                reason: "must be at least 1".to_string(),
            });
        }
        runner
            .circuit_breaker
            .validate()
            .map_err(|err| ConfigError::Invalid {
                field: "runner.circuit_breaker",
                reason: err.to_string(),
            })?;
        if runner.error_router.error_handler_name.is_empty() {
            return Err(ConfigError::Invalid {
                field: "runner.error_router.error_handler_name",
                reason: "must not be empty".to_string(),
            });
        }

        self.orchestrator
            .validate()
            .map_err(|err| ConfigError::Invalid {
                field: "orchestrator",
                reason: err.to_string(),
            })?;

        self.retry.validate().map_err(|reason| ConfigError::Invalid {
            field: "retry",
            reason,
        })?;

        if self.composition.max_concurrency == 0 {
            return Err(ConfigError::Invalid {
                field: "composition.max_concurrency",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}
