use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Shared settings for bounded event queues
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfigBase {
    /// Capacity of the bounded queue
    pub queue_size: usize,
    /// How long a producer may wait for a free slot
    pub emit_timeout_ms: u64,
}

impl Default for QueueConfigBase {
    fn default() -> Self {
        Self {
            queue_size: 100,
            emit_timeout_ms: 1000,
        }
    }
}

impl QueueConfigBase {
    pub fn small() -> Self {
        Self {
            queue_size: 16,
            emit_timeout_ms: 250,
        }
    }

    pub fn large() -> Self {
        Self {
            queue_size: 1024,
            emit_timeout_ms: 5000,
        }
    }

    pub fn emit_timeout(&self) -> Duration {
        Duration::from_millis(self.emit_timeout_ms)
    }
}

/// Shared settings for bounded-time operations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfigBase {
    /// Deadline for a whole operation; 0 disables it
    pub operation_timeout_ms: u64,
    /// Upper bound on concurrently running units of work
    pub max_concurrency: usize,
}

impl Default for TimeoutConfigBase {
    fn default() -> Self {
        Self {
            operation_timeout_ms: 30_000,
            max_concurrency: 10,
        }
    }
}

impl TimeoutConfigBase {
    pub fn fast() -> Self {
        Self {
            operation_timeout_ms: 5_000,
            max_concurrency: 4,
        }
    }

    pub fn slow() -> Self {
        Self {
            operation_timeout_ms: 120_000,
            max_concurrency: 32,
        }
    }

    /// `None` when the timeout is disabled
    pub fn operation_timeout(&self) -> Option<Duration> {
        if self.operation_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.operation_timeout_ms))
        }
    }
}
