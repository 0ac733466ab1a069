//! Outcome of a single agent run

use super::state::State;
use crate::*;
use std::time::Duration;

/// Output of an agent run with its timing
///
/// The error is kept as plain text so results can cross task boundaries
/// and be serialized into traces.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    pub output_state: State,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(rename = "duration_ms", with = "duration_millis", default)]
    pub duration: Duration,
}

impl AgentResult {
    /// Result with zero duration, stamped now
    pub fn new(output_state: State) -> Self {
        let now = Utc::now();
        Self {
            output_state,
            error: None,
            start_time: now,
            end_time: now,
            duration: Duration::ZERO,
        }
    }

    /// Successful run that started at `start_time` and ends now
    pub fn completed(output_state: State, start_time: DateTime<Utc>) -> Self {
        let end_time = Utc::now();
        Self {
            output_state,
            error: None,
            start_time,
            end_time,
            duration: elapsed_between(start_time, end_time),
        }
    }

    /// Failed run that started at `start_time` and ends now
    pub fn failed(output_state: State, start_time: DateTime<Utc>, error: impl ToString) -> Self {
        let mut result = Self::completed(output_state, start_time);
        result.error = Some(error.to_string());
        result
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

fn elapsed_between(start: DateTime<Utc>, end: DateTime<Utc>) -> Duration {
    (end - start).to_std().unwrap_or(Duration::ZERO)
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
