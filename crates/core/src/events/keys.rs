//! Reserved metadata keys understood by the runtime

/// Metadata keys with runtime meaning
pub struct MetadataKeys;

impl MetadataKeys {
    /// Target agent for single-target (route) dispatch
    pub const ROUTE: &'static str = "route";

    /// Session correlation id, defaulted to the event id by the runner
    pub const SESSION_ID: &'static str = "session_id";

    /// Number of times an event was re-enqueued after a failure
    pub const RETRY_COUNT: &'static str = "retry_count";

    /// Outcome marker on runner-generated events ("success" / "error")
    pub const STATUS: &'static str = "status";

    /// Agent that produced an error event
    pub const FAILED_AGENT_ID: &'static str = "failed_agent_id";

    /// Error router classification fields
    pub const ERROR_CODE: &'static str = "error_code";
    pub const SEVERITY: &'static str = "severity";
    pub const RECOVERY_ACTION: &'static str = "recovery_action";
}

/// Values written under [`MetadataKeys::STATUS`]
pub struct EventStatus;

impl EventStatus {
    pub const SUCCESS: &'static str = "success";
    pub const ERROR: &'static str = "error";
}

/// Output-state key a loop agent sets to stop a loop orchestrator early
pub const LOOP_COMPLETED_KEY: &str = "loop_completed";
