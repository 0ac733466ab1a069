//! Error classification, recovery decisions and error-handler routing
//!
//! A failed dispatch is turned into an error event addressed to a handler
//! agent. The handler is chosen by severity first, then by error code, then
//! the configured default.

use agentflow_core::{Event, EventData, EventMetadata, EventStatus, MetadataKeys};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

/// Error codes assigned by [`categorize_error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "VALIDATION_ERROR")]
    Validation,
    #[serde(rename = "TIMEOUT_ERROR")]
    Timeout,
    #[serde(rename = "LLM_ERROR")]
    Llm,
    #[serde(rename = "NETWORK_ERROR")]
    Network,
    #[serde(rename = "AUTH_ERROR")]
    Auth,
    #[serde(rename = "RESOURCE_ERROR")]
    Resource,
    #[serde(rename = "UNKNOWN_ERROR")]
    Unknown,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Validation => "VALIDATION_ERROR",
            ErrorCode::Timeout => "TIMEOUT_ERROR",
            ErrorCode::Llm => "LLM_ERROR",
            ErrorCode::Network => "NETWORK_ERROR",
            ErrorCode::Auth => "AUTH_ERROR",
            ErrorCode::Resource => "RESOURCE_ERROR",
            ErrorCode::Unknown => "UNKNOWN_ERROR",
        }
    }

    /// Lowercase category name mirroring the code
    pub fn category(&self) -> &'static str {
        match self {
            ErrorCode::Validation => "validation",
            ErrorCode::Timeout => "timeout",
            ErrorCode::Llm => "llm",
            ErrorCode::Network => "network",
            ErrorCode::Auth => "auth",
            ErrorCode::Resource => "resource",
            ErrorCode::Unknown => "unknown",
        }
    }

    /// Codes worth retrying once the limit is reached fall back instead of escalating
    fn is_transient(&self) -> bool {
        matches!(self, ErrorCode::Timeout | ErrorCode::Network | ErrorCode::Llm)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorSeverity::Low => "low",
            ErrorSeverity::Medium => "medium",
            ErrorSeverity::High => "high",
            ErrorSeverity::Critical => "critical",
        }
    }
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryAction {
    Retry,
    Fallback,
    Escalate,
    Terminate,
}

impl RecoveryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryAction::Retry => "retry",
            RecoveryAction::Fallback => "fallback",
            RecoveryAction::Escalate => "escalate",
            RecoveryAction::Terminate => "terminate",
        }
    }
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of classifying an error message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ErrorClass {
    pub code: ErrorCode,
    pub severity: ErrorSeverity,
    pub category: &'static str,
}

impl ErrorClass {
    fn new(code: ErrorCode, severity: ErrorSeverity) -> Self {
        Self {
            code,
            severity,
            category: code.category(),
        }
    }
}

// First matching row wins
const CLASSIFICATION_RULES: &[(&[&str], ErrorCode, ErrorSeverity)] = &[
    (
        &["validation", "invalid", "required", "missing"],
        ErrorCode::Validation,
        ErrorSeverity::Medium,
    ),
    (
        &["timeout", "deadline", "context canceled"],
        ErrorCode::Timeout,
        ErrorSeverity::High,
    ),
    (
        &["llm", "openai", "azure", "model", "completion"],
        ErrorCode::Llm,
        ErrorSeverity::Medium,
    ),
    (
        &["network", "connection", "dial", "http"],
        ErrorCode::Network,
        ErrorSeverity::High,
    ),
    (
        &["auth", "unauthorized", "forbidden", "token"],
        ErrorCode::Auth,
        ErrorSeverity::Critical,
    ),
    (
        &["memory", "resource", "limit", "quota"],
        ErrorCode::Resource,
        ErrorSeverity::Critical,
    ),
];

/// Classify an error by its full context chain
pub fn categorize_error(error: &anyhow::Error) -> ErrorClass {
    categorize_message(&format!("{:#}", error))
}

/// Classify an error message by case-insensitive substring matching
pub fn categorize_message(message: &str) -> ErrorClass {
    let lowered = message.to_lowercase();
    CLASSIFICATION_RULES
        .iter()
        .find(|(needles, _, _)| needles.iter().any(|needle| lowered.contains(needle)))
        .map(|(_, code, severity)| ErrorClass::new(*code, *severity))
        .unwrap_or_else(|| ErrorClass::new(ErrorCode::Unknown, ErrorSeverity::Medium))
}

pub fn determine_recovery_action(code: ErrorCode, retry_count: u32, max_retries: u32) -> RecoveryAction {
    match code {
        ErrorCode::Auth | ErrorCode::Resource => RecoveryAction::Escalate,
        ErrorCode::Validation => RecoveryAction::Terminate,
        _ if retry_count < max_retries => RecoveryAction::Retry,
        code if code.is_transient() => RecoveryAction::Fallback,
        _ => RecoveryAction::Escalate,
    }
}

/// Error routing settings consumed by the runner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorRouterConfig {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub enable_circuit_breaker: bool,
    /// Fallback handler, also used when a selected handler is not registered
    pub error_handler_name: String,
    pub category_handlers: HashMap<ErrorCode, String>,
    pub severity_handlers: HashMap<ErrorSeverity, String>,
}

impl Default for ErrorRouterConfig {
    fn default() -> Self {
        let category_handlers = [
            (ErrorCode::Validation, "validation-error-handler"),
            (ErrorCode::Timeout, "timeout-error-handler"),
            (ErrorCode::Llm, "llm-error-handler"),
            (ErrorCode::Network, "network-error-handler"),
            (ErrorCode::Auth, "auth-error-handler"),
        ]
        .into_iter()
        .map(|(code, handler)| (code, handler.to_string()))
        .collect();

        let severity_handlers = [
            (ErrorSeverity::Critical, "critical-error-handler"),
            (ErrorSeverity::High, "high-priority-error-handler"),
        ]
        .into_iter()
        .map(|(severity, handler)| (severity, handler.to_string()))
        .collect();

        Self {
            max_retries: 3,
            retry_delay_ms: 1000,
            enable_circuit_breaker: true,
            error_handler_name: "error-handler".to_string(),
            category_handlers,
            severity_handlers,
        }
    }
}

impl ErrorRouterConfig {
    /// Only the default handler, no category or severity routing
    pub fn minimal(error_handler_name: impl Into<String>) -> Self {
        Self {
            error_handler_name: error_handler_name.into(),
            category_handlers: HashMap::new(),
            severity_handlers: HashMap::new(),
            ..Self::default()
        }
    }

    pub fn retry_delay(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.retry_delay_ms)
    }
}

/// Structured description of a failed dispatch carried by error events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEventData {
    pub original_event: Event,
    pub failed_agent: String,
    pub error_message: String,
    pub error_code: ErrorCode,
    pub retry_count: u32,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub severity: ErrorSeverity,
    pub error_category: String,
    pub recovery_action: RecoveryAction,
}

impl ErrorEventData {
    /// Classify `error` raised by `failed_agent` while handling `original_event`
    pub fn from_failure(
        original_event: &Event,
        failed_agent: &str,
        error: &anyhow::Error,
        config: &ErrorRouterConfig,
    ) -> Self {
        let error_message = format!("{:#}", error);
        let class = categorize_message(&error_message);
        let retry_count = retry_count(original_event);

        Self {
            original_event: original_event.clone(),
            failed_agent: failed_agent.to_string(),
            error_message,
            error_code: class.code,
            retry_count,
            timestamp: Utc::now(),
            session_id: original_event.session_id().unwrap_or_default(),
            severity: class.severity,
            error_category: class.category.to_string(),
            recovery_action: determine_recovery_action(class.code, retry_count, config.max_retries),
        }
    }

    pub fn is_retryable(&self) -> bool {
        is_retryable_error(self)
    }
}

/// Severity handler, then category handler, then the default handler
pub fn determine_error_handler(error_data: &ErrorEventData, config: &ErrorRouterConfig) -> String {
    config
        .severity_handlers
        .get(&error_data.severity)
        .or_else(|| config.category_handlers.get(&error_data.error_code))
        .cloned()
        .unwrap_or_else(|| config.error_handler_name.clone())
}

pub fn is_retryable_error(error_data: &ErrorEventData) -> bool {
    error_data.recovery_action == RecoveryAction::Retry
}

/// Build the error event for a failure; returns it with its classification
pub fn create_error_event(
    original_event: &Event,
    failed_agent: &str,
    error: &anyhow::Error,
    config: &ErrorRouterConfig,
) -> (Event, ErrorEventData) {
    let error_data = ErrorEventData::from_failure(original_event, failed_agent, error, config);
    let handler = determine_error_handler(&error_data, config);
    let event = build_error_event(&error_data, &handler);
    (event, error_data)
}

/// Address an error event for `error_data` to `handler`
pub fn build_error_event(error_data: &ErrorEventData, handler: &str) -> Event {
    let mut payload = EventData::new();
    payload.insert(
        "error_data".to_string(),
        serde_json::to_value(error_data).unwrap_or(serde_json::Value::Null),
    );
    payload.insert("original_event_id".to_string(), json!(error_data.original_event.id()));
    payload.insert("error".to_string(), json!(error_data.error_message));
    payload.insert("failed_agent".to_string(), json!(error_data.failed_agent));
    payload.insert("retry_count".to_string(), json!(error_data.retry_count));
    payload.insert("error_code".to_string(), json!(error_data.error_code.as_str()));
    payload.insert("severity".to_string(), json!(error_data.severity.as_str()));
    payload.insert(
        "recovery_action".to_string(),
        json!(error_data.recovery_action.as_str()),
    );

    let mut metadata = EventMetadata::new();
    metadata.insert(MetadataKeys::SESSION_ID.to_string(), error_data.session_id.clone());
    metadata.insert(MetadataKeys::ROUTE.to_string(), handler.to_string());
    metadata.insert(MetadataKeys::STATUS.to_string(), EventStatus::ERROR.to_string());
    metadata.insert(
        MetadataKeys::ERROR_CODE.to_string(),
        error_data.error_code.as_str().to_string(),
    );
    metadata.insert(
        MetadataKeys::SEVERITY.to_string(),
        error_data.severity.as_str().to_string(),
    );
    metadata.insert(
        MetadataKeys::RECOVERY_ACTION.to_string(),
        error_data.recovery_action.as_str().to_string(),
    );
    if !error_data.failed_agent.is_empty() && error_data.failed_agent != "unknown" {
        metadata.insert(
            MetadataKeys::FAILED_AGENT_ID.to_string(),
            error_data.failed_agent.clone(),
        );
    }

    let event = Event::new(handler, payload, metadata);
    event.set_source_agent_id(error_data.failed_agent.clone());

    debug!(
        event_id = %event.id(),
        handler = %handler,
        error_code = %error_data.error_code,
        severity = %error_data.severity,
        recovery_action = %error_data.recovery_action,
        "Created error event"
    );
    event
}

/// Retry count carried in metadata; absent or unparsable counts as 0
pub fn retry_count(event: &Event) -> u32 {
    event
        .metadata_value(MetadataKeys::RETRY_COUNT)
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(0)
}

/// Copy of `event` with a fresh id and `retry_count` incremented
pub fn increment_retry_count(event: &Event) -> Event {
    let mut metadata = event.metadata();
    metadata.insert(
        MetadataKeys::RETRY_COUNT.to_string(),
        (retry_count(event) + 1).to_string(),
    );

    let next = Event::new(event.target_agent_id(), event.data(), metadata);
    next.set_source_agent_id(event.source_agent_id());
    next
}
