use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::io::{self, Write};
use std::str::FromStr;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Layer, Registry};

/// One JSON log line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredLogEntry {
    /// ISO 8601 timestamp
    pub timestamp: String,
    pub level: String,
    /// Emitting module
    pub target: String,
    pub message: String,
    /// Structured fields recorded on the event (agent, event_id, session_id, ...)
    #[serde(flatten)]
    pub fields: HashMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<ExecutionContext>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub performance: Option<PerformanceMetrics>,
}

/// Process information attached to JSON log lines
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub app_version: String,
    pub hostname: String,
    pub pid: u32,
    pub thread_id: String,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self {
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            pid: std::process::id(),
            thread_id: format!("{:?}", std::thread::current().id()),
        }
    }
}

/// Timing fields lifted out of a log event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub duration_ms: Option<u64>,
    /// Attempts made by a retried operation
    pub attempts: Option<u64>,
    /// Sub-agents or events handled by the operation
    pub items_processed: Option<u64>,
}

/// Layer writing each event as one JSON line to stdout
pub struct JsonFormatter {
    include_context: bool,
}

impl<S> Layer<S> for JsonFormatter
where
    S: Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        let mut visitor = JsonVisitor::default();
        event.record(&mut visitor);

        let level = match *event.metadata().level() {
            Level::ERROR => "ERROR",
            Level::WARN => "WARN",
            Level::INFO => "INFO",
            Level::DEBUG => "DEBUG",
            Level::TRACE => "TRACE",
        };

        let performance = visitor.extract_performance_metrics();

        let entry = StructuredLogEntry {
            timestamp: Utc::now().to_rfc3339(),
            level: level.to_string(),
            target: event.metadata().target().to_string(),
            message: visitor.message.unwrap_or_default(),
            fields: visitor.fields,
            context: self.include_context.then(ExecutionContext::default),
            performance,
        };

        if let Ok(json) = serde_json::to_string(&entry) {
            let _ = writeln!(io::stdout(), "{}", json);
        }
    }
}

#[derive(Default)]
struct JsonVisitor {
    message: Option<String>,
    fields: HashMap<String, Value>,
}

impl Visit for JsonVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{:?}", value));
        } else {
            self.fields
                .insert(field.name().to_string(), Value::String(format!("{:?}", value)));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.fields
                .insert(field.name().to_string(), Value::String(value.to_string()));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields
            .insert(field.name().to_string(), Value::Number(value.into()));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields
            .insert(field.name().to_string(), Value::Number(value.into()));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields
            .insert(field.name().to_string(), Value::Bool(value));
    }
}

impl JsonVisitor {
    fn extract_performance_metrics(&self) -> Option<PerformanceMetrics> {
        let metrics = PerformanceMetrics {
            duration_ms: self.get_u64_field("duration_ms"),
            attempts: self.get_u64_field("attempts"),
            items_processed: self.get_u64_field("items_count"),
        };

        if metrics.duration_ms.is_some()
            || metrics.attempts.is_some()
            || metrics.items_processed.is_some()
        {
            Some(metrics)
        } else {
            None
        }
    }

    fn get_u64_field(&self, name: &str) -> Option<u64> {
        self.fields.get(name).and_then(|v| v.as_u64())
    }
}

/// Logging setup for binaries embedding the runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum level ("error", "warn", "info", "debug", "trace"); RUST_LOG wins when set
    pub level: String,
    /// One JSON object per line instead of human-readable output
    pub json_output: bool,
    /// ANSI colours (plain output only)
    pub color_output: bool,
    /// Attach host/pid/thread to JSON lines
    pub include_context: bool,
    pub include_line_numbers: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_output: false,
            color_output: true,
            include_context: true,
            include_line_numbers: cfg!(debug_assertions),
        }
    }
}

impl LoggingConfig {
    pub fn level(&self) -> Level {
        Level::from_str(&self.level).unwrap_or(Level::INFO)
    }
}

/// Install the global subscriber described by `config`
pub fn init_structured_logging(config: LoggingConfig) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level().to_string()));

    if config.json_output {
        let json_layer = JsonFormatter {
            include_context: config.include_context,
        };

        let subscriber = Registry::default().with(env_filter).with(json_layer);

        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let fmt_layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_line_number(config.include_line_numbers)
            .with_ansi(config.color_output)
            .with_span_events(FmtSpan::CLOSE);

        let subscriber = Registry::default().with(env_filter).with(fmt_layer);

        tracing::subscriber::set_global_default(subscriber)?;
    }

    Ok(())
}

/// Test-friendly subscriber; repeated calls are ignored
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Logs the duration of an operation when finished
pub struct OperationTimer {
    start: std::time::Instant,
    operation_name: String,
    fields: HashMap<String, Value>,
}

impl OperationTimer {
    pub fn new(operation_name: impl Into<String>) -> Self {
        Self {
            start: std::time::Instant::now(),
            operation_name: operation_name.into(),
            fields: HashMap::new(),
        }
    }

    pub fn add_field(&mut self, key: impl Into<String>, value: impl Serialize) {
        if let Ok(v) = serde_json::to_value(value) {
            self.fields.insert(key.into(), v);
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    pub fn finish(self) {
        self.log_outcome(None);
    }

    /// Log at debug on success, at warn with the error on failure
    pub fn finish_with_result<T, E: std::fmt::Display>(self, result: &Result<T, E>) {
        self.log_outcome(result.as_ref().err().map(ToString::to_string));
    }

    fn log_outcome(self, error: Option<String>) {
        let duration_ms = self.elapsed_ms();
        let operation = self.operation_name.as_str();
        match error {
            None => tracing::debug!(
                operation,
                duration_ms,
                success = true,
                fields = ?self.fields,
                "Operation completed"
            ),
            Some(error) => tracing::warn!(
                operation,
                duration_ms,
                success = false,
                error = %error,
                fields = ?self.fields,
                "Operation failed"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structured_log_entry_serialization() {
        let mut fields = HashMap::new();
        fields.insert("agent".to_string(), Value::String("planner".to_string()));

        let entry = StructuredLogEntry {
            timestamp: "2024-01-01T00:00:00Z".to_string(),
            level: "INFO".to_string(),
            target: "agentflow_orchestrator::runner".to_string(),
            message: "Event processed".to_string(),
            fields,
            context: Some(ExecutionContext::default()),
            performance: Some(PerformanceMetrics {
                duration_ms: Some(12),
                attempts: Some(2),
                items_processed: None,
            }),
        };

        let json = serde_json::to_string(&entry).expect("serialize entry");
        assert!(json.contains("\"agent\":\"planner\""));
        assert!(json.contains("Event processed"));
        assert!(json.contains("duration_ms"));
    }

    #[test]
    fn test_logging_config_level_parsing() {
        let mut config = LoggingConfig::default();
        assert_eq!(config.level(), Level::INFO);

        config.level = "debug".to_string();
        assert_eq!(config.level(), Level::DEBUG);

        config.level = "not-a-level".to_string();
        assert_eq!(config.level(), Level::INFO);
    }

    #[test]
    fn test_logging_config_from_partial_json() {
        let config: LoggingConfig =
            serde_json::from_str(r#"{"json_output": true}"#).expect("parse config");
        assert!(config.json_output);
        assert_eq!(config.level, "info");
    }

    #[test]
    fn test_logging_config_json_round_trip() {
        let config = LoggingConfig {
            level: "warn".to_string(),
            json_output: true,
            color_output: false,
            include_context: false,
            include_line_numbers: true,
        };

        let json = serde_json::to_string(&config).expect("serialize config");
        let parsed: LoggingConfig = serde_json::from_str(&json).expect("parse config");
        assert_eq!(parsed.level(), Level::WARN);
        assert!(parsed.json_output);
        assert!(!parsed.color_output);
        assert!(!parsed.include_context);
        assert!(parsed.include_line_numbers);
    }

    #[test]
    fn test_operation_timer() {
        init_test_logging();

        let mut timer = OperationTimer::new("dispatch");
        timer.add_field("event_id", "evt-1");
        timer.add_field("items_count", 3);

        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(timer.elapsed_ms() >= 5);

        let outcome: Result<(), String> = Err("boom".to_string());
        timer.finish_with_result(&outcome);
    }
}
