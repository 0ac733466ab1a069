pub mod config_base;
pub mod structured_logging;

pub use config_base::{QueueConfigBase, TimeoutConfigBase};

pub use structured_logging::{
    init_structured_logging,
    init_test_logging,
    ExecutionContext,
    LoggingConfig,
    OperationTimer,
    PerformanceMetrics,
    StructuredLogEntry,
};
