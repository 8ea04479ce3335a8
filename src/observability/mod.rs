// Structured logging
pub mod logging;

// Metric descriptions
pub mod metrics;

pub use logging::{init_logging, LogFormat};
pub use metrics::describe_metrics;
