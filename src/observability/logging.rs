//! # Structured Logging
//!
//! Installs a `tracing` subscriber for applications that do not bring their own.
//!
//! ## Key Features
//! - Text or JSON output selected by [`LoggingConfig::format`]
//! - `RUST_LOG` directives layered over the configured level
//! - Safe to call more than once; later calls leave the first subscriber in place

use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::core::config::LoggingConfig;

/// Output format of the installed subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    pub fn parse(format: &str) -> Self {
        match format.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Text,
        }
    }
}

/// Parse a level name, defaulting to `INFO`
pub fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Install the global subscriber. Returns `false` when one was already installed.
pub fn init_logging(config: &LoggingConfig) -> bool {
    let level = parse_level(&config.level);
    let env_filter = EnvFilter::from_default_env().add_directive(level.into());

    let installed = match LogFormat::parse(&config.format) {
        LogFormat::Json => Registry::default()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_target(true),
            )
            .try_init()
            .is_ok(),
        LogFormat::Text => Registry::default()
            .with(env_filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .try_init()
            .is_ok(),
    };

    if installed {
        info!(level = %level, format = %config.format, "Structured logging initialized");
    } else {
        warn!("Tracing subscriber already initialized, skipping initialization");
    }
    installed
}
