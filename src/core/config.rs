//! # Configuration Module
//!
//! This module holds the driver configuration consumed by the balancer and the
//! loading mechanisms around it.
//!
//! ## Key Features
//! - YAML/JSON configuration parsing with serde
//! - Human readable durations (`"30s"`, `"1m"`) through `humantime_serde`
//! - Environment variable override support (`BALANCER_*`)
//! - Validation that reports every problem at once

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tonic::Code;

use crate::core::error::{BalancerError, BalancerResult};
use crate::load_balancing::strategies::SelectionStrategy;

const MAX_BACKOFF_MULTIPLIER: f64 = 100.0;

/// Top-level configuration for one driver instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Seed address used for discovery, or the only address in single-connection mode
    pub endpoint: String,

    /// Database path sent with every call
    pub database: String,

    /// Upper bound for a single discovery attempt (dial + enumerate + locality detection)
    #[serde(default = "default_dial_timeout", with = "humantime_serde")]
    pub dial_timeout: Option<Duration>,

    /// Attach the call site to call failures
    #[serde(default)]
    pub wrap_errors: bool,

    /// gRPC status codes (snake_case names) that ban the connection a call failed on
    #[serde(default = "default_pessimization_codes")]
    pub pessimization_codes: Vec<String>,

    #[serde(default)]
    pub balancer: BalancerConfig,

    #[serde(default)]
    pub discovery: DiscoveryConfig,

    #[serde(default)]
    pub retry: RetryPolicyConfig,

    #[serde(default)]
    pub meta: MetaConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl DriverConfig {
    pub fn new(endpoint: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            database: database.into(),
            dial_timeout: default_dial_timeout(),
            wrap_errors: false,
            pessimization_codes: default_pessimization_codes(),
            balancer: BalancerConfig::default(),
            discovery: DiscoveryConfig::default(),
            retry: RetryPolicyConfig::default(),
            meta: MetaConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a YAML file
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> BalancerResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| BalancerError::config(format!("Failed to read config file: {}", e)))?;

        let mut config: DriverConfig = serde_yaml::from_str(&content)
            .map_err(|e| BalancerError::config(format!("Failed to parse config: {}", e)))?;

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from JSON
    pub async fn load_from_json<P: AsRef<Path>>(path: P) -> BalancerResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| BalancerError::config(format!("Failed to read config file: {}", e)))?;

        let mut config: DriverConfig = serde_json::from_str(&content)
            .map_err(|e| BalancerError::config(format!("Failed to parse JSON config: {}", e)))?;

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `BALANCER_*` environment variable overrides
    pub fn apply_env_overrides(&mut self) -> BalancerResult<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> BalancerResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(endpoint) = lookup("BALANCER_ENDPOINT") {
            self.endpoint = endpoint;
        }

        if let Some(database) = lookup("BALANCER_DATABASE") {
            self.database = database;
        }

        if let Some(timeout) = lookup("BALANCER_DIAL_TIMEOUT") {
            let timeout = humantime::parse_duration(&timeout)
                .map_err(|e| BalancerError::config(format!("Invalid BALANCER_DIAL_TIMEOUT: {}", e)))?;
            self.dial_timeout = (!timeout.is_zero()).then_some(timeout);
        }

        if let Some(interval) = lookup("BALANCER_DISCOVERY_INTERVAL") {
            self.discovery.interval = humantime::parse_duration(&interval).map_err(|e| {
                BalancerError::config(format!("Invalid BALANCER_DISCOVERY_INTERVAL: {}", e))
            })?;
        }

        if let Some(value) = lookup("BALANCER_SINGLE_CONN") {
            self.balancer.single_conn = parse_bool("BALANCER_SINGLE_CONN", &value)?;
        }

        if let Some(value) = lookup("BALANCER_DETECT_LOCAL_DC") {
            self.balancer.detect_local_dc = parse_bool("BALANCER_DETECT_LOCAL_DC", &value)?;
        }

        if let Some(value) = lookup("BALANCER_ALLOW_FALLBACK") {
            self.balancer.allow_fallback = parse_bool("BALANCER_ALLOW_FALLBACK", &value)?;
        }

        if let Some(level) = lookup("BALANCER_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Some(format) = lookup("BALANCER_LOG_FORMAT") {
            self.logging.format = format;
        }

        Ok(())
    }

    /// Configuration validation with every problem reported at once
    pub fn validate(&self) -> BalancerResult<()> {
        let mut errors = Vec::new();

        if self.endpoint.is_empty() {
            errors.push("endpoint cannot be empty".to_string());
        }

        if let Some(timeout) = self.dial_timeout {
            if timeout.is_zero() {
                errors.push("dial_timeout must be greater than 0 when set".to_string());
            }
        }

        for name in &self.pessimization_codes {
            if parse_code(name).is_none() {
                errors.push(format!("Unknown pessimization code: {}", name));
            }
        }

        if self.balancer.detect_local_dc && !self.balancer.prefer_locations.is_empty() {
            errors.push("prefer_locations cannot be combined with detect_local_dc".to_string());
        }

        let multiplier = self.retry.backoff_multiplier;
        if !multiplier.is_finite() || !(1.0..=MAX_BACKOFF_MULTIPLIER).contains(&multiplier) {
            errors.push(format!(
                "retry backoff_multiplier must be between 1.0 and {}, got: {}",
                MAX_BACKOFF_MULTIPLIER, multiplier
            ));
        }

        if self.retry.base_delay > self.retry.max_delay {
            errors.push("retry base_delay cannot exceed max_delay".to_string());
        }

        if !(0.0..=1.0).contains(&self.retry.jitter) {
            errors.push(format!(
                "retry jitter must be between 0.0 and 1.0, got: {}",
                self.retry.jitter
            ));
        }

        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => errors.push(format!("Invalid log level: {}", self.logging.level)),
        }

        match self.logging.format.to_lowercase().as_str() {
            "json" | "text" => {}
            _ => errors.push(format!("Invalid log format: {}", self.logging.format)),
        }

        if !errors.is_empty() {
            return Err(BalancerError::config(format!(
                "Configuration validation failed:\n{}",
                errors.join("\n")
            )));
        }

        Ok(())
    }

    /// Parsed pessimization codes; unknown names are skipped (see [`DriverConfig::validate`])
    pub fn pessimization_codes(&self) -> Vec<Code> {
        self.pessimization_codes
            .iter()
            .filter_map(|name| parse_code(name))
            .collect()
    }

    /// Periodic rediscovery interval, `None` when refresh is disabled
    pub fn discovery_interval(&self) -> Option<Duration> {
        (!self.discovery.interval.is_zero()).then_some(self.discovery.interval)
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self::new("localhost:2135", "/local")
    }
}

/// Balancing policy
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BalancerConfig {
    /// Skip discovery and route every call through the configured endpoint
    #[serde(default)]
    pub single_conn: bool,

    /// Detect the nearest location and prefer its nodes
    #[serde(default)]
    pub detect_local_dc: bool,

    /// Use nodes outside the preferred tier once it has no allowed connection
    #[serde(default)]
    pub allow_fallback: bool,

    /// Static list of preferred locations, an alternative to detection
    #[serde(default)]
    pub prefer_locations: Vec<String>,

    /// Tie-break between allowed connections of one tier
    #[serde(default)]
    pub strategy: SelectionStrategy,
}

/// Discovery scheduling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Interval between background rediscoveries, `0s` disables them
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
        }
    }
}

/// Retry policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicyConfig {
    /// Maximum attempts, 0 retries until the context is done
    pub max_attempts: u32,

    /// Base delay between retries
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,

    /// Maximum delay between retries
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// Backoff multiplier
    pub backoff_multiplier: f64,

    /// Fraction of each delay that is randomised (0.0 - 1.0)
    #[serde(default)]
    pub jitter: f64,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

/// Values attached to every outgoing call
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetaConfig {
    #[serde(default)]
    pub application_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

fn default_dial_timeout() -> Option<Duration> {
    Some(Duration::from_secs(5))
}

fn default_pessimization_codes() -> Vec<String> {
    ["unavailable", "unknown", "internal", "data_loss", "deadline_exceeded"]
        .iter()
        .map(|code| code.to_string())
        .collect()
}

fn parse_bool(key: &str, value: &str) -> BalancerResult<bool> {
    value
        .parse()
        .map_err(|e| BalancerError::config(format!("Invalid {}: {}", key, e)))
}

/// Parse a gRPC status code from its snake_case (or upper-case) name
pub fn parse_code(name: &str) -> Option<Code> {
    let code = match name.to_lowercase().as_str() {
        "ok" => Code::Ok,
        "cancelled" | "canceled" => Code::Cancelled,
        "unknown" => Code::Unknown,
        "invalid_argument" => Code::InvalidArgument,
        "deadline_exceeded" => Code::DeadlineExceeded,
        "not_found" => Code::NotFound,
        "already_exists" => Code::AlreadyExists,
        "permission_denied" => Code::PermissionDenied,
        "resource_exhausted" => Code::ResourceExhausted,
        "failed_precondition" => Code::FailedPrecondition,
        "aborted" => Code::Aborted,
        "out_of_range" => Code::OutOfRange,
        "unimplemented" => Code::Unimplemented,
        "internal" => Code::Internal,
        "unavailable" => Code::Unavailable,
        "data_loss" => Code::DataLoss,
        "unauthenticated" => Code::Unauthenticated,
        _ => return None,
    };
    Some(code)
}
