//! # Error Handling Module
//!
//! This module defines every error the balancer can surface, using the `thiserror` crate.
//! It also carries the two classifications the rest of the crate depends on:
//!
//! - **Retryability**: whether the retry policy may run an operation again. Errors can be
//!   explicitly tagged as retryable with [`BalancerError::retryable`], which wraps the
//!   original cause instead of replacing it.
//! - **Context errors**: whether a failure was caused by a cancelled or expired [`Context`].
//!   These are recognised structurally (also through the retryable wrapper), never by
//!   matching on message strings.
//!
//! ## Rust Error Handling Concepts
//!
//! - `Result<T, E>` instead of exceptions, with `?` for propagation
//! - Enum variants instead of exception hierarchies, so `match` covers every case
//! - `#[source]` keeps the cause chain available through `std::error::Error::source`
//!
//! [`Context`]: crate::core::context::Context

use std::convert::Infallible;
use std::panic::Location;

use thiserror::Error;
use tonic::Code;

/// Main result type used throughout the balancer
pub type BalancerResult<T> = Result<T, BalancerError>;

/// Comprehensive error types for the balancer
#[derive(Debug, Error, Clone)]
pub enum BalancerError {
    /// Selection found no allowed connection after exhausting every permitted tier
    #[error("no endpoints: cannot get connection from balancer after {attempts} attempts")]
    NoEndpoints { attempts: usize },

    /// The discovery client failed to enumerate the cluster
    #[error("Service discovery error: {message}")]
    Discovery { message: String },

    /// The locality detector failed to determine the caller's location
    #[error("Locality detection error: {message}")]
    Locality { message: String },

    /// A transport could not be established to an address
    #[error("Dial error ({address}): {message}")]
    Dial { address: String, message: String },

    /// The wrapped error may be retried regardless of its own classification
    #[error("retryable: {cause}")]
    Retryable {
        #[source]
        cause: Box<BalancerError>,
    },

    /// The remote call itself failed; the status is passed through unchanged
    #[error("rpc error: {status}{}", format_location(.location))]
    Call {
        status: tonic::Status,
        location: Option<&'static Location<'static>>,
    },

    /// The caller's context was cancelled
    #[error("context canceled")]
    Canceled,

    /// The caller's context deadline passed
    #[error("context deadline exceeded")]
    DeadlineExceeded,

    /// The balancer was closed and no longer serves calls
    #[error("balancer is closed")]
    Closed,

    /// Retry budget was exhausted while every failure was retryable
    #[error("retry attempts exhausted after {attempts} attempts: {last_error}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        last_error: Box<BalancerError>,
    },

    /// Configuration-related errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Call metadata could not be encoded into request headers
    #[error("Invalid call metadata '{key}': {message}")]
    InvalidMetadata { key: String, message: String },

    /// Request message encoding failed
    #[error("Encode error: {message}")]
    Encode { message: String },

    /// Response message decoding failed
    #[error("Decode error: {message}")]
    Decode { message: String },

    /// Internal errors for unexpected failures
    #[error("Internal error: {message}")]
    Internal { message: String },

    /// I/O errors (config files, sockets)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// JSON serialization/deserialization errors
    #[error("JSON error: {message}")]
    Json { message: String },

    /// YAML parsing errors for configuration files
    #[error("YAML error: {message}")]
    Yaml { message: String },
}

fn format_location(location: &Option<&'static Location<'static>>) -> String {
    match location {
        Some(location) => format!(" at `{}:{}`", location.file(), location.line()),
        None => String::new(),
    }
}

impl BalancerError {
    /// Create a discovery error with a custom message
    pub fn discovery<S: Into<String>>(message: S) -> Self {
        Self::Discovery {
            message: message.into(),
        }
    }

    /// Create a locality detection error with a custom message
    pub fn locality<S: Into<String>>(message: S) -> Self {
        Self::Locality {
            message: message.into(),
        }
    }

    /// Create a dial error for an address
    pub fn dial<A: Into<String>, S: Into<String>>(address: A, message: S) -> Self {
        Self::Dial {
            address: address.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error with a custom message
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create a call failure from a transport status
    pub fn call(status: tonic::Status) -> Self {
        Self::Call {
            status,
            location: None,
        }
    }

    /// Tag an error as retryable, keeping the original as its cause.
    ///
    /// Tagging an already retryable error does not nest wrappers.
    pub fn retryable(err: BalancerError) -> Self {
        match err {
            err @ Self::Retryable { .. } => err,
            err => Self::Retryable {
                cause: Box::new(err),
            },
        }
    }

    /// Record the caller's source location on a call failure.
    ///
    /// Only `Call` errors carry a location; the status code is untouched, so
    /// classification is identical with or without it.
    #[track_caller]
    pub fn with_stack_trace(self) -> Self {
        match self {
            Self::Call { status, .. } => Self::Call {
                status,
                location: Some(Location::caller()),
            },
            Self::Retryable { cause } => Self::Retryable {
                cause: Box::new(cause.with_stack_trace()),
            },
            other => other,
        }
    }

    /// The innermost error, looking through retryable tags and exhausted retries
    pub fn root(&self) -> &BalancerError {
        match self {
            Self::Retryable { cause } => cause.root(),
            Self::RetryExhausted { last_error, .. } => last_error.root(),
            other => other,
        }
    }

    /// The transport status code, if this is a call failure
    pub fn code(&self) -> Option<Code> {
        match self.root() {
            Self::Call { status, .. } => Some(status.code()),
            _ => None,
        }
    }

    /// Check whether this error was caused by a cancelled or expired context
    pub fn is_context_error(&self) -> bool {
        matches!(self.root(), Self::Canceled | Self::DeadlineExceeded)
    }

    /// Check whether selection failed for lack of endpoints
    pub fn is_no_endpoints(&self) -> bool {
        matches!(self.root(), Self::NoEndpoints { .. })
    }

    /// Check if this error may be retried.
    ///
    /// `idempotent` widens the set: failures after which the remote side may or
    /// may not have applied the operation are only retried when repeating the
    /// operation is safe.
    pub fn is_retryable(&self, idempotent: bool) -> bool {
        match self {
            Self::Retryable { .. } => true,
            Self::Canceled | Self::DeadlineExceeded | Self::Closed => false,
            Self::Dial { .. } | Self::NoEndpoints { .. } => true,
            Self::Discovery { .. } | Self::Locality { .. } | Self::Io { .. } => idempotent,
            Self::Call { status, .. } => match status.code() {
                Code::Unavailable | Code::ResourceExhausted | Code::Aborted => true,
                Code::Internal | Code::Unknown | Code::DeadlineExceeded | Code::Cancelled => {
                    idempotent
                }
                _ => false,
            },
            _ => false,
        }
    }

    /// Get a string representation of the error type for metrics labels
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::NoEndpoints { .. } => "no_endpoints",
            Self::Discovery { .. } => "discovery_error",
            Self::Locality { .. } => "locality_error",
            Self::Dial { .. } => "dial_error",
            Self::Retryable { cause } => cause.error_type(),
            Self::Call { .. } => "call_error",
            Self::Canceled => "canceled",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Closed => "closed",
            Self::RetryExhausted { last_error, .. } => last_error.error_type(),
            Self::Configuration { .. } => "configuration_error",
            Self::InvalidMetadata { .. } => "invalid_metadata",
            Self::Encode { .. } => "encode_error",
            Self::Decode { .. } => "decode_error",
            Self::Internal { .. } => "internal_error",
            Self::Io { .. } => "io_error",
            Self::Json { .. } => "json_error",
            Self::Yaml { .. } => "yaml_error",
        }
    }
}

impl From<Infallible> for BalancerError {
    fn from(infallible: Infallible) -> Self {
        match infallible {}
    }
}

impl From<tonic::Status> for BalancerError {
    fn from(status: tonic::Status) -> Self {
        Self::call(status)
    }
}

impl From<std::io::Error> for BalancerError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for BalancerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json {
            message: err.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for BalancerError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Yaml {
            message: err.to_string(),
        }
    }
}

impl From<prost::EncodeError> for BalancerError {
    fn from(err: prost::EncodeError) -> Self {
        Self::Encode {
            message: err.to_string(),
        }
    }
}

impl From<prost::DecodeError> for BalancerError {
    fn from(err: prost::DecodeError) -> Self {
        Self::Decode {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_wrapper_keeps_cause() {
        let err = BalancerError::retryable(BalancerError::DeadlineExceeded);
        assert!(err.is_retryable(false));
        assert!(err.is_context_error());
        assert!(matches!(err.root(), BalancerError::DeadlineExceeded));

        // no double wrapping
        let twice = BalancerError::retryable(err.clone());
        assert!(matches!(twice, BalancerError::Retryable { ref cause } if matches!(**cause, BalancerError::DeadlineExceeded)));
    }

    #[test]
    fn test_exhausted_retries_keep_last_error() {
        let err = BalancerError::RetryExhausted {
            attempts: 2,
            last_error: Box::new(BalancerError::retryable(BalancerError::DeadlineExceeded)),
        };
        assert!(err.is_context_error());
        assert!(!err.is_retryable(true));
        assert_eq!(err.error_type(), "deadline_exceeded");
        assert!(std::error::Error::source(&err).is_some());

        let call = BalancerError::RetryExhausted {
            attempts: 3,
            last_error: Box::new(BalancerError::call(tonic::Status::unavailable("down"))),
        };
        assert_eq!(call.code(), Some(Code::Unavailable));
    }

    #[test]
    fn test_stack_trace_does_not_change_code() {
        let plain = BalancerError::call(tonic::Status::unavailable("node down"));
        let traced = plain.clone().with_stack_trace();

        assert_eq!(plain.code(), Some(Code::Unavailable));
        assert_eq!(traced.code(), Some(Code::Unavailable));
        assert!(traced.to_string().contains("error.rs"));
        assert!(!plain.to_string().contains(" at `"));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(BalancerError::call(tonic::Status::unavailable("x")).is_retryable(false));
        assert!(!BalancerError::call(tonic::Status::internal("x")).is_retryable(false));
        assert!(BalancerError::call(tonic::Status::internal("x")).is_retryable(true));
        assert!(!BalancerError::call(tonic::Status::invalid_argument("x")).is_retryable(true));
        assert!(BalancerError::discovery("boom").is_retryable(true));
        assert!(!BalancerError::discovery("boom").is_retryable(false));
        assert!(!BalancerError::Canceled.is_retryable(true));
        assert!(!BalancerError::config("bad").is_retryable(true));
    }

    #[test]
    fn test_no_endpoints_message() {
        let err = BalancerError::NoEndpoints { attempts: 3 };
        assert!(err.is_no_endpoints());
        assert_eq!(
            err.to_string(),
            "no endpoints: cannot get connection from balancer after 3 attempts"
        );
        assert_eq!(err.error_type(), "no_endpoints");
    }
}
