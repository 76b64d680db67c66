//! Error types for the Arbiter engine.

use thiserror::Error;

/// Main error type for Arbiter operations.
#[derive(Error, Debug)]
pub enum ArbiterError {
    /// A duration literal could not be parsed
    #[error("Invalid duration: {0}")]
    InvalidDuration(String),

    /// An IP address or CIDR literal could not be parsed
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Malformed input supplied by the caller
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Arithmetic exceeded the 32-bit unsigned bound
    #[error("Overflow: {0}")]
    Overflow(String),

    /// The counter store could not serve the request
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// The remote decision service did not answer in time
    #[error("Remote call timed out after {0}ms")]
    RemoteTimeout(u64),

    /// The remote decision service returned an error
    #[error("Remote error: {0}")]
    Remote(String),

    /// A rule failed while being evaluated
    #[error("Rule evaluation error: {0}")]
    RuleEvaluation(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// gRPC transport errors
    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::transport::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<tonic::Status> for ArbiterError {
    fn from(status: tonic::Status) -> Self {
        ArbiterError::Remote(format!("{}: {}", status.code(), status.message()))
    }
}

impl From<config::ConfigError> for ArbiterError {
    fn from(err: config::ConfigError) -> Self {
        ArbiterError::Config(err.to_string())
    }
}

/// Result type alias for Arbiter operations.
pub type Result<T> = std::result::Result<T, ArbiterError>;
