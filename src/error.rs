//! Error types for the Gatekeeper service.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Gatekeeper operations.
#[derive(Error, Debug)]
pub enum GatekeeperError {
    /// Configuration-related errors. Fatal at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// HTTP server errors
    #[error("HTTP error: {0}")]
    Http(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A runtime failure inside a single limit evaluator.
///
/// Faults never deny a request. They are logged at the evaluator boundary
/// and the evaluator reports no violation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EvaluationFault {
    /// The geo resolver did not answer in time.
    #[error("geo lookup for {ip} timed out after {timeout:?}")]
    GeoTimeout { ip: String, timeout: Duration },

    /// The geo resolver returned an error.
    #[error("geo lookup for {ip} failed: {reason}")]
    GeoLookup { ip: String, reason: String },
}

/// Result type alias for Gatekeeper operations.
pub type Result<T> = std::result::Result<T, GatekeeperError>;
