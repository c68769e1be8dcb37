//! Error types for Halo.
//!
//! One taxonomy covers the registry, the control bus and the variable engine.
//! Control errors map onto JSON-RPC error codes so they can cross the wire.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the Halo core.
#[derive(Debug, Error)]
pub enum HaloError {
    // Registry and discovery errors
    #[error("Failed to enumerate instances: {message}")]
    DiscoveryFailed { message: String },

    #[error("Instance name \"{name}\" is already registered by PID {pid}")]
    RegistrationConflict { name: String, pid: u32 },

    #[error("No running instance named \"{name}\"")]
    InstanceNotFound { name: String },

    // Control errors
    #[error("{method} call to \"{instance}\" failed: {message}")]
    CallFailed {
        instance: String,
        method: String,
        message: String,
    },

    /// The remote process exited while the call was in flight.
    ///
    /// Only produced for `Quit`, where exiting is the requested outcome.
    #[error("\"{instance}\" exited before replying to {method}")]
    ExpectedNoReply { instance: String, method: String },

    #[error("Proxy for \"{instance}\" was already released")]
    ProxyReleased { instance: String },

    #[error("Invalid params: {message}")]
    InvalidParams { message: String },

    #[error("Unknown control method: {method}")]
    MethodNotFound { method: String },

    #[error("{message}")]
    Handler { message: String },

    // Variable errors
    #[error("Variable used after dispose")]
    UseAfterDispose,

    #[error("Command {command} failed: {message}")]
    CommandFailed { command: String, message: String },

    // Database errors
    #[error("Database error: {message}")]
    Database {
        message: String,
        #[source]
        source: Option<rusqlite::Error>,
    },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for Halo operations.
pub type Result<T> = std::result::Result<T, HaloError>;

impl From<std::io::Error> for HaloError {
    fn from(err: std::io::Error) -> Self {
        HaloError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for HaloError {
    fn from(err: serde_json::Error) -> Self {
        HaloError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<rusqlite::Error> for HaloError {
    fn from(err: rusqlite::Error) -> Self {
        HaloError::Database {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl HaloError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        HaloError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Shorthand for a handler-side failure reported back to the caller.
    pub fn handler(message: impl Into<String>) -> Self {
        HaloError::Handler {
            message: message.into(),
        }
    }

    /// Convert to a JSON-RPC error code.
    ///
    /// Standard codes:
    /// - -32700: Parse error
    /// - -32600: Invalid Request
    /// - -32601: Method not found
    /// - -32602: Invalid params
    /// - -32603: Internal error
    ///
    /// Application codes:
    /// - -32000: Handler reported a failure
    /// - -32001: Instance not found
    /// - -32005: Validation error
    pub fn to_rpc_error_code(&self) -> i32 {
        match self {
            HaloError::Handler { .. } | HaloError::CommandFailed { .. } => -32000,

            HaloError::InstanceNotFound { .. } => -32001,

            HaloError::MethodNotFound { .. } => -32601,

            HaloError::InvalidParams { .. } => -32602,

            HaloError::Validation { .. } => -32005,

            _ => -32603,
        }
    }

    /// Whether this is the benign outcome of asking an instance to quit.
    pub fn is_expected_no_reply(&self) -> bool {
        matches!(self, HaloError::ExpectedNoReply { .. })
    }
}
