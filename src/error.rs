//! Error types for the MySQL adapter.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Construction-time problems (missing connection strings, unknown connection names)
//! are returned directly; execution failures are mirrored here for the `try_*`
//! operations after the adapter observers have seen them.

use crate::db::failure::DriverError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Connection '{name}' not found in file '{file}'")]
    ConnectionNotFound { name: String, file: String },

    #[error("I/O error on '{path}': {message}")]
    Io { path: String, message: String },

    #[error("Database error {code}: {message}")]
    Database {
        /// MySQL error number, e.g. 1064 for a syntax error
        code: u16,
        message: String,
    },

    #[error("Timeout: {operation} exceeded {elapsed_secs}s")]
    Timeout {
        operation: String,
        elapsed_secs: u64,
    },

    #[error("Driver error: {message}")]
    Driver { message: String },

    #[error("Gave up after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("Operation cancelled: adapter is closed")]
    Cancelled,

    #[error("Cannot reject {requested} items, only {pending} pending")]
    RejectOutOfRange { requested: usize, pending: usize },

    #[error("Row composition error: {message}")]
    Composition { message: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Decode error: {message}")]
    Decode { message: String },
}

impl AdapterError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a connection not found error.
    pub fn connection_not_found(name: impl Into<String>, file: impl Into<String>) -> Self {
        Self::ConnectionNotFound {
            name: name.into(),
            file: file.into(),
        }
    }

    /// Create an I/O error for the given path.
    pub fn io(path: impl Into<String>, err: &std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            message: err.to_string(),
        }
    }

    /// Create a composition error.
    pub fn composition(message: impl Into<String>) -> Self {
        Self::Composition {
            message: message.into(),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create a retries exhausted error.
    pub fn retries_exhausted(attempts: u32, last_error: &DriverError) -> Self {
        Self::RetriesExhausted {
            attempts,
            last_error: last_error.to_string(),
        }
    }

    /// Check if this error came from executing a statement (as opposed to setup).
    pub fn is_execution_error(&self) -> bool {
        matches!(
            self,
            Self::Database { .. }
                | Self::Timeout { .. }
                | Self::Driver { .. }
                | Self::RetriesExhausted { .. }
                | Self::Cancelled
        )
    }
}

/// Convert a classified driver failure into the caller-facing error.
impl From<DriverError> for AdapterError {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::Database { code, message, .. } => AdapterError::Database { code, message },
            DriverError::Timeout { elapsed } => AdapterError::Timeout {
                operation: "command execution".to_string(),
                elapsed_secs: elapsed.as_secs(),
            },
            DriverError::Decode { message } => AdapterError::Decode { message },
            DriverError::Connection { message } | DriverError::Other { message } => {
                AdapterError::Driver { message }
            }
        }
    }
}

/// Result type alias for adapter operations.
pub type AdapterResult<T> = Result<T, AdapterError>;
