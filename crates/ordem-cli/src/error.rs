//! Error types for the ordem CLI

use std::path::PathBuf;
use thiserror::Error;

use ordem::observability::ObservabilityError;
use ordem::DatabaseError;

/// Result type alias for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;

/// CLI error types
#[derive(Error, Debug)]
pub enum CliError {
    /// Configuration file read error
    #[error("Failed to read configuration file {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Configuration parse error
    #[error("Failed to parse configuration file {path}: {message}")]
    ConfigParse { path: PathBuf, message: String },

    /// Validation failure
    #[error("Configuration validation failed: {message}")]
    ValidationFailed { message: String },

    /// Invalid configuration value
    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    /// Logging could not be initialized
    #[error("Failed to initialize logging: {0}")]
    Logging(#[from] ObservabilityError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    /// Health check reported the database as unhealthy
    #[error("Database unhealthy: {message}")]
    Unhealthy { message: String },

    /// Credentials did not match
    #[error("Credentials rejected for {username}")]
    CredentialsRejected { username: String },

    /// Nothing was supplied on standard input
    #[error("Expected a secret on standard input")]
    EmptyInput,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CliError {
    /// Create a validation failure error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::ValidationFailed {
            message: message.into(),
        }
    }

    /// Create an invalid value error
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}
