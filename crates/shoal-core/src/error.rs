//! Core error types shared across the platform crates.

use thiserror::Error;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Cross-cutting platform errors
#[derive(Error, Debug)]
pub enum Error {
    /// A configuration value failed validation
    #[error("invalid configuration: {field}, reason: {reason}")]
    InvalidConfiguration { field: String, reason: String },

    /// Telemetry bootstrap failed
    #[error("telemetry initialization failed: {reason}")]
    TelemetryInit { reason: String },

    /// Internal invariant broken
    #[error("internal error: {reason}")]
    Internal { reason: String },

    /// Foreign error raised by an embedding platform
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Create an invalid configuration error
    pub fn invalid_configuration(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create an internal error
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }
}
