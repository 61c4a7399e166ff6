//! Tracing bootstrap.

use crate::error::{Error, Result};
use tracing_subscriber::EnvFilter;

/// Telemetry configuration
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name reported on the root span
    pub service_name: String,
    /// Log level filter used when `RUST_LOG` is not set
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "shoal".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl TelemetryConfig {
    /// Create a configuration with the given service name
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    /// Set the fallback log level filter
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    /// Create from environment (`SHOAL_SERVICE_NAME`, `RUST_LOG`)
    pub fn from_env() -> Self {
        Self {
            service_name: std::env::var("SHOAL_SERVICE_NAME")
                .unwrap_or_else(|_| "shoal".to_string()),
            log_level: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        }
    }
}

/// Install a global tracing subscriber with an env filter and fmt output.
///
/// Fails with [`Error::TelemetryInit`] if a subscriber is already installed;
/// use [`try_init_telemetry`] where double-initialization is expected (tests).
pub fn init_telemetry(config: &TelemetryConfig) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .try_init()
        .map_err(|e| Error::TelemetryInit {
            reason: e.to_string(),
        })?;

    tracing::info!(service = %config.service_name, "telemetry initialized");
    Ok(())
}

/// Like [`init_telemetry`], but tolerates an already-installed subscriber.
pub fn try_init_telemetry(config: &TelemetryConfig) {
    let _ = init_telemetry(config);
}
