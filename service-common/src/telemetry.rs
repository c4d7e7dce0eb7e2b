//! Tracing subscriber setup.

use std::fmt;
use std::str::FromStr;

use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::PlatformError;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Pretty,
    /// One JSON object per event
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format '{other}', expected 'pretty' or 'json'")),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pretty => "pretty",
            Self::Json => "json",
        })
    }
}

/// Tracing configuration.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Service name for tracing
    pub service_name: String,
    /// Log level filter, used when `RUST_LOG` is unset
    pub log_level: String,
    /// Output format
    pub format: LogFormat,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            service_name: "service".to_string(),
            log_level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl TracingConfig {
    /// Create config with custom service name.
    #[must_use]
    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    /// Create config with custom log level.
    #[must_use]
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    /// Set the output format.
    #[must_use]
    pub const fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable JSON output.
    #[must_use]
    pub const fn with_json_output(self) -> Self {
        self.with_format(LogFormat::Json)
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.log_level))
    }
}

/// Initialize tracing with the given configuration.
///
/// Should be called once at application startup.
///
/// # Panics
///
/// Panics if a global subscriber is already installed; use
/// [`try_init_tracing`] where that can happen.
pub fn init_tracing(config: &TracingConfig) {
    let registry = tracing_subscriber::registry().with(config.filter());
    match config.format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
    info!(service = %config.service_name, format = %config.format, "Tracing initialized");
}

/// Like [`init_tracing`] but reports an existing subscriber as an error.
///
/// # Errors
///
/// Returns [`PlatformError::Internal`] when a global subscriber is already set.
pub fn try_init_tracing(config: &TracingConfig) -> Result<(), PlatformError> {
    let registry = tracing_subscriber::registry().with(config.filter());
    let result = match config.format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).try_init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).try_init(),
    };
    result.map_err(|e| PlatformError::internal(format!("tracing already initialized: {e}")))?;
    info!(service = %config.service_name, format = %config.format, "Tracing initialized");
    Ok(())
}
