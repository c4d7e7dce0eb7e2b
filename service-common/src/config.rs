//! Environment-driven configuration with validation.
//!
//! [`Settings::from_env`] reads every knob once at startup and hands out the
//! typed config structs the rest of the crate is built from.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use http::StatusCode;
use thiserror::Error;
use tonic::Code;

use crate::auth::AuthConfig;
use crate::client::{HttpClientConfig, RpcClientConfig};
use crate::error::PlatformError;
use crate::rate_limiter::RateLimitConfig;
use crate::retry::{
    DEFAULT_BACKOFF_FACTOR, DEFAULT_INITIAL_DELAY, DEFAULT_MAX_DELAY, DEFAULT_MAX_RETRIES,
    RetryPolicy,
};
use crate::telemetry::{LogFormat, TracingConfig};

/// Upper bound for every configured timeout, delay and TTL (30 days).
pub const MAX_DURATION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Configuration errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Environment variable parse error
    #[error("Failed to parse environment variable {name}: {reason}")]
    ParseError {
        /// Variable name
        name: String,
        /// Parser message
        reason: String,
    },

    /// A value parsed but violates a constraint
    #[error("Invalid {field}: {reason}")]
    Invalid {
        /// Variable name
        field: String,
        /// Violated constraint
        reason: String,
    },
}

impl From<ConfigError> for PlatformError {
    fn from(err: ConfigError) -> Self {
        Self::InvalidInput(err.to_string())
    }
}

/// Process-wide settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// `SERVICE_NAME`
    pub service_name: String,
    /// `LOG_LEVEL`
    pub log_level: String,
    /// `LOG_FORMAT` (`pretty` or `json`)
    pub log_format: LogFormat,
    /// `OUTBOUND_TIMEOUT_SECS`
    pub outbound_timeout: Duration,
    /// `RETRY_MAX_RETRIES`
    pub retry_max_retries: u32,
    /// `RETRY_INITIAL_DELAY_MS`
    pub retry_initial_delay: Duration,
    /// `RETRY_MAX_DELAY_MS`
    pub retry_max_delay: Duration,
    /// `RETRY_BACKOFF_FACTOR`
    pub retry_backoff_factor: f64,
    /// `RATE_LIMIT_RATE`
    pub rate_limit_rate: f64,
    /// `RATE_LIMIT_BURST`
    pub rate_limit_burst: u32,
    /// `RATE_LIMIT_TTL_SECS`
    pub rate_limit_ttl: Duration,
    /// `RATE_LIMIT_CLEANUP_SECS`
    pub rate_limit_cleanup: Duration,
    /// `AUTH_ENABLED`
    pub auth_enabled: bool,
    /// `AUTH_CACHE_TTL_SECS`
    pub auth_cache_ttl: Duration,
    /// `AUTH_REQUIRED_SCOPE`
    pub auth_required_scope: Option<String>,
    /// `AUTH_SKIP_PATHS`, comma separated
    pub auth_skip_paths: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        let rate_limit = RateLimitConfig::default();
        Self {
            service_name: "service".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            outbound_timeout: crate::client::DEFAULT_TIMEOUT,
            retry_max_retries: DEFAULT_MAX_RETRIES,
            retry_initial_delay: DEFAULT_INITIAL_DELAY,
            retry_max_delay: DEFAULT_MAX_DELAY,
            retry_backoff_factor: DEFAULT_BACKOFF_FACTOR,
            rate_limit_rate: rate_limit.rate,
            rate_limit_burst: rate_limit.burst,
            rate_limit_ttl: rate_limit.ttl,
            rate_limit_cleanup: rate_limit.cleanup_interval,
            auth_enabled: true,
            auth_cache_ttl: crate::auth::DEFAULT_CACHE_TTL,
            auth_required_scope: None,
            auth_skip_paths: Vec::new(),
        }
    }
}

impl Settings {
    /// Loads settings from the environment (after `.env`) with validation.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] naming the first bad variable.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Loads settings through `lookup`, falling back to defaults.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] naming the first bad variable.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let vars = Vars(lookup);

        let settings = Self {
            service_name: vars.string("SERVICE_NAME").unwrap_or(defaults.service_name),
            log_level: vars.string("LOG_LEVEL").unwrap_or(defaults.log_level),
            log_format: vars.parse("LOG_FORMAT", defaults.log_format)?,
            outbound_timeout: vars.secs("OUTBOUND_TIMEOUT_SECS", defaults.outbound_timeout)?,
            retry_max_retries: vars.parse("RETRY_MAX_RETRIES", defaults.retry_max_retries)?,
            retry_initial_delay: vars.millis("RETRY_INITIAL_DELAY_MS", defaults.retry_initial_delay)?,
            retry_max_delay: vars.millis("RETRY_MAX_DELAY_MS", defaults.retry_max_delay)?,
            retry_backoff_factor: vars.parse("RETRY_BACKOFF_FACTOR", defaults.retry_backoff_factor)?,
            rate_limit_rate: vars.parse("RATE_LIMIT_RATE", defaults.rate_limit_rate)?,
            rate_limit_burst: vars.parse("RATE_LIMIT_BURST", defaults.rate_limit_burst)?,
            rate_limit_ttl: vars.secs("RATE_LIMIT_TTL_SECS", defaults.rate_limit_ttl)?,
            rate_limit_cleanup: vars.secs("RATE_LIMIT_CLEANUP_SECS", defaults.rate_limit_cleanup)?,
            auth_enabled: vars.parse("AUTH_ENABLED", defaults.auth_enabled)?,
            auth_cache_ttl: vars.secs("AUTH_CACHE_TTL_SECS", defaults.auth_cache_ttl)?,
            auth_required_scope: vars.string("AUTH_REQUIRED_SCOPE"),
            auth_skip_paths: vars.list("AUTH_SKIP_PATHS"),
        };

        settings.validate()?;
        Ok(settings)
    }

    /// Validates the settings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &str, reason: &str| {
            Err(ConfigError::Invalid {
                field: field.to_string(),
                reason: reason.to_string(),
            })
        };

        if self.outbound_timeout.is_zero() {
            return invalid("OUTBOUND_TIMEOUT_SECS", "must be greater than 0");
        }
        if !(self.retry_backoff_factor.is_finite() && self.retry_backoff_factor > 1.0) {
            return invalid("RETRY_BACKOFF_FACTOR", "must be greater than 1.0");
        }
        if self.retry_max_delay < self.retry_initial_delay {
            return invalid("RETRY_MAX_DELAY_MS", "must not be below RETRY_INITIAL_DELAY_MS");
        }
        if !(self.rate_limit_rate.is_finite() && self.rate_limit_rate > 0.0) {
            return invalid("RATE_LIMIT_RATE", "must be greater than 0");
        }
        if self.rate_limit_burst == 0 {
            return invalid("RATE_LIMIT_BURST", "must be at least 1");
        }
        if self.rate_limit_ttl.is_zero() {
            return invalid("RATE_LIMIT_TTL_SECS", "must be greater than 0");
        }
        if self.rate_limit_cleanup.is_zero() {
            return invalid("RATE_LIMIT_CLEANUP_SECS", "must be greater than 0");
        }
        if self.auth_cache_ttl.is_zero() {
            return invalid("AUTH_CACHE_TTL_SECS", "must be greater than 0");
        }

        let bounded = [
            ("OUTBOUND_TIMEOUT_SECS", self.outbound_timeout),
            ("RETRY_INITIAL_DELAY_MS", self.retry_initial_delay),
            ("RETRY_MAX_DELAY_MS", self.retry_max_delay),
            ("RATE_LIMIT_TTL_SECS", self.rate_limit_ttl),
            ("RATE_LIMIT_CLEANUP_SECS", self.rate_limit_cleanup),
            ("AUTH_CACHE_TTL_SECS", self.auth_cache_ttl),
        ];
        if let Some((field, _)) = bounded.iter().find(|(_, value)| *value > MAX_DURATION) {
            return invalid(field, "must not exceed 30 days");
        }
        Ok(())
    }

    /// Retry policy over HTTP statuses.
    #[must_use]
    pub fn http_retry_policy(&self) -> RetryPolicy<StatusCode> {
        self.retry_policy(RetryPolicy::default())
    }

    /// Retry policy over gRPC codes.
    #[must_use]
    pub fn rpc_retry_policy(&self) -> RetryPolicy<Code> {
        self.retry_policy(RetryPolicy::default())
    }

    fn retry_policy<C: PartialEq>(&self, base: RetryPolicy<C>) -> RetryPolicy<C> {
        base.with_max_retries(self.retry_max_retries)
            .with_initial_delay(self.retry_initial_delay)
            .with_max_delay(self.retry_max_delay)
            .with_backoff_factor(self.retry_backoff_factor)
    }

    /// Outbound HTTP client config for `service` at `base_url`.
    #[must_use]
    pub fn http_client_config(&self, service: &str, base_url: &str) -> HttpClientConfig {
        HttpClientConfig::new(service, base_url)
            .with_timeout(self.outbound_timeout)
            .with_retry(self.http_retry_policy())
    }

    /// Outbound gRPC client config for `service` at `target`.
    #[must_use]
    pub fn rpc_client_config(&self, service: &str, target: &str) -> RpcClientConfig {
        RpcClientConfig::new(service, target)
            .with_timeout(self.outbound_timeout)
            .with_retry(self.rpc_retry_policy())
    }

    /// Rate limiter config.
    #[must_use]
    pub fn rate_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig::default()
            .with_name(format!("{}_rate_limiter", self.service_name))
            .with_rate(self.rate_limit_rate, self.rate_limit_burst)
            .with_ttl(self.rate_limit_ttl)
            .with_cleanup_interval(self.rate_limit_cleanup)
    }

    /// Inbound auth config.
    #[must_use]
    pub fn auth_config(&self) -> AuthConfig {
        let mut config = AuthConfig::default()
            .with_enabled(self.auth_enabled)
            .with_cache_ttl(self.auth_cache_ttl);
        if let Some(scope) = &self.auth_required_scope {
            config = config.with_required_scope(scope.clone());
        }
        for path in &self.auth_skip_paths {
            config = config.with_skip_path(path.clone());
        }
        config
    }

    /// Tracing config.
    #[must_use]
    pub fn tracing_config(&self) -> TracingConfig {
        TracingConfig::default()
            .with_service_name(&self.service_name)
            .with_log_level(&self.log_level)
            .with_format(self.log_format)
    }
}

struct Vars<F>(F);

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.0)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: FromStr>(&self, name: &str, default: T) -> Result<T, ConfigError>
    where
        T::Err: std::fmt::Display,
    {
        match self.string(name) {
            Some(val) => val.parse().map_err(|e: T::Err| ConfigError::ParseError {
                name: name.to_string(),
                reason: e.to_string(),
            }),
            None => Ok(default),
        }
    }

    fn secs(&self, name: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(name, default.as_secs()).map(Duration::from_secs)
    }

    fn millis(&self, name: &str, default: Duration) -> Result<Duration, ConfigError> {
        let default = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
        self.parse(name, default).map(Duration::from_millis)
    }

    fn list(&self, name: &str) -> Vec<String> {
        self.string(name)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<Settings, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Settings::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let settings = load(&[]).expect("defaults are valid");
        assert_eq!(settings.outbound_timeout, Duration::from_secs(30));
        assert_eq!(settings.retry_max_retries, 3);
        assert_eq!(settings.retry_initial_delay, Duration::from_millis(500));
        assert_eq!(settings.rate_limit_burst, 20);
        assert_eq!(settings.rate_limit_ttl, Duration::from_secs(3600));
        assert_eq!(settings.auth_cache_ttl, Duration::from_secs(300));
        assert!(settings.auth_enabled);
    }

    #[test]
    fn test_durations_are_capped() {
        let err = load(&[("AUTH_CACHE_TTL_SECS", "18446744073709551615")]).expect_err("too long");
        assert!(matches!(err, ConfigError::Invalid { ref field, .. } if field == "AUTH_CACHE_TTL_SECS"));

        let err = load(&[("OUTBOUND_TIMEOUT_SECS", "2592001")]).expect_err("too long");
        assert!(matches!(err, ConfigError::Invalid { ref field, .. } if field == "OUTBOUND_TIMEOUT_SECS"));

        let settings = load(&[("AUTH_CACHE_TTL_SECS", "2592000")]).expect("at the cap");
        assert_eq!(settings.auth_cache_ttl, MAX_DURATION);
    }

    #[test]
    fn test_overrides() {
        let settings = load(&[
            ("SERVICE_NAME", "orders"),
            ("LOG_FORMAT", "json"),
            ("RETRY_MAX_RETRIES", "5"),
            ("RETRY_INITIAL_DELAY_MS", "100"),
            ("AUTH_ENABLED", "false"),
            ("AUTH_REQUIRED_SCOPE", "orders:read"),
            ("AUTH_SKIP_PATHS", "/health, /metrics,"),
        ])
        .expect("valid");

        assert_eq!(settings.service_name, "orders");
        assert_eq!(settings.log_format, LogFormat::Json);
        assert_eq!(settings.retry_max_retries, 5);

        let auth = settings.auth_config();
        assert!(!auth.enabled);
        assert_eq!(auth.required_scope.as_deref(), Some("orders:read"));
        assert_eq!(auth.skip_paths, vec!["/health".to_string(), "/metrics".to_string()]);

        let retry = settings.http_retry_policy();
        assert_eq!(retry.max_retries, 5);
        assert_eq!(retry.initial_delay, Duration::from_millis(100));
        assert!(retry.is_retryable(&StatusCode::SERVICE_UNAVAILABLE));
    }

    #[test]
    fn test_parse_error_names_variable() {
        let err = load(&[("RATE_LIMIT_BURST", "lots")]).expect_err("not a number");
        assert!(matches!(err, ConfigError::ParseError { ref name, .. } if name == "RATE_LIMIT_BURST"));
    }

    #[test]
    fn test_validation_rules() {
        for (name, value) in [
            ("RETRY_BACKOFF_FACTOR", "1.0"),
            ("RATE_LIMIT_BURST", "0"),
            ("RATE_LIMIT_RATE", "0"),
            ("OUTBOUND_TIMEOUT_SECS", "0"),
            ("AUTH_CACHE_TTL_SECS", "0"),
            ("RETRY_MAX_DELAY_MS", "10"),
        ] {
            let err = load(&[(name, value)]).expect_err(name);
            assert!(matches!(err, ConfigError::Invalid { ref field, .. } if field == name), "{name}");
        }
    }

    #[test]
    fn test_derived_configs() {
        let settings = load(&[("SERVICE_NAME", "orders"), ("RATE_LIMIT_RATE", "2.5")]).expect("valid");
        let limiter = settings.rate_limit_config();
        assert!((limiter.rate - 2.5).abs() < f64::EPSILON);
        assert_eq!(limiter.name, "orders_rate_limiter");

        let rpc = settings.rpc_client_config("users", "http://users:50051");
        assert!(rpc.retry.is_retryable(&Code::Unavailable));

        let tracing = settings.tracing_config();
        assert_eq!(tracing.service_name, "orders");
    }

    #[test]
    fn test_config_error_into_platform_error() {
        let err: PlatformError = ConfigError::Invalid {
            field: "X".to_string(),
            reason: "bad".to_string(),
        }
        .into();
        assert!(matches!(err, PlatformError::InvalidInput(_)));
    }
}
