//! Liveness and readiness checks.
//!
//! Dependencies register a [`HealthCheck`]; [`HealthRegistry::readiness`]
//! runs them all concurrently, each bounded by the registry timeout.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::client::HttpClient;
use crate::context::CallContext;
use crate::error::PlatformError;

/// Default per-check timeout.
pub const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Health of one component or of the whole process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Working normally
    Healthy,
    /// A non-critical dependency is failing
    Degraded,
    /// A critical dependency is failing
    Unhealthy,
}

/// A dependency that can be probed.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Name shown in reports.
    fn name(&self) -> &str;

    /// Whether a failure makes the process unready. Non-critical failures
    /// only degrade it.
    fn critical(&self) -> bool {
        true
    }

    /// Probe the dependency.
    ///
    /// # Errors
    ///
    /// Any error marks the check as failed; its message lands in the report.
    async fn check(&self, ctx: &CallContext) -> Result<(), PlatformError>;
}

/// Outcome of one check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    /// Check name
    pub name: String,
    /// Resulting status
    pub status: HealthStatus,
    /// Failure message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Time the check took, in milliseconds
    pub duration_ms: u64,
    /// When the check finished
    pub timestamp: DateTime<Utc>,
}

/// Aggregated health report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Worst status across all checks
    pub status: HealthStatus,
    /// When the report was produced
    pub timestamp: DateTime<Utc>,
    /// Individual results in registration order
    pub checks: Vec<CheckResult>,
}

impl HealthReport {
    fn from_checks(checks: Vec<CheckResult>) -> Self {
        let status = checks
            .iter()
            .map(|c| c.status)
            .fold(HealthStatus::Healthy, |worst, status| match (worst, status) {
                (HealthStatus::Unhealthy, _) | (_, HealthStatus::Unhealthy) => HealthStatus::Unhealthy,
                (HealthStatus::Degraded, _) | (_, HealthStatus::Degraded) => HealthStatus::Degraded,
                _ => HealthStatus::Healthy,
            });
        Self {
            status,
            timestamp: Utc::now(),
            checks,
        }
    }

    /// Whether the process should receive traffic.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.status != HealthStatus::Unhealthy
    }
}

/// Registered health checks.
pub struct HealthRegistry {
    checks: RwLock<Vec<Arc<dyn HealthCheck>>>,
    timeout: Duration,
}

impl std::fmt::Debug for HealthRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthRegistry")
            .field("checks", &self.checks.read().len())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_CHECK_TIMEOUT)
    }
}

impl HealthRegistry {
    /// Registry with a per-check `timeout`.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            checks: RwLock::new(Vec::new()),
            timeout,
        }
    }

    /// Add a check.
    pub fn register(&self, check: impl HealthCheck + 'static) {
        self.register_arc(Arc::new(check));
    }

    /// Add a shared check.
    pub fn register_arc(&self, check: Arc<dyn HealthCheck>) {
        self.checks.write().push(check);
    }

    /// Number of registered checks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.checks.read().len()
    }

    /// Whether no checks are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.checks.read().is_empty()
    }

    /// Liveness never consults dependencies.
    #[must_use]
    pub fn liveness(&self) -> HealthReport {
        HealthReport::from_checks(Vec::new())
    }

    /// Run every check concurrently.
    pub async fn readiness(&self, ctx: &CallContext) -> HealthReport {
        let checks = self.checks.read().clone();
        let ctx = ctx.child().with_timeout(self.timeout);

        let results = join_all(checks.iter().map(|check| self.run(&ctx, check.as_ref()))).await;
        let report = HealthReport::from_checks(results);
        debug!(status = ?report.status, checks = report.checks.len(), "Readiness evaluated");
        report
    }

    async fn run(&self, ctx: &CallContext, check: &dyn HealthCheck) -> CheckResult {
        let start = Instant::now();
        let outcome = match tokio::time::timeout(self.timeout, ctx.run(check.check(ctx))).await {
            Ok(Ok(result)) => result,
            Ok(Err(done)) => Err(done),
            Err(_) => Err(PlatformError::Timeout {
                duration: self.timeout,
            }),
        };

        let (status, message) = match outcome {
            Ok(()) => (HealthStatus::Healthy, None),
            Err(err) => {
                warn!(check = check.name(), error = %err, "Health check failed");
                let status = if check.critical() {
                    HealthStatus::Unhealthy
                } else {
                    HealthStatus::Degraded
                };
                (status, Some(err.to_string()))
            }
        };

        CheckResult {
            name: check.name().to_string(),
            status,
            message,
            duration_ms: u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
            timestamp: Utc::now(),
        }
    }
}

/// [`HealthCheck`] that GETs a path through an [`HttpClient`] and expects 2xx.
#[derive(Debug, Clone)]
pub struct HttpPing {
    name: String,
    client: Arc<HttpClient>,
    path: String,
    critical: bool,
}

impl HttpPing {
    /// Ping `path` on `client`'s service.
    #[must_use]
    pub fn new(client: Arc<HttpClient>, path: impl Into<String>) -> Self {
        Self {
            name: client.service_name().to_string(),
            client,
            path: path.into(),
            critical: true,
        }
    }

    /// Override the reported name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Mark the dependency as non-critical.
    #[must_use]
    pub const fn non_critical(mut self) -> Self {
        self.critical = false;
        self
    }
}

#[async_trait]
impl HealthCheck for HttpPing {
    fn name(&self) -> &str {
        &self.name
    }

    fn critical(&self) -> bool {
        self.critical
    }

    async fn check(&self, ctx: &CallContext) -> Result<(), PlatformError> {
        self.client
            .get(ctx, &self.path)
            .await?
            .error_for_status(self.client.service_name())
            .map(drop)
    }
}
