//! Retry engine with exponential backoff.
//!
//! [`RetryPolicy`] is an immutable value shared read-only by every call a
//! client makes. The outbound clients build one attempt closure per call and
//! hand it to [`RetryPolicy::execute`]; all looping, waiting and exhaustion
//! handling lives here.

use std::future::Future;
use std::time::Duration;

use http::StatusCode;
use tokio::time::{Instant, sleep};
use tonic::Code;
use tracing::{debug, error, info, warn};

use crate::context::CallContext;
use crate::error::PlatformError;
use crate::metrics::ClientMetrics;

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default delay before the first retry.
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(500);
/// Default upper bound for any single delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(5);
/// Default multiplier between consecutive delays.
pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;

/// HTTP statuses retried by default.
pub const DEFAULT_RETRYABLE_STATUSES: [StatusCode; 6] = [
    StatusCode::REQUEST_TIMEOUT,
    StatusCode::TOO_MANY_REQUESTS,
    StatusCode::INTERNAL_SERVER_ERROR,
    StatusCode::BAD_GATEWAY,
    StatusCode::SERVICE_UNAVAILABLE,
    StatusCode::GATEWAY_TIMEOUT,
];

/// gRPC codes retried by default.
pub const DEFAULT_RETRYABLE_CODES: [Code; 4] = [
    Code::Unavailable,
    Code::ResourceExhausted,
    Code::DeadlineExceeded,
    Code::Internal,
];

/// Classified outcome of one attempt.
#[derive(Debug)]
pub enum Attempt<T> {
    /// The attempt produced a value to hand back to the caller
    Success(T),
    /// Transient failure; the engine may try again
    Retryable(PlatformError),
    /// Failure that is returned to the caller as-is
    Terminal(PlatformError),
}

impl<T> Attempt<T> {
    /// Classify a transport result: success passes through, errors are
    /// retryable when [`PlatformError::is_retryable`] says so.
    pub fn from_result(result: Result<T, PlatformError>) -> Self {
        match result {
            Ok(value) => Self::Success(value),
            Err(err) if err.is_retryable() => Self::Retryable(err),
            Err(err) => Self::Terminal(err),
        }
    }
}

/// Retry policy over a set of retryable outcome codes `C`.
///
/// `C` is [`StatusCode`] for HTTP clients and [`Code`] for RPC clients.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy<C> {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Multiplier between consecutive delays
    pub backoff_factor: f64,
    /// Outcome codes worth another attempt
    pub retryable: Vec<C>,
}

impl Default for RetryPolicy<StatusCode> {
    fn default() -> Self {
        Self::with_codes(DEFAULT_RETRYABLE_STATUSES.to_vec())
    }
}

impl Default for RetryPolicy<Code> {
    fn default() -> Self {
        Self::with_codes(DEFAULT_RETRYABLE_CODES.to_vec())
    }
}

impl<C: PartialEq> RetryPolicy<C> {
    /// Default timing with a custom retryable set.
    #[must_use]
    pub const fn with_codes(retryable: Vec<C>) -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            retryable,
        }
    }

    /// Set the number of retries.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the delay before the first retry.
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the upper bound for any single delay.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the multiplier between consecutive delays.
    #[must_use]
    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    /// Replace the retryable set.
    #[must_use]
    pub fn with_retryable(mut self, retryable: Vec<C>) -> Self {
        self.retryable = retryable;
        self
    }

    /// Check the policy's invariants.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::InvalidInput`] when the factor is not above
    /// 1.0 or the max delay is below the initial delay.
    pub fn validate(&self) -> Result<(), PlatformError> {
        if !(self.backoff_factor.is_finite() && self.backoff_factor > 1.0) {
            return Err(PlatformError::invalid_input(format!(
                "backoff factor must be greater than 1.0, got {}",
                self.backoff_factor
            )));
        }
        if self.max_delay < self.initial_delay {
            return Err(PlatformError::invalid_input(
                "max delay must not be below initial delay",
            ));
        }
        Ok(())
    }

    /// Whether `code` is in the retryable set.
    pub fn is_retryable(&self, code: &C) -> bool {
        self.retryable.contains(code)
    }

    /// Total attempts this policy allows, including the first.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before the `attempt`-th retry (1-based).
    ///
    /// `initial_delay * backoff_factor^(attempt - 1)`, clamped to `max_delay`.
    /// Attempt 1 (and 0) yields exactly `initial_delay`.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return self.initial_delay;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }

        Duration::try_from_secs_f64(secs)
            .map_or(self.max_delay, |delay| delay.max(self.initial_delay))
    }

    /// Run `operation` until it succeeds, fails terminally, or the budget is spent.
    ///
    /// `operation` receives the 1-based attempt number. Both the attempts and
    /// the waits between them race against `ctx`.
    ///
    /// # Errors
    ///
    /// - the terminal error of an attempt, unchanged
    /// - [`PlatformError::Cancelled`] or [`PlatformError::DeadlineExceeded`]
    ///   when `ctx` finishes first
    /// - [`PlatformError::ServiceUnavailable`] wrapping the last error once
    ///   every attempt returned a retryable failure
    pub async fn execute<T, F, Fut>(
        &self,
        ctx: &CallContext,
        service: &str,
        operation: F,
    ) -> Result<T, PlatformError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Attempt<T>>,
    {
        self.run(ctx, service, None, operation).await
    }

    /// Like [`execute`](Self::execute), recording attempts into `metrics`.
    ///
    /// # Errors
    ///
    /// Same as [`execute`](Self::execute).
    pub async fn execute_observed<T, F, Fut>(
        &self,
        ctx: &CallContext,
        service: &str,
        metrics: &ClientMetrics,
        operation: F,
    ) -> Result<T, PlatformError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Attempt<T>>,
    {
        self.run(ctx, service, Some(metrics), operation).await
    }

    async fn run<T, F, Fut>(
        &self,
        ctx: &CallContext,
        service: &str,
        metrics: Option<&ClientMetrics>,
        mut operation: F,
    ) -> Result<T, PlatformError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Attempt<T>>,
    {
        let mut last_error = None;

        for retry in 0..=self.max_retries {
            let attempt = retry + 1;

            if retry > 0 {
                let delay = self.delay(retry);
                debug!(service, attempt, ?delay, "Waiting before retry");
                tokio::select! {
                    biased;
                    reason = ctx.done() => return Err(reason.into_error()),
                    () = sleep(delay) => {}
                }
                if let Some(metrics) = metrics {
                    metrics.retries.inc();
                }
            }

            if let Some(metrics) = metrics {
                metrics.attempts.inc();
            }
            debug!(service, attempt, "Sending attempt");
            let started = Instant::now();

            let outcome = tokio::select! {
                biased;
                reason = ctx.done() => return Err(reason.into_error()),
                outcome = operation(attempt) => outcome,
            };

            match outcome {
                Attempt::Success(value) => {
                    if retry > 0 {
                        info!(service, attempt, "Request succeeded after retry");
                    } else {
                        info!(service, duration = ?started.elapsed(), "Request succeeded");
                    }
                    return Ok(value);
                }
                Attempt::Terminal(err) => {
                    debug!(service, attempt, error = %err, "Request failed with non-retryable outcome");
                    return Err(err);
                }
                Attempt::Retryable(err) => {
                    warn!(
                        service,
                        attempt,
                        max_attempts = self.max_attempts(),
                        duration = ?started.elapsed(),
                        error = %err,
                        "Request failed with retryable outcome"
                    );
                    last_error = Some(err);
                }
            }
        }

        if let Some(metrics) = metrics {
            metrics.exhausted.inc();
        }
        let last = last_error.unwrap_or_else(|| PlatformError::internal("no attempt was made"));
        error!(
            service,
            attempts = self.max_attempts(),
            error = %last,
            "Retries exhausted"
        );
        Err(PlatformError::service_unavailable(
            service,
            self.max_attempts(),
            last,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    fn status_error(status: u16) -> PlatformError {
        PlatformError::Status {
            service: "billing".to_string(),
            status,
            body: String::new(),
        }
    }

    fn fast_policy() -> RetryPolicy<StatusCode> {
        RetryPolicy::default()
            .with_max_retries(2)
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(5))
            .with_retryable(vec![StatusCode::SERVICE_UNAVAILABLE])
    }

    #[test]
    fn test_http_defaults() {
        let policy = RetryPolicy::<StatusCode>::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.initial_delay, Duration::from_millis(500));
        assert_eq!(policy.max_delay, Duration::from_secs(5));
        assert!(policy.is_retryable(&StatusCode::TOO_MANY_REQUESTS));
        assert!(policy.is_retryable(&StatusCode::REQUEST_TIMEOUT));
        assert!(!policy.is_retryable(&StatusCode::NOT_FOUND));
        assert!(!policy.is_retryable(&StatusCode::NOT_IMPLEMENTED));
    }

    #[test]
    fn test_rpc_defaults() {
        let policy = RetryPolicy::<Code>::default();
        assert!(policy.is_retryable(&Code::Unavailable));
        assert!(policy.is_retryable(&Code::Internal));
        assert!(!policy.is_retryable(&Code::InvalidArgument));
        assert!(!policy.is_retryable(&Code::PermissionDenied));
    }

    #[test]
    fn test_delay_calculation() {
        let policy = RetryPolicy::<StatusCode>::default();

        assert_eq!(policy.delay(1), Duration::from_millis(500));
        assert_eq!(policy.delay(2), Duration::from_millis(1000));
        assert_eq!(policy.delay(3), Duration::from_millis(2000));
        assert_eq!(policy.delay(4), Duration::from_millis(4000));
        assert_eq!(policy.delay(5), Duration::from_secs(5));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn test_validate() {
        assert!(RetryPolicy::<StatusCode>::default().validate().is_ok());
        assert!(
            RetryPolicy::<StatusCode>::default()
                .with_backoff_factor(1.0)
                .validate()
                .is_err()
        );
        assert!(
            RetryPolicy::<StatusCode>::default()
                .with_max_delay(Duration::from_millis(10))
                .validate()
                .is_err()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_success_single_attempt() {
        let policy = fast_policy();
        let mut calls = 0;

        let result = policy
            .execute(&CallContext::new(), "billing", |_| {
                calls += 1;
                async { Attempt::Success(42) }
            })
            .await;

        assert_eq!(result.ok(), Some(42));
        assert_eq!(calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_failure_short_circuits() {
        let policy = fast_policy();
        let mut calls = 0;

        let result: Result<(), _> = policy
            .execute(&CallContext::new(), "billing", |_| {
                calls += 1;
                async { Attempt::Terminal(status_error(400)) }
            })
            .await;

        assert_eq!(calls, 1);
        assert!(matches!(result, Err(PlatformError::Status { status: 400, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_respected() {
        let policy = fast_policy();
        let metrics = ClientMetrics::new("billing");
        let mut seen = Vec::new();

        let result: Result<(), _> = policy
            .execute_observed(&CallContext::new(), "billing", &metrics, |attempt| {
                seen.push(attempt);
                async { Attempt::Retryable(status_error(503)) }
            })
            .await;

        assert_eq!(seen, vec![1, 2, 3]);
        match result {
            Err(PlatformError::ServiceUnavailable {
                service,
                attempts,
                source,
            }) => {
                assert_eq!(service, "billing");
                assert_eq!(attempts, 3);
                assert!(matches!(*source, PlatformError::Status { status: 503, .. }));
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(metrics.attempts.get(), 3);
        assert_eq!(metrics.retries.get(), 2);
        assert_eq!(metrics.exhausted.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_retries_with_backoff() {
        let policy = fast_policy();
        let mut script: VecDeque<u16> = VecDeque::from([503, 503, 200]);
        let started = Instant::now();

        let result = policy
            .execute(&CallContext::new(), "billing", |_| {
                let status = script.pop_front().unwrap_or(200);
                async move {
                    if status == 200 {
                        Attempt::Success(status)
                    } else {
                        Attempt::Retryable(status_error(status))
                    }
                }
            })
            .await;

        assert_eq!(result.ok(), Some(200));
        assert!(script.is_empty());
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_millis(310));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_during_wait_is_not_exhaustion() {
        let policy = fast_policy();
        let ctx = CallContext::new().with_timeout(Duration::from_millis(150));
        let started = Instant::now();
        let mut calls = 0;

        let result: Result<(), _> = policy
            .execute(&ctx, "billing", |_| {
                calls += 1;
                async { Attempt::Retryable(status_error(503)) }
            })
            .await;

        assert!(matches!(result, Err(PlatformError::DeadlineExceeded)));
        assert_eq!(calls, 2);
        assert!(started.elapsed() < Duration::from_millis(160));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_during_wait() {
        let policy = fast_policy().with_initial_delay(Duration::from_secs(1));
        let ctx = CallContext::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let result: Result<(), _> = policy
            .execute(&ctx, "billing", |_| async {
                Attempt::Retryable(PlatformError::transport("reset"))
            })
            .await;

        assert!(matches!(result, Err(PlatformError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_attempt_is_cut_by_deadline() {
        let policy = fast_policy();
        let ctx = CallContext::new().with_timeout(Duration::from_millis(50));

        let result: Result<(), _> = policy
            .execute(&ctx, "billing", |_| async {
                sleep(Duration::from_secs(60)).await;
                Attempt::Success(())
            })
            .await;

        assert!(matches!(result, Err(PlatformError::DeadlineExceeded)));
    }

    #[test]
    fn test_attempt_from_result() {
        assert!(matches!(
            Attempt::from_result(Ok::<_, PlatformError>(1)),
            Attempt::Success(1)
        ));
        assert!(matches!(
            Attempt::<()>::from_result(Err(PlatformError::transport("reset"))),
            Attempt::Retryable(_)
        ));
        assert!(matches!(
            Attempt::<()>::from_result(Err(PlatformError::invalid_input("bad"))),
            Attempt::Terminal(_)
        ));
    }
}
