//! Outbound gRPC client shell.
//!
//! Wraps a tonic [`Channel`] and drives any generated-stub invocation through
//! the retry engine, classifying failures by [`Code`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tonic::metadata::{MetadataMap, MetadataValue};
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Request, Response, Status};
use tracing::{debug, info, instrument};

use super::interceptor::BearerAuth;
use crate::context::CallContext;
use crate::error::PlatformError;
use crate::metrics::ClientMetrics;
use crate::retry::{Attempt, RetryPolicy};

/// Default per-call timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A step that may inspect, mutate or reject an outgoing RPC.
pub trait RpcInterceptor: Send + Sync {
    /// Mutate the outgoing metadata for `method`, or reject the call.
    ///
    /// # Errors
    ///
    /// The returned status aborts the call.
    fn intercept(&self, method: &str, metadata: &mut MetadataMap) -> Result<(), Status>;
}

impl<F> RpcInterceptor for F
where
    F: Fn(&str, &mut MetadataMap) -> Result<(), Status> + Send + Sync,
{
    fn intercept(&self, method: &str, metadata: &mut MetadataMap) -> Result<(), Status> {
        self(method, metadata)
    }
}

impl RpcInterceptor for BearerAuth {
    fn intercept(&self, _method: &str, metadata: &mut MetadataMap) -> Result<(), Status> {
        let value = MetadataValue::try_from(self.header_value().as_bytes())
            .map_err(|_| Status::internal("bearer token is not valid metadata"))?;
        metadata.insert("authorization", value);
        Ok(())
    }
}

/// Outbound gRPC client configuration.
#[derive(Clone)]
pub struct RpcClientConfig {
    /// Name of the target service
    pub service_name: String,
    /// Endpoint URI, e.g. `http://users:50051`
    pub target: String,
    /// Timeout applied to each attempt
    pub timeout: Duration,
    /// Timeout for establishing the connection
    pub connect_timeout: Duration,
    /// Retry policy over gRPC codes
    pub retry: RetryPolicy<Code>,
    interceptors: Vec<Arc<dyn RpcInterceptor>>,
}

impl std::fmt::Debug for RpcClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClientConfig")
            .field("service_name", &self.service_name)
            .field("target", &self.target)
            .field("timeout", &self.timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("retry", &self.retry)
            .field("interceptors", &self.interceptors.len())
            .finish()
    }
}

impl RpcClientConfig {
    /// Config for `service_name` at `target` with default timeouts and retry.
    #[must_use]
    pub fn new(service_name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            target: target.into(),
            timeout: DEFAULT_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            retry: RetryPolicy::default(),
            interceptors: Vec::new(),
        }
    }

    /// Set the per-call timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the connect timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy<Code>) -> Self {
        self.retry = retry;
        self
    }

    /// Append an interceptor; interceptors run in the order added.
    #[must_use]
    pub fn with_interceptor(mut self, interceptor: impl RpcInterceptor + 'static) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    fn endpoint(&self) -> Result<Endpoint, PlatformError> {
        if self.timeout.is_zero() {
            return Err(PlatformError::invalid_input("timeout must be positive"));
        }
        self.retry.validate()?;
        Ok(Endpoint::from_shared(self.target.clone())
            .map_err(|e| {
                PlatformError::invalid_input(format!("invalid target '{}': {e}", self.target))
            })?
            .connect_timeout(self.connect_timeout))
    }
}

/// Outbound gRPC client with retry.
#[derive(Clone)]
pub struct RpcClient {
    config: RpcClientConfig,
    channel: Channel,
    metrics: Arc<ClientMetrics>,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RpcClient {
    /// Connect eagerly.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::InvalidInput`] for a bad configuration and
    /// [`PlatformError::Transport`] when the connection fails.
    pub async fn connect(config: RpcClientConfig) -> Result<Self, PlatformError> {
        let channel = config.endpoint()?.connect().await.map_err(|e| {
            PlatformError::transport(format!("failed to connect to {}: {e}", config.target))
        })?;
        info!(service = %config.service_name, target = %config.target, "gRPC connection established");
        Ok(Self::from_channel(config, channel))
    }

    /// Create a client that connects on first use.
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::InvalidInput`] for a bad configuration.
    pub fn connect_lazy(config: RpcClientConfig) -> Result<Self, PlatformError> {
        let channel = config.endpoint()?.connect_lazy();
        Ok(Self::from_channel(config, channel))
    }

    /// Wrap an existing channel.
    #[must_use]
    pub fn from_channel(config: RpcClientConfig, channel: Channel) -> Self {
        let metrics = Arc::new(ClientMetrics::new(&config.service_name));
        Self {
            config,
            channel,
            metrics,
        }
    }

    /// The underlying channel.
    #[must_use]
    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }

    /// Target service name.
    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.config.service_name
    }

    /// Attempt, retry and exhaustion counters.
    #[must_use]
    pub fn metrics(&self) -> &ClientMetrics {
        &self.metrics
    }

    /// Call `method` with retry.
    ///
    /// `invoke` receives a channel and a fully prepared request (timeout set,
    /// interceptors applied) and performs one generated-stub call:
    ///
    /// ```ignore
    /// let user = client
    ///     .call(&ctx, "/users.v1.Users/Get", request, |channel, request| async move {
    ///         UsersClient::new(channel).get(request).await
    ///     })
    ///     .await?;
    /// ```
    ///
    /// # Errors
    ///
    /// - [`PlatformError::ServiceUnavailable`] once the retry budget is spent
    /// - [`PlatformError::Grpc`] for a non-retryable status or interceptor rejection
    /// - [`PlatformError::Cancelled`] or [`PlatformError::DeadlineExceeded`]
    #[instrument(skip(self, ctx, message, invoke), fields(service = %self.config.service_name))]
    pub async fn call<Req, Resp, F, Fut>(
        &self,
        ctx: &CallContext,
        method: &str,
        message: Req,
        mut invoke: F,
    ) -> Result<Resp, PlatformError>
    where
        Req: Clone,
        F: FnMut(Channel, Request<Req>) -> Fut,
        Fut: Future<Output = Result<Response<Resp>, Status>>,
    {
        let message = &message;

        self.config
            .retry
            .execute_observed(ctx, &self.config.service_name, &self.metrics, |attempt| {
                let prepared = self.prepare(ctx, method, message.clone());
                let pending = prepared.map(|request| invoke(self.channel.clone(), request));
                async move {
                    let pending = match pending {
                        Ok(pending) => pending,
                        Err(status) => return Attempt::Terminal(PlatformError::Grpc(status)),
                    };
                    match pending.await {
                        Ok(response) => Attempt::Success(response.into_inner()),
                        Err(status) if self.config.retry.is_retryable(&status.code()) => {
                            debug!(attempt, code = ?status.code(), "Retryable gRPC status");
                            Attempt::Retryable(PlatformError::Grpc(status))
                        }
                        Err(status) => Attempt::Terminal(PlatformError::Grpc(status)),
                    }
                }
            })
            .await
    }

    fn prepare<Req>(&self, ctx: &CallContext, method: &str, message: Req) -> Result<Request<Req>, Status> {
        let mut request = Request::new(message);
        request.set_timeout(ctx.bound(self.config.timeout));
        for interceptor in &self.config.interceptors {
            interceptor.intercept(method, request.metadata_mut())?;
        }
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    fn lazy_client(config: RpcClientConfig) -> RpcClient {
        RpcClient::connect_lazy(config).expect("valid config")
    }

    fn config() -> RpcClientConfig {
        RpcClientConfig::new("users", "http://127.0.0.1:1").with_retry(
            RetryPolicy::default()
                .with_max_retries(2)
                .with_initial_delay(Duration::from_millis(100)),
        )
    }

    #[test]
    fn test_default_config() {
        let config = RpcClientConfig::new("users", "http://users:50051");
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.retry.max_retries, 3);
        assert!(config.retry.is_retryable(&Code::Unavailable));
    }

    #[tokio::test]
    async fn test_invalid_target_rejected() {
        let result = RpcClient::connect_lazy(RpcClientConfig::new("users", "not a uri"));
        assert!(matches!(result, Err(PlatformError::InvalidInput(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_retryable_codes() {
        let client = lazy_client(config());
        let script = Mutex::new(VecDeque::from([
            Err(Status::unavailable("down")),
            Err(Status::resource_exhausted("busy")),
            Ok(7u32),
        ]));

        let result = client
            .call(&CallContext::new(), "/users.v1.Users/Get", (), |_, _| {
                let next = script.lock().pop_front().unwrap_or(Ok(0));
                async move { next.map(Response::new) }
            })
            .await;

        assert_eq!(result.ok(), Some(7));
        assert_eq!(client.metrics().attempts.get(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_code_not_retried() {
        let client = lazy_client(config());
        let mut calls = 0;

        let result: Result<(), _> = client
            .call(&CallContext::new(), "/users.v1.Users/Get", (), |_, _| {
                calls += 1;
                async { Err(Status::not_found("no user")) }
            })
            .await;

        assert_eq!(calls, 1);
        match result {
            Err(PlatformError::Grpc(status)) => assert_eq!(status.code(), Code::NotFound),
            other => panic!("expected grpc error, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion() {
        let client = lazy_client(config());

        let err = client
            .call(&CallContext::new(), "/users.v1.Users/Get", (), |_, _| async {
                Err::<Response<()>, _>(Status::unavailable("down"))
            })
            .await
            .expect_err("budget spent");

        assert!(err.is_exhausted());
        assert_eq!(client.metrics().exhausted.get(), 1);
    }

    #[tokio::test]
    async fn test_interceptors_and_timeout_applied() {
        let client = lazy_client(
            config()
                .with_timeout(Duration::from_secs(3))
                .with_interceptor(BearerAuth::new("t0k3n").expect("token"))
                .with_interceptor(|method: &str, metadata: &mut MetadataMap| -> Result<(), Status> {
                    let value = MetadataValue::try_from(method)
                        .map_err(|_| Status::internal("bad method"))?;
                    metadata.insert("x-method", value);
                    Ok(())
                }),
        );

        let seen = client
            .call(&CallContext::new(), "/users.v1.Users/Get", (), |_, request| {
                let metadata = request.metadata().clone();
                async move { Ok(Response::new(metadata)) }
            })
            .await
            .expect("success");

        let get = |key: &str| seen.get(key).and_then(|v| v.to_str().ok()).map(str::to_string);
        assert_eq!(get("authorization").as_deref(), Some("Bearer t0k3n"));
        assert_eq!(get("x-method").as_deref(), Some("/users.v1.Users/Get"));
        assert_eq!(get("grpc-timeout").as_deref(), Some("3000000u"));
    }

    #[tokio::test]
    async fn test_interceptor_rejection_is_terminal() {
        let client = lazy_client(config().with_interceptor(
            |_: &str, _: &mut MetadataMap| -> Result<(), Status> {
                Err(Status::unauthenticated("no credentials"))
            },
        ));
        let mut calls = 0;

        let result: Result<(), _> = client
            .call(&CallContext::new(), "/users.v1.Users/Get", (), |_, _| {
                calls += 1;
                async { Ok(Response::new(())) }
            })
            .await;

        assert_eq!(calls, 0);
        assert!(matches!(result, Err(PlatformError::Grpc(_))));
    }
}
