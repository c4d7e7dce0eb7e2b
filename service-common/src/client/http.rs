//! Outbound HTTP client shell.
//!
//! Builds exactly one attempt per call (resolve URL, serialize body, apply
//! headers, run interceptors, send with the per-call timeout, classify the
//! status) and hands it to the retry engine. No retry state lives here.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{ACCEPT, CONTENT_TYPE};
use http::{HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode, Uri};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::instrument;
use url::Url;

use super::interceptor::HttpInterceptor;
use super::transport::{HttpConfig, HttpResponse, HttpTransport, ReqwestTransport};
use crate::context::CallContext;
use crate::error::PlatformError;
use crate::metrics::ClientMetrics;
use crate::retry::{Attempt, RetryPolicy};

/// Default per-call timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const APPLICATION_JSON: &str = "application/json";

/// Outbound HTTP client configuration.
#[derive(Clone)]
pub struct HttpClientConfig {
    /// Name of the target service, used in logs and the exhaustion error
    pub service_name: String,
    /// Base URL every request path is appended to
    pub base_url: String,
    /// Timeout applied to each attempt
    pub timeout: Duration,
    /// Retry policy over HTTP status codes
    pub retry: RetryPolicy<StatusCode>,
    /// Headers added to every request, after the JSON defaults
    pub default_headers: HeaderMap,
    interceptors: Vec<Arc<dyn HttpInterceptor>>,
}

impl std::fmt::Debug for HttpClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClientConfig")
            .field("service_name", &self.service_name)
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .field("default_headers", &self.default_headers)
            .field("interceptors", &self.interceptor_count())
            .finish()
    }
}

impl HttpClientConfig {
    /// Config for `service_name` at `base_url` with default timeout and retry.
    #[must_use]
    pub fn new(service_name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            base_url: base_url.into(),
            timeout: DEFAULT_TIMEOUT,
            retry: RetryPolicy::default(),
            default_headers: HeaderMap::new(),
            interceptors: Vec::new(),
        }
    }

    /// Set the per-call timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy<StatusCode>) -> Self {
        self.retry = retry;
        self
    }

    /// Add a header sent with every request.
    #[must_use]
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.default_headers.append(name, value);
        self
    }

    /// Append an interceptor; interceptors run in the order added.
    #[must_use]
    pub fn with_interceptor(mut self, interceptor: impl HttpInterceptor + 'static) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    fn interceptor_count(&self) -> usize {
        self.interceptors.len()
    }
}

/// One logical outbound call.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    headers: HeaderMap,
    body: Option<Bytes>,
}

impl OutboundRequest {
    /// Request `method` on `path`, relative to the client's base URL.
    #[must_use]
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    /// GET `path`.
    #[must_use]
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    /// POST `path`.
    #[must_use]
    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    /// PUT `path`.
    #[must_use]
    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    /// DELETE `path`.
    #[must_use]
    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// Add a query parameter.
    #[must_use]
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Set a header, overriding defaults of the same name.
    #[must_use]
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set several headers at once.
    #[must_use]
    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers.extend(headers);
        self
    }

    /// Serialize `body` as the JSON payload.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::Serialization`] when `body` cannot be encoded.
    pub fn json<B: Serialize + ?Sized>(mut self, body: &B) -> Result<Self, PlatformError> {
        self.body = Some(Bytes::from(serde_json::to_vec(body)?));
        Ok(self)
    }

    /// Use raw bytes as the payload.
    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// HTTP method.
    #[must_use]
    pub const fn method(&self) -> &Method {
        &self.method
    }

    /// Path relative to the base URL.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }
}

/// Outbound HTTP client with retry.
pub struct HttpClient {
    config: HttpClientConfig,
    transport: Arc<dyn HttpTransport>,
    metrics: ClientMetrics,
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl HttpClient {
    /// Create a client backed by reqwest.
    ///
    /// # Errors
    ///
    /// Returns an error when the configuration is invalid or the reqwest
    /// client cannot be built.
    pub fn new(config: HttpClientConfig) -> Result<Self, PlatformError> {
        let transport = ReqwestTransport::from_config(&HttpConfig::default())?;
        Self::with_transport(config, Arc::new(transport))
    }

    /// Create a client over any transport.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::InvalidInput`] for an unparseable base URL, a
    /// zero timeout or an invalid retry policy.
    pub fn with_transport(
        config: HttpClientConfig,
        transport: Arc<dyn HttpTransport>,
    ) -> Result<Self, PlatformError> {
        Url::parse(&config.base_url).map_err(|e| {
            PlatformError::invalid_input(format!("invalid base url '{}': {e}", config.base_url))
        })?;
        if config.timeout.is_zero() {
            return Err(PlatformError::invalid_input("timeout must be positive"));
        }
        config.retry.validate()?;

        let metrics = ClientMetrics::new(&config.service_name);
        Ok(Self {
            config,
            transport,
            metrics,
        })
    }

    /// Target service name.
    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.config.service_name
    }

    /// Client configuration.
    #[must_use]
    pub const fn config(&self) -> &HttpClientConfig {
        &self.config
    }

    /// Attempt, retry and exhaustion counters.
    #[must_use]
    pub const fn metrics(&self) -> &ClientMetrics {
        &self.metrics
    }

    /// Execute `request` with retry.
    ///
    /// Statuses outside the retryable set, including non-2xx ones, are
    /// returned as responses.
    ///
    /// # Errors
    ///
    /// - [`PlatformError::ServiceUnavailable`] once the retry budget is spent
    /// - [`PlatformError::Cancelled`] or [`PlatformError::DeadlineExceeded`]
    /// - a non-retryable transport, serialization or interceptor error
    #[instrument(
        skip(self, ctx, request),
        fields(service = %self.config.service_name, method = %request.method, path = %request.path)
    )]
    pub async fn execute(
        &self,
        ctx: &CallContext,
        request: OutboundRequest,
    ) -> Result<HttpResponse, PlatformError> {
        let uri = self.resolve(&request)?;
        let request = &request;
        let uri = &uri;

        self.config
            .retry
            .execute_observed(ctx, &self.config.service_name, &self.metrics, |_| {
                self.attempt(ctx, request, uri)
            })
            .await
    }

    async fn attempt(&self, ctx: &CallContext, request: &OutboundRequest, uri: &Uri) -> Attempt<HttpResponse> {
        let outgoing = match self.build(request, uri) {
            Ok(outgoing) => outgoing,
            Err(err) => return Attempt::Terminal(err),
        };

        match self.transport.send(outgoing, ctx.bound(self.config.timeout)).await {
            Ok(response) if self.config.retry.is_retryable(&response.status) => {
                Attempt::Retryable(PlatformError::Status {
                    service: self.config.service_name.clone(),
                    status: response.status.as_u16(),
                    body: response.text(),
                })
            }
            Ok(response) => Attempt::Success(response),
            Err(err) => Attempt::from_result(Err(err)),
        }
    }

    fn resolve(&self, request: &OutboundRequest) -> Result<Uri, PlatformError> {
        let joined = format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            request.path.trim_start_matches('/')
        );
        let mut url = Url::parse(&joined)
            .map_err(|e| PlatformError::invalid_input(format!("invalid url '{joined}': {e}")))?;
        if !request.query.is_empty() {
            url.query_pairs_mut().extend_pairs(&request.query);
        }

        url.as_str()
            .parse::<Uri>()
            .map_err(|e| PlatformError::invalid_input(format!("invalid uri '{url}': {e}")))
    }

    fn build(&self, request: &OutboundRequest, uri: &Uri) -> Result<Request<Bytes>, PlatformError> {
        let mut outgoing = Request::builder()
            .method(request.method.clone())
            .uri(uri.clone())
            .body(request.body.clone().unwrap_or_default())
            .map_err(|e| PlatformError::invalid_input(format!("invalid request: {e}")))?;

        let headers = outgoing.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(APPLICATION_JSON));
        headers.insert(ACCEPT, HeaderValue::from_static(APPLICATION_JSON));
        override_headers(headers, &self.config.default_headers);
        override_headers(headers, &request.headers);

        for interceptor in &self.config.interceptors {
            interceptor.intercept(&mut outgoing)?;
        }
        Ok(outgoing)
    }

    /// GET `path`.
    ///
    /// # Errors
    ///
    /// Same as [`execute`](Self::execute).
    pub async fn get(&self, ctx: &CallContext, path: &str) -> Result<HttpResponse, PlatformError> {
        self.get_with_headers(ctx, path, HeaderMap::new()).await
    }

    /// GET `path` with per-call `headers` overriding the defaults.
    ///
    /// # Errors
    ///
    /// Same as [`execute`](Self::execute).
    pub async fn get_with_headers(
        &self,
        ctx: &CallContext,
        path: &str,
        headers: HeaderMap,
    ) -> Result<HttpResponse, PlatformError> {
        self.execute(ctx, OutboundRequest::get(path).headers(headers)).await
    }

    /// POST `body` as JSON to `path`.
    ///
    /// # Errors
    ///
    /// Same as [`execute`](Self::execute).
    pub async fn post<B: Serialize + ?Sized>(
        &self,
        ctx: &CallContext,
        path: &str,
        body: &B,
    ) -> Result<HttpResponse, PlatformError> {
        self.post_with_headers(ctx, path, body, HeaderMap::new()).await
    }

    /// POST `body` as JSON to `path` with per-call `headers`.
    ///
    /// # Errors
    ///
    /// Same as [`execute`](Self::execute).
    pub async fn post_with_headers<B: Serialize + ?Sized>(
        &self,
        ctx: &CallContext,
        path: &str,
        body: &B,
        headers: HeaderMap,
    ) -> Result<HttpResponse, PlatformError> {
        let request = OutboundRequest::post(path).json(body)?.headers(headers);
        self.execute(ctx, request).await
    }

    /// PUT `body` as JSON to `path`.
    ///
    /// # Errors
    ///
    /// Same as [`execute`](Self::execute).
    pub async fn put<B: Serialize + ?Sized>(
        &self,
        ctx: &CallContext,
        path: &str,
        body: &B,
    ) -> Result<HttpResponse, PlatformError> {
        self.put_with_headers(ctx, path, body, HeaderMap::new()).await
    }

    /// PUT `body` as JSON to `path` with per-call `headers`.
    ///
    /// # Errors
    ///
    /// Same as [`execute`](Self::execute).
    pub async fn put_with_headers<B: Serialize + ?Sized>(
        &self,
        ctx: &CallContext,
        path: &str,
        body: &B,
        headers: HeaderMap,
    ) -> Result<HttpResponse, PlatformError> {
        let request = OutboundRequest::put(path).json(body)?.headers(headers);
        self.execute(ctx, request).await
    }

    /// DELETE `path`.
    ///
    /// # Errors
    ///
    /// Same as [`execute`](Self::execute).
    pub async fn delete(&self, ctx: &CallContext, path: &str) -> Result<HttpResponse, PlatformError> {
        self.delete_with_headers(ctx, path, HeaderMap::new()).await
    }

    /// DELETE `path` with per-call `headers`.
    ///
    /// # Errors
    ///
    /// Same as [`execute`](Self::execute).
    pub async fn delete_with_headers(
        &self,
        ctx: &CallContext,
        path: &str,
        headers: HeaderMap,
    ) -> Result<HttpResponse, PlatformError> {
        self.execute(ctx, OutboundRequest::delete(path).headers(headers)).await
    }

    /// GET `path` and decode a 2xx JSON body.
    ///
    /// # Errors
    ///
    /// Same as [`execute`](Self::execute), plus [`PlatformError::Status`] for
    /// a non-2xx reply and [`PlatformError::Serialization`] for a bad body.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        ctx: &CallContext,
        path: &str,
    ) -> Result<T, PlatformError> {
        self.get(ctx, path)
            .await?
            .error_for_status(&self.config.service_name)?
            .json()
    }
}

fn override_headers(target: &mut HeaderMap, overrides: &HeaderMap) {
    for name in overrides.keys() {
        target.remove(name);
        for value in overrides.get_all(name) {
            target.append(name.clone(), value.clone());
        }
    }
}
