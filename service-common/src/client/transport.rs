//! HTTP transport port and its reqwest adapter.
//!
//! The client shell only sees [`HttpTransport`]; [`ReqwestTransport`] is the
//! production implementation built from [`HttpConfig`].

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Request, StatusCode};
use reqwest::{Client, ClientBuilder};
use serde::de::DeserializeOwned;

use crate::error::PlatformError;

/// Response of one HTTP attempt.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// Status code
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// Raw body
    pub body: Bytes,
}

impl HttpResponse {
    /// Create a response.
    #[must_use]
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// Whether the status is 2xx.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Decode the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::Serialization`] when the body does not decode.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, PlatformError> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Body as text, lossily decoded.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Turn a non-2xx response into [`PlatformError::Status`].
    ///
    /// # Errors
    ///
    /// Returns the status error naming `service` for any non-2xx status.
    pub fn error_for_status(self, service: &str) -> Result<Self, PlatformError> {
        if self.is_success() {
            return Ok(self);
        }
        Err(PlatformError::Status {
            service: service.to_string(),
            status: self.status.as_u16(),
            body: self.text(),
        })
    }
}

/// Sends one fully-built request.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Send `request`, giving up after `timeout`.
    async fn send(&self, request: Request<Bytes>, timeout: Duration) -> Result<HttpResponse, PlatformError>;
}

/// HTTP client configuration.
///
/// Provides sensible defaults for production use with connection pooling,
/// timeouts, and TLS configuration.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Connection timeout (default: 10s)
    pub connect_timeout: Duration,
    /// Pool idle timeout (default: 90s)
    pub pool_idle_timeout: Duration,
    /// Maximum idle connections per host (default: 10)
    pub pool_max_idle_per_host: usize,
    /// User agent string
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            pool_idle_timeout: Duration::from_secs(90),
            pool_max_idle_per_host: 10,
            user_agent: concat!("service-common/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl HttpConfig {
    /// Set the connect timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the user agent.
    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Set pool limits.
    #[must_use]
    pub const fn with_pool_config(mut self, idle_timeout: Duration, max_idle: usize) -> Self {
        self.pool_idle_timeout = idle_timeout;
        self.pool_max_idle_per_host = max_idle;
        self
    }
}

/// Build a reqwest client with rustls TLS and connection pooling.
///
/// Per-request timeouts are applied by [`ReqwestTransport`], not here.
///
/// # Errors
///
/// Returns an error if the client cannot be built (e.g., TLS initialization fails).
///
/// # Examples
///
/// ```
/// use service_common::client::{HttpConfig, build_http_client};
/// use std::time::Duration;
///
/// let config = HttpConfig::default().with_connect_timeout(Duration::from_secs(2));
/// let client = build_http_client(&config).expect("Failed to build client");
/// ```
pub fn build_http_client(config: &HttpConfig) -> Result<Client, reqwest::Error> {
    ClientBuilder::new()
        .connect_timeout(config.connect_timeout)
        .pool_idle_timeout(config.pool_idle_timeout)
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .user_agent(&config.user_agent)
        .use_rustls_tls()
        .build()
}

/// [`HttpTransport`] backed by a shared reqwest client.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// Wrap an existing reqwest client.
    #[must_use]
    pub const fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a transport from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::Http`] if the client cannot be built.
    pub fn from_config(config: &HttpConfig) -> Result<Self, PlatformError> {
        Ok(Self::new(build_http_client(config)?))
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: Request<Bytes>, timeout: Duration) -> Result<HttpResponse, PlatformError> {
        let mut request = reqwest::Request::try_from(request)
            .map_err(|e| PlatformError::invalid_input(format!("invalid request: {e}")))?;
        *request.timeout_mut() = Some(timeout);

        let map_err = |err: reqwest::Error| {
            if err.is_timeout() {
                PlatformError::Timeout { duration: timeout }
            } else {
                PlatformError::Http(err)
            }
        };

        let response = self.client.execute(request).await.map_err(map_err)?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(map_err)?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}
