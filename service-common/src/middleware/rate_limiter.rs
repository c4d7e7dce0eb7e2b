//! Rate Limiter Tower Layer
//!
//! Per-caller rate limiting keyed by client IP.

use std::net::SocketAddr;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use http::{HeaderMap, Request};
use tower::{Layer, Service};
use tracing::warn;

use crate::error::PlatformError;
use crate::rate_limiter::{KeyedRateLimiter, RateLimitDecision};

/// Key used when no caller address can be determined.
pub const UNKNOWN_CLIENT: &str = "unknown";

const FORWARDED_FOR: &str = "x-forwarded-for";
const REAL_IP: &str = "x-real-ip";

/// Caller key for `req`.
///
/// First hop of `X-Forwarded-For`, then `X-Real-IP`, then the connection's
/// [`SocketAddr`] from the extensions, else [`UNKNOWN_CLIENT`].
#[must_use]
pub fn client_key<B>(req: &Request<B>) -> String {
    header_ip(req.headers())
        .or_else(|| req.extensions().get::<SocketAddr>().map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

fn header_ip(headers: &HeaderMap) -> Option<String> {
    let header = |name: &'static str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    header(FORWARDED_FOR)
        .and_then(|chain| chain.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .or_else(|| header(REAL_IP))
        .map(str::to_string)
}

/// Rate limiter layer for Tower
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<KeyedRateLimiter>,
}

impl RateLimitLayer {
    /// Creates a layer over a shared limiter.
    ///
    /// The caller owns the limiter's sweep lifecycle.
    #[must_use]
    pub const fn new(limiter: Arc<KeyedRateLimiter>) -> Self {
        Self { limiter }
    }

    /// The shared limiter.
    #[must_use]
    pub const fn limiter(&self) -> &Arc<KeyedRateLimiter> {
        &self.limiter
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            limiter: self.limiter.clone(),
        }
    }
}

/// Rate limiter service wrapper
pub struct RateLimitService<S> {
    inner: S,
    limiter: Arc<KeyedRateLimiter>,
}

impl<S: Clone> Clone for RateLimitService<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limiter: self.limiter.clone(),
        }
    }
}

impl<S, B> Service<Request<B>> for RateLimitService<S>
where
    S: Service<Request<B>> + Clone + Send + 'static,
    S::Response: Send + 'static,
    S::Error: Into<PlatformError> + Send + 'static,
    S::Future: Send + 'static,
    B: Send + 'static,
{
    type Response = S::Response;
    type Error = PlatformError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let key = client_key(&req);
        let decision = self.limiter.check(&key);
        let mut inner = self.inner.clone();

        Box::pin(async move {
            match decision {
                RateLimitDecision::Allowed => inner.call(req).await.map_err(Into::into),
                RateLimitDecision::Denied { retry_after } => {
                    warn!(client = %key, path = %req.uri().path(), ?retry_after, "Rate limit exceeded");
                    Err(PlatformError::RateLimited { retry_after })
                }
            }
        })
    }
}
