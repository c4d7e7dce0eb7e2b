//! Service-token authentication for tonic servers.
//!
//! Applied as a Tower layer on the server, e.g.
//! `Server::builder().layer(GrpcAuthLayer::new(authenticator))`. Rejections
//! become gRPC statuses; the identity reaches handlers through
//! `request.extensions()`.

use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use http::header::AUTHORIZATION;
use http::{Request, Response};
use tonic::body::BoxBody;
use tower::{Layer, Service};
use tracing::{debug, warn};

use crate::auth::ServiceAuthenticator;
use crate::context::{CallContext, RequestContext};
use crate::error::{AuthError, PlatformError};

/// Header carrying the caller's remaining deadline.
pub const GRPC_TIMEOUT_HEADER: &str = "grpc-timeout";

/// Parse a `grpc-timeout` value: up to 8 digits followed by one of
/// `H`, `M`, `S`, `m`, `u`, `n`.
#[must_use]
pub fn parse_grpc_timeout(value: &str) -> Option<Duration> {
    if value.len() < 2 || value.len() > 9 || !value.is_ascii() {
        return None;
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let amount: u64 = digits.parse().ok()?;
    match unit {
        "H" => Some(Duration::from_secs(amount * 3600)),
        "M" => Some(Duration::from_secs(amount * 60)),
        "S" => Some(Duration::from_secs(amount)),
        "m" => Some(Duration::from_millis(amount)),
        "u" => Some(Duration::from_micros(amount)),
        "n" => Some(Duration::from_nanos(amount)),
        _ => None,
    }
}

// Upstream context if a layer put one there, bounded by grpc-timeout.
fn call_context(parts: &http::request::Parts) -> CallContext {
    let ctx = CallContext::from_extensions(&parts.extensions);
    match parts
        .headers
        .get(GRPC_TIMEOUT_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_grpc_timeout)
    {
        Some(timeout) => ctx.with_timeout(timeout),
        None => ctx,
    }
}

/// Authenticates gRPC calls by full method name.
#[derive(Clone)]
pub struct GrpcAuthLayer {
    authenticator: Arc<ServiceAuthenticator>,
}

impl GrpcAuthLayer {
    /// Creates a new layer around a shared authenticator
    #[must_use]
    pub const fn new(authenticator: Arc<ServiceAuthenticator>) -> Self {
        Self { authenticator }
    }
}

impl<S> Layer<S> for GrpcAuthLayer {
    type Service = GrpcAuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        GrpcAuthService {
            inner,
            authenticator: self.authenticator.clone(),
        }
    }
}

/// gRPC auth service wrapper
pub struct GrpcAuthService<S> {
    inner: S,
    authenticator: Arc<ServiceAuthenticator>,
}

impl<S: Clone> Clone for GrpcAuthService<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            authenticator: self.authenticator.clone(),
        }
    }
}

impl<S, B> Service<Request<B>> for GrpcAuthService<S>
where
    S: Service<Request<B>, Response = Response<BoxBody>> + Clone + Send + 'static,
    S::Error: Send + 'static,
    S::Future: Send + 'static,
    B: Send + 'static,
{
    type Response = Response<BoxBody>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let authenticator = self.authenticator.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let config = authenticator.config();
            let method = req.uri().path().to_string();
            if !config.enabled || config.should_skip_method(&method) {
                debug!(%method, "Skipping authentication");
                return inner.call(req).await;
            }

            let (mut parts, body) = req.into_parts();
            let ctx = call_context(&parts);
            let outcome = match parts.headers.get(AUTHORIZATION).map(|v| v.to_str()) {
                Some(Err(_)) => Err(AuthError::MalformedAuthorization),
                header => {
                    authenticator
                        .authenticate_scoped(
                            &ctx,
                            header.and_then(Result::ok),
                            config.scope_for_method(&method),
                        )
                        .await
                }
            };

            let identity = match outcome {
                Ok(identity) => identity,
                Err(err) => {
                    warn!(%method, code = err.code().as_str(), error = %err, "Call rejected");
                    return Ok(PlatformError::Auth(err).to_status().into_http());
                }
            };

            RequestContext::ensure_in(&mut parts.extensions, &parts.headers)
                .set_identity(identity.clone());
            parts.extensions.insert(identity);

            inner.call(Request::from_parts(parts, body)).await
        })
    }
}
