//! Service-token authentication as Tower layers for HTTP services.

use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use http::Request;
use http::header::AUTHORIZATION;
use tower::{Layer, Service};
use tracing::warn;

use crate::auth::{ServiceAuthenticator, ServiceIdentity, authorize};
use crate::context::{CallContext, RequestContext};
use crate::error::{AuthError, PlatformError};

/// Authenticates every request with a [`ServiceAuthenticator`].
///
/// On success the [`ServiceIdentity`] and a [`RequestContext`] carrying it
/// are inserted into the request extensions.
#[derive(Clone)]
pub struct ServiceAuthLayer {
    authenticator: Arc<ServiceAuthenticator>,
}

impl ServiceAuthLayer {
    /// Creates a new auth layer around a shared authenticator
    #[must_use]
    pub const fn new(authenticator: Arc<ServiceAuthenticator>) -> Self {
        Self { authenticator }
    }
}

impl<S> Layer<S> for ServiceAuthLayer {
    type Service = ServiceAuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ServiceAuthService {
            inner,
            authenticator: self.authenticator.clone(),
        }
    }
}

/// Auth service wrapper
pub struct ServiceAuthService<S> {
    inner: S,
    authenticator: Arc<ServiceAuthenticator>,
}

impl<S: Clone> Clone for ServiceAuthService<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            authenticator: self.authenticator.clone(),
        }
    }
}

impl<S, B> Service<Request<B>> for ServiceAuthService<S>
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
        let authenticator = self.authenticator.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let config = authenticator.config();
            if !config.enabled || config.should_skip_path(req.uri().path()) {
                return inner.call(req).await.map_err(Into::into);
            }

            let (mut parts, body) = req.into_parts();
            let authorization = parts
                .headers
                .get(AUTHORIZATION)
                .map(|value| value.to_str().map_err(|_| AuthError::MalformedAuthorization))
                .transpose()?;

            let ctx = CallContext::from_extensions(&parts.extensions);
            let identity = authenticator
                .authenticate_scoped(
                    &ctx,
                    authorization,
                    config.required_scope.as_deref(),
                )
                .await
                .map_err(|err| {
                    warn!(path = %parts.uri.path(), code = err.code().as_str(), error = %err, "Request rejected");
                    PlatformError::Auth(err)
                })?;

            RequestContext::ensure_in(&mut parts.extensions, &parts.headers)
                .set_identity(identity.clone());
            parts.extensions.insert(identity);

            inner
                .call(Request::from_parts(parts, body))
                .await
                .map_err(Into::into)
        })
    }
}

/// Requires a scope on requests already authenticated by [`ServiceAuthLayer`].
#[derive(Debug, Clone)]
pub struct RequireScopeLayer {
    scope: Arc<str>,
}

impl RequireScopeLayer {
    /// Creates a layer requiring `scope`
    #[must_use]
    pub fn new(scope: &str) -> Self {
        Self {
            scope: Arc::from(scope),
        }
    }
}

impl<S> Layer<S> for RequireScopeLayer {
    type Service = RequireScopeService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequireScopeService {
            inner,
            scope: self.scope.clone(),
        }
    }
}

/// Scope check service wrapper
#[derive(Clone)]
pub struct RequireScopeService<S> {
    inner: S,
    scope: Arc<str>,
}

impl<S, B> Service<Request<B>> for RequireScopeService<S>
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
        let scope = self.scope.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            // No identity means no scopes at all.
            let outcome = req
                .extensions()
                .get::<ServiceIdentity>()
                .map_or_else(
                    || {
                        Err(AuthError::InsufficientScope {
                            required: scope.to_string(),
                        })
                    },
                    |identity| authorize(identity, Some(&*scope)),
                );
            outcome?;

            inner.call(req).await.map_err(Into::into)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthConfig, TokenValidation, TokenValidator};
    use async_trait::async_trait;
    use std::convert::Infallible;
    use tower::{ServiceBuilder, ServiceExt, service_fn};

    struct StaticValidator;

    #[async_trait]
    impl TokenValidator for StaticValidator {
        async fn validate(&self, _ctx: &CallContext, token: &str) -> Result<TokenValidation, PlatformError> {
            match token {
                "reader" => Ok(TokenValidation {
                    valid: true,
                    client_id: "svc-reader".to_string(),
                    tenant_id: "t-1".to_string(),
                    scopes: vec!["orders:read".to_string()],
                    ..TokenValidation::default()
                }),
                "down" => Err(PlatformError::transport("connection refused")),
                "slow" => {
                    tokio::time::sleep(std::time::Duration::from_secs(60)).await;
                    Ok(TokenValidation::invalid())
                }
                _ => Ok(TokenValidation::invalid()),
            }
        }
    }

    fn layer(config: AuthConfig) -> ServiceAuthLayer {
        let authenticator =
            ServiceAuthenticator::new(config, Arc::new(StaticValidator)).expect("config");
        ServiceAuthLayer::new(Arc::new(authenticator))
    }

    async fn echo_client(req: Request<()>) -> Result<Option<String>, Infallible> {
        let ctx = RequestContext::from_extensions(req.extensions());
        Ok(ctx.and_then(|c| c.identity()).map(|i| i.client_id.clone()))
    }

    fn request(path: &str, authorization: Option<&str>) -> Request<()> {
        let mut builder = Request::get(path);
        if let Some(value) = authorization {
            builder = builder.header(AUTHORIZATION, value);
        }
        builder.body(()).expect("request")
    }

    fn auth_error(result: Result<Option<String>, PlatformError>) -> AuthError {
        match result {
            Err(PlatformError::Auth(err)) => err,
            other => panic!("expected auth error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_authenticated_request_carries_identity() {
        let svc = ServiceBuilder::new()
            .layer(layer(AuthConfig::default()))
            .service(service_fn(echo_client));

        let result = svc.oneshot(request("/orders", Some("Bearer reader"))).await;
        assert_eq!(result.expect("allowed"), Some("svc-reader".to_string()));
    }

    #[tokio::test]
    async fn test_rejections() {
        let svc = ServiceBuilder::new()
            .layer(layer(AuthConfig::default()))
            .service(service_fn(echo_client));

        let missing = svc.clone().oneshot(request("/orders", None)).await;
        assert_eq!(auth_error(missing), AuthError::MissingToken);

        let invalid = svc.clone().oneshot(request("/orders", Some("Bearer nope"))).await;
        assert_eq!(auth_error(invalid), AuthError::InvalidToken);

        let outage = svc.oneshot(request("/orders", Some("Bearer down"))).await;
        assert!(matches!(auth_error(outage), AuthError::ValidatorUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_skip_paths_and_disabled() {
        let svc = ServiceBuilder::new()
            .layer(layer(AuthConfig::default().with_skip_path("/health")))
            .service(service_fn(echo_client));
        assert_eq!(svc.oneshot(request("/health/ready", None)).await.expect("skipped"), None);

        let svc = ServiceBuilder::new()
            .layer(layer(AuthConfig::default().with_enabled(false)))
            .service(service_fn(echo_client));
        assert_eq!(svc.oneshot(request("/orders", None)).await.expect("disabled"), None);
    }

    #[tokio::test]
    async fn test_required_scope_on_layer() {
        let svc = ServiceBuilder::new()
            .layer(layer(AuthConfig::default().with_required_scope("orders:write")))
            .service(service_fn(echo_client));

        let result = svc.oneshot(request("/orders", Some("Bearer reader"))).await;
        assert_eq!(
            auth_error(result),
            AuthError::InsufficientScope {
                required: "orders:write".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_require_scope_layer() {
        let svc = ServiceBuilder::new()
            .layer(layer(AuthConfig::default()))
            .layer(RequireScopeLayer::new("orders:read"))
            .service(service_fn(echo_client));
        assert!(svc.oneshot(request("/orders", Some("Bearer reader"))).await.is_ok());

        let svc = ServiceBuilder::new()
            .layer(layer(AuthConfig::default()))
            .layer(RequireScopeLayer::new("orders:delete"))
            .service(service_fn(echo_client));
        let result = svc.oneshot(request("/orders", Some("Bearer reader"))).await;
        assert_eq!(result.map_err(|e| e.code()), Err(crate::error::ErrorCode::PermissionDenied));
    }

    #[tokio::test]
    async fn test_require_scope_without_identity() {
        let svc = RequireScopeLayer::new("orders:read").layer(service_fn(echo_client));
        let result = svc.oneshot(request("/orders", None)).await;
        assert!(matches!(
            auth_error(result),
            AuthError::InsufficientScope { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_upstream_deadline_bounds_validation() {
        let svc = ServiceBuilder::new()
            .layer(layer(AuthConfig::default()))
            .service(service_fn(echo_client));
        let mut req = request("/orders", Some("Bearer slow"));
        req.extensions_mut()
            .insert(CallContext::new().with_timeout(std::time::Duration::from_millis(200)));

        let started = tokio::time::Instant::now();
        let result = svc.oneshot(req).await;

        assert!(matches!(auth_error(result), AuthError::ValidatorUnavailable { .. }));
        assert!(started.elapsed() < std::time::Duration::from_secs(1));
    }
}
