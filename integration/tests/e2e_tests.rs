//! End-to-end tests for the service-common request path.
//!
//! Each test wires the real clients, authenticator and limiters together over
//! the test doubles from `test-utils`, on a paused Tokio clock where timing
//! matters.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use http::header::AUTHORIZATION;
use http::{Request, StatusCode};
use proptest::prelude::*;
use service_common::auth::RemoteTokenValidator;
use service_common::middleware::{RateLimitLayer, RequireScopeLayer, ServiceAuthLayer};
use service_common::{
    AuthConfig, AuthError, CallContext, HttpClient, HttpClientConfig, KeyedRateLimiter,
    PlatformError, RateLimitConfig, RequestContext, ServiceAuthenticator,
};
use test_utils::fixtures::{
    ADMIN_TOKEN, EXPIRED_TOKEN, READER_TOKEN, admin_validation, bearer, expired_validation,
    fast_retry_policy, reader_validation,
};
use test_utils::mocks::{MockTokenValidator, RecordingInterceptor, ScriptedTransport};
use tokio::time::Instant;
use tower::{ServiceBuilder, ServiceExt, service_fn};

fn client_over(transport: &Arc<ScriptedTransport>) -> HttpClient {
    let config = HttpClientConfig::new("inventory", "http://inventory.internal")
        .with_retry(fast_retry_policy());
    HttpClient::with_transport(config, transport.clone()).expect("client")
}

fn validator() -> Arc<MockTokenValidator> {
    Arc::new(
        MockTokenValidator::new()
            .with_token(READER_TOKEN, reader_validation())
            .with_token(ADMIN_TOKEN, admin_validation())
            .with_token(EXPIRED_TOKEN, expired_validation()),
    )
}

fn authenticator(config: AuthConfig, validator: Arc<MockTokenValidator>) -> Arc<ServiceAuthenticator> {
    Arc::new(ServiceAuthenticator::new(config, validator).expect("auth config"))
}

fn request(path: &str, token: Option<&str>, client_ip: &str) -> Request<()> {
    let mut builder = Request::get(path).header("x-forwarded-for", client_ip);
    if let Some(token) = token {
        builder = builder.header(AUTHORIZATION, bearer(token));
    }
    builder.body(()).expect("request")
}

async fn caller_service(req: Request<()>) -> Result<String, Infallible> {
    let caller = RequestContext::from_extensions(req.extensions())
        .and_then(RequestContext::identity)
        .map_or_else(|| "anonymous".to_string(), |identity| identity.service_name.clone());
    Ok(caller)
}

// =============================================================================
// Outbound retry path
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_recovers_after_two_unavailable_responses() {
    let transport = Arc::new(ScriptedTransport::with_statuses(&[503, 503, 200]));
    let client = client_over(&transport);

    let started = Instant::now();
    let response = client.get(&CallContext::new(), "/stock/42").await.expect("recovered");
    let waited = started.elapsed();

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(transport.count(), 3);
    assert!(waited >= Duration::from_millis(300), "waited {waited:?}");
    assert!(waited < Duration::from_millis(400), "waited {waited:?}");
    assert_eq!(client.metrics().attempts.get(), 3);
    assert_eq!(client.metrics().retries.get(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_exhaustion_names_service() {
    let transport = Arc::new(ScriptedTransport::new().with_fallback(StatusCode::SERVICE_UNAVAILABLE));
    let client = client_over(&transport);

    let started = Instant::now();
    let err = client.get(&CallContext::new(), "/stock/42").await.expect_err("exhausted");

    assert!(err.is_exhausted());
    assert!(err.to_string().contains("inventory"));
    match &err {
        PlatformError::ServiceUnavailable { service, attempts, source } => {
            assert_eq!(service, "inventory");
            assert_eq!(*attempts, 3);
            assert!(matches!(**source, PlatformError::Status { status: 503, .. }));
        }
        other => panic!("expected exhaustion, got {other:?}"),
    }
    assert_eq!(transport.count(), 3);
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(client.metrics().exhausted.get(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_interrupts_backoff() {
    let transport = Arc::new(ScriptedTransport::new().with_fallback(StatusCode::SERVICE_UNAVAILABLE));
    let client = client_over(&transport);
    let ctx = CallContext::new().with_timeout(Duration::from_millis(150));

    let started = Instant::now();
    let err = client.get(&ctx, "/stock/42").await.expect_err("deadline");

    assert!(matches!(err, PlatformError::DeadlineExceeded));
    assert_eq!(transport.count(), 2);
    assert!(started.elapsed() < Duration::from_millis(300));
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_stops_retries() {
    let transport = Arc::new(ScriptedTransport::new().with_fallback(StatusCode::SERVICE_UNAVAILABLE));
    let client = client_over(&transport);
    let ctx = CallContext::new();

    let canceller = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let err = client.get(&ctx, "/stock/42").await.expect_err("cancelled");
    assert!(err.is_cancellation());
    assert_eq!(transport.count(), 1);
}

#[tokio::test]
async fn test_non_retryable_status_returned_as_response() {
    let transport = Arc::new(ScriptedTransport::with_statuses(&[404]));
    let client = client_over(&transport);

    let response = client.get(&CallContext::new(), "/stock/missing").await.expect("response");
    assert_eq!(response.status, StatusCode::NOT_FOUND);
    assert_eq!(transport.count(), 1);
    assert!(response.error_for_status("inventory").is_err());
}

#[tokio::test]
async fn test_interceptor_applies_to_every_attempt() {
    let transport = Arc::new(ScriptedTransport::with_statuses(&[503, 200]));
    let interceptor = RecordingInterceptor::new();
    let config = HttpClientConfig::new("inventory", "http://inventory.internal")
        .with_retry(fast_retry_policy().with_initial_delay(Duration::from_millis(1)))
        .with_interceptor(interceptor.clone());
    let client = HttpClient::with_transport(config, transport.clone()).expect("client");

    let body = serde_json::json!({"sku": "A-1", "quantity": 2});
    let response = client.post(&CallContext::new(), "/reservations", &body).await.expect("ok");

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(interceptor.seen(), vec!["POST /reservations", "POST /reservations"]);
    for sent in transport.requests() {
        assert!(sent.headers.contains_key(RecordingInterceptor::TAG_HEADER));
        assert_eq!(sent.uri, "http://inventory.internal/reservations");
        assert_eq!(serde_json::from_slice::<serde_json::Value>(&sent.body).expect("json"), body);
    }

    interceptor.set_reject(true);
    let err = client.get(&CallContext::new(), "/stock").await.expect_err("rejected");
    assert!(matches!(err, PlatformError::Interceptor { .. }));
    assert_eq!(transport.count(), 2);
}

// =============================================================================
// Inbound authentication path
// =============================================================================

#[tokio::test]
async fn test_auth_layer_caches_validations() {
    let validator = validator();
    let auth = authenticator(AuthConfig::default(), validator.clone());
    let svc = ServiceBuilder::new()
        .layer(ServiceAuthLayer::new(auth.clone()))
        .service(service_fn(caller_service));

    for _ in 0..3 {
        let caller = svc
            .clone()
            .oneshot(request("/orders", Some(READER_TOKEN), "10.0.0.1"))
            .await
            .expect("authenticated");
        assert_eq!(caller, "orders-service");
    }
    assert_eq!(validator.calls(), 1);

    assert!(auth.invalidate(READER_TOKEN));
    svc.oneshot(request("/orders", Some(READER_TOKEN), "10.0.0.1"))
        .await
        .expect("authenticated");
    assert_eq!(validator.calls(), 2);
}

#[tokio::test]
async fn test_auth_layer_rejections() {
    let validator = validator();
    let auth = authenticator(AuthConfig::default().with_skip_path("/health"), validator.clone());
    let svc = ServiceBuilder::new()
        .layer(ServiceAuthLayer::new(auth))
        .service(service_fn(caller_service));

    let missing = svc.clone().oneshot(request("/orders", None, "10.0.0.1")).await;
    assert!(matches!(missing, Err(PlatformError::Auth(AuthError::MissingToken))));

    let unknown = svc.clone().oneshot(request("/orders", Some("forged"), "10.0.0.1")).await;
    assert!(matches!(unknown, Err(PlatformError::Auth(AuthError::InvalidToken))));

    let health = svc.clone().oneshot(request("/health/live", None, "10.0.0.1")).await;
    assert_eq!(health.expect("skipped"), "anonymous");

    validator.set_unavailable(true);
    let outage = svc.oneshot(request("/orders", Some(ADMIN_TOKEN), "10.0.0.1")).await;
    let err = outage.expect_err("outage");
    assert!(matches!(err, PlatformError::Auth(AuthError::ValidatorUnavailable { .. })));
    assert_eq!(err.code().http_status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_expired_token_is_not_cached() {
    let validator = validator();
    let auth = authenticator(AuthConfig::default(), validator.clone());
    let ctx = CallContext::new();

    for _ in 0..2 {
        auth.validate_token(&ctx, EXPIRED_TOKEN).await.expect("valid at authority");
    }
    assert_eq!(validator.calls(), 2);
    assert!(!auth.cache().contains(EXPIRED_TOKEN));
}

#[tokio::test]
async fn test_scope_layers() {
    let auth = authenticator(AuthConfig::default(), validator());
    let svc = ServiceBuilder::new()
        .layer(ServiceAuthLayer::new(auth))
        .layer(RequireScopeLayer::new("inventory:write"))
        .service(service_fn(caller_service));

    // reader holds inventory:*, admin holds *
    for token in [READER_TOKEN, ADMIN_TOKEN] {
        svc.clone()
            .oneshot(request("/inventory", Some(token), "10.0.0.1"))
            .await
            .expect("in scope");
    }

    let svc = ServiceBuilder::new()
        .layer(ServiceAuthLayer::new(authenticator(AuthConfig::default(), validator())))
        .layer(RequireScopeLayer::new("orders:write"))
        .service(service_fn(caller_service));
    let denied = svc.oneshot(request("/orders", Some(READER_TOKEN), "10.0.0.1")).await;
    let err = denied.expect_err("denied");
    assert_eq!(err.code().http_status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_remote_validator_over_http_client() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.push_json(
        200,
        &serde_json::json!({
            "valid": true,
            "clientId": "client-billing",
            "serviceName": "billing-service",
            "tenantId": "tenant-test",
            "scopes": ["billing:read"],
        }),
    );
    let client = HttpClient::with_transport(
        HttpClientConfig::new("auth", "http://auth.internal").with_retry(fast_retry_policy()),
        transport.clone(),
    )
    .expect("client");
    let auth = Arc::new(
        ServiceAuthenticator::new(
            AuthConfig::default(),
            Arc::new(RemoteTokenValidator::new(Arc::new(client))),
        )
        .expect("auth"),
    );

    let identity = auth
        .authenticate(&CallContext::new(), Some(&bearer("remote-token")))
        .await
        .expect("authenticated");
    assert_eq!(identity.service_name, "billing-service");
    assert!(identity.has_scope("billing:read"));

    let sent = transport.requests();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].uri, "http://auth.internal/api/v1/tokens/validate");
    let body: serde_json::Value = serde_json::from_slice(&sent[0].body).expect("json");
    assert_eq!(body["token"], "remote-token");
}

// =============================================================================
// Rate limiting path
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_rate_limit_layer_per_client() {
    let limiter = Arc::new(KeyedRateLimiter::new(RateLimitConfig::default().with_rate(1.0, 2)));
    let svc = ServiceBuilder::new()
        .layer(RateLimitLayer::new(limiter.clone()))
        .service(service_fn(caller_service));

    for _ in 0..2 {
        svc.clone()
            .oneshot(request("/orders", None, "203.0.113.7"))
            .await
            .expect("within burst");
    }
    let denied = svc.clone().oneshot(request("/orders", None, "203.0.113.7")).await;
    match denied {
        Err(PlatformError::RateLimited { retry_after }) => {
            assert!(retry_after > Duration::ZERO && retry_after <= Duration::from_secs(1));
        }
        other => panic!("expected rate limit, got {other:?}"),
    }

    // another caller has its own bucket
    svc.clone()
        .oneshot(request("/orders", None, "198.51.100.1"))
        .await
        .expect("other client");

    tokio::time::advance(Duration::from_secs(1)).await;
    svc.oneshot(request("/orders", None, "203.0.113.7"))
        .await
        .expect("refilled");
    assert_eq!(limiter.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_use_shares_bucket() {
    let limiter = Arc::new(KeyedRateLimiter::new(RateLimitConfig::default().with_rate(0.001, 10)));

    let handles: Vec<_> = (0..32)
        .map(|_| {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.allow("10.1.1.1") })
        })
        .collect();

    let mut allowed = 0;
    for handle in handles {
        if handle.await.expect("task") {
            allowed += 1;
        }
    }

    assert_eq!(allowed, 10);
    assert_eq!(limiter.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_idle_keys_evicted_by_background_sweep() {
    let limiter = KeyedRateLimiter::spawn(
        RateLimitConfig::default()
            .with_ttl(Duration::from_secs(1))
            .with_cleanup_interval(Duration::from_millis(500)),
    )
    .expect("spawn");

    limiter.allow("10.0.0.1");
    limiter.allow("10.0.0.2");
    assert_eq!(limiter.len(), 2);

    tokio::time::sleep(Duration::from_millis(800)).await;
    limiter.allow("10.0.0.2");

    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(limiter.keys(""), vec!["10.0.0.2".to_string()]);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(limiter.is_empty());
    limiter.stop();
}

// =============================================================================
// Properties across the whole path
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_failures_before_success_are_retried(failures in 0usize..3) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .expect("runtime");

        runtime.block_on(async {
            let mut script = vec![503u16; failures];
            script.push(200);
            let transport = Arc::new(ScriptedTransport::with_statuses(&script));
            let client = client_over(&transport);

            let response = client.get(&CallContext::new(), "/stock").await;
            prop_assert_eq!(response.expect("ok").status, StatusCode::OK);
            prop_assert_eq!(transport.count(), failures + 1);
            Ok(())
        })?;
    }
}
