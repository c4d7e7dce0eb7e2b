//! Sample validations, identities and policies.

use std::time::Duration;

use chrono::Utc;
use http::StatusCode;
use service_common::RetryPolicy;
use service_common::auth::{BEARER_PREFIX, ServiceIdentity, TokenValidation};

/// Tenant used by every fixture.
pub const TEST_TENANT: &str = "tenant-test";

/// Token accepted with read scopes.
pub const READER_TOKEN: &str = "reader-token";

/// Token accepted with the universal wildcard.
pub const ADMIN_TOKEN: &str = "admin-token";

/// Token the authority reports as already expired.
pub const EXPIRED_TOKEN: &str = "expired-token";

/// `Authorization` header value for `token`.
#[must_use]
pub fn bearer(token: &str) -> String {
    format!("{BEARER_PREFIX}{token}")
}

/// Valid token for `orders-service` with `orders:read` and `inventory:*`.
#[must_use]
pub fn reader_validation() -> TokenValidation {
    TokenValidation {
        valid: true,
        client_id: "client-orders".to_string(),
        service_name: "orders-service".to_string(),
        tenant_id: TEST_TENANT.to_string(),
        user_id: None,
        scopes: vec!["orders:read".to_string(), "inventory:*".to_string()],
        expires_at: Some(Utc::now() + chrono::Duration::hours(1)),
    }
}

/// Valid token holding `*`.
#[must_use]
pub fn admin_validation() -> TokenValidation {
    TokenValidation {
        valid: true,
        client_id: "client-admin".to_string(),
        service_name: "admin-service".to_string(),
        tenant_id: TEST_TENANT.to_string(),
        user_id: Some(uuid::Uuid::new_v4().to_string()),
        scopes: vec!["*".to_string()],
        expires_at: None,
    }
}

/// Valid token whose expiry is in the past.
#[must_use]
pub fn expired_validation() -> TokenValidation {
    TokenValidation {
        expires_at: Some(Utc::now() - chrono::Duration::minutes(5)),
        ..reader_validation()
    }
}

/// Identity matching [`reader_validation`].
#[must_use]
pub fn reader_identity() -> ServiceIdentity {
    reader_validation().identity()
}

/// Two retries on 503, 100ms initial delay, factor 2.
#[must_use]
pub fn fast_retry_policy() -> RetryPolicy<StatusCode> {
    RetryPolicy::with_codes(vec![StatusCode::SERVICE_UNAVAILABLE])
        .with_max_retries(2)
        .with_initial_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(1))
        .with_backoff_factor(2.0)
}
