//! Proptest generators for service-common types.

use std::time::Duration;

use http::StatusCode;
use proptest::prelude::*;
use service_common::RetryPolicy;

/// Status codes commonly configured as retryable.
pub const RETRYABLE_STATUSES: [u16; 4] = [429, 502, 503, 504];

/// Generate a valid HTTP retry policy retrying [`RETRYABLE_STATUSES`].
pub fn retry_policy_strategy() -> impl Strategy<Value = RetryPolicy<StatusCode>> {
    (0u32..6, 1u64..1_000, 0u64..30_000, 1.01f64..4.0).prop_map(
        |(retries, initial_ms, extra_ms, factor)| {
            RetryPolicy::with_codes(retryable_statuses())
                .with_max_retries(retries)
                .with_initial_delay(Duration::from_millis(initial_ms))
                .with_max_delay(Duration::from_millis(initial_ms + extra_ms))
                .with_backoff_factor(factor)
        },
    )
}

/// [`RETRYABLE_STATUSES`] as status codes.
#[must_use]
pub fn retryable_statuses() -> Vec<StatusCode> {
    RETRYABLE_STATUSES
        .iter()
        .filter_map(|s| StatusCode::from_u16(*s).ok())
        .collect()
}

/// Generate a status from [`RETRYABLE_STATUSES`].
pub fn retryable_status_strategy() -> impl Strategy<Value = StatusCode> {
    prop::sample::select(retryable_statuses())
}

/// Generate a 2xx or 4xx status that is never retried.
pub fn non_retryable_status_strategy() -> impl Strategy<Value = StatusCode> {
    prop::sample::select(vec![
        StatusCode::OK,
        StatusCode::CREATED,
        StatusCode::NO_CONTENT,
        StatusCode::BAD_REQUEST,
        StatusCode::UNAUTHORIZED,
        StatusCode::FORBIDDEN,
        StatusCode::NOT_FOUND,
        StatusCode::CONFLICT,
    ])
}

/// Generate a `resource:action` scope.
pub fn scope_strategy() -> impl Strategy<Value = String> {
    ("[a-z]{2,10}", "[a-z]{2,8}").prop_map(|(resource, action)| format!("{resource}:{action}"))
}

/// Generate a set of granted scopes, possibly including wildcards.
pub fn granted_scopes_strategy() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec(
        prop_oneof![
            8 => scope_strategy(),
            1 => "[a-z]{2,10}".prop_map(|resource| format!("{resource}:*")),
            1 => Just("*".to_string()),
        ],
        0..6,
    )
}

/// Generate an IPv4 client address.
pub fn client_ip_strategy() -> impl Strategy<Value = String> {
    any::<[u8; 4]>().prop_map(|[a, b, c, d]| format!("{a}.{b}.{c}.{d}"))
}

/// Generate an opaque bearer token.
pub fn token_strategy() -> impl Strategy<Value = String> {
    "[A-Za-z0-9_-]{16,64}"
}
