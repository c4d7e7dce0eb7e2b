//! Outbound request interceptors.

use bytes::Bytes;
use http::header::AUTHORIZATION;
use http::{HeaderValue, Request};

use crate::error::PlatformError;

/// A step that may inspect, mutate or reject an outgoing HTTP request.
///
/// Interceptors run in registration order after all headers are applied. A
/// rejection aborts the call without consuming the retry budget.
pub trait HttpInterceptor: Send + Sync {
    /// Mutate `request` in place, or reject it.
    ///
    /// # Errors
    ///
    /// Any error aborts the call and is returned to the caller.
    fn intercept(&self, request: &mut Request<Bytes>) -> Result<(), PlatformError>;
}

impl<F> HttpInterceptor for F
where
    F: Fn(&mut Request<Bytes>) -> Result<(), PlatformError> + Send + Sync,
{
    fn intercept(&self, request: &mut Request<Bytes>) -> Result<(), PlatformError> {
        self(request)
    }
}

/// Adds `Authorization: Bearer <token>` to every outgoing call.
///
/// Works for both the HTTP and the RPC client.
#[derive(Clone)]
pub struct BearerAuth {
    value: HeaderValue,
}

impl std::fmt::Debug for BearerAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BearerAuth").finish_non_exhaustive()
    }
}

impl BearerAuth {
    /// Create an interceptor for `token`.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::InvalidInput`] when the token contains bytes
    /// not allowed in a header.
    pub fn new(token: &str) -> Result<Self, PlatformError> {
        let mut value = HeaderValue::try_from(format!("Bearer {token}"))
            .map_err(|_| PlatformError::invalid_input("bearer token is not a valid header value"))?;
        value.set_sensitive(true);
        Ok(Self { value })
    }

    /// The full header value.
    #[must_use]
    pub const fn header_value(&self) -> &HeaderValue {
        &self.value
    }
}

impl HttpInterceptor for BearerAuth {
    fn intercept(&self, request: &mut Request<Bytes>) -> Result<(), PlatformError> {
        request.headers_mut().insert(AUTHORIZATION, self.value.clone());
        Ok(())
    }
}
