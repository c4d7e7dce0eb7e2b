//! Inbound service-token authentication.
//!
//! [`ServiceAuthenticator`] turns an authorization header into a
//! [`ServiceIdentity`]: cache lookup, remote validation through a
//! [`TokenValidator`] on a miss, then an optional scope check. The HTTP and
//! gRPC layers in [`crate::middleware`] both sit on top of it.

mod authenticator;
mod scope;
mod validator;

pub use authenticator::{
    AuthConfig, BEARER_PREFIX, DEFAULT_CACHE_TTL, ServiceAuthenticator, authorize, extract_bearer,
};
pub use scope::{WILDCARD, has_scope};
pub use validator::{
    DEFAULT_VALIDATE_PATH, RemoteTokenValidator, ServiceIdentity, TokenValidation, TokenValidator,
};
