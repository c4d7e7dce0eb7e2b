//! Cached bearer-token authentication shared by the HTTP and gRPC layers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, instrument, warn};

use super::validator::{ServiceIdentity, TokenValidation, TokenValidator};
use crate::cache::{TtlCache, TtlCacheConfig};
use crate::context::CallContext;
use crate::error::{AuthError, PlatformError};

/// Prefix every authorization header must carry.
pub const BEARER_PREFIX: &str = "Bearer ";

/// Default lifetime of a cached validation.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

/// Inbound authentication configuration.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// When false every request passes unauthenticated
    pub enabled: bool,
    /// Upper bound on how long a validation is cached
    pub cache_ttl: Duration,
    /// Scope every authenticated request must carry
    pub required_scope: Option<String>,
    /// HTTP path prefixes that bypass authentication
    pub skip_paths: Vec<String>,
    /// gRPC full method names that bypass authentication
    pub skip_methods: Vec<String>,
    /// Required scope per gRPC full method name
    pub scope_map: HashMap<String, String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_ttl: DEFAULT_CACHE_TTL,
            required_scope: None,
            skip_paths: Vec::new(),
            skip_methods: Vec::new(),
            scope_map: HashMap::new(),
        }
    }
}

impl AuthConfig {
    /// Enable or disable authentication.
    #[must_use]
    pub const fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the cache lifetime.
    #[must_use]
    pub const fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Require `scope` on every request.
    #[must_use]
    pub fn with_required_scope(mut self, scope: impl Into<String>) -> Self {
        self.required_scope = Some(scope.into());
        self
    }

    /// Bypass authentication for paths starting with `prefix`.
    #[must_use]
    pub fn with_skip_path(mut self, prefix: impl Into<String>) -> Self {
        self.skip_paths.push(prefix.into());
        self
    }

    /// Bypass authentication for the gRPC method `method`.
    #[must_use]
    pub fn with_skip_method(mut self, method: impl Into<String>) -> Self {
        self.skip_methods.push(method.into());
        self
    }

    /// Require `scope` for the gRPC method `method`.
    #[must_use]
    pub fn with_method_scope(mut self, method: impl Into<String>, scope: impl Into<String>) -> Self {
        self.scope_map.insert(method.into(), scope.into());
        self
    }

    /// Whether `path` bypasses authentication.
    #[must_use]
    pub fn should_skip_path(&self, path: &str) -> bool {
        self.skip_paths.iter().any(|prefix| path.starts_with(prefix.as_str()))
    }

    /// Whether the gRPC `method` bypasses authentication.
    #[must_use]
    pub fn should_skip_method(&self, method: &str) -> bool {
        self.skip_methods.iter().any(|m| m == method)
    }

    /// Scope required by the gRPC `method`, falling back to the global one.
    #[must_use]
    pub fn scope_for_method(&self, method: &str) -> Option<&str> {
        self.scope_map
            .get(method)
            .or(self.required_scope.as_ref())
            .map(String::as_str)
            .filter(|scope| !scope.is_empty())
    }

    /// Check the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::InvalidInput`] for a zero cache TTL.
    pub fn validate(&self) -> Result<(), PlatformError> {
        if self.cache_ttl.is_zero() {
            return Err(PlatformError::invalid_input("auth cache ttl must be positive"));
        }
        Ok(())
    }
}

/// Strip the `Bearer ` prefix from an authorization header.
///
/// # Errors
///
/// Returns [`AuthError::MissingToken`] for an absent or empty header and
/// [`AuthError::MalformedAuthorization`] for anything else that is not
/// `Bearer <token>`.
pub fn extract_bearer(authorization: Option<&str>) -> Result<&str, AuthError> {
    let header = authorization
        .filter(|h| !h.is_empty())
        .ok_or(AuthError::MissingToken)?;
    header
        .strip_prefix(BEARER_PREFIX)
        .filter(|token| !token.is_empty())
        .ok_or(AuthError::MalformedAuthorization)
}

/// Check `identity` against an optional required scope.
///
/// # Errors
///
/// Returns [`AuthError::InsufficientScope`] when the scope is missing.
pub fn authorize(identity: &ServiceIdentity, required: Option<&str>) -> Result<(), AuthError> {
    match required {
        Some(scope) if !identity.has_scope(scope) => Err(AuthError::InsufficientScope {
            required: scope.to_string(),
        }),
        _ => Ok(()),
    }
}

/// Authenticates bearer tokens through a [`TokenValidator`], caching
/// successful validations.
///
/// Only valid results are cached. Two concurrent first requests with the same
/// token may both reach the validator.
pub struct ServiceAuthenticator {
    config: AuthConfig,
    validator: Arc<dyn TokenValidator>,
    cache: Arc<TtlCache<TokenValidation>>,
}

impl std::fmt::Debug for ServiceAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceAuthenticator")
            .field("config", &self.config)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl ServiceAuthenticator {
    /// Create an authenticator.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::InvalidInput`] for an invalid configuration.
    pub fn new(config: AuthConfig, validator: Arc<dyn TokenValidator>) -> Result<Self, PlatformError> {
        config.validate()?;
        let cache = TtlCache::new(
            TtlCacheConfig::default()
                .with_name("token_cache")
                .with_default_ttl(config.cache_ttl),
        );
        Ok(Self {
            config,
            validator,
            cache: Arc::new(cache),
        })
    }

    /// Authentication configuration.
    #[must_use]
    pub const fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// The validation cache.
    #[must_use]
    pub const fn cache(&self) -> &Arc<TtlCache<TokenValidation>> {
        &self.cache
    }

    /// Authenticate an authorization header value.
    ///
    /// # Errors
    ///
    /// - [`AuthError::MissingToken`] or [`AuthError::MalformedAuthorization`]
    ///   without contacting the validator
    /// - [`AuthError::InvalidToken`] when the validator rejects the token
    /// - [`AuthError::ValidatorUnavailable`] when the validator cannot answer
    pub async fn authenticate(
        &self,
        ctx: &CallContext,
        authorization: Option<&str>,
    ) -> Result<ServiceIdentity, AuthError> {
        let token = extract_bearer(authorization)?;
        let validation = self.validate_token(ctx, token).await?;
        Ok(validation.identity())
    }

    /// Authenticate, then check `required`.
    ///
    /// # Errors
    ///
    /// As [`authenticate`](Self::authenticate), plus
    /// [`AuthError::InsufficientScope`].
    pub async fn authenticate_scoped(
        &self,
        ctx: &CallContext,
        authorization: Option<&str>,
        required: Option<&str>,
    ) -> Result<ServiceIdentity, AuthError> {
        let identity = self.authenticate(ctx, authorization).await?;
        authorize(&identity, required)?;
        Ok(identity)
    }

    /// Validate a raw token, consulting the cache first.
    ///
    /// # Errors
    ///
    /// [`AuthError::InvalidToken`] or [`AuthError::ValidatorUnavailable`].
    #[instrument(skip_all)]
    pub async fn validate_token(&self, ctx: &CallContext, token: &str) -> Result<TokenValidation, AuthError> {
        if let Some(cached) = self.cache.get(token) {
            debug!("Token validation cache hit");
            return Ok(cached);
        }

        let validation = ctx
            .run(self.validator.validate(ctx, token))
            .await
            .and_then(|result| result)
            .map_err(|e| {
                warn!(error = %e, "Token validation failed");
                AuthError::ValidatorUnavailable {
                    reason: e.to_string(),
                }
            })?;

        if !validation.valid {
            debug!("Token rejected by authority");
            return Err(AuthError::InvalidToken);
        }

        match validation.cache_ttl(self.config.cache_ttl, Utc::now()) {
            Some(ttl) => self.cache.set(token, validation.clone(), ttl),
            None => debug!("Token expires at authority, not caching"),
        }
        Ok(validation)
    }

    /// Drop the cached validation of `token`.
    pub fn invalidate(&self, token: &str) -> bool {
        self.cache.invalidate(token)
    }

    /// Drop every cached validation.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }
}
