//! Token validation capability and its remote adapter.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::scope::has_scope;
use crate::client::HttpClient;
use crate::context::CallContext;
use crate::error::PlatformError;

/// Default path of the auth service's validation endpoint.
pub const DEFAULT_VALIDATE_PATH: &str = "/api/v1/tokens/validate";

/// Caller identity attached to an authenticated request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceIdentity {
    /// OAuth client id of the calling service
    pub client_id: String,
    /// Name of the calling service
    pub service_name: String,
    /// Tenant the call acts for; may be empty
    pub tenant_id: String,
    /// End user on whose behalf the service acts
    pub user_id: Option<String>,
    /// Granted scopes
    pub scopes: Vec<String>,
}

impl ServiceIdentity {
    /// Whether the identity was granted `required`.
    #[must_use]
    pub fn has_scope(&self, required: &str) -> bool {
        has_scope(&self.scopes, required)
    }
}

/// Answer of the validating authority for one token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TokenValidation {
    /// Whether the authority accepted the token
    pub valid: bool,
    /// Client id the token was issued to
    pub client_id: String,
    /// Service name the token was issued to
    pub service_name: String,
    /// Tenant id
    pub tenant_id: String,
    /// User id, for delegated tokens
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Granted scopes
    pub scopes: Vec<String>,
    /// Expiry of the token at the authority
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl TokenValidation {
    /// A rejected token.
    #[must_use]
    pub fn invalid() -> Self {
        Self::default()
    }

    /// The identity carried by this validation.
    #[must_use]
    pub fn identity(&self) -> ServiceIdentity {
        ServiceIdentity {
            client_id: self.client_id.clone(),
            service_name: self.service_name.clone(),
            tenant_id: self.tenant_id.clone(),
            user_id: self.user_id.clone().filter(|id| !id.is_empty()),
            scopes: self.scopes.clone(),
        }
    }

    /// How long this validation may be cached at `now`.
    ///
    /// The lifetime never outlives the authority's own expiry. `None` means
    /// the token is already expired and must not be cached.
    #[must_use]
    pub fn cache_ttl(&self, max: Duration, now: DateTime<Utc>) -> Option<Duration> {
        let Some(expires_at) = self.expires_at else {
            return Some(max);
        };
        let remaining = (expires_at - now).to_std().ok()?;
        if remaining.is_zero() {
            return None;
        }
        Some(remaining.min(max))
    }
}

/// Validates bearer tokens against an authority.
///
/// `Ok` with `valid == false` means the authority rejected the token; `Err`
/// means the authority could not be asked.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    /// Validate `token` within `ctx`.
    ///
    /// # Errors
    ///
    /// Returns an error when the authority is unreachable or answers garbage.
    async fn validate(&self, ctx: &CallContext, token: &str) -> Result<TokenValidation, PlatformError>;
}

#[async_trait]
impl<T: TokenValidator + ?Sized> TokenValidator for Arc<T> {
    async fn validate(&self, ctx: &CallContext, token: &str) -> Result<TokenValidation, PlatformError> {
        (**self).validate(ctx, token).await
    }
}

#[derive(Serialize)]
struct ValidateRequest<'a> {
    token: &'a str,
}

/// [`TokenValidator`] that asks the auth service over HTTP.
///
/// Sends `POST {"token": "..."}` to the validate path; any non-2xx reply that
/// survives the client's retry policy counts as an invalid token.
#[derive(Debug, Clone)]
pub struct RemoteTokenValidator {
    client: Arc<HttpClient>,
    validate_path: String,
}

impl RemoteTokenValidator {
    /// Validator using `client` and [`DEFAULT_VALIDATE_PATH`].
    #[must_use]
    pub fn new(client: Arc<HttpClient>) -> Self {
        Self {
            client,
            validate_path: DEFAULT_VALIDATE_PATH.to_string(),
        }
    }

    /// Override the validate path.
    #[must_use]
    pub fn with_validate_path(mut self, path: impl Into<String>) -> Self {
        self.validate_path = path.into();
        self
    }
}

#[async_trait]
impl TokenValidator for RemoteTokenValidator {
    #[instrument(skip_all, fields(service = %self.client.service_name()))]
    async fn validate(&self, ctx: &CallContext, token: &str) -> Result<TokenValidation, PlatformError> {
        let response = self
            .client
            .post(ctx, &self.validate_path, &ValidateRequest { token })
            .await?;

        if !response.is_success() {
            debug!(status = response.status.as_u16(), "Authority rejected token");
            return Ok(TokenValidation::invalid());
        }
        response.json()
    }
}
