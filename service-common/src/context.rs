//! Request-scoped state passed explicitly down the call chain.
//!
//! [`CallContext`] carries the caller's deadline and cancellation signal into
//! every outbound attempt and remote validation. [`RequestContext`] carries
//! metadata about the inbound request (ids, tenant, authenticated caller);
//! every field is optional and reading an absent field is never an error.

use std::future::Future;
use std::time::Duration;

use http::{Extensions, HeaderMap};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::auth::ServiceIdentity;
use crate::error::PlatformError;

/// Header carrying the request id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";
/// Header carrying the trace id.
pub const TRACE_ID_HEADER: &str = "x-trace-id";
/// Header carrying the tenant id.
pub const TENANT_ID_HEADER: &str = "x-tenant-id";

/// Why a [`CallContext`] finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneReason {
    /// The cancellation token fired
    Cancelled,
    /// The deadline passed
    DeadlineExceeded,
}

impl DoneReason {
    /// Convert into the matching error.
    #[must_use]
    pub const fn into_error(self) -> PlatformError {
        match self {
            Self::Cancelled => PlatformError::Cancelled,
            Self::DeadlineExceeded => PlatformError::DeadlineExceeded,
        }
    }
}

/// Deadline and cancellation for one logical call.
///
/// Cloning is cheap; clones share the cancellation token.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    deadline: Option<Instant>,
    cancellation: CancellationToken,
}

impl CallContext {
    /// Create a context with no deadline and a fresh cancellation token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound the context by `timeout` from now.
    ///
    /// An earlier existing deadline is kept. A timeout too large to
    /// represent as an instant leaves the context unbounded by it.
    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.with_deadline(deadline),
            None => self,
        }
    }

    /// Bound the context by an absolute deadline.
    ///
    /// An earlier existing deadline is kept.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(current) if current < deadline => current,
            _ => deadline,
        });
        self
    }

    /// The context stored in request extensions by an upstream layer, or a
    /// fresh one.
    #[must_use]
    pub fn from_extensions(extensions: &Extensions) -> Self {
        extensions.get::<Self>().cloned().unwrap_or_default()
    }

    /// Use `token` as the cancellation signal.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Derive a context whose token is a child of this one.
    ///
    /// Cancelling the parent cancels the child; not the reverse.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            deadline: self.deadline,
            cancellation: self.cancellation.child_token(),
        }
    }

    /// Cancel this context and every clone of it.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// The cancellation token.
    #[must_use]
    pub const fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// The absolute deadline, if any.
    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, if any.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Clamp `timeout` to the time remaining before the deadline.
    #[must_use]
    pub fn bound(&self, timeout: Duration) -> Duration {
        self.remaining().map_or(timeout, |remaining| remaining.min(timeout))
    }

    /// Non-blocking check of whether the context has finished.
    #[must_use]
    pub fn is_done(&self) -> Option<DoneReason> {
        if self.cancellation.is_cancelled() {
            return Some(DoneReason::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(DoneReason::DeadlineExceeded),
            _ => None,
        }
    }

    /// Return an error if the context has already finished.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::Cancelled`] or [`PlatformError::DeadlineExceeded`].
    pub fn check(&self) -> Result<(), PlatformError> {
        self.is_done().map_or(Ok(()), |reason| Err(reason.into_error()))
    }

    /// Resolve once the token is cancelled or the deadline passes.
    pub async fn done(&self) -> DoneReason {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    () = self.cancellation.cancelled() => DoneReason::Cancelled,
                    () = sleep_until(deadline) => DoneReason::DeadlineExceeded,
                }
            }
            None => {
                self.cancellation.cancelled().await;
                DoneReason::Cancelled
            }
        }
    }

    /// Drive `future` to completion unless the context finishes first.
    ///
    /// # Errors
    ///
    /// Returns the cancellation error when the context wins the race.
    pub async fn run<F: Future>(&self, future: F) -> Result<F::Output, PlatformError> {
        tokio::select! {
            biased;
            reason = self.done() => Err(reason.into_error()),
            output = future => Ok(output),
        }
    }
}

/// Metadata describing one inbound request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    request_id: Option<String>,
    trace_id: Option<String>,
    tenant_id: Option<String>,
    client_ip: Option<String>,
    identity: Option<ServiceIdentity>,
}

impl RequestContext {
    /// Create an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a context from well-known request headers.
    ///
    /// A request id is generated when the caller did not send one.
    #[must_use]
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };

        Self {
            request_id: Some(
                header(REQUEST_ID_HEADER).unwrap_or_else(|| Uuid::new_v4().to_string()),
            ),
            trace_id: header(TRACE_ID_HEADER),
            tenant_id: header(TENANT_ID_HEADER),
            client_ip: None,
            identity: None,
        }
    }

    /// Borrow the context stored in request extensions, if any.
    #[must_use]
    pub fn from_extensions(extensions: &Extensions) -> Option<&Self> {
        extensions.get::<Self>()
    }

    /// Get or create the context stored in request extensions.
    pub fn ensure_in<'a>(extensions: &'a mut Extensions, headers: &HeaderMap) -> &'a mut Self {
        extensions.get_or_insert_with(|| Self::from_headers(headers))
    }

    /// Set the request id.
    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Set the trace id.
    #[must_use]
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    /// Set the tenant id.
    #[must_use]
    pub fn with_tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// Set the caller's address.
    #[must_use]
    pub fn with_client_ip(mut self, client_ip: impl Into<String>) -> Self {
        self.client_ip = Some(client_ip.into());
        self
    }

    /// Attach the authenticated caller.
    ///
    /// The identity's tenant fills the tenant id when none is set yet.
    pub fn set_identity(&mut self, identity: ServiceIdentity) {
        if self.tenant_id.is_none() && !identity.tenant_id.is_empty() {
            self.tenant_id = Some(identity.tenant_id.clone());
        }
        self.identity = Some(identity);
    }

    /// Request id.
    #[must_use]
    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    /// Trace id.
    #[must_use]
    pub fn trace_id(&self) -> Option<&str> {
        self.trace_id.as_deref()
    }

    /// Tenant id.
    #[must_use]
    pub fn tenant_id(&self) -> Option<&str> {
        self.tenant_id.as_deref()
    }

    /// Caller address.
    #[must_use]
    pub fn client_ip(&self) -> Option<&str> {
        self.client_ip.as_deref()
    }

    /// Authenticated caller.
    #[must_use]
    pub const fn identity(&self) -> Option<&ServiceIdentity> {
        self.identity.as_ref()
    }

    /// Scopes granted to the authenticated caller; empty when anonymous.
    #[must_use]
    pub fn scopes(&self) -> &[String] {
        self.identity
            .as_ref()
            .map_or(&[], |identity| identity.scopes.as_slice())
    }
}
