//! Centralized error types for the service-common library.
//!
//! Every fallible operation returns [`PlatformError`]. Callers branch on the
//! variant (or on [`ErrorCode`]) instead of parsing messages; in particular the
//! exhaustion error [`PlatformError::ServiceUnavailable`] is the only variant
//! that means "the retry budget was spent".

use std::time::Duration;

use http::StatusCode;
use thiserror::Error;
use tonic::{Code, Status};

/// Inbound authentication and authorization failures.
///
/// None of these are retried by this library.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No authorization header was supplied.
    #[error("missing authorization header")]
    MissingToken,

    /// The authorization header is not of the form `Bearer <token>`.
    #[error("invalid authorization format")]
    MalformedAuthorization,

    /// The remote authority answered and rejected the token.
    #[error("token is not valid")]
    InvalidToken,

    /// The remote authority could not be reached.
    #[error("token validator unavailable: {reason}")]
    ValidatorUnavailable {
        /// Underlying failure, for operators
        reason: String,
    },

    /// The token is valid but lacks the scope required by the route.
    #[error("insufficient permissions: requires {required}")]
    InsufficientScope {
        /// Scope the route or method declared
        required: String,
    },
}

impl AuthError {
    /// Get the error code for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InsufficientScope { .. } => ErrorCode::PermissionDenied,
            _ => ErrorCode::Unauthenticated,
        }
    }

    /// Message safe to return to the caller.
    ///
    /// Validator outages are not revealed to the caller; the variant and the
    /// logs keep them apart from invalid tokens.
    #[must_use]
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::MissingToken | Self::MalformedAuthorization => {
                "Missing or invalid authorization header"
            }
            Self::InvalidToken => "Token is not valid",
            Self::ValidatorUnavailable { .. } => "Token validation failed",
            Self::InsufficientScope { .. } => "Insufficient permissions",
        }
    }
}

/// Common error type for platform operations.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum PlatformError {
    /// HTTP transport failure reported by reqwest
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// gRPC status returned by a remote service
    #[error("gRPC error: {0}")]
    Grpc(#[from] Status),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Connection-level failure from any transport
    #[error("Transport error: {message}")]
    Transport {
        /// Description of the failure
        message: String,
    },

    /// A single attempt exceeded its own timeout
    #[error("Operation timed out after {duration:?}")]
    Timeout {
        /// Timeout that elapsed
        duration: Duration,
    },

    /// A remote HTTP service answered with a failure status
    #[error("{service} responded with HTTP {status}")]
    Status {
        /// Target service name
        service: String,
        /// HTTP status code
        status: u16,
        /// Response body, lossily decoded
        body: String,
    },

    /// Retries exhausted against the named service
    #[error("service '{service}' is unavailable after {attempts} attempts: {source}")]
    ServiceUnavailable {
        /// Target service name
        service: String,
        /// Attempts performed
        attempts: u32,
        /// Last underlying error
        #[source]
        source: Box<PlatformError>,
    },

    /// The caller cancelled the operation
    #[error("Operation cancelled")]
    Cancelled,

    /// The caller's deadline expired
    #[error("Deadline exceeded")]
    DeadlineExceeded,

    /// An outbound interceptor refused to send the request
    #[error("Interceptor rejected request: {reason}")]
    Interceptor {
        /// Why the interceptor refused
        reason: String,
    },

    /// Inbound authentication or authorization failure
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Rate limit exceeded
    #[error("Rate limited")]
    RateLimited {
        /// When the caller may try again
        retry_after: Duration,
    },

    /// Invalid input provided
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Stable error codes for API responses.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Transport,
    Timeout,
    UpstreamStatus,
    ServiceUnavailable,
    Cancelled,
    DeadlineExceeded,
    Unauthenticated,
    PermissionDenied,
    RateLimited,
    InvalidInput,
    Internal,
}

impl ErrorCode {
    /// Get the string representation of the error code.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Transport => "TRANSPORT_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::UpstreamStatus => "UPSTREAM_ERROR",
            Self::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            Self::Cancelled => "CANCELLED",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::Unauthenticated => "UNAUTHENTICATED",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::RateLimited => "RATE_LIMITED",
            Self::InvalidInput => "INVALID_INPUT",
            Self::Internal => "INTERNAL_ERROR",
        }
    }

    /// Get the HTTP status for this error.
    #[must_use]
    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::Transport | Self::UpstreamStatus => StatusCode::BAD_GATEWAY,
            Self::Timeout | Self::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            Self::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            // nginx's "client closed request"
            Self::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::PermissionDenied => StatusCode::FORBIDDEN,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::InvalidInput => StatusCode::BAD_REQUEST,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the gRPC status code for this error.
    #[must_use]
    pub const fn grpc_code(&self) -> Code {
        match self {
            Self::Transport | Self::ServiceUnavailable => Code::Unavailable,
            Self::Timeout | Self::DeadlineExceeded => Code::DeadlineExceeded,
            Self::UpstreamStatus => Code::Unknown,
            Self::Cancelled => Code::Cancelled,
            Self::Unauthenticated => Code::Unauthenticated,
            Self::PermissionDenied => Code::PermissionDenied,
            Self::RateLimited => Code::ResourceExhausted,
            Self::InvalidInput => Code::InvalidArgument,
            Self::Internal => Code::Internal,
        }
    }
}

impl PlatformError {
    /// Get the error code for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Http(_) | Self::Transport { .. } => ErrorCode::Transport,
            Self::Grpc(_) | Self::Status { .. } => ErrorCode::UpstreamStatus,
            Self::Serialization(_) | Self::InvalidInput(_) => ErrorCode::InvalidInput,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::ServiceUnavailable { .. } => ErrorCode::ServiceUnavailable,
            Self::Cancelled => ErrorCode::Cancelled,
            Self::DeadlineExceeded => ErrorCode::DeadlineExceeded,
            Self::Interceptor { .. } | Self::Internal(_) => ErrorCode::Internal,
            Self::Auth(err) => err.code(),
            Self::RateLimited { .. } => ErrorCode::RateLimited,
        }
    }

    /// Check if this error is a transient transport-class failure.
    ///
    /// Status failures (HTTP or gRPC) are not classified here; the retry
    /// policy of the client that received them decides.
    ///
    /// # Examples
    ///
    /// ```
    /// use service_common::PlatformError;
    ///
    /// assert!(PlatformError::transport("connection reset").is_retryable());
    /// assert!(!PlatformError::Cancelled.is_retryable());
    /// ```
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Http(_) | Self::Transport { .. } | Self::Timeout { .. } | Self::RateLimited { .. }
        )
    }

    /// True when this is the distinguished "retries exhausted" error.
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        matches!(self, Self::ServiceUnavailable { .. })
    }

    /// True when the caller's cancellation or deadline ended the operation.
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded)
    }

    /// Convert to a gRPC status.
    ///
    /// Upstream gRPC statuses pass through unchanged.
    #[must_use]
    pub fn to_status(&self) -> Status {
        match self {
            Self::Grpc(status) => Status::new(status.code(), status.message()),
            Self::Auth(err) => Status::new(err.code().grpc_code(), err.public_message()),
            other => Status::new(other.code().grpc_code(), other.to_string()),
        }
    }

    /// Create a transport error with the given message.
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create an interceptor rejection with the given reason.
    #[must_use]
    pub fn interceptor(reason: impl Into<String>) -> Self {
        Self::Interceptor {
            reason: reason.into(),
        }
    }

    /// Create an invalid input error with the given message.
    #[must_use]
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create an internal error with the given message.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create the exhaustion error for `service` wrapping its last failure.
    #[must_use]
    pub fn service_unavailable(service: impl Into<String>, attempts: u32, last: Self) -> Self {
        Self::ServiceUnavailable {
            service: service.into(),
            attempts,
            source: Box::new(last),
        }
    }
}

impl From<std::convert::Infallible> for PlatformError {
    fn from(never: std::convert::Infallible) -> Self {
        match never {}
    }
}
