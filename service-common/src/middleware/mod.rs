//! Tower Middleware
//!
//! Inbound layers for HTTP and gRPC servers: service-token authentication,
//! scope checks and per-caller rate limiting.

pub mod auth;
pub mod grpc_auth;
pub mod rate_limiter;

pub use auth::{RequireScopeLayer, RequireScopeService, ServiceAuthLayer, ServiceAuthService};
pub use grpc_auth::{GrpcAuthLayer, GrpcAuthService};
pub use rate_limiter::{RateLimitLayer, RateLimitService, UNKNOWN_CLIENT, client_key};
