//! Shared library for the resilient request path of platform services.
//!
//! This crate provides centralized implementations for:
//! - Error types with retryability classification
//! - Retry policies with exponential backoff and cancellable waits
//! - Outbound HTTP and gRPC clients with interceptors
//! - A concurrent TTL cache with opportunistic and background sweeps
//! - Service-token authentication with cached remote validation
//! - Per-key token-bucket rate limiting with idle eviction
//! - Tower layers for HTTP and gRPC servers
//! - Health checks, tracing setup and Prometheus-style metrics

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod cache;
pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod health;
pub mod metrics;
pub mod middleware;
pub mod rate_limiter;
pub mod retry;
pub mod sweeper;
pub mod telemetry;

pub use auth::{AuthConfig, ServiceAuthenticator, ServiceIdentity, TokenValidator};
pub use cache::{TtlCache, TtlCacheConfig};
pub use client::{HttpClient, HttpClientConfig, RpcClient, RpcClientConfig};
pub use config::{ConfigError, Settings};
pub use context::{CallContext, RequestContext};
pub use error::{AuthError, ErrorCode, PlatformError};
pub use health::{HealthCheck, HealthRegistry, HealthReport, HealthStatus};
pub use rate_limiter::{KeyedRateLimiter, RateLimitConfig, RateLimitDecision};
pub use retry::{Attempt, RetryPolicy};
pub use telemetry::{LogFormat, TracingConfig, init_tracing, try_init_tracing};
