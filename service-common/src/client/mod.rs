//! Outbound clients with retry, deadlines and interceptors.
//!
//! - [`HttpClient`]: JSON-over-HTTP calls against a base URL
//! - [`RpcClient`]: gRPC calls over a tonic channel
//!
//! Both classify failures through [`crate::retry::RetryPolicy`] and honor the
//! caller's [`crate::context::CallContext`].

mod http;
mod interceptor;
mod rpc;
mod transport;

pub use self::http::{DEFAULT_TIMEOUT, HttpClient, HttpClientConfig, OutboundRequest};
pub use interceptor::{BearerAuth, HttpInterceptor};
pub use rpc::{DEFAULT_CONNECT_TIMEOUT, RpcClient, RpcClientConfig, RpcInterceptor};
pub use transport::{HttpConfig, HttpResponse, HttpTransport, ReqwestTransport, build_http_client};
