//! Test doubles for the collaborators service-common talks to.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method, Request, StatusCode};
use parking_lot::{Mutex, RwLock};
use service_common::auth::{TokenValidation, TokenValidator};
use service_common::client::{HttpInterceptor, HttpResponse, HttpTransport, RpcInterceptor};
use service_common::{CallContext, PlatformError};
use tonic::Status;
use tonic::metadata::MetadataMap;

/// In-memory [`TokenValidator`].
///
/// Unknown tokens validate as invalid. Switching it to unavailable makes
/// every call fail like an unreachable auth service.
#[derive(Debug, Default)]
pub struct MockTokenValidator {
    tokens: RwLock<HashMap<String, TokenValidation>>,
    unavailable: AtomicBool,
    calls: AtomicUsize,
    latency: RwLock<Option<Duration>>,
}

impl MockTokenValidator {
    /// Create an empty validator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `token` with `validation`.
    #[must_use]
    pub fn with_token(self, token: impl Into<String>, validation: TokenValidation) -> Self {
        self.tokens.write().insert(token.into(), validation);
        self
    }

    /// Delay every answer by `latency`.
    #[must_use]
    pub fn with_latency(self, latency: Duration) -> Self {
        *self.latency.write() = Some(latency);
        self
    }

    /// Simulate an outage of the auth service.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of validations requested so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenValidator for MockTokenValidator {
    async fn validate(&self, _ctx: &CallContext, token: &str) -> Result<TokenValidation, PlatformError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let latency = *self.latency.read();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(PlatformError::service_unavailable(
                "auth",
                1,
                PlatformError::transport("connection refused"),
            ));
        }
        Ok(self
            .tokens
            .read()
            .get(token)
            .cloned()
            .unwrap_or_else(TokenValidation::invalid))
    }
}

/// A request seen by [`ScriptedTransport`].
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    /// HTTP method
    pub method: Method,
    /// Full URI
    pub uri: String,
    /// Headers after defaults and interceptors
    pub headers: HeaderMap,
    /// Request body
    pub body: Bytes,
    /// Timeout handed to the transport
    pub timeout: Duration,
}

/// [`HttpTransport`] that replays a script and records every request.
///
/// Once the script is used up every call answers with the fallback status.
#[derive(Debug)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Result<HttpResponse, PlatformError>>>,
    fallback: StatusCode,
    requests: Mutex<Vec<RecordedRequest>>,
    latency: Option<Duration>,
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: StatusCode::OK,
            requests: Mutex::new(Vec::new()),
            latency: None,
        }
    }
}

impl ScriptedTransport {
    /// Transport answering 200 until scripted otherwise.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport answering the given statuses in order.
    #[must_use]
    pub fn with_statuses(statuses: &[u16]) -> Self {
        let transport = Self::new();
        for status in statuses {
            transport.push_status(*status, "");
        }
        transport
    }

    /// Status returned once the script is exhausted.
    #[must_use]
    pub const fn with_fallback(mut self, status: StatusCode) -> Self {
        self.fallback = status;
        self
    }

    /// Delay every answer by `latency`.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Append a response to the script.
    ///
    /// # Panics
    ///
    /// Panics on a status code outside 100..=999.
    pub fn push_status(&self, status: u16, body: &'static str) {
        let status = StatusCode::from_u16(status).expect("valid status code");
        self.script.lock().push_back(Ok(HttpResponse::new(status, body)));
    }

    /// Append a JSON response to the script.
    ///
    /// # Panics
    ///
    /// Panics on a status code outside 100..=999.
    pub fn push_json(&self, status: u16, body: &serde_json::Value) {
        let status = StatusCode::from_u16(status).expect("valid status code");
        self.script
            .lock()
            .push_back(Ok(HttpResponse::new(status, body.to_string())));
    }

    /// Append a transport failure to the script.
    pub fn push_error(&self, error: PlatformError) {
        self.script.lock().push_back(Err(error));
    }

    /// Requests seen so far.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    /// Number of requests seen so far.
    pub fn count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(&self, request: Request<Bytes>, timeout: Duration) -> Result<HttpResponse, PlatformError> {
        let (parts, body) = request.into_parts();
        self.requests.lock().push(RecordedRequest {
            method: parts.method,
            uri: parts.uri.to_string(),
            headers: parts.headers,
            body,
            timeout,
        });

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let next = self.script.lock().pop_front();
        next.unwrap_or_else(|| Ok(HttpResponse::new(self.fallback, "")))
    }
}

/// Interceptor that records what it saw and optionally tags or rejects calls.
#[derive(Debug, Clone, Default)]
pub struct RecordingInterceptor {
    seen: Arc<Mutex<Vec<String>>>,
    reject: Arc<AtomicBool>,
}

impl RecordingInterceptor {
    /// Header set on every intercepted HTTP request and RPC.
    pub const TAG_HEADER: &'static str = "x-intercepted";

    /// Create a new interceptor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject subsequent calls.
    pub fn set_reject(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    /// `METHOD path` of every HTTP request, or the RPC method name.
    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().clone()
    }
}

impl HttpInterceptor for RecordingInterceptor {
    fn intercept(&self, request: &mut Request<Bytes>) -> Result<(), PlatformError> {
        self.seen
            .lock()
            .push(format!("{} {}", request.method(), request.uri().path()));
        if self.reject.load(Ordering::SeqCst) {
            return Err(PlatformError::interceptor("rejected by recording interceptor"));
        }
        request
            .headers_mut()
            .insert(Self::TAG_HEADER, http::HeaderValue::from_static("1"));
        Ok(())
    }
}

impl RpcInterceptor for RecordingInterceptor {
    fn intercept(&self, method: &str, metadata: &mut MetadataMap) -> Result<(), Status> {
        self.seen.lock().push(method.to_string());
        if self.reject.load(Ordering::SeqCst) {
            return Err(Status::permission_denied("rejected by recording interceptor"));
        }
        metadata.insert(Self::TAG_HEADER, tonic::metadata::MetadataValue::from_static("1"));
        Ok(())
    }
}
