use async_trait::async_trait;
use axum::body::Body;
use hyper::{Request, Response};
use thiserror::Error;

/// Custom error type for HTTP client operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpClientError {
    /// Error when connection to backend fails
    #[error("connection error: {0}")]
    ConnectionError(String),

    /// Error when request times out
    #[error("timeout error after {0} seconds")]
    Timeout(u64),

    /// Error when request is invalid
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Result type alias for HTTP client operations
pub type HttpClientResult<T> = Result<T, HttpClientError>;

/// HttpClient defines the port (interface) for outbound HTTP: sandbox
/// `/run` forwards, health probes, and worker self-registration.
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Send an HTTP request to a backend server.
    async fn send_request(&self, req: Request<Body>) -> HttpClientResult<Response<Body>>;

    /// Perform a health check against a URL.
    ///
    /// Returns `Ok(true)` for a 2xx response, `Ok(false)` for any other
    /// outcome that is not a timeout.
    async fn health_check(&self, url: &str, timeout_secs: u64) -> HttpClientResult<bool>;
}
