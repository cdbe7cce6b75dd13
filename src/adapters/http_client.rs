//! HTTP client adapter using Hyper with Rustls (HTTP/1.1 + HTTP/2).
//!
//! Responsibilities:
//! * Forwards execution requests to sandbox workers
//! * Performs GET-based health probes with a timeout
//! * Converts between Hyper and Axum body types
//!
//! This adapter is intentionally minimal; retries / circuit breaking can
//! be layered on a different abstraction if required.
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use eyre::Result;
use http_body_util::BodyExt;
use hyper::{Request, Response, Version, header, header::HeaderValue};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use rustls_native_certs::load_native_certs;
use tokio::time::timeout;

use crate::ports::http_client::{HttpClient, HttpClientError, HttpClientResult};

pub struct HttpClientAdapter {
    client: Client<HttpsConnector<HttpConnector>, Body>,
}

impl HttpClientAdapter {
    /// Create a new HTTP client adapter.
    pub fn new() -> Result<Self> {
        // Install default crypto provider for rustls if not already set
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false); // Allow HTTPS URLs

        let mut root_cert_store = rustls::RootCertStore::empty();
        let native_certs = load_native_certs();

        for cert in native_certs.certs {
            if root_cert_store.add(cert).is_err() {
                tracing::warn!("failed to add native certificate to rustls RootCertStore");
            }
        }
        if !native_certs.errors.is_empty() {
            tracing::warn!(errors = ?native_certs.errors, "some native certificates failed to load");
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();

        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new()).build::<_, Body>(https_connector);

        Ok(Self { client })
    }

    fn user_agent() -> HeaderValue {
        HeaderValue::from_static(concat!("sandgate/", env!("CARGO_PKG_VERSION")))
    }
}

#[async_trait]
impl HttpClient for HttpClientAdapter {
    async fn send_request(&self, mut req: Request<Body>) -> HttpClientResult<Response<Body>> {
        if !req.headers().contains_key(header::USER_AGENT) {
            req.headers_mut()
                .insert(header::USER_AGENT, Self::user_agent());
        }

        // Set Host header from the target URI.
        let host_value = match req.uri().host() {
            Some(host) => {
                let rendered = match req.uri().port() {
                    Some(port) => format!("{host}:{}", port.as_u16()),
                    None => host.to_string(),
                };
                HeaderValue::from_str(&rendered)
                    .map_err(|e| HttpClientError::InvalidRequest(e.to_string()))?
            }
            None => {
                return Err(HttpClientError::InvalidRequest(
                    "outgoing URI has no host".to_string(),
                ));
            }
        };
        req.headers_mut().insert(header::HOST, host_value);

        let (mut parts, body) = req.into_parts();
        // Force HTTP/1.1 on the wire; ALPN may still negotiate h2.
        parts.version = Version::HTTP_11;
        let outgoing = Request::from_parts(parts, body);

        let method = outgoing.method().clone();
        let uri = outgoing.uri().clone();

        match self.client.request(outgoing).await {
            Ok(response) => {
                let (mut parts, hyper_body) = response.into_parts();
                // The body is re-framed by the server in front of us.
                parts.headers.remove(header::TRANSFER_ENCODING);
                Ok(Response::from_parts(parts, Body::new(hyper_body)))
            }
            Err(e) => {
                tracing::error!(method = %method, uri = %uri, error = %e, "backend request failed");
                Err(HttpClientError::ConnectionError(format!(
                    "request to {method} {uri} failed: {e}"
                )))
            }
        }
    }

    async fn health_check(&self, url: &str, timeout_secs: u64) -> HttpClientResult<bool> {
        let request = Request::builder()
            .method("GET")
            .uri(url)
            .version(Version::HTTP_11)
            .header(header::USER_AGENT, Self::user_agent())
            .body(Body::empty())
            .map_err(|e| HttpClientError::InvalidRequest(e.to_string()))?;

        let deadline = Duration::from_secs(timeout_secs);
        match timeout(deadline, self.client.request(request)).await {
            Ok(Ok(response)) => {
                let is_healthy = response.status().is_success();
                // Consume the body to release the connection.
                let _ = response.into_body().collect().await;
                tracing::debug!(url, healthy = is_healthy, "health probe completed");
                Ok(is_healthy)
            }
            Ok(Err(e)) => {
                tracing::debug!(url, error = %e, "health probe connection failed");
                Ok(false)
            }
            Err(_) => Err(HttpClientError::Timeout(timeout_secs)),
        }
    }
}

impl HttpClientAdapter {
    /// Convenience method for JSON POST requests.
    pub async fn post_json(&self, url: &str, body: Body) -> HttpClientResult<Response<Body>> {
        let request = Request::builder()
            .method("POST")
            .uri(url)
            .header(header::CONTENT_TYPE, "application/json")
            .body(body)
            .map_err(|e| HttpClientError::InvalidRequest(e.to_string()))?;

        self.send_request(request).await
    }
}
