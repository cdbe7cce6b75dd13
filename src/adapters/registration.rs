//! Worker-side self-registration.
//!
//! Sandbox workers call this at boot to announce themselves to a
//! gateway's admin API; the pool then starts probing them.
use axum::body::Body;
use eyre::{Result, WrapErr, eyre};
use hyper::{Request, header};

use crate::{core::route::SandboxInstance, ports::http_client::HttpClient};

/// POST the instance to `<gateway_url>/admin/sandboxes/register`.
///
/// `admin_api_key` must be the gateway's admin key; registration is an
/// admin-surface operation.
pub async fn register_with_gateway(
    client: &dyn HttpClient,
    gateway_url: &str,
    admin_api_key: &str,
    instance: &SandboxInstance,
) -> Result<()> {
    let payload = serde_json::to_string(instance).wrap_err("failed to serialize instance")?;

    let request = Request::builder()
        .method("POST")
        .uri(format!(
            "{}/admin/sandboxes/register",
            gateway_url.trim_end_matches('/')
        ))
        .header(header::CONTENT_TYPE, "application/json")
        .header("X-Api-Key", admin_api_key)
        .body(Body::from(payload))
        .wrap_err("failed to build registration request")?;

    let response = tokio::time::timeout(
        std::time::Duration::from_secs(10),
        client.send_request(request),
    )
    .await
    .map_err(|_| eyre!("registration timed out"))?
    .wrap_err("registration request failed")?;

    if !response.status().is_success() {
        return Err(eyre!("registration failed: {}", response.status()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use hyper::{Response, StatusCode};

    use super::*;
    use crate::{
        core::route::{InstanceStatus, SandboxKind},
        ports::http_client::HttpClientResult,
    };

    struct RecordingClient {
        status: StatusCode,
        seen_uri: Arc<Mutex<Option<String>>>,
    }

    #[async_trait]
    impl HttpClient for RecordingClient {
        async fn send_request(&self, req: Request<Body>) -> HttpClientResult<Response<Body>> {
            *self.seen_uri.lock().unwrap() = Some(req.uri().to_string());
            assert_eq!(req.headers().get("X-Api-Key").unwrap(), "adm-secret");
            Ok(Response::builder()
                .status(self.status)
                .body(Body::empty())
                .unwrap())
        }

        async fn health_check(&self, _url: &str, _timeout_secs: u64) -> HttpClientResult<bool> {
            Ok(true)
        }
    }

    fn instance() -> SandboxInstance {
        SandboxInstance {
            id: "worker-1".to_string(),
            url: "http://worker-1:8194".to_string(),
            kind: SandboxKind::Python,
            status: InstanceStatus::Healthy,
            load: 0,
            last_ping: 0,
        }
    }

    #[tokio::test]
    async fn registers_against_the_admin_surface() {
        let seen_uri = Arc::new(Mutex::new(None));
        let client = RecordingClient {
            status: StatusCode::OK,
            seen_uri: seen_uri.clone(),
        };

        register_with_gateway(&client, "http://gateway:8195/", "adm-secret", &instance())
            .await
            .unwrap();

        assert_eq!(
            seen_uri.lock().unwrap().as_deref(),
            Some("http://gateway:8195/admin/sandboxes/register")
        );
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let client = RecordingClient {
            status: StatusCode::UNAUTHORIZED,
            seen_uri: Arc::new(Mutex::new(None)),
        };

        let result =
            register_with_gateway(&client, "http://gateway:8195", "adm-secret", &instance()).await;
        assert!(result.is_err());
    }
}
