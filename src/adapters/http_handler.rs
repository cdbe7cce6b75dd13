//! Gateway data plane: authenticate, match, dispatch.
//!
//! Mounted as the fallback handler of the gateway listener so every
//! path and method flows through the catalog matcher.
use std::{sync::Arc, time::Duration};

use axum::body::Body;
use hyper::{Request, Response, StatusCode, header};
use tokio::time::timeout;
use tracing::Instrument;
use uuid::Uuid;

use crate::{
    config::models::GatewayConfig,
    core::{
        catalog::RouteCatalog,
        pool::SandboxPool,
        route::{HandlerKind, Route},
    },
    ports::http_client::HttpClient,
    tracing_setup,
};

/// Default sandbox execution timeout when the route does not set one.
const DEFAULT_RUN_TIMEOUT_SECS: u64 = 30;

/// Last-resort key forwarded to sandbox workers when neither the
/// request nor the configuration carries one.
const FALLBACK_SANDBOX_KEY: &str = "sandgate-sandbox";

pub struct GatewayHandler {
    catalog: Arc<RouteCatalog>,
    pool: Arc<SandboxPool>,
    http_client: Arc<dyn HttpClient>,
    config: Arc<GatewayConfig>,
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

fn json_error(status: StatusCode, message: &str) -> Response<Body> {
    json_response(status, serde_json::json!({ "error": message }))
}

/// The `/run` payload a sandbox worker expects.
fn execution_envelope(route: &Route) -> serde_json::Value {
    serde_json::json!({
        "language": "python3",
        "code": route.code.clone().unwrap_or_default(),
        "preload": "",
        "enable_network": true,
        "timeout": route.timeout.unwrap_or(0),
    })
}

/// Key forwarded to the worker: the caller's, else the configured
/// gateway key, else the hard-coded fallback.
fn forwarded_api_key(inbound: Option<&str>, configured: &str) -> String {
    match inbound {
        Some(key) if !key.is_empty() => key.to_string(),
        _ => {
            if configured.is_empty() {
                FALLBACK_SANDBOX_KEY.to_string()
            } else {
                configured.to_string()
            }
        }
    }
}

impl GatewayHandler {
    pub fn new(
        catalog: Arc<RouteCatalog>,
        pool: Arc<SandboxPool>,
        http_client: Arc<dyn HttpClient>,
        config: Arc<GatewayConfig>,
    ) -> Self {
        Self {
            catalog,
            pool,
            http_client,
            config,
        }
    }

    /// Entry point for every request on the gateway listener.
    pub async fn handle(&self, req: Request<Body>) -> Response<Body> {
        let method = req.method().to_string();
        let path = req.uri().path().to_string();
        let request_id = Uuid::new_v4().to_string();
        let span = tracing_setup::create_request_span(&method, &path, &request_id);

        let start = std::time::Instant::now();
        let response = self.route_request(req, &path, &method).instrument(span).await;

        if self.config.app.debug {
            tracing::info!(
                method = %method,
                path = %path,
                status = response.status().as_u16(),
                duration_ms = start.elapsed().as_millis() as u64,
                "request completed"
            );
        }
        response
    }

    async fn route_request(
        &self,
        req: Request<Body>,
        path: &str,
        method: &str,
    ) -> Response<Body> {
        if !self.authenticate(&req) {
            return json_error(StatusCode::UNAUTHORIZED, "invalid gateway api key");
        }

        let Some(route) = self.catalog.match_route(path, method).await else {
            return json_error(StatusCode::NOT_FOUND, "route not found");
        };

        match route.handler {
            HandlerKind::Sandbox => self.handle_sandbox(&route, req).await,
            HandlerKind::Proxy => {
                json_error(StatusCode::NOT_IMPLEMENTED, "proxy handler not implemented")
            }
            HandlerKind::Static => {
                json_error(StatusCode::NOT_IMPLEMENTED, "static handler not implemented")
            }
        }
    }

    fn authenticate(&self, req: &Request<Body>) -> bool {
        let provided = req
            .headers()
            .get("X-Api-Key")
            .and_then(|value| value.to_str().ok())
            .unwrap_or("");
        let expected = self.config.gateway_api_key();
        !expected.is_empty() && expected == provided
    }

    async fn handle_sandbox(&self, route: &Route, req: Request<Body>) -> Response<Body> {
        // Validated on write, so a sandbox route always carries a kind.
        let Some(kind) = route.sandbox_type else {
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, "route has no sandbox type");
        };

        let instance = match self.pool.get_healthy(kind).await {
            Ok(instance) => instance,
            Err(e) => return json_error(StatusCode::SERVICE_UNAVAILABLE, &e.to_string()),
        };

        let inbound_key = req
            .headers()
            .get("X-Api-Key")
            .and_then(|value| value.to_str().ok());
        let api_key = forwarded_api_key(inbound_key, self.config.gateway_api_key());

        let envelope = execution_envelope(route);
        let run_request = match Request::builder()
            .method("POST")
            .uri(format!("{}/run", instance.url))
            .header(header::CONTENT_TYPE, "application/json")
            .header("X-Api-Key", api_key)
            .body(Body::from(envelope.to_string()))
        {
            Ok(run_request) => run_request,
            Err(e) => {
                self.pool.release(&instance.id).await;
                return json_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
            }
        };

        let deadline = Duration::from_secs(route.timeout.unwrap_or(DEFAULT_RUN_TIMEOUT_SECS));
        let outcome = timeout(deadline, self.http_client.send_request(run_request)).await;
        self.pool.release(&instance.id).await;

        match outcome {
            // Headers, status, and body stream through verbatim.
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                tracing::warn!(instance_id = %instance.id, error = %e, "sandbox forward failed");
                json_error(
                    StatusCode::BAD_GATEWAY,
                    &format!("sandbox unavailable: {e}"),
                )
            }
            Err(_) => {
                tracing::warn!(
                    instance_id = %instance.id,
                    timeout_secs = deadline.as_secs(),
                    "sandbox forward timed out"
                );
                json_error(
                    StatusCode::BAD_GATEWAY,
                    &format!(
                        "sandbox unavailable: timed out after {}s",
                        deadline.as_secs()
                    ),
                )
            }
        }
    }
}

/// Build the gateway listener router: every path and method lands in the
/// handler.
pub fn gateway_router(handler: Arc<GatewayHandler>) -> axum::Router {
    axum::Router::new().fallback(move |req: Request<Body>| {
        let handler = handler.clone();
        async move { handler.handle(req).await }
    })
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;
    use crate::{
        core::{
            balancer::LoadBalancer,
            route::{InstanceStatus, SandboxInstance, SandboxKind},
        },
        ports::http_client::{HttpClientError, HttpClientResult},
    };

    struct EchoClient;

    #[async_trait]
    impl HttpClient for EchoClient {
        async fn send_request(&self, req: Request<Body>) -> HttpClientResult<Response<Body>> {
            assert!(req.uri().to_string().ends_with("/run"));
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header("X-Sandbox", "1")
                .body(Body::from("sandbox says hi"))
                .unwrap())
        }

        async fn health_check(&self, _url: &str, _timeout_secs: u64) -> HttpClientResult<bool> {
            Ok(true)
        }
    }

    struct FailingClient;

    #[async_trait]
    impl HttpClient for FailingClient {
        async fn send_request(&self, _req: Request<Body>) -> HttpClientResult<Response<Body>> {
            Err(HttpClientError::ConnectionError("refused".to_string()))
        }

        async fn health_check(&self, _url: &str, _timeout_secs: u64) -> HttpClientResult<bool> {
            Ok(false)
        }
    }

    fn test_config() -> Arc<GatewayConfig> {
        let mut config = GatewayConfig::default();
        config.app.gateway_key = "gw-secret".to_string();
        config.app.debug = false;
        Arc::new(config)
    }

    fn sandbox_route(id: &str, path: &str) -> Route {
        Route {
            id: id.to_string(),
            path: path.to_string(),
            method: "GET".to_string(),
            handler: HandlerKind::Sandbox,
            sandbox_type: Some(SandboxKind::Python),
            code: Some("print('hi')".to_string()),
            target: None,
            timeout: Some(5),
            metadata: Default::default(),
            created_at: 0,
            updated_at: 0,
            version: 0,
        }
    }

    async fn handler_with(client: Arc<dyn HttpClient>) -> (Arc<GatewayHandler>, Arc<SandboxPool>) {
        let catalog = RouteCatalog::new(None, None);
        catalog
            .create(sandbox_route("hello", "/api/hello"))
            .await
            .unwrap();
        let pool = SandboxPool::new(None, LoadBalancer::from_name("least-connections"));
        let handler = Arc::new(GatewayHandler::new(
            catalog,
            pool.clone(),
            client,
            test_config(),
        ));
        (handler, pool)
    }

    fn get(path: &str, api_key: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method("GET").uri(path);
        if let Some(key) = api_key {
            builder = builder.header("X-Api-Key", key);
        }
        builder.body(Body::empty()).unwrap()
    }

    fn healthy_python_instance() -> SandboxInstance {
        SandboxInstance {
            id: "py-1".to_string(),
            url: "http://py-1:8194".to_string(),
            kind: SandboxKind::Python,
            status: InstanceStatus::Healthy,
            load: 0,
            last_ping: 0,
        }
    }

    #[tokio::test]
    async fn missing_or_wrong_key_is_unauthorized() {
        let (handler, _) = handler_with(Arc::new(EchoClient)).await;
        let app = gateway_router(handler);

        let response = app.clone().oneshot(get("/api/hello", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app.oneshot(get("/api/hello", Some("wrong"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"], "invalid gateway api key");
    }

    #[tokio::test]
    async fn unmatched_path_is_404() {
        let (handler, _) = handler_with(Arc::new(EchoClient)).await;
        let app = gateway_router(handler);

        let response = app
            .oneshot(get("/does/not/exist", Some("gw-secret")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"], "route not found");
    }

    #[tokio::test]
    async fn no_healthy_instance_is_503() {
        let (handler, _) = handler_with(Arc::new(EchoClient)).await;
        let app = gateway_router(handler);

        let response = app
            .oneshot(get("/api/hello", Some("gw-secret")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn dispatch_forwards_sandbox_response_verbatim() {
        let (handler, pool) = handler_with(Arc::new(EchoClient)).await;
        pool.register(healthy_python_instance()).await.unwrap();
        let app = gateway_router(handler);

        let response = app
            .oneshot(get("/api/hello", Some("gw-secret")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("X-Sandbox").unwrap(), "1");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"sandbox says hi");

        // The in-flight counter was released after the response.
        assert_eq!(pool.all().await["py-1"].load, 0);
    }

    #[tokio::test]
    async fn transport_failure_is_502() {
        let (handler, pool) = handler_with(Arc::new(FailingClient)).await;
        pool.register(healthy_python_instance()).await.unwrap();
        let app = gateway_router(handler);

        let response = app
            .oneshot(get("/api/hello", Some("gw-secret")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn non_sandbox_handlers_are_unimplemented() {
        let catalog = RouteCatalog::new(None, None);
        let mut route = sandbox_route("proxied", "/api/proxied");
        route.handler = HandlerKind::Proxy;
        route.sandbox_type = None;
        route.target = Some("http://backend:3000".to_string());
        catalog.create(route).await.unwrap();

        let pool = SandboxPool::new(None, LoadBalancer::from_name("least-connections"));
        let handler = Arc::new(GatewayHandler::new(
            catalog,
            pool,
            Arc::new(EchoClient),
            test_config(),
        ));
        let app = gateway_router(handler);

        let response = app
            .oneshot(get("/api/proxied", Some("gw-secret")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
    }

    #[test]
    fn envelope_carries_route_code_and_timeout() {
        let route = sandbox_route("hello", "/api/hello");
        let envelope = execution_envelope(&route);
        assert_eq!(envelope["language"], "python3");
        assert_eq!(envelope["code"], "print('hi')");
        assert_eq!(envelope["preload"], "");
        assert_eq!(envelope["enable_network"], true);
        assert_eq!(envelope["timeout"], 5);
    }

    #[test]
    fn api_key_fallback_chain() {
        assert_eq!(forwarded_api_key(Some("caller"), "configured"), "caller");
        assert_eq!(forwarded_api_key(None, "configured"), "configured");
        assert_eq!(forwarded_api_key(Some(""), "configured"), "configured");
        assert_eq!(forwarded_api_key(None, ""), FALLBACK_SANDBOX_KEY);
    }
}
