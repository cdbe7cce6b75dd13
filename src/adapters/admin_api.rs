//! Admin REST surface: route CRUD, sandbox registration, introspection,
//! and manual sync, served under `/admin` on the management port.
//!
//! Mutations go through the catalog's mutation protocol so the store,
//! the event stream, and the local cache stay in the committed order.
use std::{collections::HashMap, sync::Arc};

use axum::{
    Json, Router,
    extract::{Path, Query, Request, State},
    http::{Method, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
};
use serde::Deserialize;
use tower_http::catch_panic::CatchPanicLayer;

use crate::{
    config::models::GatewayConfig,
    core::{
        catalog::{CONFIG_VERSION_KEY, CatalogError, ROUTES_KEY, RouteCatalog, UPDATED_KEY},
        events::{CONSUMER_GROUP, EventLog},
        pool::SandboxPool,
        route::{EventKind, Route, RouteEvent, SandboxInstance, now_nanos},
    },
    ports::store::Store,
};

/// Deadline for the store ping behind `/admin/health`.
const HEALTH_PING_DEADLINE_SECS: u64 = 5;

#[derive(Clone)]
pub struct AdminState {
    pub catalog: Arc<RouteCatalog>,
    pub pool: Arc<SandboxPool>,
    pub events: Option<Arc<EventLog>>,
    pub store: Option<Arc<dyn Store>>,
    pub config: Arc<GatewayConfig>,
}

type ApiResponse = (StatusCode, Json<serde_json::Value>);

fn ok(body: serde_json::Value) -> ApiResponse {
    (StatusCode::OK, Json(body))
}

fn error_response(status: StatusCode, message: impl std::fmt::Display) -> ApiResponse {
    (status, Json(serde_json::json!({ "error": message.to_string() })))
}

fn store_unavailable() -> ApiResponse {
    error_response(StatusCode::SERVICE_UNAVAILABLE, "store not available")
}

fn catalog_error(err: CatalogError) -> ApiResponse {
    match err {
        CatalogError::NotFound(_) => error_response(StatusCode::NOT_FOUND, err),
        _ => error_response(StatusCode::BAD_REQUEST, err),
    }
}

/// Deserialize a JSON body into a concrete type, mapping failures to a
/// 400 with the serde message instead of axum's default rejection.
fn parse_body<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Result<T, ApiResponse> {
    serde_json::from_value(value).map_err(|e| error_response(StatusCode::BAD_REQUEST, e))
}

/// Build the admin router with auth, CORS, and panic recovery applied.
pub fn admin_router(state: AdminState) -> Router {
    let cors_enabled = state.config.gateway.cors_enabled;

    let routes = Router::new()
        .route("/routes", get(list_routes).post(add_route))
        .route("/routes/{id}", put(update_route).delete(delete_route))
        .route("/routes/{id}/details", get(route_details))
        .route("/sandboxes", get(list_sandboxes))
        .route("/sandboxes/register", post(register_sandbox))
        .route("/sandboxes/{id}", delete(delete_sandbox))
        .route("/health", get(health))
        .route("/config/version", get(config_version))
        .route("/events/stream-info", get(stream_info))
        .route("/events/pending", get(pending_messages))
        .route("/events/test", post(publish_test_event))
        .route("/events/consumers", get(event_consumers))
        .route("/events/stats", get(event_stats))
        .route("/events/cleanup", post(cleanup_events))
        .route("/sync/trigger", post(trigger_sync))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth));

    let mut router = Router::new().nest("/admin", routes).with_state(state);
    if cors_enabled {
        router = router.layer(middleware::from_fn(cors));
    }
    router.layer(CatchPanicLayer::custom(|_: Box<dyn std::any::Any + Send>| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": "internal server error" })),
        )
            .into_response()
    }))
}

async fn admin_auth(State(state): State<AdminState>, req: Request, next: Next) -> Response {
    let provided = req
        .headers()
        .get("X-Api-Key")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    let expected = state.config.admin_api_key();

    if expected.is_empty() || expected != provided {
        return error_response(StatusCode::UNAUTHORIZED, "invalid admin api key").into_response();
    }
    next.run(req).await
}

fn apply_cors_headers(response: &mut Response) {
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        header::HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        header::HeaderValue::from_static("GET, POST, PUT, DELETE, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        header::HeaderValue::from_static("Content-Type, Authorization, X-Requested-With"),
    );
}

async fn cors(req: Request, next: Next) -> Response {
    if req.method() == Method::OPTIONS {
        let mut response = StatusCode::NO_CONTENT.into_response();
        apply_cors_headers(&mut response);
        return response;
    }
    let mut response = next.run(req).await;
    apply_cors_headers(&mut response);
    response
}

async fn list_routes(State(state): State<AdminState>) -> ApiResponse {
    let routes = state.catalog.get_all().await;
    ok(serde_json::json!({ "routes": routes }))
}

async fn add_route(
    State(state): State<AdminState>,
    Json(body): Json<serde_json::Value>,
) -> ApiResponse {
    let route: Route = match parse_body(body) {
        Ok(route) => route,
        Err(rejection) => return rejection,
    };

    match state.catalog.create(route).await {
        Ok(created) => ok(serde_json::json!({ "message": "route added", "id": created.id })),
        Err(e) => catalog_error(e),
    }
}

async fn update_route(
    State(state): State<AdminState>,
    Path(route_id): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> ApiResponse {
    let route: Route = match parse_body(body) {
        Ok(route) => route,
        Err(rejection) => return rejection,
    };

    match state.catalog.update(&route_id, route).await {
        Ok(updated) => ok(serde_json::json!({ "message": "route updated", "id": updated.id })),
        Err(e) => catalog_error(e),
    }
}

async fn delete_route(
    State(state): State<AdminState>,
    Path(route_id): Path<String>,
) -> ApiResponse {
    match state.catalog.delete(&route_id).await {
        Ok(()) => ok(serde_json::json!({ "message": "route deleted" })),
        Err(e) => catalog_error(e),
    }
}

async fn route_details(
    State(state): State<AdminState>,
    Path(route_id): Path<String>,
) -> ApiResponse {
    let Some(route) = state.catalog.get(&route_id).await else {
        return error_response(StatusCode::NOT_FOUND, "route not found");
    };

    // The store copy can lag or lead the cache; expose both.
    let mut store_copy: Option<Route> = None;
    if let Some(store) = &state.store {
        if let Ok(Some(raw)) = store.hget(ROUTES_KEY, &route_id).await {
            store_copy = serde_json::from_str(&raw).ok();
        }
    }

    ok(serde_json::json!({
        "route": route,
        "store_data": store_copy,
        "in_memory": true,
        "version": state.catalog.version_of(&route_id).await,
    }))
}

async fn list_sandboxes(State(state): State<AdminState>) -> ApiResponse {
    let sandboxes = state.pool.all().await;
    ok(serde_json::json!({ "sandboxes": sandboxes }))
}

async fn register_sandbox(
    State(state): State<AdminState>,
    Json(body): Json<serde_json::Value>,
) -> ApiResponse {
    let instance: SandboxInstance = match parse_body(body) {
        Ok(instance) => instance,
        Err(rejection) => return rejection,
    };

    match state.pool.register(instance).await {
        Ok(()) => ok(serde_json::json!({ "message": "sandbox registered" })),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn delete_sandbox(
    State(state): State<AdminState>,
    Path(instance_id): Path<String>,
) -> ApiResponse {
    match state.pool.remove(&instance_id).await {
        Ok(()) => ok(serde_json::json!({ "message": "sandbox deleted" })),
        Err(e) => error_response(StatusCode::BAD_REQUEST, e),
    }
}

async fn health(State(state): State<AdminState>) -> ApiResponse {
    let Some(store) = &state.store else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "unhealthy",
                "error": "store not available",
            })),
        );
    };

    if let Err(e) = store.ping(HEALTH_PING_DEADLINE_SECS).await {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "unhealthy",
                "error": format!("store connection failed: {e}"),
            })),
        );
    }

    ok(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().timestamp(),
        "routes": state.catalog.len().await,
        "sandboxes": state.pool.len().await,
    }))
}

async fn config_version(State(state): State<AdminState>) -> ApiResponse {
    let Some(store) = &state.store else {
        return store_unavailable();
    };

    let global_version = match store.get(CONFIG_VERSION_KEY).await {
        Ok(version) => version.unwrap_or_default(),
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    };
    let updating_routes = store.smembers(UPDATED_KEY).await.unwrap_or_default();
    let total_routes = store.hlen(ROUTES_KEY).await.unwrap_or(0);

    ok(serde_json::json!({
        "global_version": global_version,
        "last_updated": state.catalog.last_config_update().await,
        "updating_routes": updating_routes,
        "total_routes": total_routes,
        "memory_routes": state.catalog.len().await,
        "instance_id": state.catalog.instance_id(),
        "store_enabled": true,
    }))
}

async fn stream_info(State(state): State<AdminState>) -> ApiResponse {
    let Some(events) = &state.events else {
        return store_unavailable();
    };

    match events.stream_info().await {
        Ok(info) => ok(serde_json::json!({ "stream_info": info })),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn pending_messages(
    State(state): State<AdminState>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResponse {
    let Some(events) = &state.events else {
        return store_unavailable();
    };

    let group = params
        .get("consumer_group")
        .map(String::as_str)
        .filter(|group| !group.is_empty())
        .unwrap_or(CONSUMER_GROUP);

    match events.pending(group).await {
        Ok(pending) => ok(serde_json::json!({ "pending_messages": pending })),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

#[derive(Debug, Deserialize)]
struct TestEventBody {
    event_type: EventKind,
    route_id: String,
    #[serde(default)]
    route_data: Option<Route>,
}

async fn publish_test_event(
    State(state): State<AdminState>,
    Json(body): Json<serde_json::Value>,
) -> ApiResponse {
    let Some(events) = &state.events else {
        return store_unavailable();
    };

    let body: TestEventBody = match parse_body(body) {
        Ok(body) => body,
        Err(rejection) => return rejection,
    };

    let event = RouteEvent {
        event_id: format!("test-{}", now_nanos()),
        event_type: body.event_type,
        route_id: body.route_id,
        route_data: body.route_data,
        timestamp: 0,
        source: "test".to_string(),
    };

    match events.publish(event).await {
        Ok(_) => ok(serde_json::json!({ "message": "test event published" })),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn event_consumers(State(state): State<AdminState>) -> ApiResponse {
    let Some(events) = &state.events else {
        return store_unavailable();
    };

    ok(serde_json::json!({ "consumers": events.consumers() }))
}

async fn event_stats(State(state): State<AdminState>) -> ApiResponse {
    let Some(events) = &state.events else {
        return store_unavailable();
    };

    // Introspection degrades to zeros rather than failing the endpoint.
    let total_events = events.stream_len().await.unwrap_or(0);
    let groups = events.group_info().await.unwrap_or_default();

    let total_pending: u64 = groups.iter().map(|group| group.pending).sum();
    let consumer_groups: serde_json::Map<String, serde_json::Value> = groups
        .into_iter()
        .map(|group| {
            (
                group.name.clone(),
                serde_json::json!({
                    "consumers": group.consumers,
                    "pending": group.pending,
                    "last_delivered_id": group.last_delivered_id,
                }),
            )
        })
        .collect();

    ok(serde_json::json!({
        "total_events": total_events,
        "total_pending": total_pending,
        "consumer_groups": consumer_groups,
        "instance_id": state.catalog.instance_id(),
        "last_config_update": state.catalog.last_config_update().await,
        "memory_route_count": state.catalog.len().await,
    }))
}

#[derive(Debug, Deserialize)]
struct CleanupBody {
    #[serde(default)]
    max_age_hours: i64,
}

async fn cleanup_events(
    State(state): State<AdminState>,
    Json(body): Json<serde_json::Value>,
) -> ApiResponse {
    let Some(events) = &state.events else {
        return store_unavailable();
    };

    let body: CleanupBody = match parse_body(body) {
        Ok(body) => body,
        Err(rejection) => return rejection,
    };
    let effective_hours = if body.max_age_hours <= 0 {
        24
    } else {
        body.max_age_hours
    };

    match events.cleanup(body.max_age_hours).await {
        Ok((deleted, cutoff)) => ok(serde_json::json!({
            "message": "events cleanup completed",
            "deleted_count": deleted,
            "max_age_hours": effective_hours,
            "cutoff_time": cutoff,
        })),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn trigger_sync(State(state): State<AdminState>) -> ApiResponse {
    if !state.catalog.store_enabled() {
        return store_unavailable();
    }

    let start = std::time::Instant::now();
    let sync_time = chrono::Utc::now().timestamp();
    tracing::info!(instance_id = state.catalog.instance_id(), "manual sync triggered");

    if let Err(e) = state.catalog.load_incremental().await {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, e);
    }

    ok(serde_json::json!({
        "message": "configuration sync triggered",
        "instance_id": state.catalog.instance_id(),
        "duration_ms": start.elapsed().as_millis() as u64,
        "sync_time": sync_time,
    }))
}
