//! Domain types for the route catalog: route definitions, sandbox
//! instances, and the events that propagate mutations between replicas.
//!
//! These types are serde-friendly because they are persisted verbatim in
//! the shared store and carried inside stream events. Field-wise equality
//! after a store round trip (including `version`) is part of the contract.
use std::{
    collections::HashMap,
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced by route validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RouteError {
    #[error("route id is required")]
    MissingId,

    #[error("route path is required")]
    MissingPath,

    #[error("route method is required")]
    MissingMethod,

    #[error("sandbox_type is required for sandbox routes")]
    MissingSandboxType,
}

/// How a matched route is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandlerKind {
    Sandbox,
    Proxy,
    Static,
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerKind::Sandbox => write!(f, "sandbox"),
            HandlerKind::Proxy => write!(f, "proxy"),
            HandlerKind::Static => write!(f, "static"),
        }
    }
}

/// Runtime a sandbox worker executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxKind {
    Python,
    Nodejs,
    Go,
}

impl fmt::Display for SandboxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SandboxKind::Python => write!(f, "python"),
            SandboxKind::Nodejs => write!(f, "nodejs"),
            SandboxKind::Go => write!(f, "go"),
        }
    }
}

/// A route definition as stored in the catalog.
///
/// `version` is a mutation-time nanosecond stamp; for a given `id` every
/// stored update carries a strictly greater version than its predecessor,
/// which is what makes last-writer-wins reconciliation deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub id: String,
    pub path: String,
    /// HTTP method this route answers, or `"ANY"`.
    pub method: String,
    pub handler: HandlerKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_type: Option<SandboxKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Execution timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
    #[serde(default)]
    pub version: i64,
}

impl Route {
    /// Check the invariants an admin write must satisfy.
    pub fn validate(&self) -> Result<(), RouteError> {
        if self.id.is_empty() {
            return Err(RouteError::MissingId);
        }
        if self.path.is_empty() {
            return Err(RouteError::MissingPath);
        }
        if self.method.is_empty() {
            return Err(RouteError::MissingMethod);
        }
        if self.handler == HandlerKind::Sandbox && self.sandbox_type.is_none() {
            return Err(RouteError::MissingSandboxType);
        }
        Ok(())
    }
}

/// Liveness classification of a sandbox worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Healthy,
    Unhealthy,
    Starting,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceStatus::Healthy => write!(f, "healthy"),
            InstanceStatus::Unhealthy => write!(f, "unhealthy"),
            InstanceStatus::Starting => write!(f, "starting"),
        }
    }
}

/// A registered sandbox worker.
///
/// `url` always carries a scheme once the instance has passed through
/// registration; `load` counts in-flight dispatches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxInstance {
    pub id: String,
    pub url: String,
    #[serde(rename = "type")]
    pub kind: SandboxKind,
    pub status: InstanceStatus,
    #[serde(default)]
    pub load: i64,
    #[serde(default)]
    pub last_ping: i64,
}

/// Kind of a route-mutation event on the shared stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Create,
    Update,
    Delete,
    HealthUpdate,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Create => write!(f, "CREATE"),
            EventKind::Update => write!(f, "UPDATE"),
            EventKind::Delete => write!(f, "DELETE"),
            EventKind::HealthUpdate => write!(f, "HEALTH_UPDATE"),
        }
    }
}

/// A route mutation broadcast to peer replicas.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteEvent {
    pub event_id: String,
    pub event_type: EventKind,
    pub route_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_data: Option<Route>,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub source: String,
}

/// Current unix time in whole seconds.
pub fn now_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Current unix time in nanoseconds, used as the mutation version stamp.
pub fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_route() -> Route {
        Route {
            id: "hello".to_string(),
            path: "/api/hello".to_string(),
            method: "GET".to_string(),
            handler: HandlerKind::Sandbox,
            sandbox_type: Some(SandboxKind::Python),
            code: Some("print('hi')".to_string()),
            target: None,
            timeout: Some(5),
            metadata: HashMap::new(),
            created_at: 1_700_000_000,
            updated_at: 1_700_000_000,
            version: 1_700_000_000_000_000_000,
        }
    }

    #[test]
    fn route_round_trips_through_json() {
        let route = sample_route();
        let json = serde_json::to_string(&route).unwrap();
        let back: Route = serde_json::from_str(&json).unwrap();
        assert_eq!(route, back);
        assert_eq!(back.version, route.version);
    }

    #[test]
    fn route_serializes_enums_as_wire_strings() {
        let route = sample_route();
        let value: serde_json::Value = serde_json::to_value(&route).unwrap();
        assert_eq!(value["handler"], "sandbox");
        assert_eq!(value["sandbox_type"], "python");
    }

    #[test]
    fn validate_rejects_missing_fields() {
        let mut route = sample_route();
        route.id.clear();
        assert_eq!(route.validate(), Err(RouteError::MissingId));

        let mut route = sample_route();
        route.path.clear();
        assert_eq!(route.validate(), Err(RouteError::MissingPath));

        let mut route = sample_route();
        route.method.clear();
        assert_eq!(route.validate(), Err(RouteError::MissingMethod));

        let mut route = sample_route();
        route.sandbox_type = None;
        assert_eq!(route.validate(), Err(RouteError::MissingSandboxType));
    }

    #[test]
    fn non_sandbox_routes_do_not_need_a_sandbox_type() {
        let mut route = sample_route();
        route.handler = HandlerKind::Proxy;
        route.sandbox_type = None;
        route.target = Some("http://backend:3000".to_string());
        assert!(route.validate().is_ok());
    }

    #[test]
    fn event_kind_uses_screaming_case_on_the_wire() {
        let json = serde_json::to_string(&EventKind::HealthUpdate).unwrap();
        assert_eq!(json, "\"HEALTH_UPDATE\"");
        let back: EventKind = serde_json::from_str("\"DELETE\"").unwrap();
        assert_eq!(back, EventKind::Delete);
    }

    #[test]
    fn event_with_route_data_round_trips() {
        let event = RouteEvent {
            event_id: "create-1".to_string(),
            event_type: EventKind::Create,
            route_id: "hello".to_string(),
            route_data: Some(sample_route()),
            timestamp: 1_700_000_000,
            source: "route-manager".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: RouteEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.route_data.unwrap(), sample_route());
    }
}
