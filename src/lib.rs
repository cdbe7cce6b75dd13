//! Sandgate - a horizontally scalable sandbox-routing HTTP gateway.
//!
//! Sandgate routes incoming requests to dynamically configured backends,
//! the primary backend class being a pool of code-execution sandboxes.
//! Route definitions are mutated at runtime through a management API and
//! converge across gateway replicas through a shared store: a versioned
//! route catalog, an append-only event stream with consumer groups, and
//! an incremental reconciliation loop.
//!
//! # Features
//! - Two listeners on separate ports: the gateway data plane and the
//!   `/admin` management surface
//! - Priority-ordered path matching (exact > parameterized > prefix >
//!   wildcard)
//! - Sandbox pool with periodic liveness probes and pluggable load
//!   balancing (least-connections, round-robin, random)
//! - Store-backed route catalog with last-writer-wins reconciliation and
//!   a full-load fallback
//! - Degraded single-replica mode when the store is unreachable at boot
//! - Structured tracing, graceful shutdown, and shared-secret auth on
//!   both listeners
//!
//! # Architecture
//! The crate separates **ports** (traits) from **adapters**
//! (implementations) while keeping business logic inside `core`. The
//! shared store is only ever reached through the [`ports::store::Store`]
//! trait; outbound HTTP goes through [`ports::http_client::HttpClient`].
//!
//! # Error Handling
//! Application-level fallible APIs return `eyre::Result<T>`; subsystems
//! expose domain error types (`CatalogError`, `PoolError`, `StoreError`).
//!
//! # License
//! Dual-licensed under either MIT or Apache-2.0 at your option.
pub mod config;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

// These modules are implementation details and should not be directly used by users
pub mod adapters;
pub mod core;

// Re-export the specific types needed by the binary crate
pub use crate::{
    adapters::{AdminState, GatewayHandler, HttpClientAdapter, MemoryStore, RedisStore},
    core::{EventLog, LoadBalancer, RouteCatalog, SandboxPool},
    ports::http_client::HttpClient,
    utils::Shutdown,
};
