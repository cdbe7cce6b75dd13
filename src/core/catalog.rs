//! The route catalog: authoritative in-memory route map per replica.
//!
//! Reads serve the matcher on the data path; writes arrive from the
//! admin API (local mutations) and from the event consumer (remote
//! mutations). One exclusive lock guards both the route map and the
//! per-id version map so a reader never observes them out of step.
//!
//! Convergence across replicas rests on three mechanisms layered from
//! cheap to exhaustive: stream events (fast path), the update-marker set
//! consumed by incremental reconciliation (O(delta) catch-up), and a
//! full reload from the store hash whenever the global version advanced
//! but the markers are gone (repairs a replica that missed a
//! marker-clear window).
use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock, broadcast, mpsc};

use crate::{
    core::{
        events::{EventHandler, EventLog},
        matcher,
        route::{EventKind, Route, RouteError, RouteEvent, now_nanos, now_seconds},
    },
    ports::store::{Store, StoreResult},
};

/// Hash of `id -> serialized Route`.
pub const ROUTES_KEY: &str = "gateway:routes";
/// Set of update markers: `<id>` or `DELETE:<id>`.
pub const UPDATED_KEY: &str = "gateway:routes:updated";
/// String holding the highest mutation stamp in nanoseconds.
pub const CONFIG_VERSION_KEY: &str = "gateway:config:version";

const TOMBSTONE_PREFIX: &str = "DELETE:";

/// Cadence of the background reconciliation ticker.
pub const SYNC_INTERVAL: Duration = Duration::from_secs(60);

/// Errors from admin-originated catalog mutations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CatalogError {
    #[error(transparent)]
    Invalid(#[from] RouteError),

    #[error("route {0} not found")]
    NotFound(String),

    #[error("route id cannot be changed")]
    IdMismatch,
}

#[derive(Default)]
struct CatalogState {
    routes: HashMap<String, Route>,
    /// Redundant with `Route.version`, kept separately so reconciliation
    /// can compare against partially written entries.
    versions: HashMap<String, i64>,
    /// Highest global config version this replica has observed.
    last_config_update: i64,
}

/// Per-replica route catalog. `None` store means degraded
/// single-replica mode: in-memory only, no events, no reconciliation.
pub struct RouteCatalog {
    state: RwLock<CatalogState>,
    store: Option<Arc<dyn Store>>,
    events: Option<Arc<EventLog>>,
    sync_tx: mpsc::Sender<()>,
    sync_rx: Mutex<Option<mpsc::Receiver<()>>>,
    instance_id: String,
}

impl RouteCatalog {
    pub fn new(store: Option<Arc<dyn Store>>, events: Option<Arc<EventLog>>) -> Arc<Self> {
        // Size-1 channel with non-blocking send: extra signals coalesce,
        // which is sound because reconciliation is idempotent.
        let (sync_tx, sync_rx) = mpsc::channel(1);
        Arc::new(Self {
            state: RwLock::new(CatalogState::default()),
            store,
            events,
            sync_tx,
            sync_rx: Mutex::new(Some(sync_rx)),
            instance_id: format!("instance-{}", now_nanos()),
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn store_enabled(&self) -> bool {
        self.store.is_some()
    }

    /// Create a route: validate, stamp, persist, mark, bump the global
    /// version, broadcast, apply locally, then signal reconciliation.
    pub async fn create(&self, mut route: Route) -> Result<Route, CatalogError> {
        let mut state = self.state.write().await;

        route.validate()?;

        let now = now_seconds();
        if route.created_at == 0 {
            route.created_at = now;
        }
        route.updated_at = now;
        route.version = now_nanos();

        self.persist(&route).await;
        self.broadcast(EventKind::Create, route.id.clone(), Some(route.clone()))
            .await;

        state
            .versions
            .insert(route.id.clone(), route.version);
        state.routes.insert(route.id.clone(), route.clone());
        drop(state);

        self.signal_sync();
        Ok(route)
    }

    /// Update an existing route. Refuses unknown ids and bodies whose id
    /// differs from the addressed id.
    pub async fn update(&self, route_id: &str, mut route: Route) -> Result<Route, CatalogError> {
        let mut state = self.state.write().await;

        let existing = state
            .routes
            .get(route_id)
            .ok_or_else(|| CatalogError::NotFound(route_id.to_string()))?;
        if route.created_at == 0 {
            route.created_at = existing.created_at;
        }

        route.validate()?;
        if route_id != route.id {
            return Err(CatalogError::IdMismatch);
        }

        route.updated_at = now_seconds();
        route.version = now_nanos();

        self.persist(&route).await;
        self.broadcast(EventKind::Update, route.id.clone(), Some(route.clone()))
            .await;

        state
            .versions
            .insert(route.id.clone(), route.version);
        state.routes.insert(route.id.clone(), route.clone());
        drop(state);

        self.signal_sync();
        Ok(route)
    }

    /// Delete a route. A missing id is a no-op locally but the tombstone
    /// marker and the event are still emitted so peers converge.
    pub async fn delete(&self, route_id: &str) -> Result<(), CatalogError> {
        let mut state = self.state.write().await;

        if let Some(store) = &self.store {
            if let Err(e) = store.hdel(ROUTES_KEY, route_id).await {
                tracing::warn!(route_id, error = %e, "failed to delete route from store");
            } else {
                self.mark_updated(store, &format!("{TOMBSTONE_PREFIX}{route_id}"))
                    .await;
            }
        }

        self.broadcast(EventKind::Delete, route_id.to_string(), None)
            .await;

        state.routes.remove(route_id);
        state.versions.remove(route_id);
        drop(state);

        self.signal_sync();
        Ok(())
    }

    /// Write the route to the store hash and, on success, record the
    /// update marker and bump the global version. A store failure is
    /// logged and the in-memory apply proceeds; the replica stays
    /// functional though divergent until the next reconciliation.
    async fn persist(&self, route: &Route) {
        let Some(store) = &self.store else { return };

        let raw = match serde_json::to_string(route) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::error!(route_id = %route.id, error = %e, "failed to serialize route");
                return;
            }
        };

        match store.hset(ROUTES_KEY, &route.id, &raw).await {
            Ok(()) => {
                self.mark_updated(store, &route.id).await;
                tracing::debug!(route_id = %route.id, version = route.version, "route persisted");
            }
            Err(e) => {
                tracing::warn!(route_id = %route.id, error = %e, "failed to persist route");
            }
        }
    }

    async fn mark_updated(&self, store: &Arc<dyn Store>, marker: &str) {
        if let Err(e) = store.sadd(UPDATED_KEY, marker).await {
            tracing::warn!(marker, error = %e, "failed to record update marker");
        }
        let stamp = now_nanos().to_string();
        if let Err(e) = store.set(CONFIG_VERSION_KEY, &stamp).await {
            tracing::warn!(error = %e, "failed to bump config version");
        }
    }

    async fn broadcast(&self, kind: EventKind, route_id: String, route_data: Option<Route>) {
        let Some(events) = &self.events else { return };

        let event = RouteEvent {
            event_id: format!("{}-{}", kind.to_string().to_lowercase(), now_nanos()),
            event_type: kind,
            route_id,
            route_data,
            timestamp: 0,
            source: "route-manager".to_string(),
        };
        if let Err(e) = events.publish(event).await {
            tracing::warn!(event_type = %kind, error = %e, "failed to publish route event");
        }
    }

    /// Non-blocking nudge of the reconciliation loop. At most one signal
    /// is queued; the rest coalesce.
    pub fn signal_sync(&self) {
        let _ = self.sync_tx.try_send(());
    }

    /// Incremental reconciliation: pull the delta recorded in the
    /// update-marker set, or fall back to a full reload when the global
    /// version advanced without markers.
    pub async fn load_incremental(&self) -> StoreResult<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };

        let current: i64 = store
            .get(CONFIG_VERSION_KEY)
            .await?
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0);

        {
            let state = self.state.read().await;
            if current <= state.last_config_update {
                return Ok(());
            }
        }

        let members = store.smembers(UPDATED_KEY).await?;

        let mut state = self.state.write().await;
        // Another task may have reconciled while we waited for the lock.
        if current <= state.last_config_update {
            return Ok(());
        }

        let mut updated = 0usize;
        let mut deleted = 0usize;

        if !members.is_empty() {
            for member in &members {
                if member.is_empty() {
                    continue;
                }
                if let Some(route_id) = member.strip_prefix(TOMBSTONE_PREFIX) {
                    if state.routes.remove(route_id).is_some() {
                        state.versions.remove(route_id);
                        deleted += 1;
                        tracing::debug!(route_id, "incremental delete");
                    }
                    continue;
                }

                let raw = match store.hget(ROUTES_KEY, member).await {
                    Ok(Some(raw)) => raw,
                    Ok(None) => continue,
                    Err(e) => {
                        tracing::warn!(route_id = %member, error = %e, "failed to read updated route");
                        continue;
                    }
                };
                match serde_json::from_str::<Route>(&raw) {
                    Ok(route) => {
                        // Last-writer-wins: replayed or reordered markers
                        // must never roll a route back.
                        let known = state.versions.get(member).copied().unwrap_or(0);
                        if route.version > known {
                            state.versions.insert(member.clone(), route.version);
                            state.routes.insert(member.clone(), route);
                            updated += 1;
                            tracing::debug!(route_id = %member, "incremental update");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(route_id = %member, error = %e, "failed to deserialize stored route");
                    }
                }
            }

            if let Err(e) = store.del(UPDATED_KEY).await {
                tracing::warn!(error = %e, "failed to clear update markers");
            }
        } else {
            // Version advanced but the markers are gone: another replica
            // cleared them first. Reload everything.
            tracing::warn!("no update markers, falling back to full load");
            let all = store.hgetall(ROUTES_KEY).await?;
            state.routes.clear();
            state.versions.clear();
            for (route_id, raw) in all {
                match serde_json::from_str::<Route>(&raw) {
                    Ok(route) => {
                        state.versions.insert(route_id.clone(), route.version);
                        state.routes.insert(route_id, route);
                    }
                    Err(e) => {
                        tracing::warn!(route_id = %route_id, error = %e, "skipping undecodable route");
                    }
                }
            }
            updated = state.routes.len();
        }

        state.last_config_update = current;
        tracing::info!(
            updated,
            deleted,
            total = state.routes.len(),
            "incremental load complete"
        );
        Ok(())
    }

    /// Background reconciliation driver: runs on local signals and on the
    /// periodic ticker until shutdown.
    pub async fn run_sync_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let Some(mut sync_rx) = self.sync_rx.lock().await.take() else {
            tracing::warn!("sync loop already running");
            return;
        };

        let mut ticker = tokio::time::interval(SYNC_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval_secs = SYNC_INTERVAL.as_secs(), "configuration watcher started");

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = sync_rx.recv() => {
                    if let Err(e) = self.load_incremental().await {
                        tracing::warn!(error = %e, "signalled reconciliation failed");
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.load_incremental().await {
                        tracing::warn!(error = %e, "periodic reconciliation failed");
                    }
                }
            }
        }
        tracing::info!("configuration watcher stopped");
    }

    /// Resolve `(path, method)` against the cached catalog.
    pub async fn match_route(&self, path: &str, method: &str) -> Option<Route> {
        let state = self.state.read().await;
        matcher::best_match(state.routes.values(), path, method).cloned()
    }

    pub async fn get(&self, route_id: &str) -> Option<Route> {
        self.state.read().await.routes.get(route_id).cloned()
    }

    pub async fn get_all(&self) -> Vec<Route> {
        self.state.read().await.routes.values().cloned().collect()
    }

    pub async fn version_of(&self, route_id: &str) -> Option<i64> {
        self.state.read().await.versions.get(route_id).copied()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.routes.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.routes.is_empty()
    }

    pub async fn last_config_update(&self) -> i64 {
        self.state.read().await.last_config_update
    }
}

#[async_trait]
impl EventHandler for RouteCatalog {
    /// Apply a remote mutation. Handlers operate on already-committed
    /// facts, so CREATE/UPDATE overwrite unconditionally.
    async fn handle_event(&self, event: &RouteEvent) -> eyre::Result<()> {
        match event.event_type {
            EventKind::Create | EventKind::Update => {
                let route = event
                    .route_data
                    .clone()
                    .ok_or_else(|| {
                        eyre::eyre!("missing route data for {} event", event.event_type)
                    })?;
                let target_id = if route.id.is_empty() {
                    event.route_id.clone()
                } else {
                    route.id.clone()
                };

                let mut state = self.state.write().await;
                state.versions.insert(target_id.clone(), route.version);
                state.routes.insert(target_id.clone(), route);
                tracing::info!(
                    route_id = %target_id,
                    event_type = %event.event_type,
                    "applied remote route event"
                );
                Ok(())
            }
            EventKind::Delete => {
                let mut state = self.state.write().await;
                if state.routes.remove(&event.route_id).is_some() {
                    state.versions.remove(&event.route_id);
                    tracing::info!(route_id = %event.route_id, "applied remote delete");
                } else if let Some(alternative) = event
                    .route_data
                    .as_ref()
                    .map(|route| route.id.clone())
                    .filter(|id| !id.is_empty())
                {
                    // Some publishers only populate route_data.
                    if state.routes.remove(&alternative).is_some() {
                        state.versions.remove(&alternative);
                        tracing::info!(route_id = %alternative, "applied remote delete via route data");
                    }
                }
                Ok(())
            }
            EventKind::HealthUpdate => {
                tracing::debug!(route_id = %event.route_id, "ignoring health update event");
                Ok(())
            }
        }
    }
}
