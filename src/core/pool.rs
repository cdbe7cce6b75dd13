//! Sandbox worker pool: registration, liveness tracking, and
//! load-balanced selection.
//!
//! The authoritative instance set lives in the shared store; every
//! replica holds an observational copy and republishes probe results.
//! Replicas overwrite each other's status freely; the property that
//! matters is that at least one replica publishes fresh status every
//! probe interval.
use std::{collections::HashMap, sync::Arc, time::Duration};

use thiserror::Error;
use tokio::sync::{RwLock, broadcast};

use crate::{
    core::{
        balancer::LoadBalancer,
        route::{InstanceStatus, SandboxInstance, SandboxKind, now_seconds},
    },
    ports::{http_client::HttpClient, store::{Store, StoreResult}},
};

/// Hash of `id -> serialized SandboxInstance`.
pub const INSTANCES_KEY: &str = "sandbox:instances";

/// Probe timeout per instance.
const PROBE_TIMEOUT_SECS: u64 = 5;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum PoolError {
    #[error("no healthy {0} sandbox available")]
    NoHealthyInstance(SandboxKind),
}

pub struct SandboxPool {
    store: Option<Arc<dyn Store>>,
    instances: RwLock<HashMap<String, SandboxInstance>>,
    balancer: LoadBalancer,
}

impl SandboxPool {
    pub fn new(store: Option<Arc<dyn Store>>, balancer: LoadBalancer) -> Arc<Self> {
        Arc::new(Self {
            store,
            instances: RwLock::new(HashMap::new()),
            balancer,
        })
    }

    pub fn strategy_name(&self) -> &str {
        self.balancer.name()
    }

    /// Populate the in-memory set from the shared store at boot.
    pub async fn load_from_store(&self) -> StoreResult<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };

        let raw_instances = store.hgetall(INSTANCES_KEY).await?;
        let mut instances = self.instances.write().await;
        for (id, raw) in raw_instances {
            match serde_json::from_str::<SandboxInstance>(&raw) {
                Ok(instance) => {
                    instances.insert(instance.id.clone(), instance);
                }
                Err(e) => {
                    tracing::warn!(instance_id = %id, error = %e, "skipping undecodable instance");
                }
            }
        }
        tracing::info!(count = instances.len(), "loaded sandbox instances from store");
        Ok(())
    }

    /// Register or overwrite an instance. URLs without a scheme are
    /// rewritten to `http://` so every pooled URL is probe-able.
    pub async fn register(&self, mut instance: SandboxInstance) -> StoreResult<()> {
        if !instance.url.is_empty()
            && !instance.url.starts_with("http://")
            && !instance.url.starts_with("https://")
        {
            instance.url = format!("http://{}", instance.url);
            tracing::debug!(instance_id = %instance.id, url = %instance.url, "normalized instance url");
        }

        let mut instances = self.instances.write().await;
        instances.insert(instance.id.clone(), instance.clone());
        drop(instances);

        self.persist(&instance).await;
        Ok(())
    }

    /// Remove an instance locally and from the store.
    pub async fn remove(&self, instance_id: &str) -> StoreResult<()> {
        self.instances.write().await.remove(instance_id);
        if let Some(store) = &self.store {
            store.hdel(INSTANCES_KEY, instance_id).await?;
        }
        Ok(())
    }

    /// Pick a healthy instance of the requested kind and charge one
    /// in-flight dispatch to it. Callers pair this with [`release`].
    ///
    /// [`release`]: SandboxPool::release
    pub async fn get_healthy(&self, kind: SandboxKind) -> Result<SandboxInstance, PoolError> {
        let mut instances = self.instances.write().await;

        let candidates: Vec<SandboxInstance> = instances
            .values()
            .filter(|instance| {
                instance.kind == kind && instance.status == InstanceStatus::Healthy
            })
            .cloned()
            .collect();

        let index = self
            .balancer
            .pick(&candidates)
            .ok_or(PoolError::NoHealthyInstance(kind))?;
        let chosen_id = candidates[index].id.clone();

        let chosen = instances
            .get_mut(&chosen_id)
            .ok_or(PoolError::NoHealthyInstance(kind))?;
        chosen.load += 1;
        Ok(chosen.clone())
    }

    /// Release one in-flight dispatch after the forwarded response
    /// completed (or failed).
    pub async fn release(&self, instance_id: &str) {
        let mut instances = self.instances.write().await;
        if let Some(instance) = instances.get_mut(instance_id) {
            instance.load = (instance.load - 1).max(0);
        }
    }

    pub async fn all(&self) -> HashMap<String, SandboxInstance> {
        self.instances.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.instances.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.instances.read().await.is_empty()
    }

    async fn persist(&self, instance: &SandboxInstance) {
        let Some(store) = &self.store else { return };
        match serde_json::to_string(instance) {
            Ok(raw) => {
                if let Err(e) = store.hset(INSTANCES_KEY, &instance.id, &raw).await {
                    tracing::warn!(instance_id = %instance.id, error = %e, "failed to persist instance");
                }
            }
            Err(e) => {
                tracing::error!(instance_id = %instance.id, error = %e, "failed to serialize instance");
            }
        }
    }

    /// Probe every known instance once, sequentially, and publish the
    /// outcome. A 2xx on `GET <url>/health` marks the instance healthy;
    /// anything else, including an empty URL, marks it unhealthy.
    pub async fn check_instances_health(&self, client: &Arc<dyn HttpClient>) {
        let snapshot: Vec<(String, String)> = {
            let instances = self.instances.read().await;
            instances
                .values()
                .map(|instance| (instance.id.clone(), instance.url.clone()))
                .collect()
        };

        for (id, url) in snapshot {
            let healthy = if url.is_empty() {
                tracing::warn!(instance_id = %id, "instance has no url, marking unhealthy");
                false
            } else {
                let probe_url = format!("{url}/health");
                match client.health_check(&probe_url, PROBE_TIMEOUT_SECS).await {
                    Ok(result) => result,
                    Err(e) => {
                        tracing::debug!(instance_id = %id, error = %e, "health probe failed");
                        false
                    }
                }
            };

            let updated = {
                let mut instances = self.instances.write().await;
                instances.get_mut(&id).map(|instance| {
                    if healthy {
                        instance.status = InstanceStatus::Healthy;
                        instance.last_ping = now_seconds();
                    } else {
                        instance.status = InstanceStatus::Unhealthy;
                    }
                    instance.clone()
                })
            };

            if let Some(instance) = updated {
                if healthy {
                    tracing::debug!(instance_id = %id, "sandbox healthy");
                } else {
                    tracing::warn!(instance_id = %id, "sandbox unhealthy");
                }
                self.persist(&instance).await;
            }
        }
    }

    /// Background probe loop until shutdown.
    pub async fn run_health_loop(
        self: Arc<Self>,
        client: Arc<dyn HttpClient>,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        tracing::info!(interval_secs = interval.as_secs(), "sandbox health loop started");
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(interval) => {
                    self.check_instances_health(&client).await;
                }
            }
        }
        tracing::info!("sandbox health loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use axum::body::Body;
    use hyper::{Request, Response};

    use super::*;
    use crate::{
        adapters::memory_store::MemoryStore,
        ports::http_client::{HttpClientError, HttpClientResult},
    };

    struct MockHttpClient {
        healthy: bool,
    }

    #[async_trait]
    impl HttpClient for MockHttpClient {
        async fn send_request(&self, _req: Request<Body>) -> HttpClientResult<Response<Body>> {
            Err(HttpClientError::ConnectionError("not used".to_string()))
        }

        async fn health_check(&self, _url: &str, _timeout_secs: u64) -> HttpClientResult<bool> {
            Ok(self.healthy)
        }
    }

    fn instance(id: &str, kind: SandboxKind, status: InstanceStatus) -> SandboxInstance {
        SandboxInstance {
            id: id.to_string(),
            url: format!("http://{id}:8194"),
            kind,
            status,
            load: 0,
            last_ping: 0,
        }
    }

    fn pool() -> Arc<SandboxPool> {
        SandboxPool::new(None, LoadBalancer::from_name("least-connections"))
    }

    #[tokio::test]
    async fn register_normalizes_scheme_less_urls() {
        let pool = pool();
        let mut bare = instance("worker-1", SandboxKind::Python, InstanceStatus::Healthy);
        bare.url = "worker-1:8194".to_string();
        pool.register(bare).await.unwrap();

        let all = pool.all().await;
        assert_eq!(all["worker-1"].url, "http://worker-1:8194");
    }

    #[tokio::test]
    async fn https_urls_are_left_alone() {
        let pool = pool();
        let mut secure = instance("worker-1", SandboxKind::Python, InstanceStatus::Healthy);
        secure.url = "https://worker-1:8194".to_string();
        pool.register(secure).await.unwrap();
        assert_eq!(pool.all().await["worker-1"].url, "https://worker-1:8194");
    }

    #[tokio::test]
    async fn get_healthy_filters_kind_and_status() {
        let pool = pool();
        pool.register(instance("py-ok", SandboxKind::Python, InstanceStatus::Healthy))
            .await
            .unwrap();
        pool.register(instance("py-down", SandboxKind::Python, InstanceStatus::Unhealthy))
            .await
            .unwrap();
        pool.register(instance("node-ok", SandboxKind::Nodejs, InstanceStatus::Healthy))
            .await
            .unwrap();

        let chosen = pool.get_healthy(SandboxKind::Python).await.unwrap();
        assert_eq!(chosen.id, "py-ok");

        let missing = pool.get_healthy(SandboxKind::Go).await;
        assert!(matches!(missing, Err(PoolError::NoHealthyInstance(_))));
    }

    #[tokio::test]
    async fn dispatch_charges_and_release_refunds_load() {
        let pool = pool();
        pool.register(instance("py-ok", SandboxKind::Python, InstanceStatus::Healthy))
            .await
            .unwrap();

        let chosen = pool.get_healthy(SandboxKind::Python).await.unwrap();
        assert_eq!(chosen.load, 1);
        assert_eq!(pool.all().await["py-ok"].load, 1);

        pool.release("py-ok").await;
        assert_eq!(pool.all().await["py-ok"].load, 0);

        // Release never drives the counter negative.
        pool.release("py-ok").await;
        assert_eq!(pool.all().await["py-ok"].load, 0);
    }

    #[tokio::test]
    async fn probes_flip_status_and_stamp_last_ping() {
        let store = Arc::new(MemoryStore::new());
        let pool = SandboxPool::new(
            Some(store.clone() as Arc<dyn Store>),
            LoadBalancer::from_name("least-connections"),
        );
        pool.register(instance("py", SandboxKind::Python, InstanceStatus::Starting))
            .await
            .unwrap();

        let client: Arc<dyn HttpClient> = Arc::new(MockHttpClient { healthy: true });
        pool.check_instances_health(&client).await;
        let all = pool.all().await;
        assert_eq!(all["py"].status, InstanceStatus::Healthy);
        assert!(all["py"].last_ping > 0);

        // Published to the store as well.
        let raw = store.hget(INSTANCES_KEY, "py").await.unwrap().unwrap();
        let stored: SandboxInstance = serde_json::from_str(&raw).unwrap();
        assert_eq!(stored.status, InstanceStatus::Healthy);

        let client: Arc<dyn HttpClient> = Arc::new(MockHttpClient { healthy: false });
        pool.check_instances_health(&client).await;
        assert_eq!(pool.all().await["py"].status, InstanceStatus::Unhealthy);
    }

    #[tokio::test]
    async fn empty_url_disqualifies_from_probing() {
        let pool = pool();
        let mut broken = instance("broken", SandboxKind::Python, InstanceStatus::Healthy);
        broken.url = String::new();
        pool.register(broken).await.unwrap();

        let client: Arc<dyn HttpClient> = Arc::new(MockHttpClient { healthy: true });
        pool.check_instances_health(&client).await;
        assert_eq!(pool.all().await["broken"].status, InstanceStatus::Unhealthy);
    }

    #[tokio::test]
    async fn boot_load_reads_the_store() {
        let store = Arc::new(MemoryStore::new());
        let seeded = instance("seeded", SandboxKind::Python, InstanceStatus::Healthy);
        store
            .hset(
                INSTANCES_KEY,
                "seeded",
                &serde_json::to_string(&seeded).unwrap(),
            )
            .await
            .unwrap();

        let pool = SandboxPool::new(
            Some(store as Arc<dyn Store>),
            LoadBalancer::from_name("least-connections"),
        );
        pool.load_from_store().await.unwrap();
        assert_eq!(pool.len().await, 1);
    }
}
