//! Route-mutation event log over the store's append-only stream.
//!
//! One named stream carries every mutation; each replica runs a single
//! consumer in the shared `route-managers` group. Delivery is per-stream
//! FIFO and at-least-once: handlers must be idempotent on `version`.
use std::{
    sync::{Arc, RwLock as StdRwLock},
    time::Duration,
};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::{
    core::route::{RouteEvent, now_seconds},
    ports::store::{
        GroupInfo, PendingEntry, Store, StoreResult, StreamEntry, StreamInfo,
    },
};

/// Stream key shared by all replicas.
pub const STREAM_KEY: &str = "gateway:route:events";
/// Consumer group every replica's catalog consumer joins.
pub const CONSUMER_GROUP: &str = "route-managers";

/// Field carrying the serialized event inside a stream entry.
const EVENT_DATA_FIELD: &str = "event_data";

/// Callback invoked for every delivered event.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle_event(&self, event: &RouteEvent) -> eyre::Result<()>;
}

/// Consumer tuning. Defaults mirror the production settings: batches of
/// ten, five-second block reads, acknowledge after successful handling.
#[derive(Debug, Clone, Serialize)]
pub struct EventConsumerConfig {
    pub consumer_group: String,
    pub consumer_name: String,
    pub batch_size: usize,
    pub block_time_ms: u64,
    /// When set, the loop acknowledges an entry after its handler
    /// returns success. Failed entries stay pending and show up under
    /// `/admin/events/pending`.
    pub ack_on_success: bool,
}

impl EventConsumerConfig {
    pub fn for_replica(consumer_name: String) -> Self {
        Self {
            consumer_group: CONSUMER_GROUP.to_string(),
            consumer_name,
            batch_size: 10,
            block_time_ms: 5_000,
            ack_on_success: true,
        }
    }
}

/// Publisher plus consumer registry for the route event stream.
pub struct EventLog {
    store: Arc<dyn Store>,
    stream_key: String,
    consumers: StdRwLock<Vec<EventConsumerConfig>>,
}

impl EventLog {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            stream_key: STREAM_KEY.to_string(),
            consumers: StdRwLock::new(Vec::new()),
        }
    }

    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    /// Publish a route event. The timestamp is stamped here and the
    /// source defaults to `gateway`.
    pub async fn publish(&self, mut event: RouteEvent) -> StoreResult<String> {
        event.timestamp = now_seconds();
        if event.source.is_empty() {
            event.source = "gateway".to_string();
        }

        let payload = serde_json::to_string(&event)
            .map_err(|e| crate::ports::store::StoreError::Protocol(e.to_string()))?;
        let fields = [
            (EVENT_DATA_FIELD, payload),
            ("event_type", event.event_type.to_string()),
            ("route_id", event.route_id.clone()),
            ("timestamp", event.timestamp.to_string()),
        ];

        let message_id = self.store.append(&self.stream_key, &fields).await?;
        tracing::info!(
            event_type = %event.event_type,
            route_id = %event.route_id,
            message_id = %message_id,
            "published route event"
        );
        Ok(message_id)
    }

    /// Create the consumer group (idempotent) and spawn the consumer
    /// loop for this replica. The task runs until `shutdown` fires.
    pub async fn start_consumer(
        &self,
        config: EventConsumerConfig,
        handler: Arc<dyn EventHandler>,
        shutdown: broadcast::Receiver<()>,
    ) -> StoreResult<()> {
        self.store
            .create_group(&self.stream_key, &config.consumer_group)
            .await?;

        if let Ok(mut consumers) = self.consumers.write() {
            consumers.push(config.clone());
        }

        let consumer = EventConsumer {
            store: self.store.clone(),
            stream_key: self.stream_key.clone(),
            config,
            handler,
        };
        tokio::spawn(consumer.run(shutdown));
        Ok(())
    }

    /// Descriptors of the consumers this replica has started.
    pub fn consumers(&self) -> Vec<EventConsumerConfig> {
        self.consumers.read().map(|c| c.clone()).unwrap_or_default()
    }

    pub async fn stream_info(&self) -> StoreResult<StreamInfo> {
        self.store.stream_info(&self.stream_key).await
    }

    pub async fn stream_len(&self) -> StoreResult<u64> {
        self.store.stream_len(&self.stream_key).await
    }

    pub async fn group_info(&self) -> StoreResult<Vec<GroupInfo>> {
        self.store.group_info(&self.stream_key).await
    }

    pub async fn pending(&self, group: &str) -> StoreResult<Vec<PendingEntry>> {
        self.store.pending(&self.stream_key, group, 100).await
    }

    /// Delete entries older than `max_age_hours`. Returns the number of
    /// deleted entries and the cutoff unix time.
    pub async fn cleanup(&self, max_age_hours: i64) -> StoreResult<(u64, i64)> {
        let hours = if max_age_hours <= 0 { 24 } else { max_age_hours };
        let cutoff_secs = now_seconds() - hours * 3_600;
        let cutoff_id = format!("{}", cutoff_secs.max(0) * 1_000);

        let old = self.store.range_until(&self.stream_key, &cutoff_id).await?;
        if old.is_empty() {
            return Ok((0, cutoff_secs));
        }
        let ids: Vec<String> = old.into_iter().map(|entry| entry.id).collect();
        let deleted = self.store.delete_entries(&self.stream_key, &ids).await?;
        Ok((deleted, cutoff_secs))
    }
}

struct EventConsumer {
    store: Arc<dyn Store>,
    stream_key: String,
    config: EventConsumerConfig,
    handler: Arc<dyn EventHandler>,
}

impl EventConsumer {
    async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(
            consumer = %self.config.consumer_name,
            group = %self.config.consumer_group,
            "event consumer started"
        );

        loop {
            let read = tokio::select! {
                _ = shutdown.recv() => break,
                read = self.store.read_group(
                    &self.stream_key,
                    &self.config.consumer_group,
                    &self.config.consumer_name,
                    self.config.batch_size,
                    self.config.block_time_ms,
                ) => read,
            };

            match read {
                Ok(entries) => {
                    for entry in entries {
                        if let Err(e) = self.process_entry(&entry).await {
                            tracing::error!(
                                entry_id = %entry.id,
                                error = %e,
                                "failed to process event entry"
                            );
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "stream read failed, backing off");
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }

        tracing::info!(consumer = %self.config.consumer_name, "event consumer stopped");
    }

    async fn process_entry(&self, entry: &StreamEntry) -> eyre::Result<()> {
        let payload = entry
            .fields
            .get(EVENT_DATA_FIELD)
            .ok_or_else(|| eyre::eyre!("missing {EVENT_DATA_FIELD} field in entry {}", entry.id))?;

        let event: RouteEvent = serde_json::from_str(payload)?;

        tracing::debug!(
            event_type = %event.event_type,
            event_id = %event.event_id,
            route_id = %event.route_id,
            "handling route event"
        );

        self.handler.handle_event(&event).await?;

        if self.config.ack_on_success {
            self.store
                .ack(&self.stream_key, &self.config.consumer_group, &entry.id)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{adapters::memory_store::MemoryStore, core::route::EventKind};

    struct CountingHandler {
        seen: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl EventHandler for CountingHandler {
        async fn handle_event(&self, _event: &RouteEvent) -> eyre::Result<()> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                eyre::bail!("handler rejected event");
            }
            Ok(())
        }
    }

    fn delete_event(route_id: &str) -> RouteEvent {
        RouteEvent {
            event_id: "delete-1".to_string(),
            event_type: EventKind::Delete,
            route_id: route_id.to_string(),
            route_data: None,
            timestamp: 0,
            source: String::new(),
        }
    }

    #[tokio::test]
    async fn publish_stamps_timestamp_and_source() {
        let store = Arc::new(MemoryStore::new());
        let log = Arc::new(EventLog::new(store.clone()));

        log.publish(delete_event("r1")).await.unwrap();

        let info = log.stream_info().await.unwrap();
        assert_eq!(info.length, 1);

        let entries = store
            .range_until(STREAM_KEY, &format!("{}", i64::MAX))
            .await
            .unwrap();
        let event: RouteEvent =
            serde_json::from_str(&entries[0].fields[EVENT_DATA_FIELD]).unwrap();
        assert!(event.timestamp > 0);
        assert_eq!(event.source, "gateway");
        assert_eq!(entries[0].fields["event_type"], "DELETE");
    }

    #[tokio::test]
    async fn consumer_delivers_and_acks_on_success() {
        let store = Arc::new(MemoryStore::new());
        let log = Arc::new(EventLog::new(store.clone()));
        let handler = Arc::new(CountingHandler {
            seen: AtomicUsize::new(0),
            fail: false,
        });

        let (shutdown_tx, _) = broadcast::channel(1);
        let mut config = EventConsumerConfig::for_replica("consumer-test".to_string());
        config.block_time_ms = 50;
        log.start_consumer(config, handler.clone(), shutdown_tx.subscribe())
            .await
            .unwrap();

        log.publish(delete_event("r1")).await.unwrap();

        for _ in 0..50 {
            if handler.seen.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(handler.seen.load(Ordering::SeqCst), 1);

        // Acked after successful handling.
        for _ in 0..50 {
            if log.pending(CONSUMER_GROUP).await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(log.pending(CONSUMER_GROUP).await.unwrap().is_empty());

        let _ = shutdown_tx.send(());
    }

    #[tokio::test]
    async fn failed_handler_leaves_entry_pending() {
        let store = Arc::new(MemoryStore::new());
        let log = Arc::new(EventLog::new(store.clone()));
        let handler = Arc::new(CountingHandler {
            seen: AtomicUsize::new(0),
            fail: true,
        });

        let (shutdown_tx, _) = broadcast::channel(1);
        let mut config = EventConsumerConfig::for_replica("consumer-test".to_string());
        config.block_time_ms = 50;
        log.start_consumer(config, handler.clone(), shutdown_tx.subscribe())
            .await
            .unwrap();

        log.publish(delete_event("r1")).await.unwrap();

        for _ in 0..50 {
            if handler.seen.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(log.pending(CONSUMER_GROUP).await.unwrap().len(), 1);

        let _ = shutdown_tx.send(());
    }

    #[tokio::test]
    async fn cleanup_defaults_to_24_hours_and_spares_fresh_entries() {
        let store = Arc::new(MemoryStore::new());
        let log = Arc::new(EventLog::new(store));

        log.publish(delete_event("r1")).await.unwrap();
        let (deleted, _) = log.cleanup(0).await.unwrap();
        assert_eq!(deleted, 0);
        assert_eq!(log.stream_len().await.unwrap(), 1);
    }
}
