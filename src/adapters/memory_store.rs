//! In-process implementation of the [`Store`] port.
//!
//! Backs the integration tests (two catalogs sharing one `MemoryStore`
//! exercise the replica-convergence path without a server) and local
//! experiments. Stream semantics mirror what the gateway relies on:
//! per-group delivery cursors, a pending set until acknowledgement, and
//! a bounded blocking read.
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use crate::ports::store::{
    GroupInfo, PendingEntry, Store, StoreResult, StreamEntry, StreamInfo,
};

#[derive(Default)]
struct GroupState {
    /// Index into the entry vector of the next entry to deliver.
    cursor: usize,
    pending: HashMap<String, PendingState>,
}

struct PendingState {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u64,
}

#[derive(Default)]
struct StreamState {
    entries: Vec<StreamEntry>,
    next_seq: u64,
    last_id: String,
    groups: HashMap<String, GroupState>,
}

#[derive(Default)]
struct Inner {
    hashes: HashMap<String, HashMap<String, String>>,
    sets: HashMap<String, HashSet<String>>,
    strings: HashMap<String, String>,
    streams: HashMap<String, StreamState>,
}

/// Shared in-memory store. Cloning shares the underlying state, so two
/// "replicas" constructed over clones observe each other's writes.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    appended: Arc<Notify>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Split `<millis>-<seq>` (seq optional) into a sortable pair.
fn parse_id(id: &str) -> (u64, u64) {
    let mut parts = id.splitn(2, '-');
    let millis = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let seq = parts
        .next()
        .and_then(|p| p.parse().ok())
        .unwrap_or(u64::MAX);
    (millis, seq)
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self, _deadline_secs: u64) -> StoreResult<()> {
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .hashes
            .get(key)
            .and_then(|hash| hash.get(field))
            .cloned())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        inner
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hdel(&self, key: &str, field: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(hash) = inner.hashes.get_mut(key) {
            hash.remove(field);
        }
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let inner = self.inner.lock().await;
        Ok(inner.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hlen(&self, key: &str) -> StoreResult<u64> {
        let inner = self.inner.lock().await;
        Ok(inner.hashes.get(key).map(|hash| hash.len() as u64).unwrap_or(0))
    }

    async fn sadd(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        inner
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        let inner = self.inner.lock().await;
        let mut members: Vec<String> = inner
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        Ok(members)
    }

    async fn del(&self, key: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        inner.hashes.remove(key);
        inner.sets.remove(key);
        inner.strings.remove(key);
        inner.streams.remove(key);
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let inner = self.inner.lock().await;
        Ok(inner.strings.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        inner.strings.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn append(&self, stream: &str, fields: &[(&str, String)]) -> StoreResult<String> {
        let mut inner = self.inner.lock().await;
        let state = inner.streams.entry(stream.to_string()).or_default();
        let id = format!("{}-{}", now_millis(), state.next_seq);
        state.next_seq += 1;
        state.last_id = id.clone();
        state.entries.push(StreamEntry {
            id: id.clone(),
            fields: fields
                .iter()
                .map(|(field, value)| (field.to_string(), value.clone()))
                .collect(),
        });
        drop(inner);
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn create_group(&self, stream: &str, group: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let state = inner.streams.entry(stream.to_string()).or_default();
        state.groups.entry(group.to_string()).or_default();
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> StoreResult<Vec<StreamEntry>> {
        let deadline = Instant::now() + Duration::from_millis(block_ms);
        loop {
            {
                let mut inner = self.inner.lock().await;
                let state = inner.streams.entry(stream.to_string()).or_default();
                let group_state = state.groups.entry(group.to_string()).or_default();

                if group_state.cursor < state.entries.len() {
                    let end = (group_state.cursor + count).min(state.entries.len());
                    let delivered: Vec<StreamEntry> =
                        state.entries[group_state.cursor..end].to_vec();
                    group_state.cursor = end;
                    for entry in &delivered {
                        group_state.pending.insert(
                            entry.id.clone(),
                            PendingState {
                                consumer: consumer.to_string(),
                                delivered_at: Instant::now(),
                                delivery_count: 1,
                            },
                        );
                    }
                    return Ok(delivered);
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Vec::new());
            }
            tokio::select! {
                _ = self.appended.notified() => {}
                _ = tokio::time::sleep(remaining) => return Ok(Vec::new()),
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(state) = inner.streams.get_mut(stream) {
            if let Some(group_state) = state.groups.get_mut(group) {
                group_state.pending.remove(id);
            }
        }
        Ok(())
    }

    async fn range_until(&self, stream: &str, end_id: &str) -> StoreResult<Vec<StreamEntry>> {
        let end = parse_id(end_id);
        let inner = self.inner.lock().await;
        Ok(inner
            .streams
            .get(stream)
            .map(|state| {
                state
                    .entries
                    .iter()
                    .filter(|entry| parse_id(&entry.id) <= end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete_entries(&self, stream: &str, ids: &[String]) -> StoreResult<u64> {
        let mut inner = self.inner.lock().await;
        let Some(state) = inner.streams.get_mut(stream) else {
            return Ok(0);
        };
        let remove: HashSet<&String> = ids.iter().collect();
        let before = state.entries.len();
        // Cursors index into the entry vector, so shift them back by the
        // number of removed entries that preceded them.
        for group_state in state.groups.values_mut() {
            let removed_before_cursor = state.entries[..group_state.cursor.min(before)]
                .iter()
                .filter(|entry| remove.contains(&entry.id))
                .count();
            group_state.cursor -= removed_before_cursor;
        }
        state.entries.retain(|entry| !remove.contains(&entry.id));
        Ok((before - state.entries.len()) as u64)
    }

    async fn stream_len(&self, stream: &str) -> StoreResult<u64> {
        let inner = self.inner.lock().await;
        Ok(inner
            .streams
            .get(stream)
            .map(|state| state.entries.len() as u64)
            .unwrap_or(0))
    }

    async fn stream_info(&self, stream: &str) -> StoreResult<StreamInfo> {
        let inner = self.inner.lock().await;
        let Some(state) = inner.streams.get(stream) else {
            return Ok(StreamInfo::default());
        };
        Ok(StreamInfo {
            length: state.entries.len() as u64,
            last_generated_id: state.last_id.clone(),
            first_entry_id: state.entries.first().map(|entry| entry.id.clone()),
            last_entry_id: state.entries.last().map(|entry| entry.id.clone()),
        })
    }

    async fn group_info(&self, stream: &str) -> StoreResult<Vec<GroupInfo>> {
        let inner = self.inner.lock().await;
        let Some(state) = inner.streams.get(stream) else {
            return Ok(Vec::new());
        };
        let mut groups: Vec<GroupInfo> = state
            .groups
            .iter()
            .map(|(name, group_state)| {
                let consumers: HashSet<&str> = group_state
                    .pending
                    .values()
                    .map(|pending| pending.consumer.as_str())
                    .collect();
                GroupInfo {
                    name: name.clone(),
                    consumers: consumers.len() as u64,
                    pending: group_state.pending.len() as u64,
                    last_delivered_id: state
                        .entries
                        .get(group_state.cursor.wrapping_sub(1))
                        .map(|entry| entry.id.clone())
                        .unwrap_or_else(|| "0-0".to_string()),
                }
            })
            .collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(groups)
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> StoreResult<Vec<PendingEntry>> {
        let inner = self.inner.lock().await;
        let Some(state) = inner.streams.get(stream) else {
            return Ok(Vec::new());
        };
        let Some(group_state) = state.groups.get(group) else {
            return Ok(Vec::new());
        };
        let mut pending: Vec<PendingEntry> = group_state
            .pending
            .iter()
            .map(|(id, pending_state)| PendingEntry {
                id: id.clone(),
                consumer: pending_state.consumer.clone(),
                idle_ms: pending_state.delivered_at.elapsed().as_millis() as u64,
                delivery_count: pending_state.delivery_count,
            })
            .collect();
        pending.sort_by(|a, b| parse_id(&a.id).cmp(&parse_id(&b.id)));
        pending.truncate(count);
        Ok(pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hash_and_set_and_string_ops() {
        let store = MemoryStore::new();
        store.hset("h", "a", "1").await.unwrap();
        store.hset("h", "b", "2").await.unwrap();
        assert_eq!(store.hget("h", "a").await.unwrap().as_deref(), Some("1"));
        assert_eq!(store.hlen("h").await.unwrap(), 2);
        store.hdel("h", "a").await.unwrap();
        assert_eq!(store.hget("h", "a").await.unwrap(), None);

        store.sadd("s", "x").await.unwrap();
        store.sadd("s", "x").await.unwrap();
        assert_eq!(store.smembers("s").await.unwrap(), vec!["x".to_string()]);
        store.del("s").await.unwrap();
        assert!(store.smembers("s").await.unwrap().is_empty());

        store.set("k", "v").await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn group_read_delivers_each_entry_once() {
        let store = MemoryStore::new();
        store.create_group("st", "g").await.unwrap();
        store
            .append("st", &[("event_data", "one".to_string())])
            .await
            .unwrap();
        store
            .append("st", &[("event_data", "two".to_string())])
            .await
            .unwrap();

        let first = store.read_group("st", "g", "c1", 10, 10).await.unwrap();
        assert_eq!(first.len(), 2);
        let second = store.read_group("st", "g", "c1", 10, 10).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn ack_clears_pending() {
        let store = MemoryStore::new();
        store.create_group("st", "g").await.unwrap();
        store
            .append("st", &[("event_data", "one".to_string())])
            .await
            .unwrap();

        let delivered = store.read_group("st", "g", "c1", 10, 10).await.unwrap();
        assert_eq!(store.pending("st", "g", 100).await.unwrap().len(), 1);
        store.ack("st", "g", &delivered[0].id).await.unwrap();
        assert!(store.pending("st", "g", 100).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn blocking_read_wakes_on_append() {
        let store = MemoryStore::new();
        store.create_group("st", "g").await.unwrap();

        let reader = store.clone();
        let handle =
            tokio::spawn(async move { reader.read_group("st", "g", "c1", 10, 2_000).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        store
            .append("st", &[("event_data", "late".to_string())])
            .await
            .unwrap();

        let delivered = handle.await.unwrap().unwrap();
        assert_eq!(delivered.len(), 1);
    }

    #[tokio::test]
    async fn range_and_delete_by_age() {
        let store = MemoryStore::new();
        store
            .append("st", &[("event_data", "old".to_string())])
            .await
            .unwrap();
        let cutoff = format!("{}", now_millis() + 1_000);
        let old = store.range_until("st", &cutoff).await.unwrap();
        assert_eq!(old.len(), 1);
        let ids: Vec<String> = old.into_iter().map(|entry| entry.id).collect();
        assert_eq!(store.delete_entries("st", &ids).await.unwrap(), 1);
        assert_eq!(store.stream_len("st").await.unwrap(), 0);
    }
}
