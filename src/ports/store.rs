//! Port for the shared key-value + stream store.
//!
//! The gateway never talks to a concrete store client outside the
//! adapter implementing this trait. The operation set is exactly what
//! the catalog, the event log, and the pool need: hash, set, and string
//! operations plus an append-only stream with consumer groups.
use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

/// Errors surfaced by store operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StoreError {
    #[error("store connection error: {0}")]
    Connection(String),

    #[error("store operation timed out after {0} seconds")]
    Timeout(u64),

    #[error("store protocol error: {0}")]
    Protocol(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One entry of an append-only stream.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamEntry {
    pub id: String,
    pub fields: HashMap<String, String>,
}

/// Stream metadata for introspection endpoints.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamInfo {
    pub length: u64,
    pub last_generated_id: String,
    pub first_entry_id: Option<String>,
    pub last_entry_id: Option<String>,
}

/// Per-consumer-group metadata.
#[derive(Debug, Clone, Serialize)]
pub struct GroupInfo {
    pub name: String,
    pub consumers: u64,
    pub pending: u64,
    pub last_delivered_id: String,
}

/// A delivered-but-unacknowledged stream entry.
#[derive(Debug, Clone, Serialize)]
pub struct PendingEntry {
    pub id: String,
    pub consumer: String,
    pub idle_ms: u64,
    pub delivery_count: u64,
}

/// Abstract repository over the shared store.
///
/// All values are serialized strings; callers own the serde layer.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Liveness probe with a deadline in seconds.
    async fn ping(&self, deadline_secs: u64) -> StoreResult<()>;

    // Hash operations.
    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>>;
    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()>;
    async fn hdel(&self, key: &str, field: &str) -> StoreResult<()>;
    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>>;
    async fn hlen(&self, key: &str) -> StoreResult<u64>;

    // Set operations.
    async fn sadd(&self, key: &str, member: &str) -> StoreResult<()>;
    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>>;

    /// Remove a key of any type.
    async fn del(&self, key: &str) -> StoreResult<()>;

    // String operations.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> StoreResult<()>;

    // Append-only stream operations.

    /// Append an entry, returning its generated id.
    async fn append(&self, stream: &str, fields: &[(&str, String)]) -> StoreResult<String>;

    /// Create a consumer group starting at the beginning of the stream.
    /// Creating a group that already exists is not an error.
    async fn create_group(&self, stream: &str, group: &str) -> StoreResult<()>;

    /// Block-read up to `count` entries not yet delivered to this
    /// consumer, waiting at most `block_ms`. An empty result after the
    /// block window is not an error.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> StoreResult<Vec<StreamEntry>>;

    /// Acknowledge one entry for a group.
    async fn ack(&self, stream: &str, group: &str, id: &str) -> StoreResult<()>;

    /// All entries with ids at or below `end_id` (a millisecond stamp or
    /// full entry id).
    async fn range_until(&self, stream: &str, end_id: &str) -> StoreResult<Vec<StreamEntry>>;

    /// Delete entries by id, returning how many were removed.
    async fn delete_entries(&self, stream: &str, ids: &[String]) -> StoreResult<u64>;

    async fn stream_len(&self, stream: &str) -> StoreResult<u64>;
    async fn stream_info(&self, stream: &str) -> StoreResult<StreamInfo>;
    async fn group_info(&self, stream: &str) -> StoreResult<Vec<GroupInfo>>;

    /// Pending (delivered, unacknowledged) entries for a group.
    async fn pending(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> StoreResult<Vec<PendingEntry>>;
}
