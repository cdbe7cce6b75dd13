//! Redis implementation of the [`Store`] port.
//!
//! Uses the async `ConnectionManager`, which reconnects on its own after
//! transient failures. Construction is the only place where store
//! unreachability matters: a failed boot `ping` puts the gateway in
//! degraded single-replica mode, so `connect` surfaces the error instead
//! of retrying.
use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use redis::{
    AsyncCommands, RedisError,
    aio::ConnectionManager,
    streams::{
        StreamInfoGroupsReply, StreamInfoStreamReply, StreamPendingCountReply, StreamRangeReply,
        StreamReadOptions, StreamReadReply,
    },
};
use tokio::time::timeout;

use crate::{
    config::models::RedisConfig,
    ports::store::{
        GroupInfo, PendingEntry, Store, StoreError, StoreResult, StreamEntry, StreamInfo,
    },
};

const BOOT_PING_DEADLINE_SECS: u64 = 5;

pub struct RedisStore {
    manager: ConnectionManager,
}

fn map_err(err: RedisError) -> StoreError {
    if err.is_connection_refusal() || err.is_connection_dropped() || err.is_io_error() {
        StoreError::Connection(err.to_string())
    } else {
        StoreError::Protocol(err.to_string())
    }
}

fn entry_fields(map: HashMap<String, redis::Value>) -> HashMap<String, String> {
    map.into_iter()
        .filter_map(|(field, value)| {
            redis::from_redis_value::<String>(&value)
                .ok()
                .map(|text| (field, text))
        })
        .collect()
}

impl RedisStore {
    /// Connect and verify liveness with the boot deadline.
    pub async fn connect(config: &RedisConfig) -> StoreResult<Self> {
        let url = if config.password.is_empty() {
            format!("redis://{}/{}", config.addr, config.db)
        } else {
            format!("redis://:{}@{}/{}", config.password, config.addr, config.db)
        };

        let client = redis::Client::open(url).map_err(map_err)?;
        let manager = timeout(
            Duration::from_secs(BOOT_PING_DEADLINE_SECS),
            client.get_connection_manager(),
        )
        .await
        .map_err(|_| StoreError::Timeout(BOOT_PING_DEADLINE_SECS))?
        .map_err(map_err)?;

        let store = Self { manager };
        store.ping(BOOT_PING_DEADLINE_SECS).await?;
        Ok(store)
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn ping(&self, deadline_secs: u64) -> StoreResult<()> {
        let mut con = self.manager.clone();
        let pong = timeout(Duration::from_secs(deadline_secs), async move {
            let reply: String = redis::cmd("PING").query_async(&mut con).await?;
            Ok::<_, RedisError>(reply)
        })
        .await
        .map_err(|_| StoreError::Timeout(deadline_secs))?
        .map_err(map_err)?;

        if pong == "PONG" {
            Ok(())
        } else {
            Err(StoreError::Protocol(format!("unexpected ping reply: {pong}")))
        }
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let mut con = self.manager.clone();
        con.hget(key, field).await.map_err(map_err)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        let mut con = self.manager.clone();
        let _: () = con.hset(key, field, value).await.map_err(map_err)?;
        Ok(())
    }

    async fn hdel(&self, key: &str, field: &str) -> StoreResult<()> {
        let mut con = self.manager.clone();
        let _: () = con.hdel(key, field).await.map_err(map_err)?;
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let mut con = self.manager.clone();
        con.hgetall(key).await.map_err(map_err)
    }

    async fn hlen(&self, key: &str) -> StoreResult<u64> {
        let mut con = self.manager.clone();
        con.hlen(key).await.map_err(map_err)
    }

    async fn sadd(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut con = self.manager.clone();
        let _: () = con.sadd(key, member).await.map_err(map_err)?;
        Ok(())
    }

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut con = self.manager.clone();
        con.smembers(key).await.map_err(map_err)
    }

    async fn del(&self, key: &str) -> StoreResult<()> {
        let mut con = self.manager.clone();
        let _: () = con.del(key).await.map_err(map_err)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut con = self.manager.clone();
        con.get(key).await.map_err(map_err)
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut con = self.manager.clone();
        let _: () = con.set(key, value).await.map_err(map_err)?;
        Ok(())
    }

    async fn append(&self, stream: &str, fields: &[(&str, String)]) -> StoreResult<String> {
        let mut con = self.manager.clone();
        con.xadd(stream, "*", fields).await.map_err(map_err)
    }

    async fn create_group(&self, stream: &str, group: &str) -> StoreResult<()> {
        let mut con = self.manager.clone();
        let created: Result<(), RedisError> =
            con.xgroup_create_mkstream(stream, group, "0").await;
        match created {
            Ok(()) => Ok(()),
            // The group surviving a replica restart is the normal case.
            Err(err) if err.to_string().contains("BUSYGROUP") => Ok(()),
            Err(err) => Err(map_err(err)),
        }
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> StoreResult<Vec<StreamEntry>> {
        let mut con = self.manager.clone();
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block_ms as usize);

        let reply: Option<StreamReadReply> = con
            .xread_options(&[stream], &[">"], &options)
            .await
            .map_err(map_err)?;

        let mut entries = Vec::new();
        if let Some(reply) = reply {
            for key in reply.keys {
                for id in key.ids {
                    entries.push(StreamEntry {
                        id: id.id,
                        fields: entry_fields(id.map),
                    });
                }
            }
        }
        Ok(entries)
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> StoreResult<()> {
        let mut con = self.manager.clone();
        let _: () = con.xack(stream, group, &[id]).await.map_err(map_err)?;
        Ok(())
    }

    async fn range_until(&self, stream: &str, end_id: &str) -> StoreResult<Vec<StreamEntry>> {
        let mut con = self.manager.clone();
        let reply: StreamRangeReply = con.xrange(stream, "-", end_id).await.map_err(map_err)?;
        Ok(reply
            .ids
            .into_iter()
            .map(|id| StreamEntry {
                id: id.id,
                fields: entry_fields(id.map),
            })
            .collect())
    }

    async fn delete_entries(&self, stream: &str, ids: &[String]) -> StoreResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut con = self.manager.clone();
        con.xdel(stream, ids).await.map_err(map_err)
    }

    async fn stream_len(&self, stream: &str) -> StoreResult<u64> {
        let mut con = self.manager.clone();
        con.xlen(stream).await.map_err(map_err)
    }

    async fn stream_info(&self, stream: &str) -> StoreResult<StreamInfo> {
        let mut con = self.manager.clone();
        let info: StreamInfoStreamReply = con.xinfo_stream(stream).await.map_err(map_err)?;
        Ok(StreamInfo {
            length: info.length as u64,
            last_generated_id: info.last_generated_id,
            first_entry_id: (!info.first_entry.id.is_empty()).then(|| info.first_entry.id),
            last_entry_id: (!info.last_entry.id.is_empty()).then(|| info.last_entry.id),
        })
    }

    async fn group_info(&self, stream: &str) -> StoreResult<Vec<GroupInfo>> {
        let mut con = self.manager.clone();
        let reply: StreamInfoGroupsReply = con.xinfo_groups(stream).await.map_err(map_err)?;
        Ok(reply
            .groups
            .into_iter()
            .map(|group| GroupInfo {
                name: group.name,
                consumers: group.consumers as u64,
                pending: group.pending as u64,
                last_delivered_id: group.last_delivered_id,
            })
            .collect())
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> StoreResult<Vec<PendingEntry>> {
        let mut con = self.manager.clone();
        let reply: StreamPendingCountReply = con
            .xpending_count(stream, group, "-", "+", count)
            .await
            .map_err(map_err)?;
        Ok(reply
            .ids
            .into_iter()
            .map(|pending| PendingEntry {
                id: pending.id,
                consumer: pending.consumer,
                idle_ms: pending.last_delivered_ms as u64,
                delivery_count: pending.times_delivered as u64,
            })
            .collect())
    }
}
