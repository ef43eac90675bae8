//! Redis-backed [`StoreDriver`] implementation.
//!
//! Grounded on `server/src/data/topics/redis.rs` of the teacher repo: a
//! `deadpool_redis::Pool` with explicit pool timeouts, raw `redis::cmd(...)`
//! calls (the `redis` crate's typed `AsyncCommands` trait has no helpers for
//! consumer-group stream commands), and hand-parsed `RedisValue` responses
//! for XPENDING/XCLAIM/XREADGROUP/XINFO.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::redis::{cmd, RedisResult, Value as RedisValue};
use deadpool_redis::{Config, Pool, Runtime};

use crate::error::RediMqError;
use crate::scripts;

use super::{ConsumerInfo, Fields, PendingEntry, StoreDriver, TrimHint};

/// Redis-backed store driver. Cheap to clone (wraps a connection pool).
#[derive(Clone)]
pub struct RedisDriver {
    pool: Pool,
}

impl RedisDriver {
    /// Connect to `redis_url`, validating the connection with a `PING`.
    pub async fn connect(redis_url: &str) -> Result<Self, RediMqError> {
        let mut config = Config::from_url(redis_url);
        config.pool = Some(deadpool_redis::PoolConfig {
            max_size: 32,
            timeouts: deadpool_redis::Timeouts {
                wait: Some(Duration::from_secs(5)),
                create: Some(Duration::from_secs(5)),
                recycle: Some(Duration::from_secs(5)),
            },
            ..Default::default()
        });

        let pool = config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| RediMqError::transient("redis pool creation", e))?;

        let mut conn = pool.get().await?;
        cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(|e| RediMqError::transient("redis PING", e))?;

        tracing::debug!("redis driver connected");
        Ok(Self { pool })
    }

    /// Build a driver around an existing pool (e.g. one shared with other
    /// subsystems of an embedding application).
    pub fn with_pool(pool: Pool) -> Self {
        Self { pool }
    }
}

fn fields_to_args(fields: &Fields) -> Vec<(&str, &str)> {
    fields.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect()
}

fn bulk_string(value: &RedisValue) -> Option<String> {
    match value {
        RedisValue::BulkString(bytes) => String::from_utf8(bytes.clone()).ok(),
        RedisValue::SimpleString(s) => Some(s.clone()),
        _ => None,
    }
}

fn parse_fields(value: &RedisValue) -> Fields {
    let mut fields = HashMap::new();
    if let RedisValue::Array(items) = value {
        let mut iter = items.iter();
        while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
            if let (Some(k), Some(v)) = (bulk_string(k), bulk_string(v)) {
                fields.insert(k, v);
            }
        }
    }
    fields
}

/// Parse one `[id, [field, value, ...]]` stream entry.
fn parse_entry(entry: &RedisValue) -> Option<(String, Fields)> {
    let RedisValue::Array(parts) = entry else {
        return None;
    };
    if parts.len() < 2 {
        return None;
    }
    let id = bulk_string(&parts[0])?;
    let fields = parse_fields(&parts[1]);
    Some((id, fields))
}

/// Parse a flat list of `[id, fields]` entries — the shape returned by
/// XCLAIM and by both Lua scripts that claim via XCLAIM internally.
fn parse_entries(value: RedisValue) -> Vec<(String, Fields)> {
    match value {
        RedisValue::Array(items) => items.iter().filter_map(parse_entry).collect(),
        _ => vec![],
    }
}

/// Parse the XREADGROUP response shape: `[[stream_name, [[id, fields], ...]]]`.
fn parse_xreadgroup_response(value: RedisValue) -> Vec<(String, Fields)> {
    let RedisValue::Array(streams) = value else {
        return vec![];
    };
    let mut out = vec![];
    for stream in streams {
        let RedisValue::Array(parts) = stream else {
            continue;
        };
        if parts.len() < 2 {
            continue;
        }
        if let RedisValue::Array(messages) = &parts[1] {
            for m in messages {
                if let Some(parsed) = parse_entry(m) {
                    out.push(parsed);
                }
            }
        }
    }
    out
}

#[async_trait]
impl StoreDriver for RedisDriver {
    async fn append(&self, log: &str, fields: &Fields) -> Result<String, RediMqError> {
        self.append_bounded(log, fields, TrimHint::default(), None).await
    }

    async fn append_bounded(
        &self,
        log: &str,
        fields: &Fields,
        hint: TrimHint,
        min_id_timestamp_ms: Option<i64>,
    ) -> Result<String, RediMqError> {
        let mut conn = self.pool.get().await?;
        let mut c = cmd("XADD");
        c.arg(log);
        if let Some(max_len) = hint.approx_max_len {
            c.arg("MAXLEN").arg("~").arg(max_len);
        }
        if let Some(ts) = min_id_timestamp_ms {
            c.arg("MINID").arg("~").arg(ts);
        }
        c.arg("*");
        for (field, value) in fields_to_args(fields) {
            c.arg(field).arg(value);
        }
        let id: String = c.query_async(&mut conn).await?;
        Ok(id)
    }

    async fn read_new(
        &self,
        log: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<(String, Fields)>, RediMqError> {
        if count == 0 {
            return Ok(vec![]);
        }
        let mut conn = self.pool.get().await?;
        let result: RedisResult<RedisValue> = cmd("XREADGROUP")
            .arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count)
            .arg("STREAMS")
            .arg(log)
            .arg(">")
            .query_async(&mut conn)
            .await;
        match result {
            Ok(RedisValue::Nil) => Ok(vec![]),
            Ok(value) => Ok(parse_xreadgroup_response(value)),
            Err(e) => Err(RediMqError::transient("XREADGROUP", e)),
        }
    }

    async fn pending(
        &self,
        log: &str,
        group: &str,
        count: usize,
        idle_ge_ms: Option<u64>,
        consumer: Option<&str>,
    ) -> Result<Vec<PendingEntry>, RediMqError> {
        if count == 0 {
            return Ok(vec![]);
        }
        let mut conn = self.pool.get().await?;
        let mut c = cmd("XPENDING");
        c.arg(log).arg(group);
        if let Some(idle) = idle_ge_ms {
            c.arg("IDLE").arg(idle);
        }
        c.arg("-").arg("+").arg(count);
        if let Some(consumer) = consumer {
            c.arg(consumer);
        }
        let value: RedisValue = c.query_async(&mut conn).await?;
        let RedisValue::Array(entries) = value else {
            return Ok(vec![]);
        };
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            let RedisValue::Array(parts) = entry else {
                continue;
            };
            if parts.len() < 4 {
                continue;
            }
            let (Some(id), Some(owner)) = (bulk_string(&parts[0]), bulk_string(&parts[1])) else {
                continue;
            };
            let idle_ms = match &parts[2] {
                RedisValue::Int(n) => *n as u64,
                _ => 0,
            };
            let deliveries = match &parts[3] {
                RedisValue::Int(n) => *n as u64,
                _ => 0,
            };
            out.push(PendingEntry {
                id,
                owner,
                idle_ms,
                deliveries,
            });
        }
        Ok(out)
    }

    async fn claim(
        &self,
        log: &str,
        group: &str,
        new_consumer: &str,
        min_idle_ms: u64,
        ids: &[String],
    ) -> Result<Vec<(String, Fields)>, RediMqError> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let mut conn = self.pool.get().await?;
        let mut c = cmd("XCLAIM");
        c.arg(log).arg(group).arg(new_consumer).arg(min_idle_ms);
        for id in ids {
            c.arg(id.as_str());
        }
        let value: RedisValue = c.query_async(&mut conn).await?;
        Ok(parse_entries(value))
    }

    async fn create_group(&self, log: &str, group: &str, start_id: &str) -> Result<(), RediMqError> {
        let mut conn = self.pool.get().await?;
        let result: RedisResult<String> = cmd("XGROUP")
            .arg("CREATE")
            .arg(log)
            .arg(group)
            .arg(start_id)
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                tracing::debug!(error = %RediMqError::already_exists("XGROUP CREATE"), group, log, "group already existed");
                Ok(())
            }
            Err(e) => Err(RediMqError::transient("XGROUP CREATE", e)),
        }
    }

    async fn create_consumer(&self, log: &str, group: &str, consumer: &str) -> Result<(), RediMqError> {
        let mut conn = self.pool.get().await?;
        let result: RedisResult<i64> = cmd("XGROUP")
            .arg("CREATECONSUMER")
            .arg(log)
            .arg(group)
            .arg(consumer)
            .query_async(&mut conn)
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("NOGROUP") => Err(RediMqError::protocol(
                "XGROUP CREATECONSUMER",
                format!("group '{group}' does not exist on '{log}'"),
            )),
            Err(e) => Err(RediMqError::transient("XGROUP CREATECONSUMER", e)),
        }
    }

    async fn delete_consumer(&self, log: &str, group: &str, consumer: &str) -> Result<(), RediMqError> {
        let mut conn = self.pool.get().await?;
        let result: RedisResult<i64> = cmd("XGROUP")
            .arg("DELCONSUMER")
            .arg(log)
            .arg(group)
            .arg(consumer)
            .query_async(&mut conn)
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("NOGROUP") => Ok(()),
            Err(e) => Err(RediMqError::transient("XGROUP DELCONSUMER", e)),
        }
    }

    async fn ack(&self, log: &str, group: &str, id: &str) -> Result<bool, RediMqError> {
        let mut conn = self.pool.get().await?;
        let acked: i64 = cmd("XACK")
            .arg(log)
            .arg(group)
            .arg(id)
            .query_async(&mut conn)
            .await?;
        Ok(acked > 0)
    }

    async fn length(&self, log: &str) -> Result<u64, RediMqError> {
        let mut conn = self.pool.get().await?;
        let len: u64 = cmd("XLEN").arg(log).query_async(&mut conn).await?;
        Ok(len)
    }

    async fn range(&self, log: &str, from: &str, to: &str) -> Result<Vec<(String, Fields)>, RediMqError> {
        let mut conn = self.pool.get().await?;
        let value: RedisValue = cmd("XRANGE")
            .arg(log)
            .arg(from)
            .arg(to)
            .query_async(&mut conn)
            .await?;
        Ok(parse_entries(value))
    }

    async fn consumers(&self, log: &str, group: &str) -> Result<Vec<ConsumerInfo>, RediMqError> {
        let mut conn = self.pool.get().await?;
        let result: RedisResult<RedisValue> = cmd("XINFO")
            .arg("CONSUMERS")
            .arg(log)
            .arg(group)
            .query_async(&mut conn)
            .await;
        let value = match result {
            Ok(v) => v,
            Err(e) if e.to_string().contains("NOGROUP") => return Ok(vec![]),
            Err(e) => return Err(RediMqError::transient("XINFO CONSUMERS", e)),
        };
        let RedisValue::Array(entries) = value else {
            return Ok(vec![]);
        };
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            let RedisValue::Array(kvs) = entry else {
                continue;
            };
            let mut name = None;
            let mut pending_count = 0u64;
            let mut idle_ms = 0u64;
            let mut iter = kvs.iter();
            while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
                match bulk_string(k).as_deref() {
                    Some("name") => name = bulk_string(v),
                    Some("pending") => {
                        if let RedisValue::Int(n) = v {
                            pending_count = *n as u64;
                        }
                    }
                    Some("idle") => {
                        if let RedisValue::Int(n) = v {
                            idle_ms = *n as u64;
                        }
                    }
                    _ => {}
                }
            }
            if let Some(name) = name {
                out.push(ConsumerInfo {
                    name,
                    pending_count,
                    idle_ms,
                });
            }
        }
        Ok(out)
    }

    async fn del(&self, log: &str, id: &str) -> Result<(), RediMqError> {
        let mut conn = self.pool.get().await?;
        let _: i64 = cmd("XDEL").arg(log).arg(id).query_async(&mut conn).await?;
        Ok(())
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool, RediMqError> {
        let mut conn = self.pool.get().await?;
        let added: i64 = cmd("SADD").arg(key).arg(member).query_async(&mut conn).await?;
        Ok(added == 1)
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), RediMqError> {
        let mut conn = self.pool.get().await?;
        let _: i64 = cmd("SREM").arg(key).arg(member).query_async(&mut conn).await?;
        Ok(())
    }

    async fn set_is_member(&self, key: &str, member: &str) -> Result<bool, RediMqError> {
        let mut conn = self.pool.get().await?;
        let is_member: bool = cmd("SISMEMBER")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(is_member)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, RediMqError> {
        let mut conn = self.pool.get().await?;
        let members: Vec<String> = cmd("SMEMBERS").arg(key).query_async(&mut conn).await?;
        Ok(members)
    }

    async fn set_scan(
        &self,
        key: &str,
        pattern: &str,
        count: usize,
        cursor: u64,
    ) -> Result<(Vec<String>, u64), RediMqError> {
        let mut conn = self.pool.get().await?;
        let (next_cursor, members): (u64, Vec<String>) = cmd("SSCAN")
            .arg(key)
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await?;
        Ok((members, next_cursor))
    }

    async fn key_delete(&self, key: &str) -> Result<(), RediMqError> {
        let mut conn = self.pool.get().await?;
        let _: i64 = cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), RediMqError> {
        let mut conn = self.pool.get().await?;
        let _: i64 = cmd("EXPIRE")
            .arg(key)
            .arg(ttl.as_secs())
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn eval_publish_to_grouped_topic(
        &self,
        set_key: &str,
        registry_log: &str,
        group_key: &str,
    ) -> Result<(), RediMqError> {
        let mut conn = self.pool.get().await?;
        let _: String = scripts::PUBLISH_TO_GROUPED_TOPIC
            .key(set_key)
            .key(registry_log)
            .arg(group_key)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| RediMqError::transient("publish-to-grouped-topic script", e))?;
        Ok(())
    }

    async fn eval_reclaim_message_groups(
        &self,
        registry_log: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<(String, String)>, RediMqError> {
        let mut conn = self.pool.get().await?;
        let value: RedisValue = scripts::RECLAIM_MESSAGE_GROUPS
            .key(registry_log)
            .arg(group)
            .arg(consumer)
            .arg(count)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| RediMqError::transient("reclaim-message-groups script", e))?;
        let entries = parse_entries(value);
        Ok(entries
            .into_iter()
            .filter_map(|(id, fields)| fields.get("key").cloned().map(|k| (id, k)))
            .collect())
    }

    async fn eval_delete_empty_group(
        &self,
        registry_log: &str,
        per_group_log: &str,
        registry_id: &str,
    ) -> Result<bool, RediMqError> {
        let mut conn = self.pool.get().await?;
        let deleted: i64 = scripts::DELETE_EMPTY_GROUP
            .key(registry_log)
            .key(per_group_log)
            .arg(registry_id)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| RediMqError::transient("delete-empty-group script", e))?;
        Ok(deleted == 1)
    }
}
