//! In-memory [`StoreDriver`] used by this crate's own tests (see §8 of
//! SPEC_FULL.md) to exercise the locking/partitioning algorithm
//! deterministically, without a live Redis server.
//!
//! Grounded on the recorded-calls mock idiom in
//! `PostHog-posthog/rust/common/redis/src/mock.rs` (`MockRedisClient`) and on
//! the teacher's own `server/src/data/topics/memory.rs` in-process backend.
//! Trimming (`TrimHint`, `expire`) and `SSCAN` pagination are deliberately
//! simplified — single page, no eviction — since the properties under test
//! never depend on either.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::RediMqError;

use super::{ConsumerInfo, Fields, PendingEntry, StoreDriver, TrimHint};

#[derive(Clone)]
struct LogEntry {
    id: String,
    fields: Fields,
}

struct PendingState {
    owner: String,
    delivered_at: Instant,
    deliveries: u64,
}

#[derive(Default)]
struct GroupState {
    next_unread: usize,
    pending: HashMap<String, PendingState>,
    consumer_last_active: HashMap<String, Instant>,
}

#[derive(Default)]
struct Log {
    entries: Vec<LogEntry>,
    next_seq: u64,
    groups: HashMap<String, GroupState>,
}

impl Log {
    fn next_id(&mut self) -> String {
        self.next_seq += 1;
        format!("{}-0", self.next_seq)
    }

    fn index_of(&self, id: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.id == id)
    }
}

#[derive(Default)]
struct State {
    logs: HashMap<String, Log>,
    sets: HashMap<String, HashSet<String>>,
}

/// A fully in-process store driver. Cheap to clone; all instances share the
/// same underlying state.
#[derive(Clone, Default)]
pub struct MockDriver {
    state: Arc<Mutex<State>>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn touch_consumer(group: &mut GroupState, consumer: &str) {
        group.consumer_last_active.insert(consumer.to_string(), Instant::now());
    }
}

fn idle_ms(since: Instant) -> u64 {
    Instant::now().saturating_duration_since(since).as_millis() as u64
}

#[async_trait]
impl StoreDriver for MockDriver {
    async fn append(&self, log: &str, fields: &Fields) -> Result<String, RediMqError> {
        let mut state = self.state.lock();
        let entry = state.logs.entry(log.to_string()).or_default();
        let id = entry.next_id();
        entry.entries.push(LogEntry {
            id: id.clone(),
            fields: fields.clone(),
        });
        Ok(id)
    }

    async fn append_bounded(
        &self,
        log: &str,
        fields: &Fields,
        _hint: TrimHint,
        _min_id_timestamp_ms: Option<i64>,
    ) -> Result<String, RediMqError> {
        self.append(log, fields).await
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
        let mut state = self.state.lock();
        let Some(l) = state.logs.get_mut(log) else {
            return Ok(vec![]);
        };
        let Some(g) = l.groups.get_mut(group) else {
            return Err(RediMqError::protocol("read_new", format!("no group '{group}' on '{log}'")));
        };
        let available = &l.entries[g.next_unread.min(l.entries.len())..];
        let take = available.len().min(count);
        let mut out = Vec::with_capacity(take);
        for entry in &available[..take] {
            g.pending.insert(
                entry.id.clone(),
                PendingState {
                    owner: consumer.to_string(),
                    delivered_at: Instant::now(),
                    deliveries: 1,
                },
            );
            out.push((entry.id.clone(), entry.fields.clone()));
        }
        g.next_unread += take;
        MockDriver::touch_consumer(g, consumer);
        Ok(out)
    }

    async fn pending(
        &self,
        log: &str,
        group: &str,
        count: usize,
        idle_ge_ms: Option<u64>,
        consumer: Option<&str>,
    ) -> Result<Vec<PendingEntry>, RediMqError> {
        let state = self.state.lock();
        let Some(l) = state.logs.get(log) else {
            return Ok(vec![]);
        };
        let Some(g) = l.groups.get(group) else {
            return Ok(vec![]);
        };
        let mut entries: Vec<_> = g
            .pending
            .iter()
            .filter(|(_, p)| consumer.map(|c| p.owner == c).unwrap_or(true))
            .filter(|(_, p)| idle_ge_ms.map(|min| idle_ms(p.delivered_at) >= min).unwrap_or(true))
            .map(|(id, p)| PendingEntry {
                id: id.clone(),
                owner: p.owner.clone(),
                idle_ms: idle_ms(p.delivered_at),
                deliveries: p.deliveries,
            })
            .collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries.truncate(count);
        Ok(entries)
    }

    async fn claim(
        &self,
        log: &str,
        group: &str,
        new_consumer: &str,
        min_idle_ms: u64,
        ids: &[String],
    ) -> Result<Vec<(String, Fields)>, RediMqError> {
        let mut state = self.state.lock();
        let Some(l) = state.logs.get_mut(log) else {
            return Ok(vec![]);
        };
        let entries = l.entries.clone();
        let Some(g) = l.groups.get_mut(group) else {
            return Ok(vec![]);
        };
        let mut out = vec![];
        for id in ids {
            let eligible = g
                .pending
                .get(id)
                .map(|p| idle_ms(p.delivered_at) >= min_idle_ms)
                .unwrap_or(false);
            if !eligible {
                continue;
            }
            g.pending.insert(
                id.clone(),
                PendingState {
                    owner: new_consumer.to_string(),
                    delivered_at: Instant::now(),
                    deliveries: g.pending.get(id).map(|p| p.deliveries + 1).unwrap_or(1),
                },
            );
            if let Some(entry) = entries.iter().find(|e| &e.id == id) {
                out.push((entry.id.clone(), entry.fields.clone()));
            }
        }
        MockDriver::touch_consumer(g, new_consumer);
        Ok(out)
    }

    async fn create_group(&self, log: &str, group: &str, start_id: &str) -> Result<(), RediMqError> {
        let mut state = self.state.lock();
        let l = state.logs.entry(log.to_string()).or_default();
        let skip = if start_id == "0" || start_id == "0-0" {
            0
        } else {
            l.entries.len()
        };
        l.groups.entry(group.to_string()).or_insert_with(|| GroupState {
            next_unread: skip,
            ..Default::default()
        });
        Ok(())
    }

    async fn create_consumer(&self, log: &str, group: &str, consumer: &str) -> Result<(), RediMqError> {
        let mut state = self.state.lock();
        let Some(l) = state.logs.get_mut(log) else {
            return Err(RediMqError::protocol("create_consumer", format!("no log '{log}'")));
        };
        let Some(g) = l.groups.get_mut(group) else {
            return Err(RediMqError::protocol(
                "create_consumer",
                format!("no group '{group}' on '{log}'"),
            ));
        };
        g.consumer_last_active.entry(consumer.to_string()).or_insert_with(Instant::now);
        Ok(())
    }

    async fn delete_consumer(&self, log: &str, group: &str, consumer: &str) -> Result<(), RediMqError> {
        let mut state = self.state.lock();
        if let Some(l) = state.logs.get_mut(log) {
            if let Some(g) = l.groups.get_mut(group) {
                g.consumer_last_active.remove(consumer);
                g.pending.retain(|_, p| p.owner != consumer);
            }
        }
        Ok(())
    }

    async fn ack(&self, log: &str, group: &str, id: &str) -> Result<bool, RediMqError> {
        let mut state = self.state.lock();
        let Some(l) = state.logs.get_mut(log) else {
            return Ok(false);
        };
        let Some(g) = l.groups.get_mut(group) else {
            return Ok(false);
        };
        Ok(g.pending.remove(id).is_some())
    }

    async fn length(&self, log: &str) -> Result<u64, RediMqError> {
        let state = self.state.lock();
        Ok(state.logs.get(log).map(|l| l.entries.len() as u64).unwrap_or(0))
    }

    async fn range(&self, log: &str, from: &str, to: &str) -> Result<Vec<(String, Fields)>, RediMqError> {
        let state = self.state.lock();
        let Some(l) = state.logs.get(log) else {
            return Ok(vec![]);
        };
        let lo = if from == "-" { None } else { Some(from.to_string()) };
        let hi = if to == "+" { None } else { Some(to.to_string()) };
        Ok(l.entries
            .iter()
            .filter(|e| lo.as_ref().map(|lo| &e.id >= lo).unwrap_or(true))
            .filter(|e| hi.as_ref().map(|hi| &e.id <= hi).unwrap_or(true))
            .map(|e| (e.id.clone(), e.fields.clone()))
            .collect())
    }

    async fn consumers(&self, log: &str, group: &str) -> Result<Vec<ConsumerInfo>, RediMqError> {
        let state = self.state.lock();
        let Some(l) = state.logs.get(log) else {
            return Ok(vec![]);
        };
        let Some(g) = l.groups.get(group) else {
            return Ok(vec![]);
        };
        Ok(g.consumer_last_active
            .iter()
            .map(|(name, last_active)| ConsumerInfo {
                name: name.clone(),
                pending_count: g.pending.values().filter(|p| &p.owner == name).count() as u64,
                idle_ms: idle_ms(*last_active),
            })
            .collect())
    }

    async fn del(&self, log: &str, id: &str) -> Result<(), RediMqError> {
        let mut state = self.state.lock();
        if let Some(l) = state.logs.get_mut(log) {
            if let Some(idx) = l.index_of(id) {
                l.entries.remove(idx);
            }
            for g in l.groups.values_mut() {
                g.pending.remove(id);
            }
        }
        Ok(())
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool, RediMqError> {
        let mut state = self.state.lock();
        Ok(state.sets.entry(key.to_string()).or_default().insert(member.to_string()))
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), RediMqError> {
        let mut state = self.state.lock();
        if let Some(set) = state.sets.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn set_is_member(&self, key: &str, member: &str) -> Result<bool, RediMqError> {
        let state = self.state.lock();
        Ok(state.sets.get(key).map(|s| s.contains(member)).unwrap_or(false))
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, RediMqError> {
        let state = self.state.lock();
        Ok(state.sets.get(key).map(|s| s.iter().cloned().collect()).unwrap_or_default())
    }

    async fn set_scan(
        &self,
        key: &str,
        pattern: &str,
        _count: usize,
        _cursor: u64,
    ) -> Result<(Vec<String>, u64), RediMqError> {
        let members = self.set_members(key).await?;
        let matches = if pattern == "*" {
            members
        } else {
            let needle = pattern.trim_matches('*');
            members.into_iter().filter(|m| m.contains(needle)).collect()
        };
        Ok((matches, 0))
    }

    async fn key_delete(&self, key: &str) -> Result<(), RediMqError> {
        let mut state = self.state.lock();
        state.logs.remove(key);
        state.sets.remove(key);
        Ok(())
    }

    async fn expire(&self, _key: &str, _ttl: Duration) -> Result<(), RediMqError> {
        Ok(())
    }

    async fn eval_publish_to_grouped_topic(
        &self,
        set_key: &str,
        registry_log: &str,
        group_key: &str,
    ) -> Result<(), RediMqError> {
        let added = self.set_add(set_key, group_key).await?;
        if added {
            let mut fields = Fields::new();
            fields.insert("key".to_string(), group_key.to_string());
            self.append(registry_log, &fields).await?;
        }
        Ok(())
    }

    async fn eval_reclaim_message_groups(
        &self,
        registry_log: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<(String, String)>, RediMqError> {
        let mut state = self.state.lock();
        let Some(l) = state.logs.get_mut(registry_log) else {
            return Ok(vec![]);
        };
        let entries = l.entries.clone();
        let Some(g) = l.groups.get_mut(group) else {
            return Ok(vec![]);
        };
        let mut ids: Vec<String> = g.pending.keys().cloned().collect();
        ids.sort();
        ids.truncate(count);
        let mut out = vec![];
        for id in ids {
            g.pending.insert(
                id.clone(),
                PendingState {
                    owner: consumer.to_string(),
                    delivered_at: Instant::now(),
                    deliveries: g.pending.get(&id).map(|p| p.deliveries + 1).unwrap_or(1),
                },
            );
            if let Some(entry) = entries.iter().find(|e| e.id == id) {
                if let Some(key) = entry.fields.get("key") {
                    out.push((id, key.clone()));
                }
            }
        }
        MockDriver::touch_consumer(g, consumer);
        Ok(out)
    }

    async fn eval_delete_empty_group(
        &self,
        registry_log: &str,
        per_group_log: &str,
        registry_id: &str,
    ) -> Result<bool, RediMqError> {
        let len = self.length(per_group_log).await?;
        if len != 0 {
            return Ok(false);
        }
        self.del(registry_log, registry_id).await?;
        self.key_delete(per_group_log).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_then_read_new_delivers_once() {
        let driver = MockDriver::new();
        driver.create_group("log", "g", "0").await.unwrap();
        let mut fields = Fields::new();
        fields.insert("a".into(), "1".into());
        driver.append("log", &fields).await.unwrap();

        let first = driver.read_new("log", "g", "c1", 10).await.unwrap();
        assert_eq!(first.len(), 1);
        let second = driver.read_new("log", "g", "c1", 10).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn ack_removes_from_pending() {
        let driver = MockDriver::new();
        driver.create_group("log", "g", "0").await.unwrap();
        driver.append("log", &Fields::new()).await.unwrap();
        let delivered = driver.read_new("log", "g", "c1", 1).await.unwrap();
        let (id, _) = &delivered[0];

        assert!(driver.ack("log", "g", id).await.unwrap());
        assert!(!driver.ack("log", "g", id).await.unwrap());
    }

    #[tokio::test]
    async fn claim_respects_min_idle() {
        let driver = MockDriver::new();
        driver.create_group("log", "g", "0").await.unwrap();
        driver.append("log", &Fields::new()).await.unwrap();
        let delivered = driver.read_new("log", "g", "c1", 1).await.unwrap();
        let (id, _) = delivered[0].clone();

        let claimed = driver.claim("log", "g", "c2", 10_000, &[id.clone()]).await.unwrap();
        assert!(claimed.is_empty());

        let claimed = driver.claim("log", "g", "c2", 0, &[id]).await.unwrap();
        assert_eq!(claimed.len(), 1);
    }

    #[tokio::test]
    async fn publish_to_grouped_topic_dedups_registry() {
        let driver = MockDriver::new();
        driver.eval_publish_to_grouped_topic("set", "registry", "k1").await.unwrap();
        driver.eval_publish_to_grouped_topic("set", "registry", "k1").await.unwrap();
        assert_eq!(driver.length("registry").await.unwrap(), 1);
    }
}
