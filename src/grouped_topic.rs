//! Grouped Topic Engine (§4.4) — the core of the crate.
//!
//! Messages are published under a `group_key`; delivery is strictly ordered
//! within a key and unordered across keys. A *registry log* holds one entry
//! per known `group_key`; claiming a registry entry is how a consumer
//! acquires the lock that lets it read the corresponding per-group log.
//! There is no explicit unlock — locks rotate between consumers purely by
//! idle-timeout reclaim (see the state machine in SPEC_FULL.md §4.4.6).

use std::sync::Arc;

use crate::config::TopicOptions;
use crate::driver::{Fields, StoreDriver};
use crate::error::RediMqError;
use crate::message::{Message, ReceiptContext};

/// A handle identifying one grouped topic by name.
pub struct GroupedTopic {
    driver: Arc<dyn StoreDriver>,
    /// `redimq:gmts:<name>:message-groups`.
    registry_log: String,
    /// `redimq:gmts:<name>:messagegroupset`.
    registry_set: String,
    pub name: String,
    pub options: TopicOptions,
}

/// A registry entry claimed during lock acquisition: its id on the registry
/// log, and the `group_key` it names.
struct Lock {
    registry_id: String,
    group_key: String,
}

impl GroupedTopic {
    pub(crate) fn new(driver: Arc<dyn StoreDriver>, name: String, options: TopicOptions) -> Self {
        GroupedTopic {
            driver,
            registry_log: format!("redimq:gmts:{name}:message-groups"),
            registry_set: format!("redimq:gmts:{name}:messagegroupset"),
            name,
            options,
        }
    }

    fn per_group_log(&self, group_key: &str) -> String {
        format!("redimq:gmts:{}:mg:{group_key}:messages", self.name)
    }

    /// Register `group_key` if new, then unconditionally append `data` to its
    /// per-group log (§4.4.1). A crash between the two leaves a registry
    /// entry with no message yet — benign, see DESIGN.md.
    #[tracing::instrument(skip(self, data), fields(topic = %self.name, group_key))]
    pub async fn publish(&self, group_key: &str, data: Fields) -> Result<Message, RediMqError> {
        self.driver
            .eval_publish_to_grouped_topic(&self.registry_set, &self.registry_log, group_key)
            .await?;

        let log = self.per_group_log(group_key);
        let id = self.driver.append(&log, &data).await?;
        if let Some(ttl) = self.options.max_retention {
            self.driver.expire(&log, ttl).await?;
        }
        Ok(Message::published(id, Some(group_key.to_string()), data))
    }

    /// Acquire up to `N` message-group locks and deliver one message per
    /// locked group (§4.4.3–§4.4.4).
    #[tracing::instrument(skip(self), fields(topic = %self.name, group, consumer))]
    pub async fn consume(&self, group: &str, consumer: &str) -> Result<Vec<Message>, RediMqError> {
        let locks = self.acquire_locks(group, consumer).await?;
        let mut messages = Vec::with_capacity(locks.len());
        for lock in locks {
            if let Some(m) = self.deliver(group, consumer, &lock, 1).await?.into_iter().next() {
                messages.push(m);
            }
        }
        Ok(messages)
    }

    /// As [`Self::consume`], but reads up to `batch_size` messages per locked
    /// group instead of one. Returns one batch (possibly empty) per lock;
    /// empty batches are omitted.
    #[tracing::instrument(skip(self), fields(topic = %self.name, group, consumer, batch_size))]
    pub async fn consume_in_batches(
        &self,
        group: &str,
        consumer: &str,
        batch_size: usize,
    ) -> Result<Vec<Vec<Message>>, RediMqError> {
        let locks = self.acquire_locks(group, consumer).await?;
        let mut batches = Vec::with_capacity(locks.len());
        for lock in locks {
            let batch = self.deliver(group, consumer, &lock, batch_size).await?;
            if !batch.is_empty() {
                batches.push(batch);
            }
        }
        Ok(batches)
    }

    /// §4.4.2 partition sizing followed by §4.4.3 three-tier acquisition.
    async fn acquire_locks(&self, group: &str, consumer: &str) -> Result<Vec<Lock>, RediMqError> {
        self.driver.create_group(&self.registry_log, group, "0").await?;
        self.driver.create_consumer(&self.registry_log, group, consumer).await?;

        let idle_threshold_ms = self.options.max_idle_time_for_messages.as_millis() as u64;
        let consumers = self.driver.consumers(&self.registry_log, group).await?;
        let healthy_others = consumers
            .iter()
            .filter(|c| c.idle_ms < idle_threshold_ms)
            .count();
        let caller_already_counted = consumers
            .iter()
            .any(|c| c.name == consumer && c.idle_ms < idle_threshold_ms);
        let c = healthy_others + if caller_already_counted { 0 } else { 1 };

        let g = self.driver.length(&self.registry_log).await?;
        if g == 0 {
            return Ok(vec![]);
        }
        let n = ((g as usize) + c - 1) / c.max(1);

        let mut locks = Vec::with_capacity(n);

        // Tier R: reclaim own.
        let reclaimed = self
            .driver
            .eval_reclaim_message_groups(&self.registry_log, group, consumer, n)
            .await?;
        locks.extend(reclaimed.into_iter().map(|(registry_id, group_key)| Lock {
            registry_id,
            group_key,
        }));

        // Tier N: read new.
        if locks.len() < n {
            let remaining = n - locks.len();
            let fresh = self
                .driver
                .read_new(&self.registry_log, group, consumer, remaining)
                .await?;
            locks.extend(fresh.into_iter().filter_map(|(id, fields)| {
                fields.get("key").map(|key| Lock {
                    registry_id: id,
                    group_key: key.clone(),
                })
            }));
        }

        // Tier S: steal stuck.
        if locks.len() < n {
            let remaining = n - locks.len();
            let stuck = self
                .driver
                .pending(&self.registry_log, group, remaining, Some(idle_threshold_ms), None)
                .await?;
            let ids: Vec<String> = stuck.into_iter().map(|p| p.id).collect();
            if !ids.is_empty() {
                let stolen = self
                    .driver
                    .claim(&self.registry_log, group, consumer, idle_threshold_ms, &ids)
                    .await?;
                locks.extend(stolen.into_iter().filter_map(|(id, fields)| {
                    fields.get("key").map(|key| Lock {
                        registry_id: id,
                        group_key: key.clone(),
                    })
                }));
            }
        }

        Ok(locks)
    }

    /// §4.4.4 per-group delivery: try a stuck message first, then a new one,
    /// up to `count` total.
    async fn deliver(
        &self,
        group: &str,
        consumer: &str,
        lock: &Lock,
        count: usize,
    ) -> Result<Vec<Message>, RediMqError> {
        let log = self.per_group_log(&lock.group_key);
        self.driver.create_group(&log, group, "0").await?;
        self.driver.create_consumer(&log, group, consumer).await?;

        let idle_ms = self.options.max_idle_time_for_messages.as_millis() as u64;
        let stuck = self.driver.pending(&log, group, count, Some(idle_ms), None).await?;
        let stuck_ids: Vec<String> = stuck.into_iter().map(|p| p.id).collect();
        let mut entries = if stuck_ids.is_empty() {
            vec![]
        } else {
            self.driver.claim(&log, group, consumer, idle_ms, &stuck_ids).await?
        };

        let remaining = count.saturating_sub(entries.len());
        if remaining > 0 {
            let fresh = self.driver.read_new(&log, group, consumer, remaining).await?;
            entries.extend(fresh);
        }

        Ok(entries
            .into_iter()
            .map(|(id, fields)| self.to_message(id, &lock.group_key, &log, group, consumer, fields))
            .collect())
    }

    fn to_message(
        &self,
        id: String,
        group_key: &str,
        log: &str,
        group: &str,
        consumer: &str,
        fields: Fields,
    ) -> Message {
        Message::received(
            id,
            Some(group_key.to_string()),
            fields,
            consumer.to_string(),
            ReceiptContext {
                driver: Arc::clone(&self.driver),
                log: log.to_string(),
                group: group.to_string(),
            },
        )
    }

    /// §4.4.5: reclaim long-stuck registry entries into a pseudo-consumer,
    /// drop the ones whose per-group log is now empty, and prune healthy but
    /// lock-less consumers so they stop inflating the partition denominator.
    #[tracing::instrument(skip(self), fields(topic = %self.name, group))]
    pub async fn cleanup(&self, group: &str) -> Result<(), RediMqError> {
        let retention_ms = self
            .options
            .max_retention
            .unwrap_or(self.options.max_idle_time_for_messages)
            .as_millis() as u64;

        let stuck = self
            .driver
            .pending(&self.registry_log, group, 100, Some(retention_ms), None)
            .await?;
        let ids: Vec<String> = stuck.into_iter().map(|p| p.id).collect();
        if !ids.is_empty() {
            let claimed = self
                .driver
                .claim(&self.registry_log, group, "system", retention_ms, &ids)
                .await?;
            for (registry_id, fields) in claimed {
                if let Some(key) = fields.get("key") {
                    self.driver.del(&self.registry_log, &registry_id).await?;
                    self.driver.set_remove(&self.registry_set, key).await?;
                }
            }
        }

        let idle_threshold_ms = self.options.max_idle_time_for_messages.as_millis() as u64;
        let consumers = self.driver.consumers(&self.registry_log, group).await?;
        for c in consumers {
            if c.pending_count == 0 && c.idle_ms < idle_threshold_ms {
                self.driver.delete_consumer(&self.registry_log, group, &c.name).await?;
            }
        }

        Ok(())
    }

    /// Delete a specific `group_key`'s per-group log and registry entry once
    /// it is known to be empty, via the delete-empty-group script. Exposed
    /// for callers that track emptiness themselves (e.g. after an ack leaves
    /// a per-group log at length 0) rather than waiting for [`Self::cleanup`].
    pub(crate) async fn try_delete_if_empty(
        &self,
        registry_id: &str,
        group_key: &str,
    ) -> Result<bool, RediMqError> {
        let log = self.per_group_log(group_key);
        self.driver
            .eval_delete_empty_group(&self.registry_log, &log, registry_id)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::mock::MockDriver;
    use std::collections::HashMap;
    use std::time::Duration as StdDuration;

    fn fields(k: &str, v: &str) -> Fields {
        let mut f: HashMap<String, String> = HashMap::new();
        f.insert(k.to_string(), v.to_string());
        f
    }

    fn grouped() -> GroupedTopic {
        GroupedTopic::new(Arc::new(MockDriver::new()), "orders".to_string(), TopicOptions::default())
    }

    #[tokio::test]
    async fn per_group_fifo_and_one_message_per_group_per_round() {
        let t = grouped();
        t.publish("k1", fields("i", "1")).await.unwrap();
        t.publish("k1", fields("i", "2")).await.unwrap();
        t.publish("k2", fields("j", "1")).await.unwrap();

        let first = t.consume("g", "c1").await.unwrap();
        assert_eq!(first.len(), 2);
        let by_key: HashMap<_, _> = first
            .iter()
            .map(|m| (m.group_key.clone().unwrap(), m.data.get("i").or_else(|| m.data.get("j")).cloned()))
            .collect();
        assert_eq!(by_key.get("k1").unwrap().as_deref(), Some("1"));
        assert_eq!(by_key.get("k2").unwrap().as_deref(), Some("1"));

        for m in &first {
            m.acknowledge().await.unwrap();
        }

        let second = t.consume("g", "c1").await.unwrap();
        let k1_msg = second.iter().find(|m| m.group_key.as_deref() == Some("k1"));
        assert_eq!(k1_msg.unwrap().data.get("i").map(String::as_str), Some("2"));
    }

    #[tokio::test]
    async fn idle_lock_is_stolen_by_another_consumer() {
        let mut opts = TopicOptions::default();
        opts.max_idle_time_for_messages = StdDuration::from_millis(50);
        let t = GroupedTopic::new(Arc::new(MockDriver::new()), "orders".to_string(), opts);

        t.publish("k1", fields("i", "1")).await.unwrap();
        let first = t.consume("g", "c1").await.unwrap();
        assert_eq!(first.len(), 1);

        tokio::time::sleep(StdDuration::from_millis(80)).await;

        let second = t.consume("g", "c2").await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].group_key.as_deref(), Some("k1"));
    }

    #[tokio::test]
    async fn publish_dedups_registry_entry_per_key() {
        let t = grouped();
        t.publish("k1", fields("i", "1")).await.unwrap();
        t.publish("k1", fields("i", "2")).await.unwrap();

        let locks = t.acquire_locks("g", "c1").await.unwrap();
        assert_eq!(locks.len(), 1);
    }

    #[tokio::test]
    async fn cleanup_drops_registry_entry_once_reclaimed_past_retention() {
        let mut opts = TopicOptions::default();
        opts.max_retention = Some(StdDuration::from_millis(30));
        let t = GroupedTopic::new(Arc::new(MockDriver::new()), "orders".to_string(), opts);

        t.publish("k1", fields("i", "1")).await.unwrap();
        let locks = t.acquire_locks("g", "c1").await.unwrap();
        assert_eq!(locks.len(), 1);

        tokio::time::sleep(StdDuration::from_millis(50)).await;
        t.cleanup("g").await.unwrap();

        let remaining = t.driver.length(&t.registry_log).await.unwrap();
        assert_eq!(remaining, 0);
    }

    #[tokio::test]
    async fn consume_in_batches_returns_multiple_messages_per_group() {
        let t = grouped();
        for i in 0..3 {
            t.publish("k1", fields("i", &i.to_string())).await.unwrap();
        }

        let batches = t.consume_in_batches("g", "c1", 10).await.unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 3);
    }
}
