//! Unordered Topic Engine (§4.3): fan-out publish and competing-consumer
//! pull with idle-reclaim.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::driver::{Fields, StoreDriver, TrimHint};
use crate::error::RediMqError;
use crate::message::{Message, ReceiptContext};
use crate::config::TopicOptions;

fn min_id_timestamp_ms(retention: Duration) -> i64 {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    now.saturating_sub(retention).as_millis() as i64
}

/// A handle identifying one log by name. Competing consumers in the same
/// consumer group receive disjoint messages; there is no ordering guarantee.
pub struct UnorderedTopic {
    driver: Arc<dyn StoreDriver>,
    /// `redimq:umts:<name>`.
    pub stream_key: String,
    pub name: String,
    pub options: TopicOptions,
}

impl UnorderedTopic {
    pub(crate) fn new(driver: Arc<dyn StoreDriver>, name: String, options: TopicOptions) -> Self {
        UnorderedTopic {
            driver,
            stream_key: format!("redimq:umts:{name}"),
            name,
            options,
        }
    }

    /// Append `data` to the topic's log, applying any configured retention
    /// or max-length trimming hints.
    #[tracing::instrument(skip(self, data), fields(topic = %self.name))]
    pub async fn publish(&self, data: Fields) -> Result<Message, RediMqError> {
        let hint = TrimHint {
            approx_max_len: self.options.max_length,
        };
        let min_id = self.options.max_retention.map(min_id_timestamp_ms);
        let id = self
            .driver
            .append_bounded(&self.stream_key, &data, hint, min_id)
            .await?;
        Ok(Message::published(id, None, data))
    }

    /// Two-phase pull (§4.3): first reclaim entries idle past the topic's
    /// `max_idle_time_for_messages`, then fill any remaining budget with
    /// newly-delivered entries. Returns reclaimed messages first, then new.
    #[tracing::instrument(skip(self), fields(topic = %self.name, group, consumer, count))]
    pub async fn consume(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<Message>, RediMqError> {
        self.driver.create_group(&self.stream_key, group, "0").await?;
        self.driver.create_consumer(&self.stream_key, group, consumer).await?;

        let idle_ms = self.options.max_idle_time_for_messages.as_millis() as u64;

        let stuck = self
            .driver
            .pending(&self.stream_key, group, count, Some(idle_ms), None)
            .await?;
        let stuck_ids: Vec<String> = stuck.into_iter().map(|p| p.id).collect();
        let reclaimed = if stuck_ids.is_empty() {
            vec![]
        } else {
            self.driver
                .claim(&self.stream_key, group, consumer, idle_ms, &stuck_ids)
                .await?
        };

        let mut messages: Vec<Message> = reclaimed
            .into_iter()
            .map(|(id, fields)| self.to_message(id, fields, group, consumer))
            .collect();

        let remaining = count.saturating_sub(messages.len());
        if remaining > 0 {
            let fresh = self
                .driver
                .read_new(&self.stream_key, group, consumer, remaining)
                .await?;
            messages.extend(
                fresh
                    .into_iter()
                    .map(|(id, fields)| self.to_message(id, fields, group, consumer)),
            );
        }

        Ok(messages)
    }

    fn to_message(&self, id: String, fields: Fields, group: &str, consumer: &str) -> Message {
        Message::received(
            id,
            None,
            fields,
            consumer.to_string(),
            ReceiptContext {
                driver: Arc::clone(&self.driver),
                log: self.stream_key.clone(),
                group: group.to_string(),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::mock::MockDriver;
    use std::time::Duration as StdDuration;

    fn topic() -> UnorderedTopic {
        UnorderedTopic::new(Arc::new(MockDriver::new()), "orders".to_string(), TopicOptions::default())
    }

    #[tokio::test]
    async fn publish_then_consume_round_trips_payload() {
        let t = topic();
        let mut data = Fields::new();
        data.insert("foo".into(), "a".into());
        t.publish(data.clone()).await.unwrap();

        let msgs = t.consume("g", "c1", 1).await.unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].data, data);
        assert!(!msgs[0].id.is_empty());
    }

    #[tokio::test]
    async fn idle_message_is_reclaimed_by_another_consumer() {
        let mut opts = TopicOptions::default();
        opts.max_idle_time_for_messages = StdDuration::from_millis(50);
        let t = UnorderedTopic::new(Arc::new(MockDriver::new()), "orders".to_string(), opts);

        t.publish(Fields::new()).await.unwrap();
        let first = t.consume("g", "c1", 1).await.unwrap();
        assert_eq!(first.len(), 1);

        tokio::time::sleep(StdDuration::from_millis(80)).await;

        let second = t.consume("g", "c2", 1).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id, first[0].id);
    }

    #[tokio::test]
    async fn ack_is_idempotent() {
        let t = topic();
        t.publish(Fields::new()).await.unwrap();
        let msgs = t.consume("g", "c1", 1).await.unwrap();

        assert!(msgs[0].acknowledge().await.unwrap());
        assert!(msgs[0].acknowledge().await.is_err());
    }
}
