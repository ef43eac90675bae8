//! Client & Registry (§4.6): topic/grouped-topic construction plus the
//! well-known registry sets every created topic is added to.

use std::sync::Arc;

use crate::config::TopicOptions;
use crate::consumer::{Consumer, Handler};
use crate::driver::redis::RedisDriver;
use crate::driver::StoreDriver;
use crate::error::RediMqError;
use crate::grouped_topic::GroupedTopic;
use crate::message::Message;
use crate::topic::UnorderedTopic;

/// Unordered topic registry set (§6).
const UNORDERED_REGISTRY: &str = "redimq:umts";
/// Grouped topic registry set (§6).
const GROUPED_REGISTRY: &str = "redimq:gmts";

/// Entry point: constructs topics, grouped topics, and consumers, all
/// sharing one [`StoreDriver`].
#[derive(Clone)]
pub struct Client {
    driver: Arc<dyn StoreDriver>,
}

impl Client {
    /// Connect to `redis_url` and build a client backed by a real Redis
    /// Streams store.
    pub async fn connect(redis_url: &str) -> Result<Self, RediMqError> {
        let driver = RedisDriver::connect(redis_url).await?;
        Ok(Client::with_driver(Arc::new(driver)))
    }

    /// Build a client around any [`StoreDriver`] — the real Redis adapter,
    /// the in-memory mock, or an embedder's own implementation.
    pub fn with_driver(driver: Arc<dyn StoreDriver>) -> Self {
        Client { driver }
    }

    /// Create (or reopen a handle to) an unordered topic, registering its
    /// name in the `redimq:umts` set.
    #[tracing::instrument(skip(self, options), fields(topic = name))]
    pub async fn new_topic(&self, name: &str, options: TopicOptions) -> Result<UnorderedTopic, RediMqError> {
        self.driver.set_add(UNORDERED_REGISTRY, name).await?;
        Ok(UnorderedTopic::new(Arc::clone(&self.driver), name.to_string(), options))
    }

    /// Create (or reopen a handle to) a grouped topic, registering its name
    /// in the `redimq:gmts` set.
    #[tracing::instrument(skip(self, options), fields(topic = name))]
    pub async fn new_grouped_topic(&self, name: &str, options: TopicOptions) -> Result<GroupedTopic, RediMqError> {
        self.driver.set_add(GROUPED_REGISTRY, name).await?;
        Ok(GroupedTopic::new(Arc::clone(&self.driver), name.to_string(), options))
    }

    /// Names of every unordered topic ever created against this store.
    pub async fn get_all_topics(&self) -> Result<Vec<String>, RediMqError> {
        self.driver.set_members(UNORDERED_REGISTRY).await
    }

    /// Names of every grouped topic ever created against this store.
    pub async fn get_all_grouped_topics(&self) -> Result<Vec<String>, RediMqError> {
        self.driver.set_members(GROUPED_REGISTRY).await
    }

    /// Paginated scan over the unordered-topic registry. Returns
    /// `(matches, next_cursor)`; a `next_cursor` of 0 means the scan has
    /// wrapped back to the start (§4.6).
    pub async fn find_topics(&self, pattern: &str, count: usize, cursor: u64) -> Result<(Vec<String>, u64), RediMqError> {
        self.driver.set_scan(UNORDERED_REGISTRY, pattern, count, cursor).await
    }

    /// As [`Self::find_topics`], over the grouped-topic registry.
    pub async fn find_grouped_topics(
        &self,
        pattern: &str,
        count: usize,
        cursor: u64,
    ) -> Result<(Vec<String>, u64), RediMqError> {
        self.driver.set_scan(GROUPED_REGISTRY, pattern, count, cursor).await
    }

    /// Build a consumer in `group` named `name` that dispatches received
    /// messages to `handler`.
    pub fn new_consumer<F, Fut>(&self, group: &str, name: &str, handler: F) -> Arc<Consumer>
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), RediMqError>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |m| Box::pin(handler(m)));
        Consumer::with_handler(group.to_string(), name.to_string(), handler)
    }

    /// Build a consumer in `group` named `name` with no handler: received
    /// messages are delivered through the returned stream instead (restored
    /// from `original_source/consumer.go`'s channel-fallback mode).
    pub fn new_channel_consumer(&self, group: &str, name: &str) -> (Arc<Consumer>, impl futures::Stream<Item = Message>) {
        Consumer::with_channel(group.to_string(), name.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::mock::MockDriver;

    fn client() -> Client {
        Client::with_driver(Arc::new(MockDriver::new()))
    }

    #[tokio::test]
    async fn new_topic_registers_name_in_registry_set() {
        let c = client();
        c.new_topic("orders", TopicOptions::default()).await.unwrap();
        c.new_topic("shipments", TopicOptions::default()).await.unwrap();

        let mut names = c.get_all_topics().await.unwrap();
        names.sort();
        assert_eq!(names, vec!["orders".to_string(), "shipments".to_string()]);
    }

    #[tokio::test]
    async fn new_grouped_topic_registers_name_separately_from_topics() {
        let c = client();
        c.new_topic("orders", TopicOptions::default()).await.unwrap();
        c.new_grouped_topic("orders", TopicOptions::default()).await.unwrap();

        assert_eq!(c.get_all_topics().await.unwrap(), vec!["orders".to_string()]);
        assert_eq!(c.get_all_grouped_topics().await.unwrap(), vec!["orders".to_string()]);
    }

    #[tokio::test]
    async fn unordered_publish_then_consume_round_trips() {
        let c = client();
        let topic = c.new_topic("orders", TopicOptions::default()).await.unwrap();

        let mut data = crate::driver::Fields::new();
        data.insert("foo".to_string(), "a".to_string());
        topic.publish(data.clone()).await.unwrap();

        let messages = topic.consume("g", "c1", 1).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].data, data);
        assert!(!messages[0].id.is_empty());
    }
}
