//! redimq: a Redis Streams backed message-queue client.
//!
//! Two abstractions sit on top of a single append-only log primitive:
//!
//! - [`UnorderedTopic`]: fan-out publish, competing-consumer pull. No
//!   ordering guarantee; any consumer in a group may receive any message.
//! - [`GroupedTopic`]: messages published under a `group_key` are delivered
//!   in FIFO order *within* that key, while different keys are sharded
//!   across the group's consumers. There is no explicit unlock — a
//!   consumer's claim on a message group rotates to another consumer only
//!   after it sits idle past `max_idle_time_for_messages`.
//!
//! Everything is built on top of a single [`StoreDriver`] trait, so the
//! same engine code runs against a real Redis server
//! ([`driver::redis::RedisDriver`]) or an in-process mock
//! ([`driver::mock::MockDriver`]) for deterministic tests.
//!
//! ```no_run
//! # async fn example() -> Result<(), redimq::RediMqError> {
//! use redimq::{Client, TopicOptions};
//!
//! let client = Client::connect("redis://127.0.0.1/").await?;
//! let topic = client.new_topic("orders", TopicOptions::default()).await?;
//!
//! let mut data = std::collections::HashMap::new();
//! data.insert("amount".to_string(), "42".to_string());
//! topic.publish(data).await?;
//!
//! let messages = topic.consume("billing", "worker-1", 10).await?;
//! for message in messages {
//!     message.acknowledge().await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod consumer;
pub mod driver;
pub mod error;
pub mod grouped_topic;
pub mod message;
pub mod retry;
mod scripts;
pub mod topic;

pub use client::Client;
pub use config::TopicOptions;
pub use consumer::{Consumer, Handler};
pub use driver::{mock::MockDriver, redis::RedisDriver, ConsumerInfo, Fields, PendingEntry, StoreDriver, TrimHint};
pub use error::RediMqError;
pub use grouped_topic::GroupedTopic;
pub use message::Message;
pub use topic::UnorderedTopic;
