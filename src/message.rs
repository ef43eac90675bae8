//! The [`Message`] value type (§3).

use std::sync::Arc;

use crate::driver::{Fields, StoreDriver};
use crate::error::RediMqError;

/// Everything needed to acknowledge a message, held independently of the
/// `Topic`/`GroupedTopic` handle that produced it (see the Design Note on
/// self-referential handles in SPEC_FULL.md §3: a `Message` never embeds its
/// originating topic, only an `Arc<dyn StoreDriver>` and the coordinates
/// `acknowledge` needs).
#[derive(Clone)]
pub(crate) struct ReceiptContext {
    pub driver: Arc<dyn StoreDriver>,
    pub log: String,
    pub group: String,
}

/// A message published to or received from a topic.
///
/// Immutable after construction. The server-side record is retained until
/// acknowledged and outside retention; the client-side value here is a
/// snapshot taken at publish or receive time.
#[derive(Clone)]
pub struct Message {
    /// Server-assigned identifier, monotonic within its log.
    pub id: String,
    /// Group key this message belongs to; `None` for unordered-topic messages.
    pub group_key: Option<String>,
    /// Opaque payload fields.
    pub data: Fields,
    /// Consumer identity that received this message, if it was received
    /// (rather than just published) — required for [`Message::acknowledge`].
    pub consumer_name: Option<String>,

    pub(crate) receipt: Option<ReceiptContext>,
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("group_key", &self.group_key)
            .field("data", &self.data)
            .field("consumer_name", &self.consumer_name)
            .finish()
    }
}

impl Message {
    /// A message built from its id and payload after a successful publish.
    /// Carries no receipt context: producers never acknowledge.
    pub(crate) fn published(id: String, group_key: Option<String>, data: Fields) -> Self {
        Message {
            id,
            group_key,
            data,
            consumer_name: None,
            receipt: None,
        }
    }

    pub(crate) fn received(
        id: String,
        group_key: Option<String>,
        data: Fields,
        consumer_name: String,
        receipt: ReceiptContext,
    ) -> Self {
        Message {
            id,
            group_key,
            data,
            consumer_name: Some(consumer_name),
            receipt: Some(receipt),
        }
    }

    /// Acknowledge this message. Idempotent: the first call removes it from
    /// the caller's pending list and returns `Ok(true)`; a repeat call finds
    /// it already gone and returns `Err(NotOwned)` — the message is never
    /// re-delivered either way (P3).
    #[tracing::instrument(skip(self), fields(id = %self.id))]
    pub async fn acknowledge(&self) -> Result<bool, RediMqError> {
        let receipt = self.receipt.as_ref().ok_or_else(|| {
            RediMqError::protocol("Message::acknowledge", "message was never received from a topic")
        })?;
        let acked = receipt.driver.ack(&receipt.log, &receipt.group, &self.id).await?;
        if acked {
            Ok(true)
        } else {
            Err(RediMqError::NotOwned {
                context: "Message::acknowledge".to_string(),
                id: self.id.clone(),
            })
        }
    }
}
