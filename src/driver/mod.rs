//! Store Driver Adapter (§4.1 of the design): a thin typed façade over the
//! underlying store's log, consumer-group, pending-list, claim, and
//! script-eval primitives. The engines in `topic.rs` / `grouped_topic.rs`
//! depend only on [`StoreDriver`], never on a concrete Redis type, so the
//! locking algorithm can be exercised against [`mock::MockDriver`] without a
//! live server.

pub mod mock;
pub mod redis;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::RediMqError;

/// Record fields: an opaque mapping from field name to field value.
pub type Fields = HashMap<String, String>;

/// One entry inspected from a consumer group's pending-entries list.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub id: String,
    pub owner: String,
    pub idle_ms: u64,
    pub deliveries: u64,
}

/// One consumer registered on a log's consumer group.
#[derive(Debug, Clone)]
pub struct ConsumerInfo {
    pub name: String,
    pub pending_count: u64,
    pub idle_ms: u64,
}

/// Optional trimming hints for [`StoreDriver::append_bounded`]. The minimum
/// id bound is passed separately as a timestamp (see
/// `min_id_timestamp_ms` on [`StoreDriver::append_bounded`]); this only
/// carries the approximate max-length hint.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrimHint {
    pub approx_max_len: Option<i64>,
}

/// Store primitives the engines depend on. Every method is a single server
/// round-trip; reads that yield nothing return an empty `Vec` rather than an
/// error.
#[async_trait]
pub trait StoreDriver: Send + Sync {
    /// Append a record, returning the server-assigned id.
    async fn append(&self, log: &str, fields: &Fields) -> Result<String, RediMqError>;

    /// As [`Self::append`], with retention/max-length trimming hints.
    async fn append_bounded(
        &self,
        log: &str,
        fields: &Fields,
        hint: TrimHint,
        min_id_timestamp_ms: Option<i64>,
    ) -> Result<String, RediMqError>;

    /// Deliver up to `count` previously-undelivered records to `consumer`.
    /// Non-blocking: returns empty if none are available.
    async fn read_new(
        &self,
        log: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<(String, Fields)>, RediMqError>;

    /// Inspect the group's pending-entries list.
    async fn pending(
        &self,
        log: &str,
        group: &str,
        count: usize,
        idle_ge_ms: Option<u64>,
        consumer: Option<&str>,
    ) -> Result<Vec<PendingEntry>, RediMqError>;

    /// Transfer ownership of listed ids to `new_consumer`, provided each has
    /// been idle at least `min_idle_ms`.
    async fn claim(
        &self,
        log: &str,
        group: &str,
        new_consumer: &str,
        min_idle_ms: u64,
        ids: &[String],
    ) -> Result<Vec<(String, Fields)>, RediMqError>;

    /// Idempotent: tolerates "group already exists".
    async fn create_group(&self, log: &str, group: &str, start_id: &str) -> Result<(), RediMqError>;

    /// Idempotent: tolerates "consumer already exists".
    async fn create_consumer(&self, log: &str, group: &str, consumer: &str) -> Result<(), RediMqError>;

    /// Drop a consumer's registration entirely (its pending entries, if any,
    /// become unowned). Used by cleanup to prune long-idle, lock-less
    /// consumers so they stop inflating the partition-sizing denominator.
    async fn delete_consumer(&self, log: &str, group: &str, consumer: &str) -> Result<(), RediMqError>;

    async fn ack(&self, log: &str, group: &str, id: &str) -> Result<bool, RediMqError>;

    async fn length(&self, log: &str) -> Result<u64, RediMqError>;

    async fn consumers(&self, log: &str, group: &str) -> Result<Vec<ConsumerInfo>, RediMqError>;

    /// Inclusive range scan over raw ids, e.g. `"-"`/`"+"` for the full log.
    async fn range(&self, log: &str, from: &str, to: &str) -> Result<Vec<(String, Fields)>, RediMqError>;

    async fn del(&self, log: &str, id: &str) -> Result<(), RediMqError>;

    /// Returns `true` if `member` was newly added (not already present).
    async fn set_add(&self, key: &str, member: &str) -> Result<bool, RediMqError>;

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), RediMqError>;

    async fn set_is_member(&self, key: &str, member: &str) -> Result<bool, RediMqError>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>, RediMqError>;

    /// Paginated scan; returns `(matches, next_cursor)`. A `next_cursor` of 0
    /// means the scan has wrapped back to the start.
    async fn set_scan(
        &self,
        key: &str,
        pattern: &str,
        count: usize,
        cursor: u64,
    ) -> Result<(Vec<String>, u64), RediMqError>;

    async fn key_delete(&self, key: &str) -> Result<(), RediMqError>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), RediMqError>;

    /// `publish-to-grouped-topic` script (§4.2): if `group_key` is not in
    /// `set_key`, add it there and append `{key: group_key}` to `registry_log`.
    async fn eval_publish_to_grouped_topic(
        &self,
        set_key: &str,
        registry_log: &str,
        group_key: &str,
    ) -> Result<(), RediMqError>;

    /// `reclaim-message-groups` script (§4.2): read up to `count` pending
    /// registry entries for `group` regardless of owner and claim them for
    /// `consumer` with `min_idle = 0`. Returns `(registry_id, group_key)` pairs.
    async fn eval_reclaim_message_groups(
        &self,
        registry_log: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<(String, String)>, RediMqError>;

    /// `delete-empty-group` script (§4.2): if `per_group_log` is empty, delete
    /// `registry_id` from `registry_log` and drop `per_group_log`. Returns
    /// whether the deletion happened.
    async fn eval_delete_empty_group(
        &self,
        registry_log: &str,
        per_group_log: &str,
        registry_id: &str,
    ) -> Result<bool, RediMqError>;
}
