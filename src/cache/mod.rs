//! Message state cache: per-message confirmation state for sent and received
//! messages.
//!
//! Backends differ along two axes. *Storage*: in-process maps or Redis
//! hashes. *Iteration*: unordered backends scan every record and filter by
//! status, ordered backends keep a FIFO index of pending ids so that only
//! the pending subset is fetched. For any sequence of calls the two
//! iteration strategies return the same sets of records.

mod memory;
mod redis;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::Headers;
use crate::error::StorageError;

pub use memory::{MemoryMessageCache, OrderedMemoryMessageCache};
pub use redis::{OrderedRedisMessageCache, RedisMessageCache};

/// Suffix of the Redis lists holding the pending ids of the ordered backend.
pub const PENDING_KEYS_SUFFIX: &str = "_keys";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageStatus {
    /// Sent: awaiting confirmation. Received: acknowledgment owed.
    Syn,
    /// Sent: confirmed by the peer. Received: acknowledgment sent.
    Ack,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentRecord {
    pub message_id: String,
    pub destination: String,
    pub headers: Headers,
    pub payload: Value,
    pub status: MessageStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub acknowledged_at: Option<DateTime<Utc>>,
}

impl SentRecord {
    pub fn new(message_id: &str, destination: &str, headers: Headers, payload: Value) -> Self {
        Self {
            message_id: message_id.to_string(),
            destination: destination.to_string(),
            headers,
            payload,
            status: MessageStatus::Syn,
            timestamp: Utc::now(),
            acknowledged_at: None,
        }
    }

    /// Flip to `ACK`. Already-confirmed records keep their original
    /// acknowledgment time.
    pub fn confirm(&mut self) {
        if self.status == MessageStatus::Syn {
            self.status = MessageStatus::Ack;
            self.acknowledged_at = Some(Utc::now());
        }
    }

    pub fn acknowledged_before(&self, cutoff: DateTime<Utc>) -> bool {
        self.status == MessageStatus::Ack && self.acknowledged_at.is_some_and(|at| at < cutoff)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceivedRecord {
    pub message_id: String,
    pub source: String,
    pub headers: Headers,
    pub payload: Value,
    pub status: MessageStatus,
    pub timestamp: DateTime<Utc>,
}

impl ReceivedRecord {
    pub fn new(message_id: &str, source: &str, headers: Headers, payload: Value) -> Self {
        Self {
            message_id: message_id.to_string(),
            source: source.to_string(),
            headers,
            payload,
            status: MessageStatus::Syn,
            timestamp: Utc::now(),
        }
    }
}

/// Common view on cached records, used by the ordered backends.
pub(crate) trait CachedRecord {
    fn status(&self) -> MessageStatus;

    fn is_pending(&self) -> bool {
        self.status() == MessageStatus::Syn
    }
}

impl CachedRecord for SentRecord {
    fn status(&self) -> MessageStatus {
        self.status
    }
}

impl CachedRecord for ReceivedRecord {
    fn status(&self) -> MessageStatus {
        self.status
    }
}

/// How an ordered backend's pending index changes when a record is replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IndexChange {
    Push,
    Remove,
    Keep,
}

/// An id is indexed iff its record is pending: it is pushed when a record
/// becomes `SYN` (first insertion or re-arm) and removed when it leaves `SYN`.
pub(crate) fn index_change(was_pending: bool, now_pending: bool) -> IndexChange {
    match (was_pending, now_pending) {
        (false, true) => IndexChange::Push,
        (true, false) => IndexChange::Remove,
        _ => IndexChange::Keep,
    }
}

/// Whether more than `expiry` has passed between `since` and `now`. A zero
/// expiry never expires.
pub fn is_expired(since: DateTime<Utc>, now: DateTime<Utc>, expiry: Duration) -> bool {
    if expiry.is_zero() {
        return false;
    }
    (now - since)
        .to_std()
        .map(|elapsed| elapsed > expiry)
        .unwrap_or(false)
}

#[async_trait]
pub trait MessageCache: Send + Sync {
    /// Insert or replace the sent record for `message_id`.
    async fn store_sent(&self, message_id: &str, record: SentRecord) -> Result<(), StorageError>;

    /// All sent records still awaiting confirmation.
    async fn get_unconfirmed_sent(&self) -> Result<Vec<SentRecord>, StorageError>;

    /// Mark a sent record as confirmed.
    ///
    /// ## Errors:
    /// - `StorageError::UnknownMessage` if no sent record exists for `message_id`
    async fn confirm_sent(&self, message_id: &str) -> Result<(), StorageError>;

    async fn is_sent_unconfirmed(&self, message_id: &str) -> Result<bool, StorageError>;

    /// Insert or replace the received record for `message_id`. Storing a `SYN`
    /// record over an `ACK` one re-arms the acknowledgment.
    async fn store_received(
        &self,
        message_id: &str,
        record: ReceivedRecord,
    ) -> Result<(), StorageError>;

    /// All received records whose acknowledgment is still owed.
    async fn get_received_unacked(&self) -> Result<Vec<ReceivedRecord>, StorageError>;

    async fn is_already_received(&self, message_id: &str) -> Result<bool, StorageError>;

    /// Drop a sent record entirely. Absent ids are ignored.
    async fn remove_sent(&self, message_id: &str) -> Result<(), StorageError>;

    /// Drop a received record entirely. Absent ids are ignored.
    async fn remove_received(&self, message_id: &str) -> Result<(), StorageError>;

    /// Drop confirmed sent records acknowledged before `cutoff` and return how
    /// many were removed.
    async fn purge_acknowledged_sent(&self, cutoff: DateTime<Utc>) -> Result<usize, StorageError>;
}
