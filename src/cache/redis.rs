//! Redis-backed message caches.
//!
//! Records are stored as JSON strings in two hashes keyed by message id. The
//! ordered variant also keeps the pending ids of each hash in a Redis list
//! named `<hash>_keys`.
//!
//! Processes sharing these keys under one identity can race: the
//! read-modify-write sequences below are not atomic across calls.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fred::{clients::RedisClient, prelude::*};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use crate::cache::{
    index_change, CachedRecord, IndexChange, MessageCache, ReceivedRecord, SentRecord,
    PENDING_KEYS_SUFFIX,
};
use crate::error::StorageError;

fn decode<R: DeserializeOwned>(raw: &str) -> Result<R, StorageError> {
    Ok(serde_json::from_str(raw)?)
}

/// Redis cache that reads whole hashes and filters by status.
#[derive(Clone)]
pub struct RedisMessageCache {
    client: RedisClient,
    sent_name: String,
    received_name: String,
}

impl RedisMessageCache {
    /// Wrap an initialized client.
    pub fn new(client: RedisClient, sent_name: &str, received_name: &str) -> Self {
        Self {
            client,
            sent_name: sent_name.to_string(),
            received_name: received_name.to_string(),
        }
    }

    /// Connect a dedicated client to `url`.
    pub async fn connect(
        url: &str,
        sent_name: &str,
        received_name: &str,
    ) -> Result<Self, StorageError> {
        let client = Builder::from_config(RedisConfig::from_url(url)?).build()?;
        client.init().await?;
        Ok(Self::new(client, sent_name, received_name))
    }

    pub fn sent_name(&self) -> &str {
        &self.sent_name
    }

    pub fn received_name(&self) -> &str {
        &self.received_name
    }

    async fn get<R: DeserializeOwned>(
        &self,
        hash: &str,
        message_id: &str,
    ) -> Result<Option<R>, StorageError> {
        let raw: Option<String> = self.client.hget(hash, message_id).await?;
        raw.as_deref().map(decode).transpose()
    }

    async fn put<R: Serialize>(
        &self,
        hash: &str,
        message_id: &str,
        record: &R,
    ) -> Result<(), StorageError> {
        let _: i64 = self
            .client
            .hset(hash, (message_id, serde_json::to_string(record)?))
            .await?;
        Ok(())
    }

    async fn delete(&self, hash: &str, message_id: &str) -> Result<(), StorageError> {
        let _: i64 = self.client.hdel(hash, message_id).await?;
        Ok(())
    }

    async fn all<R: DeserializeOwned>(&self, hash: &str) -> Result<Vec<R>, StorageError> {
        let raw: Vec<String> = self.client.hvals(hash).await?;
        raw.iter().map(|r| decode(r)).collect()
    }

    /// Fetch the records for `ids` in order, skipping ids without a record.
    async fn many<R: DeserializeOwned>(
        &self,
        hash: &str,
        ids: Vec<String>,
    ) -> Result<Vec<R>, StorageError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let raw: Vec<Option<String>> = self.client.hmget(hash, ids).await?;
        raw.iter().flatten().map(|r| decode(r)).collect()
    }

    async fn get_sent(&self, message_id: &str) -> Result<Option<SentRecord>, StorageError> {
        self.get(&self.sent_name, message_id).await
    }

    async fn get_received(&self, message_id: &str) -> Result<Option<ReceivedRecord>, StorageError> {
        self.get(&self.received_name, message_id).await
    }

    async fn acknowledged_sent_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<String>, StorageError> {
        Ok(self
            .all::<SentRecord>(&self.sent_name)
            .await?
            .into_iter()
            .filter(|r| r.acknowledged_before(cutoff))
            .map(|r| r.message_id)
            .collect())
    }
}

#[async_trait]
impl MessageCache for RedisMessageCache {
    async fn store_sent(&self, message_id: &str, record: SentRecord) -> Result<(), StorageError> {
        self.put(&self.sent_name, message_id, &record).await
    }

    async fn get_unconfirmed_sent(&self) -> Result<Vec<SentRecord>, StorageError> {
        let records: Vec<SentRecord> = self.all(&self.sent_name).await?;
        Ok(records.into_iter().filter(|r| r.is_pending()).collect())
    }

    async fn confirm_sent(&self, message_id: &str) -> Result<(), StorageError> {
        let mut record = self
            .get_sent(message_id)
            .await?
            .ok_or_else(|| StorageError::UnknownMessage(message_id.to_string()))?;
        record.confirm();
        self.put(&self.sent_name, message_id, &record).await
    }

    async fn is_sent_unconfirmed(&self, message_id: &str) -> Result<bool, StorageError> {
        Ok(self
            .get_sent(message_id)
            .await?
            .is_some_and(|r| r.is_pending()))
    }

    async fn store_received(
        &self,
        message_id: &str,
        record: ReceivedRecord,
    ) -> Result<(), StorageError> {
        self.put(&self.received_name, message_id, &record).await
    }

    async fn get_received_unacked(&self) -> Result<Vec<ReceivedRecord>, StorageError> {
        let records: Vec<ReceivedRecord> = self.all(&self.received_name).await?;
        Ok(records.into_iter().filter(|r| r.is_pending()).collect())
    }

    async fn is_already_received(&self, message_id: &str) -> Result<bool, StorageError> {
        Ok(self.client.hexists(self.received_name.as_str(), message_id).await?)
    }

    async fn remove_sent(&self, message_id: &str) -> Result<(), StorageError> {
        self.delete(&self.sent_name, message_id).await
    }

    async fn remove_received(&self, message_id: &str) -> Result<(), StorageError> {
        self.delete(&self.received_name, message_id).await
    }

    async fn purge_acknowledged_sent(&self, cutoff: DateTime<Utc>) -> Result<usize, StorageError> {
        let ids = self.acknowledged_sent_before(cutoff).await?;
        for id in &ids {
            self.delete(&self.sent_name, id).await?;
        }
        Ok(ids.len())
    }
}

/// Redis cache that keeps pending ids in `<hash>_keys` lists so pending
/// queries fetch only the pending records, oldest first.
#[derive(Clone)]
pub struct OrderedRedisMessageCache {
    inner: RedisMessageCache,
    sent_keys: String,
    received_keys: String,
}

impl OrderedRedisMessageCache {
    pub fn new(client: RedisClient, sent_name: &str, received_name: &str) -> Self {
        Self::from_cache(RedisMessageCache::new(client, sent_name, received_name))
    }

    pub async fn connect(
        url: &str,
        sent_name: &str,
        received_name: &str,
    ) -> Result<Self, StorageError> {
        Ok(Self::from_cache(
            RedisMessageCache::connect(url, sent_name, received_name).await?,
        ))
    }

    fn from_cache(inner: RedisMessageCache) -> Self {
        let sent_keys = format!("{}{PENDING_KEYS_SUFFIX}", inner.sent_name());
        let received_keys = format!("{}{PENDING_KEYS_SUFFIX}", inner.received_name());
        Self {
            inner,
            sent_keys,
            received_keys,
        }
    }

    async fn index(&self, keys: &str, message_id: &str) -> Result<(), StorageError> {
        let _: i64 = self.inner.client.rpush(keys, message_id).await?;
        Ok(())
    }

    async fn unindex(&self, keys: &str, message_id: &str) -> Result<(), StorageError> {
        let _: i64 = self.inner.client.lrem(keys, 0, message_id).await?;
        Ok(())
    }

    async fn pending_ids(&self, keys: &str) -> Result<Vec<String>, StorageError> {
        Ok(self.inner.client.lrange(keys, 0, -1).await?)
    }

    /// Keep the pending list in step with a status change.
    async fn reindex(
        &self,
        keys: &str,
        message_id: &str,
        was_pending: bool,
        now_pending: bool,
    ) -> Result<(), StorageError> {
        match index_change(was_pending, now_pending) {
            IndexChange::Push => self.index(keys, message_id).await,
            IndexChange::Remove => self.unindex(keys, message_id).await,
            IndexChange::Keep => Ok(()),
        }
    }
}

#[async_trait]
impl MessageCache for OrderedRedisMessageCache {
    async fn store_sent(&self, message_id: &str, record: SentRecord) -> Result<(), StorageError> {
        let was_pending = self
            .inner
            .get_sent(message_id)
            .await?
            .is_some_and(|r| r.is_pending());
        let now_pending = record.is_pending();
        self.inner.store_sent(message_id, record).await?;
        self.reindex(&self.sent_keys, message_id, was_pending, now_pending)
            .await
    }

    async fn get_unconfirmed_sent(&self) -> Result<Vec<SentRecord>, StorageError> {
        let ids = self.pending_ids(&self.sent_keys).await?;
        let records: Vec<SentRecord> = self.inner.many(self.inner.sent_name(), ids).await?;
        Ok(records.into_iter().filter(|r| r.is_pending()).collect())
    }

    async fn confirm_sent(&self, message_id: &str) -> Result<(), StorageError> {
        self.inner.confirm_sent(message_id).await?;
        self.unindex(&self.sent_keys, message_id).await
    }

    async fn is_sent_unconfirmed(&self, message_id: &str) -> Result<bool, StorageError> {
        self.inner.is_sent_unconfirmed(message_id).await
    }

    async fn store_received(
        &self,
        message_id: &str,
        record: ReceivedRecord,
    ) -> Result<(), StorageError> {
        let was_pending = self
            .inner
            .get_received(message_id)
            .await?
            .is_some_and(|r| r.is_pending());
        let now_pending = record.is_pending();
        self.inner.store_received(message_id, record).await?;
        self.reindex(&self.received_keys, message_id, was_pending, now_pending)
            .await
    }

    async fn get_received_unacked(&self) -> Result<Vec<ReceivedRecord>, StorageError> {
        let ids = self.pending_ids(&self.received_keys).await?;
        let records: Vec<ReceivedRecord> =
            self.inner.many(self.inner.received_name(), ids).await?;
        Ok(records.into_iter().filter(|r| r.is_pending()).collect())
    }

    async fn is_already_received(&self, message_id: &str) -> Result<bool, StorageError> {
        self.inner.is_already_received(message_id).await
    }

    async fn remove_sent(&self, message_id: &str) -> Result<(), StorageError> {
        self.inner.remove_sent(message_id).await?;
        self.unindex(&self.sent_keys, message_id).await
    }

    async fn remove_received(&self, message_id: &str) -> Result<(), StorageError> {
        self.inner.remove_received(message_id).await?;
        self.unindex(&self.received_keys, message_id).await
    }

    async fn purge_acknowledged_sent(&self, cutoff: DateTime<Utc>) -> Result<usize, StorageError> {
        let purged = self.inner.purge_acknowledged_sent(cutoff).await?;
        if purged > 0 {
            debug!("Purged {purged} acknowledged records from {}", self.inner.sent_name());
        }
        Ok(purged)
    }
}
