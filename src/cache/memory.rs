use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::cache::{
    index_change, CachedRecord, IndexChange, MessageCache, ReceivedRecord, SentRecord,
};
use crate::error::StorageError;

/// In-process cache that scans every record on each pending query.
#[derive(Default, Debug)]
pub struct MemoryMessageCache {
    sent: RwLock<HashMap<String, SentRecord>>,
    received: RwLock<HashMap<String, ReceivedRecord>>,
}

impl MemoryMessageCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent_len(&self) -> usize {
        self.sent.read().await.len()
    }
}

#[async_trait]
impl MessageCache for MemoryMessageCache {
    async fn store_sent(&self, message_id: &str, record: SentRecord) -> Result<(), StorageError> {
        self.sent.write().await.insert(message_id.to_string(), record);
        Ok(())
    }

    async fn get_unconfirmed_sent(&self) -> Result<Vec<SentRecord>, StorageError> {
        Ok(self
            .sent
            .read()
            .await
            .values()
            .filter(|r| r.is_pending())
            .cloned()
            .collect())
    }

    async fn confirm_sent(&self, message_id: &str) -> Result<(), StorageError> {
        self.sent
            .write()
            .await
            .get_mut(message_id)
            .ok_or_else(|| StorageError::UnknownMessage(message_id.to_string()))?
            .confirm();
        Ok(())
    }

    async fn is_sent_unconfirmed(&self, message_id: &str) -> Result<bool, StorageError> {
        Ok(self
            .sent
            .read()
            .await
            .get(message_id)
            .is_some_and(|r| r.is_pending()))
    }

    async fn store_received(
        &self,
        message_id: &str,
        record: ReceivedRecord,
    ) -> Result<(), StorageError> {
        self.received
            .write()
            .await
            .insert(message_id.to_string(), record);
        Ok(())
    }

    async fn get_received_unacked(&self) -> Result<Vec<ReceivedRecord>, StorageError> {
        Ok(self
            .received
            .read()
            .await
            .values()
            .filter(|r| r.is_pending())
            .cloned()
            .collect())
    }

    async fn is_already_received(&self, message_id: &str) -> Result<bool, StorageError> {
        Ok(self.received.read().await.contains_key(message_id))
    }

    async fn remove_sent(&self, message_id: &str) -> Result<(), StorageError> {
        self.sent.write().await.remove(message_id);
        Ok(())
    }

    async fn remove_received(&self, message_id: &str) -> Result<(), StorageError> {
        self.received.write().await.remove(message_id);
        Ok(())
    }

    async fn purge_acknowledged_sent(&self, cutoff: DateTime<Utc>) -> Result<usize, StorageError> {
        let mut sent = self.sent.write().await;
        let before = sent.len();
        sent.retain(|_, r| !r.acknowledged_before(cutoff));
        Ok(before - sent.len())
    }
}

/// Records plus a FIFO of the ids whose record is pending. An id is in
/// `pending` iff its record has status `SYN`.
#[derive(Debug)]
struct PendingIndex<R> {
    records: HashMap<String, R>,
    pending: VecDeque<String>,
}

impl<R> Default for PendingIndex<R> {
    fn default() -> Self {
        Self {
            records: HashMap::new(),
            pending: VecDeque::new(),
        }
    }
}

impl<R: CachedRecord + Clone> PendingIndex<R> {
    fn upsert(&mut self, message_id: &str, record: R) {
        let was_pending = self.is_pending(message_id);
        match index_change(was_pending, record.is_pending()) {
            IndexChange::Push => self.pending.push_back(message_id.to_string()),
            IndexChange::Remove => self.unindex(message_id),
            IndexChange::Keep => {}
        }
        self.records.insert(message_id.to_string(), record);
    }

    fn update(&mut self, message_id: &str, f: impl FnOnce(&mut R)) -> bool {
        let Some(record) = self.records.get_mut(message_id) else {
            return false;
        };
        let was_pending = record.is_pending();
        f(record);
        if index_change(was_pending, record.is_pending()) == IndexChange::Remove {
            self.unindex(message_id);
        }
        true
    }

    fn remove(&mut self, message_id: &str) {
        if let Some(record) = self.records.remove(message_id) {
            if record.is_pending() {
                self.unindex(message_id);
            }
        }
    }

    fn unindex(&mut self, message_id: &str) {
        self.pending.retain(|id| id != message_id);
    }

    fn pending_records(&self) -> Vec<R> {
        self.pending
            .iter()
            .filter_map(|id| self.records.get(id))
            .filter(|r| r.is_pending())
            .cloned()
            .collect()
    }

    fn is_pending(&self, message_id: &str) -> bool {
        self.records.get(message_id).is_some_and(|r| r.is_pending())
    }
}

/// In-process cache that keeps pending ids in insertion order, so pending
/// queries touch only the pending subset and return it oldest first.
#[derive(Default, Debug)]
pub struct OrderedMemoryMessageCache {
    sent: RwLock<PendingIndex<SentRecord>>,
    received: RwLock<PendingIndex<ReceivedRecord>>,
}

impl OrderedMemoryMessageCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pending sent ids, oldest first.
    pub async fn pending_sent_ids(&self) -> Vec<String> {
        self.sent.read().await.pending.iter().cloned().collect()
    }

    /// Received ids still owed an acknowledgment, oldest first.
    pub async fn pending_received_ids(&self) -> Vec<String> {
        self.received.read().await.pending.iter().cloned().collect()
    }
}

#[async_trait]
impl MessageCache for OrderedMemoryMessageCache {
    async fn store_sent(&self, message_id: &str, record: SentRecord) -> Result<(), StorageError> {
        self.sent.write().await.upsert(message_id, record);
        Ok(())
    }

    async fn get_unconfirmed_sent(&self) -> Result<Vec<SentRecord>, StorageError> {
        Ok(self.sent.read().await.pending_records())
    }

    async fn confirm_sent(&self, message_id: &str) -> Result<(), StorageError> {
        if self.sent.write().await.update(message_id, SentRecord::confirm) {
            Ok(())
        } else {
            Err(StorageError::UnknownMessage(message_id.to_string()))
        }
    }

    async fn is_sent_unconfirmed(&self, message_id: &str) -> Result<bool, StorageError> {
        Ok(self.sent.read().await.is_pending(message_id))
    }

    async fn store_received(
        &self,
        message_id: &str,
        record: ReceivedRecord,
    ) -> Result<(), StorageError> {
        self.received.write().await.upsert(message_id, record);
        Ok(())
    }

    async fn get_received_unacked(&self) -> Result<Vec<ReceivedRecord>, StorageError> {
        Ok(self.received.read().await.pending_records())
    }

    async fn is_already_received(&self, message_id: &str) -> Result<bool, StorageError> {
        Ok(self.received.read().await.records.contains_key(message_id))
    }

    async fn remove_sent(&self, message_id: &str) -> Result<(), StorageError> {
        self.sent.write().await.remove(message_id);
        Ok(())
    }

    async fn remove_received(&self, message_id: &str) -> Result<(), StorageError> {
        self.received.write().await.remove(message_id);
        Ok(())
    }

    async fn purge_acknowledged_sent(&self, cutoff: DateTime<Utc>) -> Result<usize, StorageError> {
        // Acknowledged records are never in the pending index.
        let mut sent = self.sent.write().await;
        let before = sent.records.len();
        sent.records.retain(|_, r| !r.acknowledged_before(cutoff));
        Ok(before - sent.records.len())
    }
}
