//! Dead-letter sinks: permanent record of messages whose retry or
//! acknowledgment window ran out.

use std::collections::HashMap;

use async_trait::async_trait;
use fred::{clients::RedisClient, prelude::*};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::StorageError;

pub const RETRY_EXPIRED: &str = "Retry time expired";
pub const ACKNOWLEDGE_EXPIRED: &str = "Acknowledge time expired";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// The message id.
    pub context: String,
    /// The full cache record at the time of expiry.
    pub payload: Value,
    pub comment: String,
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Record an expired message. Storing the same context twice keeps the
    /// last entry.
    async fn store(&self, context: &str, payload: Value, comment: &str) -> Result<(), StorageError>;
}

#[derive(Default, Debug)]
pub struct MemoryDeadLetterSink {
    letters: RwLock<HashMap<String, DeadLetter>>,
}

impl MemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, context: &str) -> Option<DeadLetter> {
        self.letters.read().await.get(context).cloned()
    }

    pub async fn len(&self) -> usize {
        self.letters.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.letters.read().await.is_empty()
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetterSink {
    async fn store(&self, context: &str, payload: Value, comment: &str) -> Result<(), StorageError> {
        let letter = DeadLetter {
            context: context.to_string(),
            payload,
            comment: comment.to_string(),
        };
        self.letters.write().await.insert(context.to_string(), letter);
        Ok(())
    }
}

/// Sink writing JSON entries into one Redis hash keyed by context.
#[derive(Clone)]
pub struct RedisDeadLetterSink {
    client: RedisClient,
    store_name: String,
}

impl RedisDeadLetterSink {
    pub fn new(client: RedisClient, store_name: &str) -> Self {
        Self {
            client,
            store_name: store_name.to_string(),
        }
    }

    pub async fn connect(url: &str, store_name: &str) -> Result<Self, StorageError> {
        let client = Builder::from_config(RedisConfig::from_url(url)?).build()?;
        client.init().await?;
        Ok(Self::new(client, store_name))
    }

    pub async fn get(&self, context: &str) -> Result<Option<DeadLetter>, StorageError> {
        let raw: Option<String> = self.client.hget(self.store_name.as_str(), context).await?;
        Ok(raw.as_deref().map(serde_json::from_str).transpose()?)
    }
}

#[async_trait]
impl DeadLetterSink for RedisDeadLetterSink {
    async fn store(&self, context: &str, payload: Value, comment: &str) -> Result<(), StorageError> {
        let letter = DeadLetter {
            context: context.to_string(),
            payload,
            comment: comment.to_string(),
        };
        let _: i64 = self
            .client
            .hset(self.store_name.as_str(), (context, serde_json::to_string(&letter)?))
            .await?;
        Ok(())
    }
}
