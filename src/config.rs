//! Node configuration: which backends to use and how to reach them.

use std::sync::Arc;
use std::time::Duration;

use clap::ValueEnum;
use ds::RedisDeliveryConfig;
use tracing::info;

use crate::cache::{
    MemoryMessageCache, MessageCache, OrderedMemoryMessageCache, OrderedRedisMessageCache,
    RedisMessageCache,
};
use crate::dead_letter::{DeadLetterSink, MemoryDeadLetterSink, RedisDeadLetterSink};
use crate::error::StorageError;
use crate::reliable::ReliableConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CacheBackend {
    Memory,
    OrderedMemory,
    Redis,
    OrderedRedis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DeadLetterBackend {
    Memory,
    Redis,
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub identity: String,
    pub delivery: RedisDeliveryConfig,
    pub cache: CacheBackend,
    pub dead_letters: DeadLetterBackend,
    pub send_expiry: Duration,
    pub acknowledge_expiry: Duration,
    pub retention: Option<Duration>,
    pub tick_interval: Duration,
}

impl NodeConfig {
    /// Redis hash holding this node's sent records.
    pub fn sent_store(&self) -> String {
        format!("{}_sent", self.identity)
    }

    /// Redis hash holding this node's received records.
    pub fn received_store(&self) -> String {
        format!("{}_received", self.identity)
    }

    /// Redis hash holding this node's dead letters.
    pub fn dead_letter_store(&self) -> String {
        format!("{}_dead", self.identity)
    }

    async fn message_cache(&self) -> Result<Arc<dyn MessageCache>, StorageError> {
        let url = self.delivery.url.as_str();
        let cache: Arc<dyn MessageCache> = match self.cache {
            CacheBackend::Memory => Arc::new(MemoryMessageCache::new()),
            CacheBackend::OrderedMemory => Arc::new(OrderedMemoryMessageCache::new()),
            CacheBackend::Redis => Arc::new(
                RedisMessageCache::connect(url, &self.sent_store(), &self.received_store()).await?,
            ),
            CacheBackend::OrderedRedis => Arc::new(
                OrderedRedisMessageCache::connect(url, &self.sent_store(), &self.received_store())
                    .await?,
            ),
        };
        Ok(cache)
    }

    async fn dead_letter_sink(&self) -> Result<Arc<dyn DeadLetterSink>, StorageError> {
        let sink: Arc<dyn DeadLetterSink> = match self.dead_letters {
            DeadLetterBackend::Memory => Arc::new(MemoryDeadLetterSink::new()),
            DeadLetterBackend::Redis => Arc::new(
                RedisDeadLetterSink::connect(&self.delivery.url, &self.dead_letter_store()).await?,
            ),
        };
        Ok(sink)
    }

    /// Build the channel options, connecting the Redis-backed stores if
    /// selected.
    pub async fn reliable_config(&self) -> Result<ReliableConfig, StorageError> {
        info!(
            "Node {} uses {:?} cache and {:?} dead letters",
            self.identity, self.cache, self.dead_letters
        );
        let mut config = ReliableConfig::default()
            .with_send_expiry(self.send_expiry)
            .with_acknowledge_expiry(self.acknowledge_expiry)
            .with_message_cache(self.message_cache().await?)
            .with_dead_message_backend(self.dead_letter_sink().await?);
        if let Some(retention) = self.retention {
            config = config.with_retention(retention);
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(cache: CacheBackend) -> NodeConfig {
        NodeConfig {
            identity: "alice".to_string(),
            delivery: RedisDeliveryConfig::default(),
            cache,
            dead_letters: DeadLetterBackend::Memory,
            send_expiry: Duration::from_secs(30),
            acknowledge_expiry: Duration::ZERO,
            retention: Some(Duration::from_secs(60)),
            tick_interval: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_store_names_are_scoped_by_identity() {
        let config = node(CacheBackend::Memory);
        assert_eq!(config.sent_store(), "alice_sent");
        assert_eq!(config.received_store(), "alice_received");
        assert_eq!(config.dead_letter_store(), "alice_dead");
    }

    #[tokio::test]
    async fn test_memory_backends_need_no_server() {
        let config = node(CacheBackend::OrderedMemory).reliable_config().await.unwrap();

        assert_eq!(config.send_expiry, Duration::from_secs(30));
        assert_eq!(config.acknowledge_expiry, Duration::ZERO);
        assert_eq!(config.retention, Some(Duration::from_secs(60)));
        assert!(config.message_cache.get_unconfirmed_sent().await.unwrap().is_empty());
    }
}
