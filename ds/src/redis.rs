//! Redis PUBLISH/SUBSCRIBE delivery service.

use std::sync::mpsc;

use fred::{
    clients::{RedisClient, SubscriberClient},
    prelude::*,
    types::Message,
};
use tokio::{sync::broadcast::error::RecvError, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::transport::{DeliveryService, SubscriberRegistry};
use crate::DeliveryServiceError;

pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
pub const DEFAULT_PUBSUB_CHANNEL: &str = "reliable";

#[derive(Debug, Clone)]
pub struct RedisDeliveryConfig {
    pub url: String,
    /// The Redis pub/sub channel every participant publishes to.
    pub channel: String,
}

impl Default for RedisDeliveryConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_REDIS_URL.to_string(),
            channel: DEFAULT_PUBSUB_CHANNEL.to_string(),
        }
    }
}

/// Redis-backed delivery service.
///
/// All participants publish on one Redis channel; a background task reads the
/// subscriber connection and hands each frame to the local subscriptions whose
/// prefix matches. Redis pub/sub does not buffer for absent subscribers, so a
/// frame published while a peer is disconnected is lost.
pub struct RedisDeliveryService {
    channel: String,
    client: RedisClient,
    sub_client: SubscriberClient,
    registry: SubscriberRegistry,
    forwarder: JoinHandle<()>,
}

impl RedisDeliveryService {
    pub async fn connect(cfg: RedisDeliveryConfig) -> Result<Self, DeliveryServiceError> {
        let config = RedisConfig::from_url(&cfg.url)?;
        let client = Builder::from_config(config.clone()).build()?;
        let sub_client = Builder::from_config(config).build_subscriber_client()?;
        client.init().await?;
        sub_client.init().await?;
        sub_client.subscribe(cfg.channel.clone()).await?;
        info!("Subscribed to redis channel {}", cfg.channel);

        let registry = SubscriberRegistry::default();
        let forwarder = Self::spawn_forwarder(sub_client.message_rx(), registry.clone());

        Ok(Self {
            channel: cfg.channel,
            client,
            sub_client,
            registry,
            forwarder,
        })
    }

    fn spawn_forwarder(
        mut rx: tokio::sync::broadcast::Receiver<Message>,
        registry: SubscriberRegistry,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(message) => match message.value.as_bytes() {
                        Some(frame) => registry.dispatch(frame),
                        None => debug!("Ignoring non-binary message on {}", message.channel),
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Redis subscriber lagged, {skipped} frames lost");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            info!("Redis forwarding task finished");
        })
    }

    pub async fn shutdown(self) -> Result<(), DeliveryServiceError> {
        self.sub_client.unsubscribe(self.channel.clone()).await?;
        self.sub_client.quit().await?;
        self.client.quit().await?;
        self.forwarder.abort();
        Ok(())
    }
}

impl DeliveryService for RedisDeliveryService {
    async fn publish(&self, frame: Vec<u8>) -> Result<(), DeliveryServiceError> {
        let _: i64 = self
            .client
            .publish(self.channel.clone(), frame.as_slice())
            .await?;
        Ok(())
    }

    fn subscribe(&self, prefix: &[u8]) -> Result<mpsc::Receiver<Vec<u8>>, DeliveryServiceError> {
        self.registry.register(prefix)
    }
}
