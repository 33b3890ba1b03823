//! Reliable, deduplicated, at-least-once delivery on top of an
//! [`EnvelopeChannel`].
//!
//! `send` only records the message. Transmission happens in `synchronize`,
//! which retransmits every unconfirmed message, acknowledges every received
//! one and dead-letters whatever outlived its window. A driver calls
//! `receive` and then `synchronize` on every tick.
//!
//! Per sent message: `SYN --ack received--> ACK`, `SYN --expired--> dead`.
//! Per received message: `SYN --ack sent--> ACK --duplicate--> SYN`,
//! `SYN --expired--> dead`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ds::DeliveryService;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cache::{
    is_expired, MessageCache, MessageStatus, OrderedMemoryMessageCache, ReceivedRecord, SentRecord,
};
use crate::channel::Channel;
use crate::dead_letter::{DeadLetterSink, MemoryDeadLetterSink, ACKNOWLEDGE_EXPIRED, RETRY_EXPIRED};
use crate::envelope::{
    Envelope, EnvelopeChannel, Headers, ACK_TYPE, MESSAGE_ID_HEADER, TYPE_HEADER,
};
use crate::error::{ReliableError, StorageError};
use crate::message_id::generate_message_id;

/// Application callback, invoked once per newly delivered message.
pub type Callback = Box<dyn FnMut(&Envelope) + Send>;

/// Options of a [`ReliableChannel`]. A zero expiry disables dead-lettering
/// for that direction.
#[derive(Clone)]
pub struct ReliableConfig {
    pub send_expiry: Duration,
    pub acknowledge_expiry: Duration,
    /// How long confirmed sent records are kept before being purged. `None`
    /// keeps them forever.
    pub retention: Option<Duration>,
    pub message_cache: Arc<dyn MessageCache>,
    pub dead_message_backend: Arc<dyn DeadLetterSink>,
    /// Merged into every outgoing envelope.
    pub default_headers: Headers,
}

impl Default for ReliableConfig {
    fn default() -> Self {
        Self {
            send_expiry: Duration::ZERO,
            acknowledge_expiry: Duration::ZERO,
            retention: None,
            message_cache: Arc::new(OrderedMemoryMessageCache::new()),
            dead_message_backend: Arc::new(MemoryDeadLetterSink::new()),
            default_headers: Headers::new(),
        }
    }
}

impl ReliableConfig {
    pub fn with_send_expiry(mut self, expiry: Duration) -> Self {
        self.send_expiry = expiry;
        self
    }

    pub fn with_acknowledge_expiry(mut self, expiry: Duration) -> Self {
        self.acknowledge_expiry = expiry;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = Some(retention);
        self
    }

    pub fn with_message_cache(mut self, cache: Arc<dyn MessageCache>) -> Self {
        self.message_cache = cache;
        self
    }

    pub fn with_dead_message_backend(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_message_backend = sink;
        self
    }

    pub fn with_default_headers(mut self, headers: Headers) -> Self {
        self.default_headers = headers;
        self
    }
}

/// Outcome of processing one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// No frame was pending.
    Empty,
    /// A frame was handled without reaching the application: an ACK, a
    /// duplicate or a malformed frame.
    Consumed,
    /// A new message, already passed to every callback.
    Delivered(Envelope),
}

/// What one `synchronize` call did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub resent: usize,
    pub acknowledged: usize,
    pub dead_lettered: usize,
    pub purged: usize,
}

pub struct ReliableChannel<D: DeliveryService> {
    channel: EnvelopeChannel<D>,
    current_message_id: String,
    send_expiry: Duration,
    acknowledge_expiry: Duration,
    retention: Option<Duration>,
    message_cache: Arc<dyn MessageCache>,
    dead_message_backend: Arc<dyn DeadLetterSink>,
    callbacks: Vec<Callback>,
}

fn dead_letter_payload<R: Serialize>(record: &R) -> Result<Value, StorageError> {
    Ok(serde_json::to_value(record)?)
}

impl<D: DeliveryService> ReliableChannel<D> {
    pub fn new(channel: Channel<D>, config: ReliableConfig) -> Self {
        let current_message_id = generate_message_id(channel.identity());
        Self {
            channel: EnvelopeChannel::new(channel, config.default_headers),
            current_message_id,
            send_expiry: config.send_expiry,
            acknowledge_expiry: config.acknowledge_expiry,
            retention: config.retention,
            message_cache: config.message_cache,
            dead_message_backend: config.dead_message_backend,
            callbacks: Vec::new(),
        }
    }

    /// Subscribe `identity` on `service` and wrap it in a reliable channel.
    pub fn connect(
        identity: &str,
        service: D,
        config: ReliableConfig,
    ) -> Result<Self, ReliableError> {
        Ok(Self::new(Channel::connect(identity, service)?, config))
    }

    pub fn identity(&self) -> &str {
        self.channel.identity()
    }

    /// The id the next `send` will use.
    pub fn current_message_id(&self) -> &str {
        &self.current_message_id
    }

    pub fn message_cache(&self) -> &Arc<dyn MessageCache> {
        &self.message_cache
    }

    pub fn register_callback<F>(&mut self, callback: F)
    where
        F: FnMut(&Envelope) + Send + 'static,
    {
        self.callbacks.push(Box::new(callback));
    }

    /// Queue `payload` for reliable delivery to `destination` and return its
    /// message id. Nothing is transmitted until the next `synchronize`.
    pub async fn send(
        &mut self,
        destination: &str,
        payload: Value,
        extra_headers: Headers,
    ) -> Result<String, ReliableError> {
        let message_id = self.current_message_id.clone();
        let mut headers = extra_headers;
        headers.insert(
            MESSAGE_ID_HEADER.to_string(),
            Value::String(message_id.clone()),
        );

        let record = SentRecord::new(&message_id, destination, headers, payload);
        self.message_cache.store_sent(&message_id, record).await?;
        debug!("[send]: queued {message_id} for {destination}");

        self.current_message_id = generate_message_id(self.identity());
        Ok(message_id)
    }

    /// Process at most one inbound frame without waiting for one.
    ///
    /// ## Returns:
    /// - `Some(envelope)` when a new application message was delivered to the
    ///   callbacks
    /// - `None` when nothing was pending, or the frame was an ACK, a duplicate
    ///   or malformed
    ///
    /// ## Errors:
    /// - transport or storage failures; the frame is lost but cache state is
    ///   left as it was
    pub async fn receive(&mut self) -> Result<Option<Envelope>, ReliableError> {
        match self.receive_next().await? {
            Inbound::Delivered(envelope) => Ok(Some(envelope)),
            Inbound::Empty | Inbound::Consumed => Ok(None),
        }
    }

    /// Like [`receive`](Self::receive), but tells an empty queue apart from a
    /// frame that was consumed without reaching the application, so callers
    /// can drain the queue one frame at a time.
    pub async fn receive_next(&mut self) -> Result<Inbound, ReliableError> {
        let envelope = match self.channel.try_receive() {
            Ok(Some(envelope)) => envelope,
            Ok(None) => return Ok(Inbound::Empty),
            Err(e) if e.is_decode_error() => {
                warn!("[receive]: dropping malformed frame for {}: {e}", self.identity());
                return Ok(Inbound::Consumed);
            }
            Err(e) => return Err(e.into()),
        };

        let Some(envelope) = self.pre_callback(envelope).await? else {
            return Ok(Inbound::Consumed);
        };
        for callback in self.callbacks.iter_mut() {
            callback(&envelope);
        }
        Ok(Inbound::Delivered(envelope))
    }

    /// Drop the received record of `message_id`, so that the sender's next
    /// retransmission is delivered again instead of being suppressed. Used
    /// when the application failed to process a delivered envelope.
    pub async fn forget_received(&mut self, message_id: &str) -> Result<(), ReliableError> {
        self.message_cache.remove_received(message_id).await?;
        debug!("[forget_received]: {message_id} will be delivered again");
        Ok(())
    }

    /// Update the cache for an inbound envelope and decide whether it reaches
    /// the application.
    async fn pre_callback(&mut self, envelope: Envelope) -> Result<Option<Envelope>, ReliableError> {
        let Some(message_id) = envelope.message_id().map(str::to_string) else {
            warn!("[receive]: dropping envelope without {MESSAGE_ID_HEADER}");
            return Ok(None);
        };

        if envelope.is_ack() {
            if self.message_cache.is_sent_unconfirmed(&message_id).await? {
                self.message_cache.confirm_sent(&message_id).await?;
                debug!("[receive]: {message_id} confirmed");
            } else {
                debug!("[receive]: ignoring ACK for unknown or confirmed {message_id}");
            }
            return Ok(None);
        }

        let Some(source) = envelope.source() else {
            warn!("[receive]: dropping {message_id}, no source to acknowledge");
            return Ok(None);
        };
        let record = ReceivedRecord::new(
            &message_id,
            source,
            envelope.headers.clone(),
            envelope.data.clone(),
        );

        if self.message_cache.is_already_received(&message_id).await? {
            // The sender missed our ACK: owe it another one.
            self.message_cache.store_received(&message_id, record).await?;
            debug!("[receive]: duplicate {message_id}, re-arming acknowledgment");
            return Ok(None);
        }

        self.message_cache.store_received(&message_id, record).await?;
        Ok(Some(envelope))
    }

    /// Retransmit unconfirmed messages, acknowledge received ones and
    /// dead-letter whatever expired.
    pub async fn synchronize(&mut self) -> Result<SyncReport, ReliableError> {
        let now = Utc::now();
        let mut report = SyncReport::default();

        for record in self.message_cache.get_unconfirmed_sent().await? {
            if is_expired(record.timestamp, now, self.send_expiry) {
                warn!("[synchronize]: {} to {} expired, dead-lettering", record.message_id, record.destination);
                self.dead_message_backend
                    .store(&record.message_id, dead_letter_payload(&record)?, RETRY_EXPIRED)
                    .await?;
                self.message_cache.remove_sent(&record.message_id).await?;
                report.dead_lettered += 1;
                continue;
            }
            self.channel
                .send(&record.destination, &record.payload, &record.headers)
                .await?;
            report.resent += 1;
        }

        for mut record in self.message_cache.get_received_unacked().await? {
            if is_expired(record.timestamp, now, self.acknowledge_expiry) {
                warn!("[synchronize]: acknowledgment of {} expired, dead-lettering", record.message_id);
                self.dead_message_backend
                    .store(&record.message_id, dead_letter_payload(&record)?, ACKNOWLEDGE_EXPIRED)
                    .await?;
                self.message_cache.remove_received(&record.message_id).await?;
                report.dead_lettered += 1;
                continue;
            }
            self.channel
                .send(&record.source, &Value::Null, &Self::ack_headers(&record.message_id))
                .await?;
            record.status = MessageStatus::Ack;
            let message_id = record.message_id.clone();
            self.message_cache.store_received(&message_id, record).await?;
            report.acknowledged += 1;
        }

        if let Some(retention) = self.retention {
            let cutoff = chrono::Duration::from_std(retention)
                .ok()
                .and_then(|span| now.checked_sub_signed(span));
            if let Some(cutoff) = cutoff {
                report.purged = self.message_cache.purge_acknowledged_sent(cutoff).await?;
            }
        }

        if report.dead_lettered > 0 || report.purged > 0 {
            info!("[synchronize]: {} {report:?}", self.identity());
        }
        Ok(report)
    }

    fn ack_headers(message_id: &str) -> Headers {
        Headers::from([
            (MESSAGE_ID_HEADER.to_string(), Value::String(message_id.to_string())),
            (TYPE_HEADER.to_string(), Value::String(ACK_TYPE.to_string())),
        ])
    }
}
