//! Tick loop driving a [`ReliableChannel`].
//!
//! Each tick lets the node role act, hands every pending inbound frame to the
//! role as it is received and then synchronizes. Errors are logged and the
//! loop carries on with the next tick. It stops on cancellation, or once the
//! role reports that it is done.

use std::time::Duration;

use async_trait::async_trait;
use ds::DeliveryService;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::envelope::Envelope;
use crate::error::ReliableError;
use crate::reliable::{Inbound, ReliableChannel, SyncReport};

/// Default interval between two synchronizations.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Controls when the next tick fires.
#[async_trait]
pub trait SyncScheduler: Send {
    /// Wait until the next tick should run.
    async fn next_tick(&mut self);
}

pub struct IntervalScheduler {
    interval: tokio::time::Interval,
}

impl IntervalScheduler {
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        Self { interval }
    }
}

impl Default for IntervalScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_TICK_INTERVAL)
    }
}

#[async_trait]
impl SyncScheduler for IntervalScheduler {
    async fn next_tick(&mut self) {
        self.interval.tick().await;
    }
}

/// Application behavior plugged into the driver.
#[async_trait]
pub trait NodeRole<D: DeliveryService>: Send {
    /// Called at the start of every tick, before inbound frames are drained.
    async fn on_tick(&mut self, _channel: &mut ReliableChannel<D>) -> Result<(), ReliableError> {
        Ok(())
    }

    /// Called for every newly delivered envelope, after the channel callbacks.
    async fn on_message(
        &mut self,
        _channel: &mut ReliableChannel<D>,
        _envelope: Envelope,
    ) -> Result<(), ReliableError> {
        Ok(())
    }

    /// Checked after every successful tick. Returning `true` stops the driver.
    async fn is_done(&mut self, _channel: &mut ReliableChannel<D>) -> Result<bool, ReliableError> {
        Ok(false)
    }
}

/// Role that only relies on the channel callbacks.
pub struct Passive;

impl<D: DeliveryService> NodeRole<D> for Passive {}

/// Run one tick: role hook, inbound frames, synchronize.
///
/// Each delivered envelope reaches the role before the next frame is read, so
/// a failure on a later frame never loses an earlier one. When the role fails
/// on an envelope, its received record is dropped and the sender's
/// retransmission is delivered again.
pub async fn tick<D, R>(
    channel: &mut ReliableChannel<D>,
    role: &mut R,
) -> Result<SyncReport, ReliableError>
where
    D: DeliveryService,
    R: NodeRole<D>,
{
    role.on_tick(channel).await?;
    loop {
        let envelope = match channel.receive_next().await? {
            Inbound::Empty => break,
            Inbound::Consumed => continue,
            Inbound::Delivered(envelope) => envelope,
        };
        let message_id = envelope.message_id().map(str::to_string);
        if let Err(e) = role.on_message(channel, envelope).await {
            if let Some(message_id) = message_id {
                channel.forget_received(&message_id).await?;
            }
            return Err(e);
        }
    }
    channel.synchronize().await
}

pub async fn run_driver<D, S, R>(
    channel: &mut ReliableChannel<D>,
    scheduler: &mut S,
    role: &mut R,
    token: CancellationToken,
) where
    D: DeliveryService,
    S: SyncScheduler,
    R: NodeRole<D>,
{
    info!("[run_driver]: started for {}", channel.identity());
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = scheduler.next_tick() => {
                if let Err(e) = tick(channel, role).await {
                    error!("[run_driver]: tick failed for {}: {e}", channel.identity());
                    continue;
                }
                match role.is_done(channel).await {
                    Ok(true) => break,
                    Ok(false) => {}
                    Err(e) => error!("[run_driver]: done check failed for {}: {e}", channel.identity()),
                }
            }
        }
    }
    info!("[run_driver]: stopped for {}", channel.identity());
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use chrono::{DateTime, Utc};
    use ds::MemoryDeliveryService;
    use serde_json::json;

    use super::*;
    use crate::cache::{
        MemoryMessageCache, MessageCache, OrderedMemoryMessageCache, ReceivedRecord, SentRecord,
    };
    use crate::envelope::Headers;
    use crate::error::StorageError;
    use crate::reliable::ReliableConfig;

    /// Memory cache whose `store_received` fails once, on the given call.
    struct FlakyCache {
        inner: MemoryMessageCache,
        calls: AtomicUsize,
        fail_on: usize,
    }

    impl FlakyCache {
        fn new(fail_on: usize) -> Self {
            Self {
                inner: MemoryMessageCache::new(),
                calls: AtomicUsize::new(0),
                fail_on,
            }
        }
    }

    #[async_trait]
    impl MessageCache for FlakyCache {
        async fn store_sent(&self, message_id: &str, record: SentRecord) -> Result<(), StorageError> {
            self.inner.store_sent(message_id, record).await
        }

        async fn get_unconfirmed_sent(&self) -> Result<Vec<SentRecord>, StorageError> {
            self.inner.get_unconfirmed_sent().await
        }

        async fn confirm_sent(&self, message_id: &str) -> Result<(), StorageError> {
            self.inner.confirm_sent(message_id).await
        }

        async fn is_sent_unconfirmed(&self, message_id: &str) -> Result<bool, StorageError> {
            self.inner.is_sent_unconfirmed(message_id).await
        }

        async fn store_received(
            &self,
            message_id: &str,
            record: ReceivedRecord,
        ) -> Result<(), StorageError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_on {
                return Err(StorageError::UnknownMessage("transient".to_string()));
            }
            self.inner.store_received(message_id, record).await
        }

        async fn get_received_unacked(&self) -> Result<Vec<ReceivedRecord>, StorageError> {
            self.inner.get_received_unacked().await
        }

        async fn is_already_received(&self, message_id: &str) -> Result<bool, StorageError> {
            self.inner.is_already_received(message_id).await
        }

        async fn remove_sent(&self, message_id: &str) -> Result<(), StorageError> {
            self.inner.remove_sent(message_id).await
        }

        async fn remove_received(&self, message_id: &str) -> Result<(), StorageError> {
            self.inner.remove_received(message_id).await
        }

        async fn purge_acknowledged_sent(&self, cutoff: DateTime<Utc>) -> Result<usize, StorageError> {
            self.inner.purge_acknowledged_sent(cutoff).await
        }
    }

    /// Fails on the first envelope it is handed, then records.
    struct FailsOnce {
        attempts: usize,
        seen: Vec<Envelope>,
    }

    #[async_trait]
    impl<D: DeliveryService> NodeRole<D> for FailsOnce {
        async fn on_message(
            &mut self,
            _channel: &mut ReliableChannel<D>,
            envelope: Envelope,
        ) -> Result<(), ReliableError> {
            self.attempts += 1;
            if self.attempts == 1 {
                return Err(StorageError::UnknownMessage("busy".to_string()).into());
            }
            self.seen.push(envelope);
            Ok(())
        }
    }

    /// Done after a fixed number of ticks.
    struct Countdown(usize);

    #[async_trait]
    impl<D: DeliveryService> NodeRole<D> for Countdown {
        async fn is_done(&mut self, _channel: &mut ReliableChannel<D>) -> Result<bool, ReliableError> {
            self.0 = self.0.saturating_sub(1);
            Ok(self.0 == 0)
        }
    }

    struct Recorder(Arc<Mutex<Vec<Envelope>>>);

    #[async_trait]
    impl<D: DeliveryService> NodeRole<D> for Recorder {
        async fn on_message(
            &mut self,
            _channel: &mut ReliableChannel<D>,
            envelope: Envelope,
        ) -> Result<(), ReliableError> {
            self.0.lock().unwrap().push(envelope);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_tick_drains_every_pending_frame() {
        let bus = MemoryDeliveryService::new();
        let mut alice =
            ReliableChannel::connect("alice", bus.clone(), ReliableConfig::default()).unwrap();
        let mut bob =
            ReliableChannel::connect("bob", bus.clone(), ReliableConfig::default()).unwrap();

        for i in 0..3 {
            alice.send("bob", json!(i), Headers::new()).await.unwrap();
        }
        let report = tick(&mut alice, &mut Passive).await.unwrap();
        assert_eq!(report.resent, 3);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let report = tick(&mut bob, &mut Recorder(seen.clone())).await.unwrap();

        assert_eq!(seen.lock().unwrap().len(), 3);
        assert_eq!(report.acknowledged, 3);
    }

    #[tokio::test]
    async fn test_driver_stops_on_cancellation() {
        let bus = MemoryDeliveryService::new();
        let mut alice =
            ReliableChannel::connect("alice", bus.clone(), ReliableConfig::default()).unwrap();
        let mut bob =
            ReliableChannel::connect("bob", bus.clone(), ReliableConfig::default()).unwrap();
        let id = alice.send("bob", json!("hi"), Headers::new()).await.unwrap();

        let token = CancellationToken::new();
        let bob_token = token.clone();
        let bob_task = tokio::spawn(async move {
            let mut scheduler = IntervalScheduler::new(Duration::from_millis(10));
            run_driver(&mut bob, &mut scheduler, &mut Passive, bob_token).await;
        });

        let mut scheduler = IntervalScheduler::new(Duration::from_millis(10));
        for _ in 0..50 {
            scheduler.next_tick().await;
            tick(&mut alice, &mut Passive).await.unwrap();
            if !alice.message_cache().is_sent_unconfirmed(&id).await.unwrap() {
                break;
            }
        }
        token.cancel();
        bob_task.await.unwrap();

        assert!(!alice.message_cache().is_sent_unconfirmed(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_storage_failure_keeps_envelopes_already_delivered() {
        let bus = MemoryDeliveryService::new();
        let mut alice = ReliableChannel::connect(
            "alice",
            bus.clone(),
            ReliableConfig::default().with_message_cache(Arc::new(OrderedMemoryMessageCache::new())),
        )
        .unwrap();
        let mut hub = ReliableChannel::connect(
            "hub",
            bus.clone(),
            ReliableConfig::default().with_message_cache(Arc::new(FlakyCache::new(2))),
        )
        .unwrap();

        let first = alice.send("hub", json!("m1"), Headers::new()).await.unwrap();
        let second = alice.send("hub", json!("m2"), Headers::new()).await.unwrap();
        alice.synchronize().await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut recorder = Recorder(seen.clone());
        assert!(tick(&mut hub, &mut recorder).await.is_err());
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(seen.lock().unwrap()[0].message_id(), Some(first.as_str()));

        for _ in 0..5 {
            tick(&mut alice, &mut Passive).await.unwrap();
            tick(&mut hub, &mut recorder).await.unwrap();
        }
        tick(&mut alice, &mut Passive).await.unwrap();

        let ids: Vec<_> = seen
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| e.message_id().map(str::to_string))
            .collect();
        assert_eq!(ids, vec![first, second]);
        assert!(alice.message_cache().get_unconfirmed_sent().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_message_is_redelivered_after_role_failure() {
        let bus = MemoryDeliveryService::new();
        let mut alice =
            ReliableChannel::connect("alice", bus.clone(), ReliableConfig::default()).unwrap();
        let mut bob =
            ReliableChannel::connect("bob", bus.clone(), ReliableConfig::default()).unwrap();
        let mut role = FailsOnce {
            attempts: 0,
            seen: Vec::new(),
        };

        let id = alice.send("bob", json!("retry me"), Headers::new()).await.unwrap();
        tick(&mut alice, &mut Passive).await.unwrap();
        assert!(tick(&mut bob, &mut role).await.is_err());
        assert!(!bob.message_cache().is_already_received(&id).await.unwrap());

        tick(&mut alice, &mut Passive).await.unwrap();
        tick(&mut bob, &mut role).await.unwrap();
        tick(&mut alice, &mut Passive).await.unwrap();

        assert_eq!(role.attempts, 2);
        assert_eq!(role.seen.len(), 1);
        assert_eq!(role.seen[0].data, json!("retry me"));
        assert!(!alice.message_cache().is_sent_unconfirmed(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_driver_returns_once_role_is_done() {
        let bus = MemoryDeliveryService::new();
        let mut alice =
            ReliableChannel::connect("alice", bus.clone(), ReliableConfig::default()).unwrap();
        let mut scheduler = IntervalScheduler::new(Duration::from_millis(5));
        let mut role = Countdown(3);

        tokio::time::timeout(
            Duration::from_secs(5),
            run_driver(&mut alice, &mut scheduler, &mut role, CancellationToken::new()),
        )
        .await
        .expect("Failed to stop the driver without cancellation");

        assert_eq!(role.0, 0);
    }
}
