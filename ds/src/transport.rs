//! Transport-agnostic delivery service interface.
//!
//! A delivery service is a best-effort broadcast bus: every published frame
//! is offered to every subscription whose prefix matches it. Nothing is
//! acknowledged, ordered or deduplicated at this level.

use std::future::Future;
use std::sync::{mpsc, Arc, Mutex};

use tracing::{debug, error};

use crate::DeliveryServiceError;

/// Capacity of each subscription queue. Frames arriving at a full queue are
/// dropped, which is within the contract of a best-effort transport.
pub const SUBSCRIPTION_CAPACITY: usize = 1024;

pub trait DeliveryService: Send + Sync + 'static {
    /// Publish a raw frame to every subscriber. Fire-and-forget.
    fn publish(&self, frame: Vec<u8>)
        -> impl Future<Output = Result<(), DeliveryServiceError>> + Send;

    /// Subscribe to frames starting with `prefix`.
    ///
    /// The returned receiver is polled with `try_recv`, which never blocks.
    /// Senders are pruned when the corresponding receiver is dropped, but only
    /// during the next dispatch.
    fn subscribe(&self, prefix: &[u8]) -> Result<mpsc::Receiver<Vec<u8>>, DeliveryServiceError>;
}

struct Subscriber {
    prefix: Vec<u8>,
    tx: mpsc::SyncSender<Vec<u8>>,
}

/// Prefix-filtered fan-out shared by the delivery service implementations.
#[derive(Clone, Default)]
pub(crate) struct SubscriberRegistry {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
}

impl SubscriberRegistry {
    pub(crate) fn register(
        &self,
        prefix: &[u8],
    ) -> Result<mpsc::Receiver<Vec<u8>>, DeliveryServiceError> {
        let (tx, rx) = mpsc::sync_channel(SUBSCRIPTION_CAPACITY);
        self.subscribers
            .lock()
            .map_err(|_| DeliveryServiceError::RegistryPoisoned)?
            .push(Subscriber {
                prefix: prefix.to_vec(),
                tx,
            });
        Ok(rx)
    }

    /// Hand `frame` to every matching subscriber.
    pub(crate) fn dispatch(&self, frame: &[u8]) {
        let mut guard = match self.subscribers.lock() {
            Ok(g) => g,
            Err(e) => {
                error!("Subscriber mutex poisoned: {e}");
                return;
            }
        };
        guard.retain(|sub| {
            if !frame.starts_with(&sub.prefix) {
                return true;
            }
            match sub.tx.try_send(frame.to_vec()) {
                Ok(()) => true,
                Err(mpsc::TrySendError::Full(_)) => {
                    debug!("Subscription queue full, dropping frame");
                    true
                }
                Err(mpsc::TrySendError::Disconnected(_)) => false,
            }
        });
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.subscribers.lock().map(|g| g.len()).unwrap_or(0)
    }
}
