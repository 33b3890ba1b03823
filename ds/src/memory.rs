//! In-process broadcast bus.

use std::sync::{mpsc, Arc, Mutex};

use tracing::debug;

use crate::transport::{DeliveryService, SubscriberRegistry};
use crate::DeliveryServiceError;

/// Predicate deciding whether a published frame is lost in transit.
pub type LossFilter = Box<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// Delivery service that fans frames out to subscribers living in the same
/// process. Clones share the same bus.
///
/// A loss filter can be installed to simulate an unreliable network: every
/// frame for which it returns `true` is silently discarded.
#[derive(Clone, Default)]
pub struct MemoryDeliveryService {
    registry: SubscriberRegistry,
    loss: Arc<Mutex<Option<LossFilter>>>,
}

impl MemoryDeliveryService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install (or clear, with `None`) the loss filter.
    pub fn set_loss_filter(&self, filter: Option<LossFilter>) {
        if let Ok(mut guard) = self.loss.lock() {
            *guard = filter;
        }
    }

    fn is_lost(&self, frame: &[u8]) -> bool {
        self.loss
            .lock()
            .ok()
            .and_then(|guard| guard.as_ref().map(|f| f(frame)))
            .unwrap_or(false)
    }
}

impl DeliveryService for MemoryDeliveryService {
    async fn publish(&self, frame: Vec<u8>) -> Result<(), DeliveryServiceError> {
        if self.is_lost(&frame) {
            debug!("Dropping frame of {} bytes", frame.len());
            return Ok(());
        }
        self.registry.dispatch(&frame);
        Ok(())
    }

    fn subscribe(&self, prefix: &[u8]) -> Result<mpsc::Receiver<Vec<u8>>, DeliveryServiceError> {
        self.registry.register(prefix)
    }
}
