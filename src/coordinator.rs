//! Fan-out coordinator: relays every message from one client to all the
//! other clients it coordinates.

use async_trait::async_trait;
use ds::DeliveryService;
use serde_json::Value;
use tracing::{debug, warn};

use crate::driver::NodeRole;
use crate::envelope::{Envelope, Headers};
use crate::error::ReliableError;
use crate::reliable::ReliableChannel;

/// Header carrying the identity of the client a relayed message came from.
/// `source` stays the coordinator's so that acknowledgments come back to it.
pub const ORIGIN_HEADER: &str = "origin";

pub struct Coordinator {
    clients: Vec<String>,
}

impl Coordinator {
    pub fn new<I, S>(clients: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            clients: clients.into_iter().map(Into::into).collect(),
        }
    }

    /// Queue `envelope` for every client except its sender. Returns the ids of
    /// the relayed messages.
    pub async fn fan_out<D: DeliveryService>(
        &self,
        channel: &mut ReliableChannel<D>,
        envelope: &Envelope,
    ) -> Result<Vec<String>, ReliableError> {
        let Some(origin) = envelope.source() else {
            warn!("[fan_out]: dropping envelope without source");
            return Ok(Vec::new());
        };

        let mut relayed = Vec::new();
        for client in self.clients.iter().filter(|client| *client != origin) {
            let headers = Headers::from([(
                ORIGIN_HEADER.to_string(),
                Value::String(origin.to_string()),
            )]);
            let id = channel.send(client, envelope.data.clone(), headers).await?;
            debug!("[fan_out]: relayed message from {origin} to {client} as {id}");
            relayed.push(id);
        }
        Ok(relayed)
    }
}

#[async_trait]
impl<D: DeliveryService> NodeRole<D> for Coordinator {
    async fn on_message(
        &mut self,
        channel: &mut ReliableChannel<D>,
        envelope: Envelope,
    ) -> Result<(), ReliableError> {
        self.fan_out(channel, &envelope).await?;
        Ok(())
    }
}
