//! Identity-addressed channel over a broadcast delivery service.
//!
//! Frames on the wire look like `<destination>::<body>`. Each channel only
//! subscribes to frames prefixed with its own identity and strips that prefix
//! before handing the body up.

use std::sync::{
    mpsc::{self, TryRecvError},
    Mutex,
};

use ds::DeliveryService;
use tracing::debug;

use crate::error::ChannelError;

/// Separator between the destination identity and the frame body.
pub const ADDRESS_SEPARATOR: &str = "::";

pub fn frame_for(destination: &str, body: &str) -> String {
    format!("{destination}{ADDRESS_SEPARATOR}{body}")
}

pub struct Channel<D: DeliveryService> {
    identity: String,
    service: D,
    // Behind a mutex so that `&Channel` can be held across an await.
    inbound: Mutex<mpsc::Receiver<Vec<u8>>>,
}

impl<D: DeliveryService> Channel<D> {
    /// Subscribe to `<identity>::` on `service`. The subscription lives as long
    /// as the channel.
    pub fn connect(identity: &str, service: D) -> Result<Self, ChannelError> {
        let inbound = service.subscribe(Self::subscription(identity).as_bytes())?;
        debug!("Channel {identity} subscribed");
        Ok(Self {
            identity: identity.to_string(),
            service,
            inbound: Mutex::new(inbound),
        })
    }

    fn subscription(identity: &str) -> String {
        format!("{identity}{ADDRESS_SEPARATOR}")
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub async fn send(&self, destination: &str, body: &str) -> Result<(), ChannelError> {
        self.service
            .publish(frame_for(destination, body).into_bytes())
            .await?;
        Ok(())
    }

    /// Non-blocking poll for one frame body. `Ok(None)` means nothing is
    /// pending.
    pub fn try_receive(&self) -> Result<Option<String>, ChannelError> {
        let inbound = self
            .inbound
            .lock()
            .map_err(|_| ChannelError::TransportClosed)?;
        let frame = match inbound.try_recv() {
            Ok(frame) => frame,
            Err(TryRecvError::Empty) => return Ok(None),
            Err(TryRecvError::Disconnected) => return Err(ChannelError::TransportClosed),
        };
        let prefix_len = self.identity.len() + ADDRESS_SEPARATOR.len();
        let body = frame.get(prefix_len..).unwrap_or_default().to_vec();
        Ok(Some(String::from_utf8(body)?))
    }
}
