//! Chat client role: lines typed by the user go to the coordinator, relayed
//! messages are rendered with the name of the client that wrote them.

use async_trait::async_trait;
use ds::DeliveryService;
use serde_json::Value;
use tokio::sync::mpsc::{error::TryRecvError, UnboundedReceiver};
use tracing::{debug, info};

use crate::coordinator::ORIGIN_HEADER;
use crate::driver::NodeRole;
use crate::envelope::{Envelope, Headers};
use crate::error::ReliableError;
use crate::reliable::ReliableChannel;

pub struct ChatClient {
    coordinator: String,
    lines: UnboundedReceiver<String>,
    closed: bool,
}

impl ChatClient {
    pub fn new(coordinator: &str, lines: UnboundedReceiver<String>) -> Self {
        Self {
            coordinator: coordinator.to_string(),
            lines,
            closed: false,
        }
    }

    /// Whether the input side has gone away.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// `<author>: <text>` for a delivered chat message.
pub fn render(envelope: &Envelope) -> String {
    let author = envelope
        .header(ORIGIN_HEADER)
        .or_else(|| envelope.source())
        .unwrap_or("?");
    match &envelope.data {
        Value::String(text) => format!("{author}: {text}"),
        other => format!("{author}: {other}"),
    }
}

#[async_trait]
impl<D: DeliveryService> NodeRole<D> for ChatClient {
    async fn on_tick(&mut self, channel: &mut ReliableChannel<D>) -> Result<(), ReliableError> {
        loop {
            let line = match self.lines.try_recv() {
                Ok(line) => line,
                Err(TryRecvError::Empty) => return Ok(()),
                Err(TryRecvError::Disconnected) => {
                    if !self.closed {
                        info!("[on_tick]: input closed");
                        self.closed = true;
                    }
                    return Ok(());
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            let id = channel
                .send(&self.coordinator, Value::String(line), Headers::new())
                .await?;
            debug!("[on_tick]: queued {id}");
        }
    }

    /// Once input is closed, keep going until every line is confirmed or
    /// dead-lettered by the send expiry.
    async fn is_done(&mut self, channel: &mut ReliableChannel<D>) -> Result<bool, ReliableError> {
        if !self.closed {
            return Ok(false);
        }
        let pending = channel.message_cache().get_unconfirmed_sent().await?.len();
        if pending > 0 {
            debug!("[is_done]: waiting on {pending} unconfirmed lines");
        }
        Ok(pending == 0)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use ds::MemoryDeliveryService;
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::driver::{run_driver, IntervalScheduler, Passive};
    use crate::reliable::ReliableConfig;

    #[test]
    fn test_render_prefers_origin() {
        let relayed = Envelope::new(
            Headers::from([
                ("source".to_string(), json!("hub")),
                ("origin".to_string(), json!("alice")),
            ]),
            json!("hi"),
        );
        let direct = Envelope::new(Headers::from([("source".to_string(), json!("hub"))]), json!(7));

        assert_eq!(render(&relayed), "alice: hi");
        assert_eq!(render(&direct), "hub: 7");
    }

    #[tokio::test]
    async fn test_lines_are_queued_for_the_coordinator() {
        let bus = MemoryDeliveryService::new();
        let mut alice =
            ReliableChannel::connect("alice", bus.clone(), ReliableConfig::default()).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut client = ChatClient::new("hub", rx);

        tx.send("hello".to_string()).unwrap();
        tx.send("   ".to_string()).unwrap();
        drop(tx);
        client.on_tick(&mut alice).await.unwrap();

        let pending = alice.message_cache().get_unconfirmed_sent().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].destination, "hub");
        assert_eq!(pending[0].payload, json!("hello"));
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn test_closed_input_waits_for_confirmation() {
        let bus = MemoryDeliveryService::new();
        let mut alice =
            ReliableChannel::connect("alice", bus.clone(), ReliableConfig::default()).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut client = ChatClient::new("hub", rx);

        assert!(!client.is_done(&mut alice).await.unwrap());

        tx.send("bye".to_string()).unwrap();
        drop(tx);
        client.on_tick(&mut alice).await.unwrap();
        assert!(client.is_closed());
        assert!(!client.is_done(&mut alice).await.unwrap());

        let pending = alice.message_cache().get_unconfirmed_sent().await.unwrap();
        alice.message_cache().confirm_sent(&pending[0].message_id).await.unwrap();
        assert!(client.is_done(&mut alice).await.unwrap());
    }

    #[tokio::test]
    async fn test_last_line_is_delivered_before_the_client_stops() {
        let bus = MemoryDeliveryService::new();
        let mut alice =
            ReliableChannel::connect("alice", bus.clone(), ReliableConfig::default()).unwrap();
        let mut hub = ReliableChannel::connect("hub", bus.clone(), ReliableConfig::default()).unwrap();
        let received = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = received.clone();
        hub.register_callback(move |envelope| sink.lock().unwrap().push(envelope.data.clone()));

        let token = CancellationToken::new();
        let hub_token = token.clone();
        let hub_task = tokio::spawn(async move {
            let mut scheduler = IntervalScheduler::new(Duration::from_millis(10));
            run_driver(&mut hub, &mut scheduler, &mut Passive, hub_token).await;
        });

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send("last words".to_string()).unwrap();
        drop(tx);
        let mut client = ChatClient::new("hub", rx);
        let mut scheduler = IntervalScheduler::new(Duration::from_millis(10));
        tokio::time::timeout(
            Duration::from_secs(5),
            run_driver(&mut alice, &mut scheduler, &mut client, CancellationToken::new()),
        )
        .await
        .expect("Failed to stop once the line was confirmed");
        token.cancel();
        hub_task.await.unwrap();

        assert_eq!(*received.lock().unwrap(), vec![json!("last words")]);
        assert!(alice.message_cache().get_unconfirmed_sent().await.unwrap().is_empty());
    }
}
