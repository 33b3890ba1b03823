//! JSON envelopes: `{"headers": {...}, "data": <payload>}`.

use std::collections::BTreeMap;

use ds::DeliveryService;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::channel::Channel;
use crate::error::ChannelError;

pub const SOURCE_HEADER: &str = "source";
pub const DESTINATION_HEADER: &str = "destination";
pub const MESSAGE_ID_HEADER: &str = "message_id";
pub const TYPE_HEADER: &str = "type";
pub const ACK_TYPE: &str = "ACK";

/// Header map. Values are JSON scalars in practice, but any JSON value
/// round-trips.
pub type Headers = BTreeMap<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(headers: Headers, data: Value) -> Self {
        Self { headers, data }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(raw: &str) -> Result<Self, ChannelError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// String value of header `name`, if present and a string.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(Value::as_str)
    }

    pub fn message_id(&self) -> Option<&str> {
        self.header(MESSAGE_ID_HEADER)
    }

    pub fn source(&self) -> Option<&str> {
        self.header(SOURCE_HEADER)
    }

    pub fn destination(&self) -> Option<&str> {
        self.header(DESTINATION_HEADER)
    }

    pub fn is_ack(&self) -> bool {
        self.header(TYPE_HEADER) == Some(ACK_TYPE)
    }
}

/// Channel that speaks envelopes on top of an addressed [`Channel`].
pub struct EnvelopeChannel<D: DeliveryService> {
    channel: Channel<D>,
    default_headers: Headers,
}

impl<D: DeliveryService> EnvelopeChannel<D> {
    /// `source` is always part of the defaults; entries in `default_headers`
    /// are merged over it.
    pub fn new(channel: Channel<D>, default_headers: Headers) -> Self {
        let mut defaults = Headers::new();
        defaults.insert(
            SOURCE_HEADER.to_string(),
            Value::String(channel.identity().to_string()),
        );
        defaults.extend(default_headers);
        Self {
            channel,
            default_headers: defaults,
        }
    }

    pub fn identity(&self) -> &str {
        self.channel.identity()
    }

    /// Build the outgoing headers: defaults, then `extra_headers`, then the
    /// destination.
    pub fn build_headers(&self, destination: &str, extra_headers: &Headers) -> Headers {
        let mut headers = self.default_headers.clone();
        headers.extend(extra_headers.iter().map(|(k, v)| (k.clone(), v.clone())));
        headers.insert(
            DESTINATION_HEADER.to_string(),
            Value::String(destination.to_string()),
        );
        headers
    }

    pub async fn send(
        &self,
        destination: &str,
        data: &Value,
        extra_headers: &Headers,
    ) -> Result<(), ChannelError> {
        let envelope = Envelope::new(self.build_headers(destination, extra_headers), data.clone());
        self.channel.send(destination, &envelope.encode()?).await
    }

    /// Non-blocking poll for one envelope.
    pub fn try_receive(&self) -> Result<Option<Envelope>, ChannelError> {
        match self.channel.try_receive()? {
            Some(raw) => Ok(Some(Envelope::decode(&raw)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use ds::MemoryDeliveryService;
    use serde_json::json;

    use super::*;

    fn headers(pairs: &[(&str, Value)]) -> Headers {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_round_trip_preserves_headers_and_data() {
        let envelope = Envelope::new(
            headers(&[
                ("message_id", json!("a:::1")),
                ("priority", json!(3)),
                ("urgent", json!(true)),
            ]),
            json!({"text": "hi", "list": [1, 2, {"nested": null}]}),
        );

        let decoded = Envelope::decode(&envelope.encode().unwrap()).unwrap();

        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_malformed_json_is_a_decode_error() {
        let err = Envelope::decode("{not json").unwrap_err();
        assert!(err.is_decode_error());
    }

    #[tokio::test]
    async fn test_headers_merge_order() {
        let bus = MemoryDeliveryService::new();
        let channel = Channel::connect("alice", bus.clone()).unwrap();
        let alice = EnvelopeChannel::new(channel, headers(&[("app", json!("chat"))]));

        let built = alice.build_headers(
            "bob",
            &headers(&[("app", json!("override")), ("destination", json!("mallory"))]),
        );

        assert_eq!(built.get("source"), Some(&json!("alice")));
        assert_eq!(built.get("app"), Some(&json!("override")));
        assert_eq!(built.get("destination"), Some(&json!("bob")));
    }

    #[tokio::test]
    async fn test_send_and_receive_envelope() {
        let bus = MemoryDeliveryService::new();
        let alice = EnvelopeChannel::new(Channel::connect("alice", bus.clone()).unwrap(), Headers::new());
        let bob = EnvelopeChannel::new(Channel::connect("bob", bus.clone()).unwrap(), Headers::new());

        alice
            .send("bob", &json!("payload"), &headers(&[("message_id", json!("x"))]))
            .await
            .unwrap();

        let received = bob.try_receive().unwrap().unwrap();
        assert_eq!(received.data, json!("payload"));
        assert_eq!(received.source(), Some("alice"));
        assert_eq!(received.destination(), Some("bob"));
        assert_eq!(received.message_id(), Some("x"));
        assert!(!received.is_ack());
        assert!(bob.try_receive().unwrap().is_none());
    }
}
