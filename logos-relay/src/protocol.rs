//! JSON text protocol for the relay.
//!
//! Every WebSocket frame carries exactly one JSON object discriminated by
//! its `type` field:
//! ```text
//! {"type":"ping","peerId":"peer_…","timestamp":1700000000000}
//! {"type":"pong","timestamp":1700000000000}
//! {"type":"connected","clientId":3,"timestamp":1700000000000}
//! {"type":"doc","docId":"demo","update":"AQID","peerId":"peer_…","timestamp":…}
//! {"type":"ephemeral","docId":"demo","update":"AQID","peerId":"peer_…","timestamp":…}
//! ```
//!
//! `update` is an opaque engine payload. It travels base64-encoded inside the
//! JSON text and is raw bytes on both sides of the wire. Raw binary frames
//! are never part of the protocol.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Default relay port.
pub const DEFAULT_PORT: u16 = 30026;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Encode an opaque update for transport inside JSON text.
pub fn encode_update(update: &[u8]) -> String {
    STANDARD.encode(update)
}

/// Decode a transport-encoded update back to raw bytes.
pub fn decode_update(text: &str) -> Result<Vec<u8>, ProtocolError> {
    STANDARD
        .decode(text)
        .map_err(|e| ProtocolError::Malformed(format!("invalid base64 update: {e}")))
}

/// Which of the two forwarded payload kinds a message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    /// Durable document-engine update
    Doc,
    /// Short-lived presence state; later updates supersede earlier ones
    Ephemeral,
}

impl std::fmt::Display for UpdateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Doc => f.write_str("doc"),
            Self::Ephemeral => f.write_str("ephemeral"),
        }
    }
}

/// Body shared by `doc` and `ephemeral` messages.
///
/// Missing fields decode to empty values so that an incomplete message is
/// rejected by [`UpdatePayload::validate`] rather than by the decoder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePayload {
    #[serde(default)]
    pub doc_id: String,
    #[serde(default, with = "base64_update")]
    pub update: Vec<u8>,
    #[serde(default)]
    pub peer_id: String,
    #[serde(default)]
    pub timestamp: i64,
}

impl UpdatePayload {
    pub fn new(doc_id: impl Into<String>, update: Vec<u8>, peer_id: impl Into<String>) -> Self {
        Self {
            doc_id: doc_id.into(),
            update,
            peer_id: peer_id.into(),
            timestamp: now_millis(),
        }
    }

    /// Check the fields a relay needs before forwarding.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.doc_id.is_empty() {
            return Err(ProtocolError::EmptyDocId);
        }
        if self.peer_id.is_empty() {
            return Err(ProtocolError::EmptyPeerId);
        }
        if self.update.is_empty() {
            return Err(ProtocolError::EmptyUpdate);
        }
        Ok(())
    }
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RelayMessage {
    /// Client keep-alive
    #[serde(rename_all = "camelCase")]
    Ping { peer_id: String, timestamp: i64 },
    /// Server reply to a ping, unicast to the sender
    Pong { timestamp: i64 },
    /// Sent once per connection with the server-assigned id
    #[serde(rename_all = "camelCase")]
    Connected { client_id: u64, timestamp: i64 },
    /// Document-engine update
    Doc(UpdatePayload),
    /// Presence/ephemeral-state update
    Ephemeral(UpdatePayload),
}

/// Tags the decoder recognizes.
const KNOWN_TAGS: [&str; 5] = ["ping", "pong", "connected", "doc", "ephemeral"];

impl RelayMessage {
    pub fn ping(peer_id: impl Into<String>) -> Self {
        Self::Ping {
            peer_id: peer_id.into(),
            timestamp: now_millis(),
        }
    }

    pub fn pong() -> Self {
        Self::Pong {
            timestamp: now_millis(),
        }
    }

    pub fn connected(client_id: u64) -> Self {
        Self::Connected {
            client_id,
            timestamp: now_millis(),
        }
    }

    pub fn doc(doc_id: impl Into<String>, update: Vec<u8>, peer_id: impl Into<String>) -> Self {
        Self::Doc(UpdatePayload::new(doc_id, update, peer_id))
    }

    pub fn ephemeral(
        doc_id: impl Into<String>,
        update: Vec<u8>,
        peer_id: impl Into<String>,
    ) -> Self {
        Self::Ephemeral(UpdatePayload::new(doc_id, update, peer_id))
    }

    /// The wire tag of this message.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
            Self::Connected { .. } => "connected",
            Self::Doc(_) => "doc",
            Self::Ephemeral(_) => "ephemeral",
        }
    }

    /// The forwarded payload, if this is a `doc` or `ephemeral` message.
    pub fn update_payload(&self) -> Option<(UpdateKind, &UpdatePayload)> {
        match self {
            Self::Doc(p) => Some((UpdateKind::Doc, p)),
            Self::Ephemeral(p) => Some((UpdateKind::Ephemeral, p)),
            _ => None,
        }
    }

    /// Serialize to one JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize one JSON text frame.
    ///
    /// Unknown fields are ignored. A frame that is not a JSON object with a
    /// string `type` is malformed; a recognized object with an unrecognized
    /// tag is reported separately.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        let tag = match value.get("type") {
            Some(serde_json::Value::String(tag)) => tag.clone(),
            _ => return Err(ProtocolError::MissingType),
        };
        if !KNOWN_TAGS.contains(&tag.as_str()) {
            return Err(ProtocolError::UnknownType(tag));
        }

        serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

/// Serde adapter carrying `Vec<u8>` as a base64 string.
mod base64_update {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::encode_update(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = Option::<String>::deserialize(d)?.unwrap_or_default();
        super::decode_update(&text).map_err(serde::de::Error::custom)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("Frame has no message type")]
    MissingType,

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("Missing docId")]
    EmptyDocId,

    #[error("Missing peerId")]
    EmptyPeerId,

    #[error("Missing or empty update")]
    EmptyUpdate,

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Connection closed")]
    ConnectionClosed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doc_roundtrip_keeps_bytes() {
        let msg = RelayMessage::doc("demo", vec![1, 2, 3], "A");
        let encoded = msg.encode().unwrap();
        let decoded = RelayMessage::decode(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_update_is_base64_on_the_wire() {
        let msg = RelayMessage::ephemeral("demo", vec![1, 2, 3], "A");
        let json: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "ephemeral");
        assert_eq!(json["docId"], "demo");
        assert_eq!(json["peerId"], "A");
        assert_eq!(json["update"], "AQID");
    }

    #[test]
    fn test_connected_field_names() {
        let json: serde_json::Value =
            serde_json::from_str(&RelayMessage::connected(7).encode().unwrap()).unwrap();
        assert_eq!(json["type"], "connected");
        assert_eq!(json["clientId"], 7);
        assert!(json["timestamp"].as_i64().unwrap() > 0);
    }

    #[test]
    fn test_decode_ping_from_js_client() {
        let text = r#"{"type":"ping","peerId":"peer_abc","timestamp":1700000000000}"#;
        match RelayMessage::decode(text).unwrap() {
            RelayMessage::Ping { peer_id, timestamp } => {
                assert_eq!(peer_id, "peer_abc");
                assert_eq!(timestamp, 1_700_000_000_000);
            }
            other => panic!("expected ping, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let text = r#"{"type":"pong","timestamp":5,"server":"x","extra":[1,2]}"#;
        assert_eq!(
            RelayMessage::decode(text).unwrap(),
            RelayMessage::Pong { timestamp: 5 }
        );
    }

    #[test]
    fn test_decode_non_json() {
        assert!(matches!(
            RelayMessage::decode("not json at all"),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_missing_type() {
        assert_eq!(
            RelayMessage::decode(r#"{"docId":"demo"}"#),
            Err(ProtocolError::MissingType)
        );
        assert_eq!(RelayMessage::decode("[1,2,3]"), Err(ProtocolError::MissingType));
    }

    #[test]
    fn test_decode_unknown_type() {
        assert_eq!(
            RelayMessage::decode(r#"{"type":"snapshot","timestamp":1}"#),
            Err(ProtocolError::UnknownType("snapshot".into()))
        );
    }

    #[test]
    fn test_decode_invalid_base64() {
        let text = r#"{"type":"doc","docId":"d","update":"%%%","peerId":"p","timestamp":1}"#;
        assert!(matches!(
            RelayMessage::decode(text),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_missing_update_fields_fail_validation_not_decode() {
        let text = r#"{"type":"doc","docId":"demo","peerId":"A"}"#;
        let msg = RelayMessage::decode(text).unwrap();
        let (kind, payload) = msg.update_payload().unwrap();
        assert_eq!(kind, UpdateKind::Doc);
        assert_eq!(payload.validate(), Err(ProtocolError::EmptyUpdate));
    }

    #[test]
    fn test_validate() {
        assert!(UpdatePayload::new("demo", vec![1], "A").validate().is_ok());
        assert_eq!(
            UpdatePayload::new("", vec![1], "A").validate(),
            Err(ProtocolError::EmptyDocId)
        );
        assert_eq!(
            UpdatePayload::new("demo", vec![1], "").validate(),
            Err(ProtocolError::EmptyPeerId)
        );
        assert_eq!(
            UpdatePayload::new("demo", Vec::new(), "A").validate(),
            Err(ProtocolError::EmptyUpdate)
        );
    }

    #[test]
    fn test_base64_helpers() {
        assert_eq!(encode_update(&[0xFF, 0x00, 0x10]), "/wAQ");
        assert_eq!(decode_update("/wAQ").unwrap(), vec![0xFF, 0x00, 0x10]);
        assert!(decode_update("not base64!").is_err());
    }

    #[test]
    fn test_large_update() {
        let update = vec![42u8; 65536];
        let msg = RelayMessage::doc("demo", update.clone(), "A");
        let decoded = RelayMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.update_payload().unwrap().1.update, update);
    }

    #[test]
    fn test_tags() {
        assert_eq!(RelayMessage::ping("p").tag(), "ping");
        assert_eq!(RelayMessage::pong().tag(), "pong");
        assert_eq!(RelayMessage::connected(1).tag(), "connected");
        assert_eq!(RelayMessage::doc("d", vec![1], "p").tag(), "doc");
        assert_eq!(RelayMessage::ephemeral("d", vec![1], "p").tag(), "ephemeral");
        assert_eq!(UpdateKind::Ephemeral.to_string(), "ephemeral");
    }
}
