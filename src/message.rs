/// Wire message — the one shape every transport carries.
///
/// Inbound, `type` is the routing key and everything else is optional.
/// Outbound, the hub stamps `timestamp` (milliseconds since epoch) at send
/// time. Unknown JSON fields are ignored on decode; absent optionals are
/// omitted on encode.
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Reserved event types. Handlers must not register these — the kernel
/// produces them itself.
pub const SYSTEM_ACK: &str = "system:ack";
pub const SYSTEM_ERROR: &str = "system:error";
pub const SYSTEM_REPLY: &str = "system:reply";

/// Envelope-level target: a single client id or a list of them.
///
/// Parsed and re-serialized faithfully, but no core path routes on it —
/// only the signaling bridge inspects `payload.target`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Target {
    One(String),
    Many(Vec<String>),
}

/// A routed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Routing key. Must be non-empty.
    #[serde(rename = "type")]
    pub kind: String,
    /// Arbitrary structured payload.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Target>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    /// Correlation token supplied by the sender, echoed back as `system:ack`
    /// after dispatch. Any JSON scalar; `Null` means no ack requested.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub ack: Value,
    /// Stamped by the hub on every outbound message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

/// Errors that can occur decoding a wire message.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("message has empty type")]
    EmptyType,
}

impl Message {
    /// Build a message with just a type and payload.
    pub fn event(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            target: None,
            room: None,
            ack: Value::Null,
            timestamp: None,
        }
    }

    /// `system:ack` carrying the sender's correlation token.
    pub fn ack(token: Value) -> Self {
        Self::event(SYSTEM_ACK, json!({ "ack": token }))
    }

    /// `system:error` with a human message and optional detail string.
    pub fn error(text: &str, details: Option<String>) -> Self {
        let payload = match details {
            Some(d) => json!({ "message": text, "details": d }),
            None => json!({ "message": text }),
        };
        Self::event(SYSTEM_ERROR, payload)
    }

    /// `system:reply` wrapping a plain text message.
    pub fn reply_text(text: &str) -> Self {
        Self::event(SYSTEM_REPLY, json!({ "message": text }))
    }

    /// Whether the sender asked for an acknowledgement.
    pub fn wants_ack(&self) -> bool {
        !self.ack.is_null()
    }

    /// Decode from a JSON string, rejecting empty routing keys.
    pub fn from_json(s: &str) -> Result<Self, ParseError> {
        let msg: Message = serde_json::from_str(s)?;
        if msg.kind.is_empty() {
            return Err(ParseError::EmptyType);
        }
        Ok(msg)
    }

    /// Serialize to a JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn decode_minimal() {
        let msg = Message::from_json(r#"{"type":"chat:message"}"#).unwrap();
        assert_eq!(msg.kind, "chat:message");
        assert!(msg.payload.is_null());
        assert_eq!(msg.room, None);
        assert!(!msg.wants_ack());
    }

    #[test]
    fn decode_full() {
        let msg = Message::from_json(
            r#"{"type":"chat:message","payload":{"body":"hi"},"room":"Lobby","ack":"7"}"#,
        )
        .unwrap();
        assert_eq!(msg.payload["body"], "hi");
        assert_eq!(msg.room.as_deref(), Some("Lobby"));
        assert_eq!(msg.ack, json!("7"));
        assert!(msg.wants_ack());
    }

    #[test]
    fn decode_rejects_missing_type() {
        assert!(Message::from_json(r#"{"payload":1}"#).is_err());
    }

    #[test]
    fn decode_rejects_empty_type() {
        let err = Message::from_json(r#"{"type":""}"#).unwrap_err();
        assert!(matches!(err, ParseError::EmptyType));
    }

    #[test]
    fn decode_ignores_unknown_fields() {
        let msg = Message::from_json(r#"{"type":"x","bogus":true}"#).unwrap();
        assert_eq!(msg.kind, "x");
    }

    #[test]
    fn target_single_and_list() {
        let one = Message::from_json(r#"{"type":"x","target":"abc"}"#).unwrap();
        assert_eq!(one.target, Some(Target::One("abc".into())));

        let many = Message::from_json(r#"{"type":"x","target":["a","b"]}"#).unwrap();
        assert_eq!(many.target, Some(Target::Many(vec!["a".into(), "b".into()])));
    }

    #[test]
    fn target_is_preserved_but_inert() {
        // The envelope-level target round-trips; nothing routes on it.
        let msg = Message::from_json(r#"{"type":"x","target":"abc"}"#).unwrap();
        let json = msg.to_json().unwrap();
        let back = Message::from_json(&json).unwrap();
        assert_eq!(back.target, Some(Target::One("abc".into())));
    }

    #[test]
    fn encode_omits_absent_fields() {
        let json = Message::event("ping", Value::Null).to_json().unwrap();
        assert_eq!(json, r#"{"type":"ping"}"#);
    }

    #[test]
    fn numeric_ack_token_round_trips() {
        let msg = Message::from_json(r#"{"type":"x","ack":42}"#).unwrap();
        assert_eq!(msg.ack, json!(42));
        assert_eq!(Message::ack(msg.ack).payload, json!({ "ack": 42 }));
    }

    #[test]
    fn error_with_and_without_details() {
        let with = Message::error("Internal handler error", Some("boom".into()));
        assert_eq!(with.kind, SYSTEM_ERROR);
        assert_eq!(with.payload["details"], "boom");

        let without = Message::error("nope", None);
        assert!(without.payload.get("details").is_none());
    }

    #[test]
    fn reply_text_shape() {
        let msg = Message::reply_text("hello");
        assert_eq!(msg.kind, SYSTEM_REPLY);
        assert_eq!(msg.payload, json!({ "message": "hello" }));
    }
}
